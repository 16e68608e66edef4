//! MOV to and from debug registers, trapped while MOV-DR exiting is on.

use {
    crate::intel::{
        events::EventInjection,
        support::{read_effective_guest_cr4, Cpu},
        vm::Vm,
        vmerror::DebugRegisterQualification,
        vmexit::ExitType,
    },
    bit_field::BitField,
    x86::vmx::vmcs::{guest, ro},
    x86_64::registers::control::Cr4Flags,
};

/// DR7.GD, general detect: any debug-register access raises #DB.
const DR7_GENERAL_DETECT_BIT: usize = 13;

/// Handles the MOV DR VM exit (basic exit reason 29).
///
/// DR7 lives in the guest-state area; DR0-DR3 and DR6 are not switched on VM exits, so the live
/// registers are the guest's. DR4 and DR5 alias DR6 and DR7 unless CR4.DE is set.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 18.2.2 Debug Registers DR4 and DR5
pub fn handle_mov_dr<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let qualification = DebugRegisterQualification::from(cpu.vmread(ro::EXIT_QUALIFICATION));

    if cpu.vmread(guest::DR7).get_bit(DR7_GENERAL_DETECT_BIT) {
        EventInjection::vmentry_inject_db(cpu);
        return ExitType::Continue;
    }

    let register = match qualification.debug_register() as u8 {
        4 | 5 if Cr4Flags::from_bits_retain(read_effective_guest_cr4(cpu)).contains(Cr4Flags::DEBUGGING_EXTENSIONS) => {
            EventInjection::vmentry_inject_ud(cpu);
            return ExitType::Continue;
        }
        4 => 6,
        5 => 7,
        register => register,
    };

    let gpr = qualification.general_purpose_register();

    // Direction 0 is MOV to DR.
    if !qualification.direction() {
        let value = vm.guest_registers.gpr(gpr);
        log::trace!("Core {}: mov dr{}, {:#x}", vm.core_id, register, value);

        match register {
            7 => cpu.vmwrite(guest::DR7, value),
            _ => cpu.dr_write(register, value),
        }
    } else {
        let value = match register {
            7 => cpu.vmread(guest::DR7),
            _ => cpu.dr(register),
        };

        vm.guest_registers.set_gpr(gpr, value);
    }

    ExitType::IncrementRIP
}
