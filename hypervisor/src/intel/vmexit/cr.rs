use {
    crate::{
        config::VPID_TAG,
        error::HypervisorError,
        intel::{
            events::EventInjection,
            invept::{invept_all_contexts, invvpid_single_context},
            support::{read_effective_guest_cr0, read_effective_guest_cr4, Cpu},
            vm::Vm,
            vmerror::ControlRegisterQualification,
            vmexit::ExitType,
        },
    },
    bit_field::BitField,
    core::ops::Range,
    x86::vmx::vmcs::{control, guest, ro},
    x86_64::registers::control::{Cr0Flags, Cr4Flags},
};

/// Access type field of the control-register exit qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

impl CrAccessType {
    fn from_qualification(qualification: &ControlRegisterQualification) -> Self {
        match qualification.access_type() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        }
    }
}

/// CR3[63], the PCID no-flush hint. It is not part of the register value.
const CR3_NO_FLUSH_BIT: usize = 63;

/// Handles the `ControlRegisterAccess` VM-exit.
///
/// This function is invoked when the guest executes certain instructions
/// that read or write to control registers.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.3 Instructions That Cause VM Exits Conditionally
pub fn handle_cr_access<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> Result<ExitType, HypervisorError> {
    let qualification = ControlRegisterQualification::from(cpu.vmread(ro::EXIT_QUALIFICATION));
    let register = qualification.general_purpose_register();

    log::trace!("Core {}: CR access {:?}", vm.core_id, qualification);

    match CrAccessType::from_qualification(&qualification) {
        CrAccessType::MovToCr => {
            let value = vm.guest_registers.gpr(register);

            match qualification.control_register() {
                0 => Ok(handle_mov_to_cr0(cpu, value)),
                3 => Ok(handle_mov_to_cr3(cpu, value)),
                4 => Ok(handle_mov_to_cr4(cpu, value)),
                _ => Err(HypervisorError::UnhandledVmExit),
            }
        }
        CrAccessType::MovFromCr => {
            let value = match qualification.control_register() {
                0 => read_effective_guest_cr0(cpu),
                3 => cpu.vmread(guest::CR3),
                4 => read_effective_guest_cr4(cpu),
                _ => return Err(HypervisorError::UnhandledVmExit),
            };

            vm.guest_registers.set_gpr(register, value);
            Ok(ExitType::IncrementRIP)
        }
        CrAccessType::Clts => {
            let mut cr0 = Cr0Flags::from_bits_retain(read_effective_guest_cr0(cpu));
            cr0.remove(Cr0Flags::TASK_SWITCHED);
            Ok(handle_mov_to_cr0(cpu, cr0.bits()))
        }
        CrAccessType::Lmsw => {
            // LMSW loads CR0[3:0] but can never clear PE.
            let source = qualification.lmsw_source_data() & 0xf;
            let current = read_effective_guest_cr0(cpu);
            let value = (current & !0xf) | source | (current & 1);
            Ok(handle_mov_to_cr0(cpu, value))
        }
    }
}

/// The MOV to CR0 instruction causes a VM exit unless the value of its source operand matches, for
/// the position of each bit set in the CR0 guest/host mask, the corresponding bit in the CR0 read shadow. (If every
/// bit is clear in the CR0 guest/host mask, MOV to CR0 cannot cause a VM exit.)
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.3 Instructions That Cause VM Exits Conditionally
fn handle_mov_to_cr0<C: Cpu + ?Sized>(cpu: &mut C, value: u64) -> ExitType {
    let curr_cr0 = Cr0Flags::from_bits_retain(read_effective_guest_cr0(cpu));
    let curr_cr4 = Cr4Flags::from_bits_retain(read_effective_guest_cr4(cpu));

    let mut new_cr0_raw = value;

    // CR0[15:6] is always 0
    new_cr0_raw.set_bits(6..16, 0);

    // CR0[17] is always 0
    new_cr0_raw.set_bit(17, false);

    // CR0[28:19] is always 0
    new_cr0_raw.set_bits(19..29, 0);

    let mut new_cr0 = Cr0Flags::from_bits_retain(new_cr0_raw);

    // CR0.ET is always 1
    new_cr0.set(Cr0Flags::EXTENSION_TYPE, true);

    // #GP(0) if setting any reserved bits in CR0[63:32]
    if new_cr0.bits().get_bits(32..64) != 0 {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if setting CR0.PG while CR0.PE is clear
    if new_cr0.contains(Cr0Flags::PAGING) && !new_cr0.contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if invalid bit combination
    if !new_cr0.contains(Cr0Flags::CACHE_DISABLE) && new_cr0.contains(Cr0Flags::NOT_WRITE_THROUGH) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if an attempt is made to clear CR0.PG
    if !new_cr0.contains(Cr0Flags::PAGING) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if an attempt is made to clear CR0.WP while CR4.CET is set
    if !new_cr0.contains(Cr0Flags::WRITE_PROTECT) && curr_cr4.contains(Cr4Flags::CONTROL_FLOW_ENFORCEMENT) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // Cached guest-physical translations carry the memory type.
    if new_cr0.contains(Cr0Flags::CACHE_DISABLE) != curr_cr0.contains(Cr0Flags::CACHE_DISABLE)
        || new_cr0.contains(Cr0Flags::NOT_WRITE_THROUGH) != curr_cr0.contains(Cr0Flags::NOT_WRITE_THROUGH)
    {
        invept_all_contexts(cpu);
    }

    cpu.vmwrite(control::CR0_READ_SHADOW, new_cr0.bits());

    let vmx_cr0_fixed0 = cpu.rdmsr(x86::msr::IA32_VMX_CR0_FIXED0);
    let vmx_cr0_fixed1 = cpu.rdmsr(x86::msr::IA32_VMX_CR0_FIXED1);

    // make sure to account for VMX reserved bits when setting the real CR0
    new_cr0 |= Cr0Flags::from_bits_retain(vmx_cr0_fixed0);
    new_cr0 &= Cr0Flags::from_bits_retain(vmx_cr0_fixed1);

    cpu.vmwrite(guest::CR0, new_cr0.bits());

    ExitType::IncrementRIP
}

/// Loads guest CR3. Bit 63 only asks the processor to keep PCID-tagged translations, so it is
/// dropped from the stored value and the VPID's linear translations are flushed.
fn handle_mov_to_cr3<C: Cpu + ?Sized>(cpu: &mut C, value: u64) -> ExitType {
    let mut cr3 = value;
    cr3.set_bit(CR3_NO_FLUSH_BIT, false);

    cpu.vmwrite(guest::CR3, cr3);
    invvpid_single_context(cpu, VPID_TAG);

    ExitType::IncrementRIP
}

/// The MOV to CR4 instruction causes a VM exit unless the value of its source operand matches, for
/// the position of each bit set in the CR4 guest/host mask, the corresponding bit in the CR4 read shadow.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.3 Instructions That Cause VM Exits Conditionally
fn handle_mov_to_cr4<C: Cpu + ?Sized>(cpu: &mut C, value: u64) -> ExitType {
    const CR4_RESERVED_1: usize = 15;
    const CR4_RESERVED_2: Range<usize> = 32..64;
    const CPUID_ECX_SMX: usize = 6;

    let mut new_cr4 = Cr4Flags::from_bits_retain(value);

    let curr_cr3 = cpu.vmread(guest::CR3);

    let curr_cr0 = Cr0Flags::from_bits_retain(read_effective_guest_cr0(cpu));
    let curr_cr4 = Cr4Flags::from_bits_retain(read_effective_guest_cr4(cpu));
    let has_smx = cpu.cpuid(1, 0).ecx.get_bit(CPUID_ECX_SMX);

    // #GP(0) if an attempt is made to set CR4.SMXE when SMX is not supported
    if !has_smx && new_cr4.contains(Cr4Flags::SAFER_MODE_EXTENSIONS) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if an attempt is made to write to any reserved bits
    if new_cr4.bits().get_bit(CR4_RESERVED_1) || new_cr4.bits().get_bits(CR4_RESERVED_2) != 0 {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if an attempt is made to change CR4.PCIDE from 0 to 1 while CR3[11:0] != 000H
    if new_cr4.contains(Cr4Flags::PCID) && !curr_cr4.contains(Cr4Flags::PCID) && curr_cr3.get_bits(0..12) != 0 {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if CR4.PAE is cleared
    if !new_cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if CR4.LA57 is enabled
    if new_cr4.contains(Cr4Flags::L5_PAGING) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // #GP(0) if CR4.CET == 1 and CR0.WP == 0
    if new_cr4.contains(Cr4Flags::CONTROL_FLOW_ENFORCEMENT) && !curr_cr0.contains(Cr0Flags::WRITE_PROTECT) {
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // invalidate TLB entries if required
    if (new_cr4.contains(Cr4Flags::PAGE_GLOBAL) != curr_cr4.contains(Cr4Flags::PAGE_GLOBAL))
        || !new_cr4.contains(Cr4Flags::PCID) && curr_cr4.contains(Cr4Flags::PCID)
        || new_cr4.contains(Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION)
            && !curr_cr4.contains(Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION)
    {
        invvpid_single_context(cpu, VPID_TAG);
    }

    cpu.vmwrite(control::CR4_READ_SHADOW, new_cr4.bits());

    let vmx_cr4_fixed0 = cpu.rdmsr(x86::msr::IA32_VMX_CR4_FIXED0);
    let vmx_cr4_fixed1 = cpu.rdmsr(x86::msr::IA32_VMX_CR4_FIXED1);

    // make sure to account for VMX reserved bits when setting the real CR4
    new_cr4 |= Cr4Flags::from_bits_retain(vmx_cr4_fixed0);
    new_cr4 &= Cr4Flags::from_bits_retain(vmx_cr4_fixed1);

    cpu.vmwrite(guest::CR4, new_cr4.bits());

    ExitType::IncrementRIP
}
