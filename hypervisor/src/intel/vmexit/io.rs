//! IN/OUT emulation for ports masked in the I/O bitmaps.

use {
    crate::intel::{
        support::{AccessSize, Cpu},
        vm::Vm,
        vmerror::IoQualification,
        vmexit::ExitType,
    },
    bit_field::BitField,
    log::*,
    x86::vmx::vmcs::ro,
};

/// RFLAGS.DF
const RFLAGS_DIRECTION_FLAG_BIT: usize = 10;

fn access_size(qualification: &IoQualification) -> Option<AccessSize> {
    match qualification.size_of_access() {
        0 => Some(AccessSize::Byte),
        1 => Some(AccessSize::Word),
        3 => Some(AccessSize::Dword),
        _ => None,
    }
}

/// Handles the I/O instruction VM exit (basic exit reason 30).
///
/// The access is replayed on the real port. String forms move data between the port and guest
/// memory at RSI/RDI, stepping backwards when RFLAGS.DF is set and repeating RCX times under REP.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
pub fn handle_io_instruction<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let qualification = IoQualification::from(cpu.vmread(ro::EXIT_QUALIFICATION));
    let port = qualification.port_number() as u16;

    let Some(size) = access_size(&qualification) else {
        error!("Core {}: I/O exit with invalid access size, {:?}", vm.core_id, qualification);
        return ExitType::Continue;
    };

    let is_in = qualification.direction();
    trace!("Core {}: {} port {:#x} {:?}", vm.core_id, if is_in { "IN" } else { "OUT" }, port, size);

    if !qualification.string_instruction() {
        if is_in {
            let value = cpu.port_read(port, size) as u64;
            vm.guest_registers.rax = match size {
                // A 32-bit destination zero-extends into RAX.
                AccessSize::Dword => value,
                _ => (vm.guest_registers.rax & !size.mask()) | value,
            };
        } else {
            cpu.port_write(port, size, (vm.guest_registers.rax & size.mask()) as u32);
        }

        return ExitType::IncrementRIP;
    }

    let count = if qualification.rep_prefixed() { vm.guest_registers.rcx } else { 1 };
    let step = size as u64;
    let backwards = vm.guest_registers.rflags.get_bit(RFLAGS_DIRECTION_FLAG_BIT);

    for _ in 0..count {
        if is_in {
            let value = cpu.port_read(port, size);
            cpu.guest_write(vm.guest_registers.rdi, size, value);
            vm.guest_registers.rdi = advance(vm.guest_registers.rdi, step, backwards);
        } else {
            let value = cpu.guest_read(vm.guest_registers.rsi, size);
            cpu.port_write(port, size, value);
            vm.guest_registers.rsi = advance(vm.guest_registers.rsi, step, backwards);
        }
    }

    if qualification.rep_prefixed() {
        vm.guest_registers.rcx = 0;
    }

    ExitType::IncrementRIP
}

fn advance(address: u64, step: u64, backwards: bool) -> u64 {
    if backwards {
        address.wrapping_sub(step)
    } else {
        address.wrapping_add(step)
    }
}
