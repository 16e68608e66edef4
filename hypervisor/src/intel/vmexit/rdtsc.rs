//! RDTSC, RDTSCP and RDPMC, trapped when the matching exiting controls are set through hypercalls.
//!
//! The native values are handed back unchanged.

use crate::intel::{support::Cpu, vm::Vm, vmexit::ExitType};

/// Handles the RDTSC VM exit (basic exit reason 16).
pub fn handle_rdtsc<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    vm.guest_registers.set_edx_eax(cpu.rdtsc());
    ExitType::IncrementRIP
}

/// Handles the RDTSCP VM exit (basic exit reason 51). ECX receives `IA32_TSC_AUX`.
pub fn handle_rdtscp<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let (tsc, aux) = cpu.rdtscp();
    vm.guest_registers.set_edx_eax(tsc);
    vm.guest_registers.rcx = aux as u64;
    ExitType::IncrementRIP
}

/// Handles the RDPMC VM exit (basic exit reason 15). ECX selects the counter.
pub fn handle_rdpmc<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let counter = vm.guest_registers.rcx as u32;
    vm.guest_registers.set_edx_eax(cpu.rdpmc(counter));
    ExitType::IncrementRIP
}
