//! External interrupts, the interrupt window and the NMI window.
//!
//! External-interrupt exiting is on either because it was requested through a hypercall or
//! because a hook single-step is in flight. Interrupts that cannot be delivered right away go
//! into the per-core queue and are injected one per interrupt-window exit.

use {
    crate::intel::{
        events::EventInjection,
        support::Cpu,
        vm::Vm,
        vmcs::set_primary_controls,
        vmerror::InterruptionInformation,
        vmexit::ExitType,
    },
    bit_field::BitField,
    log::*,
    x86::vmx::vmcs::{control::PrimaryControls, guest, ro},
};

/// RFLAGS.IF
const RFLAGS_INTERRUPT_FLAG_BIT: usize = 9;

/// Blocking by STI and blocking by MOV SS in the interruptibility state.
const INTERRUPTIBILITY_BLOCKING_MASK: u64 = 0b11;

/// Handles the external interrupt VM exit (basic exit reason 1).
///
/// The interrupt was acknowledged on exit, so it is either injected now or queued. While a hook is
/// lifted for its single step it is always queued: delivering it would run the guest's handler
/// against the unhooked page.
pub fn handle_external_interrupt<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let information = InterruptionInformation::from(cpu.vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32);
    let vector = information.vector();

    if vm.mtf_restore_target.is_some() || !guest_interruptible(vm, cpu) {
        queue_interrupt(vm, cpu, vector);
    } else {
        trace!("Core {}: delivering interrupt {:#x}", vm.core_id, vector);
        EventInjection::vmentry_inject_external_interrupt(cpu, vector);
    }

    ExitType::Continue
}

/// Handles the interrupt-window VM exit (basic exit reason 7).
pub fn handle_interrupt_window<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    if vm.mtf_restore_target.is_some() {
        // Reopened by the MTF exit.
        set_primary_controls(cpu, PrimaryControls::INTERRUPT_WINDOW_EXITING, false);
        return ExitType::Continue;
    }

    if let Some(vector) = vm.pending_interrupts.pop_front() {
        trace!("Core {}: delivering queued interrupt {:#x}", vm.core_id, vector);
        EventInjection::vmentry_inject_external_interrupt(cpu, vector);
    }

    if vm.pending_interrupts.is_empty() {
        set_primary_controls(cpu, PrimaryControls::INTERRUPT_WINDOW_EXITING, false);
    }

    ExitType::Continue
}

/// Handles the NMI-window VM exit (basic exit reason 8).
pub fn handle_nmi_window<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    if vm.mtf_restore_target.is_some() {
        set_primary_controls(cpu, PrimaryControls::NMI_WINDOW_EXITING, false);
        return ExitType::Continue;
    }

    if vm.queued_nmis > 0 {
        vm.queued_nmis -= 1;
        EventInjection::vmentry_inject_nmi(cpu);
    }

    if vm.queued_nmis == 0 {
        set_primary_controls(cpu, PrimaryControls::NMI_WINDOW_EXITING, false);
    }

    ExitType::Continue
}

/// Adds `vector` to the pending queue. A full queue drops the interrupt.
pub fn queue_interrupt<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, vector: u32) {
    if vm.pending_interrupts.push_back(vector).is_err() {
        warn!("Core {}: pending interrupt queue full, dropping vector {:#x}", vm.core_id, vector);
    }

    if vm.mtf_restore_target.is_none() {
        set_primary_controls(cpu, PrimaryControls::INTERRUPT_WINDOW_EXITING, true);
    }
}

/// Returns true when an external interrupt injected now would be delivered.
fn guest_interruptible<C: Cpu + ?Sized>(vm: &Vm, cpu: &C) -> bool {
    vm.guest_registers.rflags.get_bit(RFLAGS_INTERRUPT_FLAG_BIT)
        && cpu.vmread(guest::INTERRUPTIBILITY_STATE) & INTERRUPTIBILITY_BLOCKING_MASK == 0
}
