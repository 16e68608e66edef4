//! Exceptions and NMIs intercepted through the exception bitmap and NMI exiting.

use {
    crate::intel::{
        events::EventInjection,
        support::Cpu,
        vm::Vm,
        vmcs::set_primary_controls,
        vmerror::{InterruptionInformation, InterruptionType},
        vmexit::ExitType,
    },
    log::*,
    x86::vmx::vmcs::{control::PrimaryControls, ro},
};

/// Handles the exception or NMI VM exit (basic exit reason 0).
///
/// Exceptions are delivered back to the guest unchanged. An NMI arriving while a hook is being
/// single-stepped is held and delivered through NMI-window exiting once the hook is re-armed.
pub fn handle_exception_or_nmi<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let information = InterruptionInformation::from(cpu.vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32);

    if !information.valid() {
        warn!("Core {}: exception exit without valid interruption information", vm.core_id);
        return ExitType::Continue;
    }

    let interruption_type = InterruptionType::from_u32(information.interruption_type());
    trace!("Core {}: {:?} vector {}", vm.core_id, interruption_type, information.vector());

    if interruption_type == InterruptionType::NonMaskableInterrupt {
        vm.queued_nmis += 1;

        // The MTF exit opens the window once the hook is back in place.
        if vm.mtf_restore_target.is_none() {
            set_primary_controls(cpu, PrimaryControls::NMI_WINDOW_EXITING, true);
        } else {
            trace!("Core {}: NMI held, {} queued", vm.core_id, vm.queued_nmis);
        }

        return ExitType::Continue;
    }

    EventInjection::vmentry_reinject(cpu, information);

    ExitType::Continue
}
