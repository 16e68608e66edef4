//! The monitor trap flag exit: re-arming a hook after its single step, and single-step requests.

use {
    crate::intel::{
        invept::invept_single_context,
        shared::EptState,
        support::Cpu,
        vm::Vm,
        vmcs::{set_pinbased_controls, set_primary_controls},
        vmexit::ExitType,
    },
    log::*,
    x86::vmx::vmcs::control::{PinbasedControls, PrimaryControls},
};

/// Lifts the hook on `page` for one instruction.
///
/// Called after the violation handler swapped the original entry in. External interrupts exit
/// while the step is in flight so none is delivered against the unhooked page.
pub fn arm_hook_restore<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, page: u64) {
    if let Some(previous) = vm.mtf_restore_target.replace(page) {
        warn!("Core {}: hook on {:#x} still awaiting restore, now {:#x}", vm.core_id, previous, page);
    }

    set_primary_controls(cpu, PrimaryControls::MONITOR_TRAP_FLAG, true);
    set_pinbased_controls(cpu, PinbasedControls::EXTERNAL_INTERRUPT_EXITING, true);
}

/// Handles the monitor trap flag VM exit (basic exit reason 37).
///
/// The step that was armed by an EPT violation is done: the shadow entry goes back in and held
/// interrupts get their window. MTF stays on when a single-step request is waiting for the next
/// boundary.
pub fn handle_monitor_trap_flag<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, ept_state: &EptState) -> ExitType {
    let Some(page) = vm.mtf_restore_target.take() else {
        if vm.single_step_pending {
            trace!("Core {}: single step completed at {:#x}", vm.core_id, vm.guest_registers.rip);
            vm.single_step_pending = false;
        } else {
            warn!("Core {}: monitor trap exit with nothing armed", vm.core_id);
        }

        vm.ignore_mtf_unset = false;
        set_primary_controls(cpu, PrimaryControls::MONITOR_TRAP_FLAG, false);

        return ExitType::Continue;
    };

    if let Err(error) = ept_state.restore_after_mtf(page) {
        error!("Core {}: failed to re-arm hook on {:#x}: {}", vm.core_id, page, error);
    }
    invept_single_context(cpu, ept_state.eptp());
    trace!("Core {}: hook on {:#x} re-armed", vm.core_id, page);

    set_pinbased_controls(
        cpu,
        PinbasedControls::EXTERNAL_INTERRUPT_EXITING,
        vm.external_interrupt_exiting_requested,
    );

    if !vm.pending_interrupts.is_empty() {
        set_primary_controls(cpu, PrimaryControls::INTERRUPT_WINDOW_EXITING, true);
    }

    if vm.queued_nmis > 0 {
        set_primary_controls(cpu, PrimaryControls::NMI_WINDOW_EXITING, true);
    }

    if vm.ignore_mtf_unset {
        vm.ignore_mtf_unset = false;
    } else {
        set_primary_controls(cpu, PrimaryControls::MONITOR_TRAP_FLAG, false);
    }

    ExitType::Continue
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{
            hooks::hook_manager::HookKind,
            invept::InveptType,
            vmcs::{pinbased_controls, primary_controls},
            vmerror::VmxBasicExitReason,
            vmexit::tests::Harness,
        },
        x86::vmx::vmcs::guest,
    };

    /// Instruction fetch from a page whose entry allows read and write only.
    const EXECUTE_VIOLATION: u64 = 0b01_1100;
    /// Data read from a page whose entry allows execute only.
    const READ_VIOLATION: u64 = 0b10_0001;

    fn mtf_armed(harness: &Harness) -> bool {
        primary_controls(&harness.cpu).contains(PrimaryControls::MONITOR_TRAP_FLAG)
    }

    #[test]
    fn execute_hook_is_lifted_for_exactly_one_instruction() {
        let mut harness = Harness::new();
        harness.hook(0x1000, HookKind::ExecuteRedirect { shadow_page: None });
        let record = harness.ept_state.hook(0x1000).unwrap();
        assert_eq!(harness.ept_state.live_entry(0x1000).unwrap(), record.shadow_entry);

        harness.violation(0x1000, EXECUTE_VIOLATION, 0x1000);

        assert_eq!(harness.ept_state.live_entry(0x1000).unwrap(), record.original_entry);
        assert!(harness.vm.suppress_rip_advance);
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1000);
        assert_eq!(harness.vm.mtf_restore_target, Some(0x1000));
        assert!(mtf_armed(&harness));
        assert!(pinbased_controls(&harness.cpu).contains(PinbasedControls::EXTERNAL_INTERRUPT_EXITING));

        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x1003, 0);

        assert_eq!(harness.ept_state.live_entry(0x1000).unwrap(), record.shadow_entry);
        assert_eq!(harness.vm.mtf_restore_target, None);
        assert!(!mtf_armed(&harness));
        assert!(!pinbased_controls(&harness.cpu).contains(PinbasedControls::EXTERNAL_INTERRUPT_EXITING));
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1003);
        assert_eq!(
            harness.cpu.invept_log.last(),
            Some(&(InveptType::SingleContext, harness.ept_state.eptp()))
        );
    }

    #[test]
    fn redirected_execute_hook_lets_reads_see_the_real_page() {
        let mut harness = Harness::new();
        harness.hook(0x40_2000, HookKind::ExecuteRedirect { shadow_page: Some(0x7000) });
        let record = harness.ept_state.hook(0x40_2000).unwrap();
        assert_eq!(record.shadow_entry.physical_address(), 0x7000);

        harness.violation(0x40_2010, READ_VIOLATION, 0xffff_f800_0000_4000);

        assert_eq!(harness.ept_state.live_entry(0x40_2000).unwrap().physical_address(), 0x40_2000);
        assert_eq!(harness.vm.mtf_restore_target, Some(0x40_2000));

        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0xffff_f800_0000_4004, 0);

        assert_eq!(harness.ept_state.live_entry(0x40_2000).unwrap().physical_address(), 0x7000);
        assert_eq!(harness.ept_state.hook(0x40_2000).unwrap().hits, 1);
    }

    #[test]
    fn requested_external_interrupt_exiting_survives_the_step() {
        let mut harness = Harness::new();
        harness.vm.external_interrupt_exiting_requested = true;
        harness.hook(0x60_1000, HookKind::WriteTrap);

        harness.violation(0x60_1000, 0b1010, 0x1000);
        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x1003, 0);

        assert!(pinbased_controls(&harness.cpu).contains(PinbasedControls::EXTERNAL_INTERRUPT_EXITING));
    }

    #[test]
    fn held_interrupts_get_a_window_after_the_restore() {
        let mut harness = Harness::new();
        harness.hook(0x60_1000, HookKind::WriteTrap);
        harness.violation(0x60_1000, 0b1010, 0x1000);
        harness.vm.pending_interrupts.push_back(0x41).unwrap();
        harness.vm.queued_nmis = 1;

        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x1003, 0);

        let primary = primary_controls(&harness.cpu);
        assert!(primary.contains(PrimaryControls::INTERRUPT_WINDOW_EXITING));
        assert!(primary.contains(PrimaryControls::NMI_WINDOW_EXITING));
    }

    #[test]
    fn single_step_request_keeps_mtf_for_one_more_exit() {
        let mut harness = Harness::new();
        harness.hook(0x1000, HookKind::ExecuteRedirect { shadow_page: None });
        harness.violation(0x1000, EXECUTE_VIOLATION, 0x1000);

        harness.vm.request_single_step(&mut harness.cpu);
        assert!(harness.vm.ignore_mtf_unset);

        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x1003, 0);
        assert_eq!(harness.vm.mtf_restore_target, None);
        assert!(harness.vm.single_step_pending);
        assert!(mtf_armed(&harness));

        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x1007, 0);
        assert!(!harness.vm.single_step_pending);
        assert!(!mtf_armed(&harness));
    }

    #[test]
    fn single_step_without_a_hook_completes_on_the_first_exit() {
        let mut harness = Harness::new();

        harness.vm.request_single_step(&mut harness.cpu);
        assert!(!harness.vm.ignore_mtf_unset);

        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x2001, 0);

        assert!(!harness.vm.single_step_pending);
        assert!(!mtf_armed(&harness));
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x2001);
    }

    #[test]
    fn stray_monitor_trap_exit_turns_mtf_off() {
        let mut harness = Harness::new();
        set_primary_controls(&mut harness.cpu, PrimaryControls::MONITOR_TRAP_FLAG, true);

        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x2001, 0);

        assert!(!mtf_armed(&harness));
    }
}
