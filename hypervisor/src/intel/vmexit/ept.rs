//! EPT violations and misconfigurations.

use {
    crate::intel::{
        shared::EptState,
        support::Cpu,
        vm::Vm,
        vmerror::EptViolationQualification,
        vmexit::{mtf::arm_hook_restore, ExitType},
    },
    log::*,
    x86::vmx::vmcs::{guest, ro},
};

/// Handles the EPT violation VM exit (basic exit reason 48).
///
/// A violation on a hooked page swaps the original entry in and single-steps the faulting
/// instruction with the monitor trap flag. Without a hook the violation is unexpected: the mapping
/// stays as it is and the instruction is retried.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.3.2 EPT Violations
pub fn handle_ept_violation<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, ept_state: &EptState) -> ExitType {
    let guest_pa = cpu.vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
    let qualification = EptViolationQualification::from(cpu.vmread(ro::EXIT_QUALIFICATION));
    let process = cpu.vmread(guest::CR3);

    trace!("Core {}: EPT violation at {:#x}, {:?}", vm.core_id, guest_pa, qualification);

    match ept_state.handle_ept_violation(guest_pa, process) {
        Some(page) => arm_hook_restore(vm, cpu, page),
        None => error!(
            "Core {}: EPT violation without a hook at {:#x}, RIP {:#x}, {:?}",
            vm.core_id, guest_pa, vm.guest_registers.rip, qualification
        ),
    }

    // Do not increment RIP, the faulting instruction runs again against the new mapping.
    ExitType::Continue
}

/// Handles the EPT misconfiguration VM exit (basic exit reason 49).
///
/// Every entry is built with a valid permission and memory type combination, so this means the
/// tables were corrupted. The guest is resumed as is and will most likely not survive it.
pub fn handle_ept_misconfiguration<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let guest_pa = cpu.vmread(ro::GUEST_PHYSICAL_ADDR_FULL);

    error!(
        "Core {}: EPT misconfiguration at {:#x}, RIP {:#x}",
        vm.core_id, guest_pa, vm.guest_registers.rip
    );

    ExitType::Continue
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{
            hooks::hook_manager::HookKind,
            vmcs::primary_controls,
            vmerror::VmxBasicExitReason,
            vmexit::tests::Harness,
        },
        x86::vmx::vmcs::control::PrimaryControls,
    };

    #[test]
    fn violation_without_a_hook_changes_nothing() {
        let mut harness = Harness::new();
        let before = harness.ept_state.live_entry(0x30_0000).unwrap();

        harness.violation(0x30_0000, 0b0001, 0x1000);

        assert_eq!(harness.ept_state.live_entry(0x30_0000).unwrap(), before);
        assert_eq!(harness.vm.mtf_restore_target, None);
        assert!(!primary_controls(&harness.cpu).contains(PrimaryControls::MONITOR_TRAP_FLAG));
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1000);
    }

    #[test]
    fn violation_counts_hits_for_the_scoped_process_only() {
        let mut harness = Harness::new();
        harness
            .ept_state
            .provide_split_buffer(crate::intel::ept::SplitBuffer::new(&harness.platform).unwrap());
        harness
            .ept_state
            .install_hook(0x80_4000, HookKind::ReadWriteTrap, Some(0x1ad000))
            .unwrap();

        harness.cpu.vmwrite(guest::CR3, 0x5000);
        harness.violation(0x80_4008, 0b0001, 0x1000);
        harness.exit(VmxBasicExitReason::MonitorTrapFlag, 0x1004, 0);

        harness.cpu.vmwrite(guest::CR3, 0x1ad000 | 0x3);
        harness.violation(0x80_4008, 0b0001, 0x2000);

        assert_eq!(harness.ept_state.hook(0x80_4000).unwrap().hits, 1);
        assert_eq!(harness.vm.mtf_restore_target, Some(0x80_4000));
    }

    #[test]
    fn misconfiguration_is_logged_and_retried() {
        let mut harness = Harness::new();
        harness.cpu.vmwrite(ro::GUEST_PHYSICAL_ADDR_FULL, 0x1234_5000);

        let exited = harness.exit(VmxBasicExitReason::EptMisconfiguration, 0x7000, 3);

        assert!(!exited);
        assert!(harness.vm.suppress_rip_advance);
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x7000);
    }
}
