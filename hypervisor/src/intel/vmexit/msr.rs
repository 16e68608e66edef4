//! Provides virtual machine management capabilities, specifically for handling MSR
//! read and write operations. It ensures that guest MSR accesses are properly
//! intercepted and handled, with support for injecting faults for invalid accesses.

use {
    crate::intel::{events::EventInjection, support::Cpu, vm::Vm, vmexit::ExitType},
    x86::{msr, vmx::vmcs::guest},
};

/// Enum representing the type of MSR access.
///
/// There are two types of MSR access: reading from an MSR and writing to an MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

const MSR_RANGE_LOW_END: u32 = 0x00001FFF;
const MSR_RANGE_HIGH_START: u32 = 0xC0000000;
const MSR_RANGE_HIGH_END: u32 = 0xC0001FFF;
const SYNTHETIC_MSR_START: u32 = 0x40000000;
const SYNTHETIC_MSR_END: u32 = 0x400000FF;

/// MSRs loaded from the guest-state area on VM entry. The VMCS copy is the guest's value.
fn vmcs_backed_field(msr_id: u32) -> Option<u32> {
    match msr_id {
        msr::IA32_SYSENTER_CS => Some(guest::IA32_SYSENTER_CS),
        msr::IA32_SYSENTER_ESP => Some(guest::IA32_SYSENTER_ESP),
        msr::IA32_SYSENTER_EIP => Some(guest::IA32_SYSENTER_EIP),
        msr::IA32_FS_BASE => Some(guest::FS_BASE),
        msr::IA32_GS_BASE => Some(guest::GS_BASE),
        _ => None,
    }
}

/// MSRs that hold a linear address and fault on a non-canonical write.
fn holds_address(msr_id: u32) -> bool {
    matches!(
        msr_id,
        msr::IA32_DS_AREA
            | msr::IA32_FS_BASE
            | msr::IA32_GS_BASE
            | msr::IA32_KERNEL_GSBASE
            | msr::IA32_LSTAR
            | msr::IA32_SYSENTER_EIP
            | msr::IA32_SYSENTER_ESP
    )
}

fn is_canonical(address: u64) -> bool {
    let upper = (address as i64) >> 47;
    upper == 0 || upper == -1
}

/// Handles MSR access based on the provided access type.
///
/// Only the two architectural ranges covered by the MSR bitmap are replayed. The synthetic range
/// a hypervisor would expose at 40000000H and everything else fault with #GP, as they would on
/// bare metal.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: RDMSR—Read From Model Specific Register or WRMSR—Write to Model Specific Register
/// and Table C-1. Basic Exit Reasons 31 and 32.
pub fn handle_msr_access<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, access_type: MsrAccessType) -> ExitType {
    let msr_id = vm.guest_registers.rcx as u32;

    if (SYNTHETIC_MSR_START..=SYNTHETIC_MSR_END).contains(&msr_id) {
        log::trace!("Core {}: synthetic MSR {:#x} accessed", vm.core_id, msr_id);
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    if !(msr_id <= MSR_RANGE_LOW_END || (MSR_RANGE_HIGH_START..=MSR_RANGE_HIGH_END).contains(&msr_id)) {
        log::trace!("Core {}: invalid MSR access attempted: {:#x}", vm.core_id, msr_id);
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    match access_type {
        MsrAccessType::Read => {
            let value = match vmcs_backed_field(msr_id) {
                Some(field) => cpu.vmread(field),
                None => cpu.rdmsr(msr_id),
            };

            vm.guest_registers.set_edx_eax(value);
        }
        MsrAccessType::Write => {
            let value = vm.guest_registers.edx_eax();

            if holds_address(msr_id) && !is_canonical(value) {
                EventInjection::vmentry_inject_gp(cpu, 0);
                return ExitType::Continue;
            }

            match vmcs_backed_field(msr_id) {
                Some(field) => cpu.vmwrite(field, value),
                None => cpu.wrmsr(msr_id, value),
            }
        }
    }

    log::trace!("Core {}: {:?} MSR {:#x}", vm.core_id, access_type, msr_id);
    ExitType::IncrementRIP
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{vmerror::VmxBasicExitReason, vmexit::tests::Harness},
        x86::vmx::vmcs::control,
    };

    fn msr_exit(harness: &mut Harness, reason: VmxBasicExitReason, msr_id: u32) {
        harness.vm.guest_registers.rcx = msr_id as u64;
        harness.exit(reason, 0x1000, 2);
    }

    #[test]
    fn rdmsr_splits_the_value() {
        let mut harness = Harness::new();
        harness.cpu.set_msr(msr::IA32_LSTAR, 0xffff_f800_1234_5678);

        msr_exit(&mut harness, VmxBasicExitReason::Rdmsr, msr::IA32_LSTAR);

        assert_eq!(harness.vm.guest_registers.rax, 0x1234_5678);
        assert_eq!(harness.vm.guest_registers.rdx, 0xffff_f800);
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1002);
    }

    #[test]
    fn wrmsr_combines_edx_eax() {
        let mut harness = Harness::new();
        harness.vm.guest_registers.rax = 0xdead_0000_0000_0d01;
        harness.vm.guest_registers.rdx = 0x0;

        msr_exit(&mut harness, VmxBasicExitReason::Wrmsr, msr::IA32_EFER);

        assert_eq!(harness.cpu.rdmsr(msr::IA32_EFER), 0xd01);
    }

    #[test]
    fn segment_bases_live_in_the_vmcs() {
        let mut harness = Harness::new();
        harness.cpu.vmwrite(guest::GS_BASE, 0xffff_f800_0000_1000);

        msr_exit(&mut harness, VmxBasicExitReason::Rdmsr, msr::IA32_GS_BASE);
        assert_eq!(harness.vm.guest_registers.edx_eax(), 0xffff_f800_0000_1000);

        harness.vm.guest_registers.set_edx_eax(0x7ff6_0000_2000);
        msr_exit(&mut harness, VmxBasicExitReason::Wrmsr, msr::IA32_FS_BASE);
        assert_eq!(harness.cpu.vmread(guest::FS_BASE), 0x7ff6_0000_2000);
        assert!(!harness.cpu.msrs.contains_key(&msr::IA32_FS_BASE));
    }

    #[test]
    fn non_canonical_lstar_raises_gp() {
        let mut harness = Harness::new();
        harness.vm.guest_registers.set_edx_eax(0x8000_0000_0000_0000);

        msr_exit(&mut harness, VmxBasicExitReason::Wrmsr, msr::IA32_LSTAR);

        assert_eq!(harness.cpu.vmread(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0b0d);
        assert!(!harness.cpu.msrs.contains_key(&msr::IA32_LSTAR));
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1000);
    }

    #[test]
    fn synthetic_and_unknown_msrs_raise_gp() {
        for msr_id in [0x4000_0000, 0x4000_00ff, 0x2000, 0xC000_2000] {
            let mut harness = Harness::new();

            msr_exit(&mut harness, VmxBasicExitReason::Rdmsr, msr_id);

            assert_eq!(harness.cpu.vmread(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0b0d);
            assert_eq!(harness.cpu.vmread(guest::RIP), 0x1000);
        }
    }
}
