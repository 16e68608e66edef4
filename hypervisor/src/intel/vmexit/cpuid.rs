//! Handles CPU-related virtualization tasks, specifically intercepting and managing
//! the `CPUID` instruction in a VM to control the exposure of CPU features to the guest.

use {
    crate::intel::{support::Cpu, vm::Vm, vmexit::ExitType},
    bitfield::BitMut,
    log::*,
};

/// CPUID function for feature information, including hypervisor presence.
const FEATURE_INFORMATION_LEAF: u32 = 0x1;

/// Enumerates specific feature bits in the ECX register for CPUID instruction results.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FeatureBits {
    /// Bit 31 of ECX for CPUID with EAX=1, indicating hypervisor presence.
    HypervisorPresentBit = 31,
}

/// Handles the `CPUID` VM-exit.
///
/// The instruction is executed on the host and the results are handed back, with the
/// hypervisor-present bit set for leaf 1. Everything else passes through unchanged.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual, Table C-1. Basic Exit Reasons 10.
pub fn handle_cpuid<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    let leaf = vm.guest_registers.rax as u32;
    let sub_leaf = vm.guest_registers.rcx as u32;

    let mut cpuid_result = cpu.cpuid(leaf, sub_leaf);
    trace!("CPUID leaf {:#x}, sub-leaf {:#x}", leaf, sub_leaf);

    if leaf == FEATURE_INFORMATION_LEAF {
        cpuid_result.ecx.set_bit(FeatureBits::HypervisorPresentBit as usize, true);
    }

    vm.guest_registers.rax = cpuid_result.eax as u64;
    vm.guest_registers.rbx = cpuid_result.ebx as u64;
    vm.guest_registers.rcx = cpuid_result.ecx as u64;
    vm.guest_registers.rdx = cpuid_result.edx as u64;

    ExitType::IncrementRIP
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{vmerror::VmxBasicExitReason, vmexit::tests::Harness},
        x86::vmx::vmcs::guest,
    };

    #[test]
    fn leaf_one_reports_a_hypervisor() {
        let mut harness = Harness::new();
        harness.cpu.set_cpuid(1, 0, 0x906ea, 0x100800, 0x7ffafbbf, 0xbfebfbff);
        harness.vm.guest_registers.rax = 1;

        harness.exit(VmxBasicExitReason::Cpuid, 0x1000, 2);

        assert_eq!(harness.vm.guest_registers.rax, 0x906ea);
        assert_eq!(harness.vm.guest_registers.rcx, 0xfffafbbf);
        assert_eq!(harness.vm.guest_registers.rdx, 0xbfebfbff);
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1002);
    }

    #[test]
    fn other_leaves_pass_through() {
        let mut harness = Harness::new();
        harness.cpu.set_cpuid(7, 0, 0, 0x029c6fbf, 0x40000000, 0);
        harness.vm.guest_registers.rax = 0xffff_ffff_0000_0007;

        harness.exit(VmxBasicExitReason::Cpuid, 0x1000, 2);

        assert_eq!(harness.vm.guest_registers.rbx, 0x029c6fbf);
        assert_eq!(harness.vm.guest_registers.rcx, 0x40000000);
    }
}
