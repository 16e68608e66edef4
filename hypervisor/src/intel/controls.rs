//! Adjusting requested VMX controls to what the processor allows.
//!
//! Credits to Satoshi Tanda: https://github.com/tandasat/Hypervisor-101-in-Rust/blob/main/hypervisor/src/hardware_vt/vmx.rs

use {crate::intel::support::Cpu, bit_field::BitField, x86::msr};

/// The VMX control fields that have capability MSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Returns `requested_value` with the must-be-one bits set and the must-be-zero bits cleared.
///
/// When `IA32_VMX_BASIC[55]` is set the TRUE capability MSRs are used, which allow clearing some
/// default-one controls. The secondary controls have no TRUE MSR.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: A.3 VM-EXECUTION CONTROLS
pub fn adjust_vmx_controls<C: Cpu + ?Sized>(cpu: &C, control: VmxControl, requested_value: u64) -> u64 {
    let true_controls = cpu.rdmsr(msr::IA32_VMX_BASIC).get_bit(55);

    let capability_msr = match (control, true_controls) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    };

    let capabilities = cpu.rdmsr(capability_msr);
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;

    let mut effective_value = u32::try_from(requested_value).unwrap_or(u32::MAX);
    effective_value |= allowed0;
    effective_value &= allowed1;

    u64::from(effective_value)
}
