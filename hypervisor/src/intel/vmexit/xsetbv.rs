//! Provides handlers for managing VM exits due to the XSETBV instruction, ensuring
//! controlled manipulation of the XCR0 register by the guest.

use {
    crate::intel::{events::EventInjection, support::Cpu, vm::Vm, vmexit::ExitType},
    core::arch::x86_64::_XCR_XFEATURE_ENABLED_MASK,
    x86_64::registers::{control::Cr4Flags, xcontrol::XCr0Flags},
};

/// Manages the XSETBV instruction during a VM exit.
///
/// The value is checked against what the processor supports (CPUID leaf 0DH) and against the
/// architectural XCR0 rules. Anything invalid raises #GP(0) in the guest.
pub fn handle_xsetbv<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) -> ExitType {
    // Extract the XCR (extended control register) number from the guest's RCX register.
    let xcr = vm.guest_registers.rcx as u32;

    if xcr != _XCR_XFEATURE_ENABLED_MASK {
        log::debug!("Invalid XCR value for xsetbv: {:#x}", xcr);
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    let value_raw = vm.guest_registers.edx_eax();
    let value = XCr0Flags::from_bits_retain(value_raw);

    let cpuid_ext_state_info = cpu.cpuid(0x0d, 0x00);
    let xcr0_unsupported_mask = !((cpuid_ext_state_info.edx as u64) << 32 | cpuid_ext_state_info.eax as u64);

    // Make sure the guest is not trying to set any unsupported bits
    if value.bits() & xcr0_unsupported_mask != 0 {
        log::debug!("Trying to set unsupported XCR0 value for xsetbv: {:#x}", value_raw);
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    // Make sure bits being set are architecturally valid.
    if !is_valid_xcr0(value) {
        log::debug!("Invalid XCR0 value for xsetbv: {:#x}", value_raw);
        EventInjection::vmentry_inject_gp(cpu, 0);
        return ExitType::Continue;
    }

    log::trace!("Core {}: XSETBV {:#x}, {:#x}", vm.core_id, xcr, value_raw);

    // XSETBV itself faults unless the host has CR4.OSXSAVE set.
    cpu.cr4_write(cpu.cr4() | Cr4Flags::OSXSAVE.bits());
    cpu.xsetbv(xcr, value_raw);

    ExitType::IncrementRIP
}

fn is_valid_xcr0(xcr0: XCr0Flags) -> bool {
    // #GP(0) if clearing XCR0.X87
    if !xcr0.contains(XCr0Flags::X87) {
        return false;
    }

    // #GP(0) if XCR0.AVX is 1 while XCRO.SSE is cleared
    if xcr0.contains(XCr0Flags::AVX) && !xcr0.contains(XCr0Flags::SSE) {
        return false;
    }

    // #GP(0) if XCR0.AVX is clear and XCR0.opmask, XCR0.ZMM_Hi256, or XCR0.Hi16_ZMM is set
    if !xcr0.contains(XCr0Flags::AVX)
        && (xcr0.contains(XCr0Flags::OPMASK) || xcr0.contains(XCr0Flags::ZMM_HI256) || xcr0.contains(XCr0Flags::HI16_ZMM))
    {
        return false;
    }

    // BNDREGS and BNDCSR must be the same.
    if xcr0.contains(XCr0Flags::BNDREG) != xcr0.contains(XCr0Flags::BNDCSR) {
        return false;
    }

    // #GP(0) if setting XCR0.opmask, XCR0.ZMM_Hi256, or XCR0.Hi16_ZMM while not setting all of them
    if xcr0.contains(XCr0Flags::OPMASK) != xcr0.contains(XCr0Flags::ZMM_HI256)
        || xcr0.contains(XCr0Flags::ZMM_HI256) != xcr0.contains(XCr0Flags::HI16_ZMM)
    {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{vmerror::VmxBasicExitReason, vmexit::tests::Harness},
        x86::vmx::vmcs::{control, guest},
    };

    fn harness() -> Harness {
        let mut harness = Harness::new();
        // x87, SSE, AVX, opmask, ZMM_Hi256, Hi16_ZMM
        harness.cpu.set_cpuid(0xd, 0, 0xe7, 0, 0, 0);
        harness
    }

    #[test]
    fn supported_value_is_loaded() {
        let mut harness = harness();
        harness.vm.guest_registers.rax = 0x7;

        harness.exit(VmxBasicExitReason::Xsetbv, 0x1000, 3);

        assert_eq!(harness.cpu.xcr.get(&0), Some(&0x7));
        assert_ne!(harness.cpu.cr4 & Cr4Flags::OSXSAVE.bits(), 0);
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1003);
    }

    #[test]
    fn unsupported_bits_raise_gp() {
        let mut harness = harness();
        // PKRU is not reported by CPUID.
        harness.vm.guest_registers.rax = 0x207;

        harness.exit(VmxBasicExitReason::Xsetbv, 0x1000, 3);

        assert_eq!(harness.cpu.vmread(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0b0d);
        assert!(harness.cpu.xcr.is_empty());
    }

    #[test]
    fn avx_without_sse_raises_gp() {
        let mut harness = harness();
        harness.vm.guest_registers.rax = 0x5;

        harness.exit(VmxBasicExitReason::Xsetbv, 0x1000, 3);

        assert_eq!(harness.cpu.vmread(control::VMENTRY_INTERRUPTION_INFO_FIELD), 0x8000_0b0d);
        assert_eq!(harness.cpu.vmread(guest::RIP), 0x1000);
    }

    #[test]
    fn partial_avx512_state_raises_gp() {
        let mut harness = harness();
        harness.vm.guest_registers.rax = 0x27;

        harness.exit(VmxBasicExitReason::Xsetbv, 0x1000, 3);

        assert!(harness.cpu.xcr.is_empty());
    }

    #[test]
    fn other_xcrs_raise_gp() {
        let mut harness = harness();
        harness.vm.guest_registers.rcx = 1;
        harness.vm.guest_registers.rax = 0x3;

        harness.exit(VmxBasicExitReason::Xsetbv, 0x1000, 3);

        assert!(harness.cpu.xcr.is_empty());
    }
}
