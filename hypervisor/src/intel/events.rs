//! This module provides utilities and structures to manage event injection in VMX.
//! It handles the representation, manipulation, and injection of various types of events.

use {
    crate::intel::{
        support::Cpu,
        vmerror::{ExceptionInterrupt, InterruptionInformation, InterruptionType},
    },
    bitfield::bitfield,
    x86::vmx::vmcs,
};

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.8.3 VM-Entry Controls for Event Injection
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub get_vector, set_vector: 7, 0;

    /// Interruption type, see [`InterruptionType`].
    pub get_type, set_type: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub get_deliver_error_code, set_deliver_error_code: 11, 11;

    /// Valid
    pub get_valid, set_valid: 31, 31;
}

/// Provides methods for event injection in VMX.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.6 EVENT INJECTION
impl EventInjection {
    fn event(vector: u32, interruption_type: InterruptionType, deliver_error_code: bool) -> u32 {
        let mut event = EventInjection(0);

        event.set_vector(vector);
        event.set_type(interruption_type as u32);
        event.set_deliver_error_code(deliver_error_code as u32);
        event.set_valid(1);

        event.0
    }

    /// Injects a general protection fault with the given error code.
    pub fn vmentry_inject_gp<C: Cpu + ?Sized>(cpu: &mut C, error_code: u32) {
        let event = Self::event(ExceptionInterrupt::GeneralProtectionFault as u32, InterruptionType::HardwareException, true);
        log::trace!("Injecting #GP({:#x})", error_code);

        cpu.vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code as u64);
        cpu.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event as u64);
    }

    /// Injects an undefined opcode exception.
    pub fn vmentry_inject_ud<C: Cpu + ?Sized>(cpu: &mut C) {
        let event = Self::event(ExceptionInterrupt::InvalidOpcode as u32, InterruptionType::HardwareException, false);
        log::trace!("Injecting #UD");

        cpu.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event as u64);
    }

    /// Injects a breakpoint exception. INT3 is a software exception and needs its length.
    pub fn vmentry_inject_bp<C: Cpu + ?Sized>(cpu: &mut C) {
        let event = Self::event(ExceptionInterrupt::Breakpoint as u32, InterruptionType::SoftwareException, false);

        cpu.vmwrite(vmcs::control::VMENTRY_INSTRUCTION_LEN, 1);
        cpu.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event as u64);
    }

    /// Injects a debug exception.
    pub fn vmentry_inject_db<C: Cpu + ?Sized>(cpu: &mut C) {
        let event = Self::event(ExceptionInterrupt::Debug as u32, InterruptionType::HardwareException, false);

        cpu.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event as u64);
    }

    /// Injects a non-maskable interrupt.
    pub fn vmentry_inject_nmi<C: Cpu + ?Sized>(cpu: &mut C) {
        let event = Self::event(ExceptionInterrupt::NonMaskableInterrupt as u32, InterruptionType::NonMaskableInterrupt, false);

        cpu.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event as u64);
    }

    /// Injects an external interrupt with the given vector.
    pub fn vmentry_inject_external_interrupt<C: Cpu + ?Sized>(cpu: &mut C, vector: u32) {
        let event = Self::event(vector & 0xff, InterruptionType::ExternalInterrupt, false);

        cpu.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event as u64);
    }

    /// Re-delivers an event described by the VM-exit interruption information.
    ///
    /// The error code and, for software-generated events, the instruction
    /// length are taken from the exit fields.
    pub fn vmentry_reinject<C: Cpu + ?Sized>(cpu: &mut C, information: InterruptionInformation) {
        let interruption_type = InterruptionType::from_u32(information.interruption_type());
        let event = Self::event(information.vector(), interruption_type, information.error_code_valid());

        if information.error_code_valid() {
            let error_code = cpu.vmread(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE);
            cpu.vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code);
        }

        if matches!(
            interruption_type,
            InterruptionType::SoftwareInterrupt
                | InterruptionType::PrivilegedSoftwareException
                | InterruptionType::SoftwareException
        ) {
            let length = cpu.vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);
            cpu.vmwrite(vmcs::control::VMENTRY_INSTRUCTION_LEN, length);
        }

        cpu.vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event as u64);
    }
}
