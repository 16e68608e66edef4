use crate::intel::{events::EventInjection, support::Cpu, vmexit::ExitType};

/// Handles VM exits for VMX instructions and GETSEC.
///
/// Nested virtualization is not offered, so the guest sees the #UD it would get with VMX and SMX
/// disabled.
pub fn handle_vmx_instruction<C: Cpu + ?Sized>(cpu: &mut C) -> ExitType {
    EventInjection::vmentry_inject_ud(cpu);
    ExitType::Continue
}
