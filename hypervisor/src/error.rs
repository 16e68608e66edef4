use {shared::HypercallStatus, thiserror::Error};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Intel CPU not found")]
    CPUUnsupported,

    #[error("VMX is not supported")]
    VMXUnsupported,

    #[error("EPT is not supported")]
    EPTUnsupported,

    #[error("MTRRs are not supported")]
    MTRRUnsupported,

    #[error("VMX locked off in BIOS")]
    VMXBIOSLock,

    #[error("Failed to allocate memory")]
    MemoryAllocationFailed,

    #[error("Failed to execute VMXON")]
    VMXONFailed,

    #[error("Failed to execute VMXOFF")]
    VMXOFFFailed,

    #[error("Failed to execute VMCLEAR")]
    VMCLEARFailed,

    #[error("Failed to execute VMPTRLD")]
    VMPTRLDFailed,

    #[error("Failed to execute VMLAUNCH, VM-instruction error {0}")]
    VMLAUNCHFailed(u64),

    #[error("VMX regions are in the wrong state for this transition")]
    InvalidVmxState,

    #[error("Invalid core index {0}")]
    InvalidCoreIndex(usize),

    #[error("The single-core call lock is already held")]
    SingleCoreLockBusy,

    #[error("Failed to virtualize {0} core(s)")]
    VirtualizationFailed(usize),

    #[error("Unhandled VM exit")]
    UnhandledVmExit,

    #[error("Core {0} is not virtualized")]
    CoreNotVirtualized(usize),

    #[error("Hypervisor is not running")]
    NotRunning,

    #[error("Hypervisor is already running")]
    AlreadyRunning,

    #[error("Guest physical address {0:#x} is beyond the identity map")]
    AddressOutOfRange(u64),

    #[error("Invalid EPT PML4 base address")]
    InvalidEptPml4BaseAddress,

    #[error("Page {0:#x} is already hooked")]
    HookAlreadyExists(u64),

    #[error("No hook on page {0:#x}")]
    HookNotFound(u64),

    #[error("No split buffer available")]
    SplitBufferUnavailable,

    #[error("Page table for {0:#x} not found")]
    PageTableNotFound(u64),

    #[error("Invalid hook kind {0:#x}")]
    InvalidHookKind(u64),

    #[error("Invalid hypercall operand {0:#x}")]
    InvalidHypercallOperand(u64),

    #[error("Unknown hypercall request {0:#x}")]
    UnknownHypercall(u64),

    #[error("Hypercall failed with status {0:?}")]
    HypercallFailed(HypercallStatus),
}

impl From<HypervisorError> for HypercallStatus {
    fn from(error: HypervisorError) -> Self {
        match error {
            HypervisorError::InvalidCoreIndex(_)
            | HypervisorError::AddressOutOfRange(_)
            | HypervisorError::InvalidHookKind(_)
            | HypervisorError::InvalidHypercallOperand(_) => HypercallStatus::InvalidParameter,
            HypervisorError::MemoryAllocationFailed | HypervisorError::SplitBufferUnavailable => {
                HypercallStatus::InsufficientResources
            }
            HypervisorError::HookAlreadyExists(_) => HypercallStatus::AlreadyExists,
            HypervisorError::HookNotFound(_) => HypercallStatus::NotFound,
            HypervisorError::UnknownHypercall(_) => HypercallStatus::NotSupported,
            HypervisorError::HypercallFailed(status) => status,
            _ => HypercallStatus::Unsuccessful,
        }
    }
}

/// Converts a status returned from root mode back into a `Result`.
pub fn status_to_result(status: HypercallStatus) -> Result<(), HypervisorError> {
    match status {
        HypercallStatus::Success => Ok(()),
        other => Err(HypervisorError::HypercallFailed(other)),
    }
}
