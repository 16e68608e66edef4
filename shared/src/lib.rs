//! Definitions shared between the root-mode core and the code that talks to it:
//! the hypercall ABI and the framing of remote debuggee packets.

#![cfg_attr(not(test), no_std)]

/// Value expected in R10 on every hypercall.
pub const HYPERCALL_SIGNATURE_R10: u64 = 0x48564653;

/// Value expected in R11 on every hypercall.
pub const HYPERCALL_SIGNATURE_R11: u64 = 0x564d43414c4c;

/// Value expected in R12 on every hypercall.
pub const HYPERCALL_SIGNATURE_R12: u64 = 0x4e4f485950455256;

/// Operand selecting every MSR in the bitmap requests.
pub const ALL_MSRS: u64 = 0xffff_ffff;

/// Operand selecting every I/O port in the bitmap requests.
pub const ALL_IO_PORTS: u64 = 0xffff_ffff;

/// Operand selecting every exception vector in the exception-bitmap requests.
pub const ALL_EXCEPTIONS: u64 = 0xffff_ffff;

/// Requests understood by the hypercall handler. Only the low 32 bits of RCX select one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HypercallRequest {
    Test = 0x1,
    Vmxoff = 0x2,
    /// RDX = physical address, R8 = encoded [`PageHookKind`], R9 = process CR3 or 0.
    ChangePageAttribute = 0x3,
    InveptAllContexts = 0x4,
    InveptSingleContext = 0x5,
    UnhookAllPages = 0x6,
    UnhookSinglePage = 0x7,
    ChangeMsrBitmapRead = 0xA,
    ChangeMsrBitmapWrite = 0xB,
    SetRdtscExiting = 0xC,
    SetRdpmcExiting = 0xD,
    SetExceptionBitmap = 0xE,
    EnableMovDebugRegistersExiting = 0xF,
    EnableExternalInterruptExiting = 0x10,
    ChangeIoBitmap = 0x11,
    UnsetRdtscExiting = 0x13,
    DisableExternalInterruptExiting = 0x14,
    UnsetRdpmcExiting = 0x15,
    DisableMovDebugRegistersExiting = 0x16,
    ResetMsrBitmapRead = 0x17,
    ResetMsrBitmapWrite = 0x18,
    ResetExceptionBitmap = 0x19,
    ResetIoBitmap = 0x1A,
    EnableMovToCr3Exiting = 0x1B,
    DisableMovToCr3Exiting = 0x1C,
    UnsetExceptionBitmap = 0x1D,
    SetVmExitOnNmis = 0x23,
    UnsetVmExitOnNmis = 0x24,
    /// RDX = control register (0 or 4), R8 = guest/host mask bits to add.
    EnableMovToControlRegistersExiting = 0x2B,
    /// RDX = control register (0 or 4), R8 = guest/host mask bits to remove.
    DisableMovToControlRegistersExiting = 0x2C,
}

impl TryFrom<u64> for HypercallRequest {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        use HypercallRequest::*;

        let request = match value & 0xffff_ffff {
            0x1 => Test,
            0x2 => Vmxoff,
            0x3 => ChangePageAttribute,
            0x4 => InveptAllContexts,
            0x5 => InveptSingleContext,
            0x6 => UnhookAllPages,
            0x7 => UnhookSinglePage,
            0xA => ChangeMsrBitmapRead,
            0xB => ChangeMsrBitmapWrite,
            0xC => SetRdtscExiting,
            0xD => SetRdpmcExiting,
            0xE => SetExceptionBitmap,
            0xF => EnableMovDebugRegistersExiting,
            0x10 => EnableExternalInterruptExiting,
            0x11 => ChangeIoBitmap,
            0x13 => UnsetRdtscExiting,
            0x14 => DisableExternalInterruptExiting,
            0x15 => UnsetRdpmcExiting,
            0x16 => DisableMovDebugRegistersExiting,
            0x17 => ResetMsrBitmapRead,
            0x18 => ResetMsrBitmapWrite,
            0x19 => ResetExceptionBitmap,
            0x1A => ResetIoBitmap,
            0x1B => EnableMovToCr3Exiting,
            0x1C => DisableMovToCr3Exiting,
            0x1D => UnsetExceptionBitmap,
            0x23 => SetVmExitOnNmis,
            0x24 => UnsetVmExitOnNmis,
            0x2B => EnableMovToControlRegistersExiting,
            0x2C => DisableMovToControlRegistersExiting,
            _ => return Err(value),
        };

        Ok(request)
    }
}

impl From<HypercallRequest> for u64 {
    fn from(request: HypercallRequest) -> Self {
        request as u32 as u64
    }
}

/// Status returned in RAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum HypercallStatus {
    Success = 0,
    Unsuccessful = 1,
    InvalidParameter = 2,
    InsufficientResources = 3,
    AlreadyExists = 4,
    NotFound = 5,
    NotSupported = 6,
}

impl HypercallStatus {
    pub fn to_u64(self) -> u64 {
        self as u64
    }

    /// Unknown values read back as `Unsuccessful`.
    pub fn from_u64(value: u64) -> Self {
        match value {
            0 => HypercallStatus::Success,
            2 => HypercallStatus::InvalidParameter,
            3 => HypercallStatus::InsufficientResources,
            4 => HypercallStatus::AlreadyExists,
            5 => HypercallStatus::NotFound,
            6 => HypercallStatus::NotSupported,
            _ => HypercallStatus::Unsuccessful,
        }
    }

    pub fn is_success(self) -> bool {
        self == HypercallStatus::Success
    }
}

/// The kind of an EPT page hook, as carried in the second hypercall operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageHookKind {
    ExecuteRedirect = 0,
    ReadTrap = 1,
    WriteTrap = 2,
    ReadWriteTrap = 3,
}

impl TryFrom<u64> for PageHookKind {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PageHookKind::ExecuteRedirect),
            1 => Ok(PageHookKind::ReadTrap),
            2 => Ok(PageHookKind::WriteTrap),
            3 => Ok(PageHookKind::ReadWriteTrap),
            _ => Err(value),
        }
    }
}

const HOOK_KIND_MASK: u64 = 0xfff;

/// Packs a hook kind and an optional page-aligned shadow page into one operand.
///
/// Returns `None` if `shadow_page` is not page aligned.
pub fn encode_hook_operand(kind: PageHookKind, shadow_page: Option<u64>) -> Option<u64> {
    let page = shadow_page.unwrap_or(0);
    if page & HOOK_KIND_MASK != 0 {
        return None;
    }
    Some(page | kind as u64)
}

/// Reverses [`encode_hook_operand`].
pub fn decode_hook_operand(operand: u64) -> Result<(PageHookKind, Option<u64>), u64> {
    let kind = PageHookKind::try_from(operand & HOOK_KIND_MASK)?;
    let page = operand & !HOOK_KIND_MASK;
    Ok((kind, if page == 0 { None } else { Some(page) }))
}

/// Marks the start of every remote packet ("HYPERDBG").
pub const PACKET_INDICATOR: u64 = 0x4859504552444247;

/// Direction and execution context of a remote packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    DebuggerToDebuggeeExecuteOnVmxRoot = 1,
    DebuggerToDebuggeeExecuteOnUserMode = 2,
    DebuggeeToDebugger = 3,
    HardwareDebuggeeToDebugger = 4,
    DebuggerToDebuggeeHardwareLevel = 5,
}

impl TryFrom<u32> for PacketType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::DebuggerToDebuggeeExecuteOnVmxRoot),
            2 => Ok(PacketType::DebuggerToDebuggeeExecuteOnUserMode),
            3 => Ok(PacketType::DebuggeeToDebugger),
            4 => Ok(PacketType::HardwareDebuggeeToDebugger),
            5 => Ok(PacketType::DebuggerToDebuggeeHardwareLevel),
            _ => Err(value),
        }
    }
}

/// What the receiver of a packet is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestedAction {
    DebuggeeStarted = 1,
    DebuggeePausedAndCurrentInstruction = 2,
    DebuggeeResultOfHypercall = 3,
    DebuggeeEventTriggered = 4,
    DebuggerContinue = 5,
    DebuggerStepInstruction = 6,
    DebuggerSetHook = 7,
    DebuggerRemoveHook = 8,
}

impl TryFrom<u32> for RequestedAction {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use RequestedAction::*;

        match value {
            1 => Ok(DebuggeeStarted),
            2 => Ok(DebuggeePausedAndCurrentInstruction),
            3 => Ok(DebuggeeResultOfHypercall),
            4 => Ok(DebuggeeEventTriggered),
            5 => Ok(DebuggerContinue),
            6 => Ok(DebuggerStepInstruction),
            7 => Ok(DebuggerSetHook),
            8 => Ok(DebuggerRemoveHook),
            _ => Err(value),
        }
    }
}

/// Fixed-size header preceding every remote packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// Wrapping byte sum of every header byte after this one.
    pub checksum: u8,
    pub indicator: u64,
    pub packet_type: u32,
    pub requested_action: u32,
}

/// Reasons a received header is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    BadIndicator,
    BadChecksum,
    UnknownType(u32),
    UnknownAction(u32),
}

impl PacketHeader {
    pub const SIZE: usize = core::mem::size_of::<PacketHeader>();

    /// Builds a header with the indicator set and the checksum computed.
    pub fn seal(packet_type: PacketType, requested_action: RequestedAction) -> Self {
        let mut header = PacketHeader {
            checksum: 0,
            indicator: PACKET_INDICATOR,
            packet_type: packet_type as u32,
            requested_action: requested_action as u32,
        };
        header.checksum = header.compute_checksum();
        header
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let indicator = self.indicator;
        let packet_type = self.packet_type;
        let requested_action = self.requested_action;

        bytes[0] = self.checksum;
        bytes[1..9].copy_from_slice(&indicator.to_le_bytes());
        bytes[9..13].copy_from_slice(&packet_type.to_le_bytes());
        bytes[13..17].copy_from_slice(&requested_action.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut indicator = [0u8; 8];
        let mut packet_type = [0u8; 4];
        let mut requested_action = [0u8; 4];
        indicator.copy_from_slice(&bytes[1..9]);
        packet_type.copy_from_slice(&bytes[9..13]);
        requested_action.copy_from_slice(&bytes[13..17]);

        PacketHeader {
            checksum: bytes[0],
            indicator: u64::from_le_bytes(indicator),
            packet_type: u32::from_le_bytes(packet_type),
            requested_action: u32::from_le_bytes(requested_action),
        }
    }

    pub fn compute_checksum(&self) -> u8 {
        checksum(&self.to_bytes()[1..])
    }

    /// Validates the indicator and checksum and decodes the enums.
    pub fn verify(&self) -> Result<(PacketType, RequestedAction), PacketError> {
        let indicator = self.indicator;
        if indicator != PACKET_INDICATOR {
            return Err(PacketError::BadIndicator);
        }
        if self.checksum != self.compute_checksum() {
            return Err(PacketError::BadChecksum);
        }

        let packet_type = PacketType::try_from(self.packet_type).map_err(PacketError::UnknownType)?;
        let action = RequestedAction::try_from(self.requested_action).map_err(PacketError::UnknownAction)?;
        Ok((packet_type, action))
    }
}

/// Wrapping sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// Raw event data the core hands to the packet transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct EventPayload {
    pub core: u32,
    pub exit_reason: u32,
    pub exit_qualification: u64,
    pub guest_rip: u64,
    pub guest_rsp: u64,
    pub guest_cr3: u64,
    pub faulting_address: u64,
}
