//! Exit reasons, exit qualifications and event types reported by VMX.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Appendix C VMX BASIC EXIT REASONS

use bitfield::bitfield;

/// Basic exit reasons (bits 15:0 of the exit-reason field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    SppRelatedEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
}

impl VmxBasicExitReason {
    /// Decodes the basic exit reason from the full exit-reason field.
    pub fn from_u32(reason: u32) -> Option<Self> {
        use VmxBasicExitReason::*;

        let reason = match reason & 0xffff {
            0 => ExceptionOrNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            3 => InitSignal,
            4 => StartupIpi,
            5 => IoSystemManagementInterrupt,
            6 => OtherSmi,
            7 => InterruptWindow,
            8 => NmiWindow,
            9 => TaskSwitch,
            10 => Cpuid,
            11 => Getsec,
            12 => Hlt,
            13 => Invd,
            14 => Invlpg,
            15 => Rdpmc,
            16 => Rdtsc,
            17 => Rsm,
            18 => Vmcall,
            19 => Vmclear,
            20 => Vmlaunch,
            21 => Vmptrld,
            22 => Vmptrst,
            23 => Vmread,
            24 => Vmresume,
            25 => Vmwrite,
            26 => Vmxoff,
            27 => Vmxon,
            28 => ControlRegisterAccesses,
            29 => MovDr,
            30 => IoInstruction,
            31 => Rdmsr,
            32 => Wrmsr,
            33 => VmEntryFailureInvalidGuestState,
            34 => VmEntryFailureMsrLoading,
            36 => Mwait,
            37 => MonitorTrapFlag,
            39 => Monitor,
            40 => Pause,
            41 => VmEntryFailureMachineCheckEvent,
            43 => TprBelowThreshold,
            44 => ApicAccess,
            45 => VirtualizedEoi,
            46 => AccessToGdtrOrIdtr,
            47 => AccessToLdtrOrTr,
            48 => EptViolation,
            49 => EptMisconfiguration,
            50 => Invept,
            51 => Rdtscp,
            52 => VmxPreemptionTimerExpired,
            53 => Invvpid,
            54 => WbinvdOrWbnoinvd,
            55 => Xsetbv,
            56 => ApicWrite,
            57 => Rdrand,
            58 => Invpcid,
            59 => Vmfunc,
            60 => Encls,
            61 => Rdseed,
            62 => PageModificationLogFull,
            63 => Xsaves,
            64 => Xrstors,
            66 => SppRelatedEvent,
            67 => Umwait,
            68 => Tpause,
            69 => Loadiwkey,
            _ => return None,
        };

        Some(reason)
    }
}

/// Interruption types used by the exit and entry interruption-information fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    Reserved = 1,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

impl InterruptionType {
    pub fn from_u32(value: u32) -> Self {
        match value & 7 {
            0 => InterruptionType::ExternalInterrupt,
            2 => InterruptionType::NonMaskableInterrupt,
            3 => InterruptionType::HardwareException,
            4 => InterruptionType::SoftwareInterrupt,
            5 => InterruptionType::PrivilegedSoftwareException,
            6 => InterruptionType::SoftwareException,
            7 => InterruptionType::OtherEvent,
            _ => InterruptionType::Reserved,
        }
    }
}

/// Architectural exception vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionInterrupt {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
    X87FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    Virtualization = 20,
    ControlProtection = 21,
}

bitfield! {
    /// VM-exit interruption-information field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-19. Format of the VM-Exit Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct InterruptionInformation(u32);
    impl Debug;

    pub vector, set_vector: 7, 0;
    pub interruption_type, set_interruption_type: 10, 8;
    pub error_code_valid, set_error_code_valid: 11;
    pub nmi_unblocking_due_to_iret, set_nmi_unblocking_due_to_iret: 12;
    pub valid, set_valid: 31;
}

bitfield! {
    /// Exit qualification for EPT violations.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-7. Exit Qualification for EPT Violations
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EptViolationQualification(u64);
    impl Debug;

    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub ept_readable, set_ept_readable: 3;
    pub ept_writeable, set_ept_writeable: 4;
    pub ept_executable, set_ept_executable: 5;
    pub ept_executable_for_user_mode, _: 6;
    pub valid_guest_linear_address, _: 7;
    pub caused_by_translation, _: 8;
    pub nmi_unblocking, _: 12;
}

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ControlRegisterQualification(u64);
    impl Debug;

    pub control_register, set_control_register: 3, 0;
    pub access_type, set_access_type: 5, 4;
    pub lmsw_operand_type, _: 6;
    pub general_purpose_register, set_general_purpose_register: 11, 8;
    pub lmsw_source_data, _: 31, 16;
}

bitfield! {
    /// Exit qualification for MOV DR.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-4. Exit Qualification for MOV DR
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DebugRegisterQualification(u64);
    impl Debug;

    pub debug_register, set_debug_register: 2, 0;
    /// 0 = MOV to DR, 1 = MOV from DR.
    pub direction, set_direction: 4;
    pub general_purpose_register, set_general_purpose_register: 11, 8;
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-5. Exit Qualification for I/O Instructions
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct IoQualification(u64);
    impl Debug;

    /// 0 = 1 byte, 1 = 2 bytes, 3 = 4 bytes.
    pub size_of_access, set_size_of_access: 2, 0;
    /// 0 = OUT, 1 = IN.
    pub direction, set_direction: 3;
    pub string_instruction, set_string_instruction: 4;
    pub rep_prefixed, set_rep_prefixed: 5;
    pub operand_encoding, _: 6;
    pub port_number, set_port_number: 31, 16;
}

macro_rules! raw_field {
    ($($name:ident: $raw:ty),* $(,)?) => {
        $(
            impl From<$raw> for $name {
                fn from(value: $raw) -> Self {
                    Self(value)
                }
            }

            impl From<$name> for $raw {
                fn from(field: $name) -> Self {
                    field.0
                }
            }
        )*
    };
}

raw_field!(
    InterruptionInformation: u32,
    EptViolationQualification: u64,
    ControlRegisterQualification: u64,
    DebugRegisterQualification: u64,
    IoQualification: u64,
);

/// VM-instruction error numbers reported after a failed VMX instruction.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 31.4 VM INSTRUCTION ERROR NUMBERS
pub fn vm_instruction_error_description(error: u64) -> &'static str {
    match error {
        1 => "VMCALL executed in VMX root operation",
        2 => "VMCLEAR with invalid physical address",
        3 => "VMCLEAR with VMXON pointer",
        4 => "VMLAUNCH with non-clear VMCS",
        5 => "VMRESUME with non-launched VMCS",
        6 => "VMRESUME after VMXOFF",
        7 => "VM entry with invalid control field(s)",
        8 => "VM entry with invalid host-state field(s)",
        9 => "VMPTRLD with invalid physical address",
        10 => "VMPTRLD with VMXON pointer",
        11 => "VMPTRLD with incorrect VMCS revision identifier",
        12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
        13 => "VMWRITE to read-only VMCS component",
        15 => "VMXON executed in VMX root operation",
        16 => "VM entry with invalid executive-VMCS pointer",
        17 => "VM entry with non-launched executive VMCS",
        18 => "VM entry with executive-VMCS pointer not VMXON pointer",
        19 => "VMCALL with non-clear VMCS",
        20 => "VMCALL with invalid VM-exit control fields",
        22 => "VMCALL with incorrect MSEG revision identifier",
        23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
        24 => "VMCALL with invalid SMM-monitor features",
        25 => "VM entry with invalid VM-execution control fields in executive VMCS",
        26 => "VM entry with events blocked by MOV SS",
        28 => "Invalid operand to INVEPT/INVVPID",
        _ => "Unknown VM-instruction error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_reason_ignores_the_upper_bits() {
        assert_eq!(VmxBasicExitReason::from_u32(0x8000_0021), Some(VmxBasicExitReason::VmEntryFailureInvalidGuestState));
        assert_eq!(VmxBasicExitReason::from_u32(48), Some(VmxBasicExitReason::EptViolation));
        assert_eq!(VmxBasicExitReason::from_u32(35), None);
    }

    #[test]
    fn io_qualification_fields() {
        // IN AL, 0x60
        let qualification = IoQualification(0x0060_0008);
        assert!(qualification.direction());
        assert_eq!(qualification.size_of_access(), 0);
        assert_eq!(qualification.port_number(), 0x60);
        assert!(!qualification.string_instruction());
    }
}
