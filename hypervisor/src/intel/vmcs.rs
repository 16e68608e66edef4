//! The VMCS region and the initial guest, host and control state.
//!
//! The guest is a copy of the core that launched it. Host state is the same core with the
//! selector RPL and TI bits cleared, as VM entry requires.

use {
    crate::{
        config::VPID_TAG,
        intel::{
            capture::GuestRegisters,
            controls::{adjust_vmx_controls, VmxControl},
            segmentation::{ProcessorState, SegmentDescriptor},
            support::Cpu,
        },
    },
    core::fmt,
    x86::{
        bits64::paging::BASE_PAGE_SIZE,
        vmx::vmcs::{
            self,
            control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls},
        },
    },
};

/// Represents the VMCS region in memory.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; BASE_PAGE_SIZE - 8],
}
static_assertions::const_assert_eq!(core::mem::size_of::<Vmcs>(), BASE_PAGE_SIZE);

/// Physical addresses the control fields point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlAddresses {
    pub eptp: u64,
    pub msr_bitmap: u64,
    pub io_bitmap_a: u64,
    pub io_bitmap_b: u64,
}

/// Initialize the guest state for the currently loaded VMCS.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4 GUEST-STATE AREA
#[rustfmt::skip]
pub fn setup_guest_registers_state<C: Cpu + ?Sized>(cpu: &mut C, state: &ProcessorState, registers: &GuestRegisters) {
    log::debug!("Setting up Guest Registers State");

    cpu.vmwrite(vmcs::guest::CR0, state.cr0);
    cpu.vmwrite(vmcs::guest::CR3, state.cr3);
    cpu.vmwrite(vmcs::guest::CR4, state.cr4);
    cpu.vmwrite(vmcs::guest::DR7, state.dr7);

    cpu.vmwrite(vmcs::guest::RSP, registers.rsp);
    cpu.vmwrite(vmcs::guest::RIP, registers.rip);
    cpu.vmwrite(vmcs::guest::RFLAGS, registers.rflags);

    let segments: [(&SegmentDescriptor, u32, u32, u32, u32); 8] = [
        (&state.es, vmcs::guest::ES_SELECTOR, vmcs::guest::ES_BASE, vmcs::guest::ES_LIMIT, vmcs::guest::ES_ACCESS_RIGHTS),
        (&state.cs, vmcs::guest::CS_SELECTOR, vmcs::guest::CS_BASE, vmcs::guest::CS_LIMIT, vmcs::guest::CS_ACCESS_RIGHTS),
        (&state.ss, vmcs::guest::SS_SELECTOR, vmcs::guest::SS_BASE, vmcs::guest::SS_LIMIT, vmcs::guest::SS_ACCESS_RIGHTS),
        (&state.ds, vmcs::guest::DS_SELECTOR, vmcs::guest::DS_BASE, vmcs::guest::DS_LIMIT, vmcs::guest::DS_ACCESS_RIGHTS),
        (&state.fs, vmcs::guest::FS_SELECTOR, vmcs::guest::FS_BASE, vmcs::guest::FS_LIMIT, vmcs::guest::FS_ACCESS_RIGHTS),
        (&state.gs, vmcs::guest::GS_SELECTOR, vmcs::guest::GS_BASE, vmcs::guest::GS_LIMIT, vmcs::guest::GS_ACCESS_RIGHTS),
        (&state.ldtr, vmcs::guest::LDTR_SELECTOR, vmcs::guest::LDTR_BASE, vmcs::guest::LDTR_LIMIT, vmcs::guest::LDTR_ACCESS_RIGHTS),
        (&state.tr, vmcs::guest::TR_SELECTOR, vmcs::guest::TR_BASE, vmcs::guest::TR_LIMIT, vmcs::guest::TR_ACCESS_RIGHTS),
    ];

    for (segment, selector, base, limit, access_rights) in segments {
        cpu.vmwrite(selector, u64::from(segment.selector));
        cpu.vmwrite(base, segment.base_address);
        cpu.vmwrite(limit, u64::from(segment.segment_limit));
        cpu.vmwrite(access_rights, u64::from(segment.access_rights));
    }

    cpu.vmwrite(vmcs::guest::GDTR_BASE, state.gdtr_base);
    cpu.vmwrite(vmcs::guest::GDTR_LIMIT, u64::from(state.gdtr_limit));
    cpu.vmwrite(vmcs::guest::IDTR_BASE, state.idtr_base);
    cpu.vmwrite(vmcs::guest::IDTR_LIMIT, u64::from(state.idtr_limit));

    cpu.vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, state.debugctl);
    cpu.vmwrite(vmcs::guest::IA32_SYSENTER_CS, state.sysenter_cs);
    cpu.vmwrite(vmcs::guest::IA32_SYSENTER_ESP, state.sysenter_esp);
    cpu.vmwrite(vmcs::guest::IA32_SYSENTER_EIP, state.sysenter_eip);
    cpu.vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);

    log::debug!("Guest Registers State setup successfully!");
}

/// Initialize the host state for the currently loaded VMCS.
///
/// HOST_RSP and HOST_RIP are written by `launch_vm` right before VMLAUNCH.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.5 HOST-STATE AREA
#[rustfmt::skip]
pub fn setup_host_registers_state<C: Cpu + ?Sized>(cpu: &mut C, state: &ProcessorState) {
    log::debug!("Setting up Host Registers State");

    cpu.vmwrite(vmcs::host::CR0, cpu.cr0());
    cpu.vmwrite(vmcs::host::CR3, cpu.cr3());
    cpu.vmwrite(vmcs::host::CR4, cpu.cr4());

    const SELECTOR_MASK: u16 = 0xF8;
    cpu.vmwrite(vmcs::host::CS_SELECTOR, u64::from(state.cs.selector & SELECTOR_MASK));
    cpu.vmwrite(vmcs::host::SS_SELECTOR, u64::from(state.ss.selector & SELECTOR_MASK));
    cpu.vmwrite(vmcs::host::DS_SELECTOR, u64::from(state.ds.selector & SELECTOR_MASK));
    cpu.vmwrite(vmcs::host::ES_SELECTOR, u64::from(state.es.selector & SELECTOR_MASK));
    cpu.vmwrite(vmcs::host::FS_SELECTOR, u64::from(state.fs.selector & SELECTOR_MASK));
    cpu.vmwrite(vmcs::host::GS_SELECTOR, u64::from(state.gs.selector & SELECTOR_MASK));
    cpu.vmwrite(vmcs::host::TR_SELECTOR, u64::from(state.tr.selector & SELECTOR_MASK));

    cpu.vmwrite(vmcs::host::FS_BASE, state.fs_base);
    cpu.vmwrite(vmcs::host::GS_BASE, state.gs_base);
    cpu.vmwrite(vmcs::host::TR_BASE, state.tr.base_address);
    cpu.vmwrite(vmcs::host::GDTR_BASE, state.gdtr_base);
    cpu.vmwrite(vmcs::host::IDTR_BASE, state.idtr_base);

    cpu.vmwrite(vmcs::host::IA32_SYSENTER_CS, state.sysenter_cs);
    cpu.vmwrite(vmcs::host::IA32_SYSENTER_ESP, state.sysenter_esp);
    cpu.vmwrite(vmcs::host::IA32_SYSENTER_EIP, state.sysenter_eip);

    log::debug!("Host Registers State setup successfully!");
}

/// Initialize the VMCS control values for the currently loaded VMCS.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// - 25.6 VM-EXECUTION CONTROL FIELDS
/// - 25.7 VM-EXIT CONTROL FIELDS
/// - 25.8 VM-ENTRY CONTROL FIELDS
#[rustfmt::skip]
pub fn setup_vmcs_control_fields<C: Cpu + ?Sized>(cpu: &mut C, state: &ProcessorState, addresses: &ControlAddresses) {
    log::debug!("Setting up VMCS Control Fields");

    const PRIMARY_CTL: u64 = (PrimaryControls::SECONDARY_CONTROLS.bits()
        | PrimaryControls::USE_MSR_BITMAPS.bits()
        | PrimaryControls::USE_IO_BITMAPS.bits()) as u64;
    const SECONDARY_CTL: u64 = (SecondaryControls::ENABLE_RDTSCP.bits()
        | SecondaryControls::ENABLE_XSAVES_XRSTORS.bits()
        | SecondaryControls::ENABLE_INVPCID.bits()
        | SecondaryControls::ENABLE_VPID.bits()
        | SecondaryControls::ENABLE_EPT.bits()) as u64;
    const ENTRY_CTL: u64 = EntryControls::IA32E_MODE_GUEST.bits() as u64;
    const EXIT_CTL: u64 = (ExitControls::HOST_ADDRESS_SPACE_SIZE.bits() | ExitControls::ACK_INTERRUPT_ON_EXIT.bits()) as u64;
    const PINBASED_CTL: u64 = 0;

    let primary = adjust_vmx_controls(cpu, VmxControl::ProcessorBased, PRIMARY_CTL);
    let secondary = adjust_vmx_controls(cpu, VmxControl::ProcessorBased2, SECONDARY_CTL);
    let entry = adjust_vmx_controls(cpu, VmxControl::VmEntry, ENTRY_CTL);
    let exit = adjust_vmx_controls(cpu, VmxControl::VmExit, EXIT_CTL);
    let pinbased = adjust_vmx_controls(cpu, VmxControl::PinBased, PINBASED_CTL);

    cpu.vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary);
    cpu.vmwrite(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary);
    cpu.vmwrite(vmcs::control::VMENTRY_CONTROLS, entry);
    cpu.vmwrite(vmcs::control::VMEXIT_CONTROLS, exit);
    cpu.vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, pinbased);

    cpu.vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, 0);
    cpu.vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, 0);
    cpu.vmwrite(vmcs::control::CR0_READ_SHADOW, state.cr0);
    cpu.vmwrite(vmcs::control::CR4_READ_SHADOW, state.cr4);

    cpu.vmwrite(vmcs::control::EXCEPTION_BITMAP, 0);
    cpu.vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, addresses.msr_bitmap);
    cpu.vmwrite(vmcs::control::IO_BITMAP_A_ADDR_FULL, addresses.io_bitmap_a);
    cpu.vmwrite(vmcs::control::IO_BITMAP_B_ADDR_FULL, addresses.io_bitmap_b);

    cpu.vmwrite(vmcs::control::EPTP_FULL, addresses.eptp);
    cpu.vmwrite(vmcs::control::VPID, u64::from(VPID_TAG));

    log::debug!("VMCS Control Fields setup successfully!");
}

/// Sets or clears `controls` in the primary processor-based execution controls.
pub fn set_primary_controls<C: Cpu + ?Sized>(cpu: &mut C, controls: PrimaryControls, enable: bool) {
    set_control_bits(cpu, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, u64::from(controls.bits()), enable);
}

pub fn primary_controls<C: Cpu + ?Sized>(cpu: &C) -> PrimaryControls {
    PrimaryControls::from_bits_truncate(cpu.vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32)
}

/// Sets or clears `controls` in the pin-based execution controls.
pub fn set_pinbased_controls<C: Cpu + ?Sized>(cpu: &mut C, controls: PinbasedControls, enable: bool) {
    set_control_bits(cpu, vmcs::control::PINBASED_EXEC_CONTROLS, u64::from(controls.bits()), enable);
}

pub fn pinbased_controls<C: Cpu + ?Sized>(cpu: &C) -> PinbasedControls {
    PinbasedControls::from_bits_truncate(cpu.vmread(vmcs::control::PINBASED_EXEC_CONTROLS) as u32)
}

// Reserved default-one bits have no flag, so the field is updated as a raw value.
fn set_control_bits<C: Cpu + ?Sized>(cpu: &mut C, field: u32, bits: u64, enable: bool) {
    let value = cpu.vmread(field);
    let value = if enable { value | bits } else { value & !bits };
    cpu.vmwrite(field, value);
}

/// A summary of the current VMCS for diagnostics.
pub struct VmcsDump<'a, C: Cpu + ?Sized>(pub &'a C);

impl<C: Cpu + ?Sized> fmt::Debug for VmcsDump<'_, C> {
    #[rustfmt::skip]
    fn fmt(&self, format: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpu = self.0;

        format.debug_struct("Vmcs")
            .field("Guest CR0", &cpu.vmread(vmcs::guest::CR0))
            .field("Guest CR3", &cpu.vmread(vmcs::guest::CR3))
            .field("Guest CR4", &cpu.vmread(vmcs::guest::CR4))
            .field("Guest RSP", &cpu.vmread(vmcs::guest::RSP))
            .field("Guest RIP", &cpu.vmread(vmcs::guest::RIP))
            .field("Guest RFLAGS", &cpu.vmread(vmcs::guest::RFLAGS))
            .field("Guest CS Selector", &cpu.vmread(vmcs::guest::CS_SELECTOR))
            .field("Guest CS Access Rights", &cpu.vmread(vmcs::guest::CS_ACCESS_RIGHTS))
            .field("Guest TR Base", &cpu.vmread(vmcs::guest::TR_BASE))
            .field("Guest Interruptibility", &cpu.vmread(vmcs::guest::INTERRUPTIBILITY_STATE))
            .field("Host CR3", &cpu.vmread(vmcs::host::CR3))
            .field("Host RSP", &cpu.vmread(vmcs::host::RSP))
            .field("Host RIP", &cpu.vmread(vmcs::host::RIP))
            .field("Pin Based Execution Controls", &cpu.vmread(vmcs::control::PINBASED_EXEC_CONTROLS))
            .field("Primary Proc Based Execution Controls", &cpu.vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS))
            .field("Secondary Proc Based Execution Controls", &cpu.vmread(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS))
            .field("VM Entry Controls", &cpu.vmread(vmcs::control::VMENTRY_CONTROLS))
            .field("VM Exit Controls", &cpu.vmread(vmcs::control::VMEXIT_CONTROLS))
            .field("Exception Bitmap", &cpu.vmread(vmcs::control::EXCEPTION_BITMAP))
            .field("EPT Pointer", &cpu.vmread(vmcs::control::EPTP_FULL))
            .field("VM Instruction Error", &cpu.vmread(vmcs::ro::VM_INSTRUCTION_ERROR))
            .finish_non_exhaustive()
    }
}
