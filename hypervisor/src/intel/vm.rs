//! Per-core virtualization state and the VMX region lifecycle.
//!
//! A core moves through `Uninitialized -> RegionsAllocated -> Entered -> Launched -> Off`. Each
//! `Vm` is owned by its core; other cores never touch it while the hypervisor is running.

use {
    crate::{
        allocate::{allocate_stack, box_zeroed},
        config::{HOST_STACK_SIZE, PENDING_INTERRUPTS_BUFFER_CAPACITY},
        error::HypervisorError,
        intel::{
            bitmap::{IoBitmap, MsrBitmap},
            capture::GuestRegisters,
            segmentation::ProcessorState,
            shared::EptState,
            support::{Cpu, Intel},
            vmcs::{self, set_primary_controls, ControlAddresses, Vmcs},
            vmexit::handle_vmexit,
            vmlaunch::{launch_vm, resume_guest},
            vmxon::{disable_vmx_operation, prepare_vmx_operation, revision_identifier, Vmxon},
        },
        platform::Platform,
    },
    alloc::boxed::Box,
    core::cell::UnsafeCell,
    heapless::Deque,
    log::*,
    x86::{
        bits64::rflags::RFlags,
        vmx::vmcs::{control::PrimaryControls, guest, ro},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxState {
    Uninitialized,
    RegionsAllocated,
    /// VMXON executed and the VMCS is current.
    Entered,
    /// The guest has run at least once.
    Launched,
    Off,
}

pub struct Vm {
    pub core_id: usize,
    pub state: VmxState,

    pub vmxon_region: Option<Box<Vmxon>>,
    pub vmxon_region_pa: u64,
    pub vmcs_region: Option<Box<Vmcs>>,
    pub vmcs_region_pa: u64,

    pub msr_bitmap: Box<MsrBitmap>,
    pub msr_bitmap_pa: u64,
    pub io_bitmap: Box<IoBitmap>,
    pub io_bitmap_pa: u64,

    /// The stack VM exits are handled on.
    pub host_stack: Box<[u8]>,

    /// The guest's general-purpose registers state.
    pub guest_registers: GuestRegisters,

    pub eptp: u64,

    /// Set once `capture_registers` has been passed on the way into the guest.
    pub virtualization_attempted: bool,
    pub launched: bool,
    /// VM-instruction error of a failed VMLAUNCH/VMRESUME.
    pub launch_error: Option<u64>,
    pub vmxoff_executed: bool,

    pub in_root_mode: bool,
    pub suppress_rip_advance: bool,

    /// Page whose hook was lifted for one instruction and must be re-applied on the next MTF exit.
    pub mtf_restore_target: Option<u64>,
    /// Keeps MTF armed after a hook restore because a single-step request also waits on it.
    pub ignore_mtf_unset: bool,
    pub single_step_pending: bool,

    /// External-interrupt exiting as configured through hypercalls, independent of hook single-steps.
    pub external_interrupt_exiting_requested: bool,
    pub pending_interrupts: Deque<u32, PENDING_INTERRUPTS_BUFFER_CAPACITY>,
    pub queued_nmis: u32,
}

impl Vm {
    /// Allocates the bitmaps and host stack of `core_id`. The VMX regions come later, from the core itself.
    pub fn new<P: Platform + ?Sized>(core_id: usize, eptp: u64, platform: &P) -> Result<Self, HypervisorError> {
        trace!("Creating VM for core {}", core_id);

        let msr_bitmap = unsafe { box_zeroed::<MsrBitmap>() }?;
        let io_bitmap = unsafe { box_zeroed::<IoBitmap>() }?;
        let msr_bitmap_pa = platform.virtual_to_physical(&*msr_bitmap as *const MsrBitmap as u64);
        let io_bitmap_pa = platform.virtual_to_physical(&*io_bitmap as *const IoBitmap as u64);

        Ok(Self {
            core_id,
            state: VmxState::Uninitialized,
            vmxon_region: None,
            vmxon_region_pa: 0,
            vmcs_region: None,
            vmcs_region_pa: 0,
            msr_bitmap,
            msr_bitmap_pa,
            io_bitmap,
            io_bitmap_pa,
            host_stack: allocate_stack(HOST_STACK_SIZE)?,
            guest_registers: GuestRegisters::default(),
            eptp,
            virtualization_attempted: false,
            launched: false,
            launch_error: None,
            vmxoff_executed: false,
            in_root_mode: false,
            suppress_rip_advance: false,
            mtf_restore_target: None,
            ignore_mtf_unset: false,
            single_step_pending: false,
            external_interrupt_exiting_requested: false,
            pending_interrupts: Deque::new(),
            queued_nmis: 0,
        })
    }

    /// Allocates the VMXON region and the VMCS and stamps both with the revision identifier.
    pub fn allocate_regions<C: Cpu + ?Sized, P: Platform + ?Sized>(&mut self, cpu: &C, platform: &P) -> Result<(), HypervisorError> {
        if self.state != VmxState::Uninitialized {
            return Err(HypervisorError::InvalidVmxState);
        }

        let revision_id = revision_identifier(cpu);

        let mut vmxon_region = unsafe { box_zeroed::<Vmxon>() }?;
        let mut vmcs_region = unsafe { box_zeroed::<Vmcs>() }?;
        vmxon_region.revision_id = revision_id;
        vmcs_region.revision_id = revision_id;

        self.vmxon_region_pa = platform.virtual_to_physical(&*vmxon_region as *const Vmxon as u64);
        self.vmcs_region_pa = platform.virtual_to_physical(&*vmcs_region as *const Vmcs as u64);
        self.vmxon_region = Some(vmxon_region);
        self.vmcs_region = Some(vmcs_region);
        self.state = VmxState::RegionsAllocated;

        trace!("Core {} VMXON region at {:#x}, VMCS at {:#x}", self.core_id, self.vmxon_region_pa, self.vmcs_region_pa);

        Ok(())
    }

    /// Enters VMX operation. On failure the regions are released and the core is back to `Uninitialized`.
    pub fn activate_vmxon<C: Cpu + ?Sized>(&mut self, cpu: &mut C) -> Result<(), HypervisorError> {
        if self.state != VmxState::RegionsAllocated {
            return Err(HypervisorError::InvalidVmxState);
        }

        let result = prepare_vmx_operation(cpu).and_then(|_| cpu.vmxon(self.vmxon_region_pa));
        if let Err(error) = result {
            error!("Core {} failed to enter VMX operation: {}", self.core_id, error);
            disable_vmx_operation(cpu);
            self.release_regions();
            return Err(error);
        }

        self.state = VmxState::Entered;
        debug!("Core {} entered VMX operation", self.core_id);

        Ok(())
    }

    /// Makes the VMCS current and writes every guest, host and control field.
    pub fn activate_vmcs<C: Cpu + ?Sized>(&mut self, cpu: &mut C, state: &ProcessorState) -> Result<(), HypervisorError> {
        if self.state != VmxState::Entered {
            return Err(HypervisorError::InvalidVmxState);
        }

        cpu.vmclear(self.vmcs_region_pa)?;
        cpu.vmptrld(self.vmcs_region_pa)?;

        let addresses = ControlAddresses {
            eptp: self.eptp,
            msr_bitmap: self.msr_bitmap_pa,
            io_bitmap_a: self.io_bitmap_pa,
            io_bitmap_b: self.io_bitmap_pa + 0x1000,
        };

        vmcs::setup_guest_registers_state(cpu, state, &self.guest_registers);
        vmcs::setup_host_registers_state(cpu, state);
        vmcs::setup_vmcs_control_fields(cpu, state, &addresses);

        debug!("Core {} VMCS activated", self.core_id);

        Ok(())
    }

    /// Runs the guest on the current core, handling exits until VMX is left.
    ///
    /// Must be called on the host stack. Returns to the guest context through `resume_guest`, either
    /// after VMXOFF or when VM entry fails, in which case `launch_error` is set.
    pub fn launch(&mut self, ept_state: &EptState) -> ! {
        let mut cpu = Intel;

        info!("Core {} launching the VM", self.core_id);

        // Hypercalls from this core are valid from the first guest instruction on. A failed entry
        // moves the state to `Off`.
        self.state = VmxState::Launched;

        loop {
            let flags = unsafe { launch_vm(&mut self.guest_registers, u64::from(self.launched)) };

            if RFlags::from_raw(flags).intersects(RFlags::FLAGS_CF | RFlags::FLAGS_ZF) {
                self.fail_entry(&mut cpu);
                unsafe { resume_guest(&self.guest_registers) };
            }

            self.launched = true;

            if handle_vmexit(self, &mut cpu, ept_state) {
                unsafe { resume_guest(&self.guest_registers) };
            }
        }
    }

    /// Records a failed VM entry and leaves VMX operation.
    pub fn fail_entry<C: Cpu + ?Sized>(&mut self, cpu: &mut C) {
        let instruction_error = cpu.vmread(ro::VM_INSTRUCTION_ERROR);
        error!(
            "Core {} VM entry failed: {}",
            self.core_id,
            crate::intel::vmerror::vm_instruction_error_description(instruction_error)
        );

        if let Err(error) = cpu.vmxoff() {
            error!("Core {}: {}", self.core_id, error);
        }
        disable_vmx_operation(cpu);

        self.launch_error = Some(instruction_error);
        self.state = VmxState::Off;
    }

    /// Leaves VMX operation from a VMCALL exit and prepares the return to the guest context.
    ///
    /// The guest resumes after the VMCALL with its own stack, RFLAGS, CR3 and descriptor tables.
    pub fn vmxoff<C: Cpu + ?Sized>(&mut self, cpu: &mut C) -> Result<(), HypervisorError> {
        if self.state != VmxState::Launched {
            return Err(HypervisorError::InvalidVmxState);
        }

        // The VMCS is unreadable once VMX is off.
        let return_rip = self.guest_registers.rip + cpu.vmread(ro::VMEXIT_INSTRUCTION_LEN);
        let return_rsp = cpu.vmread(guest::RSP);
        let return_rflags = cpu.vmread(guest::RFLAGS);
        let guest_cr3 = cpu.vmread(guest::CR3);
        let gdtr_base = cpu.vmread(guest::GDTR_BASE);
        let gdtr_limit = cpu.vmread(guest::GDTR_LIMIT) as u16;
        let idtr_base = cpu.vmread(guest::IDTR_BASE);
        let idtr_limit = cpu.vmread(guest::IDTR_LIMIT) as u16;

        cpu.vmxoff()?;

        cpu.cr3_write(guest_cr3);
        cpu.load_descriptor_tables(gdtr_base, gdtr_limit, idtr_base, idtr_limit);
        disable_vmx_operation(cpu);

        self.guest_registers.rip = return_rip;
        self.guest_registers.rsp = return_rsp;
        self.guest_registers.rflags = return_rflags;
        self.vmxoff_executed = true;
        self.state = VmxState::Off;

        info!("Core {} left VMX operation", self.core_id);

        Ok(())
    }

    /// Drops the VMXON region and the VMCS.
    pub fn release_regions(&mut self) {
        self.vmxon_region = None;
        self.vmcs_region = None;
        self.vmxon_region_pa = 0;
        self.vmcs_region_pa = 0;

        if self.state != VmxState::Off {
            self.state = VmxState::Uninitialized;
        }
    }

    /// Asks for an MTF exit after the next guest instruction.
    ///
    /// If a hook restore is already waiting on MTF, that exit keeps MTF armed and the step completes
    /// on the exit after it.
    pub fn request_single_step<C: Cpu + ?Sized>(&mut self, cpu: &mut C) {
        self.single_step_pending = true;
        self.ignore_mtf_unset = self.mtf_restore_target.is_some();
        set_primary_controls(cpu, PrimaryControls::MONITOR_TRAP_FLAG, true);
    }

    /// Top of the host stack, laid out like a call frame with home space.
    pub fn host_stack_top(&self) -> u64 {
        let end = self.host_stack.as_ptr() as u64 + self.host_stack.len() as u64;
        (end & !0xf) - 0x28
    }
}

/// A per-core `Vm` slot owned by the hypervisor context.
///
/// Each slot is only ever borrowed mutably by the core it belongs to, or by the issuing core
/// while no core is virtualized.
pub struct CoreSlot(UnsafeCell<Vm>);

unsafe impl Sync for CoreSlot {}

impl CoreSlot {
    pub fn new(vm: Vm) -> Self {
        Self(UnsafeCell::new(vm))
    }

    /// # Safety
    ///
    /// The caller must be the owning core, or no other reference to this slot may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get(&self) -> &mut Vm {
        unsafe { &mut *self.0.get() }
    }
}
