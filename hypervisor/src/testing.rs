//! Host-side stand-ins for the processor and the hosting kernel.
//!
//! `SimulatedCpu` keeps VMCS fields, MSRs and registers in maps and records every
//! invalidation. `SimulatedPlatform` runs deferred and all-core calls on real threads
//! so that the synchronization code is exercised under actual concurrency.

use {
    crate::{
        error::HypervisorError,
        intel::{
            invept::{InveptType, InvvpidType},
            segmentation::{ProcessorState, SegmentDescriptor},
            support::{AccessSize, Cpu},
        },
        platform::{CallBarrier, DeferredCall, Platform},
    },
    alloc::boxed::Box,
    core::arch::x86_64::CpuidResult,
    std::{
        cell::Cell,
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Barrier, Mutex,
        },
        vec::Vec,
    },
};

#[derive(Default)]
pub struct SimulatedCpu {
    pub vmcs: HashMap<u32, u64>,
    pub msrs: HashMap<u32, u64>,
    pub cpuid: HashMap<(u32, u32), CpuidResult>,
    pub invept_log: Vec<(InveptType, u64)>,
    pub invvpid_log: Vec<(InvvpidType, u16, u64)>,
    pub fail_vmxon: bool,
    pub vmx_enabled: bool,
    pub current_vmcs: Option<u64>,
    pub cleared_vmcs: Vec<u64>,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub xcr: HashMap<u32, u64>,
    pub tsc: u64,
    pub tsc_aux: u32,
    pub pmc: HashMap<u32, u64>,
    pub wbinvd_count: usize,
    pub debug_registers: [u64; 8],
    pub ports: HashMap<u16, u32>,
    pub port_writes: Vec<(u16, AccessSize, u32)>,
    pub memory: HashMap<u64, u8>,
    pub descriptor_tables: Option<(u64, u16, u64, u16)>,
    /// VMREADs issued outside VMX operation. Hardware raises #UD for them.
    pub vmreads_outside_vmx: Cell<usize>,
}

impl SimulatedCpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_msr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    pub fn set_cpuid(&mut self, leaf: u32, sub_leaf: u32, eax: u32, ebx: u32, ecx: u32, edx: u32) {
        self.cpuid.insert((leaf, sub_leaf), CpuidResult { eax, ebx, ecx, edx });
    }

    pub fn write_memory(&mut self, address: u64, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.memory.insert(address + offset as u64, *byte);
        }
    }
}

impl Cpu for SimulatedCpu {
    fn vmxon(&mut self, _vmxon_region: u64) -> Result<(), HypervisorError> {
        if self.fail_vmxon {
            return Err(HypervisorError::VMXONFailed);
        }
        self.vmx_enabled = true;
        Ok(())
    }

    fn vmxoff(&mut self) -> Result<(), HypervisorError> {
        if !self.vmx_enabled {
            return Err(HypervisorError::VMXOFFFailed);
        }
        self.vmx_enabled = false;
        self.current_vmcs = None;
        Ok(())
    }

    fn vmclear(&mut self, vmcs_region: u64) -> Result<(), HypervisorError> {
        if !self.vmx_enabled {
            return Err(HypervisorError::VMCLEARFailed);
        }
        self.cleared_vmcs.push(vmcs_region);
        Ok(())
    }

    fn vmptrld(&mut self, vmcs_region: u64) -> Result<(), HypervisorError> {
        if !self.cleared_vmcs.contains(&vmcs_region) {
            return Err(HypervisorError::VMPTRLDFailed);
        }
        self.current_vmcs = Some(vmcs_region);
        Ok(())
    }

    fn vmread(&self, field: u32) -> u64 {
        if !self.vmx_enabled {
            self.vmreads_outside_vmx.set(self.vmreads_outside_vmx.get() + 1);
        }
        self.vmcs.get(&field).copied().unwrap_or(0)
    }

    fn vmwrite(&mut self, field: u32, value: u64) {
        self.vmcs.insert(field, value);
    }

    fn invept(&mut self, invalidation: InveptType, eptp: u64) {
        self.invept_log.push((invalidation, eptp));
    }

    fn invvpid(&mut self, invalidation: InvvpidType, vpid: u16, linear_address: u64) {
        self.invvpid_log.push((invalidation, vpid, linear_address));
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
        self.cpuid.get(&(leaf, sub_leaf)).copied().unwrap_or(CpuidResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        })
    }

    fn cr0(&self) -> u64 {
        self.cr0
    }

    fn cr0_write(&mut self, value: u64) {
        self.cr0 = value;
    }

    fn cr3(&self) -> u64 {
        self.cr3
    }

    fn cr3_write(&mut self, value: u64) {
        self.cr3 = value;
    }

    fn cr4(&self) -> u64 {
        self.cr4
    }

    fn cr4_write(&mut self, value: u64) {
        self.cr4 = value;
    }

    fn xsetbv(&mut self, xcr: u32, value: u64) {
        self.xcr.insert(xcr, value);
    }

    fn load_descriptor_tables(&mut self, gdt_base: u64, gdt_limit: u16, idt_base: u64, idt_limit: u16) {
        self.descriptor_tables = Some((gdt_base, gdt_limit, idt_base, idt_limit));
    }

    fn rdtsc(&self) -> u64 {
        self.tsc
    }

    fn rdtscp(&self) -> (u64, u32) {
        (self.tsc, self.tsc_aux)
    }

    fn rdpmc(&self, counter: u32) -> u64 {
        self.pmc.get(&counter).copied().unwrap_or(0)
    }

    fn wbinvd(&mut self) {
        self.wbinvd_count += 1;
    }

    fn dr(&self, index: u8) -> u64 {
        self.debug_registers[index as usize & 7]
    }

    fn dr_write(&mut self, index: u8, value: u64) {
        self.debug_registers[index as usize & 7] = value;
    }

    fn port_read(&mut self, port: u16, size: AccessSize) -> u32 {
        self.ports.get(&port).copied().unwrap_or(0xffff_ffff) & size.mask() as u32
    }

    fn port_write(&mut self, port: u16, size: AccessSize, value: u32) {
        self.port_writes.push((port, size, value & size.mask() as u32));
    }

    fn guest_read(&self, address: u64, size: AccessSize) -> u32 {
        (0..size as u64).fold(0u32, |value, offset| {
            let byte = self.memory.get(&(address + offset)).copied().unwrap_or(0);
            value | (byte as u32) << (offset * 8)
        })
    }

    fn guest_write(&mut self, address: u64, size: AccessSize, value: u32) {
        for offset in 0..size as u64 {
            self.memory.insert(address + offset, (value >> (offset * 8)) as u8);
        }
    }
}

std::thread_local! {
    static CURRENT_CORE: Cell<usize> = const { Cell::new(0) };
}

/// Something the simulated kernel was asked to do, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    DeferredCall { core: usize },
    Broadcast,
    Vmcall { core: usize, request: u64 },
}

type VmcallHandler = dyn Fn(usize, u64, u64, u64, u64) -> u64 + Send + Sync;

struct Inner {
    processor_count: usize,
    deferred_allocations: AtomicUsize,
    deferred_frees: AtomicUsize,
    fail_deferred_allocations: AtomicBool,
    completed_broadcast_cores: AtomicUsize,
    events: Mutex<Vec<PlatformEvent>>,
    vmcalls: Mutex<Vec<(usize, u64, u64, u64, u64)>>,
    vmcall_handler: Mutex<Option<Arc<VmcallHandler>>>,
}

/// A kernel with `processor_count` cores, each backed by a host thread while a call runs.
///
/// Clones share state, so a test can keep one handle after moving another into the hypervisor.
#[derive(Clone)]
pub struct SimulatedPlatform {
    inner: Arc<Inner>,
}

impl SimulatedPlatform {
    pub fn new(processor_count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                processor_count,
                deferred_allocations: AtomicUsize::new(0),
                deferred_frees: AtomicUsize::new(0),
                fail_deferred_allocations: AtomicBool::new(false),
                completed_broadcast_cores: AtomicUsize::new(0),
                events: Mutex::new(Vec::new()),
                vmcalls: Mutex::new(Vec::new()),
                vmcall_handler: Mutex::new(None),
            }),
        }
    }

    /// Index of the simulated core the calling thread stands for.
    pub fn current_core() -> usize {
        CURRENT_CORE.with(|core| core.get())
    }

    pub fn deferred_allocations(&self) -> usize {
        self.inner.deferred_allocations.load(Ordering::SeqCst)
    }

    pub fn deferred_frees(&self) -> usize {
        self.inner.deferred_frees.load(Ordering::SeqCst)
    }

    pub fn fail_deferred_allocations(&self, fail: bool) {
        self.inner.fail_deferred_allocations.store(fail, Ordering::SeqCst);
    }

    pub fn completed_broadcast_cores(&self) -> usize {
        self.inner.completed_broadcast_cores.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        self.inner.events.lock().unwrap().clone()
    }

    /// Every hypercall issued so far as `(core, request, parameter1, parameter2, parameter3)`.
    pub fn vmcalls(&self) -> Vec<(usize, u64, u64, u64, u64)> {
        self.inner.vmcalls.lock().unwrap().clone()
    }

    /// Routes hypercalls to `handler`. Without one every hypercall succeeds.
    pub fn set_vmcall_handler(&self, handler: impl Fn(usize, u64, u64, u64, u64) -> u64 + Send + Sync + 'static) {
        *self.inner.vmcall_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    fn record(&self, event: PlatformEvent) {
        self.inner.events.lock().unwrap().push(event);
    }
}

struct SimulatedBarrier<'a> {
    barrier: &'a Barrier,
    completed: &'a AtomicUsize,
}

impl CallBarrier for SimulatedBarrier<'_> {
    fn synchronize(&self) {
        self.barrier.wait();
    }

    fn done(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Platform for SimulatedPlatform {
    fn processor_count(&self) -> usize {
        self.inner.processor_count
    }

    fn current_processor(&self) -> usize {
        Self::current_core()
    }

    fn virtual_to_physical(&self, virtual_address: u64) -> u64 {
        virtual_address
    }

    fn allocate_deferred_call(&self, call: DeferredCall) -> Option<Box<DeferredCall>> {
        self.inner.deferred_allocations.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_deferred_allocations.load(Ordering::SeqCst) {
            return None;
        }
        Some(Box::new(call))
    }

    fn queue_deferred_call(&self, call: &DeferredCall) {
        self.record(PlatformEvent::DeferredCall { core: call.target() });

        let target = call.target();
        let address = call as *const DeferredCall as usize;

        // The issuing core keeps the call alive until the completion lock is released.
        std::thread::spawn(move || {
            CURRENT_CORE.with(|core| core.set(target));
            unsafe { (*(address as *const DeferredCall)).execute() };
        });
    }

    fn free_deferred_call(&self, call: Box<DeferredCall>) {
        self.inner.deferred_frees.fetch_add(1, Ordering::SeqCst);
        drop(call);
    }

    fn call_on_all_processors(&self, routine: &(dyn Fn(&dyn CallBarrier) + Sync)) {
        self.record(PlatformEvent::Broadcast);

        let count = self.inner.processor_count;
        let barrier = Barrier::new(count);
        let completed_before = self.inner.completed_broadcast_cores.load(Ordering::SeqCst);

        std::thread::scope(|scope| {
            for core in 0..count {
                let barrier = &barrier;
                let completed = &self.inner.completed_broadcast_cores;
                scope.spawn(move || {
                    CURRENT_CORE.with(|current| current.set(core));
                    routine(&SimulatedBarrier { barrier, completed });
                });
            }
        });

        debug_assert_eq!(
            self.inner.completed_broadcast_cores.load(Ordering::SeqCst) - completed_before,
            count
        );
    }

    fn vmcall(&self, request: u64, parameter1: u64, parameter2: u64, parameter3: u64) -> u64 {
        let core = Self::current_core();
        self.record(PlatformEvent::Vmcall { core, request });
        self.inner
            .vmcalls
            .lock()
            .unwrap()
            .push((core, request, parameter1, parameter2, parameter3));

        let handler = self.inner.vmcall_handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(core, request, parameter1, parameter2, parameter3),
            None => 0,
        }
    }
}

/// A 64-bit kernel core as captured right before virtualization.
pub fn processor_state() -> ProcessorState {
    let segment = |selector: u16, access_rights: u32| SegmentDescriptor {
        selector,
        base_address: 0,
        segment_limit: 0xffff_ffff,
        access_rights,
    };

    ProcessorState {
        es: segment(0x2b, 0xc0f3),
        cs: segment(0x10, 0x209b),
        ss: segment(0x18, 0xc093),
        ds: segment(0x2b, 0xc0f3),
        fs: segment(0x53, 0x40f3),
        gs: segment(0x2b, 0xc0f3),
        ldtr: SegmentDescriptor::UNUSABLE,
        tr: SegmentDescriptor {
            selector: 0x40,
            base_address: 0xffff_f800_1234_5000,
            segment_limit: 0x67,
            access_rights: 0x8b,
        },
        gdtr_base: 0xffff_f800_1234_0000,
        gdtr_limit: 0x57,
        idtr_base: 0xffff_f800_1234_1000,
        idtr_limit: 0xfff,
        cr0: 0x8005_0033,
        cr3: 0x1ad000,
        cr4: 0x3506f8,
        dr7: 0x400,
        debugctl: 0,
        sysenter_cs: 0,
        sysenter_esp: 0,
        sysenter_eip: 0,
        fs_base: 0,
        gs_base: 0xffff_f800_0000_1000,
    }
}
