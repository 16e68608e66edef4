//! Manages hypervisor startup and shutdown.
//!
//! [`Hypervisor`] owns everything the root-mode core needs: the shared EPT, one [`Vm`] per
//! logical processor and the lock serializing single-core calls. Every core is virtualized in
//! place, so the kernel that called [`Hypervisor::start`] keeps running as the guest.

use {
    crate::{
        allocate::try_box,
        broadcast::broadcast_to_all_cores,
        error::{status_to_result, HypervisorError},
        intel::{
            capture::capture_registers,
            mtrr::{CacheMap, Mtrr},
            segmentation::ProcessorState,
            shared::EptState,
            support::{Cpu, Intel},
            vm::{CoreSlot, Vm, VmxState},
            vmlaunch::switch_stack,
        },
        platform::Platform,
        spinlock::SpinLock,
    },
    alloc::{boxed::Box, vec::Vec},
    core::{
        ffi::c_void,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    log::*,
    shared::{HypercallRequest, HypercallStatus},
    x86::msr::IA32_VMX_EPT_VPID_CAP,
};

/// The hypervisor context: created once, started on every core, stopped once.
pub struct Hypervisor<P: Platform> {
    pub(crate) platform: P,
    pub(crate) ept_state: Box<EptState>,
    pub(crate) cores: Box<[CoreSlot]>,
    /// Serializes [`crate::broadcast::run_on_single_core`].
    pub(crate) single_core_lock: SpinLock,
    pub(crate) running: AtomicBool,
}

impl<P: Platform> Hypervisor<P> {
    /// Checks that this processor can host the hypervisor and builds the EPT from its MTRRs.
    pub fn new(platform: P) -> Result<Self, HypervisorError> {
        debug!("Creating hypervisor");

        let cpu = Intel;
        check_supported_cpu(&cpu)?;

        let cache_map = Mtrr::read(&cpu);
        trace!("Cache map: {:#x?}", cache_map);

        Self::with_cache_map(platform, cache_map)
    }

    /// Builds the context from an already resolved cache map, one `Vm` per logical processor.
    pub fn with_cache_map(platform: P, cache_map: CacheMap) -> Result<Self, HypervisorError> {
        let ept_state = try_box(EptState::new(cache_map, &platform)?)?;
        let eptp = ept_state.eptp();

        let processor_count = platform.processor_count();
        let mut cores = Vec::new();
        cores
            .try_reserve_exact(processor_count)
            .map_err(|_| HypervisorError::MemoryAllocationFailed)?;

        for core_id in 0..processor_count {
            cores.push(CoreSlot::new(Vm::new(core_id, eptp, &platform)?));
        }

        debug!("Hypervisor created for {} core(s), EPTP {:#x}", processor_count, eptp);

        Ok(Self {
            platform,
            ept_state,
            cores: cores.into_boxed_slice(),
            single_core_lock: SpinLock::new(),
            running: AtomicBool::new(false),
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn ept_state(&self) -> &EptState {
        &self.ept_state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Tells whether `core` runs as a guest of this hypervisor. Only such cores may issue
    /// hypercalls; VMCALL anywhere else raises #UD.
    pub(crate) fn is_virtualized(&self, core: usize) -> bool {
        self.cores
            .get(core)
            .is_some_and(|slot| unsafe { slot.get() }.state == VmxState::Launched)
    }

    /// Virtualizes every core.
    ///
    /// Starting is all or nothing: if any core fails, the cores that did get virtualized leave
    /// VMX operation again and the error counts the failed cores.
    pub fn start(&self) -> Result<(), HypervisorError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(HypervisorError::AlreadyRunning);
        }

        info!("Virtualizing {} core(s)", self.cores.len());

        let failures = AtomicUsize::new(0);

        broadcast_to_all_cores(
            &self.platform,
            &|_| {
                if let Err(error) = self.virtualize_current_core() {
                    error!("Core {} was not virtualized: {}", self.platform.current_processor(), error);
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            },
            0,
        );

        match failures.load(Ordering::SeqCst) {
            0 => {
                info!("Every core is virtualized");
                Ok(())
            }
            count => Err(self.abandon_start(count)),
        }
    }

    /// Takes the cores that did get virtualized back out of VMX operation after `failures` cores
    /// failed to start.
    fn abandon_start(&self, failures: usize) -> HypervisorError {
        warn!("Rolling back, {} core(s) failed", failures);

        match self.devirtualize() {
            0 => self.running.store(false, Ordering::Release),
            stuck => error!("{} core(s) could not leave VMX operation", stuck),
        }

        HypervisorError::VirtualizationFailed(failures)
    }

    /// Takes every core out of VMX operation and releases the per-core regions.
    ///
    /// Hooks are removed and every core flushes its EPT translations before VMXOFF, so the guest
    /// never runs on a stale mapping once the hypervisor is gone.
    pub fn stop(&self) -> Result<(), HypervisorError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(HypervisorError::NotRunning);
        }

        info!("Devirtualizing {} core(s)", self.cores.len());

        if self.is_virtualized(self.platform.current_processor()) {
            let status = self.platform.vmcall(HypercallRequest::UnhookAllPages.into(), 0, 0, 0);
            if let Err(error) = status_to_result(HypercallStatus::from_u64(status)) {
                warn!("Failed to remove hooks: {}", error);
            }
        } else {
            warn!("Core {} is not virtualized, hooks stay in place", self.platform.current_processor());
        }

        match self.devirtualize() {
            0 => {
                self.running.store(false, Ordering::Release);
                info!("Every core left VMX operation");
                Ok(())
            }
            // The hypervisor keeps running on those cores, so `stop` can be retried.
            count => Err(HypervisorError::VirtualizationFailed(count)),
        }
    }

    /// Flushes and leaves VMX operation on every virtualized core, then releases the regions of
    /// every core that is out of it. Returns how many cores are still in VMX operation.
    ///
    /// A core whose VMXOFF failed keeps its regions: the processor still references them.
    fn devirtualize(&self) -> usize {
        self.broadcast_hypercall(HypercallRequest::InveptAllContexts);
        let failed = self.broadcast_hypercall(HypercallRequest::Vmxoff);

        for (core, slot) in self.cores.iter().enumerate() {
            if failed.get(core).copied().unwrap_or(false) {
                warn!("Core {} is still in VMX operation, keeping its regions", core);
                continue;
            }

            // This core no longer runs in root mode.
            unsafe { slot.get() }.release_regions();
        }

        failed.iter().filter(|&&failed| failed).count()
    }

    /// Issues `request` on every virtualized core. Returns, per core, whether the request failed.
    fn broadcast_hypercall(&self, request: HypercallRequest) -> Vec<bool> {
        let failed: Vec<AtomicBool> = (0..self.cores.len()).map(|_| AtomicBool::new(false)).collect();

        broadcast_to_all_cores(
            &self.platform,
            &|_| {
                let core = self.platform.current_processor();
                if !self.is_virtualized(core) {
                    return;
                }

                let status = HypercallStatus::from_u64(self.platform.vmcall(request.into(), 0, 0, 0));
                if !status.is_success() {
                    error!("Core {}: {:?} returned {:?}", core, request, status);
                    if let Some(flag) = failed.get(core) {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            },
            0,
        );

        failed.iter().map(|flag| flag.load(Ordering::SeqCst)).collect()
    }

    /// Runs on each core from the start broadcast.
    ///
    /// `capture_registers` returns twice: first on the way in, then once more as the guest when
    /// the VM runs, or after a failed VM entry with `launch_error` set.
    fn virtualize_current_core(&self) -> Result<(), HypervisorError> {
        let core = self.platform.current_processor();
        let slot = self.cores.get(core).ok_or(HypervisorError::InvalidCoreIndex(core))?;
        let vm = unsafe { slot.get() };
        let mut cpu = Intel;

        vm.virtualization_attempted = false;
        unsafe { capture_registers(&mut vm.guest_registers) };

        if unsafe { core::ptr::read_volatile(&vm.virtualization_attempted) } {
            return match vm.launch_error.take() {
                Some(code) => {
                    vm.release_regions();
                    Err(HypervisorError::VMLAUNCHFailed(code))
                }
                None => {
                    debug!("Core {} is running as a guest", core);
                    Ok(())
                }
            };
        }

        unsafe { core::ptr::write_volatile(&mut vm.virtualization_attempted, true) };

        vm.allocate_regions(&cpu, &self.platform)?;
        vm.activate_vmxon(&mut cpu)?;

        let state = unsafe { ProcessorState::capture(&cpu) };
        if let Err(error) = vm.activate_vmcs(&mut cpu, &state) {
            vm.fail_entry(&mut cpu);
            vm.release_regions();
            return Err(error);
        }

        let stack_top = vm.host_stack_top();
        let ept_state: *const EptState = &*self.ept_state;

        unsafe { switch_stack(vm, ept_state as *const c_void, landing as usize, stack_top) }
    }
}

/// First function on the host stack.
extern "efiapi" fn landing(vm: &mut Vm, ept_state: &EptState) -> ! {
    vm.launch(ept_state)
}

/// Checks if the CPU is supported for hypervisor operation.
///
/// Verifies the CPU is Intel with VMX support, Memory Type Range Registers (MTRRs) support and
/// the EPT/VPID capabilities the EPT manager relies on.
pub fn check_supported_cpu<C: Cpu + ?Sized>(cpu: &C) -> Result<(), HypervisorError> {
    /* Intel® 64 and IA-32 Architectures Software Developer's Manual: 24.6 DISCOVERING SUPPORT FOR VMX */
    has_intel_cpu(cpu)?;
    info!("CPU is Intel");

    has_vmx_support(cpu)?;
    info!("Virtual Machine Extension (VMX) technology is supported");

    has_mtrr(cpu)?;
    info!("Memory Type Range Registers (MTRRs) are supported");

    check_ept_support(cpu)?;
    info!("Extended Page Tables (EPT) are supported");

    Ok(())
}

/// Verifies the CPU vendor is GenuineIntel.
fn has_intel_cpu<C: Cpu + ?Sized>(cpu: &C) -> Result<(), HypervisorError> {
    let leaf = cpu.cpuid(0, 0);

    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&leaf.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&leaf.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&leaf.ecx.to_le_bytes());

    if &vendor == b"GenuineIntel" {
        Ok(())
    } else {
        Err(HypervisorError::CPUUnsupported)
    }
}

/// CPUID.1:ECX.VMX[bit 5]
fn has_vmx_support<C: Cpu + ?Sized>(cpu: &C) -> Result<(), HypervisorError> {
    if cpu.cpuid(1, 0).ecx & (1 << 5) != 0 {
        Ok(())
    } else {
        Err(HypervisorError::VMXUnsupported)
    }
}

/// CPUID.1:EDX.MTRR[bit 12]
fn has_mtrr<C: Cpu + ?Sized>(cpu: &C) -> Result<(), HypervisorError> {
    if cpu.cpuid(1, 0).edx & (1 << 12) != 0 {
        Ok(())
    } else {
        Err(HypervisorError::MTRRUnsupported)
    }
}

/// Checks for Extended Page Tables (EPT) support on the CPU.
///
/// Credits Satoshi Tanda: https://github.com/tandasat/MiniVisorPkg/blob/master/Sources/MiniVisor.c#L534-L550
fn check_ept_support<C: Cpu + ?Sized>(cpu: &C) -> Result<(), HypervisorError> {
    /// [Bit 6] Indicates support for a page-walk length of 4.
    const PAGE_WALK_LENGTH_4: u64 = 1 << 6;

    /// [Bit 14] The EPT paging-structure memory type can be write-back (WB).
    const MEMORY_TYPE_WRITE_BACK: u64 = 1 << 14;

    /// [Bit 16] An EPT PDE can map a 2-Mbyte page.
    const PDE_2MB_PAGES: u64 = 1 << 16;

    /// [Bit 20] INVEPT is supported.
    const INVEPT: u64 = 1 << 20;

    /// [Bit 25] Single-context INVEPT is supported.
    const INVEPT_SINGLE_CONTEXT: u64 = 1 << 25;

    /// [Bit 26] All-context INVEPT is supported.
    const INVEPT_ALL_CONTEXTS: u64 = 1 << 26;

    /// [Bit 32] INVVPID is supported.
    const INVVPID: u64 = 1 << 32;

    /// [Bit 41] Single-context INVVPID is supported.
    const INVVPID_SINGLE_CONTEXT: u64 = 1 << 41;

    /// [Bit 42] All-context INVVPID is supported.
    const INVVPID_ALL_CONTEXTS: u64 = 1 << 42;

    let ept_vpid_cap = cpu.rdmsr(IA32_VMX_EPT_VPID_CAP);

    let required_features = PAGE_WALK_LENGTH_4
        | MEMORY_TYPE_WRITE_BACK
        | PDE_2MB_PAGES
        | INVEPT
        | INVEPT_SINGLE_CONTEXT
        | INVEPT_ALL_CONTEXTS
        | INVVPID
        | INVVPID_SINGLE_CONTEXT
        | INVVPID_ALL_CONTEXTS;

    if ept_vpid_cap & required_features != required_features {
        return Err(HypervisorError::EPTUnsupported);
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::{
            intel::{
                mtrr::{CacheRange, MemoryType},
                vm::VmxState,
            },
            testing::{PlatformEvent, SimulatedCpu, SimulatedPlatform},
        },
        alloc::vec,
    };

    const EPT_VPID_CAP: u64 = 0x0000_0f01_0611_4141;

    fn supported_cpu() -> SimulatedCpu {
        let mut cpu = SimulatedCpu::new();
        cpu.set_cpuid(0, 0, 0x16, 0x756e_6547, 0x6c65_746e, 0x4965_6e69);
        cpu.set_cpuid(1, 0, 0x906ea, 0, 1 << 5, 1 << 12);
        cpu.set_msr(IA32_VMX_EPT_VPID_CAP, EPT_VPID_CAP);
        cpu
    }

    fn hypervisor(processor_count: usize) -> Hypervisor<SimulatedPlatform> {
        let cache_map = CacheMap::new(vec![CacheRange::new(0xa0000, 0x100000, MemoryType::Uncacheable)]);
        Hypervisor::with_cache_map(SimulatedPlatform::new(processor_count), cache_map).unwrap()
    }

    /// A started hypervisor on `processor_count` simulated cores, every one of them launched.
    pub(crate) fn running_hypervisor(processor_count: usize) -> Hypervisor<SimulatedPlatform> {
        let hypervisor = hypervisor(processor_count);
        for slot in hypervisor.cores.iter() {
            unsafe { slot.get() }.state = VmxState::Launched;
        }
        hypervisor.running.store(true, Ordering::Release);
        hypervisor
    }

    fn vm(hypervisor: &Hypervisor<SimulatedPlatform>, core: usize) -> &mut Vm {
        unsafe { hypervisor.cores[core].get() }
    }

    #[test]
    fn intel_cpu_with_vmx_ept_and_mtrr_is_supported() {
        assert_eq!(check_supported_cpu(&supported_cpu()), Ok(()));
    }

    #[test]
    fn other_vendors_are_rejected() {
        let mut cpu = supported_cpu();
        // AuthenticAMD
        cpu.set_cpuid(0, 0, 0x10, 0x6874_7541, 0x444d_4163, 0x6974_6e65);

        assert_eq!(check_supported_cpu(&cpu), Err(HypervisorError::CPUUnsupported));
    }

    #[test]
    fn missing_features_are_reported() {
        let mut cpu = supported_cpu();
        cpu.set_cpuid(1, 0, 0x906ea, 0, 0, 1 << 12);
        assert_eq!(check_supported_cpu(&cpu), Err(HypervisorError::VMXUnsupported));

        let mut cpu = supported_cpu();
        cpu.set_cpuid(1, 0, 0x906ea, 0, 1 << 5, 0);
        assert_eq!(check_supported_cpu(&cpu), Err(HypervisorError::MTRRUnsupported));

        let mut cpu = supported_cpu();
        cpu.set_msr(IA32_VMX_EPT_VPID_CAP, EPT_VPID_CAP & !(1 << 16));
        assert_eq!(check_supported_cpu(&cpu), Err(HypervisorError::EPTUnsupported));
    }

    #[test]
    fn one_vm_per_core_sharing_the_eptp() {
        let hypervisor = hypervisor(4);

        assert_eq!(hypervisor.cores.len(), 4);
        for (index, slot) in hypervisor.cores.iter().enumerate() {
            let vm = unsafe { slot.get() };
            assert_eq!(vm.core_id, index);
            assert_eq!(vm.eptp, hypervisor.ept_state.eptp());
            assert_eq!(vm.state, VmxState::Uninitialized);
        }
    }

    #[test]
    fn start_twice_is_rejected() {
        let hypervisor = running_hypervisor(1);

        assert_eq!(hypervisor.start(), Err(HypervisorError::AlreadyRunning));
    }

    #[test]
    fn stop_unhooks_flushes_then_leaves_vmx() {
        let hypervisor = running_hypervisor(2);

        assert_eq!(hypervisor.stop(), Ok(()));
        assert!(!hypervisor.is_running());

        let unhook = u64::from(HypercallRequest::UnhookAllPages);
        let invept = u64::from(HypercallRequest::InveptAllContexts);
        let vmxoff = u64::from(HypercallRequest::Vmxoff);

        let events = hypervisor.platform.events();
        assert_eq!(events[0], PlatformEvent::Vmcall { core: 0, request: unhook });
        assert_eq!(events[1], PlatformEvent::Broadcast);
        assert_eq!(events[4], PlatformEvent::Broadcast);

        let mut flushes = events[2..4].to_vec();
        flushes.sort_by_key(|event| match event {
            PlatformEvent::Vmcall { core, .. } => *core,
            _ => usize::MAX,
        });
        assert_eq!(
            flushes,
            vec![
                PlatformEvent::Vmcall { core: 0, request: invept },
                PlatformEvent::Vmcall { core: 1, request: invept },
            ]
        );
        assert!(events[5..]
            .iter()
            .all(|event| matches!(event, PlatformEvent::Vmcall { request, .. } if *request == vmxoff)));
        assert_eq!(events.len(), 7);
    }

    #[test]
    fn stop_reports_cores_that_stayed_in_vmx() {
        let hypervisor = running_hypervisor(3);
        let vmxoff = u64::from(HypercallRequest::Vmxoff);
        hypervisor.platform.set_vmcall_handler(move |core, request, _, _, _| {
            if request == vmxoff && core == 2 {
                HypercallStatus::Unsuccessful.to_u64()
            } else {
                HypercallStatus::Success.to_u64()
            }
        });

        let mut cpu = SimulatedCpu::new();
        cpu.set_msr(x86::msr::IA32_VMX_BASIC, 0x00da_0400_0000_0004);
        let stuck = vm(&hypervisor, 2);
        stuck.state = VmxState::Uninitialized;
        stuck.allocate_regions(&cpu, &hypervisor.platform).unwrap();
        stuck.state = VmxState::Launched;

        assert_eq!(hypervisor.stop(), Err(HypervisorError::VirtualizationFailed(1)));

        let stuck = vm(&hypervisor, 2);
        assert_eq!(stuck.state, VmxState::Launched);
        assert!(stuck.vmxon_region.is_some());
        assert!(stuck.vmcs_region.is_some());
        assert_eq!(vm(&hypervisor, 0).state, VmxState::Uninitialized);
        assert!(hypervisor.is_running());

        // A second attempt only reaches the core that is still virtualized.
        hypervisor.platform.set_vmcall_handler(|_, _, _, _, _| HypercallStatus::Success.to_u64());
        let issued = hypervisor.platform.vmcalls().len();

        assert_eq!(hypervisor.stop(), Ok(()));

        let retried = &hypervisor.platform.vmcalls()[issued..];
        assert_eq!(retried.len(), 2);
        assert!(retried.iter().all(|call| call.0 == 2));
        assert!(vm(&hypervisor, 2).vmcs_region.is_none());
        assert!(!hypervisor.is_running());
    }

    #[test]
    fn failed_start_takes_the_launched_cores_back_out() {
        let hypervisor = running_hypervisor(3);
        vm(&hypervisor, 2).state = VmxState::Uninitialized;

        assert_eq!(hypervisor.abandon_start(1), HypervisorError::VirtualizationFailed(1));

        assert!(!hypervisor.is_running());
        let calls = hypervisor.platform.vmcalls();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|call| call.0 != 2));
        assert!(calls
            .iter()
            .any(|call| call.0 == 1 && call.1 == u64::from(HypercallRequest::Vmxoff)));
        assert!((0..3).all(|core| !hypervisor.is_virtualized(core)));
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let hypervisor = running_hypervisor(1);
        hypervisor.running.store(false, Ordering::Release);

        assert_eq!(hypervisor.stop(), Err(HypervisorError::NotRunning));
        assert!(hypervisor.platform.events().is_empty());
    }
}
