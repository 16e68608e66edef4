//! Runtime configuration of a started hypervisor.
//!
//! Every method runs in the guest. It issues the matching hypercall on the selected core(s) and
//! turns the returned status into a `Result`. Settings that live in a VMCS or a bitmap are per
//! core; hooks are global because all cores share one EPT.

use {
    crate::{
        broadcast::{run_on_target, CoreTarget},
        error::{status_to_result, HypervisorError},
        intel::{ept::SplitBuffer, hooks::hook_manager::HookKind},
        platform::Platform,
        vmm::Hypervisor,
    },
    core::sync::atomic::{AtomicU64, Ordering},
    log::*,
    shared::{HypercallRequest, HypercallStatus},
};

impl<P: Platform> Hypervisor<P> {
    /// Issues `request` on the cores selected by `target`.
    ///
    /// When several cores fail, the status of the last one to report is returned. A selected core
    /// that is not virtualized reports `Unsuccessful` without issuing the hypercall.
    fn hypercall_on(
        &self,
        target: CoreTarget,
        request: HypercallRequest,
        parameter1: u64,
        parameter2: u64,
        parameter3: u64,
    ) -> Result<(), HypervisorError> {
        if !self.is_running() {
            return Err(HypervisorError::NotRunning);
        }

        let failure = AtomicU64::new(HypercallStatus::Success.to_u64());

        run_on_target(
            &self.platform,
            &self.single_core_lock,
            target,
            &|_| {
                let core = self.platform.current_processor();
                if !self.is_virtualized(core) {
                    warn!("Core {} is not virtualized, skipping {:?}", core, request);
                    failure.store(HypercallStatus::Unsuccessful.to_u64(), Ordering::SeqCst);
                    return;
                }

                let status = self.platform.vmcall(request.into(), parameter1, parameter2, parameter3);
                if status != HypercallStatus::Success.to_u64() {
                    failure.store(status, Ordering::SeqCst);
                }
            },
            0,
        )?;

        status_to_result(HypercallStatus::from_u64(failure.load(Ordering::SeqCst)))
    }

    /// Issues `request` on the current core only.
    fn hypercall(&self, request: HypercallRequest, parameter1: u64, parameter2: u64, parameter3: u64) -> Result<(), HypervisorError> {
        if !self.is_running() {
            return Err(HypervisorError::NotRunning);
        }

        let core = self.platform.current_processor();
        if !self.is_virtualized(core) {
            return Err(HypervisorError::CoreNotVirtualized(core));
        }

        let status = self.platform.vmcall(request.into(), parameter1, parameter2, parameter3);
        status_to_result(HypercallStatus::from_u64(status))
    }

    /// Intercepts RDMSR of `msr`. [`shared::ALL_MSRS`] selects every MSR.
    pub fn intercept_msr_read(&self, target: CoreTarget, msr: u64) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::ChangeMsrBitmapRead, msr, 0, 0)
    }

    /// Intercepts WRMSR of `msr`. [`shared::ALL_MSRS`] selects every MSR.
    pub fn intercept_msr_write(&self, target: CoreTarget, msr: u64) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::ChangeMsrBitmapWrite, msr, 0, 0)
    }

    pub fn reset_msr_read_interception(&self, target: CoreTarget) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::ResetMsrBitmapRead, 0, 0, 0)
    }

    pub fn reset_msr_write_interception(&self, target: CoreTarget) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::ResetMsrBitmapWrite, 0, 0, 0)
    }

    /// Intercepts IN/OUT on `port`. [`shared::ALL_IO_PORTS`] selects every port.
    pub fn intercept_io_port(&self, target: CoreTarget, port: u64) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::ChangeIoBitmap, port, 0, 0)
    }

    pub fn reset_io_interception(&self, target: CoreTarget) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::ResetIoBitmap, 0, 0, 0)
    }

    pub fn set_rdtsc_exiting(&self, target: CoreTarget, enable: bool) -> Result<(), HypervisorError> {
        let request = if enable { HypercallRequest::SetRdtscExiting } else { HypercallRequest::UnsetRdtscExiting };
        self.hypercall_on(target, request, 0, 0, 0)
    }

    pub fn set_rdpmc_exiting(&self, target: CoreTarget, enable: bool) -> Result<(), HypervisorError> {
        let request = if enable { HypercallRequest::SetRdpmcExiting } else { HypercallRequest::UnsetRdpmcExiting };
        self.hypercall_on(target, request, 0, 0, 0)
    }

    pub fn set_mov_dr_exiting(&self, target: CoreTarget, enable: bool) -> Result<(), HypervisorError> {
        let request = if enable {
            HypercallRequest::EnableMovDebugRegistersExiting
        } else {
            HypercallRequest::DisableMovDebugRegistersExiting
        };
        self.hypercall_on(target, request, 0, 0, 0)
    }

    pub fn set_mov_to_cr3_exiting(&self, target: CoreTarget, enable: bool) -> Result<(), HypervisorError> {
        let request = if enable { HypercallRequest::EnableMovToCr3Exiting } else { HypercallRequest::DisableMovToCr3Exiting };
        self.hypercall_on(target, request, 0, 0, 0)
    }

    /// Makes the bits of `mask` in CR0 or CR4 (`register` 0 or 4) host owned, or hands them back
    /// to the guest.
    pub fn set_mov_to_control_register_exiting(
        &self,
        target: CoreTarget,
        register: u64,
        mask: u64,
        enable: bool,
    ) -> Result<(), HypervisorError> {
        let request = if enable {
            HypercallRequest::EnableMovToControlRegistersExiting
        } else {
            HypercallRequest::DisableMovToControlRegistersExiting
        };
        self.hypercall_on(target, request, register, mask, 0)
    }

    pub fn set_external_interrupt_exiting(&self, target: CoreTarget, enable: bool) -> Result<(), HypervisorError> {
        let request = if enable {
            HypercallRequest::EnableExternalInterruptExiting
        } else {
            HypercallRequest::DisableExternalInterruptExiting
        };
        self.hypercall_on(target, request, 0, 0, 0)
    }

    pub fn set_nmi_exiting(&self, target: CoreTarget, enable: bool) -> Result<(), HypervisorError> {
        let request = if enable { HypercallRequest::SetVmExitOnNmis } else { HypercallRequest::UnsetVmExitOnNmis };
        self.hypercall_on(target, request, 0, 0, 0)
    }

    /// Intercepts exception `vector`. [`shared::ALL_EXCEPTIONS`] selects every vector.
    pub fn set_exception_interception(&self, target: CoreTarget, vector: u64) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::SetExceptionBitmap, vector, 0, 0)
    }

    pub fn unset_exception_interception(&self, target: CoreTarget, vector: u64) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::UnsetExceptionBitmap, vector, 0, 0)
    }

    pub fn reset_exception_interception(&self, target: CoreTarget) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::ResetExceptionBitmap, 0, 0, 0)
    }

    /// Hooks the 4KB page of `guest_pa`, optionally only for the address space `process` (a CR3).
    ///
    /// A page table for splitting is handed to root mode up front, since root mode cannot
    /// allocate. The new mapping is live on every core once this returns.
    pub fn install_hook(&self, guest_pa: u64, kind: HookKind, process: Option<u64>) -> Result<(), HypervisorError> {
        let operand = kind.to_operand()?;

        // Splits are never undone, so a region seen split here stays split. Any other install
        // brings its own buffer; one left over waits in the pool for a later split.
        if !matches!(self.ept_state.ept().is_split(guest_pa), Ok(true)) {
            self.ept_state.provide_split_buffer(SplitBuffer::new(&self.platform)?);
        }

        self.hypercall(HypercallRequest::ChangePageAttribute, guest_pa, operand, process.unwrap_or(0))?;
        debug!("Hooked {:#x} as {:?}", guest_pa, kind);

        self.hypercall_on(CoreTarget::All, HypercallRequest::InveptAllContexts, 0, 0, 0)
    }

    /// Removes the hook on the page of `guest_pa`. The original mapping is live on every core once
    /// this returns.
    pub fn remove_hook(&self, guest_pa: u64) -> Result<(), HypervisorError> {
        self.hypercall(HypercallRequest::UnhookSinglePage, guest_pa, 0, 0)?;
        debug!("Unhooked {:#x}", guest_pa);

        self.hypercall_on(CoreTarget::All, HypercallRequest::InveptAllContexts, 0, 0, 0)
    }

    /// Flushes the translations derived from the shared EPT on the selected cores.
    pub fn invalidate_ept(&self, target: CoreTarget) -> Result<(), HypervisorError> {
        self.hypercall_on(target, HypercallRequest::InveptSingleContext, self.ept_state.eptp(), 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use {
        crate::{
            broadcast::CoreTarget,
            error::HypervisorError,
            intel::{
                ept::SplitBuffer,
                hooks::hook_manager::HookKind,
                shared::EptState,
                vm::VmxState,
            },
            testing::PlatformEvent,
            vmm::tests::running_hypervisor,
        },
        alloc::vec,
        core::sync::atomic::Ordering,
        shared::{HypercallRequest, HypercallStatus, PageHookKind, ALL_MSRS},
        std::sync::{Arc, Barrier},
    };

    #[test]
    fn single_core_request_reaches_only_that_core() {
        let hypervisor = running_hypervisor(4);

        hypervisor.intercept_msr_write(CoreTarget::Single(2), 0xc000_0082).unwrap();

        assert_eq!(
            hypervisor.platform().vmcalls(),
            vec![(2, u64::from(HypercallRequest::ChangeMsrBitmapWrite), 0xc000_0082, 0, 0)]
        );
        assert_eq!(hypervisor.platform().events()[0], PlatformEvent::DeferredCall { core: 2 });
    }

    #[test]
    fn global_request_reaches_every_core() {
        let hypervisor = running_hypervisor(3);

        hypervisor.intercept_msr_read(CoreTarget::All, ALL_MSRS).unwrap();

        let mut cores: Vec<usize> = hypervisor.platform().vmcalls().iter().map(|call| call.0).collect();
        cores.sort();
        assert_eq!(cores, vec![0, 1, 2]);
        assert!(hypervisor
            .platform()
            .vmcalls()
            .iter()
            .all(|call| call.1 == u64::from(HypercallRequest::ChangeMsrBitmapRead) && call.2 == ALL_MSRS));
    }

    #[test]
    fn out_of_range_core_is_invalid() {
        let hypervisor = running_hypervisor(2);

        assert_eq!(hypervisor.set_rdtsc_exiting(CoreTarget::Single(2), true), Err(HypervisorError::InvalidCoreIndex(2)));
        assert!(hypervisor.platform().vmcalls().is_empty());
    }

    #[test]
    fn failed_status_becomes_an_error() {
        let hypervisor = running_hypervisor(2);
        hypervisor
            .platform()
            .set_vmcall_handler(|core, _, _, _, _| if core == 1 { HypercallStatus::InvalidParameter.to_u64() } else { 0 });

        assert_eq!(
            hypervisor.set_exception_interception(CoreTarget::All, 40),
            Err(HypervisorError::HypercallFailed(HypercallStatus::InvalidParameter))
        );
        assert_eq!(hypervisor.set_exception_interception(CoreTarget::Single(0), 14), Ok(()));
    }

    #[test]
    fn toggles_map_to_request_pairs() {
        let hypervisor = running_hypervisor(1);
        let core = CoreTarget::Single(0);

        hypervisor.set_rdpmc_exiting(core, true).unwrap();
        hypervisor.set_rdpmc_exiting(core, false).unwrap();
        hypervisor.set_nmi_exiting(core, true).unwrap();
        hypervisor.set_external_interrupt_exiting(core, false).unwrap();
        hypervisor.set_mov_to_control_register_exiting(core, 4, 1 << 20, true).unwrap();

        let requests: Vec<(u64, u64, u64)> = hypervisor
            .platform()
            .vmcalls()
            .iter()
            .map(|call| (call.1, call.2, call.3))
            .collect();
        assert_eq!(
            requests,
            vec![
                (HypercallRequest::SetRdpmcExiting.into(), 0, 0),
                (HypercallRequest::UnsetRdpmcExiting.into(), 0, 0),
                (HypercallRequest::SetVmExitOnNmis.into(), 0, 0),
                (HypercallRequest::DisableExternalInterruptExiting.into(), 0, 0),
                (HypercallRequest::EnableMovToControlRegistersExiting.into(), 4, 1 << 20),
            ]
        );
    }

    #[test]
    fn hook_install_provides_a_buffer_and_flushes_every_core() {
        let hypervisor = running_hypervisor(2);

        hypervisor.install_hook(0x20_3000, HookKind::ReadTrap, Some(0x1ad000)).unwrap();

        assert_eq!(hypervisor.ept_state().split_pool_len(), 1);

        let calls = hypervisor.platform().vmcalls();
        assert_eq!(
            calls[0],
            (
                0,
                u64::from(HypercallRequest::ChangePageAttribute),
                0x20_3000,
                PageHookKind::ReadTrap as u64,
                0x1ad000
            )
        );
        assert_eq!(calls.len(), 3);
        assert!(calls[1..]
            .iter()
            .all(|call| call.1 == u64::from(HypercallRequest::InveptAllContexts)));

        // Root mode splits the region.
        hypervisor.ept_state().install_hook(0x20_3000, HookKind::ReadTrap, None).unwrap();
        assert_eq!(hypervisor.ept_state().split_pool_len(), 0);

        // Pages in a split region need no buffer, pages elsewhere bring one each.
        hypervisor.install_hook(0x20_5000, HookKind::WriteTrap, None).unwrap();
        assert_eq!(hypervisor.ept_state().split_pool_len(), 0);
        hypervisor.install_hook(0x40_0000, HookKind::WriteTrap, None).unwrap();
        assert_eq!(hypervisor.ept_state().split_pool_len(), 1);
    }

    #[test]
    fn concurrent_installs_into_different_regions_both_split() {
        let hypervisor = running_hypervisor(2);
        hypervisor
            .ept_state()
            .provide_split_buffer(SplitBuffer::new(hypervisor.platform()).unwrap());

        // Both callers are past their buffer check before either reaches root mode.
        let state = hypervisor.ept_state() as *const EptState as usize;
        let barrier = Arc::new(Barrier::new(2));
        let change_page = u64::from(HypercallRequest::ChangePageAttribute);
        hypervisor.platform().set_vmcall_handler(move |_, request, guest_pa, operand, process| {
            if request != change_page {
                return HypercallStatus::Success.to_u64();
            }
            barrier.wait();
            let state = unsafe { &*(state as *const EptState) };
            let result = HookKind::from_operand(operand)
                .and_then(|kind| state.install_hook(guest_pa, kind, if process == 0 { None } else { Some(process) }));
            match result {
                Ok(()) => HypercallStatus::Success.to_u64(),
                Err(error) => HypercallStatus::from(error).to_u64(),
            }
        });

        let (first, second) = std::thread::scope(|scope| {
            let first = scope.spawn(|| hypervisor.install_hook(0x20_3000, HookKind::ReadTrap, None));
            let second = scope.spawn(|| hypervisor.install_hook(0x40_5000, HookKind::WriteTrap, None));
            (first.join().unwrap(), second.join().unwrap())
        });

        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(hypervisor.ept_state().hook_count(), 2);
        assert_eq!(hypervisor.ept_state().split_pool_len(), 1);
    }

    #[test]
    fn cores_outside_vmx_get_no_hypercall() {
        let hypervisor = running_hypervisor(2);
        unsafe { hypervisor.cores[0].get() }.state = VmxState::Off;

        assert_eq!(
            hypervisor.set_rdtsc_exiting(CoreTarget::Single(0), true),
            Err(HypervisorError::HypercallFailed(HypercallStatus::Unsuccessful))
        );
        assert_eq!(hypervisor.remove_hook(0x20_3000), Err(HypervisorError::CoreNotVirtualized(0)));
        assert!(hypervisor.platform().vmcalls().is_empty());
    }

    #[test]
    fn invalidation_uses_the_shared_eptp() {
        let hypervisor = running_hypervisor(2);

        hypervisor.invalidate_ept(CoreTarget::Single(1)).unwrap();

        assert_eq!(
            hypervisor.platform().vmcalls(),
            vec![(1, u64::from(HypercallRequest::InveptSingleContext), hypervisor.ept_state().eptp(), 0, 0)]
        );
    }

    #[test]
    fn failed_unhook_skips_the_flush() {
        let hypervisor = running_hypervisor(2);
        hypervisor
            .platform()
            .set_vmcall_handler(|_, _, _, _, _| HypercallStatus::NotFound.to_u64());

        assert_eq!(
            hypervisor.remove_hook(0x20_3000),
            Err(HypervisorError::HypercallFailed(HypercallStatus::NotFound))
        );
        assert_eq!(hypervisor.platform().vmcalls().len(), 1);
    }

    #[test]
    fn requests_need_a_running_hypervisor() {
        let hypervisor = running_hypervisor(1);
        hypervisor.running.store(false, Ordering::Release);

        assert_eq!(hypervisor.reset_io_interception(CoreTarget::All), Err(HypervisorError::NotRunning));
        assert_eq!(hypervisor.remove_hook(0x1000), Err(HypervisorError::NotRunning));
    }
}
