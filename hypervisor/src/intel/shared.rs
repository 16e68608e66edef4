//! State shared by every core: the EPT identity map, its hooks and the split-buffer pool.
//!
//! All cores run on the same EPT, so a hook installed by one core is live for all of them once
//! each core has flushed its cached translations.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::{Ept, Entry, SplitBuffer},
            hooks::hook_manager::{HookKind, HookManager, HookRecord},
            mtrr::CacheMap,
            support::Cpu,
        },
        platform::Platform,
        spinlock::SpinMutex,
    },
    alloc::{boxed::Box, vec::Vec},
    log::*,
};

pub struct EptState {
    ept: Box<Ept>,
    eptp: u64,
    cache_map: CacheMap,
    hooks: SpinMutex<HookManager>,
    /// Page tables handed over by guest-side callers for root-mode splits.
    ///
    /// Guest code takes this lock, and a VM exit can arrive while it holds it. Root mode therefore
    /// never takes it while holding `hooks`.
    split_pool: SpinMutex<Vec<SplitBuffer>>,
}

impl EptState {
    /// Builds the identity map for `cache_map`.
    pub fn new<P: Platform + ?Sized>(cache_map: CacheMap, platform: &P) -> Result<Self, HypervisorError> {
        trace!("Initializing shared EPT state");

        let mut ept = Ept::new()?;
        ept.build_identity(&cache_map, platform)?;
        let eptp = ept.eptp()?;

        Ok(Self {
            ept,
            eptp,
            cache_map,
            hooks: SpinMutex::new(HookManager::new()),
            split_pool: SpinMutex::new(Vec::new()),
        })
    }

    pub fn eptp(&self) -> u64 {
        self.eptp
    }

    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    pub fn cache_map(&self) -> &CacheMap {
        &self.cache_map
    }

    /// Adds a page table root mode may consume for the next split.
    pub fn provide_split_buffer(&self, buffer: SplitBuffer) {
        self.split_pool.lock().push(buffer);
    }

    pub fn split_pool_len(&self) -> usize {
        self.split_pool.lock().len()
    }

    /// Hooks the page of `guest_pa`, splitting its 2MB region with a pooled buffer if needed.
    pub fn install_hook(&self, guest_pa: u64, kind: HookKind, process: Option<u64>) -> Result<(), HypervisorError> {
        let mut candidate = self.split_pool.lock().pop();

        let result = self
            .hooks
            .lock()
            .install_hook(&self.ept, guest_pa, kind, process, || candidate.take());

        if let Some(buffer) = candidate {
            self.split_pool.lock().push(buffer);
        }

        result
    }

    pub fn remove_hook<C: Cpu + ?Sized>(&self, cpu: &mut C, guest_pa: u64) -> Result<HookRecord, HypervisorError> {
        self.hooks.lock().remove_hook(&self.ept, cpu, self.eptp, guest_pa)
    }

    pub fn remove_all_hooks<C: Cpu + ?Sized>(&self, cpu: &mut C) -> usize {
        self.hooks.lock().remove_all_hooks(&self.ept, cpu, self.eptp)
    }

    /// Lifts the hook covering `guest_pa`, if any. Returns the hooked page.
    pub fn handle_ept_violation(&self, guest_pa: u64, process: u64) -> Option<u64> {
        self.hooks.lock().handle_ept_violation(&self.ept, guest_pa, process)
    }

    pub fn restore_after_mtf(&self, page: u64) -> Result<(), HypervisorError> {
        self.hooks.lock().restore_after_mtf(&self.ept, page)
    }

    pub fn hook(&self, guest_pa: u64) -> Option<HookRecord> {
        self.hooks.lock().hook(guest_pa).cloned()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().len()
    }

    /// The entry currently translating `guest_pa`: the 4KB entry if its region is split, the 2MB
    /// leaf otherwise.
    pub fn live_entry(&self, guest_pa: u64) -> Result<Entry, HypervisorError> {
        if !self.ept.is_split(guest_pa)? {
            return self.ept.pde(guest_pa);
        }

        let hooks = self.hooks.lock();
        let pt = hooks
            .split_table(guest_pa)
            .ok_or(HypervisorError::PageTableNotFound(guest_pa))?;

        self.ept.pte(guest_pa, pt)
    }
}
