//! Registry of hooked guest-physical pages.
//!
//! A hook replaces the 4KB EPT entry of a page with a restricted "shadow" entry. The guest
//! access the restriction catches is let through by swapping the original entry back in for one
//! instruction, after which the monitor trap flag brings control back here to re-arm the hook.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::{AccessType, Ept, Entry, Pt, SplitBuffer},
            invept::invept_single_context,
            support::Cpu,
        },
    },
    alloc::collections::BTreeMap,
    log::*,
    shared::{decode_hook_operand, encode_hook_operand, PageHookKind},
    x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// What a hook intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Execution traps. With a shadow page, the page executes from `shadow_page` instead and
    /// reads or writes trap so they still see the real contents.
    ExecuteRedirect { shadow_page: Option<u64> },
    /// Reads trap. Writes trap too, since write-without-read is an EPT misconfiguration.
    ReadTrap,
    WriteTrap,
    ReadWriteTrap,
}

impl HookKind {
    /// Derives the restricted entry installed while the hook is armed.
    pub fn shadow_entry(&self, original: Entry) -> Entry {
        let mut shadow = original;

        match *self {
            HookKind::ExecuteRedirect { shadow_page: None } => shadow.set_executable(false),
            HookKind::ExecuteRedirect {
                shadow_page: Some(page),
            } => {
                shadow.set_permissions(AccessType::EXECUTE);
                shadow.set_pfn(page >> BASE_PAGE_SHIFT);
            }
            HookKind::ReadTrap | HookKind::ReadWriteTrap => {
                shadow.set_readable(false);
                shadow.set_writable(false);
            }
            HookKind::WriteTrap => shadow.set_writable(false),
        }

        shadow
    }

    /// Decodes the hypercall operand built by [`HookKind::to_operand`].
    pub fn from_operand(operand: u64) -> Result<Self, HypervisorError> {
        let (kind, shadow_page) = decode_hook_operand(operand).map_err(HypervisorError::InvalidHookKind)?;

        Ok(match kind {
            PageHookKind::ExecuteRedirect => HookKind::ExecuteRedirect { shadow_page },
            PageHookKind::ReadTrap => HookKind::ReadTrap,
            PageHookKind::WriteTrap => HookKind::WriteTrap,
            PageHookKind::ReadWriteTrap => HookKind::ReadWriteTrap,
        })
    }

    pub fn to_operand(&self) -> Result<u64, HypervisorError> {
        let (kind, shadow_page) = match *self {
            HookKind::ExecuteRedirect { shadow_page } => (PageHookKind::ExecuteRedirect, shadow_page),
            HookKind::ReadTrap => (PageHookKind::ReadTrap, None),
            HookKind::WriteTrap => (PageHookKind::WriteTrap, None),
            HookKind::ReadWriteTrap => (PageHookKind::ReadWriteTrap, None),
        };

        encode_hook_operand(kind, shadow_page).ok_or(HypervisorError::InvalidHypercallOperand(shadow_page.unwrap_or(0)))
    }
}

/// A hooked page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRecord {
    /// Page-aligned guest-physical address, the registry key.
    pub page: u64,
    pub original_entry: Entry,
    pub shadow_entry: Entry,
    /// Base of the split 2MB region whose page table holds the live entry.
    pub large_page: u64,
    pub kind: HookKind,
    /// CR3 of the process the hook is scoped to. `None` hooks every address space.
    pub process: Option<u64>,
    /// Number of serviced violations from the scoped process.
    pub hits: u64,
}

/// The hook registry and the page tables created by splitting.
///
/// Callers serialize access with [`crate::spinlock::SpinMutex`]. Every method that changes a
/// live entry does so while that lock is held.
#[derive(Default)]
pub struct HookManager {
    hooks: BTreeMap<u64, HookRecord>,
    split_tables: BTreeMap<u64, SplitBuffer>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn hook(&self, guest_pa: u64) -> Option<&HookRecord> {
        self.hooks.get(&page_base(guest_pa))
    }

    pub fn split_table_count(&self) -> usize {
        self.split_tables.len()
    }

    /// The page table created when the 2MB region containing `guest_pa` was split.
    pub fn split_table(&self, guest_pa: u64) -> Option<&Pt> {
        self.split_tables.get(&large_page_base(guest_pa)).map(|buffer| &*buffer.table)
    }

    /// Hooks the page containing `guest_pa`.
    ///
    /// `take_buffer` is only called when the 2MB region still needs splitting, so a buffer offered
    /// for an already split region stays with the caller. Nothing is modified when an error is
    /// returned.
    pub fn install_hook(
        &mut self,
        ept: &Ept,
        guest_pa: u64,
        kind: HookKind,
        process: Option<u64>,
        take_buffer: impl FnOnce() -> Option<SplitBuffer>,
    ) -> Result<(), HypervisorError> {
        let page = page_base(guest_pa);
        let large_page = large_page_base(guest_pa);

        // Range check before anything else.
        let split = ept.is_split(page)?;

        if self.hooks.contains_key(&page) {
            warn!("Page {:#x} is already hooked", page);
            return Err(HypervisorError::HookAlreadyExists(page));
        }

        if !split {
            let buffer = take_buffer().ok_or(HypervisorError::SplitBufferUnavailable)?;
            ept.split_large_page(page, &buffer)?;
            self.split_tables.insert(large_page, buffer);
        }

        let pt = &self
            .split_tables
            .get(&large_page)
            .ok_or(HypervisorError::PageTableNotFound(large_page))?
            .table;

        let original_entry = ept.pte(page, pt)?;
        let shadow_entry = kind.shadow_entry(original_entry);
        ept.set_pte(page, pt, shadow_entry)?;

        debug!("Hooked page {:#x} as {:?}", page, kind);

        self.hooks.insert(
            page,
            HookRecord {
                page,
                original_entry,
                shadow_entry,
                large_page,
                kind,
                process,
                hits: 0,
            },
        );

        Ok(())
    }

    /// Swaps the original entry in for the page of `guest_pa` so the faulting access can complete.
    ///
    /// Returns the hooked page, or `None` when no hook covers the address. `process` is the CR3
    /// of the faulting context and only affects the hit counter.
    pub fn handle_ept_violation(&mut self, ept: &Ept, guest_pa: u64, process: u64) -> Option<u64> {
        let page = page_base(guest_pa);
        let record = self.hooks.get_mut(&page)?;
        let pt = &self.split_tables.get(&record.large_page)?.table;

        if record.process.map_or(true, |cr3| cr3 & !0xfff == process & !0xfff) {
            record.hits += 1;
        }

        ept.set_pte(page, pt, record.original_entry).ok()?;
        trace!("Hook on {:#x} lifted for one instruction", page);

        Some(page)
    }

    /// Re-installs the shadow entry after the single step completed.
    pub fn restore_after_mtf(&mut self, ept: &Ept, page: u64) -> Result<(), HypervisorError> {
        let page = page_base(page);
        let record = self.hooks.get(&page).ok_or(HypervisorError::HookNotFound(page))?;
        let pt = &self
            .split_tables
            .get(&record.large_page)
            .ok_or(HypervisorError::PageTableNotFound(record.large_page))?
            .table;

        ept.set_pte(page, pt, record.shadow_entry)
    }

    /// Restores the original entry, flushes the EPT context, then forgets the hook.
    ///
    /// The split table stays in place; it maps the region exactly like the large page did.
    pub fn remove_hook<C: Cpu + ?Sized>(&mut self, ept: &Ept, cpu: &mut C, eptp: u64, guest_pa: u64) -> Result<HookRecord, HypervisorError> {
        let page = page_base(guest_pa);
        let record = self.hooks.get(&page).ok_or(HypervisorError::HookNotFound(page))?;
        let pt = &self
            .split_tables
            .get(&record.large_page)
            .ok_or(HypervisorError::PageTableNotFound(record.large_page))?
            .table;

        ept.set_pte(page, pt, record.original_entry)?;
        invept_single_context(cpu, eptp);

        debug!("Unhooked page {:#x}", page);

        self.hooks.remove(&page).ok_or(HypervisorError::HookNotFound(page))
    }

    /// Removes every hook. Returns how many were removed.
    pub fn remove_all_hooks<C: Cpu + ?Sized>(&mut self, ept: &Ept, cpu: &mut C, eptp: u64) -> usize {
        let pages = self.hooks.keys().copied().collect::<alloc::vec::Vec<_>>();

        pages
            .into_iter()
            .filter(|&page| match self.remove_hook(ept, cpu, eptp, page) {
                Ok(_) => true,
                Err(error) => {
                    error!("Failed to unhook {:#x}: {}", page, error);
                    false
                }
            })
            .count()
    }
}

fn page_base(guest_pa: u64) -> u64 {
    guest_pa & !(BASE_PAGE_SIZE as u64 - 1)
}

fn large_page_base(guest_pa: u64) -> u64 {
    guest_pa & !(LARGE_PAGE_SIZE as u64 - 1)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{intel::mtrr::CacheMap, testing::SimulatedCpu, testing::SimulatedPlatform},
        alloc::{boxed::Box, vec},
    };

    fn ept() -> Box<Ept> {
        let mut ept = Ept::new().unwrap();
        ept.build_identity(&CacheMap::new(vec![]), &SimulatedPlatform::new(1)).unwrap();
        ept
    }

    fn buffer() -> Option<SplitBuffer> {
        SplitBuffer::new(&SimulatedPlatform::new(1)).ok()
    }

    #[test]
    fn shadow_entries_per_kind() {
        let original = Entry::large_leaf(0x20_0000, crate::intel::mtrr::MemoryType::WriteBack);

        let execute = HookKind::ExecuteRedirect { shadow_page: None }.shadow_entry(original);
        assert_eq!(execute.permissions(), AccessType::READ_WRITE);

        let redirect = HookKind::ExecuteRedirect {
            shadow_page: Some(0x9000),
        }
        .shadow_entry(original);
        assert_eq!(redirect.permissions(), AccessType::EXECUTE);
        assert_eq!(redirect.physical_address(), 0x9000);

        assert_eq!(HookKind::ReadTrap.shadow_entry(original).permissions(), AccessType::EXECUTE);
        assert_eq!(HookKind::WriteTrap.shadow_entry(original).permissions(), AccessType::READ_EXECUTE);
        assert_eq!(HookKind::ReadWriteTrap.shadow_entry(original).permissions(), AccessType::EXECUTE);
    }

    #[test]
    fn operand_encoding_survives_the_hypercall() {
        let kind = HookKind::ExecuteRedirect {
            shadow_page: Some(0x7000),
        };
        assert_eq!(HookKind::from_operand(kind.to_operand().unwrap()), Ok(kind));
        assert_eq!(HookKind::from_operand(0x7), Err(HypervisorError::InvalidHookKind(0x7)));
    }

    #[test]
    fn unhook_restores_the_original_entry() {
        let ept = ept();
        let mut cpu = SimulatedCpu::new();
        let mut manager = HookManager::new();

        manager.install_hook(&ept, 0x30_4123, HookKind::WriteTrap, None, buffer).unwrap();
        let record = manager.hook(0x30_4000).cloned().unwrap();
        let pt = &manager.split_tables[&0x20_0000].table;
        assert_eq!(ept.pte(0x30_4000, pt).unwrap(), record.shadow_entry);

        let removed = manager.remove_hook(&ept, &mut cpu, 0x1e, 0x30_4000).unwrap();
        let pt = &manager.split_tables[&0x20_0000].table;

        assert_eq!(removed, record);
        assert_eq!(ept.pte(0x30_4000, pt).unwrap(), record.original_entry);
        assert!(manager.is_empty());
        assert_eq!(cpu.invept_log.len(), 1);
    }

    #[test]
    fn duplicate_hooks_are_rejected() {
        let ept = ept();
        let mut manager = HookManager::new();

        manager.install_hook(&ept, 0x5000, HookKind::ReadTrap, None, buffer).unwrap();
        let record = manager.hook(0x5000).cloned().unwrap();

        assert_eq!(
            manager.install_hook(&ept, 0x5abc, HookKind::WriteTrap, None, buffer),
            Err(HypervisorError::HookAlreadyExists(0x5000))
        );
        assert_eq!(manager.hook(0x5000), Some(&record));
    }

    #[test]
    fn second_hook_in_a_region_reuses_the_split() {
        let ept = ept();
        let mut manager = HookManager::new();

        manager.install_hook(&ept, 0x40_1000, HookKind::ReadTrap, None, buffer).unwrap();
        manager
            .install_hook(&ept, 0x40_2000, HookKind::ReadTrap, None, || panic!("region is already split"))
            .unwrap();

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.split_table_count(), 1);
    }

    #[test]
    fn failures_leave_the_tables_untouched() {
        let ept = ept();
        let mut manager = HookManager::new();
        let pde = ept.pde(0x60_0000).unwrap();

        assert_eq!(
            manager.install_hook(&ept, 0x60_0000, HookKind::ReadTrap, None, || None),
            Err(HypervisorError::SplitBufferUnavailable)
        );
        assert_eq!(ept.pde(0x60_0000).unwrap(), pde);

        let beyond = crate::config::EPT_SUPPORTED_PHYSICAL_WIDTH;
        assert_eq!(
            manager.install_hook(&ept, beyond, HookKind::ReadTrap, None, buffer),
            Err(HypervisorError::AddressOutOfRange(beyond))
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn removing_an_unknown_hook_fails() {
        let ept = ept();
        let mut cpu = SimulatedCpu::new();
        let mut manager = HookManager::new();

        assert_eq!(
            manager.remove_hook(&ept, &mut cpu, 0x1e, 0x8000).map(|_| ()),
            Err(HypervisorError::HookNotFound(0x8000))
        );
        assert!(cpu.invept_log.is_empty());
    }

    #[test]
    fn violation_and_restore_toggle_the_live_entry() {
        let ept = ept();
        let mut manager = HookManager::new();
        manager.install_hook(&ept, 0x1000, HookKind::ExecuteRedirect { shadow_page: None }, Some(0xabc000), buffer).unwrap();
        let record = manager.hook(0x1000).cloned().unwrap();

        assert_eq!(manager.handle_ept_violation(&ept, 0x1010, 0xabc000), Some(0x1000));
        assert_eq!(ept.pte(0x1000, &manager.split_tables[&0].table).unwrap(), record.original_entry);
        assert_eq!(manager.hook(0x1000).map(|r| r.hits), Some(1));

        // Another address space lifts the hook too but is not counted.
        assert_eq!(manager.handle_ept_violation(&ept, 0x1010, 0xdef000), Some(0x1000));
        assert_eq!(manager.hook(0x1000).map(|r| r.hits), Some(1));

        manager.restore_after_mtf(&ept, 0x1000).unwrap();
        assert_eq!(ept.pte(0x1000, &manager.split_tables[&0].table).unwrap(), record.shadow_entry);

        assert_eq!(manager.handle_ept_violation(&ept, 0x2000, 0), None);
    }

    #[test]
    fn remove_all_clears_the_registry() {
        let ept = ept();
        let mut cpu = SimulatedCpu::new();
        let mut manager = HookManager::new();

        for pa in [0x1000, 0x2000, 0x20_0000] {
            manager.install_hook(&ept, pa, HookKind::ReadWriteTrap, None, buffer).unwrap();
        }

        assert_eq!(manager.remove_all_hooks(&ept, &mut cpu, 0x1e), 3);
        assert!(manager.is_empty());
        assert_eq!(cpu.invept_log.len(), 3);
    }
}
