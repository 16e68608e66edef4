//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//! The extended page-table mechanism (EPT) is a feature that can be used to support the virtualization of physical memory.
//! Guest-physical addresses are translated by traversing a set of EPT paging structures to produce physical addresses that are used to access memory.
//!
//! The hypervisor keeps one identity map of the first 512 GiB with 2MB leaves. Tables hold atomic
//! entries so that any core can rewrite a leaf through a shared reference while the others keep
//! walking the structure.
//!
//! Credits to the work by Satoshi (https://github.com/tandasat/Hello-VT-rp/blob/main/hypervisor/src/intel_vt/epts.rs) and Matthias (https://github.com/not-matthias/amd_hypervisor/blob/main/hypervisor/src/svm/nested_page_table.rs).

use {
    crate::{
        allocate::box_zeroed,
        config::EPT_SUPPORTED_PHYSICAL_WIDTH,
        error::HypervisorError,
        intel::mtrr::{CacheMap, MemoryType},
        platform::Platform,
    },
    alloc::boxed::Box,
    bitfield::bitfield,
    core::{
        ptr::addr_of,
        sync::atomic::{AtomicU64, Ordering},
    },
    log::*,
    x86::bits64::paging::{pd_index, pdpt_index, pt_index, VAddr, BASE_PAGE_SHIFT, BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Number of entries in every EPT paging structure.
pub const ENTRY_COUNT: usize = 512;

/// The EPT paging structures of the identity map.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
#[repr(C, align(4096))]
pub struct Ept {
    /// Page Map Level 4 (PML4) Table.
    pml4: Table,
    /// Page Directory Pointer Table (PDPT), one entry per GiB.
    pdpt: Table,
    /// Page directories holding the 2MB leaves.
    pd: [Table; ENTRY_COUNT],
    /// Physical address of `pml4`, resolved while building.
    pml4_pa: u64,
}

impl Ept {
    /// Allocates an empty set of tables. Every entry is not-present until [`Ept::build_identity`] runs.
    pub fn new() -> Result<Box<Self>, HypervisorError> {
        unsafe { box_zeroed::<Self>() }
    }

    /// Builds the 512 GiB identity map with 2MB leaves.
    ///
    /// Each leaf takes the memory type `cache_map` resolves for its range, except the leaf at
    /// physical address 0 which is always uncacheable since legacy MMIO lives there.
    pub fn build_identity<P: Platform + ?Sized>(&mut self, cache_map: &CacheMap, platform: &P) -> Result<(), HypervisorError> {
        trace!("Initializing EPTs");

        let pdpt_pa = platform.virtual_to_physical(addr_of!(self.pdpt) as u64);
        self.pml4.set_entry(0, Entry::table(pdpt_pa));

        for (i, pd) in self.pd.iter().enumerate() {
            let pd_pa = platform.virtual_to_physical(pd as *const Table as u64);
            self.pdpt.set_entry(i, Entry::table(pd_pa));

            for j in 0..ENTRY_COUNT {
                let pa = ((i * ENTRY_COUNT + j) * LARGE_PAGE_SIZE) as u64;
                let memory_type = match pa {
                    0 => MemoryType::Uncacheable,
                    _ => cache_map.resolve(pa..pa + LARGE_PAGE_SIZE as u64),
                };

                pd.set_entry(j, Entry::large_leaf(pa, memory_type));
            }
        }

        self.pml4_pa = platform.virtual_to_physical(addr_of!(self.pml4) as u64);
        debug!("EPT identity map built, PML4 at {:#x}", self.pml4_pa);

        Ok(())
    }

    /// Creates an Extended Page Table Pointer (EPTP) with a Write-Back memory type and a 4-level page walk.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
    pub fn eptp(&self) -> Result<u64, HypervisorError> {
        // "Number of levels minus one" in bits 5:3.
        const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
        const EPT_MEMORY_TYPE_WB: u64 = MemoryType::WriteBack as u64;

        if self.pml4_pa == 0 || self.pml4_pa.trailing_zeros() < 12 {
            return Err(HypervisorError::InvalidEptPml4BaseAddress);
        }

        Ok(self.pml4_pa | EPT_PAGE_WALK_LENGTH_4 | EPT_MEMORY_TYPE_WB)
    }

    /// Reads the PDE covering `guest_pa`.
    pub fn pde(&self, guest_pa: u64) -> Result<Entry, HypervisorError> {
        let (pdpt, pd, _) = Self::indices(guest_pa)?;
        Ok(self.pd[pdpt].entry(pd))
    }

    /// Tells whether the 2MB region containing `guest_pa` is mapped by a page table.
    pub fn is_split(&self, guest_pa: u64) -> Result<bool, HypervisorError> {
        Ok(!self.pde(guest_pa)?.large())
    }

    /// Splits the 2MB leaf containing `guest_pa` into 512 4KB entries stored in `buffer`.
    ///
    /// The new entries keep the permissions and memory type of the large page, so the translation
    /// of every address stays the same. Returns `false` without touching `buffer` if the region is
    /// already split.
    pub fn split_large_page(&self, guest_pa: u64, buffer: &SplitBuffer) -> Result<bool, HypervisorError> {
        let (pdpt, pd, _) = Self::indices(guest_pa)?;
        let pde = self.pd[pdpt].entry(pd);

        if !pde.large() {
            trace!("Page is already split: {:#x}", guest_pa);
            return Ok(false);
        }

        trace!("Splitting 2mb page into 4kb pages: {:#x}", guest_pa);
        let base = pde.pfn() << BASE_PAGE_SHIFT;

        for i in 0..ENTRY_COUNT {
            let mut pte = pde;
            pte.set_large(false);
            pte.set_accessed(false);
            pte.set_dirty(false);
            pte.set_pfn((base + (i * BASE_PAGE_SIZE) as u64) >> BASE_PAGE_SHIFT);
            buffer.table.set_entry(i, pte);
        }

        // The table must be complete before the PDE can point at it.
        self.pd[pdpt].set_entry(pd, Entry::table(buffer.physical_address));

        Ok(true)
    }

    /// Reads the 4KB entry for `guest_pa` from `pt`, the table backing its split 2MB region.
    pub fn pte(&self, guest_pa: u64, pt: &Pt) -> Result<Entry, HypervisorError> {
        let (_, _, index) = Self::indices(guest_pa)?;
        Ok(pt.entry(index))
    }

    /// Rewrites the 4KB entry for `guest_pa` in `pt`.
    pub fn set_pte(&self, guest_pa: u64, pt: &Pt, entry: Entry) -> Result<(), HypervisorError> {
        let (_, _, index) = Self::indices(guest_pa)?;
        pt.set_entry(index, entry);
        Ok(())
    }

    fn indices(guest_pa: u64) -> Result<(usize, usize, usize), HypervisorError> {
        if guest_pa >= EPT_SUPPORTED_PHYSICAL_WIDTH {
            return Err(HypervisorError::AddressOutOfRange(guest_pa));
        }

        let address = VAddr::from(guest_pa);
        Ok((pdpt_index(address), pd_index(address), pt_index(address)))
    }
}

/// A page table reserved for splitting one 2MB leaf, with its physical address resolved up front.
///
/// Root mode cannot allocate or translate addresses, so buffers are prepared by the guest-side
/// caller and handed over through the pool in [`crate::intel::shared::EptState`].
pub struct SplitBuffer {
    pub table: Box<Pt>,
    pub physical_address: u64,
}

impl SplitBuffer {
    pub fn new<P: Platform + ?Sized>(platform: &P) -> Result<Self, HypervisorError> {
        let table = unsafe { box_zeroed::<Pt>() }?;
        let physical_address = platform.virtual_to_physical(&*table as *const Pt as u64);

        Ok(Self { table, physical_address })
    }
}

/// A 4KB EPT paging structure of 512 entries.
#[repr(C, align(4096))]
pub struct Table {
    entries: [AtomicU64; ENTRY_COUNT],
}

/// Represents an EPT Page-Table Entry (PTE) that maps a 4-KByte Page.
pub type Pt = Table;

impl Table {
    pub fn entry(&self, index: usize) -> Entry {
        Entry(self.entries[index].load(Ordering::Acquire))
    }

    pub fn set_entry(&self, index: usize, entry: Entry) {
        self.entries[index].store(entry.0, Ordering::Release);
    }
}

bitfield! {
    /// Represents an Extended Page Table Entry (EPT Entry).
    ///
    /// The same layout serves table pointers and leaves; `memory_type`, `ignore_pat`, `large`
    /// and `dirty` are only meaningful in leaves.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large, set_large: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub user_executable, set_user_executable: 10;
    pub pfn, set_pfn: 51, 12;
    pub suppress_ve, set_suppress_ve: 63;
}

impl Entry {
    /// A non-leaf entry referencing the table at `pa` with full permissions.
    pub fn table(pa: u64) -> Self {
        let mut entry = Entry(0);
        entry.set_permissions(AccessType::READ_WRITE_EXECUTE);
        entry.set_pfn(pa >> BASE_PAGE_SHIFT);
        entry
    }

    /// A 2MB identity leaf.
    pub fn large_leaf(pa: u64, memory_type: MemoryType) -> Self {
        let mut entry = Self::table(pa);
        entry.set_memory_type(memory_type as u64);
        entry.set_large(true);
        entry
    }

    pub fn physical_address(&self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }

    pub fn permissions(&self) -> AccessType {
        AccessType::from_bits_truncate(self.0 as u8 & 0b111)
    }

    pub fn set_permissions(&mut self, access: AccessType) {
        self.set_readable(access.contains(AccessType::READ));
        self.set_writable(access.contains(AccessType::WRITE));
        self.set_executable(access.contains(AccessType::EXECUTE));
    }
}

bitflags::bitflags! {
    /// Represents the different access permissions for an EPT entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        /// The EPT entry allows read access.
        const READ = 0b001;
        /// The EPT entry allows write access.
        const WRITE = 0b010;
        /// The EPT entry allows execute access.
        const EXECUTE = 0b100;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}
