//! Memory Type Range Registers: the cacheability of physical memory as programmed by firmware.
//!
//! The EPT identity map has to reproduce these memory types, otherwise guest accesses to
//! MMIO would become cacheable through the EPT memory type.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 12.11 MEMORY TYPE RANGE REGISTERS (MTRRS)

use {
    crate::intel::support::Cpu,
    alloc::vec::Vec,
    bit_field::BitField,
    core::ops::Range,
    log::*,
};

const IA32_MTRRCAP: u32 = 0xFE;
const IA32_MTRR_DEF_TYPE: u32 = 0x2FF;
const IA32_MTRR_PHYSBASE0: u32 = 0x200;
const IA32_MTRR_PHYSMASK0: u32 = 0x201;
const IA32_MTRR_FIX64K_00000: u32 = 0x250;
const IA32_MTRR_FIX16K_80000: u32 = 0x258;
const IA32_MTRR_FIX4K_C0000: u32 = 0x268;

/// Memory types as encoded in MTRRs and EPT entries.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 12-8. Memory Types That Can Be Encoded in MTRRs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    /// Reserved encodings fall back to uncacheable.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MemoryType::WriteCombining,
            4 => MemoryType::WriteThrough,
            5 => MemoryType::WriteProtected,
            6 => MemoryType::WriteBack,
            _ => MemoryType::Uncacheable,
        }
    }
}

/// One physical range and its memory type. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRange {
    pub start: u64,
    pub end: u64,
    pub memory_type: MemoryType,
    /// Fixed-range MTRRs take priority over variable ranges.
    pub fixed: bool,
}

impl CacheRange {
    pub fn new(start: u64, end: u64, memory_type: MemoryType) -> Self {
        Self {
            start,
            end,
            memory_type,
            fixed: false,
        }
    }

    fn overlaps(&self, range: &Range<u64>) -> bool {
        self.start < range.end && range.start < self.end
    }
}

/// The immutable list of cache ranges consulted while building the identity map.
#[derive(Debug, Clone)]
pub struct CacheMap {
    ranges: Vec<CacheRange>,
    default_type: MemoryType,
}

impl CacheMap {
    /// Creates a map over `ranges` whose unclaimed memory is write-back.
    pub fn new(ranges: Vec<CacheRange>) -> Self {
        Self::with_default(ranges, MemoryType::WriteBack)
    }

    pub fn with_default(ranges: Vec<CacheRange>, default_type: MemoryType) -> Self {
        Self { ranges, default_type }
    }

    pub fn ranges(&self) -> &[CacheRange] {
        &self.ranges
    }

    pub fn default_type(&self) -> MemoryType {
        self.default_type
    }

    /// Resolves the memory type for `range` following the MTRR precedence rules.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 12.11.4.1 MTRR Precedences
    pub fn resolve(&self, range: Range<u64>) -> MemoryType {
        let matching = self.ranges.iter().filter(|r| r.overlaps(&range));

        // UC wins over every other overlapping range, fixed or not.
        if matching.clone().any(|r| r.memory_type == MemoryType::Uncacheable) {
            return MemoryType::Uncacheable;
        }

        if let Some(fixed) = matching.clone().find(|r| r.fixed) {
            return fixed.memory_type;
        }

        let mut resolved: Option<MemoryType> = None;
        for current in matching {
            resolved = match (resolved, current.memory_type) {
                (Some(MemoryType::WriteThrough), MemoryType::WriteBack)
                | (Some(MemoryType::WriteBack), MemoryType::WriteThrough) => Some(MemoryType::WriteThrough),
                (_, memory_type) => Some(memory_type),
            };
        }

        resolved.unwrap_or(self.default_type)
    }
}

/// Reader for the MTRR MSRs.
pub struct Mtrr;

impl Mtrr {
    /// Builds the cache map from the MTRRs of the current processor.
    ///
    /// MTRRs are synchronized across processors by firmware, so reading them once is enough.
    pub fn read<C: Cpu + ?Sized>(cpu: &C) -> CacheMap {
        let capabilities = cpu.rdmsr(IA32_MTRRCAP);
        let def_type = cpu.rdmsr(IA32_MTRR_DEF_TYPE);

        // With MTRRs disabled all of physical memory is UC.
        if !def_type.get_bit(11) {
            warn!("MTRRs are disabled, mapping all memory uncacheable");
            return CacheMap::with_default(Vec::new(), MemoryType::Uncacheable);
        }

        let default_type = MemoryType::from_u8(def_type.get_bits(0..8) as u8);
        let mut ranges = Vec::new();

        if capabilities.get_bit(8) && def_type.get_bit(10) {
            Self::read_fixed_ranges(cpu, &mut ranges);
        }

        let variable_count = capabilities.get_bits(0..8) as u32;
        for index in 0..variable_count {
            let base = cpu.rdmsr(IA32_MTRR_PHYSBASE0 + index * 2);
            let mask = cpu.rdmsr(IA32_MTRR_PHYSMASK0 + index * 2);

            if !mask.get_bit(11) {
                continue;
            }

            let start = base & 0x000f_ffff_ffff_f000;
            let mask_pfn = mask & 0x000f_ffff_ffff_f000;
            if mask_pfn == 0 {
                continue;
            }

            // The lowest set bit of the mask gives the size of the range.
            let length = 1u64 << mask_pfn.trailing_zeros();
            let memory_type = MemoryType::from_u8(base.get_bits(0..8) as u8);

            debug!("MTRR range: {:#x}..{:#x} {:?}", start, start + length, memory_type);
            ranges.push(CacheRange::new(start, start + length, memory_type));
        }

        debug!("{} MTRR ranges committed, default {:?}", ranges.len(), default_type);

        CacheMap::with_default(ranges, default_type)
    }

    fn read_fixed_ranges<C: Cpu + ?Sized>(cpu: &C, ranges: &mut Vec<CacheRange>) {
        let mut push_bank = |msr: u32, base: u64, size: u64| {
            let types = cpu.rdmsr(msr);
            for slot in 0..8u64 {
                let start = base + slot * size;
                ranges.push(CacheRange {
                    start,
                    end: start + size,
                    memory_type: MemoryType::from_u8((types >> (slot * 8)) as u8),
                    fixed: true,
                });
            }
        };

        push_bank(IA32_MTRR_FIX64K_00000, 0x0, 0x10000);

        for bank in 0..2u32 {
            push_bank(IA32_MTRR_FIX16K_80000 + bank, 0x80000 + bank as u64 * 0x20000, 0x4000);
        }

        for bank in 0..8u32 {
            push_bank(IA32_MTRR_FIX4K_C0000 + bank, 0xC0000 + bank as u64 * 0x8000, 0x1000);
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testing::SimulatedCpu, alloc::vec};

    #[test]
    fn uncacheable_wins_over_every_other_range() {
        let map = CacheMap::new(vec![
            CacheRange::new(0x0, 0x200000, MemoryType::WriteBack),
            CacheRange::new(0x0, 0x1000, MemoryType::Uncacheable),
        ]);

        assert_eq!(map.resolve(0x0..0x200000), MemoryType::Uncacheable);
        assert_eq!(map.resolve(0x200000..0x400000), MemoryType::WriteBack);
    }

    #[test]
    fn write_through_beats_write_back() {
        let map = CacheMap::new(vec![
            CacheRange::new(0x0, 0x400000, MemoryType::WriteThrough),
            CacheRange::new(0x0, 0x400000, MemoryType::WriteBack),
        ]);

        assert_eq!(map.resolve(0x0..0x200000), MemoryType::WriteThrough);
    }

    #[test]
    fn unmatched_memory_uses_the_default() {
        let map = CacheMap::with_default(vec![], MemoryType::WriteProtected);
        assert_eq!(map.resolve(0x1000..0x2000), MemoryType::WriteProtected);
    }

    #[test]
    fn variable_ranges_are_decoded_from_base_and_mask() {
        let mut cpu = SimulatedCpu::new();
        cpu.set_msr(IA32_MTRRCAP, 2);
        cpu.set_msr(IA32_MTRR_DEF_TYPE, (1 << 11) | MemoryType::WriteBack as u64);
        // 0xC000_0000 + 1GB, UC.
        cpu.set_msr(IA32_MTRR_PHYSBASE0, 0xC000_0000 | MemoryType::Uncacheable as u64);
        cpu.set_msr(IA32_MTRR_PHYSMASK0, 0xf_c000_0000 | (1 << 11));
        // Disabled pair.
        cpu.set_msr(IA32_MTRR_PHYSBASE0 + 2, MemoryType::WriteThrough as u64);
        cpu.set_msr(IA32_MTRR_PHYSMASK0 + 2, 0xf_ffe0_0000);

        let map = Mtrr::read(&cpu);

        assert_eq!(map.ranges(), &[CacheRange::new(0xC000_0000, 0x1_0000_0000, MemoryType::Uncacheable)]);
        assert_eq!(map.resolve(0xC000_0000..0xC020_0000), MemoryType::Uncacheable);
        assert_eq!(map.resolve(0x0020_0000..0x0040_0000), MemoryType::WriteBack);
    }

    #[test]
    fn fixed_ranges_cover_the_first_megabyte() {
        let mut cpu = SimulatedCpu::new();
        cpu.set_msr(IA32_MTRRCAP, 1 << 8);
        cpu.set_msr(IA32_MTRR_DEF_TYPE, (1 << 11) | (1 << 10) | MemoryType::WriteBack as u64);
        cpu.set_msr(IA32_MTRR_FIX64K_00000, 0x0606_0606_0606_0606);

        let map = Mtrr::read(&cpu);

        assert_eq!(map.ranges().len(), 88);
        assert!(map.ranges().iter().all(|r| r.fixed));
        assert_eq!(map.ranges().last().map(|r| r.end), Some(0x100000));
        assert_eq!(map.resolve(0x10000..0x20000), MemoryType::WriteBack);
    }

    #[test]
    fn disabled_mtrrs_make_everything_uncacheable() {
        let cpu = SimulatedCpu::new();
        let map = Mtrr::read(&cpu);
        assert_eq!(map.resolve(0x200000..0x400000), MemoryType::Uncacheable);
    }
}
