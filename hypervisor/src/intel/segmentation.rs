//! Segment descriptors and the processor state a core is virtualized with.
//!
//! The guest starts as an exact copy of the core that launched it, so every segment register,
//! descriptor table and control register is captured here and copied into the VMCS.
//! Credits to Satoshi Tanda: https://github.com/tandasat/Hello-VT-rp/blob/main/hypervisor/src/intel_vt/vm.rs

use {
    crate::intel::support::Cpu,
    bit_field::BitField,
    x86::{
        dtables::{sgdt, sidt, DescriptorTablePointer},
        msr,
        segmentation::SegmentSelector,
    },
};

/// Access rights value marking a segment register as unusable in the VMCS.
pub const SEGMENT_UNUSABLE: u32 = 1 << 16;

/// Converts native segment access rights, as returned by LAR, to VMX format.
pub fn access_rights_from_native(access_rights: u32) -> u32 {
    if access_rights == 0 {
        return SEGMENT_UNUSABLE;
    }

    (access_rights >> 8) & 0b1111_0000_1111_1111
}

/// A segment register as the VMCS describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub selector: u16,
    pub base_address: u64,
    pub segment_limit: u32,
    pub access_rights: u32,
}

impl SegmentDescriptor {
    pub const UNUSABLE: Self = Self {
        selector: 0,
        base_address: 0,
        segment_limit: 0,
        access_rights: SEGMENT_UNUSABLE,
    };

    /// Decodes the descriptor `selector` refers to in `gdt`.
    ///
    /// The null selector, LDT selectors and selectors outside the table give an unusable segment.
    /// System descriptors (TSS, LDT) are 16 bytes in IA-32e mode and take the upper half of the base
    /// from the following entry.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
    pub fn from_selector(selector: SegmentSelector, gdt: &[u64]) -> Self {
        let raw = selector.bits();
        let index = (raw >> 3) as usize;

        if index == 0 || raw.get_bit(2) || index >= gdt.len() {
            return Self {
                selector: raw,
                ..Self::UNUSABLE
            };
        }

        let descriptor = gdt[index];
        if !descriptor.get_bit(47) {
            return Self {
                selector: raw,
                ..Self::UNUSABLE
            };
        }

        let mut base_address = descriptor.get_bits(16..40) | descriptor.get_bits(56..64) << 24;
        let system = !descriptor.get_bit(44);
        if system {
            if let Some(upper) = gdt.get(index + 1) {
                base_address |= upper.get_bits(0..32) << 32;
            }
        }

        let mut segment_limit = (descriptor.get_bits(0..16) | descriptor.get_bits(48..52) << 16) as u32;
        if descriptor.get_bit(55) {
            segment_limit = segment_limit << 12 | 0xfff;
        }

        let access_rights = (descriptor >> 40) as u32 & 0b1111_0000_1111_1111;

        Self {
            selector: raw,
            base_address,
            segment_limit,
            access_rights,
        }
    }
}

/// Everything VMCS guest and host state is built from.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorState {
    pub es: SegmentDescriptor,
    pub cs: SegmentDescriptor,
    pub ss: SegmentDescriptor,
    pub ds: SegmentDescriptor,
    pub fs: SegmentDescriptor,
    pub gs: SegmentDescriptor,
    pub ldtr: SegmentDescriptor,
    pub tr: SegmentDescriptor,
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub debugctl: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub fs_base: u64,
    pub gs_base: u64,
}

impl ProcessorState {
    /// Captures the segment, descriptor table and control register state of the current core.
    ///
    /// # Safety
    ///
    /// GDTR must describe a readable table, which holds for any running kernel.
    pub unsafe fn capture<C: Cpu + ?Sized>(cpu: &C) -> Self {
        let mut gdtr = DescriptorTablePointer::<u64>::default();
        let mut idtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut gdtr);
        sidt(&mut idtr);

        let gdt = core::slice::from_raw_parts(gdtr.base, (gdtr.limit as usize + 1) / 8);
        let segment = |selector: SegmentSelector| SegmentDescriptor::from_selector(selector, gdt);

        let mut fs = segment(x86::segmentation::fs());
        let mut gs = segment(x86::segmentation::gs());
        let fs_base = cpu.rdmsr(msr::IA32_FS_BASE);
        let gs_base = cpu.rdmsr(msr::IA32_GS_BASE);
        fs.base_address = fs_base;
        gs.base_address = gs_base;

        Self {
            es: segment(x86::segmentation::es()),
            cs: segment(x86::segmentation::cs()),
            ss: segment(x86::segmentation::ss()),
            ds: segment(x86::segmentation::ds()),
            fs,
            gs,
            ldtr: segment(x86::dtables::ldtr()),
            tr: segment(x86::task::tr()),
            gdtr_base: gdtr.base as u64,
            gdtr_limit: gdtr.limit,
            idtr_base: idtr.base as u64,
            idtr_limit: idtr.limit,
            cr0: cpu.cr0(),
            cr3: cpu.cr3(),
            cr4: cpu.cr4(),
            dr7: cpu.dr(7),
            debugctl: cpu.rdmsr(msr::IA32_DEBUGCTL),
            sysenter_cs: cpu.rdmsr(msr::IA32_SYSENTER_CS),
            sysenter_esp: cpu.rdmsr(msr::IA32_SYSENTER_ESP),
            sysenter_eip: cpu.rdmsr(msr::IA32_SYSENTER_EIP),
            fs_base,
            gs_base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Flat 64-bit kernel code, flat data, and a TSS at 0xffff_f800_1234_5000 with limit 0x67.
    const GDT: [u64; 5] = [
        0,
        0x0020_9b00_0000_0000,
        0x00cf_9300_0000_ffff,
        0x0000_8b34_5000_0067 | 0x12 << 56,
        0x0000_0000_ffff_f800,
    ];

    #[test]
    fn code_segment_access_rights() {
        let cs = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x08), &GDT);
        assert_eq!(cs.access_rights, 0x209b);
        assert_eq!(cs.base_address, 0);
    }

    #[test]
    fn granular_limit_is_scaled() {
        let ds = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x10), &GDT);
        assert_eq!(ds.segment_limit, 0xffff_ffff);
        assert_eq!(ds.access_rights, 0xc093);
    }

    #[test]
    fn system_descriptor_takes_upper_base() {
        let tr = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x18), &GDT);
        assert_eq!(tr.base_address, 0xffff_f800_1234_5000);
        assert_eq!(tr.segment_limit, 0x67);
        assert_eq!(tr.access_rights, 0x8b);
    }

    #[test]
    fn null_and_out_of_range_selectors_are_unusable() {
        let null = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0), &GDT);
        let outside = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x50), &GDT);

        assert_eq!(null.access_rights, SEGMENT_UNUSABLE);
        assert_eq!(outside.access_rights, SEGMENT_UNUSABLE);
        assert_eq!(access_rights_from_native(0), SEGMENT_UNUSABLE);
    }
}
