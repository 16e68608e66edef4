//! MSR and I/O interception bitmaps.
//!
//! A set bit makes the matching RDMSR/WRMSR or IN/OUT trap. Both bitmaps are owned by one core
//! and only ever changed by that core from root mode.

use bitfield::{Bit, BitMut};

/// Number of MSRs covered by each of the low and high halves.
const MSR_RANGE: u32 = 0x2000;
const HIGH_MSR_BASE: u32 = 0xC000_0000;

/// Represents the MSR Bitmap structure used in VMX.
///
/// In processors that support the 1-setting of the “use MSR bitmaps” VM-execution control,
/// the VM-execution control fields include the 64-bit physical address of four contiguous
/// MSR bitmaps, which are each 1-KByte in size.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.9 MSR-Bitmap Address
#[repr(C, align(4096))]
pub struct MsrBitmap {
    /// RDMSR of 00000000H to 00001FFFH.
    pub read_low_msrs: [u8; 0x400],
    /// RDMSR of C0000000H to C0001FFFH.
    pub read_high_msrs: [u8; 0x400],
    /// WRMSR of 00000000H to 00001FFFH.
    pub write_low_msrs: [u8; 0x400],
    /// WRMSR of C0000000H to C0001FFFH.
    pub write_high_msrs: [u8; 0x400],
}
static_assertions::const_assert_eq!(core::mem::size_of::<MsrBitmap>(), 0x1000);

impl MsrBitmap {
    /// Returns true if `msr` has a bit in the bitmap. MSRs outside both ranges always trap.
    pub fn covers(msr: u32) -> bool {
        msr < MSR_RANGE || (HIGH_MSR_BASE..HIGH_MSR_BASE + MSR_RANGE).contains(&msr)
    }

    fn section(&mut self, msr: u32, is_write: bool) -> &mut [u8; 0x400] {
        match (msr >= HIGH_MSR_BASE, is_write) {
            (true, true) => &mut self.write_high_msrs,
            (true, false) => &mut self.read_high_msrs,
            (false, true) => &mut self.write_low_msrs,
            (false, false) => &mut self.read_low_msrs,
        }
    }

    fn set(&mut self, msr: u32, is_write: bool, intercept: bool) -> bool {
        if !Self::covers(msr) {
            return false;
        }

        let msr_low = msr & 0x1FFF;
        self.section(msr, is_write)[(msr_low >> 3) as usize].set_bit((msr_low & 7) as usize, intercept);
        true
    }

    /// Masks a specific MSR for interception on read or write operations.
    ///
    /// Returns false when `msr` is outside the ranges the bitmap covers.
    ///
    /// # Example
    ///
    /// * Enable VM-exit on write operations to LSTAR
    /// `msr_bitmap.mask(IA32_LSTAR, true); // 'true' indicates a write operation`
    pub fn mask(&mut self, msr: u32, is_write: bool) -> bool {
        self.set(msr, is_write, true)
    }

    pub fn unmask(&mut self, msr: u32, is_write: bool) -> bool {
        self.set(msr, is_write, false)
    }

    /// Intercepts every read or every write.
    pub fn mask_all(&mut self, is_write: bool) {
        let (low, high) = self.direction(is_write);
        low.fill(0xff);
        high.fill(0xff);
    }

    /// Lets every read or every write through.
    pub fn reset(&mut self, is_write: bool) {
        let (low, high) = self.direction(is_write);
        low.fill(0);
        high.fill(0);
    }

    fn direction(&mut self, is_write: bool) -> (&mut [u8; 0x400], &mut [u8; 0x400]) {
        if is_write {
            (&mut self.write_low_msrs, &mut self.write_high_msrs)
        } else {
            (&mut self.read_low_msrs, &mut self.read_high_msrs)
        }
    }

    pub fn is_masked(&self, msr: u32, is_write: bool) -> bool {
        if !Self::covers(msr) {
            return true;
        }

        let section = match (msr >= HIGH_MSR_BASE, is_write) {
            (true, true) => &self.write_high_msrs,
            (true, false) => &self.read_high_msrs,
            (false, true) => &self.write_low_msrs,
            (false, false) => &self.read_low_msrs,
        };
        let msr_low = msr & 0x1FFF;

        section[(msr_low >> 3) as usize].bit((msr_low & 7) as usize)
    }
}

/// The two I/O bitmaps: A covers ports 0000H to 7FFFH, B covers 8000H to FFFFH.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.4 I/O-Bitmap Addresses
#[repr(C, align(4096))]
pub struct IoBitmap {
    pub a: [u8; 0x1000],
    pub b: [u8; 0x1000],
}
static_assertions::const_assert_eq!(core::mem::size_of::<IoBitmap>(), 0x2000);

impl IoBitmap {
    fn slot(&mut self, port: u16) -> (&mut u8, usize) {
        let index = (port & 0x7FFF) as usize;
        let bitmap = if port < 0x8000 { &mut self.a } else { &mut self.b };
        (&mut bitmap[index >> 3], index & 7)
    }

    pub fn mask(&mut self, port: u16) {
        let (byte, bit) = self.slot(port);
        byte.set_bit(bit, true);
    }

    pub fn unmask(&mut self, port: u16) {
        let (byte, bit) = self.slot(port);
        byte.set_bit(bit, false);
    }

    pub fn mask_all(&mut self) {
        self.a.fill(0xff);
        self.b.fill(0xff);
    }

    pub fn reset(&mut self) {
        self.a.fill(0);
        self.b.fill(0);
    }

    pub fn is_masked(&self, port: u16) -> bool {
        let index = (port & 0x7FFF) as usize;
        let bitmap = if port < 0x8000 { &self.a } else { &self.b };
        bitmap[index >> 3].bit(index & 7)
    }
}
