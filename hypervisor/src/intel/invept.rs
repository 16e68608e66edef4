//! INVEPT and INVVPID: dropping cached guest-physical and linear translations.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.1 Operations that Invalidate Cached Mappings

use {
    crate::intel::support::Cpu,
    core::arch::asm,
    x86::bits64::rflags::RFlags,
};

/// INVEPT invalidation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum InveptType {
    /// Invalidates mappings associated with a single EPTP.
    SingleContext = 1,
    /// Invalidates mappings associated with every EPTP.
    AllContexts = 2,
}

/// INVVPID invalidation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainingGlobals = 3,
}

#[repr(C)]
struct InveptDescriptor {
    eptp: u64,
    reserved: u64,
}

#[repr(C)]
struct InvvpidDescriptor {
    vpid: u64,
    linear_address: u64,
}

/// Executes INVEPT. Returns `false` when the instruction reported VMfail.
pub fn invept(invalidation: InveptType, eptp: u64) -> bool {
    let descriptor = InveptDescriptor { eptp, reserved: 0 };

    let flags: u64;
    unsafe {
        asm!(
            "invept {}, [{}]",
            "pushfq",
            "pop {}",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            lateout(reg) flags
        );
    }

    vm_succeeded(flags)
}

/// Executes INVVPID. Returns `false` when the instruction reported VMfail.
pub fn invvpid(invalidation: InvvpidType, vpid: u16, linear_address: u64) -> bool {
    let descriptor = InvvpidDescriptor {
        vpid: vpid as u64,
        linear_address,
    };

    let flags: u64;
    unsafe {
        asm!(
            "invvpid {}, [{}]",
            "pushfq",
            "pop {}",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            lateout(reg) flags
        );
    }

    vm_succeeded(flags)
}

fn vm_succeeded(flags: u64) -> bool {
    !RFlags::from_raw(flags).intersects(RFlags::FLAGS_CF | RFlags::FLAGS_ZF)
}

/// Invalidates the translations derived from `eptp` on the current core.
pub fn invept_single_context<C: Cpu + ?Sized>(cpu: &mut C, eptp: u64) {
    cpu.invept(InveptType::SingleContext, eptp);
}

/// Invalidates the translations derived from every EPTP on the current core.
pub fn invept_all_contexts<C: Cpu + ?Sized>(cpu: &mut C) {
    cpu.invept(InveptType::AllContexts, 0);
}

pub fn invvpid_single_context<C: Cpu + ?Sized>(cpu: &mut C, vpid: u16) {
    cpu.invvpid(InvvpidType::SingleContext, vpid, 0);
}

pub fn invvpid_all_contexts<C: Cpu + ?Sized>(cpu: &mut C) {
    cpu.invvpid(InvvpidType::AllContexts, 0, 0);
}
