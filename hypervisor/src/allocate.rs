//! Fallible zero-initialized allocations for hardware structures.
//!
//! Every allocation here happens outside VMX root operation, before a core is
//! virtualized or from a guest-side request path. Root mode never allocates.

use {
    crate::error::HypervisorError,
    alloc::{
        alloc::{alloc_zeroed, Layout},
        boxed::Box,
        vec::Vec,
    },
};

/// Allocates a zero-filled `T`, honouring its alignment.
///
/// Hardware regions such as the VMXON region, the VMCS and EPT tables are
/// declared `#[repr(C, align(4096))]`, so the returned box is always page
/// aligned without over-allocating.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value of `T`.
pub unsafe fn box_zeroed<T>() -> Result<Box<T>, HypervisorError> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Err(HypervisorError::MemoryAllocationFailed);
    }

    let ptr = unsafe { alloc_zeroed(layout) }.cast::<T>();
    if ptr.is_null() {
        return Err(HypervisorError::MemoryAllocationFailed);
    }

    Ok(unsafe { Box::from_raw(ptr) })
}

/// Moves `value` into a freshly allocated box, reporting exhaustion instead of aborting.
pub fn try_box<T>(value: T) -> Result<Box<T>, HypervisorError> {
    let mut slot: Vec<T> = Vec::new();
    slot.try_reserve_exact(1)
        .map_err(|_| HypervisorError::MemoryAllocationFailed)?;
    slot.push(value);

    let raw = Box::into_raw(slot.into_boxed_slice()).cast::<T>();
    Ok(unsafe { Box::from_raw(raw) })
}

/// Allocates a zero-filled stack of `size` bytes.
pub fn allocate_stack(size: usize) -> Result<Box<[u8]>, HypervisorError> {
    let mut stack: Vec<u8> = Vec::new();
    stack
        .try_reserve_exact(size)
        .map_err(|_| HypervisorError::MemoryAllocationFailed)?;
    stack.resize(size, 0);
    Ok(stack.into_boxed_slice())
}
