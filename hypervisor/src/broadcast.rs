//! Fans work out to other cores and waits for it to finish.
//!
//! Both primitives block the caller with no timeout. A core that never runs the
//! queued routine stalls the caller forever.

use {
    crate::{
        error::HypervisorError,
        platform::{CoreRoutine, DeferredCall, Platform},
        spinlock::SpinLock,
    },
    log::*,
};

/// Selects which cores a configuration request is applied on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreTarget {
    All,
    Single(usize),
}

/// Runs `routine(context)` on `core` and returns once it has completed there.
///
/// `lock` is the dedicated single-core lock. It is taken here and released by
/// the deferred call itself as its last action, so acquiring it again tells the
/// caller the routine finished.
pub fn run_on_single_core<P: Platform + ?Sized>(
    platform: &P,
    lock: &SpinLock,
    core: usize,
    routine: CoreRoutine<'_>,
    context: u64,
) -> Result<(), HypervisorError> {
    if core >= platform.processor_count() {
        warn!("Core {} is out of range", core);
        return Err(HypervisorError::InvalidCoreIndex(core));
    }

    let call = unsafe { DeferredCall::new(core, routine, context, lock) };
    let call = platform
        .allocate_deferred_call(call)
        .ok_or(HypervisorError::MemoryAllocationFailed)?;

    if !lock.try_lock() {
        platform.free_deferred_call(call);
        return Err(HypervisorError::SingleCoreLockBusy);
    }

    platform.queue_deferred_call(&call);

    // Spin until the target core released the lock.
    lock.lock();
    lock.unlock();

    platform.free_deferred_call(call);

    Ok(())
}

/// Runs `routine(context)` on every core and returns once all of them are done.
pub fn broadcast_to_all_cores<P: Platform + ?Sized>(platform: &P, routine: CoreRoutine<'_>, context: u64) {
    platform.call_on_all_processors(&|barrier| {
        routine(context);

        barrier.synchronize();
        barrier.done();
    });
}

/// Runs `routine` on the cores selected by `target`.
pub fn run_on_target<P: Platform + ?Sized>(
    platform: &P,
    lock: &SpinLock,
    target: CoreTarget,
    routine: CoreRoutine<'_>,
    context: u64,
) -> Result<(), HypervisorError> {
    match target {
        CoreTarget::All => {
            broadcast_to_all_cores(platform, routine, context);
            Ok(())
        }
        CoreTarget::Single(core) => run_on_single_core(platform, lock, core, routine, context),
    }
}
