//! The services the hosting kernel provides to the hypervisor.
//!
//! Processor enumeration, deferred procedure calls and address translation
//! belong to the OS the hypervisor is loaded into. They are reached through
//! [`Platform`] so that the root-mode core stays independent of any one kernel.

use {
    crate::{allocate::try_box, spinlock::SpinLock},
    alloc::boxed::Box,
};

/// Per-core routine signature used by deferred and broadcast calls.
pub type CoreRoutine<'a> = &'a (dyn Fn(u64) + Sync);

/// Rendezvous handed to every routine run through [`Platform::call_on_all_processors`].
pub trait CallBarrier {
    /// Waits until every core has reached this point.
    fn synchronize(&self);

    /// Signals that this core finished the routine.
    fn done(&self);
}

/// A one-shot call queued to a specific core.
///
/// The object does not own its routine or completion lock; both outlive it
/// because [`crate::broadcast::run_on_single_core`] blocks until the call has run.
pub struct DeferredCall {
    target: usize,
    routine: *const (dyn Fn(u64) + Sync),
    context: u64,
    completion: *const SpinLock,
}

unsafe impl Send for DeferredCall {}
unsafe impl Sync for DeferredCall {}

impl DeferredCall {
    /// # Safety
    ///
    /// `routine` and `completion` must stay alive until [`DeferredCall::execute`] returns.
    pub unsafe fn new(target: usize, routine: CoreRoutine<'_>, context: u64, completion: &SpinLock) -> Self {
        // Erase the routine's lifetime. The caller keeps it borrowed for the whole call.
        let routine: &'static (dyn Fn(u64) + Sync) = unsafe { core::mem::transmute(routine) };

        Self {
            target,
            routine,
            context,
            completion,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn context(&self) -> u64 {
        self.context
    }

    /// Runs the routine on the current core, then releases the completion lock.
    ///
    /// Releasing the lock is the last action; the issuing core may free this
    /// object as soon as it observes the release.
    pub fn execute(&self) {
        unsafe {
            (*self.routine)(self.context);
            (*self.completion).unlock();
        }
    }
}

/// Kernel services used by the hypervisor.
pub trait Platform: Sync {
    /// Number of active logical processors.
    fn processor_count(&self) -> usize;

    /// Index of the logical processor executing the caller.
    fn current_processor(&self) -> usize;

    /// Translates a kernel virtual address to a physical address.
    fn virtual_to_physical(&self, virtual_address: u64) -> u64;

    /// Allocates the deferred-call object. `None` signals resource exhaustion.
    fn allocate_deferred_call(&self, call: DeferredCall) -> Option<Box<DeferredCall>> {
        try_box(call).ok()
    }

    /// Queues `call` to run on `call.target()`. Must not block on its completion.
    fn queue_deferred_call(&self, call: &DeferredCall);

    fn free_deferred_call(&self, call: Box<DeferredCall>) {
        drop(call);
    }

    /// Runs `routine` on every logical processor and returns once all of them signalled
    /// [`CallBarrier::done`].
    fn call_on_all_processors(&self, routine: &(dyn Fn(&dyn CallBarrier) + Sync));

    /// Issues a hypercall from the current core.
    fn vmcall(&self, request: u64, parameter1: u64, parameter2: u64, parameter3: u64) -> u64;
}
