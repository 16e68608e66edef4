//! This crate provides the root-mode core of a thin VT-x hypervisor.
//!
//! It virtualizes every core of a running kernel in place, maps guest-physical memory one to one
//! through EPT and exposes page hooks and interception controls to the guest through hypercalls.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod allocate;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod error;
pub mod intel;
pub mod logger;
pub mod platform;
pub mod spinlock;
pub mod vmm;

#[cfg(test)]
pub(crate) mod testing;
