//! Intel VT-x: VMX operation, the VMCS, EPT and VM-exit handling.

pub mod bitmap;
pub mod capture;
pub mod controls;
pub mod ept;
pub mod events;
pub mod hooks;
pub mod invept;
pub mod mtrr;
pub mod segmentation;
pub mod shared;
pub mod support;
pub mod vm;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
pub mod vmlaunch;
pub mod vmxon;
