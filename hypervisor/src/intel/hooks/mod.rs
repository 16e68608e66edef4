//! EPT page hooks.

pub mod hook_manager;
