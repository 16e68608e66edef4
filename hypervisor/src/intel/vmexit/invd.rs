use crate::intel::{support::Cpu, vmexit::ExitType};

/// Handles the INVD VM exit (basic exit reason 13).
///
/// INVD would discard dirty lines that the hypervisor's own structures may live in, so the caches
/// are written back before being invalidated.
pub fn handle_invd<C: Cpu + ?Sized>(cpu: &mut C) -> ExitType {
    cpu.wbinvd();
    ExitType::IncrementRIP
}
