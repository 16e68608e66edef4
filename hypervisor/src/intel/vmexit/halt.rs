//! Handles the VM exit caused by the `HLT` instruction.

use {crate::intel::vmexit::ExitType, log::trace};

/// Handles the VM exit caused by a `HLT` instruction.
///
/// The guest is resumed after the `HLT` instead of halting the core; the next interrupt would
/// have woken it at the same place.
pub fn handle_halt() -> ExitType {
    trace!("Handling HLT VM exit...");
    ExitType::IncrementRIP
}
