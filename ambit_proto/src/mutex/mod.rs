// This module contains the two mutual-exclusion algorithms. Both assume a
// complete graph and per-sender FIFO channels; both simulate a workload
// where every worker enters the critical section a configured number of
// times and terminates after an END from every peer.
//
// Requesters and the critical-section occupancy are timer events posted
// into the own inbound queue (with no sender, so the FIFO check skips
// them): protocol state is only ever touched by the dispatch loop.

// This module contains Lamport's algorithm.
mod lamport;

// This module contains the Ricart-Agrawala optimization.
mod ricart;

// Re-exports.
pub use lamport::Lamport;
pub use ricart::Ricart;

use ambit::message::{Envelope, Payload};
use color_eyre::eyre::{eyre, Report};

/// Critical-section entries per worker in the simulated workload.
pub const DEFAULT_CS_ENTRIES: u32 = 2;

pub(crate) fn timestamp(message: &Envelope) -> Result<u64, Report> {
    match message.payload {
        Payload::Stamp { timestamp } => Ok(timestamp),
        _ => Err(eyre!("{} should carry a timestamp", message.command)),
    }
}
