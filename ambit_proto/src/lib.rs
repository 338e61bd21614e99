// This crate contains the protocol suite that runs on the `ambit` runtime:
// seven classical distributed algorithms plus the in-process simulation
// harness their tests are driven with.

// This module contains the flooding broadcast.
pub mod flooding;

// This module contains the ring-size count.
pub mod count;

// This module contains the three ring leader elections.
pub mod election;

// This module contains the depth-first-traversal spanning tree.
pub mod dft;

// This module contains the shout spanning tree.
pub mod shout;

// This module contains the bully leader election.
pub mod bully;

// This module contains the two mutual-exclusion algorithms.
pub mod mutex;

// This module contains the deterministic in-process simulation harness.
pub mod sim;

use ambit::id::NodeId;
use ambit::message::{Envelope, Payload};
use color_eyre::eyre::{bail, eyre, Report};
use std::fmt;
use std::str::FromStr;

/// The sender of a message that must have one.
pub(crate) fn sender(message: &Envelope) -> Result<NodeId, Report> {
    message
        .sender
        .ok_or_else(|| eyre!("{} should have a sender", message.command))
}

/// The counter/origin pair of a circulating token.
pub(crate) fn token(message: &Envelope) -> Result<(u64, NodeId), Report> {
    match message.payload {
        Payload::Token { counter, origin } => Ok((counter, origin)),
        _ => Err(eyre!("{} should carry a token payload", message.command)),
    }
}

/// The protocols a worker can be asked to run. The kind also decides the
/// topology requirements and whether FIFO mode must be on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Flooding,
    Count,
    AllTheWay,
    AsFar,
    ControlledDistance,
    Dft,
    Shout,
    Bully,
    Lamport,
    Ricart,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 10] = [
        ProtocolKind::Flooding,
        ProtocolKind::Count,
        ProtocolKind::AllTheWay,
        ProtocolKind::AsFar,
        ProtocolKind::ControlledDistance,
        ProtocolKind::Dft,
        ProtocolKind::Shout,
        ProtocolKind::Bully,
        ProtocolKind::Lamport,
        ProtocolKind::Ricart,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Flooding => "flooding",
            ProtocolKind::Count => "count",
            ProtocolKind::AllTheWay => "all-the-way",
            ProtocolKind::AsFar => "as-far",
            ProtocolKind::ControlledDistance => "controlled-distance",
            ProtocolKind::Dft => "dft",
            ProtocolKind::Shout => "shout",
            ProtocolKind::Bully => "bully",
            ProtocolKind::Lamport => "lamport",
            ProtocolKind::Ricart => "ricart",
        }
    }

    /// The mutual-exclusion algorithms assume per-sender FIFO channels.
    pub fn fifo_required(&self) -> bool {
        matches!(self, ProtocolKind::Lamport | ProtocolKind::Ricart)
    }

    /// Ring protocols run on a `RingNode` and reject other topologies at
    /// setup.
    pub fn ring(&self) -> bool {
        matches!(
            self,
            ProtocolKind::Count
                | ProtocolKind::AllTheWay
                | ProtocolKind::AsFar
                | ProtocolKind::ControlledDistance
        )
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for kind in Self::ALL {
            if kind.name() == s {
                return Ok(kind);
            }
        }
        bail!(
            "unknown protocol {:?}; expected one of: {}",
            s,
            Self::ALL.map(|kind| kind.name()).join(", ")
        )
    }
}
