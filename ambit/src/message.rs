use crate::command::{Command, VisualizerOutcome};
use crate::graph::LocalDns;
use crate::id::{NodeId, SeqNumber};
use crate::time::StartAt;
use bytes::Bytes;
use color_eyre::eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything the coordinator hands a worker during setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setup {
    pub id: NodeId,
    pub edges: Vec<(NodeId, NodeId)>,
    pub local_dns: LocalDns,
    pub shell: bool,
    pub exp_path: String,
    pub visualizer_port: Option<u16>,
}

/// Payload shapes shared by the protocol families. The wire form is
/// self-describing by the variant tag, so a receiver always reconstructs
/// the exact subtype; adding a message kind means adding a variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Commands that carry nothing beyond `command` and `sender`.
    Empty,
    /// READY and SOP carry the worker's listen port.
    Port { port: u16 },
    Setup(Setup),
    StartAt(StartAt),
    /// Ring traversal and all-the-way election: a circulating token.
    Token { counter: u64, origin: NodeId },
    /// As-far-as-it-can election: a candidacy claim.
    Claim { origin: NodeId },
    /// Controlled-distance election: a claim with a hop budget. The budget
    /// is `None` on BACK/NOTIFY, which travel without one.
    Ranged { origin: NodeId, limit: Option<u64> },
    /// Mutual exclusion: a logical-clock timestamp.
    Stamp { timestamp: u64 },
    /// COUNT_M: total messages sent by the reporting worker.
    Count { counter: u64 },
    /// END_PROTOCOL and ERROR: a free-text payload.
    Text { text: String },
    /// Mirroring envelope for the visualizer; `receiver` is `None` when the
    /// mirrored send was coordinator-bound.
    Visual {
        inner: Box<Envelope>,
        receiver: Option<NodeId>,
    },
    /// End-of-visualization marker.
    VisualEnd,
    /// Visualizer outcome reported back to the coordinator.
    Status(VisualizerOutcome),
}

/// The wire envelope. `sender` is `None` for coordinator-originated traffic
/// and for locally posted trigger events; `seq_number` is only attached in
/// FIFO mode, on node-to-node sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: Command,
    pub sender: Option<NodeId>,
    pub seq_number: Option<SeqNumber>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(command: Command, sender: Option<NodeId>, payload: Payload) -> Self {
        Self {
            command,
            sender,
            seq_number: None,
            payload,
        }
    }

    /// A command with no payload.
    pub fn plain(command: Command, sender: NodeId) -> Self {
        Self::new(command, Some(sender), Payload::Empty)
    }

    pub fn ready(port: u16) -> Self {
        Self::new(Command::Ready, None, Payload::Port { port })
    }

    pub fn start_protocol(sender: NodeId, port: u16) -> Self {
        Self::new(Command::StartProtocol, Some(sender), Payload::Port { port })
    }

    pub fn setup(setup: Setup) -> Self {
        Self::new(Command::Setup, None, Payload::Setup(setup))
    }

    pub fn wakeup() -> Self {
        Self::new(Command::Wakeup, None, Payload::Empty)
    }

    pub fn start_at(at: StartAt) -> Self {
        Self::new(Command::StartAt, None, Payload::StartAt(at))
    }

    pub fn token(command: Command, sender: NodeId, counter: u64, origin: NodeId) -> Self {
        Self::new(command, Some(sender), Payload::Token { counter, origin })
    }

    pub fn claim(command: Command, sender: NodeId, origin: NodeId) -> Self {
        Self::new(command, Some(sender), Payload::Claim { origin })
    }

    pub fn ranged(command: Command, sender: NodeId, origin: NodeId, limit: Option<u64>) -> Self {
        Self::new(command, Some(sender), Payload::Ranged { origin, limit })
    }

    pub fn stamp(command: Command, sender: NodeId, timestamp: u64) -> Self {
        Self::new(command, Some(sender), Payload::Stamp { timestamp })
    }

    pub fn count(sender: NodeId, counter: u64) -> Self {
        Self::new(Command::CountM, Some(sender), Payload::Count { counter })
    }

    pub fn end_protocol(sender: NodeId) -> Self {
        Self::new(
            Command::EndProtocol,
            Some(sender),
            Payload::Text { text: String::new() },
        )
    }

    pub fn error(sender: Option<NodeId>, text: impl Into<String>) -> Self {
        Self::new(Command::Error, sender, Payload::Text { text: text.into() })
    }

    /// A local trigger event posted by a timer; `sender` is `None` so the
    /// FIFO check skips it, like coordinator traffic.
    pub fn trigger(command: Command) -> Self {
        Self::new(command, None, Payload::Empty)
    }

    /// Wraps this envelope for the visualizer stream.
    pub fn mirrored(&self, receiver: Option<NodeId>) -> Self {
        Self::new(
            self.command,
            self.sender,
            Payload::Visual {
                inner: Box::new(self.clone()),
                receiver,
            },
        )
    }

    pub fn visual_end() -> Self {
        Self::new(Command::End, None, Payload::VisualEnd)
    }

    pub fn status(outcome: VisualizerOutcome) -> Self {
        Self::new(Command::End, None, Payload::Status(outcome))
    }

    pub fn to_bytes(&self) -> Result<Bytes, Report> {
        let bytes = bincode::serialize(self).wrap_err("error serializing envelope")?;
        Ok(Bytes::from(bytes))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Report> {
        bincode::deserialize(bytes).wrap_err("error deserializing envelope")
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sender {
            Some(sender) => write!(f, "{} from {}", self.command, sender)?,
            None => write!(f, "{} from coordinator", self.command)?,
        }
        if let Some(seq) = self.seq_number {
            write!(f, " (seq {})", seq)?;
        }
        match &self.payload {
            Payload::Empty => Ok(()),
            Payload::Port { port } => write!(f, " port: {}", port),
            Payload::Setup(setup) => write!(f, " setup for {}", setup.id),
            Payload::StartAt(at) => write!(f, " {}", at),
            Payload::Token { counter, origin } => {
                write!(f, " origin: {}, counter: {}", origin, counter)
            }
            Payload::Claim { origin } => write!(f, " origin: {}", origin),
            Payload::Ranged { origin, limit } => match limit {
                Some(limit) => write!(f, " origin: {}, limit: {}", origin, limit),
                None => write!(f, " origin: {}", origin),
            },
            Payload::Stamp { timestamp } => write!(f, " timestamp: {}", timestamp),
            Payload::Count { counter } => write!(f, " counter: {}", counter),
            Payload::Text { text } if text.is_empty() => Ok(()),
            Payload::Text { text } => write!(f, " {}", text),
            Payload::Visual { inner, receiver } => match receiver {
                Some(receiver) => write!(f, " mirror of [{}] to {}", inner, receiver),
                None => write!(f, " mirror of [{}] to coordinator", inner),
            },
            Payload::VisualEnd => write!(f, " end of visualization"),
            Payload::Status(outcome) => write!(f, " status: {:?}", outcome),
        }
    }
}
