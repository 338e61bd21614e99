use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of commands exchanged between coordinator, workers and
/// visualizer. The `Display` impl renders the short wire names that show up
/// in the per-worker logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Ready,
    Setup,
    StartProtocol,
    Wakeup,
    StartAt,
    Inform,
    Election,
    Notify,
    Forth,
    Back,
    Forward,
    Return,
    BackEdge,
    Q,
    Yes,
    No,
    Term,
    End,
    Sat,
    Request,
    Reply,
    Release,
    CountM,
    EndProtocol,
    Error,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Ready => "RDY",
            Command::Setup => "SETUP",
            Command::StartProtocol => "SOP",
            Command::Wakeup => "WAKEUP",
            Command::StartAt => "START_AT",
            Command::Inform => "I",
            Command::Election => "ELECTION",
            Command::Notify => "NOTIFY",
            Command::Forth => "FORTH",
            Command::Back => "BACK",
            Command::Forward => "FWD",
            Command::Return => "RETURN",
            Command::BackEdge => "BACK_EDGE",
            Command::Q => "Q",
            Command::Yes => "YES",
            Command::No => "NO",
            Command::Term => "TERM",
            Command::End => "END",
            Command::Sat => "SAT",
            Command::Request => "REQUEST",
            Command::Reply => "REPLY",
            Command::Release => "RELEASE",
            Command::CountM => "COUNT_M",
            Command::EndProtocol => "EOP",
            Command::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Closed set of local protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Asleep,
    Awake,
    Candidate,
    Defeated,
    Leader,
    Follower,
    Done,
    Processing,
    Saturated,
    Idle,
    Active,
    Visited,
    Requesting,
    Cs,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Asleep => "ASLEEP",
            State::Awake => "AWAKE",
            State::Candidate => "CANDIDATE",
            State::Defeated => "DEFEATED",
            State::Leader => "LEADER",
            State::Follower => "FOLLOWER",
            State::Done => "DONE",
            State::Processing => "PROCESSING",
            State::Saturated => "SATURATED",
            State::Idle => "IDLE",
            State::Active => "ACTIVE",
            State::Visited => "VISITED",
            State::Requesting => "REQUESTING",
            State::Cs => "CS",
        };
        write!(f, "{}", name)
    }
}

/// Outcome reported by the visualizer process to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisualizerOutcome {
    Success,
    InternalError,
    ExternalError,
    Continue,
}
