use crate::mutex::{timestamp, DEFAULT_CS_ENTRIES};
use ambit::command::{Command, State};
use ambit::id::NodeId;
use ambit::message::{Envelope, Payload};
use ambit::node::NodeOps;
use ambit::protocol::Protocol;
use ambit::HashSet;
use color_eyre::eyre::{bail, eyre, Report};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::info;

/// Ricart-Agrawala mutual exclusion: like Lamport's algorithm but without
/// RELEASE messages. A requester collects a REPLY from every peer; peers
/// that currently hold or outrank it defer their REPLY until they leave the
/// critical section. Costs `2(n-1)` messages per entry.
#[derive(Debug)]
pub struct Ricart {
    lc: u64,
    cs_entered: u32,
    entries_target: u32,
    state: State,
    current_request_lc: u64,
    received_replies: HashSet<NodeId>,
    /// Requesters whose REPLY waits until we leave the critical section.
    deferred: Vec<NodeId>,
    ends: HashSet<NodeId>,
    rng: StdRng,
}

impl Ricart {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::with_entries(DEFAULT_CS_ENTRIES)
    }

    pub fn with_entries(entries_target: u32) -> Self {
        Self {
            lc: 0,
            cs_entered: 0,
            entries_target,
            state: State::Idle,
            current_request_lc: 0,
            received_replies: HashSet::new(),
            deferred: Vec::new(),
            ends: HashSet::new(),
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn in_cs(&self) -> bool {
        self.state == State::Cs
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn cs_entered(&self) -> u32 {
        self.cs_entered
    }

    /// The request trigger: issue a request now, or come back later if one
    /// is already in flight.
    async fn on_request_trigger<N: NodeOps>(
        &mut self,
        node: &mut N,
        message: &Envelope,
    ) -> Result<(), Report> {
        if self.state != State::Idle {
            let retry = match message.payload {
                Payload::Count { counter } => counter,
                _ => 1,
            };
            node.schedule(Duration::from_secs(retry), message.clone());
            return Ok(());
        }
        self.lc += 1;
        self.received_replies.clear();
        self.state = State::Requesting;
        self.current_request_lc = self.lc;
        node.send_to_all(Envelope::stamp(Command::Request, node.id(), self.lc))
            .await
    }

    fn access_check<N: NodeOps>(&mut self, node: &mut N) {
        if self.state != State::Requesting {
            return;
        }
        let neighbors = node.neighbors();
        if neighbors
            .iter()
            .all(|neighbor| self.received_replies.contains(neighbor))
        {
            self.enter_cs(node);
        }
    }

    fn enter_cs<N: NodeOps>(&mut self, node: &mut N) {
        self.state = State::Cs;
        self.lc += 1;
        info!("accessed the critical section");
        let occupancy = Duration::from_secs(self.rng.gen_range(1..=2));
        node.schedule(occupancy, Envelope::trigger(Command::Release));
    }

    /// Leaves the critical section: instead of a RELEASE broadcast, flush
    /// the deferred REQUESTs with REPLYs.
    async fn leave_cs<N: NodeOps>(&mut self, node: &mut N) -> Result<(), Report> {
        info!("released the critical section");
        self.state = State::Idle;
        self.cs_entered += 1;
        for from in std::mem::take(&mut self.deferred) {
            node.send_to(Envelope::stamp(Command::Reply, node.id(), self.lc), from)
                .await?;
        }
        if self.cs_entered == self.entries_target {
            node.send_to_all_uncounted(Envelope::plain(Command::End, node.id()))
                .await?;
        }
        Ok(())
    }

    /// Done once the own workload ran dry and every peer said so too; the
    /// two together guarantee nobody exits while a peer still needs
    /// replies.
    fn terminated<N: NodeOps>(&self, node: &N) -> bool {
        self.cs_entered == self.entries_target && self.ends.len() == node.neighbors().len()
    }
}

impl<N: NodeOps> Protocol<N> for Ricart {
    fn setup(&mut self, node: &mut N) -> Result<(), Report> {
        self.rng = StdRng::seed_from_u64((node.id() + 1) * 32);
        self.lc = 0;
        self.cs_entered = 0;
        self.state = State::Idle;
        self.current_request_lc = 0;
        self.received_replies.clear();
        self.deferred.clear();
        self.ends.clear();

        for i in 0..self.entries_target as u64 {
            let delay = self.rng.gen_range(4 * i + 1..=4 * i + 4);
            node.schedule(
                Duration::from_secs(delay),
                Envelope::new(
                    Command::Request,
                    None,
                    Payload::Count { counter: delay },
                ),
            );
        }
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        if message.command == Command::StartAt {
            bail!("this protocol does not support simultaneous wakeup");
        }
        match (message.command, message.sender) {
            (Command::Request, None) => {
                self.on_request_trigger(node, &message).await?;
                Ok(false)
            }
            (Command::Release, None) => {
                self.leave_cs(node).await?;
                Ok(self.terminated(node))
            }
            (Command::End, Some(from)) => {
                self.ends.insert(from);
                Ok(self.terminated(node))
            }
            (Command::Request, Some(from)) => {
                let ts = timestamp(&message)?;
                self.lc = self.lc.max(ts) + 1;
                match self.state {
                    State::Cs => {
                        self.deferred.push(from);
                    }
                    State::Requesting => {
                        // lexicographic priority on (timestamp, id)
                        if (self.current_request_lc, node.id()) < (ts, from) {
                            self.deferred.push(from);
                        } else {
                            node.send_to(
                                Envelope::stamp(Command::Reply, node.id(), self.lc),
                                from,
                            )
                            .await?;
                        }
                    }
                    State::Idle => {
                        node.send_to(Envelope::stamp(Command::Reply, node.id(), self.lc), from)
                            .await?;
                    }
                    state => bail!("unexpected command REQUEST in state {}", state),
                }
                Ok(false)
            }
            (Command::Reply, Some(from)) => {
                let ts = timestamp(&message)?;
                self.lc = self.lc.max(ts) + 1;
                self.received_replies.insert(from);
                self.access_check(node);
                Ok(false)
            }
            (command, _) => Err(eyre!("unexpected command {}", command)),
        }
    }

    async fn cleanup(&mut self, node: &mut N) -> Result<(), Report> {
        node.send_total_messages().await
    }
}
