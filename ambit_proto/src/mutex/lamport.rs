use crate::mutex::{timestamp, DEFAULT_CS_ENTRIES};
use ambit::command::Command;
use ambit::id::NodeId;
use ambit::message::Envelope;
use ambit::node::NodeOps;
use ambit::protocol::Protocol;
use ambit::{HashMap, HashSet};
use color_eyre::eyre::{bail, eyre, Report};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tracing::info;

/// Lamport mutual exclusion: a logical clock, a min-priority queue of
/// requests ordered by `(timestamp, id)`, and per-peer histories of
/// REPLY/RELEASE timestamps. A worker enters the critical section when its
/// own request heads the queue and every peer has logged something newer.
/// Costs `3(n-1)` messages per entry.
#[derive(Debug)]
pub struct Lamport {
    lc: u64,
    cs_entered: u32,
    entries_target: u32,
    using_cs: bool,
    requests: BinaryHeap<Reverse<(u64, NodeId)>>,
    history: HashMap<NodeId, Vec<u64>>,
    ends: HashSet<NodeId>,
    rng: StdRng,
}

impl Lamport {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self::with_entries(DEFAULT_CS_ENTRIES)
    }

    pub fn with_entries(entries_target: u32) -> Self {
        Self {
            lc: 0,
            cs_entered: 0,
            entries_target,
            using_cs: false,
            requests: BinaryHeap::new(),
            history: HashMap::new(),
            ends: HashSet::new(),
            rng: StdRng::seed_from_u64(0),
        }
    }

    pub fn in_cs(&self) -> bool {
        self.using_cs
    }

    pub fn cs_entered(&self) -> u32 {
        self.cs_entered
    }

    /// Issues one request: bump the clock, queue the own entry, ask
    /// everyone.
    async fn request<N: NodeOps>(&mut self, node: &mut N) -> Result<(), Report> {
        self.lc += 1;
        self.requests.push(Reverse((self.lc, node.id())));
        node.send_to_all(Envelope::stamp(Command::Request, node.id(), self.lc))
            .await
    }

    /// Grants the critical section when the own request heads the queue and
    /// every peer has logged a timestamp newer than it.
    async fn access_check<N: NodeOps>(&mut self, node: &mut N) -> Result<(), Report> {
        if self.using_cs {
            return Ok(());
        }
        let Some(&Reverse((top_ts, top_id))) = self.requests.peek() else {
            return Ok(());
        };
        if top_id != node.id() {
            return Ok(());
        }
        for neighbor in node.neighbors() {
            let newer = self
                .history
                .get(&neighbor)
                .map(|timestamps| timestamps.iter().any(|&ts| ts > top_ts))
                .unwrap_or(false);
            if !newer {
                return Ok(());
            }
        }
        self.enter_cs(node);
        Ok(())
    }

    /// Starts the simulated occupancy; a timer posts the local release
    /// trigger when it is over.
    fn enter_cs<N: NodeOps>(&mut self, node: &mut N) {
        self.using_cs = true;
        self.lc += 1;
        info!("accessed the critical section");
        let occupancy = Duration::from_secs(self.rng.gen_range(1..=2));
        node.schedule(occupancy, Envelope::trigger(Command::Release));
    }

    /// Leaves the critical section: pop the own request, tell everyone, and
    /// after the last entry start the END wave.
    async fn release<N: NodeOps>(&mut self, node: &mut N) -> Result<(), Report> {
        info!("released the critical section");
        self.using_cs = false;
        self.cs_entered += 1;
        self.requests
            .pop()
            .ok_or_else(|| eyre!("release with an empty request queue"))?;
        node.send_to_all(Envelope::stamp(Command::Release, node.id(), self.lc))
            .await?;
        if self.cs_entered == self.entries_target {
            node.send_to_all_uncounted(Envelope::plain(Command::End, node.id()))
                .await?;
        }
        // the own next request may already be serviceable
        self.access_check(node).await
    }

    /// Done once the own workload ran dry and every peer said so too; the
    /// two together guarantee nobody exits while a peer still needs
    /// replies.
    fn terminated<N: NodeOps>(&self, node: &N) -> bool {
        self.cs_entered == self.entries_target && self.ends.len() == node.neighbors().len()
    }
}

impl<N: NodeOps> Protocol<N> for Lamport {
    fn setup(&mut self, node: &mut N) -> Result<(), Report> {
        self.rng = StdRng::seed_from_u64((node.id() + 1) * 32);
        self.lc = 0;
        self.cs_entered = 0;
        self.using_cs = false;
        self.requests.clear();
        self.history = node
            .neighbors()
            .into_iter()
            .map(|neighbor| (neighbor, Vec::new()))
            .collect();
        self.ends.clear();

        // the simulated workload: every worker spontaneously requests the
        // critical section `entries_target` times, in staggered windows
        for i in 0..self.entries_target as u64 {
            let delay = self.rng.gen_range(4 * i + 1..=4 * i + 4);
            node.schedule(
                Duration::from_secs(delay),
                Envelope::trigger(Command::Request),
            );
        }
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        if message.command == Command::StartAt {
            bail!("this protocol does not support simultaneous wakeup");
        }
        match (message.command, message.sender) {
            // local triggers posted by the requester and occupancy timers
            (Command::Request, None) => {
                self.request(node).await?;
                Ok(false)
            }
            (Command::Release, None) => {
                self.release(node).await?;
                Ok(self.terminated(node))
            }
            (Command::End, Some(from)) => {
                self.ends.insert(from);
                Ok(self.terminated(node))
            }
            (Command::Request, Some(from)) => {
                let ts = timestamp(&message)?;
                self.lc = self.lc.max(ts) + 1;
                self.requests.push(Reverse((ts, from)));
                if !self.using_cs {
                    node.send_to(Envelope::stamp(Command::Reply, node.id(), self.lc), from)
                        .await?;
                }
                Ok(false)
            }
            (Command::Release, Some(from)) => {
                let ts = timestamp(&message)?;
                self.lc = self.lc.max(ts) + 1;
                self.history.entry(from).or_default().push(ts);
                // a RELEASE means the sender's request heads the queue
                self.requests
                    .pop()
                    .ok_or_else(|| eyre!("RELEASE from {} with an empty request queue", from))?;
                self.access_check(node).await?;
                Ok(false)
            }
            (Command::Reply, Some(from)) => {
                let ts = timestamp(&message)?;
                self.lc = self.lc.max(ts) + 1;
                self.history.entry(from).or_default().push(ts);
                self.access_check(node).await?;
                Ok(false)
            }
            (command, _) => Err(eyre!("unexpected command {}", command)),
        }
    }

    async fn cleanup(&mut self, node: &mut N) -> Result<(), Report> {
        node.send_total_messages().await
    }
}
