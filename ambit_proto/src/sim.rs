// Deterministic in-process harness used by the protocol tests: virtual
// nodes record their sends instead of hitting sockets, a virtual clock
// orders timer events, and channels deliver in FIFO order. Terminated nodes
// drop late traffic, like the real runtime loses datagrams to an exited
// process.

use ambit::id::NodeId;
use ambit::message::Envelope;
use ambit::node::{NodeOps, RingOps};
use ambit::protocol::Protocol;
use ambit::time::StartAt;
use color_eyre::eyre::{bail, eyre, Report};
use std::collections::VecDeque;
use std::time::Duration;

/// A virtual worker: same primitives as the real node, no sockets.
#[derive(Debug)]
pub struct SimNode {
    id: NodeId,
    neighbors: Vec<NodeId>,
    total_messages: u64,
    /// Node-to-node sends recorded since the last drain.
    outgoing: Vec<(NodeId, Envelope)>,
    /// Coordinator-bound sends, kept for the tests to assert on.
    to_coordinator: Vec<Envelope>,
    /// Local self-posts recorded since the last drain.
    posted: Vec<Envelope>,
    /// Timers armed since the last drain.
    armed: Vec<(Duration, Envelope)>,
}

impl SimNode {
    pub fn new(id: NodeId, neighbors: Vec<NodeId>) -> Self {
        Self {
            id,
            neighbors,
            total_messages: 0,
            outgoing: Vec::new(),
            to_coordinator: Vec::new(),
            posted: Vec::new(),
            armed: Vec::new(),
        }
    }

    fn record(&mut self, target: NodeId, message: Envelope, counted: bool) -> Result<(), Report> {
        if !self.neighbors.contains(&target) {
            bail!("node {} is not a neighbor of {}", target, self.id);
        }
        self.outgoing.push((target, message));
        if counted {
            self.total_messages += 1;
        }
        Ok(())
    }

    /// Messages sent to the coordinator, in order.
    pub fn coordinator_messages(&self) -> impl Iterator<Item = &Envelope> {
        self.to_coordinator.iter()
    }
}

impl NodeOps for SimNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors.clone()
    }

    async fn send_random(&mut self, message: Envelope) -> Result<(), Report> {
        let first = *self
            .neighbors
            .first()
            .ok_or_else(|| eyre!("node {} has no neighbors", self.id))?;
        self.record(first, message, true)
    }

    async fn send_to(&mut self, message: Envelope, target: NodeId) -> Result<(), Report> {
        self.record(target, message, true)
    }

    async fn send_back(&mut self, message: Envelope) -> Result<(), Report> {
        self.to_coordinator.push(message);
        Ok(())
    }

    async fn send_to_all(&mut self, message: Envelope) -> Result<(), Report> {
        for target in self.neighbors.clone() {
            self.record(target, message.clone(), true)?;
        }
        Ok(())
    }

    async fn send_to_all_uncounted(&mut self, message: Envelope) -> Result<(), Report> {
        for target in self.neighbors.clone() {
            self.record(target, message.clone(), false)?;
        }
        Ok(())
    }

    async fn send_to_all_except(&mut self, message: Envelope, exclude: NodeId) -> Result<(), Report> {
        for target in self.neighbors.clone() {
            if target == exclude {
                continue;
            }
            self.record(target, message.clone(), true)?;
        }
        Ok(())
    }

    async fn send_to_missing(&mut self, message: Envelope, excludes: &[NodeId]) -> Result<(), Report> {
        if excludes.len() + 1 != self.neighbors.len() {
            bail!(
                "send_to_missing expects {} excluded neighbors, got {}",
                self.neighbors.len().saturating_sub(1),
                excludes.len()
            );
        }
        for target in self.neighbors.clone() {
            if excludes.contains(&target) {
                continue;
            }
            self.record(target, message.clone(), true)?;
        }
        Ok(())
    }

    fn send_to_me(&mut self, message: Envelope) -> Result<(), Report> {
        self.posted.push(message);
        Ok(())
    }

    fn schedule(&mut self, delay: Duration, message: Envelope) {
        self.armed.push((delay, message));
    }

    async fn pause_until(&self, _at: StartAt) -> Result<(), Report> {
        // virtual time, nothing to wait for
        Ok(())
    }

    fn total_messages(&self) -> u64 {
        self.total_messages
    }

    async fn send_total_messages(&mut self) -> Result<(), Report> {
        let message = Envelope::count(self.id, self.total_messages);
        self.send_back(message).await
    }
}

impl RingOps for SimNode {
    async fn send_to_other(&mut self, message: Envelope, sender: NodeId) -> Result<(), Report> {
        let target = *self
            .neighbors
            .iter()
            .find(|&&neighbor| neighbor != sender)
            .ok_or_else(|| eyre!("no neighbor other than {}", sender))?;
        self.record(target, message, true)
    }
}

/// One registered worker.
pub struct SimEntry<P> {
    pub node: SimNode,
    pub protocol: P,
    pub done: bool,
}

/// The simulation: registered workers, a queue of in-flight messages and a
/// virtual clock ordering the armed timers.
pub struct Simulation<P> {
    entries: Vec<SimEntry<P>>,
    in_flight: VecDeque<(NodeId, Envelope)>,
    timers: Vec<(Duration, NodeId, Envelope)>,
    clock: Duration,
}

impl<P> Simulation<P>
where
    P: Protocol<SimNode>,
{
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            in_flight: VecDeque::new(),
            timers: Vec::new(),
            clock: Duration::ZERO,
        }
    }

    /// Registers a worker and runs the protocol's setup, collecting
    /// whatever it sends or arms.
    pub fn register(
        &mut self,
        id: NodeId,
        neighbors: Vec<NodeId>,
        mut protocol: P,
    ) -> Result<(), Report> {
        assert!(self.entry(id).is_none(), "node {} registered twice", id);
        let mut node = SimNode::new(id, neighbors);
        protocol.setup(&mut node)?;
        let mut entry = SimEntry {
            node,
            protocol,
            done: false,
        };
        Self::collect_into(&mut entry, &mut self.in_flight, &mut self.timers, self.clock);
        self.entries.push(entry);
        Ok(())
    }

    /// Registers every node of a ring, in cycle order, with per-node
    /// neighbors `[previous, next]`.
    pub fn register_ring(
        &mut self,
        order: &[NodeId],
        mut make: impl FnMut() -> P,
    ) -> Result<(), Report> {
        let n = order.len();
        for (i, &id) in order.iter().enumerate() {
            let previous = order[(i + n - 1) % n];
            let next = order[(i + 1) % n];
            self.register(id, vec![previous, next], make())?;
        }
        Ok(())
    }

    pub fn wakeup(&mut self, id: NodeId) {
        self.in_flight.push_back((id, Envelope::wakeup()));
    }

    pub fn wakeup_all(&mut self) {
        let ids: Vec<_> = self.entries.iter().map(|entry| entry.node.id).collect();
        for id in ids {
            self.wakeup(id);
        }
    }

    /// Runs until no message is in flight and no timer is armed.
    pub async fn run(&mut self) -> Result<(), Report> {
        self.run_with_inspect(|_| {}).await
    }

    /// Same as `run`, calling `inspect` after every delivery; tests use it
    /// to assert safety invariants at every step.
    pub async fn run_with_inspect(
        &mut self,
        mut inspect: impl FnMut(&[SimEntry<P>]),
    ) -> Result<(), Report> {
        loop {
            let (to, message) = if let Some(next) = self.in_flight.pop_front() {
                next
            } else if let Some(next) = self.pop_timer() {
                next
            } else {
                break;
            };
            self.deliver(to, message).await?;
            inspect(&self.entries);
        }
        Ok(())
    }

    async fn deliver(&mut self, to: NodeId, message: Envelope) -> Result<(), Report> {
        let clock = self.clock;
        let entry = match self.entries.iter_mut().find(|entry| entry.node.id == to) {
            // the process already exited; the datagram is lost
            Some(entry) if entry.done => return Ok(()),
            Some(entry) => entry,
            None => bail!("message for unregistered node {}", to),
        };
        let done = entry.protocol.handle(&mut entry.node, message).await?;
        if done {
            entry.protocol.cleanup(&mut entry.node).await?;
            entry.done = true;
        }
        Self::collect_into(entry, &mut self.in_flight, &mut self.timers, clock);
        Ok(())
    }

    fn collect_into(
        entry: &mut SimEntry<P>,
        in_flight: &mut VecDeque<(NodeId, Envelope)>,
        timers: &mut Vec<(Duration, NodeId, Envelope)>,
        clock: Duration,
    ) {
        let id = entry.node.id;
        for (to, message) in entry.node.outgoing.drain(..) {
            in_flight.push_back((to, message));
        }
        for message in entry.node.posted.drain(..) {
            in_flight.push_back((id, message));
        }
        for (delay, message) in entry.node.armed.drain(..) {
            timers.push((clock + delay, id, message));
        }
    }

    fn pop_timer(&mut self) -> Option<(NodeId, Envelope)> {
        let index = self
            .timers
            .iter()
            .enumerate()
            .min_by_key(|&(i, &(at, _, _))| (at, i))
            .map(|(i, _)| i)?;
        let (at, id, message) = self.timers.remove(index);
        self.clock = at;
        Some((id, message))
    }

    fn entry(&self, id: NodeId) -> Option<&SimEntry<P>> {
        self.entries.iter().find(|entry| entry.node.id == id)
    }

    pub fn node(&self, id: NodeId) -> &SimNode {
        &self.entry(id).expect("node should be registered").node
    }

    pub fn protocol(&self, id: NodeId) -> &P {
        &self.entry(id).expect("node should be registered").protocol
    }

    pub fn done(&self, id: NodeId) -> bool {
        self.entry(id).expect("node should be registered").done
    }

    pub fn all_done(&self) -> bool {
        self.entries.iter().all(|entry| entry.done)
    }

    /// Sum of the per-node message counters.
    pub fn total_messages(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| entry.node.total_messages())
            .sum()
    }
}
