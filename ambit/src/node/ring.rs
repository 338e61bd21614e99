use crate::id::{NodeId, SeqNumber};
use crate::inbox::Inbox;
use crate::message::Envelope;
use crate::node::{Node, NodeOps, WorkerNode};
use crate::time::StartAt;
use color_eyre::eyre::{bail, eyre, Report};
use std::time::Duration;

/// Ring-only primitives.
#[allow(async_fn_in_trait)]
pub trait RingOps: NodeOps {
    /// Unicast to the unique neighbor that is not `sender`. Only meaningful
    /// on a ring, where every node has exactly two neighbors.
    async fn send_to_other(&mut self, message: Envelope, sender: NodeId) -> Result<(), Report>;
}

/// A worker on a ring topology. Construction checks the two-neighbor
/// precondition so that a bad graph is rejected at setup instead of
/// misbehaving mid-protocol.
#[derive(Debug)]
pub struct RingNode {
    node: Node,
}

impl RingNode {
    pub fn new(node: Node) -> Result<Self, Report> {
        let neighbors = node.neighbors().len();
        if neighbors != 2 {
            bail!(
                "node {} has {} neighbors; a ring node needs exactly 2",
                node.id(),
                neighbors
            );
        }
        Ok(Self { node })
    }
}

impl NodeOps for RingNode {
    fn id(&self) -> NodeId {
        self.node.id()
    }

    fn neighbors(&self) -> Vec<NodeId> {
        self.node.neighbors()
    }

    async fn send_random(&mut self, message: Envelope) -> Result<(), Report> {
        self.node.send_random(message).await
    }

    async fn send_to(&mut self, message: Envelope, target: NodeId) -> Result<(), Report> {
        self.node.send_to(message, target).await
    }

    async fn send_back(&mut self, message: Envelope) -> Result<(), Report> {
        self.node.send_back(message).await
    }

    async fn send_to_all(&mut self, message: Envelope) -> Result<(), Report> {
        self.node.send_to_all(message).await
    }

    async fn send_to_all_uncounted(&mut self, message: Envelope) -> Result<(), Report> {
        self.node.send_to_all_uncounted(message).await
    }

    async fn send_to_all_except(
        &mut self,
        message: Envelope,
        exclude: NodeId,
    ) -> Result<(), Report> {
        self.node.send_to_all_except(message, exclude).await
    }

    async fn send_to_missing(
        &mut self,
        message: Envelope,
        excludes: &[NodeId],
    ) -> Result<(), Report> {
        self.node.send_to_missing(message, excludes).await
    }

    fn send_to_me(&mut self, message: Envelope) -> Result<(), Report> {
        self.node.send_to_me(message)
    }

    fn schedule(&mut self, delay: Duration, message: Envelope) {
        self.node.schedule(delay, message)
    }

    async fn pause_until(&self, at: StartAt) -> Result<(), Report> {
        self.node.pause_until(at).await
    }

    fn total_messages(&self) -> u64 {
        self.node.total_messages()
    }

    async fn send_total_messages(&mut self) -> Result<(), Report> {
        self.node.send_total_messages().await
    }
}

impl RingOps for RingNode {
    async fn send_to_other(&mut self, message: Envelope, sender: NodeId) -> Result<(), Report> {
        let target = self
            .neighbors()
            .into_iter()
            .find(|&neighbor| neighbor != sender)
            .ok_or_else(|| eyre!("no neighbor other than {}", sender))?;
        self.node.send_to(message, target).await
    }
}

impl WorkerNode for RingNode {
    fn fifo(&self) -> bool {
        self.node.fifo()
    }

    fn next_expected(&mut self, sender: NodeId) -> &mut SeqNumber {
        self.node.next_expected(sender)
    }

    fn inbox_mut(&mut self) -> &mut Inbox {
        self.node.inbox_mut()
    }

    async fn send_start_of_protocol(&mut self) -> Result<(), Report> {
        self.node.send_start_of_protocol().await
    }

    async fn send_end_of_protocol(&mut self) -> Result<(), Report> {
        self.node.send_end_of_protocol().await
    }

    async fn send_error(&mut self, text: String) -> Result<(), Report> {
        self.node.send_error(text).await
    }

    fn cleanup(&mut self) {
        self.node.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::node::tests::Harness;

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_non_ring_degrees() {
        let harness = Harness::new(&[1, 2, 4]);
        let node = harness.connect(0, false).await;
        assert!(RingNode::new(node).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_to_other_skips_the_sender() {
        let harness = Harness::new(&[7, 2]);
        let node = harness.connect(3, false).await;
        let mut ring = RingNode::new(node).unwrap();

        ring.send_to_other(Envelope::token(Command::Forward, 3, 1, 3), 7)
            .await
            .unwrap();
        let got = Harness::recv_from(&harness.neighbors[1].1);
        assert_eq!(got.command, Command::Forward);
        assert_eq!(ring.total_messages(), 1);
    }
}
