use crate::sender;
use ambit::command::{Command, State};
use ambit::id::NodeId;
use ambit::message::Envelope;
use ambit::node::NodeOps;
use ambit::protocol::Protocol;
use ambit::HashSet;
use color_eyre::eyre::{bail, eyre, Report};
use tracing::info;

/// Depth-first traversal with a single initiator: one token walks the
/// graph, FORWARD into unvisited territory, BACK_EDGE to close cycles,
/// RETURN when a subtree is exhausted. At termination every node knows its
/// entry edge and its tree neighbors, and together they form a spanning
/// tree rooted at the initiator.
#[derive(Debug)]
pub struct Dft {
    state: State,
    initiator: bool,
    entry: Option<NodeId>,
    /// Neighbors not yet visited, kept in DNS order for a deterministic
    /// walk.
    unvisited: Vec<NodeId>,
    tree_neighbors: HashSet<NodeId>,
}

impl Dft {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            initiator: false,
            entry: None,
            unvisited: Vec::new(),
            tree_neighbors: HashSet::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }

    pub fn entry(&self) -> Option<NodeId> {
        self.entry
    }

    pub fn tree_neighbors(&self) -> &HashSet<NodeId> {
        &self.tree_neighbors
    }

    /// Pushes the token onward, or returns it to the entry when this
    /// subtree is exhausted. `Ok(true)` means the local computation is
    /// over.
    async fn visit<N: NodeOps>(&mut self, node: &mut N) -> Result<bool, Report> {
        if let Some(next) = self.unvisited.pop() {
            node.send_to(Envelope::plain(Command::Forward, node.id()), next)
                .await?;
            self.state = State::Visited;
            Ok(false)
        } else if !self.initiator {
            let entry = self
                .entry
                .ok_or_else(|| eyre!("visited node without an entry edge"))?;
            node.send_to(Envelope::plain(Command::Return, node.id()), entry)
                .await?;
            Ok(true)
        } else {
            Ok(true)
        }
    }
}

impl<N: NodeOps> Protocol<N> for Dft {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Idle;
        self.initiator = false;
        self.entry = None;
        self.tree_neighbors.clear();
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        if message.command == Command::StartAt {
            bail!("this protocol supports only one initiator");
        }
        match (self.state, message.command) {
            (State::Idle, Command::Wakeup) => {
                self.unvisited = node.neighbors();
                self.initiator = true;
                info!("I am the root");
                self.visit(node).await
            }
            (State::Idle, Command::Forward) => {
                let from = sender(&message)?;
                self.entry = Some(from);
                self.unvisited = node.neighbors();
                self.unvisited.retain(|&neighbor| neighbor != from);
                self.visit(node).await
            }
            (State::Visited, Command::Forward) => {
                let from = sender(&message)?;
                let before = self.unvisited.len();
                self.unvisited.retain(|&neighbor| neighbor != from);
                if self.unvisited.len() == before {
                    bail!("FORWARD from {} which is not unvisited", from);
                }
                // the token reached the sender some other way first; this
                // edge closes a cycle
                node.send_to(Envelope::plain(Command::BackEdge, node.id()), from)
                    .await?;
                Ok(false)
            }
            (State::Visited, Command::Return) => {
                let from = sender(&message)?;
                self.tree_neighbors.insert(from);
                self.visit(node).await
            }
            (State::Visited, Command::BackEdge) => self.visit(node).await,
            (state, command) => Err(eyre!("unexpected command {} in state {}", command, state)),
        }
    }

    async fn cleanup(&mut self, node: &mut N) -> Result<(), Report> {
        info!("my neighbors in the spanning tree are: {:?}", self.tree_neighbors);
        node.send_total_messages().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulation;

    /// Collects the entry edges and checks they span the graph.
    fn assert_spanning_tree(simulation: &Simulation<Dft>, ids: &[u64], root: u64) {
        let mut edges = HashSet::new();
        for &id in ids {
            let protocol = simulation.protocol(id);
            assert!(simulation.done(id));
            if id == root {
                assert!(protocol.initiator());
                assert_eq!(protocol.entry(), None);
            } else {
                let entry = protocol.entry().expect("non-root node needs an entry");
                // the parent saw this node's RETURN
                assert!(
                    simulation.protocol(entry).tree_neighbors().contains(&id),
                    "{} missing from the tree neighbors of {}",
                    id,
                    entry
                );
                edges.insert((id.min(entry), id.max(entry)));
            }
        }
        // n - 1 distinct edges reaching every node: a spanning tree
        assert_eq!(edges.len(), ids.len() - 1);
    }

    #[tokio::test]
    async fn cycle_graph_yields_a_spanning_tree() {
        let mut simulation = Simulation::new();
        // square 1-2-3-4-1: one edge must close as a back edge
        simulation.register(1, vec![2, 4], Dft::new()).unwrap();
        simulation.register(2, vec![1, 3], Dft::new()).unwrap();
        simulation.register(3, vec![2, 4], Dft::new()).unwrap();
        simulation.register(4, vec![3, 1], Dft::new()).unwrap();
        simulation.wakeup(1);
        simulation.run().await.unwrap();

        assert_spanning_tree(&simulation, &[1, 2, 3, 4], 1);
    }

    #[tokio::test]
    async fn dense_graph_yields_a_spanning_tree() {
        let mut simulation = Simulation::new();
        let ids = [0, 1, 2, 3];
        for &id in &ids {
            let neighbors = ids.iter().copied().filter(|&n| n != id).collect();
            simulation.register(id, neighbors, Dft::new()).unwrap();
        }
        simulation.wakeup(2);
        simulation.run().await.unwrap();

        assert_spanning_tree(&simulation, &ids, 2);
    }
}
