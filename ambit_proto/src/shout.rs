use crate::sender;
use ambit::command::{Command, State};
use ambit::id::NodeId;
use ambit::message::Envelope;
use ambit::node::NodeOps;
use ambit::protocol::Protocol;
use ambit::HashSet;
use color_eyre::eyre::{bail, eyre, Report};
use tracing::info;

/// Shout spanning-tree construction: the root floods Q, every node adopts
/// the first Q's sender as parent (YES) and refuses later ones (NO). A node
/// is done once every neighbor answered its question.
#[derive(Debug)]
pub struct Shout {
    state: State,
    /// Answers received so far, the parent counted as one.
    counter: usize,
    parent: Option<NodeId>,
    tree_neighbors: HashSet<NodeId>,
}

impl Shout {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            counter: 0,
            parent: None,
            tree_neighbors: HashSet::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn tree_neighbors(&self) -> &HashSet<NodeId> {
        &self.tree_neighbors
    }

    fn decided<N: NodeOps>(&mut self, node: &N) -> bool {
        if self.counter == node.neighbors().len() {
            self.state = State::Done;
            info!("computation done");
            info!("tree neighbors: {:?}", self.tree_neighbors);
            info!("parent: {:?}", self.parent);
            true
        } else {
            false
        }
    }
}

impl<N: NodeOps> Protocol<N> for Shout {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Idle;
        self.counter = 0;
        self.parent = None;
        self.tree_neighbors.clear();
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        if message.command == Command::StartAt {
            bail!("this protocol supports only one initiator");
        }
        match (self.state, message.command) {
            (State::Idle, Command::Wakeup) => {
                info!("I am the root");
                self.counter = 0;
                self.state = State::Active;
                node.send_to_all(Envelope::plain(Command::Q, node.id())).await?;
                Ok(false)
            }
            (State::Idle, Command::Q) => {
                let from = sender(&message)?;
                self.parent = Some(from);
                self.tree_neighbors.insert(from);
                self.counter = 1;
                node.send_to(Envelope::plain(Command::Yes, node.id()), from)
                    .await?;
                if self.decided(node) {
                    // a leaf: the parent was its only neighbor
                    Ok(true)
                } else {
                    node.send_to_all_except(Envelope::plain(Command::Q, node.id()), from)
                        .await?;
                    self.state = State::Active;
                    Ok(false)
                }
            }
            (State::Active, Command::Q) => {
                let from = sender(&message)?;
                node.send_to(Envelope::plain(Command::No, node.id()), from)
                    .await?;
                Ok(false)
            }
            (State::Active, Command::Yes) => {
                let from = sender(&message)?;
                self.tree_neighbors.insert(from);
                self.counter += 1;
                Ok(self.decided(node))
            }
            (State::Active, Command::No) => {
                self.counter += 1;
                Ok(self.decided(node))
            }
            (state, command) => Err(eyre!("unexpected command {} in state {}", command, state)),
        }
    }

    async fn cleanup(&mut self, node: &mut N) -> Result<(), Report> {
        node.send_total_messages().await
    }
}
