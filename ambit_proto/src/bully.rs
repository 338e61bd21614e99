use crate::sender;
use ambit::command::{Command, State};
use ambit::message::Envelope;
use ambit::node::NodeOps;
use ambit::protocol::Protocol;
use color_eyre::eyre::{bail, eyre, Report};
use std::time::Duration;
use tracing::info;

/// How long a node waits for a REPLY before declaring itself LEADER.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bully election on a complete graph: a node challenges every strictly
/// greater id and wins if nobody answers within the timeout. The timeout is
/// a scheduled TERM self-post; a REPLY before it lands settles the node as
/// a follower, and the role is read off when TERM arrives.
#[derive(Debug)]
pub struct Bully {
    state: State,
    waiting: bool,
    role: Option<State>,
    timeout: Duration,
}

impl Bully {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Asleep,
            waiting: false,
            role: None,
            timeout: REPLY_TIMEOUT,
        }
    }

    /// Shrinks the timeout; the loopback tests have no reason to wait five
    /// real seconds.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::new()
        }
    }

    pub fn role(&self) -> Option<State> {
        self.role
    }

    /// Challenges every neighbor with a strictly greater id and arms the
    /// reply timeout once.
    async fn broadcast<N: NodeOps>(&mut self, node: &mut N) -> Result<(), Report> {
        for id in node.neighbors() {
            if id > node.id() {
                node.send_to(Envelope::plain(Command::Election, node.id()), id)
                    .await?;
            }
        }
        if !self.waiting {
            self.waiting = true;
            node.schedule(self.timeout, Envelope::plain(Command::Term, node.id()));
        }
        Ok(())
    }

    async fn ack<N: NodeOps>(&mut self, node: &mut N, target: u64) -> Result<(), Report> {
        node.send_to(Envelope::plain(Command::Reply, node.id()), target)
            .await
    }
}

impl<N: NodeOps> Protocol<N> for Bully {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Asleep;
        self.waiting = false;
        self.role = None;
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        if message.command == Command::StartAt {
            bail!("this wakeup is not supported");
        }
        match message.command {
            Command::Wakeup => {
                if self.state == State::Asleep {
                    self.state = State::Active;
                    self.broadcast(node).await?;
                }
                Ok(false)
            }
            Command::Election => match self.state {
                State::Done => Ok(false),
                State::Asleep => {
                    self.state = State::Active;
                    let from = sender(&message)?;
                    self.ack(node, from).await?;
                    self.broadcast(node).await?;
                    Ok(false)
                }
                State::Active => {
                    let from = sender(&message)?;
                    self.ack(node, from).await?;
                    Ok(false)
                }
                state => Err(eyre!("unexpected command ELECTION in state {}", state)),
            },
            Command::Reply => match self.state {
                State::Active => {
                    self.state = State::Done;
                    self.role = Some(State::Follower);
                    info!("I am follower");
                    Ok(false)
                }
                State::Done => Ok(false),
                state => Err(eyre!("unexpected command REPLY in state {}", state)),
            },
            Command::Term => {
                // nobody outranked us before the timeout fired
                let role = *self.role.get_or_insert(State::Leader);
                info!("finished");
                info!("{}", role);
                Ok(true)
            }
            command => Err(eyre!(
                "unexpected command {} in state {}",
                command,
                self.state
            )),
        }
    }

    async fn cleanup(&mut self, node: &mut N) -> Result<(), Report> {
        node.send_total_messages().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulation;

    fn complete(ids: &[u64]) -> Simulation<Bully> {
        let mut simulation = Simulation::new();
        for &id in ids {
            let neighbors = ids.iter().copied().filter(|&n| n != id).collect();
            simulation.register(id, neighbors, Bully::new()).unwrap();
        }
        simulation
    }

    #[tokio::test]
    async fn the_largest_id_wins() {
        let ids = [0, 1, 2, 3, 4];
        let mut simulation = complete(&ids);
        simulation.wakeup(0);
        simulation.run().await.unwrap();

        for &id in &ids {
            assert!(simulation.done(id));
            let expected = if id == 4 {
                State::Leader
            } else {
                State::Follower
            };
            assert_eq!(simulation.protocol(id).role(), Some(expected), "node {}", id);
        }
    }

    #[tokio::test]
    async fn waking_the_largest_elects_it_directly() {
        let ids = [0, 1, 2, 3, 4];
        let mut simulation = complete(&ids);
        simulation.wakeup(4);
        simulation.run().await.unwrap();

        assert_eq!(simulation.protocol(4).role(), Some(State::Leader));
        // nobody else was challenged, so nobody else speaks
        for id in [0, 1, 2, 3] {
            assert_eq!(simulation.node(id).total_messages(), 0);
        }
    }
}
