use crate::{sender, token};
use ambit::command::{Command, State};
use ambit::message::Envelope;
use ambit::node::RingOps;
use ambit::protocol::{start_command, Protocol};
use color_eyre::eyre::{eyre, Report};
use tracing::info;

/// Ring-size count with a single initiator: a token circulates once,
/// incrementing its counter per hop; when it returns home the counter is
/// the ring size and an END wave closes the ring.
#[derive(Debug)]
pub struct Count {
    state: State,
    /// The ring size, once this node learned it.
    network_size: Option<u64>,
}

impl Count {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Asleep,
            network_size: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn network_size(&self) -> Option<u64> {
        self.network_size
    }
}

impl<N: RingOps> Protocol<N> for Count {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Asleep;
        self.network_size = None;
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        let command = start_command(node, &message).await?;
        match command {
            Command::Wakeup => {
                node.send_random(Envelope::token(Command::Forward, node.id(), 1, node.id()))
                    .await?;
                self.state = State::Awake;
                Ok(false)
            }
            Command::Forward => {
                let (counter, origin) = token(&message)?;
                if origin == node.id() {
                    info!("received back my message! nodes in network: {}", counter);
                    self.network_size = Some(counter);
                    node.send_random(Envelope::token(Command::End, node.id(), counter, node.id()))
                        .await?;
                    self.state = State::Done;
                    Ok(true)
                } else {
                    let sender = sender(&message)?;
                    node.send_to_other(
                        Envelope::token(Command::Forward, node.id(), counter + 1, origin),
                        sender,
                    )
                    .await?;
                    self.state = State::Awake;
                    Ok(false)
                }
            }
            Command::End => {
                let (counter, origin) = token(&message)?;
                info!(
                    "{} discovered that there are {} nodes in the network",
                    origin, counter
                );
                self.network_size = Some(counter);
                let sender = sender(&message)?;
                node.send_to_other(
                    Envelope::token(Command::End, node.id(), counter, origin),
                    sender,
                )
                .await?;
                self.state = State::Done;
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

    #[tokio::test]
    async fn initiator_counts_the_ring() {
        let mut simulation = Simulation::new();
        simulation
            .register_ring(&[1, 2, 3, 4, 5], Count::new)
            .unwrap();
        simulation.wakeup(3);
        simulation.run().await.unwrap();

        assert_eq!(simulation.protocol(3).network_size(), Some(5));
        for id in 1..=5 {
            assert!(simulation.done(id));
            assert_eq!(simulation.protocol(id).state(), State::Done);
        }
        // two messages per node: one on the counting leg, one on the END wave
        assert_eq!(simulation.total_messages(), 10);
    }

    #[tokio::test]
    async fn every_node_learns_the_size() {
        let mut simulation = Simulation::new();
        simulation.register_ring(&[7, 1, 4], Count::new).unwrap();
        simulation.wakeup(7);
        simulation.run().await.unwrap();

        for id in [7, 1, 4] {
            assert_eq!(simulation.protocol(id).network_size(), Some(3));
        }
    }
}
