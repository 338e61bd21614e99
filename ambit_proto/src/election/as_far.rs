use crate::sender;
use ambit::command::{Command, State};
use ambit::message::{Envelope, Payload};
use ambit::node::RingOps;
use ambit::protocol::{start_command, Protocol};
use color_eyre::eyre::{eyre, Report};
use tracing::info;

/// As-far-as-it-can election: a candidacy travels only while it dominates
/// the local minimum, so all but the smallest id die on the way. The
/// surviving origin makes a full circle, its owner becomes LEADER and a
/// NOTIFY wave converts everyone else.
#[derive(Debug)]
pub struct AsFar {
    state: State,
    min: u64,
}

impl AsFar {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Asleep,
            min: u64::MAX,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }
}

fn claim(message: &Envelope) -> Result<u64, Report> {
    match message.payload {
        Payload::Claim { origin } => Ok(origin),
        _ => Err(eyre!("{} should carry a claim payload", message.command)),
    }
}

impl<N: RingOps> Protocol<N> for AsFar {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Asleep;
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        let command = start_command(node, &message).await?;
        match (self.state, command) {
            (State::Asleep, Command::Wakeup) => {
                node.send_random(Envelope::claim(Command::Election, node.id(), node.id()))
                    .await?;
                self.min = node.id();
                self.state = State::Awake;
                Ok(false)
            }
            (State::Asleep, Command::Election) => {
                let origin = claim(&message)?;
                let from = sender(&message)?;
                self.min = node.id();
                if origin < self.min {
                    node.send_to_other(
                        Envelope::claim(Command::Election, node.id(), origin),
                        from,
                    )
                    .await?;
                    self.min = origin;
                } else {
                    // the incoming claim is dominated; inject the own
                    // candidacy in its direction of travel
                    node.send_to_other(
                        Envelope::claim(Command::Election, node.id(), node.id()),
                        from,
                    )
                    .await?;
                }
                self.state = State::Awake;
                Ok(false)
            }
            (State::Awake, Command::Election) => {
                let origin = claim(&message)?;
                let from = sender(&message)?;
                if origin < self.min {
                    node.send_to_other(
                        Envelope::claim(Command::Election, node.id(), origin),
                        from,
                    )
                    .await?;
                    self.min = origin;
                    Ok(false)
                } else if origin == self.min && origin == node.id() {
                    // the own claim survived the full circle
                    node.send_to_other(Envelope::claim(Command::Notify, node.id(), origin), from)
                        .await?;
                    self.state = State::Leader;
                    info!("elected {}", self.state);
                    Ok(true)
                } else {
                    // dominated claims travel no further
                    Ok(false)
                }
            }
            (State::Awake, Command::Notify) => {
                let origin = claim(&message)?;
                let from = sender(&message)?;
                node.send_to_other(Envelope::claim(Command::Notify, node.id(), origin), from)
                    .await?;
                self.state = State::Follower;
                info!("elected {}", self.state);
                Ok(true)
            }
            (state, command) => Err(eyre!("unexpected command {} in state {}", command, state)),
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

    async fn run(order: &[u64], initiators: &[u64]) -> Simulation<AsFar> {
        let mut simulation = Simulation::new();
        simulation.register_ring(order, AsFar::new).unwrap();
        for &id in initiators {
            simulation.wakeup(id);
        }
        simulation.run().await.unwrap();
        simulation
    }

    fn assert_unique_leader(simulation: &Simulation<AsFar>, order: &[u64], leader: u64) {
        for &id in order {
            let expected = if id == leader {
                State::Leader
            } else {
                State::Follower
            };
            assert_eq!(simulation.protocol(id).state(), expected, "node {}", id);
            assert!(simulation.done(id));
        }
    }

    #[tokio::test]
    async fn all_awake_elect_the_minimum() {
        let order = [3, 7, 1, 5, 2];
        let simulation = run(&order, &order).await;
        assert_unique_leader(&simulation, &order, 1);
    }

    #[tokio::test]
    async fn single_initiator_elects_the_minimum() {
        let order = [3, 7, 1, 5, 2];
        let simulation = run(&order, &[3]).await;
        assert_unique_leader(&simulation, &order, 1);
    }

    #[tokio::test]
    async fn favorable_orderings_stay_linear() {
        // a single initiator next to the minimum: the dominated claims die
        // after one hop each, so the message count stays O(n)
        let order = [9, 1, 4, 6, 8];
        let simulation = run(&order, &[9]).await;
        assert_unique_leader(&simulation, &order, 1);
        assert!(simulation.total_messages() <= 3 * order.len() as u64);
    }
}
