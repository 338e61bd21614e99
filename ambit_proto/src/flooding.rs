use ambit::command::{Command, State};
use ambit::message::Envelope;
use ambit::node::NodeOps;
use ambit::protocol::{start_command, Protocol};
use color_eyre::eyre::{eyre, Report};
use tracing::info;

/// Flooding broadcast over an arbitrary connected graph. A woken node
/// informs every neighbor; an informed node relays to everyone except the
/// sender. A single initiator costs `2m - (n - 1)` messages overall.
#[derive(Debug)]
pub struct Flooding {
    state: State,
}

impl Flooding {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Asleep,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }
}

impl<N: NodeOps> Protocol<N> for Flooding {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Asleep;
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        let command = start_command(node, &message).await?;
        match (self.state, command) {
            (State::Asleep, Command::Wakeup) => {
                node.send_to_all(Envelope::plain(Command::Inform, node.id())).await?;
                self.state = State::Done;
                info!("computation is done locally");
                Ok(true)
            }
            (State::Asleep, Command::Inform) => {
                let sender = message
                    .sender
                    .ok_or_else(|| eyre!("INFORM without a sender"))?;
                node.send_to_all_except(Envelope::plain(Command::Inform, node.id()), sender)
                    .await?;
                self.state = State::Done;
                info!("computation is done locally");
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

    fn line_1_2_3() -> Simulation<Flooding> {
        let mut simulation = Simulation::new();
        simulation.register(1, vec![2], Flooding::new()).unwrap();
        simulation.register(2, vec![1, 3], Flooding::new()).unwrap();
        simulation.register(3, vec![2], Flooding::new()).unwrap();
        simulation
    }

    #[tokio::test]
    async fn line_graph_floods_with_two_messages() {
        let mut simulation = line_1_2_3();
        simulation.wakeup(1);
        simulation.run().await.unwrap();

        assert!(simulation.all_done());
        for id in [1, 2, 3] {
            assert_eq!(simulation.protocol(id).state(), State::Done);
        }
        // 2m - (n - 1) = 4 - 2
        assert_eq!(simulation.total_messages(), 2);
    }

    #[tokio::test]
    async fn inner_initiator_floods_both_ways() {
        let mut simulation = line_1_2_3();
        simulation.wakeup(2);
        simulation.run().await.unwrap();

        assert!(simulation.all_done());
        assert_eq!(simulation.total_messages(), 2);
    }

    #[tokio::test]
    async fn unexpected_commands_fail_loudly() {
        let mut protocol = Flooding::new();
        let mut node = crate::sim::SimNode::new(9, vec![1]);
        assert!(protocol
            .handle(&mut node, Envelope::plain(Command::Election, 1))
            .await
            .is_err());
    }
}
