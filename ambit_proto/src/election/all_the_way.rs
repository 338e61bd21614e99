use crate::{sender, token};
use ambit::command::{Command, State};
use ambit::message::Envelope;
use ambit::node::RingOps;
use ambit::protocol::{start_command, Protocol};
use color_eyre::eyre::{eyre, Report};
use tracing::info;

/// All-the-way election: every candidacy token circulates the full ring.
/// Each node tracks the minimum origin seen and how many tokens it
/// forwarded; once its own token comes back it knows the ring size, and
/// after forwarding that many tokens it decides. The leader closes the run
/// with a TERM wave.
#[derive(Debug)]
pub struct AllTheWay {
    state: State,
    /// Tokens forwarded so far, the own one included.
    count: u64,
    ringsize: u64,
    known: bool,
    min: u64,
}

impl AllTheWay {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Asleep,
            count: 0,
            ringsize: 0,
            known: false,
            min: u64::MAX,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    async fn initialize<N: RingOps>(&mut self, node: &mut N) -> Result<(), Report> {
        self.count = 1;
        self.ringsize = 1;
        self.known = false;
        self.min = node.id();
        node.send_random(Envelope::token(Command::Election, node.id(), 1, node.id()))
            .await
    }

    async fn check<N: RingOps>(&mut self, node: &mut N) -> Result<(), Report> {
        info!(
            "count: {}, ringsize: {}, min: {}",
            self.count, self.ringsize, self.min
        );
        if self.count == self.ringsize {
            if node.id() == self.min {
                self.state = State::Leader;
                node.send_random(Envelope::token(Command::Term, node.id(), 1, node.id()))
                    .await?;
            } else {
                self.state = State::Follower;
            }
            info!("elected {}", self.state);
        }
        Ok(())
    }

    async fn relay<N: RingOps>(
        &mut self,
        node: &mut N,
        message: &Envelope,
        command: Command,
    ) -> Result<(), Report> {
        let (counter, origin) = token(message)?;
        let from = sender(message)?;
        node.send_to_other(
            Envelope::token(command, node.id(), counter + 1, origin),
            from,
        )
        .await?;
        self.min = self.min.min(origin);
        self.count += 1;
        Ok(())
    }
}

impl<N: RingOps> Protocol<N> for AllTheWay {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Asleep;
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        let command = start_command(node, &message).await?;

        if command == Command::Term {
            let (counter, origin) = token(&message)?;
            if origin == node.id() {
                info!("got back the termination message");
            } else {
                let from = sender(&message)?;
                node.send_to_other(
                    Envelope::token(Command::Term, node.id(), counter + 1, origin),
                    from,
                )
                .await?;
            }
            return Ok(true);
        }

        match (self.state, command) {
            (State::Asleep, Command::Wakeup) => {
                self.initialize(node).await?;
                self.state = State::Awake;
                Ok(false)
            }
            (State::Asleep, Command::Election) => {
                self.initialize(node).await?;
                self.relay(node, &message, Command::Election).await?;
                self.state = State::Awake;
                Ok(false)
            }
            (State::Awake, Command::Election) => {
                let (counter, origin) = token(&message)?;
                if origin != node.id() {
                    self.relay(node, &message, Command::Election).await?;
                    if self.known {
                        self.check(node).await?;
                    }
                } else {
                    self.ringsize = counter;
                    self.known = true;
                    self.check(node).await?;
                }
                Ok(false)
            }
            (state, command) => Err(eyre!("unexpected command {} in state {}", command, state)),
        }
    }

    async fn cleanup(&mut self, node: &mut N) -> Result<(), Report> {
        info!("leader election protocol is done");
        node.send_total_messages().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Simulation;

    fn leaders_and_followers(
        simulation: &Simulation<AllTheWay>,
        ids: &[u64],
    ) -> (Vec<u64>, Vec<u64>) {
        let mut leaders = Vec::new();
        let mut followers = Vec::new();
        for &id in ids {
            match simulation.protocol(id).state() {
                State::Leader => leaders.push(id),
                State::Follower => followers.push(id),
                state => panic!("node {} ended in state {}", id, state),
            }
        }
        (leaders, followers)
    }

    #[tokio::test]
    async fn all_awake_elect_the_minimum() {
        let order = [3, 7, 1, 5, 2];
        let mut simulation = Simulation::new();
        simulation.register_ring(&order, AllTheWay::new).unwrap();
        simulation.wakeup_all();
        simulation.run().await.unwrap();

        let (leaders, followers) = leaders_and_followers(&simulation, &order);
        assert_eq!(leaders, vec![1]);
        assert_eq!(followers.len(), 4);
        assert!(simulation.all_done());
        // every candidacy circulates the whole ring: at least n * n sends
        assert!(simulation.total_messages() >= 25);
    }

    #[tokio::test]
    async fn single_initiator_still_elects_the_minimum() {
        let order = [4, 9, 6, 2];
        let mut simulation = Simulation::new();
        simulation.register_ring(&order, AllTheWay::new).unwrap();
        simulation.wakeup(9);
        simulation.run().await.unwrap();

        let (leaders, followers) = leaders_and_followers(&simulation, &order);
        assert_eq!(leaders, vec![2]);
        assert_eq!(followers.len(), 3);
    }
}
