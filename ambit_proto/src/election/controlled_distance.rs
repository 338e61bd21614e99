use crate::sender;
use ambit::command::{Command, State};
use ambit::message::{Envelope, Payload};
use ambit::node::RingOps;
use ambit::protocol::{start_command, Protocol};
use color_eyre::eyre::{eyre, Report};
use tracing::info;

/// Controlled-distance election: candidacies probe the ring with an
/// exponentially growing hop budget. A FORTH that survives its budget
/// bounces BACK; two returned probes double the budget. A candidate whose
/// FORTH makes the full circle is the LEADER. Message cost is
/// O(n log n).
#[derive(Debug)]
pub struct ControlledDistance {
    state: State,
    limit: u64,
    /// BACK messages received in the current round.
    back_count: u8,
}

impl ControlledDistance {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            state: State::Asleep,
            limit: 1,
            back_count: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    async fn initialize<N: RingOps>(&mut self, node: &mut N) -> Result<(), Report> {
        self.limit = 1;
        self.back_count = 0;
        node.send_to_all(Envelope::ranged(
            Command::Forth,
            node.id(),
            node.id(),
            Some(self.limit),
        ))
        .await
    }

    /// Relays a foreign FORTH: one hop less to travel, or a BACK to its
    /// sender when the budget is spent.
    async fn process_forth<N: RingOps>(
        &mut self,
        node: &mut N,
        origin: u64,
        from: u64,
        limit: u64,
    ) -> Result<(), Report> {
        let limit = limit - 1;
        info!("processing a probe, {} hops left", limit);
        if limit == 0 {
            node.send_to(Envelope::ranged(Command::Back, node.id(), origin, None), from)
                .await?;
        } else {
            node.send_to_other(
                Envelope::ranged(Command::Forth, node.id(), origin, Some(limit)),
                from,
            )
            .await?;
        }
        Ok(())
    }

    /// Counts a returned probe; both sides back means the round is over and
    /// the budget doubles.
    async fn check<N: RingOps>(&mut self, node: &mut N, origin: u64) -> Result<(), Report> {
        self.back_count += 1;
        if self.back_count == 2 {
            self.back_count = 0;
            self.limit *= 2;
            node.send_to_all(Envelope::ranged(
                Command::Forth,
                node.id(),
                origin,
                Some(self.limit),
            ))
            .await?;
        }
        Ok(())
    }
}

fn ranged(message: &Envelope) -> Result<(u64, Option<u64>), Report> {
    match message.payload {
        Payload::Ranged { origin, limit } => Ok((origin, limit)),
        _ => Err(eyre!("{} should carry a ranged payload", message.command)),
    }
}

impl<N: RingOps> Protocol<N> for ControlledDistance {
    fn setup(&mut self, _node: &mut N) -> Result<(), Report> {
        self.state = State::Asleep;
        Ok(())
    }

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report> {
        let command = start_command(node, &message).await?;
        match (self.state, command) {
            (State::Asleep, Command::Wakeup) => {
                self.state = State::Candidate;
                self.initialize(node).await?;
                Ok(false)
            }
            (State::Asleep, Command::Forth) => {
                let (origin, limit) = ranged(&message)?;
                let from = sender(&message)?;
                if origin < node.id() {
                    let limit = limit.ok_or_else(|| eyre!("FORTH without a hop budget"))?;
                    self.process_forth(node, origin, from, limit).await?;
                    self.state = State::Defeated;
                } else {
                    // the incoming candidacy is dominated and dies here
                    self.initialize(node).await?;
                    self.state = State::Candidate;
                }
                Ok(false)
            }
            (State::Candidate, Command::Forth) => {
                let (origin, limit) = ranged(&message)?;
                let from = sender(&message)?;
                if origin < node.id() {
                    let limit = limit.ok_or_else(|| eyre!("FORTH without a hop budget"))?;
                    self.process_forth(node, origin, from, limit).await?;
                    self.state = State::Defeated;
                    Ok(false)
                } else if origin == node.id() {
                    // the own probe made the full circle undefeated
                    node.send_to_other(
                        Envelope::ranged(Command::Notify, node.id(), node.id(), None),
                        from,
                    )
                    .await?;
                    self.state = State::Leader;
                    info!("elected {}", self.state);
                    Ok(true)
                } else {
                    // a dominated candidacy travels no further
                    Ok(false)
                }
            }
            (State::Candidate, Command::Back) => {
                let (origin, _) = ranged(&message)?;
                if origin == node.id() {
                    self.check(node, origin).await?;
                }
                Ok(false)
            }
            (State::Defeated, Command::Forth) => {
                let (origin, limit) = ranged(&message)?;
                let from = sender(&message)?;
                let limit = limit.ok_or_else(|| eyre!("FORTH without a hop budget"))?;
                self.process_forth(node, origin, from, limit).await?;
                Ok(false)
            }
            (State::Defeated, Command::Back) => {
                let (origin, _) = ranged(&message)?;
                let from = sender(&message)?;
                node.send_to_other(Envelope::ranged(Command::Back, node.id(), origin, None), from)
                    .await?;
                Ok(false)
            }
            (State::Defeated, Command::Notify) => {
                let (origin, _) = ranged(&message)?;
                let from = sender(&message)?;
                node.send_to_other(
                    Envelope::ranged(Command::Notify, node.id(), origin, None),
                    from,
                )
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
