// This module contains the protocol contract and the dispatch engine that
// drives one protocol run on a worker.

use crate::command::Command;
use crate::id::SeqNumber;
use crate::message::Envelope;
use crate::node::{NodeOps, WorkerNode};
use crate::{log, warn};
use color_eyre::eyre::{Report, WrapErr};
use std::time::Duration;

/// A protocol is a state machine over the send primitives of its node:
/// `setup` initializes local state, `handle` consumes one message and
/// returns `Ok(true)` iff the local computation terminated, `cleanup`
/// flushes accounting. Invariant violations (unexpected state/command
/// pairs) are reported as errors and cross the engine's error boundary.
#[allow(async_fn_in_trait)]
pub trait Protocol<N: NodeOps> {
    fn setup(&mut self, node: &mut N) -> Result<(), Report>;

    async fn handle(&mut self, node: &mut N, message: Envelope) -> Result<bool, Report>;

    async fn cleanup(&mut self, node: &mut N) -> Result<(), Report>;
}

/// How one protocol run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `handle` reported local termination.
    Completed,
    /// The coordinator broadcast ERROR and this worker bailed out.
    Aborted,
}

/// Resolves the effective command of a message: START_AT suspends until the
/// carried wall-clock instant and then counts as WAKEUP. Protocols that
/// support synchronized starts await this first thing in `handle`.
pub async fn start_command<N: NodeOps>(node: &N, message: &Envelope) -> Result<Command, Report> {
    match (&message.command, &message.payload) {
        (Command::StartAt, crate::message::Payload::StartAt(at)) => {
            node.pause_until(*at).await?;
            Ok(Command::Wakeup)
        }
        _ => Ok(message.command),
    }
}

/// FIFO admission verdict for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Deliver,
    Defer,
    Reject,
}

/// Decides what to do with a sequenced message given the expected sequence
/// for its sender, advancing the counter on delivery. A missing stamp is
/// delivered as-is (only node-to-node traffic is stamped).
pub fn fifo_admit(expected: &mut SeqNumber, seq: Option<SeqNumber>) -> Admit {
    match seq {
        None => Admit::Deliver,
        Some(seq) if seq == *expected => {
            *expected += 1;
            Admit::Deliver
        }
        Some(seq) if seq > *expected => Admit::Defer,
        Some(_) => Admit::Reject,
    }
}

/// Drives one protocol run: dequeue, deserialize, FIFO reorder check,
/// dispatch, terminate when `handle` says so. The error boundary converts a
/// failure inside `handle` into an ERROR message to the coordinator before
/// cleaning up, which is how the coordinator learns of crashes.
pub async fn run<N, P>(node: &mut N, protocol: &mut P) -> Result<RunOutcome, Report>
where
    N: WorkerNode,
    P: Protocol<N>,
{
    protocol.setup(node)?;
    node.send_start_of_protocol().await?;

    let outcome = loop {
        let bytes = node.inbox_mut().recv().await?;
        let message = match Envelope::from_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("[engine] skipping undecodable datagram: {:?}", e);
                continue;
            }
        };

        if message.command == Command::Error {
            tracing::info!("exiting: decoded an error message from the coordinator");
            break RunOutcome::Aborted;
        }

        // coordinator traffic and local triggers carry no sender and skip
        // the reorder check
        if node.fifo() {
            if let Some(sender) = message.sender {
                match fifo_admit(node.next_expected(sender), message.seq_number) {
                    Admit::Deliver => {}
                    Admit::Defer => {
                        log!("[engine] out of order message from {}, re-queueing", sender);
                        node.inbox_mut().reinsert(bytes);
                        // let the missing datagram arrive
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        continue;
                    }
                    Admit::Reject => {
                        warn!(
                            "[engine] stale sequence number from {}: {:?}",
                            sender, message.seq_number
                        );
                        continue;
                    }
                }
            }
        }

        tracing::info!("{}", message);
        match protocol.handle(node, message).await {
            Ok(true) => break RunOutcome::Completed,
            Ok(false) => continue,
            Err(e) => {
                let text = format!("fatal error in node {}: {:?}", node.id(), e);
                if let Err(send_error) = node.send_error(text).await {
                    warn!(
                        "[engine] error reporting the failure to the coordinator: {:?}",
                        send_error
                    );
                }
                if let Err(cleanup_error) = protocol.cleanup(node).await {
                    warn!("[engine] error in protocol cleanup: {:?}", cleanup_error);
                }
                node.cleanup();
                return Err(e).wrap_err("protocol failure");
            }
        }
    };

    protocol
        .cleanup(node)
        .await
        .wrap_err("error in protocol cleanup")?;
    node.send_end_of_protocol().await?;
    node.cleanup();
    Ok(outcome)
}
