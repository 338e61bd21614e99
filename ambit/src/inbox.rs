use crate::config::BUFFER_SIZE;
use crate::message::Envelope;
use crate::{trace, warn};
use bytes::Bytes;
use color_eyre::eyre::{eyre, Report};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Cloneable handle that enqueues directly into a worker's own inbound
/// queue. Used by `send_to_me` and by timer tasks posting local trigger
/// events.
#[derive(Debug, Clone)]
pub struct Poster {
    tx: UnboundedSender<Bytes>,
}

impl Poster {
    pub fn post(&self, envelope: &Envelope) -> Result<(), Report> {
        self.send_bytes(envelope.to_bytes()?)
    }

    pub fn send_bytes(&self, bytes: Bytes) -> Result<(), Report> {
        self.tx
            .send(bytes)
            .map_err(|_| eyre!("inbound queue is closed"))
    }
}

/// The inbound message queue. A listener task owns the bound socket and
/// forwards every datagram, in socket read order, into an unbounded FIFO
/// channel; the network may reorder, the queue does not. FIFO mode is
/// re-established at dispatch, not here.
#[derive(Debug)]
pub struct Inbox {
    tx: UnboundedSender<Bytes>,
    rx: UnboundedReceiver<Bytes>,
    listener: JoinHandle<()>,
}

impl Inbox {
    /// Starts the listener task on an already-bound socket.
    pub fn listen(socket: UdpSocket) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_tx = tx.clone();
        let listener = tokio::spawn(listener_task(socket, listener_tx));
        Self { tx, rx, listener }
    }

    /// Dequeues the next datagram, waiting for one to arrive.
    pub async fn recv(&mut self) -> Result<Bytes, Report> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| eyre!("inbound queue is closed"))
    }

    /// Dequeues the next datagram, waiting up to `timeout`; `None` on
    /// timeout.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, Report> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(bytes)) => Ok(Some(bytes)),
            Ok(None) => Err(eyre!("inbound queue is closed")),
            Err(_) => Ok(None),
        }
    }

    /// Re-queues raw bytes at the tail. Used to defer out-of-order
    /// deliveries in FIFO mode and to put back messages a drain loop is not
    /// interested in yet.
    pub fn reinsert(&self, bytes: Bytes) {
        if self.tx.send(bytes).is_err() {
            warn!("[inbox] error re-queueing message");
        }
    }

    pub fn poster(&self) -> Poster {
        Poster {
            tx: self.tx.clone(),
        }
    }

    /// Stops the listener; after this no new datagrams are enqueued. Items
    /// already queued can still be drained.
    pub fn stop(&self) {
        self.listener.abort();
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listener_task(socket: UdpSocket, tx: UnboundedSender<Bytes>) {
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => {
                trace!("[inbox] {} bytes from {}", len, from);
                if tx.send(Bytes::copy_from_slice(&buffer[..len])).is_err() {
                    // queue side is gone, nothing left to do
                    break;
                }
            }
            Err(e) => {
                warn!("[inbox] socket error in listener: {:?}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    async fn bound_inbox() -> (Inbox, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind should work");
        let port = socket.local_addr().unwrap().port();
        (Inbox::listen(socket), port)
    }

    #[tokio::test]
    async fn datagrams_flow_through_the_queue() {
        let (mut inbox, port) = bound_inbox().await;
        let out = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let envelope = Envelope::wakeup();
        out.send_to(&envelope.to_bytes().unwrap(), ("127.0.0.1", port))
            .unwrap();

        let bytes = inbox.recv().await.unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[tokio::test]
    async fn reinsert_goes_to_the_tail() {
        let (inbox, _port) = bound_inbox().await;
        let poster = inbox.poster();
        let first = Envelope::plain(Command::Q, 1);
        let second = Envelope::plain(Command::Yes, 2);
        poster.post(&first).unwrap();
        poster.post(&second).unwrap();

        let mut inbox = inbox;
        let head = inbox.recv().await.unwrap();
        inbox.reinsert(head);

        // the deferred head now sits behind the second message
        let next = inbox.recv().await.unwrap();
        assert_eq!(Envelope::from_bytes(&next).unwrap(), second);
        let tail = inbox.recv().await.unwrap();
        assert_eq!(Envelope::from_bytes(&tail).unwrap(), first);
    }

    #[tokio::test]
    async fn recv_timeout_expires() {
        let (mut inbox, _port) = bound_inbox().await;
        let got = inbox
            .recv_timeout(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn stop_halts_the_listener() {
        let (mut inbox, port) = bound_inbox().await;
        inbox.stop();
        // give the abort a chance to land
        tokio::time::sleep(Duration::from_millis(20)).await;

        let out = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        out.send_to(&Envelope::wakeup().to_bytes().unwrap(), ("127.0.0.1", port))
            .unwrap();
        let got = inbox
            .recv_timeout(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
