// This module contains the worker node runtime: the handshake with the
// coordinator, the send primitives protocols are written against, and the
// resource cleanup that runs on every exit path.

mod ring;

// Re-exports.
pub use ring::{RingNode, RingOps};

use crate::command::Command;
use crate::graph::LocalDns;
use crate::id::{NodeId, SeqNumber};
use crate::inbox::Inbox;
use crate::message::{Envelope, Payload, Setup};
use crate::time::StartAt;
use crate::HashMap;
use crate::{log, warn};
use color_eyre::eyre::{bail, eyre, Report, WrapErr};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Send primitives exposed to protocols. Every operation except `send_back`
/// and `send_to_me` increments the message counter. The trait is the seam
/// that lets the in-process simulation drive protocols without sockets.
#[allow(async_fn_in_trait)]
pub trait NodeOps {
    fn id(&self) -> NodeId;

    /// Neighbor ids in local-DNS insertion order.
    fn neighbors(&self) -> Vec<NodeId>;

    /// Unicast to the *first* neighbor in DNS insertion order. The name is
    /// historical; the choice is deterministic and the ring protocols
    /// depend on that.
    async fn send_random(&mut self, message: Envelope) -> Result<(), Report>;

    /// Unicast to the neighbor with the given id.
    async fn send_to(&mut self, message: Envelope, target: NodeId) -> Result<(), Report>;

    /// Unicast to the coordinator. Not counted.
    async fn send_back(&mut self, message: Envelope) -> Result<(), Report>;

    /// Unicast to every neighbor.
    async fn send_to_all(&mut self, message: Envelope) -> Result<(), Report>;

    /// Unicast to every neighbor without touching the counter; used for
    /// protocol-level END waves that should not inflate the metrics.
    async fn send_to_all_uncounted(&mut self, message: Envelope) -> Result<(), Report>;

    /// Unicast to every neighbor except one.
    async fn send_to_all_except(&mut self, message: Envelope, exclude: NodeId)
        -> Result<(), Report>;

    /// Unicast to every neighbor not in `excludes`; the exclude list must
    /// leave exactly one neighbor out.
    async fn send_to_missing(&mut self, message: Envelope, excludes: &[NodeId])
        -> Result<(), Report>;

    /// Enqueues directly into the own inbound queue. Not counted.
    fn send_to_me(&mut self, message: Envelope) -> Result<(), Report>;

    /// Posts `message` into the own inbound queue after `delay`. Timers and
    /// requesters use this instead of mutating protocol state from another
    /// task.
    fn schedule(&mut self, delay: Duration, message: Envelope);

    /// Suspends until the given wall-clock instant; used on START_AT.
    async fn pause_until(&self, at: StartAt) -> Result<(), Report>;

    /// Total number of inter-worker messages sent so far.
    fn total_messages(&self) -> u64;

    /// Reports the counter to the coordinator with COUNT_M. Not counted.
    async fn send_total_messages(&mut self) -> Result<(), Report>;
}

/// Engine-facing side of a worker, on top of the protocol-facing `NodeOps`.
#[allow(async_fn_in_trait)]
pub trait WorkerNode: NodeOps {
    fn fifo(&self) -> bool;

    /// Inbound expected-sequence slot for `sender` (starts at 0).
    fn next_expected(&mut self, sender: NodeId) -> &mut SeqNumber;

    fn inbox_mut(&mut self) -> &mut Inbox;

    async fn send_start_of_protocol(&mut self) -> Result<(), Report>;

    async fn send_end_of_protocol(&mut self) -> Result<(), Report>;

    async fn send_error(&mut self, text: String) -> Result<(), Report>;

    /// Releases the listener and, when mirroring, tells the visualizer the
    /// stream is over. Runs on every exit path.
    fn cleanup(&mut self);
}

/// One worker process: owns the listening socket, the inbound queue and the
/// per-run counters.
#[derive(Debug)]
pub struct Node {
    hostname: String,
    back: u16,
    port: u16,
    fifo: bool,
    id: NodeId,
    edges: Vec<(NodeId, NodeId)>,
    local_dns: LocalDns,
    reverse_dns: HashMap<u16, NodeId>,
    shell: bool,
    exp_path: PathBuf,
    visualizer_port: Option<u16>,
    total_messages: u64,
    sleep_delay: Duration,
    send_seq: HashMap<NodeId, SeqNumber>,
    recv_seq: HashMap<NodeId, SeqNumber>,
    inbox: Inbox,
    out: std::net::UdpSocket,
}

impl Node {
    /// Binds the listening socket, announces READY to the coordinator and
    /// blocks until SETUP arrives. Passing port 0 binds an ephemeral port
    /// (used by the tests).
    pub async fn connect(
        hostname: impl Into<String>,
        back: u16,
        port: u16,
        fifo: bool,
    ) -> Result<Self, Report> {
        let hostname = hostname.into();
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .wrap_err_with(|| format!("error binding worker port {}", port))?;
        let port = socket.local_addr()?.port();
        let mut inbox = Inbox::listen(socket);
        let out = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .wrap_err("error binding outbound socket")?;

        // part of the handshake, never counted
        out.send_to(&Envelope::ready(port).to_bytes()?, (hostname.as_str(), back))
            .wrap_err("error sending READY to the coordinator")?;

        let setup = wait_for_setup(&mut inbox).await?;
        let reverse_dns = setup
            .local_dns
            .iter()
            .map(|(id, port)| (port, id))
            .collect();

        Ok(Self {
            hostname,
            back,
            port,
            fifo,
            id: setup.id,
            edges: setup.edges,
            local_dns: setup.local_dns,
            reverse_dns,
            shell: setup.shell,
            exp_path: PathBuf::from(setup.exp_path),
            visualizer_port: setup.visualizer_port,
            total_messages: 0,
            sleep_delay: Duration::from_secs(1),
            send_seq: HashMap::new(),
            recv_seq: HashMap::new(),
            inbox,
            out,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shell(&self) -> bool {
        self.shell
    }

    pub fn exp_path(&self) -> &PathBuf {
        &self.exp_path
    }

    pub fn edges(&self) -> &[(NodeId, NodeId)] {
        &self.edges
    }

    pub fn local_dns(&self) -> &LocalDns {
        &self.local_dns
    }

    /// The delay inserted before each inter-worker send while the
    /// visualizer is attached, so it can animate.
    pub fn set_sleep_delay(&mut self, delay: Duration) {
        self.sleep_delay = delay;
    }

    /// Logs the basic information of this node.
    pub fn print_info(&self) {
        tracing::info!(
            "node {} | listening on {} | coordinator on {} | fifo: {} | edges: {:?} | dns: {:?}",
            self.id,
            self.port,
            self.back,
            self.fifo,
            self.edges,
            self.local_dns
        );
    }

    /// Transmits one datagram. Counting is the caller's business; this takes
    /// care of the FIFO stamp, the visualizer delay and the mirrored copy.
    async fn transmit(&mut self, mut message: Envelope, port: u16) -> Result<(), Report> {
        let to_worker = port != self.back;
        if to_worker && self.visualizer_port.is_some() {
            tokio::time::sleep(self.sleep_delay).await;
        }
        if self.fifo && to_worker {
            let target = *self
                .reverse_dns
                .get(&port)
                .ok_or_else(|| eyre!("port {} is not a neighbor", port))?;
            let seq = self.send_seq.entry(target).or_insert(0);
            message.seq_number = Some(*seq);
            *seq += 1;
        }
        self.out
            .send_to(&message.to_bytes()?, (self.hostname.as_str(), port))
            .wrap_err("error sending datagram")?;

        // replicate node-to-node traffic, and errors on their way to the
        // coordinator, for the visualizer
        if let Some(visualizer_port) = self.visualizer_port {
            if to_worker || message.command == Command::Error {
                let receiver = if to_worker {
                    Some(*self.reverse_dns.get(&port).expect("checked above"))
                } else {
                    None
                };
                let mirrored = message.mirrored(receiver);
                self.out
                    .send_to(
                        &mirrored.to_bytes()?,
                        (self.hostname.as_str(), visualizer_port),
                    )
                    .wrap_err("error mirroring datagram to the visualizer")?;
            }
        }
        Ok(())
    }

    fn port_of(&self, target: NodeId) -> Result<u16, Report> {
        self.local_dns
            .get(target)
            .ok_or_else(|| eyre!("node {} is not a neighbor of {}", target, self.id))
    }

    fn send_end_of_visualization(&mut self) {
        if let Some(visualizer_port) = self.visualizer_port {
            if let Ok(bytes) = Envelope::visual_end().to_bytes() {
                let _ = self
                    .out
                    .send_to(&bytes, (self.hostname.as_str(), visualizer_port));
            }
        }
    }
}

impl NodeOps for Node {
    fn id(&self) -> NodeId {
        self.id
    }

    fn neighbors(&self) -> Vec<NodeId> {
        self.local_dns.ids().collect()
    }

    async fn send_random(&mut self, message: Envelope) -> Result<(), Report> {
        let (_, port) = self
            .local_dns
            .first()
            .ok_or_else(|| eyre!("node {} has no neighbors", self.id))?;
        self.transmit(message, port).await?;
        self.total_messages += 1;
        Ok(())
    }

    async fn send_to(&mut self, message: Envelope, target: NodeId) -> Result<(), Report> {
        let port = self.port_of(target)?;
        self.transmit(message, port).await?;
        self.total_messages += 1;
        Ok(())
    }

    async fn send_back(&mut self, message: Envelope) -> Result<(), Report> {
        self.transmit(message, self.back).await
    }

    async fn send_to_all(&mut self, message: Envelope) -> Result<(), Report> {
        for (_, port) in self.local_dns.clone().iter() {
            self.transmit(message.clone(), port).await?;
            self.total_messages += 1;
        }
        Ok(())
    }

    async fn send_to_all_uncounted(&mut self, message: Envelope) -> Result<(), Report> {
        for (_, port) in self.local_dns.clone().iter() {
            self.transmit(message.clone(), port).await?;
        }
        Ok(())
    }

    async fn send_to_all_except(
        &mut self,
        message: Envelope,
        exclude: NodeId,
    ) -> Result<(), Report> {
        for (id, port) in self.local_dns.clone().iter() {
            if id == exclude {
                continue;
            }
            self.transmit(message.clone(), port).await?;
            self.total_messages += 1;
        }
        Ok(())
    }

    async fn send_to_missing(
        &mut self,
        message: Envelope,
        excludes: &[NodeId],
    ) -> Result<(), Report> {
        if excludes.len() + 1 != self.local_dns.len() {
            bail!(
                "send_to_missing expects {} excluded neighbors, got {}",
                self.local_dns.len().saturating_sub(1),
                excludes.len()
            );
        }
        for (id, port) in self.local_dns.clone().iter() {
            if excludes.contains(&id) {
                continue;
            }
            self.transmit(message.clone(), port).await?;
            self.total_messages += 1;
        }
        Ok(())
    }

    fn send_to_me(&mut self, message: Envelope) -> Result<(), Report> {
        self.inbox.poster().post(&message)
    }

    fn schedule(&mut self, delay: Duration, message: Envelope) {
        let poster = self.inbox.poster();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = poster.post(&message) {
                log!("[node] scheduled post after queue shutdown: {:?}", e);
            }
        });
    }

    async fn pause_until(&self, at: StartAt) -> Result<(), Report> {
        at.pause_until().await
    }

    fn total_messages(&self) -> u64 {
        self.total_messages
    }

    async fn send_total_messages(&mut self) -> Result<(), Report> {
        let message = Envelope::count(self.id, self.total_messages);
        self.send_back(message).await
    }
}

impl WorkerNode for Node {
    fn fifo(&self) -> bool {
        self.fifo
    }

    fn next_expected(&mut self, sender: NodeId) -> &mut SeqNumber {
        self.recv_seq.entry(sender).or_insert(0)
    }

    fn inbox_mut(&mut self) -> &mut Inbox {
        &mut self.inbox
    }

    async fn send_start_of_protocol(&mut self) -> Result<(), Report> {
        let message = Envelope::start_protocol(self.id, self.port);
        self.send_back(message).await
    }

    async fn send_end_of_protocol(&mut self) -> Result<(), Report> {
        let message = Envelope::end_protocol(self.id);
        self.send_back(message).await
    }

    async fn send_error(&mut self, text: String) -> Result<(), Report> {
        let message = Envelope::error(Some(self.id), text);
        self.send_back(message).await
    }

    fn cleanup(&mut self) {
        self.inbox.stop();
        self.send_end_of_visualization();
    }
}

async fn wait_for_setup(inbox: &mut Inbox) -> Result<Setup, Report> {
    loop {
        let bytes = inbox.recv().await?;
        let message = match Envelope::from_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("[node] error deserializing during setup: {:?}", e);
                continue;
            }
        };
        match message.payload {
            Payload::Setup(setup) => return Ok(setup),
            _ => {
                warn!("[node] unexpected message during setup: {}", message);
                continue;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A coordinator-side endpoint plus fake neighbor sockets, everything on
    /// ephemeral loopback ports.
    pub(crate) struct Harness {
        pub coordinator: std::net::UdpSocket,
        pub neighbors: Vec<(NodeId, std::net::UdpSocket)>,
    }

    impl Harness {
        pub fn new(neighbor_ids: &[NodeId]) -> Self {
            let coordinator = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            coordinator
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let neighbors = neighbor_ids
                .iter()
                .map(|&id| {
                    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
                    socket
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    (id, socket)
                })
                .collect();
            Self {
                coordinator,
                neighbors,
            }
        }

        pub fn local_dns(&self) -> LocalDns {
            self.neighbors
                .iter()
                .map(|(id, socket)| (*id, socket.local_addr().unwrap().port()))
                .collect()
        }

        pub fn recv_from(socket: &std::net::UdpSocket) -> Envelope {
            let mut buffer = [0u8; crate::config::BUFFER_SIZE];
            let (len, _) = socket.recv_from(&mut buffer).unwrap();
            Envelope::from_bytes(&buffer[..len]).unwrap()
        }

        /// Runs the coordinator side of the handshake while the node
        /// connects.
        pub async fn connect(&self, id: NodeId, fifo: bool) -> Node {
            let back = self.coordinator.local_addr().unwrap().port();
            let dns = self.local_dns();
            let handle =
                tokio::spawn(async move { Node::connect("127.0.0.1", back, 0, fifo).await });

            let ready = Self::recv_from(&self.coordinator);
            assert_eq!(ready.command, Command::Ready);
            let Payload::Port { port } = ready.payload else {
                panic!("READY should carry the listen port");
            };

            let setup = Envelope::setup(Setup {
                id,
                edges: vec![],
                local_dns: dns,
                shell: true,
                exp_path: "logs/test".to_string(),
                visualizer_port: None,
            });
            self.coordinator
                .send_to(&setup.to_bytes().unwrap(), ("127.0.0.1", port))
                .unwrap();

            handle.await.unwrap().unwrap()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_installs_the_topology() {
        let harness = Harness::new(&[7, 2]);
        let node = harness.connect(3, false).await;
        assert_eq!(node.id(), 3);
        assert_eq!(node.neighbors(), vec![7, 2]);
        assert_eq!(node.total_messages(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn primitives_count_and_route() {
        let harness = Harness::new(&[7, 2]);
        let mut node = harness.connect(3, false).await;

        node.send_random(Envelope::plain(Command::Forward, 3))
            .await
            .unwrap();
        let got = Harness::recv_from(&harness.neighbors[0].1);
        assert_eq!(got.command, Command::Forward);
        assert_eq!(node.total_messages(), 1);

        node.send_to(Envelope::plain(Command::Q, 3), 2).await.unwrap();
        let got = Harness::recv_from(&harness.neighbors[1].1);
        assert_eq!(got.command, Command::Q);
        assert_eq!(node.total_messages(), 2);

        node.send_to_all_except(Envelope::plain(Command::Inform, 3), 7)
            .await
            .unwrap();
        let got = Harness::recv_from(&harness.neighbors[1].1);
        assert_eq!(got.command, Command::Inform);
        assert_eq!(node.total_messages(), 3);

        // coordinator-bound traffic is never counted
        node.send_total_messages().await.unwrap();
        let got = Harness::recv_from(&harness.coordinator);
        assert_eq!(got.command, Command::CountM);
        assert_eq!(got.payload, Payload::Count { counter: 3 });
        assert_eq!(node.total_messages(), 3);

        // the uncounted broadcast opt-out
        node.send_to_all_uncounted(Envelope::plain(Command::End, 3))
            .await
            .unwrap();
        assert_eq!(node.total_messages(), 3);

        assert!(node
            .send_to(Envelope::plain(Command::Q, 3), 9)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fifo_mode_stamps_node_to_node_sends() {
        let harness = Harness::new(&[1, 2]);
        let mut node = harness.connect(0, true).await;

        node.send_to(Envelope::stamp(Command::Request, 0, 1), 1)
            .await
            .unwrap();
        node.send_to(Envelope::stamp(Command::Request, 0, 2), 1)
            .await
            .unwrap();
        node.send_to(Envelope::stamp(Command::Request, 0, 3), 2)
            .await
            .unwrap();

        let first = Harness::recv_from(&harness.neighbors[0].1);
        let second = Harness::recv_from(&harness.neighbors[0].1);
        let other = Harness::recv_from(&harness.neighbors[1].1);
        assert_eq!(first.seq_number, Some(0));
        assert_eq!(second.seq_number, Some(1));
        assert_eq!(other.seq_number, Some(0));

        // coordinator-bound sends are not stamped
        node.send_end_of_protocol().await.unwrap();
        let eop = Harness::recv_from(&harness.coordinator);
        assert_eq!(eop.seq_number, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_to_missing_enforces_the_size_rule() {
        let harness = Harness::new(&[1, 2, 4]);
        let mut node = harness.connect(0, false).await;

        assert!(node
            .send_to_missing(Envelope::plain(Command::Q, 0), &[1])
            .await
            .is_err());
        node.send_to_missing(Envelope::plain(Command::Q, 0), &[1, 4])
            .await
            .unwrap();
        let got = Harness::recv_from(&harness.neighbors[1].1);
        assert_eq!(got.command, Command::Q);
        assert_eq!(node.total_messages(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_to_me_and_schedule_post_locally() {
        let harness = Harness::new(&[1]);
        let mut node = harness.connect(0, false).await;

        node.send_to_me(Envelope::plain(Command::Term, 0)).unwrap();
        node.schedule(Duration::from_millis(10), Envelope::trigger(Command::Request));

        let bytes = node.inbox_mut().recv().await.unwrap();
        assert_eq!(
            Envelope::from_bytes(&bytes).unwrap().command,
            Command::Term
        );
        let bytes = node.inbox_mut().recv().await.unwrap();
        let trigger = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(trigger.command, Command::Request);
        assert_eq!(trigger.sender, None);
        assert_eq!(node.total_messages(), 0);
    }
}
