// This module contains the coordinator: the process that launches one
// worker per vertex, hands each one its view of the topology, triggers
// wake-ups and drains the termination and accounting traffic.

use crate::command::{Command, VisualizerOutcome};
use crate::config::Config;
use crate::graph::{Graph, LocalDns};
use crate::id::NodeId;
use crate::inbox::Inbox;
use crate::message::{Envelope, Payload, Setup};
use crate::time::{experiment_dir_name, StartAt};
use crate::HashSet;
use crate::{log, warn};
use color_eyre::eyre::{bail, eyre, Report, WrapErr};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Child, Command as ProcessCommand};
use std::time::Duration;
use tokio::net::UdpSocket;

pub struct Coordinator {
    config: Config,
    graph: Graph,
    /// The port plan: vertex id to assigned listen port, in node order.
    dns: LocalDns,
    exp_path: PathBuf,
    visualizer_port: Option<u16>,
    inbox: Inbox,
    out: std::net::UdpSocket,
    children: Vec<Child>,
}

impl Coordinator {
    /// Binds the coordinator listener and lays out the port plan: one port
    /// per vertex from `base_port` in node order, the visualizer (when
    /// enabled) right after the last worker.
    pub async fn new(mut config: Config, graph: Graph) -> Result<Self, Report> {
        if !graph.is_connected() {
            warn!("[coordinator] the supplied graph is not connected");
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port()))
            .await
            .wrap_err_with(|| format!("error binding coordinator port {}", config.port()))?;
        config.set_port(socket.local_addr()?.port());
        let inbox = Inbox::listen(socket);
        let out = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .wrap_err("error binding outbound socket")?;

        let dns: LocalDns = graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, &node)| (node, config.base_port() + i as u16))
            .collect();

        let visualizer_port = if config.visualizer() {
            Some(config.base_port() + graph.node_count() as u16)
        } else {
            None
        };

        let exp_path = if config.shell() {
            PathBuf::new()
        } else {
            let path = config.log_root().join(experiment_dir_name());
            std::fs::create_dir_all(&path)
                .wrap_err_with(|| format!("error creating log directory {:?}", path))?;
            path
        };

        Ok(Self {
            config,
            graph,
            dns,
            exp_path,
            visualizer_port,
            inbox,
            out,
            children: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dns(&self) -> &LocalDns {
        &self.dns
    }

    pub fn visualizer_port(&self) -> Option<u16> {
        self.visualizer_port
    }

    pub fn number_of_nodes(&self) -> usize {
        self.graph.node_count()
    }

    /// Spawns one worker process per vertex, appending
    /// `(hostname, coordinator_port, listen_port)` to the configured worker
    /// command, then waits for a READY from every one of them.
    pub async fn initialize_clients(&mut self) -> Result<(), Report> {
        self.spawn_workers()?;
        self.wait_for_ready().await
    }

    pub fn spawn_workers(&mut self) -> Result<(), Report> {
        let (program, fixed_args) = self
            .config
            .worker_command()
            .split_first()
            .ok_or_else(|| eyre!("empty worker command"))?;
        for (_, port) in self.dns.clone().iter() {
            let child = ProcessCommand::new(program)
                .args(fixed_args)
                .arg(self.config.hostname())
                .arg(self.config.port().to_string())
                .arg(port.to_string())
                .spawn()
                .wrap_err_with(|| format!("error spawning worker {:?}", program))?;
            self.children.push(child);
        }
        Ok(())
    }

    /// Drains READY messages until every assigned port announced itself.
    pub async fn wait_for_ready(&mut self) -> Result<(), Report> {
        let mut ready: HashSet<u16> = HashSet::new();
        while ready.len() < self.number_of_nodes() {
            let message = self.next_message().await?;
            match (message.command, &message.payload) {
                (Command::Ready, Payload::Port { port }) => {
                    if ready.insert(*port) {
                        tracing::info!("{} is ready", port);
                    }
                }
                _ => bail!("unexpected message during initialization: {}", message),
            }
        }
        tracing::info!("all {} clients are ready", ready.len());
        Ok(())
    }

    /// Sends every vertex its SETUP (id, incident edges, local DNS, shell
    /// flag, log directory, visualizer port) and waits for all SOPs.
    pub async fn setup_clients(&mut self) -> Result<(), Report> {
        for (node, port) in self.dns.clone().iter() {
            let setup = Setup {
                id: node,
                edges: self.graph.incident_edges(node),
                local_dns: self.graph.local_dns(node, &self.dns),
                shell: self.config.shell(),
                exp_path: self.exp_path.to_string_lossy().into_owned(),
                visualizer_port: self.visualizer_port,
            };
            self.send(Envelope::setup(setup), port)?;
        }

        let mut acks = 0;
        while acks < self.number_of_nodes() {
            let message = self.next_message().await?;
            match message.command {
                Command::StartProtocol => {
                    acks += 1;
                    tracing::info!(
                        "{} started the protocol",
                        message.sender.unwrap_or_default()
                    );
                }
                _ => {
                    // not ours to consume yet
                    self.defer(&message).await?;
                }
            }
        }
        tracing::info!("all {} clients started the protocol", acks);
        Ok(())
    }

    /// Wakes a single vertex immediately.
    pub fn wakeup(&mut self, node: NodeId) -> Result<(), Report> {
        let port = self
            .dns
            .get(node)
            .ok_or_else(|| eyre!("unknown node {}", node))?;
        self.send(Envelope::wakeup(), port)
    }

    /// Schedules a synchronized start: every vertex receives the same
    /// absolute wall-clock instant, `delta_seconds` from now, and
    /// unsuspends together.
    pub fn wakeup_all(&mut self, delta_seconds: u64) -> Result<(), Report> {
        let at = StartAt::after(delta_seconds);
        for (_, port) in self.dns.clone().iter() {
            self.send(Envelope::start_at(at), port)?;
        }
        Ok(())
    }

    /// Drains the inbound queue until every vertex reported END_PROTOCOL.
    /// An ERROR from any worker triggers the failure broadcast and aborts;
    /// unrelated messages are re-queued rather than consumed.
    pub async fn wait_for_termination(&mut self) -> Result<(), Report> {
        let mut eop_received = 0;
        while eop_received < self.number_of_nodes() {
            let message = self.next_message().await?;
            match message.command {
                Command::EndProtocol => {
                    eop_received += 1;
                    log!(
                        "[coordinator] EOP {}/{}",
                        eop_received,
                        self.number_of_nodes()
                    );
                }
                Command::Error => {
                    let text = match message.payload {
                        Payload::Text { text } => text,
                        _ => String::new(),
                    };
                    tracing::error!("a node crashed with the following error: {}", text);
                    self.send_termination()?;
                    bail!("aborted after a worker failure: {}", text);
                }
                _ => self.defer(&message).await?,
            }
        }
        tracing::info!("received EOP from all nodes in the network");
        Ok(())
    }

    /// Drains one COUNT_M per vertex and returns the sum of the reported
    /// message counters.
    pub async fn wait_for_number_of_messages(&mut self) -> Result<u64, Report> {
        let mut counts_received = 0;
        let mut total = 0;
        while counts_received < self.number_of_nodes() {
            let message = self.next_message().await?;
            match (message.command, &message.payload) {
                (Command::CountM, Payload::Count { counter }) => {
                    counts_received += 1;
                    total += counter;
                }
                _ => self.defer(&message).await?,
            }
        }
        tracing::info!("total number of messages: {}", total);
        Ok(total)
    }

    /// Broadcasts ERROR to every worker; used on crash or user interrupt.
    pub fn send_termination(&mut self) -> Result<(), Report> {
        for (_, port) in self.dns.clone().iter() {
            self.send(Envelope::error(None, "node crash"), port)?;
        }
        Ok(())
    }

    /// Blocks until the visualizer reports how the visualization ended and
    /// reacts: an internal error tears the run down, an external error has
    /// already been handled through the regular ERROR path.
    pub async fn start_visualization(&mut self) -> Result<(), Report> {
        if self.visualizer_port.is_none() {
            bail!("enable the visualizer in the config to use this method");
        }
        loop {
            let message = self.next_message().await?;
            match message.payload {
                Payload::Status(VisualizerOutcome::Success) => {
                    tracing::info!("end of visualization");
                    return Ok(());
                }
                Payload::Status(VisualizerOutcome::InternalError) => {
                    self.send_termination()?;
                    bail!("visualizer failed internally");
                }
                Payload::Status(VisualizerOutcome::ExternalError) => {
                    // the worker failure is handled through the ERROR path
                    return Ok(());
                }
                Payload::Status(VisualizerOutcome::Continue) => continue,
                _ => self.defer(&message).await?,
            }
        }
    }

    /// Stops the listener. Worker processes terminate on their own.
    pub fn close(&mut self) {
        self.inbox.stop();
        self.children.clear();
    }

    fn send(&self, message: Envelope, port: u16) -> Result<(), Report> {
        self.out
            .send_to(&message.to_bytes()?, (self.config.hostname(), port))
            .wrap_err("error sending datagram")?;
        Ok(())
    }

    /// Receives the next decodable envelope.
    async fn next_message(&mut self) -> Result<Envelope, Report> {
        loop {
            let bytes = self.inbox.recv().await?;
            match Envelope::from_bytes(&bytes) {
                Ok(message) => return Ok(message),
                Err(e) => {
                    warn!("[coordinator] skipping undecodable datagram: {:?}", e);
                    continue;
                }
            }
        }
    }

    /// Puts a message that belongs to a later drain back at the tail.
    async fn defer(&self, message: &Envelope) -> Result<(), Report> {
        self.inbox.reinsert(message.to_bytes()?);
        // avoid spinning while the interesting message is still in flight
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(())
    }
}

impl fmt::Display for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "node | port")?;
        for (node, port) in self.dns.iter() {
            writeln!(f, "{:>4} | {}", node, port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeOps, WorkerNode};

    fn config(base_port: u16) -> Config {
        let mut config = Config::new(vec!["unused-worker".to_string()]);
        // port 0: bind an ephemeral port so parallel tests don't collide
        config.set_port(0).set_base_port(base_port).set_shell(true);
        config
    }

    async fn coordinator(base_port: u16) -> Coordinator {
        let graph = Graph::line(vec![1, 2, 3]).unwrap();
        Coordinator::new(config(base_port), graph).await.unwrap()
    }

    fn spawn_worker(back: u16, port: u16) -> tokio::task::JoinHandle<Node> {
        tokio::spawn(async move {
            let mut node = Node::connect("127.0.0.1", back, port, false)
                .await
                .unwrap();
            node.send_start_of_protocol().await.unwrap();
            node
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_completes_with_n_readies_and_n_sops() {
        let mut coordinator = coordinator(42110).await;
        let back = coordinator.config().port();

        let workers: Vec<_> = coordinator
            .dns()
            .clone()
            .iter()
            .map(|(_, port)| spawn_worker(back, port))
            .collect();

        coordinator.wait_for_ready().await.unwrap();
        coordinator.setup_clients().await.unwrap();

        for worker in workers {
            let node = worker.await.unwrap();
            // the middle node of the line has two neighbors
            if node.id() == 2 {
                assert_eq!(node.neighbors(), vec![1, 3]);
            } else {
                assert_eq!(node.neighbors().len(), 1);
            }
        }
        coordinator.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn termination_drain_requeues_unrelated_messages() {
        let mut coordinator = coordinator(42120).await;
        let back = coordinator.config().port();

        let workers: Vec<_> = coordinator
            .dns()
            .clone()
            .iter()
            .map(|(_, port)| spawn_worker(back, port))
            .collect();

        coordinator.wait_for_ready().await.unwrap();
        coordinator.setup_clients().await.unwrap();

        // every worker reports COUNT_M before EOP; the termination drain
        // must skip over the counts without consuming them
        for worker in workers {
            let mut node = worker.await.unwrap();
            node.send_total_messages().await.unwrap();
            node.send_end_of_protocol().await.unwrap();
            node.cleanup();
        }

        coordinator.wait_for_termination().await.unwrap();
        let total = coordinator.wait_for_number_of_messages().await.unwrap();
        assert_eq!(total, 0);
        coordinator.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_worker_error_aborts_the_drain() {
        let mut coordinator = coordinator(42130).await;
        let back = coordinator.config().port();

        let workers: Vec<_> = coordinator
            .dns()
            .clone()
            .iter()
            .map(|(_, port)| spawn_worker(back, port))
            .collect();

        coordinator.wait_for_ready().await.unwrap();
        coordinator.setup_clients().await.unwrap();

        let mut nodes = Vec::new();
        for worker in workers {
            nodes.push(worker.await.unwrap());
        }
        nodes[0]
            .send_error("fatal error in node 1: boom".to_string())
            .await
            .unwrap();

        let result = coordinator.wait_for_termination().await;
        assert!(result.is_err());

        // the failure broadcast reached the still-listening workers
        let bytes = nodes[1].inbox_mut().recv().await.unwrap();
        let message = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(message.command, Command::Error);
        coordinator.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn port_plan_follows_node_order() {
        let coordinator = coordinator(42140).await;
        let plan: Vec<_> = coordinator.dns().iter().collect();
        assert_eq!(plan, vec![(1, 42140), (2, 42141), (3, 42142)]);
        assert!(coordinator.visualizer_port().is_none());
    }
}
