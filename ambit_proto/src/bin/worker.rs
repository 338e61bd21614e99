use ambit::logger;
use ambit::node::{Node, NodeOps, RingNode, WorkerNode};
use ambit::protocol::{Protocol, RunOutcome};
use ambit_proto::bully::Bully;
use ambit_proto::count::Count;
use ambit_proto::dft::Dft;
use ambit_proto::election::{AllTheWay, AsFar, ControlledDistance};
use ambit_proto::flooding::Flooding;
use ambit_proto::mutex::{Lamport, Ricart};
use ambit_proto::shout::Shout;
use ambit_proto::ProtocolKind;
use clap::Parser;
use color_eyre::eyre::{bail, Report};

/// One worker process: one vertex of the overlay.
#[derive(Parser, Debug)]
#[command(name = "worker")]
struct Args {
    /// Protocol to run (e.g. flooding, count, all-the-way, bully, lamport)
    protocol: String,

    /// Host the coordinator runs on
    hostname: String,

    /// Port the coordinator listens on
    coordinator_port: u16,

    /// Port this worker listens on
    listen_port: u16,

    /// Force per-sender FIFO mode on (the mutual-exclusion protocols
    /// enable it on their own)
    #[arg(long)]
    fifo: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("error installing the error handler: {:?}", e);
    }
    let args = Args::parse();
    match run(args).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            eprintln!("worker failed: {:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<RunOutcome, Report> {
    let kind: ProtocolKind = args.protocol.parse()?;
    let fifo = args.fifo || kind.fifo_required();

    let node = Node::connect(
        args.hostname.as_str(),
        args.coordinator_port,
        args.listen_port,
        fifo,
    )
    .await?;
    let _guard = logger::init_worker(node.shell(), node.exp_path(), node.id());
    node.print_info();

    match kind {
        ProtocolKind::Flooding => drive(node, Flooding::new()).await,
        ProtocolKind::Dft => drive(node, Dft::new()).await,
        ProtocolKind::Shout => drive(node, Shout::new()).await,
        ProtocolKind::Bully => drive(node, Bully::new()).await,
        ProtocolKind::Lamport => drive(node, Lamport::new()).await,
        ProtocolKind::Ricart => drive(node, Ricart::new()).await,
        ProtocolKind::Count => drive(ring(node).await?, Count::new()).await,
        ProtocolKind::AllTheWay => drive(ring(node).await?, AllTheWay::new()).await,
        ProtocolKind::AsFar => drive(ring(node).await?, AsFar::new()).await,
        ProtocolKind::ControlledDistance => {
            drive(ring(node).await?, ControlledDistance::new()).await
        }
    }
}

async fn drive<N, P>(mut node: N, mut protocol: P) -> Result<RunOutcome, Report>
where
    N: WorkerNode,
    P: Protocol<N>,
{
    ambit::protocol::run(&mut node, &mut protocol).await
}

/// Converts to a ring worker, reporting a bad topology to the coordinator
/// before giving up.
async fn ring(mut node: Node) -> Result<RingNode, Report> {
    let neighbors = node.neighbors().len();
    if neighbors != 2 {
        let text = format!(
            "fatal error in node {}: ring protocol on a node with {} neighbors",
            node.id(),
            neighbors
        );
        node.send_error(text.clone()).await?;
        node.cleanup();
        bail!(text);
    }
    RingNode::new(node)
}
