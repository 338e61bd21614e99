use ambit::config::Config;
use ambit::coordinator::Coordinator;
use ambit::graph::Graph;
use ambit::logger;
use ambit_proto::ProtocolKind;
use clap::Parser;
use color_eyre::eyre::{bail, Report};
use std::path::PathBuf;
use tracing::info;

/// The coordinator: spawns one worker per vertex, wires the overlay, wakes
/// it up and collects the results.
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
struct Args {
    /// Graph file: first line the node count, then one edge per line
    graph: PathBuf,

    /// Protocol the workers run
    protocol: String,

    /// Path to the worker binary
    #[arg(long, default_value = "target/debug/worker")]
    worker: String,

    /// Wake exactly this vertex
    #[arg(long)]
    wakeup: Option<u64>,

    /// Wake every vertex at now + this many seconds
    #[arg(long, conflicts_with = "wakeup")]
    wakeup_all: Option<u64>,

    /// Write per-worker log files under this directory instead of letting
    /// workers print to their stdout
    #[arg(long)]
    logs: Option<PathBuf>,

    /// Mirror all node-to-node traffic to a visualizer port
    #[arg(long)]
    visualizer: bool,

    /// Coordinator listen port
    #[arg(long, default_value_t = ambit::config::DEFAULT_COORDINATOR_PORT)]
    port: u16,

    /// First worker port; workers bind a contiguous range from here
    #[arg(long, default_value_t = ambit::config::DEFAULT_BASE_PORT)]
    base_port: u16,
}

#[tokio::main]
async fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("error installing the error handler: {:?}", e);
    }
    logger::init_coordinator();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("coordinator failed: {:?}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Report> {
    let kind: ProtocolKind = args.protocol.parse()?;
    let graph = Graph::from_file(&args.graph)?;
    info!(
        "{}: {} nodes, {} edges",
        args.graph.display(),
        graph.node_count(),
        graph.edge_count()
    );

    let mut config = Config::new(vec![args.worker.clone(), kind.name().to_string()]);
    config.set_port(args.port).set_base_port(args.base_port);
    config.set_visualizer(args.visualizer);
    if let Some(logs) = &args.logs {
        config.set_shell(false).set_log_root(logs.clone());
    }

    let mut coordinator = Coordinator::new(config, graph).await?;
    info!("\n{}", coordinator);

    coordinator.initialize_clients().await?;
    coordinator.setup_clients().await?;

    // the mutual-exclusion workloads start themselves; everything else
    // needs a wake-up
    match (args.wakeup, args.wakeup_all, kind.fifo_required()) {
        (_, _, true) => {}
        (Some(node), None, false) => coordinator.wakeup(node)?,
        (None, Some(delta), false) => coordinator.wakeup_all(delta)?,
        (None, None, false) => bail!("{} needs --wakeup <id> or --wakeup-all <seconds>", kind),
        (Some(_), Some(_), false) => unreachable!("clap rejects the combination"),
    }

    let drained = tokio::select! {
        result = drain(&mut coordinator) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match drained {
        Some(result) => result,
        None => {
            info!("interrupted, broadcasting the failure");
            coordinator.send_termination()
        }
    };
    coordinator.close();
    result
}

async fn drain(coordinator: &mut Coordinator) -> Result<(), Report> {
    coordinator.wait_for_termination().await?;
    let total = coordinator.wait_for_number_of_messages().await?;
    info!("run complete, {} messages exchanged", total);
    Ok(())
}
