// End-to-end runs over loopback UDP: a real coordinator and real workers,
// everything in one process with the workers as tasks. Every test uses its
// own port range so they can run in parallel.

use ambit::config::Config;
use ambit::coordinator::Coordinator;
use ambit::graph::Graph;
use ambit::node::{Node, NodeOps, RingNode};
use ambit_proto::bully::Bully;
use ambit_proto::count::Count;
use ambit_proto::election::AllTheWay;
use ambit_proto::flooding::Flooding;
use color_eyre::eyre::Report;
use std::time::Duration;

async fn coordinator(graph: Graph, base_port: u16) -> Coordinator {
    let mut config = Config::new(vec!["in-process".to_string()]);
    // port 0: an ephemeral coordinator port keeps parallel tests apart
    config.set_port(0).set_base_port(base_port).set_shell(true);
    Coordinator::new(config, graph)
        .await
        .expect("coordinator should bind")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn flooding_a_line_costs_two_messages() {
    let graph = Graph::line(vec![1, 2, 3]).unwrap();
    let mut coordinator = coordinator(graph, 43210).await;
    let back = coordinator.config().port();

    let workers: Vec<_> = coordinator
        .dns()
        .clone()
        .iter()
        .map(|(_, port)| {
            tokio::spawn(async move {
                let mut node = Node::connect("127.0.0.1", back, port, false).await?;
                let mut protocol = Flooding::new();
                ambit::protocol::run(&mut node, &mut protocol).await?;
                Ok::<u64, Report>(node.total_messages())
            })
        })
        .collect();

    coordinator.wait_for_ready().await.unwrap();
    coordinator.setup_clients().await.unwrap();
    coordinator.wakeup(1).unwrap();
    coordinator.wait_for_termination().await.unwrap();

    // 2m - (n - 1) = 2 * 2 - 2
    let total = coordinator.wait_for_number_of_messages().await.unwrap();
    assert_eq!(total, 2);

    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    coordinator.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn ring_count_reports_the_ring_size() {
    let graph = Graph::ring(vec![1, 2, 3, 4, 5]).unwrap();
    let mut coordinator = coordinator(graph, 43310).await;
    let back = coordinator.config().port();

    let workers: Vec<_> = coordinator
        .dns()
        .clone()
        .iter()
        .map(|(_, port)| {
            tokio::spawn(async move {
                let node = Node::connect("127.0.0.1", back, port, false).await?;
                let mut ring = RingNode::new(node)?;
                let mut protocol = Count::new();
                ambit::protocol::run(&mut ring, &mut protocol).await?;
                Ok::<u64, Report>(ring.total_messages())
            })
        })
        .collect();

    coordinator.wait_for_ready().await.unwrap();
    coordinator.setup_clients().await.unwrap();
    coordinator.wakeup(3).unwrap();
    coordinator.wait_for_termination().await.unwrap();

    // two messages per node: the counting leg plus the END wave
    let total = coordinator.wait_for_number_of_messages().await.unwrap();
    assert_eq!(total, 10);

    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    coordinator.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn synchronized_start_elects_a_leader() {
    let graph = Graph::ring(vec![3, 7, 1, 5, 2]).unwrap();
    let mut coordinator = coordinator(graph, 43410).await;
    let back = coordinator.config().port();

    let workers: Vec<_> = coordinator
        .dns()
        .clone()
        .iter()
        .map(|(_, port)| {
            tokio::spawn(async move {
                let node = Node::connect("127.0.0.1", back, port, false).await?;
                let mut ring = RingNode::new(node)?;
                let mut protocol = AllTheWay::new();
                ambit::protocol::run(&mut ring, &mut protocol).await?;
                Ok::<u64, Report>(ring.total_messages())
            })
        })
        .collect();

    coordinator.wait_for_ready().await.unwrap();
    coordinator.setup_clients().await.unwrap();
    coordinator.wakeup_all(1).unwrap();
    coordinator.wait_for_termination().await.unwrap();

    // every candidacy circulates the whole ring
    let total = coordinator.wait_for_number_of_messages().await.unwrap();
    assert!(total >= 25, "sent {} messages", total);

    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    coordinator.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn bully_terminates_on_a_complete_graph() {
    let graph = Graph::complete(0..5).unwrap();
    let mut coordinator = coordinator(graph, 43510).await;
    let back = coordinator.config().port();

    let workers: Vec<_> = coordinator
        .dns()
        .clone()
        .iter()
        .map(|(_, port)| {
            tokio::spawn(async move {
                let mut node = Node::connect("127.0.0.1", back, port, false).await?;
                let mut protocol = Bully::with_timeout(Duration::from_millis(300));
                ambit::protocol::run(&mut node, &mut protocol).await?;
                Ok::<u64, Report>(node.total_messages())
            })
        })
        .collect();

    coordinator.wait_for_ready().await.unwrap();
    coordinator.setup_clients().await.unwrap();
    coordinator.wakeup(0).unwrap();
    coordinator.wait_for_termination().await.unwrap();

    // the wakeup challenges everyone above it, and so on up the chain
    let total = coordinator.wait_for_number_of_messages().await.unwrap();
    assert!(total >= 8, "sent {} messages", total);

    for worker in workers {
        worker.await.unwrap().unwrap();
    }
    coordinator.close();
}
