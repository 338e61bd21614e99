use crate::id::NodeId;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the coordinator subscriber: plain lines on standard output.
pub fn init_coordinator() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .try_init();
}

/// Installs the worker subscriber. With `shell` set, events go to standard
/// output; otherwise to `{exp_path}/{id}.out`, one event per line. Returns
/// the appender guard that must stay alive until the process exits so the
/// last lines get flushed.
pub fn init_worker(shell: bool, exp_path: &Path, id: NodeId) -> Option<WorkerGuard> {
    if shell {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .try_init();
        None
    } else {
        let appender = tracing_appender::rolling::never(exp_path, format!("{}.out", id));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
            .try_init();
        Some(guard)
    }
}
