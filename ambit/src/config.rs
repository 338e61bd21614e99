use std::path::PathBuf;

/// Reference ports: workers bind a contiguous range starting at
/// `DEFAULT_BASE_PORT`; the coordinator listens on `DEFAULT_COORDINATOR_PORT`;
/// the visualizer, when enabled, takes the port right after the last worker.
pub const DEFAULT_COORDINATOR_PORT: u16 = 65000;
pub const DEFAULT_BASE_PORT: u16 = 65432;

/// Maximum datagram size, on both sides.
pub const BUFFER_SIZE: usize = 4096;

/// Run configuration shared by the coordinator and, through SETUP, the
/// workers.
#[derive(Debug, Clone)]
pub struct Config {
    hostname: String,
    port: u16,
    base_port: u16,
    shell: bool,
    log_root: PathBuf,
    visualizer: bool,
    worker_command: Vec<String>,
}

impl Config {
    /// Creates a config with the reference ports. `worker_command` is the
    /// program (plus fixed leading arguments) used to spawn each worker; the
    /// coordinator appends `(hostname, coordinator_port, listen_port)`.
    pub fn new(worker_command: Vec<String>) -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: DEFAULT_COORDINATOR_PORT,
            base_port: DEFAULT_BASE_PORT,
            shell: true,
            log_root: PathBuf::from("logs"),
            visualizer: false,
            worker_command,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// True when workers log to standard output instead of per-worker files.
    pub fn shell(&self) -> bool {
        self.shell
    }

    pub fn log_root(&self) -> &PathBuf {
        &self.log_root
    }

    pub fn visualizer(&self) -> bool {
        self.visualizer
    }

    pub fn worker_command(&self) -> &[String] {
        &self.worker_command
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = hostname.into();
        self
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn set_base_port(&mut self, base_port: u16) -> &mut Self {
        self.base_port = base_port;
        self
    }

    pub fn set_shell(&mut self, shell: bool) -> &mut Self {
        self.shell = shell;
        self
    }

    pub fn set_log_root(&mut self, log_root: impl Into<PathBuf>) -> &mut Self {
        self.log_root = log_root.into();
        self
    }

    pub fn set_visualizer(&mut self, visualizer: bool) -> &mut Self {
        self.visualizer = visualizer;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_ports() {
        let config = Config::new(vec!["worker".to_string()]);
        assert_eq!(config.port(), 65000);
        assert_eq!(config.base_port(), 65432);
        assert!(config.shell());
        assert!(!config.visualizer());
    }

    #[test]
    fn setters_chain() {
        let mut config = Config::new(vec!["worker".to_string()]);
        config.set_shell(false).set_base_port(50000).set_visualizer(true);
        assert!(!config.shell());
        assert_eq!(config.base_port(), 50000);
        assert!(config.visualizer());
    }
}
