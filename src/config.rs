use std::time::Duration;

use crate::constants::{DEFAULT_BACKLOG, DEFAULT_PORT};

/// Where and how the server listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host name or IP address to bind, e.g. `0.0.0.0` or `localhost`.
    pub bind_address: String,
    pub port: u16,
    /// Pending-connection queue length passed to `listen(2)`.
    pub backlog: u32,
    /// Draw a progress bar on stderr while tasks run.
    pub progress: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            progress: true,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Where a worker connects and how persistent it is.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_address: String,
    pub port: u16,
    /// Attempts made for each connection before giving up.
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// Execution failures in a row tolerated before the worker stops.
    pub max_consecutive_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_attempts: 1,
            retry_delay: Duration::from_secs(1),
            max_consecutive_failures: 3,
        }
    }
}

impl WorkerConfig {
    pub fn new(server_address: impl Into<String>, port: u16) -> Self {
        Self {
            server_address: server_address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_connect_attempts(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server_address, self.port)
    }
}
