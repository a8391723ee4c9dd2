use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub database_url: String,
    /// Bearer secret. `None` disables authentication.
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_size_mb: usize,
    /// Seconds in-flight requests get to finish once a shutdown signal arrives.
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn max_body_size_bytes(&self) -> usize {
        self.max_body_size_mb * 1024 * 1024
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5499,
            max_body_size_mb: 10,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Sizing and timing of the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrently leased connections
    pub max_size: usize,
    /// Open every connection up front instead of on first use
    pub eager: bool,
    /// How long `acquire` waits for a free connection
    pub acquire_timeout: Duration,
    /// How long `close` waits for outstanding leases before closing anyway
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 3,
            eager: false,
            acquire_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
