use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use deltaguard_core::HubConfig;
use deltaguard_core::change_bus::ChangeBusConfig;
use deltaguard_core::multiplexer::MultiplexerConfig;
use deltaguard_core::runner::RunnerConfig;
use deltaguard_core::tailer::TailerConfig;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_DB_CONNECTIONS: u32 = 10;
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub progress_dir: PathBuf,
    pub runner: RunnerConfig,
    pub tailer: TailerConfig,
    pub bus: ChangeBusConfig,
    pub client: MultiplexerConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            bus: self.bus.clone(),
            tailer: self.tailer.clone(),
            runner: self.runner.clone(),
            ..HubConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dispatch_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// In-memory job store when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Where the configuration came from, for startup logging.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
