use once_cell::sync::Lazy;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use deltaguard_core::change_bus::ChangeBusConfig;
use deltaguard_core::multiplexer::MultiplexerConfig;
use deltaguard_core::progress_log::DEFAULT_PROGRESS_DIR;
use deltaguard_core::runner::{RunnerConfig, ScannerMode};
use deltaguard_core::tailer::TailerConfig;

use super::{
    models::{
        Config, ConfigMetadata, DEFAULT_DISPATCH_INTERVAL, DEFAULT_HOST,
        DEFAULT_MAX_DB_CONNECTIONS, DEFAULT_PORT, DatabaseConfig, ServerConfig,
    },
    sources::{EnvConfig, FileConfig},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("deltaguard.toml"),
        PathBuf::from("config/deltaguard.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, then the TOML file, then environment variables.
    /// Environment values win over the file.
    pub fn load(&self) -> Result<Config, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env = EnvConfig::gather();
        let (file, config_path) = self.load_file_config(&env)?;

        let mut config = compose_config(file.unwrap_or_default(), env)?;
        config.metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };
        Ok(config)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = match (&self.options.config_path, &env.config_path) {
            (Some(path), _) | (None, Some(path)) => (Some(path.clone()), true),
            (None, None) => (
                DEFAULT_CONFIG_LOCATIONS
                    .iter()
                    .find(|candidate| candidate.exists())
                    .cloned(),
                false,
            ),
        };

        let Some(path) = path else {
            return Ok((None, None));
        };
        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file = read_file_config(&path)?;
        Ok((Some(file), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merges file and environment values over the defaults.
pub fn compose_config(
    file: FileConfig,
    env: EnvConfig,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        server: file_server,
        database: file_database,
        progress: file_progress,
        scanner: file_scanner,
        bus: file_bus,
        client: file_client,
    } = file;

    let server = ServerConfig {
        host: env
            .server_host
            .or(file_server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(DEFAULT_PORT),
        dispatch_interval: parse_duration(
            "server.dispatch_interval",
            file_server.dispatch_interval,
        )?
        .unwrap_or(DEFAULT_DISPATCH_INTERVAL),
    };

    let database = DatabaseConfig {
        url: env.database_url.or(file_database.url),
        max_connections: file_database
            .max_connections
            .unwrap_or(DEFAULT_MAX_DB_CONNECTIONS),
    };

    let runner_defaults = RunnerConfig::default();
    let mode = match env.scanner_mode.or(file_scanner.mode) {
        Some(raw) => raw
            .parse::<ScannerMode>()
            .map_err(|reason| ConfigLoadError::InvalidScannerMode { reason })?,
        None => runner_defaults.mode,
    };
    let runner = RunnerConfig {
        mode,
        program: env
            .scanner_path
            .or(file_scanner.path)
            .unwrap_or(runner_defaults.program),
        docker_image: env
            .scanner_image
            .or(file_scanner.image)
            .unwrap_or(runner_defaults.docker_image),
        uploads_dir: env
            .uploads_dir
            .or(file_scanner.uploads_dir)
            .unwrap_or(runner_defaults.uploads_dir),
        report_dir: env.reports_dir.or(file_scanner.reports_dir),
        use_progress: env
            .scanner_use_progress
            .or(file_scanner.use_progress)
            .unwrap_or(runner_defaults.use_progress),
        grace_period: parse_duration("scanner.grace_period", file_scanner.grace_period)?
            .unwrap_or(runner_defaults.grace_period),
        mirror_interval: runner_defaults.mirror_interval,
    };

    let tailer_defaults = TailerConfig::default();
    let tailer = TailerConfig {
        interval: parse_duration("progress.tail_interval", file_progress.tail_interval)?
            .unwrap_or(tailer_defaults.interval),
        backlog: file_progress.backlog.unwrap_or(tailer_defaults.backlog),
        ..tailer_defaults
    };

    let bus_defaults = ChangeBusConfig::default();
    let bus = ChangeBusConfig {
        poll_interval: parse_duration("bus.poll_interval", file_bus.poll_interval)?
            .unwrap_or(bus_defaults.poll_interval),
        poll_limit: file_bus.poll_limit.unwrap_or(bus_defaults.poll_limit),
    };

    let client = MultiplexerConfig {
        max_open: env
            .max_streams
            .or(file_client.max_streams)
            .unwrap_or(MultiplexerConfig::default().max_open),
    };

    Ok(Config {
        server,
        database,
        progress_dir: env
            .progress_dir
            .or(file_progress.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRESS_DIR)),
        runner,
        tailer,
        bus,
        client,
        metadata: ConfigMetadata::default(),
    })
}

fn parse_duration(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|value| {
        humantime::parse_duration(value.trim()).map_err(|source| {
            ConfigLoadError::InvalidDuration {
                field,
                value,
                source,
            }
        })
    })
    .transpose()
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid scanner mode: {reason}")]
    InvalidScannerMode { reason: String },
    #[error("failed to load .env file")]
    EnvFile(#[from] dotenvy::Error),
}
