use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub progress: FileProgressConfig,
    #[serde(default)]
    pub scanner: FileScannerConfig,
    #[serde(default)]
    pub bus: FileBusConfig,
    #[serde(default)]
    pub client: FileClientConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// How often queued jobs are picked up, e.g. `"5s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_interval: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileProgressConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backlog: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileScannerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploads_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_progress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBusConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_limit: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_streams: Option<usize>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub progress_dir: Option<PathBuf>,
    pub uploads_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub scanner_mode: Option<String>,
    pub scanner_path: Option<PathBuf>,
    pub scanner_image: Option<String>,
    pub scanner_use_progress: Option<bool>,
    pub max_streams: Option<usize>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("DELTAGUARD_CONFIG").map(PathBuf::from),
            server_host: non_empty_var("SERVER_HOST"),
            server_port: non_empty_var("SERVER_PORT").and_then(|s| s.parse().ok()),
            database_url: non_empty_var("DATABASE_URL"),
            progress_dir: non_empty_var("PROGRESS_DIR").map(PathBuf::from),
            uploads_dir: non_empty_var("UPLOADS_DIR").map(PathBuf::from),
            reports_dir: non_empty_var("REPORTS_DIR").map(PathBuf::from),
            scanner_mode: non_empty_var("SCANNER_MODE"),
            scanner_path: non_empty_var("SCANNER_PATH").map(PathBuf::from),
            scanner_image: non_empty_var("SCANNER_IMAGE"),
            scanner_use_progress: parse_bool_var("SCANNER_USE_PROGRESS"),
            max_streams: non_empty_var("DELTAGUARD_MAX_STREAMS").and_then(|s| s.parse().ok()),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|raw| parse_bool(&raw))
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [scanner]
            mode = "docker"
            grace_period = "3s"
            "#,
        )
        .unwrap();
        assert_eq!(file.server.port, Some(9000));
        assert_eq!(file.server.host, None);
        assert_eq!(file.scanner.mode.as_deref(), Some("docker"));
        assert_eq!(file.scanner.grace_period.as_deref(), Some("3s"));
        assert!(file.database.url.is_none());
    }

    #[test]
    fn bool_spellings() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
