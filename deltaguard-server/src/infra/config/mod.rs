pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{ConfigLoadError, ConfigLoader, ConfigLoaderOptions, compose_config};
pub use models::{Config, ConfigMetadata, DatabaseConfig, ServerConfig};
