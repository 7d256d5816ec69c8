//! System configuration parsing.
//!
//! ```kdl
//! server {
//!     listen "0.0.0.0:3000"
//! }
//! database "postgres" {
//!     url "postgres://buildplane@127.0.0.1:5432/buildplane"
//!     max-connections 10
//! }
//! provisioner {
//!     stale-interval-seconds 90
//! }
//! logging level="info" format="json"
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Heartbeat age after which a worker no longer counts as live.
pub const DEFAULT_STALE_INTERVAL: Duration = Duration::from_secs(90);

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub provisioner: ProvisionerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    pub stale_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            stale_interval: DEFAULT_STALE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text. Absent sections keep their
/// defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => parse_server(node, &mut config.server)?,
            "database" => parse_database(node, &mut config.database)?,
            "provisioner" => parse_provisioner(node, &mut config.provisioner)?,
            "logging" => parse_logging(node, &mut config.logging)?,
            _ => {} // Ignore unknown nodes
        }
    }

    if config.database.backend == StoreBackend::Postgres && config.database.url.is_none() {
        return Err(ConfigError::MissingField("database url".to_string()));
    }

    Ok(config)
}

fn parse_server(node: &KdlNode, server: &mut ServerConfig) -> ConfigResult<()> {
    for child in children(node) {
        if child.name().value() == "listen" {
            let listen = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField("server listen".to_string()))?;
            server.listen = listen.parse().map_err(|e| ConfigError::InvalidValue {
                field: "server listen".to_string(),
                message: format!("{e}"),
            })?;
        }
    }
    Ok(())
}

fn parse_database(node: &KdlNode, database: &mut DatabaseConfig) -> ConfigResult<()> {
    if let Some(backend) = get_first_string_arg(node) {
        database.backend = match backend.as_str() {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "database backend".to_string(),
                    message: format!("unknown backend: {other}"),
                });
            }
        };
    }
    for child in children(node) {
        match child.name().value() {
            "url" => database.url = get_first_string_arg(child),
            "max-connections" | "max_connections" => {
                database.max_connections = get_first_int_arg(child, "database max-connections")?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_provisioner(node: &KdlNode, provisioner: &mut ProvisionerConfig) -> ConfigResult<()> {
    for child in children(node) {
        if matches!(
            child.name().value(),
            "stale-interval-seconds" | "stale_interval_seconds"
        ) {
            let seconds: u64 = get_first_int_arg(child, "provisioner stale-interval-seconds")?;
            if seconds == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "provisioner stale-interval-seconds".to_string(),
                    message: "must be positive".to_string(),
                });
            }
            provisioner.stale_interval = Duration::from_secs(seconds);
        }
    }
    Ok(())
}

fn parse_logging(node: &KdlNode, logging: &mut LoggingConfig) -> ConfigResult<()> {
    if let Some(level) = get_string_prop(node, "level") {
        logging.level = level;
    }
    if let Some(format) = get_string_prop(node, "format") {
        logging.format = match format.as_str() {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "logging format".to_string(),
                    message: format!("unknown format: {other}"),
                });
            }
        };
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg<T: TryFrom<i128>>(node: &KdlNode, field: &str) -> ConfigResult<T> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    T::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{value} is out of range"),
    })
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            server {
                listen "127.0.0.1:8080"
            }
            database "postgres" {
                url "postgres://buildplane@localhost/buildplane"
                max-connections 20
            }
            provisioner {
                stale-interval-seconds 30
            }
            logging level="debug" format="json"
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.database.backend, StoreBackend::Postgres);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.provisioner.stale_interval, Duration::from_secs(30));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.database.backend, StoreBackend::Memory);
        assert_eq!(config.provisioner.stale_interval, DEFAULT_STALE_INTERVAL);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_postgres_requires_url() {
        let result = parse_system_config(r#"database "postgres""#);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let result = parse_system_config(r#"database "sqlite""#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_rejects_zero_stale_interval() {
        let kdl = r#"
            provisioner {
                stale-interval-seconds 0
            }
        "#;
        assert!(parse_system_config(kdl).is_err());
    }
}
