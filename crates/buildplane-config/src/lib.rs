//! KDL configuration parsing for Buildplane.
//!
//! The server reads its system configuration (listen address, store
//! backend, worker stale interval, logging) from `buildplane.kdl`.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, LogFormat, LoggingConfig, ProvisionerConfig, ServerConfig, StoreBackend,
    SystemConfig, load_system_config, parse_system_config,
};
