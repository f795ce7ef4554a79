pub mod config;
pub mod types;

pub use config::{BreakerSettings, ConfigError, GridConfig};
pub use types::*;
