//! agentgrid-proxy: public hostname registration for tenant containers.
//!
//! Each active tenant is reachable at `<tenant-id>.<base-domain>`. This
//! crate registers and removes those hostnames with the reverse proxy
//! in front of the host.
//!
//! # Components
//!
//! - **`HostRegistrar`**: the contract the orchestrator calls
//! - **`caddy`**: implementation against the Caddy admin API

use async_trait::async_trait;

pub mod caddy;
pub mod error;

pub use caddy::{CaddyRegistrar, Route};
pub use error::{ProxyError, ProxyResult};

/// Registers public hostnames with a reverse proxy.
#[async_trait]
pub trait HostRegistrar: Send + Sync {
    /// Route `hostname` to `target` (`host:port`).
    async fn add_host(&self, hostname: &str, target: &str) -> ProxyResult<()>;

    /// Remove the route for `hostname`. Fails with `RouteNotFound` if absent.
    async fn remove_host(&self, hostname: &str) -> ProxyResult<()>;
}
