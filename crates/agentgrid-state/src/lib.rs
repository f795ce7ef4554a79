//! agentgrid-state: embedded state store for agentgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds tenant records, the port
//! allocation ledger, the agent/provider catalog, and the audit log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Tenant mutations are read-modify-write inside a single write transaction,
//! so concurrent workflows for different tenants never clobber each other.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
