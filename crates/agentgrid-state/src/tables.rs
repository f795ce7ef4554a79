//! redb table definitions for the agentgrid state store.
//!
//! Values are JSON-serialized domain types from `agentgrid-core`.

use redb::TableDefinition;

/// Tenant records keyed by tenant id.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Port ledger keyed by host port. The durable source of truth for
/// which ports are occupied.
pub const PORT_ALLOCATIONS: TableDefinition<u16, &[u8]> = TableDefinition::new("port_allocations");

/// Agent type catalog keyed by agent type id.
pub const AGENT_TYPES: TableDefinition<&str, &[u8]> = TableDefinition::new("agent_types");

/// LLM provider catalog keyed by provider id.
pub const LLM_PROVIDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("llm_providers");

/// Audit entries keyed by a monotonically increasing sequence number.
pub const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
