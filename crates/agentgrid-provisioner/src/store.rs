//! The persisted-store contract the orchestrator depends on.

use agentgrid_core::{AgentType, AuditEntry, LlmProvider, Tenant, TenantStatus};
use agentgrid_state::{StateResult, StateStore};

/// Tenant records, the port ledger, catalog lookups and the audit log.
///
/// Calls are synchronous. `clear_port`, `record_port_allocation` for the
/// same tenant, and `release_port_allocation` are idempotent.
/// `release_port_allocation` only removes a row held by `tenant_id` and
/// reports whether it removed one.
pub trait TenantStore: Send + Sync {
    fn get_tenant(&self, id: &str) -> StateResult<Option<Tenant>>;
    fn update_status(&self, id: &str, status: TenantStatus) -> StateResult<()>;
    fn set_port(&self, id: &str, port: u16) -> StateResult<()>;
    fn clear_port(&self, id: &str) -> StateResult<()>;
    fn record_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<()>;
    fn release_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<bool>;
    fn list_allocated_ports(&self) -> StateResult<Vec<u16>>;
    fn get_agent_type(&self, id: &str) -> StateResult<Option<AgentType>>;
    fn get_llm_provider(&self, id: &str) -> StateResult<Option<LlmProvider>>;
    fn record_audit(&self, entry: &AuditEntry) -> StateResult<()>;
}

impl TenantStore for StateStore {
    fn get_tenant(&self, id: &str) -> StateResult<Option<Tenant>> {
        StateStore::get_tenant(self, id)
    }

    fn update_status(&self, id: &str, status: TenantStatus) -> StateResult<()> {
        StateStore::update_status(self, id, status).map(|_| ())
    }

    fn set_port(&self, id: &str, port: u16) -> StateResult<()> {
        StateStore::set_port(self, id, port)
    }

    fn clear_port(&self, id: &str) -> StateResult<()> {
        StateStore::clear_port(self, id)
    }

    fn record_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<()> {
        StateStore::record_port_allocation(self, port, tenant_id)
    }

    fn release_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<bool> {
        StateStore::release_port_allocation(self, port, tenant_id)
    }

    fn list_allocated_ports(&self) -> StateResult<Vec<u16>> {
        StateStore::list_allocated_ports(self)
    }

    fn get_agent_type(&self, id: &str) -> StateResult<Option<AgentType>> {
        StateStore::get_agent_type(self, id)
    }

    fn get_llm_provider(&self, id: &str) -> StateResult<Option<LlmProvider>> {
        StateStore::get_llm_provider(self, id)
    }

    fn record_audit(&self, entry: &AuditEntry) -> StateResult<()> {
        self.append_audit(entry)
    }
}
