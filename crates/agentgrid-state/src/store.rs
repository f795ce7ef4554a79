//! StateStore: redb-backed state persistence for agentgrid.
//!
//! Provides typed operations over tenants, the port ledger, the catalog,
//! and the audit log. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use agentgrid_core::*;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TENANTS).map_err(map_err!(Table))?;
        txn.open_table(PORT_ALLOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(AGENT_TYPES).map_err(map_err!(Table))?;
        txn.open_table(LLM_PROVIDERS).map_err(map_err!(Table))?;
        txn.open_table(AUDIT_LOG).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Insert or update a tenant record.
    pub fn put_tenant(&self, tenant: &Tenant) -> StateResult<()> {
        self.put_str_keyed(TENANTS, &tenant.id, tenant)?;
        debug!(tenant_id = %tenant.id, "tenant stored");
        Ok(())
    }

    /// Get a tenant by id.
    pub fn get_tenant(&self, id: &str) -> StateResult<Option<Tenant>> {
        self.get_str_keyed(TENANTS, id)
    }

    /// List all tenants.
    pub fn list_tenants(&self) -> StateResult<Vec<Tenant>> {
        self.list_str_keyed(TENANTS)
    }

    /// Number of tenants in a status that counts toward capacity.
    pub fn count_active_tenants(&self) -> StateResult<usize> {
        Ok(self
            .list_tenants()?
            .iter()
            .filter(|t| t.status.counts_toward_capacity())
            .count())
    }

    /// Set a tenant's status, stamping suspension/cancellation times.
    pub fn update_status(&self, id: &str, status: TenantStatus) -> StateResult<Tenant> {
        let tenant = self.modify_tenant(id, |t| {
            t.status = status;
            match status {
                TenantStatus::Suspended => t.suspended_at = Some(epoch_secs()),
                TenantStatus::Cancelled => t.cancelled_at = Some(epoch_secs()),
                TenantStatus::Active => t.suspended_at = None,
                _ => {}
            }
        })?;
        debug!(tenant_id = %id, %status, "tenant status updated");
        Ok(tenant)
    }

    /// Record the host port bound to a tenant.
    pub fn set_port(&self, id: &str, port: u16) -> StateResult<()> {
        self.modify_tenant(id, |t| t.container_port = Some(port))?;
        Ok(())
    }

    /// Clear the tenant's port. Clearing an already-empty port is a no-op.
    pub fn clear_port(&self, id: &str) -> StateResult<()> {
        self.modify_tenant(id, |t| t.container_port = None)?;
        Ok(())
    }

    /// Delete a tenant by id. Returns true if it existed.
    pub fn delete_tenant(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a tenant inside one write transaction.
    fn modify_tenant<F>(&self, id: &str, f: F) -> StateResult<Tenant>
    where
        F: FnOnce(&mut Tenant),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let tenant = {
            let mut table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            let bytes = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => guard.value().to_vec(),
                None => return Err(StateError::NotFound(format!("tenant {id}"))),
            };
            let mut tenant: Tenant =
                serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            f(&mut tenant);
            tenant.updated_at = epoch_secs();
            let value = serde_json::to_vec(&tenant).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
            tenant
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(tenant)
    }

    // ── Port ledger ────────────────────────────────────────────────

    /// Record that `port` belongs to `tenant_id`.
    ///
    /// Re-recording the same pair is a no-op; recording a port held by a
    /// different tenant is a `Conflict`.
    pub fn record_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PORT_ALLOCATIONS).map_err(map_err!(Table))?;
            let existing = match table.get(port).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<PortAllocation>(guard.value())
                        .map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            match existing {
                Some(row) if row.tenant_id == tenant_id => {
                    debug!(port, %tenant_id, "port allocation already recorded");
                    return Ok(());
                }
                Some(row) => {
                    return Err(StateError::Conflict(format!(
                        "port {port} already allocated to {}",
                        row.tenant_id
                    )));
                }
                None => {}
            }
            let row = PortAllocation {
                port,
                tenant_id: tenant_id.to_string(),
                allocated_at: epoch_secs(),
            };
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(port, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(port, %tenant_id, "port allocation recorded");
        Ok(())
    }

    /// Remove a port from the ledger if `tenant_id` holds it. Returns true
    /// if a row was removed; a row held by another tenant is left alone.
    pub fn release_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(PORT_ALLOCATIONS).map_err(map_err!(Table))?;
            let holder = match table.get(port).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice::<PortAllocation>(guard.value())
                        .map_err(map_err!(Deserialize))?
                        .tenant_id,
                ),
                None => None,
            };
            released = match holder {
                Some(holder) if holder == tenant_id => {
                    table.remove(port).map_err(map_err!(Write))?;
                    true
                }
                Some(holder) => {
                    warn!(port, %tenant_id, %holder, "port held by another tenant, not released");
                    false
                }
                None => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(port, %tenant_id, released, "port allocation released");
        Ok(released)
    }

    /// All ports currently in the ledger, ascending.
    pub fn list_allocated_ports(&self) -> StateResult<Vec<u16>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORT_ALLOCATIONS).map_err(map_err!(Table))?;
        let mut ports = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ports.push(key.value());
        }
        Ok(ports)
    }

    /// Full ledger rows, ascending by port.
    pub fn list_port_allocations(&self) -> StateResult<Vec<PortAllocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PORT_ALLOCATIONS).map_err(map_err!(Table))?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            rows.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(rows)
    }

    // ── Catalog ────────────────────────────────────────────────────

    /// Insert the default agent types and providers that are not yet present.
    pub fn seed_catalog(&self) -> StateResult<()> {
        let mut seeded = 0usize;
        for agent in default_agent_types() {
            if self.get_str_keyed::<AgentType>(AGENT_TYPES, &agent.id)?.is_none() {
                self.put_agent_type(&agent)?;
                seeded += 1;
            }
        }
        for provider in default_llm_providers() {
            if self
                .get_str_keyed::<LlmProvider>(LLM_PROVIDERS, &provider.id)?
                .is_none()
            {
                self.put_llm_provider(&provider)?;
                seeded += 1;
            }
        }
        debug!(seeded, "catalog seeded");
        Ok(())
    }

    pub fn put_agent_type(&self, agent: &AgentType) -> StateResult<()> {
        self.put_str_keyed(AGENT_TYPES, &agent.id, agent)
    }

    /// Get an active agent type by id.
    pub fn get_agent_type(&self, id: &str) -> StateResult<Option<AgentType>> {
        Ok(self
            .get_str_keyed::<AgentType>(AGENT_TYPES, id)?
            .filter(|a| a.is_active))
    }

    /// List active agent types.
    pub fn list_agent_types(&self) -> StateResult<Vec<AgentType>> {
        let mut agents: Vec<AgentType> = self.list_str_keyed(AGENT_TYPES)?;
        agents.retain(|a| a.is_active);
        Ok(agents)
    }

    pub fn put_llm_provider(&self, provider: &LlmProvider) -> StateResult<()> {
        self.put_str_keyed(LLM_PROVIDERS, &provider.id, provider)
    }

    /// Get an active LLM provider by id.
    pub fn get_llm_provider(&self, id: &str) -> StateResult<Option<LlmProvider>> {
        Ok(self
            .get_str_keyed::<LlmProvider>(LLM_PROVIDERS, id)?
            .filter(|p| p.is_active))
    }

    /// List active LLM providers.
    pub fn list_llm_providers(&self) -> StateResult<Vec<LlmProvider>> {
        let mut providers: Vec<LlmProvider> = self.list_str_keyed(LLM_PROVIDERS)?;
        providers.retain(|p| p.is_active);
        Ok(providers)
    }

    // ── Audit ──────────────────────────────────────────────────────

    /// Append an audit entry.
    pub fn append_audit(&self, entry: &AuditEntry) -> StateResult<()> {
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(AUDIT_LOG).map_err(map_err!(Table))?;
            let next = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(0);
            table
                .insert(next, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Audit entries for one tenant, oldest first.
    pub fn list_audit_for_tenant(&self, tenant_id: &str) -> StateResult<Vec<AuditEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT_LOG).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let audit: AuditEntry =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if audit.tenant_id == tenant_id {
                results.push(audit);
            }
        }
        Ok(results)
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_str_keyed<T: Serialize>(
        &self,
        def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_str_keyed<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_str_keyed<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&str, &[u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }
}
