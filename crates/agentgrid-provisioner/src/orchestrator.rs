//! Provisioning orchestrator: drives the tenant lifecycle.
//!
//! ```text
//! pending --provision--> provisioning --success--> active
//! provisioning --any failure--> pending   (full rollback)
//! active --suspend--> suspended --resume--> active
//! any --terminate--> cancelled
//! ```
//!
//! Each provisioning step that leaves something behind pushes its undo
//! onto a [`CompensationStack`]. A failure (or cancellation) at any later
//! step unwinds that stack before the original error is returned.
//!
//! The orchestrator does not serialize work per tenant. Callers must not
//! run two workflows for the same tenant at once.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agentgrid_breaker::{BreakerConfig, BreakerError, BreakerStats, CircuitBreaker};
use agentgrid_core::{AgentType, AuditEntry, GridConfig, LlmProvider, Tenant, TenantStatus, epoch_secs};
use agentgrid_proxy::HostRegistrar;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compensation::CompensationStack;
use crate::error::{ProvisionError, ProvisionResult, Step};
use crate::ports::PortAllocator;
use crate::render::{DescriptorConfig, WorkloadRenderer, gateway_token_key};
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::store::TenantStore;
use crate::validation::{BotInfo, TokenValidator, ValidationFailure};

/// Name of the breaker guarding bot-token validation.
pub const VALIDATION_BREAKER: &str = "bot-token-validation";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Tenants are published as `<id>.<base_domain>`.
    pub base_domain: String,
    /// Host the reverse proxy reaches tenant ports on.
    pub upstream_host: String,
    /// Bound on each container-runtime call and each compensation action.
    pub step_timeout: Duration,
    pub validation_timeout: Duration,
    pub gateway_token_prefix: String,
    /// Provider credentials keyed by `env_key`.
    pub provider_keys: HashMap<String, String>,
    pub breaker: BreakerConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            base_domain: config.base_domain.clone(),
            upstream_host: "localhost".to_string(),
            step_timeout: config.runtime_timeout(),
            validation_timeout: config.validation_timeout(),
            gateway_token_prefix: config.gateway_token_prefix.clone(),
            provider_keys: config.provider_keys.clone(),
            breaker: BreakerConfig {
                max_failures: config.breaker.max_failures,
                open_timeout: Duration::from_secs(config.breaker.open_timeout_secs),
                half_open_max_probes: config.breaker.half_open_max_probes,
                success_threshold: config.breaker.success_threshold,
            },
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&GridConfig::default())
    }
}

/// Result of a successful provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub tenant_id: String,
    pub port: u16,
    pub hostname: String,
    /// False when the reverse proxy could not be updated.
    pub proxy_registered: bool,
}

pub struct Orchestrator {
    store: Arc<dyn TenantStore>,
    ports: Arc<PortAllocator>,
    renderer: Arc<dyn WorkloadRenderer>,
    runtime: Arc<dyn ContainerRuntime>,
    validator: Arc<dyn TokenValidator>,
    registrar: Option<Arc<dyn HostRegistrar>>,
    breaker: CircuitBreaker,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// The allocator must already be hydrated from the port ledger.
    pub fn new(
        store: Arc<dyn TenantStore>,
        ports: Arc<PortAllocator>,
        renderer: Arc<dyn WorkloadRenderer>,
        runtime: Arc<dyn ContainerRuntime>,
        validator: Arc<dyn TokenValidator>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            ports,
            renderer,
            runtime,
            validator,
            registrar: None,
            breaker: CircuitBreaker::new(VALIDATION_BREAKER, settings.breaker),
            settings,
        }
    }

    /// Register tenant hostnames with a reverse proxy.
    pub fn with_registrar(mut self, registrar: Arc<dyn HostRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    // ── Provision ──────────────────────────────────────────────────

    pub async fn provision(&self, tenant_id: &str) -> ProvisionResult<Provisioned> {
        self.provision_cancellable(tenant_id, &CancellationToken::new())
            .await
    }

    /// Provision a `pending` tenant. Any failure after the tenant is marked
    /// `provisioning` rolls back to `pending` and returns the original error.
    pub async fn provision_cancellable(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<Provisioned> {
        let (tenant, agent, provider) = sync_step(cancel, tenant_id, Step::LoadTenant, || {
            self.load_for_provision(tenant_id)
        })?;
        info!(
            %tenant_id,
            agent_type = %agent.id,
            llm_provider = %provider.id,
            "provisioning tenant"
        );

        let mut stack = CompensationStack::new(tenant_id, self.settings.step_timeout);
        let port = match self
            .run_provision(&tenant, &agent, &provider, &mut stack, cancel)
            .await
        {
            Ok(port) => {
                stack.commit();
                port
            }
            Err(err) => {
                let step = err.step().map(|s| s.as_str()).unwrap_or("unknown");
                error!(%tenant_id, step, error = %err, "provisioning failed, rolling back");
                let mut actions = stack.labels();
                actions.reverse();
                let failures = stack.unwind().await;
                self.audit(
                    tenant_id,
                    "provision_failed",
                    serde_json::json!({
                        "step": step,
                        "error": err.to_string(),
                        "compensations": actions,
                        "compensation_failures": failures
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>(),
                    }),
                );
                return Err(err);
            }
        };

        self.audit(
            tenant_id,
            "provisioned",
            serde_json::json!({
                "port": port,
                "agent_type": agent.id,
                "llm_provider": provider.id,
            }),
        );

        let hostname = tenant.hostname(&self.settings.base_domain);
        let proxy_registered = self.register_host(tenant_id, &hostname, port).await;
        info!(%tenant_id, port, %hostname, "tenant provisioned");

        Ok(Provisioned {
            tenant_id: tenant_id.to_string(),
            port,
            hostname,
            proxy_registered,
        })
    }

    fn load_for_provision(
        &self,
        tenant_id: &str,
    ) -> ProvisionResult<(Tenant, AgentType, LlmProvider)> {
        let tenant = self.load_in(tenant_id, "provision", TenantStatus::Pending)?;
        let agent = self
            .store
            .get_agent_type(&tenant.agent_type_id)?
            .ok_or_else(|| ProvisionError::CatalogNotFound {
                kind: "agent type",
                id: tenant.agent_type_id.clone(),
            })?;
        let provider = self
            .store
            .get_llm_provider(&tenant.llm_provider_id)?
            .ok_or_else(|| ProvisionError::CatalogNotFound {
                kind: "llm provider",
                id: tenant.llm_provider_id.clone(),
            })?;
        Ok((tenant, agent, provider))
    }

    /// Steps 2 through 9. Returns the allocated host port.
    async fn run_provision(
        &self,
        tenant: &Tenant,
        agent: &AgentType,
        provider: &LlmProvider,
        stack: &mut CompensationStack,
        cancel: &CancellationToken,
    ) -> ProvisionResult<u16> {
        let id = tenant.id.as_str();

        sync_step(cancel, id, Step::MarkProvisioning, || {
            Ok(self.store.update_status(id, TenantStatus::Provisioning)?)
        })?;
        log_transition(id, tenant.status, TenantStatus::Provisioning);
        {
            let store = Arc::clone(&self.store);
            let id = id.to_string();
            stack.push("reset_status", move || async move {
                let reset = store
                    .update_status(&id, TenantStatus::Pending)
                    .map_err(ProvisionError::from);
                if reset.is_ok() {
                    log_transition(&id, TenantStatus::Provisioning, TenantStatus::Pending);
                }
                reset
            });
        }

        sync_step(cancel, id, Step::RenderWorkspace, || {
            Ok(self.renderer.render_workspace(
                id,
                &tenant.assistant_name,
                &tenant.custom_instructions,
            )?)
        })?;

        let port = sync_step(cancel, id, Step::AllocatePort, || Ok(self.ports.allocate()?))?;
        {
            let ports = Arc::clone(&self.ports);
            stack.push("release_port", move || async move {
                ports.release(port);
                Ok(())
            });
        }

        sync_step(cancel, id, Step::RecordPort, || {
            Ok(self.store.record_port_allocation(port, id)?)
        })?;
        {
            let store = Arc::clone(&self.store);
            let id = id.to_string();
            stack.push("release_port_allocation", move || async move {
                store
                    .release_port_allocation(port, &id)
                    .map(|_| ())
                    .map_err(ProvisionError::from)
            });
        }

        sync_step(cancel, id, Step::SetPort, || Ok(self.store.set_port(id, port)?))?;
        {
            let store = Arc::clone(&self.store);
            let id = id.to_string();
            stack.push("clear_port", move || async move {
                store.clear_port(&id).map_err(ProvisionError::from)
            });
        }

        let gateway_token = format!(
            "{}{}",
            self.settings.gateway_token_prefix,
            Uuid::new_v4().simple()
        );
        let descriptor = DescriptorConfig {
            tenant_id: id.to_string(),
            agent_type: agent.id.clone(),
            host_port: port,
            internal_port: agent.internal_port,
            base_image: agent.base_image.clone(),
            health_endpoint: agent.health_endpoint.clone(),
            min_memory: agent.min_memory.clone(),
            min_cpu: agent.min_cpu.clone(),
            gateway_token: gateway_token.clone(),
            bot_token: tenant.bot_token.clone(),
        };
        sync_step(cancel, id, Step::RenderDescriptor, || {
            Ok(self.renderer.render_descriptor(&descriptor)?)
        })?;

        let secrets = self.secret_env(tenant, agent, provider, &gateway_token);
        sync_step(cancel, id, Step::RenderSecrets, || {
            Ok(self.renderer.render_secrets(id, &secrets)?)
        })?;

        // Pushed before `create` so a half-created container is removed too.
        {
            let runtime = Arc::clone(&self.runtime);
            let id = id.to_string();
            stack.push("remove_container", move || async move {
                runtime.remove(&id).await.map_err(ProvisionError::from)
            });
        }
        self.guarded(cancel, id, Step::CreateContainer, self.runtime.create(id))
            .await?;
        self.guarded(cancel, id, Step::StartContainer, self.runtime.start(id))
            .await?;

        sync_step(cancel, id, Step::MarkActive, || {
            Ok(self.store.update_status(id, TenantStatus::Active)?)
        })?;
        log_transition(id, TenantStatus::Provisioning, TenantStatus::Active);

        Ok(port)
    }

    fn secret_env(
        &self,
        tenant: &Tenant,
        agent: &AgentType,
        provider: &LlmProvider,
        gateway_token: &str,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        match self.settings.provider_keys.get(&provider.env_key) {
            Some(key) => {
                env.insert(provider.env_key.clone(), key.clone());
            }
            None => warn!(
                tenant_id = %tenant.id,
                env_key = %provider.env_key,
                "no credential configured for llm provider"
            ),
        }
        env.insert("TELEGRAM_BOT_TOKEN".to_string(), tenant.bot_token.clone());
        env.insert(gateway_token_key(&agent.id), gateway_token.to_string());
        env
    }

    async fn register_host(&self, tenant_id: &str, hostname: &str, port: u16) -> bool {
        let Some(registrar) = &self.registrar else {
            debug!(%tenant_id, "no reverse proxy configured, skipping registration");
            return false;
        };
        let target = format!("{}:{}", self.settings.upstream_host, port);
        let outcome =
            tokio::time::timeout(self.settings.step_timeout, registrar.add_host(hostname, &target))
                .await;
        match outcome {
            Ok(Ok(())) => {
                info!(%tenant_id, %hostname, %target, "hostname registered");
                true
            }
            Ok(Err(e)) => {
                warn!(%tenant_id, %hostname, error = %e, "hostname registration failed");
                false
            }
            Err(_) => {
                warn!(%tenant_id, %hostname, "hostname registration timed out");
                false
            }
        }
    }

    // ── Suspend / resume ───────────────────────────────────────────

    pub async fn suspend(&self, tenant_id: &str) -> ProvisionResult<()> {
        self.suspend_cancellable(tenant_id, &CancellationToken::new())
            .await
    }

    /// Stop an `active` tenant's container, then mark it `suspended`.
    /// If the stop fails the status is left unchanged.
    pub async fn suspend_cancellable(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        sync_step(cancel, tenant_id, Step::LoadTenant, || {
            self.load_in(tenant_id, "suspend", TenantStatus::Active)
        })?;
        self.guarded(cancel, tenant_id, Step::StopContainer, self.runtime.stop(tenant_id))
            .await?;
        at_step(tenant_id, Step::MarkSuspended, || {
            Ok(self.store.update_status(tenant_id, TenantStatus::Suspended)?)
        })?;
        log_transition(tenant_id, TenantStatus::Active, TenantStatus::Suspended);
        self.audit(tenant_id, "suspended", serde_json::Value::Null);
        Ok(())
    }

    pub async fn resume(&self, tenant_id: &str) -> ProvisionResult<()> {
        self.resume_cancellable(tenant_id, &CancellationToken::new())
            .await
    }

    /// Start a `suspended` tenant's container, then mark it `active`.
    pub async fn resume_cancellable(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        sync_step(cancel, tenant_id, Step::LoadTenant, || {
            self.load_in(tenant_id, "resume", TenantStatus::Suspended)
        })?;
        self.guarded(cancel, tenant_id, Step::StartContainer, self.runtime.start(tenant_id))
            .await?;
        at_step(tenant_id, Step::MarkActive, || {
            Ok(self.store.update_status(tenant_id, TenantStatus::Active)?)
        })?;
        log_transition(tenant_id, TenantStatus::Suspended, TenantStatus::Active);
        self.audit(tenant_id, "resumed", serde_json::Value::Null);
        Ok(())
    }

    // ── Terminate ──────────────────────────────────────────────────

    pub async fn terminate(&self, tenant_id: &str) -> ProvisionResult<()> {
        self.terminate_cancellable(tenant_id, &CancellationToken::new())
            .await
    }

    /// Release the tenant's port, remove its container and mark it
    /// `cancelled`. Safe to call again after a partial or full success.
    pub async fn terminate_cancellable(
        &self,
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        let tenant = sync_step(cancel, tenant_id, Step::LoadTenant, || self.load(tenant_id))?;
        info!(%tenant_id, status = %tenant.status, "terminating tenant");

        if let Some(port) = tenant.container_port {
            let released = sync_step(cancel, tenant_id, Step::ReleasePort, || {
                Ok(self.store.release_port_allocation(port, tenant_id)?)
            })?;
            // No ledger row means an earlier attempt already freed the port,
            // which may since have gone to another tenant.
            if released {
                self.ports.release(port);
            } else {
                debug!(%tenant_id, port, "port no longer held in ledger");
            }
            at_step(tenant_id, Step::ClearPort, || {
                Ok(self.store.clear_port(tenant_id)?)
            })?;
        }

        match self
            .guarded(cancel, tenant_id, Step::RemoveContainer, self.runtime.remove(tenant_id))
            .await
        {
            Ok(()) => {}
            Err(e) if matches!(e.root(), ProvisionError::ContainerNotFound(_)) => {
                debug!(%tenant_id, "container already absent");
            }
            Err(e) => return Err(e),
        }

        self.deregister_host(tenant_id, &tenant.hostname(&self.settings.base_domain))
            .await;

        if tenant.status != TenantStatus::Cancelled {
            at_step(tenant_id, Step::MarkCancelled, || {
                Ok(self.store.update_status(tenant_id, TenantStatus::Cancelled)?)
            })?;
            log_transition(tenant_id, tenant.status, TenantStatus::Cancelled);
        }
        self.audit(
            tenant_id,
            "terminated",
            serde_json::json!({ "port": tenant.container_port }),
        );
        Ok(())
    }

    async fn deregister_host(&self, tenant_id: &str, hostname: &str) {
        let Some(registrar) = &self.registrar else {
            return;
        };
        match tokio::time::timeout(self.settings.step_timeout, registrar.remove_host(hostname)).await
        {
            Ok(Ok(())) => info!(%tenant_id, %hostname, "hostname removed"),
            Ok(Err(e)) if e.is_not_found() => debug!(%tenant_id, %hostname, "hostname not registered"),
            Ok(Err(e)) => warn!(%tenant_id, %hostname, error = %e, "hostname removal failed"),
            Err(_) => warn!(%tenant_id, %hostname, "hostname removal timed out"),
        }
    }

    // ── Validation & inspection ────────────────────────────────────

    /// Check a bot token through the circuit breaker.
    ///
    /// A refused call surfaces as [`ProvisionError::CircuitOpen`]; a token
    /// the dependency rejected surfaces as [`ProvisionError::Validation`],
    /// and an unreachable dependency as
    /// [`ProvisionError::ValidationUnavailable`]. Rejections do not count
    /// against the breaker.
    pub async fn validate_bot_token(&self, token: &str) -> ProvisionResult<BotInfo> {
        let limit = self.settings.validation_timeout;
        let outcome = self
            .breaker
            .execute_with_result(|| async move {
                match tokio::time::timeout(limit, self.validator.validate(token)).await {
                    Ok(Ok(info)) => Ok(Ok(info)),
                    Ok(Err(failure)) if failure.is_unavailable() => Err(failure),
                    Ok(Err(rejection)) => Ok(Err(rejection)),
                    Err(_) => Err(ValidationFailure::Unavailable(format!(
                        "no answer within {limit:?}"
                    ))),
                }
            })
            .await;

        match outcome {
            Ok(Ok(info)) => {
                debug!(bot_id = info.id, "bot token valid");
                Ok(info)
            }
            Ok(Err(rejection)) => Err(rejection.into()),
            Err(BreakerError::Open(open)) => Err(open.into()),
            Err(BreakerError::Inner(failure)) => Err(failure.into()),
        }
    }

    pub async fn container_state(&self, tenant_id: &str) -> ProvisionResult<ContainerState> {
        match tokio::time::timeout(self.settings.step_timeout, self.runtime.status(tenant_id)).await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProvisionError::Timeout(self.settings.step_timeout)),
        }
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    /// Force the validation breaker closed.
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn load(&self, tenant_id: &str) -> ProvisionResult<Tenant> {
        self.store
            .get_tenant(tenant_id)?
            .ok_or_else(|| ProvisionError::TenantNotFound(tenant_id.to_string()))
    }

    fn load_in(
        &self,
        tenant_id: &str,
        action: &'static str,
        required: TenantStatus,
    ) -> ProvisionResult<Tenant> {
        let tenant = self.load(tenant_id)?;
        if tenant.status != required {
            return Err(ProvisionError::InvalidTransition {
                tenant_id: tenant_id.to_string(),
                action,
                status: tenant.status,
            });
        }
        Ok(tenant)
    }

    /// Race an async step against cancellation and the step timeout.
    async fn guarded<T, E, Fut>(
        &self,
        cancel: &CancellationToken,
        tenant_id: &str,
        step: Step,
        fut: Fut,
    ) -> ProvisionResult<T>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProvisionError>,
    {
        let limit = self.settings.step_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
            result = tokio::time::timeout(limit, fut) => match result {
                Ok(inner) => inner.map_err(Into::into),
                Err(_) => Err(ProvisionError::Timeout(limit)),
            },
        };
        outcome.map_err(|e| e.at(tenant_id, step))
    }

    /// Best-effort audit append.
    fn audit(&self, tenant_id: &str, action: &str, details: serde_json::Value) {
        let entry = AuditEntry {
            tenant_id: tenant_id.to_string(),
            action: action.to_string(),
            details,
            created_at: epoch_secs(),
        };
        if let Err(e) = self.store.record_audit(&entry) {
            warn!(%tenant_id, action, error = %e, "audit write failed");
        }
    }
}

/// Run a synchronous step unless cancellation was requested.
fn sync_step<T>(
    cancel: &CancellationToken,
    tenant_id: &str,
    step: Step,
    f: impl FnOnce() -> ProvisionResult<T>,
) -> ProvisionResult<T> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled.at(tenant_id, step));
    }
    at_step(tenant_id, step, f)
}

/// Run a synchronous step that must follow a completed side effect.
fn at_step<T>(
    tenant_id: &str,
    step: Step,
    f: impl FnOnce() -> ProvisionResult<T>,
) -> ProvisionResult<T> {
    f().map_err(|e| e.at(tenant_id, step))
}

fn log_transition(tenant_id: &str, from: TenantStatus, to: TenantStatus) {
    info!(%tenant_id, %from, %to, "tenant status changed");
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agentgrid_breaker::CircuitState;
    use agentgrid_proxy::{ProxyError, ProxyResult};
    use agentgrid_state::{StateError, StateResult, StateStore};
    use async_trait::async_trait;

    use super::*;
    use crate::render::RenderError;
    use crate::runtime::{RuntimeError, RuntimeResult};

    // ── Fakes ──────────────────────────────────────────────────────

    /// Real in-memory store with per-call fault injection.
    struct FaultyStore {
        inner: StateStore,
        faults: Mutex<HashSet<String>>,
    }

    impl FaultyStore {
        fn new(inner: StateStore) -> Self {
            Self {
                inner,
                faults: Mutex::new(HashSet::new()),
            }
        }

        fn fail(&self, call: &str) {
            self.faults.lock().unwrap().insert(call.to_string());
        }

        fn check(&self, call: &str) -> StateResult<()> {
            if self.faults.lock().unwrap().contains(call) {
                Err(StateError::Write(format!("injected failure: {call}")))
            } else {
                Ok(())
            }
        }

        fn tenant(&self, id: &str) -> Tenant {
            self.inner.get_tenant(id).unwrap().unwrap()
        }
    }

    impl TenantStore for FaultyStore {
        fn get_tenant(&self, id: &str) -> StateResult<Option<Tenant>> {
            self.check("get_tenant")?;
            self.inner.get_tenant(id)
        }

        fn update_status(&self, id: &str, status: TenantStatus) -> StateResult<()> {
            self.check(&format!("update_status:{status}"))?;
            self.inner.update_status(id, status).map(|_| ())
        }

        fn set_port(&self, id: &str, port: u16) -> StateResult<()> {
            self.check("set_port")?;
            self.inner.set_port(id, port)
        }

        fn clear_port(&self, id: &str) -> StateResult<()> {
            self.check("clear_port")?;
            self.inner.clear_port(id)
        }

        fn record_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<()> {
            self.check("record_port_allocation")?;
            self.inner.record_port_allocation(port, tenant_id)
        }

        fn release_port_allocation(&self, port: u16, tenant_id: &str) -> StateResult<bool> {
            self.check("release_port_allocation")?;
            self.inner.release_port_allocation(port, tenant_id)
        }

        fn list_allocated_ports(&self) -> StateResult<Vec<u16>> {
            self.inner.list_allocated_ports()
        }

        fn get_agent_type(&self, id: &str) -> StateResult<Option<AgentType>> {
            self.inner.get_agent_type(id)
        }

        fn get_llm_provider(&self, id: &str) -> StateResult<Option<LlmProvider>> {
            self.inner.get_llm_provider(id)
        }

        fn record_audit(&self, entry: &AuditEntry) -> StateResult<()> {
            self.check("record_audit")?;
            self.inner.append_audit(entry)
        }
    }

    #[derive(Default)]
    struct FakeRenderer {
        faults: Mutex<HashSet<&'static str>>,
        descriptors: Mutex<Vec<DescriptorConfig>>,
        secrets: Mutex<Vec<BTreeMap<String, String>>>,
    }

    impl FakeRenderer {
        fn check(&self, call: &'static str) -> Result<(), RenderError> {
            if self.faults.lock().unwrap().contains(call) {
                Err(RenderError::UnknownAgentType(format!("injected: {call}")))
            } else {
                Ok(())
            }
        }
    }

    impl WorkloadRenderer for FakeRenderer {
        fn render_workspace(&self, _: &str, _: &str, _: &str) -> Result<(), RenderError> {
            self.check("workspace")
        }

        fn render_descriptor(&self, config: &DescriptorConfig) -> Result<(), RenderError> {
            self.check("descriptor")?;
            self.descriptors.lock().unwrap().push(config.clone());
            Ok(())
        }

        fn render_secrets(
            &self,
            _: &str,
            env: &BTreeMap<String, String>,
        ) -> Result<(), RenderError> {
            self.check("secrets")?;
            self.secrets.lock().unwrap().push(env.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        containers: Mutex<HashMap<String, ContainerState>>,
        faults: Mutex<HashSet<&'static str>>,
        hangs: Mutex<HashSet<&'static str>>,
    }

    impl FakeRuntime {
        fn fail(&self, call: &'static str) {
            self.faults.lock().unwrap().insert(call);
        }

        fn hang(&self, call: &'static str) {
            self.hangs.lock().unwrap().insert(call);
        }

        async fn enter(&self, call: &'static str) -> RuntimeResult<()> {
            let hang = self.hangs.lock().unwrap().contains(call);
            if hang {
                std::future::pending::<()>().await;
            }
            if self.faults.lock().unwrap().contains(call) {
                return Err(RuntimeError::CommandFailed {
                    command: format!("docker compose {call}"),
                    code: Some(1),
                    output: "injected".into(),
                });
            }
            Ok(())
        }

        fn state(&self, id: &str) -> Option<ContainerState> {
            self.containers.lock().unwrap().get(id).cloned()
        }

        fn set(&self, id: &str, state: ContainerState) -> RuntimeResult<()> {
            let mut containers = self.containers.lock().unwrap();
            match containers.get_mut(id) {
                Some(current) => {
                    *current = state;
                    Ok(())
                }
                None => Err(RuntimeError::NotFound(id.to_string())),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create(&self, id: &str) -> RuntimeResult<()> {
            // A failed create still leaves a container behind.
            self.containers
                .lock()
                .unwrap()
                .insert(id.to_string(), ContainerState::Created);
            self.enter("create").await
        }

        async fn start(&self, id: &str) -> RuntimeResult<()> {
            self.enter("start").await?;
            self.set(id, ContainerState::Running)
        }

        async fn stop(&self, id: &str) -> RuntimeResult<()> {
            self.enter("stop").await?;
            self.set(id, ContainerState::Exited)
        }

        async fn remove(&self, id: &str) -> RuntimeResult<()> {
            self.enter("remove").await?;
            self.containers.lock().unwrap().remove(id);
            Ok(())
        }

        async fn status(&self, id: &str) -> RuntimeResult<ContainerState> {
            Ok(self.state(id).unwrap_or(ContainerState::NotFound))
        }
    }

    #[derive(Default)]
    struct FakeRegistrar {
        hosts: Mutex<BTreeMap<String, String>>,
        broken: Mutex<bool>,
    }

    #[async_trait]
    impl HostRegistrar for FakeRegistrar {
        async fn add_host(&self, hostname: &str, target: &str) -> ProxyResult<()> {
            if *self.broken.lock().unwrap() {
                return Err(ProxyError::Http("proxy down".into()));
            }
            self.hosts
                .lock()
                .unwrap()
                .insert(hostname.to_string(), target.to_string());
            Ok(())
        }

        async fn remove_host(&self, hostname: &str) -> ProxyResult<()> {
            match self.hosts.lock().unwrap().remove(hostname) {
                Some(_) => Ok(()),
                None => Err(ProxyError::RouteNotFound(hostname.to_string())),
            }
        }
    }

    #[derive(Default)]
    struct FakeValidator {
        script: Mutex<VecDeque<Result<BotInfo, ValidationFailure>>>,
        calls: AtomicUsize,
    }

    impl FakeValidator {
        fn push(&self, outcome: Result<BotInfo, ValidationFailure>) {
            self.script.lock().unwrap().push_back(outcome);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenValidator for FakeValidator {
        async fn validate(&self, _token: &str) -> Result<BotInfo, ValidationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| Ok(bot()))
        }
    }

    fn bot() -> BotInfo {
        BotInfo {
            id: 99,
            is_bot: true,
            first_name: "Helper".into(),
            username: Some("helper_bot".into()),
        }
    }

    // ── Harness ────────────────────────────────────────────────────

    struct Harness {
        orch: Orchestrator,
        store: Arc<FaultyStore>,
        ports: Arc<PortAllocator>,
        renderer: Arc<FakeRenderer>,
        runtime: Arc<FakeRuntime>,
        registrar: Arc<FakeRegistrar>,
        validator: Arc<FakeValidator>,
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            base_domain: "agents.test".into(),
            upstream_host: "localhost".into(),
            step_timeout: Duration::from_secs(5),
            validation_timeout: Duration::from_secs(2),
            gateway_token_prefix: "agentgrid_".into(),
            provider_keys: HashMap::from([("OPENAI_API_KEY".into(), "sk-test".into())]),
            breaker: BreakerConfig {
                max_failures: 2,
                open_timeout: Duration::from_secs(30),
                half_open_max_probes: 1,
                success_threshold: 1,
            },
        }
    }

    fn harness_with_range(range: std::ops::RangeInclusive<u16>) -> Harness {
        let state = StateStore::open_in_memory().unwrap();
        state.seed_catalog().unwrap();
        state
            .put_tenant(&Tenant::new("t1", "t1@example.com", "Ada", "- plan meals", "123:abc"))
            .unwrap();

        let store = Arc::new(FaultyStore::new(state));
        let ports = Arc::new(PortAllocator::new(range));
        let renderer = Arc::new(FakeRenderer::default());
        let runtime = Arc::new(FakeRuntime::default());
        let registrar = Arc::new(FakeRegistrar::default());
        let validator = Arc::new(FakeValidator::default());

        let orch = Orchestrator::new(
            store.clone(),
            ports.clone(),
            renderer.clone(),
            runtime.clone(),
            validator.clone(),
            settings(),
        )
        .with_registrar(registrar.clone());

        Harness {
            orch,
            store,
            ports,
            renderer,
            runtime,
            registrar,
            validator,
        }
    }

    fn harness() -> Harness {
        harness_with_range(30000..=30009)
    }

    impl Harness {
        /// Status pending, nothing allocated anywhere, no container.
        fn assert_rolled_back(&self) {
            let tenant = self.store.tenant("t1");
            assert_eq!(tenant.status, TenantStatus::Pending);
            assert_eq!(tenant.container_port, None);
            assert!(self.store.inner.list_allocated_ports().unwrap().is_empty());
            assert!(self.ports.allocated().is_empty());
            assert_eq!(self.runtime.state("t1"), None);
        }
    }

    // ── Provision ──────────────────────────────────────────────────

    #[tokio::test]
    async fn provision_happy_path() {
        let h = harness();
        let out = h.orch.provision("t1").await.unwrap();

        assert_eq!(out.port, 30000);
        assert_eq!(out.hostname, "t1.agents.test");
        assert!(out.proxy_registered);

        let tenant = h.store.tenant("t1");
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(tenant.container_port, Some(30000));
        assert_eq!(h.store.inner.list_allocated_ports().unwrap(), vec![30000]);
        assert_eq!(h.runtime.state("t1"), Some(ContainerState::Running));
        assert_eq!(
            h.registrar.hosts.lock().unwrap().get("t1.agents.test").cloned(),
            Some("localhost:30000".to_string())
        );

        let descriptor = h.renderer.descriptors.lock().unwrap()[0].clone();
        assert_eq!(descriptor.agent_type, "openclaw");
        assert_eq!(descriptor.host_port, 30000);
        assert_eq!(descriptor.internal_port, 18789);
        assert!(descriptor.gateway_token.starts_with("agentgrid_"));

        let secrets = h.renderer.secrets.lock().unwrap()[0].clone();
        assert_eq!(secrets["OPENAI_API_KEY"], "sk-test");
        assert_eq!(secrets["TELEGRAM_BOT_TOKEN"], "123:abc");
        assert_eq!(secrets["OPENCLAW_GATEWAY_TOKEN"], descriptor.gateway_token);

        let audit = h.store.inner.list_audit_for_tenant("t1").unwrap();
        assert!(audit.iter().any(|e| e.action == "provisioned"));
    }

    #[tokio::test]
    async fn rollback_after_each_failing_step() {
        type Inject = fn(&Harness);
        let cases: &[(Step, Inject)] = &[
            (Step::AllocatePort, |h| {
                // Exhaust the single-port range up front.
                h.ports.allocate().unwrap();
            }),
            (Step::RecordPort, |h| h.store.fail("record_port_allocation")),
            (Step::SetPort, |h| h.store.fail("set_port")),
            (Step::RenderDescriptor, |h| {
                h.renderer.faults.lock().unwrap().insert("descriptor");
            }),
            (Step::RenderSecrets, |h| {
                h.renderer.faults.lock().unwrap().insert("secrets");
            }),
            (Step::CreateContainer, |h| h.runtime.fail("create")),
            (Step::StartContainer, |h| h.runtime.fail("start")),
            (Step::MarkActive, |h| h.store.fail("update_status:active")),
        ];

        for (step, inject) in cases {
            let h = harness_with_range(30000..=30000);
            inject(&h);
            let err = h.orch.provision("t1").await.unwrap_err();
            assert_eq!(err.step(), Some(*step), "{err}");

            if *step == Step::AllocatePort {
                assert!(matches!(err.root(), ProvisionError::PortsExhausted(_)));
                // The pre-allocated port belongs to nobody in the ledger.
                h.ports.release(30000);
            }
            h.assert_rolled_back();

            let audit = h.store.inner.list_audit_for_tenant("t1").unwrap();
            assert!(audit.iter().any(|e| e.action == "provision_failed"));
        }
    }

    #[tokio::test]
    async fn workspace_failure_only_resets_status() {
        let h = harness();
        h.renderer.faults.lock().unwrap().insert("workspace");

        let err = h.orch.provision("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::RenderWorkspace));
        assert!(matches!(err.root(), ProvisionError::Render(_)));
        h.assert_rolled_back();

        let audit = h.store.inner.list_audit_for_tenant("t1").unwrap();
        let failed = audit
            .iter()
            .find(|e| e.action == "provision_failed")
            .unwrap();
        assert_eq!(failed.details["compensations"], serde_json::json!(["reset_status"]));
    }

    #[tokio::test]
    async fn compensation_failure_does_not_mask_original_error() {
        let h = harness();
        h.runtime.fail("start");
        h.store.fail("release_port_allocation");

        let err = h.orch.provision("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::StartContainer));
        assert!(matches!(err.root(), ProvisionError::Runtime(_)));
        assert!(err.is_retryable());

        let audit = h.store.inner.list_audit_for_tenant("t1").unwrap();
        let failed = audit
            .iter()
            .find(|e| e.action == "provision_failed")
            .unwrap();
        assert_eq!(
            failed.details["compensations"],
            serde_json::json!([
                "remove_container",
                "clear_port",
                "release_port_allocation",
                "release_port",
                "reset_status"
            ])
        );

        // Every other compensation still ran.
        let tenant = h.store.tenant("t1");
        assert_eq!(tenant.status, TenantStatus::Pending);
        assert_eq!(tenant.container_port, None);
        assert!(h.ports.allocated().is_empty());
        assert_eq!(h.runtime.state("t1"), None);
        assert_eq!(h.store.inner.list_allocated_ports().unwrap(), vec![30000]);
    }

    #[tokio::test]
    async fn provision_unknown_tenant() {
        let h = harness();
        let err = h.orch.provision("ghost").await.unwrap_err();
        assert!(matches!(err.root(), ProvisionError::TenantNotFound(id) if id == "ghost"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn provision_requires_pending() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();

        let err = h.orch.provision("t1").await.unwrap_err();
        assert!(matches!(
            err.root(),
            ProvisionError::InvalidTransition {
                status: TenantStatus::Active,
                ..
            }
        ));
        assert_eq!(h.ports.allocated(), vec![30000]);
    }

    #[tokio::test]
    async fn provision_unknown_agent_type_has_no_side_effects() {
        let h = harness();
        let mut tenant = h.store.tenant("t1");
        tenant.agent_type_id = "hal9000".into();
        h.store.inner.put_tenant(&tenant).unwrap();

        let err = h.orch.provision("t1").await.unwrap_err();
        assert!(matches!(
            err.root(),
            ProvisionError::CatalogNotFound {
                kind: "agent type",
                ..
            }
        ));
        assert_eq!(err.step(), Some(Step::LoadTenant));
        h.assert_rolled_back();
    }

    #[tokio::test]
    async fn missing_provider_credential_is_not_fatal() {
        let h = harness();
        let mut tenant = h.store.tenant("t1");
        tenant.llm_provider_id = "groq".into();
        h.store.inner.put_tenant(&tenant).unwrap();

        h.orch.provision("t1").await.unwrap();
        let secrets = h.renderer.secrets.lock().unwrap()[0].clone();
        assert!(!secrets.contains_key("GROQ_API_KEY"));
        assert!(secrets.contains_key("TELEGRAM_BOT_TOKEN"));
    }

    #[tokio::test]
    async fn proxy_failure_does_not_roll_back() {
        let h = harness();
        *h.registrar.broken.lock().unwrap() = true;

        let out = h.orch.provision("t1").await.unwrap();
        assert!(!out.proxy_registered);
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Active);
        assert_eq!(h.runtime.state("t1"), Some(ContainerState::Running));
    }

    #[tokio::test]
    async fn audit_failure_is_not_fatal() {
        let h = harness();
        h.store.fail("record_audit");
        h.orch.provision("t1").await.unwrap();
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_runtime_times_out_and_rolls_back() {
        let h = harness();
        h.runtime.hang("start");

        let err = h.orch.provision("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::StartContainer));
        assert!(matches!(err.root(), ProvisionError::Timeout(_)));
        h.assert_rolled_back();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_rolls_back() {
        let h = harness();
        h.runtime.hang("start");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = h.orch.provision_cancellable("t1", &cancel).await.unwrap_err();
        assert!(matches!(err.root(), ProvisionError::Cancelled));
        assert_eq!(err.step(), Some(Step::StartContainer));
        h.assert_rolled_back();
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.orch.provision_cancellable("t1", &cancel).await.unwrap_err();
        assert_eq!(err.step(), Some(Step::LoadTenant));
        h.assert_rolled_back();
    }

    #[tokio::test]
    async fn concurrent_provisions_get_distinct_ports() {
        let h = harness();
        for i in 2..=5 {
            let id = format!("t{i}");
            h.store
                .inner
                .put_tenant(&Tenant::new(&id, format!("{id}@example.com"), "Ada", "", "1:a"))
                .unwrap();
        }

        let (a, b, c, d, e) = tokio::join!(
            h.orch.provision("t1"),
            h.orch.provision("t2"),
            h.orch.provision("t3"),
            h.orch.provision("t4"),
            h.orch.provision("t5"),
        );
        let mut ports: Vec<u16> = [a, b, c, d, e]
            .into_iter()
            .map(|r| r.unwrap().port)
            .collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![30000, 30001, 30002, 30003, 30004]);
        assert_eq!(h.store.inner.list_allocated_ports().unwrap().len(), 5);
    }

    // ── Suspend / resume ───────────────────────────────────────────

    #[tokio::test]
    async fn suspend_and_resume() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();

        h.orch.suspend("t1").await.unwrap();
        let tenant = h.store.tenant("t1");
        assert_eq!(tenant.status, TenantStatus::Suspended);
        assert!(tenant.suspended_at.is_some());
        assert_eq!(h.runtime.state("t1"), Some(ContainerState::Exited));

        h.orch.resume("t1").await.unwrap();
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Active);
        assert_eq!(h.runtime.state("t1"), Some(ContainerState::Running));
    }

    #[tokio::test]
    async fn failed_stop_leaves_status_unchanged() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();
        h.runtime.fail("stop");

        let err = h.orch.suspend("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::StopContainer));
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn failed_start_leaves_suspended() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();
        h.orch.suspend("t1").await.unwrap();
        h.runtime.fail("start");

        let err = h.orch.resume("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::StartContainer));
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Suspended);
    }

    #[tokio::test]
    async fn suspend_without_container_is_container_not_found() {
        let h = harness();
        h.store
            .inner
            .update_status("t1", TenantStatus::Active)
            .unwrap();

        let err = h.orch.suspend("t1").await.unwrap_err();
        assert!(matches!(err.root(), ProvisionError::ContainerNotFound(_)));
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn suspend_and_resume_guard_status() {
        let h = harness();
        let err = h.orch.suspend("t1").await.unwrap_err();
        assert!(matches!(err.root(), ProvisionError::InvalidTransition { .. }));

        let err = h.orch.resume("t1").await.unwrap_err();
        assert!(matches!(err.root(), ProvisionError::InvalidTransition { .. }));
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Pending);
    }

    // ── Terminate ──────────────────────────────────────────────────

    #[tokio::test]
    async fn terminate_releases_everything() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();

        h.orch.terminate("t1").await.unwrap();
        let tenant = h.store.tenant("t1");
        assert_eq!(tenant.status, TenantStatus::Cancelled);
        assert!(tenant.cancelled_at.is_some());
        assert_eq!(tenant.container_port, None);
        assert!(h.store.inner.list_allocated_ports().unwrap().is_empty());
        assert!(h.ports.allocated().is_empty());
        assert_eq!(h.runtime.state("t1"), None);
        assert!(h.registrar.hosts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminate_twice_succeeds() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();

        h.orch.terminate("t1").await.unwrap();
        h.orch.terminate("t1").await.unwrap();
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminate_never_provisioned_tenant() {
        let h = harness();
        h.orch.terminate("t1").await.unwrap();
        h.orch.terminate("t1").await.unwrap();
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminate_retries_after_partial_failure() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();
        h.runtime.fail("remove");

        let err = h.orch.terminate("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::RemoveContainer));
        assert_eq!(h.store.tenant("t1").container_port, None);

        h.runtime.faults.lock().unwrap().clear();
        h.orch.terminate("t1").await.unwrap();
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Cancelled);
        assert_eq!(h.runtime.state("t1"), None);
    }

    fn add_tenant(h: &Harness, id: &str) {
        h.store
            .inner
            .put_tenant(&Tenant::new(id, format!("{id}@example.com"), "Bo", "", "1:b"))
            .unwrap();
    }

    #[tokio::test]
    async fn terminate_retry_after_clear_port_failure_spares_new_holder() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();
        h.store.fail("clear_port");

        let err = h.orch.terminate("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::ClearPort));
        assert_eq!(h.store.tenant("t1").container_port, Some(30000));
        assert!(h.ports.allocated().is_empty());

        // The freed port goes to the next tenant before t1 is retried.
        add_tenant(&h, "t2");
        assert_eq!(h.orch.provision("t2").await.unwrap().port, 30000);

        h.store.faults.lock().unwrap().clear();
        h.orch.terminate("t1").await.unwrap();
        assert_eq!(h.store.tenant("t1").container_port, None);
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Cancelled);
        assert_eq!(h.store.inner.list_allocated_ports().unwrap(), vec![30000]);
        assert_eq!(h.ports.allocated(), vec![30000]);

        add_tenant(&h, "t3");
        assert_eq!(h.orch.provision("t3").await.unwrap().port, 30001);
        let t2 = h.store.tenant("t2");
        assert_eq!(t2.status, TenantStatus::Active);
        assert_eq!(t2.container_port, Some(30000));
    }

    #[tokio::test]
    async fn terminate_retry_after_ledger_release_failure() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();
        add_tenant(&h, "t2");
        h.orch.provision("t2").await.unwrap();
        h.store.fail("release_port_allocation");

        let err = h.orch.terminate("t1").await.unwrap_err();
        assert_eq!(err.step(), Some(Step::ReleasePort));
        assert_eq!(h.store.tenant("t1").container_port, Some(30000));
        assert_eq!(h.store.inner.list_allocated_ports().unwrap(), vec![30000, 30001]);
        assert_eq!(h.ports.allocated(), vec![30000, 30001]);

        h.store.faults.lock().unwrap().clear();
        h.orch.terminate("t1").await.unwrap();
        assert_eq!(h.store.tenant("t1").status, TenantStatus::Cancelled);
        assert_eq!(h.store.inner.list_allocated_ports().unwrap(), vec![30001]);
        assert_eq!(h.ports.allocated(), vec![30001]);
        assert_eq!(h.store.tenant("t2").container_port, Some(30001));
    }

    #[tokio::test]
    async fn released_port_is_reused() {
        let h = harness();
        h.orch.provision("t1").await.unwrap();
        h.orch.terminate("t1").await.unwrap();

        h.store
            .inner
            .put_tenant(&Tenant::new("t2", "t2@example.com", "Bo", "", "1:b"))
            .unwrap();
        let out = h.orch.provision("t2").await.unwrap();
        assert_eq!(out.port, 30000);
    }

    // ── Validation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn validate_bot_token_ok() {
        let h = harness();
        let info = h.orch.validate_bot_token("123:abc").await.unwrap();
        assert_eq!(info.username.as_deref(), Some("helper_bot"));
    }

    #[tokio::test]
    async fn unavailable_dependency_trips_breaker() {
        let h = harness();
        h.validator
            .push(Err(ValidationFailure::Unavailable("502".into())));
        h.validator
            .push(Err(ValidationFailure::Unavailable("502".into())));

        for _ in 0..2 {
            let err = h.orch.validate_bot_token("123:abc").await.unwrap_err();
            assert!(matches!(err, ProvisionError::ValidationUnavailable(_)));
            assert!(err.is_retryable());
        }

        let err = h.orch.validate_bot_token("123:abc").await.unwrap_err();
        assert!(matches!(err, ProvisionError::CircuitOpen(_)));
        assert!(err.is_retryable());
        assert_eq!(h.validator.calls(), 2);
        assert_eq!(h.orch.breaker_stats().state, CircuitState::Open);

        h.orch.reset_breaker();
        h.orch.validate_bot_token("123:abc").await.unwrap();
        assert_eq!(h.validator.calls(), 3);
    }

    #[tokio::test]
    async fn rejections_do_not_trip_breaker() {
        let h = harness();
        for _ in 0..3 {
            h.validator
                .push(Err(ValidationFailure::Rejected("Unauthorized".into())));
        }

        for _ in 0..3 {
            let err = h.orch.validate_bot_token("bad").await.unwrap_err();
            assert!(matches!(err, ProvisionError::Validation(_)));
            assert!(!err.is_retryable());
        }
        let stats = h.orch.breaker_stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
    }

    // ── Inspection ─────────────────────────────────────────────────

    #[tokio::test]
    async fn container_state_reflects_runtime() {
        let h = harness();
        assert_eq!(
            h.orch.container_state("t1").await.unwrap(),
            ContainerState::NotFound
        );
        h.orch.provision("t1").await.unwrap();
        assert_eq!(
            h.orch.container_state("t1").await.unwrap(),
            ContainerState::Running
        );
    }

    #[test]
    fn settings_follow_config() {
        let mut config = GridConfig::default();
        config.base_domain = "agents.example.com".into();
        config.breaker.max_failures = 7;

        let settings = OrchestratorSettings::from_config(&config);
        assert_eq!(settings.base_domain, "agents.example.com");
        assert_eq!(settings.breaker.max_failures, 7);
        assert_eq!(settings.step_timeout, Duration::from_secs(120));
        assert_eq!(settings.validation_timeout, Duration::from_secs(10));
    }
}
