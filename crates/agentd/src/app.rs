//! Subsystem wiring and the subcommand handlers.

use std::sync::Arc;

use agentgrid_core::{GridConfig, Tenant, tenant_id_from_email};
use agentgrid_provisioner::{
    DockerComposeRuntime, FileRenderer, Orchestrator, OrchestratorSettings, PortAllocator,
    TelegramValidator,
};
use agentgrid_proxy::CaddyRegistrar;
use agentgrid_state::StateStore;
use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct NewTenant {
    pub email: String,
    pub assistant_name: String,
    pub instructions: String,
    pub bot_token: String,
    pub agent_type: String,
    pub llm_provider: String,
    pub validate: bool,
}

pub struct App {
    config: GridConfig,
    store: StateStore,
    orch: Orchestrator,
}

impl App {
    pub fn open(config: GridConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;
        std::fs::create_dir_all(&config.tenants_dir)
            .with_context(|| format!("creating {}", config.tenants_dir.display()))?;

        // ── State ──────────────────────────────────────────────────

        let db_path = config.db_path();
        let store = StateStore::open(&db_path)?;
        store.seed_catalog()?;
        info!(path = ?db_path, "state store opened");

        let ports = Arc::new(PortAllocator::new(
            config.port_range_start..=config.port_range_end,
        ));
        ports.load_allocated_ports(&store)?;

        // ── Collaborators ──────────────────────────────────────────

        let renderer = FileRenderer::new(&config.templates_dir, &config.tenants_dir);
        let runtime = DockerComposeRuntime::new(&config.tenants_dir);
        let validator =
            TelegramValidator::new(&config.validation_api_base, config.validation_timeout())?;

        let mut orch = Orchestrator::new(
            Arc::new(store.clone()),
            ports,
            Arc::new(renderer),
            Arc::new(runtime),
            Arc::new(validator),
            OrchestratorSettings::from_config(&config),
        );
        if let Some(url) = &config.proxy_admin_url {
            let registrar = CaddyRegistrar::new(url, config.proxy_server.clone())?
                .with_timeout(config.runtime_timeout());
            orch = orch.with_registrar(Arc::new(registrar));
            info!(admin = %url, "reverse proxy registration enabled");
        }

        Ok(Self {
            config,
            store,
            orch,
        })
    }

    pub fn init(&self) -> anyhow::Result<()> {
        println!(
            "initialized {} ({} agent types, {} llm providers)",
            self.config.db_path().display(),
            self.store.list_agent_types()?.len(),
            self.store.list_llm_providers()?.len(),
        );
        Ok(())
    }

    pub async fn create_tenant(&self, new: NewTenant) -> anyhow::Result<()> {
        let id = tenant_id_from_email(&new.email)?;
        if self.store.get_tenant(&id)?.is_some() {
            bail!("tenant {id} already exists");
        }

        let active = self.store.count_active_tenants()?;
        if active >= self.config.max_tenants as usize {
            bail!(
                "tenant capacity reached ({active}/{})",
                self.config.max_tenants
            );
        }

        if self.store.get_agent_type(&new.agent_type)?.is_none() {
            bail!("unknown agent type: {}", new.agent_type);
        }
        if self.store.get_llm_provider(&new.llm_provider)?.is_none() {
            bail!("unknown llm provider: {}", new.llm_provider);
        }

        let mut tenant = Tenant::new(
            id.clone(),
            new.email,
            new.assistant_name,
            new.instructions,
            new.bot_token,
        );
        tenant.agent_type_id = new.agent_type;
        tenant.llm_provider_id = new.llm_provider;

        if new.validate {
            let bot = self.orch.validate_bot_token(&tenant.bot_token).await?;
            tenant.bot_username = bot.username;
        }

        self.store.put_tenant(&tenant)?;
        info!(tenant_id = %id, "tenant created");
        println!("{id}");
        Ok(())
    }

    pub async fn provision(&self, tenant_id: &str) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling provisioning");
                trigger.cancel();
            }
        });

        let outcome = self.orch.provision_cancellable(tenant_id, &cancel).await;
        interrupt.abort();

        let provisioned = outcome?;
        println!("{}", serde_json::to_string_pretty(&provisioned)?);
        Ok(())
    }

    pub async fn suspend(&self, tenant_id: &str) -> anyhow::Result<()> {
        self.orch.suspend(tenant_id).await?;
        println!("{tenant_id} suspended");
        Ok(())
    }

    pub async fn resume(&self, tenant_id: &str) -> anyhow::Result<()> {
        self.orch.resume(tenant_id).await?;
        println!("{tenant_id} resumed");
        Ok(())
    }

    pub async fn terminate(&self, tenant_id: &str) -> anyhow::Result<()> {
        self.orch.terminate(tenant_id).await?;
        println!("{tenant_id} cancelled");
        Ok(())
    }

    pub async fn status(&self, tenant_id: &str) -> anyhow::Result<()> {
        let Some(mut tenant) = self.store.get_tenant(tenant_id)? else {
            bail!("tenant not found: {tenant_id}");
        };
        tenant.bot_token = redact(&tenant.bot_token);

        let container = match self.orch.container_state(tenant_id).await {
            Ok(state) => state.to_string(),
            Err(e) => {
                warn!(%tenant_id, error = %e, "container status unavailable");
                "unknown".to_string()
            }
        };

        let report = serde_json::json!({
            "tenant": tenant,
            "container": container,
            "hostname": tenant.hostname(&self.config.base_domain),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }

    pub async fn validate_token(&self, token: &str) -> anyhow::Result<()> {
        let result = self.orch.validate_bot_token(token).await;
        let stats = self.orch.breaker_stats();
        let bot = result.with_context(|| format!("breaker {} is {}", stats.name, stats.state))?;
        println!("{}", serde_json::to_string_pretty(&bot)?);
        Ok(())
    }

    pub fn ports(&self) -> anyhow::Result<()> {
        let rows = self.store.list_port_allocations()?;
        if rows.is_empty() {
            println!("no ports allocated");
        }
        for row in rows {
            println!("{}\t{}", row.port, row.tenant_id);
        }
        Ok(())
    }
}

/// Keep the bot id prefix, hide the secret.
fn redact(token: &str) -> String {
    match token.split_once(':') {
        Some((bot_id, _)) => format!("{bot_id}:***"),
        None => "***".to_string(),
    }
}
