//! End-to-end provisioning through the public API: on-disk store, real
//! file renderer and workspace templates, in-memory container engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agentgrid_core::{Tenant, TenantStatus};
use agentgrid_provisioner::render::{SECRETS_FILE, descriptor_path};
use agentgrid_provisioner::runtime::RuntimeResult;
use agentgrid_provisioner::{
    BotInfo, ContainerRuntime, ContainerState, FileRenderer, Orchestrator, OrchestratorSettings,
    PortAllocator, ProvisionError, RuntimeError, Step, TokenValidator, ValidationFailure,
};
use agentgrid_state::StateStore;
use async_trait::async_trait;

// ── Fixtures ────────────────────────────────────────────────────────

/// Container engine that insists on a rendered descriptor, like the real one.
struct DiskRuntime {
    tenants_dir: PathBuf,
    containers: Mutex<HashMap<String, ContainerState>>,
    fail_start: Mutex<bool>,
}

impl DiskRuntime {
    fn new(tenants_dir: &Path) -> Self {
        Self {
            tenants_dir: tenants_dir.to_path_buf(),
            containers: Mutex::new(HashMap::new()),
            fail_start: Mutex::new(false),
        }
    }

    fn has_container(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }
}

#[async_trait]
impl ContainerRuntime for DiskRuntime {
    async fn create(&self, id: &str) -> RuntimeResult<()> {
        let descriptor = descriptor_path(&self.tenants_dir, id);
        if !descriptor.exists() {
            return Err(RuntimeError::DescriptorMissing(descriptor));
        }
        self.containers
            .lock()
            .unwrap()
            .insert(id.to_string(), ContainerState::Created);
        Ok(())
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        if *self.fail_start.lock().unwrap() {
            return Err(RuntimeError::CommandFailed {
                command: "docker compose up -d".into(),
                code: Some(1),
                output: "port is already allocated".into(),
            });
        }
        match self.containers.lock().unwrap().get_mut(id) {
            Some(state) => {
                *state = ContainerState::Running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        match self.containers.lock().unwrap().get_mut(id) {
            Some(state) => {
                *state = ContainerState::Exited;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn status(&self, id: &str) -> RuntimeResult<ContainerState> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(ContainerState::NotFound))
    }
}

struct AcceptAll;

#[async_trait]
impl TokenValidator for AcceptAll {
    async fn validate(&self, _token: &str) -> Result<BotInfo, ValidationFailure> {
        Ok(BotInfo {
            id: 1,
            is_bot: true,
            first_name: "Helper".into(),
            username: Some("helper_bot".into()),
        })
    }
}

fn templates_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../templates")
}

struct Env {
    _dir: tempfile::TempDir,
    tenants_dir: PathBuf,
    db_path: PathBuf,
    store: Arc<StateStore>,
    ports: Arc<PortAllocator>,
    runtime: Arc<DiskRuntime>,
    orch: Orchestrator,
}

fn env() -> Env {
    let dir = tempfile::tempdir().unwrap();
    let tenants_dir = dir.path().join("tenants");
    let db_path = dir.path().join("agentgrid.redb");

    let store = Arc::new(StateStore::open(&db_path).unwrap());
    store.seed_catalog().unwrap();
    store
        .put_tenant(&Tenant::new(
            "alice-example-com",
            "alice@example.com",
            "Juniper",
            "Freelance illustrator\n- chase unpaid invoices\n- keep my calendar sane",
            "123:abc",
        ))
        .unwrap();

    let ports = Arc::new(PortAllocator::new(30000..=30009));
    ports.load_allocated_ports(store.as_ref()).unwrap();

    let runtime = Arc::new(DiskRuntime::new(&tenants_dir));
    let mut settings = OrchestratorSettings::default();
    settings
        .provider_keys
        .insert("OPENAI_API_KEY".into(), "sk-test".into());

    let orch = Orchestrator::new(
        store.clone(),
        ports.clone(),
        Arc::new(FileRenderer::new(templates_dir(), &tenants_dir)),
        runtime.clone(),
        Arc::new(AcceptAll),
        settings,
    );

    Env {
        _dir: dir,
        tenants_dir,
        db_path,
        store,
        ports,
        runtime,
        orch,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn provision_writes_tenant_files_and_starts_container() {
    let env = env();
    let out = env.orch.provision("alice-example-com").await.unwrap();
    assert_eq!(out.port, 30000);
    assert_eq!(out.hostname, "alice-example-com.localhost");
    assert!(!out.proxy_registered);

    let dir = env.tenants_dir.join("alice-example-com");
    let compose = std::fs::read_to_string(dir.join("docker-compose.yml")).unwrap();
    assert!(compose.contains("agentgrid-alice-example-com"));
    assert!(compose.contains("30000:18789"));

    let agents = std::fs::read_to_string(dir.join(".openclaw/workspace/AGENTS.md")).unwrap();
    assert!(agents.contains("Juniper"));
    assert!(agents.contains("- chase unpaid invoices"));
    let user = std::fs::read_to_string(dir.join(".openclaw/workspace/USER.md")).unwrap();
    assert!(user.contains("Freelance illustrator"));

    let secrets = std::fs::read_to_string(dir.join(SECRETS_FILE)).unwrap();
    assert!(secrets.contains("OPENAI_API_KEY=sk-test\n"));
    assert!(secrets.contains("TELEGRAM_BOT_TOKEN=123:abc\n"));
    assert!(secrets.contains("OPENCLAW_GATEWAY_TOKEN=agentgrid_"));

    let tenant = env.store.get_tenant("alice-example-com").unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Active);
    assert_eq!(tenant.container_port, Some(30000));
    assert_eq!(
        env.orch.container_state("alice-example-com").await.unwrap(),
        ContainerState::Running
    );
}

#[tokio::test]
async fn failed_start_rolls_back_durably() {
    let env = env();
    *env.runtime.fail_start.lock().unwrap() = true;

    let err = env.orch.provision("alice-example-com").await.unwrap_err();
    assert_eq!(err.step(), Some(Step::StartContainer));
    assert!(matches!(err.root(), ProvisionError::Runtime(_)));
    assert!(err.is_retryable());

    let tenant = env.store.get_tenant("alice-example-com").unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Pending);
    assert_eq!(tenant.container_port, None);
    assert!(env.store.list_allocated_ports().unwrap().is_empty());
    assert!(env.ports.allocated().is_empty());
    assert!(!env.runtime.has_container("alice-example-com"));

    // The caller can simply retry once the engine recovers.
    *env.runtime.fail_start.lock().unwrap() = false;
    env.orch.provision("alice-example-com").await.unwrap();
}

#[tokio::test]
async fn full_lifecycle() {
    let env = env();
    let id = "alice-example-com";

    env.orch.provision(id).await.unwrap();
    env.orch.suspend(id).await.unwrap();
    assert_eq!(
        env.orch.container_state(id).await.unwrap(),
        ContainerState::Exited
    );
    env.orch.resume(id).await.unwrap();
    env.orch.terminate(id).await.unwrap();
    env.orch.terminate(id).await.unwrap();

    let tenant = env.store.get_tenant(id).unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Cancelled);
    assert!(env.store.list_allocated_ports().unwrap().is_empty());

    let actions: Vec<String> = env
        .store
        .list_audit_for_tenant(id)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec!["provisioned", "suspended", "resumed", "terminated", "terminated"]
    );
}

#[tokio::test]
async fn restarted_allocator_respects_ledger() {
    let env = env();
    env.orch.provision("alice-example-com").await.unwrap();
    let db_path = env.db_path.clone();
    let Env { store, orch, .. } = env;
    drop(orch);
    drop(store);

    let reopened = StateStore::open(&db_path).unwrap();
    let ports = PortAllocator::new(30000..=30009);
    assert_eq!(ports.load_allocated_ports(&reopened).unwrap(), 1);
    assert_eq!(ports.allocate().unwrap(), 30001);
}
