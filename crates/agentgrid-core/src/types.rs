//! Domain types shared across agentgrid crates.
//!
//! Tenants, catalog entries (agent types and LLM providers), port ledger
//! rows, and audit entries. All types are serde-serializable so the state
//! store can persist them as JSON values.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable tenant identifier (lowercase, `[a-z0-9-]`, at most 63 chars).
pub type TenantId = String;

/// Container names and compose projects are capped at 63 characters.
pub const MAX_TENANT_ID_LEN: usize = 63;

// ── Tenant ─────────────────────────────────────────────────────────

/// Lifecycle status of a tenant workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Pending,
    Provisioning,
    Active,
    Suspended,
    Cancelled,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Pending => "pending",
            TenantStatus::Provisioning => "provisioning",
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that count against tenant capacity.
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(
            self,
            TenantStatus::Pending | TenantStatus::Provisioning | TenantStatus::Active
        )
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown tenant status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TenantStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TenantStatus::Pending),
            "provisioning" => Ok(TenantStatus::Provisioning),
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "cancelled" => Ok(TenantStatus::Cancelled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A customer's provisioned workload instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: TenantId,
    pub email: String,
    /// Display name of the assistant, rendered into the workspace.
    pub assistant_name: String,
    /// Free-form instructions; bullet lines become responsibilities.
    pub custom_instructions: String,
    pub bot_token: String,
    pub bot_username: Option<String>,
    pub status: TenantStatus,
    /// Host port bound to the tenant container. Mirrors the port ledger.
    pub container_port: Option<u16>,
    pub agent_type_id: String,
    pub llm_provider_id: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub suspended_at: Option<u64>,
    pub cancelled_at: Option<u64>,
}

impl Tenant {
    /// Build a fresh `pending` tenant with the default catalog selections.
    pub fn new(
        id: impl Into<TenantId>,
        email: impl Into<String>,
        assistant_name: impl Into<String>,
        custom_instructions: impl Into<String>,
        bot_token: impl Into<String>,
    ) -> Self {
        let now = epoch_secs();
        Self {
            id: id.into(),
            email: email.into(),
            assistant_name: assistant_name.into(),
            custom_instructions: custom_instructions.into(),
            bot_token: bot_token.into(),
            bot_username: None,
            status: TenantStatus::Pending,
            container_port: None,
            agent_type_id: DEFAULT_AGENT_TYPE.to_string(),
            llm_provider_id: DEFAULT_LLM_PROVIDER.to_string(),
            created_at: now,
            updated_at: now,
            suspended_at: None,
            cancelled_at: None,
        }
    }

    /// Public hostname under the given base domain.
    pub fn hostname(&self, base_domain: &str) -> String {
        format!("{}.{}", self.id, base_domain)
    }
}

pub const DEFAULT_AGENT_TYPE: &str = "openclaw";
pub const DEFAULT_LLM_PROVIDER: &str = "openai";

// ── Catalog ────────────────────────────────────────────────────────

/// A workload template that tenants can select.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentType {
    pub id: String,
    pub name: String,
    pub description: String,
    pub language: String,
    pub base_image: String,
    pub internal_port: u16,
    /// Secondary container port, 0 when the agent has none.
    pub internal_port_bridge: u16,
    pub health_endpoint: String,
    pub min_memory: String,
    pub min_cpu: String,
    pub env_vars: Vec<String>,
    pub is_active: bool,
}

/// An LLM backend whose credential is injected into the tenant container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmProvider {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Environment variable name carrying the credential.
    pub env_key: String,
    pub base_url: Option<String>,
    pub is_active: bool,
}

/// Agent types seeded into a fresh store.
pub fn default_agent_types() -> Vec<AgentType> {
    vec![
        AgentType {
            id: "openclaw".to_string(),
            name: "OpenClaw".to_string(),
            description: "Multi-channel AI assistant with voice, canvas, and 20+ LLM providers"
                .to_string(),
            language: "nodejs".to_string(),
            base_image: "node:22-bookworm".to_string(),
            internal_port: 18789,
            internal_port_bridge: 18790,
            health_endpoint: "/health".to_string(),
            min_memory: "512M".to_string(),
            min_cpu: "0.25".to_string(),
            env_vars: vec![
                "OPENAI_API_KEY".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
                "TELEGRAM_BOT_TOKEN".to_string(),
            ],
            is_active: true,
        },
        AgentType {
            id: "myrai".to_string(),
            name: "Myrai".to_string(),
            description: "Go-based AI assistant with persona system, memory, and 20+ LLM providers"
                .to_string(),
            language: "go".to_string(),
            base_image: "ghcr.io/gmsas95/myrai:latest".to_string(),
            internal_port: 8080,
            internal_port_bridge: 0,
            health_endpoint: "/api/health".to_string(),
            min_memory: "512M".to_string(),
            min_cpu: "0.25".to_string(),
            env_vars: vec![
                "OPENAI_API_KEY".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
                "GROQ_API_KEY".to_string(),
                "TELEGRAM_BOT_TOKEN".to_string(),
                "MYRAI_GATEWAY_TOKEN".to_string(),
            ],
            is_active: true,
        },
    ]
}

/// LLM providers seeded into a fresh store.
pub fn default_llm_providers() -> Vec<LlmProvider> {
    [
        ("openai", "OpenAI", "GPT-4, GPT-3.5 - Most popular, reliable", "OPENAI_API_KEY"),
        ("anthropic", "Anthropic", "Claude - Great reasoning and long context", "ANTHROPIC_API_KEY"),
        ("groq", "Groq", "Fast inference at affordable prices", "GROQ_API_KEY"),
        ("ollama", "Ollama", "Free local inference - runs on your hardware", "OLLAMA_HOST"),
    ]
    .into_iter()
    .map(|(id, name, description, env_key)| LlmProvider {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        env_key: env_key.to_string(),
        base_url: None,
        is_active: true,
    })
    .collect()
}

// ── Ledger & audit ─────────────────────────────────────────────────

/// A row in the durable port-allocation table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    pub tenant_id: TenantId,
    pub allocated_at: u64,
}

/// An append-only record of an orchestrator action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub tenant_id: TenantId,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: u64,
}

// ── Tenant identity ────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantIdError {
    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("email does not yield a usable tenant id: {0}")]
    Empty(String),
}

/// Derive a container-safe tenant id from an email address.
///
/// `Jane.Doe@Example.com` becomes `jane-doe-example-com`.
pub fn tenant_id_from_email(email: &str) -> Result<TenantId, TenantIdError> {
    if !is_valid_email(email) {
        return Err(TenantIdError::InvalidEmail(email.to_string()));
    }

    let mut id = String::with_capacity(email.len());
    for c in email.to_lowercase().chars() {
        let c = match c {
            '@' | '.' | '/' => '-',
            other => other,
        };
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            // Collapse hyphen runs as we go.
            if c == '-' && id.ends_with('-') {
                continue;
            }
            id.push(c);
        }
    }

    let mut id = id.trim_matches('-').to_string();
    if id.len() > MAX_TENANT_ID_LEN {
        id.truncate(MAX_TENANT_ID_LEN);
        id = id.trim_end_matches('-').to_string();
    }

    if id.is_empty() {
        return Err(TenantIdError::Empty(email.to_string()));
    }
    Ok(id)
}

fn is_valid_email(email: &str) -> bool {
    email.contains('@') && email.len() > 3 && email.len() < 254
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TenantStatus::Pending,
            TenantStatus::Provisioning,
            TenantStatus::Active,
            TenantStatus::Suspended,
            TenantStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TenantStatus>(), Ok(status));
        }
        assert!("deleted".parse::<TenantStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TenantStatus::Provisioning).unwrap();
        assert_eq!(json, "\"provisioning\"");
    }

    #[test]
    fn capacity_counts_live_statuses_only() {
        assert!(TenantStatus::Pending.counts_toward_capacity());
        assert!(TenantStatus::Active.counts_toward_capacity());
        assert!(!TenantStatus::Suspended.counts_toward_capacity());
        assert!(!TenantStatus::Cancelled.counts_toward_capacity());
    }

    #[test]
    fn tenant_id_from_simple_email() {
        assert_eq!(
            tenant_id_from_email("Jane.Doe@Example.com").unwrap(),
            "jane-doe-example-com"
        );
    }

    #[test]
    fn tenant_id_strips_symbols_and_collapses_hyphens() {
        assert_eq!(
            tenant_id_from_email("a+b..c@x.io").unwrap(),
            "ab-c-x-io"
        );
        assert_eq!(tenant_id_from_email(".lead@x.io").unwrap(), "lead-x-io");
    }

    #[test]
    fn tenant_id_truncates_to_container_limit() {
        let email = format!("{}@example.com", "a".repeat(80));
        let id = tenant_id_from_email(&email).unwrap();
        assert_eq!(id.len(), MAX_TENANT_ID_LEN);
    }

    #[test]
    fn tenant_id_rejects_invalid_email() {
        assert!(matches!(
            tenant_id_from_email("nope"),
            Err(TenantIdError::InvalidEmail(_))
        ));
        assert!(matches!(
            tenant_id_from_email("@@@@"),
            Err(TenantIdError::Empty(_))
        ));
    }

    #[test]
    fn new_tenant_is_pending_without_port() {
        let t = Tenant::new("t1", "t1@x.io", "Ada", "Help me", "123:abc");
        assert_eq!(t.status, TenantStatus::Pending);
        assert!(t.container_port.is_none());
        assert_eq!(t.agent_type_id, DEFAULT_AGENT_TYPE);
        assert_eq!(t.hostname("example.com"), "t1.example.com");
    }

    #[test]
    fn seeded_catalog_is_consistent() {
        let agents = default_agent_types();
        assert!(agents.iter().any(|a| a.id == DEFAULT_AGENT_TYPE));
        let providers = default_llm_providers();
        assert!(providers.iter().any(|p| p.id == DEFAULT_LLM_PROVIDER));
        assert!(providers.iter().all(|p| p.is_active));
    }
}
