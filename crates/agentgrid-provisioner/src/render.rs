//! Workload rendering: tenant workspace files, container descriptor,
//! and the secret environment file.
//!
//! Layout under `<tenants_dir>/<tenant-id>/`:
//!
//! ```text
//! docker-compose.yml
//! .env.secret                      (mode 0600)
//! .openclaw/openclaw.json          (openclaw only)
//! .openclaw/workspace/AGENTS.md
//! .openclaw/workspace/USER.md
//! .openclaw/workspace/SOUL.md
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use askama::Template;
use thiserror::Error;
use tracing::debug;

pub const DESCRIPTOR_FILE: &str = "docker-compose.yml";
pub const SECRETS_FILE: &str = ".env.secret";

const WORKSPACE_TEMPLATES: &[(&str, &str)] = &[
    ("personal-assistant/AGENTS.md.tmpl", "AGENTS.md"),
    ("personal-assistant/USER.md.tmpl", "USER.md"),
    ("personal-assistant/SOUL.md.tmpl", "SOUL.md"),
];

const DEFAULT_USER_DESCRIPTION: &str = "a user seeking AI assistance";
const DEFAULT_RESPONSIBILITIES: &str = "- Provide general assistance as needed";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("failed to read template {path}: {source}")]
    ReadTemplate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template {template}: unknown placeholder '{placeholder}'")]
    UnknownPlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("template {0}: unterminated placeholder")]
    Unterminated(String),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template engine: {0}")]
    Engine(#[from] askama::Error),

    #[error("failed to encode agent config: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything needed to render one tenant's container descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorConfig {
    pub tenant_id: String,
    pub agent_type: String,
    pub host_port: u16,
    pub internal_port: u16,
    pub base_image: String,
    pub health_endpoint: String,
    pub min_memory: String,
    pub min_cpu: String,
    pub gateway_token: String,
    pub bot_token: String,
}

/// Pure file generation for a tenant's workload. No network calls.
pub trait WorkloadRenderer: Send + Sync {
    fn render_workspace(
        &self,
        tenant_id: &str,
        assistant_name: &str,
        instructions: &str,
    ) -> Result<(), RenderError>;

    fn render_descriptor(&self, config: &DescriptorConfig) -> Result<(), RenderError>;

    fn render_secrets(
        &self,
        tenant_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), RenderError>;
}

pub fn tenant_dir(tenants_dir: &Path, tenant_id: &str) -> PathBuf {
    tenants_dir.join(tenant_id)
}

pub fn descriptor_path(tenants_dir: &Path, tenant_id: &str) -> PathBuf {
    tenant_dir(tenants_dir, tenant_id).join(DESCRIPTOR_FILE)
}

/// Environment key carrying the gateway token for an agent type,
/// e.g. `MYRAI_GATEWAY_TOKEN`.
pub fn gateway_token_key(agent_type: &str) -> String {
    format!("{}_GATEWAY_TOKEN", agent_type.to_uppercase().replace('-', "_"))
}

// ── Descriptor templates ───────────────────────────────────────────

#[derive(Template)]
#[template(path = "compose/openclaw.yml")]
struct OpenclawCompose<'a> {
    cfg: &'a DescriptorConfig,
}

#[derive(Template)]
#[template(path = "compose/myrai.yml")]
struct MyraiCompose<'a> {
    cfg: &'a DescriptorConfig,
}

fn render_compose(config: &DescriptorConfig) -> Result<String, RenderError> {
    match config.agent_type.as_str() {
        "openclaw" => Ok(OpenclawCompose { cfg: config }.render()?),
        "myrai" => Ok(MyraiCompose { cfg: config }.render()?),
        other => Err(RenderError::UnknownAgentType(other.to_string())),
    }
}

fn openclaw_config(config: &DescriptorConfig) -> serde_json::Value {
    serde_json::json!({
        "gateway": {
            "port": config.internal_port,
            "auth": { "token": config.gateway_token },
        },
        "agents": {
            "defaults": { "workspace": "/home/node/.openclaw/workspace" },
        },
        "channels": {
            "telegram": {
                "enabled": true,
                "botToken": config.bot_token,
                "dmPolicy": "open",
                "allowFrom": ["*"],
            },
        },
    })
}

// ── Workspace placeholders ─────────────────────────────────────────

/// First non-blank line of the instructions.
pub fn user_description(instructions: &str) -> String {
    instructions
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(DEFAULT_USER_DESCRIPTION)
        .to_string()
}

/// Bullet lines (`-` or `*`) re-emitted as `- item`.
pub fn responsibilities(instructions: &str) -> String {
    let items: Vec<String> = instructions
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('-') || l.starts_with('*'))
        .map(|l| l.trim_start_matches(['-', '*']).trim())
        .filter(|item| !item.is_empty())
        .map(|item| format!("- {item}"))
        .collect();

    if items.is_empty() {
        DEFAULT_RESPONSIBILITIES.to_string()
    } else {
        items.join("\n")
    }
}

/// Substitute `{{name}}` placeholders in a single pass. Substituted values
/// are never re-scanned.
pub fn fill_placeholders(
    template_name: &str,
    template: &str,
    vars: &[(&str, &str)],
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| RenderError::Unterminated(template_name.to_string()))?;
        let key = after[..close].trim();
        let value = vars
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
            .ok_or_else(|| RenderError::UnknownPlaceholder {
                template: template_name.to_string(),
                placeholder: key.to_string(),
            })?;
        out.push_str(value);
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

// ── File renderer ──────────────────────────────────────────────────

/// Renders into `<tenants_dir>/<id>/` using workspace templates from
/// `templates_dir`.
#[derive(Debug, Clone)]
pub struct FileRenderer {
    templates_dir: PathBuf,
    tenants_dir: PathBuf,
}

impl FileRenderer {
    pub fn new(templates_dir: impl Into<PathBuf>, tenants_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            tenants_dir: tenants_dir.into(),
        }
    }

    pub fn tenants_dir(&self) -> &Path {
        &self.tenants_dir
    }

    fn workspace_dir(&self, tenant_id: &str) -> PathBuf {
        tenant_dir(&self.tenants_dir, tenant_id)
            .join(".openclaw")
            .join("workspace")
    }
}

impl WorkloadRenderer for FileRenderer {
    fn render_workspace(
        &self,
        tenant_id: &str,
        assistant_name: &str,
        instructions: &str,
    ) -> Result<(), RenderError> {
        let description = user_description(instructions);
        let duties = responsibilities(instructions);
        let vars = [
            ("assistant_name", assistant_name),
            ("user_description", description.as_str()),
            ("custom_instructions", instructions),
            ("responsibilities", duties.as_str()),
        ];

        let dir = self.workspace_dir(tenant_id);
        create_dir(&dir)?;
        for (template, output) in WORKSPACE_TEMPLATES {
            let path = self.templates_dir.join(template);
            let source = fs::read_to_string(&path)
                .map_err(|source| RenderError::ReadTemplate { path, source })?;
            let rendered = fill_placeholders(template, &source, &vars)?;
            write_file(&dir.join(output), rendered.as_bytes())?;
        }

        debug!(%tenant_id, dir = %dir.display(), "workspace rendered");
        Ok(())
    }

    fn render_descriptor(&self, config: &DescriptorConfig) -> Result<(), RenderError> {
        let compose = render_compose(config)?;
        let dir = tenant_dir(&self.tenants_dir, &config.tenant_id);
        create_dir(&dir)?;
        write_file(&dir.join(DESCRIPTOR_FILE), compose.as_bytes())?;

        if config.agent_type == "openclaw" {
            let agent_dir = dir.join(".openclaw");
            create_dir(&agent_dir)?;
            let json = serde_json::to_vec_pretty(&openclaw_config(config))?;
            write_file(&agent_dir.join("openclaw.json"), &json)?;
        }

        debug!(tenant_id = %config.tenant_id, agent_type = %config.agent_type, "descriptor rendered");
        Ok(())
    }

    fn render_secrets(
        &self,
        tenant_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<(), RenderError> {
        let dir = tenant_dir(&self.tenants_dir, tenant_id);
        create_dir(&dir)?;

        let content: String = env.iter().map(|(k, v)| format!("{k}={v}\n")).collect();
        let path = dir.join(SECRETS_FILE);
        write_secret(&path, content.as_bytes())?;

        debug!(%tenant_id, keys = env.len(), "secrets rendered");
        Ok(())
    }
}

fn create_dir(dir: &Path) -> Result<(), RenderError> {
    fs::create_dir_all(dir).map_err(|source| RenderError::Write {
        path: dir.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), RenderError> {
    fs::write(path, contents).map_err(|source| RenderError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a file readable only by its owner.
fn write_secret(path: &Path, contents: &[u8]) -> Result<(), RenderError> {
    use std::io::Write;

    let map = |source| RenderError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        // Tighten a pre-existing file before rewriting it.
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(map)?;
        }
    }

    let mut file = options.open(path).map_err(map)?;
    file.write_all(contents).map_err(map)?;
    Ok(())
}
