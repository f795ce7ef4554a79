//! Error types for provisioning.

use std::fmt;
use std::time::Duration;

use agentgrid_breaker::CircuitOpenError;
use agentgrid_core::TenantStatus;
use agentgrid_state::StateError;
use thiserror::Error;

use crate::ports::PortsExhausted;
use crate::render::RenderError;
use crate::runtime::RuntimeError;
use crate::validation::ValidationFailure;

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// A named unit of orchestrator work, used for error context and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    LoadTenant,
    MarkProvisioning,
    RenderWorkspace,
    AllocatePort,
    RecordPort,
    SetPort,
    RenderDescriptor,
    RenderSecrets,
    CreateContainer,
    StartContainer,
    MarkActive,
    StopContainer,
    MarkSuspended,
    ReleasePort,
    ClearPort,
    RemoveContainer,
    MarkCancelled,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::LoadTenant => "load_tenant",
            Step::MarkProvisioning => "mark_provisioning",
            Step::RenderWorkspace => "render_workspace",
            Step::AllocatePort => "allocate_port",
            Step::RecordPort => "record_port",
            Step::SetPort => "set_port",
            Step::RenderDescriptor => "render_descriptor",
            Step::RenderSecrets => "render_secrets",
            Step::CreateContainer => "create_container",
            Step::StartContainer => "start_container",
            Step::MarkActive => "mark_active",
            Step::StopContainer => "stop_container",
            Step::MarkSuspended => "mark_suspended",
            Step::ReleasePort => "release_port",
            Step::ClearPort => "clear_port",
            Step::RemoveContainer => "remove_container",
            Step::MarkCancelled => "mark_cancelled",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rollback action that itself failed. Logged, never returned in place
/// of the failure that triggered the rollback.
#[derive(Debug, Clone, Error)]
#[error("compensation '{action}' for tenant {tenant_id} failed: {reason}")]
pub struct CompensationError {
    pub tenant_id: String,
    pub action: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error(transparent)]
    PortsExhausted(#[from] PortsExhausted),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The dependency refused the input. Not retryable.
    #[error("bot token rejected: {0}")]
    Validation(String),

    /// The dependency could not answer; retry later.
    #[error("token validation unavailable: {0}")]
    ValidationUnavailable(String),

    #[error(transparent)]
    Runtime(RuntimeError),

    #[error("state store: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("unknown {kind}: {id}")]
    CatalogNotFound { kind: &'static str, id: String },

    #[error("cannot {action} tenant {tenant_id} while {status}")]
    InvalidTransition {
        tenant_id: String,
        action: &'static str,
        status: TenantStatus,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("tenant {tenant_id}: {step} failed: {source}")]
    Step {
        tenant_id: String,
        step: Step,
        #[source]
        source: Box<ProvisionError>,
    },
}

impl From<ValidationFailure> for ProvisionError {
    fn from(e: ValidationFailure) -> Self {
        match e {
            ValidationFailure::Rejected(reason) => ProvisionError::Validation(reason),
            ValidationFailure::Unavailable(reason) => ProvisionError::ValidationUnavailable(reason),
        }
    }
}

impl From<RuntimeError> for ProvisionError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(id) => ProvisionError::ContainerNotFound(id),
            other => ProvisionError::Runtime(other),
        }
    }
}

impl ProvisionError {
    /// Attach tenant and step context.
    pub fn at(self, tenant_id: &str, step: Step) -> Self {
        ProvisionError::Step {
            tenant_id: tenant_id.to_string(),
            step,
            source: Box::new(self),
        }
    }

    /// The underlying failure with all step context removed.
    pub fn root(&self) -> &ProvisionError {
        let mut err = self;
        while let ProvisionError::Step { source, .. } = err {
            err = source.as_ref();
        }
        err
    }

    /// The innermost step this error was raised at, if any.
    pub fn step(&self) -> Option<Step> {
        let mut found = None;
        let mut err = self;
        while let ProvisionError::Step { step, source, .. } = err {
            found = Some(*step);
            err = source.as_ref();
        }
        found
    }

    /// Whether retrying without any upstream change may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            ProvisionError::CircuitOpen(_)
            | ProvisionError::Runtime(_)
            | ProvisionError::Timeout(_)
            | ProvisionError::ValidationUnavailable(_)
            | ProvisionError::Cancelled => true,
            _ => false,
        }
    }
}
