//! agentgrid-provisioner: tenant container provisioning.
//!
//! Turns a `pending` tenant record into a running, reachable agent
//! container, and tears it down again.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────┐
//!   agentd ────────▶ │   Orchestrator   │ ──── CircuitBreaker ──▶ TokenValidator
//!                    └────────┬─────────┘
//!        ┌──────────────┬─────┴───────┬────────────────┬──────────────┐
//!        ▼              ▼             ▼                ▼              ▼
//!  PortAllocator   TenantStore   WorkloadRenderer  ContainerRuntime  HostRegistrar
//!  (in-memory)     (redb)        (files)           (docker compose)  (Caddy)
//! ```
//!
//! The allocator, breaker and compensation stack are in-process state;
//! every other collaborator sits behind a trait so tests can swap it.

pub mod compensation;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod render;
pub mod runtime;
pub mod store;
pub mod validation;

pub use compensation::CompensationStack;
pub use error::{CompensationError, ProvisionError, ProvisionResult, Step};
pub use orchestrator::{Orchestrator, OrchestratorSettings, Provisioned, VALIDATION_BREAKER};
pub use ports::{PortAllocator, PortsExhausted};
pub use render::{DescriptorConfig, FileRenderer, RenderError, WorkloadRenderer};
pub use runtime::{ContainerRuntime, ContainerState, DockerComposeRuntime, RuntimeError};
pub use store::TenantStore;
pub use validation::{BotInfo, TelegramValidator, TokenValidator, ValidationFailure};
