//! agentgrid-breaker: admission control for a flaky external dependency.
//!
//! A `CircuitBreaker` wraps calls to one logical dependency and stops
//! calling it after repeated failures, giving it a cooldown before
//! letting a limited number of trial calls through.
//!
//! # States
//!
//! ```text
//! Closed ──(max_failures consecutive failures)──► Open
//!   ▲                                              │
//!   │                                   (open_timeout elapsed)
//!   │                                              ▼
//!   └──(success_threshold successes)──────── HalfOpen
//!                                                  │
//!                      Open ◄──(any failure)───────┘
//! ```
//!
//! The breaker never retries. Outcomes are taken strictly from the
//! wrapped call's `Result`; state is process-local and starts `Closed`.

pub mod breaker;
pub mod error;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use error::{BreakerError, CircuitOpenError, OpenReason};
