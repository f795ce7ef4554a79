//! Compensating actions for a multi-step workflow.
//!
//! After each side effect succeeds, the workflow pushes the action that
//! undoes it. On failure the stack is unwound in reverse order. Every
//! action runs even if an earlier one fails; failures are logged and
//! returned for reporting, never propagated.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info};

use crate::error::{CompensationError, ProvisionError, ProvisionResult};

type BoxFuture = Pin<Box<dyn Future<Output = ProvisionResult<()>> + Send>>;

type Action = Box<dyn FnOnce() -> BoxFuture + Send>;

pub struct CompensationStack {
    tenant_id: String,
    timeout: Duration,
    actions: Vec<(&'static str, Action)>,
}

impl CompensationStack {
    /// `timeout` bounds each individual action.
    pub fn new(tenant_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            timeout,
            actions: Vec::new(),
        }
    }

    pub fn push<F, Fut>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ProvisionResult<()>> + Send + 'static,
    {
        self.actions
            .push((label, Box::new(move || Box::pin(action()) as BoxFuture)));
    }

    /// Pending action labels, most recent last.
    pub fn labels(&self) -> Vec<&'static str> {
        self.actions.iter().map(|(label, _)| *label).collect()
    }

    /// Drop all actions; the workflow committed.
    pub fn commit(mut self) {
        self.actions.clear();
    }

    /// Run every action, most recent first.
    pub async fn unwind(mut self) -> Vec<CompensationError> {
        let mut failures = Vec::new();
        while let Some((label, action)) = self.actions.pop() {
            let outcome = match tokio::time::timeout(self.timeout, action()).await {
                Ok(result) => result,
                Err(_) => Err(ProvisionError::Timeout(self.timeout)),
            };
            match outcome {
                Ok(()) => info!(tenant_id = %self.tenant_id, action = label, "compensation applied"),
                Err(e) => {
                    let failure = CompensationError {
                        tenant_id: self.tenant_id.clone(),
                        action: label,
                        reason: e.to_string(),
                    };
                    error!(
                        tenant_id = %self.tenant_id,
                        action = label,
                        error = %failure,
                        "compensation failed"
                    );
                    failures.push(failure);
                }
            }
        }
        failures
    }
}
