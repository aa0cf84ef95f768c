//! Audit collaborator
//!
//! Records who did what to which repository. Sink failures are logged and
//! swallowed so auditing can never fail the operation being audited.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Action;

/// A single auditable operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Principal name
    pub principal: String,
    /// Performed action
    pub action: Action,
    /// Short operation name, e.g. `upload` or `repository.create`
    pub operation: String,
    /// Repository name when the operation targets one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Package, path or other object of the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Failure reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(principal: impl Into<String>, action: Action, operation: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            action,
            operation: operation.into(),
            repository: None,
            target: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn repository(mut self, name: impl Into<String>) -> Self {
        self.repository = Some(name.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Destination for audit events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_success(&self, event: AuditEvent) -> anyhow::Result<()>;
    async fn log_failure(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Writes audit events to the `audit` tracing target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_success(&self, event: AuditEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            principal = %event.principal,
            action = %event.action,
            operation = %event.operation,
            repository = event.repository.as_deref().unwrap_or("-"),
            target_object = event.target.as_deref().unwrap_or("-"),
            "ok"
        );
        Ok(())
    }

    async fn log_failure(&self, event: AuditEvent) -> anyhow::Result<()> {
        tracing::warn!(
            target: "audit",
            principal = %event.principal,
            action = %event.action,
            operation = %event.operation,
            repository = event.repository.as_deref().unwrap_or("-"),
            target_object = event.target.as_deref().unwrap_or("-"),
            error = event.error.as_deref().unwrap_or("-"),
            "failed"
        );
        Ok(())
    }
}

/// Record the outcome of an operation, never propagating sink errors
pub async fn record<T, E: std::fmt::Display>(
    sink: &Arc<dyn AuditSink>,
    mut event: AuditEvent,
    outcome: &Result<T, E>,
) {
    let result = match outcome {
        Ok(_) => sink.log_success(event.clone()).await,
        Err(e) => {
            event.error = Some(e.to_string());
            sink.log_failure(event.clone()).await
        }
    };
    if let Err(e) = result {
        tracing::warn!(operation = %event.operation, error = %e, "Audit sink failed");
    }
}
