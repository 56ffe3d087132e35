//! Audit records and the sinks they are written to
//!
//! Every request that reaches the authorization check produces exactly one
//! [`AuditRecord`]. Records are built once and never modified.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::AuthError;
use crate::cloudbuild::{BuildFailure, BuildOutcome};
use crate::command::{CommandError, DeployTarget, SlashCommand};
use crate::error::DispatchError;

pub const AUDIT_TARGET: &str = "audit";

/// Pipeline stage an error record came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Command,
    Build,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum AuditOutcome {
    Success {
        service: String,
        environment: String,
        trigger_id: String,
        project_id: String,
        branch: Option<String>,
        build_id: String,
        log_url: Option<String>,
    },
    Denied {
        reason: String,
    },
    Error {
        stage: ErrorStage,
        reason: String,
    },
}

impl AuditOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditOutcome::Success { .. } => "success",
            AuditOutcome::Denied { .. } => "denied",
            AuditOutcome::Error { .. } => "error",
        }
    }
}

/// Who asked for what, when, and what happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    pub user_id: String,
    pub user_name: String,
    pub team_id: String,
    pub channel_id: String,
    pub command_text: String,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    fn new(command: &SlashCommand, outcome: AuditOutcome) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            recorded_at: Utc::now(),
            user_id: command.user_id.clone(),
            user_name: command.user_name.clone(),
            team_id: command.team_id.clone(),
            channel_id: command.channel_id.clone(),
            command_text: command.text.trim().to_string(),
            outcome,
        }
    }

    pub fn denied(command: &SlashCommand, reason: &AuthError) -> Self {
        Self::new(
            command,
            AuditOutcome::Denied {
                reason: reason.to_string(),
            },
        )
    }

    pub fn command_error(command: &SlashCommand, err: &CommandError) -> Self {
        Self::new(
            command,
            AuditOutcome::Error {
                stage: ErrorStage::Command,
                reason: err.to_string(),
            },
        )
    }

    pub fn build_failed(command: &SlashCommand, target: &DeployTarget, failure: &BuildFailure) -> Self {
        Self::new(
            command,
            AuditOutcome::Error {
                stage: ErrorStage::Build,
                reason: format!(
                    "{} in {}: {}",
                    target.service.trigger_id, target.environment.project_id, failure
                ),
            },
        )
    }

    /// Record for the result of a trigger call.
    pub fn from_outcome(command: &SlashCommand, target: &DeployTarget, outcome: &BuildOutcome) -> Self {
        match outcome {
            BuildOutcome::Triggered(build) => Self::new(
                command,
                AuditOutcome::Success {
                    service: target.service.alias.clone(),
                    environment: target.environment.alias.clone(),
                    trigger_id: target.service.trigger_id.clone(),
                    project_id: target.environment.project_id.clone(),
                    branch: target.branch.clone(),
                    build_id: build.build_id.clone(),
                    log_url: build.log_url.clone(),
                },
            ),
            BuildOutcome::Failed(failure) => Self::build_failed(command, target, failure),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append a single record.
    async fn record(&self, record: &AuditRecord) -> Result<(), DispatchError>;
}

/// Emits each record as one structured event on the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), DispatchError> {
        let json = serde_json::to_string(record)
            .map_err(|e| DispatchError::AuditError(format!("Failed to serialize record: {}", e)))?;
        info!(
            target: AUDIT_TARGET,
            audit_id = %record.id,
            outcome = record.outcome.kind(),
            user_id = %record.user_id,
            record = %json,
            "audit record"
        );
        Ok(())
    }
}

/// Writes to every sink. A failing sink is logged and does not stop the others.
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), DispatchError> {
        for sink in &self.sinks {
            if let Err(e) = sink.record(record).await {
                error!("Audit sink failed for record {}: {}", record.id, e);
            }
        }
        Ok(())
    }
}

/// Keeps records in process memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), DispatchError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudbuild::TriggeredBuild;
    use crate::{EnvironmentDescriptor, ServiceDescriptor};
    use serde_json::json;

    fn command() -> SlashCommand {
        SlashCommand {
            user_id: "U1".to_string(),
            user_name: "ana".to_string(),
            team_id: "T1".to_string(),
            channel_id: "C1".to_string(),
            command: "/deploy".to_string(),
            text: " api prod ".to_string(),
            ..Default::default()
        }
    }

    fn target() -> DeployTarget {
        DeployTarget {
            service: ServiceDescriptor {
                alias: "api".to_string(),
                name: "API server".to_string(),
                trigger_id: "deploy-api".to_string(),
                environments: None,
            },
            environment: EnvironmentDescriptor {
                alias: "prod".to_string(),
                name: "Production".to_string(),
                project_id: "acme-prod".to_string(),
            },
            branch: Some("main".to_string()),
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _record: &AuditRecord) -> Result<(), DispatchError> {
            Err(DispatchError::AuditError("disk full".to_string()))
        }
    }

    #[test]
    fn success_record_serializes_flat_with_tag() {
        let outcome = BuildOutcome::Triggered(TriggeredBuild {
            build_id: "b-1".to_string(),
            log_url: None,
            status: None,
        });
        let record = AuditRecord::from_outcome(&command(), &target(), &outcome);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"], json!("success"));
        assert_eq!(value["build_id"], json!("b-1"));
        assert_eq!(value["branch"], json!("main"));
        assert_eq!(value["command_text"], json!("api prod"));
        assert_eq!(value["user_id"], json!("U1"));

        let back: AuditRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn failure_and_denial_records() {
        let outcome = BuildOutcome::Failed(BuildFailure::NotFound("gone".to_string()));
        let record = AuditRecord::from_outcome(&command(), &target(), &outcome);
        match &record.outcome {
            AuditOutcome::Error { stage, reason } => {
                assert_eq!(*stage, ErrorStage::Build);
                assert!(reason.starts_with("deploy-api in acme-prod"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let record = AuditRecord::denied(
            &command(),
            &AuthError::UserNotAllowed {
                user_id: "U1".to_string(),
            },
        );
        assert_eq!(record.outcome.kind(), "denied");

        let record = AuditRecord::command_error(&command(), &CommandError::WrongArity(1));
        assert_eq!(
            record.outcome,
            AuditOutcome::Error {
                stage: ErrorStage::Command,
                reason: CommandError::WrongArity(1).to_string(),
            }
        );
    }

    #[test]
    fn record_ids_are_unique() {
        let err = CommandError::WrongArity(0);
        let a = AuditRecord::command_error(&command(), &err);
        let b = AuditRecord::command_error(&command(), &err);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn fanout_survives_failing_sink() {
        let memory = Arc::new(MemoryAuditSink::new());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![
            Arc::new(FailingSink),
            Arc::new(TracingAuditSink),
            memory.clone(),
        ];
        let fanout = FanoutAuditSink::new(sinks);
        let record = AuditRecord::command_error(&command(), &CommandError::WrongArity(1));
        fanout.record(&record).await.unwrap();
        assert_eq!(memory.records(), vec![record]);
    }
}
