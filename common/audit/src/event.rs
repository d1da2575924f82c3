use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Who caused a lifecycle decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The control plane itself (scheduled rotations, reconciliation)
    System,
    /// An operator, identified by whatever the boundary could attribute
    /// (dashboard identity or caller IP)
    Operator { identity: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CycleFinished,
    ContainerStart,
    ContainerStop,
    HealthPass,
    PoolAdd,
    PoolRemove,
    PreStopHook,
    AuthReject,
    AllowlistReject,
    ViolationReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Ok,
    Rejected,
    Failed,
}

/// One audited lifecycle decision. Append-only: never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub actor: Actor,
    pub action: AuditAction,
    pub target: String,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Draft an event; the timestamp is assigned by the recorder so that
    /// timestamps stay monotonic per process.
    pub fn draft(
        actor: Actor,
        action: AuditAction,
        target: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            ts: OffsetDateTime::UNIX_EPOCH,
            actor,
            action,
            target: target.into(),
            result,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
