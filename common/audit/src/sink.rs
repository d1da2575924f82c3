use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::event::AuditEvent;

/// Append-only destination for audit events. Durable persistence is owned
/// by the deployment (the sink it provides wraps whatever store it uses);
/// the implementations here cover structured logs and tests.
#[async_trait]
pub trait AuditSink {
    async fn append(&self, event: &AuditEvent);
}

/// Emits each event as a structured log line under the `audit` target.
pub struct TracingSink {}

#[async_trait]
impl AuditSink for TracingSink {
    async fn append(&self, event: &AuditEvent) {
        info!(
            target: "audit",
            action = ?event.action,
            target_name = %event.target,
            result = ?event.result,
            reason = event.reason.as_deref().unwrap_or(""),
            "audit event"
        );
    }
}

/// Collects events in memory; test use only.
#[derive(Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("poisoned MemorySink lock").clone()
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, event: &AuditEvent) {
        self.events
            .lock()
            .expect("poisoned MemorySink lock")
            .push(event.clone());
    }
}
