use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::prometheus::report_pool_apply;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("removal would leave service {service} without a healthy backend")]
    InvariantViolation { service: String },

    #[error("proxy configuration apply failed: {0}")]
    Reload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendMember {
    pub service: String,
    pub name: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSnapshot {
    pub members: Vec<BackendMember>,
    /// Configuration revision last applied to the reverse proxy.
    pub revision: u64,
}

/// Applies a rendered upstream fragment to the reverse proxy. The pool
/// state only becomes authoritative once this returns Ok.
#[async_trait]
pub trait ProxyApplier {
    async fn apply(&self, fragment: &str, revision: u64) -> Result<(), PoolError>;
}

/// Keeps the reverse proxy's active-backend set consistent with the
/// containers the controller believes are serving.
///
/// Mutations are optimistic: the change is rendered and applied first, and
/// committed to the in-memory state only when the apply succeeds. A failed
/// apply leaves the last known-good state in place.
pub struct BackendPool {
    backend_port: u16,
    state: Mutex<PoolSnapshot>,
    applier: Arc<dyn ProxyApplier + Send + Sync>,
}

impl BackendPool {
    pub fn new(backend_port: u16, applier: Arc<dyn ProxyApplier + Send + Sync>) -> Self {
        Self {
            backend_port,
            state: Mutex::new(PoolSnapshot::default()),
            applier,
        }
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.state.lock().await.clone()
    }

    /// Adds a member (only verified-healthy containers are ever cut over,
    /// so new members enter healthy) and reconciles the proxy.
    pub async fn add(&self, service: &str, name: &str) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let mut next = state.members.clone();
        match next.iter_mut().find(|m| m.name == name) {
            Some(member) => member.healthy = true,
            None => next.push(BackendMember {
                service: service.to_string(),
                name: name.to_string(),
                healthy: true,
            }),
        }
        self.reconcile(&mut state, next).await
    }

    /// Removes a member and reconciles the proxy. Refused outright unless
    /// another healthy member of the same service stays behind; this is
    /// what keeps a rotation from taking the service fully offline.
    pub async fn remove(&self, service: &str, name: &str) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        if !state.members.iter().any(|m| m.name == name) {
            return Ok(());
        }
        let survivors_healthy = state
            .members
            .iter()
            .any(|m| m.service == service && m.name != name && m.healthy);
        if !survivors_healthy {
            return Err(PoolError::InvariantViolation {
                service: service.to_string(),
            });
        }
        let next = state
            .members
            .iter()
            .filter(|m| m.name != name)
            .cloned()
            .collect();
        self.reconcile(&mut state, next).await
    }

    async fn reconcile(
        &self,
        state: &mut PoolSnapshot,
        next: Vec<BackendMember>,
    ) -> Result<(), PoolError> {
        let revision = state.revision + 1;
        let fragment = self.render(&next, revision);
        match self.applier.apply(&fragment, revision).await {
            Ok(()) => {
                report_pool_apply("ok");
                info!(revision, members = next.len(), "backend pool reconciled");
                state.members = next;
                state.revision = revision;
                Ok(())
            }
            Err(err) => {
                report_pool_apply("error");
                Err(err)
            }
        }
    }

    fn render(&self, members: &[BackendMember], revision: u64) -> String {
        let mut services: Vec<(&str, Vec<&str>)> = Vec::new();
        for member in members {
            match services.iter_mut().find(|(s, _)| *s == member.service) {
                Some((_, names)) => names.push(&member.name),
                None => services.push((&member.service, vec![&member.name])),
            }
        }

        let mut out = format!("# managed by rotor, revision {revision}\n");
        for (service, names) in services {
            out.push_str(&format!("upstream {service} {{\n"));
            for name in names {
                out.push_str(&format!("    server {name}:{};\n", self.backend_port));
            }
            out.push_str("}\n");
        }
        out
    }
}

/// Writes the fragment to the shared config path and pokes the proxy with
/// the configured reload command.
pub struct FileApplier {
    path: PathBuf,
    reload_command: String,
    timeout: Duration,
}

impl FileApplier {
    pub fn new(path: PathBuf, reload_command: String, timeout: Duration) -> Self {
        Self {
            path,
            reload_command,
            timeout,
        }
    }
}

#[async_trait]
impl ProxyApplier for FileApplier {
    async fn apply(&self, fragment: &str, _revision: u64) -> Result<(), PoolError> {
        tokio::fs::write(&self.path, fragment)
            .await
            .map_err(|e| PoolError::Reload(format!("write {}: {e}", self.path.display())))?;

        if self.reload_command.is_empty() {
            return Ok(());
        }

        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&self.reload_command)
                .output(),
        )
        .await
        .map_err(|_| PoolError::Reload("proxy reload timed out".to_string()))?
        .map_err(|e| PoolError::Reload(format!("proxy reload failed to spawn: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PoolError::Reload(format!(
                "proxy reload exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Records applied fragments in memory; test use only.
#[derive(Default, Clone)]
pub struct MemoryApplier {
    applies: Arc<StdMutex<Vec<(u64, String)>>>,
    fail_next: Arc<AtomicBool>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applies(&self) -> Vec<(u64, String)> {
        self.applies.lock().expect("poisoned").clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyApplier for MemoryApplier {
    async fn apply(&self, fragment: &str, revision: u64) -> Result<(), PoolError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PoolError::Reload("injected apply failure".to_string()));
        }
        self.applies
            .lock()
            .expect("poisoned")
            .push((revision, fragment.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{BackendPool, MemoryApplier, PoolError};

    fn pool() -> (BackendPool, MemoryApplier) {
        let applier = MemoryApplier::new();
        (BackendPool::new(8080, Arc::new(applier.clone())), applier)
    }

    #[tokio::test]
    async fn add_renders_and_applies_the_upstream() {
        let (pool, applier) = pool();
        pool.add("web", "web1").await.unwrap();

        let applies = applier.applies();
        assert_eq!(applies.len(), 1);
        assert_eq!(applies[0].0, 1);
        assert!(applies[0].1.contains("upstream web {"));
        assert!(applies[0].1.contains("server web1:8080;"));

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.members.len(), 1);
    }

    #[tokio::test]
    async fn removing_the_last_healthy_member_is_refused() {
        let (pool, _applier) = pool();
        pool.add("web", "web1").await.unwrap();

        let err = pool.remove("web", "web1").await.unwrap_err();
        assert_eq!(
            err,
            PoolError::InvariantViolation {
                service: "web".to_string()
            }
        );
        assert_eq!(pool.snapshot().await.members.len(), 1);
    }

    #[tokio::test]
    async fn removal_with_a_healthy_survivor_succeeds() {
        let (pool, applier) = pool();
        pool.add("web", "web1").await.unwrap();
        pool.add("web", "web2").await.unwrap();

        pool.remove("web", "web1").await.unwrap();

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.members[0].name, "web2");
        let last = applier.applies().pop().unwrap();
        assert!(!last.1.contains("web1"));
    }

    #[tokio::test]
    async fn another_service_does_not_satisfy_the_invariant() {
        let (pool, _applier) = pool();
        pool.add("web", "web1").await.unwrap();
        pool.add("api", "api1").await.unwrap();

        assert!(pool.remove("web", "web1").await.is_err());
    }

    #[tokio::test]
    async fn failed_apply_rolls_back_the_state() {
        let (pool, applier) = pool();
        pool.add("web", "web1").await.unwrap();

        applier.fail_next();
        let err = pool.add("web", "web2").await.unwrap_err();
        assert!(matches!(err, PoolError::Reload(_)));

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.members[0].name, "web1");
    }

    #[tokio::test]
    async fn removing_an_unknown_member_is_a_no_op() {
        let (pool, applier) = pool();
        pool.add("web", "web1").await.unwrap();

        pool.remove("web", "ghost").await.unwrap();
        assert_eq!(applier.applies().len(), 1);
    }

    #[tokio::test]
    async fn upstreams_are_grouped_by_service() {
        let (pool, applier) = pool();
        pool.add("web", "web1").await.unwrap();
        pool.add("api", "api1").await.unwrap();
        pool.add("web", "web2").await.unwrap();

        let last = applier.applies().pop().unwrap().1;
        let web_block = last.find("upstream web {").unwrap();
        let api_block = last.find("upstream api {").unwrap();
        assert!(web_block < api_block);
        assert!(last.contains("server web2:8080;"));
    }
}
