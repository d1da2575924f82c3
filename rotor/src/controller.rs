use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use audit::{Actor, AuditAction, AuditEvent, AuditRecorder, AuditResult};
use futures::future::join_all;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::RotorError;
use crate::broker_client::LifecycleApi;
use crate::config::RotationSlot;
use crate::hooks::PreStopHook;
use crate::pool::BackendPool;
use crate::probe::{ProbeVerdict, Prober};
use crate::prometheus::{report_cycle_duration, report_cycle_outcome, report_trigger_rejected};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerRole {
    Active,
    Standby,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedContainer {
    pub name: String,
    pub service: String,
    pub role: ContainerRole,
    pub health: ContainerHealth,
    #[serde(with = "time::serde::rfc3339")]
    pub last_transition_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Provisioning,
    HealthChecking,
    Cutover,
    Draining,
}

impl CycleState {
    fn as_str(&self) -> &'static str {
        match self {
            CycleState::Provisioning => "provisioning",
            CycleState::HealthChecking => "health_checking",
            CycleState::Cutover => "cutover",
            CycleState::Draining => "draining",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Pending,
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationCycle {
    pub id: Uuid,
    pub trigger: CycleTrigger,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub state: CycleState,
    pub outcome: CycleOutcome,
    pub involved: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: &'static str,
    pub cycle: Option<RotationCycle>,
    pub last_cycle: Option<RotationCycle>,
    pub containers: Vec<ManagedContainer>,
}

struct CycleFailure {
    outcome: CycleOutcome,
    reason: String,
}

struct ControllerState {
    containers: HashMap<String, ManagedContainer>,
    /// Admission guard: the id of the in-flight cycle or operator stop.
    /// At most one non-terminal operation exists process-wide.
    busy: Option<Uuid>,
    current: Option<RotationCycle>,
    last_cycle: Option<RotationCycle>,
}

struct Inner {
    slots: Vec<RotationSlot>,
    drain_grace: Duration,
    broker: Arc<dyn LifecycleApi + Send + Sync>,
    pool: Arc<BackendPool>,
    prober: Arc<dyn Prober + Send + Sync>,
    hook: Arc<dyn PreStopHook + Send + Sync>,
    audit: AuditRecorder,
    state: Mutex<ControllerState>,
    shutdown: CancellationToken,
}

/// The rotation state machine. Owns the managed-container role map and the
/// single-cycle admission guard; drives the broker, the health probe and
/// the pool reconciler through one complete cycle at a time.
///
/// The state lock is only ever held for discrete mutations; probing, drain
/// waits and every broker or reconciler call happen with the lock
/// released, so status queries stay responsive during a cycle.
#[derive(Clone)]
pub struct RotationController {
    inner: Arc<Inner>,
}

impl RotationController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slots: Vec<RotationSlot>,
        broker: Arc<dyn LifecycleApi + Send + Sync>,
        pool: Arc<BackendPool>,
        prober: Arc<dyn Prober + Send + Sync>,
        hook: Arc<dyn PreStopHook + Send + Sync>,
        audit: AuditRecorder,
        drain_grace: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let containers = slots
            .iter()
            .map(|slot| {
                let name = slot.names[0].clone();
                (
                    name.clone(),
                    ManagedContainer {
                        name,
                        service: slot.service.clone(),
                        role: ContainerRole::Active,
                        health: ContainerHealth::Unknown,
                        last_transition_at: now,
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                slots,
                drain_grace,
                broker,
                pool,
                prober,
                hook,
                audit,
                state: Mutex::new(ControllerState {
                    containers,
                    busy: None,
                    current: None,
                    last_cycle: None,
                }),
                shutdown,
            }),
        }
    }

    /// Seeds the backend pool with the initial actives and applies the
    /// baseline proxy configuration. Failing here fails startup: the
    /// controller must not run without a known-good pool.
    pub async fn bootstrap(&self) -> Result<(), RotorError> {
        for slot in &self.inner.slots {
            self.inner.pool.add(&slot.service, &slot.names[0]).await?;
            self.inner
                .set_health(&slot.names[0], ContainerHealth::Healthy);
        }
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.inner.state.lock().expect("poisoned controller lock");
        let mut containers: Vec<ManagedContainer> = state.containers.values().cloned().collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        StatusSnapshot {
            state: state
                .current
                .as_ref()
                .map_or("idle", |cycle| cycle.state.as_str()),
            cycle: state.current.clone(),
            last_cycle: state.last_cycle.clone(),
            containers,
        }
    }

    /// Interval-timer entry point. A cycle already in flight is not an
    /// error here, just a skipped tick.
    pub async fn trigger_scheduled(&self) {
        match self.admit(CycleTrigger::Scheduled) {
            Ok(admitted) => {
                Inner::run_cycle(self.inner.clone(), admitted, Actor::System).await;
            }
            Err(RotorError::ConcurrentRotation { in_flight }) => {
                report_trigger_rejected();
                info!(%in_flight, "scheduled rotation skipped, cycle already in flight");
            }
            Err(err) => {
                warn!("scheduled rotation not admitted: {}", err);
            }
        }
    }

    /// Manual rotate-now. Returns the new cycle id immediately; the cycle
    /// itself runs in the background.
    pub fn trigger_manual(&self, actor: Actor) -> Result<Uuid, RotorError> {
        let admitted = self.admit(CycleTrigger::Manual).inspect_err(|err| {
            if matches!(err, RotorError::ConcurrentRotation { .. }) {
                report_trigger_rejected();
            }
        })?;
        let id = admitted.cycle_id;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Inner::run_cycle(inner, admitted, actor).await;
        });
        Ok(id)
    }

    /// Operator stop, funneled through the controller so it serializes
    /// against rotation cycles and cannot empty the backend pool.
    pub async fn manual_stop(&self, actor: Actor, name: &str) -> Result<(), RotorError> {
        let service = {
            let mut state = self.inner.state.lock().expect("poisoned controller lock");
            if let Some(id) = state.busy {
                return Err(RotorError::ConcurrentRotation { in_flight: id });
            }
            let container =
                state
                    .containers
                    .get(name)
                    .ok_or_else(|| RotorError::UnknownContainer {
                        name: name.to_string(),
                    })?;
            let service = container.service.clone();
            state.busy = Some(Uuid::now_v7());
            service
        };

        let result = self.manual_stop_inner(&actor, name, &service).await;
        self.inner
            .state
            .lock()
            .expect("poisoned controller lock")
            .busy = None;
        result
    }

    async fn manual_stop_inner(
        &self,
        actor: &Actor,
        name: &str,
        service: &str,
    ) -> Result<(), RotorError> {
        let inner = &self.inner;

        // Traffic first: refuse outright if this is the service's last
        // healthy backend.
        if let Err(err) = inner.pool.remove(service, name).await {
            inner.audit.record(
                AuditEvent::draft(
                    actor.clone(),
                    AuditAction::PoolRemove,
                    name,
                    AuditResult::Rejected,
                )
                .with_reason(err.to_string()),
            );
            return Err(err.into());
        }

        if let Err(reason) = inner.hook.flush(name).await {
            warn!(container = name, "pre-stop hook failed: {}", reason);
            inner.audit.record(
                AuditEvent::draft(
                    actor.clone(),
                    AuditAction::PreStopHook,
                    name,
                    AuditResult::Failed,
                )
                .with_reason(reason),
            );
        }

        if let Err(err) = inner.broker.stop(name).await {
            inner.audit.record(
                AuditEvent::draft(
                    actor.clone(),
                    AuditAction::ContainerStop,
                    name,
                    AuditResult::Failed,
                )
                .with_reason(err.to_string()),
            );
            // the container still serves; put it back in the pool
            if let Err(readd) = inner.pool.add(service, name).await {
                warn!(container = name, "could not restore pool member: {}", readd);
            }
            return Err(err.into());
        }

        inner.audit.record(
            AuditEvent::draft(
                actor.clone(),
                AuditAction::ContainerStop,
                name,
                AuditResult::Ok,
            )
            .with_reason("operator stop, removed from backend pool"),
        );
        inner.retire(name);
        Ok(())
    }

    /// Waits for an in-flight operation to reach a terminal state, up to
    /// `grace`. Used on shutdown; returns whether the controller is idle.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self
                .inner
                .state
                .lock()
                .expect("poisoned controller lock")
                .busy
                .is_none()
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Check-and-set admission: at most one non-terminal cycle. Selection
    /// is oldest-active-first across slots; the standby is always the
    /// slot's inactive name.
    fn admit(&self, trigger: CycleTrigger) -> Result<AdmittedCycle, RotorError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().expect("poisoned controller lock");

        if let Some(id) = state.busy {
            return Err(RotorError::ConcurrentRotation { in_flight: id });
        }

        let (slot, old) = inner
            .slots
            .iter()
            .filter_map(|slot| {
                let active = slot.names.iter().find(|name| {
                    state
                        .containers
                        .get(*name)
                        .map(|c| c.role == ContainerRole::Active)
                        .unwrap_or(false)
                })?;
                let at = state.containers[active].last_transition_at;
                Some((slot, active.clone(), at))
            })
            .min_by_key(|(_, _, at)| *at)
            .map(|(slot, active, _)| (slot.clone(), active))
            .ok_or(RotorError::NothingToRotate)?;

        let standby = slot
            .names
            .iter()
            .find(|name| **name != old)
            .expect("slot names are distinct")
            .clone();

        let now = OffsetDateTime::now_utc();
        let cycle = RotationCycle {
            id: Uuid::now_v7(),
            trigger,
            started_at: now,
            state: CycleState::Provisioning,
            outcome: CycleOutcome::Pending,
            involved: vec![old.clone(), standby.clone()],
        };

        state.busy = Some(cycle.id);
        state.current = Some(cycle.clone());
        state.containers.insert(
            standby.clone(),
            ManagedContainer {
                name: standby.clone(),
                service: slot.service.clone(),
                role: ContainerRole::Standby,
                health: ContainerHealth::Unknown,
                last_transition_at: now,
            },
        );

        Ok(AdmittedCycle {
            cycle_id: cycle.id,
            trigger,
            slot,
            old,
            standby,
        })
    }
}

struct AdmittedCycle {
    cycle_id: Uuid,
    trigger: CycleTrigger,
    slot: RotationSlot,
    old: String,
    standby: String,
}

impl Inner {
    async fn run_cycle(inner: Arc<Inner>, admitted: AdmittedCycle, actor: Actor) {
        let started = Instant::now();
        let trigger_tag = match admitted.trigger {
            CycleTrigger::Scheduled => "scheduled",
            CycleTrigger::Manual => "manual",
        };
        let service = admitted.slot.service.clone();
        let cycle_id = admitted.cycle_id;

        let result = inner.execute_cycle(&admitted, &actor).await;
        let (outcome, outcome_tag, reason) = match result {
            Ok(()) => (CycleOutcome::Success, "success", None),
            Err(CycleFailure { outcome, reason }) => {
                let tag = match outcome {
                    CycleOutcome::Aborted => "aborted",
                    _ => "failed",
                };
                (outcome, tag, Some(reason))
            }
        };

        {
            let mut state = inner.state.lock().expect("poisoned controller lock");
            if let Some(mut cycle) = state.current.take() {
                cycle.outcome = outcome;
                state.last_cycle = Some(cycle);
            }
            state.busy = None;
        }

        report_cycle_outcome(trigger_tag, outcome_tag);
        report_cycle_duration(outcome_tag, started.elapsed().as_secs_f64());

        match reason {
            None => info!(%cycle_id, service = %service, "rotation cycle succeeded"),
            Some(reason) => {
                warn!(%cycle_id, service = %service, outcome = outcome_tag, "rotation cycle did not complete: {}", reason);
                inner.audit.record(
                    AuditEvent::draft(
                        actor,
                        AuditAction::CycleFinished,
                        service,
                        AuditResult::Failed,
                    )
                    .with_reason(format!("outcome={outcome_tag}, reason={reason}")),
                );
            }
        }
    }

    async fn execute_cycle(
        &self,
        admitted: &AdmittedCycle,
        actor: &Actor,
    ) -> Result<(), CycleFailure> {
        let AdmittedCycle {
            slot, old, standby, ..
        } = admitted;

        if self.shutdown.is_cancelled() {
            self.retire(standby);
            return Err(CycleFailure {
                outcome: CycleOutcome::Aborted,
                reason: "shutdown requested".to_string(),
            });
        }

        // Provisioning
        match self.broker.start(standby).await {
            Ok(()) => {
                self.audit.record(AuditEvent::draft(
                    actor.clone(),
                    AuditAction::ContainerStart,
                    standby,
                    AuditResult::Ok,
                ));
            }
            Err(err) => {
                self.audit.record(
                    AuditEvent::draft(
                        actor.clone(),
                        AuditAction::ContainerStart,
                        standby,
                        AuditResult::Failed,
                    )
                    .with_reason(err.to_string()),
                );
                self.retire(standby);
                return Err(CycleFailure {
                    outcome: CycleOutcome::Aborted,
                    reason: format!("standby start failed: {err}"),
                });
            }
        }

        // HealthChecking. One standby per cycle today, but the probes run
        // concurrently if that ever grows.
        self.set_cycle_state(CycleState::HealthChecking);
        let standbys = [standby.clone()];
        let verdicts = join_all(standbys.iter().map(|name| self.prober.check(name))).await;

        if self.shutdown.is_cancelled() {
            self.stop_discarded_standby(standby, actor).await;
            return Err(CycleFailure {
                outcome: CycleOutcome::Aborted,
                reason: "shutdown requested".to_string(),
            });
        }

        if let Some(bad) = verdicts.iter().find(|v| **v != ProbeVerdict::Healthy) {
            // Never cut over against an unhealthy standby: discard it and
            // leave the running actives untouched.
            let reason = match bad {
                ProbeVerdict::Timeout => "health_check_timeout",
                _ => "standby_unhealthy",
            };
            self.set_health(standby, ContainerHealth::Unhealthy);
            self.stop_discarded_standby(standby, actor).await;
            return Err(CycleFailure {
                outcome: CycleOutcome::Failed,
                reason: reason.to_string(),
            });
        }

        self.set_health(standby, ContainerHealth::Healthy);
        self.audit.record(AuditEvent::draft(
            actor.clone(),
            AuditAction::HealthPass,
            standby,
            AuditResult::Ok,
        ));

        // Cutover
        self.set_cycle_state(CycleState::Cutover);
        if let Err(err) = self.pool.add(&slot.service, standby).await {
            self.stop_discarded_standby(standby, actor).await;
            return Err(CycleFailure {
                outcome: CycleOutcome::Failed,
                reason: format!("cutover apply failed: {err}"),
            });
        }
        self.audit.record(AuditEvent::draft(
            actor.clone(),
            AuditAction::PoolAdd,
            standby,
            AuditResult::Ok,
        ));
        self.set_role(standby, ContainerRole::Active);
        self.set_role(old, ContainerRole::Draining);

        // Drain: let in-flight connections finish. Shutdown shortens the
        // wait, never the pool.
        tokio::select! {
            _ = tokio::time::sleep(self.drain_grace) => {}
            _ = self.shutdown.cancelled() => {}
        }

        // Draining: flush, stop, remove
        self.set_cycle_state(CycleState::Draining);
        if let Err(reason) = self.hook.flush(old).await {
            warn!(container = %old, "pre-stop hook failed: {}", reason);
            self.audit.record(
                AuditEvent::draft(
                    actor.clone(),
                    AuditAction::PreStopHook,
                    old,
                    AuditResult::Failed,
                )
                .with_reason(reason),
            );
        }

        if let Err(err) = self.broker.stop(old).await {
            self.audit.record(
                AuditEvent::draft(
                    actor.clone(),
                    AuditAction::ContainerStop,
                    old,
                    AuditResult::Failed,
                )
                .with_reason(err.to_string()),
            );
            // the old container keeps serving; leave it pooled and active
            self.set_role(old, ContainerRole::Active);
            return Err(CycleFailure {
                outcome: CycleOutcome::Failed,
                reason: format!("stop of {old} failed: {err}"),
            });
        }

        match self.pool.remove(&slot.service, old).await {
            Ok(()) => {
                self.audit.record(
                    AuditEvent::draft(
                        actor.clone(),
                        AuditAction::ContainerStop,
                        old,
                        AuditResult::Ok,
                    )
                    .with_reason("drained, removed from backend pool"),
                );
                self.retire(old);
                Ok(())
            }
            Err(err) => {
                self.audit.record(
                    AuditEvent::draft(
                        actor.clone(),
                        AuditAction::ContainerStop,
                        old,
                        AuditResult::Ok,
                    )
                    .with_reason(format!("stopped, but pool removal failed: {err}")),
                );
                self.retire(old);
                Err(CycleFailure {
                    outcome: CycleOutcome::Failed,
                    reason: format!("pool removal failed: {err}"),
                })
            }
        }
    }

    /// Best-effort stop of a standby that never made it into the pool.
    async fn stop_discarded_standby(&self, standby: &str, actor: &Actor) {
        match self.broker.stop(standby).await {
            Ok(()) => {
                self.audit.record(
                    AuditEvent::draft(
                        actor.clone(),
                        AuditAction::ContainerStop,
                        standby,
                        AuditResult::Ok,
                    )
                    .with_reason("discarded standby"),
                );
            }
            Err(err) => {
                warn!(container = %standby, "failed to stop discarded standby: {}", err);
                self.audit.record(
                    AuditEvent::draft(
                        actor.clone(),
                        AuditAction::ContainerStop,
                        standby,
                        AuditResult::Failed,
                    )
                    .with_reason(err.to_string()),
                );
            }
        }
        self.retire(standby);
    }

    fn set_cycle_state(&self, cycle_state: CycleState) {
        let mut state = self.state.lock().expect("poisoned controller lock");
        if let Some(cycle) = state.current.as_mut() {
            cycle.state = cycle_state;
        }
    }

    fn set_role(&self, name: &str, role: ContainerRole) {
        let mut state = self.state.lock().expect("poisoned controller lock");
        if let Some(container) = state.containers.get_mut(name) {
            container.role = role;
            container.last_transition_at = OffsetDateTime::now_utc();
        }
    }

    fn set_health(&self, name: &str, health: ContainerHealth) {
        let mut state = self.state.lock().expect("poisoned controller lock");
        if let Some(container) = state.containers.get_mut(name) {
            container.health = health;
            container.last_transition_at = OffsetDateTime::now_utc();
        }
    }

    /// Retires a container record: stopped and out of the pool means the
    /// controller no longer tracks it.
    fn retire(&self, name: &str) {
        let mut state = self.state.lock().expect("poisoned controller lock");
        state.containers.remove(name);
    }
}
