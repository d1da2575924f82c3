use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use audit::{AuditRecorder, ReportGate, TracingSink};
use health::HealthRegistry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::broker_client::BrokerClient;
use crate::config::Config;
use crate::controller::RotationController;
use crate::hooks::{HttpPreStopHook, NoopHook, PreStopHook};
use crate::pool::{BackendPool, FileApplier};
use crate::probe::HttpProber;
use crate::router::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("rotor_liveness");
    let audit = AuditRecorder::new(Arc::new(TracingSink {}), config.audit_recent_capacity);

    let applier = Arc::new(FileApplier::new(
        config.upstream_file.clone().into(),
        config.proxy_reload_command.clone(),
        Duration::from_secs(config.proxy_reload_timeout_secs),
    ));
    let pool = Arc::new(BackendPool::new(config.backend_port, applier));

    let broker = Arc::new(BrokerClient::new(
        config.broker_url.clone(),
        config.broker_token.clone(),
        Duration::from_secs(config.broker_timeout_secs),
    ));

    let prober = Arc::new(HttpProber::new(
        config.backend_port,
        config.health_path.clone(),
        Duration::from_secs(config.probe_interval_secs),
        Duration::from_secs(config.probe_timeout_secs),
        config.probe_failure_threshold,
    ));

    let hook: Arc<dyn PreStopHook + Send + Sync> = match config.flush_path.clone() {
        Some(path) => Arc::new(HttpPreStopHook::new(
            config.backend_port,
            path,
            Duration::from_secs(config.flush_timeout_secs),
        )),
        None => Arc::new(NoopHook),
    };

    let cancel = CancellationToken::new();
    let controller = RotationController::new(
        config.rotation_slots.0.clone(),
        broker,
        pool,
        prober,
        hook,
        audit.clone(),
        Duration::from_secs(config.drain_grace_secs),
        cancel.clone(),
    );
    controller
        .bootstrap()
        .await
        .expect("failed to apply the baseline proxy configuration");

    // Rotation interval timer. The first rotation happens one full
    // interval after startup, not immediately.
    let rotation_interval = Duration::from_secs(config.rotation_interval_secs);
    let timer_health = liveness
        .register(
            "rotation_timer".to_string(),
            rotation_interval + Duration::from_secs(60),
        )
        .await;
    {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + rotation_interval,
                rotation_interval,
            );
            timer_health.report_healthy().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        timer_health.report_healthy().await;
                        controller.trigger_scheduled().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    let reports = Arc::new(ReportGate::new(
        config.report_max_bytes,
        config.reports_per_minute,
    ));
    {
        // keep the keyed rate-limiter state bounded
        let reports = reports.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => reports.clean(),
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    let app = router(
        controller.clone(),
        audit,
        reports,
        liveness,
        config.export_prometheus,
    );

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        cancel.cancel();
    })
    .await
    .unwrap();

    // An in-flight cycle gets a bounded grace to reach a terminal state.
    // Even a forced exit cannot empty the pool: the reconciler refuses any
    // removal that would.
    if !controller
        .wait_idle(Duration::from_secs(config.shutdown_grace_secs))
        .await
    {
        warn!("shutdown grace elapsed with a rotation still in flight");
    }
}
