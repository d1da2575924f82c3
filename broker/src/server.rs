use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use audit::{AuditRecorder, TracingSink};
use health::HealthRegistry;
use tokio::net::TcpListener;

use crate::cache::InspectCache;
use crate::config::Config;
use crate::router::router;
use crate::runtime::{ContainerRuntime, HttpRuntime};

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("broker_liveness");

    let runtime: Arc<dyn ContainerRuntime + Send + Sync> = Arc::new(HttpRuntime::new(
        config.runtime_url.clone(),
        Duration::from_secs(config.runtime_timeout_secs),
        Duration::from_secs(config.stop_grace_secs),
    ));

    // The broker itself is request-driven; the watchdog pings the runtime
    // so a dead engine socket shows up on /_liveness instead of only on
    // the next rotation.
    let watchdog = liveness
        .register("runtime".to_string(), Duration::from_secs(30))
        .await;
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                match runtime.ping().await {
                    Ok(()) => watchdog.report_healthy().await,
                    Err(err) => {
                        tracing::warn!("runtime ping failed: {}", err);
                        watchdog
                            .report_status(health::ComponentStatus::Unhealthy)
                            .await
                    }
                }
            }
        });
    }

    let cache = InspectCache::new(
        Duration::from_secs(config.inspect_cache_ttl_secs),
        config.inspect_cache_capacity,
    );
    let audit = AuditRecorder::new(Arc::new(TracingSink {}), config.audit_recent_capacity);

    let app = router(
        config.broker_token,
        config.broker_allowlist,
        runtime,
        cache,
        audit,
        liveness,
        config.export_prometheus,
    );

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .unwrap()
}
