use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use audit::{AuditAction, AuditRecorder, AuditResult, MemorySink};
use health::HealthRegistry;
use reqwest::StatusCode;
use serde_json::{json, Value};

use broker::cache::InspectCache;
use broker::router::router;
use broker::runtime::FakeRuntime;

const TOKEN: &str = "s3cret";

struct TestBroker {
    base: String,
    runtime: FakeRuntime,
    sink: MemorySink,
}

impl TestBroker {
    async fn spawn(allowlist: &str, cache_ttl: Duration) -> Self {
        let runtime = FakeRuntime::new().with_containers(json!([
            {"Id": "aaa", "Names": ["/web1"], "State": "running"},
            {"Id": "bbb", "Names": ["/web2"], "State": "running"},
            {"Id": "ccc", "Names": ["/etcd-prod"], "State": "running"},
        ]));
        let sink = MemorySink::new();
        let audit = AuditRecorder::new(Arc::new(sink.clone()), 64);
        let liveness = HealthRegistry::new("test_liveness");

        let app = router(
            TOKEN.to_string(),
            allowlist.parse().expect("valid allowlist"),
            Arc::new(runtime.clone()),
            InspectCache::new(cache_ttl, 64),
            audit,
            liveness,
            false,
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("could not bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            runtime,
            sink,
        }
    }

    async fn audited(&self, action: AuditAction) -> Vec<audit::AuditEvent> {
        // sink writes land on a background task
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let matching: Vec<_> = self
                .sink
                .events()
                .into_iter()
                .filter(|e| e.action == action)
                .collect();
            if !matching.is_empty() || tokio::time::Instant::now() > deadline {
                return matching;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn missing_token_is_rejected_before_the_runtime() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_secs(3)).await;

    let res = client()
        .post(format!("{}/containers/web2/start", broker.base))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("bearer token"));
    assert!(broker.runtime.calls().is_empty());
}

#[tokio::test]
async fn wrong_token_is_rejected_before_the_runtime() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_secs(3)).await;

    let res = client()
        .post(format!("{}/containers/web2/start", broker.base))
        .bearer_auth("not-the-token")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(broker.runtime.calls().is_empty());
    assert!(!broker.audited(AuditAction::AuthReject).await.is_empty());
}

#[tokio::test]
async fn disallowed_target_yields_allowlist_violation_and_zero_runtime_calls() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_secs(3)).await;

    let res = client()
        .post(format!("{}/containers/etcd-prod/start", broker.base))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    let body: Value = res.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not allowlisted"));
    assert!(broker.runtime.calls().is_empty());

    let rejections = broker.audited(AuditAction::AllowlistReject).await;
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].target, "etcd-prod");
    assert_eq!(rejections[0].result, AuditResult::Rejected);
    match &rejections[0].actor {
        audit::Actor::Operator { identity } => assert!(identity.contains("127.0.0.1")),
        other => panic!("expected operator actor, got {other:?}"),
    }
}

#[tokio::test]
async fn allowed_start_reaches_the_runtime_and_is_audited_once() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_secs(3)).await;

    let res = client()
        .post(format!("{}/containers/web2/start", broker.base))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["container"], "web2");
    assert_eq!(broker.runtime.calls(), vec!["start:web2"]);

    let audited = broker.audited(AuditAction::ContainerStart).await;
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].result, AuditResult::Ok);
}

#[tokio::test]
async fn allowed_stop_reaches_the_runtime() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_secs(3)).await;

    let res = client()
        .post(format!("{}/containers/web1/stop", broker.base))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(broker.runtime.calls(), vec!["stop:web1"]);
}

#[tokio::test]
async fn inspect_results_are_cached_within_ttl() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_secs(3)).await;
    let url = format!("{}/containers/json?name=web1", broker.base);

    for _ in 0..3 {
        let res = client().get(&url).bearer_auth(TOKEN).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    assert_eq!(broker.runtime.calls(), vec!["list:web1"]);
}

#[tokio::test]
async fn inspect_after_ttl_expiry_triggers_one_fresh_runtime_call() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_millis(100)).await;
    let url = format!("{}/containers/json?name=web1", broker.base);

    let res = client().get(&url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(250)).await;

    let res = client().get(&url).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    assert_eq!(broker.runtime.calls(), vec!["list:web1", "list:web1"]);
}

#[tokio::test]
async fn unfiltered_inspect_narrows_to_allowlisted_containers() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop,inspect", Duration::from_secs(3)).await;

    let res = client()
        .get(format!("{}/containers/json", broker.base))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["Names"][0].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["/web1", "/web2"]);
}

#[tokio::test]
async fn inspect_on_disallowed_name_is_rejected() {
    let broker = TestBroker::spawn("web[0-9]+:start,stop", Duration::from_secs(3)).await;

    let res = client()
        .get(format!("{}/containers/json?name=web1", broker.base))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    // start/stop only: inspect is not in the entry's operation set
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert!(broker.runtime.calls().is_empty());
}
