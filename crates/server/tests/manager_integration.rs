use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use alertmux_common::now_unix;
use alertmux_common::tenant::TenantConfig;
use alertmux_server::api::USER_ID_HEADER;
use alertmux_server::http::{router, TenantState};
use alertmux_server::manager::{Manager, ManagerConfig};
use alertmux_server::metrics::ManagerMetrics;
use alertmux_server::store::inmem::InMemStore;
use alertmux_server::store::pump::ChangePump;
use alertmux_server::store::ConfigStore;

const VALID_CONFIG: &str = "route:\n  receiver: team-x\n  group_by: [alertname]\nreceivers:\n  - name: team-x\n    webhook_configs:\n      - url: http://127.0.0.1:9/hook\n";

fn tenant(user: &str) -> TenantConfig {
    TenantConfig {
        user_id: user.into(),
        config: VALID_CONFIG.into(),
        updated_at: now_unix(),
        ..Default::default()
    }
}

struct Harness {
    store: Arc<InMemStore>,
    manager: Arc<Manager>,
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

async fn start() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemStore::new());
    let stop = CancellationToken::new();
    let pump = ChangePump::new(store.clone(), stop.clone());
    let manager = Manager::new(
        ManagerConfig {
            data_dir: dir.path().to_path_buf(),
            retention: Duration::from_secs(3600),
            external_url: "/api/prom/alertmanager".into(),
            poll_interval: Duration::from_millis(50),
            peer: None,
            peer_timeout: Duration::from_secs(15),
        },
        pump,
        ManagerMetrics::new(),
    )
    .unwrap();
    let task = tokio::spawn(manager.clone().run());
    Harness {
        store,
        manager,
        stop,
        task,
        _dir: dir,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn engines_follow_store_lifecycle() {
    let h = start().await;

    // Created through the watch stream.
    h.store.set_config(&tenant("u1")).await.unwrap();
    settle().await;
    assert!(h.manager.engine("u1").await.is_some());

    // Deactivation tears the engine down before the next poll returns.
    h.store.deactivate_config("u1").await.unwrap();
    settle().await;
    assert!(h.manager.engine("u1").await.is_none());

    // Restore brings it back.
    h.store.restore_config("u1").await.unwrap();
    settle().await;
    assert!(h.manager.engine("u1").await.is_some());

    // Hard deletion arrives as a synthetic deleted config.
    h.store.delete_config("u1");
    settle().await;
    assert!(h.manager.engine("u1").await.is_none());

    h.manager.shutdown();
    h.task.await.unwrap();
    h.stop.cancel();
}

#[tokio::test]
async fn tenant_router_reaches_the_right_engine() {
    let h = start().await;
    h.store.set_config(&tenant("u1")).await.unwrap();
    settle().await;

    let app = router(
        "/api/prom/alertmanager",
        TenantState {
            manager: h.manager.clone(),
        },
    );

    let alerts = serde_json::json!([
        {"labels": {"alertname": "HighLoad", "job": "api"}}
    ]);
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/prom/alertmanager/api/v1/alerts")
                .header(USER_ID_HEADER, "u1")
                .header("content-type", "application/json")
                .body(Body::from(alerts.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/prom/alertmanager/api/v1/alerts")
                .header(USER_ID_HEADER, "u1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let raw = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let listed: Vec<serde_json::Value> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["labels"]["alertname"], "HighLoad");

    // Unknown tenants get a 404, not someone else's engine.
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/prom/alertmanager/api/v1/alerts")
                .header(USER_ID_HEADER, "u2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    h.manager.shutdown();
    h.task.await.unwrap();
    h.stop.cancel();
}

#[tokio::test]
async fn silences_are_tenant_scoped() {
    let h = start().await;
    h.store.set_config(&tenant("u1")).await.unwrap();
    h.store.set_config(&tenant("u2")).await.unwrap();
    settle().await;

    let app = router(
        "",
        TenantState {
            manager: h.manager.clone(),
        },
    );

    let silence = serde_json::json!({
        "id": "",
        "matchers": [{"name": "alertname", "value": "HighLoad", "is_regex": false}],
        "starts_at": 0,
        "ends_at": i64::MAX,
        "created_by": "ops",
        "comment": "maintenance"
    });
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/silences")
                .header(USER_ID_HEADER, "u1")
                .header("content-type", "application/json")
                .body(Body::from(silence.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/silences")
                .header(USER_ID_HEADER, "u2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let raw = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let listed: Vec<serde_json::Value> = serde_json::from_slice(&raw).unwrap();
    assert!(listed.is_empty());

    h.manager.shutdown();
    h.task.await.unwrap();
    h.stop.cancel();
}
