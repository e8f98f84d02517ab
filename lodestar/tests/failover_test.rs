//! Failover tests over real HTTP.
//!
//! The first datacenter consists of a node that answers 503 and a node whose
//! port is closed; the second datacenter has one healthy node. Calls must walk
//! the topology in order and land on the healthy node.

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use lodestar::{
    ApiRoot, AttemptListener, AttemptOutcome, AuditTrail, Command, CommandRunner, Datacenter,
    Deployment, Error, HttpExecutor, Node, ReqwestTransport, RetryPolicy, StaticTokenProvider,
};
use lodestar::config::HttpConfig;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://{}", addr)
}

/// Server answering 503 to everything, counting hits
async fn failing_server(hits: Arc<AtomicUsize>) -> String {
    let router = Router::new().route(
        "/api/json/v1",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::SERVICE_UNAVAILABLE, "overloaded")
            }
        }),
    );
    serve(router).await
}

async fn healthy_server() -> String {
    let router = Router::new().route(
        "/api/json/v1",
        post(|| async { Json(json!({"status": {"namespaces": ["default_keyspace"]}})) }),
    );
    serve(router).await
}

/// Address nobody listens on
async fn closed_port() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn node(id: &str, url: &str) -> Node {
    Node::new(id, url, url).unwrap()
}

fn executor(trail: Arc<AuditTrail>) -> HttpExecutor {
    let transport = ReqwestTransport::new(&HttpConfig {
        connect_timeout_ms: 500,
        ..Default::default()
    })
    .unwrap();
    HttpExecutor::new(Arc::new(transport))
        .with_retry(RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        })
        .with_request_timeout(Duration::from_secs(2))
        .with_listener(trail)
}

#[tokio::test]
async fn test_failover_to_second_datacenter() {
    let hits = Arc::new(AtomicUsize::new(0));
    let failing = failing_server(hits.clone()).await;
    let closed = closed_port().await;
    let healthy = healthy_server().await;

    let dc1 = Datacenter::new("dc1", Arc::new(StaticTokenProvider::new("t1")))
        .with_node(node("dc1-busy", &failing))
        .unwrap()
        .with_node(node("dc1-down", &closed))
        .unwrap();
    let dc2 = Datacenter::new("dc2", Arc::new(StaticTokenProvider::new("t2")))
        .with_node(node("dc2-ok", &healthy))
        .unwrap();
    let deployment = Arc::new(Deployment::new(vec![dc1, dc2]).unwrap());

    let trail = Arc::new(AuditTrail::new());
    let runner = CommandRunner::new(deployment, Arc::new(executor(trail.clone())));

    let response = runner
        .run_command(&ApiRoot, &Command::new("findNamespaces"))
        .await
        .unwrap();
    assert_eq!(
        response.status_strings("namespaces").unwrap(),
        vec!["default_keyspace"]
    );

    let route: Vec<String> = trail.route().into_iter().map(|(_, n)| n).collect();
    assert_eq!(
        route,
        vec!["dc1-busy", "dc1-busy", "dc1-down", "dc1-down", "dc2-ok"]
    );
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let events = trail.events();
    assert_eq!(events[0].http_status, Some(503));
    assert_eq!(events[2].error_class.as_deref(), Some("connect"));
    assert_eq!(events[4].outcome, AttemptOutcome::Success);
    assert_eq!(events[4].datacenter_id, "dc2");
}

#[tokio::test]
async fn test_exhausted_topology_reports_each_datacenter() {
    let hits = Arc::new(AtomicUsize::new(0));
    let failing = failing_server(hits.clone()).await;
    let closed = closed_port().await;

    let dc1 = Datacenter::new("dc1", Arc::new(StaticTokenProvider::new("t")))
        .with_node(node("a", &failing))
        .unwrap();
    let dc2 = Datacenter::new("dc2", Arc::new(StaticTokenProvider::new("t")))
        .with_node(node("b", &closed))
        .unwrap();
    let deployment = Deployment::new(vec![dc1, dc2]).unwrap();
    let trail = Arc::new(AuditTrail::new());

    let err = executor(trail.clone())
        .execute(&deployment, &ApiRoot, lodestar::HttpMethod::Post, Some("{}"), None)
        .await
        .unwrap_err();

    match err {
        Error::ExhaustedTopology { attempts, failures, deadline_exceeded } => {
            assert_eq!(attempts, 4);
            assert!(!deadline_exceeded);
            assert_eq!(failures.len(), 2);
            assert!(failures[0].last_error.contains("503"));
            assert_eq!(failures[1].datacenter, "dc2");
        }
        other => panic!("expected ExhaustedTopology, got {:?}", other),
    }
    assert_eq!(trail.len(), 4);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_listener_sees_every_attempt() {
    struct Counter(AtomicUsize);
    impl AttemptListener for Counter {
        fn on_attempt(&self, _event: &lodestar::AttemptEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let healthy = healthy_server().await;
    let deployment = Deployment::single(
        Datacenter::new("dc1", Arc::new(StaticTokenProvider::new("t")))
            .with_node(node("n1", &healthy))
            .unwrap(),
    )
    .unwrap();
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    let executor = executor(Arc::new(AuditTrail::new())).with_listener(counter.clone());

    for _ in 0..3 {
        executor
            .execute(&deployment, &ApiRoot, lodestar::HttpMethod::Post, Some("{}"), None)
            .await
            .unwrap();
    }
    assert_eq!(counter.0.load(Ordering::SeqCst), 3);
}
