use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use control::{ControlClient, ControlError, FetchPolicy};
use tokio::net::TcpListener;

const DEFINITION: &str = r#"{
    "pipeline": {
        "crawler": {"handler": "crawler", "first": true, "next_task_name": "parser",
                    "routing_key": "index.crawler", "bucket_name": "raw", "object_name": "raw.json"},
        "parser": {"handler": "parser", "last": true,
                   "routing_key": "build.parser", "bucket_name": "parsed", "object_name": "parsed.txt"}
    },
    "exchange_name": "index",
    "backlog_queue_name": "backlog",
    "builder_queue_name": "builder"
}"#;

/// Serves `/pipeline/config`, answering 500 for the first `failures` calls.
async fn serve(failures: u32) -> (String, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/pipeline/config",
            get(|State((calls, failures)): State<(Arc<AtomicU32>, u32)>| async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                } else {
                    (StatusCode::OK, DEFINITION.to_string())
                }
            }),
        )
        .with_state((Arc::clone(&calls), failures));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), calls)
}

fn fast_policy(attempts: u32) -> FetchPolicy {
    FetchPolicy {
        attempts,
        initial_backoff: Duration::from_millis(5),
        multiplier: 2,
        request_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn retries_until_the_endpoint_recovers() {
    let (url, calls) = serve(2).await;
    let client = ControlClient::new(&url, fast_policy(3)).unwrap();

    let definition = client.fetch_pipeline().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(definition.first_stage().0.as_str(), "crawler");
    assert_eq!(definition.builder_queue_name().as_str(), "builder");
}

#[tokio::test]
async fn gives_up_after_the_attempt_budget() {
    let (url, calls) = serve(u32::MAX).await;
    let client = ControlClient::new(&url, fast_policy(3)).unwrap();

    let err = client.fetch_pipeline().await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
        ControlError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, ControlError::Status { status: 500, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_exhausted() {
    let client = ControlClient::new("http://127.0.0.1:1", fast_policy(2)).unwrap();
    let err = client.fetch_pipeline().await.unwrap_err();
    assert!(matches!(err, ControlError::Exhausted { attempts: 2, .. }));
}
