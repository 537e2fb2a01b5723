#![cfg(feature = "http")]

mod common;

use std::time::Duration;

use common::{Recorder, wait_until};
use netkit::{
    CallBehavior, CallErrorKind, CallRequest, HttpBridgeConfig, NetkitError, NetworkServices,
    SchedulerConfig, TransactionErrorKind,
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

fn services() -> NetworkServices {
    let config = SchedulerConfig::new().maintenance_interval(Duration::from_millis(50));
    NetworkServices::start_http(config, HttpBridgeConfig::default()).unwrap()
}

fn fast_retries(max_retries: u32) -> CallBehavior {
    CallBehavior::builder()
        .max_retries(max_retries)
        .retry_delay(Duration::from_millis(10))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_get_json_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .and(header("cache-control", "no-cache"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]})))
        .expect(1)
        .mount(&server)
        .await;

    let services = services();
    let response = services
        .transactions()
        .get_json(
            &format!("{}/items", server.uri()),
            &(),
            CallBehavior::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.payload, json!({"items": [1, 2]}));
}

#[tokio::test]
async fn test_post_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_json(json!({"a": 1})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let services = services();
    let response = services
        .transactions()
        .post_json(
            &format!("{}/orders", server.uri()),
            &json!({"a": 1}),
            CallBehavior::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.payload["status"], "ok");
}

#[tokio::test]
async fn test_redirect_is_reported_and_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved here"))
        .mount(&server)
        .await;

    let services = services();
    let recorder = Recorder::new();
    let id = services.scheduler().submit(
        CallRequest::get(format!("{}/old", server.uri())),
        CallBehavior::default(),
        recorder.clone(),
    );
    wait_until(|| recorder.is_finished(id)).await;

    assert_eq!(
        recorder.names(id),
        [
            "started",
            "redirected",
            "header_loaded",
            "succeeded",
            "finished"
        ]
    );
    match &recorder.events(id)[3].event {
        netkit::CallEvent::Succeeded(response) => {
            assert_eq!(response.text(), "moved here");
            assert_eq!(response.url, format!("{}/new", server.uri()));
        }
        other => panic!("unexpected event {other}"),
    }
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "not found"})))
        .expect(1)
        .mount(&server)
        .await;

    let services = services();
    let err = services
        .transactions()
        .get_json(&format!("{}/missing", server.uri()), &(), fast_retries(2))
        .await
        .unwrap_err();

    match err {
        NetkitError::Transaction(failure) => {
            assert_eq!(
                failure.kind,
                TransactionErrorKind::Call(CallErrorKind::BadRequest)
            );
            assert_eq!(failure.status, Some(404));
            assert_eq!(failure.json, Some(json!({"error": "not found"})));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let services = services();
    let err = services
        .scheduler()
        .call(
            CallRequest::get(format!("{}/broken", server.uri())),
            fast_retries(2),
        )
        .wait()
        .await
        .unwrap_err();

    match err {
        NetkitError::Call(failure) => {
            assert_eq!(failure.kind, CallErrorKind::BadServer);
            assert_eq!(failure.status, Some(503));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_connection_refused_is_retried() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let services = services();
    let err = services
        .scheduler()
        .call(
            CallRequest::get(format!("http://127.0.0.1:{port}/")),
            fast_retries(1),
        )
        .wait()
        .await
        .unwrap_err();

    match err {
        NetkitError::Call(failure) => assert_eq!(failure.kind, CallErrorKind::NoConnection),
        other => panic!("unexpected error {other}"),
    }
    let stats = services.scheduler().snapshot_statistics();
    assert_eq!(stats.total_retries, 1);
    assert_eq!(stats.failures.no_connection, 1);
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("late")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let services = services();
    let behavior = CallBehavior::builder()
        .timeout(Duration::from_millis(300))
        .max_retries(0)
        .build()
        .unwrap();
    let err = services
        .scheduler()
        .call(CallRequest::get(format!("{}/slow", server.uri())), behavior)
        .wait()
        .await
        .unwrap_err();

    match err {
        NetkitError::Call(failure) => assert_eq!(failure.kind, CallErrorKind::TimedOut),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(
        services.scheduler().snapshot_statistics().num_calls_in_flight,
        0
    );
}

#[tokio::test]
async fn test_post_redirected_with_302_continues_as_get() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/done"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/done"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"saved": true})))
        .expect(1)
        .mount(&server)
        .await;

    let services = services();
    let response = services
        .transactions()
        .post_json(
            &format!("{}/submit", server.uri()),
            &json!({"a": 1}),
            CallBehavior::default(),
        )
        .await
        .unwrap();

    assert_eq!(response.payload, json!({"saved": true}));
    assert_eq!(response.url, format!("{}/done", server.uri()));
}
