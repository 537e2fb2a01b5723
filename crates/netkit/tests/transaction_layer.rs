mod common;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use common::{behavior, harness, wait_until};
use netkit::{
    CallErrorKind, CallId, ContextId, ExecutionContext, NetkitError, QuotaPolicy,
    TransactionErrorKind, TransactionFailure, TransactionLayer, TransactionObserver,
    TransactionResponse, TransportError,
};
use serde_json::{Value, json};

const URL: &str = "https://api.example.com/v2/orders";

#[derive(Default)]
struct Outcomes {
    succeeded: Mutex<Vec<(CallId, Value, Option<ContextId>)>>,
    failed: Mutex<Vec<(CallId, TransactionFailure)>>,
}

impl TransactionObserver for Outcomes {
    fn did_succeed(&self, call: CallId, response: TransactionResponse) {
        self.succeeded
            .lock()
            .unwrap()
            .push((call, response.payload, ExecutionContext::current()));
    }

    fn did_fail(&self, call: CallId, failure: TransactionFailure) {
        self.failed.lock().unwrap().push((call, failure));
    }
}

#[tokio::test]
async fn test_post_accepted_by_default_classifier() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());

    let task = tokio::spawn({
        let layer = layer.clone();
        async move {
            layer
                .post_json(URL, &json!({"a": 1}), behavior().build().unwrap())
                .await
        }
    });

    wait_until(|| h.transport.opened() == 1).await;
    let request = h.transport.request(0);
    assert_eq!(request.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
    assert_eq!(
        request.headers.get("Content-Type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(
        request.headers.get("Accept").map(String::as_str),
        Some("application/json")
    );

    h.transport.respond(0, 200, br#"{"status":"ok"}"#);
    let response = task.await.unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.payload, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_classifier_rejects_successful_status() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::with_classifier(h.scheduler.clone(), |payload: &Value, _: u16| {
        payload["status"] == "ok"
    });
    let outcomes = Arc::new(Outcomes::default());

    let id = layer
        .post(
            URL,
            &json!({"a": 1}),
            behavior().build().unwrap(),
            outcomes.clone(),
        )
        .unwrap();
    h.transport.respond(0, 200, br#"{"status":"fail"}"#);
    wait_until(|| !outcomes.failed.lock().unwrap().is_empty()).await;

    let failed = outcomes.failed.lock().unwrap();
    let (call, failure) = &failed[0];
    assert_eq!(*call, id);
    assert_eq!(
        failure.kind,
        TransactionErrorKind::Call(CallErrorKind::BadServer)
    );
    assert_eq!(failure.status, Some(200));
    assert_eq!(failure.json, Some(json!({"status": "fail"})));
    assert!(outcomes.succeeded.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_decode_failure_carries_raw_bytes() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());

    let task = tokio::spawn({
        let layer = layer.clone();
        async move {
            layer
                .get_json(URL, &(), behavior().build().unwrap())
                .await
        }
    });
    wait_until(|| h.transport.opened() == 1).await;
    h.transport.respond(0, 200, b"<html>oops</html>");

    let err = task.await.unwrap().unwrap_err();
    match err {
        NetkitError::Transaction(failure) => {
            assert_eq!(failure.kind, TransactionErrorKind::JsonDecodeFailure);
            assert_eq!(&failure.raw[..], b"<html>oops</html>");
            assert_eq!(failure.status, Some(200));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_empty_body_decodes_to_null() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());

    let task = tokio::spawn({
        let layer = layer.clone();
        async move { layer.get_json(URL, &(), behavior().build().unwrap()).await }
    });
    wait_until(|| h.transport.opened() == 1).await;
    h.transport.respond(0, 204, b"");

    let response = task.await.unwrap().unwrap();
    assert_eq!(response.status, 204);
    assert_eq!(response.payload, Value::Null);
}

#[tokio::test]
async fn test_get_parameters_go_into_query() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());
    let outcomes = Arc::new(Outcomes::default());

    layer
        .get(
            URL,
            &json!({"state": "open", "limit": 20}),
            behavior().build().unwrap(),
            outcomes.clone(),
        )
        .unwrap();

    let url = url::Url::parse(&h.transport.request(0).url).unwrap();
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    pairs.sort();
    assert_eq!(
        pairs,
        [
            ("limit".to_string(), "20".to_string()),
            ("state".to_string(), "open".to_string())
        ]
    );
    assert!(h.transport.request(0).body.is_none());
}

#[tokio::test]
async fn test_handler_pair_runs_on_call_context() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());
    let delivered = Arc::new(Mutex::new(None));
    let failed = Arc::new(AtomicBool::new(false));

    layer
        .get_with(
            URL,
            &(),
            behavior().context("ui").build().unwrap(),
            {
                let delivered = delivered.clone();
                move |response| {
                    *delivered.lock().unwrap() =
                        Some((response.payload, ExecutionContext::current()));
                }
            },
            {
                let failed = failed.clone();
                move |_| failed.store(true, Ordering::SeqCst)
            },
        )
        .unwrap();

    h.transport.respond(0, 200, br#"[1,2,3]"#);
    wait_until(|| delivered.lock().unwrap().is_some()).await;

    let (payload, context) = delivered.lock().unwrap().take().unwrap();
    assert_eq!(payload, json!([1, 2, 3]));
    assert_eq!(context, Some(ContextId::new("ui")));
    assert!(!failed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_failure_handler_is_never_invoked_inline() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());
    let failure = Arc::new(Mutex::new(None));
    h.transport
        .refuse_next(TransportError::connect("offline"));

    layer
        .post_with(
            URL,
            &json!({"a": 1}),
            behavior().max_retries(0).build().unwrap(),
            |_| panic!("unexpected success"),
            {
                let failure = failure.clone();
                move |f| *failure.lock().unwrap() = Some(f)
            },
        )
        .unwrap();
    assert!(failure.lock().unwrap().is_none());

    wait_until(|| failure.lock().unwrap().is_some()).await;
    let failure = failure.lock().unwrap().take().unwrap();
    assert_eq!(
        failure.kind,
        TransactionErrorKind::Call(CallErrorKind::NoConnection)
    );
    assert!(failure.raw.is_empty());
}

#[tokio::test]
async fn test_error_body_is_decoded_when_possible() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());
    let outcomes = Arc::new(Outcomes::default());

    layer
        .get(URL, &(), behavior().build().unwrap(), outcomes.clone())
        .unwrap();
    h.transport
        .respond(0, 422, br#"{"error":"quantity must be positive"}"#);
    wait_until(|| !outcomes.failed.lock().unwrap().is_empty()).await;

    let failed = outcomes.failed.lock().unwrap();
    let failure = &failed[0].1;
    assert_eq!(
        failure.kind,
        TransactionErrorKind::Call(CallErrorKind::BadRequest)
    );
    assert_eq!(
        failure.json,
        Some(json!({"error": "quantity must be positive"}))
    );
}

#[tokio::test]
async fn test_dropping_awaited_transaction_cancels_call() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());

    let task = tokio::spawn({
        let layer = layer.clone();
        async move { layer.get_json(URL, &(), behavior().build().unwrap()).await }
    });
    wait_until(|| h.transport.opened() == 1).await;

    task.abort();
    let _ = task.await;

    assert_eq!(h.transport.cancelled(), vec![h.transport.handle(0)]);
    assert_eq!(h.scheduler.snapshot_statistics().total_cancelled_calls, 1);
}

#[tokio::test]
async fn test_invalid_url_is_rejected_before_submission() {
    let h = harness(QuotaPolicy::default());
    let layer = TransactionLayer::new(h.scheduler.clone());
    let outcomes = Arc::new(Outcomes::default());

    let err = layer
        .get("not a url", &(), behavior().build().unwrap(), outcomes.clone())
        .unwrap_err();
    assert!(matches!(err, NetkitError::InvalidUrl(_)));
    assert_eq!(h.transport.opened(), 0);
    assert_eq!(h.scheduler.snapshot_statistics().total_submitted, 0);
}
