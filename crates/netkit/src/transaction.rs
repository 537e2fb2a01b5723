//! JSON transactions on top of the call scheduler.
//!
//! A transaction is one scheduler call whose request body is encoded from,
//! and whose response body is decoded into, a [`serde_json::Value`]. After a
//! successful call the decoded payload and status go through a
//! [`ResponseClassifier`], which may still turn the outcome into a failure.
//!
//! Outcomes can be received three ways, all backed by the same completion:
//! - a [`TransactionObserver`] (`get` / `post`),
//! - a single-use success/failure handler pair (`get_with` / `post_with`),
//! - an awaited future (`get_json` / `post_json`).
//!
//! Callbacks always run on the call's execution context, never inline with
//! the submission.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::{
    behavior::CallBehavior,
    call::CallId,
    error::{CallErrorKind, CallFailure, NetkitError, NetkitResult},
    observer::{CallEvent, CallObserver},
    scheduler::CallScheduler,
    transport::{CallRequest, CallResponse},
};

/// Decides whether a decoded response counts as a success.
///
/// The default implementation accepts every response that the scheduler
/// already considered successful.
pub trait ResponseClassifier: Send + Sync + 'static {
    fn is_success(&self, payload: &Value, status: u16) -> bool {
        let _ = (payload, status);
        true
    }

    /// Kind reported for a response rejected by [`Self::is_success`].
    fn rejection_kind(&self, payload: &Value, status: u16) -> CallErrorKind {
        let _ = (payload, status);
        CallErrorKind::BadServer
    }
}

/// Accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl ResponseClassifier for DefaultClassifier {}

impl<F> ResponseClassifier for F
where
    F: Fn(&Value, u16) -> bool + Send + Sync + 'static,
{
    fn is_success(&self, payload: &Value, status: u16) -> bool {
        self(payload, status)
    }
}

/// Why a transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The underlying call failed, or the classifier rejected the response.
    Call(CallErrorKind),
    /// The call succeeded but the body was not valid JSON.
    JsonDecodeFailure,
}

impl fmt::Display for TransactionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(kind) => fmt::Display::fmt(kind, f),
            Self::JsonDecodeFailure => f.write_str("JSON decode failure"),
        }
    }
}

/// Terminal failure of a transaction.
#[derive(Debug, Clone, Error)]
#[error("transaction failed ({kind}){}", status_suffix(.status))]
pub struct TransactionFailure {
    pub kind: TransactionErrorKind,
    pub status: Option<u16>,
    /// The error body, if it decoded as JSON.
    pub json: Option<Value>,
    /// The raw body, kept for diagnosing malformed responses.
    pub raw: Bytes,
    pub message: Option<String>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(", status {s}")).unwrap_or_default()
}

impl TransactionFailure {
    fn from_call(failure: CallFailure) -> Self {
        let json = if failure.body.is_empty() {
            None
        } else {
            serde_json::from_slice(&failure.body).ok()
        };
        Self {
            kind: TransactionErrorKind::Call(failure.kind),
            status: failure.status,
            json,
            raw: failure.body,
            message: failure.message,
        }
    }
}

/// A successful transaction.
#[derive(Debug, Clone)]
pub struct TransactionResponse {
    pub status: u16,
    pub payload: Value,
    pub headers: HashMap<String, String>,
    /// URL the payload was finally served from.
    pub url: String,
    pub latency: Duration,
}

pub type TransactionOutcome = Result<TransactionResponse, TransactionFailure>;

/// Receives the outcome of transactions it was submitted with.
pub trait TransactionObserver: Send + Sync + 'static {
    fn did_succeed(&self, call: CallId, response: TransactionResponse);
    fn did_fail(&self, call: CallId, failure: TransactionFailure);
}

type Completion = Box<dyn FnOnce(CallId, TransactionOutcome) + Send>;

/// Call observer that decodes and classifies, then resolves once.
struct TransactionCall<C> {
    classifier: Arc<C>,
    complete: Mutex<Option<Completion>>,
}

impl<C: ResponseClassifier> CallObserver for TransactionCall<C> {
    fn on_event(&self, call: CallId, event: CallEvent) {
        let outcome = match event {
            CallEvent::Succeeded(response) => classify(&*self.classifier, call, response),
            CallEvent::Failed(failure) => Err(TransactionFailure::from_call(failure)),
            _ => return,
        };
        if let Some(complete) = self.complete.lock().take() {
            complete(call, outcome);
        }
    }
}

/// Decode a response body. Blank bodies decode to `null`.
fn decode(body: &[u8]) -> Result<Value, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
}

fn classify<C: ResponseClassifier + ?Sized>(
    classifier: &C,
    call: CallId,
    response: CallResponse,
) -> TransactionOutcome {
    let payload = match decode(&response.body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(%call, status = response.status, error = %e, "Response body is not valid JSON");
            return Err(TransactionFailure {
                kind: TransactionErrorKind::JsonDecodeFailure,
                status: Some(response.status),
                json: None,
                raw: response.body,
                message: Some(e.to_string()),
            });
        }
    };

    if !classifier.is_success(&payload, response.status) {
        let kind = classifier.rejection_kind(&payload, response.status);
        debug!(%call, status = response.status, %kind, "Response rejected by classifier");
        return Err(TransactionFailure {
            kind: TransactionErrorKind::Call(kind),
            status: Some(response.status),
            json: Some(payload),
            raw: response.body,
            message: None,
        });
    }

    Ok(TransactionResponse {
        status: response.status,
        payload,
        headers: response.headers,
        url: response.url,
        latency: response.latency,
    })
}

/// Append `params` to the query string of `url`.
///
/// `params` must serialize to a JSON object (or `null` for none). String
/// values are sent verbatim, everything else as compact JSON text.
fn encode_query<P: Serialize + ?Sized>(url: &str, params: &P) -> NetkitResult<String> {
    let mut url = Url::parse(url)?;
    match serde_json::to_value(params)? {
        Value::Null => {}
        Value::Object(map) if map.is_empty() => {}
        Value::Object(map) => {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &map {
                match value {
                    Value::String(s) => pairs.append_pair(key, s),
                    other => pairs.append_pair(key, &other.to_string()),
                };
            }
        }
        _ => return Err(NetkitError::config("query parameters must be a JSON object")),
    }
    Ok(url.into())
}

/// Cancels the call when an awaited transaction is dropped early.
struct CancelOnDrop {
    scheduler: Arc<CallScheduler>,
    call: CallId,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        // No-op once the call is terminal.
        self.scheduler.cancel(self.call);
    }
}

/// JSON request/response layer over a [`CallScheduler`].
pub struct TransactionLayer<C = DefaultClassifier> {
    scheduler: Arc<CallScheduler>,
    classifier: Arc<C>,
}

impl<C> Clone for TransactionLayer<C> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<C> fmt::Debug for TransactionLayer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionLayer")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl TransactionLayer<DefaultClassifier> {
    pub fn new(scheduler: Arc<CallScheduler>) -> Self {
        Self::with_classifier(scheduler, DefaultClassifier)
    }
}

impl<C: ResponseClassifier> TransactionLayer<C> {
    /// Create a layer that classifies responses with `classifier`.
    pub fn with_classifier(scheduler: Arc<CallScheduler>, classifier: C) -> Self {
        Self {
            scheduler,
            classifier: Arc::new(classifier),
        }
    }

    pub fn scheduler(&self) -> &Arc<CallScheduler> {
        &self.scheduler
    }

    /// Submit a prepared request; `complete` runs exactly once unless the
    /// call is cancelled.
    pub fn submit(
        &self,
        request: CallRequest,
        behavior: CallBehavior,
        complete: impl FnOnce(CallId, TransactionOutcome) + Send + 'static,
    ) -> CallId {
        let observer = TransactionCall {
            classifier: Arc::clone(&self.classifier),
            complete: Mutex::new(Some(Box::new(complete))),
        };
        self.scheduler
            .submit(request, behavior, Arc::new(observer))
    }

    /// GET `url` with `params` in the query string.
    pub fn get<P: Serialize + ?Sized>(
        &self,
        url: &str,
        params: &P,
        behavior: CallBehavior,
        observer: Arc<dyn TransactionObserver>,
    ) -> NetkitResult<CallId> {
        let request = get_request(url, params)?;
        Ok(self.submit(request, behavior, move |call, outcome| {
            notify(&*observer, call, outcome)
        }))
    }

    /// POST `body` as JSON to `url`.
    pub fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        behavior: CallBehavior,
        observer: Arc<dyn TransactionObserver>,
    ) -> NetkitResult<CallId> {
        let request = post_request(url, body)?;
        Ok(self.submit(request, behavior, move |call, outcome| {
            notify(&*observer, call, outcome)
        }))
    }

    /// GET with a single-use success/failure handler pair.
    pub fn get_with<P, S, F>(
        &self,
        url: &str,
        params: &P,
        behavior: CallBehavior,
        on_success: S,
        on_failure: F,
    ) -> NetkitResult<CallId>
    where
        P: Serialize + ?Sized,
        S: FnOnce(TransactionResponse) + Send + 'static,
        F: FnOnce(TransactionFailure) + Send + 'static,
    {
        let request = get_request(url, params)?;
        Ok(self.submit(request, behavior, split(on_success, on_failure)))
    }

    /// POST with a single-use success/failure handler pair.
    pub fn post_with<B, S, F>(
        &self,
        url: &str,
        body: &B,
        behavior: CallBehavior,
        on_success: S,
        on_failure: F,
    ) -> NetkitResult<CallId>
    where
        B: Serialize + ?Sized,
        S: FnOnce(TransactionResponse) + Send + 'static,
        F: FnOnce(TransactionFailure) + Send + 'static,
    {
        let request = post_request(url, body)?;
        Ok(self.submit(request, behavior, split(on_success, on_failure)))
    }

    /// GET and await the outcome. Dropping the future cancels the call.
    pub async fn get_json<P: Serialize + ?Sized>(
        &self,
        url: &str,
        params: &P,
        behavior: CallBehavior,
    ) -> NetkitResult<TransactionResponse> {
        let request = get_request(url, params)?;
        self.run(request, behavior).await
    }

    /// POST and await the outcome. Dropping the future cancels the call.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        behavior: CallBehavior,
    ) -> NetkitResult<TransactionResponse> {
        let request = post_request(url, body)?;
        self.run(request, behavior).await
    }

    /// Cancel a transaction. See [`CallScheduler::cancel`].
    pub fn cancel(&self, call: CallId) -> bool {
        self.scheduler.cancel(call)
    }

    async fn run(
        &self,
        request: CallRequest,
        behavior: CallBehavior,
    ) -> NetkitResult<TransactionResponse> {
        let (tx, rx) = oneshot::channel();
        let call = self.submit(request, behavior, move |_, outcome| {
            let _ = tx.send(outcome);
        });
        let _guard = CancelOnDrop {
            scheduler: Arc::clone(&self.scheduler),
            call,
        };

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(NetkitError::Cancelled { call }),
        }
    }
}

fn get_request<P: Serialize + ?Sized>(url: &str, params: &P) -> NetkitResult<CallRequest> {
    let url = encode_query(url, params)?;
    Ok(CallRequest::get(url).header("Accept", "application/json"))
}

fn post_request<B: Serialize + ?Sized>(url: &str, body: &B) -> NetkitResult<CallRequest> {
    Url::parse(url)?;
    CallRequest::post(url)
        .header("Accept", "application/json")
        .json(body)
}

fn notify(observer: &dyn TransactionObserver, call: CallId, outcome: TransactionOutcome) {
    match outcome {
        Ok(response) => observer.did_succeed(call, response),
        Err(failure) => observer.did_fail(call, failure),
    }
}

fn split<S, F>(on_success: S, on_failure: F) -> impl FnOnce(CallId, TransactionOutcome) + Send + 'static
where
    S: FnOnce(TransactionResponse) + Send + 'static,
    F: FnOnce(TransactionFailure) + Send + 'static,
{
    move |_, outcome| match outcome {
        Ok(response) => on_success(response),
        Err(failure) => on_failure(failure),
    }
}
