//! Per-call state and its state machine.

use std::{collections::HashMap, fmt, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::{
    backoff,
    behavior::{CallBehavior, Priority, RedirectRetryPolicy},
    error::{CallErrorKind, CallFailure},
    transport::{CallRequest, CallResponse, TransportHandle, TransportRequest},
};

/// Identifier of a submitted call.
///
/// Ids are generational: once a call is destroyed its id never matches a
/// later call, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId {
    index: u32,
    generation: u32,
}

impl CallId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}.{}", self.index, self.generation)
    }
}

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Waiting in its priority bucket for quota.
    Queued,
    /// An attempt is in flight.
    Active,
    /// The in-flight attempt was redirected; the call stays in flight.
    Redirected,
    /// The attempt completed with a success status.
    Succeeded,
    /// The attempt failed.
    Failed,
    /// The attempt exceeded the call's timeout and was abandoned.
    TimedOut,
    /// Waiting out the retry delay before re-entering the queue.
    Retrying,
    /// Terminal: callbacks have been issued.
    Finished,
    /// Terminal: cancelled by the caller.
    Cancelled,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    /// Whether the call currently occupies quota in its bucket.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Active | Self::Redirected)
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;

        match (self, next) {
            (Finished | Cancelled, _) => false,
            (_, Cancelled) => !matches!(self, Succeeded | Failed | TimedOut),
            (Queued, Active) => true,
            (Active, Succeeded | Redirected | TimedOut | Failed) => true,
            (Redirected, Active) => true,
            (Succeeded, Finished) => true,
            (Failed | TimedOut, Retrying | Finished) => true,
            (Retrying, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Read-only view of a live call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub id: CallId,
    pub state: CallState,
    pub priority: Priority,
    pub retry_count: u32,
    /// URL the call was submitted with.
    pub original_url: String,
    /// URL the current (or next) attempt reads from.
    pub current_url: String,
    /// Redirect targets recorded under [`RedirectRetryPolicy::StoreRedirectStack`].
    pub redirect_stack: Vec<String>,
}

/// Mutable state of one call.
#[derive(Debug)]
pub struct NetworkCall {
    id: CallId,
    request: CallRequest,
    behavior: CallBehavior,
    state: CallState,
    retry_count: u32,
    submitted_at: Instant,
    started_at: Option<Instant>,
    retry_at: Option<Instant>,
    handle: Option<TransportHandle>,
    current_url: String,
    redirect_stack: Vec<String>,
    status: Option<u16>,
    headers: HashMap<String, String>,
    data: BytesMut,
    started_notified: bool,
    header_notified: bool,
}

impl NetworkCall {
    pub fn new(id: CallId, request: CallRequest, behavior: CallBehavior, now: Instant) -> Self {
        let current_url = request.url.clone();
        Self {
            id,
            request,
            behavior,
            state: CallState::Queued,
            retry_count: 0,
            submitted_at: now,
            started_at: None,
            retry_at: None,
            handle: None,
            current_url,
            redirect_stack: Vec::new(),
            status: None,
            headers: HashMap::new(),
            data: BytesMut::new(),
            started_notified: false,
            header_notified: false,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn behavior(&self) -> &CallBehavior {
        &self.behavior
    }

    pub fn priority(&self) -> Priority {
        self.behavior.priority()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn handle(&self) -> Option<TransportHandle> {
        self.handle
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn redirect_stack(&self) -> &[String] {
        &self.redirect_stack
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Illegal transitions are refused and leave the call untouched.
    pub fn transition(&mut self, next: CallState) -> Result<CallState, CallState> {
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }
        Ok(std::mem::replace(&mut self.state, next))
    }

    /// URL the next attempt should target, per the redirect policy.
    pub fn attempt_url(&self) -> &str {
        match self.behavior.redirect_retry_policy() {
            RedirectRetryPolicy::RetryFromTopURL => &self.request.url,
            RedirectRetryPolicy::StoreRedirectStack => self
                .redirect_stack
                .last()
                .map(String::as_str)
                .unwrap_or(&self.request.url),
        }
    }

    /// Build the transport request for the next attempt.
    pub fn attempt_request(&self) -> TransportRequest {
        TransportRequest {
            method: self.request.method,
            url: self.attempt_url().to_string(),
            headers: self.request.headers.clone(),
            body: self.request.body.clone(),
            accept_compression: self.behavior.accept_compression(),
            allow_cached_responses: self.behavior.allow_cached_responses(),
        }
    }

    /// Reset per-attempt state for a freshly admitted attempt.
    pub fn begin_attempt(&mut self, now: Instant, handle: Option<TransportHandle>) {
        self.current_url = self.attempt_url().to_string();
        self.started_at = Some(now);
        self.retry_at = None;
        self.handle = handle;
        self.status = None;
        self.headers.clear();
        self.data.clear();
    }

    /// Detach the transport handle of the current attempt.
    pub fn end_attempt(&mut self) -> Option<TransportHandle> {
        self.handle.take()
    }

    pub fn record_header(&mut self, status: u16, headers: HashMap<String, String>) {
        self.status = Some(status);
        self.headers = headers;
    }

    pub fn append_data(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Apply a redirect reported by the transport.
    ///
    /// Subsequent bytes belong to `url`. Under `StoreRedirectStack` the URL is
    /// also remembered for retries.
    pub fn record_redirect(&mut self, url: &str) {
        if self.behavior.redirect_retry_policy() == RedirectRetryPolicy::StoreRedirectStack {
            self.redirect_stack.push(url.to_string());
        }
        self.current_url = url.to_string();
        self.status = None;
        self.headers.clear();
        self.data.clear();
    }

    /// Time spent in the current attempt.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or(Duration::ZERO)
    }

    /// Whether the in-flight attempt has exceeded the call's timeout.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.state.is_in_flight() && self.elapsed(now) > self.behavior.timeout()
    }

    /// Whether a failure of `kind` may be followed by another attempt.
    pub fn can_retry(&self, kind: CallErrorKind) -> bool {
        kind.is_retryable() && self.retry_count < self.behavior.max_retries()
    }

    /// Count a retry and arm its delay. Returns the delay.
    pub fn schedule_retry(&mut self, now: Instant) -> Duration {
        self.retry_count += 1;
        let delay = backoff::retry_delay(
            self.behavior.retry_delay_policy(),
            self.behavior.retry_delay(),
            self.retry_count,
            self.behavior.retry_jitter(),
        );
        self.retry_at = Some(now.checked_add(delay).unwrap_or(now));
        delay
    }

    /// Whether the retry delay has elapsed.
    pub fn retry_due(&self, now: Instant) -> bool {
        self.state == CallState::Retrying && self.retry_at.is_some_and(|at| at <= now)
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn mark_started(&mut self) -> bool {
        !std::mem::replace(&mut self.started_notified, true)
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn mark_header(&mut self) -> bool {
        !std::mem::replace(&mut self.header_notified, true)
    }

    pub(crate) fn header_notified(&self) -> bool {
        self.header_notified
    }

    /// Freeze the received bytes into a response.
    pub fn take_response(&mut self, now: Instant) -> CallResponse {
        CallResponse {
            status: self.status.unwrap_or_default(),
            headers: std::mem::take(&mut self.headers),
            body: self.data.split().freeze(),
            url: self.current_url.clone(),
            latency: self.elapsed(now),
            retries: self.retry_count,
        }
    }

    /// Freeze the received bytes into a failure of `kind`.
    pub fn take_failure(&mut self, kind: CallErrorKind) -> CallFailure {
        let body: Bytes = self.data.split().freeze();
        CallFailure::new(kind)
            .with_status(self.status)
            .with_body(body)
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            id: self.id,
            state: self.state,
            priority: self.priority(),
            retry_count: self.retry_count,
            original_url: self.request.url.clone(),
            current_url: self.current_url.clone(),
            redirect_stack: self.redirect_stack.clone(),
        }
    }
}
