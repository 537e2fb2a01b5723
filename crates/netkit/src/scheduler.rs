//! Priority-gated call scheduler.
//!
//! The scheduler owns every live call in a generational arena together with
//! one FIFO queue and one in-flight counter per priority bucket. All of that
//! state sits behind a single mutex, which is taken by:
//! - the public API (`submit`, `cancel`, snapshots) from any thread,
//! - the driver task, which applies transport notifications and runs the
//!   periodic maintenance tick.
//!
//! Callbacks are never invoked under the lock. They are queued, in order,
//! onto the call's [`ExecutionContext`] while the lock is held, which is what
//! keeps the per-call ordering intact across threads.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{Notify, broadcast, mpsc, oneshot},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    behavior::{CallBehavior, Priority},
    call::{CallId, CallInfo, CallState, NetworkCall},
    config::SchedulerConfig,
    context::{ContextProvider, ExecutionContext},
    error::{CallErrorKind, NetkitError, NetkitResult},
    observer::{CallCompletion, CallEvent, CallObserver, CompletionObserver},
    quota::InFlightLedger,
    statistics::{StatisticsRecorder, StatisticsSnapshot},
    table::CallTable,
    transport::{
        CallRequest, EventSink, Transport, TransportEvent, TransportHandle, TransportNotification,
        header_value, is_success_status,
    },
};

/// A state change of one call, published on [`CallScheduler::subscribe_transitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub call: CallId,
    pub state: CallState,
}

struct Delivery {
    observer: Arc<dyn CallObserver>,
    context: Arc<ExecutionContext>,
    cancelled: Arc<AtomicBool>,
}

impl Delivery {
    /// Queue `event` on the call's context. Suppressed if the call is
    /// cancelled before the job runs.
    fn send(&self, call: CallId, event: CallEvent) {
        let observer = Arc::clone(&self.observer);
        let cancelled = Arc::clone(&self.cancelled);
        let queued = self.context.execute(move || {
            if !cancelled.load(Ordering::Acquire) {
                observer.on_event(call, event);
            }
        });
        if !queued {
            warn!(%call, context = %self.context.id(), "Execution context is gone; callback dropped");
        }
    }
}

struct Entry {
    call: NetworkCall,
    delivery: Delivery,
}

#[derive(Default)]
struct SchedulerState {
    calls: CallTable<Entry>,
    queues: [VecDeque<CallId>; Priority::COUNT],
    ledger: InFlightLedger,
    handles: HashMap<TransportHandle, CallId>,
    stats: StatisticsRecorder,
}

struct Shared {
    config: SchedulerConfig,
    transport: Arc<dyn Transport>,
    contexts: Arc<dyn ContextProvider>,
    sink: EventSink,
    transitions: broadcast::Sender<Transition>,
    wakeup: Notify,
    state: Mutex<SchedulerState>,
}

/// Admits, dispatches, retries, times out and cancels network calls.
pub struct CallScheduler {
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl fmt::Debug for CallScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CallScheduler")
            .field("live_calls", &state.calls.len())
            .field("in_flight", &state.ledger.total())
            .finish()
    }
}

impl CallScheduler {
    /// Create a scheduler and spawn its driver on the current tokio runtime.
    ///
    /// The driver stops when the scheduler is dropped.
    pub fn start(
        config: SchedulerConfig,
        transport: Arc<dyn Transport>,
        contexts: Arc<dyn ContextProvider>,
    ) -> NetkitResult<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| NetkitError::config(format!("No tokio runtime available: {e}")))?;

        let (sink, notifications) = EventSink::channel();
        let (transitions, _) = broadcast::channel(config.transition_channel_capacity);
        let shared = Arc::new(Shared {
            config,
            transport,
            contexts,
            sink,
            transitions,
            wakeup: Notify::new(),
            state: Mutex::new(SchedulerState::default()),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            shared: Arc::clone(&shared),
            notifications,
            shutdown: shutdown_rx,
        };
        runtime.spawn(driver.run());

        Ok(Arc::new(Self {
            shared,
            shutdown: Some(shutdown_tx),
        }))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Submit a call. Never blocks; the call is queued in its priority bucket
    /// and admitted as soon as the bucket has spare quota.
    pub fn submit(
        &self,
        request: CallRequest,
        behavior: CallBehavior,
        observer: Arc<dyn CallObserver>,
    ) -> CallId {
        self.shared.submit(request, behavior, observer)
    }

    /// Submit a call and get an awaitable handle on its outcome.
    pub fn call(&self, request: CallRequest, behavior: CallBehavior) -> CallCompletion {
        let (observer, rx) = CompletionObserver::new();
        let id = self.submit(request, behavior, Arc::new(observer));
        CallCompletion::new(id, rx)
    }

    /// Submit a GET with the default behavior.
    pub fn get(&self, url: impl Into<String>, observer: Arc<dyn CallObserver>) -> CallId {
        let behavior = self.shared.config.default_behavior.clone();
        self.submit(CallRequest::get(url), behavior, observer)
    }

    /// Submit a POST with the default behavior.
    pub fn post(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
        observer: Arc<dyn CallObserver>,
    ) -> CallId {
        let behavior = self.shared.config.default_behavior.clone();
        self.submit(CallRequest::post(url).body(body), behavior, observer)
    }

    /// Cancel a call.
    ///
    /// Idempotent: returns `false` and changes nothing if the call is already
    /// terminal or unknown. Once this returns `true`, no further callbacks
    /// are delivered for the call.
    pub fn cancel(&self, id: CallId) -> bool {
        self.shared.cancel(id)
    }

    /// Consistent copy of the current counters.
    pub fn snapshot_statistics(&self) -> StatisticsSnapshot {
        let state = self.shared.state.lock();
        let queued = std::array::from_fn(|i| state.queues[i].len());
        state.stats.snapshot(&state.ledger, queued)
    }

    /// Detect timed-out attempts, requeue due retries and admit queued calls.
    ///
    /// The driver runs this every `maintenance_interval`; calling it directly
    /// is harmless.
    pub fn maintenance_tick(&self) {
        self.shared.maintenance_tick();
    }

    /// Read-only view of a live call. `None` once the call is terminal.
    pub fn call_info(&self, id: CallId) -> Option<CallInfo> {
        let state = self.shared.state.lock();
        state.calls.get(id).map(|entry| entry.call.info())
    }

    /// Current state of a live call.
    pub fn call_state(&self, id: CallId) -> Option<CallState> {
        let state = self.shared.state.lock();
        state.calls.get(id).map(|entry| entry.call.state())
    }

    /// Number of calls that are neither finished nor cancelled.
    pub fn live_calls(&self) -> usize {
        self.shared.state.lock().calls.len()
    }

    /// Receive every state transition from now on.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<Transition> {
        self.shared.transitions.subscribe()
    }
}

impl Drop for CallScheduler {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Shared {
    fn submit(
        &self,
        request: CallRequest,
        behavior: CallBehavior,
        observer: Arc<dyn CallObserver>,
    ) -> CallId {
        let context = self.contexts.acquire(behavior.context());
        let now = Instant::now();
        let priority = behavior.priority();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = state.calls.insert_with(|id| Entry {
            call: NetworkCall::new(id, request, behavior, now),
            delivery: Delivery {
                observer,
                context,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        });
        state.queues[priority.index()].push_back(id);
        state.stats.record_submitted();
        self.publish(id, CallState::Queued);
        debug!(call = %id, %priority, "Call submitted");

        self.admit_pending(state, now);
        id
    }

    fn cancel(&self, id: CallId) -> bool {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(entry) = state.calls.get_mut(id) else {
            trace!(call = %id, "Cancel ignored for terminal or unknown call");
            return false;
        };
        let priority = entry.call.priority();

        match entry.call.state() {
            CallState::Queued => state.queues[priority.index()].retain(|queued| *queued != id),
            CallState::Active | CallState::Redirected => {
                if let Some(handle) = entry.call.end_attempt() {
                    state.handles.remove(&handle);
                    self.transport.cancel(handle);
                }
                if !state.ledger.release(priority) {
                    error!(call = %id, %priority, "In-flight counter underflow on cancel");
                }
            }
            _ => {}
        }

        entry.delivery.cancelled.store(true, Ordering::Release);
        self.advance(&mut entry.call, CallState::Cancelled);
        state.stats.record_cancel(entry.call.retry_count() > 0);
        debug!(call = %id, "Call cancelled");

        self.destroy(state, id);
        self.admit_pending(state, now);
        true
    }

    fn handle_notification(&self, note: TransportNotification) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(&id) = state.handles.get(&note.handle) else {
            trace!(handle = %note.handle, "Ignoring notification for untracked exchange");
            return;
        };

        match note.event {
            TransportEvent::ResponseHeader { status, headers } => {
                if let Some(entry) = state.calls.get_mut(id) {
                    if entry.call.mark_header() {
                        let content_length =
                            header_value(&headers, "content-length").and_then(|v| v.parse().ok());
                        entry.delivery.send(
                            id,
                            CallEvent::HeaderLoaded {
                                status,
                                content_length,
                                headers: headers.clone(),
                            },
                        );
                    }
                    entry.call.record_header(status, headers);
                }
            }
            TransportEvent::DataChunk(chunk) => {
                if let Some(entry) = state.calls.get_mut(id) {
                    entry.call.append_data(&chunk);
                }
            }
            TransportEvent::Redirect { url, status } => {
                if let Some(entry) = state.calls.get_mut(id) {
                    if self.advance(&mut entry.call, CallState::Redirected) {
                        entry.call.record_redirect(&url);
                        debug!(call = %id, %url, status, "Call redirected");
                        if !entry.call.header_notified() {
                            entry
                                .delivery
                                .send(id, CallEvent::Redirected { url, status });
                        }
                        self.advance(&mut entry.call, CallState::Active);
                    }
                }
            }
            TransportEvent::Complete => self.complete_attempt(state, id, now),
            TransportEvent::Error(err) => {
                self.fail_attempt(
                    state,
                    id,
                    err.kind(),
                    CallState::Failed,
                    Some(err.to_string()),
                    now,
                );
            }
        }

        self.admit_pending(state, now);
    }

    fn maintenance_tick(&self) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let expired: Vec<CallId> = state
            .calls
            .values()
            .filter(|entry| entry.call.is_timed_out(now))
            .map(|entry| entry.call.id())
            .collect();
        for id in expired {
            if let Some(entry) = state.calls.get(id) {
                if let Some(handle) = entry.call.handle() {
                    self.transport.cancel(handle);
                }
                warn!(
                    call = %id,
                    elapsed_ms = entry.call.elapsed(now).as_millis() as u64,
                    timeout_ms = entry.call.behavior().timeout().as_millis() as u64,
                    "Call attempt timed out"
                );
            }
            self.fail_attempt(
                state,
                id,
                CallErrorKind::TimedOut,
                CallState::TimedOut,
                None,
                now,
            );
        }

        let mut due: Vec<(Instant, CallId)> = state
            .calls
            .values()
            .filter(|entry| entry.call.retry_due(now))
            .filter_map(|entry| entry.call.retry_at().map(|at| (at, entry.call.id())))
            .collect();
        due.sort();
        for (_, id) in due {
            if let Some(entry) = state.calls.get_mut(id) {
                let priority = entry.call.priority();
                if self.advance(&mut entry.call, CallState::Queued) {
                    state.queues[priority.index()].push_back(id);
                }
            }
        }

        self.admit_pending(state, now);
    }

    fn next_retry_due(&self) -> Option<Instant> {
        let state = self.state.lock();
        state
            .calls
            .values()
            .filter(|entry| entry.call.state() == CallState::Retrying)
            .filter_map(|entry| entry.call.retry_at())
            .min()
    }

    /// Admit queued calls, head first, while their bucket has quota.
    fn admit_pending(&self, state: &mut SchedulerState, now: Instant) {
        for priority in Priority::ALL {
            while state.ledger.has_capacity(&self.config.quotas, priority) {
                let Some(id) = state.queues[priority.index()].pop_front() else {
                    break;
                };
                self.start_attempt(state, id, now);
            }
        }
    }

    fn start_attempt(&self, state: &mut SchedulerState, id: CallId, now: Instant) {
        let Some(entry) = state.calls.get_mut(id) else {
            return;
        };
        if !self.advance(&mut entry.call, CallState::Active) {
            return;
        }
        state.ledger.admit(entry.call.priority());
        if entry.call.mark_started() {
            entry.delivery.send(id, CallEvent::Started);
        }

        let request = entry.call.attempt_request();
        match self.transport.open(&request, self.sink.clone()) {
            Ok(handle) => {
                entry.call.begin_attempt(now, Some(handle));
                state.handles.insert(handle, id);
                self.transport.schedule(handle, &entry.delivery.context);
                debug!(
                    call = %id,
                    %handle,
                    url = %request.url,
                    retry = entry.call.retry_count(),
                    "Call admitted"
                );
                self.transport.start(handle);
            }
            Err(err) => {
                entry.call.begin_attempt(now, None);
                warn!(call = %id, error = %err, "Transport could not open exchange");
                self.fail_attempt(
                    state,
                    id,
                    err.kind(),
                    CallState::Failed,
                    Some(err.to_string()),
                    now,
                );
            }
        }
    }

    fn complete_attempt(&self, state: &mut SchedulerState, id: CallId, now: Instant) {
        let Some(entry) = state.calls.get_mut(id) else {
            return;
        };

        match entry.call.status() {
            Some(status) if is_success_status(status) => {
                if let Some(handle) = entry.call.end_attempt() {
                    state.handles.remove(&handle);
                }
                if !self.advance(&mut entry.call, CallState::Succeeded) {
                    return;
                }
                let priority = entry.call.priority();
                if !state.ledger.release(priority) {
                    error!(call = %id, %priority, "In-flight counter underflow on success");
                }

                let response = entry.call.take_response(now);
                state
                    .stats
                    .record_success(response.latency, entry.call.retry_count() > 0);
                debug!(
                    call = %id,
                    status,
                    bytes = response.body.len(),
                    latency_ms = response.latency.as_millis() as u64,
                    "Call succeeded"
                );

                entry.delivery.send(id, CallEvent::Succeeded(response));
                entry.delivery.send(id, CallEvent::Finished);
                self.advance(&mut entry.call, CallState::Finished);
                self.destroy(state, id);
            }
            Some(status) => {
                let kind = CallErrorKind::from_status(status);
                self.fail_attempt(state, id, kind, CallState::Failed, None, now);
            }
            None => {
                self.fail_attempt(
                    state,
                    id,
                    CallErrorKind::Internal,
                    CallState::Failed,
                    Some("transport completed without a response header".to_string()),
                    now,
                );
            }
        }
    }

    /// End the in-flight attempt with a failure, then retry or finish.
    ///
    /// `outcome` is `Failed` or `TimedOut`.
    fn fail_attempt(
        &self,
        state: &mut SchedulerState,
        id: CallId,
        kind: CallErrorKind,
        outcome: CallState,
        message: Option<String>,
        now: Instant,
    ) {
        let Some(entry) = state.calls.get_mut(id) else {
            return;
        };
        if let Some(handle) = entry.call.end_attempt() {
            state.handles.remove(&handle);
        }
        if !self.advance(&mut entry.call, outcome) {
            return;
        }
        let priority = entry.call.priority();
        if !state.ledger.release(priority) {
            error!(call = %id, %priority, "In-flight counter underflow on failure");
        }

        if entry.call.can_retry(kind) {
            let delay = entry.call.schedule_retry(now);
            let retry = entry.call.retry_count();
            self.advance(&mut entry.call, CallState::Retrying);
            state.stats.record_retry(retry == 1);
            info!(
                call = %id,
                %kind,
                retry,
                max_retries = entry.call.behavior().max_retries(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            self.wakeup.notify_one();
            return;
        }

        let mut failure = entry.call.take_failure(kind);
        if let Some(message) = message {
            failure = failure.with_message(message);
        }
        if kind.is_fatal() {
            error!(call = %id, %kind, message = ?failure.message, "Call failed internally");
        } else {
            warn!(
                call = %id,
                %kind,
                status = ?failure.status,
                retries = entry.call.retry_count(),
                "Call failed"
            );
        }
        state
            .stats
            .record_failure(kind, entry.call.retry_count() > 0);

        entry.delivery.send(id, CallEvent::Failed(failure));
        entry.delivery.send(id, CallEvent::Finished);
        self.advance(&mut entry.call, CallState::Finished);
        self.destroy(state, id);
    }

    /// Drop a terminal call and its context subscription.
    fn destroy(&self, state: &mut SchedulerState, id: CallId) {
        if let Some(entry) = state.calls.remove(id) {
            self.contexts.release(entry.delivery.context.id());
        }
    }

    fn advance(&self, call: &mut NetworkCall, next: CallState) -> bool {
        match call.transition(next) {
            Ok(_) => {
                self.publish(call.id(), next);
                true
            }
            Err(current) => {
                error!(call = %call.id(), from = %current, to = %next, "Illegal call state transition");
                false
            }
        }
    }

    fn publish(&self, call: CallId, state: CallState) {
        let _ = self.transitions.send(Transition { call, state });
    }

    /// Abort every in-flight exchange. Used when the scheduler goes away.
    fn abort_all(&self) {
        let mut state = self.state.lock();
        for (handle, call) in state.handles.drain() {
            trace!(%call, %handle, "Aborting exchange on shutdown");
            self.transport.cancel(handle);
        }
    }
}

/// Background task applying transport notifications and running the
/// maintenance tick.
struct Driver {
    shared: Arc<Shared>,
    notifications: mpsc::UnboundedReceiver<TransportNotification>,
    shutdown: oneshot::Receiver<()>,
}

impl Driver {
    async fn run(mut self) {
        let mut tick = time::interval(self.shared.config.maintenance_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(
            interval_ms = self.shared.config.maintenance_interval.as_millis() as u64,
            "Scheduler driver started"
        );

        loop {
            let next_retry = self.shared.next_retry_due();

            tokio::select! {
                _ = &mut self.shutdown => break,
                note = self.notifications.recv() => match note {
                    Some(note) => self.shared.handle_notification(note),
                    None => break,
                },
                _ = tick.tick() => self.shared.maintenance_tick(),
                _ = sleep_until(next_retry) => self.shared.maintenance_tick(),
                _ = self.shared.wakeup.notified() => {}
            }
        }

        self.shared.abort_all();
        debug!("Scheduler driver stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
