#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use netkit::{
    CallBehavior, CallEvent, CallId, CallObserver, CallScheduler, ContextId, ContextPool,
    ContextProvider, EventSink, ExecutionContext, QuotaPolicy, SchedulerConfig, Transport,
    TransportError, TransportHandle, TransportRequest,
};

struct Opened {
    handle: TransportHandle,
    request: TransportRequest,
    sink: EventSink,
    context: Option<ContextId>,
    started: bool,
}

#[derive(Default)]
struct FakeState {
    opened: Vec<Opened>,
    cancelled: Vec<TransportHandle>,
    refuse: Vec<TransportError>,
}

/// In-memory transport driven by the test.
///
/// Exchanges are addressed by the order they were opened in.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `open` fail with `error`.
    pub fn refuse_next(&self, error: TransportError) {
        self.state.lock().unwrap().refuse.push(error);
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened.len()
    }

    pub fn request(&self, index: usize) -> TransportRequest {
        self.state.lock().unwrap().opened[index].request.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.opened.iter().map(|o| o.request.url.clone()).collect()
    }

    pub fn handle(&self, index: usize) -> TransportHandle {
        self.state.lock().unwrap().opened[index].handle
    }

    pub fn scheduled_on(&self, index: usize) -> Option<ContextId> {
        self.state.lock().unwrap().opened[index].context.clone()
    }

    pub fn is_started(&self, index: usize) -> bool {
        self.state.lock().unwrap().opened[index].started
    }

    pub fn cancelled(&self) -> Vec<TransportHandle> {
        self.state.lock().unwrap().cancelled.clone()
    }

    fn sink(&self, index: usize) -> (TransportHandle, EventSink) {
        let state = self.state.lock().unwrap();
        let opened = &state.opened[index];
        (opened.handle, opened.sink.clone())
    }

    pub fn header(&self, index: usize, status: u16) {
        let (handle, sink) = self.sink(index);
        sink.response_header(handle, status, HashMap::new());
    }

    pub fn chunk(&self, index: usize, data: &'static [u8]) {
        let (handle, sink) = self.sink(index);
        sink.data_chunk(handle, Bytes::from_static(data));
    }

    pub fn complete(&self, index: usize) {
        let (handle, sink) = self.sink(index);
        sink.complete(handle);
    }

    pub fn redirect(&self, index: usize, url: &str, status: u16) {
        let (handle, sink) = self.sink(index);
        sink.redirect(handle, url, status);
    }

    pub fn fail(&self, index: usize, error: TransportError) {
        let (handle, sink) = self.sink(index);
        sink.error(handle, error);
    }

    /// Header, one body chunk, completion.
    pub fn respond(&self, index: usize, status: u16, body: &'static [u8]) {
        self.header(index, status);
        if !body.is_empty() {
            self.chunk(index, body);
        }
        self.complete(index);
    }
}

impl Transport for FakeTransport {
    fn open(
        &self,
        request: &TransportRequest,
        sink: EventSink,
    ) -> Result<TransportHandle, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.refuse.is_empty() {
            return Err(state.refuse.remove(0));
        }
        let handle = TransportHandle::next();
        state.opened.push(Opened {
            handle,
            request: request.clone(),
            sink,
            context: None,
            started: false,
        });
        Ok(handle)
    }

    fn schedule(&self, handle: TransportHandle, context: &ExecutionContext) {
        let mut state = self.state.lock().unwrap();
        if let Some(opened) = state.opened.iter_mut().find(|o| o.handle == handle) {
            opened.context = Some(context.id().clone());
        }
    }

    fn start(&self, handle: TransportHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(opened) = state.opened.iter_mut().find(|o| o.handle == handle) {
            opened.started = true;
        }
    }

    fn cancel(&self, handle: TransportHandle) {
        self.state.lock().unwrap().cancelled.push(handle);
    }
}

/// A delivered event, with the context it was delivered on.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub call: CallId,
    pub event: CallEvent,
    pub context: Option<ContextId>,
}

/// Observer that records every event.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Delivered>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self, call: CallId) -> Vec<Delivered> {
        let events = self.events.lock().unwrap();
        events.iter().filter(|d| d.call == call).cloned().collect()
    }

    pub fn names(&self, call: CallId) -> Vec<&'static str> {
        self.events(call).iter().map(|d| d.event.name()).collect()
    }

    pub fn is_finished(&self, call: CallId) -> bool {
        self.names(call).contains(&"finished")
    }
}

impl CallObserver for Recorder {
    fn on_event(&self, call: CallId, event: CallEvent) {
        self.events.lock().unwrap().push(Delivered {
            call,
            event,
            context: ExecutionContext::current(),
        });
    }
}

pub struct Harness {
    pub scheduler: Arc<CallScheduler>,
    pub transport: Arc<FakeTransport>,
    pub contexts: Arc<ContextPool>,
}

/// Scheduler over a [`FakeTransport`] on the current runtime.
pub fn harness(quotas: QuotaPolicy) -> Harness {
    let transport = FakeTransport::new();
    let contexts = Arc::new(ContextPool::current().unwrap());
    let config = SchedulerConfig::new()
        .quotas(quotas)
        .maintenance_interval(Duration::from_millis(100));
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let provider: Arc<dyn ContextProvider> = contexts.clone();
    let scheduler = CallScheduler::start(config, dyn_transport, provider).unwrap();
    Harness {
        scheduler,
        transport,
        contexts,
    }
}

pub fn behavior() -> netkit::CallBehaviorBuilder {
    CallBehavior::builder()
}

/// Poll `condition` until it holds, yielding to the runtime between checks.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Let queued notifications and callbacks run.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
