//! Callback surface of the scheduler.
//!
//! Every call reports to one [`CallObserver`] through a single [`CallEvent`]
//! stream. Per call the order is always
//! `Started, Redirected*, HeaderLoaded?, (Succeeded | Failed), Finished`,
//! delivered on the call's execution context. A cancelled call may stop at
//! any point of that sequence.

use std::{collections::HashMap, fmt};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    call::CallId,
    error::{CallFailure, NetkitError, NetkitResult},
    transport::CallResponse,
};

/// A notification about one call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The first attempt was admitted.
    Started,
    /// The transport followed a redirect.
    Redirected { url: String, status: u16 },
    /// The response header arrived. Delivered at most once per call.
    HeaderLoaded {
        status: u16,
        content_length: Option<u64>,
        headers: HashMap<String, String>,
    },
    /// The call succeeded. `Finished` follows.
    Succeeded(CallResponse),
    /// The call failed for good. `Finished` follows.
    Failed(CallFailure),
    /// No further events will be delivered for this call.
    Finished,
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Redirected { .. } => "redirected",
            Self::HeaderLoaded { .. } => "header_loaded",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives the events of the calls it was submitted with.
pub trait CallObserver: Send + Sync + 'static {
    fn on_event(&self, call: CallId, event: CallEvent);
}

impl<F> CallObserver for F
where
    F: Fn(CallId, CallEvent) + Send + Sync + 'static,
{
    fn on_event(&self, call: CallId, event: CallEvent) {
        self(call, event)
    }
}

type Outcome = Result<CallResponse, CallFailure>;

/// Adapter that turns the event stream into a single awaited outcome.
pub(crate) struct CompletionObserver {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl CompletionObserver {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn resolve(&self, outcome: Outcome) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

impl CallObserver for CompletionObserver {
    fn on_event(&self, _call: CallId, event: CallEvent) {
        match event {
            CallEvent::Succeeded(response) => self.resolve(Ok(response)),
            CallEvent::Failed(failure) => self.resolve(Err(failure)),
            _ => {}
        }
    }
}

/// A submitted call whose outcome can be awaited.
#[derive(Debug)]
pub struct CallCompletion {
    id: CallId,
    rx: oneshot::Receiver<Outcome>,
}

impl CallCompletion {
    pub(crate) fn new(id: CallId, rx: oneshot::Receiver<Outcome>) -> Self {
        Self { id, rx }
    }

    /// Id to cancel the call with.
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Wait for the call's terminal outcome.
    ///
    /// Resolves to [`NetkitError::Cancelled`] if the call is cancelled first.
    pub async fn wait(self) -> NetkitResult<CallResponse> {
        let id = self.id;
        match self.rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(NetkitError::Cancelled { call: id }),
        }
    }
}
