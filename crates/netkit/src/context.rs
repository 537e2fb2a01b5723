//! Execution contexts that receive callbacks.
//!
//! An [`ExecutionContext`] is a serial job queue drained by a single tokio
//! task: jobs submitted to the same context run one at a time, in submission
//! order. Contexts are looked up by a [`ContextId`] through a
//! [`ContextProvider`], so calls that name the same identifier share a
//! context.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, error};

use crate::error::{NetkitError, NetkitResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<ContextId>> = const { RefCell::new(None) };
}

/// Identifier of an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(String);

impl ContextId {
    /// Identifier of the default context.
    pub const MAIN: &'static str = "main";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The default context most callbacks are delivered on.
    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::main()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ContextId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A serial executor for callbacks and transport work.
pub struct ExecutionContext {
    id: ContextId,
    jobs: mpsc::UnboundedSender<Job>,
    runtime: Handle,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("closed", &self.jobs.is_closed())
            .finish()
    }
}

impl ExecutionContext {
    /// Spawn a new context on the given runtime.
    ///
    /// The worker task exits once every handle to the context is dropped and
    /// the queued jobs have run.
    pub fn spawn(id: ContextId, runtime: &Handle) -> Arc<Self> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_id = id.clone();

        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(&worker_id, job);
            }
            debug!(context = %worker_id, "Execution context stopped");
        });

        Arc::new(Self {
            id,
            jobs,
            runtime: runtime.clone(),
        })
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    /// Runtime the context's worker runs on. Transports spawn their I/O here.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Queue a job. Returns `false` if the worker is gone.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.send(Box::new(job)).is_ok()
    }

    /// Identifier of the context running the current job, if any.
    pub fn current() -> Option<ContextId> {
        CURRENT.with(|current| current.borrow().clone())
    }
}

fn run_job(id: &ContextId, job: Job) {
    CURRENT.with(|current| *current.borrow_mut() = Some(id.clone()));
    let result = panic::catch_unwind(AssertUnwindSafe(job));
    CURRENT.with(|current| *current.borrow_mut() = None);

    if result.is_err() {
        error!(context = %id, "Callback panicked; context keeps running");
    }
}

/// Source of execution contexts, keyed by identifier.
pub trait ContextProvider: Send + Sync + 'static {
    /// Get (or create) the context for `id` and register one subscriber.
    fn acquire(&self, id: &ContextId) -> Arc<ExecutionContext>;

    /// Drop one subscriber registered by [`acquire`](Self::acquire).
    fn release(&self, id: &ContextId);
}

struct PoolEntry {
    context: Arc<ExecutionContext>,
    subscribers: usize,
    pinned: bool,
}

/// Reference-counted pool of shared execution contexts.
///
/// A context lives while it has subscribers or is pinned.
pub struct ContextPool {
    runtime: Handle,
    entries: Mutex<HashMap<ContextId, PoolEntry>>,
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("contexts", &self.entries.lock().len())
            .finish()
    }
}

impl ContextPool {
    /// Create a pool whose contexts run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a pool on the runtime of the calling task.
    pub fn current() -> NetkitResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| NetkitError::config(format!("No tokio runtime available: {e}")))?;
        Ok(Self::new(runtime))
    }

    /// Keep a context alive even when nothing is subscribed to it.
    ///
    /// Unpinning a context with no subscribers shuts it down.
    pub fn pin(&self, id: &ContextId, pinned: bool) {
        let mut entries = self.entries.lock();
        if pinned {
            let runtime = &self.runtime;
            entries
                .entry(id.clone())
                .or_insert_with(|| PoolEntry {
                    context: ExecutionContext::spawn(id.clone(), runtime),
                    subscribers: 0,
                    pinned: false,
                })
                .pinned = true;
        } else if let Some(entry) = entries.get_mut(id) {
            entry.pinned = false;
            if entry.subscribers == 0 {
                entries.remove(id);
            }
        }
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Current subscriber count of a context, if it is live.
    pub fn subscribers(&self, id: &ContextId) -> Option<usize> {
        self.entries.lock().get(id).map(|entry| entry.subscribers)
    }
}

impl ContextProvider for ContextPool {
    fn acquire(&self, id: &ContextId) -> Arc<ExecutionContext> {
        let mut entries = self.entries.lock();
        let runtime = &self.runtime;
        let entry = entries.entry(id.clone()).or_insert_with(|| {
            debug!(context = %id, "Creating execution context");
            PoolEntry {
                context: ExecutionContext::spawn(id.clone(), runtime),
                subscribers: 0,
                pinned: false,
            }
        });
        entry.subscribers += 1;
        Arc::clone(&entry.context)
    }

    fn release(&self, id: &ContextId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(id) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            if entry.subscribers == 0 && !entry.pinned {
                entries.remove(id);
            }
        }
    }
}
