//! # netkit
//!
//! Network access layer for client applications: a priority-gated call
//! scheduler and a thin JSON transaction layer on top of it.
//!
//! ## Features
//!
//! - **Priority Quotas**: Four buckets with independent in-flight limits;
//!   saturated buckets queue instead of blocking the caller
//! - **Retries**: Bounded retries for connection failures and timeouts, with
//!   fixed or logarithmic delays
//! - **Redirects**: Followed by the transport and reported per hop; retries
//!   restart from the original URL or from the last redirect target
//! - **Ordered Callbacks**: Every call's events run in order on the
//!   execution context chosen at submission
//! - **Statistics**: Consistent snapshots of in-flight, queued and
//!   completed counters
//! - **Pluggable Transport**: The scheduler only sees the [`Transport`]
//!   trait; an HTTP bridge over `reqwest` ships behind the `http` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netkit::{CallBehavior, NetworkServices, Priority, SchedulerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = NetworkServices::start_http(SchedulerConfig::default(), Default::default())?;
//!
//!     let behavior = CallBehavior::builder().priority(Priority::High).build()?;
//!     let response = services
//!         .transactions()
//!         .get_json("https://api.example.com/items", &(), behavior)
//!         .await?;
//!     println!("{}", response.payload);
//!     Ok(())
//! }
//! ```

mod backoff;
mod table;

pub mod behavior;
pub mod call;
pub mod config;
pub mod context;
pub mod error;
pub mod observer;
pub mod quota;
pub mod scheduler;
pub mod service;
pub mod statistics;
pub mod transaction;
pub mod transport;

#[cfg(feature = "http")]
pub mod http;

pub use behavior::{CallBehavior, CallBehaviorBuilder, Priority, RedirectRetryPolicy, RetryDelayPolicy};
pub use call::{CallId, CallInfo, CallState};
pub use config::SchedulerConfig;
pub use context::{ContextId, ContextPool, ContextProvider, ExecutionContext};
pub use error::{CallErrorKind, CallFailure, NetkitError, NetkitResult};
#[cfg(feature = "http")]
pub use crate::http::{HttpBridge, HttpBridgeConfig};
pub use observer::{CallCompletion, CallEvent, CallObserver};
pub use quota::QuotaPolicy;
pub use scheduler::{CallScheduler, Transition};
pub use service::NetworkServices;
pub use statistics::{FailureTotals, StatisticsSnapshot};
pub use transaction::{
    DefaultClassifier, ResponseClassifier, TransactionErrorKind, TransactionFailure,
    TransactionLayer, TransactionObserver, TransactionOutcome, TransactionResponse,
};
pub use transport::{
    CallRequest, CallResponse, EventSink, Method, Transport, TransportError, TransportEvent,
    TransportHandle, TransportNotification, TransportRequest,
};
