//! Transport bridge abstraction and the request/response types that cross it.
//!
//! The scheduler never talks to a concrete HTTP stack. It opens, schedules,
//! starts and cancels exchanges through [`Transport`], and the transport
//! reports progress back through the [`EventSink`] it was given at `open`.
//! This makes the whole scheduler testable against a scripted transport.

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    context::ExecutionContext,
    error::{CallErrorKind, NetkitResult},
};

/// HTTP method enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
            Method::Patch => write!(f, "PATCH"),
            Method::Head => write!(f, "HEAD"),
        }
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Delete => http::Method::DELETE,
            Method::Patch => http::Method::PATCH,
            Method::Head => http::Method::HEAD,
        }
    }
}

/// A request as submitted by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    /// HTTP method
    pub method: Method,

    /// Target URL
    pub url: String,

    /// Request headers
    pub headers: HashMap<String, String>,

    /// Request body
    pub body: Option<Bytes>,
}

impl CallRequest {
    /// Create a new request.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Create a POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Create a PUT request.
    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    /// Create a DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Add a header to the request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the request body as JSON.
    pub fn json<T: Serialize + ?Sized>(mut self, data: &T) -> NetkitResult<Self> {
        let body = serde_json::to_vec(data)?;
        self.body = Some(body.into());
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        Ok(self)
    }
}

/// The request handed to the transport for one attempt.
///
/// The URL is already resolved according to the call's redirect policy.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    /// Whether a compressed response encoding may be negotiated.
    pub accept_compression: bool,
    /// Whether an intermediate cache may answer.
    pub allow_cached_responses: bool,
}

/// Successful result of a call.
#[derive(Debug, Clone)]
pub struct CallResponse {
    /// Response status code
    pub status: u16,

    /// Response headers
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Bytes,

    /// URL the body was read from
    pub url: String,

    /// Duration of the successful attempt
    pub latency: Duration,

    /// Number of retries it took
    pub retries: u32,
}

impl CallResponse {
    /// Check if the response indicates success.
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }

    /// Parse the response body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> NetkitResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Get the response body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Get a header value, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

pub(crate) fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

pub(crate) fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Opaque identifier of one transport exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(u64);

impl TransportHandle {
    /// Allocate a process-unique handle.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xfer-{}", self.0)
    }
}

/// Failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The host could not be reached.
    #[error("Connection failed: {message}")]
    Connect { message: String },

    /// The transport gave up waiting on its own.
    #[error("Transport timed out")]
    Timeout,

    /// The request cannot be sent as given.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The peer violated the protocol or sent something unusable.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A bug in the transport itself.
    #[error("Internal transport error: {message}")]
    Internal { message: String },
}

impl TransportError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classification used by the scheduler.
    pub fn kind(&self) -> CallErrorKind {
        match self {
            Self::Connect { .. } => CallErrorKind::NoConnection,
            Self::Timeout => CallErrorKind::TimedOut,
            Self::InvalidRequest { .. } => CallErrorKind::BadRequest,
            Self::Protocol { .. } => CallErrorKind::BadServer,
            Self::Internal { .. } => CallErrorKind::Internal,
        }
    }
}

/// Progress of an exchange, reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Final (non-redirect) response header arrived.
    ResponseHeader {
        status: u16,
        headers: HashMap<String, String>,
    },
    /// A chunk of the response body arrived.
    DataChunk(Bytes),
    /// The transport followed a redirect to `url`.
    Redirect { url: String, status: u16 },
    /// The body has been fully received.
    Complete,
    /// The exchange failed.
    Error(TransportError),
}

/// A [`TransportEvent`] tagged with the exchange it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportNotification {
    pub handle: TransportHandle,
    pub event: TransportEvent,
}

/// Channel through which a transport reports progress.
///
/// Sending never blocks. Notifications sent after the receiving scheduler is
/// gone are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportNotification>,
}

impl EventSink {
    /// Create a sink and the receiver its notifications arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, handle: TransportHandle, event: TransportEvent) -> bool {
        self.tx.send(TransportNotification { handle, event }).is_ok()
    }

    pub fn response_header(
        &self,
        handle: TransportHandle,
        status: u16,
        headers: HashMap<String, String>,
    ) -> bool {
        self.notify(handle, TransportEvent::ResponseHeader { status, headers })
    }

    pub fn data_chunk(&self, handle: TransportHandle, chunk: Bytes) -> bool {
        self.notify(handle, TransportEvent::DataChunk(chunk))
    }

    pub fn redirect(&self, handle: TransportHandle, url: impl Into<String>, status: u16) -> bool {
        self.notify(
            handle,
            TransportEvent::Redirect {
                url: url.into(),
                status,
            },
        )
    }

    pub fn complete(&self, handle: TransportHandle) -> bool {
        self.notify(handle, TransportEvent::Complete)
    }

    pub fn error(&self, handle: TransportHandle, error: TransportError) -> bool {
        self.notify(handle, TransportEvent::Error(error))
    }
}

/// The bridge between the scheduler and a concrete network stack.
///
/// Implementations must not block and must not call back into the scheduler
/// synchronously: all progress goes through the [`EventSink`].
pub trait Transport: Send + Sync + 'static {
    /// Prepare an exchange for `request` without starting it.
    fn open(
        &self,
        request: &TransportRequest,
        sink: EventSink,
    ) -> Result<TransportHandle, TransportError>;

    /// Bind the exchange to the context its work should run on.
    fn schedule(&self, handle: TransportHandle, context: &ExecutionContext);

    /// Start the exchange.
    fn start(&self, handle: TransportHandle);

    /// Abort the exchange. No further notifications are expected for it.
    fn cancel(&self, handle: TransportHandle);
}
