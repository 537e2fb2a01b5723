//! HTTP transport bridge backed by `reqwest`.
//!
//! Redirects are followed here rather than inside `reqwest`, so each hop can
//! be reported to the scheduler. Bodies are streamed chunk by chunk.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use futures_util::StreamExt;
use reqwest::{
    Client,
    header::{CACHE_CONTROL, LOCATION},
};
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    context::ExecutionContext,
    error::{NetkitError, NetkitResult},
    transport::{EventSink, Transport, TransportError, TransportHandle, TransportRequest},
};

/// Configuration for [`HttpBridge`].
#[derive(Debug, Clone)]
pub struct HttpBridgeConfig {
    /// User agent string
    pub user_agent: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Pool idle timeout
    pub pool_idle_timeout: Duration,

    /// Maximum number of redirects followed per attempt
    pub max_redirects: usize,

    /// Headers sent with every request, unless the request sets them itself
    pub default_headers: HashMap<String, String>,
}

impl Default for HttpBridgeConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("netkit/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            max_redirects: 10,
            default_headers: HashMap::new(),
        }
    }
}

impl HttpBridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> NetkitResult<()> {
        if self.user_agent.is_empty() {
            return Err(NetkitError::config("User agent cannot be empty"));
        }
        if self.connect_timeout.is_zero() {
            return Err(NetkitError::config("Connect timeout cannot be zero"));
        }
        Ok(())
    }
}

struct Exchange {
    request: TransportRequest,
    sink: EventSink,
    runtime: Option<Handle>,
    task: Option<AbortHandle>,
}

/// [`Transport`] that performs real HTTP exchanges.
pub struct HttpBridge {
    plain: Client,
    compressed: Client,
    config: HttpBridgeConfig,
    exchanges: Arc<scc::HashMap<TransportHandle, Exchange>>,
}

impl fmt::Debug for HttpBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBridge")
            .field("config", &self.config)
            .field("exchanges", &self.exchanges.len())
            .finish()
    }
}

impl HttpBridge {
    pub fn new(config: HttpBridgeConfig) -> NetkitResult<Self> {
        config.validate()?;
        let plain = client_builder(&config)
            .no_gzip()
            .build()
            .map_err(|e| NetkitError::config(format!("Failed to build HTTP client: {e}")))?;
        let compressed = client_builder(&config)
            .gzip(true)
            .build()
            .map_err(|e| NetkitError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            plain,
            compressed,
            config,
            exchanges: Arc::new(scc::HashMap::new()),
        })
    }

    pub fn config(&self) -> &HttpBridgeConfig {
        &self.config
    }

    /// Number of exchanges opened and not yet finished or cancelled.
    pub fn open_exchanges(&self) -> usize {
        self.exchanges.len()
    }
}

fn client_builder(config: &HttpBridgeConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(Some(config.pool_idle_timeout))
        .redirect(reqwest::redirect::Policy::none())
}

impl Transport for HttpBridge {
    fn open(
        &self,
        request: &TransportRequest,
        sink: EventSink,
    ) -> Result<TransportHandle, TransportError> {
        Url::parse(&request.url)
            .map_err(|e| TransportError::invalid_request(format!("{}: {e}", request.url)))?;

        let mut request = request.clone();
        for (name, value) in &self.config.default_headers {
            request
                .headers
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }

        let handle = TransportHandle::next();
        let exchange = Exchange {
            request,
            sink,
            runtime: None,
            task: None,
        };
        if self.exchanges.insert_sync(handle, exchange).is_err() {
            return Err(TransportError::internal(format!(
                "exchange handle {handle} already in use"
            )));
        }
        Ok(handle)
    }

    fn schedule(&self, handle: TransportHandle, context: &ExecutionContext) {
        self.exchanges.update_sync(&handle, |_, exchange| {
            exchange.runtime = Some(context.runtime().clone());
        });
    }

    fn start(&self, handle: TransportHandle) {
        let Some((request, sink, runtime)) = self.exchanges.update_sync(&handle, |_, exchange| {
            (
                exchange.request.clone(),
                exchange.sink.clone(),
                exchange.runtime.clone(),
            )
        }) else {
            warn!(%handle, "Start requested for unknown exchange");
            return;
        };

        let Some(runtime) = runtime.or_else(|| Handle::try_current().ok()) else {
            sink.error(handle, TransportError::internal("no runtime to run the exchange on"));
            return;
        };

        let client = if request.accept_compression {
            self.compressed.clone()
        } else {
            self.plain.clone()
        };
        let max_redirects = self.config.max_redirects;
        let exchanges = Arc::clone(&self.exchanges);
        let task = runtime.spawn(async move {
            if let Err(err) = run_exchange(&client, &request, max_redirects, handle, &sink).await {
                debug!(%handle, error = %err, "Exchange failed");
                sink.error(handle, err);
            }
            exchanges.remove_sync(&handle);
        });

        let abort = task.abort_handle();
        if self
            .exchanges
            .update_sync(&handle, |_, exchange| exchange.task = Some(abort))
            .is_none()
        {
            // Cancelled or already finished; aborting a finished task is a no-op.
            task.abort();
        }
    }

    fn cancel(&self, handle: TransportHandle) {
        if let Some((_, exchange)) = self.exchanges.remove_sync(&handle) {
            if let Some(task) = exchange.task {
                task.abort();
            }
            trace!(%handle, "Exchange cancelled");
        }
    }
}

async fn run_exchange(
    client: &Client,
    request: &TransportRequest,
    max_redirects: usize,
    handle: TransportHandle,
    sink: &EventSink,
) -> Result<(), TransportError> {
    let mut url = Url::parse(&request.url)
        .map_err(|e| TransportError::invalid_request(format!("{}: {e}", request.url)))?;
    let mut method = http::Method::from(request.method);
    let mut body = request.body.clone();
    let mut redirects = 0;

    loop {
        let mut builder = client.request(method.clone(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.allow_cached_responses {
            builder = builder.header(CACHE_CONTROL, "no-cache");
        }
        if let Some(body) = &body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if status.is_redirection() {
            if let Some(location) = response.headers().get(LOCATION) {
                redirects += 1;
                if redirects > max_redirects {
                    return Err(TransportError::protocol("redirect limit exceeded"));
                }
                let location = location
                    .to_str()
                    .map_err(|_| TransportError::protocol("redirect Location is not valid text"))?;
                url = url.join(location).map_err(|e| {
                    TransportError::protocol(format!("redirect Location could not be resolved: {e}"))
                })?;

                // 303 always, and 301/302 after a POST, continue as a bodiless GET.
                let downgrade = status.as_u16() == 303
                    || (matches!(status.as_u16(), 301 | 302) && method == http::Method::POST);
                if downgrade {
                    method = http::Method::GET;
                    body = None;
                }

                trace!(%handle, %url, status = status.as_u16(), "Following redirect");
                sink.redirect(handle, url.as_str(), status.as_u16());
                continue;
            }
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        sink.response_header(handle, status.as_u16(), headers);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            sink.data_chunk(handle, chunk);
        }
        sink.complete(handle);
        return Ok(());
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::connect(error.to_string())
    } else if error.is_builder() {
        TransportError::invalid_request(error.to_string())
    } else {
        TransportError::protocol(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HttpBridgeConfig::default();
        assert!(config.user_agent.starts_with("netkit/"));
        assert_eq!(config.max_redirects, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(HttpBridgeConfig::new().user_agent("").validate().is_err());
        assert!(
            HttpBridgeConfig::new()
                .connect_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_open_rejects_invalid_url() {
        let bridge = HttpBridge::new(HttpBridgeConfig::default()).unwrap();
        let (sink, _rx) = EventSink::channel();
        let request = TransportRequest {
            method: crate::transport::Method::Get,
            url: "not a url".to_string(),
            headers: HashMap::new(),
            body: None,
            accept_compression: true,
            allow_cached_responses: false,
        };
        let err = bridge.open(&request, sink).unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest { .. }));
        assert_eq!(bridge.open_exchanges(), 0);
    }

    #[test]
    fn test_cancel_unknown_handle_is_noop() {
        let bridge = HttpBridge::new(HttpBridgeConfig::default()).unwrap();
        bridge.cancel(TransportHandle::from_raw(u64::MAX));
        assert_eq!(bridge.open_exchanges(), 0);
    }
}
