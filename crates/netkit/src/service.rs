//! Process-wide bundle of the network collaborators.

use std::sync::Arc;

use tracing::info;

use crate::{
    config::SchedulerConfig,
    context::{ContextId, ContextPool, ContextProvider},
    error::NetkitResult,
    scheduler::CallScheduler,
    transaction::TransactionLayer,
    transport::Transport,
};

/// Context pool, scheduler and transaction layer, built once at start-up and
/// handed by reference to whoever needs them.
#[derive(Debug, Clone)]
pub struct NetworkServices {
    contexts: Arc<ContextPool>,
    scheduler: Arc<CallScheduler>,
    transactions: TransactionLayer,
}

impl NetworkServices {
    /// Start the services on the current tokio runtime with `transport`.
    ///
    /// The `main` context is pinned for the lifetime of the pool.
    pub fn start(config: SchedulerConfig, transport: Arc<dyn Transport>) -> NetkitResult<Self> {
        let contexts = Arc::new(ContextPool::current()?);
        contexts.pin(&ContextId::main(), true);

        let quotas = config.quotas;
        let provider: Arc<dyn ContextProvider> = contexts.clone();
        let scheduler = CallScheduler::start(config, transport, provider)?;
        let transactions = TransactionLayer::new(Arc::clone(&scheduler));
        info!(?quotas, "Network services started");

        Ok(Self {
            contexts,
            scheduler,
            transactions,
        })
    }

    /// Start the services over a real HTTP stack.
    #[cfg(feature = "http")]
    pub fn start_http(
        config: SchedulerConfig,
        http: crate::http::HttpBridgeConfig,
    ) -> NetkitResult<Self> {
        let bridge = crate::http::HttpBridge::new(http)?;
        Self::start(config, Arc::new(bridge))
    }

    pub fn contexts(&self) -> &Arc<ContextPool> {
        &self.contexts
    }

    pub fn scheduler(&self) -> &Arc<CallScheduler> {
        &self.scheduler
    }

    pub fn transactions(&self) -> &TransactionLayer {
        &self.transactions
    }
}
