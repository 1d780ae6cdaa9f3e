//! Transport seam beneath the network client.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Nothing answered at the endpoint.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The endpoint answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Wire-level access to the coordination backend and to node endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Health probe used for connect and heartbeat.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Deliver a payload to an endpoint and wait for its reply.
    async fn send(&self, endpoint: &str, payload: Value) -> Result<Value, TransportError>;

    /// Ask an endpoint to abandon work. Best-effort; the default does nothing.
    async fn cancel(&self, _endpoint: &str, _payload: Value) -> Result<(), TransportError> {
        Ok(())
    }
}

/// An opaque execution backend that fulfils job payloads.
///
/// From the orchestrator's point of view it either returns a result, fails,
/// or takes too long.
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    async fn execute(&self, payload: Value) -> Result<Value, String>;
}

/// [`ExecutionProvider`] built from an async closure.
pub struct FnProvider<F> {
    run: F,
}

/// Wrap an async closure as an execution provider.
pub fn provider_fn<F, Fut>(run: F) -> Arc<FnProvider<F>>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(FnProvider { run })
}

#[async_trait]
impl<F, Fut> ExecutionProvider for FnProvider<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn execute(&self, payload: Value) -> Result<Value, String> {
        (self.run)(payload).await
    }
}

/// In-process transport routing endpoints to registered providers.
///
/// Used by the daemon's standalone mode and as the test double for remote
/// nodes. Taking it offline makes probes and sends fail as a dropped link would.
#[derive(Default)]
pub struct LoopbackTransport {
    providers: RwLock<HashMap<String, Arc<dyn ExecutionProvider>>>,
    offline: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `endpoint` to `provider`, replacing any previous route.
    pub fn register(&self, endpoint: impl Into<String>, provider: Arc<dyn ExecutionProvider>) {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(endpoint.into(), provider);
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    fn provider(&self, endpoint: &str) -> Option<Arc<dyn ExecutionProvider>> {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(endpoint)
            .cloned()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Unreachable("loopback offline".into()))
        }
    }

    async fn send(&self, endpoint: &str, payload: Value) -> Result<Value, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Unreachable("loopback offline".into()));
        }
        let provider = self
            .provider(endpoint)
            .ok_or_else(|| TransportError::Unreachable(endpoint.to_string()))?;
        provider.execute(payload).await.map_err(TransportError::Remote)
    }
}
