//! Resilient network client: connectivity, heartbeat, and reconnect with backoff.
//!
//! The client owns a single supervisor task. While connected it probes the
//! transport every heartbeat interval; the first failed probe flips
//! `connected` to false at once and the supervisor switches to reconnecting
//! with exponential backoff. Requests never queue: while disconnected they
//! fail with [`MeshError::Connectivity`].

mod transport;

pub use transport::*;

use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeshEvent};

/// Exponential backoff: `delay(n) = min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay for the given zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Client for the coordination backend and node endpoints.
pub struct NetworkClient {
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    heartbeat_interval: Duration,
    request_timeout: Duration,
    connected: watch::Sender<bool>,
    /// Consecutive failed probes since the last success.
    failures: AtomicU32,
    events: EventBus,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkClient {
    pub fn new(transport: Arc<dyn Transport>, config: &NetworkConfig, events: EventBus) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            transport,
            backoff: Backoff::new(config.backoff_base(), config.backoff_cap()),
            heartbeat_interval: config.heartbeat_interval(),
            request_timeout: config.request_timeout(),
            connected,
            failures: AtomicU32::new(0),
            events,
            supervisor: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Observe the `connected` flag; dependents use this to pause and resume work.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Consecutive failed probes since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Delay the supervisor will wait before the next reconnect attempt.
    pub fn next_reconnect_delay(&self) -> Duration {
        self.backoff
            .delay(self.consecutive_failures().saturating_sub(1))
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Probe the backend once and start the supervisor.
    ///
    /// On success the failure counter resets and heartbeats begin. On failure
    /// the supervisor keeps retrying in the background with backoff; the
    /// error is returned so the caller knows the first attempt failed.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let outcome = self.probe_once().await;
        self.ensure_supervisor();
        outcome
    }

    /// Stop the supervisor and mark the client disconnected.
    pub fn disconnect(&self) {
        if let Some(handle) = self.lock_supervisor().take() {
            handle.abort();
        }
        self.mark_disconnected("client shut down");
    }

    /// Send a request with the default timeout.
    pub async fn request(&self, endpoint: &str, payload: Value) -> Result<Value> {
        self.request_with_timeout(endpoint, payload, self.request_timeout)
            .await
    }

    /// Send a request with an explicit deadline.
    ///
    /// Fails immediately when disconnected, and aborts early if the
    /// connection drops while the request is in flight.
    pub async fn request_with_timeout(
        &self,
        endpoint: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let mut connected = self.connected.subscribe();
        if !*connected.borrow_and_update() {
            return Err(MeshError::Connectivity(format!(
                "cannot reach {endpoint}: client disconnected"
            )));
        }

        tokio::select! {
            outcome = tokio::time::timeout(timeout, self.transport.send(endpoint, payload)) => {
                match outcome {
                    Err(_) => Err(MeshError::ExecutionTimeout(timeout)),
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(e)) => Err(MeshError::Execution(e.to_string())),
                }
            }
            _ = connected.wait_for(|up| !*up) => {
                Err(MeshError::Connectivity(format!(
                    "connection lost during request to {endpoint}"
                )))
            }
        }
    }

    /// Forward a best-effort cancellation.
    pub async fn cancel(&self, endpoint: &str, payload: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(MeshError::Connectivity("client disconnected".into()));
        }
        self.transport
            .cancel(endpoint, payload)
            .await
            .map_err(|e| MeshError::Execution(e.to_string()))
    }

    /// One health check, bounded by the request timeout. A check that never
    /// answers counts as a failure like any other.
    async fn probe_once(&self) -> Result<()> {
        let outcome = match tokio::time::timeout(self.request_timeout, self.transport.probe()).await {
            Ok(outcome) => outcome.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "no answer within {}ms",
                self.request_timeout.as_millis()
            )),
        };
        match outcome {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                self.mark_connected();
                Ok(())
            }
            Err(reason) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %reason, failures, "connectivity check failed");
                self.mark_disconnected(&reason);
                Err(MeshError::Connectivity(reason))
            }
        }
    }

    fn mark_connected(&self) {
        let changed = self.connected.send_if_modified(|up| !std::mem::replace(up, true));
        if changed {
            info!("network client connected");
            self.events.publish(MeshEvent::Connected);
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        let changed = self.connected.send_if_modified(|up| std::mem::replace(up, false));
        if changed {
            warn!(reason, "network client disconnected");
            self.events.publish(MeshEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_supervisor(self: &Arc<Self>) {
        let mut slot = self.lock_supervisor();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(supervise(weak)));
    }
}

/// Heartbeat while connected, reconnect with backoff while not.
///
/// Holds only a weak reference so dropping the client ends the task.
async fn supervise(client: Weak<NetworkClient>) {
    loop {
        let Some(this) = client.upgrade() else {
            return;
        };
        let wait = if this.is_connected() {
            this.heartbeat_interval
        } else {
            let delay = this.next_reconnect_delay();
            debug!(
                delay_ms = delay.as_millis() as u64,
                failures = this.consecutive_failures(),
                "scheduling reconnect"
            );
            delay
        };
        drop(this);

        tokio::time::sleep(wait).await;

        let Some(this) = client.upgrade() else {
            return;
        };
        let _ = this.probe_once().await;
    }
}
