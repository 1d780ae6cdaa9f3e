//! Backend synchronization between the local world and the authoritative store.
//!
//! Pulls happen without holding the world lock; only the merge itself takes
//! the write lock, so the tick loop is never blocked on backend I/O.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::time::Timestamp;
use crate::world_state::{EntitySnapshot, MergeReport, SharedWorld, WorldSnapshot};

/// The authoritative store replicas reconcile against.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the remote view of the world.
    async fn pull(&self) -> Result<Vec<EntitySnapshot>, SyncError>;

    /// Publish a full local checkpoint. Read-only backends can keep the default.
    async fn push(&self, _snapshot: WorldSnapshot) -> Result<(), SyncError> {
        Ok(())
    }
}

/// In-process backend, used by the daemon's standalone mode and by tests.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entities: Mutex<Vec<EntitySnapshot>>,
    unavailable: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace what the backend will serve on the next pull.
    pub fn set_entities(&self, entities: Vec<EntitySnapshot>) {
        *lock(&self.entities) = entities;
    }

    /// Simulate an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn entities(&self) -> Vec<EntitySnapshot> {
        lock(&self.entities).clone()
    }
}

#[async_trait]
impl SnapshotSource for InMemoryBackend {
    async fn pull(&self) -> Result<Vec<EntitySnapshot>, SyncError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::Unavailable("in-memory backend offline".into()));
        }
        Ok(self.entities())
    }

    async fn push(&self, snapshot: WorldSnapshot) -> Result<(), SyncError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::Unavailable("in-memory backend offline".into()));
        }
        self.set_entities(snapshot.entities);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("in-memory backend lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Callback invoked after every successful merge.
pub type MergeObserver = Arc<dyn Fn(Timestamp, &MergeReport) + Send + Sync>;

/// Periodically reconciles the local world with a [`SnapshotSource`].
pub struct SyncWorker {
    world: SharedWorld,
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    trigger: Arc<Notify>,
    observer: Option<MergeObserver>,
    tombstone_ttl: Option<Duration>,
}

impl SyncWorker {
    pub fn new(world: SharedWorld, source: Arc<dyn SnapshotSource>, interval: Duration) -> Self {
        Self {
            world,
            source,
            interval,
            trigger: Arc::new(Notify::new()),
            observer: None,
            tombstone_ttl: None,
        }
    }

    /// After each successful merge, forget tombstones older than `ttl`.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = Some(ttl);
        self
    }

    /// Call `observer` with the merge time and report after each pull.
    pub fn with_observer(mut self, observer: MergeObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handle that requests an immediate pull when notified.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Pull remote snapshots and upsert them with last-write-wins.
    pub async fn sync_once(&self) -> Result<MergeReport, SyncError> {
        let remote = self.source.pull().await?;
        let pulled = remote.len();
        let (report, at, pruned) = {
            let mut world = self.world.write().await;
            let report = world.merge_remote(remote)?;
            let at = world.now();
            let pruned = match self.tombstone_ttl {
                Some(ttl) => {
                    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                    world.prune_tombstones(Timestamp::from_millis(
                        at.as_millis().saturating_sub(ttl_ms),
                    ))
                }
                None => 0,
            };
            (report, at, pruned)
        };
        debug!(
            pulled,
            pruned,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "world sync merged"
        );
        if let Some(observer) = &self.observer {
            observer(at, &report);
        }
        Ok(report)
    }

    /// Push a full checkpoint of the local world.
    pub async fn checkpoint(&self) -> Result<usize, SyncError> {
        let snapshot = self.world.read().await.export();
        let count = snapshot.entities.len();
        self.source.push(snapshot).await?;
        Ok(count)
    }

    /// Replace the local world wholesale with the remote view.
    pub async fn bootstrap(&self) -> Result<usize, SyncError> {
        let remote = self.source.pull().await?;
        let mut world = self.world.write().await;
        let count = remote.len();
        let snapshot = WorldSnapshot {
            taken_at: world.now(),
            entities: remote,
        };
        world.import(snapshot)?;
        info!(entities = count, "world bootstrapped from backend");
        Ok(count)
    }

    /// Pull on every interval or trigger until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "world sync started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
                _ = self.trigger.notified() => {
                    debug!("world sync triggered");
                }
            }

            if let Err(e) = self.sync_once().await {
                warn!(error = %e, "world sync failed, retrying next interval");
            }
        }
        info!("world sync stopped");
    }
}
