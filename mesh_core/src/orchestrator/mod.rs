//! Priority job orchestrator.
//!
//! Jobs are validated, authorized by the policy gate, and queued by
//! `(priority desc, submission asc)`. A single dispatcher pops the best
//! pending job that has a capable Active node, marks it Running and hands it
//! to a spawned task that calls the node through the network client with a
//! deadline. Remote execution runs in parallel up to `max_in_flight`; the
//! dispatcher itself never waits on a node.
//!
//! A failed or timed-out attempt goes back to Pending until the retry budget
//! is spent, then the job ends as Failed(Exhausted). Results from an attempt
//! that is no longer current are dropped.

mod job;
mod job_type;
mod queue;

pub use job::*;
pub use job_type::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use world_engine::{SharedClock, Timestamp};

use crate::config::OrchestratorConfig;
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeshEvent};
use crate::network::NetworkClient;
use crate::policy::{AccountId, DenyReason, PolicyGate};
use crate::registry::{Node, NodeFilter, NodeId, NodeRegistry};
use crate::shard::ShardedMap;
use queue::{JobQueue, QueueEntry};

/// A job submission as received from a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_type: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub metadata: Value,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, metadata: Value) -> Self {
        Self {
            job_type: job_type.into(),
            priority: None,
            metadata,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Local consequences of a completed job.
#[async_trait]
pub trait JobEffects: Send + Sync {
    /// Apply a node's result. The returned value is recorded as the job result.
    async fn apply(&self, job: &Job, result: Value) -> Result<Value>;
}

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { job_id: JobId, node_id: NodeId },
    /// The network client is disconnected.
    Paused,
    /// `max_in_flight` dispatches are already running.
    Saturated,
    /// Nothing is pending.
    Idle,
    /// Jobs are pending but no Active node can run them.
    NoCandidate,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was Pending and left the queue.
    Removed,
    /// The job was Running; the local wait was aborted and the node asked to stop.
    Forwarded,
    /// The job's result is already being applied.
    TooLate,
    AlreadyFinished(JobStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub queued: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub submitted_total: u64,
    pub retried_total: u64,
}

struct RunningDispatch {
    attempt: u32,
    node_id: NodeId,
    endpoint: String,
    abort: AbortHandle,
}

#[derive(Debug, Clone)]
struct ScheduledJob {
    job_type: JobType,
    every: Duration,
    priority: i32,
    metadata: Value,
}

/// Priority queue, dispatcher and recurring scheduler.
pub struct Orchestrator {
    jobs: ShardedMap<JobId, Job>,
    queue: Mutex<JobQueue>,
    sequence: AtomicU64,
    running: ShardedMap<JobId, RunningDispatch>,
    node_load: ShardedMap<NodeId, usize>,
    permits: Arc<Semaphore>,
    wake: Notify,
    submitted: AtomicU64,
    retried: AtomicU64,
    registry: Arc<NodeRegistry>,
    gate: Arc<PolicyGate>,
    network: Arc<NetworkClient>,
    effects: Option<Arc<dyn JobEffects>>,
    recurring: Vec<ScheduledJob>,
    config: OrchestratorConfig,
    clock: SharedClock,
    events: EventBus,
}

impl Orchestrator {
    /// Build an orchestrator. Fails if the job table is inconsistent or a
    /// recurring entry names an unknown type or invalid metadata.
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<NodeRegistry>,
        gate: Arc<PolicyGate>,
        network: Arc<NetworkClient>,
        clock: SharedClock,
        events: EventBus,
    ) -> Result<Self> {
        verify_job_table()?;

        let recurring = config
            .recurring
            .iter()
            .map(|entry| {
                let job_type: JobType = entry.job_type.parse()?;
                job_type.parse_payload(&entry.metadata)?;
                Ok(ScheduledJob {
                    job_type,
                    every: entry.every(),
                    priority: entry.priority.unwrap_or(SYSTEM_PRIORITY),
                    metadata: normalize_metadata(entry.metadata.clone()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            jobs: ShardedMap::default(),
            queue: Mutex::new(JobQueue::default()),
            sequence: AtomicU64::new(0),
            running: ShardedMap::default(),
            node_load: ShardedMap::default(),
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            wake: Notify::new(),
            submitted: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            registry,
            gate,
            network,
            effects: None,
            recurring,
            config,
            clock,
            events,
        })
    }

    pub fn with_effects(mut self, effects: Arc<dyn JobEffects>) -> Self {
        self.effects = Some(effects);
        self
    }

    /// Validate, authorize and enqueue a user job.
    ///
    /// Validation runs first so malformed requests never consume quota. Any
    /// error here means nothing was queued.
    pub fn submit(&self, account: &AccountId, request: JobRequest) -> Result<JobId> {
        let job_type: JobType = request.job_type.parse()?;
        job_type.parse_payload(&request.metadata)?;
        self.gate
            .check(account, job_type.profile().category)
            .into_result()?;

        let priority = request
            .priority
            .unwrap_or(job_type.profile().default_priority);
        Ok(self.enqueue(
            job_type,
            priority,
            normalize_metadata(request.metadata),
            Some(account.clone()),
        ))
    }

    /// Enqueue a job on behalf of the mesh itself, bypassing the policy gate.
    pub fn submit_system(&self, job_type: JobType, priority: i32, metadata: Value) -> Result<JobId> {
        job_type.parse_payload(&metadata)?;
        Ok(self.enqueue(job_type, priority, normalize_metadata(metadata), None))
    }

    fn enqueue(
        &self,
        job_type: JobType,
        priority: i32,
        metadata: Value,
        account: Option<AccountId>,
    ) -> JobId {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(job_type, priority, metadata, account, sequence, self.clock.now());
        let job_id = job.id;

        self.jobs.insert(job_id, job);
        self.lock_queue().push(QueueEntry {
            priority,
            sequence,
            job_id,
        });
        self.submitted.fetch_add(1, Ordering::Relaxed);

        info!(job_id = %job_id, %job_type, priority, "job submitted");
        self.events.publish(MeshEvent::JobSubmitted {
            job_id,
            job_type,
            priority,
        });
        self.wake.notify_one();
        job_id
    }

    pub fn get(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .get(&job_id)
            .ok_or_else(|| MeshError::not_found("job", job_id))
    }

    /// Jobs in submission order, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .into_iter()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .collect();
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }

    pub fn stats(&self) -> OrchestratorStats {
        let mut stats = OrchestratorStats {
            queued: self.lock_queue().len(),
            in_flight: self
                .config
                .max_in_flight
                .saturating_sub(self.permits.available_permits()),
            submitted_total: self.submitted.load(Ordering::Relaxed),
            retried_total: self.retried.load(Ordering::Relaxed),
            ..OrchestratorStats::default()
        };
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Cancel a job on behalf of the account that submitted it.
    ///
    /// Jobs owned by another account, and system jobs, are refused with
    /// [`DenyReason::NotOwner`]. The caller must also pass the gate for the
    /// job's category; a refusal leaves the job untouched.
    pub async fn cancel(&self, account: &AccountId, job_id: JobId) -> Result<CancelOutcome> {
        let (owner, job_type) = self
            .jobs
            .read(&job_id, |job| job.map(|j| (j.account_id.clone(), j.job_type)))
            .ok_or_else(|| MeshError::not_found("job", job_id))?;
        if owner.as_ref() != Some(account) {
            warn!(job_id = %job_id, account = %account, "cancel refused, not the job owner");
            return Err(MeshError::PolicyDenied(DenyReason::NotOwner));
        }
        self.gate
            .check(account, job_type.profile().category)
            .into_result()?;
        self.cancel_job(job_id).await
    }

    /// Cancel any job on behalf of the mesh itself, bypassing ownership and policy.
    pub async fn cancel_system(&self, job_id: JobId) -> Result<CancelOutcome> {
        self.cancel_job(job_id).await
    }

    /// Pending jobs leave the queue; Running jobs are aborted locally and the
    /// node is asked, best-effort, to stop.
    async fn cancel_job(&self, job_id: JobId) -> Result<CancelOutcome> {
        let now = self.clock.now();
        let status = {
            let mut queue = self.lock_queue();
            let status = self
                .jobs
                .modify(&job_id, |job| {
                    let status = job.status;
                    if status == JobStatus::Pending {
                        job.fail(JobError::Cancelled, now);
                    }
                    status
                })
                .ok_or_else(|| MeshError::not_found("job", job_id))?;
            if status == JobStatus::Pending {
                queue.remove(job_id);
            }
            status
        };

        match status {
            JobStatus::Pending => {
                info!(job_id = %job_id, "pending job cancelled");
                self.publish_failed(job_id, &JobError::Cancelled);
                Ok(CancelOutcome::Removed)
            }
            JobStatus::Running => {
                let Some(dispatch) = self.running.remove(&job_id) else {
                    return Ok(CancelOutcome::TooLate);
                };
                dispatch.abort.abort();
                self.release_node(dispatch.node_id);
                self.jobs.modify(&job_id, |job| {
                    if job.status == JobStatus::Running && job.attempt() == dispatch.attempt {
                        job.fail(JobError::Cancelled, now);
                    }
                });

                if let Err(e) = self
                    .network
                    .cancel(&dispatch.endpoint, json!({ "job_id": job_id }))
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "could not forward cancellation to node");
                }
                info!(job_id = %job_id, node_id = %dispatch.node_id, "running job cancelled");
                self.publish_failed(job_id, &JobError::Cancelled);
                self.wake.notify_one();
                Ok(CancelOutcome::Forwarded)
            }
            terminal => Ok(CancelOutcome::AlreadyFinished(terminal)),
        }
    }

    /// Forget the oldest finished jobs beyond `retain_finished`. Returns how
    /// many were dropped. Pending and Running jobs are never touched.
    pub fn prune_finished(&self) -> usize {
        let mut finished: Vec<(Timestamp, u64, JobId)> = self
            .jobs
            .values()
            .into_iter()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.completed_at.unwrap_or(job.submitted_at), job.sequence, job.id))
            .collect();
        let excess = finished.len().saturating_sub(self.config.retain_finished);
        if excess == 0 {
            return 0;
        }
        finished.sort_unstable();
        let pruned = finished
            .into_iter()
            .take(excess)
            .filter(|(_, _, job_id)| self.jobs.remove(job_id).is_some())
            .count();
        debug!(pruned, retained = self.config.retain_finished, "finished jobs pruned");
        pruned
    }

    /// Run one dispatch pass.
    ///
    /// Pops jobs in priority order until one has a capable node. Jobs without
    /// a candidate are put back untouched so they keep their place.
    pub fn dispatch_once(self: &Arc<Self>) -> DispatchOutcome {
        if !self.network.is_connected() {
            return DispatchOutcome::Paused;
        }
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return DispatchOutcome::Saturated;
        };

        let now = self.clock.now();
        let mut candidates: HashMap<&'static str, Vec<Node>> = HashMap::new();
        let mut skipped = Vec::new();
        let mut selected = None;

        // Held until the dispatch is registered in `running`, so `cancel`
        // never sees a Running job without its dispatch handle.
        let mut queue = self.lock_queue();
        while let Some(entry) = queue.pop() {
            let pending = self.jobs.read(&entry.job_id, |job| {
                job.filter(|j| j.status == JobStatus::Pending)
                    .map(|j| j.job_type)
            });
            let Some(job_type) = pending else {
                continue;
            };

            let capability = job_type.profile().capability;
            let nodes = candidates.entry(capability).or_insert_with(|| {
                self.registry
                    .discover(&NodeFilter::default().with_capability(capability))
            });
            let Some(node) = self.least_loaded(nodes) else {
                skipped.push(entry);
                continue;
            };

            let started = self
                .jobs
                .modify(&entry.job_id, |job| job.start(node.id, now).then(|| job.clone()))
                .flatten();
            if let Some(job) = started {
                selected = Some((job, node));
                break;
            }
        }
        let had_skipped = !skipped.is_empty();
        for entry in skipped {
            queue.push(entry);
        }
        let Some((job, node)) = selected else {
            return if had_skipped {
                DispatchOutcome::NoCandidate
            } else {
                DispatchOutcome::Idle
            };
        };

        let job_id = job.id;
        let node_id = node.id;
        let attempt = job.attempt();
        self.node_load
            .update(node_id, |load| *load = Some(load.unwrap_or(0) + 1));

        info!(job_id = %job_id, node_id = %node_id, attempt, "job dispatched");
        self.events.publish(MeshEvent::JobStarted {
            job_id,
            node_id,
            attempt,
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let endpoint = node.endpoint.clone();
        let handle = tokio::spawn(Arc::clone(self).execute(job, node, permit, ready_rx));
        self.running.insert(
            job_id,
            RunningDispatch {
                attempt,
                node_id,
                endpoint,
                abort: handle.abort_handle(),
            },
        );
        drop(queue);
        let _ = ready_tx.send(());

        DispatchOutcome::Dispatched { job_id, node_id }
    }

    /// Dispatch until shutdown, pausing while disconnected and backing off
    /// while there is nothing to do.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let min_idle = self.config.idle_backoff_min();
        let max_idle = self.config.idle_backoff_max();
        let mut connected = self.network.watch_connected();
        let mut idle = min_idle;
        info!(max_in_flight = self.config.max_in_flight, "dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.dispatch_once() {
                DispatchOutcome::Dispatched { .. } => {
                    idle = min_idle;
                    tokio::task::yield_now().await;
                    continue;
                }
                DispatchOutcome::Paused => {
                    debug!("dispatch paused while disconnected");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = connected.wait_for(|up| *up) => {
                            info!("dispatch resumed");
                        }
                    }
                    idle = min_idle;
                    continue;
                }
                DispatchOutcome::Saturated
                | DispatchOutcome::Idle
                | DispatchOutcome::NoCandidate => {
                    self.prune_finished();
                    idle
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {
                    idle = min_idle;
                }
                _ = tokio::time::sleep(wait) => {
                    idle = (idle * 2).min(max_idle);
                }
            }
        }
        info!("dispatcher stopped");
    }

    /// Submit configured recurring jobs on their intervals until shutdown.
    ///
    /// An occurrence is skipped while disconnected or while the previous job
    /// of the same entry is still outstanding.
    pub async fn run_recurring(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.recurring.is_empty() {
            return;
        }
        let start = Instant::now();
        let mut next: Vec<Instant> = self.recurring.iter().map(|s| start + s.every).collect();
        let mut last: Vec<Option<JobId>> = vec![None; self.recurring.len()];
        info!(entries = self.recurring.len(), "recurring scheduler started");

        loop {
            let Some(due) = next.iter().min().copied() else {
                break;
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(due) => {}
            }

            let now = Instant::now();
            for (i, scheduled) in self.recurring.iter().enumerate() {
                if next[i] > now {
                    continue;
                }
                while next[i] <= now {
                    next[i] += scheduled.every;
                }
                last[i] = self.fire_recurring(scheduled, last[i]);
            }
        }
        info!("recurring scheduler stopped");
    }

    fn fire_recurring(&self, scheduled: &ScheduledJob, previous: Option<JobId>) -> Option<JobId> {
        if !self.network.is_connected() {
            debug!(job_type = %scheduled.job_type, "recurring job skipped while disconnected");
            return previous;
        }
        if let Some(previous_id) = previous {
            let outstanding = self.jobs.read(&previous_id, |job| {
                job.is_some_and(|j| !j.status.is_terminal())
            });
            if outstanding {
                debug!(job_type = %scheduled.job_type, "previous recurring job still outstanding");
                return previous;
            }
        }
        Some(self.enqueue(
            scheduled.job_type,
            scheduled.priority,
            scheduled.metadata.clone(),
            None,
        ))
    }

    async fn execute(
        self: Arc<Self>,
        job: Job,
        node: Node,
        permit: OwnedSemaphorePermit,
        ready: oneshot::Receiver<()>,
    ) {
        if ready.await.is_err() {
            return;
        }
        let envelope = json!({
            "job_id": job.id,
            "job_type": job.job_type,
            "attempt": job.attempt(),
            "metadata": job.metadata,
        });
        let timeout = self.config.dispatch_timeout();
        let outcome = self
            .network
            .request_with_timeout(&node.endpoint, envelope, timeout)
            .await;

        if matches!(outcome, Err(MeshError::ExecutionTimeout(_))) {
            if let Err(e) = self
                .network
                .cancel(&node.endpoint, json!({ "job_id": job.id }))
                .await
            {
                debug!(job_id = %job.id, error = %e, "timeout cancellation not delivered");
            }
        }

        self.finish(job, outcome).await;
        drop(permit);
        self.wake.notify_one();
    }

    async fn finish(&self, job: Job, outcome: Result<Value>) {
        let attempt = job.attempt();
        let owned = self.running.update(job.id, |slot| {
            let owned = slot.as_ref().is_some_and(|r| r.attempt == attempt);
            if owned {
                if let Some(dispatch) = slot.take() {
                    self.release_node(dispatch.node_id);
                }
            }
            owned
        });
        if !owned {
            debug!(job_id = %job.id, attempt, "discarding result of superseded attempt");
            return;
        }

        match outcome {
            Ok(result) => {
                let applied = match &self.effects {
                    Some(effects) => effects.apply(&job, result).await,
                    None => Ok(result),
                };
                let now = self.clock.now();
                match applied {
                    Ok(value) => {
                        let completed = self
                            .jobs
                            .modify(&job.id, |j| j.attempt() == attempt && j.complete(value, now))
                            .unwrap_or(false);
                        if completed {
                            info!(job_id = %job.id, attempt, "job completed");
                            self.events
                                .publish(MeshEvent::JobCompleted { job_id: job.id });
                        }
                    }
                    Err(e) => {
                        let error = JobError::Effect {
                            message: e.to_string(),
                        };
                        let failed = self
                            .jobs
                            .modify(&job.id, |j| {
                                let current =
                                    j.status == JobStatus::Running && j.attempt() == attempt;
                                if current {
                                    j.fail(error.clone(), now);
                                }
                                current
                            })
                            .unwrap_or(false);
                        if failed {
                            error!(job_id = %job.id, error = %e, "job result could not be applied");
                            self.publish_failed(job.id, &error);
                        }
                    }
                }
            }
            Err(e) => self.retry_or_fail(job.id, attempt, e.to_string(), self.clock.now()),
        }
    }

    fn retry_or_fail(&self, job_id: JobId, attempt: u32, error: String, now: Timestamp) {
        let retry_limit = self.config.retry_limit;
        let outcome = self
            .jobs
            .modify(&job_id, |job| {
                if job.status != JobStatus::Running || job.attempt() != attempt {
                    return None;
                }
                let requeued = job.fail_attempt(error.clone(), retry_limit, now);
                Some((requeued, job.retry_count, job.priority, job.sequence, job.error.clone()))
            })
            .flatten();

        match outcome {
            Some((true, retry_count, priority, sequence, _)) => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job_id, retry_count, error = %error, "job attempt failed, requeued");
                self.events.publish(MeshEvent::JobRetrying {
                    job_id,
                    retry_count,
                    error,
                });
                self.lock_queue().push(QueueEntry {
                    priority,
                    sequence,
                    job_id,
                });
            }
            Some((false, retry_count, _, _, Some(job_error))) => {
                error!(job_id = %job_id, retry_count, error = %job_error, "job failed");
                self.publish_failed(job_id, &job_error);
            }
            Some((false, ..)) | None => {
                debug!(job_id = %job_id, attempt, "discarding failure of superseded attempt");
            }
        }
    }

    fn least_loaded(&self, nodes: &[Node]) -> Option<Node> {
        nodes
            .iter()
            .min_by_key(|node| self.node_load.get(&node.id).unwrap_or(0))
            .cloned()
    }

    fn release_node(&self, node_id: NodeId) {
        self.node_load.update(node_id, |load| {
            *load = load.and_then(|n| n.checked_sub(1)).filter(|n| *n > 0);
        });
    }

    fn publish_failed(&self, job_id: JobId, error: &JobError) {
        self.events.publish(MeshEvent::JobFailed {
            job_id,
            error: error.to_string(),
        });
    }

    fn lock_queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| {
            error!("job queue lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn normalize_metadata(metadata: Value) -> Value {
    match metadata {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkConfig, PolicyConfig, RecurringJobConfig, RegistryConfig};
    use crate::network::{provider_fn, LoopbackTransport};
    use crate::registry::NodeDescriptor;
    use serde_json::json;
    use world_engine::ManualClock;

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        registry: Arc<NodeRegistry>,
        gate: Arc<PolicyGate>,
        transport: Arc<LoopbackTransport>,
        account: AccountId,
    }

    async fn harness_with(
        config: OrchestratorConfig,
        connect: bool,
        effects: Option<Arc<dyn JobEffects>>,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let events = EventBus::default();
        let transport = Arc::new(LoopbackTransport::new());
        if !connect {
            transport.set_online(false);
        }
        let network = Arc::new(NetworkClient::new(
            transport.clone(),
            &NetworkConfig::default(),
            events.clone(),
        ));
        let _ = network.connect().await;

        let registry = Arc::new(NodeRegistry::new(
            RegistryConfig::default(),
            clock.clone(),
            events.clone(),
        ));
        let gate = Arc::new(PolicyGate::new(PolicyConfig::default(), clock.clone()));
        let mut orchestrator = Orchestrator::new(
            config,
            registry.clone(),
            gate.clone(),
            network,
            clock,
            events,
        )
        .unwrap();
        if let Some(effects) = effects {
            orchestrator = orchestrator.with_effects(effects);
        }

        let account = AccountId::new("acct");
        gate.record_consent(account.clone(), "mesh.maintenance", true, Value::Null);
        Harness {
            orchestrator: Arc::new(orchestrator),
            registry,
            gate,
            transport,
            account,
        }
    }

    async fn harness(config: OrchestratorConfig) -> Harness {
        harness_with(config, true, None).await
    }

    impl Harness {
        fn add_node(&self, endpoint: &str, provider: Arc<dyn crate::network::ExecutionProvider>) -> NodeId {
            self.transport.register(endpoint, provider);
            self.registry
                .register(NodeDescriptor::new("worker", endpoint).with_capability("maintenance"))
                .unwrap()
        }

        fn submit_maintenance(&self, priority: i32) -> JobId {
            self.orchestrator
                .submit(
                    &self.account,
                    JobRequest::new("maintenance", Value::Null).with_priority(priority),
                )
                .unwrap()
        }

        async fn wait_terminal(&self, job_id: JobId) -> Job {
            for _ in 0..1_000 {
                let job = self.orchestrator.get(job_id).unwrap();
                if job.status.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {job_id} never finished");
        }
    }

    fn echo() -> Arc<dyn crate::network::ExecutionProvider> {
        provider_fn(|envelope: Value| async move { Ok(json!({ "echo": envelope["job_type"] })) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejections_have_no_side_effects() {
        let h = harness(OrchestratorConfig::default()).await;

        let err = h
            .orchestrator
            .submit(&h.account, JobRequest::new("teleport", Value::Null))
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));

        let err = h
            .orchestrator
            .submit(&h.account, JobRequest::new("maintenance", json!({"bogus": 1})))
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));

        let err = h
            .orchestrator
            .submit(
                &h.account,
                JobRequest::new("region-activation", json!({"region": "north"})),
            )
            .unwrap_err();
        assert_eq!(err, MeshError::PolicyDenied(crate::policy::DenyReason::NoConsent));

        let stats = h.orchestrator.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.submitted_total, 0);
        assert!(h.gate.rate_window(&h.account).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_dispatches_first() {
        let h = harness(OrchestratorConfig {
            max_in_flight: 1,
            ..OrchestratorConfig::default()
        })
        .await;
        h.add_node("node-a", echo());

        let low = h.submit_maintenance(1);
        let high = h.submit_maintenance(9);

        match h.orchestrator.dispatch_once() {
            DispatchOutcome::Dispatched { job_id, .. } => assert_eq!(job_id, high),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.orchestrator.dispatch_once(), DispatchOutcome::Saturated);

        h.wait_terminal(high).await;
        match h.orchestrator.dispatch_once() {
            DispatchOutcome::Dispatched { job_id, .. } => assert_eq!(job_id, low),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_waits_for_capable_node() {
        let h = harness(OrchestratorConfig::default()).await;
        let job_id = h.submit_maintenance(1);

        assert_eq!(h.orchestrator.dispatch_once(), DispatchOutcome::NoCandidate);
        assert_eq!(h.orchestrator.get(job_id).unwrap().status, JobStatus::Pending);

        let node_id = h.add_node("node-a", echo());
        assert_eq!(
            h.orchestrator.dispatch_once(),
            DispatchOutcome::Dispatched { job_id, node_id }
        );
        assert_eq!(h.orchestrator.get(job_id).unwrap().status, JobStatus::Running);

        let job = h.wait_terminal(job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"echo": "maintenance"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_while_disconnected() {
        let h = harness_with(OrchestratorConfig::default(), false, None).await;
        h.add_node("node-a", echo());
        let job_id = h.submit_maintenance(1);

        assert_eq!(h.orchestrator.dispatch_once(), DispatchOutcome::Paused);
        assert_eq!(h.orchestrator.get(job_id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retry_then_exhaust() {
        let h = harness(OrchestratorConfig {
            retry_limit: 2,
            ..OrchestratorConfig::default()
        })
        .await;
        h.add_node(
            "node-a",
            provider_fn(|_| async { Err::<Value, _>("boom".to_string()) }),
        );
        let (tx, rx) = watch::channel(false);
        let dispatcher = tokio::spawn(h.orchestrator.clone().run(rx));

        let job_id = h.submit_maintenance(1);
        let job = h.wait_terminal(job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert!(matches!(job.error, Some(JobError::Exhausted { attempts: 3, .. })));
        assert_eq!(h.orchestrator.stats().retried_total, 2);

        tx.send(true).unwrap();
        dispatcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_drives_retry_path() {
        let h = harness(OrchestratorConfig {
            retry_limit: 1,
            dispatch_timeout_ms: 100,
            ..OrchestratorConfig::default()
        })
        .await;
        h.add_node(
            "node-a",
            provider_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        );
        let (tx, rx) = watch::channel(false);
        let dispatcher = tokio::spawn(h.orchestrator.clone().run(rx));

        let job_id = h.submit_maintenance(1);
        let job = h.wait_terminal(job_id).await;

        match job.error {
            Some(JobError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.orchestrator.stats().in_flight, 0);

        tx.send(true).unwrap();
        dispatcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_job() {
        let h = harness(OrchestratorConfig::default()).await;
        let job_id = h.submit_maintenance(1);

        assert_eq!(
            h.orchestrator.cancel(&h.account, job_id).await.unwrap(),
            CancelOutcome::Removed
        );
        let job = h.orchestrator.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error, Some(JobError::Cancelled));
        assert_eq!(h.orchestrator.stats().queued, 0);

        assert_eq!(
            h.orchestrator.cancel(&h.account, job_id).await.unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Failed)
        );
        assert!(matches!(
            h.orchestrator.cancel(&h.account, JobId::new()).await,
            Err(MeshError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_job() {
        let h = harness(OrchestratorConfig::default()).await;
        h.add_node(
            "node-a",
            provider_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }),
        );
        let job_id = h.submit_maintenance(1);
        assert!(matches!(
            h.orchestrator.dispatch_once(),
            DispatchOutcome::Dispatched { .. }
        ));
        tokio::task::yield_now().await;

        assert_eq!(
            h.orchestrator.cancel(&h.account, job_id).await.unwrap(),
            CancelOutcome::Forwarded
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let job = h.orchestrator.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error, Some(JobError::Cancelled));
        assert_eq!(h.orchestrator.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_requires_ownership() {
        let h = harness(OrchestratorConfig::default()).await;
        let job_id = h.submit_maintenance(1);

        let intruder = AccountId::new("intruder");
        h.gate
            .record_consent(intruder.clone(), "mesh.maintenance", true, Value::Null);
        assert_eq!(
            h.orchestrator.cancel(&intruder, job_id).await.unwrap_err(),
            MeshError::PolicyDenied(DenyReason::NotOwner)
        );
        assert_eq!(h.orchestrator.get(job_id).unwrap().status, JobStatus::Pending);
        assert_eq!(h.orchestrator.stats().queued, 1);

        let system = h
            .orchestrator
            .submit_system(JobType::Maintenance, SYSTEM_PRIORITY, json!({}))
            .unwrap();
        assert_eq!(
            h.orchestrator.cancel(&h.account, system).await.unwrap_err(),
            MeshError::PolicyDenied(DenyReason::NotOwner)
        );
        assert_eq!(
            h.orchestrator.cancel_system(system).await.unwrap(),
            CancelOutcome::Removed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_requires_consent() {
        let h = harness(OrchestratorConfig::default()).await;
        let job_id = h.submit_maintenance(1);

        h.gate
            .record_consent(h.account.clone(), "mesh.maintenance", false, Value::Null);
        assert_eq!(
            h.orchestrator.cancel(&h.account, job_id).await.unwrap_err(),
            MeshError::PolicyDenied(DenyReason::NoConsent)
        );
        assert_eq!(h.orchestrator.get(job_id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_racing_dispatch_never_too_late() {
        let h = harness(OrchestratorConfig::default()).await;
        h.add_node(
            "node-a",
            provider_fn(|_| async { std::future::pending::<Result<Value, String>>().await }),
        );
        h.gate
            .set_tier(h.account.clone(), crate::policy::Tier::Enterprise);

        for _ in 0..50 {
            let job_id = h.submit_maintenance(1);
            let orchestrator = h.orchestrator.clone();
            let account = h.account.clone();
            let canceller = tokio::spawn(async move {
                loop {
                    match orchestrator.get(job_id).unwrap().status {
                        JobStatus::Pending => tokio::task::yield_now().await,
                        _ => return orchestrator.cancel(&account, job_id).await.unwrap(),
                    }
                }
            });

            assert!(matches!(
                h.orchestrator.dispatch_once(),
                DispatchOutcome::Dispatched { .. }
            ));
            assert_eq!(canceller.await.unwrap(), CancelOutcome::Forwarded);
        }
        assert_eq!(h.orchestrator.stats().running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_finished_keeps_newest() {
        let h = harness(OrchestratorConfig {
            retain_finished: 2,
            ..OrchestratorConfig::default()
        })
        .await;
        let finished: Vec<JobId> = (0..4).map(|_| h.submit_maintenance(1)).collect();
        let pending = h.submit_maintenance(1);
        for job_id in &finished {
            h.orchestrator.cancel(&h.account, *job_id).await.unwrap();
        }

        assert_eq!(h.orchestrator.prune_finished(), 2);
        assert!(h.orchestrator.get(finished[0]).is_err());
        assert!(h.orchestrator.get(finished[1]).is_err());
        assert!(h.orchestrator.get(finished[2]).is_ok());
        assert!(h.orchestrator.get(finished[3]).is_ok());
        assert_eq!(h.orchestrator.get(pending).unwrap().status, JobStatus::Pending);

        assert_eq!(h.orchestrator.prune_finished(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_prunes_when_idle() {
        let h = harness(OrchestratorConfig {
            retain_finished: 1,
            ..OrchestratorConfig::default()
        })
        .await;
        h.add_node("node-a", echo());
        let (tx, rx) = watch::channel(false);
        let dispatcher = tokio::spawn(h.orchestrator.clone().run(rx));

        for _ in 0..3 {
            let job_id = h.submit_maintenance(1);
            h.wait_terminal(job_id).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.orchestrator.list(None).len(), 1);
        assert_eq!(h.orchestrator.stats().submitted_total, 3);

        tx.send(true).unwrap();
        dispatcher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_effects_shape_result() {
        struct Wrap;

        #[async_trait]
        impl JobEffects for Wrap {
            async fn apply(&self, job: &Job, result: Value) -> Result<Value> {
                Ok(json!({ "type": job.job_type, "node": result }))
            }
        }

        let h = harness_with(OrchestratorConfig::default(), true, Some(Arc::new(Wrap))).await;
        h.add_node("node-a", echo());
        let job_id = h.submit_maintenance(1);
        h.orchestrator.dispatch_once();

        let job = h.wait_terminal(job_id).await;
        assert_eq!(
            job.result,
            Some(json!({"type": "maintenance", "node": {"echo": "maintenance"}}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_jobs_do_not_pile_up() {
        let h = harness(OrchestratorConfig {
            recurring: vec![RecurringJobConfig {
                job_type: "maintenance".into(),
                every_secs: 1,
                priority: None,
                metadata: json!({}),
            }],
            ..OrchestratorConfig::default()
        })
        .await;
        let (tx, rx) = watch::channel(false);
        let scheduler = tokio::spawn(h.orchestrator.clone().run_recurring(rx));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let jobs = h.orchestrator.list(None);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].account_id, None);
        assert_eq!(jobs[0].priority, SYSTEM_PRIORITY);

        h.orchestrator.cancel_system(jobs[0].id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.orchestrator.list(Some(JobStatus::Pending)).len(), 1);

        tx.send(true).unwrap();
        scheduler.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unknown_recurring_type() {
        let clock = Arc::new(ManualClock::default());
        let events = EventBus::default();
        let network = Arc::new(NetworkClient::new(
            Arc::new(LoopbackTransport::new()),
            &NetworkConfig::default(),
            events.clone(),
        ));
        let registry = Arc::new(NodeRegistry::new(
            RegistryConfig::default(),
            clock.clone(),
            events.clone(),
        ));
        let gate = Arc::new(PolicyGate::new(PolicyConfig::default(), clock.clone()));
        let config = OrchestratorConfig {
            recurring: vec![RecurringJobConfig {
                job_type: "teleport".into(),
                every_secs: 5,
                priority: None,
                metadata: json!({}),
            }],
            ..OrchestratorConfig::default()
        };
        assert!(Orchestrator::new(config, registry, gate, network, clock, events).is_err());
    }
}
