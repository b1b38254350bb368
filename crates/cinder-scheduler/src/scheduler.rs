//! Dispatch scheduler.
//!
//! One task owns the dispatch queue and the agents waiting for work; everything else
//! talks to it over a command channel. Lease writes run in their own tasks and report
//! back when done, so a slow job store never stalls the queue.

use crate::agents::{PoolHealth, check_pool, resolve_pool};
use crate::jobs::{JobListener, JobService};
use crate::queue::{DispatchQueue, QueueItem};
use async_trait::async_trait;
use chrono::Utc;
use cinder_core::agent::{Lease, LeaseOutcome, LeaseRequest, StreamConfig};
use cinder_core::graph::Graph;
use cinder_core::ids::{AgentId, BatchId, JobId, LeaseId, StreamId};
use cinder_core::job::{Batch, BatchErrorCode, Job};
use cinder_core::ports::{AgentDirectory, StreamDirectory};
use cinder_core::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Pause before a batch whose lease write failed is offered again.
const ASSIGNMENT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Point-in-time view of the dispatch queue.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub items: Vec<QueueItem>,
    pub waiters: usize,
}

struct Waiter {
    id: u64,
    request: LeaseRequest,
    reply: oneshot::Sender<Lease>,
}

enum AssignmentResult {
    Assigned,
    /// The agent stopped waiting and the lease was withdrawn.
    Reverted,
    /// The queue entry did not match the stored job; the waiter goes back in line.
    Stale(Waiter),
    /// The job store failed. The entry stays queued and the waiter goes back in line.
    Failed(Waiter),
}

enum Command {
    JobUpdated {
        job_id: JobId,
        update_index: u64,
        items: Vec<QueueItem>,
    },
    JobRemoved {
        job_id: JobId,
    },
    AddWaiter(Waiter),
    CancelWaiter {
        id: u64,
    },
    CancelAgent {
        agent_id: AgentId,
    },
    AssignmentFinished {
        job_id: JobId,
        batch_id: BatchId,
        result: AssignmentResult,
    },
    BeginReconcile,
    FinishReconcile {
        scanned: HashMap<JobId, (u64, Vec<QueueItem>)>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    jobs: Arc<JobService>,
    agents: Arc<dyn AgentDirectory>,
    streams: Arc<dyn StreamDirectory>,
    next_waiter: AtomicU64,
    reconcile_lock: Mutex<()>,
}

/// Handle to the dispatch loop. Cheap to clone.
#[derive(Clone)]
pub struct DispatchScheduler {
    inner: Arc<Inner>,
}

impl DispatchScheduler {
    /// Spawn the dispatch loop and subscribe it to job updates.
    pub async fn start(
        jobs: Arc<JobService>,
        agents: Arc<dyn AgentDirectory>,
        streams: Arc<dyn StreamDirectory>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            queue: DispatchQueue::new(),
            waiters: VecDeque::new(),
            reconciling: None,
            jobs: jobs.clone(),
            commands: commands.clone(),
        };
        tokio::spawn(dispatcher.run(receiver));

        jobs.add_listener(Arc::new(QueueUpdater {
            commands: commands.clone(),
            streams: streams.clone(),
        }))
        .await;

        Self {
            inner: Arc::new(Inner {
                commands,
                jobs,
                agents,
                streams,
                next_waiter: AtomicU64::new(1),
                reconcile_lock: Mutex::new(()),
            }),
        }
    }

    pub fn jobs(&self) -> &Arc<JobService> {
        &self.inner.jobs
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| Error::Internal("dispatch loop is not running".to_string()))
    }

    /// Wait for a lease on behalf of an idle agent.
    ///
    /// Returns `None` when no work turned up within the configured wait, or when the
    /// agent's request was cancelled. Dropping the returned future withdraws the request.
    pub async fn assign_lease(&self, request: LeaseRequest) -> Result<Option<Lease>> {
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let agent_id = request.agent_id;
        let (reply, mut receiver) = oneshot::channel();
        self.send(Command::AddWaiter(Waiter { id, request, reply }))?;
        let _guard = WaiterGuard {
            id,
            commands: self.inner.commands.clone(),
        };

        let wait = self.inner.jobs.config().lease_wait_timeout();
        match tokio::time::timeout(wait, &mut receiver).await {
            Ok(Ok(lease)) => Ok(Some(lease)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                // A lease may have been handed over just as the wait expired.
                receiver.close();
                let lease = receiver.try_recv().ok();
                if lease.is_none() {
                    debug!(agent_id = %agent_id, "No work available for agent");
                }
                Ok(lease)
            }
        }
    }

    /// Drop every pending request from an agent, e.g. when its session ends.
    pub fn cancel_agent(&self, agent_id: AgentId) -> Result<()> {
        self.send(Command::CancelAgent { agent_id })
    }

    /// Settle the batch behind a finished lease.
    pub async fn lease_finished(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        lease_id: LeaseId,
        outcome: LeaseOutcome,
    ) -> Result<Option<Job>> {
        self.inner
            .jobs
            .lease_finished(job_id, batch_id, lease_id, outcome)
            .await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        receiver
            .await
            .map_err(|_| Error::Internal("dispatch loop is not running".to_string()))
    }

    /// Rebuild the queue from the job store and fail batches that can never be dispatched.
    ///
    /// Overlapping calls return immediately.
    pub async fn reconcile(&self) -> Result<()> {
        let Ok(_running) = self.inner.reconcile_lock.try_lock() else {
            debug!("Queue reconciliation already in progress");
            return Ok(());
        };

        self.send(Command::BeginReconcile)?;
        let jobs = self.inner.jobs.job_store().find_dispatchable().await?;
        let pools = self.inner.agents.list_pools().await?;
        let agents = self.inner.agents.list_agents().await?;
        let grace = self.inner.jobs.config().no_agents_online_grace();
        let now = Utc::now();

        let mut streams: HashMap<StreamId, Option<StreamConfig>> = HashMap::new();
        let mut scanned = HashMap::new();
        let mut unschedulable = Vec::new();
        for job in jobs {
            let index = match self.inner.jobs.graph_index(&job.graph_hash).await {
                Ok(index) => index,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Skipping job with unreadable graph");
                    continue;
                }
            };
            let stream = match streams.get(&job.stream_id) {
                Some(stream) => stream.clone(),
                None => match self.inner.streams.get_stream(&job.stream_id).await {
                    Ok(stream) => {
                        streams.insert(job.stream_id.clone(), stream.clone());
                        stream
                    }
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "Failed to read stream configuration");
                        continue;
                    }
                },
            };

            let mut items = Vec::new();
            for batch in job.batches.iter().filter(|b| b.is_dispatchable()) {
                let Some(group) = index.graph().groups.get(batch.group_idx) else {
                    continue;
                };
                let assignment = match resolve_pool(stream.as_ref(), &group.agent_type) {
                    Ok(assignment) => assignment,
                    Err(code) => {
                        unschedulable.push((job.id, batch.id, code));
                        continue;
                    }
                };
                match check_pool(&assignment.pool_id, &pools, &agents) {
                    PoolHealth::Unschedulable(code) => {
                        unschedulable.push((job.id, batch.id, code));
                        continue;
                    }
                    PoolHealth::NoAgentsOnline
                        if batch.ready_time.is_some_and(|t| now - t > grace) =>
                    {
                        unschedulable.push((job.id, batch.id, BatchErrorCode::NoAgentsOnline));
                        continue;
                    }
                    PoolHealth::NoAgentsOnline | PoolHealth::Available => {}
                }
                items.push(QueueItem {
                    job_id: job.id,
                    batch_id: batch.id,
                    schedule_priority: batch.schedule_priority,
                    pool_id: assignment.pool_id,
                    workspace: assignment.workspace,
                });
            }
            scanned.insert(job.id, (job.update_index, items));
        }

        debug!(jobs = scanned.len(), unschedulable = unschedulable.len(), "Queue reconciled");
        self.send(Command::FinishReconcile { scanned })?;

        for (job_id, batch_id, error) in unschedulable {
            if let Err(e) = self.inner.jobs.fail_batch(job_id, batch_id, error).await {
                warn!(job_id = %job_id, batch_id = %batch_id, error = %e, "Failed to fail unschedulable batch");
            }
        }
        Ok(())
    }

    /// Periodic reconciliation and step timeouts until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.inner.jobs.config().clone();
        let mut reconcile = tokio::time::interval(config.reconcile_interval());
        let mut timeouts = tokio::time::interval(config.step_timeout_check_interval());
        info!(
            reconcile_interval_secs = config.reconcile_interval_secs,
            "Dispatch scheduler started"
        );

        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Queue reconciliation failed");
                    }
                }
                _ = timeouts.tick() => {
                    match self.inner.jobs.expire_steps(Utc::now()).await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "Timed out running steps"),
                        Err(e) => warn!(error = %e, "Step timeout sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Dispatch scheduler shutting down");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Stop the dispatch loop. Waiting agents are released without a lease.
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);
    }
}

/// Withdraws a waiter when its request returns or is dropped.
struct WaiterGuard {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::CancelWaiter { id: self.id });
    }
}

/// Feeds committed jobs into the dispatch loop.
struct QueueUpdater {
    commands: mpsc::UnboundedSender<Command>,
    streams: Arc<dyn StreamDirectory>,
}

#[async_trait]
impl JobListener for QueueUpdater {
    async fn job_updated(&self, job: &Job, graph: &Graph) {
        let items = queue_items(job, graph, self.streams.as_ref()).await;
        let _ = self.commands.send(Command::JobUpdated {
            job_id: job.id,
            update_index: job.update_index,
            items,
        });
    }

    async fn job_removed(&self, job_id: JobId) {
        let _ = self.commands.send(Command::JobRemoved { job_id });
    }
}

/// Queue entries for a job's dispatchable batches. Batches whose pool cannot be resolved
/// are left out; reconciliation fails them.
async fn queue_items(job: &Job, graph: &Graph, streams: &dyn StreamDirectory) -> Vec<QueueItem> {
    if !job.batches.iter().any(Batch::is_dispatchable) {
        return Vec::new();
    }
    let stream = match streams.get_stream(&job.stream_id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Failed to read stream configuration");
            None
        }
    };

    job.batches
        .iter()
        .filter(|b| b.is_dispatchable())
        .filter_map(|batch| {
            let group = graph.groups.get(batch.group_idx)?;
            let assignment = resolve_pool(stream.as_ref(), &group.agent_type).ok()?;
            Some(QueueItem {
                job_id: job.id,
                batch_id: batch.id,
                schedule_priority: batch.schedule_priority,
                pool_id: assignment.pool_id,
                workspace: assignment.workspace,
            })
        })
        .collect()
}

struct Dispatcher {
    queue: DispatchQueue,
    waiters: VecDeque<Waiter>,
    /// Jobs updated since the current reconciliation started.
    reconciling: Option<HashSet<JobId>>,
    jobs: Arc<JobService>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Dispatcher {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
            self.dispatch();
        }
        debug!(waiters = self.waiters.len(), "Dispatch loop stopped");
    }

    fn touch(&mut self, job_id: JobId) {
        if let Some(touched) = &mut self.reconciling {
            touched.insert(job_id);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::JobUpdated {
                job_id,
                update_index,
                items,
            } => {
                self.touch(job_id);
                if !self.queue.update_job(job_id, update_index, items) {
                    debug!(job_id = %job_id, update_index, "Ignoring out-of-date queue update");
                }
            }
            Command::JobRemoved { job_id } => {
                self.touch(job_id);
                self.queue.remove_job(job_id);
            }
            Command::AddWaiter(waiter) => self.waiters.push_back(waiter),
            Command::CancelWaiter { id } => self.waiters.retain(|w| w.id != id),
            Command::CancelAgent { agent_id } => {
                self.waiters.retain(|w| w.request.agent_id != agent_id)
            }
            Command::AssignmentFinished {
                job_id,
                batch_id,
                result,
            } => match result {
                AssignmentResult::Assigned | AssignmentResult::Reverted => {
                    self.queue.release(job_id, batch_id);
                }
                AssignmentResult::Stale(waiter) => {
                    self.queue.remove(job_id, batch_id);
                    if !waiter.reply.is_closed() {
                        self.waiters.push_front(waiter);
                    }
                }
                AssignmentResult::Failed(waiter) => {
                    self.queue.release(job_id, batch_id);
                    if !waiter.reply.is_closed() {
                        self.waiters.push_front(waiter);
                    }
                }
            },
            Command::BeginReconcile => self.reconciling = Some(HashSet::new()),
            Command::FinishReconcile { scanned } => {
                let touched = self.reconciling.take().unwrap_or_default();
                self.queue.reconcile(scanned, &touched);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(QueueSnapshot {
                    items: self.queue.items(),
                    waiters: self.waiters.len(),
                });
            }
            Command::Shutdown => {}
        }
    }

    /// Match waiting agents, oldest first, with the best item each of them can serve.
    fn dispatch(&mut self) {
        if self.waiters.is_empty() || self.queue.available().next().is_none() {
            return;
        }
        let mut remaining = VecDeque::with_capacity(self.waiters.len());
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            match self.queue.claim(&waiter.request.pools) {
                Some(item) => self.spawn_assignment(item, waiter),
                None => remaining.push_back(waiter),
            }
        }
        self.waiters = remaining;
    }

    fn spawn_assignment(&self, item: QueueItem, waiter: Waiter) {
        let jobs = self.jobs.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let (job_id, batch_id) = (item.job_id, item.batch_id);
            let assigned = jobs
                .try_assign_lease(&item, waiter.request.agent_id, waiter.request.session_id)
                .await;
            let result = match assigned {
                Ok(Some(lease)) => match waiter.reply.send(lease) {
                    Ok(()) => AssignmentResult::Assigned,
                    Err(lease) => {
                        debug!(lease_id = %lease.id, "Agent stopped waiting, withdrawing lease");
                        if let Err(e) = jobs.cancel_lease(job_id, batch_id, lease.id).await {
                            warn!(job_id = %job_id, batch_id = %batch_id, error = %e, "Failed to withdraw lease");
                        }
                        AssignmentResult::Reverted
                    }
                },
                Ok(None) => {
                    debug!(job_id = %job_id, batch_id = %batch_id, "Queued batch is no longer dispatchable");
                    AssignmentResult::Stale(waiter)
                }
                Err(e) => {
                    warn!(job_id = %job_id, batch_id = %batch_id, error = %e, "Lease assignment failed");
                    // The entry stays claimed until the delay passes.
                    tokio::time::sleep(ASSIGNMENT_RETRY_DELAY).await;
                    AssignmentResult::Failed(waiter)
                }
            };
            let _ = commands.send(Command::AssignmentFinished {
                job_id,
                batch_id,
                result,
            });
        });
    }
}
