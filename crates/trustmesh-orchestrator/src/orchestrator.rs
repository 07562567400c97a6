use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trustmesh_broker::{ChannelManager, ConnectionState, HEADER_ERROR, PublishOptions};
use trustmesh_types::{
    AgentDescriptor, AgentId, AgentMessage, AgentStatus, BackoffPolicy, DispatchEnvelope, Result,
    ResultEnvelope, Task, TaskEvent, TaskId, TaskOutcome, TaskResult, TaskState, TrustmeshError,
    encode,
};

use crate::circuit_breaker::{Admission, CircuitBreakerRegistry};
use crate::config::{OrchestratorConfig, later};
use crate::pool::AgentPool;
use crate::queue::ReadyQueue;
use crate::registry::TaskKindRegistry;
use crate::store::TaskStore;
use crate::ticket::{TaskNotice, TaskTicket};

/// A task submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub priority: i32,
    /// Falls back to the orchestrator default.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            priority: 0,
            max_attempts: None,
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result of one dispatch decision. Policy outcomes are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
        probe: bool,
    },
    NoEligibleAgent {
        task_id: TaskId,
        kind: String,
    },
    /// The route's breaker is open; no agent slot or attempt was used.
    CircuitOpen {
        task_id: TaskId,
        route: String,
        retry_at: DateTime<Utc>,
    },
    /// The dispatch envelope was not confirmed; the task stays queued.
    PublishFailed {
        task_id: TaskId,
        error: String,
    },
    /// The task's deadline passed before it could be dispatched.
    Expired {
        task_id: TaskId,
    },
}

impl DispatchOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            DispatchOutcome::Dispatched { task_id, .. }
            | DispatchOutcome::NoEligibleAgent { task_id, .. }
            | DispatchOutcome::CircuitOpen { task_id, .. }
            | DispatchOutcome::PublishFailed { task_id, .. }
            | DispatchOutcome::Expired { task_id } => *task_id,
        }
    }
}

/// Requeue instruction for a task that could not be dispatched.
struct Requeue {
    priority: i32,
    not_before: Option<DateTime<Utc>>,
}

struct TaskEntry {
    task: Task,
    notifier: Option<oneshot::Sender<TaskNotice>>,
    /// Dispatched as the half-open probe of its route.
    probe: bool,
    /// Terminal result whose persistence has not succeeded yet.
    pending: Option<TaskResult>,
}

impl TaskEntry {
    fn new(task: Task, notifier: Option<oneshot::Sender<TaskNotice>>) -> Self {
        Self {
            task,
            notifier,
            probe: false,
            pending: None,
        }
    }
}

/// What a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub unreachable_agents: Vec<AgentId>,
    pub ack_timeouts: usize,
    pub orphaned: usize,
    pub expired: usize,
    pub dead_lettered: usize,
}

/// What startup recovery reloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub broker: ConnectionState,
    pub active_agents: usize,
    pub open_circuits: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub ack_timeouts: u64,
    pub publish_failures: u64,
    pub in_flight: usize,
    pub queued: usize,
    /// Queued tasks dispatchable right now.
    pub ready: usize,
    /// When the earliest backed-off task becomes dispatchable.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub active_agents: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    ack_timeouts: AtomicU64,
    publish_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Owns every non-terminal task and drives it through its lifecycle.
///
/// Each task sits behind its own lock; operations on different tasks never
/// block each other. Agent slots are reserved atomically in the pool, and
/// every terminal transition is persisted before the ticket is notified.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: TaskKindRegistry,
    pool: AgentPool,
    circuits: CircuitBreakerRegistry,
    queue: ReadyQueue,
    tasks: DashMap<TaskId, Arc<Mutex<TaskEntry>>>,
    store: Arc<dyn TaskStore>,
    broker: Arc<ChannelManager>,
    wake: Notify,
    counters: Counters,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        broker: Arc<ChannelManager>,
    ) -> Self {
        Self {
            circuits: CircuitBreakerRegistry::new(config.circuit.clone()),
            config,
            registry: TaskKindRegistry::new(),
            pool: AgentPool::new(),
            queue: ReadyQueue::new(),
            tasks: DashMap::new(),
            store,
            broker,
            wake: Notify::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<ChannelManager> {
        &self.broker
    }

    pub fn registry(&self) -> &TaskKindRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    pub fn circuits(&self) -> &CircuitBreakerRegistry {
        &self.circuits
    }

    pub fn register_agent(&self, agent: AgentDescriptor) {
        self.pool.register(agent);
        self.wake.notify_one();
    }

    fn entry(&self, task_id: TaskId) -> Option<Arc<Mutex<TaskEntry>>> {
        self.tasks.get(&task_id).map(|e| e.value().clone())
    }

    fn retry_policy(&self, kind: &str) -> BackoffPolicy {
        self.registry
            .get(kind)
            .and_then(|spec| spec.retry)
            .unwrap_or(self.config.retry)
    }

    /// Current view of a task, in flight or terminal.
    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        if let Some(entry) = self.entry(task_id) {
            return Ok(entry.lock().await.task.clone());
        }
        self.store
            .get(task_id)
            .await?
            .map(|stored| stored.task)
            .ok_or(TrustmeshError::TaskNotFound(task_id))
    }

    /// Validate and enqueue a task.
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskTicket> {
        self.registry.validate(&spec.kind, &spec.payload)?;

        let mut task = Task::new(spec.kind, spec.payload)
            .with_priority(spec.priority)
            .with_max_attempts(spec.max_attempts.unwrap_or(self.config.default_max_attempts));
        if let Some(deadline) = spec.deadline {
            task = task.with_deadline(deadline);
        }
        self.enqueue(task).await
    }

    /// Resubmit a task that ended `Failed` or `DeadLettered`.
    ///
    /// The finished record stays terminal. The retry is a new task with the
    /// same kind, payload, priority and attempt budget, linked through
    /// `retry_of`, and comes with its own ticket.
    pub async fn retry_task(&self, task_id: TaskId) -> Result<TaskTicket> {
        let stored = self
            .store
            .get(task_id)
            .await?
            .ok_or(TrustmeshError::TaskNotFound(task_id))?;
        let finished = stored.task;
        if !matches!(finished.state, TaskState::Failed | TaskState::DeadLettered) {
            return Err(TrustmeshError::InvalidStateTransition {
                from: finished.state,
                event: TaskEvent::Retry,
            });
        }
        self.registry.validate(&finished.kind, &finished.payload)?;

        let mut task = Task::new(finished.kind, finished.payload)
            .with_priority(finished.priority)
            .with_max_attempts(finished.max_attempts);
        task.retry_of = Some(task_id);
        tracing::info!(task_id = %task.id, retry_of = %task_id, previous = ?finished.state, "Manual retry requested");
        self.enqueue(task).await
    }

    async fn enqueue(&self, task: Task) -> Result<TaskTicket> {
        self.store.persist(&task).await?;

        let (ticket, tx) = TaskTicket::new(task.id);
        let (task_id, priority) = (task.id, task.priority);
        tracing::info!(task_id = %task_id, kind = %task.kind, priority, "Task submitted");
        self.tasks
            .insert(task_id, Arc::new(Mutex::new(TaskEntry::new(task, Some(tx)))));
        self.queue.push(task_id, priority, None, Utc::now()).await;
        bump(&self.counters.submitted);
        self.wake.notify_one();
        Ok(ticket)
    }

    /// Submit several tasks; each gets its own result.
    pub async fn submit_batch(&self, specs: Vec<TaskSpec>) -> Vec<Result<TaskTicket>> {
        let mut tickets = Vec::with_capacity(specs.len());
        for spec in specs {
            tickets.push(self.submit_task(spec).await);
        }
        tickets
    }

    /// Dispatch the highest-priority ready task, if any.
    pub async fn dispatch_next(&self) -> Result<Option<DispatchOutcome>> {
        let now = Utc::now();
        while let Some(task_id) = self.queue.pop_ready(now).await {
            if let Some((outcome, requeue)) = self.dispatch_one(task_id, now, true).await? {
                if let Some(requeue) = requeue {
                    self.queue
                        .push(task_id, requeue.priority, requeue.not_before, now)
                        .await;
                }
                return Ok(Some(outcome));
            }
        }
        Ok(None)
    }

    /// Dispatch a specific queued task now, ignoring its retry backoff.
    pub async fn dispatch(&self, task_id: TaskId) -> Result<DispatchOutcome> {
        let Some(entry) = self.entry(task_id) else {
            return Err(TrustmeshError::TaskNotFound(task_id));
        };
        let state = entry.lock().await.task.state;
        match self.dispatch_one(task_id, Utc::now(), false).await? {
            Some((outcome, _)) => Ok(outcome),
            None => Err(TrustmeshError::InvalidStateTransition {
                from: state,
                event: TaskEvent::Dispatch,
            }),
        }
    }

    /// Dispatch every ready task the pool can take. Tasks with no eligible
    /// agent go back to the queue after the pass.
    pub async fn dispatch_pending(&self) -> Vec<DispatchOutcome> {
        let now = Utc::now();
        let mut outcomes = Vec::new();
        let mut deferred = Vec::new();

        while let Some(task_id) = self.queue.pop_ready(now).await {
            match self.dispatch_one(task_id, now, true).await {
                Ok(Some((outcome, requeue))) => {
                    if let Some(requeue) = requeue {
                        if requeue.not_before.is_some() {
                            self.queue
                                .push(task_id, requeue.priority, requeue.not_before, now)
                                .await;
                        } else {
                            deferred.push((task_id, requeue.priority));
                        }
                    }
                    outcomes.push(outcome);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(task_id = %task_id, "Dispatch failed: {}", e),
            }
        }
        for (task_id, priority) in deferred {
            self.queue.push(task_id, priority, None, now).await;
        }
        outcomes
    }

    /// Try to dispatch one task. `None` means the id was stale (task gone or
    /// no longer queued).
    async fn dispatch_one(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
        from_queue: bool,
    ) -> Result<Option<(DispatchOutcome, Option<Requeue>)>> {
        let Some(entry) = self.entry(task_id) else {
            return Ok(None);
        };
        let mut entry = entry.lock().await;
        if entry.task.state != TaskState::Queued {
            return Ok(None);
        }
        let priority = entry.task.priority;
        let requeue = |not_before| {
            from_queue.then_some(Requeue {
                priority,
                not_before,
            })
        };

        if entry.task.deadline.is_some_and(|d| d <= now) {
            self.expire(&mut entry).await?;
            return Ok(Some((DispatchOutcome::Expired { task_id }, None)));
        }

        let kind = entry.task.kind.clone();
        let probe = match self.circuits.try_acquire(&kind, now) {
            Admission::Rejected { retry_at } => {
                tracing::debug!(task_id = %task_id, route = %kind, "Circuit open, dispatch refused");
                return Ok(Some((
                    DispatchOutcome::CircuitOpen {
                        task_id,
                        route: kind,
                        retry_at,
                    },
                    requeue(Some(retry_at)),
                )));
            }
            Admission::Probe => true,
            Admission::Allowed => false,
        };

        let required = self
            .registry
            .get(&kind)
            .map(|spec| spec.required_capabilities)
            .unwrap_or_default();
        let Some(agent_id) = self.pool.try_reserve(&required) else {
            if probe {
                self.circuits.abandon_probe(&kind);
            }
            return Ok(Some((
                DispatchOutcome::NoEligibleAgent { task_id, kind },
                requeue(None),
            )));
        };

        let body = match encode(&DispatchEnvelope::for_task(&entry.task)) {
            Ok(body) => body,
            Err(e) => {
                self.pool.release(agent_id);
                if probe {
                    self.circuits.abandon_probe(&kind);
                }
                if from_queue {
                    self.queue.push(task_id, priority, None, now).await;
                }
                return Err(e);
            }
        };
        let route = self.config.routes.dispatch_route(&agent_id);
        let options = PublishOptions::for_task(task_id).with_timeout(self.config.publish_timeout);
        if let Err(e) = self.broker.publish(&route, body, options).await {
            self.pool.release(agent_id);
            if probe {
                self.circuits.abandon_probe(&kind);
            }
            bump(&self.counters.publish_failures);
            let delay = self
                .retry_policy(&kind)
                .delay(entry.task.attempt.saturating_sub(1));
            tracing::warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Dispatch publish failed, task stays queued");
            return Ok(Some((
                DispatchOutcome::PublishFailed {
                    task_id,
                    error: e.to_string(),
                },
                requeue(Some(later(now, delay))),
            )));
        }

        entry.task.apply_event(TaskEvent::Dispatch)?;
        entry.task.assigned_agent = Some(agent_id);
        entry.task.ack_deadline = Some(later(now, self.config.ack_timeout));
        entry.task.not_before = None;
        entry.probe = probe;
        self.persist(&entry.task).await;
        bump(&self.counters.dispatched);

        let attempt = entry.task.attempt;
        tracing::info!(task_id = %task_id, agent_id = %agent_id, attempt, kind = %kind, probe, "Task dispatched");
        Ok(Some((
            DispatchOutcome::Dispatched {
                task_id,
                agent_id,
                attempt,
                probe,
            },
            None,
        )))
    }

    /// An agent reported that it started executing the task.
    ///
    /// Returns false for stale or duplicate acknowledgments.
    pub async fn acknowledge(&self, task_id: TaskId, agent_id: AgentId, attempt: u32) -> Result<bool> {
        let Some(entry) = self.entry(task_id) else {
            return self.already_finished(task_id).await;
        };
        let mut entry = entry.lock().await;
        let task = &entry.task;
        if task.state != TaskState::Dispatched
            || task.attempt != attempt
            || task.assigned_agent != Some(agent_id)
        {
            tracing::debug!(task_id = %task_id, attempt, state = ?task.state, "Ignoring stale acknowledgment");
            return Ok(false);
        }
        entry.task.apply_event(TaskEvent::Acknowledge)?;
        self.persist(&entry.task).await;
        tracing::debug!(task_id = %task_id, agent_id = %agent_id, attempt, "Task executing");
        Ok(true)
    }

    /// Apply an agent's result for one attempt.
    ///
    /// Results for another attempt or agent, and duplicates of a result that
    /// was already applied, return false.
    pub async fn handle_result(&self, result: ResultEnvelope) -> Result<bool> {
        let task_id = result.task_id;
        let Some(entry) = self.entry(task_id) else {
            return self.already_finished(task_id).await;
        };
        let mut entry = entry.lock().await;

        if entry.task.is_terminal() {
            if let Some(pending) = entry.pending.clone() {
                self.finalize(&mut entry, pending).await?;
            }
            return Ok(false);
        }
        let task = &entry.task;
        if !matches!(task.state, TaskState::Dispatched | TaskState::Executing)
            || task.attempt != result.attempt
            || task.assigned_agent != Some(result.agent_id)
        {
            tracing::debug!(task_id = %task_id, attempt = result.attempt, state = ?task.state, "Ignoring stale result");
            return Ok(false);
        }

        if entry.task.state == TaskState::Dispatched {
            entry.task.apply_event(TaskEvent::Acknowledge)?;
        }
        self.pool.release(result.agent_id);
        let probe = std::mem::take(&mut entry.probe);
        let kind = entry.task.kind.clone();
        let now = Utc::now();

        match result.outcome {
            TaskOutcome::Success => {
                self.circuits.record_success(&kind, probe, now);
                entry.task.apply_event(TaskEvent::Complete)?;
                let done = TaskResult::success(result.agent_id, result.result_payload, result.attempt);
                self.finalize(&mut entry, done).await?;
            }
            TaskOutcome::PermanentFailure => {
                // The route answered; only the task is at fault.
                self.circuits.record_success(&kind, probe, now);
                let error = result.error.unwrap_or_else(|| "permanent failure".into());
                self.fail_attempt(&mut entry, error, false, now).await?;
            }
            TaskOutcome::TransientFailure => {
                self.circuits.record_failure(&kind, probe, now);
                let error = result.error.unwrap_or_else(|| "transient failure".into());
                self.fail_attempt(&mut entry, error, true, now).await?;
            }
        }
        Ok(true)
    }

    /// Route an inbound agent message.
    pub async fn handle_message(&self, message: AgentMessage) -> Result<()> {
        match message {
            AgentMessage::Started {
                task_id,
                agent_id,
                attempt,
            } => {
                self.acknowledge(task_id, agent_id, attempt).await?;
            }
            AgentMessage::Finished(result) => {
                self.handle_result(result).await?;
            }
            AgentMessage::Heartbeat {
                agent_id,
                capabilities,
                max_concurrency,
            } => {
                if self
                    .pool
                    .heartbeat(agent_id, capabilities, max_concurrency, Utc::now())
                {
                    tracing::info!(agent_id = %agent_id, "Agent joined via heartbeat");
                }
                self.wake.notify_one();
            }
        }
        Ok(())
    }

    /// Cancel a non-terminal task. Cancelling an already-cancelled task is a no-op.
    pub async fn cancel_task(&self, task_id: TaskId, reason: &str) -> Result<()> {
        let Some(entry) = self.entry(task_id) else {
            let stored = self
                .store
                .get(task_id)
                .await?
                .ok_or(TrustmeshError::TaskNotFound(task_id))?;
            return Self::cancel_conflict(task_id, stored.task.state);
        };
        let mut entry = entry.lock().await;
        if entry.task.is_terminal() {
            return Self::cancel_conflict(task_id, entry.task.state);
        }

        let agent = entry.task.assigned_agent;
        if matches!(entry.task.state, TaskState::Dispatched | TaskState::Executing) {
            if let Some(agent) = agent {
                self.pool.release(agent);
            }
            if std::mem::take(&mut entry.probe) {
                self.circuits.abandon_probe(&entry.task.kind);
            }
        }
        entry.task.apply_event(TaskEvent::Cancel)?;
        let attempt = entry.task.attempt;
        let result = TaskResult::failure(TaskState::Cancelled, agent, reason, attempt);
        self.finalize(&mut entry, result).await
    }

    fn cancel_conflict(task_id: TaskId, existing: TaskState) -> Result<()> {
        if existing == TaskState::Cancelled {
            Ok(())
        } else {
            Err(TrustmeshError::TerminalConflict {
                task_id,
                existing,
                requested: TaskState::Cancelled,
            })
        }
    }

    /// Expire overdue acknowledgments, fail work on unreachable agents,
    /// cancel tasks past their deadline, and retry unpersisted terminal results.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            unreachable_agents: self
                .pool
                .expire_heartbeats(now, self.config.heartbeat_timeout),
            ..SweepReport::default()
        };

        let entries: Vec<_> = self.tasks.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            let mut entry = entry.lock().await;
            let state = entry.task.state;
            let outcome = match state {
                TaskState::Dispatched if entry.task.ack_deadline.is_some_and(|d| d <= now) => {
                    report.ack_timeouts += 1;
                    self.ack_timeout(&mut entry, now).await
                }
                TaskState::Executing if self.agent_lost(entry.task.assigned_agent) => {
                    report.orphaned += 1;
                    if let Some(agent) = entry.task.assigned_agent {
                        self.pool.release(agent);
                    }
                    if std::mem::take(&mut entry.probe) {
                        self.circuits.abandon_probe(&entry.task.kind);
                    }
                    self.fail_attempt(&mut entry, "agent unreachable".into(), true, now)
                        .await
                }
                TaskState::Queued if entry.task.deadline.is_some_and(|d| d <= now) => {
                    report.expired += 1;
                    self.expire(&mut entry).await
                }
                state if state.is_terminal() => match entry.pending.clone() {
                    Some(pending) => self.finalize(&mut entry, pending).await,
                    None => Ok(()),
                },
                _ => Ok(()),
            };
            if !state.is_terminal() && entry.task.state == TaskState::DeadLettered {
                report.dead_lettered += 1;
            }
            if let Err(e) = outcome {
                tracing::error!(task_id = %entry.task.id, "Sweep failed for task: {}", e);
            }
        }
        report
    }

    fn agent_lost(&self, agent: Option<AgentId>) -> bool {
        match agent.and_then(|id| self.pool.get(id)) {
            Some(descriptor) => descriptor.status == AgentStatus::Unreachable,
            None => true,
        }
    }

    async fn ack_timeout(&self, entry: &mut TaskEntry, now: DateTime<Utc>) -> Result<()> {
        let task_id = entry.task.id;
        let agent = entry.task.assigned_agent;
        if let Some(agent) = agent {
            self.pool.release(agent);
        }
        let probe = std::mem::take(&mut entry.probe);
        self.circuits.record_failure(&entry.task.kind, probe, now);
        bump(&self.counters.ack_timeouts);

        if entry.task.attempts_remaining() {
            entry.task.apply_event(TaskEvent::AckTimeout)?;
            entry.task.last_error = Some("acknowledgment timed out".into());
            self.persist(&entry.task).await;
            self.queue
                .push(task_id, entry.task.priority, None, now)
                .await;
            bump(&self.counters.retried);
            tracing::warn!(task_id = %task_id, attempt = entry.task.attempt, "Acknowledgment timed out, task requeued");
            self.wake.notify_one();
            Ok(())
        } else {
            entry.task.apply_event(TaskEvent::Fail)?;
            entry.task.apply_event(TaskEvent::Exhaust)?;
            let result = TaskResult::failure(
                TaskState::DeadLettered,
                agent,
                "acknowledgment timed out",
                entry.task.attempt,
            );
            self.finalize(entry, result).await
        }
    }

    async fn expire(&self, entry: &mut TaskEntry) -> Result<()> {
        entry.task.apply_event(TaskEvent::Cancel)?;
        tracing::warn!(task_id = %entry.task.id, "Task deadline passed before dispatch");
        let result = TaskResult::failure(
            TaskState::Cancelled,
            None,
            "deadline exceeded",
            entry.task.attempt,
        );
        self.finalize(entry, result).await
    }

    /// Move a running task to `Failed`; transient failures continue straight
    /// to `Queued` (with backoff) or `DeadLettered`.
    async fn fail_attempt(
        &self,
        entry: &mut TaskEntry,
        error: String,
        transient: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let task_id = entry.task.id;
        let agent = entry.task.assigned_agent;
        let failed_attempt = entry.task.attempt;
        entry.task.apply_event(TaskEvent::Fail)?;
        entry.task.last_error = Some(error.clone());

        if !transient {
            let result = TaskResult::failure(TaskState::Failed, agent, error, failed_attempt);
            return self.finalize(entry, result).await;
        }

        if entry.task.attempts_remaining() {
            entry.task.apply_event(TaskEvent::Retry)?;
            let delay = self
                .retry_policy(&entry.task.kind)
                .delay(failed_attempt.saturating_sub(1));
            let not_before = later(now, delay);
            entry.task.not_before = Some(not_before);
            self.persist(&entry.task).await;
            self.queue
                .push(task_id, entry.task.priority, Some(not_before), now)
                .await;
            bump(&self.counters.retried);
            tracing::warn!(
                task_id = %task_id,
                attempt = failed_attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Task attempt failed, retrying"
            );
            Ok(())
        } else {
            entry.task.apply_event(TaskEvent::Exhaust)?;
            let result = TaskResult::failure(TaskState::DeadLettered, agent, error, failed_attempt);
            self.finalize(entry, result).await
        }
    }

    /// Persist a terminal result, publish it, notify the ticket, and drop the
    /// task from the in-flight set. Safe to call again after a store failure.
    async fn finalize(&self, entry: &mut TaskEntry, result: TaskResult) -> Result<()> {
        let task_id = entry.task.id;
        let state = entry.task.state;
        entry.pending = Some(result.clone());

        if let Err(e) = self.store.mark_terminal(task_id, state, &result).await {
            tracing::error!(task_id = %task_id, ?state, "Failed to persist terminal state: {}", e);
            return Err(e);
        }
        entry.pending = None;

        match state {
            TaskState::Completed | TaskState::Failed => {
                let envelope = self.result_envelope(&entry.task, &result);
                self.publish_best_effort(&self.config.routes.results, &envelope, None)
                    .await;
            }
            TaskState::DeadLettered => {
                let envelope = self.result_envelope(&entry.task, &result);
                let reason = result.error.clone().unwrap_or_default();
                self.publish_best_effort(&self.config.routes.dead_letter, &envelope, Some(reason))
                    .await;
            }
            _ => {}
        }

        let counter = match state {
            TaskState::Completed => &self.counters.completed,
            TaskState::Failed => &self.counters.failed,
            TaskState::DeadLettered => &self.counters.dead_lettered,
            _ => &self.counters.cancelled,
        };
        bump(counter);

        if state == TaskState::DeadLettered {
            tracing::error!(task_id = %task_id, attempts = result.attempt, error = ?result.error, "Task dead-lettered");
        } else {
            tracing::info!(task_id = %task_id, ?state, attempt = result.attempt, "Task finished");
        }

        if let Some(tx) = entry.notifier.take() {
            let _ = tx.send(TaskNotice { task_id, result });
        }
        self.tasks.remove(&task_id);
        Ok(())
    }

    fn result_envelope(&self, task: &Task, result: &TaskResult) -> ResultEnvelope {
        let outcome = match result.state {
            TaskState::Completed => TaskOutcome::Success,
            TaskState::DeadLettered => TaskOutcome::TransientFailure,
            _ => TaskOutcome::PermanentFailure,
        };
        ResultEnvelope {
            task_id: task.id,
            agent_id: result.agent_id.unwrap_or(Uuid::nil()),
            attempt: result.attempt,
            outcome,
            result_payload: result.payload.clone().unwrap_or_default(),
            error: result.error.clone(),
            duration_ms: (result.finished_at - task.created_at).num_milliseconds().max(0) as u64,
        }
    }

    async fn publish_best_effort(&self, route: &str, envelope: &ResultEnvelope, error: Option<String>) {
        let body = match encode(envelope) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(route, "Failed to encode result envelope: {}", e);
                return;
            }
        };
        let mut options =
            PublishOptions::for_task(envelope.task_id).with_timeout(self.config.publish_timeout);
        if let Some(error) = error {
            options = options.with_header(HEADER_ERROR, error);
        }
        if let Err(e) = self.broker.publish(route, body, options).await {
            tracing::warn!(route, task_id = %envelope.task_id, "Result publish failed: {}", e);
        }
    }

    async fn persist(&self, task: &Task) {
        if let Err(e) = self.store.persist(task).await {
            tracing::error!(task_id = %task.id, state = ?task.state, "Failed to persist task: {}", e);
        }
    }

    async fn already_finished(&self, task_id: TaskId) -> Result<bool> {
        match self.store.get(task_id).await? {
            Some(stored) if stored.task.is_terminal() => {
                tracing::debug!(task_id = %task_id, state = ?stored.task.state, "Duplicate message for finished task");
                Ok(false)
            }
            _ => Err(TrustmeshError::TaskNotFound(task_id)),
        }
    }

    /// Reload non-terminal tasks from the store after a restart. Tasks that
    /// were dispatched or executing count as acknowledgment timeouts.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for state in TaskState::in_flight() {
            for task in self.store.load_by_state(state).await? {
                if self.tasks.contains_key(&task.id) {
                    continue;
                }
                let task_id = task.id;
                let mut entry = TaskEntry::new(task, None);

                if state != TaskState::Queued {
                    if entry.task.attempts_remaining() {
                        if state == TaskState::Dispatched {
                            entry.task.apply_event(TaskEvent::AckTimeout)?;
                        } else {
                            entry.task.apply_event(TaskEvent::Fail)?;
                            entry.task.apply_event(TaskEvent::Retry)?;
                        }
                        entry.task.last_error = Some("interrupted by restart".into());
                        self.persist(&entry.task).await;
                    } else {
                        entry.task.apply_event(TaskEvent::Fail)?;
                        entry.task.apply_event(TaskEvent::Exhaust)?;
                        let result = TaskResult::failure(
                            TaskState::DeadLettered,
                            entry.task.assigned_agent,
                            "interrupted by restart",
                            entry.task.attempt,
                        );
                        self.finalize(&mut entry, result).await?;
                        report.dead_lettered += 1;
                        continue;
                    }
                }

                let (priority, not_before) = (entry.task.priority, entry.task.not_before);
                self.tasks.insert(task_id, Arc::new(Mutex::new(entry)));
                self.queue.push(task_id, priority, not_before, now).await;
                report.requeued += 1;
            }
        }

        tracing::info!(requeued = report.requeued, dead_lettered = report.dead_lettered, "Task recovery complete");
        if report.requeued > 0 {
            self.wake.notify_one();
        }
        Ok(report)
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let c = &self.counters;
        OrchestratorStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            ack_timeouts: c.ack_timeouts.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            in_flight: self.tasks.len(),
            queued: self.queue.len().await,
            ready: self.queue.ready_len(Utc::now()).await,
            next_retry_at: self.queue.next_release().await,
            active_agents: self.pool.active_count(),
        }
    }

    pub fn health(&self) -> HealthReport {
        let broker = self.broker.state();
        let active_agents = self.pool.active_count();
        let open_circuits = self.circuits.open_routes();
        let status = if !broker.is_usable() {
            HealthStatus::Down
        } else if broker == ConnectionState::Degraded
            || active_agents < self.config.min_active_agents
            || !open_circuits.is_empty()
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Up
        };
        HealthReport {
            status,
            broker,
            active_agents,
            open_circuits,
        }
    }

    /// Dispatch and sweep until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut dispatch_tick = tokio::time::interval(self.config.dispatch_interval);
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Orchestrator loop shutting down");
                    break;
                }
                _ = self.wake.notified() => {
                    self.dispatch_pending().await;
                }
                _ = dispatch_tick.tick() => {
                    self.dispatch_pending().await;
                }
                _ = sweep_tick.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if report.ack_timeouts + report.orphaned + report.expired > 0 {
                        tracing::debug!(?report, "Sweep changed tasks");
                    }
                }
            }
        }
    }
}
