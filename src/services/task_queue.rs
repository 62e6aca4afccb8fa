//! Background task queue for folder analysis jobs
//!
//! A single worker pulls task ids off a bounded FIFO queue and runs them one
//! at a time. Crawls are already rate limited against the provider, so a
//! second concurrent crawl would only compete for the same quota.
//!
//! Each running task gets a watchdog that marks it TIMEOUT once the
//! configured timeout elapses. The worker, the watchdog and cancellation
//! requests all perform terminal transitions under the same mutex, and only
//! a task that is still active can transition, so exactly one outcome wins.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{TaskQueueError, is_cancellation};
use crate::services::analysis::{GroupingResult, ProgressSink};

static FRACTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*/\s*(\d+)").unwrap());

/// Configuration for the task queue
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Pending tasks the queue accepts before rejecting submissions
    pub queue_capacity: usize,
    /// Running time after which the watchdog marks a task TIMEOUT
    pub task_timeout: Duration,
    /// Completed tasks kept for status queries
    pub completed_retention: usize,
    /// How long a cancelled or timed-out routine may take to unwind before it is aborted
    pub cancel_grace: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            task_timeout: Duration::from_secs(600),
            completed_retention: 50,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Task lifecycle; every state after `Running` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A folder analysis job as seen by pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub folder_id: String,
    pub folder_name: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 0-100, never decreases
    pub progress: f32,
    pub result: Option<GroupingResult>,
    pub error: Option<String>,
}

impl Task {
    fn new(folder_id: &str, folder_name: &str) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            folder_id: folder_id.to_string(),
            folder_name: folder_name.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            result: None,
            error: None,
        }
    }

    /// Seconds between start and completion (or now, if still running)
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Queue counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub queue_depth: usize,
    pub active_count: usize,
    pub completed_count: usize,
    pub worker_alive: bool,
}

/// A running task close to its timeout
#[derive(Debug, Clone, Serialize)]
pub struct LongRunningTask {
    pub task_id: Uuid,
    pub folder_id: String,
    pub running_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub healthy: bool,
    pub worker_alive: bool,
    pub queue_depth: usize,
    pub long_running_tasks: Vec<LongRunningTask>,
}

/// The unit of work executed for each task
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<GroupingResult>;
}

/// Everything a [`TaskRunner`] gets to see about its task
pub struct TaskContext {
    pub task_id: Uuid,
    pub folder_id: String,
    pub folder_name: String,
    /// Fires on cancellation, timeout or shutdown
    pub token: CancellationToken,
    pub progress: TaskProgress,
}

/// Monotonic progress reporting for one task, optionally scoped to a band
#[derive(Clone)]
pub struct TaskProgress {
    task_id: Uuid,
    state: Arc<Mutex<TaskState>>,
    start: f32,
    end: f32,
}

impl TaskProgress {
    /// Set overall progress in percent; lower values than the current one are ignored
    pub fn set(&self, percent: f32) {
        let percent = percent.clamp(0.0, 100.0);
        let mut state = self.state.lock();
        if let Some(entry) = state.active.get_mut(&self.task_id) {
            if entry.task.status == TaskStatus::Running && percent > entry.task.progress {
                entry.task.progress = percent;
            }
        }
    }

    /// A reporter whose 0..=1 range maps onto `start..=end` of this one
    pub fn scoped(&self, start: f32, end: f32) -> TaskProgress {
        let span = self.end - self.start;
        TaskProgress {
            task_id: self.task_id,
            state: self.state.clone(),
            start: self.start + span * start.clamp(0.0, 100.0) / 100.0,
            end: self.start + span * end.clamp(0.0, 100.0) / 100.0,
        }
    }

    /// Report `done` of `total` steps within this reporter's band
    pub fn step(&self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let fraction = (done.min(total) as f32) / (total as f32);
        self.set(self.start + (self.end - self.start) * fraction);
    }
}

impl ProgressSink for TaskProgress {
    fn report(&self, message: &str) {
        debug!(task_id = %self.task_id, message, "Task progress");
        if let Some((done, total)) = parse_fraction(message) {
            self.step(done, total);
        }
    }
}

/// Extract "i/n" from a progress message
fn parse_fraction(message: &str) -> Option<(usize, usize)> {
    let caps = FRACTION_RE.captures(message)?;
    let done = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    Some((done, total))
}

struct TaskEntry {
    task: Task,
    token: CancellationToken,
    started: Option<Instant>,
}

#[derive(Default)]
struct TaskState {
    active: HashMap<Uuid, TaskEntry>,
    completed: HashMap<Uuid, Task>,
    /// Ids of PENDING tasks in submission order
    pending: VecDeque<Uuid>,
}

impl TaskState {
    /// Move an active task to the completed index in a terminal state
    fn retire(
        &mut self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<String>,
        retention: usize,
    ) -> Option<Task> {
        let mut entry = self.active.remove(&task_id)?;
        if entry.task.status == TaskStatus::Pending {
            self.pending.retain(|id| *id != task_id);
        }
        entry.token.cancel();
        entry.task.status = status;
        entry.task.completed_at = Some(Utc::now());
        if error.is_some() {
            entry.task.error = error;
        }
        let task = entry.task;
        self.store_completed(task.clone(), retention);
        Some(task)
    }

    fn store_completed(&mut self, task: Task, retention: usize) {
        self.completed.insert(task.task_id, task);
        while self.completed.len() > retention.max(1) {
            let oldest = self
                .completed
                .values()
                .min_by_key(|t| t.completed_at)
                .map(|t| t.task_id);
            match oldest {
                Some(id) => {
                    self.completed.remove(&id);
                }
                None => break,
            }
        }
    }

    fn running_longer_than(&self, limit: Duration) -> Vec<(Uuid, String, Duration)> {
        self.active
            .values()
            .filter(|e| e.task.status == TaskStatus::Running)
            .filter_map(|e| {
                let elapsed = e.started?.elapsed();
                (elapsed > limit).then(|| (e.task.task_id, e.task.folder_id.clone(), elapsed))
            })
            .collect()
    }
}

/// How a task's routine ended, from the worker's point of view
enum Outcome {
    Finished(anyhow::Result<GroupingResult>),
    Panicked(String),
    Abandoned,
}

struct Inner {
    config: TaskQueueConfig,
    runner: Arc<dyn TaskRunner>,
    state: Arc<Mutex<TaskState>>,
    wakeup: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Owns the task queue, its worker and the task index
#[derive(Clone)]
pub struct TaskQueueManager {
    inner: Arc<Inner>,
}

impl TaskQueueManager {
    /// Create the queue and start its worker. Must be called inside a Tokio runtime.
    pub fn start(config: TaskQueueConfig, runner: Arc<dyn TaskRunner>) -> Self {
        let inner = Arc::new(Inner {
            config,
            runner,
            state: Arc::new(Mutex::new(TaskState::default())),
            wakeup: Notify::new(),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        *inner.worker.lock() = Some(Inner::spawn_worker(&inner));
        Self { inner }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.inner.config
    }

    /// Queue an analysis of `folder_id`
    pub fn submit(&self, folder_id: &str, folder_name: &str) -> Result<Uuid, TaskQueueError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TaskQueueError::ShutDown);
        }

        let mut state = self.inner.state.lock();
        if let Some(existing) = state.active.values().find(|e| e.task.folder_id == folder_id) {
            return Err(TaskQueueError::Duplicate {
                folder_id: folder_id.to_string(),
                task_id: existing.task.task_id,
            });
        }

        let capacity = self.inner.config.queue_capacity;
        if state.pending.len() >= capacity.max(1) {
            return Err(TaskQueueError::QueueFull { capacity });
        }

        let task = Task::new(folder_id, folder_name);
        let task_id = task.task_id;
        state.active.insert(
            task_id,
            TaskEntry {
                task,
                token: CancellationToken::new(),
                started: None,
            },
        );
        state.pending.push_back(task_id);
        drop(state);
        self.inner.wakeup.notify_one();

        info!(
            task_id = %task_id,
            folder_id = %folder_id,
            folder_name = %folder_name,
            "Task submitted"
        );
        Ok(task_id)
    }

    /// Cancel a pending or running task; false if it is unknown or already finished
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let mut state = self.inner.state.lock();
        if !state.active.get(&task_id).is_some_and(|e| e.task.status.is_active()) {
            return false;
        }
        state.retire(
            task_id,
            TaskStatus::Cancelled,
            Some("Task cancelled".to_string()),
            self.inner.config.completed_retention,
        );
        info!(task_id = %task_id, "Task cancelled");
        true
    }

    pub fn get_status(&self, task_id: Uuid) -> Option<Task> {
        let state = self.inner.state.lock();
        state
            .active
            .get(&task_id)
            .map(|e| e.task.clone())
            .or_else(|| state.completed.get(&task_id).cloned())
    }

    /// All known tasks, active first, each group newest first
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.inner.state.lock();
        let mut active: Vec<Task> = state.active.values().map(|e| e.task.clone()).collect();
        let mut completed: Vec<Task> = state.completed.values().cloned().collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        active.extend(completed);
        active
    }

    pub fn queue_info(&self) -> QueueInfo {
        let (queue_depth, active_count, completed_count) = {
            let state = self.inner.state.lock();
            (state.pending.len(), state.active.len(), state.completed.len())
        };
        QueueInfo {
            queue_depth,
            active_count,
            completed_count,
            worker_alive: self.is_worker_alive(),
        }
    }

    pub fn health(&self) -> QueueHealth {
        let limit = self.inner.config.task_timeout.mul_f64(0.8);
        let long_running_tasks: Vec<LongRunningTask> = self
            .inner
            .state
            .lock()
            .running_longer_than(limit)
            .into_iter()
            .map(|(task_id, folder_id, elapsed)| LongRunningTask {
                task_id,
                folder_id,
                running_secs: elapsed.as_secs_f64(),
            })
            .collect();
        let worker_alive = self.is_worker_alive();

        QueueHealth {
            healthy: worker_alive && long_running_tasks.is_empty(),
            worker_alive,
            queue_depth: self.inner.queue_depth(),
            long_running_tasks,
        }
    }

    /// Drop completed tasks that finished more than `max_age_hours` ago
    pub fn cleanup_old(&self, max_age_hours: u64) -> usize {
        let cutoff = i64::try_from(max_age_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|age| Utc::now().checked_sub_signed(age));
        match cutoff {
            Some(cutoff) => self.cleanup_completed_before(cutoff),
            None => 0,
        }
    }

    fn cleanup_completed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.completed.len();
        state
            .completed
            .retain(|_, task| task.completed_at.is_none_or(|at| at >= cutoff));
        let removed = before - state.completed.len();
        if removed > 0 {
            info!(removed, "Removed old completed tasks");
        }
        removed
    }

    /// Force TIMEOUT on tasks running for more than 150% of the timeout
    pub fn force_cleanup_stuck(&self) -> usize {
        let limit = self.inner.config.task_timeout.mul_f64(1.5);
        let retention = self.inner.config.completed_retention;
        let mut state = self.inner.state.lock();
        let stuck = state.running_longer_than(limit);
        for (task_id, folder_id, elapsed) in &stuck {
            warn!(
                task_id = %task_id,
                folder_id = %folder_id,
                running_secs = elapsed.as_secs(),
                "Forcing stuck task to timeout"
            );
            state.retire(
                *task_id,
                TaskStatus::Timeout,
                Some(format!("Task forcibly timed out after {}s", elapsed.as_secs())),
                retention,
            );
        }
        stuck.len()
    }

    pub fn is_worker_alive(&self) -> bool {
        self.inner
            .worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start a new worker if the current one has died; true if one was started
    pub fn restart_worker_if_needed(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let mut worker = self.inner.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        warn!("Task worker is not running, restarting");
        *worker = Some(Inner::spawn_worker(&self.inner));
        true
    }

    /// Stop the worker and cancel every active task
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        {
            let retention = self.inner.config.completed_retention;
            let mut state = self.inner.state.lock();
            let ids: Vec<Uuid> = state.active.keys().copied().collect();
            for task_id in ids {
                state.retire(
                    task_id,
                    TaskStatus::Cancelled,
                    Some("Task queue shut down".to_string()),
                    retention,
                );
            }
        }
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("Task worker panicked during shutdown");
                }
            }
        }
        info!("Task queue shut down");
    }

    #[cfg(test)]
    fn kill_worker(&self) {
        if let Some(handle) = self.inner.worker.lock().as_ref() {
            handle.abort();
        }
    }
}

impl Inner {
    fn spawn_worker(inner: &Arc<Inner>) -> JoinHandle<()> {
        let inner = Arc::clone(inner);
        tokio::spawn(async move { inner.worker_loop().await })
    }

    fn queue_depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    async fn worker_loop(self: Arc<Self>) {
        info!("Task worker started");

        while !self.shutdown.is_cancelled() {
            let next = self.state.lock().pending.pop_front();
            match next {
                Some(task_id) => self.execute(task_id).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                    }
                }
            }
        }

        info!("Task worker stopped");
    }

    async fn execute(self: &Arc<Self>, task_id: Uuid) {
        let ctx = {
            let mut state = self.state.lock();
            let Some(entry) = state.active.get_mut(&task_id) else {
                debug!(task_id = %task_id, "Skipping task that is no longer active");
                return;
            };
            if entry.task.status != TaskStatus::Pending {
                return;
            }
            entry.task.status = TaskStatus::Running;
            entry.task.started_at = Some(Utc::now());
            entry.started = Some(Instant::now());
            TaskContext {
                task_id,
                folder_id: entry.task.folder_id.clone(),
                folder_name: entry.task.folder_name.clone(),
                token: entry.token.clone(),
                progress: TaskProgress {
                    task_id,
                    state: self.state.clone(),
                    start: 0.0,
                    end: 100.0,
                },
            }
        };

        info!(task_id = %task_id, folder_id = %ctx.folder_id, "Task started");

        let watchdog = tokio::spawn(Self::watchdog(Arc::clone(self), task_id));
        let token = ctx.token.clone();
        let runner = self.runner.clone();
        let mut job = tokio::spawn(async move { runner.run(ctx).await });

        let joined = tokio::select! {
            res = &mut job => Some(res),
            _ = token.cancelled() => None,
        };
        let outcome = match joined {
            Some(res) => Self::outcome_of(res),
            None => match tokio::time::timeout(self.config.cancel_grace, &mut job).await {
                Ok(res) => Self::outcome_of(res),
                Err(_) => {
                    job.abort();
                    warn!(task_id = %task_id, "Task routine ignored cancellation, aborted");
                    Outcome::Abandoned
                }
            },
        };
        watchdog.abort();

        self.finish(task_id, outcome);
    }

    fn outcome_of(res: Result<anyhow::Result<GroupingResult>, JoinError>) -> Outcome {
        match res {
            Ok(result) => Outcome::Finished(result),
            Err(e) if e.is_panic() => Outcome::Panicked(panic_message(e)),
            Err(_) => Outcome::Abandoned,
        }
    }

    /// Record the routine's outcome, unless a cancel or timeout already did
    fn finish(&self, task_id: Uuid, outcome: Outcome) {
        let retention = self.config.completed_retention;
        let mut state = self.state.lock();
        let Some(entry) = state.active.get_mut(&task_id) else {
            debug!(task_id = %task_id, "Task already finalized, dropping routine outcome");
            return;
        };
        if entry.task.status != TaskStatus::Running {
            return;
        }

        match outcome {
            Outcome::Finished(Ok(result)) => {
                entry.task.progress = 100.0;
                entry.task.result = Some(result);
                state.retire(task_id, TaskStatus::Completed, None, retention);
                info!(task_id = %task_id, "Task completed");
            }
            Outcome::Finished(Err(e)) if is_cancellation(&e) => {
                state.retire(
                    task_id,
                    TaskStatus::Cancelled,
                    Some("Task cancelled".to_string()),
                    retention,
                );
                info!(task_id = %task_id, "Task stopped after cancellation");
            }
            Outcome::Finished(Err(e)) => {
                let message = format!("{e:#}");
                error!(task_id = %task_id, error = %message, "Task failed");
                state.retire(task_id, TaskStatus::Failed, Some(message), retention);
            }
            Outcome::Panicked(message) => {
                error!(task_id = %task_id, error = %message, "Task panicked");
                state.retire(
                    task_id,
                    TaskStatus::Failed,
                    Some(format!("Task panicked: {message}")),
                    retention,
                );
            }
            Outcome::Abandoned => {
                state.retire(
                    task_id,
                    TaskStatus::Failed,
                    Some("Task routine was aborted".to_string()),
                    retention,
                );
            }
        }
    }

    async fn watchdog(inner: Arc<Inner>, task_id: Uuid) {
        tokio::time::sleep(inner.config.task_timeout).await;

        let mut state = inner.state.lock();
        if !state
            .active
            .get(&task_id)
            .is_some_and(|e| e.task.status == TaskStatus::Running)
        {
            return;
        }
        let timeout = inner.config.task_timeout;
        state.retire(
            task_id,
            TaskStatus::Timeout,
            Some(format!("Task timed out after {}s", timeout.as_secs_f64())),
            inner.config.completed_retention,
        );
        warn!(task_id = %task_id, timeout_secs = timeout.as_secs_f64(), "Task timed out");
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Runner that sleeps, then returns an empty result
    struct SleepRunner(Duration);

    #[async_trait]
    impl TaskRunner for SleepRunner {
        async fn run(&self, ctx: TaskContext) -> anyhow::Result<GroupingResult> {
            ctx.progress.set(10.0);
            tokio::time::sleep(self.0).await;
            Ok(GroupingResult::empty())
        }
    }

    fn config(timeout: Duration) -> TaskQueueConfig {
        TaskQueueConfig {
            queue_capacity: 3,
            task_timeout: timeout,
            completed_retention: 2,
            cancel_grace: Duration::from_millis(100),
        }
    }

    async fn wait_terminal(queue: &TaskQueueManager, id: Uuid) -> Task {
        for _ in 0..200 {
            if let Some(task) = queue.get_status(id) {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} did not finish");
    }

    #[test]
    fn test_parse_fraction() {
        assert_eq!(parse_fraction("batch 3/10"), Some((3, 10)));
        assert_eq!(parse_fraction("crawling"), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Timeout).unwrap(), "\"timeout\"");
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_completed_retention_evicts_oldest() {
        let mut state = TaskState::default();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut task = Task::new(&format!("f{i}"), "x");
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now() + chrono::Duration::seconds(i));
            ids.push(task.task_id);
            state.store_completed(task, 2);
        }
        assert_eq!(state.completed.len(), 2);
        assert!(!state.completed.contains_key(&ids[0]));
    }

    #[tokio::test]
    async fn test_task_completes_with_full_progress() {
        let queue = TaskQueueManager::start(
            config(Duration::from_secs(5)),
            Arc::new(SleepRunner(Duration::from_millis(10))),
        );
        let id = queue.submit("folder", "Folder").unwrap();
        let task = wait_terminal(&queue, id).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
        assert!(task.result.is_some());
        assert!(task.duration_secs().is_some());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_and_full_rejections() {
        let queue = TaskQueueManager::start(
            config(Duration::from_secs(5)),
            Arc::new(SleepRunner(Duration::from_secs(2))),
        );
        let first = queue.submit("a", "A").unwrap();
        assert_matches!(
            queue.submit("a", "A again"),
            Err(TaskQueueError::Duplicate { task_id, .. }) if task_id == first
        );

        // Let the worker take "a" so the queue holds only what we add next
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.submit("b", "B").unwrap();
        queue.submit("c", "C").unwrap();
        queue.submit("d", "D").unwrap();
        assert_matches!(
            queue.submit("e", "E"),
            Err(TaskQueueError::QueueFull { capacity: 3 })
        );
        assert_eq!(queue.queue_info().active_count, 4);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_pending_task_frees_its_slot() {
        let queue = TaskQueueManager::start(
            config(Duration::from_secs(5)),
            Arc::new(SleepRunner(Duration::from_secs(2))),
        );
        queue.submit("a", "A").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let b = queue.submit("b", "B").unwrap();
        queue.submit("c", "C").unwrap();
        queue.submit("d", "D").unwrap();
        assert_eq!(queue.queue_info().queue_depth, 3);

        assert!(queue.cancel(b));
        assert_eq!(queue.queue_info().queue_depth, 2);
        assert_eq!(queue.health().queue_depth, 2);
        assert!(queue.submit("e", "E").is_ok());
        assert_matches!(
            queue.submit("f", "F"),
            Err(TaskQueueError::QueueFull { capacity: 3 })
        );
        queue.shutdown().await;
        assert_eq!(queue.queue_info().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_worker_restart() {
        let queue = TaskQueueManager::start(
            config(Duration::from_secs(5)),
            Arc::new(SleepRunner(Duration::from_millis(1))),
        );
        assert!(!queue.restart_worker_if_needed());

        queue.kill_worker();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!queue.is_worker_alive());
        assert!(!queue.health().healthy);

        assert!(queue.restart_worker_if_needed());
        assert!(queue.is_worker_alive());

        let id = queue.submit("after-restart", "x").unwrap();
        assert_eq!(wait_terminal(&queue, id).await.status, TaskStatus::Completed);
        queue.shutdown().await;
        assert!(!queue.restart_worker_if_needed());
    }

    #[tokio::test]
    async fn test_long_running_and_forced_timeout() {
        let queue = TaskQueueManager::start(
            config(Duration::from_secs(2)),
            Arc::new(SleepRunner(Duration::from_secs(10))),
        );
        let id = queue.submit("slow", "Slow").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            // Backdate the start so the checks trigger well before the watchdog fires
            let mut state = queue.inner.state.lock();
            let entry = state.active.get_mut(&id).unwrap();
            entry.started = Some(Instant::now() - Duration::from_millis(1700));
        }
        let health = queue.health();
        assert!(!health.healthy);
        assert_eq!(health.long_running_tasks.len(), 1);

        {
            let mut state = queue.inner.state.lock();
            let entry = state.active.get_mut(&id).unwrap();
            entry.started = Some(Instant::now() - Duration::from_millis(3100));
        }
        assert_eq!(queue.force_cleanup_stuck(), 1);
        assert_eq!(queue.get_status(id).unwrap().status, TaskStatus::Timeout);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cleanup_old() {
        let queue = TaskQueueManager::start(
            config(Duration::from_secs(5)),
            Arc::new(SleepRunner(Duration::from_millis(1))),
        );
        let id = queue.submit("x", "X").unwrap();
        wait_terminal(&queue, id).await;

        assert_eq!(queue.cleanup_old(1), 0);
        assert_eq!(queue.cleanup_completed_before(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(queue.get_status(id).is_none());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_scoped() {
        struct Stepper;

        #[async_trait]
        impl TaskRunner for Stepper {
            async fn run(&self, ctx: TaskContext) -> anyhow::Result<GroupingResult> {
                let analysis = ctx.progress.scoped(30.0, 90.0);
                analysis.report("batch 1/2");
                ctx.progress.set(5.0);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(GroupingResult::empty())
            }
        }

        let queue = TaskQueueManager::start(config(Duration::from_secs(5)), Arc::new(Stepper));
        let id = queue.submit("p", "P").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = queue.get_status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!((task.progress - 60.0).abs() < 0.01, "{}", task.progress);
        queue.shutdown().await;
    }
}
