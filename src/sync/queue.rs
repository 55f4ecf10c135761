//! Priority queue of work deferred while offline, replayed on reconnect.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
  High,
  Normal,
  Low,
}

impl TaskPriority {
  const ALL: [TaskPriority; 3] = [Self::High, Self::Normal, Self::Low];

  fn tier(&self) -> usize {
    match self {
      Self::High => 0,
      Self::Normal => 1,
      Self::Low => 2,
    }
  }
}

/// How a drain executes queued tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainMode {
  /// Run each batch concurrently, waiting for all of it before the next
  #[default]
  Batched,
  /// One task at a time
  Sequential,
}

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync>;

/// A deferred operation. `execute` may run several times.
#[derive(Clone)]
pub struct OfflineTask {
  /// Assigned on enqueue
  pub id: u64,
  pub label: String,
  pub priority: TaskPriority,
  pub retry_count: u32,
  pub max_retries: u32,
  pub queued_at: DateTime<Utc>,
  execute: TaskFn,
}

impl OfflineTask {
  pub fn new<F, Fut>(label: impl Into<String>, priority: TaskPriority, max_retries: u32, execute: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
  {
    Self {
      id: 0,
      label: label.into(),
      priority,
      retry_count: 0,
      max_retries,
      queued_at: Utc::now(),
      execute: Arc::new(move || Box::pin(execute())),
    }
  }

  pub fn run(&self) -> BoxFuture<'static, Result<(), SyncError>> {
    (self.execute)()
  }
}

impl fmt::Debug for OfflineTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OfflineTask")
      .field("id", &self.id)
      .field("label", &self.label)
      .field("priority", &self.priority)
      .field("retry_count", &self.retry_count)
      .field("max_retries", &self.max_retries)
      .finish()
  }
}

/// Outcome of [`OfflineQueue::enqueue`].
#[derive(Debug)]
pub enum Admission {
  Accepted(u64),
  /// Queue was full; a lower (or equal) priority task made room
  Displaced { id: u64, dropped: OfflineTask },
  /// Queue was full of higher priority work; the new task was dropped
  Rejected(OfflineTask),
}

/// FIFO within a priority tier; `high` drains before `normal` before `low`.
#[derive(Debug)]
pub struct OfflineQueue {
  tiers: [VecDeque<OfflineTask>; 3],
  capacity: usize,
  next_id: u64,
  closed: bool,
}

impl OfflineQueue {
  pub fn new(capacity: usize) -> Self {
    Self {
      tiers: Default::default(),
      capacity: capacity.max(1),
      next_id: 1,
      closed: false,
    }
  }

  /// Append `task` to the back of its tier.
  ///
  /// Fails only once the queue is closed. A full queue drops the newest
  /// task of the lowest non-empty tier at or below the new task's priority.
  pub fn enqueue(&mut self, mut task: OfflineTask) -> Result<Admission, SyncError> {
    if self.closed {
      return Err(SyncError::Disposed);
    }

    task.id = self.next_id;
    self.next_id += 1;
    let id = task.id;

    if self.len() < self.capacity {
      self.tiers[task.priority.tier()].push_back(task);
      return Ok(Admission::Accepted(id));
    }

    let victim_tier = TaskPriority::ALL
      .iter()
      .rev()
      .take_while(|p| **p >= task.priority)
      .map(|p| p.tier())
      .find(|t| !self.tiers[*t].is_empty());

    match victim_tier.and_then(|t| self.tiers[t].pop_back()) {
      Some(dropped) => {
        warn!("Offline queue full, dropping {:?}", dropped);
        self.tiers[task.priority.tier()].push_back(task);
        Ok(Admission::Displaced { id, dropped })
      }
      None => {
        warn!("Offline queue full, rejecting {:?}", task);
        Ok(Admission::Rejected(task))
      }
    }
  }

  /// Put a task that failed back at the back of its tier.
  pub fn requeue(&mut self, task: OfflineTask) {
    if self.closed {
      debug!("Queue closed, discarding {:?}", task);
      return;
    }
    self.tiers[task.priority.tier()].push_back(task);
  }

  /// Return undrained tasks to the front of their tiers, keeping their order.
  pub fn restore_front(&mut self, tasks: Vec<OfflineTask>) {
    if self.closed {
      return;
    }
    for task in tasks.into_iter().rev() {
      self.tiers[task.priority.tier()].push_front(task);
    }
  }

  /// Remove and return every task in drain order.
  pub fn take_all(&mut self) -> Vec<OfflineTask> {
    self.tiers.iter_mut().flat_map(|t| t.drain(..)).collect()
  }

  pub fn contains_label(&self, label: &str) -> bool {
    self.tiers.iter().flatten().any(|t| t.label == label)
  }

  /// Labels in drain order.
  pub fn labels(&self) -> Vec<String> {
    self.tiers.iter().flatten().map(|t| t.label.clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.tiers.iter().map(VecDeque::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Reject all further work and discard what is queued.
  pub fn close(&mut self) {
    self.closed = true;
    for tier in &mut self.tiers {
      tier.clear();
    }
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }
}

/// What happened during one [`drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
  pub succeeded: Vec<u64>,
  pub requeued: Vec<u64>,
  /// Tasks that used up their retries, with their final error
  pub dropped: Vec<(OfflineTask, SyncError)>,
  /// Tasks put back untouched because the drain was interrupted
  pub deferred: usize,
}

/// Execute everything currently queued.
///
/// Tasks enqueued or requeued while draining wait for the next drain.
/// `keep_going` is checked before each batch; when it returns false the
/// remaining tasks go back to the front of the queue.
pub async fn drain<K>(
  queue: &Mutex<OfflineQueue>,
  mode: DrainMode,
  batch_size: usize,
  keep_going: K,
) -> DrainReport
where
  K: Fn() -> bool,
{
  let mut pending: VecDeque<OfflineTask> = queue.lock().take_all().into();
  let batch_size = match mode {
    DrainMode::Batched => batch_size.max(1),
    DrainMode::Sequential => 1,
  };
  let mut report = DrainReport::default();

  while !pending.is_empty() {
    if !keep_going() {
      report.deferred = pending.len();
      queue.lock().restore_front(pending.into());
      break;
    }

    let take = batch_size.min(pending.len());
    let batch: Vec<OfflineTask> = pending.drain(..take).collect();
    let results = join_all(batch.iter().map(OfflineTask::run)).await;

    for (mut task, result) in batch.into_iter().zip(results) {
      match result {
        Ok(()) => {
          debug!("Offline task {} ({}) succeeded", task.id, task.label);
          report.succeeded.push(task.id);
        }
        Err(e) => {
          task.retry_count += 1;
          if task.retry_count >= task.max_retries {
            warn!(
              "Offline task {} ({}) dropped after {} attempts: {}",
              task.id, task.label, task.retry_count, e
            );
            report.dropped.push((task, e));
          } else {
            debug!(
              "Offline task {} ({}) failed, requeued ({}/{}): {}",
              task.id, task.label, task.retry_count, task.max_retries, e
            );
            report.requeued.push(task.id);
            queue.lock().requeue(task);
          }
        }
      }
    }
  }

  report
}
