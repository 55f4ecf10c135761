//! Background synchronizer.
//!
//! One orchestrator instance owns its network state, pending conflicts,
//! offline queue and counters. Periodic tasks pull remote state through the
//! retry executor, diff it against the local store and apply the result;
//! a task never overlaps with itself, but different tasks may run at the
//! same time since they touch disjoint records.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::{classify, merge, ConflictArbiter, ConflictSet, Divergence, ResolutionStrategy, SyncConflict};
use super::events::{EventBus, SyncEvent, SyncEventKind};
use super::queue::{self, Admission, DrainReport, OfflineQueue, OfflineTask, TaskPriority};
use super::status::{NetworkState, SyncErrorRecord, SyncStatus};
use crate::cache::{CacheLayer, Cacheable, InvalidationRule};
use crate::clock::{Clock, SystemClock};
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{ErrorKind, SyncError};
use crate::model::{Entity, EntityKey, EntityKind, EntityStatus};
use crate::remote::RemoteSource;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::store::LocalStore;

/// Independently scheduled periodic pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTask {
  Entities,
  CommentThreads,
  UserActivity,
}

impl SyncTask {
  pub const ALL: [SyncTask; 3] = [Self::Entities, Self::CommentThreads, Self::UserActivity];

  pub fn name(&self) -> &'static str {
    match self {
      Self::Entities => "entities",
      Self::CommentThreads => "comment_threads",
      Self::UserActivity => "user_activity",
    }
  }

  fn slot(&self) -> usize {
    match self {
      Self::Entities => 0,
      Self::CommentThreads => 1,
      Self::UserActivity => 2,
    }
  }

  fn offline_priority(&self) -> TaskPriority {
    match self {
      Self::Entities | Self::CommentThreads => TaskPriority::Normal,
      Self::UserActivity => TaskPriority::Low,
    }
  }

  fn queue_label(&self) -> String {
    format!("pull:{}", self.name())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// The same task is already running
  InFlight,
  /// Waiting for the reachability probe
  Offline,
  Disposed,
}

/// Counts from one applied tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
  pub pulled: usize,
  pub inserted: usize,
  pub updated: usize,
  pub conflicts: usize,
  /// Remote copies ignored because a local push is still pending
  pub kept_local: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
  Skipped(SkipReason),
  Completed(TickSummary),
  Failed(SyncError),
}

/// Result of a user-initiated push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
  /// The remote accepted the change
  Applied(Entity),
  /// The remote was unreachable; the push will replay on reconnect
  Queued(u64),
}

type Slot = (EntityKind, EntityKey);

type ReplayFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync>;

fn slot_of(entity: &Entity) -> Slot {
  (entity.kind, entity.key.clone())
}

#[derive(Default)]
struct Plan {
  pulled: usize,
  inserts: Vec<Entity>,
  updates: Vec<Entity>,
  unchanged: Vec<Entity>,
  conflicts: Vec<SyncConflict>,
  /// Pending conflicts whose record the remote has since moved past
  superseded: Vec<String>,
  kept_local: usize,
}

struct Inner {
  config: SyncConfig,
  retry: RetryConfig,
  remote: Arc<dyn RemoteSource>,
  store: Arc<dyn LocalStore>,
  cache: CacheLayer<Entity>,
  clock: Arc<dyn Clock>,
  arbiter: Option<Arc<dyn ConflictArbiter>>,
  events: EventBus,
  status: Mutex<SyncStatus>,
  in_flight: [AtomicBool; 3],
  /// Last remote version applied per record; the merge base
  snapshot: Mutex<HashMap<Slot, Entity>>,
  /// Statuses pushed locally that the remote hasn't reflected yet
  initiated: Mutex<HashMap<Slot, EntityStatus>>,
  conflicts: Mutex<ConflictSet>,
  queue: Mutex<OfflineQueue>,
  resolve_lock: tokio::sync::Mutex<()>,
  drain_lock: tokio::sync::Mutex<()>,
  cancel: CancellationToken,
  started: AtomicBool,
  disposed: AtomicBool,
  timers: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`SyncOrchestrator`].
pub struct SyncOrchestratorBuilder {
  remote: Arc<dyn RemoteSource>,
  store: Arc<dyn LocalStore>,
  cache: CacheLayer<Entity>,
  config: SyncConfig,
  retry: RetryConfig,
  clock: Arc<dyn Clock>,
  arbiter: Option<Arc<dyn ConflictArbiter>>,
}

impl SyncOrchestratorBuilder {
  pub fn config(mut self, config: SyncConfig) -> Self {
    self.config = config;
    self
  }

  pub fn retry(mut self, retry: RetryConfig) -> Self {
    self.retry = retry;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn arbiter(mut self, arbiter: Arc<dyn ConflictArbiter>) -> Self {
    self.arbiter = Some(arbiter);
    self
  }

  /// An `auto_resolve` of `Manual` is ignored: ticks never wait on an arbiter.
  pub fn build(mut self) -> SyncOrchestrator {
    if self.config.auto_resolve == Some(ResolutionStrategy::Manual) {
      warn!("Ignoring auto_resolve = manual; conflicts stay pending until resolved explicitly");
      self.config.auto_resolve = None;
    }

    let status = SyncStatus::new(self.config.max_recent_errors);
    let queue = OfflineQueue::new(self.config.offline_queue_capacity);

    SyncOrchestrator {
      inner: Arc::new(Inner {
        config: self.config,
        retry: self.retry,
        remote: self.remote,
        store: self.store,
        cache: self.cache,
        clock: self.clock,
        arbiter: self.arbiter,
        events: EventBus::default(),
        status: Mutex::new(status),
        in_flight: Default::default(),
        snapshot: Mutex::new(HashMap::new()),
        initiated: Mutex::new(HashMap::new()),
        conflicts: Mutex::new(ConflictSet::new()),
        queue: Mutex::new(queue),
        resolve_lock: tokio::sync::Mutex::new(()),
        drain_lock: tokio::sync::Mutex::new(()),
        cancel: CancellationToken::new(),
        started: AtomicBool::new(false),
        disposed: AtomicBool::new(false),
        timers: Mutex::new(Vec::new()),
      }),
    }
  }
}

/// Handle to one sync engine instance. Clones share state.
#[derive(Clone)]
pub struct SyncOrchestrator {
  inner: Arc<Inner>,
}

/// Resets a task's in-flight flag when the tick ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl SyncOrchestrator {
  pub fn builder(
    remote: Arc<dyn RemoteSource>,
    store: Arc<dyn LocalStore>,
    cache: CacheLayer<Entity>,
  ) -> SyncOrchestratorBuilder {
    SyncOrchestratorBuilder {
      remote,
      store,
      cache,
      config: SyncConfig::default(),
      retry: RetryConfig::default(),
      clock: Arc::new(SystemClock),
      arbiter: None,
    }
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Spawn the periodic pulls and the reachability probe. Idempotent.
  ///
  /// While online the probe timer instead drains whatever is still queued.
  pub fn start(&self) {
    if self.is_disposed() || self.inner.started.swap(true, Ordering::SeqCst) {
      return;
    }

    let config = &self.inner.config;
    for task in SyncTask::ALL {
      let secs = match task {
        SyncTask::Entities => config.entity_interval_secs,
        SyncTask::CommentThreads => config.thread_interval_secs,
        SyncTask::UserActivity => config.activity_interval_secs,
      };
      let this = self.clone();
      self.spawn_every(Duration::from_secs(secs.max(1)), move || {
        let this = this.clone();
        async move {
          this.run_task(task).await;
        }
      });
    }

    let this = self.clone();
    self.spawn_every(Duration::from_secs(config.probe_interval_secs.max(1)), move || {
      let this = this.clone();
      async move {
        if this.network_state() != NetworkState::Online {
          this.probe_now().await;
        } else {
          let queued = this.inner.queue.lock().len();
          // Tasks requeued after a server-side failure retry on this cadence
          if queued > 0 {
            this.drain_offline_queue().await;
          }
        }
      }
    });

    info!(
      "Sync started for {} container(s)",
      self.inner.config.containers.len()
    );
  }

  fn spawn_every<F, Fut>(&self, every: Duration, mut tick: F)
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let cancel = self.inner.cancel.clone();
    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(every);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = interval.tick() => tick().await,
        }
      }
    });
    self.inner.timers.lock().push(handle);
  }

  /// Stop all scheduled work. Pending conflicts and queued tasks are
  /// dropped; in-flight results are discarded when they complete.
  pub fn dispose(&self) {
    if self.inner.disposed.swap(true, Ordering::SeqCst) {
      return;
    }

    self.inner.cancel.cancel();
    for handle in self.inner.timers.lock().drain(..) {
      handle.abort();
    }
    self.inner.queue.lock().close();
    self.inner.conflicts.lock().clear();

    {
      let mut status = self.inner.status.lock();
      status.enabled = false;
      status.counters.conflicts = 0;
    }

    info!("Sync engine disposed");
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.load(Ordering::SeqCst)
  }

  // ==========================================================================
  // Observation
  // ==========================================================================

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  pub fn status(&self) -> SyncStatus {
    let mut status = self.inner.status.lock().clone();
    status.is_syncing = self.inner.in_flight.iter().any(|f| f.load(Ordering::SeqCst));
    status.queued_tasks = self.inner.queue.lock().len();
    status
  }

  pub fn network_state(&self) -> NetworkState {
    self.inner.status.lock().network_state
  }

  /// Pending conflicts, oldest first.
  pub fn conflicts(&self) -> Vec<SyncConflict> {
    self.inner.conflicts.lock().list()
  }

  pub fn conflict(&self, id: &str) -> Option<SyncConflict> {
    self.inner.conflicts.lock().get(id).cloned()
  }

  /// Labels of queued offline tasks in drain order.
  pub fn queued_tasks(&self) -> Vec<String> {
    self.inner.queue.lock().labels()
  }

  pub fn cache(&self) -> &CacheLayer<Entity> {
    &self.inner.cache
  }

  // ==========================================================================
  // Periodic pulls
  // ==========================================================================

  /// Run one tick of `task` now.
  pub async fn run_task(&self, task: SyncTask) -> TickOutcome {
    self.tick(task, false).await
  }

  /// Run every task concurrently.
  pub async fn sync_all(&self) -> Vec<TickOutcome> {
    let (entities, threads, activity) = futures::join!(
      self.run_task(SyncTask::Entities),
      self.run_task(SyncTask::CommentThreads),
      self.run_task(SyncTask::UserActivity)
    );
    vec![entities, threads, activity]
  }

  async fn tick(&self, task: SyncTask, from_queue: bool) -> TickOutcome {
    if self.is_disposed() {
      return TickOutcome::Skipped(SkipReason::Disposed);
    }
    if self.network_state() == NetworkState::Offline {
      debug!("Skipping {} while offline", task.name());
      return TickOutcome::Skipped(SkipReason::Offline);
    }

    let flag = &self.inner.in_flight[task.slot()];
    if flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("Skipping {}: already in flight", task.name());
      return TickOutcome::Skipped(SkipReason::InFlight);
    }
    let _guard = InFlightGuard(flag);

    self.publish(SyncEventKind::SyncStarted {
      task: task.name().to_string(),
    });

    let result = match self.fetch(task).await {
      Ok(remote) => self.diff(remote).await,
      Err(e) => Err(e),
    };

    let plan = match result {
      Ok(plan) => plan,
      Err(SyncError::Cancelled) if self.is_disposed() => {
        return TickOutcome::Skipped(SkipReason::Disposed)
      }
      Err(e) => return self.fail_tick(task, e, from_queue),
    };

    if self.is_disposed() {
      debug!("Discarding {} results after disposal", task.name());
      return TickOutcome::Skipped(SkipReason::Disposed);
    }

    let (summary, new_conflicts) = match self.apply(plan).await {
      Ok(applied) => applied,
      Err(e) => return self.fail_tick(task, e, from_queue),
    };

    {
      let mut status = self.inner.status.lock();
      status.last_sync_at = Some(self.inner.clock.now());
      status.counters.entity_pulls += 1;
    }

    info!(
      "Sync {} complete: {} pulled, {} new, {} updated, {} conflicts",
      task.name(),
      summary.pulled,
      summary.inserted,
      summary.updated,
      summary.conflicts
    );
    self.publish(SyncEventKind::SyncCompleted {
      task: task.name().to_string(),
      pulled: summary.pulled,
      applied: summary.inserted + summary.updated,
      conflicts: summary.conflicts,
    });

    if let Some(strategy) = self.inner.config.auto_resolve {
      for id in new_conflicts {
        if let Err(e) = self.resolve_conflict(&id, strategy).await {
          warn!("Auto-resolving conflict {} with {} failed: {}", id, strategy, e);
        }
      }
    }

    TickOutcome::Completed(summary)
  }

  async fn fetch(&self, task: SyncTask) -> Result<Vec<Entity>, SyncError> {
    let remote = &self.inner.remote;
    let policy = self.inner.retry.pull;

    let kind = match task {
      SyncTask::Entities => EntityKind::PullRequest,
      SyncTask::CommentThreads => EntityKind::CommentThread,
      SyncTask::UserActivity => {
        return self.with_retry(policy, || remote.fetch_activity()).await;
      }
    };

    let mut all = Vec::new();
    for container in &self.inner.config.containers {
      let batch = self
        .with_retry(policy, || remote.fetch_entities(container, kind))
        .await?;
      all.extend(batch);
    }
    Ok(all)
  }

  /// Compare every remote record with its local copy. Nothing is written.
  async fn diff(&self, remote: Vec<Entity>) -> Result<Plan, SyncError> {
    let mut plan = Plan {
      pulled: remote.len(),
      ..Plan::default()
    };
    let now = self.inner.clock.now();

    for incoming in remote {
      let local = self
        .inner
        .store
        .get_entity(incoming.kind, &incoming.key)
        .await?;

      let Some(local) = local else {
        plan.inserts.push(incoming);
        continue;
      };

      let pending = self
        .inner
        .conflicts
        .lock()
        .for_entity(incoming.kind, &incoming.key)
        .map(|c| (c.id.clone(), !c.remote.differs_from(&incoming)));

      if !local.differs_from(&incoming) {
        plan.superseded.extend(pending.map(|(id, _)| id));
        plan.unchanged.push(incoming);
        continue;
      }

      let slot = slot_of(&incoming);
      let initiated = self.inner.initiated.lock().get(&slot).copied();

      match classify(&local, &incoming, initiated) {
        Divergence::Update => {
          plan.superseded.extend(pending.map(|(id, _)| id));
          plan.updates.push(incoming);
        }
        Divergence::KeepLocal => plan.kept_local += 1,
        Divergence::Conflict => {
          // Already pending against this exact remote version
          if matches!(pending, Some((_, true))) {
            continue;
          }

          let base = self.inner.snapshot.lock().get(&slot).cloned();
          plan
            .conflicts
            .push(SyncConflict::new(local, incoming, base, now));
        }
      }
    }

    Ok(plan)
  }

  /// Write the plan: local updates first, then conflicts, then cache
  /// invalidation.
  async fn apply(&self, plan: Plan) -> Result<(TickSummary, Vec<String>), SyncError> {
    let summary = TickSummary {
      pulled: plan.pulled,
      inserted: plan.inserts.len(),
      updated: plan.updates.len(),
      conflicts: plan.conflicts.len(),
      kept_local: plan.kept_local,
    };

    let mut changed = Vec::new();
    for entity in plan.inserts.into_iter().chain(plan.updates) {
      self.inner.store.upsert_entity(entity.clone()).await?;
      changed.push(entity.cache_key());
      self.remember(entity);
    }
    for entity in plan.unchanged {
      self.remember(entity);
    }

    for id in plan.superseded {
      self.drop_superseded_conflict(&id);
    }

    let mut new_conflicts = Vec::with_capacity(plan.conflicts.len());
    for conflict in plan.conflicts {
      new_conflicts.push(conflict.id.clone());
      self.register_conflict(conflict);
    }

    if !changed.is_empty() {
      let rules: Vec<_> = changed.into_iter().map(InvalidationRule::Exact).collect();
      self.inner.cache.invalidate(&rules);
    }

    Ok((summary, new_conflicts))
  }

  /// Record `entity` as the last agreed remote version.
  fn remember(&self, entity: Entity) {
    let slot = slot_of(&entity);

    {
      let mut initiated = self.inner.initiated.lock();
      if initiated.get(&slot) == Some(&entity.status) {
        initiated.remove(&slot);
      }
    }

    self.inner.snapshot.lock().insert(slot, entity);
  }

  fn register_conflict(&self, conflict: SyncConflict) {
    let id = conflict.id.clone();
    let key = conflict.key.clone();
    info!(
      "Conflict {} on {} {}: local {:?}, remote {:?}",
      id, conflict.entity_kind, key, conflict.local.status, conflict.remote.status
    );

    let pending = {
      let mut conflicts = self.inner.conflicts.lock();
      conflicts.insert(conflict);
      conflicts.len() as u64
    };
    self.inner.status.lock().counters.conflicts = pending;

    self.publish(SyncEventKind::ConflictDetected {
      conflict_id: id,
      key,
    });
  }

  /// The remote moved on to a version that no longer conflicts with local
  /// state, so the pending conflict resolves itself in the remote's favour.
  fn drop_superseded_conflict(&self, id: &str) {
    let pending = {
      let mut conflicts = self.inner.conflicts.lock();
      if conflicts.remove(id).is_none() {
        return;
      }
      conflicts.len() as u64
    };
    self.inner.status.lock().counters.conflicts = pending;

    info!("Conflict {} superseded by a newer remote version", id);
    self.publish(SyncEventKind::ConflictResolved {
      conflict_id: id.to_string(),
      strategy: ResolutionStrategy::ServerWins.to_string(),
    });
  }

  fn fail_tick(&self, task: SyncTask, error: SyncError, from_queue: bool) -> TickOutcome {
    warn!("Sync {} failed: {}", task.name(), error);
    self.record_error(task.name(), &error);
    self.publish(SyncEventKind::SyncFailed {
      task: task.name().to_string(),
      error: error.to_string(),
    });

    if error.is_network() {
      self.go_offline(&error);

      if !from_queue && !self.inner.queue.lock().contains_label(&task.queue_label()) {
        let replay = OfflineTask::new(
          task.queue_label(),
          task.offline_priority(),
          self.inner.config.task_max_retries,
          rerun_task(Arc::downgrade(&self.inner), task),
        );
        if let Err(e) = self.enqueue(replay) {
          debug!("Could not queue {} for replay: {}", task.name(), e);
        }
      }
    }

    TickOutcome::Failed(error)
  }

  // ==========================================================================
  // Network state
  // ==========================================================================

  /// Check reachability now. Success while offline switches back online and
  /// drains the offline queue.
  pub async fn probe_now(&self) -> NetworkState {
    if self.is_disposed() {
      return self.network_state();
    }

    let remote = &self.inner.remote;
    match self.with_retry(self.inner.retry.probe, || remote.probe()).await {
      Ok(()) => {
        self.go_online().await;
      }
      Err(e) if e.is_network() => {
        debug!("Reachability probe failed: {}", e);
        self.go_offline(&e);
      }
      Err(e) => debug!("Reachability probe inconclusive: {}", e),
    }

    self.network_state()
  }

  fn set_network_state(&self, to: NetworkState) -> Option<NetworkState> {
    let mut status = self.inner.status.lock();
    let from = status.network_state;
    if from == to {
      return None;
    }
    status.network_state = to;
    Some(from)
  }

  fn go_offline(&self, cause: &SyncError) {
    if let Some(from) = self.set_network_state(NetworkState::Offline) {
      info!("Network {} -> offline: {}", from, cause);
      self.publish(SyncEventKind::NetworkStatusChanged {
        from,
        to: NetworkState::Offline,
      });
      self.publish(SyncEventKind::OfflineModeActivated);
    }
  }

  async fn go_online(&self) {
    if let Some(from) = self.set_network_state(NetworkState::Online) {
      info!("Network {} -> online", from);
      self.publish(SyncEventKind::NetworkStatusChanged {
        from,
        to: NetworkState::Online,
      });
      if from == NetworkState::Offline {
        self.publish(SyncEventKind::OfflineModeDeactivated);
      }
      self.drain_offline_queue().await;
    }
  }

  // ==========================================================================
  // Offline queue
  // ==========================================================================

  /// Queue deferred work. A full queue drops the lowest priority task
  /// (possibly `task` itself) and records a capacity error.
  pub fn enqueue(&self, task: OfflineTask) -> Result<u64, SyncError> {
    let admission = self.inner.queue.lock().enqueue(task)?;

    match admission {
      Admission::Accepted(id) => Ok(id),
      Admission::Displaced { id, dropped } => {
        self.record_error(
          "offline_queue",
          &SyncError::Capacity(format!("dropped {}", dropped.label)),
        );
        Ok(id)
      }
      Admission::Rejected(task) => {
        let error = SyncError::Capacity(format!("dropped {}", task.label));
        self.record_error("offline_queue", &error);
        Err(error)
      }
    }
  }

  /// Replay queued work in priority order. Stops early if the engine goes
  /// offline again.
  pub async fn drain_offline_queue(&self) -> DrainReport {
    let _drain = self.inner.drain_lock.lock().await;
    let config = &self.inner.config;

    let report = queue::drain(&self.inner.queue, config.drain_mode, config.batch_size, || {
      !self.is_disposed() && self.network_state() == NetworkState::Online
    })
    .await;

    for (task, error) in &report.dropped {
      let source = format!("offline:{}", task.label);
      self.record_error(&source, error);
      self.publish(SyncEventKind::SyncFailed {
        task: source,
        error: error.to_string(),
      });
    }

    if !report.succeeded.is_empty() || !report.dropped.is_empty() {
      info!(
        "Offline queue drained: {} ok, {} requeued, {} dropped, {} deferred",
        report.succeeded.len(),
        report.requeued.len(),
        report.dropped.len(),
        report.deferred
      );
    }
    report
  }

  // ==========================================================================
  // Local changes
  // ==========================================================================

  /// Push a local change made by the user.
  ///
  /// Non-retryable failures come back to the caller immediately. If the
  /// remote is unreachable the change is applied locally and queued.
  pub async fn push_entity(&self, entity: Entity) -> Result<PushOutcome, SyncError> {
    if self.is_disposed() {
      return Err(SyncError::Disposed);
    }

    if self.network_state() != NetworkState::Offline {
      let remote = &self.inner.remote;
      match self
        .with_retry(self.inner.retry.push, || remote.push_entity(&entity))
        .await
      {
        Ok(accepted) => {
          apply_accepted(&self.inner, accepted.clone()).await?;
          return Ok(PushOutcome::Applied(accepted));
        }
        Err(e) if e.is_network() => self.go_offline(&e),
        Err(e) => return Err(e),
      }
    }

    let slot = slot_of(&entity);
    self.inner.initiated.lock().insert(slot, entity.status);
    self.inner.store.upsert_entity(entity.clone()).await?;
    self
      .inner
      .cache
      .invalidate(&[InvalidationRule::Exact(entity.cache_key())]);

    let label = format!("push:{}", entity.cache_key());
    let id = self.enqueue(OfflineTask::new(
      label,
      TaskPriority::High,
      self.inner.config.task_max_retries,
      replay_push(Arc::downgrade(&self.inner), entity),
    ))?;
    Ok(PushOutcome::Queued(id))
  }

  // ==========================================================================
  // Conflict resolution
  // ==========================================================================

  /// Resolve one pending conflict. Resolutions are serialized.
  ///
  /// `Manual` defers to the configured [`ConflictArbiter`] and waits for its
  /// answer; disposal abandons the wait.
  pub async fn resolve_conflict(
    &self,
    id: &str,
    strategy: ResolutionStrategy,
  ) -> Result<Entity, SyncError> {
    if self.is_disposed() {
      return Err(SyncError::Disposed);
    }
    let _serial = self.inner.resolve_lock.lock().await;

    let conflict = self
      .conflict(id)
      .ok_or_else(|| SyncError::NotFound(format!("conflict {}", id)))?;

    let strategy = match strategy {
      ResolutionStrategy::Manual => self.ask_arbiter(&conflict).await?,
      other => other,
    };
    if !self.inner.conflicts.lock().set_resolution(id, strategy) {
      return Err(SyncError::NotFound(format!("conflict {}", id)));
    }

    let resolved = match strategy {
      ResolutionStrategy::ServerWins => conflict.remote.clone(),
      ResolutionStrategy::ClientWins => self.push_resolution(&conflict.local).await?,
      ResolutionStrategy::Merge => {
        let merged = merge(conflict.base.as_ref(), &conflict.local, &conflict.remote);
        if merged.differs_from(&conflict.remote) {
          self.push_resolution(&merged).await?
        } else {
          merged
        }
      }
      ResolutionStrategy::Manual => {
        return Err(SyncError::validation("arbiter must pick a concrete strategy"))
      }
    };

    if self.is_disposed() {
      return Err(SyncError::Disposed);
    }

    apply_accepted(&self.inner, resolved.clone()).await?;

    let pending = {
      let mut conflicts = self.inner.conflicts.lock();
      conflicts.remove(id);
      conflicts.len() as u64
    };
    self.inner.status.lock().counters.conflicts = pending;

    info!("Resolved conflict {} with {}", id, strategy);
    self.publish(SyncEventKind::ConflictResolved {
      conflict_id: id.to_string(),
      strategy: strategy.to_string(),
    });

    Ok(resolved)
  }

  async fn ask_arbiter(&self, conflict: &SyncConflict) -> Result<ResolutionStrategy, SyncError> {
    let arbiter = self
      .inner
      .arbiter
      .clone()
      .ok_or_else(|| SyncError::validation("manual resolution needs an arbiter"))?;

    tokio::select! {
      _ = self.inner.cancel.cancelled() => Err(SyncError::Disposed),
      choice = arbiter.choose(conflict) => match choice {
        Some(ResolutionStrategy::Manual) => Err(SyncError::validation("arbiter must pick a concrete strategy")),
        Some(strategy) => Ok(strategy),
        None => Err(SyncError::Conflict(format!("conflict {} left pending", conflict.id))),
      },
    }
  }

  async fn push_resolution(&self, entity: &Entity) -> Result<Entity, SyncError> {
    let remote = &self.inner.remote;
    self
      .with_retry(self.inner.retry.push, || remote.push_entity(entity))
      .await
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  async fn with_retry<T, F, Fut>(&self, policy: RetryPolicy, operation: F) -> Result<T, SyncError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
  {
    let inner = &self.inner;
    RetryExecutor::new(policy)
      .with_cancellation(inner.cancel.clone())
      .on_retry(|_| inner.status.lock().counters.retries += 1)
      .run(operation)
      .await
  }

  fn record_error(&self, source: &str, error: &SyncError) {
    // Conflicts live in the conflict set, not the error log
    if error.kind() == ErrorKind::Conflict {
      return;
    }

    let record = SyncErrorRecord {
      at: self.inner.clock.now(),
      source: source.to_string(),
      kind: Some(error.kind()),
      message: error.to_string(),
    };
    self.inner.status.lock().recent_errors.push(record);
  }

  fn publish(&self, kind: SyncEventKind) {
    self.inner.events.publish(self.inner.clock.now(), kind);
  }
}

/// Write a remote-accepted version locally and drop its stale cache entry.
async fn apply_accepted(inner: &Inner, accepted: Entity) -> Result<(), SyncError> {
  inner.store.upsert_entity(accepted.clone()).await?;
  inner
    .cache
    .invalidate(&[InvalidationRule::Exact(accepted.cache_key())]);

  let slot = slot_of(&accepted);
  inner.initiated.lock().remove(&slot);
  inner.snapshot.lock().insert(slot, accepted);
  Ok(())
}

/// Offline replay of a periodic pull.
fn rerun_task(inner: Weak<Inner>, task: SyncTask) -> ReplayFn {
  Box::new(move || {
    let inner = inner.clone();
    async move {
      let inner = inner.upgrade().ok_or(SyncError::Disposed)?;
      let orchestrator = SyncOrchestrator { inner };

      match orchestrator.tick(task, true).await {
        TickOutcome::Completed(_) | TickOutcome::Skipped(SkipReason::InFlight) => Ok(()),
        TickOutcome::Skipped(SkipReason::Offline) => Err(SyncError::network("still offline")),
        TickOutcome::Skipped(SkipReason::Disposed) => Err(SyncError::Disposed),
        TickOutcome::Failed(e) => Err(e),
      }
    }
    .boxed()
  })
}

/// Offline replay of a user push.
fn replay_push(inner: Weak<Inner>, entity: Entity) -> ReplayFn {
  Box::new(move || {
    let inner = inner.clone();
    let entity = entity.clone();
    async move {
      let inner = inner.upgrade().ok_or(SyncError::Disposed)?;
      let orchestrator = SyncOrchestrator { inner };

      match orchestrator.push_resolution(&entity).await {
        Ok(accepted) => apply_accepted(&orchestrator.inner, accepted).await,
        Err(e) => {
          if e.is_network() {
            orchestrator.go_offline(&e);
          }
          Err(e)
        }
      }
    }
    .boxed()
  })
}
