//! Background synchronization between the remote service and local state.
//!
//! - `orchestrator`: periodic pulls, network state machine, conflict handling
//! - `queue`: priority queue of work deferred while offline
//! - `conflict`: divergence classification, merge and the pending set
//! - `events`/`status`: what subscribers and status views observe

mod conflict;
mod events;
mod orchestrator;
mod queue;
mod status;

pub use conflict::{classify, merge, ConflictArbiter, ConflictSet, Divergence, ResolutionStrategy, SyncConflict};
pub use events::{EventBus, SyncEvent, SyncEventKind};
pub use orchestrator::{
  PushOutcome, SkipReason, SyncOrchestrator, SyncOrchestratorBuilder, SyncTask, TickOutcome, TickSummary,
};
pub use queue::{drain, Admission, DrainMode, DrainReport, OfflineQueue, OfflineTask, TaskPriority};
pub use status::{NetworkState, RecentErrors, SyncCounters, SyncErrorRecord, SyncStatus};
