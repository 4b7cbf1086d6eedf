//! Task Finalizer - finalize orchestration for multi-phase agent tasks
//!
//! This library syncs a finished task's branch with its target, optionally
//! waits for CI and merges, streams live progress to observers, and keeps
//! task pull request state reconciled with the hosting provider.

pub mod backend;
pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod finalize;
pub mod git;
pub mod hosting;
pub mod pr_poller;
pub mod pr_status;
pub mod risk;
pub mod task;

pub use error::{Error, Result};

pub use backend::{Backend, FileBackend, MemoryBackend};
pub use backoff::ExponentialBackoff;
pub use config::{FinalizerConfig, Validate, ValidationResult};
pub use events::stream::stream_events;
pub use events::{
    ChannelSink, Event, EventBus, EventPayload, EventSink, EventStreamer, EventType,
    JsonLinesSink, Publisher, SubscribeFilter, Subscription, GLOBAL_TASK_ID,
};
pub use executor::{
    CiMergeOutcome, CiMerger, CommandConflictResolver, ConflictResolver, GhCiMerger,
    PhaseContext, PhaseExecutor, PhaseOutcome, PhaseProgress, ProgressObserver,
    SyncPhaseExecutor,
};
pub use finalize::{
    ApprovalTrigger, FinalizeOperation, FinalizeRequest, FinalizeResponse, FinalizeResult,
    FinalizeService, FinalizeStatus, FinalizeStatusView, FinalizeTracker, FinalizeWorkflow,
    OperationHandle, TryStart, ViewStatus,
};
pub use git::{Divergence, GitService, SyncOutcome, SyncStrategy, WorktreeGit};
pub use hosting::{
    ChecksStatus, GhCliProvider, HostingProvider, PrState, PrStatusSummary, PullRequest,
    ReviewStatus,
};
pub use pr_poller::{PrPoller, PrStatusListener};
pub use pr_status::resolve_pr_status;
pub use risk::{DiffStat, RiskAssessment, RiskLevel};
pub use task::{
    ExecutionState, PhaseState, PhaseStatus, PrInfo, PrStatus, Task, TaskStatus, TaskWeight,
};
