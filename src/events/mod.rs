//! Typed task events and in-process fan-out.
//!
//! Events are fire-and-forget: the bus keeps no history, so a subscriber only
//! sees events published after it subscribed. See [`bus::EventBus`] for the
//! in-memory publisher and [`stream`] for forwarding a subscription to a
//! downstream client.

pub mod bus;
pub mod stream;

pub use bus::EventBus;
pub use stream::{ChannelSink, EventSink, EventStreamer, JsonLinesSink, SubscribeFilter};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::finalize::{FinalizeResult, FinalizeStatus};
use crate::task::PhaseStatus;

/// Task ID used to subscribe to, or publish, events for every task.
pub const GLOBAL_TASK_ID: &str = "*";

/// Token counts reported by the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub total_tokens: u64,
}

/// What the agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Idle,
    WaitingApi,
    Streaming,
    RunningTool,
    Processing,
    SpecAnalyzing,
    SpecWriting,
}

/// Aggregate metrics of the running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionMetrics {
    pub duration_seconds: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tasks_running: u32,
    pub is_paused: bool,
}

/// Snapshot of a finalize operation, published on every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeProgress {
    pub status: FinalizeStatus,
    pub step: String,
    pub progress: String,
    pub step_percent: u8,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalizeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event payload. One variant per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    TaskCreated {
        title: String,
    },
    TaskUpdated,
    TaskDeleted,
    PhaseChanged {
        phase: String,
        status: PhaseStatus,
    },
    TokensUpdated(TokenUsage),
    DecisionRequired {
        decision_id: String,
        phase: String,
        gate_type: String,
        question: String,
        #[serde(default)]
        context: String,
    },
    DecisionResolved {
        decision_id: String,
        phase: String,
        approved: bool,
        resolved_by: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    Warning {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    FilesChanged {
        files: Vec<String>,
        total_additions: u64,
        total_deletions: u64,
    },
    Activity {
        phase: String,
        activity: ActivityState,
    },
    SessionMetrics(SessionMetrics),
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    FinalizeProgress(FinalizeProgress),
}

impl EventPayload {
    /// Returns the kind of this payload, used for type filtering.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::TaskCreated { .. } => EventType::TaskCreated,
            EventPayload::TaskUpdated => EventType::TaskUpdated,
            EventPayload::TaskDeleted => EventType::TaskDeleted,
            EventPayload::PhaseChanged { .. } => EventType::Phase,
            EventPayload::TokensUpdated(_) => EventType::Tokens,
            EventPayload::DecisionRequired { .. } => EventType::DecisionRequired,
            EventPayload::DecisionResolved { .. } => EventType::DecisionResolved,
            EventPayload::Error { .. } => EventType::Error,
            EventPayload::Warning { .. } => EventType::Warning,
            EventPayload::FilesChanged { .. } => EventType::FilesChanged,
            EventPayload::Activity { .. } => EventType::Activity,
            EventPayload::SessionMetrics(_) => EventType::SessionUpdate,
            EventPayload::Heartbeat { .. } => EventType::Heartbeat,
            EventPayload::FinalizeProgress(_) => EventType::Finalize,
        }
    }
}

/// Event kind names as clients request them in a type filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    Phase,
    Tokens,
    DecisionRequired,
    DecisionResolved,
    Error,
    Warning,
    FilesChanged,
    Activity,
    SessionUpdate,
    Heartbeat,
    Finalize,
}

impl EventType {
    pub const ALL: [EventType; 14] = [
        EventType::TaskCreated,
        EventType::TaskUpdated,
        EventType::TaskDeleted,
        EventType::Phase,
        EventType::Tokens,
        EventType::DecisionRequired,
        EventType::DecisionResolved,
        EventType::Error,
        EventType::Warning,
        EventType::FilesChanged,
        EventType::Activity,
        EventType::SessionUpdate,
        EventType::Heartbeat,
        EventType::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskCreated => "task_created",
            EventType::TaskUpdated => "task_updated",
            EventType::TaskDeleted => "task_deleted",
            EventType::Phase => "phase",
            EventType::Tokens => "tokens",
            EventType::DecisionRequired => "decision_required",
            EventType::DecisionResolved => "decision_resolved",
            EventType::Error => "error",
            EventType::Warning => "warning",
            EventType::FilesChanged => "files_changed",
            EventType::Activity => "activity",
            EventType::SessionUpdate => "session_update",
            EventType::Heartbeat => "heartbeat",
            EventType::Finalize => "finalize",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown event type: {}", s)))
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Task the event belongs to, or [`GLOBAL_TASK_ID`].
    pub task_id: String,
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event for a task.
    pub fn new(task_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            task_id: task_id.into(),
            payload,
        }
    }

    /// Creates an event not bound to any task.
    pub fn global(payload: EventPayload) -> Self {
        Self::new(GLOBAL_TASK_ID, payload)
    }

    /// Creates a heartbeat event stamped with the current time.
    pub fn heartbeat() -> Self {
        Self::global(EventPayload::Heartbeat {
            timestamp: Utc::now(),
        })
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// True if the event is not bound to a specific task.
    pub fn is_global(&self) -> bool {
        self.task_id.is_empty() || self.task_id == GLOBAL_TASK_ID
    }
}

/// Identifier of one subscription within a publisher.
pub type SubscriptionId = u64;

/// Receiving end of a subscription.
///
/// The channel closes when the publisher drops the subscription, either on
/// [`Publisher::unsubscribe`] or [`Publisher::close`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    task_id: String,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, task_id: String, rx: mpsc::Receiver<Event>) -> Self {
        Self { id, task_id, rx }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Waits for the next event; `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Result<Event, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Event fan-out keyed by task ID.
pub trait Publisher: Send + Sync {
    /// Delivers an event to subscribers of its task and to wildcard
    /// subscribers. Never blocks.
    fn publish(&self, event: Event);

    /// Subscribes to one task's events, or all events with [`GLOBAL_TASK_ID`].
    fn subscribe(&self, task_id: &str) -> Subscription;

    /// Removes a subscription. Calling it again, or after the publisher
    /// already dropped the subscription, is a no-op.
    fn unsubscribe(&self, task_id: &str, subscription: &Subscription);

    /// Drops all subscriptions; later publishes are ignored.
    fn close(&self);
}
