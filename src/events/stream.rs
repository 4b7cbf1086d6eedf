//! Forwarding a subscription to a downstream client.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Event, EventType, Publisher, Subscription, GLOBAL_TASK_ID};
use crate::backend::Backend;
use crate::error::{Error, Result};

/// Default interval between heartbeats on an idle stream.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// What a streaming client asked for.
#[derive(Debug, Clone, Default)]
pub struct SubscribeFilter {
    /// Task to follow; `None` follows every task.
    pub task_id: Option<String>,
    /// Types to forward; empty forwards all.
    pub event_types: HashSet<EventType>,
    /// Only forward events of tasks in this initiative.
    pub initiative_id: Option<String>,
    /// Emit periodic heartbeats.
    pub include_heartbeat: bool,
}

impl SubscribeFilter {
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Default::default()
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = types.into_iter().collect();
        self
    }

    pub fn with_initiative(mut self, initiative_id: impl Into<String>) -> Self {
        self.initiative_id = Some(initiative_id.into());
        self
    }

    pub fn with_heartbeat(mut self, include: bool) -> Self {
        self.include_heartbeat = include;
        self
    }

    fn subscription_key(&self) -> &str {
        match self.task_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => GLOBAL_TASK_ID,
        }
    }

    fn accepts_type(&self, event_type: EventType) -> bool {
        self.event_types.is_empty() || self.event_types.contains(&event_type)
    }
}

/// Downstream consumer of a stream.
#[async_trait]
pub trait EventSink: Send {
    /// Delivers one event. An error ends the stream.
    async fn send(&mut self, event: &Event) -> Result<()>;
}

/// Sink writing one JSON document per line.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Stream(e.to_string()))
    }
}

/// Sink forwarding into a channel. Fails once the receiver is gone.
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&mut self, event: &Event) -> Result<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| Error::Stream("receiver disconnected".to_string()))
    }
}

/// Unsubscribes when dropped, whichever way the stream loop exits.
struct SubscriptionGuard {
    publisher: Arc<dyn Publisher>,
    subscription: Subscription,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let task_id = self.subscription.task_id().to_string();
        self.publisher.unsubscribe(&task_id, &self.subscription);
        tracing::debug!(task_id = %task_id, subscription = self.subscription.id(), "stream unsubscribed");
    }
}

/// Shared dependencies of every stream.
#[derive(Clone)]
pub struct EventStreamer {
    publisher: Arc<dyn Publisher>,
    backend: Arc<dyn Backend>,
    heartbeat_interval: Duration,
}

impl EventStreamer {
    pub fn new(publisher: Arc<dyn Publisher>, backend: Arc<dyn Backend>) -> Self {
        Self {
            publisher,
            backend,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Streams events matching `filter` into `sink` until cancelled, the
    /// subscription closes, or the sink fails.
    pub async fn run<S>(
        &self,
        filter: SubscribeFilter,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        stream_events(
            Arc::clone(&self.publisher),
            Arc::clone(&self.backend),
            filter,
            sink,
            cancel,
            self.heartbeat_interval,
        )
        .await
    }
}

/// Subscribes per `filter` and forwards matching events to `sink`.
///
/// Returns `Ok(())` on cancellation or when the publisher closes the
/// subscription, and the sink's error if a send fails. The subscription is
/// always released before returning.
pub async fn stream_events<S>(
    publisher: Arc<dyn Publisher>,
    backend: Arc<dyn Backend>,
    filter: SubscribeFilter,
    sink: &mut S,
    cancel: CancellationToken,
    heartbeat_interval: Duration,
) -> Result<()>
where
    S: EventSink + ?Sized,
{
    let subscription = publisher.subscribe(filter.subscription_key());
    let mut guard = SubscriptionGuard {
        publisher,
        subscription,
    };

    let period = heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        task_id = %filter.subscription_key(),
        initiative_id = ?filter.initiative_id,
        heartbeat = filter.include_heartbeat,
        "event stream started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("event stream cancelled");
                return Ok(());
            }
            received = guard.subscription.recv() => {
                let Some(event) = received else {
                    tracing::debug!("event stream subscription closed");
                    return Ok(());
                };
                if !filter.accepts_type(event.event_type()) {
                    continue;
                }
                if let Some(initiative_id) = filter.initiative_id.as_deref() {
                    if !belongs_to_initiative(backend.as_ref(), &event, initiative_id).await {
                        continue;
                    }
                }
                sink.send(&event).await?;
            }
            _ = heartbeat.tick(), if filter.include_heartbeat => {
                sink.send(&Event::heartbeat()).await?;
            }
        }
    }
}

/// True if the event's task exists and belongs to `initiative_id`.
async fn belongs_to_initiative(backend: &dyn Backend, event: &Event, initiative_id: &str) -> bool {
    if event.is_global() {
        return false;
    }
    match backend.load_task(&event.task_id).await {
        Ok(task) => task.initiative_id.as_deref() == Some(initiative_id),
        Err(e) => {
            tracing::debug!(task_id = %event.task_id, error = %e, "dropping event for unresolvable task");
            false
        }
    }
}
