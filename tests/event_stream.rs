//! Event streaming through the bus: routing, filters and heartbeats.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use common::HarnessBuilder;
use task_finalizer::{
    ChannelSink, Event, EventBus, EventPayload, EventStreamer, EventType, FinalizeRequest,
    JsonLinesSink, MemoryBackend, Publisher, Result, SubscribeFilter, Task,
};

fn spawn_stream(
    streamer: EventStreamer,
    filter: SubscribeFilter,
    cancel: CancellationToken,
) -> (JoinHandle<Result<()>>, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        streamer.run(filter, &mut sink, cancel).await
    });
    (handle, rx)
}

async fn wait_for_subscriber(bus: &EventBus, task_id: &str) {
    while bus.subscriber_count(task_id) == 0 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn task_created(task_id: &str) -> Event {
    Event::new(
        task_id,
        EventPayload::TaskCreated {
            title: format!("{} title", task_id),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn idle_stream_sends_one_heartbeat_per_interval() {
    let bus = Arc::new(EventBus::default());
    let streamer = EventStreamer::new(bus.clone(), Arc::new(MemoryBackend::new()))
        .with_heartbeat_interval(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let (stream, mut rx) = spawn_stream(
        streamer,
        SubscribeFilter::for_task("T1").with_heartbeat(true),
        cancel.clone(),
    );

    tokio::time::sleep(Duration::from_secs(95)).await;
    cancel.cancel();
    assert_ok!(stream.await.unwrap());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.event_type() == EventType::Heartbeat));
    assert!(events.iter().all(|e| e.is_global()));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_opt_in() {
    let bus = Arc::new(EventBus::default());
    let streamer = EventStreamer::new(bus.clone(), Arc::new(MemoryBackend::new()))
        .with_heartbeat_interval(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let (stream, mut rx) = spawn_stream(streamer, SubscribeFilter::for_task("T1"), cancel.clone());

    tokio::time::sleep(Duration::from_secs(95)).await;
    cancel.cancel();
    assert_ok!(stream.await.unwrap());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn task_stream_is_isolated_and_wildcard_sees_all() {
    let bus = Arc::new(EventBus::default());
    let backend = Arc::new(MemoryBackend::new());
    let cancel = CancellationToken::new();
    let (t1_stream, mut t1_rx) = spawn_stream(
        EventStreamer::new(bus.clone(), backend.clone()),
        SubscribeFilter::for_task("T1"),
        cancel.clone(),
    );
    let (all_stream, mut all_rx) = spawn_stream(
        EventStreamer::new(bus.clone(), backend),
        SubscribeFilter::all(),
        cancel.clone(),
    );
    wait_for_subscriber(&bus, "T1").await;
    wait_for_subscriber(&bus, "*").await;

    bus.publish(task_created("T1"));
    bus.publish(task_created("T2"));

    let first = t1_rx.recv().await.unwrap();
    assert_eq!(first.task_id, "T1");
    let mut wildcard = vec![all_rx.recv().await.unwrap(), all_rx.recv().await.unwrap()];
    wildcard.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    assert_eq!(wildcard[0].task_id, "T1");
    assert_eq!(wildcard[1].task_id, "T2");

    cancel.cancel();
    assert_ok!(t1_stream.await.unwrap());
    assert_ok!(all_stream.await.unwrap());
    assert!(drain(&mut t1_rx).is_empty());
    assert_eq!(bus.subscriber_count("T1"), 0);
    assert_eq!(bus.subscriber_count("*"), 0);
}

#[tokio::test]
async fn closing_bus_ends_stream() {
    let bus = Arc::new(EventBus::default());
    let (stream, _rx) = spawn_stream(
        EventStreamer::new(bus.clone(), Arc::new(MemoryBackend::new())),
        SubscribeFilter::all(),
        CancellationToken::new(),
    );
    wait_for_subscriber(&bus, "*").await;

    bus.close();
    let result = tokio::time::timeout(Duration::from_secs(5), stream)
        .await
        .expect("stream did not end");
    assert_ok!(result.unwrap());
}

#[tokio::test]
async fn finalize_progress_streams_as_json_lines() {
    let h = HarnessBuilder::new().build();
    let streamer = EventStreamer::new(h.bus.clone(), h.backend());
    let cancel = CancellationToken::new();
    let filter = SubscribeFilter::for_task("TASK-001").with_types([EventType::Finalize]);

    let stream = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut sink = JsonLinesSink::new(Vec::new());
            streamer.run(filter, &mut sink, cancel).await?;
            Ok::<_, task_finalizer::Error>(sink.into_inner())
        }
    });
    wait_for_subscriber(&h.bus, "TASK-001").await;

    // Direct subscriber to know when the run is over.
    let mut done = h.bus.subscribe("TASK-001");
    assert_ok!(
        h.service
            .start_finalize("TASK-001", FinalizeRequest::default())
            .await
    );
    common::wait_for_terminal(&mut done).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let output = assert_ok!(stream.await.unwrap());
    let lines: Vec<serde_json::Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(!lines.is_empty());
    assert!(lines.iter().all(|l| l["payload"]["type"] == "finalize_progress"), "{:?}", lines);
    let last = lines.last().unwrap();
    assert_eq!(last["payload"]["data"]["status"], "completed");
    assert_eq!(last["payload"]["data"]["step_percent"], 100);
}

#[tokio::test]
async fn initiative_stream_forwards_only_member_tasks() {
    let bus = Arc::new(EventBus::default());
    let backend = Arc::new(MemoryBackend::with_tasks([
        Task::new("T1", "orc/T1").with_initiative("INIT-1"),
        Task::new("T2", "orc/T2").with_initiative("INIT-2"),
        Task::new("T3", "orc/T3"),
    ]));
    let cancel = CancellationToken::new();
    let (stream, mut rx) = spawn_stream(
        EventStreamer::new(bus.clone(), backend),
        SubscribeFilter::all().with_initiative("INIT-1"),
        cancel.clone(),
    );
    wait_for_subscriber(&bus, "*").await;

    bus.publish(Event::global(EventPayload::Warning {
        message: "disk almost full".to_string(),
        phase: None,
    }));
    bus.publish(task_created("T2"));
    bus.publish(task_created("T3"));
    bus.publish(task_created("T404"));
    bus.publish(task_created("T1"));

    // Events are handled in order, so everything before T1 was dropped.
    let forwarded = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("member event was not forwarded")
        .unwrap();
    assert_eq!(forwarded.task_id, "T1");

    cancel.cancel();
    assert_ok!(stream.await.unwrap());
    assert!(drain(&mut rx).is_empty());
}
