//! End-to-end scenarios against the in-memory log: concurrent writers,
//! mixed-kind histories and consumer recovery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventlog_es::{
    AppendOutcome, ConsumerConfig, ConsumerError, ConsumerState, DecideError, DomainEvent,
    DropCause, DropReason, Entity, Envelope, EventStore, EventStoreBuilder, ExpectedVersion,
    HandlerError, LogGateway, LogService, LogServiceError, MemoryLog, PersistentSession,
    ProposedRecord, ProvisionOutcome, ReadSlice, RepositoryError, SubscriptionSettings,
    entity_stream,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
struct Counter {
    value: i64,
}

#[derive(Debug)]
enum CounterCommand {
    Increment(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum CounterEvent {
    Incremented { by: i64 },
}

impl DomainEvent for CounterEvent {
    const NAMESPACE: &'static str = "scenario.counter";
    const KINDS: &'static [&'static str] = &["Incremented"];
}

#[derive(Debug, thiserror::Error)]
#[error("never rejected")]
struct Never;

impl Entity for Counter {
    const ENTITY_TYPE: &'static str = "Counter";
    type Command = CounterCommand;
    type Event = CounterEvent;
    type Error = Never;

    fn apply(mut self, event: &CounterEvent) -> Self {
        match event {
            CounterEvent::Incremented { by } => self.value += by,
        }
        self
    }

    fn decide(&self, command: CounterCommand) -> Result<Vec<CounterEvent>, DecideError<Never>> {
        match command {
            CounterCommand::Increment(by) => Ok(vec![CounterEvent::Incremented { by }]),
        }
    }
}

fn fast() -> ConsumerConfig {
    ConsumerConfig {
        reattach_base_delay: Duration::from_millis(1),
        reattach_max_delay: Duration::from_millis(5),
    }
}

fn store(log: &MemoryLog) -> EventStore {
    EventStoreBuilder::new()
        .consumer_config(fast())
        .with_service(Arc::new(log.clone()))
}

async fn wait_for_acks(log: &MemoryLog, group: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.acked_count("$ce-Counter", group) < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("acknowledgements did not arrive in time");
}

/// Log wrapper whose appends wait for a second concurrent append.
#[derive(Clone)]
struct BarrierLog {
    inner: MemoryLog,
    barrier: Arc<Barrier>,
}

#[tonic::async_trait]
impl LogService for BarrierLog {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        records: Vec<ProposedRecord>,
    ) -> Result<AppendOutcome, LogServiceError> {
        self.barrier.wait().await;
        self.inner.append(stream_id, expected, records).await
    }

    async fn read_forward(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: u32,
        resolve_links: bool,
    ) -> Result<ReadSlice, LogServiceError> {
        self.inner
            .read_forward(stream_id, from_version, max_count, resolve_links)
            .await
    }

    async fn create_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError> {
        self.inner.create_subscription(stream_id, group, settings).await
    }

    async fn update_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError> {
        self.inner.update_subscription(stream_id, group, settings).await
    }

    async fn subscribe(
        &self,
        stream_id: &str,
        group: &str,
    ) -> Result<Box<dyn PersistentSession>, LogServiceError> {
        self.inner.subscribe(stream_id, group).await
    }
}

#[tokio::test]
async fn stale_writer_gets_conflict() {
    let log = MemoryLog::new();
    let repo = store(&log).repository::<Counter>();

    let created = repo.create(CounterCommand::Increment(3)).await.unwrap();
    assert_eq!(created.version, 0);
    assert_eq!(created.entity.value, 3);

    // Another writer moves the stream to version 1.
    repo.update(created.id, CounterCommand::Increment(1))
        .await
        .unwrap();

    // A writer still holding version 0 is refused by the gateway.
    let gateway = store(&log).gateway().clone();
    let encoded = eventlog_es::encode(&CounterEvent::Incremented { by: 1 }, "Counter", created.id)
        .unwrap();
    let err = gateway
        .append(&entity_stream("Counter", created.id), created.version, vec![encoded])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        eventlog_es::GatewayError::ConcurrencyConflict { expected: 0, .. }
    ));
    assert_eq!(repo.load(created.id).await.unwrap().entity.value, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_updates_one_wins() {
    let log = MemoryLog::new();
    let setup = store(&log).repository::<Counter>();
    let created = setup.create(CounterCommand::Increment(1)).await.unwrap();

    let racing = EventStoreBuilder::new().with_service(Arc::new(BarrierLog {
        inner: log.clone(),
        barrier: Arc::new(Barrier::new(2)),
    }));
    let first = racing.repository::<Counter>();
    let second = racing.repository::<Counter>();
    let id = created.id;

    let a = tokio::spawn(async move { first.update(id, CounterCommand::Increment(1)).await });
    let b = tokio::spawn(async move { second.update(id, CounterCommand::Increment(2)).await });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(RepositoryError::ConcurrencyConflict { .. })))
        .count();
    assert_eq!((successes, conflicts), (1, 1));

    let loaded = setup.load(id).await.unwrap();
    assert_eq!(loaded.version, 1);
}

#[tokio::test]
async fn unknown_kinds_are_skipped_on_replay() {
    let log = MemoryLog::new();
    let repo = store(&log).repository::<Counter>();
    let created = repo.create(CounterCommand::Increment(1)).await.unwrap();
    let stream_id = entity_stream("Counter", created.id);

    // A kind this build does not know, written by a newer producer.
    let metadata = serde_json::json!({
        "event_kind": "scenario.counter.Renamed",
        "entity_type": "Counter",
        "entity_id": created.id,
    });
    log.append(
        &stream_id,
        ExpectedVersion::Exact(0),
        vec![ProposedRecord {
            event_id: Uuid::new_v4(),
            type_tag: "Renamed".into(),
            payload: br#"{"name":"x"}"#.to_vec(),
            metadata: serde_json::to_vec(&metadata).unwrap(),
        }],
    )
    .await
    .unwrap();

    let updated = repo
        .update(created.id, CounterCommand::Increment(2))
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.entity.value, 3);
}

#[tokio::test]
async fn consumer_resumes_after_recoverable_drop_without_redelivery() {
    let log = MemoryLog::new();
    let store = store(&log);
    let repo = store.repository::<Counter>();
    let created = repo.create(CounterCommand::Increment(1)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = store
        .subscriber::<Counter>("projector")
        .on(
            "Incremented",
            move |envelope: &Envelope<CounterEvent>| -> Result<(), HandlerError> {
                sink.lock().unwrap().push(envelope.event.clone());
                Ok(())
            },
        )
        .build()
        .spawn();
    wait_for_acks(&log, "projector", 1).await;

    assert!(log.drop_subscription(
        "$ce-Counter",
        "projector",
        DropReason::ServerError,
        Some(DropCause::Server("node restarting".into()))
    ));
    repo.update(created.id, CounterCommand::Increment(2))
        .await
        .unwrap();
    wait_for_acks(&log, "projector", 2).await;

    assert_ne!(handle.state(), ConsumerState::Terminated);
    handle.shutdown().await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            CounterEvent::Incremented { by: 1 },
            CounterEvent::Incremented { by: 2 },
        ]
    );
}

#[tokio::test]
async fn transport_fault_is_recoverable_whatever_the_reason() {
    let log = MemoryLog::new();
    let store = store(&log);
    let handle = store.subscriber::<Counter>("projector").build().spawn();
    let mut state = handle.state_changes();
    state
        .wait_for(|s| *s == ConsumerState::Attached)
        .await
        .unwrap();

    log.drop_subscription(
        "$ce-Counter",
        "projector",
        DropReason::Unknown,
        Some(DropCause::Transport("connection reset".into())),
    );
    store
        .repository::<Counter>()
        .create(CounterCommand::Increment(1))
        .await
        .unwrap();
    wait_for_acks(&log, "projector", 1).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_failure_terminates_and_leaves_record_unacknowledged() {
    let log = MemoryLog::new();
    let store = store(&log);
    store
        .repository::<Counter>()
        .create(CounterCommand::Increment(1))
        .await
        .unwrap();

    let err = store
        .subscriber::<Counter>("projector")
        .on(
            "Incremented",
            |_: &Envelope<CounterEvent>| -> Result<(), HandlerError> {
                Err("read model unavailable".into())
            },
        )
        .build()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::Handler { ref kind, .. } if kind == "scenario.counter.Incremented"));
    assert_eq!(log.acked_count("$ce-Counter", "projector"), 0);

    // A restarted consumer receives the record again.
    let handle = store
        .subscriber::<Counter>("projector")
        .on(
            "Incremented",
            |_: &Envelope<CounterEvent>| -> Result<(), HandlerError> { Ok(()) },
        )
        .build()
        .spawn();
    wait_for_acks(&log, "projector", 1).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn fans_out_to_every_handler_of_a_kind() {
    let log = MemoryLog::new();
    let store = store(&log);
    store
        .repository::<Counter>()
        .create(CounterCommand::Increment(1))
        .await
        .unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&calls);
    let second = Arc::clone(&calls);
    let handle = store
        .subscriber::<Counter>("projector")
        .on(
            "Incremented",
            move |_: &Envelope<CounterEvent>| -> Result<(), HandlerError> {
                first.lock().unwrap().push("first");
                Ok(())
            },
        )
        .on(
            "Incremented",
            move |_: &Envelope<CounterEvent>| -> Result<(), HandlerError> {
                second.lock().unwrap().push("second");
                Ok(())
            },
        )
        .build()
        .spawn();
    wait_for_acks(&log, "projector", 1).await;
    handle.shutdown().await.unwrap();
    assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
}

#[tokio::test]
async fn unavailable_log_is_retried_until_attach_succeeds() {
    let log = MemoryLog::new();
    log.set_available(false);
    let store = store(&log);
    let handle = store.subscriber::<Counter>("projector").build().spawn();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), ConsumerState::Attaching);

    log.set_available(true);
    let mut state = handle.state_changes();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConsumerState::Attached),
    )
    .await
    .expect("consumer did not attach")
    .unwrap();
    handle.shutdown().await.unwrap();
    assert_eq!(handle.state(), ConsumerState::Detached);
}

#[tokio::test]
async fn non_recoverable_drop_reports_reason() {
    let log = MemoryLog::new();
    let gateway = LogGateway::new(Arc::new(log.clone()));
    let handle = eventlog_es::SubscriberBuilder::<CounterEvent>::new(gateway, "Counter", "audit")
        .config(fast())
        .build()
        .spawn();
    let mut state = handle.state_changes();
    state
        .wait_for(|s| *s == ConsumerState::Attached)
        .await
        .unwrap();

    log.drop_subscription(
        "$ce-Counter",
        "audit",
        DropReason::PersistentSubscriptionDeleted,
        None,
    );
    let err = handle.join().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "subscription dropped: PersistentSubscriptionDeleted"
    );
    assert_eq!(handle.state(), ConsumerState::Terminated);
}
