//! Log gateway: the four log operations the repository and consumer use.
//!
//! Normalizes the log service's outcomes into [`GatewayError`] kinds and
//! converts between signed stream versions (with the [`NO_STREAM`] and
//! [`ANY_VERSION`] sentinels) and the service's [`ExpectedVersion`].

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::codec::{self, EncodedEvent, EventRegistry};
use crate::error::{CodecError, GatewayError};
use crate::service::{
    AppendOutcome, ExpectedVersion, LogService, PersistentSession, ProposedRecord,
    ProvisionOutcome, ReadStatus, SubscriptionSettings,
};

/// Version of a stream that has no records.
///
/// As an expected version it requires the stream not to exist yet.
pub const NO_STREAM: i64 = -1;

/// Expected version that accepts any current version.
pub const ANY_VERSION: i64 = -2;

/// Records requested per forward-read page.
pub const DEFAULT_READ_PAGE_SIZE: u32 = 4096;

/// Stream holding the events of one entity.
pub fn entity_stream(entity_type: &str, entity_id: Uuid) -> String {
    format!("{entity_type}-{entity_id}")
}

/// Category stream aggregating every stream of an entity type.
pub fn category_stream(entity_type: &str) -> String {
    format!("$ce-{entity_type}")
}

/// Result of a complete forward read.
#[derive(Debug, Clone, PartialEq)]
pub struct EventsWithVersion<Ev> {
    /// Decoded events in commit order.
    pub events: Vec<Ev>,
    /// Version of the stream's last record, or [`NO_STREAM`].
    pub version: i64,
}

fn to_expected_version(stream_id: &str, version: i64) -> Result<ExpectedVersion, GatewayError> {
    match version {
        ANY_VERSION => Ok(ExpectedVersion::Any),
        NO_STREAM => Ok(ExpectedVersion::NoStream),
        v => u64::try_from(v)
            .map(ExpectedVersion::Exact)
            .map_err(|_| GatewayError::AppendFailed {
                stream_id: stream_id.to_string(),
                reason: format!("invalid expected version {v}"),
            }),
    }
}

/// Thin adapter over a [`LogService`].
///
/// Clone is cheap: the service is shared behind an [`Arc`].
#[derive(Clone)]
pub struct LogGateway {
    service: Arc<dyn LogService>,
    settings: SubscriptionSettings,
    page_size: u32,
}

impl fmt::Debug for LogGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogGateway")
            .field("settings", &self.settings)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl LogGateway {
    /// Wrap a log service with default subscription settings and page size.
    pub fn new(service: Arc<dyn LogService>) -> Self {
        Self {
            service,
            settings: SubscriptionSettings::default(),
            page_size: DEFAULT_READ_PAGE_SIZE,
        }
    }

    /// Settings applied by [`ensure_subscription`](Self::ensure_subscription).
    pub fn with_subscription_settings(mut self, settings: SubscriptionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Records requested per page by [`read_forward`](Self::read_forward).
    /// Zero is treated as one.
    pub fn with_read_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append encoded events if the stream is at `expected_version`.
    ///
    /// Each record gets a fresh event id.
    ///
    /// # Arguments
    ///
    /// * `stream_id` - Target stream.
    /// * `expected_version` - Version the stream must be at; [`NO_STREAM`]
    ///   requires a fresh stream, [`ANY_VERSION`] skips the check.
    /// * `events` - Records to append atomically.
    ///
    /// # Returns
    ///
    /// The stream's version after the append.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ConcurrencyConflict`] if the precondition fails.
    /// - [`GatewayError::AppendFailed`] for any other refusal.
    /// - [`GatewayError::Service`] if the service call itself fails.
    pub async fn append(
        &self,
        stream_id: &str,
        expected_version: i64,
        events: Vec<EncodedEvent>,
    ) -> Result<i64, GatewayError> {
        let expected = to_expected_version(stream_id, expected_version)?;
        let records = events
            .into_iter()
            .map(|e| ProposedRecord {
                event_id: Uuid::new_v4(),
                type_tag: e.type_tag,
                payload: e.payload,
                metadata: e.metadata,
            })
            .collect();

        match self.service.append(stream_id, expected, records).await? {
            AppendOutcome::Success { next_version } => {
                i64::try_from(next_version).map_err(|_| GatewayError::AppendFailed {
                    stream_id: stream_id.to_string(),
                    reason: format!("version {next_version} out of range"),
                })
            }
            AppendOutcome::VersionConflict { current } => {
                tracing::debug!(
                    stream_id,
                    expected_version,
                    current = ?current,
                    "append rejected by version check"
                );
                Err(GatewayError::ConcurrencyConflict {
                    stream_id: stream_id.to_string(),
                    expected: expected_version,
                })
            }
            AppendOutcome::Failed { reason } => Err(GatewayError::AppendFailed {
                stream_id: stream_id.to_string(),
                reason,
            }),
        }
    }

    /// Read and decode an entire stream from the beginning.
    ///
    /// Records of unregistered kinds and links whose target no longer
    /// resolves are skipped. The returned version still counts them, so it
    /// is always the stream's real last version.
    ///
    /// # Returns
    ///
    /// All decoded events in commit order, or an empty list and
    /// [`NO_STREAM`] for a stream without records.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ReadFailed`] if the stream is deleted or a
    /// record fails to decode for any reason other than an unknown kind.
    pub async fn read_forward<Ev>(
        &self,
        stream_id: &str,
        registry: &EventRegistry<Ev>,
    ) -> Result<EventsWithVersion<Ev>, GatewayError> {
        let read_failed = |reason: String| GatewayError::ReadFailed {
            stream_id: stream_id.to_string(),
            reason,
        };
        let mut events = Vec::new();
        let mut version = NO_STREAM;
        let mut from = 0;

        loop {
            let slice = self
                .service
                .read_forward(stream_id, from, self.page_size, true)
                .await?;
            match slice.status {
                ReadStatus::Success => {}
                ReadStatus::StreamNotFound => break,
                ReadStatus::StreamDeleted => return Err(read_failed("stream deleted".into())),
            }
            let page_len = slice.records.len();

            for record in slice.records {
                if let Some(position) = record.original_position() {
                    version = i64::try_from(position.version)
                        .map_err(|_| read_failed(format!("version {} out of range", position.version)))?;
                }
                let Some(event) = record.event else {
                    tracing::debug!(stream_id, "skipping unresolved link");
                    continue;
                };
                match codec::decode(registry, &event.payload, &event.metadata) {
                    Ok((decoded, _)) => events.push(decoded),
                    Err(CodecError::UnknownEventKind(kind)) => {
                        tracing::debug!(stream_id, kind = %kind, version = event.version, "skipping unknown event kind");
                    }
                    Err(e) => return Err(read_failed(e.to_string())),
                }
            }

            if slice.end_of_stream || page_len == 0 {
                break;
            }
            from = slice.next_version;
        }

        Ok(EventsWithVersion { events, version })
    }

    /// Idempotently provision a persistent subscription group.
    ///
    /// Creates the group; if it already exists, updates it in place.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ProvisioningFailed`] for any refusal other
    /// than "already exists", or [`GatewayError::Service`] if a call fails.
    pub async fn ensure_subscription(&self, stream_id: &str, group: &str) -> Result<(), GatewayError> {
        let failed = |reason: String| GatewayError::ProvisioningFailed {
            stream_id: stream_id.to_string(),
            group: group.to_string(),
            reason,
        };

        match self
            .service
            .create_subscription(stream_id, group, &self.settings)
            .await?
        {
            ProvisionOutcome::Done => {
                tracing::info!(stream_id, group, "persistent subscription created");
                Ok(())
            }
            ProvisionOutcome::AlreadyExists => {
                match self
                    .service
                    .update_subscription(stream_id, group, &self.settings)
                    .await?
                {
                    ProvisionOutcome::Done => {
                        tracing::info!(stream_id, group, "persistent subscription updated");
                        Ok(())
                    }
                    ProvisionOutcome::Failed { reason } => Err(failed(reason)),
                    other => Err(failed(format!("unexpected update outcome {other:?}"))),
                }
            }
            ProvisionOutcome::Failed { reason } => Err(failed(reason)),
            ProvisionOutcome::NotFound => Err(failed("stream not found".into())),
        }
    }

    /// Attach a session to an existing subscription group.
    ///
    /// Delivery order follows the source stream's commit order. Every
    /// delivered record must be acknowledged to advance the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AttachFailed`] if the service refuses.
    pub async fn attach_consumer(
        &self,
        stream_id: &str,
        group: &str,
    ) -> Result<Box<dyn PersistentSession>, GatewayError> {
        self.service
            .subscribe(stream_id, group)
            .await
            .map_err(|source| GatewayError::AttachFailed {
                stream_id: stream_id.to_string(),
                group: group.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Metadata, encode};
    use crate::entity::test_fixtures::CounterEvent;
    use crate::memory::MemoryLog;
    use crate::service::SessionEvent;

    fn gateway(log: &MemoryLog) -> LogGateway {
        LogGateway::new(Arc::new(log.clone()))
    }

    fn encoded(id: Uuid, events: &[CounterEvent]) -> Vec<EncodedEvent> {
        events
            .iter()
            .map(|e| encode(e, "Counter", id).unwrap())
            .collect()
    }

    fn unknown_record(id: Uuid) -> EncodedEvent {
        EncodedEvent {
            type_tag: "Reset".into(),
            payload: b"{}".to_vec(),
            metadata: serde_json::to_vec(&Metadata {
                event_kind: "test.counter.Reset".into(),
                entity_type: "Counter".into(),
                entity_id: id,
            })
            .unwrap(),
        }
    }

    #[test]
    fn stream_keys() {
        let id = Uuid::nil();
        assert_eq!(
            entity_stream("Counter", id),
            "Counter-00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(category_stream("Counter"), "$ce-Counter");
    }

    #[tokio::test]
    async fn append_returns_next_version_and_detects_conflicts() {
        let log = MemoryLog::new();
        let gw = gateway(&log);
        let id = Uuid::new_v4();
        let stream = entity_stream("Counter", id);

        let v = gw
            .append(&stream, NO_STREAM, encoded(id, &[CounterEvent::Incremented { by: 1 }]))
            .await
            .unwrap();
        assert_eq!(v, 0);

        let v = gw
            .append(
                &stream,
                0,
                encoded(
                    id,
                    &[
                        CounterEvent::Incremented { by: 1 },
                        CounterEvent::Decremented { by: 1 },
                    ],
                ),
            )
            .await
            .unwrap();
        assert_eq!(v, 2);

        let err = gw
            .append(&stream, 0, encoded(id, &[CounterEvent::Closed]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ConcurrencyConflict { expected: 0, .. }
        ));

        let err = gw
            .append(&stream, NO_STREAM, encoded(id, &[CounterEvent::Closed]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConcurrencyConflict { .. }));

        let v = gw
            .append(&stream, ANY_VERSION, encoded(id, &[CounterEvent::Closed]))
            .await
            .unwrap();
        assert_eq!(v, 3);
    }

    #[tokio::test]
    async fn append_to_deleted_stream_fails() {
        let log = MemoryLog::new();
        let gw = gateway(&log);
        let id = Uuid::new_v4();
        let stream = entity_stream("Counter", id);
        log.delete_stream(&stream);
        let err = gw
            .append(&stream, ANY_VERSION, encoded(id, &[CounterEvent::Closed]))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AppendFailed { .. }));
    }

    #[tokio::test]
    async fn invalid_expected_version_is_rejected() {
        let log = MemoryLog::new();
        let err = gateway(&log)
            .append("Counter-x", -7, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AppendFailed { .. }));
    }

    #[tokio::test]
    async fn read_of_missing_stream_is_empty() {
        let log = MemoryLog::new();
        let registry = EventRegistry::<CounterEvent>::for_event();
        let read = gateway(&log)
            .read_forward("Counter-missing", &registry)
            .await
            .unwrap();
        assert!(read.events.is_empty());
        assert_eq!(read.version, NO_STREAM);
    }

    #[tokio::test]
    async fn read_pages_through_long_streams() {
        let log = MemoryLog::new();
        let gw = gateway(&log).with_read_page_size(3);
        let id = Uuid::new_v4();
        let stream = entity_stream("Counter", id);
        let events: Vec<CounterEvent> = (1..=10)
            .map(|by| CounterEvent::Incremented { by })
            .collect();
        gw.append(&stream, NO_STREAM, encoded(id, &events))
            .await
            .unwrap();

        let registry = EventRegistry::<CounterEvent>::for_event();
        let read = gw.read_forward(&stream, &registry).await.unwrap();
        assert_eq!(read.events, events);
        assert_eq!(read.version, 9);

        let again = gw.read_forward(&stream, &registry).await.unwrap();
        assert_eq!(again, read);
    }

    #[tokio::test]
    async fn read_skips_unknown_kinds_but_counts_their_version() {
        let log = MemoryLog::new();
        let gw = gateway(&log);
        let id = Uuid::new_v4();
        let stream = entity_stream("Counter", id);
        let mut records = encoded(id, &[CounterEvent::Incremented { by: 2 }]);
        records.push(unknown_record(id));
        gw.append(&stream, NO_STREAM, records).await.unwrap();

        let registry = EventRegistry::<CounterEvent>::for_event();
        let read = gw.read_forward(&stream, &registry).await.unwrap();
        assert_eq!(read.events, vec![CounterEvent::Incremented { by: 2 }]);
        assert_eq!(read.version, 1);
    }

    #[tokio::test]
    async fn malformed_record_fails_the_read() {
        let log = MemoryLog::new();
        let gw = gateway(&log);
        let id = Uuid::new_v4();
        let stream = entity_stream("Counter", id);
        let mut records = encoded(id, &[CounterEvent::Incremented { by: 2 }]);
        records[0].payload = b"{\"by\": \"two\"}".to_vec();
        gw.append(&stream, NO_STREAM, records).await.unwrap();

        let registry = EventRegistry::<CounterEvent>::for_event();
        let err = gw.read_forward(&stream, &registry).await.unwrap_err();
        assert!(matches!(err, GatewayError::ReadFailed { .. }));
    }

    #[tokio::test]
    async fn read_of_deleted_stream_fails() {
        let log = MemoryLog::new();
        let gw = gateway(&log);
        let id = Uuid::new_v4();
        let stream = entity_stream("Counter", id);
        gw.append(&stream, NO_STREAM, encoded(id, &[CounterEvent::Closed]))
            .await
            .unwrap();
        log.delete_stream(&stream);
        let registry = EventRegistry::<CounterEvent>::for_event();
        let err = gw.read_forward(&stream, &registry).await.unwrap_err();
        assert!(matches!(err, GatewayError::ReadFailed { .. }));
    }

    #[tokio::test]
    async fn ensure_subscription_is_idempotent() {
        let log = MemoryLog::new();
        let gw = gateway(&log);
        gw.ensure_subscription("$ce-Counter", "projector")
            .await
            .unwrap();
        gw.ensure_subscription("$ce-Counter", "projector")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn provisioning_refusal_is_fatal() {
        let log = MemoryLog::new();
        log.set_provisioning_failure(Some("access denied".into()));
        let err = gateway(&log)
            .ensure_subscription("$ce-Counter", "projector")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProvisioningFailed { ref reason, .. } if reason == "access denied"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn attach_delivers_category_records() {
        let log = MemoryLog::new();
        let gw = gateway(&log);
        let id = Uuid::new_v4();
        gw.append(
            &entity_stream("Counter", id),
            NO_STREAM,
            encoded(id, &[CounterEvent::Incremented { by: 4 }]),
        )
        .await
        .unwrap();
        gw.ensure_subscription("$ce-Counter", "projector")
            .await
            .unwrap();
        let mut session = gw.attach_consumer("$ce-Counter", "projector").await.unwrap();
        match session.next().await {
            SessionEvent::Delivered(record) => {
                let event = record.event.unwrap();
                assert_eq!(event.stream_id, entity_stream("Counter", id));
                assert_eq!(event.type_tag, "Incremented");
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attach_to_missing_group_fails() {
        let log = MemoryLog::new();
        let err = gateway(&log)
            .attach_consumer("$ce-Counter", "nobody")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::AttachFailed { .. }));
        assert!(!err.is_transient());
    }
}
