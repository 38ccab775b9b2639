//! In-process [`LogService`] backed by memory.
//!
//! Behaves like a single-node log service: conditional appends, a `$ce-`
//! category stream of links per entity type, and persistent subscription
//! groups that checkpoint every acknowledged record and allow one attached
//! session at a time. Fault injection hooks let tests and demos exercise
//! the consumer's recovery paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::LogServiceError;
use crate::service::{
    AppendOutcome, DropCause, DropReason, ExpectedVersion, LogService, PersistentSession,
    ProposedRecord, ProvisionOutcome, ReadSlice, ReadStatus, RecordedRecord, ResolvedRecord,
    SessionClosed, SessionEvent, SubscriptionSettings,
};

/// Type tag of link records on category streams.
const LINK_TYPE: &str = "$>";

/// Prefix of system category streams.
const CATEGORY_PREFIX: &str = "$ce-";

enum Entry {
    Event(RecordedRecord),
    Link {
        link: RecordedRecord,
        stream_id: String,
        version: u64,
    },
}

impl Entry {
    fn record(&self) -> &RecordedRecord {
        match self {
            Self::Event(record) => record,
            Self::Link { link, .. } => link,
        }
    }
}

#[derive(Default)]
struct Stream {
    entries: Vec<Entry>,
    deleted: bool,
}

struct ActiveSession {
    epoch: u64,
    pending_close: Option<SessionClosed>,
}

struct Group {
    settings: SubscriptionSettings,
    start: u64,
    /// Acknowledged positions at or beyond `start`.
    acked: HashSet<u64>,
    ack_total: usize,
    active: Option<ActiveSession>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    groups: HashMap<(String, String), Group>,
    next_epoch: u64,
    unavailable: bool,
    provisioning_failure: Option<String>,
}

impl State {
    fn resolve(&self, entry: &Entry, resolve_links: bool) -> ResolvedRecord {
        match entry {
            Entry::Event(record) => ResolvedRecord::plain(record.clone()),
            Entry::Link { link, .. } if !resolve_links => ResolvedRecord::plain(link.clone()),
            Entry::Link {
                link,
                stream_id,
                version,
            } => {
                let event = self
                    .streams
                    .get(stream_id)
                    .filter(|s| !s.deleted)
                    .and_then(|s| s.entries.get(*version as usize))
                    .map(|e| e.record().clone());
                ResolvedRecord {
                    event,
                    link: Some(link.clone()),
                }
            }
        }
    }

    fn check_available(&self) -> Result<(), LogServiceError> {
        if self.unavailable {
            Err(LogServiceError::Transport(tonic::Status::unavailable(
                "log service unavailable",
            )))
        } else {
            Ok(())
        }
    }

    fn push(&mut self, stream_id: &str, entry: impl FnOnce(u64) -> Entry) -> u64 {
        let stream = self.streams.entry(stream_id.to_string()).or_default();
        let version = stream.entries.len() as u64;
        stream.entries.push(entry(version));
        version
    }
}

struct Shared {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// In-memory log service.
///
/// Clone is cheap; clones share the same log.
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use eventlog_es::{ExpectedVersion, LogService, MemoryLog, ProposedRecord};
/// use uuid::Uuid;
///
/// let log = MemoryLog::new();
/// let record = ProposedRecord {
///     event_id: Uuid::new_v4(),
///     type_tag: "Opened".into(),
///     payload: b"{}".to_vec(),
///     metadata: b"{}".to_vec(),
/// };
/// log.append("Account-1", ExpectedVersion::NoStream, vec![record]).await?;
/// let slice = log.read_forward("$ce-Account", 0, 10, true).await?;
/// assert_eq!(slice.records.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("MemoryLog")
            .field("streams", &state.streams.len())
            .field("groups", &state.groups.len())
            .finish()
    }
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed,
            }),
        }
    }

    /// Committed records of `stream_id` with links resolved, in order.
    pub fn records(&self, stream_id: &str) -> Vec<ResolvedRecord> {
        let state = self.shared.lock();
        state
            .streams
            .get(stream_id)
            .map(|s| s.entries.iter().map(|e| state.resolve(e, true)).collect())
            .unwrap_or_default()
    }

    /// Number of distinct records acknowledged by `group` on `stream_id`.
    pub fn acked_count(&self, stream_id: &str, group: &str) -> usize {
        self.shared
            .lock()
            .groups
            .get(&(stream_id.to_string(), group.to_string()))
            .map_or(0, |g| g.ack_total)
    }

    /// Whether `group` on `stream_id` currently has an attached session.
    pub fn has_session(&self, stream_id: &str, group: &str) -> bool {
        self.shared
            .lock()
            .groups
            .get(&(stream_id.to_string(), group.to_string()))
            .is_some_and(|g| g.active.is_some())
    }

    /// Close the attached session of a group with the given reason.
    ///
    /// Returns `false` if no session is attached. The group and its
    /// checkpoint survive; a new session resumes after the last acknowledged
    /// record.
    pub fn drop_subscription(
        &self,
        stream_id: &str,
        group: &str,
        reason: DropReason,
        cause: Option<DropCause>,
    ) -> bool {
        let dropped = {
            let mut state = self.shared.lock();
            match state
                .groups
                .get_mut(&(stream_id.to_string(), group.to_string()))
                .and_then(|g| g.active.as_mut())
            {
                Some(active) => {
                    active.pending_close = Some(SessionClosed { reason, cause });
                    true
                }
                None => false,
            }
        };
        if dropped {
            self.shared.notify();
        }
        dropped
    }

    /// Mark a stream deleted. Reads report it deleted and links to its
    /// records no longer resolve.
    pub fn delete_stream(&self, stream_id: &str) {
        self.shared
            .lock()
            .streams
            .entry(stream_id.to_string())
            .or_default()
            .deleted = true;
        self.shared.notify();
    }

    /// Make every call fail with a transport error while `false`.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().unavailable = !available;
    }

    /// Refuse subscription provisioning with `reason` until cleared with `None`.
    pub fn set_provisioning_failure(&self, reason: Option<String>) {
        self.shared.lock().provisioning_failure = reason;
    }
}

#[tonic::async_trait]
impl LogService for MemoryLog {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        records: Vec<ProposedRecord>,
    ) -> Result<AppendOutcome, LogServiceError> {
        let outcome = {
            let mut state = self.shared.lock();
            state.check_available()?;
            let (deleted, current) = match state.streams.get(stream_id) {
                Some(s) => (s.deleted, (s.entries.len() as u64).checked_sub(1)),
                None => (false, None),
            };
            if deleted {
                return Ok(AppendOutcome::Failed {
                    reason: format!("stream {stream_id} is deleted"),
                });
            }
            if records.is_empty() {
                return Ok(AppendOutcome::Failed {
                    reason: "no records to append".into(),
                });
            }
            let holds = match expected {
                ExpectedVersion::Any => true,
                ExpectedVersion::NoStream => current.is_none(),
                ExpectedVersion::Exact(v) => current == Some(v),
            };
            if !holds {
                return Ok(AppendOutcome::VersionConflict { current });
            }

            let category = (!stream_id.starts_with('$'))
                .then(|| stream_id.split_once('-'))
                .flatten()
                .map(|(category, _)| format!("{CATEGORY_PREFIX}{category}"));
            let mut next_version = 0;
            for proposed in records {
                let version = state.push(stream_id, |version| {
                    Entry::Event(RecordedRecord {
                        event_id: proposed.event_id,
                        stream_id: stream_id.to_string(),
                        version,
                        type_tag: proposed.type_tag,
                        payload: proposed.payload,
                        metadata: proposed.metadata,
                    })
                });
                if let Some(category) = &category {
                    state.push(category, |link_version| Entry::Link {
                        link: RecordedRecord {
                            event_id: Uuid::new_v4(),
                            stream_id: category.clone(),
                            version: link_version,
                            type_tag: LINK_TYPE.to_string(),
                            payload: format!("{version}@{stream_id}").into_bytes(),
                            metadata: Vec::new(),
                        },
                        stream_id: stream_id.to_string(),
                        version,
                    });
                }
                next_version = version;
            }
            AppendOutcome::Success { next_version }
        };
        self.shared.notify();
        Ok(outcome)
    }

    async fn read_forward(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: u32,
        resolve_links: bool,
    ) -> Result<ReadSlice, LogServiceError> {
        let state = self.shared.lock();
        state.check_available()?;
        let Some(stream) = state.streams.get(stream_id) else {
            return Ok(ReadSlice {
                status: ReadStatus::StreamNotFound,
                records: Vec::new(),
                next_version: 0,
                last_version: None,
                end_of_stream: true,
            });
        };
        let len = stream.entries.len() as u64;
        if stream.deleted {
            return Ok(ReadSlice {
                status: ReadStatus::StreamDeleted,
                records: Vec::new(),
                next_version: from_version,
                last_version: len.checked_sub(1),
                end_of_stream: true,
            });
        }
        let start = from_version.min(len);
        let end = start.saturating_add(u64::from(max_count)).min(len);
        let records = stream.entries[start as usize..end as usize]
            .iter()
            .map(|e| state.resolve(e, resolve_links))
            .collect();
        Ok(ReadSlice {
            status: ReadStatus::Success,
            records,
            next_version: end,
            last_version: len.checked_sub(1),
            end_of_stream: end >= len,
        })
    }

    async fn create_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError> {
        let mut state = self.shared.lock();
        state.check_available()?;
        if let Some(reason) = &state.provisioning_failure {
            return Ok(ProvisionOutcome::Failed {
                reason: reason.clone(),
            });
        }
        let key = (stream_id.to_string(), group.to_string());
        if state.groups.contains_key(&key) {
            return Ok(ProvisionOutcome::AlreadyExists);
        }
        let start = if settings.start_from_beginning {
            0
        } else {
            state
                .streams
                .get(stream_id)
                .map_or(0, |s| s.entries.len() as u64)
        };
        state.groups.insert(
            key,
            Group {
                settings: settings.clone(),
                start,
                acked: HashSet::new(),
                ack_total: 0,
                active: None,
            },
        );
        Ok(ProvisionOutcome::Done)
    }

    async fn update_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError> {
        let mut state = self.shared.lock();
        state.check_available()?;
        if let Some(reason) = &state.provisioning_failure {
            return Ok(ProvisionOutcome::Failed {
                reason: reason.clone(),
            });
        }
        match state
            .groups
            .get_mut(&(stream_id.to_string(), group.to_string()))
        {
            Some(existing) => {
                existing.settings = settings.clone();
                Ok(ProvisionOutcome::Done)
            }
            None => Ok(ProvisionOutcome::NotFound),
        }
    }

    async fn subscribe(
        &self,
        stream_id: &str,
        group: &str,
    ) -> Result<Box<dyn PersistentSession>, LogServiceError> {
        let (epoch, cursor) = {
            let mut state = self.shared.lock();
            state.check_available()?;
            let epoch = state.next_epoch;
            state.next_epoch += 1;
            let existing = state
                .groups
                .get_mut(&(stream_id.to_string(), group.to_string()))
                .ok_or_else(|| {
                    LogServiceError::Rejected(format!("group {group} on {stream_id} not found"))
                })?;
            if existing.active.is_some() {
                return Err(LogServiceError::Rejected(format!(
                    "group {group} on {stream_id} already has a consumer"
                )));
            }
            existing.active = Some(ActiveSession {
                epoch,
                pending_close: None,
            });
            (epoch, existing.start)
        };
        tracing::debug!(stream_id, group, epoch, "memory session attached");
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            changed: self.shared.changed.subscribe(),
            key: (stream_id.to_string(), group.to_string()),
            epoch,
            cursor,
            in_flight: HashMap::new(),
            closed: None,
        }))
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    changed: watch::Receiver<u64>,
    key: (String, String),
    epoch: u64,
    cursor: u64,
    in_flight: HashMap<Uuid, u64>,
    closed: Option<SessionClosed>,
}

impl MemorySession {
    /// Next delivery or closure, without waiting.
    fn poll_state(&mut self) -> Option<SessionEvent> {
        let mut state = self.shared.lock();
        let Some(group) = state.groups.get_mut(&self.key) else {
            return Some(SessionEvent::Closed(SessionClosed {
                reason: DropReason::PersistentSubscriptionDeleted,
                cause: None,
            }));
        };
        let closing = match group.active.as_mut() {
            Some(active) if active.epoch == self.epoch => active.pending_close.take(),
            _ => {
                return Some(SessionEvent::Closed(SessionClosed {
                    reason: DropReason::ConnectionClosed,
                    cause: Some(DropCause::Transport("session superseded".into())),
                }));
            }
        };
        if let Some(closed) = closing {
            group.active = None;
            return Some(SessionEvent::Closed(closed));
        }
        let resolve_links = group.settings.resolve_links;
        let acked = group.acked.clone();
        let stream = state.streams.get(&self.key.0)?;
        while let Some(entry) = stream.entries.get(self.cursor as usize) {
            let position = self.cursor;
            self.cursor += 1;
            if acked.contains(&position) {
                continue;
            }
            let resolved = state.resolve(entry, resolve_links);
            if let Some(id) = resolved.ack_id() {
                self.in_flight.insert(id, position);
            }
            return Some(SessionEvent::Delivered(resolved));
        }
        None
    }
}

#[tonic::async_trait]
impl PersistentSession for MemorySession {
    async fn next(&mut self) -> SessionEvent {
        loop {
            if let Some(closed) = &self.closed {
                return SessionEvent::Closed(closed.clone());
            }
            self.changed.borrow_and_update();
            if let Some(event) = self.poll_state() {
                if let SessionEvent::Closed(closed) = &event {
                    self.closed = Some(closed.clone());
                }
                return event;
            }
            if self.changed.changed().await.is_err() {
                let closed = SessionClosed {
                    reason: DropReason::ConnectionClosed,
                    cause: Some(DropCause::Transport("log shut down".into())),
                };
                self.closed = Some(closed.clone());
                return SessionEvent::Closed(closed);
            }
        }
    }

    async fn ack(&mut self, event_id: Uuid) -> Result<(), LogServiceError> {
        let Some(position) = self.in_flight.remove(&event_id) else {
            return Err(LogServiceError::Rejected(format!(
                "{event_id} was not delivered to this session"
            )));
        };
        let mut state = self.shared.lock();
        state.check_available()?;
        if let Some(group) = state.groups.get_mut(&self.key) {
            if position >= group.start && group.acked.insert(position) {
                group.ack_total += 1;
            }
            while group.acked.contains(&group.start) {
                group.acked.remove(&group.start);
                group.start += 1;
            }
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(group) = state.groups.get_mut(&self.key) {
            if group.active.as_ref().is_some_and(|a| a.epoch == self.epoch) {
                group.active = None;
            }
        }
    }
}
