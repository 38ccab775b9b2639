//! Boundary to the external append-only log service.
//!
//! Everything above this module talks to the log through [`LogService`].
//! [`GrpcLogClient`](crate::GrpcLogClient) implements it over the network and
//! [`MemoryLog`](crate::MemoryLog) implements it in-process.

use uuid::Uuid;

use crate::error::LogServiceError;

/// Append precondition on a stream's current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the current version.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last record must be at exactly this version.
    Exact(u64),
}

/// A record proposed for appending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedRecord {
    /// Client-assigned unique id.
    pub event_id: Uuid,
    /// Short type discriminator.
    pub type_tag: String,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// A record as committed to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRecord {
    pub event_id: Uuid,
    /// Stream the record was committed to.
    pub stream_id: String,
    /// Zero-based position within `stream_id`.
    pub version: u64,
    pub type_tag: String,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// A record read from a stream that may contain links.
///
/// For an ordinary record `event` is set and `link` is `None`. For a link
/// record (e.g. on a category stream) `link` is the link itself and `event`
/// the original it points to, or `None` if the original no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecord {
    pub event: Option<RecordedRecord>,
    pub link: Option<RecordedRecord>,
}

impl ResolvedRecord {
    /// Wrap a plain, non-link record.
    pub fn plain(event: RecordedRecord) -> Self {
        Self {
            event: Some(event),
            link: None,
        }
    }

    /// The record as positioned in the stream that was read: the link if
    /// there is one, otherwise the event.
    pub fn original_position(&self) -> Option<&RecordedRecord> {
        self.link.as_ref().or(self.event.as_ref())
    }

    /// Id to acknowledge for this delivery.
    ///
    /// Persistent subscriptions track the record in the subscribed stream,
    /// which is the link when one exists.
    pub fn ack_id(&self) -> Option<Uuid> {
        self.original_position().map(|r| r.event_id)
    }
}

/// Outcome of a conditional append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// All records were committed; `next_version` is the version of the last one.
    Success { next_version: u64 },
    /// The expected version did not hold. `current` is the stream's actual
    /// last version, `None` if the stream does not exist.
    VersionConflict { current: Option<u64> },
    /// Any other refusal (stream deleted, access denied, ...).
    Failed { reason: String },
}

/// Status of a forward read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// One page of a forward read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSlice {
    pub status: ReadStatus,
    pub records: Vec<ResolvedRecord>,
    /// Version to continue reading from.
    pub next_version: u64,
    /// Version of the stream's last record, if any.
    pub last_version: Option<u64>,
    /// `true` when this page reaches the end of the stream.
    pub end_of_stream: bool,
}

/// Delivery policy of a persistent subscription group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStrategy {
    DispatchToSingle,
    RoundRobin,
    /// Each source stream is delivered to one consumer at a time.
    Pinned,
}

/// Settings applied when creating or updating a subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// Deliver the original record behind each link.
    pub resolve_links: bool,
    /// New groups start at the first record rather than the tail.
    pub start_from_beginning: bool,
    pub strategy: ConsumerStrategy,
    /// Acknowledgements collected before the checkpoint is written.
    pub min_checkpoint_count: u32,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_links: true,
            start_from_beginning: true,
            strategy: ConsumerStrategy::Pinned,
            min_checkpoint_count: 1,
        }
    }
}

/// Outcome of creating or updating a subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Done,
    /// Create was refused because the group exists.
    AlreadyExists,
    /// Update was refused because the group does not exist.
    NotFound,
    Failed { reason: String },
}

/// Why a persistent subscription session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Unknown,
    UserInitiated,
    NotAuthenticated,
    AccessDenied,
    SubscribingError,
    ServerError,
    ConnectionClosed,
    CatchUpError,
    ProcessingQueueOverflow,
    EventHandlerException,
    MaxSubscribersReached,
    PersistentSubscriptionDeleted,
    NotFound,
}

/// Underlying fault attached to a drop notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropCause {
    /// The connection to the log service failed.
    Transport(String),
    /// The log service reported an error.
    Server(String),
}

impl DropCause {
    /// Returns `true` for transport-level faults.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl std::fmt::Display for DropCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Server(msg) => write!(f, "server: {msg}"),
        }
    }
}

/// Closure notification of a persistent subscription session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosed {
    pub reason: DropReason,
    pub cause: Option<DropCause>,
}

/// Next thing a persistent session yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Delivered(ResolvedRecord),
    Closed(SessionClosed),
}

/// An attached persistent subscription session.
///
/// Records arrive one at a time in commit order of the source stream. Each
/// must be acknowledged to advance the group's checkpoint. After
/// [`SessionEvent::Closed`] the session yields nothing further.
#[tonic::async_trait]
pub trait PersistentSession: Send {
    /// Wait for the next delivery or the closure notification.
    async fn next(&mut self) -> SessionEvent;

    /// Acknowledge a delivered record by its [`ack_id`](ResolvedRecord::ack_id).
    async fn ack(&mut self, event_id: Uuid) -> Result<(), LogServiceError>;
}

/// Capabilities required from the log service.
#[tonic::async_trait]
pub trait LogService: Send + Sync + 'static {
    /// Atomically append `records` if `expected` holds.
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        records: Vec<ProposedRecord>,
    ) -> Result<AppendOutcome, LogServiceError>;

    /// Read up to `max_count` records starting at `from_version`.
    async fn read_forward(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: u32,
        resolve_links: bool,
    ) -> Result<ReadSlice, LogServiceError>;

    async fn create_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError>;

    async fn update_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError>;

    /// Attach to an existing subscription group.
    async fn subscribe(
        &self,
        stream_id: &str,
        group: &str,
    ) -> Result<Box<dyn PersistentSession>, LogServiceError>;
}
