//! Crate-level error types for encoding, log access, command handling and
//! subscription consumption.

use crate::service::DropReason;

/// Error raised by a subscription handler.
///
/// Handlers are user code, so any error type is accepted as long as it can
/// cross task boundaries.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a [`LogService`](crate::LogService) implementation.
#[derive(Debug, thiserror::Error)]
pub enum LogServiceError {
    /// The channel to the log service could not be established.
    #[error("failed to connect to log service: {0}")]
    Connect(#[from] tonic::transport::Error),

    /// The transport to the log service failed (connection refused, reset,
    /// deadline exceeded).
    #[error("log service transport error: {0}")]
    Transport(tonic::Status),

    /// The log service is reachable but refused to serve the call.
    #[error("log service rejected the call: {0}")]
    Rejected(String),

    /// The log service answered with a response this client cannot interpret.
    #[error("unexpected log service response: {0}")]
    Protocol(String),
}

impl LogServiceError {
    /// Classify an RPC status as a transport fault or a definite rejection.
    pub fn from_status(status: tonic::Status) -> Self {
        use tonic::Code;
        match status.code() {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Cancelled
            | Code::Unknown
            | Code::Aborted
            | Code::ResourceExhausted => Self::Transport(status),
            _ => Self::Rejected(format!("{:?}: {}", status.code(), status.message())),
        }
    }
}

/// Error produced while encoding or decoding an event envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The persisted kind identifier does not resolve to a registered schema.
    ///
    /// Readers and subscribers treat this as "skip", never as fatal.
    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),

    /// The payload bytes did not parse against the resolved schema.
    #[error("malformed payload for event kind {kind}: {source}")]
    MalformedPayload {
        /// Kind identifier the payload was decoded against.
        kind: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The metadata bytes are not a valid envelope metadata document.
    #[error("malformed event metadata: {0}")]
    MalformedMetadata(#[source] serde_json::Error),

    /// The event value did not serialize to a `{"type": .., "data": ..}` shape.
    #[error("event does not serialize to a tagged variant")]
    NotTagged,

    /// Serialization of the event value failed.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Error returned by the [`LogGateway`](crate::LogGateway).
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The stream was not at the expected version when appending.
    #[error("concurrency conflict on {stream_id}: expected version {expected}")]
    ConcurrencyConflict {
        /// Stream the append targeted.
        stream_id: String,
        /// Expected version supplied by the caller.
        expected: i64,
    },

    /// Any other non-success append outcome.
    #[error("append to {stream_id} failed: {reason}")]
    AppendFailed { stream_id: String, reason: String },

    /// A forward read could not be completed or decoded.
    #[error("read of {stream_id} failed: {reason}")]
    ReadFailed { stream_id: String, reason: String },

    /// Creating or updating a persistent subscription group failed.
    #[error("provisioning group {group} on {stream_id} failed: {reason}")]
    ProvisioningFailed {
        stream_id: String,
        group: String,
        reason: String,
    },

    /// Attaching a session to a subscription group failed.
    #[error("attaching to group {group} on {stream_id} failed: {source}")]
    AttachFailed {
        stream_id: String,
        group: String,
        source: LogServiceError,
    },

    /// An event could not be encoded for appending.
    #[error(transparent)]
    Encode(#[from] CodecError),

    /// The underlying log service call failed.
    #[error(transparent)]
    Service(#[from] LogServiceError),
}

impl GatewayError {
    /// Returns `true` when the failure came from the transport rather than a
    /// definite answer from the log service.
    ///
    /// Used by the subscription consumer to decide whether an attach attempt
    /// is worth repeating.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service(source) | Self::AttachFailed { source, .. } => matches!(
                source,
                LogServiceError::Transport(_) | LogServiceError::Connect(_)
            ),
            _ => false,
        }
    }
}

/// Error returned by [`Entity::decide`](crate::Entity::decide).
#[derive(Debug, thiserror::Error)]
pub enum DecideError<E: std::error::Error + Send + Sync + 'static> {
    /// The entity type cannot interpret this command.
    #[error("{entity_type} does not support command {command}")]
    UnsupportedCommand {
        entity_type: &'static str,
        command: String,
    },

    /// The command was understood but rejected by domain rules.
    #[error(transparent)]
    Rejected(E),
}

/// Error returned by [`Repository`](crate::Repository) operations.
///
/// Generic over `E`, the entity's domain error type.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError<E: std::error::Error + Send + Sync + 'static> {
    /// The entity type cannot interpret this command.
    #[error("{entity_type} does not support command {command}")]
    UnsupportedCommand {
        entity_type: &'static str,
        command: String,
    },

    /// Command rejected by entity logic.
    #[error(transparent)]
    Rejected(E),

    /// Another writer committed to the stream between read and append.
    ///
    /// Never retried by the repository.
    #[error("concurrency conflict on {stream_id}: expected version {expected}")]
    ConcurrencyConflict { stream_id: String, expected: i64 },

    /// Any other log failure.
    #[error(transparent)]
    Gateway(GatewayError),
}

impl<E: std::error::Error + Send + Sync + 'static> RepositoryError<E> {
    /// Returns `true` for an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<DecideError<E>> for RepositoryError<E> {
    fn from(err: DecideError<E>) -> Self {
        match err {
            DecideError::UnsupportedCommand {
                entity_type,
                command,
            } => Self::UnsupportedCommand {
                entity_type,
                command,
            },
            DecideError::Rejected(e) => Self::Rejected(e),
        }
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<GatewayError> for RepositoryError<E> {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::ConcurrencyConflict {
                stream_id,
                expected,
            } => Self::ConcurrencyConflict {
                stream_id,
                expected,
            },
            other => Self::Gateway(other),
        }
    }
}

/// Error that terminates a subscription consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// The subscription group could not be provisioned or attached.
    #[error("subscription attach failed: {0}")]
    Attach(#[source] GatewayError),

    /// A registered handler failed; the record was not acknowledged.
    #[error("handler for {kind} failed: {source}")]
    Handler { kind: String, source: HandlerError },

    /// A delivered record could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Acknowledging a processed record failed.
    #[error("acknowledgement failed: {0}")]
    Ack(#[source] LogServiceError),

    /// The session closed for a reason outside the recoverable set.
    #[error("subscription dropped: {reason:?}{}", cause_suffix(.cause))]
    Dropped {
        reason: DropReason,
        cause: Option<String>,
    },

    /// The background consumer task panicked or was cancelled.
    #[error("consumer task failed: {0}")]
    TaskFailed(String),
}

fn cause_suffix(cause: &Option<String>) -> String {
    cause.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
}
