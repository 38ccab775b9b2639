//! gRPC implementation of [`LogService`] over the `logstore.v1` protocol.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Code;
use tonic::codegen::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use uuid::Uuid;

use crate::auth::{Credentials, CredentialsInterceptor};
use crate::error::LogServiceError;
use crate::proto;
use crate::proto::log_store_client::LogStoreClient;
use crate::service::{
    AppendOutcome, ConsumerStrategy, DropCause, DropReason, ExpectedVersion, LogService,
    PersistentSession, ProposedRecord, ProvisionOutcome, ReadSlice, ReadStatus, RecordedRecord,
    ResolvedRecord, SessionClosed, SessionEvent, SubscriptionSettings,
};

/// Timeout for establishing the channel in [`GrpcLogClient::connect`].
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outgoing request buffer of a persistent session.
const SESSION_BUFFER: usize = 32;

type Transport = LogStoreClient<InterceptedService<Channel, CredentialsInterceptor>>;

/// Convert an [`ExpectedVersion`] into its wire form.
pub fn expected_version_to_proto(expected: ExpectedVersion) -> proto::ExpectedVersion {
    let kind = match expected {
        ExpectedVersion::Any => proto::expected_version::Kind::Any(proto::Empty {}),
        ExpectedVersion::NoStream => proto::expected_version::Kind::NoStream(proto::Empty {}),
        ExpectedVersion::Exact(v) => proto::expected_version::Kind::Exact(v),
    };
    proto::ExpectedVersion { kind: Some(kind) }
}

/// Convert a [`ProposedRecord`] into the wire `ProposedEvent`.
pub fn to_proto_event(record: &ProposedRecord) -> proto::ProposedEvent {
    proto::ProposedEvent {
        event_id: record.event_id.to_string(),
        event_type: record.type_tag.clone(),
        payload: record.payload.clone(),
        metadata: record.metadata.clone(),
    }
}

fn settings_to_proto(settings: &SubscriptionSettings) -> proto::SubscriptionSettings {
    let strategy = match settings.strategy {
        ConsumerStrategy::DispatchToSingle => proto::ConsumerStrategy::DispatchToSingle,
        ConsumerStrategy::RoundRobin => proto::ConsumerStrategy::RoundRobin,
        ConsumerStrategy::Pinned => proto::ConsumerStrategy::Pinned,
    };
    proto::SubscriptionSettings {
        resolve_links: settings.resolve_links,
        start_from_beginning: settings.start_from_beginning,
        strategy: strategy as i32,
        min_checkpoint_count: settings.min_checkpoint_count,
    }
}

fn recorded_from_proto(event: proto::RecordedEvent) -> Result<RecordedRecord, LogServiceError> {
    let event_id = Uuid::parse_str(&event.event_id)
        .map_err(|e| LogServiceError::Protocol(format!("invalid event id {}: {e}", event.event_id)))?;
    Ok(RecordedRecord {
        event_id,
        stream_id: event.stream_id,
        version: event.stream_version,
        type_tag: event.event_type,
        payload: event.payload,
        metadata: event.metadata,
    })
}

fn resolved_from_proto(resolved: proto::ResolvedEvent) -> Result<ResolvedRecord, LogServiceError> {
    Ok(ResolvedRecord {
        event: resolved.event.map(recorded_from_proto).transpose()?,
        link: resolved.link.map(recorded_from_proto).transpose()?,
    })
}

/// Interpret an `AppendResponse`.
///
/// # Errors
///
/// Returns [`LogServiceError::Protocol`] if the response carries no outcome.
pub fn append_outcome_from_proto(
    response: proto::AppendResponse,
) -> Result<AppendOutcome, LogServiceError> {
    use proto::append_response::Outcome;
    match response.outcome {
        Some(Outcome::Success(s)) => Ok(AppendOutcome::Success {
            next_version: s.next_version,
        }),
        Some(Outcome::WrongExpectedVersion(w)) => Ok(AppendOutcome::VersionConflict {
            current: w.stream_exists.then_some(w.current_version),
        }),
        None => Err(LogServiceError::Protocol("append response without outcome".into())),
    }
}

fn provision_from_proto(response: proto::SubscriptionProvisionResponse) -> ProvisionOutcome {
    match response.status() {
        proto::ProvisionStatus::Success => ProvisionOutcome::Done,
        proto::ProvisionStatus::AlreadyExists => ProvisionOutcome::AlreadyExists,
        proto::ProvisionStatus::NotFound => ProvisionOutcome::NotFound,
        proto::ProvisionStatus::AccessDenied => ProvisionOutcome::Failed {
            reason: format!("access denied: {}", response.reason),
        },
        proto::ProvisionStatus::Failure => ProvisionOutcome::Failed {
            reason: response.reason,
        },
    }
}

fn provision_from_status(status: tonic::Status) -> Result<ProvisionOutcome, LogServiceError> {
    match status.code() {
        Code::AlreadyExists => Ok(ProvisionOutcome::AlreadyExists),
        Code::NotFound => Ok(ProvisionOutcome::NotFound),
        Code::PermissionDenied | Code::InvalidArgument => Ok(ProvisionOutcome::Failed {
            reason: status.message().to_string(),
        }),
        _ => Err(LogServiceError::from_status(status)),
    }
}

/// Map a wire drop reason to [`DropReason`].
pub fn drop_reason_from_proto(reason: proto::DropReason) -> DropReason {
    match reason {
        proto::DropReason::Unknown => DropReason::Unknown,
        proto::DropReason::UserInitiated => DropReason::UserInitiated,
        proto::DropReason::NotAuthenticated => DropReason::NotAuthenticated,
        proto::DropReason::AccessDenied => DropReason::AccessDenied,
        proto::DropReason::SubscribingError => DropReason::SubscribingError,
        proto::DropReason::ServerError => DropReason::ServerError,
        proto::DropReason::ConnectionClosed => DropReason::ConnectionClosed,
        proto::DropReason::CatchUpError => DropReason::CatchUpError,
        proto::DropReason::ProcessingQueueOverflow => DropReason::ProcessingQueueOverflow,
        proto::DropReason::EventHandlerException => DropReason::EventHandlerException,
        proto::DropReason::MaxSubscribersReached => DropReason::MaxSubscribersReached,
        proto::DropReason::PersistentSubscriptionDeleted => {
            DropReason::PersistentSubscriptionDeleted
        }
        proto::DropReason::NotFound => DropReason::NotFound,
    }
}

/// Map an RPC error on a live session stream to a closure notification.
fn closed_from_status(status: &tonic::Status) -> SessionClosed {
    let server = |reason| SessionClosed {
        reason,
        cause: Some(DropCause::Server(status.message().to_string())),
    };
    match status.code() {
        Code::Unauthenticated => server(DropReason::NotAuthenticated),
        Code::PermissionDenied => server(DropReason::AccessDenied),
        Code::NotFound => server(DropReason::NotFound),
        Code::Internal => server(DropReason::ServerError),
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::Cancelled
        | Code::Unknown
        | Code::Aborted
        | Code::ResourceExhausted => SessionClosed {
            reason: DropReason::ConnectionClosed,
            cause: Some(DropCause::Transport(status.to_string())),
        },
        // Definite refusals: InvalidArgument, FailedPrecondition,
        // Unimplemented and the like.
        _ => server(DropReason::Unknown),
    }
}

/// Log service client speaking the `logstore.v1` gRPC protocol.
///
/// Every RPC carries the configured credentials as a Basic `authorization`
/// header. Clone is cheap: the underlying channel is shared.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use eventlog_es::{Credentials, GrpcLogClient};
///
/// let client = GrpcLogClient::connect(
///     "http://127.0.0.1:2113",
///     Some(Credentials::new("admin", "changeit")),
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GrpcLogClient {
    inner: Arc<Transport>,
    authenticated: bool,
}

impl fmt::Debug for GrpcLogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcLogClient")
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

impl GrpcLogClient {
    /// Connect to a log service at `endpoint`.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - URI of the gRPC server (e.g. `"http://127.0.0.1:2113"`).
    /// * `credentials` - Optional username/password sent with every call.
    ///
    /// # Errors
    ///
    /// Returns [`LogServiceError::Connect`] if the channel cannot be
    /// established within the connect timeout.
    pub async fn connect(
        endpoint: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self, LogServiceError> {
        let channel = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await?;
        Self::from_channel(channel, credentials.as_ref())
    }

    /// Build a client whose channel connects on first use.
    ///
    /// # Errors
    ///
    /// Returns [`LogServiceError::Connect`] if `endpoint` is not a valid URI.
    pub fn connect_lazy(
        endpoint: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self, LogServiceError> {
        let channel = Endpoint::from_shared(endpoint.to_string())?.connect_lazy();
        Self::from_channel(channel, credentials.as_ref())
    }

    fn from_channel(
        channel: Channel,
        credentials: Option<&Credentials>,
    ) -> Result<Self, LogServiceError> {
        let interceptor =
            CredentialsInterceptor::new(credentials).map_err(LogServiceError::from_status)?;
        Ok(Self {
            inner: Arc::new(LogStoreClient::with_interceptor(channel, interceptor)),
            authenticated: credentials.is_some_and(|c| !c.username.is_empty()),
        })
    }

    fn client(&self) -> Transport {
        (*self.inner).clone()
    }
}

#[tonic::async_trait]
impl LogService for GrpcLogClient {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        records: Vec<ProposedRecord>,
    ) -> Result<AppendOutcome, LogServiceError> {
        let request = proto::AppendRequest {
            stream_id: stream_id.to_string(),
            expected_version: Some(expected_version_to_proto(expected)),
            events: records.iter().map(to_proto_event).collect(),
        };
        match self.client().append(request).await {
            Ok(response) => append_outcome_from_proto(response.into_inner()),
            Err(status) if status.code() == Code::FailedPrecondition => {
                Ok(AppendOutcome::VersionConflict { current: None })
            }
            Err(status)
                if matches!(
                    status.code(),
                    Code::NotFound | Code::PermissionDenied | Code::InvalidArgument
                ) =>
            {
                Ok(AppendOutcome::Failed {
                    reason: status.message().to_string(),
                })
            }
            Err(status) => Err(LogServiceError::from_status(status)),
        }
    }

    async fn read_forward(
        &self,
        stream_id: &str,
        from_version: u64,
        max_count: u32,
        resolve_links: bool,
    ) -> Result<ReadSlice, LogServiceError> {
        let request = proto::ReadStreamRequest {
            stream_id: stream_id.to_string(),
            from_version,
            max_count,
            resolve_links,
        };
        let response = match self.client().read_stream(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::NotFound => {
                return Ok(ReadSlice {
                    status: ReadStatus::StreamNotFound,
                    records: Vec::new(),
                    next_version: 0,
                    last_version: None,
                    end_of_stream: true,
                });
            }
            Err(status) => return Err(LogServiceError::from_status(status)),
        };
        let status = match response.status() {
            proto::ReadStatus::Success => ReadStatus::Success,
            proto::ReadStatus::StreamNotFound => ReadStatus::StreamNotFound,
            proto::ReadStatus::StreamDeleted => ReadStatus::StreamDeleted,
        };
        let records = response
            .events
            .into_iter()
            .map(resolved_from_proto)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ReadSlice {
            status,
            records,
            next_version: response.next_version,
            last_version: u64::try_from(response.last_version).ok(),
            end_of_stream: response.end_of_stream,
        })
    }

    async fn create_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError> {
        let request = proto::PersistentSubscriptionRequest {
            stream_id: stream_id.to_string(),
            group: group.to_string(),
            settings: Some(settings_to_proto(settings)),
        };
        match self.client().create_persistent_subscription(request).await {
            Ok(response) => Ok(provision_from_proto(response.into_inner())),
            Err(status) => provision_from_status(status),
        }
    }

    async fn update_subscription(
        &self,
        stream_id: &str,
        group: &str,
        settings: &SubscriptionSettings,
    ) -> Result<ProvisionOutcome, LogServiceError> {
        let request = proto::PersistentSubscriptionRequest {
            stream_id: stream_id.to_string(),
            group: group.to_string(),
            settings: Some(settings_to_proto(settings)),
        };
        match self.client().update_persistent_subscription(request).await {
            Ok(response) => Ok(provision_from_proto(response.into_inner())),
            Err(status) => provision_from_status(status),
        }
    }

    async fn subscribe(
        &self,
        stream_id: &str,
        group: &str,
    ) -> Result<Box<dyn PersistentSession>, LogServiceError> {
        let (requests, rx) = mpsc::channel(SESSION_BUFFER);
        let options = proto::ReadPersistentRequest {
            content: Some(proto::read_persistent_request::Content::Options(
                proto::read_persistent_request::Options {
                    stream_id: stream_id.to_string(),
                    group: group.to_string(),
                    buffer_size: SESSION_BUFFER as u32,
                },
            )),
        };
        requests
            .send(options)
            .await
            .map_err(|_| LogServiceError::Protocol("session request channel closed".into()))?;
        let responses = self
            .client()
            .read_persistent(ReceiverStream::new(rx))
            .await
            .map_err(LogServiceError::from_status)?
            .into_inner();
        Ok(Box::new(GrpcSession {
            requests,
            responses,
            closed: None,
        }))
    }
}

/// A `ReadPersistent` bidirectional stream.
struct GrpcSession {
    requests: mpsc::Sender<proto::ReadPersistentRequest>,
    responses: tonic::Streaming<proto::ReadPersistentResponse>,
    closed: Option<SessionClosed>,
}

impl GrpcSession {
    fn close(&mut self, closed: SessionClosed) -> SessionEvent {
        self.closed = Some(closed.clone());
        SessionEvent::Closed(closed)
    }
}

#[tonic::async_trait]
impl PersistentSession for GrpcSession {
    async fn next(&mut self) -> SessionEvent {
        use proto::read_persistent_response::Content;

        loop {
            if let Some(closed) = &self.closed {
                return SessionEvent::Closed(closed.clone());
            }
            let response = match self.responses.message().await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    return self.close(SessionClosed {
                        reason: DropReason::ConnectionClosed,
                        cause: Some(DropCause::Transport("stream ended".into())),
                    });
                }
                Err(status) => return self.close(closed_from_status(&status)),
            };
            match response.content {
                Some(Content::Confirmation(c)) => {
                    tracing::debug!(subscription_id = %c.subscription_id, "persistent session confirmed");
                }
                Some(Content::Event(delivered)) => {
                    let Some(resolved) = delivered.event else {
                        continue;
                    };
                    match resolved_from_proto(resolved) {
                        Ok(record) => return SessionEvent::Delivered(record),
                        Err(e) => {
                            return self.close(SessionClosed {
                                reason: DropReason::ServerError,
                                cause: Some(DropCause::Server(e.to_string())),
                            });
                        }
                    }
                }
                Some(Content::Dropped(dropped)) => {
                    let reason = drop_reason_from_proto(dropped.reason());
                    let cause = (!dropped.message.is_empty())
                        .then(|| DropCause::Server(dropped.message.clone()));
                    return self.close(SessionClosed { reason, cause });
                }
                None => {}
            }
        }
    }

    async fn ack(&mut self, event_id: Uuid) -> Result<(), LogServiceError> {
        let request = proto::ReadPersistentRequest {
            content: Some(proto::read_persistent_request::Content::Ack(
                proto::read_persistent_request::Ack {
                    event_ids: vec![event_id.to_string()],
                },
            )),
        };
        self.requests.send(request).await.map_err(|_| {
            LogServiceError::Transport(tonic::Status::unavailable("persistent session closed"))
        })
    }
}
