//! Persistent subscription consumer with automatic re-attachment.
//!
//! A [`Subscriber`] provisions a pinned subscription group on an entity
//! type's category stream, attaches to it, and for every delivered record:
//! decodes it, fans it out to the handlers registered for its kind, and
//! acknowledges it exactly once after dispatch. Session drops with a
//! recoverable reason (or a transport fault) lead back to attaching; any
//! other drop, and any handler error, terminates the consumer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::codec::{self, DomainEvent, EventRegistry, Metadata, qualified_kind};
use crate::error::{CodecError, ConsumerError, HandlerError, LogServiceError};
use crate::gateway::{LogGateway, category_stream};
use crate::service::{
    DropCause, DropReason, PersistentSession, RecordedRecord, ResolvedRecord, SessionClosed,
    SessionEvent,
};

/// A decoded event together with its owning entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<Ev> {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub event: Ev,
}

/// Receives envelopes of the kinds it was registered for.
///
/// Returning an error terminates the whole consumer without acknowledging
/// the record, so it will be redelivered once the consumer is restarted.
/// Handlers must tolerate redelivery.
///
/// Plain closures `FnMut(&Envelope<Ev>) -> Result<(), HandlerError>`
/// implement this trait.
#[tonic::async_trait]
pub trait EventHandler<Ev>: Send + 'static {
    async fn handle(&mut self, envelope: &Envelope<Ev>) -> Result<(), HandlerError>;
}

#[tonic::async_trait]
impl<Ev, F> EventHandler<Ev> for F
where
    Ev: Send + Sync + 'static,
    F: FnMut(&Envelope<Ev>) -> Result<(), HandlerError> + Send + 'static,
{
    async fn handle(&mut self, envelope: &Envelope<Ev>) -> Result<(), HandlerError> {
        (self)(envelope)
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not attached: not started yet, or stopped by shutdown.
    Detached,
    /// Provisioning the group and attaching a session.
    Attaching,
    /// Receiving records.
    Attached,
    /// Stopped by a fatal fault.
    Terminated,
}

/// Returns `true` if a session closed for `reason` should be re-attached.
///
/// Transport faults are always recoverable. Otherwise only connection
/// closure, server errors, subscribing errors and catch-up errors are.
pub fn is_recoverable(reason: DropReason, transport_fault: bool) -> bool {
    transport_fault
        || matches!(
            reason,
            DropReason::ConnectionClosed
                | DropReason::ServerError
                | DropReason::SubscribingError
                | DropReason::CatchUpError
        )
}

/// Re-attachment tuning.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventlog_es::ConsumerConfig;
///
/// let config = ConsumerConfig {
///     reattach_base_delay: Duration::ZERO,
///     ..ConsumerConfig::default()
/// };
/// assert_eq!(config.reattach_max_delay, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// First delay before re-attaching; doubled per consecutive attempt up to
    /// [`reattach_max_delay`](ConsumerConfig::reattach_max_delay). Reset after
    /// a record is processed. Zero re-attaches immediately.
    ///
    /// Default: 1 second.
    pub reattach_base_delay: Duration,

    /// Maximum delay between re-attach attempts.
    ///
    /// Default: 30 seconds.
    pub reattach_max_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            reattach_base_delay: Duration::from_secs(1),
            reattach_max_delay: Duration::from_secs(30),
        }
    }
}

type Handlers<Ev> = HashMap<String, Vec<Box<dyn EventHandler<Ev>>>>;
type UnknownHook = Box<dyn FnMut(&RecordedRecord, Option<&Metadata>) + Send>;
type HandlingHook<Ev> = Box<dyn FnMut(&Envelope<Ev>) + Send>;

fn log_unknown(record: &RecordedRecord, metadata: Option<&Metadata>) {
    match metadata {
        Some(metadata) => tracing::warn!(
            stream_id = %record.stream_id,
            version = record.version,
            kind = %metadata.event_kind,
            entity_type = %metadata.entity_type,
            "no decoder for record; acknowledging"
        ),
        None => tracing::warn!(
            stream_id = %record.stream_id,
            version = record.version,
            type_tag = %record.type_tag,
            "record has no readable metadata; acknowledging"
        ),
    }
}

fn log_handling<Ev>(envelope: &Envelope<Ev>) {
    tracing::debug!(
        entity_type = %envelope.entity_type,
        entity_id = %envelope.entity_id,
        "handling event"
    );
}

/// Configures a [`Subscriber`].
///
/// # Examples
///
/// ```no_run
/// # use eventlog_es::{DomainEvent, Envelope, HandlerError, LogGateway, SubscriberBuilder};
/// # fn example<Ev: DomainEvent + std::fmt::Debug>(gateway: LogGateway) {
/// let subscriber = SubscriberBuilder::<Ev>::new(gateway, "Counter", "projector")
///     .on("Incremented", |envelope: &Envelope<Ev>| -> Result<(), HandlerError> {
///         println!("{:?}", envelope.event);
///         Ok(())
///     })
///     .build();
/// # }
/// ```
pub struct SubscriberBuilder<Ev> {
    gateway: LogGateway,
    entity_type: String,
    group: String,
    registry: EventRegistry<Ev>,
    handlers: Handlers<Ev>,
    on_unknown: UnknownHook,
    on_handling: HandlingHook<Ev>,
    config: ConsumerConfig,
}

impl<Ev: DomainEvent> SubscriberBuilder<Ev> {
    /// Consumer of `entity_type`'s category stream under `group`.
    pub fn new(gateway: LogGateway, entity_type: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            gateway,
            entity_type: entity_type.into(),
            group: group.into(),
            registry: EventRegistry::for_event(),
            handlers: HashMap::new(),
            on_unknown: Box::new(log_unknown),
            on_handling: Box::new(log_handling::<Ev>),
            config: ConsumerConfig::default(),
        }
    }

    /// Register `handler` for the variant tagged `tag` of `Ev`.
    pub fn on(self, tag: &str, handler: impl EventHandler<Ev>) -> Self {
        self.on_kind(qualified_kind(Ev::NAMESPACE, tag), handler)
    }
}

impl<Ev> SubscriberBuilder<Ev> {
    /// Register `handler` for a fully qualified kind identifier.
    ///
    /// Several handlers may share a kind; they run in registration order.
    pub fn on_kind(mut self, kind: impl Into<String>, handler: impl EventHandler<Ev>) -> Self {
        self.handlers
            .entry(kind.into())
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Replace the decoder registry.
    pub fn registry(mut self, registry: EventRegistry<Ev>) -> Self {
        self.registry = registry;
        self
    }

    /// Called for records this consumer cannot decode: unknown kind,
    /// a different entity type, or metadata that does not parse (`None`).
    /// The record is acknowledged afterwards.
    pub fn on_unknown(
        mut self,
        hook: impl FnMut(&RecordedRecord, Option<&Metadata>) + Send + 'static,
    ) -> Self {
        self.on_unknown = Box::new(hook);
        self
    }

    /// Called with each envelope before it is dispatched.
    pub fn on_handling(mut self, hook: impl FnMut(&Envelope<Ev>) + Send + 'static) -> Self {
        self.on_handling = Box::new(hook);
        self
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Subscriber<Ev> {
        let (state, _) = watch::channel(ConsumerState::Detached);
        Subscriber {
            gateway: self.gateway,
            stream_id: category_stream(&self.entity_type),
            entity_type: self.entity_type,
            group: self.group,
            registry: self.registry,
            handlers: self.handlers,
            on_unknown: self.on_unknown,
            on_handling: self.on_handling,
            config: self.config,
            state,
            shutdown: None,
        }
    }
}

/// How a session ended.
enum SessionOutcome {
    Shutdown,
    Recoverable(SessionClosed),
    Fatal(ConsumerError),
}

/// A persistent subscription consumer.
///
/// Drive it with [`run`](Subscriber::run) or hand it to a background task
/// with [`spawn`](Subscriber::spawn).
pub struct Subscriber<Ev> {
    gateway: LogGateway,
    entity_type: String,
    stream_id: String,
    group: String,
    registry: EventRegistry<Ev>,
    handlers: Handlers<Ev>,
    on_unknown: UnknownHook,
    on_handling: HandlingHook<Ev>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<Ev> fmt::Debug for Subscriber<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("Subscriber")
            .field("stream_id", &self.stream_id)
            .field("group", &self.group)
            .field("handled_kinds", &kinds)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Resolves once shutdown is requested; never if there is no signal.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        let stopped = rx.wait_for(|stop| *stop).await.is_ok();
        if stopped {
            return;
        }
    }
    std::future::pending::<()>().await
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

impl<Ev: Send + Sync + 'static> Subscriber<Ev> {
    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run until a fatal fault.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Attach`] if provisioning or attaching is refused.
    /// - [`ConsumerError::Dropped`] for a non-recoverable session drop.
    /// - [`ConsumerError::Handler`] if a handler fails.
    /// - [`ConsumerError::Codec`] for a record that is neither decodable nor
    ///   of an unknown kind.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        let span = tracing::info_span!(
            "consumer",
            stream_id = %self.stream_id,
            group = %self.group
        );
        self.run_loop().instrument(span).await
    }

    /// Run on a background task.
    pub fn spawn(mut self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_rx);
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());
        ConsumerHandle {
            shutdown_tx: Arc::new(shutdown_tx),
            state,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    async fn run_loop(&mut self) -> Result<(), ConsumerError> {
        let mut delay = self.config.reattach_base_delay;

        loop {
            self.set_state(ConsumerState::Attaching);
            let attached = match self.gateway.ensure_subscription(&self.stream_id, &self.group).await {
                Ok(()) => {
                    self.gateway
                        .attach_consumer(&self.stream_id, &self.group)
                        .await
                }
                Err(e) => Err(e),
            };

            match attached {
                Ok(session) => {
                    self.set_state(ConsumerState::Attached);
                    tracing::info!("persistent subscription attached");
                    match self.consume(session, &mut delay).await {
                        SessionOutcome::Shutdown => {
                            self.set_state(ConsumerState::Detached);
                            tracing::info!("consumer stopped");
                            return Ok(());
                        }
                        SessionOutcome::Recoverable(closed) => {
                            tracing::warn!(
                                reason = ?closed.reason,
                                cause = ?closed.cause,
                                "subscription dropped, re-attaching"
                            );
                        }
                        SessionOutcome::Fatal(e) => {
                            tracing::error!(error = %e, "consumer terminated");
                            self.set_state(ConsumerState::Terminated);
                            return Err(e);
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "attach failed, will retry");
                }
                Err(e) => {
                    tracing::error!(error = %e, "attach failed");
                    self.set_state(ConsumerState::Terminated);
                    return Err(ConsumerError::Attach(e));
                }
            }

            tokio::select! {
                _ = pause(delay) => {}
                _ = shutdown_requested(&mut self.shutdown) => {
                    self.set_state(ConsumerState::Detached);
                    tracing::info!("consumer stopped");
                    return Ok(());
                }
            }
            delay = (delay * 2).min(self.config.reattach_max_delay);
        }
    }

    /// Process deliveries until the session ends.
    ///
    /// Takes the session by value so it is released before re-attaching.
    async fn consume(
        &mut self,
        mut session: Box<dyn PersistentSession>,
        delay: &mut Duration,
    ) -> SessionOutcome {
        loop {
            let event = tokio::select! {
                event = session.next() => event,
                _ = shutdown_requested(&mut self.shutdown) => return SessionOutcome::Shutdown,
            };

            let record = match event {
                SessionEvent::Delivered(record) => record,
                SessionEvent::Closed(closed) => {
                    let transport_fault = closed.cause.as_ref().is_some_and(DropCause::is_transport);
                    if is_recoverable(closed.reason, transport_fault) {
                        return SessionOutcome::Recoverable(closed);
                    }
                    return SessionOutcome::Fatal(ConsumerError::Dropped {
                        reason: closed.reason,
                        cause: closed.cause.map(|c| c.to_string()),
                    });
                }
            };

            if let Err(e) = self.dispatch(&record).await {
                return SessionOutcome::Fatal(e);
            }

            let Some(ack_id) = record.ack_id() else {
                continue;
            };
            match session.ack(ack_id).await {
                Ok(()) => *delay = self.config.reattach_base_delay,
                Err(LogServiceError::Transport(status)) => {
                    return SessionOutcome::Recoverable(SessionClosed {
                        reason: DropReason::ConnectionClosed,
                        cause: Some(DropCause::Transport(status.to_string())),
                    });
                }
                Err(e) => return SessionOutcome::Fatal(ConsumerError::Ack(e)),
            }
        }
    }

    /// Decode one record and run its handlers.
    async fn dispatch(&mut self, record: &ResolvedRecord) -> Result<(), ConsumerError> {
        let Some(event) = &record.event else {
            tracing::debug!(
                link = ?record.link.as_ref().map(|l| l.version),
                "link target no longer resolves; acknowledging"
            );
            return Ok(());
        };

        let metadata = match codec::decode_metadata(&event.metadata) {
            Ok(metadata) => metadata,
            Err(_) => {
                (self.on_unknown)(event, None);
                return Ok(());
            }
        };
        if metadata.entity_type != self.entity_type {
            (self.on_unknown)(event, Some(&metadata));
            return Ok(());
        }
        let decoded = match codec::decode(&self.registry, &event.payload, &event.metadata) {
            Ok((decoded, _)) => decoded,
            Err(CodecError::UnknownEventKind(_)) => {
                (self.on_unknown)(event, Some(&metadata));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let envelope = Envelope {
            entity_type: metadata.entity_type,
            entity_id: metadata.entity_id,
            event: decoded,
        };
        (self.on_handling)(&envelope);

        let kind = metadata.event_kind;
        if let Some(handlers) = self.handlers.get_mut(&kind) {
            for handler in handlers.iter_mut() {
                handler
                    .handle(&envelope)
                    .await
                    .map_err(|source| ConsumerError::Handler {
                        kind: kind.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }
}

/// Handle to a consumer running on a background task.
///
/// Dropping the handle does **not** stop the consumer. `Clone` is cheap.
#[derive(Clone)]
pub struct ConsumerHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConsumerState>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), ConsumerError>>>>>,
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConsumerHandle {
    /// Current state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver for waiting on state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Wait for the consumer to finish on its own.
    ///
    /// Returns `Ok(())` immediately if the task was already joined.
    ///
    /// # Errors
    ///
    /// Returns the fault that terminated the consumer, or
    /// [`ConsumerError::TaskFailed`] if the task panicked.
    pub async fn join(&self) -> Result<(), ConsumerError> {
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| ConsumerError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }

    /// Stop the consumer after the record in flight and wait for it.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns the fault if the consumer had already terminated.
    pub async fn shutdown(&self) -> Result<(), ConsumerError> {
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }
}
