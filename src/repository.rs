//! Repository: create, update and load entities under optimistic concurrency.
//!
//! Every operation re-reads and re-folds the entity's history from the log;
//! no state is cached between calls. Events are decided against the
//! pre-command state, committed, and only then folded locally, so a
//! returned [`VersionedEntity`] never reflects events the log refused.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;

use crate::codec::{self, EncodedEvent, EventRegistry};
use crate::entity::{self, Entity};
use crate::error::{GatewayError, RepositoryError};
use crate::gateway::{LogGateway, NO_STREAM, entity_stream};

/// Entity state tied to the stream version it was folded up to.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedEntity<E> {
    pub id: Uuid,
    /// Version of the last folded record, or [`NO_STREAM`].
    pub version: i64,
    pub entity: E,
}

/// Typed repository for one entity type.
///
/// Obtained from [`EventStore::repository`](crate::EventStore::repository)
/// or built directly over a [`LogGateway`]. Clone is cheap.
///
/// Conflicts are surfaced as [`RepositoryError::ConcurrencyConflict`] and
/// never retried here; callers decide between re-reading and rejecting.
pub struct Repository<E: Entity> {
    gateway: LogGateway,
    registry: Arc<EventRegistry<E::Event>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            registry: Arc::clone(&self.registry),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn encode_all<E: Entity>(id: Uuid, events: &[E::Event]) -> Result<Vec<EncodedEvent>, GatewayError> {
    events
        .iter()
        .map(|e| codec::encode(e, E::ENTITY_TYPE, id).map_err(GatewayError::from))
        .collect()
}

impl<E: Entity> Repository<E> {
    /// Repository decoding the kinds listed by `E::Event`.
    pub fn new(gateway: LogGateway) -> Self {
        Self::with_registry(gateway, EventRegistry::for_event())
    }

    /// Repository decoding with a custom registry (e.g. with legacy kinds).
    pub fn with_registry(gateway: LogGateway, registry: EventRegistry<E::Event>) -> Self {
        Self {
            gateway,
            registry: Arc::new(registry),
            _entity: PhantomData,
        }
    }

    /// Create a new entity from `command`.
    ///
    /// Allocates a fresh id, decides against the initial state, commits with
    /// [`NO_STREAM`] and folds the committed events.
    ///
    /// # Returns
    ///
    /// The new entity. If the command produces no events nothing is written
    /// and the version is [`NO_STREAM`].
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::UnsupportedCommand`] / [`RepositoryError::Rejected`]
    ///   from the entity's decision.
    /// - [`RepositoryError::ConcurrencyConflict`] only on id collision.
    /// - [`RepositoryError::Gateway`] for any log failure.
    pub async fn create(
        &self,
        command: E::Command,
    ) -> Result<VersionedEntity<E>, RepositoryError<E::Error>> {
        let id = Uuid::new_v4();
        let span = tracing::info_span!(
            "entity_command",
            entity_type = E::ENTITY_TYPE,
            entity_id = %id,
            op = "create"
        );
        self.commit_new(id, command).instrument(span).await
    }

    /// Apply `command` to the entity `id`.
    ///
    /// Reads and folds the full history, decides against the resulting
    /// state, and commits with the version just read as precondition.
    ///
    /// # Returns
    ///
    /// The updated entity. If the command produces no events nothing is
    /// written and the freshly loaded entity is returned.
    ///
    /// # Errors
    ///
    /// - [`RepositoryError::ConcurrencyConflict`] if another writer committed
    ///   between the read and the append.
    /// - [`RepositoryError::UnsupportedCommand`] / [`RepositoryError::Rejected`]
    ///   from the entity's decision.
    /// - [`RepositoryError::Gateway`] for any log failure.
    pub async fn update(
        &self,
        id: Uuid,
        command: E::Command,
    ) -> Result<VersionedEntity<E>, RepositoryError<E::Error>> {
        let span = tracing::info_span!(
            "entity_command",
            entity_type = E::ENTITY_TYPE,
            entity_id = %id,
            op = "update"
        );
        self.commit_existing(id, command).instrument(span).await
    }

    /// Rebuild the current state of entity `id` from its history.
    ///
    /// An entity without events loads as the initial state at [`NO_STREAM`].
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Gateway`] if the read fails.
    pub async fn load(&self, id: Uuid) -> Result<VersionedEntity<E>, RepositoryError<E::Error>> {
        let stream_id = entity_stream(E::ENTITY_TYPE, id);
        let history = self.gateway.read_forward(&stream_id, &self.registry).await?;
        Ok(VersionedEntity {
            id,
            version: history.version,
            entity: entity::fold(E::initial_state(), &history.events),
        })
    }

    async fn commit_new(
        &self,
        id: Uuid,
        command: E::Command,
    ) -> Result<VersionedEntity<E>, RepositoryError<E::Error>> {
        let initial = E::initial_state();
        let events = entity::decide(&initial, command)?;
        if events.is_empty() {
            tracing::debug!("command produced no events");
            return Ok(VersionedEntity {
                id,
                version: NO_STREAM,
                entity: initial,
            });
        }

        let stream_id = entity_stream(E::ENTITY_TYPE, id);
        let version = self
            .gateway
            .append(&stream_id, NO_STREAM, encode_all::<E>(id, &events)?)
            .await?;
        tracing::info!(count = events.len(), version, "events appended");

        Ok(VersionedEntity {
            id,
            version,
            entity: entity::fold(initial, &events),
        })
    }

    async fn commit_existing(
        &self,
        id: Uuid,
        command: E::Command,
    ) -> Result<VersionedEntity<E>, RepositoryError<E::Error>> {
        let loaded = self.load(id).await?;
        let events = entity::decide(&loaded.entity, command)?;
        if events.is_empty() {
            tracing::debug!(version = loaded.version, "command produced no events");
            return Ok(loaded);
        }

        let stream_id = entity_stream(E::ENTITY_TYPE, id);
        let version = self
            .gateway
            .append(&stream_id, loaded.version, encode_all::<E>(id, &events)?)
            .await?;
        tracing::info!(count = events.len(), version, "events appended");

        Ok(VersionedEntity {
            id,
            version,
            entity: entity::fold(loaded.entity, &events),
        })
    }
}
