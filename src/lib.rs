//! Event-sourced entities and checkpointed persistent subscriptions over an
//! append-only event log service.

mod auth;
pub use auth::Credentials;
mod client;
pub use client::GrpcLogClient;
mod codec;
pub use codec::{
    DomainEvent, EncodedEvent, EventRegistry, Metadata, decode, decode_metadata, encode,
    qualified_kind,
};
mod entity;
pub use entity::{Entity, decide, fold};
mod error;
mod gateway;
mod memory;

/// Wire messages and client stub generated from `proto/logstore.proto`.
pub mod proto {
    tonic::include_proto!("logstore.v1");
}

mod repository;
mod service;
mod store;
mod subscriber;

pub use error::{
    CodecError, ConsumerError, DecideError, GatewayError, HandlerError, LogServiceError,
    RepositoryError,
};
pub use gateway::{
    ANY_VERSION, DEFAULT_READ_PAGE_SIZE, EventsWithVersion, LogGateway, NO_STREAM,
    category_stream, entity_stream,
};
pub use memory::MemoryLog;
pub use repository::{Repository, VersionedEntity};
pub use service::{
    AppendOutcome, ConsumerStrategy, DropCause, DropReason, ExpectedVersion, LogService,
    PersistentSession, ProposedRecord, ProvisionOutcome, ReadSlice, ReadStatus, RecordedRecord,
    ResolvedRecord, SessionClosed, SessionEvent, SubscriptionSettings,
};
pub use store::{EventStore, EventStoreBuilder};
pub use subscriber::{
    ConsumerConfig, ConsumerHandle, ConsumerState, Envelope, EventHandler, Subscriber,
    SubscriberBuilder, is_recoverable,
};
