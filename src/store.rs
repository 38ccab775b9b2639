//! Top-level entry point composing the gateway, repositories and
//! subscription consumers into a single [`EventStore`].
//!
//! The store is opened via [`EventStoreBuilder`], which connects to the log
//! service over gRPC, or wraps any other [`LogService`] such as
//! [`MemoryLog`](crate::MemoryLog).

use std::sync::Arc;

use crate::auth::Credentials;
use crate::client::GrpcLogClient;
use crate::entity::Entity;
use crate::error::LogServiceError;
use crate::gateway::{DEFAULT_READ_PAGE_SIZE, LogGateway};
use crate::repository::Repository;
use crate::service::{LogService, SubscriptionSettings};
use crate::subscriber::{ConsumerConfig, SubscriberBuilder};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2113";

/// Access point for repositories and consumers over one log service.
///
/// `Clone` is cheap -- the connection is shared.
#[derive(Clone, Debug)]
pub struct EventStore {
    gateway: LogGateway,
    consumer_config: ConsumerConfig,
}

impl EventStore {
    /// Repository for entity type `E`.
    pub fn repository<E: Entity>(&self) -> Repository<E> {
        Repository::new(self.gateway.clone())
    }

    /// Consumer builder for `E`'s category stream under subscription `group`.
    ///
    /// The builder starts with the store's [`ConsumerConfig`].
    pub fn subscriber<E: Entity>(&self, group: impl Into<String>) -> SubscriberBuilder<E::Event> {
        SubscriberBuilder::new(self.gateway.clone(), E::ENTITY_TYPE, group)
            .config(self.consumer_config.clone())
    }

    /// The underlying gateway.
    pub fn gateway(&self) -> &LogGateway {
        &self.gateway
    }
}

/// Builder for [`EventStore`].
///
/// # Examples
///
/// ```no_run
/// use eventlog_es::{Credentials, EventStoreBuilder};
///
/// # async fn example() -> Result<(), eventlog_es::LogServiceError> {
/// let store = EventStoreBuilder::new()
///     .endpoint("http://127.0.0.1:2113")
///     .credentials(Credentials::new("admin", "changeit"))
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EventStoreBuilder {
    endpoint: Option<String>,
    credentials: Option<Credentials>,
    read_page_size: u32,
    subscription_settings: SubscriptionSettings,
    consumer_config: ConsumerConfig,
}

impl EventStoreBuilder {
    /// Builder with default settings.
    pub fn new() -> Self {
        Self {
            endpoint: None,
            credentials: None,
            read_page_size: DEFAULT_READ_PAGE_SIZE,
            subscription_settings: SubscriptionSettings::default(),
            consumer_config: ConsumerConfig::default(),
        }
    }

    /// Set the gRPC server endpoint URL.
    ///
    /// Defaults to `http://127.0.0.1:2113`.
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Send Basic credentials with every call.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Maximum records requested per read call when replaying a stream.
    pub fn read_page_size(mut self, page_size: u32) -> Self {
        self.read_page_size = page_size;
        self
    }

    /// Settings used when provisioning subscription groups.
    pub fn subscription_settings(mut self, settings: SubscriptionSettings) -> Self {
        self.subscription_settings = settings;
        self
    }

    /// Re-attachment tuning handed to every consumer built from the store.
    pub fn consumer_config(mut self, config: ConsumerConfig) -> Self {
        self.consumer_config = config;
        self
    }

    /// Connect to the configured endpoint and build the store.
    ///
    /// # Errors
    ///
    /// Returns [`LogServiceError::Connect`] if the connection cannot be
    /// established.
    pub async fn open(self) -> Result<EventStore, LogServiceError> {
        let endpoint = self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let client = GrpcLogClient::connect(endpoint, self.credentials.clone()).await?;
        tracing::info!(endpoint, "connected to log service");
        Ok(self.with_service(Arc::new(client)))
    }

    /// Build the store over an existing service.
    pub fn with_service(self, service: Arc<dyn LogService>) -> EventStore {
        let gateway = LogGateway::new(service)
            .with_subscription_settings(self.subscription_settings)
            .with_read_page_size(self.read_page_size);
        EventStore {
            gateway,
            consumer_config: self.consumer_config,
        }
    }
}

impl Default for EventStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
