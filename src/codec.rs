//! Envelope codec: event values plus routing metadata to and from log records.
//!
//! Domain events are serde enums using adjacent tagging
//! (`#[serde(tag = "type", content = "data")]`). The `"type"` tag becomes the
//! record's type tag and the `"data"` content becomes the payload. Routing
//! information travels separately as [`Metadata`], which carries the fully
//! qualified kind identifier used to resolve the payload schema on decode.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

/// A domain event type that can travel through the envelope codec.
///
/// # Contract
///
/// - The type must serialize as an adjacently tagged enum so that the
///   variant name lands under `"type"` and its fields under `"data"`.
/// - [`KINDS`](DomainEvent::KINDS) lists every variant tag; it seeds the
///   default [`EventRegistry`].
///
/// # Examples
///
/// ```
/// use eventlog_es::DomainEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum AccountEvent {
///     Opened { owner: String },
///     Closed,
/// }
///
/// impl DomainEvent for AccountEvent {
///     const NAMESPACE: &'static str = "bank.account";
///     const KINDS: &'static [&'static str] = &["Opened", "Closed"];
/// }
///
/// let event = AccountEvent::Opened { owner: "ada".into() };
/// assert_eq!(event.kind().unwrap(), "bank.account.Opened");
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Prefix that makes the variant tags globally unique.
    const NAMESPACE: &'static str;

    /// Every variant tag this type can decode.
    const KINDS: &'static [&'static str];

    /// Fully qualified kind identifier of this event value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the value does not serialize to a tagged
    /// variant.
    fn kind(&self) -> Result<String, CodecError> {
        let (tag, _) = split_tagged(self)?;
        Ok(qualified_kind(Self::NAMESPACE, &tag))
    }
}

/// Build the fully qualified kind identifier for a variant tag.
pub fn qualified_kind(namespace: &str, tag: &str) -> String {
    format!("{namespace}.{tag}")
}

/// Routing metadata persisted alongside each event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Fully qualified kind identifier (`"{namespace}.{tag}"`).
    pub event_kind: String,
    /// Owning entity type.
    pub entity_type: String,
    /// Owning entity id.
    pub entity_id: Uuid,
}

/// An event encoded for appending: the record shape the log service accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    /// Short discriminator stored as the record's type field.
    pub type_tag: String,
    /// JSON-encoded event content.
    pub payload: Vec<u8>,
    /// JSON-encoded [`Metadata`].
    pub metadata: Vec<u8>,
}

type DecodeFn<Ev> = Arc<dyn Fn(serde_json::Value) -> serde_json::Result<Ev> + Send + Sync>;

/// Explicit mapping from kind identifier to decode function.
///
/// Built once at startup via [`for_event`](EventRegistry::for_event) and
/// optionally extended with [`register`](EventRegistry::register) for
/// persisted kinds that no longer match a current variant tag.
pub struct EventRegistry<Ev> {
    decoders: HashMap<String, DecodeFn<Ev>>,
}

impl<Ev> Clone for EventRegistry<Ev> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
        }
    }
}

impl<Ev> fmt::Debug for EventRegistry<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("EventRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl<Ev: DomainEvent> EventRegistry<Ev> {
    /// Registry resolving every tag in `Ev::KINDS`.
    pub fn for_event() -> Self {
        let mut decoders: HashMap<String, DecodeFn<Ev>> = HashMap::new();
        for tag in Ev::KINDS {
            let kind = qualified_kind(Ev::NAMESPACE, tag);
            let tag = (*tag).to_string();
            let decode: DecodeFn<Ev> =
                Arc::new(move |data| serde_json::from_value(retag(&tag, data)));
            decoders.insert(kind, decode);
        }
        Self { decoders }
    }
}

impl<Ev> EventRegistry<Ev> {
    /// Registry that resolves nothing.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Map an additional kind identifier to a custom decode function.
    ///
    /// The function receives the raw payload value. Use this for renamed
    /// variants or kinds whose persisted shape needs upcasting. Replaces any
    /// existing decoder for the same kind.
    pub fn register<F>(mut self, kind: impl Into<String>, decode: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Result<Ev> + Send + Sync + 'static,
    {
        self.decoders.insert(kind.into(), Arc::new(decode));
        self
    }

    /// Returns `true` if `kind` resolves to a decoder.
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }
}

/// Rebuild the adjacently tagged form from a tag and its payload.
fn retag(tag: &str, data: serde_json::Value) -> serde_json::Value {
    if data.is_null() {
        serde_json::json!({ "type": tag })
    } else {
        serde_json::json!({ "type": tag, "data": data })
    }
}

/// Split an adjacently tagged event into its tag and content.
fn split_tagged<Ev: Serialize>(event: &Ev) -> Result<(String, serde_json::Value), CodecError> {
    let value = serde_json::to_value(event).map_err(CodecError::Encode)?;
    let serde_json::Value::Object(mut map) = value else {
        return Err(CodecError::NotTagged);
    };
    let tag = match map.remove("type") {
        Some(serde_json::Value::String(tag)) => tag,
        _ => return Err(CodecError::NotTagged),
    };
    let data = map.remove("data").unwrap_or(serde_json::Value::Null);
    Ok((tag, data))
}

/// Encode an event and its routing pair into an [`EncodedEvent`].
///
/// # Arguments
///
/// * `event` - The domain event to encode.
/// * `entity_type` - Owning entity type, recorded in the metadata.
/// * `entity_id` - Owning entity id, recorded in the metadata.
///
/// # Errors
///
/// Returns [`CodecError::NotTagged`] if the event is not an adjacently
/// tagged enum, or [`CodecError::Encode`] if serialization fails.
pub fn encode<Ev: DomainEvent>(
    event: &Ev,
    entity_type: &str,
    entity_id: Uuid,
) -> Result<EncodedEvent, CodecError> {
    let (tag, data) = split_tagged(event)?;
    let metadata = Metadata {
        event_kind: qualified_kind(Ev::NAMESPACE, &tag),
        entity_type: entity_type.to_string(),
        entity_id,
    };
    Ok(EncodedEvent {
        payload: serde_json::to_vec(&data).map_err(CodecError::Encode)?,
        metadata: serde_json::to_vec(&metadata).map_err(CodecError::Encode)?,
        type_tag: tag,
    })
}

/// Parse only the metadata of a record.
///
/// # Errors
///
/// Returns [`CodecError::MalformedMetadata`] if the bytes are not a metadata
/// document.
pub fn decode_metadata(metadata: &[u8]) -> Result<Metadata, CodecError> {
    serde_json::from_slice(metadata).map_err(CodecError::MalformedMetadata)
}

/// Decode a record back into a typed event plus its metadata.
///
/// Metadata is parsed first; its kind identifier selects the decoder from
/// `registry`, which then parses the payload.
///
/// # Errors
///
/// - [`CodecError::MalformedMetadata`] if the metadata does not parse.
/// - [`CodecError::UnknownEventKind`] if the kind is not registered.
/// - [`CodecError::MalformedPayload`] if the payload does not parse against
///   the resolved schema.
pub fn decode<Ev>(
    registry: &EventRegistry<Ev>,
    payload: &[u8],
    metadata: &[u8],
) -> Result<(Ev, Metadata), CodecError> {
    let metadata = decode_metadata(metadata)?;
    let decoder = registry
        .decoders
        .get(&metadata.event_kind)
        .ok_or_else(|| CodecError::UnknownEventKind(metadata.event_kind.clone()))?;
    let malformed = |source| CodecError::MalformedPayload {
        kind: metadata.event_kind.clone(),
        source,
    };
    let data: serde_json::Value = if payload.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(payload).map_err(malformed)?
    };
    let event = (decoder.as_ref())(data).map_err(malformed)?;
    Ok((event, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum ShipEvent {
        Launched { name: String, crew: u32 },
        Docked { port: String },
        Scuttled,
    }

    impl DomainEvent for ShipEvent {
        const NAMESPACE: &'static str = "fleet.ship";
        const KINDS: &'static [&'static str] = &["Launched", "Docked", "Scuttled"];
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Untagged {
        name: String,
    }

    impl DomainEvent for Untagged {
        const NAMESPACE: &'static str = "untagged";
        const KINDS: &'static [&'static str] = &[];
    }

    fn id() -> Uuid {
        Uuid::parse_str("6f1c0d5e-2b4a-4c89-9d3e-0a1b2c3d4e5f").unwrap()
    }

    #[test]
    fn encode_splits_tag_payload_and_metadata() {
        let event = ShipEvent::Launched {
            name: "Vasa".into(),
            crew: 150,
        };
        let encoded = encode(&event, "Ship", id()).unwrap();

        assert_eq!(encoded.type_tag, "Launched");
        let payload: serde_json::Value = serde_json::from_slice(&encoded.payload).unwrap();
        assert_eq!(payload, serde_json::json!({"name": "Vasa", "crew": 150}));
        let metadata: Metadata = serde_json::from_slice(&encoded.metadata).unwrap();
        assert_eq!(metadata.event_kind, "fleet.ship.Launched");
        assert_eq!(metadata.entity_type, "Ship");
        assert_eq!(metadata.entity_id, id());
    }

    #[test]
    fn decode_restores_event_and_metadata() {
        let registry = EventRegistry::<ShipEvent>::for_event();
        for event in [
            ShipEvent::Docked {
                port: "Stockholm".into(),
            },
            ShipEvent::Scuttled,
        ] {
            let encoded = encode(&event, "Ship", id()).unwrap();
            let (decoded, metadata) =
                decode(&registry, &encoded.payload, &encoded.metadata).unwrap();
            assert_eq!(decoded, event);
            assert_eq!(
                metadata,
                Metadata {
                    event_kind: event.kind().unwrap(),
                    entity_type: "Ship".into(),
                    entity_id: id(),
                }
            );
        }
    }

    #[test]
    fn unit_variant_encodes_null_payload() {
        let encoded = encode(&ShipEvent::Scuttled, "Ship", id()).unwrap();
        assert_eq!(encoded.payload, b"null");
    }

    #[test]
    fn unknown_kind_is_reported() {
        let registry = EventRegistry::<ShipEvent>::for_event();
        let metadata = serde_json::to_vec(&Metadata {
            event_kind: "fleet.ship.Refitted".into(),
            entity_type: "Ship".into(),
            entity_id: id(),
        })
        .unwrap();
        let err = decode(&registry, b"{}", &metadata).unwrap_err();
        assert!(
            matches!(err, CodecError::UnknownEventKind(ref k) if k == "fleet.ship.Refitted")
        );
    }

    #[test]
    fn malformed_payload_names_kind() {
        let registry = EventRegistry::<ShipEvent>::for_event();
        let encoded = encode(&ShipEvent::Docked { port: "Oslo".into() }, "Ship", id()).unwrap();
        let err = decode(&registry, b"{\"harbour\": 1}", &encoded.metadata).unwrap_err();
        match err {
            CodecError::MalformedPayload { kind, .. } => assert_eq!(kind, "fleet.ship.Docked"),
            other => panic!("expected MalformedPayload, got {other:?}"),
        }

        let err = decode(&registry, b"not json", &encoded.metadata).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload { .. }));
    }

    #[test]
    fn malformed_metadata_is_reported() {
        let registry = EventRegistry::<ShipEvent>::for_event();
        let err = decode(&registry, b"null", b"{\"event_kind\": 7}").unwrap_err();
        assert!(matches!(err, CodecError::MalformedMetadata(_)));
    }

    #[test]
    fn registered_legacy_kind_is_upcast() {
        let registry = EventRegistry::<ShipEvent>::for_event().register(
            "fleet.ship.Commissioned",
            |data| {
                let name = data["title"].as_str().unwrap_or_default().to_string();
                Ok(ShipEvent::Launched { name, crew: 0 })
            },
        );
        let metadata = serde_json::to_vec(&Metadata {
            event_kind: "fleet.ship.Commissioned".into(),
            entity_type: "Ship".into(),
            entity_id: id(),
        })
        .unwrap();
        let (event, _) = decode(&registry, b"{\"title\": \"Kronan\"}", &metadata).unwrap();
        assert_eq!(
            event,
            ShipEvent::Launched {
                name: "Kronan".into(),
                crew: 0
            }
        );
    }

    #[test]
    fn untagged_event_is_rejected_on_encode() {
        let err = encode(&Untagged { name: "x".into() }, "Thing", id()).unwrap_err();
        assert!(matches!(err, CodecError::NotTagged));
    }

    #[test]
    fn registry_debug_lists_kinds() {
        let registry = EventRegistry::<ShipEvent>::for_event();
        assert!(registry.contains("fleet.ship.Docked"));
        assert!(!registry.contains("Docked"));
        let debug = format!("{registry:?}");
        assert!(debug.contains("fleet.ship.Launched"));
    }
}
