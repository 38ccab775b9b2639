//! Entity trait and the replay engine built on it.

use crate::codec::DomainEvent;
use crate::error::DecideError;

/// An event-sourced entity whose state is derived from its event history.
///
/// The implementing type itself serves as the entity's state. State is
/// built by folding events through [`apply`](Entity::apply); new events are
/// produced from commands by [`decide`](Entity::decide).
///
/// # Associated Types
///
/// - `Command`: the commands this entity type interprets.
/// - `Event`: the events it produces and applies.
/// - `Error`: domain rejection error.
///
/// # Contract
///
/// - [`decide`](Entity::decide) must be a pure decision function: no I/O,
///   no side effects, no mutation of `self`. It returns zero or more events,
///   or [`DecideError::UnsupportedCommand`] for a command the type cannot
///   interpret, so that "accepted as a no-op" and "rejected" stay distinct.
/// - [`apply`](Entity::apply) must be a pure, total function. Replaying the
///   same events always yields the same state, and folding a prefix then the
///   remaining suffix equals folding the whole sequence.
pub trait Entity: Default + Clone + Send + Sync + 'static {
    /// Names this entity type (e.g. `"Counter"`). Prefixes stream ids and
    /// selects the category stream, so it must not contain `-`.
    const ENTITY_TYPE: &'static str;

    /// The set of commands this entity type can handle.
    type Command: std::fmt::Debug + Send + 'static;

    /// The set of events this entity type produces and applies.
    type Event: DomainEvent;

    /// Command rejection error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// State before any event has been applied.
    fn initial_state() -> Self {
        Self::default()
    }

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;

    /// Validate a command against the current state and produce events.
    fn decide(&self, command: Self::Command) -> Result<Vec<Self::Event>, DecideError<Self::Error>>;

    /// Convenience for `decide` implementations rejecting a command variant.
    fn unsupported(command: &Self::Command) -> DecideError<Self::Error> {
        DecideError::UnsupportedCommand {
            entity_type: Self::ENTITY_TYPE,
            command: format!("{command:?}"),
        }
    }
}

/// Fold `events` into `state` in order.
pub fn fold<'a, E: Entity>(state: E, events: impl IntoIterator<Item = &'a E::Event>) -> E {
    events.into_iter().fold(state, E::apply)
}

/// Produce the events `command` implies for `state`.
///
/// # Errors
///
/// Propagates the entity's [`DecideError`].
pub fn decide<E: Entity>(
    state: &E,
    command: E::Command,
) -> Result<Vec<E::Event>, DecideError<E::Error>> {
    state.decide(command)
}
