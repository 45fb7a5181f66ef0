//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Outbox rows and ledger rows are entities: their status changes over time but
/// the producer-assigned id does not.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
