//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the persisted row.
    ///
    /// Stores bump this on every committed write; writers hand it back as an
    /// [`ExpectedVersion`](crate::ExpectedVersion) to detect lost updates.
    fn version(&self) -> u64;
}
