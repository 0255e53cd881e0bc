/*
    traits.rs - Core CRDT trait definitions

    Every replicated piece of a record implements the same interface:
    - Apply a local operation
    - Merge with another replica's state
    - Query the current value and its causal clock
*/

use super::vector_clock::VectorClock;
use crate::core_store::store::errors::StoreResult;

/// Core trait that all CRDTs must implement
///
/// `merge` must be commutative, associative and idempotent.
pub trait Crdt: Clone + Send + Sync {
    /// The type of operations this CRDT accepts
    type Operation: Clone + Send + Sync;

    /// The type of value this CRDT represents
    type Value: Clone;

    /// Apply a local or remote operation to this CRDT
    fn apply(&mut self, op: Self::Operation) -> StoreResult<()>;

    /// Merge another CRDT state into this one
    fn merge(&mut self, other: &Self) -> StoreResult<()>;

    /// Get the current value/state
    fn value(&self) -> Self::Value;

    /// Join of every clock held by this CRDT
    fn vector_clock(&self) -> VectorClock;
}
