use core::fmt;
use std::sync::Arc;

use crate::{EOptionP, Entity, Property, PropertyKindId, PropertyStore};

/// The continuation attached to an interim result.
///
/// Invoked with the updated extension of one of the declared dependees, it
/// re-runs the dependent part of the analysis and returns the next result.
/// Continuations must only read through the store façade and must capture
/// (entity, kind) handles rather than store internals.
pub type OnUpdateContinuation = Box<dyn FnOnce(&PropertyStore, EOptionP) -> ComputationResult + Send>;

/// A monotone read-modify-write on a single state, executed under that
/// state's lock. Returning `None` means no change (no depender is notified).
pub type PartialUpdate = Box<dyn FnOnce(&EOptionP) -> Option<EOptionP> + Send>;

/// A property computation: the unit of work scheduled eagerly for an entity,
/// registered as a kind's lazy producer, or triggered on first derivation.
pub type PropertyComputation = Arc<dyn Fn(&PropertyStore, Entity) -> ComputationResult + Send + Sync>;

/// What a computation (or continuation) hands back to the update engine.
pub enum ComputationResult {
    /// A single final property for `entity`; the kind is carried by the
    /// property itself.
    Final {
        entity: Entity,
        property: Arc<dyn Property>,
    },
    /// A batch of results, processed in order.
    Batch(Vec<ComputationResult>),
    /// A batch of final properties.
    MultiFinal(Vec<(Entity, Arc<dyn Property>)>),
    /// A refinable value for `eps`'s (entity, kind) pair, together with the
    /// extensions of the dependees it was computed from and the continuation
    /// to run when any of them updates.
    Interim {
        eps: EOptionP,
        dependees: Vec<EOptionP>,
        c: OnUpdateContinuation,
    },
    /// A collaborative contribution to `(entity, kind)`: `update` observes
    /// the current extension and either tightens it or leaves it alone.
    Partial {
        entity: Entity,
        kind: PropertyKindId,
        update: PartialUpdate,
    },
    /// No value of its own, only dependees to watch and the continuation to
    /// run on their updates.
    InterimPartial {
        dependees: Vec<EOptionP>,
        c: OnUpdateContinuation,
    },
    /// Nothing to contribute for this entity in this phase.
    NoResult,
}

impl ComputationResult {
    pub fn final_ep(entity: Entity, property: Arc<dyn Property>) -> Self {
        Self::Final { entity, property }
    }

    pub fn interim(
        eps: EOptionP,
        dependees: Vec<EOptionP>,
        c: impl FnOnce(&PropertyStore, EOptionP) -> ComputationResult + Send + 'static,
    ) -> Self {
        Self::Interim {
            eps,
            dependees,
            c: Box::new(c),
        }
    }

    pub fn partial(
        entity: Entity,
        kind: PropertyKindId,
        update: impl FnOnce(&EOptionP) -> Option<EOptionP> + Send + 'static,
    ) -> Self {
        Self::Partial {
            entity,
            kind,
            update: Box::new(update),
        }
    }

    pub fn interim_partial(
        dependees: Vec<EOptionP>,
        c: impl FnOnce(&PropertyStore, EOptionP) -> ComputationResult + Send + 'static,
    ) -> Self {
        Self::InterimPartial {
            dependees,
            c: Box::new(c),
        }
    }
}

impl fmt::Debug for ComputationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Final { entity, property } => f
                .debug_struct("Final")
                .field("entity", entity)
                .field("property", property)
                .finish(),
            Self::Batch(rs) => f.debug_tuple("Batch").field(rs).finish(),
            Self::MultiFinal(rs) => f.debug_tuple("MultiFinal").field(rs).finish(),
            Self::Interim { eps, dependees, .. } => f
                .debug_struct("Interim")
                .field("eps", eps)
                .field("dependees", dependees)
                .finish_non_exhaustive(),
            Self::Partial { entity, kind, .. } => f
                .debug_struct("Partial")
                .field("entity", entity)
                .field("kind", kind)
                .finish_non_exhaustive(),
            Self::InterimPartial { dependees, .. } => f
                .debug_struct("InterimPartial")
                .field("dependees", dependees)
                .finish_non_exhaustive(),
            Self::NoResult => f.write_str("NoResult"),
        }
    }
}
