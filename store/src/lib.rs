//! A concurrent, dependency-tracking, monotone fixed-point property store.
//!
//! Static analyses derive *properties* about *entities* (classes, methods,
//! fields, statements, allocation sites). Analyses depend on the properties
//! of other entities, including cyclically, so results are computed as a
//! fixed point: each analysis publishes refinable interim values, the store
//! tracks who read what, and whenever a value tightens under its kind's
//! lattice, the dependent computations are re-run. Once the phase quiesces,
//! untouched states receive their kind's fallback and the remaining
//! refinable states (dependency cycles) are promoted to final, so that every
//! reached (entity, kind) pair ends with a stable value.
//!
//! The store supports three computation modes:
//!
//! * **eager**: scheduled up front for a known entity set
//!   ([PropertyStore::schedule_eager_computation_for_entity]);
//! * **lazy**: started by the first read of the kind
//!   ([PropertyStore::register_lazy_property_computation]);
//! * **triggered**: fired once per entity when a kind first receives a
//!   value ([PropertyStore::register_triggered_computation]).
//!
//! Collaborative derivation, where several analyses contribute monotone
//! pieces of one property, goes through [ComputationResult::Partial].
//! Oscillation between mutually dependent kinds is broken by a
//! [SuppressionMatrix] that drops interim notifications between configured
//! kind pairs; suppressed dependers still observe the final value.
//!
//! A phase is driven as `setup_phase` → schedule/register →
//! `wait_on_phase_completion`; the latter runs a worker pool over a shared
//! queue of detached continuations until everything is final. See the
//! `strata-scheduler` crate for manifest-driven orchestration of multiple
//! analyses across phases.

mod config;
mod entity;
mod eoptionp;
mod error;
mod kind;
mod property;
mod results;
mod state;
mod store;
mod suppression;

pub use self::{
    config::{PhaseSetup, StoreConfig},
    entity::{Entity, EntityData},
    eoptionp::{EOptionP, Extension},
    error::{PhaseFailure, SetupError},
    kind::{
        CycleResolution, CycleResolverFn, FallbackFn, FastTrackFn, PropertyKind, PropertyKindId,
        PropertyKindRegistry,
    },
    property::{Property, PropertyLattice},
    results::{ComputationResult, OnUpdateContinuation, PartialUpdate, PropertyComputation},
    store::{PhaseOutcome, PhaseReport, PropertyStore},
    suppression::SuppressionMatrix,
};
