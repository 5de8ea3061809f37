//! Manifest-driven orchestration of analyses over a `strata-store`
//! [PropertyStore](strata_store::PropertyStore).
//!
//! Each analysis describes itself with an [AnalysisScheduler] manifest: the
//! property kinds it `uses`, the kinds it derives eagerly, lazily, or
//! collaboratively, the interim-update suppression entries it needs, and a
//! handful of lifecycle callbacks. An [AnalysisScenario] collects manifests,
//! builds the producer/consumer graph between them, and partitions it into
//! [Schedule] phases such that within every phase each lazily derived kind
//! has exactly one producer and no kind has two non-collaborative producers.
//! Dependency cycles between kinds stay inside one phase; resolving them is
//! the store's job, not the scheduler's.
//!
//! Executing a schedule walks the phases in topological order: configure the
//! store, run the members through `init` / `before_schedule` / `start` /
//! `after_phase_scheduling`, wait for quiescence plus sealing, then
//! `after_phase_completion`, and move on.

mod error;
mod manifest;
mod scenario;

pub use self::{
    error::{ExecutionError, ScheduleError},
    manifest::{AnalysisScheduler, PropertyBound, PropertySide},
    scenario::{AnalysisScenario, Schedule},
};
