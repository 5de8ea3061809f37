use strata_store::{PhaseFailure, PropertyKindId, SetupError};
use thiserror::Error;

/// Errors detected while partitioning a scenario into phases.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("analysis `{analysis}` references the unregistered property kind {kind:?}")]
    UnknownKind {
        analysis: String,
        kind: PropertyKindId,
    },
    #[error(
        "analyses `{first}` and `{second}` both produce `{kind}` within one dependency cycle; \
         no consistent phase partitioning exists"
    )]
    InconsistentPhasePartitioning {
        kind: String,
        first: String,
        second: String,
    },
}

/// Errors surfaced while running a computed schedule against a store.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Phase(#[from] PhaseFailure),
}
