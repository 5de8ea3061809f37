use core::fmt;

use thiserror::Error;

use crate::PropertyKindId;

/// Configuration errors raised by [crate::PropertyStore::setup_phase],
/// before any computation is scheduled.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("unknown property kind {0:?} in the phase configuration")]
    UnknownKind(PropertyKindId),
    #[error("suppression entry ({depender:?} -> {dependee:?}) references a kind outside the phase")]
    SuppressionKindNotInPhase {
        depender: PropertyKindId,
        dependee: PropertyKindId,
    },
}

/// A phase that did not complete cleanly: some computation panicked.
///
/// The panic raises the cancellation flag; other workers finish their
/// in-flight units, and this failure is surfaced once the store has shut the
/// phase down. Finals accumulated before the failure remain readable.
#[derive(Debug, Error)]
#[error("analysis phase failed: {message}")]
pub struct PhaseFailure {
    pub message: String,
    pub(crate) fatal: bool,
}

/// Panic payload for programmer errors (non-monotone updates, final-state
/// mutation, duplicate producers, phase misuse). Workers that catch one of
/// these do not treat it as a contained analysis failure; it is re-raised
/// from [crate::PropertyStore::wait_on_phase_completion].
pub(crate) struct Fatal(pub String);

impl fmt::Debug for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal property store error: {}", self.0)
    }
}

/// Abort with a programmer error.
pub(crate) fn fatal(message: String) -> ! {
    log::error!(target: "property-store", "{message}");
    std::panic::panic_any(Fatal(message))
}
