use std::time::Duration;

use crate::{CycleResolution, PropertyKindId};

/// Configuration for a [crate::PropertyStore].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    num_threads: usize,
    debug_checks: bool,
    default_cycle_resolution: CycleResolution,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            debug_checks: cfg!(debug_assertions),
            default_cycle_resolution: CycleResolution::PromoteUpperBound,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// The number of worker threads draining the phase. Clamped to at
    /// least 1.
    pub fn with_num_threads(mut self, n: usize) -> Self {
        self.num_threads = n.max(1);
        self
    }

    #[inline]
    pub fn debug_checks(&self) -> bool {
        self.debug_checks
    }

    /// Enable or disable runtime invariant checking (monotonicity of every
    /// update, completeness after sealing).
    pub fn with_debug_checks(mut self, yes: bool) -> Self {
        self.debug_checks = yes;
        self
    }

    #[inline]
    pub fn default_cycle_resolution(&self) -> &CycleResolution {
        &self.default_cycle_resolution
    }

    /// The strategy applied at quiescence to kinds that do not register
    /// their own.
    pub fn with_default_cycle_resolution(mut self, r: CycleResolution) -> Self {
        self.default_cycle_resolution = r;
        self
    }
}

/// The set of kinds active in one phase, the suppression entries between
/// them, and an optional wall-clock deadline after which the phase is
/// cancelled.
///
/// Installed via [crate::PropertyStore::setup_phase] before any computation
/// is scheduled.
#[derive(Debug, Clone)]
pub struct PhaseSetup {
    pub(crate) kinds: Vec<PropertyKindId>,
    pub(crate) suppression: Vec<(PropertyKindId, PropertyKindId)>,
    pub(crate) deadline: Option<Duration>,
}

impl PhaseSetup {
    pub fn new(kinds: impl IntoIterator<Item = PropertyKindId>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            suppression: Vec::new(),
            deadline: None,
        }
    }

    /// Suppress interim notifications from `dependee`-kind states to
    /// `depender`-kind states.
    pub fn with_suppressed(mut self, depender: PropertyKindId, dependee: PropertyKindId) -> Self {
        self.suppression.push((depender, dependee));
        self
    }

    /// Cancel the phase if it has not completed within `timeout`.
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(timeout);
        self
    }
}
