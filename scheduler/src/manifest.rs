use strata_store::{PropertyKindId, PropertyStore};

/// Which bound of a property kind an analysis reads or derives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PropertySide {
    LowerBound,
    UpperBound,
    Both,
}

/// A property kind together with the bound side, as declared by an analysis
/// manifest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PropertyBound {
    pub kind: PropertyKindId,
    pub side: PropertySide,
}

impl PropertyBound {
    pub fn lb(kind: PropertyKindId) -> Self {
        Self {
            kind,
            side: PropertySide::LowerBound,
        }
    }

    pub fn ub(kind: PropertyKindId) -> Self {
        Self {
            kind,
            side: PropertySide::UpperBound,
        }
    }

    pub fn lub(kind: PropertyKindId) -> Self {
        Self {
            kind,
            side: PropertySide::Both,
        }
    }
}

/// The manifest and lifecycle of one analysis.
///
/// The declarative part, what the analysis `uses` and what it derives in
/// which mode, drives phase partitioning; the scheduler guarantees that
/// within one phase every lazily derived kind has exactly one producer and
/// no kind is derived both eagerly and lazily. The imperative part is a set
/// of lifecycle callbacks: for each phase the runner calls `init`,
/// `before_schedule`, `start` (the point at which computations are actually
/// submitted and lazy/triggered producers registered), and
/// `after_phase_scheduling` on every member, then waits for the store, then
/// calls `after_phase_completion`.
#[allow(unused_variables)]
pub trait AnalysisScheduler: Send + Sync {
    /// A diagnostic name; also used in scheduling error messages.
    fn name(&self) -> &str;

    /// The kinds (and bounds) this analysis reads.
    fn uses(&self) -> Vec<PropertyBound> {
        Vec::new()
    }

    /// Kinds produced exhaustively over a known entity set.
    fn derives_eagerly(&self) -> Vec<PropertyBound> {
        Vec::new()
    }

    /// The kind produced on demand; at most one per analysis.
    fn derives_lazily(&self) -> Option<PropertyBound> {
        None
    }

    /// Kinds derived via partial results, possibly by several analyses.
    fn derives_collaboratively(&self) -> Vec<PropertyBound> {
        Vec::new()
    }

    /// Interim-notification suppression entries this analysis asks for, as
    /// (depender kind, dependee kind) pairs.
    fn suppress_interim_updates(&self) -> Vec<(PropertyKindId, PropertyKindId)> {
        Vec::new()
    }

    fn init(&self, store: &PropertyStore) {}

    fn before_schedule(&self, store: &PropertyStore) {}

    /// Submit computations and register lazy/triggered producers.
    fn start(&self, store: &PropertyStore);

    fn after_phase_scheduling(&self, store: &PropertyStore) {}

    fn after_phase_completion(&self, store: &PropertyStore) {}
}
