use core::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{EOptionP, Entity, Property, PropertyLattice, error::fatal};

/// The dense identifier of a registered property kind.
///
/// Ids are assigned by the [PropertyKindRegistry] starting at 0, in
/// registration order. The store sizes its per-kind tables by the registry
/// length, so ids double as table indices.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKindId(u32);

impl PropertyKindId {
    /// Reserved id for the store-internal states that carry the continuation
    /// of a result without a value of its own. Never handed out by a
    /// registry.
    pub(crate) const ANONYMOUS: PropertyKindId = PropertyKindId(u32::MAX);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl fmt::Debug for PropertyKindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ANONYMOUS {
            write!(f, "pk#anonymous")
        } else {
            write!(f, "pk#{}", self.0)
        }
    }
}

pub type FallbackFn = Arc<dyn Fn(&Entity, PropertyKindId) -> Arc<dyn Property> + Send + Sync>;
pub type FastTrackFn =
    Arc<dyn Fn(&Entity, PropertyKindId) -> Option<Arc<dyn Property>> + Send + Sync>;
pub type CycleResolverFn = Arc<dyn Fn(&EOptionP) -> Arc<dyn Property> + Send + Sync>;

/// How a still-refinable state is promoted to final once the phase has
/// quiesced and no further updates can arrive.
#[derive(Clone)]
pub enum CycleResolution {
    /// Promote the current upper bound (or, for a kind that only tracks a
    /// lower bound, that bound) to final.
    PromoteUpperBound,
    /// A kind-specific resolver computing the final property from the
    /// current extension.
    Custom(CycleResolverFn),
}

impl CycleResolution {
    pub(crate) fn resolve(&self, eoptp: &EOptionP) -> Arc<dyn Property> {
        match self {
            Self::PromoteUpperBound => match eoptp.ub().or_else(|| eoptp.lb()) {
                Some(p) => p.clone(),
                None => fatal(format!(
                    "cycle resolution of an extension without bounds: {eoptp:?}"
                )),
            },
            Self::Custom(f) => f(eoptp),
        }
    }
}

impl fmt::Debug for CycleResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PromoteUpperBound => f.write_str("PromoteUpperBound"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// The declaration of one property kind: its diagnostic name, its lattice,
/// the fallback installed for entities no analysis ever produced a value
/// for, an optional fast-track function consulted on the first read, and an
/// optional cycle-resolution override.
pub struct PropertyKind {
    name: String,
    lattice: Arc<dyn PropertyLattice>,
    fallback: Option<FallbackFn>,
    fast_track: Option<FastTrackFn>,
    cycle_resolution: Option<CycleResolution>,
}

impl PropertyKind {
    pub fn new<L: PropertyLattice>(name: impl Into<String>, lattice: L) -> Self {
        Self {
            name: name.into(),
            lattice: Arc::new(lattice),
            fallback: None,
            fast_track: None,
            cycle_resolution: None,
        }
    }

    /// The fallback property, computed per entity. The function also
    /// receives the kind's registered id, since fallback properties must
    /// carry it and registration happens after the kind is declared.
    pub fn with_fallback(
        mut self,
        f: impl Fn(&Entity, PropertyKindId) -> Arc<dyn Property> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Arc::new(f));
        self
    }

    /// A fallback that is the same property for every entity.
    pub fn with_constant_fallback(self, p: Arc<dyn Property>) -> Self {
        self.with_fallback(move |_, _| p.clone())
    }

    /// A cheap approximation computed on the first read of an absent state,
    /// before any lazy producer runs. A returned property is installed as
    /// the state's final value.
    pub fn with_fast_track(
        mut self,
        f: impl Fn(&Entity, PropertyKindId) -> Option<Arc<dyn Property>> + Send + Sync + 'static,
    ) -> Self {
        self.fast_track = Some(Arc::new(f));
        self
    }

    /// Override the store-wide default cycle-resolution strategy for this
    /// kind.
    pub fn with_cycle_resolution(mut self, r: CycleResolution) -> Self {
        self.cycle_resolution = Some(r);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn lattice(&self) -> &dyn PropertyLattice {
        &*self.lattice
    }

    pub(crate) fn fallback_for(&self, e: &Entity, id: PropertyKindId) -> Arc<dyn Property> {
        match &self.fallback {
            Some(f) => f(e, id),
            None => fatal(format!(
                "property kind `{}` has no fallback but one is required for {e:?}",
                self.name
            )),
        }
    }

    pub(crate) fn fast_track_for(&self, e: &Entity, id: PropertyKindId) -> Option<Arc<dyn Property>> {
        self.fast_track.as_ref().and_then(|f| f(e, id))
    }

    pub(crate) fn has_fast_track(&self) -> bool {
        self.fast_track.is_some()
    }

    pub(crate) fn cycle_resolution(&self) -> Option<&CycleResolution> {
        self.cycle_resolution.as_ref()
    }
}

impl fmt::Debug for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyKind")
            .field("name", &self.name)
            .field("has_fallback", &self.fallback.is_some())
            .field("has_fast_track", &self.fast_track.is_some())
            .field("cycle_resolution", &self.cycle_resolution)
            .finish()
    }
}

/// The set of property kinds known to a store, registered once at startup.
///
/// Registration assigns dense ids; looking up a kind by id is an index into
/// a vector. Name collisions are fatal, as two analyses registering the same
/// kind independently is a wiring bug, not a recoverable condition.
#[derive(Default)]
pub struct PropertyKindRegistry {
    kinds: Vec<PropertyKind>,
    by_name: FxHashMap<String, PropertyKindId>,
}

impl PropertyKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind`, returning its dense id.
    pub fn register(&mut self, kind: PropertyKind) -> PropertyKindId {
        if self.by_name.contains_key(kind.name()) {
            fatal(format!(
                "property kind `{}` is registered more than once",
                kind.name()
            ));
        }
        let id = PropertyKindId::from_index(self.kinds.len());
        self.by_name.insert(kind.name().to_string(), id);
        self.kinds.push(kind);
        id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn contains(&self, id: PropertyKindId) -> bool {
        id.index() < self.kinds.len()
    }

    /// The kind registered under `id`. Panics for unknown ids.
    pub fn get(&self, id: PropertyKindId) -> &PropertyKind {
        match self.kinds.get(id.index()) {
            Some(kind) => kind,
            None => fatal(format!("unknown property kind {id:?}")),
        }
    }

    pub fn id_of(&self, name: &str) -> Option<PropertyKindId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropertyKindId, &PropertyKind)> {
        self.kinds
            .iter()
            .enumerate()
            .map(|(i, k)| (PropertyKindId::from_index(i), k))
    }
}

impl fmt::Debug for PropertyKindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.kinds.iter().map(|k| k.name()))
            .finish()
    }
}
