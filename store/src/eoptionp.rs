use core::fmt;
use std::sync::Arc;

use crate::{Entity, Property, PropertyKindId};

/// The observable extension of one (entity, kind) pair.
///
/// `None` is the "no value computed yet" shape; the interim shapes carry one
/// or both bounds of a still-refinable value; `Final` is immutable. Kinds
/// that use half-lattices only ever populate one of the two bounds.
#[derive(Clone)]
pub enum Extension {
    None,
    InterimUb { ub: Arc<dyn Property> },
    InterimLb { lb: Arc<dyn Property> },
    InterimLub { lb: Arc<dyn Property>, ub: Arc<dyn Property> },
    Final { p: Arc<dyn Property> },
}

/// An entity, a property kind, and the current [Extension] of the pair.
///
/// Values of this type are snapshots: the store hands out clones of the
/// extension it holds, and all bounds are shared behind [Arc], so a snapshot
/// taken at registration time can later be compared against the live state by
/// identity (see [EOptionP::same_extension]). Extensions only ever tighten,
/// per the kind's lattice.
#[derive(Clone)]
pub struct EOptionP {
    entity: Entity,
    kind: PropertyKindId,
    ext: Extension,
}

impl EOptionP {
    /// The "no value computed yet" extension.
    pub fn epk(entity: Entity, kind: PropertyKindId) -> Self {
        Self {
            entity,
            kind,
            ext: Extension::None,
        }
    }

    /// An interim extension with only an upper bound.
    pub fn interim_ub(entity: Entity, kind: PropertyKindId, ub: Arc<dyn Property>) -> Self {
        Self {
            entity,
            kind,
            ext: Extension::InterimUb { ub },
        }
    }

    /// An interim extension with only a lower bound.
    pub fn interim_lb(entity: Entity, kind: PropertyKindId, lb: Arc<dyn Property>) -> Self {
        Self {
            entity,
            kind,
            ext: Extension::InterimLb { lb },
        }
    }

    /// An interim extension with both bounds.
    pub fn interim_lub(
        entity: Entity,
        kind: PropertyKindId,
        lb: Arc<dyn Property>,
        ub: Arc<dyn Property>,
    ) -> Self {
        Self {
            entity,
            kind,
            ext: Extension::InterimLub { lb, ub },
        }
    }

    /// A final, immutable extension.
    pub fn final_ep(entity: Entity, kind: PropertyKindId, p: Arc<dyn Property>) -> Self {
        Self {
            entity,
            kind,
            ext: Extension::Final { p },
        }
    }

    #[inline]
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    #[inline]
    pub fn kind(&self) -> PropertyKindId {
        self.kind
    }

    #[inline]
    pub fn extension(&self) -> &Extension {
        &self.ext
    }

    /// True iff no value has been computed yet.
    #[inline]
    pub fn is_epk(&self) -> bool {
        matches!(self.ext, Extension::None)
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(self.ext, Extension::Final { .. })
    }

    /// True iff further updates are possible. The EPK shape is refinable.
    #[inline]
    pub fn is_refinable(&self) -> bool {
        !self.is_final()
    }

    /// The current upper bound. A final value is its own upper bound.
    pub fn ub(&self) -> Option<&Arc<dyn Property>> {
        match &self.ext {
            Extension::InterimUb { ub } | Extension::InterimLub { ub, .. } => Some(ub),
            Extension::Final { p } => Some(p),
            _ => None,
        }
    }

    /// The current lower bound. A final value is its own lower bound.
    pub fn lb(&self) -> Option<&Arc<dyn Property>> {
        match &self.ext {
            Extension::InterimLb { lb } | Extension::InterimLub { lb, .. } => Some(lb),
            Extension::Final { p } => Some(p),
            _ => None,
        }
    }

    /// The final property, if this extension is final.
    pub fn final_property(&self) -> Option<&Arc<dyn Property>> {
        match &self.ext {
            Extension::Final { p } => Some(p),
            _ => None,
        }
    }

    /// Identity comparison of two snapshots.
    ///
    /// Two snapshots are the same extension iff they are for the same
    /// (entity, kind) pair, have the same shape, and share the same bound
    /// allocations. This is the comparison dependee registration uses to
    /// detect that a dependee moved between the read and the registration.
    pub fn same_extension(&self, other: &EOptionP) -> bool {
        if self.entity != other.entity || self.kind != other.kind {
            return false;
        }
        match (&self.ext, &other.ext) {
            (Extension::None, Extension::None) => true,
            (Extension::InterimUb { ub: a }, Extension::InterimUb { ub: b }) => Arc::ptr_eq(a, b),
            (Extension::InterimLb { lb: a }, Extension::InterimLb { lb: b }) => Arc::ptr_eq(a, b),
            (
                Extension::InterimLub { lb: la, ub: ua },
                Extension::InterimLub { lb: lr, ub: ur },
            ) => Arc::ptr_eq(la, lr) && Arc::ptr_eq(ua, ur),
            (Extension::Final { p: a }, Extension::Final { p: b }) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for EOptionP {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ext {
            Extension::None => {
                write!(f, "EPK({:?}, {:?})", self.entity, self.kind)
            }
            Extension::InterimUb { ub } => {
                write!(f, "InterimUB({:?}, {:?}, ub={ub:?})", self.entity, self.kind)
            }
            Extension::InterimLb { lb } => {
                write!(f, "InterimLB({:?}, {:?}, lb={lb:?})", self.entity, self.kind)
            }
            Extension::InterimLub { lb, ub } => {
                write!(
                    f,
                    "InterimLUB({:?}, {:?}, lb={lb:?}, ub={ub:?})",
                    self.entity, self.kind
                )
            }
            Extension::Final { p } => {
                write!(f, "FinalEP({:?}, {:?}, {p:?})", self.entity, self.kind)
            }
        }
    }
}
