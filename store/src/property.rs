use core::{any::Any, fmt};
use std::sync::Arc;

use crate::{EOptionP, PropertyKindId};

/// An immutable value from a kind-specific lattice, describing some aspect of
/// an entity.
///
/// Properties are type-erased inside the store: values of the same kind are
/// ordered and joined by the kind's registered [PropertyLattice], never by
/// the store itself. Implementations carry their own [PropertyKindId] so a
/// result can be routed without the caller repeating the kind.
pub trait Property: fmt::Debug + Send + Sync + 'static {
    /// The kind this property value belongs to.
    fn kind_id(&self) -> PropertyKindId;

    /// Upcast for downcasting back to the concrete property type.
    fn as_any(&self) -> &dyn Any;
}

impl dyn Property {
    /// Get the concrete property value, if it is a `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// The lattice operations of one property kind.
///
/// `lub` must be total, associative, commutative, and idempotent; `eq` must
/// be consistent with it (`eq(a, b)` implies `lub(a, b)` equals both). Given
/// these two, the default implementations of [PropertyLattice::is_updated]
/// and [PropertyLattice::check_is_valid_update] are correct for any kind; a
/// kind overrides them only when "more informative" means something subtler
/// than a changed bound.
pub trait PropertyLattice: Send + Sync + 'static {
    /// The least upper bound of `a` and `b`.
    fn lub(&self, a: &dyn Property, b: &dyn Property) -> Arc<dyn Property>;

    /// Whether `a` and `b` denote the same lattice value.
    fn eq(&self, a: &dyn Property, b: &dyn Property) -> bool;

    /// True iff `new` is strictly more informative than `old`.
    ///
    /// The default: any transition to a final value, any bound that appears
    /// for the first time, and any present-in-both bound whose value changed.
    fn is_updated(&self, new: &EOptionP, old: &EOptionP) -> bool {
        if old.is_final() {
            return false;
        }
        if new.is_final() {
            return true;
        }
        let ub_updated = match (new.ub(), old.ub()) {
            (Some(n), Some(o)) => !self.eq(&**n, &**o),
            (Some(_), None) => true,
            (None, _) => false,
        };
        let lb_updated = match (new.lb(), old.lb()) {
            (Some(n), Some(o)) => !self.eq(&**n, &**o),
            (Some(_), None) => true,
            (None, _) => false,
        };
        ub_updated || lb_updated
    }

    /// Verify that replacing `old` by `new` is a monotone step. Only invoked
    /// when debug checks are enabled and [PropertyLattice::is_updated]
    /// returned true; an `Err` is reported as a fatal programmer error.
    fn check_is_valid_update(&self, old: &EOptionP, new: &EOptionP) -> Result<(), String> {
        fn check_bound<L: PropertyLattice + ?Sized>(
            lattice: &L,
            which: &str,
            old: Option<&Arc<dyn Property>>,
            new: Option<&Arc<dyn Property>>,
        ) -> Result<(), String> {
            match (old, new) {
                (Some(o), Some(n)) => {
                    let joined = lattice.lub(&**o, &**n);
                    if lattice.eq(&*joined, &**n) {
                        Ok(())
                    } else {
                        Err(format!(
                            "non-monotone {which} update: {o:?} -> {n:?} (lub is {joined:?})"
                        ))
                    }
                }
                (Some(o), None) => Err(format!("{which} {o:?} disappeared from the extension")),
                (None, _) => Ok(()),
            }
        }

        if old.is_final() {
            return Err(format!("update of a final extension: {old:?} -> {new:?}"));
        }
        if new.is_final() {
            // The final value must be at least as high as the old lower bound;
            // with only `lub` available the upper bound cannot be validated.
            return check_bound(self, "lower bound", old.lb(), new.final_property());
        }
        check_bound(self, "upper bound", old.ub(), new.ub())?;
        check_bound(self, "lower bound", old.lb(), new.lb())
    }
}
