use core::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::{
    EOptionP, OnUpdateContinuation, Property, PropertyKindId, PropertyLattice, SuppressionMatrix,
    error::fatal,
};

/// The key of one (entity, kind) state: the interned entity index plus the
/// kind id. Dependency edges are stored as keys, never as references to the
/// states themselves, so the dependency graph can be cyclic without cyclic
/// ownership.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct EpkId {
    pub entity: u32,
    pub kind: PropertyKindId,
}

impl fmt::Debug for EpkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}/{:?}", self.entity, self.kind)
    }
}

/// The outcome of applying a result to a state, reported back to the update
/// engine together with everything it needs to do *outside* the state lock:
/// the dependers to wake and the replaced extension.
pub(crate) enum UpdateOutcome {
    /// The value was not more informative; continuation and dependees were
    /// still replaced if supplied, but nobody is notified.
    NoChange,
    /// The extension tightened. `to_notify` holds the dependers that were
    /// detached for notification; suppressed dependers remain attached.
    Updated {
        old: EOptionP,
        first_value: bool,
        to_notify: SmallVec<[EpkId; 4]>,
    },
    /// The extension became final. Every depender was detached.
    Finalized {
        old: EOptionP,
        first_value: bool,
        dependers: Vec<EpkId>,
    },
}

struct StateInner {
    eoptp: EOptionP,
    /// Pending on-update continuation; `None` once consumed by a notifier.
    c: Option<OnUpdateContinuation>,
    /// The dependee keys declared by the most recent interim result.
    dependees: SmallVec<[EpkId; 4]>,
    /// Reverse edges: who waits on us.
    dependers: FxHashSet<EpkId>,
    /// The kind's fast-track/lazy producer has been consulted.
    producer_started: bool,
    /// Triggered computations for this (entity, kind) have fired.
    trigger_fired: bool,
}

/// The mutable state of one (entity, kind) pair. All operations lock the
/// record; none of them runs user code or touches another state while
/// holding the lock, which keeps the locking discipline single-level.
pub(crate) struct EpkState {
    inner: Mutex<StateInner>,
}

impl EpkState {
    pub fn new(eoptp: EOptionP) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                eoptp,
                c: None,
                dependees: SmallVec::new(),
                dependers: FxHashSet::default(),
                producer_started: false,
                trigger_fired: false,
            }),
        }
    }

    /// Snapshot the current extension.
    pub fn current(&self) -> EOptionP {
        self.inner.lock().eoptp.clone()
    }

    pub fn is_refinable(&self) -> bool {
        self.inner.lock().eoptp.is_refinable()
    }

    pub fn has_continuation(&self) -> bool {
        self.inner.lock().c.is_some()
    }

    /// Install an interim extension together with the continuation and
    /// dependees of the result that produced it.
    ///
    /// The continuation and dependee set are replaced even when the value is
    /// not an update: they belong to the most recent result, and the
    /// analysis is now waiting on the new dependees. Only notification is
    /// gated on the value actually tightening.
    pub fn update(
        &self,
        new: EOptionP,
        c: Option<OnUpdateContinuation>,
        dependees: SmallVec<[EpkId; 4]>,
        lattice: &dyn PropertyLattice,
        suppression: &SuppressionMatrix,
        debug_checks: bool,
    ) -> UpdateOutcome {
        debug_assert!(!new.is_final());
        debug_assert!(no_duplicates(&dependees), "duplicate dependee in {dependees:?}");
        let mut inner = self.inner.lock();
        if inner.eoptp.is_final() {
            fatal(format!(
                "interim update of the final state {:?} (new value {new:?})",
                inner.eoptp
            ));
        }
        inner.c = c;
        inner.dependees = dependees;
        let updated = lattice.is_updated(&new, &inner.eoptp);
        if !updated {
            return UpdateOutcome::NoChange;
        }
        if debug_checks {
            if let Err(violation) = lattice.check_is_valid_update(&inner.eoptp, &new) {
                fatal(violation);
            }
        }
        let first_value = inner.eoptp.is_epk();
        let own_kind = new.kind();
        let old = core::mem::replace(&mut inner.eoptp, new);
        let to_notify = detach_unsuppressed(&mut inner.dependers, own_kind, suppression);
        UpdateOutcome::Updated {
            old,
            first_value,
            to_notify,
        }
    }

    /// Seal the state with a final property, detaching every depender.
    pub fn final_update(
        &self,
        p: Arc<dyn Property>,
        lattice: &dyn PropertyLattice,
        debug_checks: bool,
    ) -> UpdateOutcome {
        let mut inner = self.inner.lock();
        if inner.eoptp.is_final() {
            fatal(format!(
                "final update of the already final state {:?} (new value {p:?})",
                inner.eoptp
            ));
        }
        let entity = inner.eoptp.entity().clone();
        let kind = inner.eoptp.kind();
        let new = EOptionP::final_ep(entity, kind, p);
        if debug_checks {
            if let Err(violation) = lattice.check_is_valid_update(&inner.eoptp, &new) {
                fatal(violation);
            }
        }
        let first_value = inner.eoptp.is_epk();
        let old = core::mem::replace(&mut inner.eoptp, new);
        inner.c = None;
        inner.dependees.clear();
        let dependers = inner.dependers.drain().collect();
        UpdateOutcome::Finalized {
            old,
            first_value,
            dependers,
        }
    }

    /// Run a collaborative read-modify-write under the state lock. The
    /// continuation and dependees of the state are untouched; a partial
    /// result never attaches a continuation and never detaches the one the
    /// state's own producer installed.
    pub fn partial_update(
        &self,
        update: crate::PartialUpdate,
        lattice: &dyn PropertyLattice,
        suppression: &SuppressionMatrix,
        debug_checks: bool,
    ) -> UpdateOutcome {
        let mut inner = self.inner.lock();
        let new = match update(&inner.eoptp) {
            Some(new) => new,
            None => return UpdateOutcome::NoChange,
        };
        if inner.eoptp.is_final() {
            fatal(format!(
                "collaborative update of the final state {:?} (new value {new:?})",
                inner.eoptp
            ));
        }
        if debug_checks {
            if let Err(violation) = lattice.check_is_valid_update(&inner.eoptp, &new) {
                fatal(violation);
            }
        }
        let first_value = inner.eoptp.is_epk();
        if new.is_final() {
            let old = core::mem::replace(&mut inner.eoptp, new);
            inner.c = None;
            inner.dependees.clear();
            let dependers = inner.dependers.drain().collect();
            UpdateOutcome::Finalized {
                old,
                first_value,
                dependers,
            }
        } else {
            if !lattice.is_updated(&new, &inner.eoptp) {
                return UpdateOutcome::NoChange;
            }
            let own_kind = new.kind();
            let old = core::mem::replace(&mut inner.eoptp, new);
            let to_notify = detach_unsuppressed(&mut inner.dependers, own_kind, suppression);
            UpdateOutcome::Updated {
                old,
                first_value,
                to_notify,
            }
        }
    }

    /// Install a continuation and dependee set without a value. Used for the
    /// anonymous states that back results carrying no property of their own.
    pub fn install_continuation(&self, c: OnUpdateContinuation, dependees: SmallVec<[EpkId; 4]>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.c.is_none());
        inner.c = Some(c);
        inner.dependees = dependees;
    }

    /// Attach `depender` iff the current extension is still the one the
    /// depender observed (or, for `always_except_if_final`, iff the state
    /// is not yet final). On failure the current extension is returned so
    /// the caller can deliver it to the depender immediately.
    pub fn add_depender(
        &self,
        expected: &EOptionP,
        depender: EpkId,
        always_except_if_final: bool,
    ) -> Result<(), EOptionP> {
        let mut inner = self.inner.lock();
        if inner.eoptp.is_final() {
            return Err(inner.eoptp.clone());
        }
        if always_except_if_final || inner.eoptp.same_extension(expected) {
            inner.dependers.insert(depender);
            Ok(())
        } else {
            Err(inner.eoptp.clone())
        }
    }

    /// Detach the pending continuation if `updated_dependee` is one of the
    /// dependees the continuation is waiting on. `None` means another
    /// notifier already consumed it, or the edge was stale.
    pub fn prepare_invoke_c(&self, updated_dependee: EpkId) -> Option<OnUpdateContinuation> {
        let mut inner = self.inner.lock();
        if inner.c.is_some() && inner.dependees.contains(&updated_dependee) {
            inner.c.take()
        } else {
            None
        }
    }

    pub fn remove_depender(&self, depender: EpkId) {
        self.inner.lock().dependers.remove(&depender);
    }

    pub fn clear_dependees(&self) {
        let mut inner = self.inner.lock();
        inner.dependees.clear();
        inner.c = None;
    }

    /// Mark the producer (fast track or lazy) as consulted; true on the
    /// first call.
    pub fn mark_producer_started(&self) -> bool {
        let mut inner = self.inner.lock();
        !core::mem::replace(&mut inner.producer_started, true)
    }

    /// Mark the per-entity trigger as fired; true on the first call.
    pub fn mark_trigger_fired(&self) -> bool {
        let mut inner = self.inner.lock();
        !core::mem::replace(&mut inner.trigger_fired, true)
    }
}

fn detach_unsuppressed(
    dependers: &mut FxHashSet<EpkId>,
    own_kind: PropertyKindId,
    suppression: &SuppressionMatrix,
) -> SmallVec<[EpkId; 4]> {
    let mut to_notify = SmallVec::new();
    dependers.retain(|d| {
        if suppression.is_suppressed(d.kind, own_kind) {
            true
        } else {
            to_notify.push(*d);
            false
        }
    });
    to_notify
}

fn no_duplicates(dependees: &[EpkId]) -> bool {
    dependees
        .iter()
        .all(|d| dependees.iter().filter(|x| *x == d).count() == 1)
}
