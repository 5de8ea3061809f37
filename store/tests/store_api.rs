//! Façade behavior: lazy and triggered computation modes, fast tracks,
//! forcing, phase validation, and failure containment.

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use std::sync::Mutex;

use common::*;
use strata_store::{
    ComputationResult, Entity, PhaseOutcome, PhaseSetup, PropertyKind, PropertyKindId,
    PropertyKindRegistry, PropertyStore, SetupError, StoreConfig,
};

fn store_with(kinds: Vec<PropertyKind>) -> (PropertyStore, Vec<PropertyKindId>) {
    let mut registry = PropertyKindRegistry::new();
    let ids = kinds.into_iter().map(|k| registry.register(k)).collect();
    (
        PropertyStore::new(StoreConfig::default(), Arc::new(registry)),
        ids,
    )
}

/// A read of an absent state starts the kind's lazy producer synchronously,
/// including through a chain of lazy kinds.
#[test]
fn lazy_producers_run_inline_on_first_read() {
    init_logging();
    let (store, ids) = store_with(vec![
        PropertyKind::new("ClassDepth", MaxLattice),
        PropertyKind::new("InheritedDepth", MaxLattice),
    ]);
    let (k0, k1) = (ids[0], ids[1]);
    store.setup_phase(PhaseSetup::new(ids)).unwrap();

    store.register_lazy_property_computation(
        k0,
        Arc::new(move |_store, e| ComputationResult::final_ep(e, int_prop(k0, 1))),
    );
    store.register_lazy_property_computation(
        k1,
        Arc::new(move |store: &PropertyStore, e: Entity| {
            let base = store.apply(&e, k0);
            assert!(base.is_final(), "nested lazy read did not run inline");
            ComputationResult::final_ep(e, int_prop(k1, int_of(&base) + 10))
        }),
    );

    let e = Entity::new("java/lang/String");
    let v = store.apply(&e, k1);
    assert!(v.is_final());
    assert_eq!(int_of(&v), 11);

    let report = store.wait_on_phase_completion().unwrap();
    assert_eq!(report.outcome, PhaseOutcome::Completed);
}

/// The fast track wins over the lazy producer and seeds a final value.
#[test]
fn fast_track_preempts_the_lazy_producer() {
    init_logging();
    let (store, ids) = store_with(vec![
        PropertyKind::new("Arity", MaxLattice).with_fast_track(|_e, k| Some(int_prop(k, 5))),
    ]);
    let k = ids[0];
    store.setup_phase(PhaseSetup::new(ids)).unwrap();

    let lazy_ran = Arc::new(AtomicBool::new(false));
    let flag = lazy_ran.clone();
    store.register_lazy_property_computation(
        k,
        Arc::new(move |_store, e| {
            flag.store(true, Ordering::SeqCst);
            ComputationResult::final_ep(e, int_prop(k, 99))
        }),
    );

    let e = Entity::new("m()I");
    let v = store.apply(&e, k);
    assert!(v.is_final());
    assert_eq!(int_of(&v), 5);
    assert!(!lazy_ran.load(Ordering::SeqCst));

    store.wait_on_phase_completion().unwrap();
}

/// A triggered computation fires once per entity, on the first value of the
/// kind, and not again for later refinements.
#[test]
fn triggered_computations_fire_once_per_entity() {
    init_logging();
    let (store, ids) = store_with(vec![
        PropertyKind::new("FieldValue", MaxLattice),
        PropertyKind::new("FieldWitness", MaxLattice),
    ]);
    let (k, witness) = (ids[0], ids[1]);
    store.setup_phase(PhaseSetup::new(ids)).unwrap();

    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = fired.clone();
    store.register_triggered_computation(
        k,
        Arc::new(move |_store, e: Entity| {
            log.lock().unwrap().push(e.downcast_ref::<&str>().copied().unwrap());
            ComputationResult::final_ep(e, int_prop(witness, 1))
        }),
    );

    let f = Entity::new("field: x");
    for value in [1, 2] {
        store.schedule_eager_computation_for_entity(
            f.clone(),
            Arc::new(move |_store, e: Entity| {
                ComputationResult::partial(e.clone(), k, move |current| {
                    let known = current
                        .ub()
                        .map(|p| p.downcast_ref::<IntProp>().unwrap().value);
                    if known < Some(value) {
                        Some(strata_store::EOptionP::interim_ub(
                            e.clone(),
                            k,
                            int_prop(k, value),
                        ))
                    } else {
                        None
                    }
                })
            }),
        );
    }

    let report = store.wait_on_phase_completion().unwrap();
    assert_eq!(report.outcome, PhaseOutcome::Completed);
    assert_eq!(fired.lock().unwrap().as_slice(), ["field: x"]);
    assert!(final_eoptp(&store, &f, witness).is_final());
}

/// `force` guarantees eventual computation without a read.
#[test]
fn force_schedules_the_lazy_producer() {
    init_logging();
    let (store, ids) = store_with(vec![PropertyKind::new("Purity", MaxLattice)]);
    let k = ids[0];
    store.setup_phase(PhaseSetup::new(ids)).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    store.register_lazy_property_computation(
        k,
        Arc::new(move |_store, e| {
            counter.fetch_add(1, Ordering::SeqCst);
            ComputationResult::final_ep(e, int_prop(k, 3))
        }),
    );

    let e = Entity::new("m()V");
    store.force(&e, k);
    store.force(&e, k); // idempotent

    let report = store.wait_on_phase_completion().unwrap();
    assert_eq!(report.outcome, PhaseOutcome::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(int_of(&final_eoptp(&store, &e, k)), 3);
}

/// Lazy registrations do not leak into the next phase; untouched states from
/// a later phase get the fallback instead of the stale producer.
#[test]
fn registrations_are_cleared_between_phases() {
    init_logging();
    let (store, ids) = store_with(vec![
        PropertyKind::new("EscapeState", MaxLattice).with_fallback(|_e, k| int_prop(k, -1)),
    ]);
    let k = ids[0];

    store.setup_phase(PhaseSetup::new(ids.clone())).unwrap();
    store.register_lazy_property_computation(
        k,
        Arc::new(move |_store, e| ComputationResult::final_ep(e, int_prop(k, 1))),
    );
    let e1 = Entity::new("site1");
    store.force(&e1, k);
    store.wait_on_phase_completion().unwrap();
    assert_eq!(int_of(&final_eoptp(&store, &e1, k)), 1);

    // Second phase: no producer registered anymore.
    store.setup_phase(PhaseSetup::new(ids)).unwrap();
    let e2 = Entity::new("site2");
    let v = store.apply(&e2, k);
    assert!(v.is_epk());
    store.wait_on_phase_completion().unwrap();
    assert_eq!(int_of(&final_eoptp(&store, &e2, k)), -1);
    // Finals from the first phase survive.
    assert_eq!(int_of(&final_eoptp(&store, &e1, k)), 1);
}

#[test]
#[should_panic]
fn second_lazy_producer_is_fatal() {
    let (store, ids) = store_with(vec![PropertyKind::new("Purity", MaxLattice)]);
    let k = ids[0];
    store.setup_phase(PhaseSetup::new(ids)).unwrap();
    let f: strata_store::PropertyComputation =
        Arc::new(move |_store, e| ComputationResult::final_ep(e, int_prop(k, 0)));
    store.register_lazy_property_computation(k, f.clone());
    store.register_lazy_property_computation(k, f);
}

#[test]
#[should_panic]
fn reading_a_kind_outside_the_phase_is_fatal() {
    let (store, ids) = store_with(vec![
        PropertyKind::new("InPhase", MaxLattice),
        PropertyKind::new("OutOfPhase", MaxLattice),
    ]);
    store.setup_phase(PhaseSetup::new([ids[0]])).unwrap();
    store.apply(&Entity::new("e"), ids[1]);
}

#[test]
fn suppression_entries_are_validated_at_setup() {
    let (store, ids) = store_with(vec![
        PropertyKind::new("A", MaxLattice),
        PropertyKind::new("B", MaxLattice),
    ]);
    let err = store
        .setup_phase(PhaseSetup::new([ids[0]]).with_suppressed(ids[0], ids[1]))
        .unwrap_err();
    assert_eq!(
        err,
        SetupError::SuppressionKindNotInPhase {
            depender: ids[0],
            dependee: ids[1],
        }
    );
}

/// Kind ids from a foreign registry are rejected at setup.
#[test]
fn unknown_kinds_are_rejected_at_setup() {
    let mut other = PropertyKindRegistry::new();
    other.register(PropertyKind::new("X", MaxLattice));
    other.register(PropertyKind::new("Y", MaxLattice));
    let foreign = other.register(PropertyKind::new("Z", MaxLattice));

    let (store, _ids) = store_with(vec![PropertyKind::new("A", MaxLattice)]);
    let err = store.setup_phase(PhaseSetup::new([foreign])).unwrap_err();
    assert_eq!(err, SetupError::UnknownKind(foreign));
}

/// A panicking analysis cancels the phase and is surfaced by
/// `wait_on_phase_completion`; results computed before the panic survive.
#[test]
fn analysis_panics_are_contained_and_surfaced() {
    init_logging();
    let mut registry = PropertyKindRegistry::new();
    let k = registry.register(PropertyKind::new("K", MaxLattice));
    // One worker makes the task order deterministic.
    let store = PropertyStore::new(
        StoreConfig::default().with_num_threads(1),
        Arc::new(registry),
    );
    store.setup_phase(PhaseSetup::new([k])).unwrap();

    let e1 = Entity::new("healthy");
    let e2 = Entity::new("doomed");
    store.schedule_eager_computation_for_entity(
        e1.clone(),
        Arc::new(move |_store, e| ComputationResult::final_ep(e, int_prop(k, 1))),
    );
    store.schedule_eager_computation_for_entity(
        e2.clone(),
        Arc::new(|_store, _e| panic!("boom: malformed bytecode")),
    );

    let failure = store.wait_on_phase_completion().unwrap_err();
    assert!(failure.message.contains("boom"));
    assert_eq!(int_of(&final_eoptp(&store, &e1, k)), 1);
    assert!(store.get(&e2, k).is_none());
}
