use core::fmt;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_deque::{Injector, Steal};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxBuildHasher, FxHashMap};
use smallvec::SmallVec;

use crate::{
    ComputationResult, EOptionP, Entity, PartialUpdate, PhaseSetup, Property, PropertyComputation,
    PropertyKindId, PropertyKindRegistry, StoreConfig, SuppressionMatrix,
    error::{Fatal, PhaseFailure, SetupError, fatal},
    results::OnUpdateContinuation,
    state::{EpkId, EpkState, UpdateOutcome},
};

const LOG: &str = "property-store";

/// How a phase ended, provided it did not fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Quiescence, fallbacks, and cycle resolution all ran; every reached
    /// state is final.
    Completed,
    /// The cancellation flag was raised; finals computed so far are kept,
    /// everything else is left as-is.
    Cancelled,
}

/// The result of [PropertyStore::wait_on_phase_completion]: the outcome plus
/// the extensions that did not reach a final value (empty on clean
/// completion).
#[derive(Debug)]
pub struct PhaseReport {
    pub outcome: PhaseOutcome,
    pub incomplete: Vec<EOptionP>,
}

/// A unit of work for the phase's worker pool.
enum Task {
    /// Run a property computation for an entity.
    Compute {
        f: PropertyComputation,
        entity: Entity,
    },
    /// Invoke a detached continuation with the updated dependee extension.
    Continue {
        c: OnUpdateContinuation,
        dependee: EOptionP,
    },
}

/// Interns entities into dense indices. The table keeps one handle per
/// interned entity so the identity address stays stable for the lifetime of
/// the store.
#[derive(Default)]
struct EntityTable {
    ids: Mutex<FxHashMap<usize, u32>>,
    list: RwLock<Vec<Entity>>,
}

impl EntityTable {
    fn intern(&self, e: &Entity) -> u32 {
        let mut ids = self.ids.lock();
        if let Some(&ix) = ids.get(&e.addr()) {
            return ix;
        }
        let mut list = self.list.write();
        let ix = list.len() as u32;
        list.push(e.clone());
        ids.insert(e.addr(), ix);
        ix
    }

    fn lookup(&self, e: &Entity) -> Option<u32> {
        self.ids.lock().get(&e.addr()).copied()
    }
}

/// The kinds active in the current phase, their suppression matrix, and the
/// phase deadline. Immutable while the phase runs.
struct PhaseState {
    configured: bool,
    active: Vec<bool>,
    suppression: SuppressionMatrix,
    deadline: Option<Instant>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            configured: false,
            active: Vec::new(),
            suppression: SuppressionMatrix::default(),
            deadline: None,
        }
    }
}

/// The process-wide authority for the properties of one analysis phase.
///
/// Analyses read extensions through [PropertyStore::apply], schedule work
/// through the `schedule_*`/`register_*` family, and hand their results back
/// as [ComputationResult]s; the store integrates results, tracks the
/// dependency graph between (entity, kind) states, wakes dependents whose
/// inputs tightened, and, once the phase quiesces, installs fallbacks and
/// resolves dependency cycles so that every reached state ends final.
///
/// The lifecycle per phase is `setup_phase` → schedule/register →
/// `wait_on_phase_completion`. The store is handed around by reference; it
/// has no hidden global instance.
pub struct PropertyStore {
    config: StoreConfig,
    registry: Arc<PropertyKindRegistry>,
    entities: EntityTable,
    states: DashMap<EpkId, Arc<EpkState>, FxBuildHasher>,
    /// At most one lazy producer per kind.
    lazy: RwLock<Vec<Option<PropertyComputation>>>,
    /// Computations fired once per entity when a kind first receives a value.
    triggered: RwLock<Vec<Vec<PropertyComputation>>>,
    phase: RwLock<PhaseState>,
    injector: Injector<Task>,
    /// Tasks queued or executing. Zero means quiescence.
    pending: AtomicUsize,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    cancelled: AtomicBool,
    /// Set while fallbacks/cycle resolution run; triggered computations are
    /// not fired for values installed by the sealing stage itself.
    sealing: AtomicBool,
    failure: Mutex<Option<PhaseFailure>>,
    /// Key allocator for the anonymous states backing value-less results.
    anon_seq: AtomicU32,
    anon_entity: Entity,
}

impl PropertyStore {
    pub fn new(config: StoreConfig, registry: Arc<PropertyKindRegistry>) -> Self {
        let kinds = registry.len();
        Self {
            config,
            registry,
            entities: EntityTable::default(),
            states: DashMap::with_hasher(FxBuildHasher::default()),
            lazy: RwLock::new(vec![None; kinds]),
            triggered: RwLock::new(vec![Vec::new(); kinds]),
            phase: RwLock::new(PhaseState::default()),
            injector: Injector::new(),
            pending: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            cancelled: AtomicBool::new(false),
            sealing: AtomicBool::new(false),
            failure: Mutex::new(None),
            anon_seq: AtomicU32::new(0),
            anon_entity: Entity::new("<anonymous depender>"),
        }
    }

    #[inline]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &PropertyKindRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read the current extension of `(e, k)`.
    ///
    /// On the first read of an absent state the kind's fast-track function
    /// is consulted, then its lazy producer is started synchronously on the
    /// calling thread; the returned extension reflects whatever the producer
    /// managed to derive during start-up. Reading a kind outside the current
    /// phase is a fatal programmer error.
    pub fn apply(&self, e: &Entity, k: PropertyKindId) -> EOptionP {
        self.ensure_active(k);
        let (_, st) = self.get_or_create_state(e, k);
        let kind = self.registry.get(k);
        let lazy = self.lazy.read()[k.index()].clone();
        if st.current().is_epk()
            && (kind.has_fast_track() || lazy.is_some())
            && st.mark_producer_started()
        {
            if let Some(p) = kind.fast_track_for(e, k) {
                log::trace!(target: LOG, "fast-tracked {:?} for {e:?}", kind.name());
                debug_assert_eq!(p.kind_id(), k);
                self.handle_final(e.clone(), p);
            } else if let Some(f) = lazy {
                log::trace!(target: LOG, "lazily computing {:?} for {e:?}", kind.name());
                let result = f(self, e.clone());
                self.process(result);
            }
        }
        st.current()
    }

    /// Ensure a value for `(e, k)` will eventually be computed, even if
    /// nobody reads it: the fast track is consulted inline, a lazy producer
    /// is scheduled, and in the absence of both the state is created so the
    /// sealing stage assigns the kind's fallback.
    pub fn force(&self, e: &Entity, k: PropertyKindId) {
        self.ensure_active(k);
        let (_, st) = self.get_or_create_state(e, k);
        let kind = self.registry.get(k);
        let lazy = self.lazy.read()[k.index()].clone();
        if st.current().is_epk()
            && (kind.has_fast_track() || lazy.is_some())
            && st.mark_producer_started()
        {
            if let Some(p) = kind.fast_track_for(e, k) {
                debug_assert_eq!(p.kind_id(), k);
                self.handle_final(e.clone(), p);
            } else if let Some(f) = lazy {
                self.submit_task(Task::Compute {
                    f,
                    entity: e.clone(),
                });
            }
        }
    }

    /// Peek at the current extension without phase checks and without
    /// starting producers. Intended for consumption after the phase and for
    /// diagnostics.
    pub fn get(&self, e: &Entity, k: PropertyKindId) -> Option<EOptionP> {
        let entity = self.entities.lookup(e)?;
        let key = EpkId { entity, kind: k };
        let st = self.states.get(&key)?.clone();
        Some(st.current())
    }

    /// Snapshot every known extension of kind `k`.
    pub fn entities(&self, k: PropertyKindId) -> Vec<EOptionP> {
        self.states
            .iter()
            .filter(|r| r.key().kind == k)
            .map(|r| r.value().current())
            .collect()
    }

    // ------------------------------------------------------------------
    // Registration and scheduling
    // ------------------------------------------------------------------

    /// Register the lazy producer for kind `k`; at most one per kind.
    pub fn register_lazy_property_computation(&self, k: PropertyKindId, f: PropertyComputation) {
        let mut lazy = self.lazy.write();
        let slot = &mut lazy[k.index()];
        if slot.is_some() {
            fatal(format!(
                "a lazy computation for kind `{}` is already registered",
                self.registry.get(k).name()
            ));
        }
        *slot = Some(f);
    }

    /// Register a computation run once per entity, when a state of kind `k`
    /// first receives a value of any shape.
    pub fn register_triggered_computation(&self, k: PropertyKindId, f: PropertyComputation) {
        self.triggered.write()[k.index()].push(f);
    }

    /// Enqueue `f` to be run for `e` by the phase's worker pool.
    pub fn schedule_eager_computation_for_entity(&self, e: Entity, f: PropertyComputation) {
        if !self.phase.read().configured {
            fatal("computations scheduled before any phase was set up".into());
        }
        self.submit_task(Task::Compute { f, entity: e });
    }

    /// Bulk form of [Self::schedule_eager_computation_for_entity].
    pub fn schedule_eager_computations_for_entities(
        &self,
        es: impl IntoIterator<Item = Entity>,
        f: PropertyComputation,
    ) {
        for e in es {
            self.schedule_eager_computation_for_entity(e, f.clone());
        }
    }

    /// Integrate a result produced outside a scheduled computation.
    pub fn submit(&self, result: ComputationResult) {
        self.process(result);
    }

    /// Raise the cooperative cancellation flag. Workers finish their current
    /// unit of work, then drain the queue without executing anything.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            log::info!(target: LOG, "phase cancellation requested");
            self.idle_cv.notify_all();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Phase lifecycle
    // ------------------------------------------------------------------

    /// Install the set of kinds active in the upcoming phase together with
    /// their suppression entries and an optional deadline. Must be called
    /// before any computation is scheduled.
    pub fn setup_phase(&self, setup: PhaseSetup) -> Result<(), SetupError> {
        if self.pending.load(Ordering::SeqCst) != 0 {
            fatal("phase setup while computations are still pending".into());
        }
        let mut active = vec![false; self.registry.len()];
        for k in &setup.kinds {
            if !self.registry.contains(*k) {
                return Err(SetupError::UnknownKind(*k));
            }
            active[k.index()] = true;
        }
        let mut suppression = SuppressionMatrix::new(self.registry.len());
        for (depender, dependee) in &setup.suppression {
            let known = |k: &PropertyKindId| self.registry.contains(*k) && active[k.index()];
            if !known(depender) || !known(dependee) {
                return Err(SetupError::SuppressionKindNotInPhase {
                    depender: *depender,
                    dependee: *dependee,
                });
            }
            suppression.suppress(*depender, *dependee);
        }
        let mut phase = self.phase.write();
        phase.configured = true;
        phase.active = active;
        phase.suppression = suppression;
        phase.deadline = setup.deadline.map(|d| Instant::now() + d);
        drop(phase);
        self.cancelled.store(false, Ordering::SeqCst);
        *self.failure.lock() = None;
        log::debug!(
            target: LOG,
            "phase configured with {} active kind(s)",
            setup.kinds.len()
        );
        Ok(())
    }

    /// Block until quiescence, fallback assignment, and cycle resolution
    /// have all completed (or the phase was cancelled or failed).
    ///
    /// On a clean completion every state reached during the phase is final.
    /// On cancellation the accumulated finals are kept and everything else
    /// is reported in the [PhaseReport]. A panic inside an analysis cancels
    /// the phase and is surfaced as a [PhaseFailure]; programmer-error
    /// panics are re-raised.
    pub fn wait_on_phase_completion(&self) -> Result<PhaseReport, PhaseFailure> {
        if !self.phase.read().configured {
            fatal("waiting on phase completion without a configured phase".into());
        }
        log::debug!(target: LOG, "running phase to completion");
        loop {
            self.drain();
            if self.is_cancelled() {
                break;
            }
            self.sealing.store(true, Ordering::SeqCst);
            let fallbacks = self.install_fallbacks();
            let promoted = if fallbacks == 0 {
                self.promote_refinables()
            } else {
                0
            };
            self.sealing.store(false, Ordering::SeqCst);
            if fallbacks == 0 && promoted == 0 {
                break;
            }
        }

        let failure = self.failure.lock().take();
        let cancelled = self.is_cancelled();
        let incomplete: Vec<EOptionP> = self
            .states
            .iter()
            .filter(|r| r.key().kind != PropertyKindId::ANONYMOUS)
            .map(|r| r.value().current())
            .filter(|e| !e.is_final())
            .collect();
        self.finish_phase(cancelled);

        if let Some(f) = failure {
            if f.fatal {
                panic::panic_any(Fatal(f.message));
            }
            return Err(f);
        }
        if !cancelled && self.config.debug_checks() && !incomplete.is_empty() {
            fatal(format!(
                "phase completed with {} non-final state(s), e.g. {:?}",
                incomplete.len(),
                incomplete[0]
            ));
        }
        log::debug!(
            target: LOG,
            "phase finished ({} incomplete state(s))",
            incomplete.len()
        );
        Ok(PhaseReport {
            outcome: if cancelled {
                PhaseOutcome::Cancelled
            } else {
                PhaseOutcome::Completed
            },
            incomplete,
        })
    }

    /// Tear the phase down: anonymous states are dropped, leftover
    /// continuations released, and per-phase registrations cleared so the
    /// next phase starts from a clean slate.
    fn finish_phase(&self, cancelled: bool) {
        self.states.retain(|key, st| {
            if key.kind == PropertyKindId::ANONYMOUS {
                return false;
            }
            if cancelled && st.is_refinable() {
                st.clear_dependees();
            }
            true
        });
        let kinds = self.registry.len();
        *self.lazy.write() = vec![None; kinds];
        *self.triggered.write() = vec![Vec::new(); kinds];
        self.phase.write().configured = false;
    }

    // ------------------------------------------------------------------
    // Worker pool
    // ------------------------------------------------------------------

    fn submit_task(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.injector.push(task);
        self.idle_cv.notify_all();
    }

    /// Run worker threads until quiescence: the queue is empty and no task
    /// is executing.
    fn drain(&self) {
        if self.pending.load(Ordering::SeqCst) == 0 {
            return;
        }
        let workers = self.config.num_threads();
        log::trace!(target: LOG, "draining work queue on {workers} worker(s)");
        thread::scope(|scope| {
            for worker in 0..workers {
                scope.spawn(move || self.worker_loop(worker));
            }
        });
    }

    fn worker_loop(&self, worker: usize) {
        log::trace!(target: LOG, "worker {worker} up");
        let deadline = self.phase.read().deadline;
        loop {
            if let Some(deadline) = deadline {
                if !self.is_cancelled() && Instant::now() >= deadline {
                    log::warn!(target: LOG, "phase deadline expired");
                    self.cancel();
                }
            }
            match self.injector.steal() {
                Steal::Success(task) => {
                    if self.is_cancelled() {
                        drop(task);
                    } else if let Err(payload) =
                        panic::catch_unwind(AssertUnwindSafe(|| self.run_task(task)))
                    {
                        self.record_panic(payload);
                    }
                    if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        self.idle_cv.notify_all();
                    }
                }
                Steal::Empty => {
                    if self.pending.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    let mut guard = self.idle_lock.lock();
                    if self.injector.is_empty() && self.pending.load(Ordering::SeqCst) > 0 {
                        self.idle_cv
                            .wait_for(&mut guard, Duration::from_millis(1));
                    }
                }
                Steal::Retry => core::hint::spin_loop(),
            }
        }
        log::trace!(target: LOG, "worker {worker} idle, exiting");
    }

    fn run_task(&self, task: Task) {
        match task {
            Task::Compute { f, entity } => {
                let result = f(self, entity);
                self.process(result);
            }
            Task::Continue { c, dependee } => {
                let result = c(self, dependee);
                self.process(result);
            }
        }
    }

    fn record_panic(&self, payload: Box<dyn core::any::Any + Send>) {
        let (message, is_fatal) = if let Some(f) = payload.downcast_ref::<Fatal>() {
            (f.0.clone(), true)
        } else if let Some(s) = payload.downcast_ref::<&'static str>() {
            ((*s).to_string(), false)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            (s.clone(), false)
        } else {
            ("analysis panicked with an opaque payload".to_string(), false)
        };
        log::error!(target: LOG, "worker caught panic: {message}");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(PhaseFailure {
                message,
                fatal: is_fatal,
            });
        }
        drop(failure);
        self.cancel();
    }

    // ------------------------------------------------------------------
    // Update engine
    // ------------------------------------------------------------------

    /// Integrate one computation result.
    fn process(&self, result: ComputationResult) {
        match result {
            ComputationResult::NoResult => {}
            ComputationResult::Batch(results) => {
                for r in results {
                    self.process(r);
                }
            }
            ComputationResult::MultiFinal(results) => {
                for (entity, property) in results {
                    self.handle_final(entity, property);
                }
            }
            ComputationResult::Final { entity, property } => {
                self.handle_final(entity, property);
            }
            ComputationResult::Interim { eps, dependees, c } => {
                self.handle_interim(eps, dependees, c);
            }
            ComputationResult::Partial {
                entity,
                kind,
                update,
            } => {
                self.handle_partial(entity, kind, update);
            }
            ComputationResult::InterimPartial { dependees, c } => {
                self.handle_interim_partial(dependees, c);
            }
        }
    }

    fn handle_final(&self, entity: Entity, property: Arc<dyn Property>) {
        let k = property.kind_id();
        self.ensure_active(k);
        let (key, st) = self.get_or_create_state(&entity, k);
        let lattice = self.registry.get(k).lattice();
        let outcome = st.final_update(property, lattice, self.config.debug_checks());
        let UpdateOutcome::Finalized {
            old,
            first_value,
            dependers,
        } = outcome
        else {
            unreachable!()
        };
        log::trace!(
            target: LOG,
            "{key:?} sealed (was {old:?}), notifying {} depender(s)",
            dependers.len()
        );
        self.fire_triggers(&st, &entity, k, first_value);
        let snapshot = st.current();
        self.notify_dependers(key, &snapshot, dependers);
    }

    fn handle_interim(&self, eps: EOptionP, dependees: Vec<EOptionP>, c: OnUpdateContinuation) {
        if eps.is_final() || eps.is_epk() {
            fatal(format!("an interim result must carry a refinable value: {eps:?}"));
        }
        if dependees.is_empty() {
            fatal(format!(
                "interim result for {eps:?} without dependees; a final result was due"
            ));
        }
        let k = eps.kind();
        self.ensure_active(k);
        let entity = eps.entity().clone();
        let (key, st) = self.get_or_create_state(&entity, k);
        let dependee_keys: SmallVec<[EpkId; 4]> = dependees
            .iter()
            .map(|d| self.key_for(d.entity(), d.kind()))
            .collect();

        let phase = self.phase.read();
        let lattice = self.registry.get(k).lattice();
        let outcome = st.update(
            eps,
            Some(c),
            dependee_keys.clone(),
            lattice,
            &phase.suppression,
            self.config.debug_checks(),
        );

        self.register_dependees(key, &st, k, &dependees, &dependee_keys, &phase.suppression);

        if let UpdateOutcome::Updated {
            old,
            first_value,
            to_notify,
        } = outcome
        {
            log::trace!(
                target: LOG,
                "{key:?} tightened from {old:?}, waking {} depender(s)",
                to_notify.len()
            );
            self.fire_triggers(&st, &entity, k, first_value);
            let snapshot = st.current();
            self.notify_dependers(key, &snapshot, to_notify);
        }
    }

    fn handle_interim_partial(&self, dependees: Vec<EOptionP>, c: OnUpdateContinuation) {
        if dependees.is_empty() {
            fatal("a value-less interim result without dependees can never resume".into());
        }
        let key = EpkId {
            entity: self.anon_seq.fetch_add(1, Ordering::Relaxed),
            kind: PropertyKindId::ANONYMOUS,
        };
        let st = Arc::new(EpkState::new(EOptionP::epk(
            self.anon_entity.clone(),
            PropertyKindId::ANONYMOUS,
        )));
        self.states.insert(key, st.clone());
        let dependee_keys: SmallVec<[EpkId; 4]> = dependees
            .iter()
            .map(|d| self.key_for(d.entity(), d.kind()))
            .collect();
        st.install_continuation(c, dependee_keys.clone());
        let phase = self.phase.read();
        self.register_dependees(
            key,
            &st,
            PropertyKindId::ANONYMOUS,
            &dependees,
            &dependee_keys,
            &phase.suppression,
        );
    }

    fn handle_partial(&self, entity: Entity, kind: PropertyKindId, update: PartialUpdate) {
        self.ensure_active(kind);
        let (key, st) = self.get_or_create_state(&entity, kind);
        let phase = self.phase.read();
        let lattice = self.registry.get(kind).lattice();
        let outcome = st.partial_update(
            update,
            lattice,
            &phase.suppression,
            self.config.debug_checks(),
        );
        match outcome {
            UpdateOutcome::NoChange => {}
            UpdateOutcome::Updated {
                first_value,
                to_notify,
                ..
            } => {
                self.fire_triggers(&st, &entity, kind, first_value);
                let snapshot = st.current();
                self.notify_dependers(key, &snapshot, to_notify);
            }
            UpdateOutcome::Finalized {
                first_value,
                dependers,
                ..
            } => {
                self.fire_triggers(&st, &entity, kind, first_value);
                let snapshot = st.current();
                self.notify_dependers(key, &snapshot, dependers);
            }
        }
    }

    /// Attach `depender` to each dependee, expecting the extension the
    /// analysis observed. If a dependee has moved in the meantime, the
    /// freshly installed continuation is detached and re-run immediately
    /// with the newer value; this is the standard mechanism for updates that race
    /// with registration. For pairs whose interim notifications are
    /// suppressed the registration tolerates interim movement and only
    /// refuses final dependees.
    fn register_dependees(
        &self,
        depender: EpkId,
        depender_state: &Arc<EpkState>,
        depender_kind: PropertyKindId,
        dependees: &[EOptionP],
        dependee_keys: &[EpkId],
        suppression: &SuppressionMatrix,
    ) {
        for (i, (d, dkey)) in dependees.iter().zip(dependee_keys).enumerate() {
            debug_assert!(d.is_refinable(), "final dependee declared: {d:?}");
            let suppressed = suppression.is_suppressed(depender_kind, d.kind());
            let (_, dst) = self.get_or_create_state(d.entity(), d.kind());
            if let Err(current) = dst.add_depender(d, depender, suppressed) {
                log::trace!(
                    target: LOG,
                    "dependee {dkey:?} moved before registration; re-running {depender:?}"
                );
                // The re-run will declare its dependee set from scratch;
                // roll back the edges installed so far.
                for pkey in dependee_keys.iter().take(i) {
                    if let Some(pst) = self.states.get(pkey).map(|r| r.value().clone()) {
                        pst.remove_depender(depender);
                    }
                }
                if let Some(c) = depender_state.prepare_invoke_c(*dkey) {
                    self.submit_task(Task::Continue {
                        c,
                        dependee: current,
                    });
                }
                break;
            }
        }
    }

    /// Hand the updated extension of `key` to every detached depender whose
    /// continuation is still pending.
    fn notify_dependers(
        &self,
        key: EpkId,
        snapshot: &EOptionP,
        dependers: impl IntoIterator<Item = EpkId>,
    ) {
        for depender in dependers {
            let Some(st) = self.states.get(&depender).map(|r| r.value().clone()) else {
                continue;
            };
            if let Some(c) = st.prepare_invoke_c(key) {
                self.submit_task(Task::Continue {
                    c,
                    dependee: snapshot.clone(),
                });
            }
        }
    }

    fn fire_triggers(
        &self,
        st: &EpkState,
        entity: &Entity,
        kind: PropertyKindId,
        first_value: bool,
    ) {
        if !first_value
            || kind == PropertyKindId::ANONYMOUS
            || self.sealing.load(Ordering::SeqCst)
            || !st.mark_trigger_fired()
        {
            return;
        }
        let fs = self.triggered.read()[kind.index()].clone();
        for f in fs {
            self.submit_task(Task::Compute {
                f,
                entity: entity.clone(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Sealing: fallbacks and cycle resolution
    // ------------------------------------------------------------------

    /// Install the kind fallback as final for every state that was reached
    /// (read or depended upon) but never received a value. Returns the
    /// number of fallbacks installed.
    fn install_fallbacks(&self) -> usize {
        let untouched: Vec<(EpkId, Arc<EpkState>)> = self
            .states
            .iter()
            .filter(|r| r.key().kind != PropertyKindId::ANONYMOUS && r.value().current().is_epk())
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        for (key, st) in &untouched {
            let kind = self.registry.get(key.kind);
            let entity = st.current().entity().clone();
            let p = kind.fallback_for(&entity, key.kind);
            log::debug!(
                target: LOG,
                "installing fallback {p:?} for {key:?} ({})",
                kind.name()
            );
            let outcome = st.final_update(p, kind.lattice(), self.config.debug_checks());
            if let UpdateOutcome::Finalized { dependers, .. } = outcome {
                let snapshot = st.current();
                self.notify_dependers(*key, &snapshot, dependers);
            }
        }
        untouched.len()
    }

    /// Promote still-refinable states to final.
    ///
    /// States without a pending continuation are promoted first and their
    /// dependers notified; this is how dependers whose interim
    /// notifications were suppressed finally observe the value. Once no such
    /// state remains, the residue consists of genuine dependency cycles; the
    /// whole residue is finalized before any notification is scheduled, so
    /// no continuation can observe a half-promoted cycle. Returns the number
    /// of promotions.
    fn promote_refinables(&self) -> usize {
        let refinable: Vec<(EpkId, Arc<EpkState>)> = self
            .states
            .iter()
            .filter(|r| r.key().kind != PropertyKindId::ANONYMOUS && r.value().is_refinable())
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        if refinable.is_empty() {
            return 0;
        }
        let passive: Vec<(EpkId, Arc<EpkState>)> = refinable
            .iter()
            .filter(|(_, st)| !st.has_continuation())
            .cloned()
            .collect();
        let wave = if passive.is_empty() { refinable } else { passive };

        let mut notifications = Vec::with_capacity(wave.len());
        for (key, st) in &wave {
            let current = st.current();
            let kind = self.registry.get(key.kind);
            let resolver = kind
                .cycle_resolution()
                .unwrap_or_else(|| self.config.default_cycle_resolution());
            let p = resolver.resolve(&current);
            log::debug!(
                target: LOG,
                "cycle-resolving {key:?} ({}) to {p:?}",
                kind.name()
            );
            let outcome = st.final_update(p, kind.lattice(), self.config.debug_checks());
            if let UpdateOutcome::Finalized { dependers, .. } = outcome {
                notifications.push((*key, st.current(), dependers));
            }
        }
        let count = notifications.len();
        for (key, snapshot, dependers) in notifications {
            self.notify_dependers(key, &snapshot, dependers);
        }
        count
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn ensure_active(&self, k: PropertyKindId) {
        let phase = self.phase.read();
        if !phase.configured {
            fatal(format!(
                "property kind {k:?} used while no phase is set up"
            ));
        }
        if k.index() >= phase.active.len() || !phase.active[k.index()] {
            fatal(format!(
                "property kind `{}` is not part of the current phase",
                self.registry.get(k).name()
            ));
        }
    }

    fn key_for(&self, e: &Entity, k: PropertyKindId) -> EpkId {
        EpkId {
            entity: self.entities.intern(e),
            kind: k,
        }
    }

    fn get_or_create_state(&self, e: &Entity, k: PropertyKindId) -> (EpkId, Arc<EpkState>) {
        let key = self.key_for(e, k);
        let st = self
            .states
            .entry(key)
            .or_insert_with(|| Arc::new(EpkState::new(EOptionP::epk(e.clone(), k))))
            .clone();
        (key, st)
    }
}

impl fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyStore")
            .field("kinds", &self.registry.len())
            .field("states", &self.states.len())
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
