use petgraph::{algo::tarjan_scc, graph::DiGraph};
use rustc_hash::{FxHashMap, FxHashSet};
use strata_store::{
    PhaseReport, PhaseSetup, PropertyKindId, PropertyKindRegistry, PropertyStore,
};

use crate::{AnalysisScheduler, ExecutionError, ScheduleError};

const LOG: &str = "scheduler";

/// The mode in which an analysis produces a kind. At most one
/// non-collaborative producer per kind is admitted into a phase;
/// collaborative contributors are unrestricted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Role {
    Eager,
    Lazy,
    Collaborative,
}

/// A set of analyses to be partitioned into phases and run against a store.
#[derive(Default)]
pub struct AnalysisScenario {
    analyses: Vec<Box<dyn AnalysisScheduler>>,
}

impl AnalysisScenario {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analysis(mut self, analysis: impl AnalysisScheduler + 'static) -> Self {
        self.analyses.push(Box::new(analysis));
        self
    }

    pub fn add(&mut self, analysis: Box<dyn AnalysisScheduler>) {
        self.analyses.push(analysis);
    }

    pub fn len(&self) -> usize {
        self.analyses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyses.is_empty()
    }

    /// Partition the scenario into phases.
    ///
    /// A producer → consumer graph is built from the manifests and condensed
    /// into strongly connected components; components are visited in
    /// topological order (producers first) and greedily merged into the
    /// current phase for as long as the phase's producer roles stay
    /// consistent. Kind cycles within one phase are fine (the store's cycle
    /// resolution handles them), but two non-collaborative producers of the
    /// same kind inside one component can never be separated, which is
    /// reported as an inconsistent partitioning.
    pub fn compute_schedule(
        self,
        registry: &PropertyKindRegistry,
    ) -> Result<Schedule, ScheduleError> {
        let n = self.analyses.len();

        // Per-analysis manifests, validated against the registry.
        let mut derived: Vec<Vec<(PropertyKindId, Role)>> = Vec::with_capacity(n);
        let mut used: Vec<Vec<PropertyKindId>> = Vec::with_capacity(n);
        for a in &self.analyses {
            let check = |kind: PropertyKindId| -> Result<PropertyKindId, ScheduleError> {
                if registry.contains(kind) {
                    Ok(kind)
                } else {
                    Err(ScheduleError::UnknownKind {
                        analysis: a.name().to_string(),
                        kind,
                    })
                }
            };
            let mut ds = Vec::new();
            for b in a.derives_eagerly() {
                ds.push((check(b.kind)?, Role::Eager));
            }
            if let Some(b) = a.derives_lazily() {
                ds.push((check(b.kind)?, Role::Lazy));
            }
            for b in a.derives_collaboratively() {
                ds.push((check(b.kind)?, Role::Collaborative));
            }
            let mut us = Vec::new();
            for b in a.uses() {
                us.push(check(b.kind)?);
            }
            for (depender, dependee) in a.suppress_interim_updates() {
                check(depender)?;
                check(dependee)?;
            }
            derived.push(ds);
            used.push(us);
        }

        // Producer → consumer edges.
        let mut producers: FxHashMap<PropertyKindId, Vec<usize>> = FxHashMap::default();
        for (i, ds) in derived.iter().enumerate() {
            for (kind, _) in ds {
                producers.entry(*kind).or_default().push(i);
            }
        }
        let mut graph = DiGraph::<usize, ()>::new();
        let nodes: Vec<_> = (0..n).map(|i| graph.add_node(i)).collect();
        let mut seen = FxHashSet::default();
        for (consumer, us) in used.iter().enumerate() {
            for kind in us {
                for &producer in producers.get(kind).map(Vec::as_slice).unwrap_or(&[]) {
                    if producer != consumer && seen.insert((producer, consumer)) {
                        graph.add_edge(nodes[producer], nodes[consumer], ());
                    }
                }
            }
        }

        // Condense into components, producers first.
        let components: Vec<Vec<usize>> = tarjan_scc(&graph)
            .into_iter()
            .rev()
            .map(|scc| scc.into_iter().map(|ix| graph[ix]).collect())
            .collect();

        // A component with two non-collaborative producers of one kind can
        // never be made consistent by splitting.
        for component in &components {
            let mut producer_of: FxHashMap<PropertyKindId, usize> = FxHashMap::default();
            for &member in component {
                for (kind, role) in &derived[member] {
                    if *role == Role::Collaborative {
                        continue;
                    }
                    if let Some(&first) = producer_of.get(kind) {
                        return Err(ScheduleError::InconsistentPhasePartitioning {
                            kind: registry.get(*kind).name().to_string(),
                            first: self.analyses[first].name().to_string(),
                            second: self.analyses[member].name().to_string(),
                        });
                    }
                    producer_of.insert(*kind, member);
                }
            }
        }

        // Greedy merge in topological order.
        let mut phases: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        let mut current_producers: FxHashSet<PropertyKindId> = FxHashSet::default();
        for component in components {
            let candidate: FxHashSet<PropertyKindId> = component
                .iter()
                .flat_map(|&m| derived[m].iter())
                .filter(|(_, role)| *role != Role::Collaborative)
                .map(|(kind, _)| *kind)
                .collect();
            let clash = candidate.iter().any(|k| current_producers.contains(k));
            if clash && !current.is_empty() {
                phases.push(core::mem::take(&mut current));
                current_producers.clear();
            }
            current_producers.extend(candidate);
            current.extend(component);
        }
        if !current.is_empty() {
            phases.push(current);
        }

        let specs = phases
            .into_iter()
            .map(|members| {
                let mut kinds: FxHashSet<PropertyKindId> = FxHashSet::default();
                let mut suppression = Vec::new();
                for &m in &members {
                    kinds.extend(derived[m].iter().map(|(kind, _)| *kind));
                    kinds.extend(used[m].iter().copied());
                    suppression.extend(self.analyses[m].suppress_interim_updates());
                }
                let mut kinds: Vec<_> = kinds.into_iter().collect();
                kinds.sort();
                PhaseSpec {
                    members,
                    kinds,
                    suppression,
                }
            })
            .collect();

        Ok(Schedule {
            analyses: self.analyses,
            phases: specs,
        })
    }
}

struct PhaseSpec {
    members: Vec<usize>,
    kinds: Vec<PropertyKindId>,
    suppression: Vec<(PropertyKindId, PropertyKindId)>,
}

/// A validated phase partitioning of an [AnalysisScenario], ready to run.
pub struct Schedule {
    analyses: Vec<Box<dyn AnalysisScheduler>>,
    phases: Vec<PhaseSpec>,
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("analyses", &self.analyses.len())
            .field("phases", &self.phases.len())
            .finish()
    }
}

impl Schedule {
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// The analysis names of phase `i`, in scheduling order.
    pub fn phase_members(&self, i: usize) -> Vec<&str> {
        self.phases[i]
            .members
            .iter()
            .map(|&m| self.analyses[m].name())
            .collect()
    }

    /// Run every phase in order against `store`: configure the phase, walk
    /// the members through their lifecycle callbacks, and wait for the store
    /// to complete. Returns one [PhaseReport] per phase.
    pub fn execute(&self, store: &PropertyStore) -> Result<Vec<PhaseReport>, ExecutionError> {
        let mut reports = Vec::with_capacity(self.phases.len());
        for (i, phase) in self.phases.iter().enumerate() {
            log::info!(
                target: LOG,
                "phase {}/{}: {:?}",
                i + 1,
                self.phases.len(),
                self.phase_members(i)
            );
            let mut setup = PhaseSetup::new(phase.kinds.iter().copied());
            for (depender, dependee) in &phase.suppression {
                setup = setup.with_suppressed(*depender, *dependee);
            }
            store.setup_phase(setup)?;

            let members: Vec<&dyn AnalysisScheduler> = phase
                .members
                .iter()
                .map(|&m| &*self.analyses[m])
                .collect();
            for a in &members {
                a.init(store);
            }
            for a in &members {
                a.before_schedule(store);
            }
            for a in &members {
                a.start(store);
            }
            for a in &members {
                a.after_phase_scheduling(store);
            }
            let report = store.wait_on_phase_completion()?;
            log::debug!(
                target: LOG,
                "phase {} finished: {:?}, {} incomplete",
                i + 1,
                report.outcome,
                report.incomplete.len()
            );
            for a in &members {
                a.after_phase_completion(store);
            }
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strata_store::{Property, PropertyKind, PropertyKindRegistry, PropertyLattice};

    use super::*;
    use crate::PropertyBound;

    struct Opaque;

    impl PropertyLattice for Opaque {
        fn lub(&self, _a: &dyn Property, _b: &dyn Property) -> Arc<dyn Property> {
            unreachable!("scheduling never joins")
        }

        fn eq(&self, _a: &dyn Property, _b: &dyn Property) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Manifest {
        name: &'static str,
        uses: Vec<PropertyBound>,
        eager: Vec<PropertyBound>,
        lazy: Option<PropertyBound>,
        collab: Vec<PropertyBound>,
    }

    impl Manifest {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Default::default()
            }
        }
    }

    impl AnalysisScheduler for Manifest {
        fn name(&self) -> &str {
            self.name
        }

        fn uses(&self) -> Vec<PropertyBound> {
            self.uses.clone()
        }

        fn derives_eagerly(&self) -> Vec<PropertyBound> {
            self.eager.clone()
        }

        fn derives_lazily(&self) -> Option<PropertyBound> {
            self.lazy
        }

        fn derives_collaboratively(&self) -> Vec<PropertyBound> {
            self.collab.clone()
        }

        fn start(&self, _store: &PropertyStore) {}
    }

    fn registry(kinds: usize) -> (PropertyKindRegistry, Vec<PropertyKindId>) {
        let mut registry = PropertyKindRegistry::new();
        let ids = (0..kinds)
            .map(|i| registry.register(PropertyKind::new(format!("P{i}"), Opaque)))
            .collect();
        (registry, ids)
    }

    #[test]
    fn a_chain_fits_in_one_phase() {
        let (registry, k) = registry(3);
        let schedule = AnalysisScenario::new()
            .with_analysis(Manifest {
                eager: vec![PropertyBound::lub(k[0])],
                ..Manifest::named("a")
            })
            .with_analysis(Manifest {
                uses: vec![PropertyBound::ub(k[0])],
                eager: vec![PropertyBound::lub(k[1])],
                ..Manifest::named("b")
            })
            .with_analysis(Manifest {
                uses: vec![PropertyBound::ub(k[1])],
                lazy: Some(PropertyBound::lub(k[2])),
                ..Manifest::named("c")
            })
            .compute_schedule(&registry)
            .unwrap();
        assert_eq!(schedule.phase_count(), 1);
        assert_eq!(schedule.phase_members(0), ["a", "b", "c"]);
    }

    #[test]
    fn conflicting_producers_split_into_phases() {
        let (registry, k) = registry(1);
        let schedule = AnalysisScenario::new()
            .with_analysis(Manifest {
                eager: vec![PropertyBound::lub(k[0])],
                ..Manifest::named("first")
            })
            .with_analysis(Manifest {
                eager: vec![PropertyBound::lub(k[0])],
                ..Manifest::named("second")
            })
            .compute_schedule(&registry)
            .unwrap();
        assert_eq!(schedule.phase_count(), 2);
        assert_eq!(schedule.phase_members(0).len(), 1);
        assert_eq!(schedule.phase_members(1).len(), 1);
    }

    #[test]
    fn collaborative_producers_share_a_phase() {
        let (registry, k) = registry(1);
        let schedule = AnalysisScenario::new()
            .with_analysis(Manifest {
                collab: vec![PropertyBound::lub(k[0])],
                ..Manifest::named("callers")
            })
            .with_analysis(Manifest {
                collab: vec![PropertyBound::lub(k[0])],
                ..Manifest::named("callees")
            })
            .compute_schedule(&registry)
            .unwrap();
        assert_eq!(schedule.phase_count(), 1);
    }

    #[test]
    fn kind_cycles_stay_in_one_phase() {
        let (registry, k) = registry(2);
        let schedule = AnalysisScenario::new()
            .with_analysis(Manifest {
                uses: vec![PropertyBound::ub(k[1])],
                eager: vec![PropertyBound::lub(k[0])],
                ..Manifest::named("forward")
            })
            .with_analysis(Manifest {
                uses: vec![PropertyBound::ub(k[0])],
                eager: vec![PropertyBound::lub(k[1])],
                ..Manifest::named("backward")
            })
            .compute_schedule(&registry)
            .unwrap();
        assert_eq!(schedule.phase_count(), 1);
        assert_eq!(schedule.phase_members(0).len(), 2);
    }

    #[test]
    fn conflicts_inside_a_cycle_are_rejected() {
        let (registry, k) = registry(3);
        let err = AnalysisScenario::new()
            .with_analysis(Manifest {
                uses: vec![PropertyBound::ub(k[2])],
                eager: vec![PropertyBound::lub(k[0]), PropertyBound::lub(k[1])],
                ..Manifest::named("left")
            })
            .with_analysis(Manifest {
                uses: vec![PropertyBound::ub(k[1])],
                eager: vec![PropertyBound::lub(k[0]), PropertyBound::lub(k[2])],
                ..Manifest::named("right")
            })
            .compute_schedule(&registry)
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::InconsistentPhasePartitioning { .. }
        ));
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let (registry, _) = registry(1);
        let (_bigger, foreign) = self::registry(3);
        let err = AnalysisScenario::new()
            .with_analysis(Manifest {
                uses: vec![PropertyBound::ub(foreign[2])],
                ..Manifest::named("astray")
            })
            .compute_schedule(&registry)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::UnknownKind { .. }));
    }
}
