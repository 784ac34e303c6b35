//! Normalized mirror of the scheduler's resources for the current experiment.
//!
//! The session task is the only writer. Every mutator runs to completion and
//! keeps the id map, insertion order and per-state counters in step; nothing
//! is recomputed lazily.

use schedwatch_core::{
    Experiment, ExperimentReference, ResourceId, ResourceRecord, ResourceState, Tag,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

/// Referential problems reported by reducers. None of them change the store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreWarning {
    #[error("resource {0} already present")]
    DuplicateResource(ResourceId),
    #[error("{operation} for unknown resource {id}")]
    UnknownResource {
        id: ResourceId,
        operation: &'static str,
    },
    #[error("invalid progress {value} for resource {id}")]
    InvalidProgress { id: ResourceId, value: f64 },
}

/// Number of resources in each state, indexed by [`ResourceState::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCounters([usize; 6]);

impl StateCounters {
    pub fn get(&self, state: ResourceState) -> usize {
        self.0[state.index()]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceState, usize)> + '_ {
        ResourceState::ALL.iter().map(|state| (*state, self.get(*state)))
    }

    fn increment(&mut self, state: ResourceState) {
        self.0[state.index()] += 1;
    }

    fn decrement(&mut self, state: ResourceState) {
        let slot = &mut self.0[state.index()];
        *slot = slot.saturating_sub(1);
    }
}

impl fmt::Display for StateCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (state, count) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{state}={count}")?;
        }
        Ok(())
    }
}

/// Shallow update of a known resource. `None` leaves a field alone; the
/// locator is not updatable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUpdate {
    pub state: Option<ResourceState>,
    pub progress: Option<Option<f64>>,
    pub task_id: Option<Option<String>>,
    pub tags: Option<Vec<Tag>>,
}

impl ResourceUpdate {
    pub fn state(state: ResourceState) -> Self {
        Self {
            state: Some(state),
            progress: Some(None),
            ..Self::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(Some(progress)),
            ..Self::default()
        }
    }
}

/// Task id -> task name, and the reverse index used by name filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskIndex {
    names: BTreeMap<String, String>,
    ids_by_name: BTreeMap<String, BTreeSet<String>>,
}

impl TaskIndex {
    pub fn from_names(names: BTreeMap<String, String>) -> Self {
        let mut ids_by_name: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, name) in &names {
            ids_by_name.entry(name.clone()).or_default().insert(id.clone());
        }
        Self { names, ids_by_name }
    }

    pub fn name(&self, task_id: &str) -> Option<&str> {
        self.names.get(task_id).map(String::as_str)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.ids_by_name.keys().map(String::as_str)
    }

    fn ids_for(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.ids_by_name.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone)]
struct StoredResource {
    record: ResourceRecord,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct EntityStore {
    connected: bool,
    resources: HashMap<ResourceId, StoredResource>,
    order: BTreeMap<u64, ResourceId>,
    next_seq: u64,
    counters: StateCounters,
    experiment: Option<Experiment>,
    experiments: Vec<ExperimentReference>,
    tasks: TaskIndex,
    revision: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- queries

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ResourceRecord> {
        self.resources.get(id).map(|stored| &stored.record)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.order.values()
    }

    /// Resources in insertion order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.order
            .values()
            .filter_map(|id| self.resources.get(id).map(|stored| &stored.record))
    }

    pub fn count(&self, state: ResourceState) -> usize {
        self.counters.get(state)
    }

    pub fn counters(&self) -> StateCounters {
        self.counters
    }

    pub fn current_experiment(&self) -> Option<&Experiment> {
        self.experiment.as_ref()
    }

    pub fn experiments(&self) -> &[ExperimentReference] {
        &self.experiments
    }

    pub fn task_name(&self, task_id: &str) -> Option<&str> {
        self.tasks.name(task_id)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.task_names().collect()
    }

    /// Resources belonging to any task with one of `names`, in insertion
    /// order. An empty filter selects everything.
    pub fn resources_in_tasks(&self, names: &[&str]) -> Vec<&ResourceRecord> {
        if names.is_empty() {
            return self.resources().collect();
        }
        let task_ids: BTreeSet<&str> = names
            .iter()
            .filter_map(|name| self.tasks.ids_for(name))
            .flat_map(|ids| ids.iter().map(String::as_str))
            .collect();
        self.resources()
            .filter(|record| {
                record
                    .task_id
                    .as_deref()
                    .is_some_and(|task_id| task_ids.contains(task_id))
            })
            .collect()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    // --- mutations

    pub fn set_connected(&mut self, connected: bool) -> bool {
        if self.connected == connected {
            return false;
        }
        self.connected = connected;
        self.bump();
        true
    }

    /// Drops every resource, the counters and the task index. Connectivity,
    /// the current experiment and the known experiment list are kept.
    pub fn clear(&mut self) {
        self.resources.clear();
        self.order.clear();
        self.counters = StateCounters::default();
        self.tasks = TaskIndex::default();
        self.bump();
    }

    pub fn set_experiment(&mut self, experiment: Experiment) {
        self.experiment = Some(experiment);
        self.bump();
    }

    pub fn set_experiments(&mut self, experiments: Vec<ExperimentReference>) {
        self.experiments = experiments;
        self.bump();
    }

    /// Inserts or refreshes one entry of the known experiment list; new names
    /// go first, matching the server's most-recent-first ordering.
    pub fn add_experiment(&mut self, reference: ExperimentReference) {
        match self
            .experiments
            .iter_mut()
            .find(|known| known.identifier == reference.identifier)
        {
            Some(known) => {
                if reference.timestamp.is_some() {
                    known.timestamp = reference.timestamp;
                }
            }
            None => self.experiments.insert(0, reference),
        }
        self.bump();
    }

    pub fn set_tasks(&mut self, names: BTreeMap<String, String>) {
        self.tasks = TaskIndex::from_names(names);
        self.bump();
    }

    pub fn add_resource(&mut self, mut record: ResourceRecord) -> Result<(), StoreWarning> {
        if self.resources.contains_key(record.id.as_str()) {
            return Err(StoreWarning::DuplicateResource(record.id));
        }
        record.progress = match (record.state, record.progress.and_then(normalize_progress)) {
            (ResourceState::Running, Some(progress)) if progress > 0.0 => Some(progress),
            _ => None,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.counters.increment(record.state);
        self.order.insert(seq, record.id.clone());
        self.resources
            .insert(record.id.clone(), StoredResource { record, seq });
        self.bump();
        Ok(())
    }

    pub fn update_resource(
        &mut self,
        id: &str,
        update: ResourceUpdate,
    ) -> Result<(), StoreWarning> {
        let Some(stored) = self.resources.get_mut(id) else {
            return Err(StoreWarning::UnknownResource {
                id: ResourceId::from(id),
                operation: "update",
            });
        };
        let progress = match update.progress {
            Some(Some(value)) => match normalize_progress(value) {
                Some(progress) => Some(Some(progress)),
                None => {
                    return Err(StoreWarning::InvalidProgress {
                        id: ResourceId::from(id),
                        value,
                    })
                }
            },
            other => other,
        };
        let record = &mut stored.record;
        if let Some(state) = update.state {
            if state != record.state {
                self.counters.decrement(record.state);
                self.counters.increment(state);
                record.state = state;
            }
        }
        if let Some(progress) = progress {
            record.progress = progress;
        }
        if let Some(task_id) = update.task_id {
            record.task_id = task_id;
        }
        if let Some(tags) = update.tags {
            record.tags = tags;
        }
        self.bump();
        Ok(())
    }

    /// New state for a known resource; clears its progress.
    pub fn apply_state_change(
        &mut self,
        id: &str,
        state: ResourceState,
    ) -> Result<(), StoreWarning> {
        self.update_resource(id, ResourceUpdate::state(state))
            .map_err(|warning| with_operation(warning, "state change"))
    }

    pub fn apply_progress(&mut self, id: &str, progress: f64) -> Result<(), StoreWarning> {
        self.update_resource(id, ResourceUpdate::progress(progress))
            .map_err(|warning| with_operation(warning, "progress"))
    }

    pub fn remove_resource(&mut self, id: &str) -> Result<ResourceRecord, StoreWarning> {
        let Some(stored) = self.resources.remove(id) else {
            return Err(StoreWarning::UnknownResource {
                id: ResourceId::from(id),
                operation: "remove",
            });
        };
        self.order.remove(&stored.seq);
        self.counters.decrement(stored.record.state);
        self.bump();
        Ok(stored.record)
    }

    fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    /// Recounts everything from scratch; test-only cross-check of the
    /// incremental bookkeeping.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        let mut recount = StateCounters::default();
        for stored in self.resources.values() {
            recount.increment(stored.record.state);
        }
        if recount != self.counters {
            return Err(format!("counters {} != recount {}", self.counters, recount));
        }
        if self.order.len() != self.resources.len() {
            return Err(format!(
                "order has {} ids, map has {}",
                self.order.len(),
                self.resources.len()
            ));
        }
        for (seq, id) in &self.order {
            match self.resources.get(id) {
                Some(stored) if stored.seq == *seq => {}
                _ => return Err(format!("order entry {seq} -> {id} not in map")),
            }
        }
        Ok(())
    }
}

/// Clamps to `[0, 1]`; rejects NaN and infinities.
pub fn normalize_progress(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value.clamp(0.0, 1.0))
    } else {
        None
    }
}

fn with_operation(warning: StoreWarning, operation: &'static str) -> StoreWarning {
    match warning {
        StoreWarning::UnknownResource { id, .. } => StoreWarning::UnknownResource { id, operation },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: &str, state: ResourceState) -> ResourceRecord {
        ResourceRecord::new(id, format!("/jobs/{id}"), state)
    }

    #[test]
    fn add_state_progress_sequence() {
        let mut store = EntityStore::new();
        store
            .add_resource(record("R1", ResourceState::Waiting))
            .expect("add");
        store
            .apply_state_change("R1", ResourceState::Running)
            .expect("state");
        store.apply_progress("R1", 0.5).expect("progress");

        assert_eq!(store.len(), 1);
        let r1 = store.get("R1").expect("R1");
        assert_eq!(r1.state, ResourceState::Running);
        assert_eq!(r1.progress, Some(0.5));
        assert_eq!(store.count(ResourceState::Waiting), 0);
        assert_eq!(store.count(ResourceState::Running), 1);
        store.check_consistency().expect("consistent");
    }

    #[test]
    fn progress_for_unknown_id_is_a_warning_noop() {
        let mut store = EntityStore::new();
        let revision = store.revision();
        let warning = store.apply_progress("R9", 0.2).expect_err("unknown");
        assert_eq!(
            warning,
            StoreWarning::UnknownResource {
                id: ResourceId::from("R9"),
                operation: "progress",
            }
        );
        assert!(store.is_empty());
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn duplicate_add_keeps_first_record() {
        let mut store = EntityStore::new();
        store
            .add_resource(record("R1", ResourceState::Waiting))
            .expect("add");
        let warning = store
            .add_resource(record("R1", ResourceState::Done))
            .expect_err("duplicate");
        assert_eq!(warning, StoreWarning::DuplicateResource(ResourceId::from("R1")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("R1").map(|r| r.state), Some(ResourceState::Waiting));
        assert_eq!(store.count(ResourceState::Done), 0);
    }

    #[test]
    fn add_then_remove_restores_counters_and_order() {
        let mut store = EntityStore::new();
        store.add_resource(record("A", ResourceState::Ready)).expect("add");
        let before = store.counters();
        let ids_before: Vec<String> = store.ids().map(|id| id.to_string()).collect();

        store.add_resource(record("B", ResourceState::Error)).expect("add");
        store.remove_resource("B").expect("remove");

        assert_eq!(store.counters(), before);
        let ids_after: Vec<String> = store.ids().map(|id| id.to_string()).collect();
        assert_eq!(ids_after, ids_before);
        assert!(store.remove_resource("B").is_err());
    }

    #[test]
    fn state_change_clears_progress() {
        let mut store = EntityStore::new();
        let mut running = record("R1", ResourceState::Running);
        running.progress = Some(0.4);
        store.add_resource(running).expect("add");
        assert_eq!(store.get("R1").and_then(|r| r.progress), Some(0.4));

        store
            .apply_state_change("R1", ResourceState::Done)
            .expect("state");
        assert_eq!(store.get("R1").and_then(|r| r.progress), None);
    }

    #[test]
    fn add_keeps_progress_only_while_running() {
        let mut store = EntityStore::new();
        let mut waiting = record("W", ResourceState::Waiting);
        waiting.progress = Some(0.3);
        let mut idle = record("I", ResourceState::Running);
        idle.progress = Some(0.0);
        let mut over = record("O", ResourceState::Running);
        over.progress = Some(3.0);
        store.add_resource(waiting).expect("add");
        store.add_resource(idle).expect("add");
        store.add_resource(over).expect("add");

        assert_eq!(store.get("W").and_then(|r| r.progress), None);
        assert_eq!(store.get("I").and_then(|r| r.progress), None);
        assert_eq!(store.get("O").and_then(|r| r.progress), Some(1.0));
    }

    #[test]
    fn non_finite_progress_is_rejected() {
        let mut store = EntityStore::new();
        store
            .add_resource(record("R1", ResourceState::Running))
            .expect("add");
        let warning = store.apply_progress("R1", f64::NAN).expect_err("nan");
        assert!(matches!(warning, StoreWarning::InvalidProgress { .. }));
        store.apply_progress("R1", -0.5).expect("clamped");
        assert_eq!(store.get("R1").and_then(|r| r.progress), Some(0.0));
    }

    #[test]
    fn unknown_id_wins_over_invalid_progress() {
        let mut store = EntityStore::new();
        let warning = store.apply_progress("R9", f64::NAN).expect_err("unknown");
        assert_eq!(
            warning,
            StoreWarning::UnknownResource {
                id: ResourceId::from("R9"),
                operation: "progress",
            }
        );
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn update_merges_supplied_fields_only() {
        let mut store = EntityStore::new();
        let mut original = record("R1", ResourceState::Waiting);
        original.task_id = Some("3".to_string());
        store.add_resource(original).expect("add");

        store
            .update_resource(
                "R1",
                ResourceUpdate {
                    tags: Some(vec![Tag {
                        name: "seed".to_string(),
                        value: serde_json::json!(1),
                    }]),
                    ..ResourceUpdate::default()
                },
            )
            .expect("update");

        let r1 = store.get("R1").expect("R1");
        assert_eq!(r1.state, ResourceState::Waiting);
        assert_eq!(r1.task_id.as_deref(), Some("3"));
        assert_eq!(r1.locator, "/jobs/R1");
        assert_eq!(r1.tags.len(), 1);
    }

    #[test]
    fn clear_drops_resources_and_tasks_but_keeps_context() {
        let mut store = EntityStore::new();
        store.set_connected(true);
        store.set_experiment(Experiment::new("mnist", 5));
        store.set_tasks(BTreeMap::from([("1".to_string(), "train".to_string())]));
        store.add_resource(record("R1", ResourceState::Done)).expect("add");

        store.clear();

        assert!(store.is_empty());
        assert_eq!(store.counters().total(), 0);
        assert!(store.task_names().is_empty());
        assert!(store.is_connected());
        assert_eq!(store.current_experiment(), Some(&Experiment::new("mnist", 5)));
        store.check_consistency().expect("consistent");
    }

    #[test]
    fn resources_filter_by_task_name() {
        let mut store = EntityStore::new();
        store.set_tasks(BTreeMap::from([
            ("1".to_string(), "train".to_string()),
            ("2".to_string(), "evaluate".to_string()),
            ("3".to_string(), "train".to_string()),
        ]));
        for (id, task) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "9")] {
            let mut resource = record(id, ResourceState::Waiting);
            resource.task_id = Some(task.to_string());
            store.add_resource(resource).expect("add");
        }

        let train: Vec<&str> = store
            .resources_in_tasks(&["train"])
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(train, vec!["a", "c"]);
        assert_eq!(store.resources_in_tasks(&[]).len(), 4);
        assert_eq!(store.task_name("2"), Some("evaluate"));
        assert_eq!(store.task_names(), vec!["evaluate", "train"]);
    }

    #[test]
    fn add_experiment_upserts_known_list() {
        let mut store = EntityStore::new();
        store.set_experiments(vec![ExperimentReference::new("a"), ExperimentReference::new("b")]);
        store.add_experiment(ExperimentReference {
            identifier: "b".to_string(),
            timestamp: Some(9),
        });
        store.add_experiment(ExperimentReference::new("c"));

        let names: Vec<&str> = store
            .experiments()
            .iter()
            .map(|e| e.identifier.as_str())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert_eq!(store.experiments()[2].timestamp, Some(9));
    }

    #[test]
    fn connectivity_changes_bump_revision_once() {
        let mut store = EntityStore::new();
        assert!(store.set_connected(true));
        let revision = store.revision();
        assert!(!store.set_connected(true));
        assert_eq!(store.revision(), revision);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, ResourceState),
        State(u8, ResourceState),
        Progress(u8, f64),
        Remove(u8),
        Clear,
    }

    fn any_state() -> impl Strategy<Value = ResourceState> {
        prop::sample::select(ResourceState::ALL.to_vec())
    }

    fn any_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..12, any_state()).prop_map(|(id, state)| Op::Add(id, state)),
            3 => (0u8..12, any_state()).prop_map(|(id, state)| Op::State(id, state)),
            2 => (0u8..12, -1.0f64..2.0).prop_map(|(id, p)| Op::Progress(id, p)),
            2 => (0u8..12).prop_map(Op::Remove),
            1 => Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn counters_match_recount_after_every_event(ops in prop::collection::vec(any_op(), 0..64)) {
            let mut store = EntityStore::new();
            for op in ops {
                let id = |n: u8| format!("R{n}");
                match op {
                    Op::Add(n, state) => { let _ = store.add_resource(record(&id(n), state)); }
                    Op::State(n, state) => { let _ = store.apply_state_change(&id(n), state); }
                    Op::Progress(n, p) => { let _ = store.apply_progress(&id(n), p); }
                    Op::Remove(n) => { let _ = store.remove_resource(&id(n)); }
                    Op::Clear => store.clear(),
                }
                prop_assert!(store.check_consistency().is_ok(), "{:?}", store.check_consistency());
                prop_assert_eq!(store.counters().total(), store.len());
                if let Some(p) = store.resources().find_map(|r| r.progress) {
                    prop_assert!((0.0..=1.0).contains(&p));
                }
            }
        }
    }
}
