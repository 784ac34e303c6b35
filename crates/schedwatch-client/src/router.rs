use crate::store::{EntityStore, StoreWarning};
use schedwatch_core::rpc::{EventKind, ServerEvent};
use schedwatch_core::{Experiment, ExperimentReference};

/// What applying one push event did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Applied,
    /// Event was valid but not for the current experiment.
    Skipped,
    Warning(StoreWarning),
    /// A new run of the current experiment appeared; it must be reloaded.
    Reload(Experiment),
}

/// Reducer dispatch: one store mutation per event kind.
pub fn apply_event(store: &mut EntityStore, event: ServerEvent) -> EventOutcome {
    let result = match event {
        ServerEvent::ResourceAdded(record) => store.add_resource(record),
        ServerEvent::StateChanged(payload) => {
            store.apply_state_change(payload.id.as_str(), payload.state)
        }
        ServerEvent::Progress(payload) => {
            store.apply_progress(payload.id.as_str(), payload.progress)
        }
        ServerEvent::ResourceRemoved(payload) => {
            store.remove_resource(payload.id.as_str()).map(|_| ())
        }
        ServerEvent::ExperimentResourceAdded(payload) => {
            let current = store
                .current_experiment()
                .is_some_and(|experiment| experiment.matches(&payload.name, payload.timestamp));
            if !current {
                return EventOutcome::Skipped;
            }
            store.add_resource(payload.resource)
        }
        ServerEvent::ExperimentAdded(payload) => {
            store.add_experiment(ExperimentReference {
                identifier: payload.name.clone(),
                timestamp: Some(payload.timestamp),
            });
            let current = store
                .current_experiment()
                .is_some_and(|experiment| experiment.name == payload.name);
            if current {
                return EventOutcome::Reload(Experiment::new(payload.name, payload.timestamp));
            }
            return EventOutcome::Applied;
        }
    };
    match result {
        Ok(()) => EventOutcome::Applied,
        Err(warning) => EventOutcome::Warning(warning),
    }
}

/// Events whose unknown-id case is expected traffic rather than a problem.
pub fn is_quiet_miss(kind: EventKind, outcome: &EventOutcome) -> bool {
    matches!(
        (kind, outcome),
        (
            EventKind::ResourceRemoved,
            EventOutcome::Warning(StoreWarning::UnknownResource { .. })
        )
    )
}
