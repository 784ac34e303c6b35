//! Session controller: the single task that owns the connection, the
//! pending-call table and the write side of the entity store.
//!
//! UI code talks to it through a cloneable [`SessionHandle`]: commands go
//! over a mailbox, reads take the shared store lock, and changes are
//! announced on a `watch` revision channel plus a `broadcast` of notices.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, Epoch};
use crate::dispatcher::{Continuation, Dispatcher, Reply, RequestIds, Resolution};
use crate::error::CallError;
use crate::router::{self, EventOutcome};
use crate::store::EntityStore;
use schedwatch_core::rpc::{
    decode_inbound, peek_response_id, Inbound, RequestId, RpcRequest, ServerEvent,
};
use schedwatch_core::{Experiment, ExperimentReference, ExperimentSnapshot};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NOTICE_CAPACITY: usize = 64;

pub type SharedStore = Arc<RwLock<EntityStore>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Transient message for the operator (toast-style).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Per-call deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallTimeout {
    /// Use the configured default.
    #[default]
    Default,
    After(Duration),
    Never,
}

#[derive(Debug)]
enum Command {
    Call {
        id: RequestId,
        method: String,
        params: Value,
        timeout: CallTimeout,
        reply: Reply,
    },
    Notify {
        method: String,
        params: Value,
    },
    Cancel {
        id: RequestId,
    },
    SelectExperiment(Experiment),
    Connect,
    Reconnect,
    Disconnect,
    Shutdown,
}

/// Calls whose results the session consumes itself.
#[derive(Debug)]
enum InternalCall {
    Listen,
    LatestNames,
    ExperimentResources { generation: u64 },
}

pub struct Session {
    config: ClientConfig,
    connection: Connection,
    dispatcher: Dispatcher<InternalCall>,
    store: SharedStore,
    revisions: watch::Sender<u64>,
    notices: broadcast::Sender<Notice>,
    commands: mpsc::Receiver<Command>,
    connection_events: mpsc::Receiver<ConnectionEvent>,
    selected: Option<Experiment>,
    load_generation: u64,
    auto_reconnect: bool,
    reconnect_delay: Option<Duration>,
    reconnect_at: Option<Instant>,
}

impl Session {
    /// Starts the session task and opens the first connection.
    pub fn spawn(config: ClientConfig) -> (SessionHandle, JoinHandle<()>) {
        let capacity = config.queue_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let store: SharedStore = Arc::new(RwLock::new(EntityStore::new()));
        let (revision_tx, revision_rx) = watch::channel(0);
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let ids = RequestIds::new();

        let session = Session {
            connection: Connection::new(&config, event_tx),
            dispatcher: Dispatcher::new(ids.clone()),
            store: store.clone(),
            revisions: revision_tx,
            notices: notice_tx.clone(),
            commands: command_rx,
            connection_events: event_rx,
            selected: config.experiment.clone(),
            load_generation: 0,
            auto_reconnect: true,
            reconnect_delay: None,
            reconnect_at: None,
            config,
        };
        let handle = SessionHandle {
            commands: command_tx,
            store,
            revisions: revision_rx,
            notices: notice_tx,
            ids,
        };
        (handle, tokio::spawn(session.run()))
    }

    async fn run(mut self) {
        info!(event = "session_start", url = %self.config.url);
        self.connection.open();
        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                Some(event) = self.connection_events.recv() => {
                    self.handle_connection_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = sleep_until(wakeup) => {
                    self.handle_timers(Instant::now()).await;
                }
            }
        }
        self.stop().await;
    }

    fn next_wakeup(&self) -> Option<Instant> {
        match (self.dispatcher.next_deadline(), self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if !self.connection.accept(&event) {
            debug!(
                "connection_event_stale: epoch={} current={} state={}",
                event.epoch(),
                self.connection.epoch(),
                self.connection.state().as_str()
            );
            return;
        }
        match event {
            ConnectionEvent::Opened { epoch } => self.on_open(epoch).await,
            ConnectionEvent::Message { text, .. } => self.on_message(&text).await,
            ConnectionEvent::Closed { epoch, reason } => self.on_close(epoch, reason).await,
        }
    }

    async fn on_open(&mut self, epoch: Epoch) {
        self.reconnect_delay = None;
        self.reconnect_at = None;
        self.with_store(|store| store.set_connected(true)).await;
        info!(event = "session_connected", epoch);
        self.notice(NoticeLevel::Info, format!("connected to {}", self.config.url));
        self.issue_internal("listen", json!({}), InternalCall::Listen);
        self.issue_internal("experiments.latest-names", json!({}), InternalCall::LatestNames);
    }

    async fn on_close(&mut self, epoch: Epoch, reason: String) {
        self.with_store(|store| store.set_connected(false)).await;
        warn!("session_disconnected: epoch={epoch} {reason}");
        self.fail_pending(CallError::ConnectionClosed).await;
        self.notice(NoticeLevel::Error, format!("connection closed: {reason}"));
        if !self.auto_reconnect {
            return;
        }
        if let Some(delay) = self.config.reconnect.next_delay(self.reconnect_delay) {
            self.reconnect_delay = Some(delay);
            self.reconnect_at = Some(Instant::now() + delay);
            info!(event = "reconnect_scheduled", delay_ms = delay.as_millis() as u64);
        }
    }

    async fn on_message(&mut self, text: &str) {
        match decode_inbound(text, self.config.max_inbound_bytes) {
            Ok(Inbound::Response { id, result }) => self.settle(id, Ok(result)).await,
            Ok(Inbound::Error { id, error }) => {
                if id.is_none() {
                    warn!("server_error_uncorrelated: {error}");
                    return;
                }
                self.settle(id, Err(CallError::from(error))).await;
            }
            Ok(Inbound::Event(event)) => self.on_event(event).await,
            Ok(Inbound::UnknownEvent { name }) => warn!("unknown_event_ignored: {name}"),
            Err(err) => match peek_response_id(text) {
                Some(id) => {
                    warn!("response_undecodable: id={id} {err}");
                    self.settle(Some(id), Err(CallError::Frame(err))).await;
                }
                None => warn!("inbound_dropped: {err}"),
            },
        }
    }

    async fn settle(&mut self, id: Option<RequestId>, outcome: Result<Value, CallError>) {
        let Some(id) = id else {
            warn!("response_without_id_dropped");
            return;
        };
        match self.dispatcher.complete(id, outcome) {
            Resolution::Unknown => warn!("response_unknown_id: id={id}"),
            resolution => self.handle_resolution(resolution).await,
        }
    }

    async fn on_event(&mut self, event: ServerEvent) {
        let kind = event.kind();
        let outcome = self.with_store(|store| router::apply_event(store, event)).await;
        let quiet = router::is_quiet_miss(kind, &outcome);
        match outcome {
            EventOutcome::Applied => debug!(event = "event_applied", kind = %kind),
            EventOutcome::Skipped => debug!(event = "event_skipped", kind = %kind),
            EventOutcome::Warning(warning) => {
                if quiet {
                    debug!("event_noop: kind={kind} {warning}");
                } else {
                    warn!("store_warning: kind={kind} {warning}");
                }
            }
            EventOutcome::Reload(experiment) => {
                info!(
                    event = "experiment_new_run",
                    name = %experiment.name,
                    timestamp = experiment.timestamp
                );
                if let Some(selected) = self.selected.as_mut() {
                    if selected.name == experiment.name {
                        *selected = experiment.clone();
                    }
                }
                self.load_experiment(experiment).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                id,
                method,
                params,
                timeout,
                reply,
            } => {
                let timeout = match timeout {
                    CallTimeout::Default => self.config.call_timeout,
                    CallTimeout::After(timeout) => Some(timeout),
                    CallTimeout::Never => None,
                };
                let request = RpcRequest::call(id, method.as_str(), params);
                if let Err(err) = self.connection.send(&request) {
                    self.report_failure(&method, &err);
                    let _ = reply.send(Err(err));
                    return;
                }
                debug!(event = "call_sent", id = %id, method = %method);
                self.dispatcher
                    .register(id, method, Continuation::Reply(reply), timeout, Instant::now());
            }
            Command::Notify { method, params } => {
                let request = RpcRequest::notify(method.as_str(), params);
                if let Err(err) = self.connection.send(&request) {
                    warn!("notify_dropped: method={method} {err}");
                }
            }
            Command::Cancel { id } => {
                if self.dispatcher.cancel(id) {
                    debug!(event = "call_cancelled", id = %id);
                }
            }
            Command::SelectExperiment(experiment) => {
                self.selected = Some(experiment.clone());
                self.load_experiment(experiment).await;
            }
            Command::Connect => {
                self.auto_reconnect = true;
                self.reconnect_at = None;
                self.connection.open();
            }
            Command::Reconnect => {
                self.auto_reconnect = true;
                self.reconnect_at = None;
                self.reconnect_delay = None;
                self.close_connection("reconnect requested").await;
                self.connection.open();
            }
            Command::Disconnect => {
                self.auto_reconnect = false;
                self.reconnect_at = None;
                self.close_connection("disconnect requested").await;
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    async fn handle_timers(&mut self, now: Instant) {
        for resolution in self.dispatcher.expire(now) {
            self.handle_resolution(resolution).await;
        }
        if let Some(at) = self.reconnect_at {
            if at <= now {
                self.reconnect_at = None;
                if self.connection.state() == ConnectionState::Closed {
                    info!(event = "reconnect_attempt");
                    self.connection.open();
                }
            }
        }
    }

    async fn handle_resolution(&mut self, resolution: Resolution<InternalCall>) {
        match resolution {
            Resolution::Replied {
                method,
                delivered,
                failure,
            } => {
                if let Some(err) = failure {
                    self.report_failure(&method, &err);
                }
                if !delivered {
                    debug!("call_result_discarded: method={method}");
                }
            }
            Resolution::Internal {
                method,
                continuation,
                outcome,
            } => match outcome {
                Ok(result) => self.on_internal_result(continuation, result).await,
                Err(CallError::ConnectionClosed) | Err(CallError::SessionStopped) => {
                    debug!("internal_call_abandoned: method={method}");
                }
                Err(err) => self.report_failure(&method, &err),
            },
            Resolution::Unknown => {}
        }
    }

    async fn on_internal_result(&mut self, continuation: InternalCall, result: Value) {
        match continuation {
            InternalCall::Listen => debug!(event = "listen_ok"),
            InternalCall::LatestNames => self.on_latest_names(result).await,
            InternalCall::ExperimentResources { generation } => {
                self.on_snapshot(generation, result).await
            }
        }
    }

    async fn on_latest_names(&mut self, result: Value) {
        let references: Vec<ExperimentReference> = match serde_json::from_value(result) {
            Ok(references) => references,
            Err(err) => {
                self.report_failure(
                    "experiments.latest-names",
                    &CallError::Decode(err.to_string()),
                );
                return;
            }
        };
        let latest = references
            .first()
            .map(|reference| Experiment::new(reference.identifier.clone(), 0));
        let known = references.len();
        self.with_store(|store| store.set_experiments(references)).await;
        debug!(event = "experiments_listed", known);

        match self.selected.clone().or(latest) {
            Some(experiment) => self.load_experiment(experiment).await,
            None => info!(event = "no_experiments"),
        }
    }

    /// Clears the store, makes `experiment` current and requests its snapshot.
    async fn load_experiment(&mut self, experiment: Experiment) {
        self.load_generation += 1;
        let generation = self.load_generation;
        let params = json!({
            "identifier": experiment.name,
            "timestamp": experiment.timestamp,
        });
        info!(
            event = "experiment_load",
            name = %experiment.name,
            timestamp = experiment.timestamp,
            generation
        );
        self.with_store(|store| {
            store.clear();
            store.set_experiment(experiment);
        })
        .await;
        if !self.connection.is_open() {
            debug!("experiment_load_deferred: generation={generation}");
            return;
        }
        self.issue_internal(
            "experiments.resources",
            params,
            InternalCall::ExperimentResources { generation },
        );
    }

    async fn on_snapshot(&mut self, generation: u64, result: Value) {
        if generation != self.load_generation {
            debug!(
                "snapshot_stale: generation={generation} current={}",
                self.load_generation
            );
            return;
        }
        let snapshot: ExperimentSnapshot = match serde_json::from_value(result) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.report_failure("experiments.resources", &CallError::Decode(err.to_string()));
                return;
            }
        };
        let (loaded, duplicates) = self
            .with_store(move |store| {
                if let Some(info) = snapshot.experiment {
                    store.set_experiment(Experiment::new(info.name, info.timestamp));
                }
                store.set_tasks(snapshot.tasks);
                let mut duplicates = 0usize;
                for record in snapshot.resources {
                    if let Err(warning) = store.add_resource(record) {
                        debug!("snapshot_resource_skipped: {warning}");
                        duplicates += 1;
                    }
                }
                (store.len(), duplicates)
            })
            .await;
        info!(event = "experiment_loaded", generation, resources = loaded, duplicates);
    }

    fn issue_internal(&mut self, method: &str, params: Value, continuation: InternalCall) {
        let id = self.dispatcher.allocate_id();
        let request = RpcRequest::call(id, method, params);
        match self.connection.send(&request) {
            Ok(()) => {
                debug!(event = "call_sent", id = %id, method = %method);
                self.dispatcher.register(
                    id,
                    method,
                    Continuation::Internal(continuation),
                    self.config.call_timeout,
                    Instant::now(),
                );
            }
            Err(err) => self.report_failure(method, &err),
        }
    }

    async fn close_connection(&mut self, reason: &str) {
        if !self.connection.close() {
            return;
        }
        self.with_store(|store| store.set_connected(false)).await;
        self.fail_pending(CallError::ConnectionClosed).await;
        self.notice(NoticeLevel::Info, format!("disconnected: {reason}"));
    }

    async fn fail_pending(&mut self, error: CallError) {
        for resolution in self.dispatcher.fail_all(error) {
            self.handle_resolution(resolution).await;
        }
    }

    async fn stop(&mut self) {
        self.connection.close();
        self.with_store(|store| store.set_connected(false)).await;
        self.fail_pending(CallError::SessionStopped).await;
        info!(event = "session_stopped");
    }

    /// Runs one mutation under the write lock and publishes the new revision.
    async fn with_store<R>(&mut self, mutate: impl FnOnce(&mut EntityStore) -> R) -> R {
        let (result, revision) = {
            let mut store = self.store.write().await;
            let result = mutate(&mut store);
            (result, store.revision())
        };
        self.revisions.send_if_modified(|current| {
            if *current == revision {
                return false;
            }
            *current = revision;
            true
        });
        result
    }

    fn report_failure(&self, method: &str, err: &CallError) {
        warn!("call_failed: method={method} {err}");
        self.notice(NoticeLevel::Error, format!("{method} failed: {err}"));
    }

    fn notice(&self, level: NoticeLevel, message: String) {
        let _ = self.notices.send(Notice { level, message });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// A call that has been submitted; await [`PendingCall::wait`] for its
/// result or pass [`PendingCall::id`] to [`SessionHandle::cancel`].
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, CallError>>,
}

impl PendingCall {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn wait(self) -> Result<Value, CallError> {
        self.rx.await.unwrap_or(Err(CallError::Cancelled))
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    store: SharedStore,
    revisions: watch::Receiver<u64>,
    notices: broadcast::Sender<Notice>,
    ids: RequestIds,
}

impl SessionHandle {
    pub async fn call(&self, method: impl Into<String>, params: Value) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, CallTimeout::Default)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: CallTimeout,
    ) -> Result<Value, CallError> {
        self.start_call(method, params, timeout).await?.wait().await
    }

    /// Submits a call without waiting for its result.
    pub async fn start_call(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: CallTimeout,
    ) -> Result<PendingCall, CallError> {
        let id = self.ids.allocate();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            id,
            method: method.into(),
            params,
            timeout,
            reply,
        })
        .await?;
        Ok(PendingCall { id, rx })
    }

    pub async fn notify(&self, method: impl Into<String>, params: Value) -> Result<(), CallError> {
        self.send(Command::Notify {
            method: method.into(),
            params,
        })
        .await
    }

    /// Forgets a pending call; its result, if it ever arrives, is dropped.
    pub async fn cancel(&self, id: RequestId) -> Result<(), CallError> {
        self.send(Command::Cancel { id }).await
    }

    pub async fn select_experiment(&self, experiment: Experiment) -> Result<(), CallError> {
        self.send(Command::SelectExperiment(experiment)).await
    }

    pub async fn connect(&self) -> Result<(), CallError> {
        self.send(Command::Connect).await
    }

    pub async fn reconnect(&self) -> Result<(), CallError> {
        self.send(Command::Reconnect).await
    }

    pub async fn disconnect(&self) -> Result<(), CallError> {
        self.send(Command::Disconnect).await
    }

    pub async fn shutdown(&self) -> Result<(), CallError> {
        self.send(Command::Shutdown).await
    }

    /// Read access to the mirror. Do not hold the guard across long awaits;
    /// the session waits for it before every mutation.
    pub async fn store(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.store.read().await
    }

    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.revisions.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Resolves once `predicate` holds for the store.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<(), CallError>
    where
        F: FnMut(&EntityStore) -> bool,
    {
        let mut revisions = self.revisions.clone();
        loop {
            {
                let store = self.store.read().await;
                if predicate(&*store) {
                    return Ok(());
                }
            }
            revisions
                .changed()
                .await
                .map_err(|_| CallError::SessionStopped)?;
        }
    }

    async fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::SessionStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_fail_fast_while_disconnected() {
        let config = ClientConfig::parse("ws://127.0.0.1:9/web-socket").expect("config");
        let (handle, task) = Session::spawn(config);
        let mut notices = handle.notices();

        let result = handle.call("hostname", json!({})).await;
        assert!(matches!(
            result,
            Err(CallError::NotConnected) | Err(CallError::ConnectionClosed)
        ));
        assert!(!handle.store().await.is_connected());
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .expect("notice in time")
            .expect("notice");
        assert_eq!(notice.level, NoticeLevel::Error);

        handle.shutdown().await.expect("shutdown");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stopped in time")
            .expect("join");
        assert_eq!(
            handle.call("hostname", json!({})).await,
            Err(CallError::SessionStopped)
        );
    }

    #[tokio::test]
    async fn selection_while_disconnected_still_resets_the_store() {
        let config = ClientConfig::parse("ws://127.0.0.1:9/web-socket").expect("config");
        let (handle, _task) = Session::spawn(config);
        handle
            .select_experiment(Experiment::new("mnist", 0))
            .await
            .expect("select");
        tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(|store| store.current_experiment().is_some()),
        )
        .await
        .expect("selected in time")
        .expect("session alive");
        let store = handle.store().await;
        assert_eq!(store.current_experiment(), Some(&Experiment::new("mnist", 0)));
        assert!(store.is_empty());
    }
}
