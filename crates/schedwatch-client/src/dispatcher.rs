//! Pending-call table for correlated requests.
//!
//! Owned by the session task, so no locking: every operation runs on the
//! single writer. Ids are drawn from a counter shared with the handles so a
//! caller knows its id (for cancellation) before the session sees the call.

use crate::error::CallError;
use schedwatch_core::rpc::RequestId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type Reply = oneshot::Sender<Result<Value, CallError>>;

/// What runs when a call settles.
#[derive(Debug)]
pub enum Continuation<I> {
    /// Result goes back to an external caller.
    Reply(Reply),
    /// Result is handled by the session itself.
    Internal(I),
}

#[derive(Debug)]
struct PendingEntry<I> {
    method: String,
    continuation: Continuation<I>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

/// Outcome of settling one entry.
#[derive(Debug)]
pub enum Resolution<I> {
    /// Sent to an external caller. `delivered` is false when the caller had
    /// already gone away.
    Replied {
        method: String,
        delivered: bool,
        failure: Option<CallError>,
    },
    Internal {
        method: String,
        continuation: I,
        outcome: Result<Value, CallError>,
    },
    /// No pending call had this id.
    Unknown,
}

#[derive(Clone, Debug)]
pub struct RequestIds(Arc<AtomicU64>);

impl RequestIds {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn allocate(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct Dispatcher<I> {
    ids: RequestIds,
    pending: HashMap<RequestId, PendingEntry<I>>,
}

impl<I> Dispatcher<I> {
    pub fn new(ids: RequestIds) -> Self {
        Self {
            ids,
            pending: HashMap::new(),
        }
    }

    pub fn allocate_id(&self) -> RequestId {
        self.ids.allocate()
    }

    /// Tracks a sent call. A second registration under the same id replaces
    /// the first, which then never settles.
    pub fn register(
        &mut self,
        id: RequestId,
        method: impl Into<String>,
        continuation: Continuation<I>,
        timeout: Option<Duration>,
        now: Instant,
    ) {
        let entry = PendingEntry {
            method: method.into(),
            continuation,
            deadline: timeout.map(|timeout| now + timeout),
            timeout,
        };
        self.pending.insert(id, entry);
    }

    pub fn complete(&mut self, id: RequestId, outcome: Result<Value, CallError>) -> Resolution<I> {
        match self.pending.remove(&id) {
            Some(entry) => settle(entry, outcome),
            None => Resolution::Unknown,
        }
    }

    /// Drops the entry without running its continuation.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Settles every entry whose deadline is at or before `now` with a
    /// timeout error.
    pub fn expire(&mut self, now: Instant) -> Vec<Resolution<I>> {
        let mut expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|entry| {
                let waited = entry.timeout.unwrap_or_default();
                settle(entry, Err(CallError::Timeout(waited)))
            })
            .collect()
    }

    /// Settles every entry with `error`, oldest first.
    pub fn fail_all(&mut self, error: CallError) -> Vec<Resolution<I>> {
        let mut entries: Vec<(RequestId, PendingEntry<I>)> = self.pending.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
            .into_iter()
            .map(|(_, entry)| settle(entry, Err(error.clone())))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|entry| entry.deadline).min()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

}

fn settle<I>(entry: PendingEntry<I>, outcome: Result<Value, CallError>) -> Resolution<I> {
    match entry.continuation {
        Continuation::Reply(reply) => {
            let failure = outcome.as_ref().err().cloned();
            Resolution::Replied {
                method: entry.method,
                delivered: reply.send(outcome).is_ok(),
                failure,
            }
        }
        Continuation::Internal(continuation) => Resolution::Internal {
            method: entry.method,
            continuation,
            outcome,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    enum Step {
        Listen,
    }

    fn dispatcher() -> Dispatcher<Step> {
        Dispatcher::new(RequestIds::new())
    }

    #[test]
    fn ids_are_sequential_and_shared() {
        let ids = RequestIds::new();
        let dispatcher: Dispatcher<Step> = Dispatcher::new(ids.clone());
        assert_eq!(ids.allocate(), RequestId(1));
        assert_eq!(dispatcher.allocate_id(), RequestId(2));
        assert_eq!(ids.allocate(), RequestId(3));
    }

    #[tokio::test]
    async fn reply_continuation_fires_once() {
        let mut dispatcher = dispatcher();
        let (tx, rx) = oneshot::channel();
        let id = dispatcher.allocate_id();
        dispatcher.register(id, "hostname", Continuation::Reply(tx), None, Instant::now());
        assert!(dispatcher.is_pending(id));

        let resolution = dispatcher.complete(id, Ok(json!("node-1")));
        assert!(matches!(
            resolution,
            Resolution::Replied { delivered: true, .. }
        ));
        assert_eq!(rx.await.expect("reply"), Ok(json!("node-1")));

        assert!(matches!(
            dispatcher.complete(id, Ok(Value::Null)),
            Resolution::Unknown
        ));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn internal_continuation_is_returned() {
        let mut dispatcher = dispatcher();
        let id = dispatcher.allocate_id();
        let now = Instant::now();
        dispatcher.register(id, "listen", Continuation::Internal(Step::Listen), None, now);
        let Resolution::Internal {
            method,
            continuation,
            outcome,
        } = dispatcher.complete(id, Err(CallError::NotConnected))
        else {
            panic!("expected internal resolution")
        };
        assert_eq!(method, "listen");
        assert_eq!(continuation, Step::Listen);
        assert_eq!(outcome, Err(CallError::NotConnected));
    }

    #[tokio::test]
    async fn expire_times_out_only_due_entries() {
        let mut dispatcher = dispatcher();
        let now = Instant::now();
        let (short_tx, short_rx) = oneshot::channel();
        let (long_tx, _long_rx) = oneshot::channel();
        let (never_tx, _never_rx) = oneshot::channel();
        let short = dispatcher.allocate_id();
        let long = dispatcher.allocate_id();
        let never = dispatcher.allocate_id();
        let short_timeout = Some(Duration::from_millis(10));
        let long_timeout = Some(Duration::from_secs(60));
        dispatcher.register(short, "paths", Continuation::Reply(short_tx), short_timeout, now);
        dispatcher.register(long, "paths", Continuation::Reply(long_tx), long_timeout, now);
        dispatcher.register(never, "paths", Continuation::Reply(never_tx), None, now);

        assert_eq!(dispatcher.next_deadline(), Some(now + Duration::from_millis(10)));
        let resolutions = dispatcher.expire(now + Duration::from_secs(1));
        assert_eq!(resolutions.len(), 1);
        assert_eq!(
            short_rx.await.expect("reply"),
            Err(CallError::Timeout(Duration::from_millis(10)))
        );
        assert!(!dispatcher.is_pending(short));
        assert!(dispatcher.is_pending(long));
        assert!(dispatcher.is_pending(never));
    }

    #[tokio::test]
    async fn cancel_removes_without_settling() {
        let mut dispatcher = dispatcher();
        let (tx, rx) = oneshot::channel();
        let id = dispatcher.allocate_id();
        dispatcher.register(id, "kill", Continuation::Reply(tx), None, Instant::now());
        assert!(dispatcher.cancel(id));
        assert!(!dispatcher.cancel(id));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn fail_all_drains_every_entry() {
        let mut dispatcher = dispatcher();
        let (tx, rx) = oneshot::channel();
        let first = dispatcher.allocate_id();
        let second = dispatcher.allocate_id();
        dispatcher.register(first, "view-file", Continuation::Reply(tx), None, Instant::now());
        let listen = Continuation::Internal(Step::Listen);
        dispatcher.register(second, "listen", listen, None, Instant::now());

        let resolutions = dispatcher.fail_all(CallError::ConnectionClosed);
        assert_eq!(resolutions.len(), 2);
        assert!(matches!(
            &resolutions[1],
            Resolution::Internal { outcome: Err(CallError::ConnectionClosed), .. }
        ));
        assert_eq!(rx.await.expect("reply"), Err(CallError::ConnectionClosed));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn dropped_caller_is_reported_undelivered() {
        let mut dispatcher = dispatcher();
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let id = dispatcher.allocate_id();
        dispatcher.register(id, "hostname", Continuation::Reply(tx), None, Instant::now());
        assert!(matches!(
            dispatcher.complete(id, Ok(Value::Null)),
            Resolution::Replied { delivered: false, .. }
        ));
    }
}
