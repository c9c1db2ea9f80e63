//! Table of asynchronous calls waiting for their `reply_to` answer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::message::{CallId, Message};

/// Runs once with the answer to an asynchronous call.
pub type Completion = Box<dyn FnOnce(Result<Message>) + Send + 'static>;

/// Opaque tag naming whoever issued a call, such as a script context id.
/// Several owners may share one routing id.
pub type CallOwner = u64;

/// An asynchronous call that has been sent and not yet answered.
pub struct PendingCall {
    call_id: CallId,
    routing_id: i32,
    owner: CallOwner,
    completion: Completion,
}

impl PendingCall {
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn routing_id(&self) -> i32 {
        self.routing_id
    }

    pub fn owner(&self) -> CallOwner {
        self.owner
    }

    /// Run the completion. Consumes the call, so it runs at most once.
    pub fn complete(self, result: Result<Message>) {
        (self.completion)(result)
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("call_id", &self.call_id)
            .field("routing_id", &self.routing_id)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Pending calls keyed by call id, behind one mutex.
///
/// Entries leave the table exactly once: answered ([`take`](Self::take)),
/// flushed on connection loss ([`drain`](Self::drain)), or released with
/// their owner ([`release_owner`](Self::release_owner)). Completions
/// always run after the lock is released.
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CallId, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<CallId, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call.
    ///
    /// # Errors
    ///
    /// `DuplicatePendingCall` if `call_id` is already waiting. The table is
    /// left unchanged and `completion` is dropped.
    pub fn insert(
        &self,
        call_id: CallId,
        routing_id: i32,
        owner: CallOwner,
        completion: Completion,
    ) -> Result<()> {
        let mut calls = self.calls();
        if calls.contains_key(&call_id) {
            return Err(ProtocolError::DuplicatePendingCall(call_id));
        }
        calls.insert(
            call_id,
            PendingCall {
                call_id,
                routing_id,
                owner,
                completion,
            },
        );
        Ok(())
    }

    pub fn take(&self, call_id: CallId) -> Option<PendingCall> {
        self.calls().remove(&call_id)
    }

    /// Remove every call, in call id order.
    pub fn drain(&self) -> Vec<PendingCall> {
        let mut drained: Vec<PendingCall> = self.calls().drain().map(|(_, call)| call).collect();
        drained.sort_by_key(|call| call.call_id);
        drained
    }

    /// Drop the calls issued by `owner` without running them. Returns how
    /// many were released.
    pub fn release_owner(&self, owner: CallOwner) -> usize {
        let released: Vec<PendingCall> = {
            let mut calls = self.calls();
            let ids: Vec<CallId> = calls
                .values()
                .filter(|call| call.owner == owner)
                .map(|call| call.call_id)
                .collect();
            ids.into_iter().filter_map(|id| calls.remove(&id)).collect()
        };
        debug!(owner, count = released.len(), "released pending calls");
        released.len()
    }

    pub fn len(&self) -> usize {
        self.calls().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting(runs: &Arc<AtomicUsize>, drops: &Arc<AtomicUsize>) -> Completion {
        let runs = Arc::clone(runs);
        let guard = DropCounter(Arc::clone(drops));
        Box::new(move |_result| {
            let _guard = guard;
            runs.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_duplicate_call_id_is_refused() {
        let table = PendingCalls::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));

        table
            .insert(CallId::from(1), 7, 1, counting(&runs, &drops))
            .unwrap();
        let err = table
            .insert(CallId::from(1), 7, 1, counting(&runs, &drops))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::DuplicatePendingCall(id) if id == CallId::from(1)));
        assert_eq!(table.len(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_take_completes_once() {
        let table = PendingCalls::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        table
            .insert(CallId::from(5), 1, 3, counting(&runs, &drops))
            .unwrap();

        let call = table.take(CallId::from(5)).unwrap();
        assert_eq!(call.routing_id(), 1);
        assert_eq!(call.owner(), 3);
        call.complete(Ok(Message::new(MessageKind::PostMessageToJs, 1)));

        assert!(table.take(CallId::from(5)).is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_owner_drops_only_its_calls() {
        let table = PendingCalls::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        for id in 1..=3 {
            table
                .insert(CallId::from(id), 10, 1, counting(&runs, &drops))
                .unwrap();
        }
        // Same view, different context.
        table
            .insert(CallId::from(4), 10, 2, counting(&runs, &drops))
            .unwrap();

        assert_eq!(table.release_owner(1), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(CallId::from(4)).unwrap().owner(), 2);
        assert_eq!(table.release_owner(99), 0);
    }

    #[test]
    fn test_drain_returns_calls_in_order() {
        let table = PendingCalls::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        for id in [9u64, 2, 5] {
            table
                .insert(CallId::from(id), 1, 1, counting(&runs, &drops))
                .unwrap();
        }

        let drained = table.drain();
        let ids: Vec<u64> = drained.iter().map(|c| c.call_id().as_u64()).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert!(table.is_empty());

        for call in drained {
            call.complete(Err(ProtocolError::ConnectionLost));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
