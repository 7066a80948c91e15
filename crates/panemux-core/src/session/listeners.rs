//! Per-session listener registry.
//!
//! Listeners are keyed by a caller-chosen id; attaching under an id that is
//! already present replaces the old listener in place. Fanout visits
//! listeners in attach order. A listener whose delivery fails (returns an
//! error or panics) is removed and the rest keep receiving.

use crate::error::DeliveryError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A transport-side subscriber to one session.
///
/// Callbacks run while the session is locked: they must not block and must
/// not call back into the registry. Forward into a channel instead.
pub trait SessionListener: Send + Sync {
    /// One output chunk (or the replay, delivered as a single call).
    fn on_data(&self, chunk: &[u8]) -> Result<(), DeliveryError>;

    /// The session ended. `code` is the process exit code, or
    /// [`crate::EXIT_CODE_TERMINATED`] when the session was torn down.
    fn on_exit(&self, code: i32);
}

/// Adapts a pair of closures into a [`SessionListener`].
pub struct FnListener<D, E> {
    on_data: D,
    on_exit: E,
}

impl<D, E> SessionListener for FnListener<D, E>
where
    D: Fn(&[u8]) -> Result<(), DeliveryError> + Send + Sync,
    E: Fn(i32) + Send + Sync,
{
    fn on_data(&self, chunk: &[u8]) -> Result<(), DeliveryError> {
        (self.on_data)(chunk)
    }

    fn on_exit(&self, code: i32) {
        (self.on_exit)(code)
    }
}

/// Build a listener from an output closure and an exit closure.
pub fn listener_fn<D, E>(on_data: D, on_exit: E) -> Arc<dyn SessionListener>
where
    D: Fn(&[u8]) -> Result<(), DeliveryError> + Send + Sync + 'static,
    E: Fn(i32) + Send + Sync + 'static,
{
    Arc::new(FnListener { on_data, on_exit })
}

struct Entry {
    id: String,
    listener: Arc<dyn SessionListener>,
    /// Distinguishes this attachment from a later one under the same id.
    generation: u64,
    /// While `Some`, the listener is waiting for its deferred replay and live
    /// chunks queue up behind it.
    pending: Option<Vec<Vec<u8>>>,
}

#[derive(Default)]
pub struct ListenerSet {
    entries: Vec<Entry>,
    next_generation: u64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under `id`, replacing any previous one.
    ///
    /// With `deferred = Some(queue)` the listener starts out holding `queue`
    /// (normally the replay) and receives nothing until
    /// [`ListenerSet::release`] is called for the returned generation.
    /// Returns the generation and whether an older listener was replaced.
    pub fn insert(
        &mut self,
        id: &str,
        listener: Arc<dyn SessionListener>,
        deferred: Option<Vec<Vec<u8>>>,
    ) -> (u64, bool) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let entry = Entry {
            id: id.to_string(),
            listener,
            generation,
            pending: deferred,
        };

        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(slot) => {
                *slot = entry;
                (generation, true)
            }
            None => {
                self.entries.push(entry);
                (generation, false)
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Remove `id` only while it is still backed by `listener`. A listener
    /// that has since been replaced under the same id stays.
    pub fn remove_if(&mut self, id: &str, listener: &Arc<dyn SessionListener>) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.id == id && same_listener(&e.listener, listener)));
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    /// Deliver one chunk to one listener right away. A failing listener is
    /// removed. Returns false if the listener is missing or failed.
    pub fn deliver_to(&mut self, id: &str, chunk: &[u8]) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        if deliver(self.entries[pos].listener.as_ref(), chunk).is_err() {
            self.entries.remove(pos);
            return false;
        }
        true
    }

    /// Deliver a chunk to every listener in attach order, queueing it for
    /// listeners still waiting on their replay. Returns the ids of listeners
    /// removed because delivery failed.
    pub fn fanout(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut failed = Vec::new();
        for entry in &mut self.entries {
            match entry.pending.as_mut() {
                Some(queue) => queue.push(chunk.to_vec()),
                None => {
                    if let Err(e) = deliver(entry.listener.as_ref(), chunk) {
                        failed.push((entry.id.clone(), e));
                    }
                }
            }
        }
        self.entries
            .retain(|e| !failed.iter().any(|(id, _)| *id == e.id));
        failed.into_iter().map(|(id, _)| id).collect()
    }

    /// Flush a deferred listener's queue in order and switch it to live
    /// delivery. Does nothing if `id` was replaced or removed since the
    /// deferral (generation mismatch). Returns false if the listener failed
    /// and was removed.
    pub fn release(&mut self, id: &str, generation: u64) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.id == id && e.generation == generation)
        else {
            return true;
        };
        let Some(queue) = self.entries[pos].pending.take() else {
            return true;
        };
        let listener = Arc::clone(&self.entries[pos].listener);
        for chunk in &queue {
            if deliver(listener.as_ref(), chunk).is_err() {
                self.entries.remove(pos);
                return false;
            }
        }
        true
    }

    /// Remove every listener, in attach order.
    pub fn drain(&mut self) -> Vec<(String, Arc<dyn SessionListener>)> {
        self.entries
            .drain(..)
            .map(|e| (e.id, e.listener))
            .collect()
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Identity comparison on the allocation, ignoring the vtable half.
fn same_listener(a: &Arc<dyn SessionListener>, b: &Arc<dyn SessionListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Call `on_data`, turning a panic into a delivery failure.
fn deliver(listener: &dyn SessionListener, chunk: &[u8]) -> Result<(), DeliveryError> {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.on_data(chunk))) {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Failed("listener panicked".into())),
    }
}

/// Call `on_exit`, containing a panic.
pub(crate) fn notify_exit(listener: &dyn SessionListener, code: i32) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| listener.on_exit(code)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<dyn SessionListener>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let listener = listener_fn(
            move |chunk| {
                s.lock().unwrap().push(chunk.to_vec());
                Ok(())
            },
            |_| {},
        );
        (listener, seen)
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let mut set = ListenerSet::new();
        let (a, a_seen) = recorder();
        let (b, b_seen) = recorder();
        let (a2, a2_seen) = recorder();
        set.insert("a", a, None);
        set.insert("b", b, None);
        let (_, replaced) = set.insert("a", a2, None);
        assert!(replaced);
        assert_eq!(set.ids(), vec!["a", "b"]);

        set.fanout(b"x");
        assert!(a_seen.lock().unwrap().is_empty());
        assert_eq!(*a2_seen.lock().unwrap(), vec![b"x".to_vec()]);
        assert_eq!(*b_seen.lock().unwrap(), vec![b"x".to_vec()]);
    }

    #[test]
    fn failing_listener_is_dropped_others_continue() {
        let mut set = ListenerSet::new();
        let (good, seen) = recorder();
        set.insert("closed", listener_fn(|_| Err(DeliveryError::Closed), |_| {}), None);
        set.insert("panics", listener_fn(|_| panic!("boom"), |_| {}), None);
        set.insert("good", good, None);

        let failed = set.fanout(b"1");
        assert_eq!(failed, vec!["closed", "panics"]);
        assert_eq!(set.ids(), vec!["good"]);

        set.fanout(b"2");
        assert_eq!(*seen.lock().unwrap(), vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn deferred_listener_gets_queue_then_live() {
        let mut set = ListenerSet::new();
        let (l, seen) = recorder();
        let (generation, _) = set.insert("l", l, Some(vec![b"replay".to_vec()]));
        set.fanout(b"live1");
        assert!(seen.lock().unwrap().is_empty());

        assert!(set.release("l", generation));
        set.fanout(b"live2");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![b"replay".to_vec(), b"live1".to_vec(), b"live2".to_vec()]
        );
    }

    #[test]
    fn stale_release_is_ignored() {
        let mut set = ListenerSet::new();
        let (old, _) = recorder();
        let (new, new_seen) = recorder();
        let (old_gen, _) = set.insert("l", old, Some(vec![b"old".to_vec()]));
        let (new_gen, _) = set.insert("l", new, Some(vec![b"new".to_vec()]));

        assert!(set.release("l", old_gen));
        assert!(new_seen.lock().unwrap().is_empty());
        assert!(set.release("l", new_gen));
        assert_eq!(*new_seen.lock().unwrap(), vec![b"new".to_vec()]);
    }

    #[test]
    fn remove_and_drain() {
        let mut set = ListenerSet::new();
        let (a, _) = recorder();
        let (b, _) = recorder();
        set.insert("a", a, None);
        set.insert("b", b, None);
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
        let drained = set.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "b");
        assert!(set.is_empty());
    }

    #[test]
    fn remove_if_spares_a_replacement() {
        let mut set = ListenerSet::new();
        let (old, _) = recorder();
        let (new, new_seen) = recorder();
        set.insert("tab", Arc::clone(&old), None);
        set.insert("tab", Arc::clone(&new), None);

        assert!(!set.remove_if("tab", &old));
        assert_eq!(set.ids(), vec!["tab"]);
        set.fanout(b"still here");
        assert_eq!(*new_seen.lock().unwrap(), vec![b"still here".to_vec()]);

        assert!(set.remove_if("tab", &new));
        assert!(set.is_empty());
    }
}
