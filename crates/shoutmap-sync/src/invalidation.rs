//! Cross-feature invalidation.
//!
//! Features that show derived data (pin like/comment counts, badges)
//! register a refetch callback under a [`Topic`]. Features that change
//! that data trigger the topic after a successful write. Callbacks are
//! isolated from each other: a panicking callback is logged and the rest
//! still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, error};

/// Refetch topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Shout-level derived data (likes, comment counts on pins).
    Shout,
    /// Event-level derived data.
    Event,
    /// Unread counters.
    Count,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Topic::Shout => "shout",
            Topic::Event => "event",
            Topic::Count => "count",
        };
        f.write_str(name)
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Callback registry keyed by topic.
#[derive(Default)]
pub struct InvalidationBus {
    next_id: AtomicU64,
    callbacks: DashMap<Topic, Vec<(u64, Callback)>>,
}

impl InvalidationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a callback. It stays registered until the returned
    /// [`Registration`] is dropped or unregistered.
    pub fn register<F>(self: &Arc<Self>, topic: Topic, callback: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .entry(topic)
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(topic = %topic, id, "registered refetch callback");
        Registration {
            bus: Arc::downgrade(self),
            topic,
            id,
        }
    }

    fn remove(&self, topic: Topic, id: u64) {
        if let Some(mut callbacks) = self.callbacks.get_mut(&topic) {
            callbacks.retain(|(cid, _)| *cid != id);
        }
    }

    /// Run every callback registered under `topic`. Returns how many ran
    /// without panicking.
    pub fn trigger(&self, topic: Topic) -> usize {
        // Snapshot so callbacks can register or unregister while we run.
        let callbacks: Vec<Callback> = self
            .callbacks
            .get(&topic)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        let mut ok = 0;
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(()) => ok += 1,
                Err(panic) => {
                    error!(
                        topic = %topic,
                        panic = %panic_message(&*panic),
                        "refetch callback panicked"
                    );
                }
            }
        }
        debug!(topic = %topic, ran = ok, "triggered refetch");
        ok
    }

    /// Number of callbacks registered under `topic`.
    pub fn registered(&self, topic: Topic) -> usize {
        self.callbacks.get(&topic).map(|c| c.len()).unwrap_or(0)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Deregistration handle for a refetch callback.
#[must_use = "dropping a Registration unregisters the callback"]
pub struct Registration {
    bus: Weak<InvalidationBus>,
    topic: Topic,
    id: u64,
}

impl Registration {
    fn detached(topic: Topic) -> Self {
        Self {
            bus: Weak::new(),
            topic,
            id: 0,
        }
    }

    /// Unregister now. Same as dropping the handle.
    pub fn unregister(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.topic, self.id);
        }
    }
}

/// What feature code holds: either a live bus or nothing.
///
/// A detached handle turns every operation into a no-op, for views
/// rendered outside a [`crate::SyncContext`].
#[derive(Clone, Default)]
pub struct InvalidationHandle(Option<Arc<InvalidationBus>>);

impl InvalidationHandle {
    pub fn new(bus: Arc<InvalidationBus>) -> Self {
        Self(Some(bus))
    }

    pub fn detached() -> Self {
        Self(None)
    }

    pub fn is_detached(&self) -> bool {
        self.0.is_none()
    }

    pub fn register<F>(&self, topic: Topic, callback: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        match &self.0 {
            Some(bus) => bus.register(topic, callback),
            None => Registration::detached(topic),
        }
    }

    pub fn trigger(&self, topic: Topic) {
        if let Some(bus) = &self.0 {
            bus.trigger(topic);
        }
    }

    pub fn register_shout_refetch<F>(&self, callback: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Topic::Shout, callback)
    }

    pub fn register_event_refetch<F>(&self, callback: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Topic::Event, callback)
    }

    pub fn register_count_refetch<F>(&self, callback: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Topic::Count, callback)
    }

    pub fn trigger_shout_refetch(&self) {
        self.trigger(Topic::Shout);
    }

    pub fn trigger_event_refetch(&self) {
        self.trigger(Topic::Event);
    }

    pub fn trigger_count_refetch(&self) {
        self.trigger(Topic::Count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_trigger_runs_only_matching_topic() {
        let handle = InvalidationHandle::new(InvalidationBus::new());
        let (shout_hits, shout_cb) = counter();
        let (count_hits, count_cb) = counter();
        let _a = handle.register_shout_refetch(shout_cb);
        let _b = handle.register_count_refetch(count_cb);

        handle.trigger_shout_refetch();
        handle.trigger_shout_refetch();

        assert_eq!(shout_hits.load(Ordering::SeqCst), 2);
        assert_eq!(count_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let bus = InvalidationBus::new();
        let handle = InvalidationHandle::new(Arc::clone(&bus));
        let (hits, cb) = counter();
        let _bad = handle.register_event_refetch(|| panic!("boom"));
        let _good = handle.register_event_refetch(cb);

        assert_eq!(bus.trigger(Topic::Event), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unregisters() {
        let bus = InvalidationBus::new();
        let handle = InvalidationHandle::new(Arc::clone(&bus));
        let (hits, cb) = counter();

        let registration = handle.register_count_refetch(cb);
        assert_eq!(bus.registered(Topic::Count), 1);
        registration.unregister();
        assert_eq!(bus.registered(Topic::Count), 0);

        handle.trigger_count_refetch();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_detached_handle_is_noop() {
        let handle = InvalidationHandle::detached();
        let (hits, cb) = counter();
        let registration = handle.register_shout_refetch(cb);
        handle.trigger_shout_refetch();
        drop(registration);

        assert!(handle.is_detached());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_register_during_trigger() {
        let bus = InvalidationBus::new();
        let inner = Arc::clone(&bus);
        let held = Arc::new(std::sync::Mutex::new(Vec::new()));
        let held_in_cb = Arc::clone(&held);
        let _r = bus.register(Topic::Shout, move || {
            let r = inner.register(Topic::Shout, || {});
            held_in_cb.lock().unwrap().push(r);
        });

        assert_eq!(bus.trigger(Topic::Shout), 1);
        assert_eq!(bus.registered(Topic::Shout), 2);
    }
}
