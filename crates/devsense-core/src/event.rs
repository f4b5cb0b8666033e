//! Typed publish/subscribe channel keyed by event name
//!
//! Listeners are plain closures returning `anyhow::Result<()>`. Each listener
//! runs inside its own failure boundary: an `Err` or a panic is routed to the
//! channel's error handler (or logged) and emission continues with the next
//! listener.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Default per-event listener count before a leak warning is logged
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Identity of a single registration, used for targeted removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Listener<P> = Arc<dyn Fn(&P) -> anyhow::Result<()> + Send + Sync>;
type ErrorHandler<K> = Arc<dyn Fn(&anyhow::Error, &K) + Send + Sync>;
type ListenerMap<K, P> = HashMap<K, Vec<Registration<P>>>;

struct Registration<P> {
    id: ListenerId,
    once: bool,
    listener: Listener<P>,
}

impl<P> Clone for Registration<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            once: self.once,
            listener: Arc::clone(&self.listener),
        }
    }
}

/// Disposer handle returned by [`EventChannel::on`] and [`EventChannel::once`]
///
/// Dropping the handle does not detach the listener; call
/// [`Subscription::unsubscribe`] for that.
pub struct Subscription {
    id: ListenerId,
    detach: Box<dyn FnOnce() -> bool + Send>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Detach exactly this registration. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        (self.detach)()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Multi-listener event channel
pub struct EventChannel<K, P> {
    listeners: Arc<Mutex<ListenerMap<K, P>>>,
    next_id: AtomicU64,
    max_listeners: usize,
    error_handler: Mutex<Option<ErrorHandler<K>>>,
}

impl<K, P> EventChannel<K, P>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    P: 'static,
{
    /// Create an empty channel with the default listener limit
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            max_listeners: DEFAULT_MAX_LISTENERS,
            error_handler: Mutex::new(None),
        }
    }

    /// Set the per-event listener count that triggers a leak warning
    pub fn with_max_listeners(mut self, max: usize) -> Self {
        self.max_listeners = max;
        self
    }

    pub fn max_listeners(&self) -> usize {
        self.max_listeners
    }

    /// Route listener failures to `handler` instead of the log
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&anyhow::Error, &K) + Send + Sync + 'static,
    {
        *self.error_handler.lock() = Some(Arc::new(handler));
    }

    /// Register a listener for `event`
    pub fn on<F>(&self, event: K, listener: F) -> Subscription
    where
        F: Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, Arc::new(listener), false)
    }

    /// Register a listener that is detached before its first invocation
    pub fn once<F>(&self, event: K, listener: F) -> Subscription
    where
        F: Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event, Arc::new(listener), true)
    }

    fn register(&self, event: K, listener: Listener<P>, once: bool) -> Subscription {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let existing = {
            let mut listeners = self.listeners.lock();
            let entries = listeners.entry(event.clone()).or_default();
            let existing = entries.len();
            entries.push(Registration { id, once, listener });
            existing
        };

        if existing >= self.max_listeners {
            warn!(
                event = %event,
                count = existing + 1,
                max = self.max_listeners,
                "Listener limit reached, possible subscription leak"
            );
        }

        let listeners = Arc::downgrade(&self.listeners);
        Subscription {
            id,
            detach: Box::new(move || match listeners.upgrade() {
                Some(listeners) => remove_registration(&mut listeners.lock(), &event, id),
                None => false,
            }),
        }
    }

    /// Remove one registration, or every registration for `event` when `id` is None.
    ///
    /// Returns the number of registrations removed.
    pub fn off(&self, event: &K, id: Option<ListenerId>) -> usize {
        let mut listeners = self.listeners.lock();
        match id {
            Some(id) => usize::from(remove_registration(&mut listeners, event, id)),
            None => listeners.remove(event).map(|entries| entries.len()).unwrap_or(0),
        }
    }

    /// Invoke every listener registered for `event` at the time of the call.
    ///
    /// Returns how many listeners were invoked.
    pub fn emit(&self, event: &K, payload: &P) -> usize {
        let snapshot: Vec<Registration<P>> = match self.listeners.lock().get(event) {
            Some(entries) => entries.clone(),
            None => return 0,
        };

        let mut invoked = 0;
        for registration in snapshot {
            // A nested emit may already have consumed this one-shot listener
            if registration.once
                && !remove_registration(&mut self.listeners.lock(), event, registration.id)
            {
                continue;
            }

            invoked += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.listener)(payload)));
            let err = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => anyhow::anyhow!("listener panicked: {}", panic_message(&*panic)),
            };
            self.report_failure(event, registration.id, &err);
        }
        invoked
    }

    fn report_failure(&self, event: &K, id: ListenerId, err: &anyhow::Error) {
        let handler = self.error_handler.lock().clone();
        match handler {
            Some(handler) => handler(err, event),
            None => error!(event = %event, listener = %id, error = %err, "Event listener failed"),
        }
    }

    pub fn listener_count(&self, event: &K) -> usize {
        self.listeners.lock().get(event).map(Vec::len).unwrap_or(0)
    }

    /// Events that currently have at least one listener, in no particular order
    pub fn event_names(&self) -> Vec<K> {
        self.listeners.lock().keys().cloned().collect()
    }

    /// Listener ids for `event` in registration order
    pub fn listeners(&self, event: &K) -> Vec<ListenerId> {
        self.listeners
            .lock()
            .get(event)
            .map(|entries| entries.iter().map(|r| r.id).collect())
            .unwrap_or_default()
    }

    pub fn has_listeners(&self, event: &K) -> bool {
        self.listener_count(event) > 0
    }

    /// Clear one event's listeners, or every event's when `event` is None
    pub fn remove_all_listeners(&self, event: Option<&K>) {
        let mut listeners = self.listeners.lock();
        match event {
            Some(event) => {
                listeners.remove(event);
            }
            None => listeners.clear(),
        }
    }
}

impl<K, P> Default for EventChannel<K, P>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    P: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> fmt::Debug for EventChannel<K, P>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let counts: Vec<(&K, usize)> = listeners.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("EventChannel")
            .field("listeners", &counts)
            .field("max_listeners", &self.max_listeners)
            .finish()
    }
}

fn remove_registration<K, P>(listeners: &mut ListenerMap<K, P>, event: &K, id: ListenerId) -> bool
where
    K: Eq + Hash,
{
    let Some(entries) = listeners.get_mut(event) else {
        return false;
    };
    let before = entries.len();
    entries.retain(|r| r.id != id);
    let removed = entries.len() != before;
    if entries.is_empty() {
        listeners.remove(event);
    }
    removed
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Channel = EventChannel<String, u32>;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&u32) -> anyhow::Result<()> + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_failing_listener_does_not_stop_others() {
        let channel = Channel::new();
        channel.on("x".into(), |_| anyhow::bail!("boom"));
        let (count, listener) = counter();
        channel.on("x".into(), listener);

        channel.emit(&"x".into(), &1);
        channel.emit(&"x".into(), &2);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let channel = Channel::new();
        channel.on("x".into(), |_| panic!("listener exploded"));
        let (count, listener) = counter();
        channel.on("x".into(), listener);

        let invoked = channel.emit(&"x".into(), &1);

        assert_eq!(invoked, 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_handler_receives_event_name() {
        let channel = Channel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        channel.set_error_handler(move |err, event| {
            s.lock().push((event.clone(), err.to_string()));
        });
        channel.on("resize".into(), |v| anyhow::bail!("bad value {}", v));

        channel.emit(&"resize".into(), &7);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "resize");
        assert_eq!(seen[0].1, "bad value 7");
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let channel = Channel::new();
        let (count, listener) = counter();
        channel.once("x".into(), listener);

        for i in 0..5 {
            channel.emit(&"x".into(), &i);
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!channel.has_listeners(&"x".into()));
    }

    #[test]
    fn test_once_detached_even_when_it_fails() {
        let channel = Channel::new();
        channel.once("x".into(), |_| anyhow::bail!("fails"));

        channel.emit(&"x".into(), &1);

        assert_eq!(channel.listener_count(&"x".into()), 0);
    }

    #[test]
    fn test_once_with_reentrant_emit() {
        let channel = Arc::new(Channel::new());
        let count = Arc::new(AtomicUsize::new(0));
        let (c, ch) = (count.clone(), Arc::downgrade(&channel));
        channel.once("x".into(), move |v| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(ch) = ch.upgrade() {
                ch.emit(&"x".into(), &(v + 1));
            }
            Ok(())
        });

        channel.emit(&"x".into(), &0);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_exactly_one_registration() {
        let channel = Channel::new();
        let (first, l1) = counter();
        let (second, l2) = counter();
        let sub = channel.on("x".into(), l1);
        channel.on("x".into(), l2);

        assert_eq!(channel.off(&"x".into(), Some(sub.id())), 1);
        assert_eq!(channel.off(&"x".into(), Some(sub.id())), 0);
        channel.emit(&"x".into(), &1);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_without_id_removes_all_for_event() {
        let channel = Channel::new();
        channel.on("x".into(), |_| Ok(()));
        channel.on("x".into(), |_| Ok(()));
        channel.on("y".into(), |_| Ok(()));

        assert_eq!(channel.off(&"x".into(), None), 2);
        assert_eq!(channel.event_names(), vec!["y".to_string()]);
    }

    #[test]
    fn test_subscription_unsubscribe() {
        let channel = Channel::new();
        let (count, listener) = counter();
        let sub = channel.on("x".into(), listener);

        assert!(sub.unsubscribe());
        channel.emit(&"x".into(), &1);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_added_during_emit_misses_current_emission() {
        let channel = Arc::new(Channel::new());
        let (late_count, late) = counter();
        let late = Arc::new(late);
        let ch = Arc::downgrade(&channel);
        channel.once("x".into(), move |_| {
            if let Some(ch) = ch.upgrade() {
                let late = late.clone();
                ch.on("x".into(), move |v| late(v));
            }
            Ok(())
        });

        channel.emit(&"x".into(), &1);
        assert_eq!(late_count.load(Ordering::SeqCst), 0);

        channel.emit(&"x".into(), &2);
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listeners_in_registration_order() {
        let channel = Channel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3u32 {
            let order = order.clone();
            channel.on("x".into(), move |_| {
                order.lock().push(tag);
                Ok(())
            });
        }

        channel.emit(&"x".into(), &0);

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        let ids = channel.listeners(&"x".into());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_max_listeners_still_registers() {
        let channel = Channel::new().with_max_listeners(2);
        for _ in 0..4 {
            channel.on("x".into(), |_| Ok(()));
        }
        assert_eq!(channel.listener_count(&"x".into()), 4);
    }

    #[test]
    fn test_remove_all_listeners() {
        let channel = Channel::new();
        channel.on("x".into(), |_| Ok(()));
        channel.on("y".into(), |_| Ok(()));

        channel.remove_all_listeners(Some(&"x".into()));
        assert!(!channel.has_listeners(&"x".into()));
        assert!(channel.has_listeners(&"y".into()));

        channel.remove_all_listeners(None);
        assert!(channel.event_names().is_empty());
        assert_eq!(channel.emit(&"y".into(), &1), 0);
    }
}
