//! Property event fan-out.
//!
//! The router maps property names to the components subscribed to them and
//! delivers every event to each subscriber in turn. A subscriber that fails
//! (returns an error or panics) is logged and skipped; the remaining subscribers
//! still receive the event.
//!
//! Components are held weakly: the composition root owns them, and a component
//! that has been dropped simply stops receiving events.
//!
//! Besides components, ad-hoc watchers can observe a (device, property) pair with
//! a closure. Watchers see events for every device, not only the session target.

use crate::components::Component;
use crate::property::Property;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// One property lifecycle event.
#[derive(Clone, Debug)]
pub enum PropertyEvent {
    /// First snapshot of the property.
    Defined(Arc<Property>),
    /// Replacement snapshot.
    Updated(Arc<Property>),
    /// Last snapshot before the property went away.
    Removed(Arc<Property>),
}

impl PropertyEvent {
    /// The snapshot carried by the event.
    pub fn property(&self) -> &Arc<Property> {
        match self {
            PropertyEvent::Defined(p) | PropertyEvent::Updated(p) | PropertyEvent::Removed(p) => p,
        }
    }

    /// Property name shortcut.
    pub fn name(&self) -> &str {
        &self.property().name
    }

    /// `true` unless the property was removed.
    pub fn is_live(&self) -> bool {
        !matches!(self, PropertyEvent::Removed(_))
    }
}

/// Closure invoked by a watcher.
pub type WatchCallback = Arc<dyn Fn(&PropertyEvent) + Send + Sync>;

/// Handle returned by [`PropertyRouter::watch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Watcher {
    id: WatchId,
    device: String,
    property: String,
    callback: WatchCallback,
}

impl Watcher {
    fn matches(&self, property: &Property) -> bool {
        self.device == property.device
            && (self.property.is_empty() || self.property == property.name)
    }
}

/// Name-keyed fan-out table.
#[derive(Default)]
pub struct PropertyRouter {
    table: RwLock<HashMap<String, Vec<Weak<dyn Component>>>>,
    members: RwLock<Vec<Weak<dyn Component>>>,
    watchers: RwLock<Vec<Arc<Watcher>>>,
    next_watch: AtomicU64,
}

impl PropertyRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `component` to events of the property `name`.
    ///
    /// Registering the same (name, component) pair twice has no effect.
    pub fn register(&self, name: &str, component: &Arc<dyn Component>) {
        let weak = Arc::downgrade(component);
        {
            let mut table = self.table.write();
            let entry = table.entry(name.to_string()).or_default();
            if entry.iter().any(|c| Weak::ptr_eq(c, &weak)) {
                return;
            }
            entry.push(weak.clone());
        }
        self.add_member(weak);
        tracing::trace!(property = name, component = component.name(), "Registered subscription");
    }

    /// Register a component for every property in its subscription list.
    ///
    /// Components with no subscriptions still become members, so they are told
    /// about session loss.
    pub fn attach(&self, component: &Arc<dyn Component>) {
        for name in component.subscriptions() {
            self.register(name, component);
        }
        self.add_member(Arc::downgrade(component));
        tracing::debug!(component = component.name(), "Component attached to router");
    }

    fn add_member(&self, weak: Weak<dyn Component>) {
        let mut members = self.members.write();
        if !members.iter().any(|c| Weak::ptr_eq(c, &weak)) {
            members.push(weak);
        }
    }

    /// Remove every subscription of `component`.
    pub fn unregister(&self, component: &Arc<dyn Component>) {
        let weak = Arc::downgrade(component);
        let keep = |c: &Weak<dyn Component>| !Weak::ptr_eq(c, &weak) && c.strong_count() > 0;

        let mut table = self.table.write();
        for entries in table.values_mut() {
            entries.retain(keep);
        }
        table.retain(|_, entries| !entries.is_empty());
        drop(table);

        self.members.write().retain(keep);
    }

    /// Number of live components subscribed to `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.table
            .read()
            .get(name)
            .map_or(0, |entries| entries.iter().filter(|c| c.strong_count() > 0).count())
    }

    /// Deliver `event` to the subscribed components, then to matching watchers.
    ///
    /// Returns the number of components that handled the event successfully.
    pub fn dispatch(&self, event: &PropertyEvent) -> usize {
        // Snapshot the list so handlers may (un)register without deadlocking.
        let subscribers: Vec<Weak<dyn Component>> = self
            .table
            .read()
            .get(event.name())
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for component in subscribers.iter().filter_map(Weak::upgrade) {
            let outcome = catch_unwind(AssertUnwindSafe(|| component.handle_event(event)));
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(
                    component = component.name(),
                    property = event.name(),
                    error = %e,
                    "Component failed to handle property event"
                ),
                Err(_) => tracing::error!(
                    component = component.name(),
                    property = event.name(),
                    "Component panicked while handling property event"
                ),
            }
        }

        self.notify_watchers(event);
        delivered
    }

    /// Deliver `event` to matching watchers only.
    pub fn notify_watchers(&self, event: &PropertyEvent) {
        let matching: Vec<Arc<Watcher>> = self
            .watchers
            .read()
            .iter()
            .filter(|w| w.matches(event.property()))
            .cloned()
            .collect();

        for watcher in matching {
            if catch_unwind(AssertUnwindSafe(|| (watcher.callback)(event))).is_err() {
                tracing::error!(
                    watch = watcher.id.0,
                    property = event.name(),
                    "Property watcher panicked"
                );
            }
        }
    }

    /// Tell every member component the session is gone.
    pub fn notify_session_lost(&self, code: i32) {
        let members: Vec<Arc<dyn Component>> =
            self.members.read().iter().filter_map(Weak::upgrade).collect();
        for component in members {
            if catch_unwind(AssertUnwindSafe(|| component.on_session_lost(code))).is_err() {
                tracing::error!(component = component.name(), "Component panicked on session loss");
            }
        }
    }

    /// Observe `property` of `device` (empty `property` = every property).
    pub fn watch(
        &self,
        device: impl Into<String>,
        property: impl Into<String>,
        callback: WatchCallback,
    ) -> WatchId {
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        self.watchers.write().push(Arc::new(Watcher {
            id,
            device: device.into(),
            property: property.into(),
            callback,
        }));
        id
    }

    /// Stop a watcher. Returns `false` if it was not registered.
    pub fn unwatch(&self, id: WatchId) -> bool {
        let mut watchers = self.watchers.write();
        let before = watchers.len();
        watchers.retain(|w| w.id != id);
        watchers.len() != before
    }
}
