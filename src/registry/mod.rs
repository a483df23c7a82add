//! Component registry: the state of record.
//!
//! Maps qualified name -> [`Component`] plus a reverse index file -> names.
//! All mutations take one write lock, so readers never observe a file's
//! components half-applied. Every mutation is published to subscribers in
//! the order it was applied: the subscriber list is locked before the state
//! lock is released. Publishing never blocks on a slow subscriber.
//!
//! When two files define the same name, the most recently scanned one wins
//! and the other definition is kept aside. Losing the winning file brings
//! the displaced definition back instead of removing the name.

mod subscriber;

pub use subscriber::Subscription;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::component::Component;
use crate::config::RegistrySection;
use crate::core::Diagnostic;
use crate::{debug, log};
use subscriber::{Delivery, Subscriber};

/// Last build outcome of a component. Stored beside the component, never
/// inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    pub component: String,
    pub success: bool,
    pub errors: Vec<Diagnostic>,
    pub duration: Duration,
    pub cache_hit: bool,
    /// Short-circuited by the circuit breaker; the compiler did not run.
    pub circuit_open: bool,
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Added(Arc<Component>),
    Updated {
        previous: Arc<Component>,
        current: Arc<Component>,
    },
    Removed(Arc<Component>),
    BuildFinished(Arc<BuildSummary>),
    Cleared,
}

/// A name that moved from one file to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub name: String,
    pub kept: PathBuf,
    pub displaced: PathBuf,
}

/// Result of applying one file's components.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    pub buffer: usize,
    pub send_timeout: Duration,
    pub max_strikes: u32,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from(&RegistrySection::default())
    }
}

impl From<&RegistrySection> for RegistryOptions {
    fn from(section: &RegistrySection) -> Self {
        Self {
            buffer: section.subscriber_buffer,
            send_timeout: Duration::from_millis(section.send_timeout_ms),
            max_strikes: section.max_strikes.max(1),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    components: FxHashMap<String, Arc<Component>>,
    by_file: FxHashMap<PathBuf, BTreeSet<String>>,
    builds: FxHashMap<String, Arc<BuildSummary>>,
    /// Definitions displaced by a same-named component in another file,
    /// oldest first.
    shadowed: FxHashMap<String, Vec<Arc<Component>>>,
}

impl RegistryState {
    fn unlink(&mut self, name: &str, path: &Path) {
        if let Some(names) = self.by_file.get_mut(path) {
            names.remove(name);
            if names.is_empty() {
                self.by_file.remove(path);
            }
        }
    }

    fn take(&mut self, name: &str) -> Option<Arc<Component>> {
        let component = self.components.remove(name)?;
        self.unlink(name, &component.path);
        self.builds.remove(name);
        Some(component)
    }

    /// Drop the definitions of `path` kept aside, except for `keep`.
    fn forget_shadows(&mut self, path: &Path, keep: &BTreeSet<&str>) {
        self.shadowed.retain(|name, displaced| {
            if !keep.contains(name.as_str()) {
                displaced.retain(|c| c.path != path);
            }
            !displaced.is_empty()
        });
    }

    fn shadow(&mut self, displaced: Arc<Component>) {
        let stack = self.shadowed.entry(displaced.name.clone()).or_default();
        stack.retain(|c| c.path != displaced.path);
        stack.push(displaced);
    }

    /// Remove `name` because its file no longer defines it. The most recently
    /// displaced definition from another file takes its place.
    fn withdraw(&mut self, name: &str, events: &mut Vec<RegistryEvent>, change: &mut FileChange) {
        let Some(gone) = self.take(name) else {
            return;
        };
        let restored = self.shadowed.get_mut(name).and_then(Vec::pop);
        if self.shadowed.get(name).is_some_and(Vec::is_empty) {
            self.shadowed.remove(name);
        }

        match restored {
            Some(current) => {
                self.by_file
                    .entry(current.path.clone())
                    .or_default()
                    .insert(name.to_string());
                self.components.insert(name.to_string(), Arc::clone(&current));
                change.updated.push(name.to_string());
                events.push(RegistryEvent::Updated {
                    previous: gone,
                    current,
                });
            }
            None => {
                change.removed.push(name.to_string());
                events.push(RegistryEvent::Removed(gone));
            }
        }
    }

    /// Insert or replace one component, appending the event and outcome.
    fn put(&mut self, component: Component, events: &mut Vec<RegistryEvent>, change: &mut FileChange) {
        let name = component.name.clone();
        let current = Arc::new(component);
        if let Some(displaced) = self.shadowed.get_mut(&name) {
            displaced.retain(|c| c.path != current.path);
            if displaced.is_empty() {
                self.shadowed.remove(&name);
            }
        }

        match self.components.get(&name).cloned() {
            None => {
                events.push(RegistryEvent::Added(Arc::clone(&current)));
                change.added.push(name.clone());
            }
            Some(previous) => {
                if previous.path != current.path {
                    self.unlink(&name, &previous.path);
                    change.conflicts.push(Conflict {
                        name: name.clone(),
                        kept: current.path.clone(),
                        displaced: previous.path.clone(),
                    });
                    self.shadow(Arc::clone(&previous));
                } else if previous.same_shape(&current) {
                    change.unchanged.push(name.clone());
                    self.components.insert(name, current);
                    return;
                }
                events.push(RegistryEvent::Updated {
                    previous,
                    current: Arc::clone(&current),
                });
                change.updated.push(name.clone());
            }
        }

        self.by_file
            .entry(current.path.clone())
            .or_default()
            .insert(name.clone());
        self.components.insert(name, current);
    }
}

pub struct ComponentRegistry {
    state: RwLock<RegistryState>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    options: RegistryOptions,
}

impl ComponentRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            options,
        }
    }

    // ------------------------------------------------------------------
    // mutations
    // ------------------------------------------------------------------

    /// Register a new component or update the existing entry of that name.
    pub fn register(&self, component: Component) -> FileChange {
        let mut change = FileChange::default();
        let mut events = Vec::new();
        let mut state = self.state.write();
        state.put(component, &mut events, &mut change);
        self.publish(state, events);
        change
    }

    /// Replace everything `path` defines with `components` in one step.
    /// Names the file no longer defines are removed.
    pub fn apply_file(&self, path: &Path, components: Vec<Component>) -> FileChange {
        let mut change = FileChange::default();
        let mut events = Vec::new();
        let mut state = self.state.write();

        let before: BTreeSet<String> = state.by_file.get(path).cloned().unwrap_or_default();
        let after: BTreeSet<&str> = components.iter().map(|c| c.name.as_str()).collect();

        state.forget_shadows(path, &after);
        for name in before.iter().filter(|n| !after.contains(n.as_str())) {
            state.withdraw(name, &mut events, &mut change);
        }
        for component in components {
            state.put(component, &mut events, &mut change);
        }

        self.publish(state, events);
        change
    }

    /// Remove `name` outright, including definitions kept aside for it.
    pub fn remove(&self, name: &str) -> Option<Arc<Component>> {
        let mut state = self.state.write();
        state.shadowed.remove(name);
        let removed = state.take(name)?;
        self.publish(state, vec![RegistryEvent::Removed(Arc::clone(&removed))]);
        Some(removed)
    }

    /// Remove every component defined by `path`. A name another file also
    /// defines falls back to that file's definition and is reported as
    /// updated.
    pub fn remove_file(&self, path: &Path) -> FileChange {
        let mut change = FileChange::default();
        let mut events = Vec::new();
        let mut state = self.state.write();

        state.forget_shadows(path, &BTreeSet::new());
        let names = state.by_file.get(path).cloned().unwrap_or_default();
        for name in &names {
            state.withdraw(name, &mut events, &mut change);
        }

        self.publish(state, events);
        change
    }

    /// Store the latest build outcome and announce it.
    pub fn record_build(&self, summary: BuildSummary) {
        let summary = Arc::new(summary);
        let mut state = self.state.write();
        if !state.components.contains_key(&summary.component) {
            // Component removed while its build was running
            return;
        }
        state
            .builds
            .insert(summary.component.clone(), Arc::clone(&summary));
        self.publish(state, vec![RegistryEvent::BuildFinished(summary)]);
    }

    /// Drop all state ahead of a full rescan.
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = RegistryState::default();
        self.publish(state, vec![RegistryEvent::Cleared]);
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<Arc<Component>> {
        self.state.read().components.get(name).cloned()
    }

    /// All components, sorted by name.
    pub fn get_all(&self) -> Vec<Arc<Component>> {
        let mut all: Vec<_> = self.state.read().components.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Components `path` currently owns, sorted by name.
    pub fn components_in_file(&self, path: &Path) -> Vec<Arc<Component>> {
        let state = self.state.read();
        state
            .by_file
            .get(path)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| state.components.get(n).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = self.state.read().by_file.keys().cloned().collect();
        files.sort();
        files
    }

    /// Files that own a component or hold a definition kept aside.
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        let state = self.state.read();
        let displaced = state.shadowed.values().flatten().map(|c| &c.path);
        let files: BTreeSet<PathBuf> = state.by_file.keys().chain(displaced).cloned().collect();
        files.into_iter().collect()
    }

    pub fn last_build(&self, name: &str) -> Option<Arc<BuildSummary>> {
        self.state.read().builds.get(name).cloned()
    }

    /// Components whose latest build failed.
    pub fn failing(&self) -> Vec<Arc<BuildSummary>> {
        let mut failing: Vec<_> = self
            .state
            .read()
            .builds
            .values()
            .filter(|b| !b.success)
            .cloned()
            .collect();
        failing.sort_by(|a, b| a.component.cmp(&b.component));
        failing
    }

    pub fn len(&self) -> usize {
        self.state.read().components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // subscriptions
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let RegistryOptions {
            buffer,
            send_timeout,
            max_strikes,
        } = self.options;
        let (subscriber, subscription) = Subscriber::new(id, buffer, send_timeout, max_strikes);
        self.subscribers.lock().push(subscriber);
        subscription
    }

    /// Live subscribers. Closed ones are pruned on the way.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.is_closed());
        subscribers.len()
    }

    /// Offer `events` in order. Takes the subscriber lock before the state
    /// guard is released so concurrent mutations publish in apply order.
    /// Offers never block; full subscribers are served by their forwarder.
    fn publish(
        &self,
        state: parking_lot::RwLockWriteGuard<'_, RegistryState>,
        events: Vec<RegistryEvent>,
    ) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        drop(state);

        subscribers.retain(|subscriber| {
            for event in &events {
                match subscriber.offer(event.clone()) {
                    Delivery::Sent => {}
                    Delivery::Deferred => {
                        debug!("registry"; "subscriber {} is backlogged", subscriber.id);
                    }
                    Delivery::Closed => {
                        log!("registry"; "removing closed subscriber {}", subscriber.id);
                        return false;
                    }
                }
            }
            true
        });
    }
}
