//! Caller-facing name registry.
//!
//! Maps each caller-facing name to exactly one backend tool binding. Writes
//! are serialized by one lock; readers see the state before or after a
//! mutation, never in between. Listing follows registration order, and a
//! replaced name moves to the end.
//!
//! A name taken over by another backend remembers the binding it displaced.
//! Refreshing the displaced backend does not take the name back, and when
//! the winner is unregistered the displaced binding is restored.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{CollisionEvent, QualifiedToolName, ToolDescriptor};
use crate::{core::BackendConnection, naming::NameForm};

/// One caller-facing name bound to a backend tool.
#[derive(Debug)]
pub struct RegistryEntry {
    caller_name: String,
    form: NameForm,
    connection: Arc<BackendConnection>,
    descriptor: Arc<ToolDescriptor>,
}

impl RegistryEntry {
    pub fn new(
        caller_name: impl Into<String>,
        form: NameForm,
        connection: Arc<BackendConnection>,
        descriptor: Arc<ToolDescriptor>,
    ) -> Self {
        Self {
            caller_name: caller_name.into(),
            form,
            connection,
            descriptor,
        }
    }

    pub fn caller_name(&self) -> &str {
        &self.caller_name
    }

    pub fn form(&self) -> NameForm {
        self.form
    }

    pub fn connection(&self) -> &Arc<BackendConnection> {
        &self.connection
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection.id()
    }

    pub fn descriptor(&self) -> &Arc<ToolDescriptor> {
        &self.descriptor
    }

    pub fn backend(&self) -> &str {
        self.descriptor.backend()
    }

    /// Backend-local tool name
    pub fn local_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn qualified_name(&self) -> QualifiedToolName {
        self.descriptor.qualified_name()
    }
}

/// Collision events kept before the oldest are dropped
const COLLISION_LOG_CAPACITY: usize = 256;

struct Slot {
    seq: u64,
    entry: Arc<RegistryEntry>,
    /// Bindings this name previously pointed at, oldest first. One is
    /// restored when the current binding's backend goes away.
    displaced: Vec<Arc<RegistryEntry>>,
}

impl Slot {
    fn displaces(&self, connection_id: Uuid) -> bool {
        self.displaced
            .iter()
            .any(|entry| entry.connection_id() == connection_id)
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Slot>,
    next_seq: u64,
    collisions: VecDeque<CollisionEvent>,
    seen_collisions: HashSet<(String, QualifiedToolName, QualifiedToolName)>,
}

impl RegistryState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert(&mut self, entry: RegistryEntry) -> Option<Arc<RegistryEntry>> {
        let seq = self.next_seq();
        let entry = Arc::new(entry);

        let Some(slot) = self.entries.get_mut(&entry.caller_name) else {
            self.entries.insert(
                entry.caller_name.clone(),
                Slot {
                    seq,
                    entry,
                    displaced: Vec::new(),
                },
            );
            return None;
        };

        let previous = std::mem::replace(&mut slot.entry, entry.clone());
        slot.seq = seq;
        slot.displaced
            .retain(|old| old.connection_id() != entry.connection_id());

        if previous.connection_id() != entry.connection_id() {
            slot.displaced.push(previous.clone());
        }
        let (old, new) = (previous.qualified_name(), entry.qualified_name());
        if old == new {
            debug!(caller_name = %entry.caller_name, "Re-registered tool");
        } else {
            self.record_collision(&entry, old, new);
        }
        Some(previous)
    }

    fn record_collision(
        &mut self,
        entry: &RegistryEntry,
        previous: QualifiedToolName,
        replacement: QualifiedToolName,
    ) {
        let key = (entry.caller_name.clone(), previous, replacement);
        if !self.seen_collisions.insert(key.clone()) {
            debug!(
                caller_name = %entry.caller_name,
                previous = %key.1,
                replacement = %key.2,
                "Tool name rebound"
            );
            return;
        }
        let (caller_name, previous, replacement) = key;
        warn!(
            caller_name = %caller_name,
            previous = %previous,
            replacement = %replacement,
            "Tool name collision, later registration wins"
        );
        if self.collisions.len() == COLLISION_LOG_CAPACITY {
            self.collisions.pop_front();
        }
        self.collisions.push_back(CollisionEvent {
            caller_name,
            form: entry.form,
            previous,
            replacement,
            at: Utc::now(),
        });
    }

    /// Drop every binding of `connection_id` outside `keep`. A name it held
    /// falls back to the most recently displaced binding, if one is left.
    fn remove_connection(&mut self, connection_id: Uuid, keep: &HashSet<String>) -> usize {
        let mut removed = 0;
        let mut vacated = Vec::new();

        for (name, slot) in self.entries.iter_mut() {
            if keep.contains(name) {
                continue;
            }
            let before = slot.displaced.len();
            slot.displaced
                .retain(|entry| entry.connection_id() != connection_id);
            removed += before - slot.displaced.len();

            if slot.entry.connection_id() == connection_id {
                removed += 1;
                vacated.push(name.clone());
            }
        }

        for name in vacated {
            let seq = self.next_seq();
            let Some(slot) = self.entries.get_mut(&name) else {
                continue;
            };
            match slot.displaced.pop() {
                Some(entry) => {
                    info!(
                        caller_name = %name,
                        backend = %entry.backend(),
                        "Restored displaced tool binding"
                    );
                    slot.entry = entry;
                    slot.seq = seq;
                }
                None => {
                    self.entries.remove(&name);
                }
            }
        }
        removed
    }

    /// Swap the bindings of `connection_id` for `entries`. Names the
    /// connection already holds keep their position, and a name it lost to
    /// another backend stays with that backend.
    fn replace_connection(&mut self, connection_id: Uuid, entries: Vec<RegistryEntry>) -> usize {
        let mut incoming: HashMap<String, RegistryEntry> = entries
            .into_iter()
            .map(|entry| (entry.caller_name.clone(), entry))
            .collect();
        let added = incoming.len();

        let mut refreshed = HashSet::new();
        for (name, slot) in self.entries.iter_mut() {
            if slot.entry.connection_id() == connection_id {
                if let Some(entry) = incoming.remove(name) {
                    slot.entry = Arc::new(entry);
                    refreshed.insert(name.clone());
                }
            } else if slot.displaces(connection_id) {
                if let Some(entry) = incoming.remove(name) {
                    slot.displaced
                        .retain(|old| old.connection_id() != connection_id);
                    slot.displaced.push(Arc::new(entry));
                    refreshed.insert(name.clone());
                }
            }
        }

        let removed = self.remove_connection(connection_id, &refreshed);
        for entry in incoming.into_values() {
            self.insert(entry);
        }
        debug!(
            connection_id = %connection_id,
            refreshed = refreshed.len(),
            removed,
            added,
            "Replaced backend registrations"
        );
        added
    }

    fn ordered(&self) -> Vec<&Slot> {
        let mut slots: Vec<&Slot> = self.entries.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a binding. Returns the replaced entry, if any.
    pub fn register(
        &self,
        caller_name: impl Into<String>,
        form: NameForm,
        connection: &Arc<BackendConnection>,
        descriptor: Arc<ToolDescriptor>,
    ) -> Option<Arc<RegistryEntry>> {
        let entry = RegistryEntry::new(caller_name, form, connection.clone(), descriptor);
        self.state.write().insert(entry)
    }

    /// Swap every binding of `connection_id` for `entries` in one write.
    pub fn replace_for(&self, connection_id: Uuid, entries: Vec<RegistryEntry>) -> usize {
        self.state.write().replace_connection(connection_id, entries)
    }

    pub fn lookup(&self, caller_name: &str) -> Option<Arc<RegistryEntry>> {
        self.state
            .read()
            .entries
            .get(caller_name)
            .map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, caller_name: &str) -> bool {
        self.state.read().entries.contains_key(caller_name)
    }

    /// (caller name, descriptor) pairs in registration order.
    pub fn list(&self) -> Vec<(String, Arc<ToolDescriptor>)> {
        self.state
            .read()
            .ordered()
            .into_iter()
            .map(|slot| (slot.entry.caller_name.clone(), slot.entry.descriptor.clone()))
            .collect()
    }

    /// Point-in-time copy of every entry in registration order.
    pub fn snapshot(&self) -> Vec<Arc<RegistryEntry>> {
        self.state
            .read()
            .ordered()
            .into_iter()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Remove every entry bound to this connection. Names it held go back
    /// to the binding they displaced, if that backend is still registered.
    pub fn unregister_all_for(&self, connection: &BackendConnection) -> usize {
        let removed = self
            .state
            .write()
            .remove_connection(connection.id(), &HashSet::new());
        if removed > 0 {
            debug!(
                backend = %connection.name(),
                connection_id = %connection.id(),
                removed,
                "Unregistered backend tools"
            );
        }
        removed
    }

    /// Recent collisions, oldest first. Each (name, previous, replacement)
    /// rebinding is recorded once.
    pub fn collisions(&self) -> Vec<CollisionEvent> {
        self.state.read().collisions.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{BackendSpec, ConnectionSettings},
        test_utils::{test_tool, FakeConnector},
    };

    fn conn(name: &str) -> Arc<BackendConnection> {
        Arc::new(BackendConnection::new(
            BackendSpec::stdio(name, "cmd"),
            Arc::new(FakeConnector::new()),
            ConnectionSettings::default(),
        ))
    }

    fn desc(backend: &str, tool: &str) -> Arc<ToolDescriptor> {
        Arc::new(ToolDescriptor::new(backend, test_tool(tool)))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ToolRegistry::new();
        let echo = conn("echo");
        assert!(registry
            .register("proxy.echo.echo", NameForm::Hierarchical, &echo, desc("echo", "echo"))
            .is_none());

        let entry = registry.lookup("proxy.echo.echo").unwrap();
        assert_eq!(entry.backend(), "echo");
        assert_eq!(entry.local_name(), "echo");
        assert_eq!(entry.connection_id(), echo.id());
        assert!(registry.lookup("echo_echo").is_none());
    }

    #[test]
    fn test_list_follows_registration_order() {
        let registry = ToolRegistry::new();
        let a = conn("a");
        for name in ["zeta", "alpha", "mid"] {
            registry.register(format!("a_{name}"), NameForm::Flat, &a, desc("a", name));
        }
        let names: Vec<_> = registry.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a_zeta", "a_alpha", "a_mid"]);
    }

    #[test]
    fn test_collision_replaces_and_records() {
        let registry = ToolRegistry::new();
        let dashed = conn("search-api");
        let underscored = conn("search_api");

        registry.register(
            "search_api_query",
            NameForm::Flat,
            &dashed,
            desc("search-api", "query"),
        );
        let replaced = registry
            .register(
                "search_api_query",
                NameForm::Flat,
                &underscored,
                desc("search_api", "query"),
            )
            .expect("previous binding returned");
        assert_eq!(replaced.backend(), "search-api");

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup("search_api_query").unwrap().backend(),
            "search_api"
        );
        let collisions = registry.collisions();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].previous, QualifiedToolName::new("search-api", "query"));
        assert_eq!(collisions[0].replacement, QualifiedToolName::new("search_api", "query"));
    }

    #[test]
    fn test_replacement_moves_to_end() {
        let registry = ToolRegistry::new();
        let a = conn("a");
        registry.register("first", NameForm::Flat, &a, desc("a", "x"));
        registry.register("second", NameForm::Flat, &a, desc("a", "y"));
        registry.register("first", NameForm::Flat, &a, desc("a", "x"));

        let names: Vec<_> = registry.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["second", "first"]);
        assert!(registry.collisions().is_empty(), "same binding is not a collision");
    }

    #[test]
    fn test_unregister_all_for_matches_connection() {
        let registry = ToolRegistry::new();
        let a = conn("a");
        let b = conn("b");
        registry.register("a_ping", NameForm::Flat, &a, desc("a", "ping"));
        registry.register("proxy.a.ping", NameForm::Hierarchical, &a, desc("a", "ping"));
        registry.register("b_ping", NameForm::Flat, &b, desc("b", "ping"));

        assert_eq!(registry.unregister_all_for(&a), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("b_ping"));
        assert_eq!(registry.unregister_all_for(&a), 0);
    }

    #[test]
    fn test_replace_for_swaps_atomically() {
        let registry = ToolRegistry::new();
        let a = conn("a");
        registry.register("a_old", NameForm::Flat, &a, desc("a", "old"));

        let added = registry.replace_for(
            a.id(),
            vec![RegistryEntry::new("a_new", NameForm::Flat, a.clone(), desc("a", "new"))],
        );
        assert_eq!(added, 1);
        assert!(!registry.contains("a_old"));
        assert!(registry.contains("a_new"));
    }

    fn flat(name: &str, connection: &Arc<BackendConnection>, tool: &str) -> RegistryEntry {
        RegistryEntry::new(
            name,
            NameForm::Flat,
            connection.clone(),
            desc(connection.name(), tool),
        )
    }

    #[test]
    fn test_refresh_keeps_collision_winner() {
        let registry = ToolRegistry::new();
        let dashed = conn("search-api");
        let underscored = conn("search_api");
        registry.replace_for(dashed.id(), vec![flat("search_api_query", &dashed, "query")]);
        registry.replace_for(
            underscored.id(),
            vec![flat("search_api_query", &underscored, "query")],
        );

        for _ in 0..3 {
            registry.replace_for(dashed.id(), vec![flat("search_api_query", &dashed, "query")]);
            registry.replace_for(
                underscored.id(),
                vec![flat("search_api_query", &underscored, "query")],
            );
            assert_eq!(
                registry.lookup("search_api_query").unwrap().backend(),
                "search_api"
            );
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.collisions().len(), 1);
    }

    #[test]
    fn test_unregister_restores_displaced_binding() {
        let registry = ToolRegistry::new();
        let dashed = conn("search-api");
        let underscored = conn("search_api");
        registry.replace_for(dashed.id(), vec![flat("search_api_query", &dashed, "query")]);
        registry.replace_for(
            underscored.id(),
            vec![flat("search_api_query", &underscored, "query")],
        );

        assert_eq!(registry.unregister_all_for(&underscored), 1);
        let entry = registry.lookup("search_api_query").unwrap();
        assert_eq!(entry.backend(), "search-api");
        assert_eq!(entry.connection_id(), dashed.id());

        assert_eq!(registry.unregister_all_for(&dashed), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_displaced_binding_dropped_when_tool_disappears() {
        let registry = ToolRegistry::new();
        let dashed = conn("search-api");
        let underscored = conn("search_api");
        registry.replace_for(dashed.id(), vec![flat("search_api_query", &dashed, "query")]);
        registry.replace_for(
            underscored.id(),
            vec![flat("search_api_query", &underscored, "query")],
        );

        // search-api stops exposing `query`; nothing is left to restore.
        registry.replace_for(dashed.id(), vec![flat("search_api_fetch", &dashed, "fetch")]);
        registry.unregister_all_for(&underscored);
        let names: Vec<_> = registry.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["search_api_fetch"]);
    }

    #[test]
    fn test_collision_log_is_bounded() {
        let registry = ToolRegistry::new();
        let a = conn("a");
        let b = conn("b");
        for i in 0..COLLISION_LOG_CAPACITY + 10 {
            let name = format!("tool_{i}");
            registry.register(name.clone(), NameForm::Flat, &a, desc("a", "x"));
            registry.register(name, NameForm::Flat, &b, desc("b", "x"));
        }
        let collisions = registry.collisions();
        assert_eq!(collisions.len(), COLLISION_LOG_CAPACITY);
        assert_eq!(collisions[0].caller_name, "tool_10");
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let registry = ToolRegistry::new();
        let a = conn("a");
        registry.register("a_one", NameForm::Flat, &a, desc("a", "one"));
        let snapshot = registry.snapshot();
        registry.register("a_two", NameForm::Flat, &a, desc("a", "two"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(snapshot[0].caller_name(), "a_one");
    }
}
