//! Compiled policy storage and indexing.
//!
//! The store compiles descriptors in configuration order and builds two
//! indices: by event type (each bucket keeps configuration order, which
//! makes the engine's short-circuit deterministic) and by id.
//! Recompilation builds fresh tables and swaps them atomically, so
//! evaluation never sees a half-installed set.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::policy::{CompiledPolicy, PolicyDescriptor};
use super::ports::RuleEngine;
use crate::event::EventType;

/// Immutable snapshot of the compiled policy set.
#[derive(Debug, Default)]
pub struct PolicyTables {
    by_id: HashMap<u32, Arc<CompiledPolicy>>,
    by_event_type: Vec<Vec<Arc<CompiledPolicy>>>,
}

impl PolicyTables {
    /// Policies whose event-type mask covers `t`, in configuration
    /// order.
    #[must_use]
    pub fn candidates(&self, t: EventType) -> &[Arc<CompiledPolicy>] {
        self.by_event_type
            .get(t.tag() as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Looks a policy up by id.
    #[must_use]
    pub fn by_id(&self, id: u32) -> Option<&Arc<CompiledPolicy>> {
        self.by_id.get(&id)
    }

    /// Number of compiled policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns `true` if no policies are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Holder of the current [`PolicyTables`] snapshot.
pub struct PolicyStore {
    rules: Arc<dyn RuleEngine>,
    tables: RwLock<Arc<PolicyTables>>,
}

impl PolicyStore {
    /// Creates an empty store over the given rule engine.
    #[must_use]
    pub fn new(rules: Arc<dyn RuleEngine>) -> Self {
        Self {
            rules,
            tables: RwLock::new(Arc::new(PolicyTables::default())),
        }
    }

    /// Compiles `descriptors` and atomically replaces the current
    /// tables. Returns the number of policies installed.
    pub fn load(&self, descriptors: &[PolicyDescriptor]) -> usize {
        let mut by_id = HashMap::with_capacity(descriptors.len());
        let mut by_event_type: Vec<Vec<Arc<CompiledPolicy>>> =
            vec![Vec::new(); EventType::COUNT];

        for descriptor in descriptors {
            let compiled = Arc::new(CompiledPolicy::compile(descriptor, &self.rules));
            debug!(
                policy = %compiled.name,
                id = compiled.id,
                event_types = compiled.event_types.len(),
                "compiled policy"
            );

            if by_id.insert(compiled.id, Arc::clone(&compiled)).is_some() {
                warn!(id = compiled.id, "duplicate policy id, later entry wins by id");
            }
            for t in compiled.event_types.iter() {
                by_event_type[t.tag() as usize].push(Arc::clone(&compiled));
            }
        }

        let count = by_id.len();
        let tables = Arc::new(PolicyTables {
            by_id,
            by_event_type,
        });
        *self.tables.write().expect("policy tables poisoned") = tables;
        count
    }

    /// The current tables snapshot. Holders keep evaluating against a
    /// consistent set even across a concurrent reload.
    #[must_use]
    pub fn tables(&self) -> Arc<PolicyTables> {
        Arc::clone(&self.tables.read().expect("policy tables poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::*;
    use crate::event::{Event, EventTypeSet};
    use crate::policy::ports::{RuleEngineError, RuleMatch};

    /// Rule engine stub mapping each ruleset to a fixed type mask.
    struct MaskEngine {
        masks: Mutex<HashMap<String, EventTypeSet>>,
        ids: Mutex<Vec<String>>,
    }

    impl MaskEngine {
        fn new(masks: &[(&str, &[EventType])]) -> Arc<Self> {
            Arc::new(Self {
                masks: Mutex::new(
                    masks
                        .iter()
                        .map(|(name, types)| {
                            ((*name).to_string(), types.iter().copied().collect())
                        })
                        .collect(),
                ),
                ids: Mutex::new(Vec::new()),
            })
        }
    }

    impl RuleEngine for MaskEngine {
        fn enable_rule(&self, _pattern: &str, _enabled: bool, _ruleset: &str) {}
        fn enable_by_tag(&self, _tags: &BTreeSet<String>, _enabled: bool, _ruleset: &str) {}

        fn find_ruleset_id(&self, ruleset: &str) -> u32 {
            let mut ids = self.ids.lock().unwrap();
            if let Some(pos) = ids.iter().position(|n| n == ruleset) {
                return u32::try_from(pos).unwrap();
            }
            ids.push(ruleset.to_string());
            u32::try_from(ids.len() - 1).unwrap()
        }

        fn event_types_for(&self, ruleset_id: u32) -> EventTypeSet {
            let ids = self.ids.lock().unwrap();
            let name = &ids[ruleset_id as usize];
            self.masks
                .lock()
                .unwrap()
                .get(name)
                .copied()
                .unwrap_or_default()
        }

        fn process(
            &self,
            _event: &Event,
            _ruleset_id: u32,
        ) -> Result<Option<RuleMatch>, RuleEngineError> {
            Ok(None)
        }
    }

    fn descriptor(id: u32, name: &str) -> PolicyDescriptor {
        PolicyDescriptor {
            id,
            name: name.to_string(),
            ..PolicyDescriptor::default()
        }
    }

    #[test]
    fn test_index_keeps_configuration_order() {
        let rules = MaskEngine::new(&[
            ("a", &[EventType::Open, EventType::Exec]),
            ("b", &[EventType::Open]),
        ]);
        let store = PolicyStore::new(rules);

        let count = store.load(&[descriptor(2, "a"), descriptor(1, "b")]);
        assert_eq!(count, 2);

        let tables = store.tables();
        let open: Vec<u32> = tables
            .candidates(EventType::Open)
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(open, vec![2, 1]);

        let exec: Vec<u32> = tables
            .candidates(EventType::Exec)
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(exec, vec![2]);
        assert!(tables.candidates(EventType::Unlink).is_empty());
    }

    #[test]
    fn test_reload_swaps_atomically() {
        let rules = MaskEngine::new(&[("a", &[EventType::Open]), ("b", &[EventType::Open])]);
        let store = PolicyStore::new(rules);

        store.load(&[descriptor(1, "a")]);
        let old = store.tables();

        store.load(&[descriptor(2, "b")]);
        let new = store.tables();

        // The held snapshot still answers from the old set.
        assert!(old.by_id(1).is_some());
        assert!(old.by_id(2).is_none());
        assert!(new.by_id(2).is_some());
        assert!(new.by_id(1).is_none());
    }
}
