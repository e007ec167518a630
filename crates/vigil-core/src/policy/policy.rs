//! Policy descriptors and their compiled form.
//!
//! Descriptors are configuration; compiling one selects the rules it
//! covers in the rule engine (a per-policy ruleset named after the
//! policy), resolves the ruleset id, and computes the event-type mask
//! used to skip evaluation cheaply.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ports::{RuleEngine, ScopePredicate};
use super::ActionType;
use crate::event::EventTypeSet;

/// Matches every rule name; used to reset a ruleset before selection.
const ALL_RULES: &str = ".*";

/// One configured security policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDescriptor {
    /// Stable policy id.
    pub id: u32,

    /// Policy name; also names the per-policy ruleset.
    pub name: String,

    /// Disabled policies are counted, never evaluated.
    pub enabled: bool,

    /// Whether the policy applies to host events.
    pub host_scope: bool,

    /// Whether the policy applies to container events.
    pub container_scope: bool,

    /// Scope predicates over container labels and host identifiers.
    pub scope_predicates: Vec<ScopePredicate>,

    /// Which rules the policy selects.
    pub rule_filter: RuleSelector,

    /// Reactive actions, in execution order.
    pub actions: Vec<ActionDescriptor>,
}

impl Default for PolicyDescriptor {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            enabled: true,
            host_scope: true,
            container_scope: true,
            scope_predicates: Vec::new(),
            rule_filter: RuleSelector::default(),
            actions: Vec::new(),
        }
    }
}

/// Rule selection: by name pattern, by tag set, or both.
///
/// Selection is additive - a rule is enabled if it matches the name
/// pattern *or* carries one of the tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSelector {
    /// Rule name pattern (anchored regex).
    pub name: Option<String>,

    /// Tags whose rules are selected.
    pub tags: BTreeSet<String>,
}

/// One configured reactive action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDescriptor {
    /// Capture the event neighborhood into a file.
    Capture {
        /// Window before the event.
        #[serde(with = "humantime_serde", default = "default_before")]
        before: Duration,

        /// Window after the event.
        #[serde(with = "humantime_serde", default = "default_after")]
        after: Duration,

        /// Optional filter expression for the capture.
        #[serde(default)]
        filter: Option<String>,

        /// Restrict the capture to the offending container.
        #[serde(default)]
        limit_to_container: bool,
    },

    /// Pause the offending container.
    Pause,

    /// Stop the offending container.
    Stop,

    /// Any action type this build does not implement. Kept so the
    /// policy still loads; the engine stamps the result failed.
    #[serde(other)]
    Unknown,
}

const fn default_before() -> Duration {
    Duration::from_secs(6)
}

const fn default_after() -> Duration {
    Duration::from_secs(6)
}

impl ActionDescriptor {
    /// The action's type tag.
    #[must_use]
    pub const fn action_type(&self) -> ActionType {
        match self {
            Self::Capture { .. } => ActionType::Capture,
            Self::Pause => ActionType::ContainerPause,
            Self::Stop => ActionType::ContainerStop,
            Self::Unknown => ActionType::Unknown,
        }
    }
}

/// A policy compiled against the rule engine.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    /// Stable policy id.
    pub id: u32,

    /// Policy name.
    pub name: String,

    /// Enable flag, checked per event.
    pub enabled: bool,

    /// Host scope flag.
    pub host_scope: bool,

    /// Container scope flag.
    pub container_scope: bool,

    /// Scope predicates.
    pub scope_predicates: Vec<ScopePredicate>,

    /// Actions in execution order.
    pub actions: Vec<ActionDescriptor>,

    /// Ruleset id resolved at compile time.
    pub ruleset_id: u32,

    /// Union of event types of every enabled rule.
    pub event_types: EventTypeSet,
}

impl CompiledPolicy {
    /// Compiles `descriptor`, installing its rule selection in the rule
    /// engine under a ruleset named after the policy.
    #[must_use]
    pub fn compile(descriptor: &PolicyDescriptor, rules: &Arc<dyn RuleEngine>) -> Self {
        // Only the rules selected by name/tags should run, so start
        // from an empty selection.
        rules.enable_rule(ALL_RULES, false, &descriptor.name);

        if let Some(pattern) = &descriptor.rule_filter.name {
            rules.enable_rule(pattern, true, &descriptor.name);
        }
        if !descriptor.rule_filter.tags.is_empty() {
            rules.enable_by_tag(&descriptor.rule_filter.tags, true, &descriptor.name);
        }

        let ruleset_id = rules.find_ruleset_id(&descriptor.name);
        let event_types = rules.event_types_for(ruleset_id);

        Self {
            id: descriptor.id,
            name: descriptor.name.clone(),
            enabled: descriptor.enabled,
            host_scope: descriptor.host_scope,
            container_scope: descriptor.container_scope,
            scope_predicates: descriptor.scope_predicates.clone(),
            actions: descriptor.actions.clone(),
            ruleset_id,
            event_types,
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_yaml_with_actions() {
        let yaml = r#"
id: 7
name: "write-below-etc"
scope_predicates:
  - key: "container.label.env"
    op: eq
    values: ["prod"]
rule_filter:
  tags: ["filesystem"]
actions:
  - type: capture
    before: "1s"
    after: "2s"
    limit_to_container: true
  - type: pause
"#;
        let descriptor: PolicyDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.id, 7);
        assert!(descriptor.enabled);
        assert_eq!(descriptor.actions.len(), 2);
        assert!(matches!(
            descriptor.actions[0],
            ActionDescriptor::Capture {
                before,
                after,
                limit_to_container: true,
                ..
            } if before == Duration::from_secs(1) && after == Duration::from_secs(2)
        ));
        assert_eq!(descriptor.actions[1].action_type(), ActionType::ContainerPause);
    }

    #[test]
    fn test_unknown_action_type_still_loads() {
        let yaml = r#"
id: 1
name: "p"
actions:
  - type: quarantine_host
"#;
        let descriptor: PolicyDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(descriptor.actions[0].action_type(), ActionType::Unknown);
    }
}
