//! External collaborator ports of the policy engine.
//!
//! The rule condition compiler, the infrastructure inventory, and the
//! container runtime all live outside this crate; the engine talks to
//! them through these traits. Implementations must be `Send + Sync`
//! because the engine is shared between the producer and control
//! threads.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::actions::ActionCompletionHandle;
use crate::event::{Event, EventTypeSet};

/// One predicate of a policy or task scope.
///
/// Keys name container labels (`container.label.team`) or host
/// identifiers (`host.hostName`, `host.mac`); the infrastructure state
/// resolves them against its inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopePredicate {
    /// Attribute key the predicate tests.
    pub key: String,

    /// Comparison operator.
    pub op: ScopeOp,

    /// Operand values; one for scalar operators, several for set
    /// membership.
    #[serde(default)]
    pub values: Vec<String>,
}

/// Scope predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeOp {
    /// Attribute equals the single operand.
    Eq,
    /// Attribute differs from the single operand.
    NotEq,
    /// Attribute is one of the operands.
    In,
    /// Attribute is none of the operands.
    NotIn,
    /// Attribute contains the single operand.
    Contains,
    /// Attribute starts with the single operand.
    StartsWith,
}

/// A rule engine hit: the rule that fired and its output template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Name of the matching rule.
    pub rule_name: String,

    /// Output template, rendered with event fields on emission.
    pub format_template: String,
}

/// Error raised by the rule engine while processing an event.
///
/// Treated as a miss by the engine; never propagated.
#[derive(Debug, Error)]
#[error("rule engine error: {0}")]
pub struct RuleEngineError(pub String);

/// Port to the external rule condition engine.
///
/// `process` must be pure with respect to the event: no hidden side
/// effects, same verdict for the same event and ruleset.
pub trait RuleEngine: Send + Sync {
    /// Enables or disables rules matching a name pattern within a
    /// ruleset.
    fn enable_rule(&self, pattern: &str, enabled: bool, ruleset: &str);

    /// Enables or disables rules carrying any of `tags` within a
    /// ruleset.
    fn enable_by_tag(&self, tags: &BTreeSet<String>, enabled: bool, ruleset: &str);

    /// Resolves a ruleset name to its id.
    fn find_ruleset_id(&self, ruleset: &str) -> u32;

    /// The event types any enabled rule of the ruleset can match.
    fn event_types_for(&self, ruleset_id: u32) -> EventTypeSet;

    /// Evaluates the ruleset's conditions against one event.
    ///
    /// # Errors
    ///
    /// Returns [`RuleEngineError`] on an internal evaluation failure;
    /// the engine logs it and treats the event as a miss.
    fn process(&self, event: &Event, ruleset_id: u32) -> Result<Option<RuleMatch>, RuleEngineError>;
}

/// Port to the infrastructure inventory used for scope decisions.
pub trait InfrastructureState: Send + Sync {
    /// Evaluates `predicates` for an event's container and this host.
    fn match_scope(
        &self,
        container_id: Option<&str>,
        host_id: &str,
        predicates: &[ScopePredicate],
    ) -> bool;

    /// Registers a named scope for continuous re-evaluation as
    /// containers come and go.
    fn register_scope(
        &self,
        reg_id: &str,
        host_scope: bool,
        container_scope: bool,
        predicates: &[ScopePredicate],
    );

    /// Whether a previously registered scope currently matches.
    fn check_registered_scope(&self, reg_id: &str) -> bool;
}

/// Container runtime commands a policy action can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerCmd {
    /// Freeze the container.
    Pause,
    /// Stop the container.
    Stop,
}

impl std::fmt::Display for ContainerCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause => f.write_str("pause"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Port to the container runtime control channel.
///
/// Commands are issued from the engine's thread and complete
/// asynchronously through the provided handle; implementations decide
/// their own threading.
pub trait ContainerControl: Send + Sync {
    /// Issues `kind` against `container_id`, completing `done` when the
    /// runtime answers.
    fn cmd(&self, kind: ContainerCmd, container_id: &str, done: ActionCompletionHandle);
}
