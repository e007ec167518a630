//! Security policies and their evaluation.
//!
//! A [`policy::PolicyDescriptor`] is configuration; the
//! [`store::PolicyStore`] compiles descriptors against the rule engine
//! and indexes them by event type; the [`engine::SecurityEngine`] runs
//! every incoming event through the candidate policies, performs the
//! matched policy's actions, and defers emission until every action has
//! settled and the [`throttle::ThrottleLedger`] has ruled.

pub mod actions;
pub mod engine;
pub mod format;
pub mod metrics;
#[allow(clippy::module_inception)]
pub mod policy;
pub mod ports;
pub mod store;
pub mod throttle;

use uuid::Uuid;

use crate::egress::wire::{
    ActionResultMsg, ActionTypeCode, PolicyEventMsg, RuleDetailMsg,
};

/// The reactive action kinds a policy may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// Retrospective capture of the event neighborhood.
    Capture,
    /// Pause the offending container.
    ContainerPause,
    /// Stop the offending container.
    ContainerStop,
    /// Configured action unknown to this agent build.
    Unknown,
}

impl ActionType {
    const fn wire_code(self) -> ActionTypeCode {
        match self {
            Self::Capture => ActionTypeCode::Capture,
            Self::ContainerPause => ActionTypeCode::ContainerPause,
            Self::ContainerStop => ActionTypeCode::ContainerStop,
            Self::Unknown => ActionTypeCode::Unknown,
        }
    }
}

/// Outcome slot for one configured action.
///
/// Slots are pre-allocated in configuration order when the policy
/// matches; asynchronous completions only stamp their slot, so the order
/// never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    /// The action this slot belongs to.
    pub action: ActionType,

    /// Whether the action succeeded. Starts `true`; failures stamp it.
    pub successful: bool,

    /// Failure detail, if any.
    pub errmsg: Option<String>,

    /// Capture token for successful capture actions.
    pub token: Option<Uuid>,
}

impl ActionResult {
    /// A fresh slot for `action`, optimistically successful.
    #[must_use]
    pub const fn pending(action: ActionType) -> Self {
        Self {
            action,
            successful: true,
            errmsg: None,
            token: None,
        }
    }

    /// A slot already stamped failed with `errmsg`.
    #[must_use]
    pub fn failed(action: ActionType, errmsg: impl Into<String>) -> Self {
        Self {
            action,
            successful: false,
            errmsg: Some(errmsg.into()),
            token: None,
        }
    }
}

/// The outgoing record describing one policy match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEvent {
    /// Matched event's timestamp, nanoseconds.
    pub ts_ns: u64,

    /// Matching policy id.
    pub policy_id: u32,

    /// Container the event belonged to, if any.
    pub container_id: Option<String>,

    /// Name of the matching rule.
    pub rule: String,

    /// Rendered rule output.
    pub output: String,

    /// One result per configured action, in configuration order.
    pub action_results: Vec<ActionResult>,

    /// Source dropped-events counter snapshotted at match time.
    pub events_dropped: u64,
}

impl From<&PolicyEvent> for PolicyEventMsg {
    fn from(event: &PolicyEvent) -> Self {
        Self {
            timestamp_ns: event.ts_ns,
            policy_id: event.policy_id,
            container_id: event.container_id.clone().unwrap_or_default(),
            rule_detail: Some(RuleDetailMsg {
                rule: event.rule.clone(),
                output: event.output.clone(),
            }),
            action_results: event
                .action_results
                .iter()
                .map(|result| ActionResultMsg {
                    action: result.action.wire_code() as i32,
                    successful: result.successful,
                    errmsg: result.errmsg.clone().unwrap_or_default(),
                    token: result.token.map(|t| t.to_string()).unwrap_or_default(),
                })
                .collect(),
            events_dropped: event.events_dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_event_to_wire_keeps_slot_order() {
        let token = Uuid::new_v4();
        let event = PolicyEvent {
            ts_ns: 5,
            policy_id: 3,
            container_id: Some("c9".to_string()),
            rule: "r".to_string(),
            output: "o".to_string(),
            action_results: vec![
                ActionResult {
                    token: Some(token),
                    ..ActionResult::pending(ActionType::Capture)
                },
                ActionResult::failed(ActionType::ContainerPause, "rpc not successful"),
            ],
            events_dropped: 1,
        };

        let msg = PolicyEventMsg::from(&event);
        assert_eq!(msg.action_results.len(), 2);
        assert_eq!(msg.action_results[0].token, token.to_string());
        assert!(!msg.action_results[1].successful);
        assert_eq!(msg.action_results[1].errmsg, "rpc not successful");
    }
}
