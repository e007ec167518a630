//! Wire message bodies.
//!
//! Hand-annotated [`prost`] messages for everything the agent emits to
//! the collector. Maps are avoided so encoding stays deterministic;
//! repeated fields keep their producer order.

use prost::Message;

/// Action type codes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ActionTypeCode {
    /// Retrospective capture of the event neighborhood.
    Capture = 0,
    /// Pause the offending container.
    ContainerPause = 1,
    /// Stop the offending container.
    ContainerStop = 2,
    /// Action type unknown to this agent build.
    Unknown = 99,
}

/// Outcome of one policy action.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResultMsg {
    /// Action type code.
    #[prost(enumeration = "ActionTypeCode", tag = "1")]
    pub action: i32,

    /// Whether the action succeeded.
    #[prost(bool, tag = "2")]
    pub successful: bool,

    /// Human-readable failure detail, empty on success.
    #[prost(string, tag = "3")]
    pub errmsg: String,

    /// Capture token, set only for successful capture actions.
    #[prost(string, tag = "4")]
    pub token: String,
}

/// Rule detail attached to condition-based matches.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuleDetailMsg {
    /// Name of the matching rule.
    #[prost(string, tag = "1")]
    pub rule: String,

    /// Rendered rule output.
    #[prost(string, tag = "2")]
    pub output: String,
}

/// One emitted policy match.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolicyEventMsg {
    /// Event timestamp in nanoseconds.
    #[prost(uint64, tag = "1")]
    pub timestamp_ns: u64,

    /// Matching policy id.
    #[prost(uint32, tag = "2")]
    pub policy_id: u32,

    /// Container the event belonged to, empty for host events.
    #[prost(string, tag = "3")]
    pub container_id: String,

    /// Rule detail.
    #[prost(message, optional, tag = "4")]
    pub rule_detail: Option<RuleDetailMsg>,

    /// One result per configured action, in configuration order.
    #[prost(message, repeated, tag = "5")]
    pub action_results: Vec<ActionResultMsg>,

    /// Source dropped-events counter snapshotted at emission.
    #[prost(uint64, tag = "6")]
    pub events_dropped: u64,
}

/// Batch of policy events.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PolicyEventsMsg {
    /// Events in the batch.
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<PolicyEventMsg>,
}

/// Per-policy suppression summary entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ThrottledEntryMsg {
    /// Policy id whose events were suppressed.
    #[prost(uint32, tag = "1")]
    pub policy_id: u32,

    /// Number of suppressed events since the last summary.
    #[prost(uint64, tag = "2")]
    pub count: u64,
}

/// Suppression summary emitted at each report interval.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ThrottledPolicyEventsMsg {
    /// Summary timestamp in nanoseconds.
    #[prost(uint64, tag = "1")]
    pub timestamp_ns: u64,

    /// Per-policy entries.
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<ThrottledEntryMsg>,

    /// Total suppressed events across all policies.
    #[prost(uint64, tag = "3")]
    pub total_count: u64,
}

/// One compliance task result.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompResultMsg {
    /// Task name.
    #[prost(string, tag = "1")]
    pub task_name: String,

    /// Task id.
    #[prost(uint64, tag = "2")]
    pub task_id: u64,

    /// Whether the run succeeded.
    #[prost(bool, tag = "3")]
    pub successful: bool,

    /// Result summary text.
    #[prost(string, tag = "4")]
    pub summary: String,
}

/// Batch of compliance results.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompResultsMsg {
    /// Results in the batch.
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<CompResultMsg>,
}

/// One chunk of a drained capture file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CaptureDataMsg {
    /// Capture token the chunk belongs to.
    #[prost(string, tag = "1")]
    pub token: String,

    /// Chunk sequence number, starting at zero.
    #[prost(uint32, tag = "2")]
    pub seq: u32,

    /// Set on the final chunk.
    #[prost(bool, tag = "3")]
    pub last: bool,

    /// Raw capture bytes.
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

/// Encodes any wire message to its protobuf bytes.
#[must_use]
pub fn encode_body<M: Message>(msg: &M) -> bytes::Bytes {
    bytes::Bytes::from(msg.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_policy_event_round_trip() {
        let msg = PolicyEventMsg {
            timestamp_ns: 42,
            policy_id: 7,
            container_id: "c1".to_string(),
            rule_detail: Some(RuleDetailMsg {
                rule: "write_below_etc".to_string(),
                output: "file below /etc opened for writing".to_string(),
            }),
            action_results: vec![ActionResultMsg {
                action: ActionTypeCode::Capture as i32,
                successful: true,
                errmsg: String::new(),
                token: "tok".to_string(),
            }],
            events_dropped: 3,
        };

        let bytes = encode_body(&msg);
        let decoded = PolicyEventMsg::decode(bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_throttled_summary_round_trip() {
        let msg = ThrottledPolicyEventsMsg {
            timestamp_ns: 10,
            entries: vec![ThrottledEntryMsg {
                policy_id: 1,
                count: 95,
            }],
            total_count: 95,
        };
        let decoded = ThrottledPolicyEventsMsg::decode(encode_body(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }
}
