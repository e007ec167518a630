//! Property tests for the universal invariants.

mod common;

use std::time::Duration;

use common::{event, Harness, StubMode};
use proptest::prelude::*;

use vigil_core::config::{MemdumpConfig, SecurityConfig};
use vigil_core::egress::wire::{PolicyEventMsg, PolicyEventsMsg, RuleDetailMsg};
use vigil_core::egress::MessageType;
use vigil_core::event::EventType;
use vigil_core::policy::policy::PolicyDescriptor;
use vigil_core::policy::ports::RuleMatch;
use prost::Message;

const SEC: u64 = 1_000_000_000;

fn arb_event_type() -> impl Strategy<Value = EventType> {
    prop::sample::select(EventType::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The short-circuit guarantees at most one emitted policy event
    /// per input event, whatever the policy set looks like.
    #[test]
    fn at_most_one_policy_event_per_event(
        types in prop::collection::vec(arb_event_type(), 1..40),
        policy_count in 1usize..4,
    ) {
        let security = SecurityConfig {
            throttle_rate: 1000.0,
            throttle_max_burst: 1_000_000,
            ..SecurityConfig::default()
        };
        let memdump = MemdumpConfig {
            bufsize: 3 * 1024 * 1024,
            ..MemdumpConfig::default()
        };
        let h = Harness::new(&security, &memdump, StubMode::CompleteOk);

        // Every policy covers every event type and always matches.
        let descriptors: Vec<PolicyDescriptor> = (0..policy_count)
            .map(|i| {
                let name = format!("p{i}");
                h.rules.on(
                    &name,
                    &EventType::ALL,
                    Some(RuleMatch {
                        rule_name: format!("r{i}"),
                        format_template: "hit".to_string(),
                    }),
                );
                PolicyDescriptor {
                    id: u32::try_from(i).unwrap() + 1,
                    name,
                    ..PolicyDescriptor::default()
                }
            })
            .collect();
        h.store.load(&descriptors);

        let mut matches = 0u64;
        for (i, t) in types.iter().enumerate() {
            if h.feed(&event((i as u64 + 1) * SEC, *t, None)) {
                matches += 1;
            }
        }
        h.engine.check_outstanding_actions();
        h.engine.flush(u64::try_from(types.len()).unwrap() * SEC + SEC);

        // Exactly one match per event (policies always fire), and the
        // emitted total never exceeds the number of events.
        prop_assert_eq!(matches, types.len() as u64);
        let emitted: usize = h
            .sink
            .decode_all::<PolicyEventsMsg>(MessageType::PolicyEvents)
            .iter()
            .map(|b| b.events.len())
            .sum();
        prop_assert_eq!(emitted, types.len());

        // And every emitted event names the first (winning) policy.
        for batch in h.sink.decode_all::<PolicyEventsMsg>(MessageType::PolicyEvents) {
            for emitted in batch.events {
                prop_assert_eq!(emitted.policy_id, 1);
            }
        }
    }

    /// The ring never holds more than three segments, whatever mix of
    /// appends, rotations, and captures runs against it.
    #[test]
    fn ring_never_exceeds_three_segments(
        ops in prop::collection::vec(0u8..3, 1..60),
    ) {
        let memdump = MemdumpConfig {
            bufsize: 12 * 1024,
            autodisable: false,
            ..MemdumpConfig::default()
        };
        let h = Harness::new(&SecurityConfig::default(), &memdump, StubMode::CompleteOk);

        let mut ts = 0u64;
        let mut tokens = Vec::new();
        for op in ops {
            ts += 1_000_000;
            match op {
                0 => h.dumper.append(&event(ts, EventType::Write, None)),
                1 => h.dumper.rotate(ts),
                _ => {
                    if let Ok(token) = h.dumper.start_capture(vigil_core::ring::CaptureSpec {
                        label: "prop".to_string(),
                        start_ts_ns: 0,
                        end_ts_ns: ts + SEC,
                        future_ns: 0,
                        filter: None,
                    }) {
                        tokens.push(token);
                    }
                },
            }
            prop_assert!(h.dumper.segment_count() <= 3);
        }

        // Jobs wind down and the ring settles back to two segments.
        for token in tokens {
            let _ = h.dumper.stop_capture(token);
        }
        let settled = common::wait_for(Duration::from_secs(5), || h.dumper.segment_count() <= 2);
        prop_assert!(settled);
    }

    /// Encoding then decoding a policy event preserves its structure.
    #[test]
    fn policy_event_wire_round_trip(
        ts in any::<u64>(),
        policy_id in any::<u32>(),
        container in "[a-f0-9]{0,12}",
        rule in "[a-z_]{1,24}",
        output in ".{0,64}",
        dropped in any::<u64>(),
    ) {
        let msg = PolicyEventMsg {
            timestamp_ns: ts,
            policy_id,
            container_id: container,
            rule_detail: Some(RuleDetailMsg { rule, output }),
            action_results: Vec::new(),
            events_dropped: dropped,
        };
        let decoded = PolicyEventMsg::decode(bytes::Bytes::from(msg.encode_to_vec())).unwrap();
        prop_assert_eq!(decoded, msg);
    }
}
