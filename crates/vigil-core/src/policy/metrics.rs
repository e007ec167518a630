//! Evaluation counters.
//!
//! A global bank plus one bank per policy; the per-policy banks are
//! logged and reset at each report interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Outcomes counted during policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum EvalCounter {
    /// Candidate policy was disabled.
    PolicyDisabled = 0,
    /// Scope predicates did not match.
    ScopeMiss = 1,
    /// Conditions did not match.
    RuleMiss = 2,
    /// Policy matched and actions were scheduled.
    Matched = 3,
    /// Rule engine failed while processing; treated as a miss.
    EngineError = 4,
}

impl EvalCounter {
    const COUNT: usize = 5;

    const ALL: [Self; Self::COUNT] = [
        Self::PolicyDisabled,
        Self::ScopeMiss,
        Self::RuleMiss,
        Self::Matched,
        Self::EngineError,
    ];

    /// Stable counter name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PolicyDisabled => "policy_disabled",
            Self::ScopeMiss => "scope_miss",
            Self::RuleMiss => "rule_miss",
            Self::Matched => "matched",
            Self::EngineError => "engine_error",
        }
    }
}

/// A fixed bank of evaluation counters.
#[derive(Debug, Default)]
pub struct CounterBank {
    counters: [AtomicU64; EvalCounter::COUNT],
}

impl CounterBank {
    /// Increments one counter.
    pub fn incr(&self, counter: EvalCounter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Reads one counter.
    #[must_use]
    pub fn get(&self, counter: EvalCounter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Returns `true` when every counter is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.counters
            .iter()
            .all(|c| c.load(Ordering::Relaxed) == 0)
    }

    fn render(&self) -> String {
        EvalCounter::ALL
            .iter()
            .map(|c| format!("{}={}", c.name(), self.get(*c)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Global and per-policy counter banks.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Totals across all policies.
    pub global: CounterBank,
    per_policy: Mutex<HashMap<u32, Arc<CounterBank>>>,
}

impl EngineMetrics {
    /// The per-policy bank for `policy_id`, created on first use.
    #[must_use]
    pub fn policy(&self, policy_id: u32) -> Arc<CounterBank> {
        Arc::clone(
            self.per_policy
                .lock()
                .expect("metrics poisoned")
                .entry(policy_id)
                .or_default(),
        )
    }

    /// Increments `counter` both globally and for `policy_id`.
    pub fn incr(&self, policy_id: u32, counter: EvalCounter) {
        self.global.incr(counter);
        self.policy(policy_id).incr(counter);
    }

    /// Logs and resets the per-policy banks.
    pub fn report(&self) {
        let per_policy = self.per_policy.lock().expect("metrics poisoned");
        for (policy_id, bank) in per_policy.iter() {
            if !bank.is_zero() {
                debug!(policy_id, counts = %bank.render(), "policy event counts");
                bank.reset();
            }
        }
    }
}
