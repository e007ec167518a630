//! The throttle ledger.
//!
//! One token bucket per policy decides whether a `PolicyEvent` is
//! *accepted* (forwarded) or *suppressed* (only counted). Suppressed
//! counts accumulate per policy and are flushed into a summary at each
//! report interval.
//!
//! Buckets start full, refill lazily on each offer at `rate` tokens per
//! second, and never hold more than `max_burst` tokens.

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-policy suppression count drained by [`ThrottleLedger::flush`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottledEntry {
    /// Policy whose events were suppressed.
    pub policy_id: u32,

    /// Events suppressed since the last flush.
    pub count: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_ns: u64,
    suppressed: u64,
}

/// Per-policy token-bucket bank.
#[derive(Debug)]
pub struct ThrottleLedger {
    rate_per_sec: f64,
    max_burst: f64,
    buckets: Mutex<HashMap<u32, Bucket>>,
}

impl ThrottleLedger {
    /// Creates a ledger refilling at `rate_per_sec`, holding at most
    /// `max_burst` tokens per policy.
    #[must_use]
    pub fn new(rate_per_sec: f64, max_burst: u64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let max_burst = max_burst as f64;
        Self {
            rate_per_sec: rate_per_sec.max(0.0),
            max_burst,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Offers one event for `policy_id` at event time `ts_ns`.
    ///
    /// Returns `true` (accepted) while the policy's bucket has tokens;
    /// otherwise counts the suppression and returns `false`.
    pub fn accept(&self, policy_id: u32, ts_ns: u64) -> bool {
        let mut buckets = self.buckets.lock().expect("throttle poisoned");
        let bucket = buckets.entry(policy_id).or_insert(Bucket {
            tokens: self.max_burst,
            last_ns: ts_ns,
            suppressed: 0,
        });

        let elapsed_ns = ts_ns.saturating_sub(bucket.last_ns);
        bucket.last_ns = ts_ns;
        #[allow(clippy::cast_precision_loss)]
        let refill = elapsed_ns as f64 / 1e9 * self.rate_per_sec;
        bucket.tokens = (bucket.tokens + refill).min(self.max_burst);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            bucket.suppressed += 1;
            false
        }
    }

    /// Drains the suppression counters. Returns the per-policy entries
    /// and the total, both zeroed afterwards.
    pub fn flush(&self) -> (Vec<ThrottledEntry>, u64) {
        let mut buckets = self.buckets.lock().expect("throttle poisoned");
        let mut entries = Vec::new();
        let mut total = 0;
        for (policy_id, bucket) in buckets.iter_mut() {
            if bucket.suppressed > 0 {
                entries.push(ThrottledEntry {
                    policy_id: *policy_id,
                    count: bucket.suppressed,
                });
                total += bucket.suppressed;
                bucket.suppressed = 0;
            }
        }
        entries.sort_by_key(|e| e.policy_id);
        (entries, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_suppression() {
        let ledger = ThrottleLedger::new(0.0, 5);
        let accepted = (0..100).filter(|i| ledger.accept(1, *i)).count();
        assert_eq!(accepted, 5);

        let (entries, total) = ledger.flush();
        assert_eq!(total, 95);
        assert_eq!(entries, vec![ThrottledEntry { policy_id: 1, count: 95 }]);

        // Flushing clears the counters.
        let (entries, total) = ledger.flush();
        assert!(entries.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_refill_restores_tokens() {
        let ledger = ThrottleLedger::new(2.0, 1);
        assert!(ledger.accept(1, 0));
        assert!(!ledger.accept(1, 1_000_000));
        // Half a second at 2 tokens/sec refills a whole token.
        assert!(ledger.accept(1, 500_000_000));
    }

    #[test]
    fn test_policies_do_not_share_buckets() {
        let ledger = ThrottleLedger::new(0.0, 1);
        assert!(ledger.accept(1, 0));
        assert!(ledger.accept(2, 0));
        assert!(!ledger.accept(1, 0));
    }
}
