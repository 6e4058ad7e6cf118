use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use crate::telemetry::metrics::RATE_LIMIT_REJECTIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    pub daily_limit: u32,
    pub cooldown_secs: u64,
}

/// Per-key usage for one UTC day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub date_key: NaiveDate,
    pub count: u32,
    pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    Quota,
    Cooldown,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::Quota => "quota",
            RateLimitReason::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    pub wait_seconds: u64,
    pub remaining_daily: u32,
    pub reason: Option<RateLimitReason>,
}

fn seconds_until_utc_midnight(now: DateTime<Utc>) -> u64 {
    let Some(midnight) = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return 0;
    };
    let millis = (midnight.and_utc() - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

/// Decides one request against a bucket. Returns the bucket to store when
/// the request is admitted; a rejection leaves the bucket untouched.
///
/// A bucket from an earlier day counts as empty. An exhausted quota wins
/// over an active cooldown, so the wait reported is the time to the next
/// UTC day.
pub fn evaluate(
    bucket: Option<&Bucket>,
    rule: &RateRule,
    now: DateTime<Utc>,
) -> (RateDecision, Option<Bucket>) {
    let today = now.date_naive();
    let (count, last_request_at) = match bucket {
        Some(b) if b.date_key == today => (b.count, b.last_request_at),
        _ => (0, None),
    };

    if count >= rule.daily_limit {
        let decision = RateDecision {
            allowed: false,
            wait_seconds: seconds_until_utc_midnight(now),
            remaining_daily: 0,
            reason: Some(RateLimitReason::Quota),
        };
        return (decision, None);
    }

    let cooldown_ms = i64::try_from(rule.cooldown_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    if let Some(last) = last_request_at {
        let elapsed_ms = (now - last).num_milliseconds();
        if elapsed_ms < cooldown_ms {
            let decision = RateDecision {
                allowed: false,
                wait_seconds: ((cooldown_ms - elapsed_ms.max(0)) as u64).div_ceil(1000),
                remaining_daily: rule.daily_limit - count,
                reason: Some(RateLimitReason::Cooldown),
            };
            return (decision, None);
        }
    }

    let next = Bucket {
        date_key: today,
        count: count + 1,
        last_request_at: Some(now),
    };
    let decision = RateDecision {
        allowed: true,
        wait_seconds: 0,
        remaining_daily: rule.daily_limit - next.count,
        reason: None,
    };
    (decision, Some(next))
}

/// Bucket storage. `update` runs `f` atomically per key and stores the
/// bucket it returns, if any.
pub trait BucketStore: Send + Sync {
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<&Bucket>) -> Option<Bucket>);
}

/// Process-local buckets. Limits reset on restart and are not shared
/// between instances.
#[derive(Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, Bucket>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops buckets from days before `today`.
    pub fn purge_stale(&self, today: NaiveDate) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.date_key >= today);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl BucketStore for MemoryBucketStore {
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<&Bucket>) -> Option<Bucket>) {
        match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if let Some(next) = f(Some(entry.get())) {
                    entry.insert(next);
                }
            }
            Entry::Vacant(entry) => {
                if let Some(next) = f(None) {
                    entry.insert(next);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self { store }
    }

    pub fn check(&self, key: &str, rule: &RateRule) -> RateDecision {
        self.check_at(key, rule, Utc::now())
    }

    pub fn check_at(&self, key: &str, rule: &RateRule, now: DateTime<Utc>) -> RateDecision {
        let mut decision = None;
        self.store.update(key, &mut |bucket: Option<&Bucket>| {
            let (outcome, next) = evaluate(bucket, rule, now);
            decision = Some(outcome);
            next
        });

        // A store that never ran the closure admits nothing.
        let decision = decision.unwrap_or(RateDecision {
            allowed: false,
            wait_seconds: rule.cooldown_secs,
            remaining_daily: 0,
            reason: Some(RateLimitReason::Cooldown),
        });

        if let Some(reason) = decision.reason {
            RATE_LIMIT_REJECTIONS.add(1, &[KeyValue::new("rate_limit.reason", reason.as_str())]);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const RULE: RateRule = RateRule {
        daily_limit: 3,
        cooldown_secs: 10,
    };

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, h, m, s).unwrap()
    }

    fn limiter() -> (RateLimiter, Arc<MemoryBucketStore>) {
        let store = Arc::new(MemoryBucketStore::new());
        (RateLimiter::new(store.clone()), store)
    }

    #[test]
    fn test_first_call_in_each_cooldown_window_is_admitted() {
        let (limiter, _) = limiter();
        let rule = RateRule {
            daily_limit: 100,
            cooldown_secs: 10,
        };
        let start = at(9, 0, 0);

        let admitted: Vec<i64> = (0..30)
            .map(|i| i * 4)
            .filter(|offset| limiter.check_at("guest:1.2.3.4", &rule, start + Duration::seconds(*offset)).allowed)
            .collect();

        assert_eq!(admitted, vec![0, 12, 24, 36, 48, 60, 72, 84, 96, 108]);
    }

    #[test]
    fn test_cooldown_wait_rounds_up() {
        let (limiter, _) = limiter();
        let start = at(9, 0, 0);
        assert!(limiter.check_at("k", &RULE, start).allowed);

        let cases = vec![
            (Duration::milliseconds(1), 10),
            (Duration::milliseconds(2_500), 8),
            (Duration::seconds(9), 1),
            (Duration::milliseconds(9_999), 1),
        ];
        for (elapsed, expected) in cases {
            let decision = limiter.check_at("k", &RULE, start + elapsed);
            assert!(!decision.allowed);
            assert_eq!(decision.reason, Some(RateLimitReason::Cooldown));
            assert_eq!(decision.wait_seconds, expected, "elapsed {elapsed}");
            assert_eq!(decision.remaining_daily, 2);
        }
        assert!(limiter.check_at("k", &RULE, start + Duration::seconds(10)).allowed);
    }

    #[test]
    fn test_huge_cooldown_still_blocks() {
        let (limiter, _) = limiter();
        let start = at(9, 0, 0);
        let cases = vec![u64::MAX / 1000 + 1, u64::MAX, i64::MAX as u64];

        for cooldown_secs in cases {
            let rule = RateRule {
                daily_limit: 100,
                cooldown_secs,
            };
            let key = format!("guest:{cooldown_secs}");
            assert!(limiter.check_at(&key, &rule, start).allowed);

            let decision = limiter.check_at(&key, &rule, start + Duration::hours(1));
            assert!(!decision.allowed, "cooldown {cooldown_secs}");
            assert_eq!(decision.reason, Some(RateLimitReason::Cooldown));
            assert!(decision.wait_seconds > 0);
        }
    }

    #[test]
    fn test_quota_wins_over_cooldown() {
        let (limiter, _) = limiter();
        for i in 0..3 {
            assert!(limiter.check_at("k", &RULE, at(23, 0, i * 20)).allowed);
        }

        let decision = limiter.check_at("k", &RULE, at(23, 0, 41));
        assert_eq!(
            decision,
            RateDecision {
                allowed: false,
                wait_seconds: 3_559,
                remaining_daily: 0,
                reason: Some(RateLimitReason::Quota),
            }
        );
    }

    #[test]
    fn test_new_utc_day_resets_count_and_cooldown() {
        let (limiter, _) = limiter();
        for i in 0..3 {
            assert!(limiter.check_at("k", &RULE, at(23, 59, i * 15)).allowed);
        }
        assert!(!limiter.check_at("k", &RULE, at(23, 59, 50)).allowed);

        let next_day = at(23, 59, 50) + Duration::seconds(12);
        let decision = limiter.check_at("k", &RULE, next_day);
        assert!(decision.allowed);
        assert_eq!(decision.remaining_daily, 2);
    }

    #[test]
    fn test_rejection_does_not_touch_bucket() {
        let bucket = Bucket {
            date_key: at(9, 0, 0).date_naive(),
            count: 1,
            last_request_at: Some(at(9, 0, 0)),
        };
        let (decision, next) = evaluate(Some(&bucket), &RULE, at(9, 0, 5));
        assert!(!decision.allowed);
        assert_eq!(next, None);

        let (decision, next) = evaluate(Some(&bucket), &RULE, at(9, 0, 10));
        assert!(decision.allowed);
        assert_eq!(next.map(|b| b.count), Some(2));
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, store) = limiter();
        let now = at(9, 0, 0);
        assert!(limiter.check_at("member:a", &RULE, now).allowed);
        assert!(limiter.check_at("member:b", &RULE, now).allowed);
        assert!(!limiter.check_at("member:a", &RULE, now).allowed);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_purge_stale() {
        let (limiter, store) = limiter();
        limiter.check_at("old", &RULE, at(9, 0, 0) - Duration::days(1));
        limiter.check_at("new", &RULE, at(9, 0, 0));

        assert_eq!(store.purge_stale(at(9, 0, 0).date_naive()), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_seconds_until_utc_midnight() {
        let cases = vec![
            (at(0, 0, 0), 86_400),
            (at(23, 59, 59), 1),
            (at(23, 59, 59) + Duration::milliseconds(500), 1),
            (at(12, 0, 0), 43_200),
        ];
        for (now, expected) in cases {
            assert_eq!(seconds_until_utc_midnight(now), expected, "now {now}");
        }
    }
}
