use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::domain::UserId;

// ============== Authorization ==============

pub fn is_authorized(user_id: Option<UserId>, allowed_users: &[i64]) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    allowed_users.contains(&user_id.0)
}

// ============== Rate Limiter (Token Bucket) ==============

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Per-user token bucket guarding validator runs.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
}

impl RateLimiter {
    pub fn new(enabled: bool, requests: u32, window: Duration) -> Self {
        let capacity = f64::from(requests);
        let window_secs = window.as_secs_f64().max(1e-9);

        Self {
            enabled,
            capacity,
            refill_per_sec: capacity / window_secs,
            buckets: HashMap::new(),
        }
    }

    pub fn check(&mut self, user_id: UserId) -> RateDecision {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: UserId, now: Instant) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allowed;
        }

        let capacity = self.capacity;
        let bucket = self.buckets.entry(user_id).or_insert_with(|| Bucket {
            tokens: capacity,
            last_update: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(capacity);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return RateDecision::Allowed;
        }

        if self.refill_per_sec <= 0.0 {
            return RateDecision::Limited {
                retry_after: Duration::MAX,
            };
        }
        let secs = (1.0 - bucket.tokens) / self.refill_per_sec;
        RateDecision::Limited {
            retry_after: Duration::from_secs_f64(secs.max(0.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_requires_listed_user() {
        assert!(is_authorized(Some(UserId(7)), &[7, 8]));
        assert!(!is_authorized(Some(UserId(9)), &[7, 8]));
        assert!(!is_authorized(None, &[7]));
        assert!(!is_authorized(Some(UserId(7)), &[]));
    }

    #[test]
    fn rate_limiter_refills_over_time() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(true, 2, Duration::from_secs(10));
        let u = UserId(1);

        assert!(rl.check_at(u, start).is_allowed());
        assert!(rl.check_at(u, start).is_allowed());
        match rl.check_at(u, start) {
            RateDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_secs(5));
            }
            RateDecision::Allowed => panic!("expected limit"),
        }

        // 2 tokens / 10s: one token back after 5 seconds.
        assert!(rl.check_at(u, start + Duration::from_secs(5)).is_allowed());
    }

    #[test]
    fn buckets_are_per_user() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(true, 1, Duration::from_secs(60));
        assert!(rl.check_at(UserId(1), start).is_allowed());
        assert!(!rl.check_at(UserId(1), start).is_allowed());
        assert!(rl.check_at(UserId(2), start).is_allowed());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let start = Instant::now();
        let mut rl = RateLimiter::new(false, 0, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(rl.check_at(UserId(1), start).is_allowed());
        }
    }
}
