// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Requeue delay policies for the change queue

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use super::notice::ObjectKey;

/// Base delay for per-item exponential backoff (doubles each failure)
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound for per-item exponential backoff
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Overall requeue rate shared by all keys
const DEFAULT_QPS: u32 = 10;
const DEFAULT_BURST: u32 = 100;

/// Decides how long a failed item waits before it is queued again
pub trait RateLimiter: Send {
    /// Delay for the next requeue of `key`; records the attempt
    fn when(&mut self, key: &ObjectKey) -> Duration;

    /// Clear the failure history for `key`
    fn forget(&mut self, key: &ObjectKey);

    /// Number of requeues recorded for `key` since the last forget
    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

/// `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: HashMap<ObjectKey, u32>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }
}

impl Default for ItemExponentialFailureRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&mut self, key: &ObjectKey) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        // f64 keeps large exponents from overflowing before the cap applies
        let secs = self.base.as_secs_f64() * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    fn forget(&mut self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

/// Token bucket shared across all keys
///
/// Each `when` takes one cell from the bucket; when it is empty the returned
/// delay is the time until the next cell becomes available.
pub struct BucketRateLimiter<C: Clock = DefaultClock> {
    limiter: GovernorRateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>,
    clock: C,
}

impl BucketRateLimiter {
    /// Zero `qps` or `burst` is raised to one
    pub fn new(qps: u32, burst: u32) -> Self {
        Self::with_clock(qps, burst, DefaultClock::default())
    }
}

impl<C: Clock> BucketRateLimiter<C> {
    pub fn with_clock(qps: u32, burst: u32, clock: C) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: GovernorRateLimiter::direct_with_clock(quota, &clock),
            clock,
        }
    }
}

impl Default for BucketRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_QPS, DEFAULT_BURST)
    }
}

impl<C> RateLimiter for BucketRateLimiter<C>
where
    C: Clock + Send,
{
    fn when(&mut self, _key: &ObjectKey) -> Duration {
        match self.limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => not_until.wait_time_from(self.clock.now()),
        }
    }

    fn forget(&mut self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 {
        0
    }
}

/// Longest delay among all member limiters
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&mut self, key: &ObjectKey) -> Duration {
        self.limiters
            .iter_mut()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, key: &ObjectKey) {
        for limiter in &mut self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with an overall token bucket
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::default()),
        Box::new(BucketRateLimiter::<DefaultClock>::default()),
    ])
}
