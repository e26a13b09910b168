//! Throttle governor — token-bucket rate limiting at three scopes
//! (global system, per-campaign, per-recipient-domain) plus a
//! per-campaign concurrency semaphore.
//!
//! All buckets live under one mutex so a grant is all-or-nothing: a send
//! consumes one token from every scope, or none at all. Refill is lazy,
//! computed from elapsed time on each acquisition attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use evermail_core::config::CampaignSettings;

/// Which scope denied a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleScope {
    Global,
    Campaign,
    Domain,
}

impl std::fmt::Display for ThrottleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThrottleScope::Global => write!(f, "global"),
            ThrottleScope::Campaign => write!(f, "campaign"),
            ThrottleScope::Domain => write!(f, "domain"),
        }
    }
}

/// Result of a throttle check. A denial is not an error — the job is
/// requeued for roughly `retry_after` later.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleDecision {
    Granted,
    Denied {
        scope: ThrottleScope,
        retry_after: Duration,
    },
}

/// Continuous-refill token bucket: capacity = per-minute rate, refill
/// rate/60 tokens per second, never exceeding capacity.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate_per_sec: capacity / 60.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }

    /// Estimated wait until one token is available again.
    fn retry_after(&self) -> Duration {
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.rate_per_sec)
    }

    /// Caps can change between ticks (admin edit); keep the earned
    /// tokens but clamp to the new capacity.
    fn reconfigure(&mut self, per_minute: u32) {
        let capacity = f64::from(per_minute.max(1));
        if (capacity - self.capacity).abs() > f64::EPSILON {
            self.capacity = capacity;
            self.rate_per_sec = capacity / 60.0;
            self.tokens = self.tokens.min(capacity);
        }
    }
}

struct GovernorState {
    global: TokenBucket,
    campaigns: HashMap<String, TokenBucket>,
    domains: HashMap<String, TokenBucket>,
}

/// Shared across all dispatch workers.
pub struct ThrottleGovernor {
    state: Mutex<GovernorState>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ThrottleGovernor {
    pub fn new(global_per_minute: u32) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(GovernorState {
                global: TokenBucket::new(global_per_minute, now),
                campaigns: HashMap::new(),
                domains: HashMap::new(),
            }),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Check global → campaign → domain, in that order, and consume one
    /// token from each only if all three grant.
    pub fn try_acquire(
        &self,
        campaign_id: &str,
        settings: &CampaignSettings,
        domain: &str,
    ) -> ThrottleDecision {
        self.try_acquire_at(campaign_id, settings, domain, Instant::now())
    }

    pub(crate) fn try_acquire_at(
        &self,
        campaign_id: &str,
        settings: &CampaignSettings,
        domain: &str,
        now: Instant,
    ) -> ThrottleDecision {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        state.global.refill(now);
        if !state.global.has_token() {
            return ThrottleDecision::Denied {
                scope: ThrottleScope::Global,
                retry_after: state.global.retry_after(),
            };
        }

        let campaign = state
            .campaigns
            .entry(campaign_id.to_string())
            .or_insert_with(|| TokenBucket::new(settings.throttle_per_minute, now));
        campaign.reconfigure(settings.throttle_per_minute);
        campaign.refill(now);
        if !campaign.has_token() {
            return ThrottleDecision::Denied {
                scope: ThrottleScope::Campaign,
                retry_after: campaign.retry_after(),
            };
        }

        let cap = settings.domain_cap(domain);
        let bucket = state
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| TokenBucket::new(cap, now));
        bucket.reconfigure(cap);
        bucket.refill(now);
        if !bucket.has_token() {
            return ThrottleDecision::Denied {
                scope: ThrottleScope::Domain,
                retry_after: bucket.retry_after(),
            };
        }

        // All scopes grant — consume from each.
        state.global.take();
        if let Some(bucket) = state.campaigns.get_mut(campaign_id) {
            bucket.take();
        }
        if let Some(bucket) = state.domains.get_mut(domain) {
            bucket.take();
        }
        ThrottleDecision::Granted
    }

    /// Concurrency cap for a campaign, independent of the rate buckets.
    /// The semaphore is sized on first use from `max_concurrent`.
    pub fn concurrency(&self, campaign_id: &str, settings: &CampaignSettings) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        semaphores
            .entry(campaign_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(settings.max_concurrent.max(1))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(per_minute: u32, domain_cap: u32) -> CampaignSettings {
        CampaignSettings {
            throttle_per_minute: per_minute,
            default_domain_cap: domain_cap,
            ..CampaignSettings::default()
        }
    }

    #[test]
    fn test_grants_up_to_capacity_then_denies() {
        let governor = ThrottleGovernor::new(600);
        let s = settings(2, 100);
        let now = Instant::now();

        assert_eq!(
            governor.try_acquire_at("camp", &s, "gmail.com", now),
            ThrottleDecision::Granted
        );
        assert_eq!(
            governor.try_acquire_at("camp", &s, "gmail.com", now),
            ThrottleDecision::Granted
        );
        match governor.try_acquire_at("camp", &s, "gmail.com", now) {
            ThrottleDecision::Denied { scope, retry_after } => {
                assert_eq!(scope, ThrottleScope::Campaign);
                assert!(retry_after > Duration::ZERO);
            }
            ThrottleDecision::Granted => panic!("third acquire should deny"),
        }
    }

    #[test]
    fn test_lazy_refill_restores_tokens() {
        let governor = ThrottleGovernor::new(600);
        let s = settings(2, 100);
        let now = Instant::now();

        assert_eq!(
            governor.try_acquire_at("camp", &s, "gmail.com", now),
            ThrottleDecision::Granted
        );
        assert_eq!(
            governor.try_acquire_at("camp", &s, "gmail.com", now),
            ThrottleDecision::Granted
        );
        // 2/min refills one token every 30 seconds.
        let later = now + Duration::from_secs(31);
        assert_eq!(
            governor.try_acquire_at("camp", &s, "gmail.com", later),
            ThrottleDecision::Granted
        );
    }

    #[test]
    fn test_denial_consumes_nothing_from_other_scopes() {
        let governor = ThrottleGovernor::new(2);
        let tight = settings(1, 100);
        let now = Instant::now();

        assert_eq!(
            governor.try_acquire_at("camp-a", &tight, "gmail.com", now),
            ThrottleDecision::Granted
        );
        // Campaign A is out of tokens — global must be untouched by this
        // denial.
        assert!(matches!(
            governor.try_acquire_at("camp-a", &tight, "gmail.com", now),
            ThrottleDecision::Denied {
                scope: ThrottleScope::Campaign,
                ..
            }
        ));
        // Campaign B still gets the remaining global token.
        assert_eq!(
            governor.try_acquire_at("camp-b", &tight, "gmail.com", now),
            ThrottleDecision::Granted
        );
        // Now the global bucket really is empty.
        assert!(matches!(
            governor.try_acquire_at("camp-c", &tight, "gmail.com", now),
            ThrottleDecision::Denied {
                scope: ThrottleScope::Global,
                ..
            }
        ));
    }

    #[test]
    fn test_per_domain_cap_with_fallback() {
        let governor = ThrottleGovernor::new(600);
        let mut s = settings(100, 1);
        s.per_domain.insert("gmail.com".into(), 50);
        let now = Instant::now();

        // Listed domain uses its own cap.
        for _ in 0..5 {
            assert_eq!(
                governor.try_acquire_at("camp", &s, "gmail.com", now),
                ThrottleDecision::Granted
            );
        }
        // Unlisted domain falls back to the default cap of 1.
        assert_eq!(
            governor.try_acquire_at("camp", &s, "icloud.com", now),
            ThrottleDecision::Granted
        );
        assert!(matches!(
            governor.try_acquire_at("camp", &s, "icloud.com", now),
            ThrottleDecision::Denied {
                scope: ThrottleScope::Domain,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrency_semaphore_bounds_in_flight() {
        let governor = ThrottleGovernor::new(600);
        let s = CampaignSettings {
            max_concurrent: 2,
            ..CampaignSettings::default()
        };

        let sem = governor.concurrency("camp", &s);
        let first = sem.clone().try_acquire_owned().unwrap();
        let _second = sem.clone().try_acquire_owned().unwrap();
        assert!(sem.clone().try_acquire_owned().is_err());

        drop(first);
        assert!(sem.try_acquire_owned().is_ok());
    }
}
