//! Per-session request rate limiting.
//!
//! One token bucket per session. Buckets are independent: each has its own
//! mutex, and the outer map lock is never held across a bucket operation, so
//! sessions cannot block each other. State is in-memory only; a host restart
//! refills everyone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::types::{Error, GroupId, RateLimitSettings, Result, SessionId};

/// Outcome of a consumption attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// Denied; `retry_after` is the time in seconds until the next token.
    Limited { retry_after: f64 },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by session id, with per-group
/// configuration overrides.
#[derive(Debug)]
pub struct RateLimiter {
    defaults: RateLimitSettings,
    overrides: RwLock<HashMap<String, RateLimitSettings>>,
    buckets: Mutex<HashMap<SessionId, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    /// Create a limiter with validated defaults.
    pub fn new(defaults: RateLimitSettings) -> Result<Self> {
        validate_settings(&defaults)?;
        Ok(Self {
            defaults,
            overrides: RwLock::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Set or replace a group's settings. Applies to future refills: existing
    /// token counts are preserved and the new capacity caps subsequent
    /// refills.
    pub fn set_group_config(&self, group: &GroupId, settings: RateLimitSettings) -> Result<()> {
        validate_settings(&settings)?;
        self.overrides
            .write()
            .expect("rate-limit overrides poisoned")
            .insert(group.as_str().to_string(), settings);
        Ok(())
    }

    /// Try to consume one token for the session.
    pub fn try_consume(&self, session_id: &SessionId, group: &GroupId) -> RateDecision {
        self.consume_at(session_id, group, Instant::now())
    }

    fn consume_at(&self, session_id: &SessionId, group: &GroupId, now: Instant) -> RateDecision {
        let settings = self.effective_settings(group);
        let capacity = settings.burst_size as f64;
        let refill_per_second = settings.requests_per_minute as f64 / 60.0;

        let bucket = {
            let mut buckets = self.buckets.lock().expect("rate-limit bucket map poisoned");
            buckets
                .entry(session_id.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket {
                        tokens: capacity,
                        last_refill: now,
                    }))
                })
                .clone()
        };

        let mut bucket = bucket.lock().expect("rate-limit bucket poisoned");
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            RateDecision::Limited {
                retry_after: (1.0 - bucket.tokens) / refill_per_second,
            }
        }
    }

    fn effective_settings(&self, group: &GroupId) -> RateLimitSettings {
        self.overrides
            .read()
            .expect("rate-limit overrides poisoned")
            .get(group.as_str())
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Remaining tokens for a session, if it has a bucket. Diagnostics only.
    pub fn tokens_remaining(&self, session_id: &SessionId) -> Option<f64> {
        let buckets = self.buckets.lock().expect("rate-limit bucket map poisoned");
        buckets
            .get(session_id)
            .map(|b| b.lock().expect("rate-limit bucket poisoned").tokens)
    }

    /// Clear one session's bucket.
    pub fn reset_session(&self, session_id: &SessionId) {
        self.buckets
            .lock()
            .expect("rate-limit bucket map poisoned")
            .remove(session_id);
    }

    /// Clear all buckets.
    pub fn cleanup(&self) {
        self.buckets
            .lock()
            .expect("rate-limit bucket map poisoned")
            .clear();
    }
}

fn validate_settings(settings: &RateLimitSettings) -> Result<()> {
    if settings.requests_per_minute == 0 {
        return Err(Error::validation("requests_per_minute must be positive"));
    }
    if settings.burst_size == 0 {
        return Err(Error::validation("burst_size must be positive"));
    }
    Ok(())
}
