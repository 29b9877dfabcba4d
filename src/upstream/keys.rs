//! API key rotation
//!
//! Each provider carries an ordered key list. A key is active, cooling
//! down after a rate limit, or disabled after consecutive errors. The
//! critical section covers exactly "pick next available key + mark
//! just-used".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

/// Consecutive non-429 failures before a key is disabled.
const DISABLE_THRESHOLD: u32 = 3;

/// Rotation strategy across a provider's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// Strict rotation through available keys
    #[default]
    RoundRobin,
    /// Prefer the available key with the fewest recent errors
    HealthBased,
}

/// Lifecycle state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyStatus {
    Active,
    /// Cooling down after an upstream 429, until the given instant
    RateLimited(Instant),
    /// Disabled after consecutive errors; manual reset restores it
    Disabled,
}

#[derive(Debug)]
struct KeyState {
    key: String,
    status: KeyStatus,
    consecutive_errors: u32,
}

impl KeyState {
    /// Availability check; expired rate-limit cooldowns heal lazily.
    fn available(&mut self, now: Instant) -> bool {
        match self.status {
            KeyStatus::Active => true,
            KeyStatus::RateLimited(until) => {
                if now >= until {
                    self.status = KeyStatus::Active;
                    true
                } else {
                    false
                }
            }
            KeyStatus::Disabled => false,
        }
    }
}

/// Observability snapshot of one key's state.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    /// Position in the ordered list
    pub index: usize,
    /// "active" | "rate-limited" | "disabled"
    pub status: &'static str,
    /// Current consecutive error count
    pub consecutive_errors: u32,
}

/// Rotating key ring for one provider.
pub struct KeyRing {
    provider: String,
    keys: Mutex<Vec<KeyState>>,
    cursor: AtomicUsize,
    strategy: RotationStrategy,
    rate_limit_cooldown: Duration,
}

impl KeyRing {
    /// Build a ring from the provider's ordered key list.
    #[must_use]
    pub fn new(
        provider: &str,
        keys: Vec<String>,
        strategy: RotationStrategy,
        rate_limit_cooldown: Duration,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            keys: Mutex::new(
                keys.into_iter()
                    .map(|key| KeyState {
                        key,
                        status: KeyStatus::Active,
                        consecutive_errors: 0,
                    })
                    .collect(),
            ),
            cursor: AtomicUsize::new(0),
            strategy,
            rate_limit_cooldown,
        }
    }

    /// Pick the next available key.
    ///
    /// # Errors
    ///
    /// `NoHealthyKey` (rate-limit kind, so the switching controller treats
    /// it as recoverable) when every key is rate-limited or disabled.
    pub fn acquire(&self) -> Result<(usize, String)> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let len = keys.len();
        if len == 0 {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!("provider {} has no API keys", self.provider),
            ));
        }

        match self.strategy {
            RotationStrategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
                for offset in 0..len {
                    let idx = (start + offset) % len;
                    if keys[idx].available(now) {
                        return Ok((idx, keys[idx].key.clone()));
                    }
                }
            }
            RotationStrategy::HealthBased => {
                let mut best: Option<usize> = None;
                for idx in 0..len {
                    if keys[idx].available(now) {
                        let better = best
                            .is_none_or(|b| keys[idx].consecutive_errors < keys[b].consecutive_errors);
                        if better {
                            best = Some(idx);
                        }
                    }
                }
                if let Some(idx) = best {
                    return Ok((idx, keys[idx].key.clone()));
                }
            }
        }

        Err(Error::new(
            ErrorKind::RateLimit,
            format!("NoHealthyKey: all API keys for provider {} are unavailable", self.provider),
        ))
    }

    /// Record a successful call on a key.
    pub fn report_success(&self, index: usize) {
        let mut keys = self.keys.lock();
        if let Some(key) = keys.get_mut(index) {
            key.consecutive_errors = 0;
        }
    }

    /// Record a failed call on a key. 429 puts the key into rate-limit
    /// cooldown; other failures count toward the disable threshold.
    pub fn report_failure(&self, index: usize, upstream_status: Option<u16>) {
        let mut keys = self.keys.lock();
        let Some(key) = keys.get_mut(index) else {
            return;
        };
        if upstream_status == Some(429) {
            key.status = KeyStatus::RateLimited(Instant::now() + self.rate_limit_cooldown);
            tracing::warn!(
                provider = %self.provider,
                key_index = index,
                cooldown = ?self.rate_limit_cooldown,
                "API key rate-limited"
            );
            return;
        }
        key.consecutive_errors += 1;
        if key.consecutive_errors >= DISABLE_THRESHOLD && key.status == KeyStatus::Active {
            key.status = KeyStatus::Disabled;
            tracing::warn!(
                provider = %self.provider,
                key_index = index,
                errors = key.consecutive_errors,
                "API key disabled after consecutive errors"
            );
        }
    }

    /// Manual reset: restore every key to active.
    pub fn reset(&self) {
        let mut keys = self.keys.lock();
        for key in keys.iter_mut() {
            key.status = KeyStatus::Active;
            key.consecutive_errors = 0;
        }
        tracing::info!(provider = %self.provider, "API keys reset");
    }

    /// Snapshot for the status surface. Key material is never exposed.
    #[must_use]
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let now = Instant::now();
        let keys = self.keys.lock();
        keys.iter()
            .enumerate()
            .map(|(index, k)| KeySnapshot {
                index,
                status: match k.status {
                    KeyStatus::Active => "active",
                    KeyStatus::RateLimited(until) if now >= until => "active",
                    KeyStatus::RateLimited(_) => "rate-limited",
                    KeyStatus::Disabled => "disabled",
                },
                consecutive_errors: k.consecutive_errors,
            })
            .collect()
    }
}
