use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with multiplicative jitter, shared by task retries and
/// broker reconnection.
///
/// `delay(attempt) = min(base * 2^attempt, cap) * rand(0.5, 1.5)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::moderate()
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            cap_ms: cap.as_millis() as u64,
            jitter: true,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            base_ms: 50,
            cap_ms: 5_000,
            jitter: true,
        }
    }

    pub fn moderate() -> Self {
        Self {
            base_ms: 100,
            cap_ms: 10_000,
            jitter: true,
        }
    }

    pub fn conservative() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 5_000,
            jitter: true,
        }
    }

    /// Zero delay between attempts.
    pub fn none() -> Self {
        Self {
            base_ms: 0,
            cap_ms: 0,
            jitter: false,
        }
    }

    /// Look up a preset by name (`aggressive`, `moderate`, `conservative`, `none`).
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "aggressive" => Some(Self::aggressive()),
            "moderate" => Some(Self::moderate()),
            "conservative" => Some(Self::conservative()),
            "none" => Some(Self::none()),
            _ => None,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// The capped exponential delay before jitter is applied.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
        let raw = self.base_ms.saturating_mul(factor);
        Duration::from_millis(raw.min(self.cap_ms))
    }

    /// The delay to wait before `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        ceiling.mul_f64(factor)
    }
}
