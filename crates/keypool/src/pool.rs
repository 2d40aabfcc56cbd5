//! Pool state and least-loaded key selection
//!
//! One record per configured key, guarded by a single exclusive lock. The
//! cooldown sweep, candidate filtering, selection, and usage increment all
//! happen inside one critical section so concurrent acquirers can never pick
//! the same least-loaded key and under-count its load. The unit of work that
//! actually uses a leased key runs entirely outside the lock.

use std::time::Duration;

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::FailureKind;

/// Pool tuning knobs. Defaults mirror the upstream free-tier limits:
/// 60 requests per key per minute, one-minute cooldown after a failure.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Requests allowed per key within one window before soft exhaustion.
    pub max_requests_per_window: u32,
    /// Length of the rate-limit window; also used as the failure cooldown.
    pub window_duration: Duration,
    /// Attempt budget for `generate_with_retry`.
    pub max_attempts: u32,
    /// Sleep before the next attempt when no key is available at all.
    pub no_credential_backoff: Duration,
    /// Sleep before the next attempt after a failed generation call.
    pub failure_backoff: Duration,
    /// Optional hard cap on a single unit-of-work invocation. `None` means
    /// the unit of work is trusted to carry its own timeout.
    pub attempt_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 60,
            window_duration: Duration::from_secs(60),
            max_attempts: 3,
            no_credential_backoff: Duration::from_secs(1),
            failure_backoff: Duration::from_millis(500),
            attempt_timeout: None,
        }
    }
}

/// Per-key usage and cooldown state. Lives for the whole process; only the
/// fields below are ever mutated, never the key itself.
struct KeyRecord {
    key: Secret<String>,
    /// Masked suffix, the only form of the key that may reach logs or status.
    masked: String,
    last_used_at: Option<Instant>,
    request_count: u32,
    available: bool,
    cooldown_until: Option<Instant>,
    window_started_at: Instant,
    last_failure: Option<FailureKind>,
}

/// A key leased for one request attempt.
#[derive(Clone)]
pub struct LeasedKey {
    /// The secret itself, for the upstream call.
    pub key: Secret<String>,
    /// Masked identifier, safe for logs.
    pub id: String,
}

impl std::fmt::Debug for LeasedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedKey").field("id", &self.id).finish()
    }
}

/// Per-key diagnostic entry in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub id: String,
    pub available: bool,
    pub request_count: u32,
    pub cooldown_remaining_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<&'static str>,
}

/// Read-only snapshot of pool state for health/monitoring endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub cooling_down: usize,
    pub keys: Vec<KeyStatus>,
}

impl PoolStatus {
    /// Health mapping: all keys available → healthy, some → degraded,
    /// none → unhealthy.
    pub fn health_label(&self) -> &'static str {
        if self.total > 0 && self.available == self.total {
            "healthy"
        } else if self.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }
}

/// API key pool with least-loaded selection and failure cooldown.
///
/// All record state sits behind one `tokio::sync::Mutex`; the lock is held
/// only for the in-memory bookkeeping, never across an upstream call.
pub struct KeyPool {
    records: Mutex<Vec<KeyRecord>>,
    pub(crate) config: PoolConfig,
}

impl KeyPool {
    /// Build a pool from a fixed key list. An empty list is valid and means
    /// pooling is disabled; `acquire` will always return `None`.
    pub fn new(keys: Vec<String>, config: PoolConfig) -> Self {
        let now = Instant::now();
        let records: Vec<KeyRecord> = keys
            .into_iter()
            .map(|k| {
                let key = Secret::new(k);
                let masked = key.masked();
                KeyRecord {
                    key,
                    masked,
                    last_used_at: None,
                    request_count: 0,
                    available: true,
                    cooldown_until: None,
                    window_started_at: now,
                    last_failure: None,
                }
            })
            .collect();
        info!(keys = records.len(), "key pool initialized");
        Self {
            records: Mutex::new(records),
            config,
        }
    }

    /// Tuning parameters the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of keys in the pool.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// True when the pool was built with no keys (pooling disabled).
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Lease the least-loaded available key, or `None` if every key is
    /// cooling down or soft-exhausted.
    ///
    /// Expired cooldowns and elapsed windows are swept lazily here: a key
    /// whose cooldown has passed becomes available with a fresh count, and an
    /// available key whose window has rolled over gets its count reset.
    /// Candidates are ordered by `(request_count, last_used_at)` — least
    /// loaded first, staleness as the tie-break. The selected key's count and
    /// last-used stamp are updated before the lock is released.
    pub async fn acquire(&self) -> Option<LeasedKey> {
        let mut records = self.records.lock().await;
        let now = Instant::now();

        for rec in records.iter_mut() {
            if !rec.available {
                if let Some(until) = rec.cooldown_until {
                    if now >= until {
                        info!(key = %rec.masked, "cooldown expired, key available again");
                        rec.available = true;
                        rec.cooldown_until = None;
                        rec.request_count = 0;
                        rec.window_started_at = now;
                    }
                }
            } else if now.duration_since(rec.window_started_at) >= self.config.window_duration {
                rec.request_count = 0;
                rec.window_started_at = now;
            }
        }

        let candidate = records
            .iter_mut()
            .filter(|r| r.available && r.request_count < self.config.max_requests_per_window)
            .min_by_key(|r| (r.request_count, r.last_used_at));

        let Some(rec) = candidate else {
            debug!("no key available for lease");
            metrics::counter!("keypool_acquire_total", "outcome" => "none").increment(1);
            return None;
        };

        rec.last_used_at = Some(now);
        rec.request_count += 1;
        debug!(key = %rec.masked, request_count = rec.request_count, "key leased");
        metrics::counter!("keypool_acquire_total", "outcome" => "leased").increment(1);
        Some(LeasedKey {
            key: rec.key.clone(),
            id: rec.masked.clone(),
        })
    }

    /// Put a key into cooldown after a failed attempt.
    ///
    /// The cooldown length is one window duration regardless of `kind`; the
    /// kind only drives logging and metrics. Cooldown deadlines never move
    /// backwards: a second report during an active cooldown can only extend it.
    /// `key` is the full secret as returned in the lease; reports for keys not
    /// in the pool are ignored.
    pub async fn report_failure(&self, key: &str, kind: FailureKind) {
        let mut records = self.records.lock().await;
        let Some(rec) = records.iter_mut().find(|r| r.key.expose() == key) else {
            warn!(kind = %kind, "failure reported for a key not in the pool, ignoring");
            return;
        };

        let until = Instant::now() + self.config.window_duration;
        let until = match rec.cooldown_until {
            Some(prev) if prev > until => prev,
            _ => until,
        };
        rec.available = false;
        rec.cooldown_until = Some(until);
        rec.last_failure = Some(kind);

        match kind {
            FailureKind::InvalidCredential => {
                warn!(key = %rec.masked, "key rejected as invalid, entering cooldown");
            }
            FailureKind::RateLimited => {
                info!(
                    key = %rec.masked,
                    cooldown_secs = self.config.window_duration.as_secs(),
                    "key rate limited, entering cooldown"
                );
            }
            FailureKind::Other => {
                warn!(key = %rec.masked, "key failed with unexpected error, entering cooldown");
            }
        }
        metrics::counter!("keypool_cooldowns_total", "kind" => kind.label()).increment(1);
    }

    /// Snapshot pool state without mutating any record.
    ///
    /// A key whose cooldown has already elapsed is reported as available even
    /// though the stored flag flips only on the next `acquire`; observers see
    /// what the next caller will get.
    pub async fn status(&self) -> PoolStatus {
        let records = self.records.lock().await;
        let now = Instant::now();

        let mut keys = Vec::with_capacity(records.len());
        let mut available = 0usize;
        let mut cooling_down = 0usize;

        for rec in records.iter() {
            let remaining = match rec.cooldown_until {
                Some(until) if !rec.available && until > now => (until - now).as_secs(),
                _ => 0,
            };
            let effectively_available = rec.available || remaining == 0;
            if effectively_available {
                available += 1;
            } else {
                cooling_down += 1;
            }
            keys.push(KeyStatus {
                id: rec.masked.clone(),
                available: effectively_available,
                request_count: rec.request_count,
                cooldown_remaining_secs: remaining,
                last_failure: rec.last_failure.map(|k| k.label()),
            });
        }

        PoolStatus {
            total: records.len(),
            available,
            cooling_down,
            keys,
        }
    }
}
