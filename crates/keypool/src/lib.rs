//! Credential pool scheduler for interchangeable upstream API keys
//!
//! Distributes generation requests across a pool of API keys to maximize
//! aggregate throughput under per-key rate limits. The pool tracks per-key
//! usage within a rolling window, selects the least-loaded key (ties broken
//! by least-recently-used), and isolates failing keys behind a cooldown.
//!
//! Key lifecycle:
//! 1. Pool is built once at startup from a fixed key list, every key `Available`
//! 2. `acquire` leases the least-loaded available key and counts the request
//! 3. A key that hits its per-window request cap is skipped until the window
//!    rolls over (soft exhaustion, not a failure)
//! 4. A reported failure puts the key in cooldown for one window duration
//! 5. Cooldown expiry is detected lazily on the next `acquire` and restores
//!    the key with a fresh request count
//!
//! `generate_with_retry` owns the attempt loop: it leases a key, runs the
//! caller-supplied unit of work outside the pool lock, and on failure cools
//! the key down and fails over to a different one, up to a bounded budget.

pub mod classify;
pub mod error;
pub mod pool;
pub mod retry;

pub use classify::{FailureKind, classify_message, classify_status};
pub use error::{Error, Result};
pub use pool::{KeyPool, KeyStatus, LeasedKey, PoolConfig, PoolStatus};
pub use retry::WorkError;
