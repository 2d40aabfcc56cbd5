//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every attempt in the retry budget was consumed without a success.
    /// Carries the text of the last per-attempt failure for diagnostics.
    #[error("pool exhausted after {attempts} attempts: {last_error}")]
    PoolExhausted { attempts: u32, last_error: String },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_display_includes_attempts_and_cause() {
        let err = Error::PoolExhausted {
            attempts: 3,
            last_error: "upstream returned 429".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"), "got: {msg}");
        assert!(msg.contains("429"), "got: {msg}");
    }
}
