//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are never stored in the TOML directly: they come from the
//! numbered GEMINI_API_KEY / GEMINI_API_KEY_2 / ... env vars or from a
//! keys file referenced by the config, one key per line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keypool::PoolConfig;
use serde::Deserialize;

/// Highest numbered GEMINI_API_KEY_N env var that is scanned. Gaps in the
/// numbering are allowed.
const MAX_NUMBERED_KEYS: usize = 16;

/// Placeholder value shipped in sample env files; treated as unset.
const KEY_PLACEHOLDER: &str = "your_gemini_api_key_here";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolSettings,
}

/// HTTP server settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream generative API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            model: default_model(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Key pool tuning. Defaults match the upstream free-tier limits.
#[derive(Debug, Deserialize)]
pub struct PoolSettings {
    /// Set to false to bypass the pool and use GEMINI_API_KEY directly.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_no_credential_backoff_ms")]
    pub no_credential_backoff_ms: u64,
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    /// Hard cap on one upstream attempt; unset trusts the HTTP timeout.
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
    /// File with one API key per line, used when no env keys are set.
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_requests_per_window: default_max_requests_per_window(),
            window_secs: default_window_secs(),
            max_attempts: default_max_attempts(),
            no_credential_backoff_ms: default_no_credential_backoff_ms(),
            failure_backoff_ms: default_failure_backoff_ms(),
            attempt_timeout_secs: None,
            keys_file: None,
        }
    }
}

impl PoolSettings {
    /// Translate into the scheduler's config struct.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_requests_per_window: self.max_requests_per_window,
            window_duration: Duration::from_secs(self.window_secs),
            max_attempts: self.max_attempts,
            no_credential_backoff: Duration::from_millis(self.no_credential_backoff_ms),
            failure_backoff: Duration::from_millis(self.failure_backoff_ms),
            attempt_timeout: self.attempt_timeout_secs.map(Duration::from_secs),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_model() -> String {
    "gemini-2.5-flash".into()
}

fn default_timeout() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

fn default_max_requests_per_window() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_no_credential_backoff_ms() -> u64 {
    1000
}

fn default_failure_backoff_ms() -> u64 {
    500
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if !config.upstream.url.starts_with("http://") && !config.upstream.url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream url must start with http:// or https://, got: {}",
                config.upstream.url
            )));
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if config.pool.max_requests_per_window == 0 {
            return Err(common::Error::Config(
                "max_requests_per_window must be greater than 0".into(),
            ));
        }

        if config.pool.window_secs == 0 {
            return Err(common::Error::Config(
                "window_secs must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-pool-gateway.toml")
    }

    /// Collect API keys for the pool.
    ///
    /// Numbered env vars win: GEMINI_API_KEY, then GEMINI_API_KEY_2 through
    /// GEMINI_API_KEY_16, skipping unset, empty, and placeholder values. If
    /// the env yields nothing and `pool.keys_file` is set, the file is read
    /// with one key per line ('#' lines and blanks ignored). An empty result
    /// is valid; the caller decides whether to run without pooling.
    pub fn load_api_keys(&self) -> common::Result<Vec<String>> {
        let mut keys = Vec::new();
        for i in 1..=MAX_NUMBERED_KEYS {
            let name = if i == 1 {
                "GEMINI_API_KEY".to_string()
            } else {
                format!("GEMINI_API_KEY_{i}")
            };
            if let Ok(value) = std::env::var(&name) {
                let value = value.trim().to_owned();
                if !value.is_empty() && value != KEY_PLACEHOLDER {
                    keys.push(value);
                }
            }
        }
        if !keys.is_empty() {
            return Ok(keys);
        }

        if let Some(ref keys_file) = self.pool.keys_file {
            let contents = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            for line in contents.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') && line != KEY_PLACEHOLDER {
                    keys.push(line.to_owned());
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    unsafe fn clear_key_env() {
        unsafe {
            remove_env("GEMINI_API_KEY");
            for i in 2..=MAX_NUMBERED_KEYS {
                remove_env(&format!("GEMINI_API_KEY_{i}"));
            }
        }
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8080"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(
            config.upstream.url,
            "https://generativelanguage.googleapis.com"
        );
        assert_eq!(config.upstream.model, "gemini-2.5-flash");
        assert_eq!(config.upstream.timeout_secs, 60);
        assert!(config.pool.enabled);
        assert_eq!(config.pool.max_requests_per_window, 60);
        assert_eq!(config.pool.window_secs, 60);
        assert_eq!(config.pool.max_attempts, 3);
        assert_eq!(config.pool.no_credential_backoff_ms, 1000);
        assert_eq!(config.pool.failure_backoff_ms, 500);
        assert!(config.pool.attempt_timeout_secs.is_none());
    }

    #[test]
    fn test_pool_config_translation() {
        let settings = PoolSettings {
            attempt_timeout_secs: Some(30),
            ..PoolSettings::default()
        };
        let pc = settings.pool_config();
        assert_eq!(pc.max_requests_per_window, 60);
        assert_eq!(pc.window_duration, Duration::from_secs(60));
        assert_eq!(pc.max_attempts, 3);
        assert_eq!(pc.no_credential_backoff, Duration::from_millis(1000));
        assert_eq!(pc.failure_backoff, Duration::from_millis(500));
        assert_eq!(pc.attempt_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_invalid_upstream_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[upstream]
url = "generativelanguage.googleapis.com"
"#,
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("upstream url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[upstream]
timeout_secs = 0
"#,
        );
        assert!(Config::load(&path).is_err(), "timeout_secs = 0 must be rejected");
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"
max_connections = 0
"#,
        );
        assert!(Config::load(&path).is_err(), "max_connections = 0 must be rejected");
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[pool]
max_attempts = 0
"#,
        );
        assert!(Config::load(&path).is_err(), "max_attempts = 0 must be rejected");
    }

    #[test]
    fn test_zero_window_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[pool]
window_secs = 0
"#,
        );
        assert!(Config::load(&path).is_err(), "window_secs = 0 must be rejected");
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("gemini-pool-gateway.toml"));
    }

    #[test]
    fn test_numbered_env_keys_collected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());
        let config = Config::load(&path).unwrap();

        unsafe {
            clear_key_env();
            set_env("GEMINI_API_KEY", "key-one-11111111");
            set_env("GEMINI_API_KEY_2", "key-two-22222222");
            // Gap at _3 is allowed
            set_env("GEMINI_API_KEY_4", "key-four-44444444");
        }
        let keys = config.load_api_keys().unwrap();
        unsafe { clear_key_env() };

        assert_eq!(
            keys,
            vec![
                "key-one-11111111",
                "key-two-22222222",
                "key-four-44444444"
            ]
        );
    }

    #[test]
    fn test_placeholder_env_key_skipped() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());
        let config = Config::load(&path).unwrap();

        unsafe {
            clear_key_env();
            set_env("GEMINI_API_KEY", "your_gemini_api_key_here");
            set_env("GEMINI_API_KEY_2", "real-key-22222222");
        }
        let keys = config.load_api_keys().unwrap();
        unsafe { clear_key_env() };

        assert_eq!(keys, vec!["real-key-22222222"]);
    }

    #[test]
    fn test_keys_file_used_when_env_empty() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys.txt");
        std::fs::write(&keys_path, "# pool keys\nfile-key-11111111\n\nfile-key-22222222\n").unwrap();

        let toml = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[pool]
keys_file = "{}"
"#,
            keys_path.display()
        );
        let path = write_config(&dir, &toml);
        let config = Config::load(&path).unwrap();

        unsafe { clear_key_env() };
        let keys = config.load_api_keys().unwrap();
        assert_eq!(keys, vec!["file-key-11111111", "file-key-22222222"]);
    }

    #[test]
    fn test_env_keys_override_keys_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys.txt");
        std::fs::write(&keys_path, "file-key-11111111\n").unwrap();

        let toml = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[pool]
keys_file = "{}"
"#,
            keys_path.display()
        );
        let path = write_config(&dir, &toml);
        let config = Config::load(&path).unwrap();

        unsafe {
            clear_key_env();
            set_env("GEMINI_API_KEY", "env-key-11111111");
        }
        let keys = config.load_api_keys().unwrap();
        unsafe { clear_key_env() };

        assert_eq!(keys, vec!["env-key-11111111"]);
    }

    #[test]
    fn test_missing_keys_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[pool]
keys_file = "/nonexistent/keys.txt"
"#,
        );
        let config = Config::load(&path).unwrap();

        unsafe { clear_key_env() };
        assert!(config.load_api_keys().is_err());
    }

    #[test]
    fn test_no_keys_anywhere_is_valid_and_empty() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());
        let config = Config::load(&path).unwrap();

        unsafe { clear_key_env() };
        let keys = config.load_api_keys().unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_pooling_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[pool]
enabled = false
"#,
        );
        let config = Config::load(&path).unwrap();
        assert!(!config.pool.enabled);
    }
}
