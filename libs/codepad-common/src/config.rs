use std::env;
use std::path::PathBuf;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which every job gets its own directory
    pub work_dir: PathBuf,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub compile_timeout_ms: u64,
    /// Cap on stdout + stderr captured per step
    pub max_output_bytes: usize,
    /// RLIMIT_FSIZE applied to run steps
    pub max_file_size_mb: u64,
    /// Delay between producing an outcome and removing the job directory
    pub cleanup_grace_ms: u64,
    pub language_config_path: PathBuf,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let default_timeout_ms = num("DEFAULT_TIMEOUT_MS", 5000);
        let max_timeout_ms = num("MAX_TIMEOUT_MS", 30000).max(default_timeout_ms);

        Self {
            work_dir: lookup("CODEPAD_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("codepad-jobs")),
            default_timeout_ms,
            max_timeout_ms,
            compile_timeout_ms: num("COMPILE_TIMEOUT_MS", 15000),
            max_output_bytes: num("MAX_OUTPUT_BYTES", 1024 * 1024) as usize,
            max_file_size_mb: num("MAX_FILE_SIZE_MB", 16),
            cleanup_grace_ms: num("CLEANUP_GRACE_MS", 0),
            language_config_path: lookup("LANGUAGE_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/languages.json")),
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.max_timeout_ms, 30000);
        assert_eq!(config.compile_timeout_ms, 15000);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
        assert_eq!(config.cleanup_grace_ms, 0);
        assert!(config.work_dir.ends_with("codepad-jobs"));
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
    }

    #[test]
    fn test_config_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CODEPAD_WORK_DIR", "/srv/jobs"),
            ("DEFAULT_TIMEOUT_MS", "2000"),
            ("MAX_OUTPUT_BYTES", "4096"),
            ("CLEANUP_GRACE_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.work_dir, PathBuf::from("/srv/jobs"));
        assert_eq!(config.default_timeout_ms, 2000);
        assert_eq!(config.max_output_bytes, 4096);
        assert_eq!(config.cleanup_grace_ms, 250);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = Config::from_lookup(|k| {
            (k == "DEFAULT_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert_eq!(config.default_timeout_ms, 5000);
    }

    #[test]
    fn test_max_timeout_never_below_default() {
        let config = Config::from_lookup(|k| match k {
            "DEFAULT_TIMEOUT_MS" => Some("10000".to_string()),
            "MAX_TIMEOUT_MS" => Some("1000".to_string()),
            _ => None,
        });
        assert_eq!(config.max_timeout_ms, 10000);
    }
}
