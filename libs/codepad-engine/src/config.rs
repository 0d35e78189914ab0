// Language configuration management for the execution engine
use anyhow::{bail, Context, Result};
use codepad_common::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Per-language toolchain and resource settings
///
/// `compilers` and `runtimes` are ordered candidate lists: the first one
/// present on the host wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default)]
    pub compilers: Vec<String>,
    #[serde(default)]
    pub runtimes: Vec<String>,
    #[serde(default)]
    pub compile_flags: Vec<String>,
    #[serde(default)]
    pub run_flags: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub compile_timeout_ms: Option<u64>,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub cpu_time_limit_secs: Option<u64>,
    /// Process and thread allowance of the run step; `null` lifts it
    #[serde(default = "default_max_processes")]
    pub max_processes: Option<u64>,
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_max_processes() -> Option<u64> {
    Some(64)
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl LanguageConfig {
    /// Built-in settings used when no languages.json is present
    pub fn builtin(language: Language) -> Self {
        let (compilers, runtimes, compile_flags) = match language {
            Language::C => (strings(&["gcc", "cc", "clang"]), vec![], strings(&["-O2", "-lm"])),
            Language::Cpp => (strings(&["g++", "c++", "clang++"]), vec![], strings(&["-O2"])),
            Language::Java => (strings(&["javac"]), strings(&["java"]), vec![]),
            Language::Python => (vec![], strings(&["python3", "python"]), vec![]),
        };
        // Every JVM thread counts against RLIMIT_NPROC
        let max_processes = match language {
            Language::Java => Some(512),
            _ => default_max_processes(),
        };

        Self {
            name: language.to_string(),
            compilers,
            runtimes,
            compile_flags,
            run_flags: vec![],
            timeout_ms: None,
            compile_timeout_ms: None,
            memory_limit_mb: default_memory_limit_mb(),
            cpu_time_limit_secs: None,
            max_processes,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
///
/// Languages absent from a loaded file are disabled.
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            let Some(language) = Language::from_str(&lang.name) else {
                bail!("Unknown language '{}' in language config", lang.name);
            };
            if language.is_compiled() && lang.compilers.is_empty() {
                bail!("Language '{}' needs at least one compiler", lang.name);
            }
            if matches!(language, Language::Java | Language::Python) && lang.runtimes.is_empty() {
                bail!("Language '{}' needs at least one runtime", lang.name);
            }
            configs.insert(language, lang);
        }

        if configs.is_empty() {
            bail!("No languages configured");
        }

        Ok(Self { configs })
    }

    /// Every supported language with built-in settings
    pub fn builtin() -> Self {
        let configs = Language::all_variants()
            .iter()
            .map(|lang| (*lang, LanguageConfig::builtin(*lang)))
            .collect();
        Self { configs }
    }

    /// Load from `config_path` if it exists, otherwise use built-ins
    ///
    /// A file that exists but does not parse is still an error.
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            Ok(Self::builtin())
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Option<&LanguageConfig> {
        self.configs.get(language)
    }

    pub fn is_enabled(&self, language: &Language) -> bool {
        self.configs.contains_key(language)
    }

    /// List all enabled languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut langs: Vec<Language> = self.configs.keys().copied().collect();
        langs.sort_by_key(|l| l.to_string());
        langs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_covers_all_languages() {
        let manager = LanguageConfigManager::builtin();
        for lang in Language::all_variants() {
            assert!(manager.is_enabled(lang), "{} should be enabled", lang);
        }
        let python = manager.get_config(&Language::Python).unwrap();
        assert_eq!(python.runtimes, vec!["python3", "python"]);
        assert!(python.compilers.is_empty());
    }

    #[test]
    fn test_builtin_c_links_math() {
        let c = LanguageConfig::builtin(Language::C);
        assert_eq!(c.compilers[0], "gcc");
        assert!(c.compile_flags.contains(&"-lm".to_string()));
    }

    #[test]
    fn test_from_json_restricts_languages() {
        let manager = LanguageConfigManager::from_json(
            r#"{"languages": [{"name": "py", "runtimes": ["pypy3"], "timeout_ms": 2000}]}"#,
        )
        .unwrap();

        assert!(manager.is_enabled(&Language::Python));
        assert!(!manager.is_enabled(&Language::Java));
        let python = manager.get_config(&Language::Python).unwrap();
        assert_eq!(python.runtimes, vec!["pypy3"]);
        assert_eq!(python.timeout_ms, Some(2000));
        assert_eq!(python.memory_limit_mb, 256);
        assert_eq!(python.max_processes, Some(64));
    }

    #[test]
    fn test_process_allowance_can_be_lifted() {
        let manager = LanguageConfigManager::from_json(
            r#"{"languages": [{"name": "python", "runtimes": ["python3"], "max_processes": null}]}"#,
        )
        .unwrap();
        assert_eq!(manager.get_config(&Language::Python).unwrap().max_processes, None);
        assert_eq!(LanguageConfig::builtin(Language::Java).max_processes, Some(512));
    }

    #[test]
    fn test_from_json_rejects_unknown_language() {
        let err = LanguageConfigManager::from_json(r#"{"languages": [{"name": "cobol"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_from_json_rejects_compiled_language_without_compiler() {
        let res = LanguageConfigManager::from_json(r#"{"languages": [{"name": "cpp"}]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_from_json_rejects_empty() {
        assert!(LanguageConfigManager::from_json(r#"{"languages": []}"#).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        assert!(LanguageConfigManager::load(&path).is_err());

        let manager = LanguageConfigManager::load_or_builtin(&path).unwrap();
        assert_eq!(manager.list_languages().len(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"languages": [{{"name": "c", "compilers": ["clang"], "memory_limit_mb": 64}}]}}"#
        )
        .unwrap();

        let manager = LanguageConfigManager::load_or_builtin(&path).unwrap();
        assert_eq!(manager.list_languages(), vec![Language::C]);
        assert_eq!(manager.get_config(&Language::C).unwrap().memory_limit_mb, 64);
    }

    #[test]
    fn test_shipped_config_matches_builtin() {
        let shipped = include_str!("../../../config/languages.json");
        let manager = LanguageConfigManager::from_json(shipped).unwrap();
        assert_eq!(manager.list_languages().len(), 4);
        for lang in Language::all_variants() {
            let builtin = LanguageConfig::builtin(*lang);
            let loaded = manager.get_config(lang).unwrap();
            assert_eq!(loaded.compilers, builtin.compilers, "{}", lang);
            assert_eq!(loaded.runtimes, builtin.runtimes, "{}", lang);
            assert_eq!(loaded.max_processes, builtin.max_processes, "{}", lang);
        }
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        fs::write(&path, "{not json").unwrap();
        assert!(LanguageConfigManager::load_or_builtin(&path).is_err());
    }
}
