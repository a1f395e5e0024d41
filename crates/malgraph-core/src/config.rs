//! Configuration loading and parsing for malgraph
//!
//! Provides functionality to load and parse `malgraph.toml` configuration files.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::oracle::RetryPolicy;
use crate::report::Phase;

pub const CONFIG_FILENAME: &str = "malgraph.toml";

const KNOWN_SECTIONS: &[(&str, &[&str])] = &[
    ("analysis", &["timeout_secs", "phases"]),
    (
        "oracle",
        &[
            "enabled",
            "endpoint",
            "model",
            "api_key_env",
            "max_attempts",
            "retry_delay_ms",
        ],
    ),
    ("knowledge", &["path", "registry", "register_unknown"]),
    ("probe", &["enabled", "image", "timeout_secs", "sandbox_dir"]),
    ("patterns", &["path"]),
    ("obfuscation", &["enabled", "max_source_bytes"]),
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid TOML in '{path}': {message}")]
    ParseError { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Default)]
pub struct ConfigResult {
    pub config: Config,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub analysis: AnalysisConfig,
    pub oracle: OracleConfig,
    pub knowledge: KnowledgeConfig,
    pub probe: ProbeConfig,
    pub patterns: PatternsConfig,
    pub obfuscation: ObfuscationConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub timeout_secs: u64,
    pub phases: Vec<Phase>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            phases: Phase::ALL.to_vec(),
        }
    }
}

impl AnalysisConfig {
    /// `None` when the timeout is disabled with `0`.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key_env: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            model: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_attempts: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl OracleConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.max_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Extra JSON knowledge merged over the built-in tables.
    pub path: Option<PathBuf>,
    pub registry: String,
    pub register_unknown: bool,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            path: None,
            registry: "https://registry.npmjs.org".to_string(),
            register_unknown: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub image: String,
    pub timeout_secs: u64,
    pub sandbox_dir: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "node:20-alpine".to_string(),
            timeout_secs: 10,
            sandbox_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatternsConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObfuscationConfig {
    pub enabled: bool,
    pub max_source_bytes: usize,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_source_bytes: 200_000,
        }
    }
}

pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let config_path = current.join(CONFIG_FILENAME);
        if config_path.exists() {
            return Some(config_path);
        }
        if !current.pop() {
            return None;
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e.message().to_string(),
    })
}

pub fn load_config_with_warnings(path: &Path) -> Result<ConfigResult, ConfigError> {
    let config = load_config(path)?;
    let warnings = std::fs::read_to_string(path)
        .map(|content| detect_unknown_keys(&content))
        .unwrap_or_default();
    Ok(ConfigResult { config, warnings })
}

fn detect_unknown_keys(content: &str) -> Vec<String> {
    let mut warnings = Vec::new();

    let table: toml::Table = match content.parse() {
        Ok(t) => t,
        Err(_) => return warnings,
    };

    let known: HashSet<&str> = KNOWN_SECTIONS.iter().map(|(name, _)| *name).collect();
    for (key, value) in &table {
        if !known.contains(key.as_str()) {
            warnings.push(format!("Unknown config option: '{}'", key));
            continue;
        }
        let Some(section) = value.as_table() else {
            continue;
        };
        let Some((_, keys)) = KNOWN_SECTIONS.iter().find(|(name, _)| name == key) else {
            continue;
        };
        for inner in section.keys() {
            if !keys.contains(&inner.as_str()) {
                warnings.push(format!("Unknown config option in [{}]: '{}'", key, inner));
            }
        }
    }

    warnings
}

pub fn load_config_or_default_with_warnings(start_dir: &Path) -> ConfigResult {
    match find_config_file(start_dir) {
        Some(path) => load_config_with_warnings(&path).unwrap_or_default(),
        None => ConfigResult::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn create_temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("Failed to create temp dir")
    }

    #[test]
    fn load_config_from_file() {
        let dir = create_temp_dir();
        let config_path = dir.path().join(CONFIG_FILENAME);
        fs::write(
            &config_path,
            r#"
[analysis]
timeout_secs = 30
phases = ["install", "import"]

[oracle]
enabled = true
endpoint = "http://localhost:8080/v1"
max_attempts = 2

[patterns]
path = "extra-patterns.toml"
"#,
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();

        assert_eq!(config.analysis.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.analysis.phases, vec![Phase::Install, Phase::Import]);
        assert!(config.oracle.enabled);
        assert_eq!(config.oracle.retry_policy().attempts, 2);
        assert_eq!(config.oracle.api_key_env, "OPENAI_API_KEY");
        assert_eq!(
            config.patterns.path.as_deref(),
            Some(Path::new("extra-patterns.toml"))
        );
        assert_eq!(config.probe, ProbeConfig::default());
    }

    #[test]
    fn default_config_when_missing() {
        let dir = create_temp_dir();
        let result = load_config_or_default_with_warnings(dir.path());

        assert_eq!(result.config, Config::default());
        assert_eq!(result.config.analysis.timeout_secs, 600);
        assert_eq!(result.config.analysis.phases.len(), 3);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn zero_timeout_disables_the_deadline() {
        let config: Config = toml::from_str("[analysis]\ntimeout_secs = 0\n").unwrap();
        assert_eq!(config.analysis.timeout(), None);
    }

    #[test]
    fn error_on_invalid_toml() {
        let dir = create_temp_dir();
        let config_path = dir.path().join(CONFIG_FILENAME);
        fs::write(&config_path, "this is not valid { toml }").unwrap();

        match load_config(&config_path) {
            Err(ConfigError::ParseError { path, .. }) => assert_eq!(path, config_path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn error_on_unknown_phase() {
        let result: Result<Config, _> = toml::from_str("[analysis]\nphases = [\"deploy\"]\n");
        assert!(result.is_err());
    }

    #[test]
    fn warns_on_unknown_keys() {
        let dir = create_temp_dir();
        let config_path = dir.path().join(CONFIG_FILENAME);
        fs::write(
            &config_path,
            "verbose = true\n[oracle]\nendpoint = \"x\"\ntemperature = 0.2\n",
        )
        .unwrap();

        let result = load_config_with_warnings(&config_path).unwrap();

        assert_eq!(
            result.warnings,
            vec![
                "Unknown config option in [oracle]: 'temperature'".to_string(),
                "Unknown config option: 'verbose'".to_string(),
            ]
        );
    }

    #[test]
    fn finds_config_in_parent_directory() {
        let dir = create_temp_dir();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "").unwrap();

        assert_eq!(
            find_config_file(&nested),
            Some(dir.path().join(CONFIG_FILENAME))
        );
    }
}
