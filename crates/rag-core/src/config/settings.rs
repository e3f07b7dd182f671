use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::services::resilience::PolicyConfig;

const DEFAULT_SETTINGS_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub conversation: ConversationSettings,
    pub resilience: ResilienceSettings,
    pub memory: MemorySettings,
    pub rag: RagSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: usize,
    /// Expected vector length; provider results of another length are rejected.
    pub dimension: Option<usize>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            dimension: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConversationSettings {
    pub max_turns_per_session: usize,
    pub session_ttl_seconds: u64,
    /// Oldest turns folded into the summary when the window is full.
    pub summary_fold_count: usize,
    pub summary_max_chars: usize,
    /// 0 disables the background sweeper.
    pub sweep_interval_seconds: u64,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_turns_per_session: 10,
            session_ttl_seconds: 24 * 60 * 60,
            summary_fold_count: 1,
            summary_max_chars: 2000,
            sweep_interval_seconds: 0,
        }
    }
}

/// Policy parameters per external call site.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ResilienceSettings {
    pub embedding: PolicyConfig,
    pub vector_search: PolicyConfig,
    pub llm: PolicyConfig,
    pub summarizer: PolicyConfig,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            embedding: PolicyConfig::new(10.0, 2),
            vector_search: PolicyConfig::new(5.0, 2),
            llm: PolicyConfig::new(30.0, 1),
            summarizer: PolicyConfig::new(15.0, 0),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MemorySettings {
    pub enabled: bool,
    /// Percent of host memory held by this process.
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: 80.0,
            critical_threshold: 90.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RagSettings {
    pub retrieval_top_k: usize,
    /// Retained turns rendered into the prompt.
    pub context_turns: usize,
    /// Evidence block is cut after the passage that crosses this length.
    pub max_context_chars: usize,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            retrieval_top_k: 5,
            context_turns: 3,
            max_context_chars: 6000,
        }
    }
}

impl Settings {
    /// `.env`, then `config/settings.toml` if present, then `APP__*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::build(File::with_name(DEFAULT_SETTINGS_FILE).required(false))
    }

    /// Same layering with an explicit settings file, which must exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::build(File::from(path.as_ref()).required(true))
    }

    fn build<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        // Defaults go in first so a partial table only overrides the keys it names.
        let defaults = Config::try_from(&Settings::default())?;
        let config = Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(invalid("cache.capacity", "must be at least 1"));
        }
        if self.conversation.max_turns_per_session == 0 {
            return Err(invalid(
                "conversation.max_turns_per_session",
                "must be at least 1",
            ));
        }
        if self.conversation.session_ttl_seconds == 0 {
            return Err(invalid("conversation.session_ttl_seconds", "must be positive"));
        }

        let memory = &self.memory;
        if !(0.0..=100.0).contains(&memory.critical_threshold)
            || memory.warning_threshold >= memory.critical_threshold
        {
            return Err(invalid(
                "memory",
                format!(
                    "expected 0 <= warning ({}) < critical ({}) <= 100",
                    memory.warning_threshold, memory.critical_threshold
                ),
            ));
        }

        for (name, policy) in [
            ("resilience.embedding", &self.resilience.embedding),
            ("resilience.vector_search", &self.resilience.vector_search),
            ("resilience.llm", &self.resilience.llm),
            ("resilience.summarizer", &self.resilience.summarizer),
        ] {
            if !(policy.timeout_seconds > 0.0 && policy.timeout_seconds.is_finite()) {
                return Err(invalid(name, "timeout_seconds must be positive"));
            }
            if policy.backoff_base_seconds < 0.0
                || policy.backoff_max_seconds < policy.backoff_base_seconds
            {
                return Err(invalid(
                    name,
                    "expected 0 <= backoff_base_seconds <= backoff_max_seconds",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.cache.capacity, 100);
        assert_eq!(settings.conversation.max_turns_per_session, 10);
        assert_eq!(settings.resilience.llm.max_retries, 1);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut settings = Settings::default();
        settings.cache.capacity = 0;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { field: "cache.capacity", .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_memory_thresholds() {
        let mut settings = Settings::default();
        settings.memory.warning_threshold = 95.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut settings = Settings::default();
        settings.resilience.vector_search = PolicyConfig::new(5.0, 2).with_backoff(4.0, 1.0);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("resilience.vector_search"));
    }
}
