use crate::errors::Result;
use podlens_core::mutation::MutationPolicies;
use podlens_core::validation::TimeWindow;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Settings read from the optional TOML file. Missing sections and keys fall
/// back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub refresh: RefreshConfig,
    pub mutation: MutationConfig,
    pub assistant: AssistantConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub default_window: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            interval_secs: 30,
            default_window: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub poll_interval_secs: u64,
    pub restart_max_retries: u32,
    pub scale_max_retries: u32,
    /// 0 checks the deployment once after the write.
    pub resources_max_retries: u32,
}

impl Default for MutationConfig {
    fn default() -> Self {
        MutationConfig {
            poll_interval_secs: 3,
            restart_max_retries: 10,
            scale_max_retries: 10,
            resources_max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub max_points: usize,
    pub history_step_secs: u64,
    pub history_span_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        AssistantConfig {
            max_points: 20,
            history_step_secs: 60,
            history_span_secs: 3_600,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No config file given, using defaults");
            return Ok(AppConfig::default());
        };
        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        info!("Loaded config from {}: {config:?}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.default_window()?;
        Ok(config)
    }

    pub fn default_window(&self) -> Result<TimeWindow> {
        Ok(TimeWindow::parse(&self.refresh.default_window)?)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh.interval_secs.max(1))
    }

    pub fn policies(&self) -> MutationPolicies {
        MutationPolicies::new(
            Duration::from_secs(self.mutation.poll_interval_secs),
            self.mutation.restart_max_retries,
            self.mutation.scale_max_retries,
            self.mutation.resources_max_retries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlens_core::mutation::OnExhausted;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.policies(), MutationPolicies::default());
        assert_eq!(config.refresh_interval(), Duration::from_secs(30));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = AppConfig::parse(
            r#"
            [mutation]
            resources_max_retries = 3

            [assistant]
            max_points = 50
            "#,
        )
        .unwrap();
        let policies = config.policies();
        assert_eq!(policies.resources.max_retries, 3);
        assert_eq!(policies.resources.on_exhausted, OnExhausted::Failed);
        assert_eq!(policies.scale.max_retries, 10);
        assert_eq!(policies.scale.interval, Duration::from_secs(3));
        assert_eq!(config.assistant.max_points, 50);
        assert_eq!(config.assistant.history_step_secs, 60);
    }

    #[test]
    fn bad_default_window_is_rejected() {
        let err = AppConfig::parse("[refresh]\ndefault_window = \"5 minutes\"").unwrap_err();
        assert!(err.to_string().contains("time window"), "{err}");
    }
}
