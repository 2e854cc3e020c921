use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::pagination::BoundsPolicy;
use crate::ranking::{DEFAULT_BLOCK_HOURS, DEFAULT_HALF_LIFE_HOURS, RankingPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "tagfeed.yaml";

/// Top-level configuration, read from YAML. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub scheduler: SchedulerSettings,
    pub retention: RetentionSettings,
    pub ranking: RankingSettings,
    pub pagination: PaginationSettings,
    pub enrichment: EnrichmentSettings,
    /// Feeds registered at startup if their url is unknown
    pub sources: Vec<SourceSettings>,
    pub log: LogSettings,
    /// File the configuration was read from, `None` when defaults were used
    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:tagfeed.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub interval_ms: u64,
    pub fetch_timeout_secs: u64,
    /// Budget for one source end to end: fetch, enrichment and saves
    pub source_timeout_secs: u64,
    /// Sources fetched at the same time
    pub concurrency: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 7_200_000,
            fetch_timeout_secs: 30,
            source_timeout_secs: 600,
            concurrency: 4,
        }
    }
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub interval_hours: u64,
    pub max_age_hours: i64,
    /// Spare saved articles from the sweep
    pub keep_saved: bool,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            max_age_hours: 24 * 7,
            keep_saved: false,
        }
    }
}

impl RetentionSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingSettings {
    pub policy: RankingPolicy,
    pub half_life_hours: f64,
    pub block_hours: i64,
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            policy: RankingPolicy::default(),
            half_life_hours: DEFAULT_HALF_LIFE_HOURS,
            block_hours: DEFAULT_BLOCK_HOURS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationSettings {
    pub bounds: BoundsPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    pub enabled: bool,
    /// Base of an OpenAI-compatible API, without `/chat/completions`
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-5-nano".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 20,
        }
    }
}

impl EnrichmentSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub console_level: String,
    pub file_level: String,
    pub file: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file_level: "debug".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Reads `path`, falling back to defaults when it does not exist.
    /// Runs before the logger exists, so callers report `origin` themselves.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.origin = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_ms == 0 {
            bail!("scheduler.interval_ms must be positive");
        }
        if self.scheduler.fetch_timeout_secs == 0 {
            bail!("scheduler.fetch_timeout_secs must be positive");
        }
        if self.scheduler.source_timeout_secs < self.scheduler.fetch_timeout_secs {
            bail!("scheduler.source_timeout_secs must be at least scheduler.fetch_timeout_secs");
        }
        if self.scheduler.concurrency == 0 {
            bail!("scheduler.concurrency must be at least 1");
        }
        if self.retention.interval_hours == 0 {
            bail!("retention.interval_hours must be positive");
        }
        if self.retention.max_age_hours <= 0 {
            bail!("retention.max_age_hours must be positive");
        }
        if self.ranking.half_life_hours.is_nan() || self.ranking.half_life_hours <= 0.0 {
            bail!("ranking.half_life_hours must be positive");
        }
        if self.ranking.block_hours <= 0 {
            bail!("ranking.block_hours must be positive");
        }
        if self.enrichment.enabled && self.enrichment.timeout_secs == 0 {
            bail!("enrichment.timeout_secs must be positive");
        }
        for source in &self.sources {
            if source.url.trim().is_empty() {
                bail!("source {:?} has no url", source.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.scheduler.interval(), Duration::from_millis(7_200_000));
        assert_eq!(config.scheduler.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(config.retention.max_age_hours, 168);
        assert!(!config.retention.keep_saved);
        assert_eq!(config.ranking.policy, RankingPolicy::Scored);
        assert_eq!(config.pagination.bounds, BoundsPolicy::Clamp);
        assert!(!config.enrichment.enabled);
    }

    #[test]
    fn sections_override_defaults() {
        let yaml = r#"
scheduler:
  interval_ms: 60000
  concurrency: 8
retention:
  keep_saved: true
ranking:
  policy: priority_blocks
  block_hours: 12
pagination:
  bounds: strict
sources:
  - name: Example
    url: https://example.com/rss.xml
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.scheduler.interval_ms, 60_000);
        assert_eq!(config.scheduler.fetch_timeout_secs, 30);
        assert_eq!(config.scheduler.concurrency, 8);
        assert!(config.retention.keep_saved);
        assert_eq!(config.ranking.policy, RankingPolicy::PriorityBlocks);
        assert_eq!(config.ranking.block_hours, 12);
        assert_eq!(config.pagination.bounds, BoundsPolicy::Strict);
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(Config::from_yaml("scheduler:\n  concurrency: 0\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/tagfeed.yaml")).unwrap();
        assert_eq!(config.database.url, "sqlite:tagfeed.db");
        assert!(config.origin.is_none());
    }

    #[test]
    fn loaded_file_is_recorded_as_origin() {
        let path = std::env::temp_dir().join(format!("tagfeed-{}.yaml", uuid::Uuid::new_v4()));
        fs::write(&path, "scheduler:\n  concurrency: 2\n").unwrap();

        let config = Config::load(&path);
        fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.scheduler.concurrency, 2);
        assert_eq!(config.origin.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn source_budget_cannot_undercut_the_fetch_deadline() {
        let yaml = "scheduler:\n  fetch_timeout_secs: 60\n  source_timeout_secs: 30\n";
        assert!(Config::from_yaml(yaml).is_err());

        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.scheduler.source_timeout(), Duration::from_secs(600));
    }
}
