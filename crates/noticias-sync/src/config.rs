use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use noticias_core::{CategoryConfig, Difficulty, StoreMetadata};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
    #[error("{0} environment variable is required")]
    MissingEnv(&'static str),
}

fn default_per_category_cap() -> usize {
    3
}
fn default_max_generation_attempts() -> u32 {
    3
}
fn default_vocabulary_size() -> usize {
    4
}
fn default_feed_scan_limit() -> usize {
    10
}
fn default_feed_window_days() -> u32 {
    7
}
fn default_retry_backoff_ms() -> u64 {
    2_000
}
fn default_max_output_tokens() -> u32 {
    12_000
}
fn default_store_location() -> PathBuf {
    PathBuf::from("docs/stories.json")
}
fn default_store_description() -> String {
    "Accumulated news stories for language learners".to_string()
}
fn default_generated_by() -> String {
    "noticias-sync".to_string()
}
fn default_audio_dir() -> PathBuf {
    PathBuf::from("docs/audio")
}

/// Pipeline tuning loaded from `pipeline.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub categories: Vec<CategoryConfig>,
    /// Difficulty applied to generated items that omit one. Every category
    /// needs an entry.
    pub difficulty_by_category: BTreeMap<String, Difficulty>,
    #[serde(default = "default_per_category_cap")]
    pub per_category_cap: usize,
    #[serde(default = "default_max_generation_attempts")]
    pub max_generation_attempts: u32,
    #[serde(default = "default_store_location")]
    pub store_location: PathBuf,
    #[serde(default = "default_vocabulary_size")]
    pub vocabulary_size: usize,
    #[serde(default = "default_feed_scan_limit")]
    pub feed_scan_limit: usize,
    #[serde(default = "default_feed_window_days")]
    pub feed_window_days: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_store_description")]
    pub store_description: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default = "default_generated_by")]
    pub generated_by: String,
    /// Audience and style instructions placed at the top of the generation prompt.
    #[serde(default)]
    pub prompt_preamble: Option<String>,
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,
    /// Public prefix for `audio_url`; audio is skipped when unset.
    #[serde(default)]
    pub audio_public_base_url: Option<String>,
    /// Where lesson documents go; rendering is skipped when unset.
    #[serde(default)]
    pub reports_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.categories.is_empty() {
            return Err(ConfigError::Invalid("at least one category is required".into()));
        }
        let mut names = HashSet::new();
        let mut slugs = HashSet::new();
        for category in &self.categories {
            if category.name.trim().is_empty() || category.slug.trim().is_empty() {
                return Err(ConfigError::Invalid("category name and slug must be non-empty".into()));
            }
            if !names.insert(category.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate category name {}", category.name)));
            }
            if !slugs.insert(category.slug.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate category slug {}", category.slug)));
            }
            if !self.difficulty_by_category.contains_key(&category.name) {
                return Err(ConfigError::Invalid(format!(
                    "difficulty_by_category has no entry for {}",
                    category.name
                )));
            }
        }
        if self.per_category_cap == 0 {
            return Err(ConfigError::Invalid("per_category_cap must be at least 1".into()));
        }
        if self.max_generation_attempts == 0 {
            return Err(ConfigError::Invalid("max_generation_attempts must be at least 1".into()));
        }
        if self.vocabulary_size == 0 {
            return Err(ConfigError::Invalid("vocabulary_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn difficulty_for(&self, category_name: &str) -> Option<Difficulty> {
        self.difficulty_by_category.get(category_name).copied()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn store_metadata(&self) -> StoreMetadata {
        StoreMetadata {
            description: self.store_description.clone(),
            content_type: self.content_type.clone(),
            generated_by: self.generated_by.clone(),
        }
    }

    /// Anchor relative paths at `root`.
    pub fn resolve_paths(mut self, root: &Path) -> Self {
        let anchor = |p: PathBuf| if p.is_absolute() { p } else { root.join(p) };
        self.store_location = anchor(self.store_location);
        self.audio_dir = anchor(self.audio_dir);
        self.reports_dir = self.reports_dir.map(anchor);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Rss,
    Fixture,
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub config_path: PathBuf,
    pub store_override: Option<PathBuf>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub openai_api_key: Option<String>,
    pub tts_model: Option<String>,
    pub feed_mode: FeedMode,
    pub fixtures_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("NOTICIAS_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            config_path: std::env::var("NOTICIAS_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("pipeline.yaml")),
            store_override: non_empty_var("NOTICIAS_STORE").map(PathBuf::from),
            anthropic_api_key: non_empty_var("ANTHROPIC_API_KEY"),
            anthropic_model: std::env::var("NOTICIAS_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5-20251001".to_string()),
            openai_api_key: non_empty_var("OPENAI_API_KEY"),
            tts_model: non_empty_var("NOTICIAS_TTS_MODEL"),
            feed_mode: match std::env::var("NOTICIAS_FEED_MODE").as_deref() {
                Ok("fixture") | Ok("fixtures") => FeedMode::Fixture,
                _ => FeedMode::Rss,
            },
            fixtures_dir: std::env::var("NOTICIAS_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("fixtures/feeds")),
            scheduler_enabled: std::env::var("NOTICIAS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("NOTICIAS_USER_AGENT")
                .unwrap_or_else(|_| "noticias-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("NOTICIAS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            workspace_root,
        }
    }

    pub fn require_anthropic_key(&self) -> Result<&str, ConfigError> {
        self.anthropic_api_key
            .as_deref()
            .ok_or(ConfigError::MissingEnv("ANTHROPIC_API_KEY"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
categories:
  - name: Burn Care
    slug: burn-care
    query: burn+wound+treatment
    emoji: "🔥"
  - name: Diabetic Foot
    slug: diabetic-foot
    query: diabetic+foot+ulcer
difficulty_by_category:
  Burn Care: B1
  Diabetic Foot: B1
"#;

    #[test]
    fn defaults_fill_optional_fields() {
        let config = PipelineConfig::from_yaml_str(MINIMAL).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.per_category_cap, 3);
        assert_eq!(config.max_generation_attempts, 3);
        assert_eq!(config.vocabulary_size, 4);
        assert_eq!(config.retry_backoff(), Duration::from_secs(2));
        assert_eq!(config.difficulty_for("Diabetic Foot"), Some(Difficulty::B1));
        assert_eq!(config.categories[0].emoji.as_deref(), Some("🔥"));
        assert!(config.reports_dir.is_none());
    }

    #[test]
    fn every_category_needs_a_difficulty() {
        let text = MINIMAL.replace("  Diabetic Foot: B1\n", "");
        let config = PipelineConfig::from_yaml_str(&text).expect("parse");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Diabetic Foot"));
    }

    #[test]
    fn unknown_difficulty_label_fails_to_parse() {
        let text = MINIMAL.replace("Burn Care: B1", "Burn Care: C2");
        assert!(PipelineConfig::from_yaml_str(&text).is_err());
    }

    #[test]
    fn zero_cap_and_duplicate_slugs_are_rejected() {
        let mut config = PipelineConfig::from_yaml_str(MINIMAL).expect("parse");
        config.per_category_cap = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::from_yaml_str(MINIMAL).expect("parse");
        config.categories[1].slug = "burn-care".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_paths_are_anchored_at_the_workspace_root() {
        let mut config = PipelineConfig::from_yaml_str(MINIMAL).expect("parse");
        config.reports_dir = Some(PathBuf::from("reports"));
        let config = config.resolve_paths(Path::new("/srv/noticias"));
        assert_eq!(config.store_location, PathBuf::from("/srv/noticias/docs/stories.json"));
        assert_eq!(config.reports_dir, Some(PathBuf::from("/srv/noticias/reports")));
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("pipeline.yaml");
        assert!(matches!(PipelineConfig::load(&missing), Err(ConfigError::Io { .. })));

        std::fs::write(&missing, MINIMAL).expect("write");
        assert_eq!(PipelineConfig::load(&missing).expect("load").categories.len(), 2);
    }
}
