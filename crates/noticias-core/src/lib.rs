//! Core domain model for the Noticias content pipeline.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "noticias-core";

/// CEFR level a story is written at. Ordered from easiest to hardest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    A2,
    B1,
    B2,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A2 => "A2",
            Self::B1 => "B1",
            Self::B2 => "B2",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDifficulty(pub String);

impl fmt::Display for UnknownDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown difficulty level `{}`", self.0)
    }
}

impl std::error::Error for UnknownDifficulty {}

impl FromStr for Difficulty {
    type Err = UnknownDifficulty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A2" => Ok(Self::A2),
            "B1" => Ok(Self::B1),
            "B2" => Ok(Self::B2),
            _ => Err(UnknownDifficulty(s.to_string())),
        }
    }
}

/// One news category the pipeline queries and generates stories for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub slug: String,
    /// Feed search query, `+`-joined terms.
    pub query: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub gradient: Option<String>,
}

impl CategoryConfig {
    /// True when `label` names this category by display name or slug.
    pub fn matches(&self, label: &str) -> bool {
        let label = label.trim();
        label == self.name || label.eq_ignore_ascii_case(&self.slug)
    }
}

/// Raw feed item considered as generation input. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
    /// Stable external key, normally the article URL.
    #[serde(alias = "url")]
    pub identifier: String,
}

impl CandidateRecord {
    pub fn has_identifier(&self) -> bool {
        !self.identifier.trim().is_empty()
    }
}

/// Missing fields load as empty and stay absent on save; completeness is
/// checked only for newly generated items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    #[serde(rename = "word", default, skip_serializing_if = "String::is_empty")]
    pub term: String,
    #[serde(rename = "definition_es", default, skip_serializing_if = "String::is_empty")]
    pub definition_primary: String,
    #[serde(rename = "definition_en", default, skip_serializing_if = "String::is_empty")]
    pub definition_secondary: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl VocabularyEntry {
    pub fn is_complete(&self) -> bool {
        !self.term.trim().is_empty()
            && !self.definition_primary.trim().is_empty()
            && !self.definition_secondary.trim().is_empty()
    }
}

/// Persisted unit of learning content.
///
/// Field names on the wire follow the published store format read by the
/// web front end. Fields this crate does not model are kept in `extra` so an
/// existing item survives a load/save cycle unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub category: String,
    /// Always set on items this pipeline generates; older stored items may
    /// lack it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline_es: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline_en: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_es: Option<String>,
    #[serde(rename = "body_es", default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_en: Option<String>,
    /// Copied from the originating [`CandidateRecord::identifier`].
    #[serde(rename = "source_url", default)]
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(rename = "key_vocabulary", default)]
    pub vocabulary: Vec<VocabularyEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl ContentItem {
    pub fn has_identifier(&self) -> bool {
        !self.identifier.trim().is_empty()
    }

    pub fn difficulty_label(&self) -> &'static str {
        self.difficulty.map_or("unrated", |d| d.as_str())
    }

    pub fn display_headline(&self) -> &str {
        self.headline_es
            .as_deref()
            .or(self.headline_en.as_deref())
            .unwrap_or(self.id.as_str())
    }
}

/// Durable, newest-first collection of content items.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AccumulationStore {
    pub items: Vec<ContentItem>,
    pub total_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AccumulationStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Non-empty identifiers of every stored item.
    pub fn known_identifiers(&self) -> HashSet<String> {
        self.items
            .iter()
            .filter(|item| item.has_identifier())
            .map(|item| item.identifier.clone())
            .collect()
    }

    pub fn known_ids(&self) -> HashSet<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }
}

/// Descriptive fields written alongside the items in the store document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    pub description: String,
    pub content_type: Option<String>,
    pub generated_by: String,
}

/// On-disk representation of the accumulation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "total_stories", default)]
    pub total_count: usize,
    #[serde(default)]
    pub new_today: usize,
    #[serde(rename = "stories", default)]
    pub items: Vec<ContentItem>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
}

impl StoreDocument {
    pub fn from_store(store: AccumulationStore, new_today: usize, meta: &StoreMetadata) -> Self {
        let generated_at = store.last_updated;
        Self {
            date: generated_at.map(|ts| ts.format("%Y-%m-%d").to_string()),
            generated_at,
            description: meta.description.clone(),
            content_type: meta.content_type.clone(),
            total_count: store.items.len(),
            new_today,
            items: store.items,
            last_updated: store.last_updated,
            generated_by: Some(meta.generated_by.clone()),
        }
    }

    /// The item count is recomputed rather than trusted from the file.
    pub fn into_store(self) -> AccumulationStore {
        AccumulationStore {
            total_count: self.items.len(),
            items: self.items,
            last_updated: self.last_updated,
        }
    }
}
