//! External collaborator contracts + implementations: news feeds, the
//! generative backend, speech synthesis, and lesson rendering.

pub mod backend;
pub mod feed;
pub mod render;
pub mod speech;

use chrono::{DateTime, Utc};
use noticias_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use backend::{AnthropicBackend, AnthropicConfig, BackendError, Completion, GenerativeBackend, StopReason};
pub use feed::{parse_rss_items, FeedSource, FixtureFeed, GoogleNewsRss, GoogleNewsRssConfig};
pub use render::{DocumentRenderer, MarkdownLessonRenderer};
pub use speech::{OpenAiSpeech, OpenAiSpeechConfig, SpeechSynthesizer};

pub const CRATE_NAME: &str = "noticias-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, fetched_at: DateTime<Utc>) -> Self {
        Self { run_id, fetched_at }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}
