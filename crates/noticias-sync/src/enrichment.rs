use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use noticias_adapters::SpeechSynthesizer;
use noticias_core::ContentItem;
use noticias_storage::ArtifactStore;
use tracing::{debug, warn};

/// Post-validation enrichment. Failures are absorbed per item: an item that
/// cannot be enriched is returned as it came in, so enrichment never blocks
/// persistence.
#[async_trait]
pub trait EnrichmentHook: Send + Sync {
    async fn apply(&self, date: NaiveDate, items: Vec<ContentItem>) -> Vec<ContentItem>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

#[async_trait]
impl EnrichmentHook for NoopEnrichmentHook {
    async fn apply(&self, _date: NaiveDate, items: Vec<ContentItem>) -> Vec<ContentItem> {
        items
    }
}

/// Narrates each item's body and sets `audio_url`. Items are synthesized
/// concurrently.
pub struct AudioEnrichmentHook {
    speech: Arc<dyn SpeechSynthesizer>,
    artifacts: ArtifactStore,
    public_base_url: String,
}

impl AudioEnrichmentHook {
    pub fn new(
        speech: Arc<dyn SpeechSynthesizer>,
        audio_dir: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            speech,
            artifacts: ArtifactStore::new(audio_dir.into()),
            public_base_url: public_base_url.into(),
        }
    }

    async fn enrich_one(&self, date: NaiveDate, mut item: ContentItem) -> ContentItem {
        let day = date.format("%Y-%m-%d").to_string();
        let relative = format!("{day}/{}.mp3", item.id);

        let audio = match self.speech.synthesize(&item.body).await {
            Ok(audio) => audio,
            Err(err) => {
                warn!(item = %item.id, error = %err, "audio synthesis failed; leaving item without audio");
                return item;
            }
        };
        match self.artifacts.store_named(&relative, &audio).await {
            Ok(stored) => {
                debug!(item = %item.id, bytes = stored.byte_size, path = %stored.absolute_path.display(), "audio stored");
                item.audio_url = Some(format!(
                    "{}/{relative}",
                    self.public_base_url.trim_end_matches('/')
                ));
            }
            Err(err) => {
                warn!(item = %item.id, error = %err, "writing audio failed; leaving item without audio");
            }
        }
        item
    }
}

#[async_trait]
impl EnrichmentHook for AudioEnrichmentHook {
    async fn apply(&self, date: NaiveDate, items: Vec<ContentItem>) -> Vec<ContentItem> {
        join_all(items.into_iter().map(|item| self.enrich_one(date, item))).await
    }
}
