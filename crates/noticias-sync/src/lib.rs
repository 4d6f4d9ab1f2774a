//! Content pipeline orchestration: load store, fetch candidates, dedupe,
//! generate, validate, enrich, merge and persist.

pub mod config;
pub mod dedup;
pub mod enrichment;
pub mod generation;
pub mod merge;
pub mod prompt;
pub mod repair;
#[cfg(test)]
mod testing;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use noticias_adapters::{
    AdapterContext, AnthropicBackend, AnthropicConfig, DocumentRenderer, FeedSource, FixtureFeed,
    GenerativeBackend, GoogleNewsRss, GoogleNewsRssConfig, MarkdownLessonRenderer, OpenAiSpeech,
    OpenAiSpeechConfig,
};
use noticias_core::{CandidateRecord, ContentItem, StoreDocument};
use noticias_storage::{write_atomic, HttpClientConfig, HttpFetcher, StoreFile};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ConfigError, FeedMode, PipelineConfig, SyncConfig};
pub use dedup::{dedupe, CandidatesByCategory};
pub use enrichment::{AudioEnrichmentHook, EnrichmentHook, NoopEnrichmentHook};
pub use generation::{
    AttemptOutcome, GeneratedBatch, GenerationDriver, GenerationError, RejectReason, RetryPolicy,
    ValidationRules,
};
pub use merge::{merge, MergeOutcome};
pub use repair::{extract_payload, repair_truncated};

pub const CRATE_NAME: &str = "noticias-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    LoadStore,
    FetchCandidates,
    Generate,
    ValidateAndFilter,
    Enrich,
    Merge,
    Persist,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LoadStore => "load_store",
            Self::FetchCandidates => "fetch_candidates",
            Self::Generate => "generate",
            Self::ValidateAndFilter => "validate_and_filter",
            Self::Enrich => "enrich",
            Self::Merge => "merge",
            Self::Persist => "persist",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub categories_with_candidates: usize,
    pub generation_attempts: u32,
    pub new_items: usize,
    pub discarded_items: usize,
    pub total_items: usize,
    pub store_path: String,
    pub store_sha256: String,
    pub lesson_path: Option<String>,
}

/// How a run that did not fail ended. Only `Persisted` writes the store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    NoNewCandidates {
        run_id: Uuid,
    },
    NoValidItems {
        run_id: Uuid,
        attempts: u32,
        discarded: usize,
    },
    Persisted(RunSummary),
}

impl RunOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::NoNewCandidates { run_id } | Self::NoValidItems { run_id, .. } => *run_id,
            Self::Persisted(summary) => summary.run_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NoNewCandidates { .. } => "no_new_candidates",
            Self::NoValidItems { .. } => "no_valid_items",
            Self::Persisted(_) => "persisted",
        }
    }
}

pub struct ContentPipeline {
    config: PipelineConfig,
    store: StoreFile,
    feed: Arc<dyn FeedSource>,
    generator: GenerationDriver,
    enrichment: Box<dyn EnrichmentHook>,
    renderer: Option<Box<dyn DocumentRenderer>>,
}

impl ContentPipeline {
    pub fn new(
        config: PipelineConfig,
        feed: Arc<dyn FeedSource>,
        backend: Arc<dyn GenerativeBackend>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = StoreFile::new(config.store_location.clone());
        let generator = GenerationDriver::new(backend, RetryPolicy::from_config(&config));
        Ok(Self {
            config,
            store,
            feed,
            generator,
            enrichment: Box::<NoopEnrichmentHook>::default(),
            renderer: None,
        })
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn with_renderer(mut self, renderer: Box<dyn DocumentRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store_path(&self) -> &Path {
        self.store.path()
    }

    pub async fn run_once(&self) -> Result<RunOutcome> {
        self.run_at(Utc::now()).await
    }

    /// Execute one run with `now` as the merge timestamp and run date.
    ///
    /// Any `Err` leaves the store file byte-for-byte as it was, as do the
    /// `NoNewCandidates` and `NoValidItems` outcomes.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, model = %self.generator.model_id());
        self.run_stages(run_id, now).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let run_date = now.date_naive();

        let mut stage = PipelineStage::LoadStore;
        let existing = self
            .store
            .load()
            .await
            .with_context(|| format!("{stage}: store at {} is unreadable", self.store.path().display()))?
            .map(StoreDocument::into_store)
            .unwrap_or_default();
        info!(%stage, items = existing.items.len(), path = %self.store.path().display(), "store loaded");

        stage = PipelineStage::FetchCandidates;
        let raw = self.fetch_all(run_id, now).await;
        let known = existing.known_identifiers();
        let candidates = dedupe(&self.config.categories, &raw, &known, self.config.per_category_cap);
        let candidate_total = dedup::candidate_count(&candidates);
        info!(
            %stage,
            fetched = raw.values().map(Vec::len).sum::<usize>(),
            known = known.len(),
            candidates = candidate_total,
            categories = candidates.len(),
            "candidates deduplicated"
        );
        if candidates.is_empty() {
            info!("no new candidates; store left untouched");
            return Ok(RunOutcome::NoNewCandidates { run_id });
        }

        stage = PipelineStage::Generate;
        let prompt = prompt::build_generation_prompt(&self.config, &candidates, run_date);
        let rules = ValidationRules::from_config(
            &self.config,
            dedup::offered_identifiers(&candidates),
            run_date,
            existing.known_ids(),
        );
        let generated = self
            .generator
            .generate_items(&prompt, &rules)
            .await
            .with_context(|| format!("{stage}: no usable output"))?;

        stage = PipelineStage::ValidateAndFilter;
        let discarded = generated.rejected.len();
        info!(%stage, accepted = generated.items.len(), discarded, "generated items validated");
        if generated.items.is_empty() {
            warn!(attempts = generated.attempts, discarded, "no valid items; store left untouched");
            return Ok(RunOutcome::NoValidItems {
                run_id,
                attempts: generated.attempts,
                discarded,
            });
        }

        stage = PipelineStage::Enrich;
        let items = self.enrichment.apply(run_date, generated.items).await;
        debug!(%stage, with_audio = items.iter().filter(|i| i.audio_url.is_some()).count(), "enrichment finished");

        stage = PipelineStage::Merge;
        let merged = merge(existing, items, now);
        for identifier in &merged.dropped {
            warn!(%stage, %identifier, "dropping generated item whose identifier is already stored");
        }
        if merged.added == 0 {
            return Ok(RunOutcome::NoValidItems {
                run_id,
                attempts: generated.attempts,
                discarded: discarded + merged.dropped.len(),
            });
        }

        stage = PipelineStage::Persist;
        let doc = StoreDocument::from_store(merged.store, merged.added, &self.config.store_metadata());
        let store_sha256 = self
            .store
            .save(&doc)
            .await
            .with_context(|| format!("{stage}: writing {}", self.store.path().display()))?;
        info!(%stage, new_items = merged.added, total = doc.total_count, sha256 = %store_sha256, "store persisted");

        let lesson_path = self.render_lesson(run_date, &doc.items[..merged.added]).await;

        Ok(RunOutcome::Persisted(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            candidates: candidate_total,
            categories_with_candidates: candidates.len(),
            generation_attempts: generated.attempts,
            new_items: merged.added,
            discarded_items: discarded + merged.dropped.len(),
            total_items: doc.total_count,
            store_path: self.store.path().display().to_string(),
            store_sha256,
            lesson_path,
        }))
    }

    /// Query every category concurrently. A failing category contributes
    /// nothing and is logged; it never fails the run.
    async fn fetch_all(&self, run_id: Uuid, now: DateTime<Utc>) -> HashMap<String, Vec<CandidateRecord>> {
        let ctx = AdapterContext::new(run_id, now);
        let fetches = self.config.categories.iter().map(|category| {
            let ctx = &ctx;
            async move { (category, self.feed.fetch_candidates(ctx, category).await) }
        });

        let mut out = HashMap::new();
        for (category, result) in join_all(fetches).await {
            match result {
                Ok(list) => {
                    debug!(category = %category.name, fetched = list.len(), source = self.feed.source_id(), "feed fetched");
                    out.insert(category.name.clone(), list);
                }
                Err(err) => {
                    warn!(category = %category.name, error = %err, "feed fetch failed; continuing without this category");
                }
            }
        }
        out
    }

    async fn render_lesson(&self, date: NaiveDate, items: &[ContentItem]) -> Option<String> {
        let (Some(renderer), Some(reports_dir)) = (&self.renderer, &self.config.reports_dir) else {
            return None;
        };
        let path = reports_dir
            .join(date.format("%Y-%m-%d").to_string())
            .join(renderer.file_name());
        let text = match renderer.render(date, items) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "lesson rendering failed");
                return None;
            }
        };
        match write_atomic(&path, text.as_bytes()).await {
            Ok(()) => Some(path.display().to_string()),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "writing lesson failed");
                None
            }
        }
    }
}

/// Run the pipeline unless a previous run holding `gate` is still going.
/// Returns `None` when the trigger was skipped.
pub async fn run_if_idle(pipeline: &ContentPipeline, gate: &Mutex<()>) -> Option<Result<RunOutcome>> {
    let Ok(_running) = gate.try_lock() else {
        warn!("previous run still in progress; skipping this trigger");
        return None;
    };
    Some(pipeline.run_once().await)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<ContentPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        let gate = Arc::clone(&gate);
        Box::pin(async move {
            match run_if_idle(&pipeline, &gate).await {
                Some(Ok(outcome)) => {
                    info!(run_id = %outcome.run_id(), outcome = outcome.label(), "scheduled run finished")
                }
                Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                None => {}
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Wire the production collaborators described by `sync`.
pub fn build_pipeline(sync: &SyncConfig) -> Result<ContentPipeline> {
    let mut config = PipelineConfig::load(&sync.config_path)?.resolve_paths(&sync.workspace_root);
    if let Some(store) = &sync.store_override {
        config.store_location = store.clone();
    }

    let api_key = sync.require_anthropic_key()?;
    let backend = AnthropicBackend::new(AnthropicConfig::new(api_key, sync.anthropic_model.clone()))
        .context("configuring generative backend")?;

    let feed: Arc<dyn FeedSource> = match sync.feed_mode {
        FeedMode::Rss => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(sync.http_timeout_secs),
                user_agent: Some(sync.user_agent.clone()),
                ..Default::default()
            })?;
            Arc::new(GoogleNewsRss::new(
                http,
                GoogleNewsRssConfig {
                    window_days: config.feed_window_days,
                    scan_limit: config.feed_scan_limit,
                    ..Default::default()
                },
            ))
        }
        FeedMode::Fixture => Arc::new(FixtureFeed::new(sync.fixtures_dir.clone())),
    };

    let audio_dir = config.audio_dir.clone();
    let audio_base_url = config.audio_public_base_url.clone();
    let render_lessons = config.reports_dir.is_some();
    let mut pipeline = ContentPipeline::new(config, feed, Arc::new(backend))?;

    match (&sync.openai_api_key, audio_base_url) {
        (Some(key), Some(base_url)) => {
            let mut speech_config = OpenAiSpeechConfig::new(key.clone());
            if let Some(model) = &sync.tts_model {
                speech_config.model = model.clone();
            }
            let speech = OpenAiSpeech::new(speech_config).context("configuring speech synthesis")?;
            pipeline = pipeline.with_enrichment(Box::new(AudioEnrichmentHook::new(
                Arc::new(speech),
                audio_dir,
                base_url,
            )));
        }
        (None, Some(_)) => warn!("OPENAI_API_KEY not set; audio enrichment disabled"),
        (_, None) => debug!("audio_public_base_url not configured; audio enrichment disabled"),
    }
    if render_lessons {
        pipeline = pipeline.with_renderer(Box::new(MarkdownLessonRenderer::default()));
    }
    Ok(pipeline)
}

pub async fn run_sync_once_from_env() -> Result<RunOutcome> {
    let config = SyncConfig::from_env();
    let pipeline = build_pipeline(&config)?;
    pipeline.run_once().await
}

/// Run on the configured cron schedule until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(build_pipeline(&config)?);
    let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
        bail!("scheduler disabled; set NOTICIAS_SCHEDULER_ENABLED=1 to enable it");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

pub fn report_store_markdown(doc: &StoreDocument, newest: usize) -> String {
    let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_difficulty: BTreeMap<&str, usize> = BTreeMap::new();
    for item in &doc.items {
        *by_category.entry(item.category.as_str()).or_default() += 1;
        *by_difficulty.entry(item.difficulty_label()).or_default() += 1;
    }

    let mut lines = vec!["# Noticias Store Report".to_string(), String::new()];
    lines.push(format!("- total items: {}", doc.items.len()));
    lines.push(format!("- added in last run: {}", doc.new_today));
    lines.push(format!(
        "- last updated: {}",
        doc.last_updated
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    ));
    lines.push(String::new());

    lines.push("## By category".to_string());
    for (category, count) in &by_category {
        lines.push(format!("- {category}: {count}"));
    }
    lines.push(String::new());
    lines.push("## By difficulty".to_string());
    for (difficulty, count) in &by_difficulty {
        lines.push(format!("- {difficulty}: {count}"));
    }
    lines.push(String::new());

    lines.push(format!("## Newest {}", newest.min(doc.items.len())));
    for item in doc.items.iter().take(newest) {
        lines.push(format!(
            "- `{}` {} ({}, {})",
            item.id,
            item.display_headline(),
            item.category,
            item.difficulty_label()
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn report_from_env(newest: usize) -> Result<String> {
    let sync = SyncConfig::from_env();
    let config = PipelineConfig::load(&sync.config_path)?.resolve_paths(&sync.workspace_root);
    let path = sync.store_override.unwrap_or(config.store_location);
    let doc = StoreFile::new(&path)
        .load()
        .await?
        .with_context(|| format!("no store at {}", path.display()))?;
    Ok(report_store_markdown(&doc, newest))
}
