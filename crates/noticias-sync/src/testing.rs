//! In-process fakes for the pipeline's external collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use noticias_adapters::{
    AdapterContext, AdapterError, BackendError, Completion, FeedSource, GenerativeBackend,
    SpeechSynthesizer, StopReason,
};
use noticias_core::{CandidateRecord, CategoryConfig};
use serde_json::{json, Value};

use crate::config::PipelineConfig;

/// Replays queued responses in order; an empty queue is a network error.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Completion, BackendError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.push(Ok(Completion {
            text: text.into(),
            stop_reason: StopReason::EndTurn,
        }))
    }

    pub fn then_truncated(self, text: impl Into<String>) -> Self {
        self.push(Ok(Completion {
            text: text.into(),
            stop_reason: StopReason::MaxTokens,
        }))
    }

    pub fn then_error(self, err: BackendError) -> Self {
        self.push(Err(err))
    }

    fn push(self, entry: Result<Completion, BackendError>) -> Self {
        self.script.lock().expect("script lock").push_back(entry);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().expect("prompts lock").last().cloned()
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<Completion, BackendError> {
        self.prompts.lock().expect("prompts lock").push(prompt.to_string());
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Network("script exhausted".into())))
    }
}

/// Feed answering from a fixed map keyed by category name; listed
/// categories in `failing` return an error instead.
#[derive(Default)]
pub struct StaticFeed {
    pub by_category: HashMap<String, Vec<CandidateRecord>>,
    pub failing: Vec<String>,
}

impl StaticFeed {
    pub fn with(mut self, category: &str, identifiers: &[&str]) -> Self {
        let list = identifiers.iter().map(|id| candidate(id)).collect();
        self.by_category.insert(category.to_string(), list);
        self
    }

    pub fn failing(mut self, category: &str) -> Self {
        self.failing.push(category.to_string());
        self
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn fetch_candidates(
        &self,
        _ctx: &AdapterContext,
        category: &CategoryConfig,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        if self.failing.contains(&category.name) {
            return Err(AdapterError::Message(format!("{} feed unavailable", category.name)));
        }
        Ok(self.by_category.get(&category.name).cloned().unwrap_or_default())
    }
}

/// Synthesizer that fails for any text containing `fail_marker`.
pub struct FakeSpeech {
    pub fail_marker: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeSpeech {
    pub fn new(fail_marker: Option<&str>) -> Self {
        Self {
            fail_marker: fail_marker.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(AdapterError::Message("tts quota exceeded".into()));
            }
        }
        Ok(format!("mp3:{text}").into_bytes())
    }
}

pub fn candidate(identifier: &str) -> CandidateRecord {
    CandidateRecord {
        title: format!("Headline for {identifier}"),
        description: "Clinical update".into(),
        source: "Wound Journal".into(),
        identifier: identifier.to_string(),
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig::from_yaml_str(
        r#"
categories:
  - name: Burn Care
    slug: burn-care
    query: burn+wound
    emoji: "🔥"
  - name: Diabetic Foot
    slug: diabetic-foot
    query: diabetic+foot+ulcer
    emoji: "🦶"
  - name: Pressure Ulcers
    slug: pressure-ulcers
    query: pressure+ulcer
difficulty_by_category:
  Burn Care: B1
  Diabetic Foot: B1
  Pressure Ulcers: A2
vocabulary_size: 2
retry_backoff_ms: 0
"#,
    )
    .expect("test config")
}

pub fn vocabulary(n: usize) -> Value {
    Value::Array(
        (0..n)
            .map(|i| json!({"word": format!("palabra{i}"), "definition_es": "def", "definition_en": "meaning"}))
            .collect(),
    )
}

/// A generated item that passes validation under [`pipeline_config`].
pub fn generated_item(category: &str, identifier: &str) -> Value {
    json!({
        "category": category,
        "headline_es": format!("Titular {identifier}"),
        "headline_en": format!("Headline {identifier}"),
        "body_es": format!("Cuerpo de la historia {identifier}."),
        "body_en": "Story body.",
        "source_url": identifier,
        "key_vocabulary": vocabulary(2),
    })
}

pub fn stories_payload(items: &[Value]) -> String {
    json!({ "stories": items }).to_string()
}
