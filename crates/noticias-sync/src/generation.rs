//! Bounded-retry generation and per-item validation of generated output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use noticias_adapters::GenerativeBackend;
use noticias_core::{CategoryConfig, ContentItem, Difficulty, VocabularyEntry};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::repair::{extract_payload, repair_truncated};

/// Result of a single generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(Vec<Value>),
    ParseFailed(String),
    BackendFailed(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation failed after {attempts} attempts: {last_failure}")]
    Exhausted { attempts: u32, last_failure: String },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_output_tokens: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_generation_attempts.max(1),
            backoff: config.retry_backoff(),
            max_output_tokens: config.max_output_tokens,
        }
    }
}

/// Unvalidated items from the first attempt that parsed.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub items: Vec<Value>,
    pub attempts: u32,
}

/// Validated output of a generation run.
#[derive(Debug, Clone)]
pub struct GeneratedBatch {
    pub items: Vec<ContentItem>,
    pub rejected: Vec<Rejection>,
    pub attempts: u32,
}

pub struct GenerationDriver {
    backend: Arc<dyn GenerativeBackend>,
    policy: RetryPolicy,
}

impl GenerationDriver {
    pub fn new(backend: Arc<dyn GenerativeBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub async fn attempt(&self, prompt: &str) -> AttemptOutcome {
        match self.backend.complete(prompt, self.policy.max_output_tokens).await {
            Ok(completion) => {
                if completion.is_truncated() {
                    warn!(
                        max_tokens = self.policy.max_output_tokens,
                        "completion hit the output bound; attempting repair"
                    );
                }
                parse_completion(&completion.text)
            }
            Err(err) => AttemptOutcome::BackendFailed(err.to_string()),
        }
    }

    /// Sample until one attempt parses, waiting `backoff` between attempts.
    /// Backend errors and unparseable output count against the same budget.
    pub async fn generate(&self, prompt: &str) -> Result<RawBatch, GenerationError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(prompt).await {
                AttemptOutcome::Success(items) => {
                    info!(attempt, items = items.len(), "generation attempt parsed");
                    return Ok(RawBatch {
                        items,
                        attempts: attempt,
                    });
                }
                AttemptOutcome::ParseFailed(reason) | AttemptOutcome::BackendFailed(reason) => {
                    warn!(attempt, max_attempts, %reason, "generation attempt failed");
                    last_failure = reason;
                }
            }
            if attempt < max_attempts && !self.policy.backoff.is_zero() {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        error!(attempts = max_attempts, %last_failure, "generation attempts exhausted");
        Err(GenerationError::Exhausted {
            attempts: max_attempts,
            last_failure,
        })
    }

    /// [`generate`](Self::generate) followed by per-item validation. A batch
    /// where every item is rejected is still `Ok`; only parsing is retried.
    pub async fn generate_items(
        &self,
        prompt: &str,
        rules: &ValidationRules,
    ) -> Result<GeneratedBatch, GenerationError> {
        let raw = self.generate(prompt).await?;
        let validated = validate_batch(raw.items, rules);
        Ok(GeneratedBatch {
            items: validated.items,
            rejected: validated.rejected,
            attempts: raw.attempts,
        })
    }
}

/// Extract, repair and parse one completion into a list of raw items.
/// Accepts `{"stories": [...]}`, `{"items": [...]}` or a bare array.
pub fn parse_completion(text: &str) -> AttemptOutcome {
    let repaired = repair_truncated(extract_payload(text));
    let value: Value = match serde_json::from_str(&repaired) {
        Ok(value) => value,
        Err(err) => return AttemptOutcome::ParseFailed(format!("unparseable output: {err}")),
    };
    match value {
        Value::Array(items) => AttemptOutcome::Success(items),
        Value::Object(mut map) => match map.remove("stories").or_else(|| map.remove("items")) {
            Some(Value::Array(items)) => AttemptOutcome::Success(items),
            _ => AttemptOutcome::ParseFailed("output has no stories array".into()),
        },
        _ => AttemptOutcome::ParseFailed("output is not an object or array".into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("item is not an object")]
    NotAnObject,
    #[error("missing source_url")]
    MissingIdentifier,
    #[error("source_url {0} was not offered to the generator")]
    UnknownIdentifier(String),
    #[error("source_url {0} appears more than once in the batch")]
    DuplicateIdentifier(String),
    #[error("missing body_es")]
    MissingBody,
    #[error("unknown category {0:?}")]
    UnknownCategory(String),
    #[error("source_url {identifier} was offered under {offered_under}, not {category}")]
    CategoryMismatch {
        identifier: String,
        offered_under: String,
        category: String,
    },
    #[error("difficulty {0} is not one of A2, B1, B2")]
    InvalidDifficulty(String),
    #[error("expected {expected} vocabulary entries, found {actual}")]
    VocabularySize { expected: usize, actual: usize },
    #[error("vocabulary entry {0} is incomplete")]
    IncompleteVocabulary(usize),
    #[error("malformed item: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub index: usize,
    pub identifier: Option<String>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub categories: Vec<CategoryConfig>,
    pub difficulty_by_category: BTreeMap<String, Difficulty>,
    pub vocabulary_size: usize,
    /// Offered identifier to the category name it was offered under.
    pub offered_identifiers: HashMap<String, String>,
    pub run_date: NaiveDate,
    /// Ids already present in the store; new ids are suffixed to avoid them.
    pub existing_ids: HashSet<String>,
}

impl ValidationRules {
    pub fn from_config(
        config: &PipelineConfig,
        offered_identifiers: HashMap<String, String>,
        run_date: NaiveDate,
        existing_ids: HashSet<String>,
    ) -> Self {
        Self {
            categories: config.categories.clone(),
            difficulty_by_category: config.difficulty_by_category.clone(),
            vocabulary_size: config.vocabulary_size,
            offered_identifiers,
            run_date,
            existing_ids,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatedBatch {
    pub items: Vec<ContentItem>,
    pub rejected: Vec<Rejection>,
}

/// Validate and normalize each raw item independently. One bad item never
/// rejects its siblings.
pub fn validate_batch(raw: Vec<Value>, rules: &ValidationRules) -> ValidatedBatch {
    let mut batch = ValidatedBatch::default();
    let mut accepted_identifiers: HashSet<String> = HashSet::new();
    let mut taken_ids = rules.existing_ids.clone();

    for (index, value) in raw.into_iter().enumerate() {
        let identifier = value.as_object().and_then(|map| string_field(map, "source_url"));
        match validate_item(value, rules, &accepted_identifiers) {
            Ok((mut item, category)) => {
                item.id = next_item_id(&category.slug, rules.run_date, &mut taken_ids);
                accepted_identifiers.insert(item.identifier.clone());
                batch.items.push(item);
            }
            Err(reason) => {
                warn!(index, identifier = identifier.as_deref().unwrap_or(""), %reason, "discarding generated item");
                batch.rejected.push(Rejection {
                    index,
                    identifier,
                    reason,
                });
            }
        }
    }
    batch
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn validate_item<'r>(
    value: Value,
    rules: &'r ValidationRules,
    accepted_identifiers: &HashSet<String>,
) -> Result<(ContentItem, &'r CategoryConfig), RejectReason> {
    let Value::Object(mut map) = value else {
        return Err(RejectReason::NotAnObject);
    };
    let identifier = string_field(&map, "source_url").ok_or(RejectReason::MissingIdentifier)?;
    let Some(offered_under) = rules.offered_identifiers.get(&identifier) else {
        return Err(RejectReason::UnknownIdentifier(identifier));
    };
    if accepted_identifiers.contains(&identifier) {
        return Err(RejectReason::DuplicateIdentifier(identifier));
    }
    if string_field(&map, "body_es").is_none() {
        return Err(RejectReason::MissingBody);
    }

    let label = map
        .get("category")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let category = rules
        .categories
        .iter()
        .find(|c| c.matches(&label))
        .ok_or(RejectReason::UnknownCategory(label))?;
    if category.name != *offered_under {
        return Err(RejectReason::CategoryMismatch {
            identifier,
            offered_under: offered_under.clone(),
            category: category.name.clone(),
        });
    }

    let configured = rules.difficulty_by_category.get(&category.name).copied();
    let difficulty = match map.get("difficulty") {
        None | Some(Value::Null) => configured,
        Some(Value::String(s)) if s.trim().is_empty() => configured,
        Some(Value::String(s)) => Some(
            s.parse::<Difficulty>()
                .map_err(|_| RejectReason::InvalidDifficulty(s.clone()))?,
        ),
        Some(other) => return Err(RejectReason::InvalidDifficulty(other.to_string())),
    }
    .ok_or_else(|| RejectReason::InvalidDifficulty(String::from("missing")))?;

    let entries = match map.get("key_vocabulary") {
        Some(Value::Array(entries)) => entries.as_slice(),
        Some(Value::Null) | None => &[],
        Some(_) => return Err(RejectReason::Malformed("key_vocabulary is not a list".into())),
    };
    if entries.len() != rules.vocabulary_size {
        return Err(RejectReason::VocabularySize {
            expected: rules.vocabulary_size,
            actual: entries.len(),
        });
    }
    for (idx, entry) in entries.iter().enumerate() {
        let complete = serde_json::from_value::<VocabularyEntry>(entry.clone())
            .map(|entry| entry.is_complete())
            .unwrap_or(false);
        if !complete {
            return Err(RejectReason::IncompleteVocabulary(idx));
        }
    }

    normalize_fields(&mut map, category, difficulty, identifier);
    let item: ContentItem = serde_json::from_value(Value::Object(map))
        .map_err(|e| RejectReason::Malformed(e.to_string()))?;
    Ok((item, category))
}

/// Rewrite the pipeline-owned fields; `id`, `added_at` and `audio_url` are
/// assigned later in the run.
fn normalize_fields(
    map: &mut Map<String, Value>,
    category: &CategoryConfig,
    difficulty: Difficulty,
    identifier: String,
) {
    map.insert("category".into(), Value::String(category.name.clone()));
    map.insert("difficulty".into(), Value::String(difficulty.as_str().into()));
    map.insert("source_url".into(), Value::String(identifier));
    map.remove("id");
    map.remove("added_at");
    map.remove("audio_url");

    for (key, fallback) in [("emoji", &category.emoji), ("gradient", &category.gradient)] {
        let missing = map
            .get(key)
            .and_then(Value::as_str)
            .map_or(true, |s| s.trim().is_empty());
        if missing {
            match fallback {
                Some(value) => {
                    map.insert(key.into(), Value::String(value.clone()));
                }
                None => {
                    map.remove(key);
                }
            }
        }
    }
}

/// `<slug>-<YYYYMMDD>`, suffixed `-2`, `-3`, ... when already taken.
pub fn next_item_id(slug: &str, date: NaiveDate, taken: &mut HashSet<String>) -> String {
    let base = format!("{slug}-{}", date.format("%Y%m%d"));
    if taken.insert(base.clone()) {
        return base;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{base}-{n}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{generated_item, pipeline_config, stories_payload, vocabulary, ScriptedBackend};
    use noticias_adapters::BackendError;
    use serde_json::json;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::ZERO,
            max_output_tokens: 1_000,
        }
    }

    fn rules(offered: &[&str]) -> ValidationRules {
        rules_in("Burn Care", offered)
    }

    fn rules_in(category: &str, offered: &[&str]) -> ValidationRules {
        ValidationRules::from_config(
            &pipeline_config(),
            offered
                .iter()
                .map(|s| (s.to_string(), category.to_string()))
                .collect(),
            NaiveDate::from_ymd_opt(2026, 2, 14).expect("date"),
            HashSet::new(),
        )
    }

    #[test]
    fn payload_shapes_are_accepted() {
        assert_eq!(parse_completion("[]"), AttemptOutcome::Success(vec![]));
        assert_eq!(
            parse_completion(r#"{"items": [{"a": 1}]}"#),
            AttemptOutcome::Success(vec![json!({"a": 1})])
        );
        assert!(matches!(
            parse_completion("```json\n{\"stories\": [{\"a\": 1}, {\"b\": 2\n"),
            AttemptOutcome::Success(items) if items.len() == 2
        ));
        assert!(matches!(parse_completion(r#"{"other": []}"#), AttemptOutcome::ParseFailed(_)));
        assert!(matches!(parse_completion("I cannot help"), AttemptOutcome::ParseFailed(_)));
        assert_eq!(
            parse_completion("Here are the [2] stories you asked for:\n{\"stories\": []}"),
            AttemptOutcome::Success(vec![])
        );
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_two_unrepairable_outputs() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .then_truncated(r#"{"stories": [{"categ"#)
                .then_truncated(r#"{"stories": [{"body_es": "x", "sou"#)
                .then_text(stories_payload(&[generated_item("Burn Care", "https://n.test/a")])),
        );
        let driver = GenerationDriver::new(backend.clone(), policy(3));

        let batch = driver.generate("prompt").await.expect("third attempt parses");
        assert_eq!(batch.attempts, 3);
        assert_eq!(batch.items.len(), 1);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempts_and_last_failure() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .then_error(BackendError::RateLimited)
                .then_text("not json at all")
                .then_error(BackendError::Timeout),
        );
        let driver = GenerationDriver::new(backend.clone(), policy(3));

        match driver.generate("prompt").await {
            Err(GenerationError::Exhausted { attempts, last_failure }) => {
                assert_eq!(attempts, 3);
                assert!(last_failure.contains("timed out"));
            }
            Ok(batch) => panic!("expected exhaustion, got {batch:?}"),
        }
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn partially_valid_batch_is_not_retried() {
        let mut bad = generated_item("Burn Care", "https://n.test/b");
        bad["key_vocabulary"] = vocabulary(0);
        let backend = Arc::new(ScriptedBackend::new().then_text(stories_payload(&[
            generated_item("Burn Care", "https://n.test/a"),
            bad,
        ])));
        let driver = GenerationDriver::new(backend.clone(), policy(3));

        let batch = driver
            .generate_items("p", &rules(&["https://n.test/a", "https://n.test/b"]))
            .await
            .expect("generate");
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.attempts, 1);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn success_on_first_attempt_makes_one_call() {
        let backend = Arc::new(ScriptedBackend::new().then_text("[]").then_text("[]"));
        let driver = GenerationDriver::new(backend.clone(), policy(3));
        assert_eq!(driver.generate("p").await.expect("ok").attempts, 1);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn backoff_separates_attempts() {
        let backend = Arc::new(ScriptedBackend::new().then_text("x").then_text("[]"));
        let driver = GenerationDriver::new(
            backend,
            RetryPolicy {
                backoff: Duration::from_millis(30),
                ..policy(2)
            },
        );
        let started = std::time::Instant::now();
        driver.generate("p").await.expect("second attempt parses");
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn valid_items_are_normalized() {
        let mut raw = generated_item("burn-care", "https://n.test/a");
        raw["difficulty"] = json!("b2");
        raw["id"] = json!("model-chosen");
        raw["audio_url"] = json!("");
        raw["reading_time"] = json!(3);

        let batch = validate_batch(vec![raw], &rules(&["https://n.test/a"]));
        assert!(batch.rejected.is_empty());
        let item = &batch.items[0];
        assert_eq!(item.id, "burn-care-20260214");
        assert_eq!(item.category, "Burn Care");
        assert_eq!(item.difficulty, Some(Difficulty::B2));
        assert_eq!(item.emoji.as_deref(), Some("🔥"));
        assert_eq!(item.audio_url, None);
        assert_eq!(item.added_at, None);
        assert_eq!(item.extra.get("reading_time"), Some(&json!(3)));
    }

    #[test]
    fn missing_difficulty_uses_category_default() {
        let batch = validate_batch(
            vec![generated_item("Pressure Ulcers", "https://n.test/p")],
            &rules_in("Pressure Ulcers", &["https://n.test/p"]),
        );
        assert_eq!(batch.items[0].difficulty, Some(Difficulty::A2));
    }

    #[test]
    fn invalid_items_are_discarded_individually() {
        let offered = [
            "https://n.test/ok",
            "https://n.test/no-body",
            "https://n.test/bad-level",
            "https://n.test/short-vocab",
            "https://n.test/bad-category",
            "https://n.test/blank-word",
        ];
        let mut no_body = generated_item("Burn Care", offered[1]);
        no_body["body_es"] = json!("  ");
        let mut bad_level = generated_item("Burn Care", offered[2]);
        bad_level["difficulty"] = json!("C1");
        let mut short_vocab = generated_item("Burn Care", offered[3]);
        short_vocab["key_vocabulary"] = vocabulary(1);
        let bad_category = generated_item("Oncology", offered[4]);
        let mut blank_word = generated_item("Burn Care", offered[5]);
        blank_word["key_vocabulary"][1]["word"] = json!("");

        let raw = vec![
            json!("not an object"),
            generated_item("Burn Care", offered[0]),
            no_body,
            bad_level,
            short_vocab,
            bad_category,
            blank_word,
            generated_item("Burn Care", "https://elsewhere.test/invented"),
            generated_item("Diabetic Foot", offered[0]),
        ];
        let batch = validate_batch(raw, &rules(&offered));

        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].identifier, offered[0]);
        let reasons: Vec<_> = batch.rejected.iter().map(|r| r.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                RejectReason::NotAnObject,
                RejectReason::MissingBody,
                RejectReason::InvalidDifficulty("C1".into()),
                RejectReason::VocabularySize { expected: 2, actual: 1 },
                RejectReason::UnknownCategory("Oncology".into()),
                RejectReason::IncompleteVocabulary(1),
                RejectReason::UnknownIdentifier("https://elsewhere.test/invented".into()),
                RejectReason::DuplicateIdentifier(offered[0].into()),
            ]
        );
        assert_eq!(batch.rejected[0].index, 0);
    }

    #[test]
    fn item_filed_under_another_category_is_rejected() {
        let mut rules = rules(&["https://n.test/burn"]);
        rules
            .offered_identifiers
            .insert("https://n.test/foot".into(), "Diabetic Foot".into());

        let batch = validate_batch(
            vec![
                generated_item("Diabetic Foot", "https://n.test/burn"),
                generated_item("diabetic-foot", "https://n.test/foot"),
            ],
            &rules,
        );
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].category, "Diabetic Foot");
        assert_eq!(
            batch.rejected[0].reason,
            RejectReason::CategoryMismatch {
                identifier: "https://n.test/burn".into(),
                offered_under: "Burn Care".into(),
                category: "Diabetic Foot".into(),
            }
        );
    }

    #[test]
    fn ids_are_suffixed_when_taken() {
        let offered = ["https://n.test/1", "https://n.test/2", "https://n.test/3"];
        let mut rules = rules(&offered);
        rules.existing_ids.insert("burn-care-20260214".into());

        let raw = offered.iter().map(|id| generated_item("Burn Care", id)).collect();
        let batch = validate_batch(raw, &rules);
        let ids: Vec<_> = batch.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["burn-care-20260214-2", "burn-care-20260214-3", "burn-care-20260214-4"]
        );
    }
}
