//! Generation prompt assembly.

use std::fmt::Write as _;

use chrono::NaiveDate;

use crate::config::PipelineConfig;
use crate::dedup::CandidatesByCategory;

const DEFAULT_PREAMBLE: &str = "You are a medical Spanish educator writing short news stories for \
healthcare professionals learning Spanish. For each category below, pick the best news item \
and adapt it into an original story in clear, natural Spanish at the requested CEFR level.";

/// Build the single prompt covering every category that has candidates,
/// in configuration order.
pub fn build_generation_prompt(
    config: &PipelineConfig,
    candidates: &CandidatesByCategory,
    date: NaiveDate,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(config.prompt_preamble.as_deref().unwrap_or(DEFAULT_PREAMBLE).trim());
    prompt.push_str("\n\n");
    let _ = writeln!(prompt, "Date: {}", date.format("%Y-%m-%d"));
    prompt.push_str("\nNEWS ITEMS:\n");

    for category in &config.categories {
        let Some(list) = candidates.get(&category.name) else {
            continue;
        };
        let level = config
            .difficulty_for(&category.name)
            .map(|d| d.as_str())
            .unwrap_or("B1");
        let _ = writeln!(prompt, "\n## {} (level {level})", category.name);
        for (n, candidate) in list.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}", n + 1, candidate.title);
            if !candidate.description.is_empty() {
                let _ = writeln!(prompt, "   Summary: {}", candidate.description);
            }
            let _ = writeln!(prompt, "   Source: {}", candidate.source);
            let _ = writeln!(prompt, "   source_url: {}", candidate.identifier);
        }
    }

    let _ = write!(
        prompt,
        r#"
Write ONE story per category listed above. Respond with JSON only, no commentary, in this shape:
{{"stories": [
  {{
    "category": "<category name exactly as listed above>",
    "difficulty": "<A2|B1|B2>",
    "headline_es": "<Spanish headline>",
    "headline_en": "<English headline>",
    "summary_es": "<one-sentence Spanish summary>",
    "body_es": "<Spanish story>",
    "body_en": "<English translation>",
    "source_url": "<source_url of the news item, copied exactly>",
    "key_vocabulary": [
      {{"word": "<Spanish term>", "definition_es": "<Spanish definition>", "definition_en": "<English meaning>"}}
    ]
  }}
]}}

Each story must have exactly {count} key_vocabulary entries.
"#,
        count = config.vocabulary_size
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use noticias_core::CandidateRecord;

    fn config() -> PipelineConfig {
        PipelineConfig::from_yaml_str(
            r#"
categories:
  - {name: Chronic Wounds, slug: chronic-wounds, query: chronic+wound}
  - {name: Burn Care, slug: burn-care, query: burn+wound}
difficulty_by_category:
  Chronic Wounds: A2
  Burn Care: B1
vocabulary_size: 5
"#,
        )
        .expect("config")
    }

    #[test]
    fn prompt_lists_only_categories_with_candidates() {
        let mut candidates = CandidatesByCategory::new();
        candidates.insert(
            "Burn Care".into(),
            vec![CandidateRecord {
                title: "Skin graft advance".into(),
                description: "Graft heals faster".into(),
                source: "Medical News".into(),
                identifier: "https://n.test/graft".into(),
            }],
        );
        let date = NaiveDate::from_ymd_opt(2026, 3, 4).expect("date");

        let prompt = build_generation_prompt(&config(), &candidates, date);
        assert!(prompt.contains("Date: 2026-03-04"));
        assert!(prompt.contains("## Burn Care (level B1)"));
        assert!(!prompt.contains("Chronic Wounds"));
        assert!(prompt.contains("source_url: https://n.test/graft"));
        assert!(prompt.contains("exactly 5 key_vocabulary entries"));
    }

    #[test]
    fn custom_preamble_replaces_default() {
        let mut config = config();
        config.prompt_preamble = Some("Write for nurses.".into());
        let date = NaiveDate::from_ymd_opt(2026, 3, 4).expect("date");
        let prompt = build_generation_prompt(&config, &CandidatesByCategory::new(), date);
        assert!(prompt.starts_with("Write for nurses."));
    }
}
