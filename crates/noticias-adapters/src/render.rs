//! Document rendering for validated items.

use chrono::NaiveDate;
use noticias_core::ContentItem;

use crate::AdapterError;

/// Turns a batch of validated items into a printable artifact. Receives a
/// shared slice, so it cannot alter the items it renders.
pub trait DocumentRenderer: Send + Sync {
    fn file_name(&self) -> &'static str;

    fn render(&self, date: NaiveDate, items: &[ContentItem]) -> Result<String, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct MarkdownLessonRenderer {
    pub title: String,
}

impl Default for MarkdownLessonRenderer {
    fn default() -> Self {
        Self {
            title: "Noticias del Día".to_string(),
        }
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

impl DocumentRenderer for MarkdownLessonRenderer {
    fn file_name(&self) -> &'static str {
        "lesson.md"
    }

    fn render(&self, date: NaiveDate, items: &[ContentItem]) -> Result<String, AdapterError> {
        if items.is_empty() {
            return Err(AdapterError::Message("nothing to render".into()));
        }

        let mut lines = vec![
            format!("# {} — {}", self.title, date.format("%Y-%m-%d")),
            String::new(),
            format!("{} new stories.", items.len()),
            String::new(),
            "## Vocabulario".to_string(),
            String::new(),
            "| Palabra | Definición | English |".to_string(),
            "| --- | --- | --- |".to_string(),
        ];
        for entry in items.iter().flat_map(|item| item.vocabulary.iter()) {
            lines.push(format!(
                "| {} | {} | {} |",
                escape_cell(&entry.term),
                escape_cell(&entry.definition_primary),
                escape_cell(&entry.definition_secondary)
            ));
        }

        for (n, item) in items.iter().enumerate() {
            lines.push(String::new());
            let emoji = item.emoji.as_deref().map(|e| format!("{e} ")).unwrap_or_default();
            lines.push(format!("## {}. {}{}", n + 1, emoji, item.display_headline()));
            lines.push(String::new());
            lines.push(format!("*{} · {}*", item.category, item.difficulty_label()));
            lines.push(String::new());
            lines.push(item.body.trim().to_string());
            if let Some(english) = item.body_en.as_deref().filter(|s| !s.trim().is_empty()) {
                lines.push(String::new());
                lines.push(format!("> {}", english.trim()));
            }
            lines.push(String::new());
            lines.push(format!("Fuente: <{}>", item.identifier));
            if let Some(audio) = item.audio_url.as_deref().filter(|s| !s.is_empty()) {
                lines.push(format!("Audio: <{audio}>"));
            }
        }
        lines.push(String::new());
        Ok(lines.join("\n"))
    }
}
