//! News feed sources producing [`CandidateRecord`]s per category.

use std::path::PathBuf;

use async_trait::async_trait;
use noticias_core::{CandidateRecord, CategoryConfig};
use noticias_storage::HttpFetcher;
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::Html;
use tracing::debug;

use crate::{AdapterContext, AdapterError};

const DEFAULT_SOURCE_LABEL: &str = "News";

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Candidates for one category in feed order. An empty list and an
    /// error are both tolerated by the caller.
    async fn fetch_candidates(
        &self,
        ctx: &AdapterContext,
        category: &CategoryConfig,
    ) -> Result<Vec<CandidateRecord>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct GoogleNewsRssConfig {
    pub base_url: String,
    /// Search window, rendered as `when:<n>d`.
    pub window_days: u32,
    /// Items examined per category before dedup.
    pub scan_limit: usize,
}

impl Default for GoogleNewsRssConfig {
    fn default() -> Self {
        Self {
            base_url: "https://news.google.com".to_string(),
            window_days: 7,
            scan_limit: 10,
        }
    }
}

pub struct GoogleNewsRss {
    http: HttpFetcher,
    config: GoogleNewsRssConfig,
}

impl GoogleNewsRss {
    pub fn new(http: HttpFetcher, config: GoogleNewsRssConfig) -> Self {
        Self { http, config }
    }

    pub fn search_url(&self, category: &CategoryConfig) -> String {
        format!(
            "{}/rss/search?q={}+when:{}d&hl=en-US&gl=US&ceid=US:en",
            self.config.base_url.trim_end_matches('/'),
            category.query,
            self.config.window_days
        )
    }
}

#[async_trait]
impl FeedSource for GoogleNewsRss {
    fn source_id(&self) -> &'static str {
        "google-news-rss"
    }

    async fn fetch_candidates(
        &self,
        ctx: &AdapterContext,
        category: &CategoryConfig,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        let url = self.search_url(category);
        let body = self.http.fetch_bytes(ctx.run_id, &category.slug, &url).await?;
        let xml = String::from_utf8_lossy(&body);
        let items = parse_rss_items(&xml, self.config.scan_limit)?;
        debug!(category = %category.name, items = items.len(), "parsed rss feed");
        Ok(items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Title,
    Link,
    Description,
    Source,
}

#[derive(Default)]
struct RawItem {
    title: String,
    link: String,
    description: String,
    source: String,
}

impl RawItem {
    fn field_mut(&mut self, field: ItemField) -> &mut String {
        match field {
            ItemField::Title => &mut self.title,
            ItemField::Link => &mut self.link,
            ItemField::Description => &mut self.description,
            ItemField::Source => &mut self.source,
        }
    }

    fn into_candidate(self) -> Option<CandidateRecord> {
        let title = html_to_text(&self.title);
        let identifier = self.link.trim().to_string();
        if title.is_empty() || identifier.is_empty() {
            return None;
        }
        let source = self.source.trim();
        Some(CandidateRecord {
            title,
            description: html_to_text(&self.description),
            source: if source.is_empty() {
                DEFAULT_SOURCE_LABEL.to_string()
            } else {
                source.to_string()
            },
            identifier,
        })
    }
}

/// Parse the `<item>` elements of an RSS 2.0 document, examining at most
/// `limit` items. Items without a title or link are skipped.
pub fn parse_rss_items(xml: &str, limit: usize) -> Result<Vec<CandidateRecord>, AdapterError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut examined = 0usize;
    let mut current: Option<RawItem> = None;
    let mut field: Option<ItemField> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| AdapterError::Message(format!("invalid rss xml: {e}")))?;
        match event {
            Event::Start(start) => match start.name().as_ref() {
                b"item" => current = Some(RawItem::default()),
                b"title" if current.is_some() => field = Some(ItemField::Title),
                b"link" if current.is_some() => field = Some(ItemField::Link),
                b"description" if current.is_some() => field = Some(ItemField::Description),
                b"source" if current.is_some() => field = Some(ItemField::Source),
                _ => {}
            },
            Event::Text(text) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    let text = text
                        .unescape()
                        .map_err(|e| AdapterError::Message(format!("invalid rss text: {e}")))?;
                    item.field_mut(f).push_str(&text);
                }
            }
            Event::CData(data) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    item.field_mut(f)
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(end) => match end.name().as_ref() {
                b"item" => {
                    field = None;
                    if let Some(item) = current.take() {
                        examined += 1;
                        if let Some(candidate) = item.into_candidate() {
                            out.push(candidate);
                        }
                        if examined >= limit {
                            break;
                        }
                    }
                }
                b"title" | b"link" | b"description" | b"source" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}

/// Strip markup and decode entities from an HTML snippet.
fn html_to_text(snippet: &str) -> String {
    if !snippet.contains('<') && !snippet.contains('&') {
        return snippet.split_whitespace().collect::<Vec<_>>().join(" ");
    }
    let fragment = Html::parse_fragment(snippet);
    fragment
        .root_element()
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Offline feed reading `<root>/<category-slug>.json`, a JSON array of
/// candidate records. A missing file yields no candidates.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    root: PathBuf,
}

impl FixtureFeed {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FeedSource for FixtureFeed {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_candidates(
        &self,
        _ctx: &AdapterContext,
        category: &CategoryConfig,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        let path = self.root.join(format!("{}.json", category.slug));
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AdapterError::Message(format!(
                    "reading {}: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&data)
            .map_err(|e| AdapterError::Message(format!("parsing {}: {e}", path.display())))
    }
}
