//! Folding a validated batch into the accumulation store.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use noticias_core::{AccumulationStore, ContentItem};

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub store: AccumulationStore,
    pub added: usize,
    /// Identifiers of new items dropped because they were empty or collided
    /// with an existing or earlier new item.
    pub dropped: Vec<String>,
}

/// Prepend `new_items` (stamped with `timestamp`) to `existing`.
///
/// Existing items keep their order and content. Identifiers stay unique
/// across the result: a new item whose identifier is empty or already
/// present is dropped and reported, never merged over an existing one.
pub fn merge(
    existing: AccumulationStore,
    new_items: Vec<ContentItem>,
    timestamp: DateTime<Utc>,
) -> MergeOutcome {
    let mut seen: HashSet<String> = existing.known_identifiers();
    let mut dropped = Vec::new();
    let mut items = Vec::with_capacity(new_items.len() + existing.items.len());

    for mut item in new_items {
        if !item.has_identifier() || !seen.insert(item.identifier.clone()) {
            dropped.push(item.identifier);
            continue;
        }
        item.added_at = Some(timestamp);
        items.push(item);
    }
    let added = items.len();
    items.extend(existing.items);

    MergeOutcome {
        store: AccumulationStore {
            total_count: items.len(),
            items,
            last_updated: Some(timestamp),
        },
        added,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use noticias_core::Difficulty;

    fn item(id: &str, identifier: &str) -> ContentItem {
        ContentItem {
            id: id.into(),
            category: "Burn Care".into(),
            difficulty: Some(Difficulty::B1),
            emoji: None,
            gradient: None,
            headline_es: None,
            headline_en: None,
            summary_es: None,
            body: "texto".into(),
            body_en: None,
            identifier: identifier.into(),
            audio_url: None,
            vocabulary: vec![],
            added_at: None,
            extra: Default::default(),
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 6, 0, 0).single().expect("ts")
    }

    fn store(items: Vec<ContentItem>) -> AccumulationStore {
        AccumulationStore {
            total_count: items.len(),
            items,
            last_updated: Some(ts(1)),
        }
    }

    #[test]
    fn new_items_go_first_and_are_stamped() {
        let mut old = item("old", "https://n.test/old");
        old.added_at = Some(ts(1));
        let existing = store(vec![old.clone()]);

        let outcome = merge(existing, vec![item("a", "https://n.test/a"), item("b", "https://n.test/b")], ts(2));
        let ids: Vec<_> = outcome.store.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "old"]);
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.store.total_count, 3);
        assert_eq!(outcome.store.last_updated, Some(ts(2)));
        assert_eq!(outcome.store.items[0].added_at, Some(ts(2)));
        assert_eq!(outcome.store.items[2], old);
    }

    #[test]
    fn colliding_identifiers_are_dropped_not_overwritten() {
        let existing = store(vec![item("old", "https://n.test/x")]);
        let outcome = merge(
            existing,
            vec![
                item("dup-existing", "https://n.test/x"),
                item("fresh", "https://n.test/y"),
                item("dup-new", "https://n.test/y"),
                item("blank", ""),
            ],
            ts(2),
        );
        let ids: Vec<_> = outcome.store.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "old"]);
        assert_eq!(outcome.dropped, vec!["https://n.test/x", "https://n.test/y", ""]);
    }

    #[test]
    fn merge_into_empty_store() {
        let outcome = merge(AccumulationStore::empty(), vec![item("a", "https://n.test/a")], ts(3));
        assert_eq!(outcome.store.total_count, 1);
    }

    #[test]
    fn empty_batch_only_touches_timestamp() {
        let existing = store(vec![item("old", "https://n.test/old")]);
        let outcome = merge(existing.clone(), vec![], ts(4));
        assert_eq!(outcome.store.items, existing.items);
        assert_eq!(outcome.added, 0);
    }
}
