//! Candidate deduplication against previously accumulated identifiers.

use std::collections::{BTreeMap, HashMap, HashSet};

use noticias_core::{CandidateRecord, CategoryConfig};

/// Surviving candidates keyed by category name. Categories with no
/// survivors are absent, never present with an empty list.
pub type CandidatesByCategory = BTreeMap<String, Vec<CandidateRecord>>;

/// Filter raw feed candidates down to new ones, at most `per_category_cap`
/// per category, preserving feed order.
///
/// A candidate is skipped when its identifier is empty, already in `known`,
/// or was already kept earlier in this pass (the same article can surface
/// under several category queries). Categories are scanned in the order of
/// `categories`, so the result is deterministic for a given input.
pub fn dedupe(
    categories: &[CategoryConfig],
    raw: &HashMap<String, Vec<CandidateRecord>>,
    known: &HashSet<String>,
    per_category_cap: usize,
) -> CandidatesByCategory {
    let mut kept_this_pass: HashSet<&str> = HashSet::new();
    let mut out = CandidatesByCategory::new();

    for category in categories {
        let Some(candidates) = raw.get(&category.name) else {
            continue;
        };

        let mut survivors = Vec::new();
        for candidate in candidates {
            if survivors.len() >= per_category_cap {
                break;
            }
            let id = candidate.identifier.trim();
            if id.is_empty() || known.contains(id) || kept_this_pass.contains(id) {
                continue;
            }
            kept_this_pass.insert(id);
            survivors.push(candidate.clone());
        }

        if !survivors.is_empty() {
            out.insert(category.name.clone(), survivors);
        }
    }

    out
}

pub fn candidate_count(candidates: &CandidatesByCategory) -> usize {
    candidates.values().map(Vec::len).sum()
}

/// Identifiers offered to the generator, mapped to the category they were
/// offered under. Generated items must cite one of these.
pub fn offered_identifiers(candidates: &CandidatesByCategory) -> HashMap<String, String> {
    candidates
        .iter()
        .flat_map(|(category, list)| {
            list.iter()
                .map(move |c| (c.identifier.trim().to_string(), category.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat(name: &str) -> CategoryConfig {
        CategoryConfig {
            name: name.to_string(),
            slug: name.to_ascii_lowercase().replace(' ', "-"),
            query: "q".into(),
            emoji: None,
            gradient: None,
        }
    }

    fn cand(id: &str) -> CandidateRecord {
        CandidateRecord {
            title: format!("title {id}"),
            description: String::new(),
            source: "News".into(),
            identifier: id.to_string(),
        }
    }

    fn ids(list: &[CandidateRecord]) -> Vec<&str> {
        list.iter().map(|c| c.identifier.as_str()).collect()
    }

    #[test]
    fn known_identifiers_are_skipped() {
        let categories = vec![cat("Burn Care")];
        let raw = HashMap::from([("Burn Care".to_string(), vec![cand("A"), cand("B")])]);
        let known = HashSet::from(["A".to_string()]);

        let out = dedupe(&categories, &raw, &known, 3);
        assert_eq!(ids(&out["Burn Care"]), vec!["B"]);
    }

    #[test]
    fn empty_identifiers_are_dropped() {
        let categories = vec![cat("Burn Care")];
        let raw = HashMap::from([("Burn Care".to_string(), vec![cand(""), cand("  "), cand("C")])]);

        let out = dedupe(&categories, &raw, &HashSet::new(), 3);
        assert_eq!(ids(&out["Burn Care"]), vec!["C"]);
    }

    #[test]
    fn cap_keeps_first_survivors_in_feed_order() {
        let categories = vec![cat("Burn Care")];
        let raw = HashMap::from([(
            "Burn Care".to_string(),
            vec![cand("1"), cand("2"), cand("3"), cand("4"), cand("5")],
        )]);
        let known = HashSet::from(["2".to_string()]);

        let out = dedupe(&categories, &raw, &known, 3);
        assert_eq!(ids(&out["Burn Care"]), vec!["1", "3", "4"]);
    }

    #[test]
    fn categories_without_survivors_are_absent() {
        let categories = vec![cat("Burn Care"), cat("Diabetic Foot"), cat("Wound Research")];
        let raw = HashMap::from([
            ("Burn Care".to_string(), vec![cand("A")]),
            ("Diabetic Foot".to_string(), vec![]),
            ("Wound Research".to_string(), vec![cand("R")]),
        ]);
        let known = HashSet::from(["A".to_string()]);

        let out = dedupe(&categories, &raw, &known, 3);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["Wound Research"]);
    }

    #[test]
    fn identifier_repeated_across_categories_is_kept_once() {
        let categories = vec![cat("Burn Care"), cat("Wound Research")];
        let raw = HashMap::from([
            ("Burn Care".to_string(), vec![cand("X"), cand("X")]),
            ("Wound Research".to_string(), vec![cand("X"), cand("Y")]),
        ]);

        let out = dedupe(&categories, &raw, &HashSet::new(), 3);
        assert_eq!(ids(&out["Burn Care"]), vec!["X"]);
        assert_eq!(ids(&out["Wound Research"]), vec!["Y"]);
        assert_eq!(candidate_count(&out), 2);
        let offered = offered_identifiers(&out);
        assert_eq!(offered.len(), 2);
        assert_eq!(offered["X"], "Burn Care");
        assert_eq!(offered["Y"], "Wound Research");
    }

    #[test]
    fn never_returns_known_ids_or_exceeds_cap() {
        let categories: Vec<_> = ["a", "b", "c"].iter().map(|n| cat(n)).collect();
        let known: HashSet<String> = (0..40).step_by(3).map(|n| n.to_string()).collect();
        for cap in 0..5 {
            let raw: HashMap<String, Vec<CandidateRecord>> = categories
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let list = (0..20).map(|n| cand(&((n * (i + 1)) % 40).to_string())).collect();
                    (c.name.clone(), list)
                })
                .collect();

            let out = dedupe(&categories, &raw, &known, cap);
            for list in out.values() {
                assert!(list.len() <= cap);
                assert!(!list.is_empty());
                assert!(list.iter().all(|c| !known.contains(&c.identifier)));
            }
        }
    }
}
