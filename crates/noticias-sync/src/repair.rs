//! Best-effort recovery of structured output that was cut off mid-document,
//! plus extraction of the payload from chatty model responses.

use serde::de::IgnoredAny;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InString,
    /// Previous character was a backslash inside a string.
    EscapeNext,
}

/// Close an abruptly terminated JSON document so it has a chance to parse.
///
/// Text that already parses is returned unchanged. Otherwise the text is
/// scanned once: an unterminated string is closed, a dangling `,` is
/// dropped, a dangling `:` or a finished key with no colon gets a `null`
/// value, and every container still open is closed innermost first. The
/// result is not guaranteed to parse; a cut inside a key or a literal such
/// as `tru` stays broken and the caller's parse attempt reports it.
pub fn repair_truncated(text: &str) -> String {
    if parses(text) {
        return text.to_string();
    }

    let mut state = ScanState::Normal;
    let mut open: Vec<char> = Vec::new();
    // Inside an object, between `{`/`,` and the `:` that follows a key.
    let mut expecting_key = false;
    let mut last_string_is_key = false;

    for ch in text.chars() {
        state = match (state, ch) {
            (ScanState::EscapeNext, _) => ScanState::InString,
            (ScanState::InString, '\\') => ScanState::EscapeNext,
            (ScanState::InString, '"') => ScanState::Normal,
            (ScanState::InString, _) => ScanState::InString,
            (ScanState::Normal, '"') => {
                last_string_is_key = expecting_key;
                ScanState::InString
            }
            (ScanState::Normal, '{') | (ScanState::Normal, '[') => {
                open.push(ch);
                expecting_key = ch == '{';
                ScanState::Normal
            }
            (ScanState::Normal, '}') | (ScanState::Normal, ']') => {
                let opener = if ch == '}' { '{' } else { '[' };
                if open.last() == Some(&opener) {
                    open.pop();
                }
                expecting_key = false;
                ScanState::Normal
            }
            (ScanState::Normal, ',') => {
                expecting_key = open.last() == Some(&'{');
                ScanState::Normal
            }
            (ScanState::Normal, ':') => {
                expecting_key = false;
                ScanState::Normal
            }
            (ScanState::Normal, _) => ScanState::Normal,
        };
    }

    let mut out = text.to_string();
    match state {
        ScanState::InString => out.push('"'),
        ScanState::EscapeNext => {
            out.pop();
            out.push('"');
        }
        ScanState::Normal => {
            out.truncate(out.trim_end().len());
            if out.ends_with(',') {
                out.pop();
            } else if out.ends_with(':') {
                out.push_str("null");
            } else if out.ends_with('"') && expecting_key && last_string_is_key {
                out.push_str(": null");
            }
        }
    }

    for opener in open.iter().rev() {
        out.push(if *opener == '{' { '}' } else { ']' });
    }
    out
}

/// Document starts tried before giving up on prose containing brackets.
const MAX_PAYLOAD_STARTS: usize = 8;

/// Locate the JSON payload inside a model response.
///
/// Handles fenced blocks (with or without a `json` tag, closing fence
/// optional) and prose before or after a bare document. Brackets in the
/// leading prose are skipped: each `{`/`[` is tried in turn, first for a
/// complete document and then for one that repairs.
pub fn extract_payload(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(fence) = trimmed.find("```") {
        let after = &trimmed[fence + 3..];
        let body = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
        let body = body
            .strip_prefix("json")
            .or_else(|| body.strip_prefix("JSON"))
            .unwrap_or(body);
        return body.trim();
    }

    let starts: Vec<usize> = trimmed
        .match_indices(['{', '['])
        .map(|(idx, _)| idx)
        .take(MAX_PAYLOAD_STARTS)
        .collect();
    let Some(&first) = starts.first() else {
        return trimmed;
    };

    for &start in &starts {
        if let Some(document) = complete_document_at(&trimmed[start..]) {
            return document;
        }
    }
    starts
        .iter()
        .map(|&start| &trimmed[start..])
        .find(|candidate| parses(&repair_truncated(candidate)))
        .unwrap_or(&trimmed[first..])
}

/// `candidate` itself, or its prefix up to the last matching closer when
/// prose trails the document.
fn complete_document_at(candidate: &str) -> Option<&str> {
    if parses(candidate) {
        return Some(candidate);
    }
    let closer = if candidate.starts_with('{') { '}' } else { ']' };
    let end = candidate.rfind(closer)?;
    let bounded = &candidate[..=end];
    parses(bounded).then_some(bounded)
}

fn parses(text: &str) -> bool {
    serde_json::from_str::<IgnoredAny>(text).is_ok()
}
