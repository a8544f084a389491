//! Tagged-block extraction: split a model reply into what the user sees and
//! what the knowledge store receives.
//!
//! A reply may embed any number of segments of the form
//!
//! ```text
//! <KNOWLEDGE>{"append": ["decided X", {"role": "user", "text": "wants Y"}]}</KNOWLEDGE>
//! ```
//!
//! Every complete segment is removed from the display text, whether or not
//! its payload parses. An opening marker without a closing marker is left in
//! place as ordinary text.

use crate::{AppendItem, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag used when none is configured
pub const DEFAULT_TAG: &str = "KNOWLEDGE";

/// A non-fatal problem found while extracting. Segments are numbered from 0
/// in the order they appear in the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExtractionWarning {
    #[error("segment {segment}: payload is not valid JSON: {reason}")]
    MalformedPayload { segment: usize, reason: String },

    #[error("segment {segment}: payload has no `append` array")]
    MissingAppend { segment: usize },

    #[error("segment {segment}: element {index} skipped: {reason}")]
    SkippedElement {
        segment: usize,
        index: usize,
        reason: String,
    },
}

/// Result of running the extractor over one reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub display_text: String,
    pub items: Vec<AppendItem>,
    pub warnings: Vec<ExtractionWarning>,
}

/// Extractor for one marker pair `<TAG>` / `</TAG>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagExtractor {
    open: String,
    close: String,
}

impl Default for TagExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl TagExtractor {
    pub fn new() -> Self {
        Self::with_tag(DEFAULT_TAG)
    }

    pub fn with_tag(tag: &str) -> Self {
        Self {
            open: format!("<{tag}>"),
            close: format!("</{tag}>"),
        }
    }

    pub fn open_marker(&self) -> &str {
        &self.open
    }

    pub fn close_marker(&self) -> &str {
        &self.close
    }

    /// Extract display text and append items from `text`
    pub fn extract(&self, text: &str) -> Extraction {
        let mut display = String::with_capacity(text.len());
        let mut items = Vec::new();
        let mut warnings = Vec::new();
        let mut rest = text;
        let mut segment = 0;

        while let Some(start) = rest.find(&self.open) {
            let body_start = start + self.open.len();
            let Some(body_len) = rest[body_start..].find(&self.close) else {
                // Unterminated: keep the marker and everything after it.
                break;
            };

            display.push_str(&rest[..start]);
            let payload = &rest[body_start..body_start + body_len];
            parse_segment(segment, payload, &mut items, &mut warnings);

            segment += 1;
            rest = &rest[body_start + body_len + self.close.len()..];
        }
        display.push_str(rest);

        for warning in &warnings {
            tracing::warn!(%warning, "knowledge block ignored in part");
        }

        Extraction {
            display_text: display.trim().to_string(),
            items,
            warnings,
        }
    }
}

fn parse_segment(
    segment: usize,
    payload: &str,
    items: &mut Vec<AppendItem>,
    warnings: &mut Vec<ExtractionWarning>,
) {
    let value: Value = match serde_json::from_str(payload.trim()) {
        Ok(v) => v,
        Err(e) => {
            warnings.push(ExtractionWarning::MalformedPayload {
                segment,
                reason: e.to_string(),
            });
            return;
        }
    };

    let elements = match value {
        Value::Array(elements) => elements,
        Value::Object(mut map) => match map.remove("append") {
            Some(Value::Array(elements)) => elements,
            _ => {
                warnings.push(ExtractionWarning::MissingAppend { segment });
                return;
            }
        },
        _ => {
            warnings.push(ExtractionWarning::MissingAppend { segment });
            return;
        }
    };

    for (index, element) in elements.into_iter().enumerate() {
        match parse_element(element) {
            Ok(item) => items.push(item),
            Err(reason) => warnings.push(ExtractionWarning::SkippedElement {
                segment,
                index,
                reason,
            }),
        }
    }
}

fn parse_element(element: Value) -> Result<AppendItem, String> {
    let (role, text) = match element {
        Value::String(text) => (Role::Assistant, text),
        Value::Object(map) => {
            let text = match map.get("text") {
                Some(Value::String(t)) => t.clone(),
                _ => return Err("object has no string `text`".to_string()),
            };
            let role = match map.get("role") {
                None | Some(Value::Null) => Role::Assistant,
                Some(Value::String(r)) => r.parse::<Role>().map_err(|e| e.to_string())?,
                Some(_) => return Err("`role` is not a string".to_string()),
            };
            (role, text)
        }
        other => return Err(format!("unsupported element {other}")),
    };

    if text.trim().is_empty() {
        return Err("blank text".to_string());
    }
    Ok(AppendItem::new(role, text.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_segment_is_removed() {
        let extractor = TagExtractor::with_tag("TAG");
        let out = extractor.extract(r#"Sure. <TAG>{"append":["Use SQLite"]}</TAG> Done."#);

        assert_eq!(out.display_text, "Sure.  Done.");
        assert_eq!(out.items, vec![AppendItem::new(Role::Assistant, "Use SQLite")]);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_no_markers_is_identity_after_trim() {
        let out = TagExtractor::new().extract("  just text\n");
        assert_eq!(out.display_text, "just text");
        assert!(out.items.is_empty());
    }

    #[test]
    fn test_malformed_payload_still_removed() {
        let out = TagExtractor::new().extract("a <KNOWLEDGE>{not json</KNOWLEDGE> b");

        assert_eq!(out.display_text, "a  b");
        assert!(out.items.is_empty());
        assert!(matches!(
            out.warnings.as_slice(),
            [ExtractionWarning::MalformedPayload { segment: 0, .. }]
        ));
    }

    #[test]
    fn test_unterminated_marker_left_untouched() {
        let text = r#"hello <KNOWLEDGE>{"append":["x"]}"#;
        let out = TagExtractor::new().extract(text);

        assert_eq!(out.display_text, text);
        assert!(out.items.is_empty());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_segments_keep_order() {
        let text = concat!(
            r#"<KNOWLEDGE>{"append":["a","b"]}</KNOWLEDGE> mid "#,
            r#"<KNOWLEDGE>["c", {"role":"user","text":"d"}]</KNOWLEDGE>"#,
        );
        let out = TagExtractor::new().extract(text);

        let texts: Vec<_> = out.items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
        assert_eq!(out.items[3].role, Role::User);
        assert_eq!(out.display_text, "mid");
    }

    #[test]
    fn test_bad_elements_are_skipped_individually() {
        let text = r#"<KNOWLEDGE>{"append":["ok", 3, {"role":"robot","text":"x"}, "  "]}</KNOWLEDGE>"#;
        let out = TagExtractor::new().extract(text);

        assert_eq!(out.items, vec![AppendItem::new(Role::Assistant, "ok")]);
        assert_eq!(out.warnings.len(), 3);
        assert!(out
            .warnings
            .iter()
            .all(|w| matches!(w, ExtractionWarning::SkippedElement { segment: 0, .. })));
    }

    #[test]
    fn test_object_without_append_is_warned() {
        let out = TagExtractor::new().extract(r#"x<KNOWLEDGE>{"add":["a"]}</KNOWLEDGE>"#);
        assert_eq!(out.display_text, "x");
        assert_eq!(
            out.warnings,
            vec![ExtractionWarning::MissingAppend { segment: 0 }]
        );
    }

    #[test]
    fn test_second_segment_after_failed_first() {
        let text = r#"<KNOWLEDGE>oops</KNOWLEDGE><KNOWLEDGE>["kept"]</KNOWLEDGE>"#;
        let out = TagExtractor::new().extract(text);

        assert_eq!(out.items.len(), 1);
        assert!(matches!(
            out.warnings[0],
            ExtractionWarning::MalformedPayload { segment: 0, .. }
        ));
    }
}
