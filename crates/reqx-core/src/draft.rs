//! Spec drafting: knowledge items to a raw spec object
//!
//! The drafter only produces an untyped object; [`crate::normalize`] is what
//! turns it into a document.

use crate::ProjectKnowledge;
use regex::Regex;
use serde_json::{json, Map, Value};

/// Builds a raw specification object from the stored knowledge.
///
/// A model-backed drafter lives outside this crate; its output goes through
/// the same normalizer.
pub trait SpecDrafter: Send + Sync {
    fn draft(&self, knowledge: &ProjectKnowledge) -> Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DraftField {
    DemandId,
    RootGoal,
    ProposedSolutions,
    Risks,
    AcceptanceCriteria,
}

impl DraftField {
    fn key(&self) -> &'static str {
        match self {
            DraftField::DemandId => "demandId",
            DraftField::RootGoal => "rootGoal",
            DraftField::ProposedSolutions => "proposedSolutions",
            DraftField::Risks => "risks",
            DraftField::AcceptanceCriteria => "acceptanceCriteria",
        }
    }

    fn is_list(&self) -> bool {
        !matches!(self, DraftField::DemandId | DraftField::RootGoal)
    }
}

struct KeyPattern {
    field: DraftField,
    regex: Regex,
}

/// Deterministic drafter reading `key: value` lines out of item text
pub struct KeyedItemDrafter {
    patterns: Vec<KeyPattern>,
}

impl Default for KeyedItemDrafter {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedItemDrafter {
    pub fn new() -> Self {
        let table: [(DraftField, &str); 5] = [
            (
                DraftField::DemandId,
                r"(?i)^\s*(?:demand[\s_-]*id|demand|id)\s*:\s*(.+?)\s*$",
            ),
            (
                DraftField::RootGoal,
                r"(?i)^\s*(?:root[\s_-]*goal|goal)\s*:\s*(.+?)\s*$",
            ),
            (
                DraftField::ProposedSolutions,
                r"(?i)^\s*(?:solutions?|features?|options?)\s*:\s*(.+?)\s*$",
            ),
            (DraftField::Risks, r"(?i)^\s*risks?\s*:\s*(.+?)\s*$"),
            (
                DraftField::AcceptanceCriteria,
                r"(?i)^\s*(?:acceptance(?:[\s_-]*criteri(?:on|a))?|criteri(?:on|a)|verify)\s*:\s*(.+?)\s*$",
            ),
        ];

        let patterns = table
            .into_iter()
            .filter_map(|(field, pattern)| match Regex::new(pattern) {
                Ok(regex) => Some(KeyPattern { field, regex }),
                Err(e) => {
                    tracing::error!(field = field.key(), error = %e, "invalid drafter pattern");
                    None
                }
            })
            .collect();

        Self { patterns }
    }

    fn classify<'a>(&self, line: &'a str) -> Option<(DraftField, &'a str)> {
        self.patterns.iter().find_map(|p| {
            p.regex
                .captures(line)
                .and_then(|cap| cap.get(1))
                .map(|m| (p.field, m.as_str()))
        })
    }
}

impl SpecDrafter for KeyedItemDrafter {
    fn draft(&self, knowledge: &ProjectKnowledge) -> Value {
        let mut out = Map::new();

        for item in &knowledge.items {
            for line in item.text.lines() {
                let Some((field, value)) = self.classify(line) else {
                    continue;
                };
                if field.is_list() {
                    match out.entry(field.key()).or_insert_with(|| json!([])) {
                        Value::Array(list) => list.push(json!(value)),
                        slot => *slot = json!([value]),
                    }
                } else {
                    // Later decisions supersede earlier ones.
                    out.insert(field.key().to_string(), json!(value));
                }
            }
        }

        Value::Object(out)
    }
}
