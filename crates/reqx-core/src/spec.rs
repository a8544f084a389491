//! Specification normalization
//!
//! [`normalize`] turns any JSON value into a complete [`SpecDocument`]. It
//! never fails: each field rule repairs what it can and records a
//! [`ValidationWarning`], and the rendered warnings end up in
//! `validationErrors`.
//!
//! ```text
//!   Value ──► root check ──► demandId ──► rootGoal ──► proposedSolutions
//!                                                         │
//!              SpecDocument ◄── promptVersion ◄── acceptanceCriteria ◄── risks
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Version of the drafting prompt this build was written against
pub const PROMPT_VERSION: &str = "2026-01-30";

/// Placeholder used when a document has no usable `demandId`
pub const PLACEHOLDER_DEMAND_ID: &str = "auto_generated";

// ============================================================================
// Document
// ============================================================================

/// The canonical specification document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecDocument {
    pub demand_id: String,
    pub root_goal: String,
    pub proposed_solutions: Vec<String>,
    pub risks: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub prompt_version: String,
    pub generated_at: DateTime<Utc>,
    pub validation_errors: Vec<String>,
}

impl SpecDocument {
    fn blank(generated_at: DateTime<Utc>) -> Self {
        Self {
            demand_id: PLACEHOLDER_DEMAND_ID.to_string(),
            root_goal: String::new(),
            proposed_solutions: Vec::new(),
            risks: Vec::new(),
            acceptance_criteria: Vec::new(),
            prompt_version: PROMPT_VERSION.to_string(),
            generated_at,
            validation_errors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }
}

// ============================================================================
// Warnings
// ============================================================================

/// One repair performed by the normalizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    NotAnObject { found: &'static str },
    Missing { field: &'static str },
    Blank { field: &'static str },
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    DroppedElements { field: &'static str, count: usize },
}

impl ValidationWarning {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationWarning::NotAnObject { .. } => None,
            ValidationWarning::Missing { field }
            | ValidationWarning::Blank { field }
            | ValidationWarning::WrongType { field, .. }
            | ValidationWarning::DroppedElements { field, .. } => Some(field),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::NotAnObject { found } => {
                write!(f, "document: expected an object, found {found}")
            }
            ValidationWarning::Missing { field } => write!(f, "{field}: missing"),
            ValidationWarning::Blank { field } => write!(f, "{field}: empty"),
            ValidationWarning::WrongType {
                field,
                expected,
                found,
            } => write!(f, "{field}: expected {expected}, found {found}"),
            ValidationWarning::DroppedElements { field, count } => {
                write!(f, "{field}: dropped {count} non-string element(s)")
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Field rules
// ============================================================================

/// One step of the field table. Rules run in table order and never abort
/// the ones after them.
struct FieldRule {
    field: &'static str,
    alias: &'static str,
    apply: fn(&'static str, Option<&Value>, &mut SpecDocument, &mut Vec<ValidationWarning>),
}

const FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        field: "demandId",
        alias: "demand_id",
        apply: |field, value, doc, warnings| {
            if let Some(s) = required_string(field, value, warnings) {
                doc.demand_id = s;
            }
        },
    },
    FieldRule {
        field: "rootGoal",
        alias: "root_goal",
        apply: |field, value, doc, warnings| {
            if let Some(s) = required_string(field, value, warnings) {
                doc.root_goal = s;
            }
        },
    },
    FieldRule {
        field: "proposedSolutions",
        alias: "proposed_solutions",
        apply: |field, value, doc, warnings| {
            doc.proposed_solutions = string_list(field, value, warnings);
        },
    },
    FieldRule {
        field: "risks",
        alias: "risks",
        apply: |field, value, doc, warnings| {
            doc.risks = string_list(field, value, warnings);
        },
    },
    FieldRule {
        field: "acceptanceCriteria",
        alias: "acceptance_criteria",
        apply: |field, value, doc, warnings| {
            doc.acceptance_criteria = string_list(field, value, warnings);
        },
    },
    FieldRule {
        field: "promptVersion",
        alias: "prompt_version",
        apply: |field, value, doc, warnings| match value {
            None => {}
            Some(Value::String(s)) if !s.trim().is_empty() => {
                doc.prompt_version = s.trim().to_string();
            }
            Some(Value::String(_)) => warnings.push(ValidationWarning::Blank { field }),
            Some(other) => warnings.push(ValidationWarning::WrongType {
                field,
                expected: "string",
                found: type_name(other),
            }),
        },
    },
];

fn required_string(
    field: &'static str,
    value: Option<&Value>,
    warnings: &mut Vec<ValidationWarning>,
) -> Option<String> {
    match value {
        None => {
            warnings.push(ValidationWarning::Missing { field });
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            warnings.push(ValidationWarning::Blank { field });
            None
        }
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(other) => {
            warnings.push(ValidationWarning::WrongType {
                field,
                expected: "string",
                found: type_name(other),
            });
            None
        }
    }
}

fn string_list(
    field: &'static str,
    value: Option<&Value>,
    warnings: &mut Vec<ValidationWarning>,
) -> Vec<String> {
    match value {
        None => {
            warnings.push(ValidationWarning::Missing { field });
            Vec::new()
        }
        Some(Value::Array(elements)) => {
            let kept: Vec<String> = elements
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect();
            let dropped = elements.len() - kept.len();
            if dropped > 0 {
                warnings.push(ValidationWarning::DroppedElements {
                    field,
                    count: dropped,
                });
            }
            kept
        }
        Some(other) => {
            warnings.push(ValidationWarning::WrongType {
                field,
                expected: "array of strings",
                found: type_name(other),
            });
            Vec::new()
        }
    }
}

/// camelCase first, snake_case as fallback. `null` counts as absent.
fn lookup<'a>(map: &'a Map<String, Value>, field: &str, alias: &str) -> Option<&'a Value> {
    let present = |key: &str| map.get(key).filter(|v| !v.is_null());
    present(field).or_else(|| present(alias))
}

// ============================================================================
// Entry points
// ============================================================================

/// Normalize `value`, stamping the document with the current time
pub fn normalize(value: &Value) -> SpecDocument {
    normalize_at(value, Utc::now())
}

/// Normalize `value` with an explicit `generatedAt`
pub fn normalize_at(value: &Value, generated_at: DateTime<Utc>) -> SpecDocument {
    let mut doc = SpecDocument::blank(generated_at);
    let mut warnings = Vec::new();

    let empty = Map::new();
    let map = match value {
        Value::Object(map) => map,
        other => {
            warnings.push(ValidationWarning::NotAnObject {
                found: type_name(other),
            });
            &empty
        }
    };

    for rule in FIELD_RULES {
        (rule.apply)(
            rule.field,
            lookup(map, rule.field, rule.alias),
            &mut doc,
            &mut warnings,
        );
    }

    if !warnings.is_empty() {
        tracing::debug!(count = warnings.len(), "spec normalized with repairs");
    }
    doc.validation_errors = warnings.iter().map(ToString::to_string).collect();
    doc
}
