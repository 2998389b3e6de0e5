//! Structural and domain checks applied to generated content before it is
//! committed.
//!
//! Validation collects every violation in schema order; the first one is the
//! headline of the returned [`ValidationError`]. Identical input always gives
//! an identical error.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::state_machine::CorrectionType;

/// Generic placeholders a model tends to invent for version and trim names.
pub const DEFAULT_DENY_LIST: &[&str] = &["base", "basic", "comfort", "standard", "default"];

/// Brand trim tokens that make an otherwise generic name legitimate.
pub const DEFAULT_ALLOW_LIST: &[&str] = &["gls", "turbo", "tsi", "tdi", "gti", "amg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Missing field, wrong shape, list size out of bounds.
    Structure,
    /// Generic placeholder or inconsistent value.
    Domain,
    /// Usable shape, but content too thin or cut off.
    Quality,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field_path: String,
    pub reason: String,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field_path, self.reason)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field_path}: {reason}")]
pub struct ValidationError {
    pub field_path: String,
    pub reason: String,
    pub violations: Vec<Violation>,
}

impl ValidationError {
    fn from_violations(violations: Vec<Violation>) -> Option<Self> {
        let first = violations.first()?.clone();
        Some(Self {
            field_path: first.field_path,
            reason: first.reason,
            violations,
        })
    }

    /// True when nothing but quality checks failed.
    pub fn is_quality_only(&self) -> bool {
        self.violations
            .iter()
            .all(|v| v.kind == ViolationKind::Quality)
    }
}

enum Rule {
    Text {
        field: &'static str,
        min_chars: usize,
        generic_check: bool,
    },
    Number {
        field: &'static str,
    },
    List {
        field: &'static str,
        min: usize,
        max: usize,
        subfields: &'static [&'static str],
        generic_checked: &'static str,
    },
}

fn schema(correction_type: CorrectionType) -> Vec<Rule> {
    match correction_type {
        CorrectionType::Specs => vec![
            Rule::Text { field: "engine", min_chars: 1, generic_check: false },
            Rule::Text { field: "transmission", min_chars: 1, generic_check: false },
            Rule::Text { field: "fuel_type", min_chars: 1, generic_check: false },
            Rule::Number { field: "power_hp" },
        ],
        CorrectionType::Pricing => vec![
            Rule::Number { field: "price_from" },
            Rule::Number { field: "price_to" },
            Rule::Text { field: "currency", min_chars: 3, generic_check: false },
        ],
        CorrectionType::Introduction => vec![Rule::Text {
            field: "introduction",
            min_chars: 200,
            generic_check: false,
        }],
        CorrectionType::Title => vec![Rule::Text {
            field: "title",
            min_chars: 1,
            generic_check: true,
        }],
        CorrectionType::Comparisons => vec![Rule::List {
            field: "comparisons",
            min: 2,
            max: 8,
            subfields: &["model", "summary"],
            generic_checked: "",
        }],
        CorrectionType::Versions => vec![Rule::List {
            field: "versions",
            min: 3,
            max: 5,
            subfields: &["name", "price"],
            generic_checked: "name",
        }],
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    deny_list: Vec<String>,
    allow_list: Vec<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(
            DEFAULT_DENY_LIST.iter().map(|s| s.to_string()).collect(),
            DEFAULT_ALLOW_LIST.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl Validator {
    pub fn new(deny_list: Vec<String>, allow_list: Vec<String>) -> Self {
        Self {
            deny_list: deny_list.into_iter().map(|s| s.to_lowercase()).collect(),
            allow_list: allow_list.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Case-insensitive substring match against the deny-list, neutralized by
    /// any allow-list token in the same value.
    pub fn is_generic(&self, value: &str) -> bool {
        let lower = value.to_lowercase();
        let denied = self.deny_list.iter().any(|d| lower.contains(d.as_str()));
        denied && !self.allow_list.iter().any(|a| lower.contains(a.as_str()))
    }

    /// `{"no_changes": true}` answers skip the schema entirely.
    pub fn is_no_changes(value: &Value) -> bool {
        value.get("no_changes").and_then(Value::as_bool) == Some(true)
    }

    pub fn validate(
        &self,
        correction_type: CorrectionType,
        value: &Value,
        truncated: bool,
    ) -> Result<(), ValidationError> {
        let violations = self.collect(correction_type, value, truncated);
        match ValidationError::from_violations(violations) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn collect(&self, correction_type: CorrectionType, value: &Value, truncated: bool) -> Vec<Violation> {
        let mut out = Vec::new();
        let Some(obj) = value.as_object() else {
            out.push(violation("$", "expected a JSON object", ViolationKind::Structure));
            return out;
        };
        if Self::is_no_changes(value) {
            return out;
        }

        for rule in schema(correction_type) {
            match rule {
                Rule::Text { field, min_chars, generic_check } => match obj.get(field) {
                    None => out.push(missing(field)),
                    Some(Value::String(s)) if s.trim().is_empty() => {
                        out.push(violation(field, "must not be empty", ViolationKind::Structure));
                    }
                    Some(Value::String(s)) => {
                        let len = s.trim().chars().count();
                        if len < min_chars {
                            out.push(violation(
                                field,
                                &format!("too short ({len} < {min_chars} characters)"),
                                ViolationKind::Quality,
                            ));
                        }
                        if generic_check && self.is_generic(s) {
                            out.push(generic(field, s));
                        }
                    }
                    Some(_) => out.push(violation(field, "expected a string", ViolationKind::Structure)),
                },
                Rule::Number { field } => match obj.get(field) {
                    None => out.push(missing(field)),
                    Some(v) if v.is_number() => {}
                    Some(_) => out.push(violation(field, "expected a number", ViolationKind::Structure)),
                },
                Rule::List { field, min, max, subfields, generic_checked } => {
                    let Some(value) = obj.get(field) else {
                        out.push(missing(field));
                        continue;
                    };
                    let Some(entries) = value.as_array() else {
                        out.push(violation(field, "expected a list", ViolationKind::Structure));
                        continue;
                    };
                    if entries.len() < min || entries.len() > max {
                        out.push(violation(
                            field,
                            &format!("expected {min}-{max} entries, got {}", entries.len()),
                            ViolationKind::Structure,
                        ));
                    }
                    for (i, entry) in entries.iter().enumerate() {
                        for sub in subfields {
                            let path = format!("{field}[{i}].{sub}");
                            match entry.get(sub) {
                                None => out.push(missing(&path)),
                                Some(v) if is_blank(v) => out.push(violation(
                                    &path,
                                    "must not be empty",
                                    ViolationKind::Structure,
                                )),
                                Some(Value::String(s)) if *sub == generic_checked && self.is_generic(s) => {
                                    out.push(generic(&path, s));
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            }
        }

        if correction_type == CorrectionType::Pricing {
            let from = obj.get("price_from").and_then(Value::as_f64);
            let to = obj.get("price_to").and_then(Value::as_f64);
            if let (Some(from), Some(to)) = (from, to) {
                if from <= 0.0 || from > to {
                    out.push(violation(
                        "price_from",
                        "must be positive and not above price_to",
                        ViolationKind::Domain,
                    ));
                }
            }
        }

        if truncated {
            out.push(violation("$", "response truncated at token limit", ViolationKind::Quality));
        }
        out
    }
}

fn violation(path: &str, reason: &str, kind: ViolationKind) -> Violation {
    Violation {
        field_path: path.to_string(),
        reason: reason.to_string(),
        kind,
    }
}

fn missing(path: &str) -> Violation {
    violation(path, "required field missing", ViolationKind::Structure)
}

fn generic(path: &str, value: &str) -> Violation {
    violation(
        path,
        &format!("generic placeholder '{value}'"),
        ViolationKind::Domain,
    )
}
