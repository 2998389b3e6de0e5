use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state_machine::{CorrectionType, WorkItem};

/// How hard a tier's prompt pushes the model towards the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    #[default]
    Relaxed,
    Strict,
    Strictest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("payload for {subject_key} has no input data")]
    MissingInput { subject_key: String },
}

/// The input of one correction: which subject, what kind, and its data.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionTask<'a> {
    pub subject_key: &'a str,
    pub correction_type: CorrectionType,
    pub payload: &'a Value,
}

impl<'a> CorrectionTask<'a> {
    pub fn from_item(item: &'a WorkItem) -> Self {
        Self {
            subject_key: &item.subject_key,
            correction_type: item.correction_type,
            payload: &item.payload,
        }
    }
}

fn instructions(correction_type: CorrectionType) -> (&'static str, &'static str) {
    match correction_type {
        CorrectionType::Specs => (
            "Correct the technical specifications of this vehicle.",
            r#"{"engine": "<engine>", "transmission": "<transmission>", "fuel_type": "<fuel>", "power_hp": <number>}"#,
        ),
        CorrectionType::Pricing => (
            "Correct the list price range of this vehicle.",
            r#"{"price_from": <number>, "price_to": <number>, "currency": "<ISO 4217 code>"}"#,
        ),
        CorrectionType::Introduction => (
            "Rewrite the introduction of this vehicle page (at least 200 characters, factual, no marketing superlatives).",
            r#"{"introduction": "<text>"}"#,
        ),
        CorrectionType::Title => (
            "Correct the page title of this vehicle (make, model, body and trim).",
            r#"{"title": "<title>"}"#,
        ),
        CorrectionType::Comparisons => (
            "List 2 to 8 competitor vehicles with a one-sentence comparison each.",
            r#"{"comparisons": [{"model": "<competitor>", "summary": "<comparison>"}]}"#,
        ),
        CorrectionType::Versions => (
            "List the 3 to 5 trim versions currently sold for this vehicle, with their official names.",
            r#"{"versions": [{"name": "<official trim name>", "price": <number>}]}"#,
        ),
    }
}

/// Builds the prompt for one tier. Stricter tiers repeat the rules the
/// validator enforces.
pub fn build_prompt(task: &CorrectionTask<'_>, strictness: Strictness) -> Result<String, PromptError> {
    let has_input = task
        .payload
        .as_object()
        .is_some_and(|o| o.values().any(|v| !v.is_null()));
    if !has_input {
        return Err(PromptError::MissingInput {
            subject_key: task.subject_key.to_string(),
        });
    }

    let (task_line, format) = instructions(task.correction_type);
    let data = serde_json::to_string_pretty(task.payload).unwrap_or_else(|_| task.payload.to_string());

    let mut prompt = format!(
        "{task_line}\n\
         Respond with ONLY valid JSON, no other text.\n\
         Format: {format}\n\
         If the current data is already correct, respond with \
         {{\"no_changes\": true, \"reason\": \"<why>\"}} instead.\n"
    );

    if strictness != Strictness::Relaxed {
        prompt.push_str(
            "\nRules:\n\
             - Every field in the format is required and must not be empty\n\
             - Never use generic placeholder names such as \"Base\", \"Standard\" or \"Comfort\"; \
             use the manufacturer's official naming\n",
        );
    }
    if strictness == Strictness::Strictest {
        prompt.push_str(
            "- Previous attempts produced invalid output; check every field against the format \
             before answering\n\
             - Do not wrap the JSON in markdown or add commentary\n",
        );
    }

    prompt.push_str(&format!("\nVehicle: {}\nCurrent data:\n{data}", task.subject_key));
    Ok(prompt)
}
