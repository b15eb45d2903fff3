//! Answer synthesis: one schema-constrained completion, validated, with
//! bounded correction retries.
//!
//! Each attempt sends the schema description, the question, the financial
//! metrics, the market quote (or an explicit note that it is unavailable)
//! and the retrieved passages. The first JSON object in the completion is
//! validated field by field. On violation the previous output and the list
//! of violations are appended to the conversation and the model is asked
//! again, up to `schema_retries` more times.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{SchemaError, SynthesisError};
use crate::llm::{extract_json_object, ChatMessage, LanguageModel};
use crate::metrics;
use crate::models::{
    ConfidenceLevel, FinancialMetric, ForecastAnswer, MarketData, DEFAULT_DISCLAIMER,
};

/// Returned when a prompt is built over an empty index.
pub const NO_CONTEXT: &str = "no indexed context available";

const SCHEMA: &str = r#"Respond with a single JSON object and nothing else:
{
  "summary": string,                    // two or three sentences
  "financial_trends": [string],         // one entry per notable metric movement
  "qualitative_assessment": string,     // management tone and themes
  "outlook_next_quarter": string,
  "key_risks": [string],
  "key_opportunities": [string],
  "confidence_level": "high" | "medium" | "low",
  "disclaimer": string,
  "missing_data": [string]              // inputs you did not have
}
Use only the data provided. Do not invent figures."#;

const STRING_FIELDS: [&str; 4] = [
    "summary",
    "qualitative_assessment",
    "outlook_next_quarter",
    "disclaimer",
];
const LIST_FIELDS: [&str; 3] = ["financial_trends", "key_risks", "key_opportunities"];

pub struct Synthesizer {
    model: Arc<dyn LanguageModel>,
    schema_retries: u32,
}

impl Synthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, schema_retries: u32) -> Self {
        Self {
            model,
            schema_retries,
        }
    }

    pub async fn synthesize(
        &self,
        question: &str,
        context: &str,
        metrics: &[FinancialMetric],
        market: &MarketData,
    ) -> Result<ForecastAnswer, SynthesisError> {
        let mut messages = vec![
            ChatMessage::system(format!(
                "You are a financial analyst writing a next-quarter business outlook.\n{}",
                SCHEMA
            )),
            ChatMessage::user(build_prompt(question, context, metrics, market)),
        ];

        let max_attempts = self.schema_retries + 1;
        let mut violations = Vec::new();

        for attempt in 1..=max_attempts {
            let raw = self
                .model
                .complete(&messages)
                .await
                .map_err(SynthesisError::Model)?;

            match validate_answer(&raw) {
                Ok(mut answer) => {
                    annotate_market(&mut answer, market);
                    if context.trim().is_empty() {
                        push_note(&mut answer.missing_data, NO_CONTEXT.to_string());
                    }
                    tracing::debug!(attempt, "synthesized answer validated");
                    return Ok(answer);
                }
                Err(found) => {
                    tracing::warn!(attempt, violations = ?found, "answer failed schema validation");
                    messages.push(ChatMessage::assistant(raw));
                    messages.push(ChatMessage::user(format!(
                        "Your previous answer did not match the schema:\n- {}\nReturn the corrected JSON object only.",
                        found.join("\n- ")
                    )));
                    violations = found;
                }
            }
        }

        Err(SchemaError {
            violations,
            attempts: max_attempts,
        }
        .into())
    }
}

fn build_prompt(
    question: &str,
    context: &str,
    metrics: &[FinancialMetric],
    market: &MarketData,
) -> String {
    let metric_lines = if metrics.is_empty() {
        "No financial metrics were extracted.".to_string()
    } else {
        metrics
            .iter()
            .map(|m| format!("- {}", metrics::describe(m)))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let market_line = match market {
        MarketData::Available(q) => format!(
            "{} last traded at {:.2} ({})",
            q.symbol,
            q.price,
            q.timestamp.to_rfc3339()
        ),
        MarketData::Unavailable { reason } => {
            format!("Market data unavailable ({}). Say so in missing_data.", reason)
        }
        MarketData::NotRequested => "Market data was not requested.".to_string(),
    };

    let context = if context.trim().is_empty() {
        NO_CONTEXT
    } else {
        context
    };

    format!(
        "Question: {}\n\nFinancial metrics:\n{}\n\nMarket data: {}\n\nDocument passages:\n{}",
        question, metric_lines, market_line, context
    )
}

/// Validate a raw completion against the answer schema.
pub fn validate_answer(raw: &str) -> Result<ForecastAnswer, Vec<String>> {
    let json = extract_json_object(raw).ok_or_else(|| vec!["no JSON object found".to_string()])?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| vec![format!("invalid JSON: {}", e)])?;
    let obj = value
        .as_object()
        .ok_or_else(|| vec!["top-level value is not an object".to_string()])?;

    let mut violations = Vec::new();

    for field in STRING_FIELDS {
        match obj.get(field) {
            None => violations.push(format!("missing field '{}'", field)),
            Some(Value::String(s)) if s.trim().is_empty() && field != "disclaimer" => {
                violations.push(format!("field '{}' must not be empty", field))
            }
            Some(Value::String(_)) => {}
            Some(_) => violations.push(format!("field '{}' must be a string", field)),
        }
    }

    for field in LIST_FIELDS {
        check_string_list(obj, field, true, &mut violations);
    }
    check_string_list(obj, "missing_data", false, &mut violations);

    let confidence = match obj.get("confidence_level") {
        None => {
            violations.push("missing field 'confidence_level'".to_string());
            None
        }
        Some(Value::String(s)) => match s.parse::<ConfidenceLevel>() {
            Ok(level) => Some(level),
            Err(_) => {
                violations.push(format!(
                    "field 'confidence_level' must be high, medium or low (got '{}')",
                    s
                ));
                None
            }
        },
        Some(_) => {
            violations.push("field 'confidence_level' must be a string".to_string());
            None
        }
    };

    match confidence {
        Some(confidence_level) if violations.is_empty() => {
            let text = |f: &str| {
                obj.get(f)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            let list = |f: &str| -> Vec<String> {
                obj.get(f)
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let disclaimer = text("disclaimer");
            Ok(ForecastAnswer {
                summary: text("summary"),
                financial_trends: list("financial_trends"),
                qualitative_assessment: text("qualitative_assessment"),
                outlook_next_quarter: text("outlook_next_quarter"),
                key_risks: list("key_risks"),
                key_opportunities: list("key_opportunities"),
                confidence_level,
                disclaimer: if disclaimer.is_empty() {
                    DEFAULT_DISCLAIMER.to_string()
                } else {
                    disclaimer
                },
                missing_data: list("missing_data"),
            })
        }
        _ => Err(violations),
    }
}

fn check_string_list(
    obj: &Map<String, Value>,
    field: &str,
    required: bool,
    violations: &mut Vec<String>,
) {
    match obj.get(field) {
        None if required => violations.push(format!("missing field '{}'", field)),
        None => {}
        Some(Value::Array(items)) => {
            if items.iter().any(|i| !i.is_string()) {
                violations.push(format!("field '{}' must contain only strings", field));
            }
        }
        Some(_) => violations.push(format!("field '{}' must be an array of strings", field)),
    }
}

/// Record an unavailable quote in the answer's missing-data notes.
pub fn annotate_market(answer: &mut ForecastAnswer, market: &MarketData) {
    if let MarketData::Unavailable { reason } = market {
        push_note(
            &mut answer.missing_data,
            format!("market data unavailable: {}", reason),
        );
    }
}

pub(crate) fn push_note(notes: &mut Vec<String>, note: String) {
    if !notes.iter().any(|n| n == &note) {
        notes.push(note);
    }
}
