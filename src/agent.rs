//! Orchestrator: a bounded plan/act/observe loop with a deterministic
//! fallback.
//!
//! # States
//!
//! ```text
//!            ┌──────────── Observing ◀──── Acting
//!            ▼                 │              ▲
//!        Planning ─────────────┼──── tool ────┘
//!            │                 │
//!            │ ready      ceiling reached
//!            ▼                 ▼
//!      Synthesizing ──err──▶ Failed ──▶ fallback answer
//!            │
//!            ▼
//!          Done
//! ```
//!
//! Each planning step is one model call and counts as one iteration,
//! whether or not its decision parses. When the iteration count reaches the
//! ceiling the loop fails over to [`Orchestrator::fallback`], which gathers
//! metrics, passages and the quote concurrently and assembles an answer
//! without the model.

use serde::Deserialize;
use std::sync::Arc;

use crate::error::SynthesisError;
use crate::llm::{extract_json_object, ChatMessage, LanguageModel};
use crate::metrics;
use crate::models::{
    AnswerPath, ConfidenceLevel, FinancialMetric, ForecastAnswer, MarketData, MetricName,
    ToolKind, DEFAULT_DISCLAIMER,
};
use crate::retrieve::AnalysisSection;
use crate::synth::{annotate_market, push_note, Synthesizer, NO_CONTEXT};
use crate::tools::{self, passages_context, ToolContext, ToolError, ToolOutput};

/// Risks and opportunities kept in a fallback answer.
const FALLBACK_LIST_LEN: usize = 3;

const POSITIVE_WORDS: [&str; 10] = [
    "confident",
    "strong",
    "growth",
    "robust",
    "momentum",
    "improve",
    "record",
    "optimistic",
    "healthy",
    "resilient",
];
const NEGATIVE_WORDS: [&str; 10] = [
    "decline",
    "weak",
    "pressure",
    "uncertain",
    "headwind",
    "challenging",
    "slowdown",
    "cautious",
    "delay",
    "soft",
];
const RISK_WORDS: [&str; 9] = [
    "risk",
    "headwind",
    "pressure",
    "uncertain",
    "decline",
    "challenge",
    "slowdown",
    "volatil",
    "attrition",
];
const OPPORTUNITY_WORDS: [&str; 9] = [
    "opportunit",
    "pipeline",
    "deal",
    "growth",
    "expansion",
    "new client",
    "demand",
    "invest",
    "win",
];

/// A tool the planner asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub kind: ToolKind,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Call(ToolCall),
    Synthesize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    IterationCeiling,
    ModelUnavailable(String),
    Synthesis(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::IterationCeiling => f.write_str("iteration ceiling reached"),
            FailureReason::ModelUnavailable(e) => write!(f, "language model unavailable: {}", e),
            FailureReason::Synthesis(e) => write!(f, "synthesis failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentState {
    Planning,
    Acting(ToolCall),
    Observing,
    Synthesizing,
    Done,
    Failed(FailureReason),
}

/// Result of one orchestrated request.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub answer: ForecastAnswer,
    pub path: AnswerPath,
    pub metrics: Vec<FinancialMetric>,
    pub market: MarketData,
    pub tools_invoked: Vec<ToolKind>,
    pub iterations: u32,
    /// Every state the loop entered, in order.
    pub trace: Vec<AgentState>,
}

#[derive(Debug, Deserialize)]
struct JsonDecision {
    action: String,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

/// Parse a planning completion. Accepts `{"action": "<tag>", "input": ...}`
/// (with `"final"` or `"synthesize"` meaning ready), or ReAct-style
/// `Action:` / `Action Input:` lines and `Final Answer`.
pub fn parse_decision(raw: &str) -> Result<Decision, String> {
    if let Some(json) = extract_json_object(raw) {
        if let Ok(decision) = serde_json::from_str::<JsonDecision>(json) {
            let input = match decision.input {
                Some(serde_json::Value::String(s)) => s,
                Some(serde_json::Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            return decision_for(&decision.action, input);
        }
    }

    let mut action = None;
    let mut input = String::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.to_ascii_lowercase().starts_with("final answer") {
            return Ok(Decision::Synthesize);
        }
        if let Some(rest) = line.strip_prefix("Action Input:") {
            input = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Action:") {
            action = Some(rest.trim().to_string());
        }
    }

    match action {
        Some(action) => decision_for(&action, input),
        None => Err("no decision found; reply with {\"action\": ..., \"input\": ...}".to_string()),
    }
}

fn decision_for(action: &str, input: String) -> Result<Decision, String> {
    match action.trim() {
        "final" | "synthesize" | "final_answer" => Ok(Decision::Synthesize),
        tag => tag
            .parse::<ToolKind>()
            .map(|kind| Decision::Call(ToolCall { kind, input })),
    }
}

/// Everything gathered by tool calls so far.
#[derive(Default)]
struct Gathered {
    metrics: Vec<FinancialMetric>,
    sections: Vec<AnalysisSection>,
    market: Option<MarketData>,
    notes: Vec<String>,
}

impl Gathered {
    fn record(&mut self, kind: ToolKind, result: &Result<ToolOutput, ToolError>) {
        match result {
            Ok(ToolOutput::Metrics(m)) => self.metrics = m.clone(),
            Ok(ToolOutput::Passages(s)) => self.sections.extend(s.iter().cloned()),
            Ok(ToolOutput::Quote(q)) => self.market = Some(MarketData::Available(q.clone())),
            Err(ToolError::MarketNotRequested) => self.market = Some(MarketData::NotRequested),
            Err(ToolError::Quote(e)) => {
                self.market = Some(MarketData::Unavailable {
                    reason: e.reason.clone(),
                })
            }
            Err(e) => push_note(&mut self.notes, format!("{}: {}", kind, e)),
        }
    }

    fn market_for(&self, ctx: &ToolContext) -> MarketData {
        match &self.market {
            Some(m) => m.clone(),
            None if ctx.include_market_data() => MarketData::Unavailable {
                reason: "market quote was not fetched".into(),
            },
            None => MarketData::NotRequested,
        }
    }
}

pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    synthesizer: Synthesizer,
    max_iterations: u32,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, schema_retries: u32, max_iterations: u32) -> Self {
        Self {
            synthesizer: Synthesizer::new(model.clone(), schema_retries),
            model,
            max_iterations: max_iterations.max(1),
        }
    }

    pub async fn run(&self, question: &str, ctx: &ToolContext) -> Outcome {
        let mut messages = vec![
            ChatMessage::system(planning_prompt(ctx)),
            ChatMessage::user(question.to_string()),
        ];
        let mut gathered = Gathered::default();
        let mut tools_invoked = Vec::new();
        let mut trace = Vec::new();
        let mut iterations = 0u32;
        let mut answer = None;
        let mut state = AgentState::Planning;

        loop {
            trace.push(state.clone());
            state = match state {
                AgentState::Planning => {
                    if iterations >= self.max_iterations {
                        AgentState::Failed(FailureReason::IterationCeiling)
                    } else {
                        iterations += 1;
                        match self.model.complete(&messages).await {
                            Err(e) => AgentState::Failed(FailureReason::ModelUnavailable(
                                e.to_string(),
                            )),
                            Ok(raw) => {
                                let decision = parse_decision(&raw);
                                messages.push(ChatMessage::assistant(raw));
                                match decision {
                                    Ok(Decision::Call(call)) => AgentState::Acting(call),
                                    Ok(Decision::Synthesize) => AgentState::Synthesizing,
                                    Err(problem) => {
                                        tracing::debug!(iteration = iterations, %problem, "unusable planning decision");
                                        messages.push(ChatMessage::user(format!(
                                            "Invalid decision: {}. Valid actions: {}, final.",
                                            problem,
                                            ToolKind::ALL.map(|k| k.tag()).join(", ")
                                        )));
                                        AgentState::Planning
                                    }
                                }
                            }
                        }
                    }
                }
                AgentState::Acting(call) => {
                    tools_invoked.push(call.kind);
                    let result = ctx.invoke(call.kind, &call.input).await;
                    let observation = match &result {
                        Ok(out) => out.render(),
                        Err(e) => format!("error: {}", e),
                    };
                    gathered.record(call.kind, &result);
                    messages.push(ChatMessage::user(format!(
                        "Observation from {}:\n{}",
                        call.kind, observation
                    )));
                    AgentState::Observing
                }
                AgentState::Observing => {
                    if iterations >= self.max_iterations {
                        AgentState::Failed(FailureReason::IterationCeiling)
                    } else {
                        AgentState::Planning
                    }
                }
                AgentState::Synthesizing => {
                    let market = gathered.market_for(ctx);
                    let context = passages_context(&gathered.sections);
                    match self
                        .synthesizer
                        .synthesize(question, &context, &gathered.metrics, &market)
                        .await
                    {
                        Ok(mut a) => {
                            for note in &gathered.notes {
                                push_note(&mut a.missing_data, note.clone());
                            }
                            answer = Some(a);
                            AgentState::Done
                        }
                        Err(SynthesisError::Schema(e)) => {
                            AgentState::Failed(FailureReason::Synthesis(e.to_string()))
                        }
                        Err(SynthesisError::Model(e)) => {
                            AgentState::Failed(FailureReason::ModelUnavailable(e.to_string()))
                        }
                    }
                }
                AgentState::Done => {
                    let market = gathered.market_for(ctx);
                    let answer =
                        answer.unwrap_or_else(|| ForecastAnswer::safe_default(Vec::new()));
                    tracing::info!(iterations, tools = tools_invoked.len(), "agent produced answer");
                    return Outcome {
                        answer,
                        path: AnswerPath::Agent,
                        metrics: gathered.metrics,
                        market,
                        tools_invoked,
                        iterations,
                        trace,
                    };
                }
                AgentState::Failed(reason) => {
                    tracing::warn!(iterations, %reason, "agent loop failed; using deterministic fallback");
                    let mut outcome = self.fallback(ctx).await;
                    tools_invoked.extend(outcome.tools_invoked);
                    outcome.tools_invoked = tools_invoked;
                    outcome.iterations = iterations;
                    outcome.trace = trace;
                    return outcome;
                }
            };
        }
    }

    /// Gather every input concurrently and assemble an answer without the
    /// model.
    pub async fn fallback(&self, ctx: &ToolContext) -> Outcome {
        let (metrics_result, passages_result, quote_result) = tokio::join!(
            ctx.invoke(ToolKind::ExtractMetrics, ""),
            ctx.invoke(ToolKind::RetrieveQualitative, ""),
            ctx.invoke(ToolKind::MarketQuote, ""),
        );

        let mut tools_invoked = vec![ToolKind::ExtractMetrics, ToolKind::RetrieveQualitative];
        if ctx.include_market_data() {
            tools_invoked.push(ToolKind::MarketQuote);
        }

        let mut gathered = Gathered::default();
        gathered.record(ToolKind::ExtractMetrics, &metrics_result);
        gathered.record(ToolKind::RetrieveQualitative, &passages_result);
        gathered.record(ToolKind::MarketQuote, &quote_result);
        if matches!(
            passages_result,
            Err(ToolError::Index(crate::error::IndexError::EmptyIndex))
        ) {
            push_note(&mut gathered.notes, NO_CONTEXT.to_string());
        }

        let market = gathered.market_for(ctx);
        let has_metrics = !gathered.metrics.is_empty();
        let has_passages = gathered.sections.iter().any(|s| !s.result.hits.is_empty());
        let has_quote = matches!(market, MarketData::Available(_));

        let (answer, path) = if !has_metrics && !has_passages && !has_quote {
            let mut answer = ForecastAnswer::safe_default(gathered.notes.clone());
            annotate_market(&mut answer, &market);
            (answer, AnswerPath::SafeDefault)
        } else {
            (
                build_fallback_answer(&gathered, &market, ctx.symbol()),
                AnswerPath::Fallback,
            )
        };

        Outcome {
            answer,
            path,
            metrics: gathered.metrics,
            market,
            tools_invoked,
            iterations: 0,
            trace: Vec::new(),
        }
    }
}

fn planning_prompt(ctx: &ToolContext) -> String {
    let catalog = ToolKind::ALL
        .iter()
        .filter(|k| **k != ToolKind::MarketQuote || ctx.include_market_data())
        .map(|k| format!("- {}", tools::describe(*k)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You plan a financial forecast for {}. Gather what you need with the tools below, one call per turn, then finish.\n\
         Tools:\n{}\n\n\
         Reply with a single JSON object: {{\"action\": \"<tool>\", \"input\": \"<text>\"}} to call a tool, \
         or {{\"action\": \"final\"}} when you have enough to write the forecast.",
        ctx.symbol().unwrap_or("the company"),
        catalog
    )
}

fn build_fallback_answer(
    gathered: &Gathered,
    market: &MarketData,
    symbol: Option<&str>,
) -> ForecastAnswer {
    let company = symbol.unwrap_or("the company");
    let financial_trends: Vec<String> = gathered.metrics.iter().map(metrics::describe).collect();

    let passages: Vec<&str> = gathered
        .sections
        .iter()
        .flat_map(|s| s.result.hits.iter().map(|h| h.chunk.text.as_str()))
        .collect();
    let (positive, negative) = sentiment_counts(&passages);
    let tone = match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => "positive",
        std::cmp::Ordering::Less => "cautious",
        std::cmp::Ordering::Equal => "neutral",
    };

    let revenue_growth = gathered
        .metrics
        .iter()
        .find(|m| m.name == MetricName::Revenue)
        .and_then(|m| m.growth_pct);

    let mut summary = format!(
        "Automated analysis of {} based on {} financial metrics and {} document passages.",
        company,
        gathered.metrics.len(),
        passages.len()
    );
    if let Some(g) = revenue_growth {
        summary.push_str(&format!(
            " Revenue changed {:+.2}% against the prior period.",
            g
        ));
    }

    let qualitative_assessment = if passages.is_empty() {
        "unknown".to_string()
    } else {
        format!(
            "Management commentary reads {} ({} positive and {} cautionary signals).",
            tone, positive, negative
        )
    };

    let outlook_next_quarter = match revenue_growth {
        Some(g) if g > 0.0 => format!(
            "Recent revenue growth and {} commentary point to continued growth next quarter.",
            tone
        ),
        Some(g) if g < 0.0 => format!(
            "Declining revenue with {} commentary points to continued pressure next quarter.",
            tone
        ),
        Some(_) => "Flat revenue suggests a similar result next quarter.".to_string(),
        None if !passages.is_empty() => format!(
            "Commentary reads {}; no revenue trend was available to quantify the outlook.",
            tone
        ),
        None => "unknown".to_string(),
    };

    let confidence_level = if !gathered.metrics.is_empty() && !passages.is_empty() {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    };

    let mut answer = ForecastAnswer {
        summary,
        financial_trends,
        qualitative_assessment,
        outlook_next_quarter,
        key_risks: keyword_sentences(&passages, &RISK_WORDS),
        key_opportunities: keyword_sentences(&passages, &OPPORTUNITY_WORDS),
        confidence_level,
        disclaimer: DEFAULT_DISCLAIMER.to_string(),
        missing_data: gathered.notes.clone(),
    };
    annotate_market(&mut answer, market);
    answer
}

fn sentiment_counts(passages: &[&str]) -> (usize, usize) {
    let mut positive = 0;
    let mut negative = 0;
    for text in passages {
        let lower = text.to_lowercase();
        positive += POSITIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();
        negative += NEGATIVE_WORDS.iter().filter(|w| lower.contains(*w)).count();
    }
    (positive, negative)
}

/// Distinct sentences mentioning any of `words`, in passage order.
fn keyword_sentences(passages: &[&str], words: &[&str]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for text in passages {
        for sentence in text.split(['.', '!', '?', '\n']) {
            let sentence = sentence.split_whitespace().collect::<Vec<_>>().join(" ");
            if sentence.len() < 15 {
                continue;
            }
            let lower = sentence.to_lowercase();
            if words.iter().any(|w| lower.contains(w)) && !found.contains(&sentence) {
                found.push(sentence);
                if found.len() == FALLBACK_LIST_LEN {
                    return found;
                }
            }
        }
    }
    found
}
