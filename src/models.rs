//! Core data models used throughout the forecasting core.
//!
//! These types represent the documents, chunks, metrics and answers that
//! flow through the build phase (acquire → extract → chunk → index) and the
//! query phase (retrieve → synthesize).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of financial disclosure a downloaded document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Transcript,
    Presentation,
    AnnualReport,
    QuarterlyResult,
    /// Text scraped from the source page itself rather than a download.
    ScrapedPage,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Transcript => "transcript",
            DocumentType::Presentation => "presentation",
            DocumentType::AnnualReport => "annual_report",
            DocumentType::QuarterlyResult => "quarterly_result",
            DocumentType::ScrapedPage => "scraped_page",
            DocumentType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A downloaded source document.
///
/// The raw bytes are owned here until [`Document::take_bytes`] hands them to
/// the extractor.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_url: String,
    pub path: Option<PathBuf>,
    pub title: String,
    pub doc_type: DocumentType,
    pub published: Option<NaiveDate>,
    pub bytes: Vec<u8>,
}

impl Document {
    /// Release the raw bytes, leaving the document as metadata only.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }

    /// Attribution reference carried by every chunk cut from this document.
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            document_id: self.id.clone(),
            label: self.title.clone(),
            url: self.source_url.clone(),
            doc_type: self.doc_type,
            published: self.published,
        }
    }
}

/// Where a chunk came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub label: String,
    pub url: String,
    pub doc_type: DocumentType,
    pub published: Option<NaiveDate>,
}

/// A bounded span of a document's extracted text.
///
/// `start` and `end` are character offsets into the extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: String,
    pub source: SourceRef,
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: TextChunk,
    pub score: f32,
}

/// Top-K hits for one query, best first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub hits: Vec<ScoredChunk>,
}

/// Closed set of metrics the extractor recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Revenue,
    Expenses,
    OperatingProfit,
    OperatingMargin,
    NetProfit,
    Eps,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Revenue => "revenue",
            MetricName::Expenses => "expenses",
            MetricName::OperatingProfit => "operating_profit",
            MetricName::OperatingMargin => "operating_margin",
            MetricName::NetProfit => "net_profit",
            MetricName::Eps => "eps",
        }
    }

    /// Unit values of this metric are reported in.
    pub fn unit(&self) -> MetricUnit {
        match self {
            MetricName::OperatingMargin => MetricUnit::Percent,
            MetricName::Eps => MetricUnit::Rupees,
            _ => MetricUnit::Crore,
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Crore,
    Percent,
    Rupees,
}

/// One metric value for one reporting period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialMetric {
    pub period: String,
    pub name: MetricName,
    pub value: f64,
    pub unit: MetricUnit,
    /// Percent change against the prior period, when that period exists and
    /// its value is non-zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growth_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl FromStr for ConfidenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(ConfidenceLevel::High),
            "medium" => Ok(ConfidenceLevel::Medium),
            "low" => Ok(ConfidenceLevel::Low),
            other => Err(format!("unknown confidence level '{}'", other)),
        }
    }
}

/// The validated structured forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastAnswer {
    pub summary: String,
    pub financial_trends: Vec<String>,
    pub qualitative_assessment: String,
    pub outlook_next_quarter: String,
    pub key_risks: Vec<String>,
    pub key_opportunities: Vec<String>,
    pub confidence_level: ConfidenceLevel,
    pub disclaimer: String,
    /// Data that could not be obtained for this answer.
    #[serde(default)]
    pub missing_data: Vec<String>,
}

pub const DEFAULT_DISCLAIMER: &str = "This forecast is generated automatically from public \
disclosures and may be incomplete or inaccurate. It is not investment advice.";

impl ForecastAnswer {
    /// Answer returned when neither the agent loop nor any fallback step
    /// produced usable data.
    pub fn safe_default(missing_data: Vec<String>) -> Self {
        Self {
            summary: "unknown".to_string(),
            financial_trends: Vec::new(),
            qualitative_assessment: "unknown".to_string(),
            outlook_next_quarter: "unknown".to_string(),
            key_risks: Vec::new(),
            key_opportunities: Vec::new(),
            confidence_level: ConfidenceLevel::Low,
            disclaimer: DEFAULT_DISCLAIMER.to_string(),
            missing_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Market data as reported on a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MarketData {
    Available(MarketQuote),
    Unavailable { reason: String },
    NotRequested,
}

/// The closed set of capabilities the orchestrator can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ExtractMetrics,
    RetrieveQualitative,
    MarketQuote,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [
        ToolKind::ExtractMetrics,
        ToolKind::RetrieveQualitative,
        ToolKind::MarketQuote,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            ToolKind::ExtractMetrics => "extract_metrics",
            ToolKind::RetrieveQualitative => "retrieve_qualitative",
            ToolKind::MarketQuote => "market_quote",
        }
    }
}

impl FromStr for ToolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        ToolKind::ALL
            .into_iter()
            .find(|k| k.tag() == tag)
            .ok_or_else(|| format!("unknown tool '{}'", tag))
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub source_url: String,
    pub periods_requested: u32,
    pub include_market_data: bool,
}

/// Which path produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerPath {
    Agent,
    Fallback,
    SafeDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastResponse {
    pub request_id: Uuid,
    pub answer: ForecastAnswer,
    pub metrics: Vec<FinancialMetric>,
    pub tools_invoked: Vec<ToolKind>,
    pub market: MarketData,
    pub path: AnswerPath,
    pub documents_used: Vec<String>,
}
