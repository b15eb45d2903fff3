//! The orchestrator's capabilities.
//!
//! Tools are a closed set ([`ToolKind`]) dispatched by `match`; there is no
//! runtime registration. A [`ToolContext`] carries everything a tool needs
//! for one request: the metrics extracted during the build phase, the
//! retriever over the shared index, and the quote provider.

use std::sync::Arc;
use thiserror::Error;

use crate::error::{IndexError, QuoteUnavailable};
use crate::market::QuoteProvider;
use crate::metrics;
use crate::models::{FinancialMetric, MarketQuote, RetrievalResult, ToolKind};
use crate::retrieve::{format_analysis, format_context, AnalysisSection, Retriever};

/// Upper bound on passage text shown to the planner per observation.
const OBSERVATION_PASSAGE_CHARS: usize = 600;

#[derive(Debug, Clone)]
pub enum ToolOutput {
    Metrics(Vec<FinancialMetric>),
    Passages(Vec<AnalysisSection>),
    Quote(MarketQuote),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no financial metrics could be extracted")]
    NoMetrics,
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Quote(#[from] QuoteUnavailable),
    #[error("market data was not requested")]
    MarketNotRequested,
    #[error("no company symbol could be derived from the source url")]
    NoSymbol,
}

/// One-line description of each tool for the planning prompt.
pub fn describe(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::ExtractMetrics => {
            "extract_metrics: quarterly financial metrics (revenue, profit, margins, EPS) with growth rates. Input: none."
        }
        ToolKind::RetrieveQualitative => {
            "retrieve_qualitative: passages from transcripts and reports. Input: a search query, or empty for a broad analysis of sentiment, themes, risks, opportunities and guidance."
        }
        ToolKind::MarketQuote => {
            "market_quote: the latest share price for the company. Input: none."
        }
    }
}

pub struct ToolContext {
    metrics: Vec<FinancialMetric>,
    retriever: Retriever,
    quotes: Arc<dyn QuoteProvider>,
    symbol: Option<String>,
    include_market_data: bool,
}

impl ToolContext {
    pub fn new(
        metrics: Vec<FinancialMetric>,
        retriever: Retriever,
        quotes: Arc<dyn QuoteProvider>,
        symbol: Option<String>,
        include_market_data: bool,
    ) -> Self {
        Self {
            metrics,
            retriever,
            quotes,
            symbol,
            include_market_data,
        }
    }

    pub fn include_market_data(&self) -> bool {
        self.include_market_data
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub async fn invoke(&self, kind: ToolKind, input: &str) -> Result<ToolOutput, ToolError> {
        tracing::debug!(tool = %kind, input, "invoking tool");
        match kind {
            ToolKind::ExtractMetrics => self.extract_metrics(),
            ToolKind::RetrieveQualitative => self.retrieve_qualitative(input).await,
            ToolKind::MarketQuote => self.market_quote().await,
        }
    }

    fn extract_metrics(&self) -> Result<ToolOutput, ToolError> {
        if self.metrics.is_empty() {
            return Err(ToolError::NoMetrics);
        }
        Ok(ToolOutput::Metrics(self.metrics.clone()))
    }

    async fn retrieve_qualitative(&self, query: &str) -> Result<ToolOutput, ToolError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(ToolOutput::Passages(
                self.retriever.comprehensive_analysis().await?,
            ));
        }
        let result = self.retriever.retrieve(query).await?;
        Ok(ToolOutput::Passages(vec![AnalysisSection {
            aspect: "query",
            result,
        }]))
    }

    async fn market_quote(&self) -> Result<ToolOutput, ToolError> {
        if !self.include_market_data {
            return Err(ToolError::MarketNotRequested);
        }
        let symbol = self.symbol.as_deref().ok_or(ToolError::NoSymbol)?;
        Ok(ToolOutput::Quote(self.quotes.get_quote(symbol).await?))
    }
}

impl ToolOutput {
    /// Text shown to the planner as the observation for this call.
    pub fn render(&self) -> String {
        match self {
            ToolOutput::Metrics(metrics) => metrics
                .iter()
                .map(metrics::describe)
                .collect::<Vec<_>>()
                .join("\n"),
            ToolOutput::Passages(sections) => {
                let trimmed: Vec<AnalysisSection> = sections
                    .iter()
                    .map(|s| AnalysisSection {
                        aspect: s.aspect,
                        result: truncate_hits(&s.result),
                    })
                    .collect();
                format_analysis(&trimmed)
            }
            ToolOutput::Quote(q) => format!(
                "{} last traded at {:.2} ({})",
                q.symbol,
                q.price,
                q.timestamp.to_rfc3339()
            ),
        }
    }
}

fn truncate_hits(result: &RetrievalResult) -> RetrievalResult {
    let mut result = result.clone();
    for hit in &mut result.hits {
        if hit.chunk.text.chars().count() > OBSERVATION_PASSAGE_CHARS {
            let cut: String = hit.chunk.text.chars().take(OBSERVATION_PASSAGE_CHARS).collect();
            hit.chunk.text = format!("{}...", cut);
        }
    }
    result
}

/// Full passage text of every section, used as synthesis context.
pub fn passages_context(sections: &[AnalysisSection]) -> String {
    if sections.len() == 1 {
        return format_context(&sections[0].result);
    }
    format_analysis(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityMetric;
    use crate::embedding::{Embedder, HashEmbedder};
    use crate::index::{SharedIndex, VectorIndex};
    use crate::market::DisabledQuoteProvider;
    use crate::models::{MetricName, MetricUnit};

    fn context(metrics: Vec<FinancialMetric>, include_market: bool) -> ToolContext {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let index = VectorIndex::empty(embedder.as_ref(), SimilarityMetric::Cosine);
        let retriever = Retriever::new(SharedIndex::new(index, embedder, 8), 3);
        ToolContext::new(
            metrics,
            retriever,
            Arc::new(DisabledQuoteProvider),
            Some("TCS".into()),
            include_market,
        )
    }

    #[tokio::test]
    async fn metrics_tool_reports_absence() {
        let ctx = context(Vec::new(), false);
        assert!(matches!(
            ctx.invoke(ToolKind::ExtractMetrics, "").await,
            Err(ToolError::NoMetrics)
        ));

        let ctx = context(
            vec![FinancialMetric {
                period: "Sep 2024".into(),
                name: MetricName::Eps,
                value: 33.06,
                unit: MetricUnit::Rupees,
                growth_pct: None,
            }],
            false,
        );
        let out = ctx.invoke(ToolKind::ExtractMetrics, "").await.unwrap();
        assert_eq!(out.render(), "eps Sep 2024: 33.06 rupees");
    }

    #[tokio::test]
    async fn retrieval_over_empty_index_fails() {
        let ctx = context(Vec::new(), false);
        let err = ctx
            .invoke(ToolKind::RetrieveQualitative, "outlook")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Index(IndexError::EmptyIndex)));
    }

    #[tokio::test]
    async fn quote_respects_request_flag() {
        let ctx = context(Vec::new(), false);
        assert!(matches!(
            ctx.invoke(ToolKind::MarketQuote, "").await,
            Err(ToolError::MarketNotRequested)
        ));

        let ctx = context(Vec::new(), true);
        assert!(matches!(
            ctx.invoke(ToolKind::MarketQuote, "").await,
            Err(ToolError::Quote(_))
        ));
    }

    #[test]
    fn every_tool_is_described_by_its_tag() {
        for kind in ToolKind::ALL {
            assert!(describe(kind).starts_with(kind.tag()));
        }
    }
}
