//! The forecast request pipeline.
//!
//! ```text
//!  request ─▶ validate ─▶ fetch page ─▶ acquire ─▶ extract ─▶ chunk ─▶ index.add ─▶ save
//!                              │                                                     │
//!                              └──▶ metrics (page table + document text) ◀───────────┘
//!                                                   │
//!                                          Orchestrator::run ─▶ response ─▶ request log
//! ```
//!
//! Build-phase failures never fail the request: each one becomes a
//! missing-data note on the answer and the pipeline continues with whatever
//! it has. The index persists across requests, but retrieval is scoped to
//! the documents of the current request's source.
//!
//! `pipeline.request_timeout_secs` bounds the build phase and the agent loop
//! together. When it expires the running step is abandoned (files written and
//! chunks indexed so far stay), the deterministic fallback answers from what
//! was gathered, and the answer notes which step timed out. Only an invalid
//! request surfaces as [`ServiceError`].

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{timeout, timeout_at};
use url::Url;
use uuid::Uuid;

use crate::acquire::Acquirer;
use crate::agent::{Orchestrator, Outcome};
use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::ServiceError;
use crate::extract::TextExtractor;
use crate::index::{SharedIndex, VectorIndex};
use crate::llm::{create_model, LanguageModel};
use crate::market::{create_quote_provider, symbol_from_url, QuoteProvider};
use crate::metrics;
use crate::models::{
    AnswerPath, Document, DocumentType, FinancialMetric, ForecastAnswer, ForecastRequest,
    ForecastResponse, MarketData, SourceRef,
};
use crate::request_log::{create_request_log, RequestLogEntry, RequestLogSink, RequestStatus};
use crate::retrieve::Retriever;
use crate::scrape;
use crate::synth::{annotate_market, push_note};
use crate::tools::ToolContext;

/// The external collaborators a [`ForecastService`] is assembled from.
pub struct Collaborators {
    pub acquirer: Acquirer,
    pub index: SharedIndex,
    pub model: Arc<dyn LanguageModel>,
    pub quotes: Arc<dyn QuoteProvider>,
    pub request_log: Arc<dyn RequestLogSink>,
}

impl Collaborators {
    /// Build every collaborator from configuration, loading the persisted
    /// index when one exists.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let index = VectorIndex::load_or_empty(
            &config.workspace.index_dir,
            embedder.as_ref(),
            config.retrieval.metric,
        )?;
        Ok(Self {
            acquirer: Acquirer::new(&config.acquisition, &config.workspace.document_dir)?,
            index: SharedIndex::new(index, embedder, config.embedding.batch_size),
            model: create_model(&config.llm)?,
            quotes: create_quote_provider(&config.market)?,
            request_log: create_request_log(&config.request_log).await?,
        })
    }
}

/// Time the deterministic fallback may take once the request deadline has
/// passed.
const FALLBACK_GRACE: Duration = Duration::from_secs(30);

/// What the build phase produced for one source.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub documents_used: Vec<String>,
    /// Every document whose text was handed to the index, the source page
    /// included. Retrieval for the request is limited to these.
    pub sources: Vec<String>,
    pub chunks_added: usize,
    pub metrics: Vec<FinancialMetric>,
    pub notes: Vec<String>,
}

/// A pipeline step abandoned at the request deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Build,
    Agent,
    Fallback,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Step::Build => "document build",
            Step::Agent => "agent loop",
            Step::Fallback => "deterministic fallback",
        }
    }
}

fn timeout_note(step: Step) -> String {
    format!("request timed out during {}", step.as_str())
}

pub struct ForecastService {
    config: Config,
    acquirer: Acquirer,
    extractor: Arc<TextExtractor>,
    index: SharedIndex,
    model: Arc<dyn LanguageModel>,
    quotes: Arc<dyn QuoteProvider>,
    request_log: Arc<dyn RequestLogSink>,
}

impl ForecastService {
    pub fn new(config: Config, parts: Collaborators) -> Self {
        Self {
            extractor: Arc::new(TextExtractor::new(&config.extraction)),
            config,
            acquirer: parts.acquirer,
            index: parts.index,
            model: parts.model,
            quotes: parts.quotes,
            request_log: parts.request_log,
        }
    }

    pub async fn from_config(config: Config) -> Result<Self> {
        let parts = Collaborators::from_config(&config).await?;
        Ok(Self::new(config, parts))
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn acquirer(&self) -> &Acquirer {
        &self.acquirer
    }

    /// Answer one forecast request.
    pub async fn forecast(
        &self,
        request: ForecastRequest,
    ) -> Result<ForecastResponse, ServiceError> {
        let request_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = match validate_request(&request) {
            Err(e) => Err(e),
            Ok(()) => Ok(self.run(request_id, &request).await),
        };

        let (status, response_json, error_message, tools_used) = match &result {
            Ok((response, timed_out)) => (
                if timed_out.is_some() {
                    RequestStatus::TimedOut
                } else {
                    RequestStatus::Completed
                },
                serde_json::to_string(response).ok(),
                timed_out.map(timeout_note),
                response.tools_invoked.clone(),
            ),
            Err(e) => (RequestStatus::Failed, None, Some(e.to_string()), Vec::new()),
        };

        let entry = RequestLogEntry {
            request_id,
            company_symbol: symbol_from_url(&request.source_url),
            source_url: request.source_url.clone(),
            periods: request.periods_requested,
            request_json: serde_json::to_string(&request).unwrap_or_default(),
            response_json,
            status,
            error_message,
            duration_ms: clock.elapsed().as_millis() as u64,
            tools_used,
            started_at,
            completed_at: Utc::now(),
        };
        if let Err(e) = self.request_log.record(&entry).await {
            tracing::warn!(%request_id, error = %e, "failed to write request log");
        }

        match &result {
            Ok((r, timed_out)) => tracing::info!(
                %request_id,
                path = ?r.path,
                timed_out = timed_out.map(Step::as_str),
                duration_ms = entry.duration_ms,
                "forecast complete"
            ),
            Err(e) => tracing::warn!(%request_id, error = %e, "forecast rejected"),
        }
        result.map(|(response, _)| response)
    }

    async fn run(
        &self,
        request_id: Uuid,
        request: &ForecastRequest,
    ) -> (ForecastResponse, Option<Step>) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.pipeline.request_timeout_secs);
        let symbol = symbol_from_url(&request.source_url);
        let periods = request.periods_requested as usize;
        tracing::info!(%request_id, source = %request.source_url, ?symbol, periods, "forecast started");

        let mut timed_out = None;
        let mut report = BuildReport::default();
        if timeout_at(
            deadline,
            self.build_into(&request.source_url, periods, &mut report),
        )
        .await
        .is_err()
        {
            tracing::warn!(%request_id, "request deadline reached during document build");
            timed_out = Some(Step::Build);
        }

        let ctx = ToolContext::new(
            report.metrics.clone(),
            Retriever::new(self.index.clone(), self.config.retrieval.k)
                .within(report.sources.iter().cloned()),
            self.quotes.clone(),
            symbol.clone(),
            request.include_market_data,
        );
        let orchestrator = Orchestrator::new(
            self.model.clone(),
            self.config.llm.schema_retries,
            self.config.agent.max_iterations,
        );
        let question = format!(
            "Forecast the next-quarter business outlook for {} using the latest {} reporting periods.",
            symbol.as_deref().unwrap_or(&request.source_url),
            periods
        );

        let mut outcome = if timed_out.is_some() {
            self.fallback_within_grace(&orchestrator, &ctx).await
        } else {
            match timeout_at(deadline, orchestrator.run(&question, &ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(%request_id, "request deadline reached during agent loop");
                    timed_out = Some(Step::Agent);
                    self.fallback_within_grace(&orchestrator, &ctx).await
                }
            }
        };

        if let Some(step) = timed_out {
            push_note(&mut outcome.answer.missing_data, timeout_note(step));
        }
        for note in report.notes {
            push_note(&mut outcome.answer.missing_data, note);
        }

        let response = ForecastResponse {
            request_id,
            answer: outcome.answer,
            metrics: if outcome.metrics.is_empty() {
                report.metrics
            } else {
                outcome.metrics
            },
            tools_invoked: outcome.tools_invoked,
            market: outcome.market,
            path: outcome.path,
            documents_used: report.documents_used,
        };
        (response, timed_out)
    }

    /// The deterministic fallback, bounded by [`FALLBACK_GRACE`]. If even
    /// that expires the answer is the safe default.
    async fn fallback_within_grace(&self, orchestrator: &Orchestrator, ctx: &ToolContext) -> Outcome {
        if let Ok(outcome) = timeout(FALLBACK_GRACE, orchestrator.fallback(ctx)).await {
            return outcome;
        }
        tracing::warn!("deterministic fallback exceeded its grace period");
        let market = if ctx.include_market_data() {
            MarketData::Unavailable {
                reason: timeout_note(Step::Fallback),
            }
        } else {
            MarketData::NotRequested
        };
        let mut answer = ForecastAnswer::safe_default(vec![timeout_note(Step::Fallback)]);
        annotate_market(&mut answer, &market);
        Outcome {
            answer,
            path: AnswerPath::SafeDefault,
            metrics: Vec::new(),
            market,
            tools_invoked: Vec::new(),
            iterations: 0,
            trace: Vec::new(),
        }
    }

    /// Acquire, extract, chunk and index everything reachable from
    /// `source_url`, and compute the period metrics.
    pub async fn build(&self, source_url: &str, periods: usize) -> BuildReport {
        let mut report = BuildReport::default();
        self.build_into(source_url, periods, &mut report).await;
        report
    }

    /// [`ForecastService::build`] writing into `report` as it goes, so an
    /// abandoned build still leaves what it had finished.
    async fn build_into(&self, source_url: &str, periods: usize, report: &mut BuildReport) {
        let (base, html) = match self.acquirer.fetch_page(source_url).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(source = source_url, error = %e, "source page unavailable");
                report.notes.push(format!("source page unavailable: {}", e));
                return;
            }
        };

        let page_text = scrape::visible_text(&html);
        let mut texts = vec![(scrape::page_source(source_url, &page_text), page_text)];

        match self
            .acquirer
            .acquire_from_page(&base, &html, self.config.acquisition.max_documents_per_type)
            .await
        {
            Ok(documents) => {
                let extracted = self.extract_all(documents, &mut report.notes).await;
                report.documents_used = extracted.iter().map(|(s, _)| s.document_id.clone()).collect();
                texts.extend(extracted);
            }
            Err(e) => {
                tracing::warn!(source = source_url, error = %e, "document acquisition failed");
                report.notes.push(format!("documents unavailable: {}", e));
            }
        }

        let table = metrics::extract_from_table(&html, periods);
        let from_text: Vec<FinancialMetric> = texts
            .iter()
            .filter(|(s, _)| s.doc_type != DocumentType::ScrapedPage)
            .flat_map(|(_, text)| metrics::extract_from_text(text, periods))
            .collect();
        report.metrics = metrics::merge(table, from_text);
        if report.metrics.is_empty() {
            report.notes.push("no financial metrics found".to_string());
        }

        report.sources = texts.iter().map(|(s, _)| s.document_id.clone()).collect();
        report.chunks_added = self.index_texts(texts, &mut report.notes).await;
    }

    /// Extract, chunk and index documents already on disk.
    pub async fn index_documents(&self, documents: Vec<Document>) -> BuildReport {
        let mut report = BuildReport::default();
        let extracted = self.extract_all(documents, &mut report.notes).await;
        report.documents_used = extracted.iter().map(|(s, _)| s.document_id.clone()).collect();
        report.sources = report.documents_used.clone();
        report.chunks_added = self.index_texts(extracted, &mut report.notes).await;
        report
    }

    /// Extract each document off the async runtime. Unreadable documents are
    /// skipped with a note.
    async fn extract_all(
        &self,
        documents: Vec<Document>,
        notes: &mut Vec<String>,
    ) -> Vec<(SourceRef, String)> {
        let mut out = Vec::with_capacity(documents.len());
        for mut document in documents {
            let source = document.source_ref();
            let extractor = self.extractor.clone();
            let joined =
                tokio::task::spawn_blocking(move || extractor.extract(&mut document)).await;
            match joined {
                Ok(Ok(extracted)) => {
                    tracing::info!(
                        document = %source.document_id,
                        strategy = extracted.strategy,
                        "document extracted"
                    );
                    out.push((source, extracted.text));
                }
                Ok(Err(e)) => notes.push(format!("document {} unreadable", e.document)),
                Err(e) => notes.push(format!(
                    "document {} extraction aborted: {}",
                    source.document_id, e
                )),
            }
        }
        out
    }

    async fn index_texts(&self, texts: Vec<(SourceRef, String)>, notes: &mut Vec<String>) -> usize {
        let size = self.config.chunking.size;
        let overlap = self.config.chunking.overlap;

        let mut chunks = Vec::new();
        for (source, text) in &texts {
            match chunk_text(source, text, size, overlap) {
                Ok(c) => chunks.extend(c),
                Err(e) => {
                    notes.push(format!("document {} not chunked: {}", source.document_id, e));
                }
            }
        }

        let added = match self.index.add(chunks).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "indexing failed");
                notes.push(format!("indexing failed: {}", e));
                return 0;
            }
        };

        if added > 0 {
            if let Err(e) = self.index.save(&self.config.workspace.index_dir).await {
                tracing::warn!(error = %e, "failed to persist index");
            }
        }
        tracing::info!(added, total = self.index.len().await, "index updated");
        added
    }
}

/// Reject requests the pipeline cannot act on.
pub fn validate_request(request: &ForecastRequest) -> Result<(), ServiceError> {
    if request.periods_requested == 0 {
        return Err(ServiceError::InvalidRequest(
            "periods_requested must be >= 1".to_string(),
        ));
    }
    let url = Url::parse(&request.source_url).map_err(|e| {
        ServiceError::InvalidRequest(format!("invalid source_url '{}': {}", request.source_url, e))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ServiceError::InvalidRequest(format!(
            "source_url must be http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(())
}
