//! Qualitative retrieval over the shared index.
//!
//! A thin layer over [`SharedIndex::query_within`] that fixes `k` and the
//! documents in scope, renders hits as attributed context for the model, and
//! runs the canned analysis queries the fallback path relies on.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::IndexError;
use crate::index::SharedIndex;
use crate::models::RetrievalResult;

/// Hits per query in [`Retriever::comprehensive_analysis`].
pub const ANALYSIS_K: usize = 3;

/// Aspect name and query text for each comprehensive-analysis query.
pub const ANALYSIS_QUERIES: [(&str, &str); 5] = [
    (
        "management_sentiment",
        "management sentiment tone confidence outlook commentary",
    ),
    (
        "key_themes",
        "key business themes strategy deal wins demand growth drivers",
    ),
    (
        "risks",
        "risks headwinds challenges uncertainty pressure decline slowdown",
    ),
    (
        "opportunities",
        "opportunities expansion new clients pipeline investment growth",
    ),
    (
        "forward_statements",
        "guidance expect next quarter forward looking outlook going ahead",
    ),
];

#[derive(Clone)]
pub struct Retriever {
    index: SharedIndex,
    k: usize,
    scope: Option<Arc<HashSet<String>>>,
}

/// One aspect of the comprehensive analysis.
#[derive(Debug, Clone)]
pub struct AnalysisSection {
    pub aspect: &'static str,
    pub result: RetrievalResult,
}

impl Retriever {
    pub fn new(index: SharedIndex, k: usize) -> Self {
        Self {
            index,
            k: k.max(1),
            scope: None,
        }
    }

    /// Only return chunks of the documents in `document_ids`.
    pub fn within(mut self, document_ids: impl IntoIterator<Item = String>) -> Self {
        self.scope = Some(Arc::new(document_ids.into_iter().collect()));
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub async fn retrieve(&self, query: &str) -> Result<RetrievalResult, IndexError> {
        self.retrieve_k(query, self.k).await
    }

    pub async fn retrieve_k(&self, query: &str, k: usize) -> Result<RetrievalResult, IndexError> {
        let result = self
            .index
            .query_within(query, k, self.scope.as_deref())
            .await?;
        tracing::debug!(query, hits = result.hits.len(), "retrieved passages");
        Ok(result)
    }

    /// Run every analysis query at [`ANALYSIS_K`]. Fails only if the index
    /// is empty; other per-query failures drop that aspect.
    pub async fn comprehensive_analysis(&self) -> Result<Vec<AnalysisSection>, IndexError> {
        let mut sections = Vec::with_capacity(ANALYSIS_QUERIES.len());
        for (aspect, query) in ANALYSIS_QUERIES {
            match self.retrieve_k(query, ANALYSIS_K).await {
                Ok(result) => sections.push(AnalysisSection { aspect, result }),
                Err(IndexError::EmptyIndex) => return Err(IndexError::EmptyIndex),
                Err(e) => tracing::warn!(aspect, error = %e, "analysis query failed"),
            }
        }
        Ok(sections)
    }
}

/// Render hits as numbered passages with their source attribution.
pub fn format_context(result: &RetrievalResult) -> String {
    let mut out = String::new();
    for (i, hit) in result.hits.iter().enumerate() {
        let source = &hit.chunk.source;
        let date = source
            .published
            .map(|d| d.to_string())
            .unwrap_or_else(|| "undated".to_string());
        let _ = writeln!(
            out,
            "[{}] {} ({}, {}) score={:.3}\n{}\n",
            i + 1,
            source.label,
            source.doc_type,
            date,
            hit.score,
            hit.chunk.text.trim()
        );
    }
    out
}

/// Render the comprehensive analysis as one context block per aspect.
pub fn format_analysis(sections: &[AnalysisSection]) -> String {
    sections
        .iter()
        .map(|s| format!("## {}\n{}", s.aspect, format_context(&s.result)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityMetric;
    use crate::embedding::{Embedder, HashEmbedder};
    use crate::index::VectorIndex;
    use crate::models::{DocumentType, SourceRef, TextChunk};
    use std::sync::Arc;

    fn chunk(i: usize, text: &str) -> TextChunk {
        TextChunk {
            id: format!("call:{}", i),
            source: SourceRef {
                document_id: "call".into(),
                label: "Q2 earnings call".into(),
                url: "https://example.com/call.pdf".into(),
                doc_type: DocumentType::Transcript,
                published: None,
            },
            index: i,
            start: 0,
            end: text.chars().count(),
            text: text.into(),
            hash: String::new(),
        }
    }

    async fn retriever(texts: &[&str]) -> Retriever {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(256));
        let index = VectorIndex::empty(embedder.as_ref(), SimilarityMetric::Cosine);
        let shared = SharedIndex::new(index, embedder, 16);
        let chunks = texts.iter().enumerate().map(|(i, t)| chunk(i, t)).collect();
        shared.add(chunks).await.unwrap();
        Retriever::new(shared, 2)
    }

    #[tokio::test]
    async fn retrieve_uses_configured_k() {
        let r = retriever(&["margin pressure", "deal pipeline", "attrition", "pricing"]).await;
        let result = r.retrieve("deal pipeline").await.unwrap();
        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.hits[0].chunk.text, "deal pipeline");
    }

    #[tokio::test]
    async fn comprehensive_analysis_covers_every_aspect() {
        let r = retriever(&[
            "Management is confident about demand.",
            "Risks include currency headwinds.",
            "New clients expand the pipeline.",
            "We expect growth next quarter.",
        ])
        .await;
        let sections = r.comprehensive_analysis().await.unwrap();
        assert_eq!(sections.len(), ANALYSIS_QUERIES.len());
        assert!(sections.iter().all(|s| s.result.hits.len() <= ANALYSIS_K));
        let text = format_analysis(&sections);
        assert!(text.contains("## risks"));
        assert!(text.contains("Q2 earnings call (transcript, undated)"));
    }

    #[tokio::test]
    async fn scoped_retriever_ignores_other_documents() {
        let r = retriever(&["deal pipeline", "margin pressure"]).await;
        let scoped = r.clone().within(["call".to_string()]);
        assert_eq!(scoped.retrieve("deal").await.unwrap().hits.len(), 2);

        let elsewhere = r.within(["other_company_call".to_string()]);
        assert!(matches!(elsewhere.retrieve("deal").await, Err(IndexError::EmptyIndex)));
        assert!(matches!(
            elsewhere.comprehensive_analysis().await,
            Err(IndexError::EmptyIndex)
        ));
    }

    #[tokio::test]
    async fn empty_index_is_reported() {
        let r = retriever(&[]).await;
        assert!(matches!(r.retrieve("x").await, Err(IndexError::EmptyIndex)));
        assert!(matches!(
            r.comprehensive_analysis().await,
            Err(IndexError::EmptyIndex)
        ));
    }
}
