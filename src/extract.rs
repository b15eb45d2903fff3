//! PDF text extraction with an ordered strategy fallback.
//!
//! PDFs vary widely in internal encoding and no single parser handles every
//! file. The extractor runs its strategies in a fixed order and returns the
//! output of the first one that yields non-trivial text:
//!
//! | Order | Strategy | Backend |
//! |-------|----------|---------|
//! | A | [`PdfExtractStrategy`] | `pdf-extract` (panics are caught) |
//! | B | [`LopdfStrategy`] | `lopdf` page content streams |
//!
//! A strategy fails when it errors, panics, or produces fewer than
//! `min_chars` non-whitespace characters. When every strategy fails the
//! document is reported as [`ExtractionErrorKind::Unreadable`]. Scanned
//! image-only documents land here; there is no OCR.

use anyhow::{anyhow, Result};
use std::panic::{self, AssertUnwindSafe};

use crate::config::ExtractionConfig;
use crate::error::{ExtractionError, ExtractionErrorKind};
use crate::models::Document;

/// One way of turning PDF bytes into text.
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, bytes: &[u8]) -> Result<String>;
}

/// Text produced by the first successful strategy.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    pub strategy: &'static str,
}

pub struct PdfExtractStrategy;

impl ExtractionStrategy for PdfExtractStrategy {
    fn name(&self) -> &'static str {
        "pdf-extract"
    }

    fn extract(&self, bytes: &[u8]) -> Result<String> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem(bytes)
        }));
        match outcome {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(anyhow!("{}", e)),
            Err(_) => Err(anyhow!("parser panicked")),
        }
    }
}

/// Reads text operators page by page, up to `max_pages`.
pub struct LopdfStrategy {
    pub max_pages: usize,
}

impl ExtractionStrategy for LopdfStrategy {
    fn name(&self) -> &'static str {
        "lopdf"
    }

    fn extract(&self, bytes: &[u8]) -> Result<String> {
        let max_pages = self.max_pages;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<String> {
            let doc = lopdf::Document::load_mem(bytes)?;
            let pages: Vec<u32> = doc.get_pages().keys().copied().take(max_pages).collect();
            if pages.is_empty() {
                return Err(anyhow!("document has no pages"));
            }
            Ok(doc.extract_text(&pages)?)
        }));
        outcome.unwrap_or_else(|_| Err(anyhow!("parser panicked")))
    }
}

pub struct TextExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    min_chars: usize,
}

impl TextExtractor {
    /// The default strategy order: `pdf-extract`, then `lopdf`.
    pub fn new(config: &ExtractionConfig) -> Self {
        Self::with_strategies(
            vec![
                Box::new(PdfExtractStrategy),
                Box::new(LopdfStrategy {
                    max_pages: config.max_pages,
                }),
            ],
            config.min_chars,
        )
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ExtractionStrategy>>, min_chars: usize) -> Self {
        Self {
            strategies,
            min_chars,
        }
    }

    /// Extract a document's text, releasing its raw bytes.
    pub fn extract(&self, document: &mut Document) -> Result<ExtractedText, ExtractionError> {
        let bytes = document.take_bytes();
        if bytes.is_empty() {
            return Err(ExtractionError {
                kind: ExtractionErrorKind::MissingContent,
                document: document.id.clone(),
                attempts: Vec::new(),
            });
        }
        self.extract_bytes(&document.id, &bytes)
    }

    pub fn extract_bytes(&self, label: &str, bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            match strategy.extract(bytes) {
                Ok(raw) => {
                    let text = normalize_text(&raw);
                    let significant = text.chars().filter(|c| !c.is_whitespace()).count();
                    if significant >= self.min_chars {
                        tracing::debug!(
                            document = label,
                            strategy = strategy.name(),
                            chars = text.len(),
                            "extracted text"
                        );
                        return Ok(ExtractedText {
                            text,
                            strategy: strategy.name(),
                        });
                    }
                    attempts.push(format!(
                        "{}: near-empty output ({} chars)",
                        strategy.name(),
                        significant
                    ));
                }
                Err(e) => attempts.push(format!("{}: {}", strategy.name(), e)),
            }
            tracing::debug!(document = label, strategy = strategy.name(), "strategy failed");
        }

        tracing::warn!(document = label, ?attempts, "document unreadable");
        Err(ExtractionError {
            kind: ExtractionErrorKind::Unreadable,
            document: label.to_string(),
            attempts,
        })
    }
}

/// Trim trailing spaces on each line and collapse runs of blank lines into
/// a single paragraph break.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0;

    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        out.push_str(line);
        blank_run = 0;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, Result<&'static str, &'static str>);

    impl ExtractionStrategy for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
        fn extract(&self, _bytes: &[u8]) -> Result<String> {
            self.1.map(str::to_string).map_err(|e| anyhow!(e))
        }
    }

    struct Panics;

    impl ExtractionStrategy for Panics {
        fn name(&self) -> &'static str {
            "panics"
        }
        fn extract(&self, _bytes: &[u8]) -> Result<String> {
            let outcome = panic::catch_unwind(|| -> String { panic!("bad xref") });
            outcome.map_err(|_| anyhow!("parser panicked"))
        }
    }

    const GOOD: &str = "Revenue from operations rose to Rs 59,381 crore this quarter.";

    #[test]
    fn falls_back_to_second_strategy_on_error() {
        let extractor = TextExtractor::with_strategies(
            vec![Box::new(Fixed("a", Err("broken"))), Box::new(Fixed("b", Ok(GOOD)))],
            20,
        );
        let out = extractor.extract_bytes("doc", b"%PDF").unwrap();
        assert_eq!(out.strategy, "b");
        assert_eq!(out.text, GOOD);
    }

    #[test]
    fn near_empty_output_counts_as_failure() {
        let extractor = TextExtractor::with_strategies(
            vec![Box::new(Fixed("a", Ok("  \n\n  x "))), Box::new(Fixed("b", Ok(GOOD)))],
            20,
        );
        let out = extractor.extract_bytes("doc", b"%PDF").unwrap();
        assert_eq!(out.strategy, "b");
    }

    #[test]
    fn first_success_wins_even_if_later_strategy_is_better() {
        let extractor = TextExtractor::with_strategies(
            vec![
                Box::new(Fixed("a", Ok("Short but sufficient text output here."))),
                Box::new(Fixed("b", Ok(GOOD))),
            ],
            20,
        );
        assert_eq!(extractor.extract_bytes("doc", b"%PDF").unwrap().strategy, "a");
    }

    #[test]
    fn all_failures_report_unreadable_with_every_attempt() {
        let extractor = TextExtractor::with_strategies(
            vec![Box::new(Panics), Box::new(Fixed("b", Ok("")))],
            20,
        );
        let err = extractor.extract_bytes("scan.pdf", b"%PDF").unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::Unreadable);
        assert_eq!(err.attempts.len(), 2);
        assert!(err.attempts[0].contains("panicked"));
        assert!(err.attempts[1].contains("near-empty"));
    }

    #[test]
    fn garbage_bytes_are_unreadable_with_default_strategies() {
        let extractor = TextExtractor::new(&ExtractionConfig::default());
        let err = extractor
            .extract_bytes("junk", b"this is not a pdf at all")
            .unwrap_err();
        assert_eq!(err.kind, ExtractionErrorKind::Unreadable);
    }

    #[test]
    fn normalize_collapses_blank_runs() {
        let raw = "Line one   \n\n\n\nLine two\nLine three  \n\n";
        assert_eq!(normalize_text(raw), "Line one\n\nLine two\nLine three");
    }
}
