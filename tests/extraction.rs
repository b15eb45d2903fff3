mod common;

use forecast_harness::chunk::chunk_text;
use forecast_harness::config::ExtractionConfig;
use forecast_harness::error::ExtractionErrorKind;
use forecast_harness::extract::TextExtractor;
use forecast_harness::models::{Document, DocumentType};

use common::{pdf_with_text, TRANSCRIPT_TEXT};

fn document(bytes: Vec<u8>) -> Document {
    Document {
        id: "transcript_2024-10-24_call".into(),
        source_url: "https://example.com/call.pdf".into(),
        path: None,
        title: "Earnings call".into(),
        doc_type: DocumentType::Transcript,
        published: None,
        bytes,
    }
}

#[test]
fn extracts_text_from_minimal_pdf_and_releases_bytes() {
    let extractor = TextExtractor::new(&ExtractionConfig::default());
    let mut doc = document(pdf_with_text(TRANSCRIPT_TEXT));

    let extracted = extractor.extract(&mut doc).unwrap();
    assert!(extracted.text.contains("confident in the deal pipeline"));
    assert!(doc.bytes.is_empty());

    let chunks = chunk_text(&doc.source_ref(), &extracted.text, 1000, 200).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].id, "transcript_2024-10-24_call:0");
}

#[test]
fn html_served_as_pdf_is_unreadable() {
    let extractor = TextExtractor::new(&ExtractionConfig::default());
    let mut doc = document(b"<html><body>Access denied</body></html>".to_vec());

    let err = extractor.extract(&mut doc).unwrap_err();
    assert_eq!(err.kind, ExtractionErrorKind::Unreadable);
    assert_eq!(err.attempts.len(), 2);
}

#[test]
fn second_extraction_has_no_content() {
    let extractor = TextExtractor::new(&ExtractionConfig::default());
    let mut doc = document(pdf_with_text(TRANSCRIPT_TEXT));
    extractor.extract(&mut doc).unwrap();

    let err = extractor.extract(&mut doc).unwrap_err();
    assert_eq!(err.kind, ExtractionErrorKind::MissingContent);
}
