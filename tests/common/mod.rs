#![allow(dead_code)]

use chrono::NaiveDate;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use forecast_harness::acquire::Acquirer;
use forecast_harness::config::Config;
use forecast_harness::embedding::create_embedder;
use forecast_harness::index::{SharedIndex, VectorIndex};
use forecast_harness::llm::LanguageModel;
use forecast_harness::market::DisabledQuoteProvider;
use forecast_harness::pipeline::{Collaborators, ForecastService};
use forecast_harness::request_log::{NoopRequestLog, RequestLogSink};

pub const TRANSCRIPT_TEXT: &str = "Management is confident in the deal pipeline";
pub const PRESENTATION_TEXT: &str = "Investor presentation covering segment revenue mix";
pub const STALE_TEXT: &str = "Annual report of the previous fiscal year";
pub const OTHER_TRANSCRIPT_TEXT: &str = "Infosys reported record large deal wins this quarter";

/// The date staleness is measured against in these tests.
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 11, 15).unwrap()
}

/// A one-page PDF whose only content is `phrase` in Helvetica.
pub fn pdf_with_text(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// A company page with a quarterly results table and three document links,
/// the annual report being 366 days older than [`today`].
pub fn company_page() -> String {
    r#"<html><body>
        <h1>Tata Consultancy Services</h1>
        <section id="quarters">
          <table class="data-table">
            <thead><tr><th></th><th>Jun 2024</th><th>Sep 2024</th></tr></thead>
            <tbody>
              <tr><td class="text">Sales +</td><td>56,337</td><td>59,381</td></tr>
              <tr><td>Net Profit +</td><td>12,105</td><td>11,955</td></tr>
            </tbody>
          </table>
        </section>
        <div class="documents">
          <a href="/files/tcs-call-q2.pdf">Earnings Call Transcript 24 Oct 2024</a>
          <a href="/files/tcs-deck-q2.pdf">Investor Presentation 10 Oct 2024</a>
          <a href="/files/tcs-ar.pdf">Annual Report 15 Nov 2023</a>
        </div>
    </body></html>"#
        .to_string()
}

/// Serve [`company_page`] at `/company/TCS/consolidated/` plus its PDFs.
/// The stale annual report must never be requested.
pub async fn mount_company(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/company/TCS/consolidated/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string(company_page()),
        )
        .mount(server)
        .await;

    for (file, text) in [
        ("/files/tcs-call-q2.pdf", TRANSCRIPT_TEXT),
        ("/files/tcs-deck-q2.pdf", PRESENTATION_TEXT),
    ] {
        Mock::given(method("GET"))
            .and(path(file))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_body_bytes(pdf_with_text(text)),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/files/tcs-ar.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(pdf_with_text(STALE_TEXT)),
        )
        .expect(0)
        .mount(server)
        .await;
}

pub fn company_url(server: &MockServer) -> String {
    format!("{}/company/TCS/consolidated/", server.uri())
}

/// A second company whose transcript link carries the same text as the
/// first company's.
pub fn other_company_page() -> String {
    r#"<html><body>
        <h1>Infosys</h1>
        <section id="quarters">
          <table class="data-table">
            <thead><tr><th></th><th>Jun 2024</th><th>Sep 2024</th></tr></thead>
            <tbody>
              <tr><td>Sales +</td><td>39,315</td><td>40,986</td></tr>
            </tbody>
          </table>
        </section>
        <div class="documents">
          <a href="/files/infy-call.pdf">Earnings Call Transcript 24 Oct 2024</a>
        </div>
    </body></html>"#
        .to_string()
}

/// Serve [`other_company_page`] at `/company/INFY/consolidated/`.
pub async fn mount_other_company(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/company/INFY/consolidated/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string(other_company_page()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/infy-call.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(pdf_with_text(OTHER_TRANSCRIPT_TEXT)),
        )
        .expect(1)
        .mount(server)
        .await;
}

pub fn other_company_url(server: &MockServer) -> String {
    format!("{}/company/INFY/consolidated/", server.uri())
}

/// Defaults with every artifact inside `workspace`, fast retries and the
/// offline hash embedder.
pub fn test_config(workspace: &TempDir) -> Config {
    let mut config = Config::default();
    config.embedding.provider = "hash".to_string();
    config.workspace.document_dir = workspace.path().join("pdfs");
    config.workspace.index_dir = workspace.path().join("index");
    config.acquisition.backoff_ms = 10;
    config.acquisition.max_retries = 1;
    config.acquisition.timeout_secs = 5;
    config
}

pub fn service(
    config: Config,
    model: Arc<dyn LanguageModel>,
    request_log: Option<Arc<dyn RequestLogSink>>,
) -> ForecastService {
    let embedder = create_embedder(&config.embedding).unwrap();
    let index = VectorIndex::empty(embedder.as_ref(), config.retrieval.metric);
    let parts = Collaborators {
        acquirer: Acquirer::new(&config.acquisition, &config.workspace.document_dir)
            .unwrap()
            .with_today(today()),
        index: SharedIndex::new(index, embedder, config.embedding.batch_size),
        model,
        quotes: Arc::new(DisabledQuoteProvider),
        request_log: request_log.unwrap_or_else(|| Arc::new(NoopRequestLog)),
    };
    ForecastService::new(config, parts)
}
