//! Document acquisition from a company's source page.
//!
//! ```text
//!  source page ──links──▶ classify + date ──▶ drop stale ──▶ cap per type ──▶ download (concurrent, retried)
//!                                                                                  │
//!                                               <document_dir>/<type>_<date>_<slug>_<hash>.pdf
//! ```
//!
//! Link discovery tries the selectors `.documents a`, `#documents a` and
//! `a[href$='.pdf']` in order and keeps the first that matches anything.
//! Only hrefs pointing at PDFs (`.pdf` or BSE `AnnPdf` viewers) are
//! candidates.
//!
//! The call succeeds when at least one document was acquired. Individual
//! download failures are logged and skipped. Transient failures (network
//! errors, timeouts, 429, 5xx) are retried with exponential backoff up to
//! `acquisition.max_retries` times.

use anyhow::{anyhow, bail, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

use crate::config::AcquisitionConfig;
use crate::error::AcquisitionError;
use crate::models::{Document, DocumentType};

const LINK_SELECTORS: [&str; 3] = [".documents a", "#documents a", "a[href$='.pdf']"];

/// A candidate document found on the source page.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLink {
    pub url: Url,
    pub text: String,
    pub doc_type: DocumentType,
    pub published: Option<NaiveDate>,
}

/// Collect PDF links from `html`, resolving relative hrefs against `base`.
pub fn discover_links(html: &str, base: &Url) -> Vec<DocumentLink> {
    let document = Html::parse_document(html);

    let anchors = LINK_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .map(|selector| document.select(&selector).collect::<Vec<_>>())
        .find(|found| !found.is_empty())
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in anchors {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !(href.to_lowercase().contains(".pdf") || href.contains("AnnPdf")) {
            continue;
        }
        let Ok(url) = base.join(href) else {
            continue;
        };
        if !seen.insert(url.to_string()) {
            continue;
        }

        let text = anchor
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let context = format!("{} {}", text, url_words(&url));
        links.push(DocumentLink {
            doc_type: classify(&context),
            published: infer_date(&context),
            url,
            text,
        });
    }
    links
}

fn url_words(url: &Url) -> String {
    url.path().replace(['_', '-', '/', '.'], " ")
}

/// Classify a document from its link text, file name, or opening text.
pub fn classify(text: &str) -> DocumentType {
    let text = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| text.contains(w));

    if has(&["transcript", "earnings call", "conference call", "concall"]) {
        DocumentType::Transcript
    } else if has(&["presentation", "investor deck", "ppt"]) {
        DocumentType::Presentation
    } else if has(&["annual report"]) {
        DocumentType::AnnualReport
    } else if has(&["financial results", "quarterly results", "results"]) {
        DocumentType::QuarterlyResult
    } else {
        DocumentType::Unknown
    }
}

static RE_ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());
/// Full month names or their three-letter abbreviations (plus `Sept`),
/// followed by a word boundary so "Market" or "declared" never match.
const MONTH: &str = r"(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\b\.?";

static RE_DAY_MONTH_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?[\s\-]+{}[\s\-,]+(\d{{4}})\b",
        MONTH
    ))
    .unwrap()
});
static RE_MONTH_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b{}[\s\-,']+(\d{{4}})\b", MONTH)).unwrap()
});
static RE_FISCAL_QUARTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bQ([1-4])[\s\-]*(?:FY)?[\s\-']*(\d{4}|\d{2})\b").unwrap()
});

fn month_number(name: &str) -> Option<u32> {
    let idx = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ]
    .iter()
    .position(|m| name.to_lowercase().starts_with(m))?;
    Some(idx as u32 + 1)
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (y, m) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(y, m, 1)?.pred_opt()
}

/// Infer a publication date from free text.
///
/// Recognises `2024-07-11`, `11 Jul 2024`, `Jul 2024` (month end) and Indian
/// fiscal quarters such as `Q1FY25` (quarter end: Q1 = June of the previous
/// calendar year, Q4 = March of the fiscal year).
pub fn infer_date(text: &str) -> Option<NaiveDate> {
    if let Some(c) = RE_ISO_DATE.captures(text) {
        let date = NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
        if date.is_some() {
            return date;
        }
    }
    if let Some(c) = RE_DAY_MONTH_YEAR.captures(text) {
        let date = NaiveDate::from_ymd_opt(c[3].parse().ok()?, month_number(&c[2])?, c[1].parse().ok()?);
        if date.is_some() {
            return date;
        }
    }
    if let Some(c) = RE_MONTH_YEAR.captures(text) {
        return last_day_of_month(c[2].parse().ok()?, month_number(&c[1])?);
    }
    if let Some(c) = RE_FISCAL_QUARTER.captures(text) {
        let quarter: u32 = c[1].parse().ok()?;
        let mut fiscal_year: i32 = c[2].parse().ok()?;
        if fiscal_year < 100 {
            fiscal_year += 2000;
        }
        let (year, month) = match quarter {
            1 => (fiscal_year - 1, 6),
            2 => (fiscal_year - 1, 9),
            3 => (fiscal_year - 1, 12),
            _ => (fiscal_year, 3),
        };
        return last_day_of_month(year, month);
    }
    None
}

/// A dated document is stale when it is more than `staleness_days` older
/// than `today`. Undated documents are never stale.
pub fn is_stale(published: Option<NaiveDate>, today: NaiveDate, staleness_days: i64) -> bool {
    match published {
        Some(date) => today.signed_duration_since(date) > ChronoDuration::days(staleness_days),
        None => false,
    }
}

/// Drop stale links and keep at most `max_per_type` per document type,
/// newest first. Undated links rank after dated ones in page order.
pub fn select_candidates(
    links: Vec<DocumentLink>,
    max_per_type: usize,
    today: NaiveDate,
    staleness_days: i64,
) -> Vec<DocumentLink> {
    let mut by_type: BTreeMap<DocumentType, Vec<DocumentLink>> = BTreeMap::new();
    for link in links {
        if is_stale(link.published, today, staleness_days) {
            tracing::debug!(url = %link.url, published = ?link.published, "skipping stale document");
            continue;
        }
        by_type.entry(link.doc_type).or_default().push(link);
    }

    by_type
        .into_values()
        .flat_map(|mut group| {
            // Stable sort keeps page order among equal dates.
            group.sort_by(|a, b| b.published.cmp(&a.published));
            group.truncate(max_per_type);
            group
        })
        .collect()
}

/// File name preserving type and date: `<type>_<YYYY-MM-DD|undated>_<slug>_<hash>.pdf`.
pub fn document_file_name(link: &DocumentLink) -> String {
    let date = link
        .published
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());
    let mut hasher = Sha256::new();
    hasher.update(link.url.as_str().as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    format!("{}_{}_{}_{}.pdf", link.doc_type, date, slugify(&link.text), &hash[..8])
}

pub(crate) fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
        if slug.len() >= 60 {
            break;
        }
    }
    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        "document".to_string()
    } else {
        slug.to_string()
    }
}

const TYPE_PREFIXES: [DocumentType; 6] = [
    DocumentType::QuarterlyResult,
    DocumentType::AnnualReport,
    DocumentType::Presentation,
    DocumentType::Transcript,
    DocumentType::ScrapedPage,
    DocumentType::Unknown,
];

/// Recover type and date from a name produced by [`document_file_name`].
pub fn parse_document_file_name(name: &str) -> Option<(DocumentType, Option<NaiveDate>)> {
    let doc_type = TYPE_PREFIXES
        .into_iter()
        .find(|t| name.starts_with(&format!("{}_", t)))?;
    let rest = &name[doc_type.as_str().len() + 1..];
    let date_part = rest.split('_').next()?;
    let published = if date_part == "undated" {
        None
    } else {
        Some(NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?)
    };
    Some((doc_type, published))
}

/// Re-read previously acquired documents from `dir`.
pub fn load_workdir(dir: &Path) -> std::io::Result<Vec<Document>> {
    let mut documents = Vec::new();
    if !dir.exists() {
        return Ok(documents);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("pdf")))
        .collect();
    paths.sort();

    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let (doc_type, published) =
            parse_document_file_name(&stem).unwrap_or((DocumentType::Unknown, None));
        documents.push(Document {
            id: stem.clone(),
            source_url: format!("file://{}", path.display()),
            title: stem,
            doc_type,
            published,
            bytes: std::fs::read(&path)?,
            path: Some(path),
        });
    }
    Ok(documents)
}

/// Remove every entry of the working directory, leaving it empty.
/// Returns the number of entries removed.
pub fn reset_workdir(dir: &Path) -> std::io::Result<usize> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        removed += 1;
    }
    tracing::info!(dir = %dir.display(), removed, "working directory reset");
    Ok(removed)
}

fn looks_like_pdf(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    head.windows(4).any(|w| w == b"%PDF")
}

/// Find the PDF a BSE corporate-filing viewer page embeds.
fn embedded_pdf_src(html: &str, base: &Url) -> Option<Url> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("iframe[src], embed[src], object[data]").ok()?;
    let element = document.select(&selector).next()?;
    let src = element
        .value()
        .attr("src")
        .or_else(|| element.value().attr("data"))?;
    base.join(src).ok()
}

/// Downloads candidate documents into a working directory.
pub struct Acquirer {
    client: reqwest::Client,
    config: AcquisitionConfig,
    document_dir: PathBuf,
    today: Option<NaiveDate>,
}

impl Acquirer {
    pub fn new(config: &AcquisitionConfig, document_dir: &Path) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            document_dir: document_dir.to_path_buf(),
            today: None,
        })
    }

    /// Pin the date staleness is measured against.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Fetch the source page's HTML.
    pub async fn fetch_page(&self, source_url: &str) -> Result<(Url, String), AcquisitionError> {
        let url = Url::parse(source_url)
            .map_err(|_| AcquisitionError::InvalidUrl(source_url.to_string()))?;
        let (bytes, _) = self
            .get_with_retry(&url)
            .await
            .map_err(|e| AcquisitionError::SourceUnreachable {
                url: source_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok((url, String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Fetch the source page and download up to `max_documents` per type.
    pub async fn acquire(
        &self,
        source_url: &str,
        max_documents: usize,
    ) -> Result<Vec<Document>, AcquisitionError> {
        let (base, html) = self.fetch_page(source_url).await?;
        self.acquire_from_page(&base, &html, max_documents).await
    }

    /// Download the documents linked from an already fetched page.
    pub async fn acquire_from_page(
        &self,
        base: &Url,
        html: &str,
        max_documents: usize,
    ) -> Result<Vec<Document>, AcquisitionError> {
        let links = discover_links(html, base);
        if links.is_empty() {
            return Err(AcquisitionError::NoDocumentLinks {
                url: base.to_string(),
            });
        }
        let found = links.len();
        let candidates =
            select_candidates(links, max_documents, self.today(), self.config.staleness_days);
        tracing::info!(
            source = %base,
            found,
            candidates = candidates.len(),
            "document links discovered"
        );

        std::fs::create_dir_all(&self.document_dir)?;

        let results: Vec<(DocumentLink, Result<Document>)> = stream::iter(candidates)
            .map(|link| async move {
                let outcome = self.download(&link).await;
                (link, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut documents = Vec::new();
        for (link, outcome) in results {
            match outcome {
                Ok(doc) => documents.push(doc),
                Err(e) => tracing::warn!(url = %link.url, error = %e, "document download failed"),
            }
        }

        if documents.is_empty() {
            return Err(AcquisitionError::NothingAcquired {
                url: base.to_string(),
                attempted: found,
            });
        }

        documents.sort_by(|a, b| {
            a.doc_type
                .cmp(&b.doc_type)
                .then(b.published.cmp(&a.published))
                .then(a.id.cmp(&b.id))
        });
        tracing::info!(source = %base, acquired = documents.len(), "acquisition complete");
        Ok(documents)
    }

    async fn download(&self, link: &DocumentLink) -> Result<Document> {
        let (mut bytes, is_html) = self.get_with_retry(&link.url).await?;

        if !looks_like_pdf(&bytes) {
            let embedded = if is_html {
                embedded_pdf_src(&String::from_utf8_lossy(&bytes), &link.url)
            } else {
                None
            };
            let Some(inner) = embedded else {
                bail!("response is not a PDF");
            };
            tracing::debug!(viewer = %link.url, pdf = %inner, "following embedded document");
            bytes = self.get_with_retry(&inner).await?.0;
            if !looks_like_pdf(&bytes) {
                bail!("embedded document at {} is not a PDF", inner);
            }
        }

        let file_name = document_file_name(link);
        let path = self.document_dir.join(&file_name);
        tokio::fs::write(&path, &bytes).await?;
        tracing::info!(file = %file_name, bytes = bytes.len(), "downloaded document");

        let id = file_name.trim_end_matches(".pdf").to_string();
        Ok(Document {
            id,
            source_url: link.url.to_string(),
            path: Some(path),
            title: if link.text.is_empty() {
                file_name.clone()
            } else {
                link.text.clone()
            },
            doc_type: link.doc_type,
            published: link.published,
            bytes,
        })
    }

    /// GET with retry on transient failures. Returns the body and whether
    /// the response declared an HTML content type.
    async fn get_with_retry(&self, url: &Url) -> Result<(Vec<u8>, bool)> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.backoff_ms << (attempt - 1).min(5);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let is_html = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .is_some_and(|v| v.contains("html"));
                        let body = response.bytes().await?;
                        return Ok((body.to_vec(), is_html));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::debug!(%url, %status, attempt, "transient HTTP failure");
                        last_err = Some(anyhow!("HTTP {} from {}", status, url));
                        continue;
                    }
                    bail!("HTTP {} from {}", status, url);
                }
                Err(e) => {
                    tracing::debug!(%url, error = %e, attempt, "request failed");
                    last_err = Some(anyhow!("request to {} failed: {}", url, e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("request to {} failed", url)))
    }
}
