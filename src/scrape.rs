//! Visible text of a scraped source page.
//!
//! The page's own prose (company profile, pros and cons, peer notes) is
//! indexed alongside the downloaded documents as a [`DocumentType::ScrapedPage`]
//! document.

use scraper::{ElementRef, Html, Node, Selector};
use sha2::{Digest, Sha256};

use crate::acquire::slugify;
use crate::models::{DocumentType, SourceRef};

const SKIPPED_TAGS: [&str; 6] = ["script", "style", "noscript", "svg", "nav", "footer"];
const BLOCK_TAGS: [&str; 12] = [
    "p", "div", "section", "li", "tr", "h1", "h2", "h3", "h4", "table", "article", "br",
];

/// Extract readable text from `html`, one block element per line.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = Selector::parse("body")
        .ok()
        .and_then(|s| document.select(&s).next())
        .unwrap_or_else(|| document.root_element());

    let mut out = String::new();
    collect_text(root, &mut out);

    out.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                out.push_str(text);
                out.push(' ');
            }
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
                if BLOCK_TAGS.contains(&name) {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Attribution for `text` scraped from `source_url`. The id changes when
/// the page text does, so a revised page is indexed afresh.
pub fn page_source(source_url: &str, text: &str) -> SourceRef {
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    SourceRef {
        document_id: format!("page_{}_{}", slugify(source_url), &digest[..8]),
        label: format!("Source page {}", source_url),
        url: source_url.to_string(),
        doc_type: DocumentType::ScrapedPage,
        published: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_scripts_and_keeps_block_structure() {
        let html = r#"<html><head><title>T</title></head><body>
            <nav>Home | Login</nav>
            <h1>Tata Consultancy Services</h1>
            <script>var x = 1;</script>
            <div class="about"><p>IT services   and consulting.</p><p>Strong order book.</p></div>
            </body></html>"#;
        let text = visible_text(html);
        assert_eq!(
            text,
            "Tata Consultancy Services\nIT services and consulting.\nStrong order book."
        );
    }

    #[test]
    fn page_source_is_attributed_to_url_and_content() {
        let url = "https://www.screener.in/company/TCS/";
        let src = page_source(url, "first");
        assert_eq!(src.doc_type, DocumentType::ScrapedPage);
        assert!(src.label.contains("screener.in"));
        assert!(src.document_id.starts_with("page_https_www_screener_in_company_tcs_"));
        assert_eq!(src.document_id, page_source(url, "first").document_id);
        assert_ne!(src.document_id, page_source(url, "second").document_id);
    }
}
