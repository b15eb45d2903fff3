//! Financial metric extraction.
//!
//! Two sources feed the same closed set of [`MetricName`]s:
//!
//! | Source | Function | Matching |
//! |--------|----------|----------|
//! | Quarterly results table (HTML) | [`extract_from_table`] | row-label table |
//! | Report text (PDF) | [`extract_from_text`] | regular-expression table |
//!
//! Missing metrics are simply absent from the output. Disclosures vary too
//! much in format for absence to be an error.
//!
//! Growth is derived per metric against the immediately preceding period:
//!
//! ```text
//! growth = (current - prior) / |prior| * 100      rounded to 2 decimals
//! ```
//!
//! It is omitted when the prior value is missing or zero, or when the result
//! is not finite.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::acquire::infer_date;
use crate::models::{FinancialMetric, MetricName};

/// Percent change from `prior` to `current`, rounded to 2 decimals.
pub fn growth_rate(current: f64, prior: f64) -> Option<f64> {
    if prior == 0.0 || !current.is_finite() || !prior.is_finite() {
        return None;
    }
    let growth = (current - prior) / prior.abs() * 100.0;
    let rounded = (growth * 100.0).round() / 100.0;
    rounded.is_finite().then_some(rounded)
}

static RE_UNIT_NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(rs\.?|₹|crores?|cr\.?|%|,)").unwrap());

/// Parse a table cell such as `59,381`, `24.5%`, `Rs. 12.3 Cr` or `(45)`.
/// Placeholders (`-`, `N/A`, empty) parse to `None`.
pub fn parse_value(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if matches!(trimmed, "" | "-" | "—" | "–" | "N/A" | "n/a" | "NA") {
        return None;
    }
    let cleaned = RE_UNIT_NOISE.replace_all(trimmed, "");
    let cleaned = cleaned.trim();
    let (negative, digits) = match cleaned.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner.trim()),
        None => (false, cleaned),
    };
    let value: f64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Map a results-table row label to a metric.
pub fn label_to_metric(label: &str) -> Option<MetricName> {
    let label: String = label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");

    if label.starts_with("sales") || label.starts_with("revenue") || label.starts_with("total revenue") {
        Some(MetricName::Revenue)
    } else if label.starts_with("expenses") || label.starts_with("total expenses") {
        Some(MetricName::Expenses)
    } else if label.starts_with("operating profit") || label == "ebit" || label == "ebitda" {
        Some(MetricName::OperatingProfit)
    } else if label.starts_with("opm") || label.starts_with("operating margin") {
        Some(MetricName::OperatingMargin)
    } else if label.starts_with("net profit") || label.starts_with("profit after tax") {
        Some(MetricName::NetProfit)
    } else if label.starts_with("eps") || label.starts_with("earnings per share") {
        Some(MetricName::Eps)
    } else {
        None
    }
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn looks_like_period(label: &str) -> bool {
    infer_date(label).is_some()
}

/// Extract metrics for the latest `periods` periods from a results table.
///
/// Looks for `section#quarters table` first and otherwise uses the first
/// table whose header names at least two periods. The header row supplies
/// period labels; each body row's first cell is the metric label.
pub fn extract_from_table(html: &str, periods: usize) -> Vec<FinancialMetric> {
    if periods == 0 {
        return Vec::new();
    }
    let document = Html::parse_document(html);
    let Some(table) = find_results_table(&document) else {
        tracing::debug!("no quarterly results table found");
        return Vec::new();
    };
    let Some(rows) = selector("tr") else {
        return Vec::new();
    };
    let Some(cells) = selector("th, td") else {
        return Vec::new();
    };

    let mut row_iter = table.select(&rows);
    let Some(header) = row_iter.next() else {
        return Vec::new();
    };
    let labels: Vec<String> = header.select(&cells).skip(1).map(cell_text).collect();
    if labels.is_empty() {
        return Vec::new();
    }

    let mut series: BTreeMap<MetricName, Vec<Option<f64>>> = BTreeMap::new();
    for row in row_iter {
        let mut row_cells = row.select(&cells).map(cell_text);
        let Some(label) = row_cells.next() else {
            continue;
        };
        let Some(name) = label_to_metric(&label) else {
            continue;
        };
        if series.contains_key(&name) {
            continue;
        }
        let mut values: Vec<Option<f64>> = row_cells.map(|c| parse_value(&c)).collect();
        values.resize(labels.len(), None);
        series.insert(name, values);
    }

    let order = chronological_order(&labels);
    let keep_from = order.len().saturating_sub(periods);

    let mut metrics = Vec::new();
    for (name, values) in &series {
        for (position, &column) in order.iter().enumerate().skip(keep_from) {
            let Some(value) = values[column] else {
                continue;
            };
            let prior = position
                .checked_sub(1)
                .and_then(|p| values[order[p]]);
            metrics.push(FinancialMetric {
                period: labels[column].clone(),
                name: *name,
                value,
                unit: name.unit(),
                growth_pct: prior.and_then(|p| growth_rate(value, p)),
            });
        }
    }
    metrics
}

fn find_results_table<'a>(document: &'a Html) -> Option<ElementRef<'a>> {
    if let Some(table) = selector("section#quarters table").and_then(|s| document.select(&s).next()) {
        return Some(table);
    }
    let tables = selector("table")?;
    let cells = selector("tr:first-child th, tr:first-child td")?;
    document.select(&tables).find(|table| {
        table
            .select(&cells)
            .filter(|c| looks_like_period(&cell_text(*c)))
            .count()
            >= 2
    })
}

/// Column indices ordered oldest to newest. Uses parsed dates when every
/// label has one, else assumes the header is already left-to-right
/// chronological.
fn chronological_order(labels: &[String]) -> Vec<usize> {
    let dates: Vec<_> = labels.iter().map(|l| infer_date(l)).collect();
    let mut order: Vec<usize> = (0..labels.len()).collect();
    if dates.iter().all(Option::is_some) {
        order.sort_by_key(|&i| dates[i]);
    }
    order
}

struct TextPattern {
    name: MetricName,
    regexes: Vec<Regex>,
}

const AMOUNT: &str = r"(?:rs\.?\s*|₹\s*|inr\s*)?([0-9][0-9,]*\.?[0-9]*)";

static TEXT_PATTERNS: LazyLock<Vec<TextPattern>> = LazyLock::new(|| {
    let build = |name, patterns: &[String]| TextPattern {
        name,
        regexes: patterns
            .iter()
            .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
            .collect(),
    };
    vec![
        build(
            MetricName::Revenue,
            &[
                format!(r"total\s+revenue[:\s]+{}\s*(?:crores?|cr)", AMOUNT),
                format!(r"revenue\s+from\s+operations[:\s]+{}", AMOUNT),
            ],
        ),
        build(
            MetricName::NetProfit,
            &[
                format!(r"net\s+profit[:\s]+{}\s*(?:crores?|cr)", AMOUNT),
                format!(r"profit\s+after\s+tax[:\s]+{}", AMOUNT),
            ],
        ),
        build(
            MetricName::OperatingMargin,
            &[
                r"operating\s+margin[:\s]+(?:of\s+|at\s+)?([0-9]+\.?[0-9]*)\s*%".to_string(),
                r"ebit\s+margin[:\s]+(?:of\s+|at\s+)?([0-9]+\.?[0-9]*)\s*%".to_string(),
            ],
        ),
        build(
            MetricName::Eps,
            &[
                format!(r"earnings\s+per\s+share[:\s]+{}", AMOUNT),
                format!(r"\beps[:\s]+{}", AMOUNT),
            ],
        ),
    ]
});

static RE_QUARTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(Q[1-4])\s*(FY)?\s*'?(\d{2,4})\b").unwrap());

/// Label of the first fiscal quarter mentioned in `text`, e.g. `Q2FY25`.
pub fn detect_quarter(text: &str) -> Option<String> {
    let c = RE_QUARTER.captures(text)?;
    Some(format!("{}FY{}", c[1].to_uppercase(), &c[3]))
}

/// Extract the reported values from a results document's text.
///
/// A document reports one period, labelled by the first fiscal quarter it
/// mentions (or `"reported"`), so growth is never derived here.
pub fn extract_from_text(text: &str, periods: usize) -> Vec<FinancialMetric> {
    if periods == 0 {
        return Vec::new();
    }
    let period = detect_quarter(text).unwrap_or_else(|| "reported".to_string());

    TEXT_PATTERNS
        .iter()
        .filter_map(|pattern| {
            let value = pattern
                .regexes
                .iter()
                .filter_map(|re| re.captures(text))
                .find_map(|c| parse_value(&c[1]))?;
            Some(FinancialMetric {
                period: period.clone(),
                name: pattern.name,
                value,
                unit: pattern.name.unit(),
                growth_pct: None,
            })
        })
        .collect()
}

/// Combine table and text metrics. Table values win; text values fill in
/// metrics the table lacks.
pub fn merge(table: Vec<FinancialMetric>, text: Vec<FinancialMetric>) -> Vec<FinancialMetric> {
    let mut merged = table;
    for metric in text {
        if !merged.iter().any(|m| m.name == metric.name) {
            merged.push(metric);
        }
    }
    merged
}

/// One-line human description, used when answers are assembled without
/// the language model.
pub fn describe(metric: &FinancialMetric) -> String {
    let unit = match metric.unit {
        crate::models::MetricUnit::Crore => " crore",
        crate::models::MetricUnit::Percent => "%",
        crate::models::MetricUnit::Rupees => " rupees",
    };
    match metric.growth_pct {
        Some(g) => format!(
            "{} {}: {:.2}{} ({:+.2}% vs prior period)",
            metric.name, metric.period, metric.value, unit, g
        ),
        None => format!("{} {}: {:.2}{}", metric.name, metric.period, metric.value, unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUARTERS_HTML: &str = r#"
        <html><body>
        <section id="profit-loss"><table><tr><th></th><th>Mar 2023</th><th>Mar 2024</th></tr>
          <tr><td>Sales</td><td>1</td><td>2</td></tr></table></section>
        <section id="quarters">
          <table class="data-table">
            <thead><tr><th></th><th>Jun 2024</th><th>Sep 2024</th></tr></thead>
            <tbody>
              <tr><td class="text">Sales&nbsp;+</td><td>56,337</td><td>59,381</td></tr>
              <tr><td>Expenses +</td><td>41,000</td><td>43,000</td></tr>
              <tr><td>OPM %</td><td>26%</td><td>24%</td></tr>
              <tr><td>Net Profit +</td><td>0</td><td>11,955</td></tr>
              <tr><td>EPS in Rs</td><td>-</td><td>33.06</td></tr>
              <tr><td>Raw PDF</td><td></td><td></td></tr>
            </tbody>
          </table>
        </section>
        </body></html>"#;

    fn find<'a>(metrics: &'a [FinancialMetric], name: MetricName, period: &str) -> Option<&'a FinancialMetric> {
        metrics.iter().find(|m| m.name == name && m.period == period)
    }

    #[test]
    fn growth_rate_examples() {
        assert_eq!(growth_rate(110.0, 100.0), Some(10.0));
        assert_eq!(growth_rate(59381.0, 56337.0), Some(5.4));
        assert_eq!(growth_rate(90.0, -100.0), Some(190.0));
        assert_eq!(growth_rate(5.0, 0.0), None);
        assert_eq!(growth_rate(f64::NAN, 1.0), None);
    }

    #[test]
    fn parse_value_handles_units_and_placeholders() {
        assert_eq!(parse_value("59,381"), Some(59381.0));
        assert_eq!(parse_value("24.5%"), Some(24.5));
        assert_eq!(parse_value("Rs. 12.3 Cr"), Some(12.3));
        assert_eq!(parse_value("(45)"), Some(-45.0));
        assert_eq!(parse_value("-"), None);
        assert_eq!(parse_value("N/A"), None);
        assert_eq!(parse_value(""), None);
    }

    #[test]
    fn table_extraction_derives_growth() {
        let metrics = extract_from_table(QUARTERS_HTML, 2);
        let revenue = find(&metrics, MetricName::Revenue, "Sep 2024").unwrap();
        assert_eq!(revenue.value, 59381.0);
        assert_eq!(revenue.growth_pct, Some(5.4));

        let first = find(&metrics, MetricName::Revenue, "Jun 2024").unwrap();
        assert_eq!(first.growth_pct, None);

        let margin = find(&metrics, MetricName::OperatingMargin, "Sep 2024").unwrap();
        assert_eq!(margin.value, 24.0);
    }

    #[test]
    fn zero_prior_omits_growth_and_missing_cells_are_absent() {
        let metrics = extract_from_table(QUARTERS_HTML, 2);
        let profit = find(&metrics, MetricName::NetProfit, "Sep 2024").unwrap();
        assert_eq!(profit.growth_pct, None);
        assert!(find(&metrics, MetricName::Eps, "Jun 2024").is_none());
        assert!(find(&metrics, MetricName::Eps, "Sep 2024").is_some());
    }

    #[test]
    fn periods_limit_keeps_latest_but_growth_uses_earlier_column() {
        let metrics = extract_from_table(QUARTERS_HTML, 1);
        let revenue: Vec<_> = metrics.iter().filter(|m| m.name == MetricName::Revenue).collect();
        assert_eq!(revenue.len(), 1);
        assert_eq!(revenue[0].period, "Sep 2024");
        assert_eq!(revenue[0].growth_pct, Some(5.4));
    }

    #[test]
    fn columns_are_reordered_chronologically() {
        let html = r#"<table>
            <tr><th></th><th>Sep 2024</th><th>Jun 2024</th></tr>
            <tr><td>Revenue</td><td>110</td><td>100</td></tr>
        </table>"#;
        let metrics = extract_from_table(html, 2);
        assert_eq!(metrics[0].period, "Jun 2024");
        assert_eq!(metrics[1].period, "Sep 2024");
        assert_eq!(metrics[1].growth_pct, Some(10.0));
    }

    #[test]
    fn page_without_results_table_yields_nothing() {
        assert!(extract_from_table("<p>No tables</p>", 4).is_empty());
    }

    #[test]
    fn text_patterns_extract_reported_values() {
        let text = "Q2 FY25 highlights. Revenue from operations: Rs. 64,259 crore. \
                    Net profit: 11,909 crore. Operating margin at 24.1%. EPS: Rs 32.92.";
        let metrics = extract_from_text(text, 2);
        let get = |n| metrics.iter().find(|m| m.name == n).map(|m| m.value);
        assert_eq!(get(MetricName::Revenue), Some(64259.0));
        assert_eq!(get(MetricName::NetProfit), Some(11909.0));
        assert_eq!(get(MetricName::OperatingMargin), Some(24.1));
        assert_eq!(get(MetricName::Eps), Some(32.92));
        assert!(metrics.iter().all(|m| m.period == "Q2FY25" && m.growth_pct.is_none()));
    }

    #[test]
    fn merge_prefers_table_values() {
        let table = extract_from_table(QUARTERS_HTML, 1);
        let text = extract_from_text("Revenue from operations: 1 crore", 1);
        let merged = merge(table.clone(), text);
        assert_eq!(merged.len(), table.len());
    }

    #[test]
    fn describe_includes_growth_sign() {
        let metric = FinancialMetric {
            period: "Sep 2024".into(),
            name: MetricName::Revenue,
            value: 59381.0,
            unit: MetricName::Revenue.unit(),
            growth_pct: Some(5.4),
        };
        assert_eq!(
            describe(&metric),
            "revenue Sep 2024: 59381.00 crore (+5.40% vs prior period)"
        );
    }
}
