//! Market quote collaborator.
//!
//! The quote is optional context for the forecast. Every failure mode maps
//! to [`QuoteUnavailable`] so callers only ever see "a price" or "no price".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::config::MarketConfig;
use crate::error::QuoteUnavailable;
use crate::models::MarketQuote;

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<MarketQuote, QuoteUnavailable>;
}

static COMPANY_SYMBOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/company/([^/?#]+)").unwrap());

/// Ticker symbol embedded in a `/company/<SYMBOL>/` source URL.
pub fn symbol_from_url(source_url: &str) -> Option<String> {
    COMPANY_SYMBOL
        .captures(source_url)
        .map(|c| c[1].to_ascii_uppercase())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
struct QuotePayload {
    status: String,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
}

/// Fetches `GET {base_url}/quote/{symbol}`, expecting
/// `{"status": "success" | "no_data" | "error", "price": .., "timestamp": ..}`.
pub struct HttpQuoteProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuoteProvider {
    pub fn new(base_url: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QuoteProvider for HttpQuoteProvider {
    async fn get_quote(&self, symbol: &str) -> Result<MarketQuote, QuoteUnavailable> {
        let unavailable = |reason: String| QuoteUnavailable {
            symbol: symbol.to_string(),
            reason,
        };

        let url = format!("{}/quote/{}", self.base_url, symbol);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("HTTP {}", response.status())));
        }

        let payload: QuotePayload = response
            .json()
            .await
            .map_err(|e| unavailable(format!("malformed response: {}", e)))?;

        match (payload.status.as_str(), payload.price) {
            ("success", Some(price)) if price.is_finite() => Ok(MarketQuote {
                symbol: symbol.to_string(),
                price,
                timestamp: payload.timestamp.unwrap_or_else(Utc::now),
            }),
            ("success", _) => Err(unavailable("response carried no price".into())),
            ("no_data", _) => Err(unavailable(
                payload.message.unwrap_or_else(|| "no data for symbol".into()),
            )),
            (status, _) => Err(unavailable(
                payload
                    .message
                    .unwrap_or_else(|| format!("provider status '{}'", status)),
            )),
        }
    }
}

/// Provider used when market data is disabled.
pub struct DisabledQuoteProvider;

#[async_trait]
impl QuoteProvider for DisabledQuoteProvider {
    async fn get_quote(&self, symbol: &str) -> Result<MarketQuote, QuoteUnavailable> {
        Err(QuoteUnavailable {
            symbol: symbol.to_string(),
            reason: "market data provider disabled".into(),
        })
    }
}

pub fn create_quote_provider(config: &MarketConfig) -> anyhow::Result<Arc<dyn QuoteProvider>> {
    match (config.provider.as_str(), config.base_url.as_deref()) {
        ("http", Some(base)) => Ok(Arc::new(HttpQuoteProvider::new(base, config.timeout_secs)?)),
        ("http", None) => anyhow::bail!("market.base_url must be set when provider is 'http'"),
        _ => Ok(Arc::new(DisabledQuoteProvider)),
    }
}
