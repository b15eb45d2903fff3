//! # Forecast Harness
//!
//! Retrieval-augmented forecasting over a company's public financial
//! disclosures.
//!
//! Given a company's source page, the harness downloads the linked earnings
//! transcripts, presentations and result filings, extracts and chunks their
//! text into a local vector index, pulls quarterly metrics from the page's
//! results table, and asks a language model for a structured next-quarter
//! outlook. When the model loop cannot finish, a deterministic fallback
//! assembles the answer from the same inputs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌──────────────┐
//! │ Acquirer │──▶│ Extract  │──▶│  Chunk  │──▶│ Vector index │
//! │ (HTTP)   │   │ (PDF)    │   │         │   │ (on disk)    │
//! └────┬─────┘   └──────────┘   └─────────┘   └──────┬───────┘
//!      │ page table                                  │ retrieve
//!      ▼                                             ▼
//! ┌──────────┐        ┌───────────────────────────────────────┐
//! │ Metrics  │───────▶│ Orchestrator ──▶ Synthesizer (LLM)    │
//! └──────────┘        │      └──fallback──▶ deterministic     │
//!                     └───────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fcast forecast https://www.screener.in/company/TCS/consolidated/ --periods 2
//! fcast index query "management outlook"
//! fcast metrics https://www.screener.in/company/TCS/consolidated/
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`acquire`] | Document discovery and download |
//! | [`scrape`] | Visible text of the source page |
//! | [`extract`] | PDF text extraction with fallback strategies |
//! | [`chunk`] | Boundary-aware overlapping chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index and its persistence |
//! | [`retrieve`] | Top-k and comprehensive retrieval |
//! | [`metrics`] | Financial metric extraction |
//! | [`llm`] | Language model abstraction |
//! | [`market`] | Market quote collaborator |
//! | [`synth`] | Schema-validated answer synthesis |
//! | [`tools`] | The orchestrator's capabilities |
//! | [`agent`] | Agent loop and deterministic fallback |
//! | [`pipeline`] | End-to-end request handling |
//! | [`request_log`] | SQLite request log |

pub mod acquire;
pub mod agent;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod llm;
pub mod market;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod request_log;
pub mod retrieve;
pub mod scrape;
pub mod synth;
pub mod tools;
