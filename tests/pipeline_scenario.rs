mod common;

use std::sync::Arc;
use std::time::Duration;
use sqlx::Row;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use forecast_harness::error::ServiceError;
use forecast_harness::llm::{ScriptedModel, UnavailableModel};
use forecast_harness::models::{
    AnswerPath, ConfidenceLevel, DocumentType, ForecastRequest, MarketData, MetricName, ToolKind,
};
use forecast_harness::request_log::{RequestLogSink, SqliteRequestLog};

use common::*;

fn request(url: String, include_market_data: bool) -> ForecastRequest {
    ForecastRequest {
        source_url: url,
        periods_requested: 2,
        include_market_data,
    }
}

fn answer_json() -> String {
    serde_json::json!({
        "summary": "Revenue grew 5.4% quarter on quarter.",
        "financial_trends": ["revenue 56,337 to 59,381 crore (+5.4%)"],
        "qualitative_assessment": "Management is confident in the deal pipeline.",
        "outlook_next_quarter": "Continued moderate growth.",
        "key_risks": ["net profit dipped slightly"],
        "key_opportunities": ["deal pipeline"],
        "confidence_level": "medium",
        "disclaimer": "Generated from public disclosures; not investment advice."
    })
    .to_string()
}

#[tokio::test]
async fn end_to_end_forecast_over_mocked_source() {
    let server = MockServer::start().await;
    mount_company(&server).await;
    let workspace = TempDir::new().unwrap();

    let model = Arc::new(ScriptedModel::new([
        r#"{"action": "extract_metrics"}"#.to_string(),
        r#"{"action": "retrieve_qualitative", "input": "management outlook"}"#.to_string(),
        r#"{"action": "market_quote"}"#.to_string(),
        r#"{"action": "final"}"#.to_string(),
        answer_json(),
    ]));
    let service = service(test_config(&workspace), model.clone(), None);

    let response = service
        .forecast(request(company_url(&server), true))
        .await
        .unwrap();

    // two fresh documents acquired, the 366-day-old annual report skipped
    assert_eq!(response.documents_used.len(), 2);
    let downloaded = std::fs::read_dir(workspace.path().join("pdfs")).unwrap().count();
    assert_eq!(downloaded, 2);

    let revenue = response
        .metrics
        .iter()
        .find(|m| m.name == MetricName::Revenue && m.period == "Sep 2024")
        .unwrap();
    assert_eq!(revenue.value, 59381.0);
    assert_eq!(revenue.growth_pct, Some(5.4));

    let hits = service.index().query("management outlook", 3).await.unwrap();
    assert!(hits.hits[0]
        .chunk
        .text
        .contains("confident in the deal pipeline"));
    assert_eq!(hits.hits[0].chunk.source.doc_type, DocumentType::Transcript);

    assert_eq!(response.path, AnswerPath::Agent);
    assert_eq!(
        response.tools_invoked,
        vec![
            ToolKind::ExtractMetrics,
            ToolKind::RetrieveQualitative,
            ToolKind::MarketQuote
        ]
    );
    assert!(matches!(response.market, MarketData::Unavailable { .. }));
    assert!(!response.answer.disclaimer.is_empty());
    assert!(response
        .answer
        .missing_data
        .iter()
        .any(|n| n.starts_with("market data unavailable")));
    assert_eq!(model.calls(), 5);

    // index persisted for later runs
    assert!(workspace.path().join("index").join("meta.json").exists());
}

#[tokio::test]
async fn unavailable_model_falls_back_and_logs_request() {
    let server = MockServer::start().await;
    mount_company(&server).await;
    let workspace = TempDir::new().unwrap();

    let log = Arc::new(
        SqliteRequestLog::open(&workspace.path().join("requests.sqlite"))
            .await
            .unwrap(),
    );
    let sink: Arc<dyn RequestLogSink> = log.clone();
    let service = service(
        test_config(&workspace),
        Arc::new(UnavailableModel::new("OPENAI_API_KEY not set")),
        Some(sink),
    );

    let response = service
        .forecast(request(company_url(&server), false))
        .await
        .unwrap();

    assert_eq!(response.path, AnswerPath::Fallback);
    assert_eq!(response.answer.confidence_level, ConfidenceLevel::Medium);
    assert_eq!(response.market, MarketData::NotRequested);
    assert!(response
        .answer
        .financial_trends
        .iter()
        .any(|t| t.starts_with("revenue Sep 2024")));
    assert!(!response.answer.disclaimer.is_empty());

    let row = sqlx::query("SELECT company_symbol, status, periods FROM forecast_requests")
        .fetch_one(log.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("company_symbol"), "TCS");
    assert_eq!(row.get::<String, _>("status"), "completed");
    assert_eq!(row.get::<i64, _>("periods"), 2);
}

#[tokio::test]
async fn unreachable_source_still_answers_with_safe_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let workspace = TempDir::new().unwrap();
    let service = service(
        test_config(&workspace),
        Arc::new(UnavailableModel::new("offline")),
        None,
    );

    let response = service
        .forecast(request(company_url(&server), true))
        .await
        .unwrap();

    assert_eq!(response.path, AnswerPath::SafeDefault);
    assert_eq!(response.answer.summary, "unknown");
    assert_eq!(response.answer.confidence_level, ConfidenceLevel::Low);
    assert!(response.documents_used.is_empty());
    assert!(response
        .answer
        .missing_data
        .iter()
        .any(|n| n.starts_with("source page unavailable")));
}

#[tokio::test]
async fn invalid_request_is_rejected() {
    let workspace = TempDir::new().unwrap();
    let service = service(
        test_config(&workspace),
        Arc::new(UnavailableModel::new("offline")),
        None,
    );

    let mut bad = request("https://www.screener.in/company/TCS/".into(), false);
    bad.periods_requested = 0;
    assert!(matches!(
        service.forecast(bad).await,
        Err(ServiceError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn request_timeout_returns_labeled_partial_answer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/company/TCS/consolidated/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(company_page())
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;
    let workspace = TempDir::new().unwrap();
    let log = Arc::new(
        SqliteRequestLog::open(&workspace.path().join("requests.sqlite"))
            .await
            .unwrap(),
    );
    let sink: Arc<dyn RequestLogSink> = log.clone();
    let mut config = test_config(&workspace);
    config.pipeline.request_timeout_secs = 1;
    let service = service(config, Arc::new(UnavailableModel::new("offline")), Some(sink));

    let response = service
        .forecast(request(company_url(&server), true))
        .await
        .unwrap();

    assert_eq!(response.path, AnswerPath::SafeDefault);
    assert_eq!(response.answer.confidence_level, ConfidenceLevel::Low);
    assert!(!response.answer.disclaimer.is_empty());
    assert!(response
        .answer
        .missing_data
        .iter()
        .any(|n| n == "request timed out during document build"));
    assert!(matches!(response.market, MarketData::Unavailable { .. }));

    let row = sqlx::query("SELECT status, error_message FROM forecast_requests")
        .fetch_one(log.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "timed_out");
    assert_eq!(
        row.get::<Option<String>, _>("error_message").as_deref(),
        Some("request timed out during document build")
    );
}

#[tokio::test]
async fn retrieval_stays_within_the_requested_company() {
    let server = MockServer::start().await;
    mount_company(&server).await;
    mount_other_company(&server).await;
    let workspace = TempDir::new().unwrap();

    // the same three-step plan for each request
    let plan = [
        r#"{"action": "retrieve_qualitative", "input": "large deal wins"}"#.to_string(),
        r#"{"action": "final"}"#.to_string(),
        answer_json(),
    ];
    let model = Arc::new(ScriptedModel::new(plan.iter().chain(plan.iter()).cloned()));
    let service = service(test_config(&workspace), model.clone(), None);

    let infy = service
        .forecast(request(other_company_url(&server), false))
        .await
        .unwrap();
    assert_eq!(infy.path, AnswerPath::Agent);
    assert_eq!(infy.documents_used.len(), 1);

    // both companies now share the persisted index
    let everything = service.index().query("large deal wins", 1).await.unwrap();
    assert!(everything.hits[0].chunk.text.contains("Infosys"));

    let calls_before = model.calls();
    let tcs = service
        .forecast(request(company_url(&server), false))
        .await
        .unwrap();
    assert_eq!(tcs.path, AnswerPath::Agent);
    assert_eq!(model.calls(), 6);
    assert_eq!(tcs.documents_used.len(), 2);
    assert!(tcs.documents_used.iter().all(|id| !infy.documents_used.contains(id)));

    let prompts = model.prompts();
    let tcs_prompts = &prompts[calls_before..];
    assert!(!tcs_prompts.is_empty());
    assert!(tcs_prompts
        .iter()
        .flatten()
        .all(|message| !message.content.contains("Infosys")));
    assert!(tcs_prompts
        .iter()
        .flatten()
        .any(|message| message.content.contains("confident in the deal pipeline")));
}
