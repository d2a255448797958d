//! HTTP-level tests for the SearXNG and exchange-rate clients.

use std::sync::Arc;

use gai_core::Error as GaiError;
use gai_rag::tools::{CurrencyConverter, ExchangeRates, HexarateClient};
use gai_rag::{SearxngClient, WebSearch};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn searxng_posts_form_and_maps_results() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("q=louvre+opening+hours"))
        .and(body_string_contains("format=json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "query": "louvre opening hours",
            "results": [
                {
                    "title": "Louvre Museum",
                    "url": "https://www.louvre.fr",
                    "content": "Open every day except Tuesday",
                    "publishedDate": "2024-05-01T00:00:00",
                    "engines": ["bing", "duckduckgo"]
                },
                {"url": "https://example.org"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = SearxngClient::new(&format!("{}/", server.uri()), 5).unwrap();
    let results = client.search("louvre opening hours").await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].title, "Louvre Museum");
    assert_eq!(results[0].snippet, "Open every day except Tuesday");
    assert_eq!(results[0].published_date.as_deref(), Some("2024-05-01T00:00:00"));
    assert_eq!(results[1].title, "Untitled");
    assert_eq!(results[1].snippet, "No content available");

    let doc = results[0].clone().into_document().unwrap();
    assert_eq!(doc.source(), "WebSearchTool");
    assert_eq!(doc.metadata.url.as_deref(), Some("https://www.louvre.fr"));
    assert_eq!(doc.metadata.extra["engines"], "bing, duckduckgo");
}

#[tokio::test]
async fn searxng_error_status_is_a_search_engine_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
        .mount(&server)
        .await;

    let err = SearxngClient::new(&server.uri(), 5)
        .unwrap()
        .search("anything")
        .await
        .unwrap_err();
    assert!(matches!(err, GaiError::SearchEngine { .. }));
    assert!(err.is_transport());
}

#[tokio::test]
async fn hexarate_reads_mid_rate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/rates/latest/USD"))
        .and(query_param("target", "EUR"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status_code": 200,
            "data": {"base": "USD", "target": "EUR", "mid": 0.9234, "unit": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let rates = Arc::new(HexarateClient::new(&server.uri(), 5).unwrap());
    let docs = CurrencyConverter::new(rates)
        .invoke(&json!({"currencyFrom": "usd", "currencyTo": "eur", "amount": "250"}))
        .await
        .unwrap();
    assert_eq!(docs[0].content, "250 USD converts to 230.85 EUR as of today");
}

#[tokio::test]
async fn hexarate_unknown_pair_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/rates/latest/USD"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"status_code": 404})))
        .mount(&server)
        .await;

    let client = HexarateClient::new(&server.uri(), 5).unwrap();
    assert_eq!(client.latest_rate("USD", "XYZ").await.unwrap(), None);
}

#[tokio::test]
async fn hexarate_outage_is_service_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = HexarateClient::new(&server.uri(), 5).unwrap();
    let err = client.latest_rate("USD", "EUR").await.unwrap_err();
    assert!(matches!(err, GaiError::ServiceUnavailable { .. }));
}
