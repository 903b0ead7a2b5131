//! DNSDB adapter and fetcher behaviour against a mock API server.

mod common;

use common::*;
use iotbackendfinder::fetch::{
    FetchError, PageRequest, PageSource, Query, RateLimitedFetcher, SourceError,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_single_page_lookup_parses_records() {
    let server = MockServer::start().await;
    mount_lookup(
        &server,
        "*.bosch-iot-hub.com",
        "ANY",
        vec![vec![
            a_record("device.bosch-iot-hub.com.", "10.0.0.1"),
            cname_record("alias.bosch-iot-hub.com.", "device.bosch-iot-hub.com."),
        ]],
    )
    .await;

    let config = test_config(&server.uri(), 100, 0);
    let source = dnsdb_source(&config);
    let page = source
        .fetch_page(&PageRequest {
            query: Query::basic("*.bosch-iot-hub.com", "ANY"),
            offset: 0,
            limit: 100,
        })
        .await
        .unwrap();

    assert!(!page.more);
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].addresses, vec!["10.0.0.1"]);
    assert_eq!(page.records[1].cname.as_deref(), Some("device.bosch-iot-hub.com."));
}

#[tokio::test]
async fn test_limited_response_streams_all_pages() {
    let server = MockServer::start().await;
    mount_lookup(&server, "*.amazonaws.com", "ANY", aws_pages()).await;

    let config = test_config(&server.uri(), 2, 0);
    let fetcher = RateLimitedFetcher::new(dnsdb_source(&config), &config.rate_limit, 2);
    let mut stream = fetcher.fetch(Query::basic("*.amazonaws.com", "ANY"));

    let mut names = Vec::new();
    while let Some(record) = stream.next_record().await.unwrap() {
        names.push(record.domain);
    }

    assert_eq!(names.len(), 10);
    assert!(stream.is_exhausted());
    assert_eq!(stream.cursor().offset, 10);
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_time_fence_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(lookup_path("*.mindsphere.io", "ANY")))
        .and(query_param("time_last_after", "1609459200"))
        .and(query_param("limit", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_string(saf_body(&[], false)))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&server.uri(), 50, 0);
    config.dnsdb.time_last_after = Some(1609459200);
    let source = dnsdb_source(&config);
    let page = source
        .fetch_page(&PageRequest {
            query: Query::basic("*.mindsphere.io", "ANY"),
            offset: 0,
            limit: 50,
        })
        .await
        .unwrap();
    assert!(page.records.is_empty());
}

#[tokio::test]
async fn test_rate_limited_response_is_quota_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let config = test_config(&server.uri(), 10, 3);
    let fetcher = RateLimitedFetcher::new(dnsdb_source(&config), &config.rate_limit, 10);
    let mut stream = fetcher.fetch(Query::basic("*.amazonaws.com", "ANY"));

    let err = stream.next_page().await.unwrap_err();
    assert!(matches!(err, FetchError::QuotaExhausted { status: 429, .. }));
    assert!(!err.is_resumable());
    // Quota errors are never retried
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_lookup(&server, "*.amazonaws.com", "ANY", vec![aws_pages().remove(0)]).await;

    let config = test_config(&server.uri(), 10, 3);
    let fetcher = RateLimitedFetcher::new(dnsdb_source(&config), &config.rate_limit, 10);
    let mut stream = fetcher.fetch(Query::basic("*.amazonaws.com", "ANY"));

    let records = stream.next_page().await.unwrap().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_retries_exhausted_is_transient_with_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let config = test_config(&server.uri(), 10, 2);
    let fetcher = RateLimitedFetcher::new(dnsdb_source(&config), &config.rate_limit, 10);
    let mut stream = fetcher.fetch(Query::basic("*.amazonaws.com", "ANY"));

    match stream.next_page().await {
        Err(FetchError::Transient { cursor, attempts, .. }) => {
            assert_eq!(cursor.offset, 0);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected transient error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_condition_is_remote_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"cond\":\"begin\"}\n{\"cond\":\"failed\",\"msg\":\"backend timeout\"}\n"),
        )
        .mount(&server)
        .await;

    let config = test_config(&server.uri(), 10, 0);
    let err = dnsdb_source(&config)
        .fetch_page(&PageRequest {
            query: Query::flexible("^iot\\.", "ANY"),
            offset: 0,
            limit: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(err, SourceError::RemoteFailed("backend timeout".to_string()));
}
