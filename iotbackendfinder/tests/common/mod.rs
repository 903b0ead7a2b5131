#![allow(dead_code)]

use flate2::write::GzEncoder;
use iotbackendfinder::catalog::PatternCatalog;
use iotbackendfinder::config::{AppConfig, BackoffStrategy, QuerySelection, RateLimitConfig};
use iotbackendfinder::fetch::DnsdbSource;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Catalog with one AWS-like and one Bosch-like provider, one seed query each
pub const TEST_CATALOG: &str = r#"
version = "test-1"

[[providers]]
name = "aws"
display_name = "AWS IoT Core"
rules = [
    { kind = "regex", id = "aws-iot-endpoint", pattern = '[a-z0-9]+(-ats)?\.iot\.[a-z0-9-]+\.amazonaws\.com' },
    { kind = "suffix", id = "aws-amazonaws", value = "amazonaws.com" },
]
filters = [{ kind = "must_contain", value = ".iot." }]
queries = [{ mode = "basic", term = "*.amazonaws.com", rrtype = "ANY" }]

[[providers]]
name = "bosch"
display_name = "Bosch IoT Suite"
rules = [{ kind = "suffix", id = "bosch-iot-hub", value = "bosch-iot-hub.com" }]
filters = [{ kind = "must_not_contain", value = "doc." }]
queries = [{ mode = "basic", term = "*.bosch-iot-hub.com", rrtype = "ANY" }]
"#;

pub fn test_catalog() -> Arc<PatternCatalog> {
    Arc::new(PatternCatalog::from_toml(TEST_CATALOG).expect("test catalog is valid"))
}

/// Configuration pointing at a mock server, with fast throttling and small pages
pub fn test_config(base_url: &str, page_size: u32, max_retries: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.dnsdb.base_url = base_url.to_string();
    config.dnsdb.page_size = page_size;
    config.dnsdb.time_last_after = None;
    config.dnsdb.query_selection = QuerySelection::Basic;
    config.rate_limit = fast_rate_limit(max_retries);
    config
}

pub fn fast_rate_limit(max_retries: u32) -> RateLimitConfig {
    RateLimitConfig {
        requests_per_second: 1000,
        backoff_strategy: BackoffStrategy::Linear,
        max_retries,
        backoff_base_delay_ms: 1,
        backoff_max_delay_ms: 5,
    }
}

pub fn dnsdb_source(config: &AppConfig) -> Arc<DnsdbSource> {
    Arc::new(DnsdbSource::new("test-key", &config.dnsdb, &config.http).expect("client builds"))
}

/// DNSDB result object for an A record
pub fn a_record(rrname: &str, ip: &str) -> Value {
    json!({
        "rrname": rrname,
        "rrtype": "A",
        "rdata": [ip],
        "time_first": 1609459300,
        "time_last": 1640995200
    })
}

/// DNSDB result object for a CNAME record
pub fn cname_record(rrname: &str, target: &str) -> Value {
    json!({
        "rrname": rrname,
        "rrtype": "CNAME",
        "rdata": [target],
        "time_first": 1609459300,
        "time_last": 1640995200
    })
}

/// Line-delimited SAF body; `limited` marks more pages
pub fn saf_body(objects: &[Value], limited: bool) -> String {
    let mut body = String::from("{\"cond\":\"begin\"}\n");
    for obj in objects {
        body.push_str(&json!({ "obj": obj }).to_string());
        body.push('\n');
    }
    let terminal = if limited { "limited" } else { "succeeded" };
    body.push_str(&json!({ "cond": terminal, "msg": "" }).to_string());
    body.push('\n');
    body
}

/// URL path the DNSDB adapter requests for a basic lookup
pub fn lookup_path(term: &str, rrtype: &str) -> String {
    format!(
        "/dnsdb/v2/lookup/rrset/name/{}/{}",
        urlencoding::encode(term),
        urlencoding::encode(rrtype)
    )
}

/// Serves `pages` by the request's `offset` and `limit` parameters
pub struct PagedResponder {
    pages: Vec<Vec<Value>>,
}

impl PagedResponder {
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        Self { pages }
    }
}

impl Respond for PagedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let param = |name: &str| {
            request
                .url
                .query_pairs()
                .find(|(k, _)| k == name)
                .and_then(|(_, v)| v.parse::<u64>().ok())
        };
        let offset = param("offset").unwrap_or(0);
        let limit = param("limit").unwrap_or(1).max(1);
        let index = (offset / limit) as usize;
        let objects = self.pages.get(index).cloned().unwrap_or_default();
        let limited = index + 1 < self.pages.len();
        ResponseTemplate::new(200)
            .set_body_string(saf_body(&objects, limited))
            .insert_header("content-type", "application/x-ndjson")
    }
}

/// Mount a paged lookup for `term`
pub async fn mount_lookup(server: &MockServer, term: &str, rrtype: &str, pages: Vec<Vec<Value>>) {
    Mock::given(method("GET"))
        .and(path(lookup_path(term, rrtype)))
        .and(header("X-API-Key", "test-key"))
        .respond_with(PagedResponder::new(pages))
        .mount(server)
        .await;
}

/// Five pages of two records each for `*.amazonaws.com`; one IoT endpoint
/// and one unrelated AWS host per page
pub fn aws_pages() -> Vec<Vec<Value>> {
    (0..5)
        .map(|i| {
            vec![
                a_record(&format!("d{}.iot.us-east-1.amazonaws.com.", i), &format!("52.0.0.{}", i + 1)),
                a_record(&format!("bucket{}.s3.amazonaws.com.", i), &format!("54.0.0.{}", i + 1)),
            ]
        })
        .collect()
}

pub fn write_gz(path: &Path, lines: &[String]) -> PathBuf {
    let file = std::fs::File::create(path).expect("create gz file");
    let mut encoder = GzEncoder::new(file, flate2::Compression::default());
    for line in lines {
        writeln!(encoder, "{}", line).expect("write gz line");
    }
    encoder.finish().expect("finish gz");
    path.to_path_buf()
}

pub fn write_zst(path: &Path, lines: &[String]) -> PathBuf {
    let file = std::fs::File::create(path).expect("create zst file");
    let mut encoder = zstd::stream::write::Encoder::new(file, 0).expect("zstd encoder");
    for line in lines {
        writeln!(encoder, "{}", line).expect("write zst line");
    }
    encoder.finish().expect("finish zst");
    path.to_path_buf()
}

/// Censys host line with one TLS service per (port, names) pair
pub fn censys_host(ip: &str, services: &[(u16, &[&str])]) -> String {
    let services: Vec<Value> = services
        .iter()
        .map(|(port, names)| {
            json!({
                "port": port,
                "service_name": "MQTT",
                "snapshot_date": "2021-06-01T00:00:00Z",
                "tls": {
                    "certificates": {
                        "leaf_data": {
                            "names": names,
                            "subject_dn": format!("CN={}", names.first().copied().unwrap_or("")),
                            "issuer_dn": "C=US, O=Test CA"
                        }
                    }
                }
            })
        })
        .collect();
    json!({
        "host_identifier": { "ipv4": ip },
        "autonomous_system": { "asn": 16509 },
        "services": services
    })
    .to_string()
}
