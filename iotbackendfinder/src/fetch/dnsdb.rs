//! DNSDB API v2 page source.
//!
//! Basic queries map to `/dnsdb/v2/lookup/rrset/name/{term}/{rrtype}`, flexible
//! queries to `/dnsdb/v2/regex/rrnames/{term}/{rrtype}`. Responses are streamed
//! as line-delimited JSON ("SAF"): a `begin` condition, one `obj` line per
//! result and a terminal `succeeded`, `limited` or `failed` condition.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Page, PageRequest, PageSource, QueryMode, SourceError};
use crate::config::{DnsdbConfig, HttpConfig};
use crate::record::{ExtractionWarning, RawRecord};

/// One line of a SAF response
#[derive(Debug, Deserialize)]
struct SafLine {
    cond: Option<String>,
    msg: Option<String>,
    obj: Option<Value>,
}

/// An rrset or rrname result object as returned by DNSDB
#[derive(Debug, Deserialize)]
pub struct DnsdbObject {
    pub rrname: String,
    pub rrtype: Option<String>,
    #[serde(default)]
    pub rdata: Value,
    pub time_first: Option<i64>,
    pub time_last: Option<i64>,
    pub zone_time_first: Option<i64>,
    pub zone_time_last: Option<i64>,
}

impl DnsdbObject {
    pub fn into_record(self) -> RawRecord {
        let rdata: Vec<String> = match self.rdata {
            Value::String(s) => vec![s],
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let rrtype = self.rrtype.map(|t| t.to_uppercase());

        let mut record = RawRecord::dnsdb(self.rrname);
        record.time_first = self.time_first.or(self.zone_time_first);
        record.time_last = self.time_last.or(self.zone_time_last);

        let kind = rrtype.clone().unwrap_or_default();
        match kind.as_str() {
            "CNAME" if !rdata.is_empty() => {
                if let Some(target) = rdata.into_iter().next() {
                    record = record.with_cname(target);
                }
            }
            "A" | "AAAA" => record = record.with_addresses(&kind, rdata),
            _ => record.rrtype = rrtype,
        }
        record
    }
}

/// Outcome of parsing a full SAF body
#[derive(Debug)]
enum Terminal {
    Succeeded,
    Limited,
}

/// DNSDB v2 REST adapter
pub struct DnsdbSource {
    client: Client,
    base_url: String,
    api_key: String,
    time_last_after: Option<i64>,
}

impl DnsdbSource {
    pub fn new(api_key: impl Into<String>, dnsdb: &DnsdbConfig, http: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(http.request_timeout())
            .user_agent(http.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: dnsdb.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            time_last_after: dnsdb.time_last_after,
        })
    }

    fn url_for(&self, request: &PageRequest) -> String {
        let query = &request.query;
        let path = match query.mode {
            QueryMode::Basic => "lookup/rrset/name",
            QueryMode::Flexible => "regex/rrnames",
        };
        format!(
            "{}/dnsdb/v2/{}/{}/{}",
            self.base_url,
            path,
            urlencoding::encode(&query.term),
            urlencoding::encode(&query.rrtype)
        )
    }

    fn parse_body(&self, request: &PageRequest, body: &str) -> Result<Page, SourceError> {
        let source = request.query.key();
        let mut page = Page::default();
        let mut terminal = None;

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parsed: SafLine = match serde_json::from_str(line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Only result lines advance the offset
                    if is_object_line(line) {
                        page.consumed += 1;
                    }
                    page.warnings.push(ExtractionWarning::MalformedRecord {
                        source: source.clone(),
                        detail: e.to_string(),
                    });
                    continue;
                }
            };

            if let Some(obj) = parsed.obj {
                page.consumed += 1;
                match serde_json::from_value::<DnsdbObject>(obj) {
                    Ok(obj) => page.records.push(obj.into_record()),
                    Err(e) => page.warnings.push(ExtractionWarning::MalformedRecord {
                        source: source.clone(),
                        detail: e.to_string(),
                    }),
                }
                continue;
            }

            match parsed.cond.as_deref() {
                Some("begin") | Some("ongoing") | None => {}
                Some("succeeded") => terminal = Some(Terminal::Succeeded),
                Some("limited") => terminal = Some(Terminal::Limited),
                Some("failed") => {
                    return Err(SourceError::RemoteFailed(
                        parsed.msg.unwrap_or_else(|| "no message".to_string()),
                    ));
                }
                Some(other) => {
                    debug!("Ignoring unknown SAF condition '{}' for {}", other, source);
                }
            }
        }

        match terminal {
            Some(Terminal::Succeeded) => page.more = false,
            Some(Terminal::Limited) => page.more = true,
            // Stream cut off before a terminal condition
            None => {
                return Err(SourceError::InvalidResponse(format!(
                    "response for {} truncated after {} results",
                    source, page.consumed
                )));
            }
        }
        Ok(page)
    }
}

/// True if a SAF line that failed to parse was meant as a result object
fn is_object_line(line: &str) -> bool {
    line.strip_prefix('{')
        .map(|rest| rest.trim_start().starts_with("\"obj\""))
        .unwrap_or(false)
}

#[async_trait]
impl PageSource for DnsdbSource {
    fn name(&self) -> &str {
        "dnsdb"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
        let url = self.url_for(request);
        let mut params: Vec<(&str, String)> = vec![("limit", request.limit.to_string())];
        if request.offset > 0 {
            params.push(("offset", request.offset.to_string()));
        }
        if let Some(after) = self.time_last_after {
            params.push(("time_last_after", after.to_string()));
        }
        debug!("GET {} {:?}", url, params);

        let response = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .header("Accept", "application/x-ndjson")
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout
                } else {
                    SourceError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        // Older API versions answer "no results" with 404
        if status == StatusCode::NOT_FOUND {
            return Ok(Page::new(Vec::new(), false));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("DNSDB returned HTTP {} for {}", status.as_u16(), request.query);
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: message.trim().chars().take(200).collect(),
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout
            } else {
                SourceError::Connection(e.to_string())
            }
        })?;
        self.parse_body(request, &body)
    }
}
