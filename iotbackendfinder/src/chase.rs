//! Bounded CNAME chasing.
//!
//! Aliases found during extraction are followed by querying their CNAME
//! target and feeding the returned records back into the extractor for the
//! same provider. The walk uses an explicit worklist of (target, depth) and
//! stops expanding past `max_depth`.

use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::extract::RecordExtractor;
use crate::fetch::{FetchError, Query, RateLimitedFetcher};
use crate::pipeline::CancelFlag;
use crate::record::{ExtractionWarning, Match, MatchSet};

/// Default number of CNAME hops followed from a seed query
pub const DEFAULT_MAX_DEPTH: u32 = 1;

/// Result of chasing the aliases of a match set
#[derive(Debug, Default)]
pub struct ChaseOutcome {
    /// Matches found on chased targets
    pub matches: MatchSet,
    pub warnings: Vec<ExtractionWarning>,
    /// Targets that were fetched
    pub expanded: Vec<String>,
    /// Fetch failure that ended the chase early; `matches` holds what was found before it
    pub error: Option<FetchError>,
    pub cancelled: bool,
}

struct Pending {
    alias: String,
    target: String,
    depth: u32,
}

/// Follows CNAME targets through a fetcher
pub struct CnameChaser<'a> {
    fetcher: &'a RateLimitedFetcher,
    extractor: &'a RecordExtractor,
    max_depth: u32,
    rrtype: String,
    cancel: CancelFlag,
}

impl<'a> CnameChaser<'a> {
    pub fn new(fetcher: &'a RateLimitedFetcher, extractor: &'a RecordExtractor) -> Self {
        Self {
            fetcher,
            extractor,
            max_depth: DEFAULT_MAX_DEPTH,
            rrtype: "ANY".to_string(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// rrtype requested for chased targets
    pub fn with_rrtype(mut self, rrtype: impl Into<String>) -> Self {
        self.rrtype = rrtype.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Chase every alias in `seeds` for `provider`.
    ///
    /// Each target is fetched at most once. Targets beyond the depth bound are
    /// reported as [`ExtractionWarning::ChaseDepthExceeded`] and not fetched.
    pub async fn chase<'m, I>(&self, provider: &str, seeds: I) -> ChaseOutcome
    where
        I: IntoIterator<Item = &'m Match>,
    {
        let mut outcome = ChaseOutcome::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut worklist: VecDeque<Pending> = seeds
            .into_iter()
            .filter_map(|m| {
                m.cname_target().map(|target| Pending {
                    alias: m.value.clone(),
                    target: target.to_string(),
                    depth: m.chase_depth + 1,
                })
            })
            .collect();

        while let Some(item) = worklist.pop_front() {
            if !visited.insert(item.target.clone()) {
                continue;
            }

            if item.depth > self.max_depth {
                let warning = ExtractionWarning::ChaseDepthExceeded {
                    alias: item.alias,
                    target: item.target,
                    depth: item.depth,
                };
                warn!("[{}] {}", provider, warning);
                outcome.warnings.push(warning);
                continue;
            }

            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            debug!("[{}] Chasing {} -> {} (hop {})", provider, item.alias, item.target, item.depth);
            outcome.expanded.push(item.target.clone());

            let mut stream = self.fetcher.fetch(Query::basic(item.target.clone(), self.rrtype.clone()));
            loop {
                let records = match stream.next_page().await {
                    Ok(Some(records)) => records,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[{}] Chasing {} failed: {}", provider, item.target, e);
                        outcome.warnings.extend(stream.take_warnings());
                        outcome.error = Some(e);
                        return outcome;
                    }
                };

                for mut m in self.extractor.extract(provider, records) {
                    m.chase_depth = item.depth;
                    m.evidence.via = Some(item.alias.clone());
                    if let Some(next) = m.cname_target() {
                        worklist.push_back(Pending {
                            alias: m.value.clone(),
                            target: next.to_string(),
                            depth: item.depth + 1,
                        });
                    }
                    outcome.matches.insert_preferring(m, |m| self.extractor.accepts(m));
                }

                if self.cancel.is_cancelled() {
                    outcome.cancelled = true;
                    break;
                }
            }
            outcome.warnings.extend(stream.take_warnings());

            if outcome.cancelled {
                break;
            }
        }

        if !outcome.expanded.is_empty() {
            info!(
                "[{}] Chased {} CNAME targets, {} new matches",
                provider,
                outcome.expanded.len(),
                outcome.matches.len()
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PatternCatalog;
    use crate::config::{BackoffStrategy, RateLimitConfig};
    use crate::fetch::{Page, PageRequest, PageSource, SourceError};
    use crate::record::RawRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Answers each basic lookup from a fixed table of name -> records
    struct TableSource {
        table: HashMap<String, Vec<RawRecord>>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageSource for TableSource {
        fn name(&self) -> &str {
            "table"
        }

        async fn fetch_page(&self, request: &PageRequest) -> Result<Page, SourceError> {
            self.requested.lock().unwrap().push(request.query.term.clone());
            let records = self.table.get(&request.query.term).cloned().unwrap_or_default();
            Ok(Page::new(records, false))
        }
    }

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: 1000,
            backoff_strategy: BackoffStrategy::Linear,
            max_retries: 0,
            backoff_base_delay_ms: 1,
            backoff_max_delay_ms: 1,
        }
    }

    fn chain_source() -> Arc<TableSource> {
        let mut table = HashMap::new();
        table.insert(
            "hop1.bosch-iot-hub.com".to_string(),
            vec![RawRecord::dnsdb("hop1.bosch-iot-hub.com.").with_cname("hop2.bosch-iot-hub.com.")],
        );
        table.insert(
            "hop2.bosch-iot-hub.com".to_string(),
            vec![RawRecord::dnsdb("hop2.bosch-iot-hub.com.").with_cname("hop3.bosch-iot-hub.com.")],
        );
        table.insert(
            "hop3.bosch-iot-hub.com".to_string(),
            vec![RawRecord::dnsdb("hop3.bosch-iot-hub.com.")
                .with_addresses("A", vec!["10.1.1.1".to_string()])],
        );
        Arc::new(TableSource {
            table,
            requested: Mutex::new(Vec::new()),
        })
    }

    fn seed(extractor: &RecordExtractor) -> Vec<Match> {
        extractor.extract_record(
            "bosch",
            &RawRecord::dnsdb("device.bosch-iot-hub.com.").with_cname("hop1.bosch-iot-hub.com."),
        )
    }

    #[tokio::test]
    async fn test_depth_one_expands_single_hop() {
        let src = chain_source();
        let fetcher = RateLimitedFetcher::new(src.clone(), &limits(), 100);
        let extractor = RecordExtractor::new(Arc::new(PatternCatalog::embedded().unwrap()));
        let seeds = seed(&extractor);

        let outcome = CnameChaser::new(&fetcher, &extractor).chase("bosch", &seeds).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.expanded, vec!["hop1.bosch-iot-hub.com"]);
        assert_eq!(*src.requested.lock().unwrap(), vec!["hop1.bosch-iot-hub.com"]);
        assert!(outcome.matches.contains("bosch", "hop1.bosch-iot-hub.com"));
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(matches!(
            &outcome.warnings[0],
            ExtractionWarning::ChaseDepthExceeded { target, depth: 2, .. } if target == "hop2.bosch-iot-hub.com"
        ));

        let hop = outcome.matches.iter().next().unwrap();
        assert_eq!(hop.chase_depth, 1);
        assert_eq!(hop.evidence.via.as_deref(), Some("device.bosch-iot-hub.com"));
    }

    #[tokio::test]
    async fn test_deeper_chase_follows_whole_chain() {
        let src = chain_source();
        let fetcher = RateLimitedFetcher::new(src.clone(), &limits(), 100);
        let extractor = RecordExtractor::new(Arc::new(PatternCatalog::embedded().unwrap()));
        let seeds = seed(&extractor);

        let outcome = CnameChaser::new(&fetcher, &extractor)
            .with_max_depth(5)
            .chase("bosch", &seeds)
            .await;

        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.expanded.len(), 3);
        assert!(outcome.matches.contains("bosch", "hop3.bosch-iot-hub.com"));
        assert!(outcome.matches.contains("bosch", "10.1.1.1"));
    }

    #[tokio::test]
    async fn test_cycles_are_visited_once() {
        let mut table = HashMap::new();
        table.insert(
            "a.bosch-iot-hub.com".to_string(),
            vec![RawRecord::dnsdb("a.bosch-iot-hub.com").with_cname("b.bosch-iot-hub.com")],
        );
        table.insert(
            "b.bosch-iot-hub.com".to_string(),
            vec![RawRecord::dnsdb("b.bosch-iot-hub.com").with_cname("a.bosch-iot-hub.com")],
        );
        let src = Arc::new(TableSource {
            table,
            requested: Mutex::new(Vec::new()),
        });
        let fetcher = RateLimitedFetcher::new(src.clone(), &limits(), 100);
        let extractor = RecordExtractor::new(Arc::new(PatternCatalog::embedded().unwrap()));
        let seeds = extractor.extract_record(
            "bosch",
            &RawRecord::dnsdb("start.bosch-iot-hub.com").with_cname("a.bosch-iot-hub.com"),
        );

        let outcome = CnameChaser::new(&fetcher, &extractor)
            .with_max_depth(10)
            .chase("bosch", &seeds)
            .await;

        assert_eq!(src.requested.lock().unwrap().len(), 2);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_chase_fetches_nothing() {
        let src = chain_source();
        let fetcher = RateLimitedFetcher::new(src.clone(), &limits(), 100);
        let extractor = RecordExtractor::new(Arc::new(PatternCatalog::embedded().unwrap()));
        let seeds = seed(&extractor);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let outcome = CnameChaser::new(&fetcher, &extractor)
            .with_cancel(cancel)
            .chase("bosch", &seeds)
            .await;

        assert!(outcome.cancelled);
        assert!(src.requested.lock().unwrap().is_empty());
    }
}
