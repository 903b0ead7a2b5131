//! Post-extraction filtering of accumulated matches.
//!
//! A match survives only if it satisfies every post filter of its provider.
//! Filters see the matched domain; for an IP match that is the name the
//! address was observed for. Providers without filters, and providers not in
//! the catalog, pass through unchanged.

use std::sync::Arc;
use tracing::debug;

use crate::catalog::PatternCatalog;
use crate::record::{Match, MatchSet};

/// Applies catalog post filters
#[derive(Debug, Clone)]
pub struct PostProcessor {
    catalog: Arc<PatternCatalog>,
}

impl PostProcessor {
    pub fn new(catalog: Arc<PatternCatalog>) -> Self {
        Self { catalog }
    }

    /// True if `m` satisfies all filters of its provider
    pub fn accepts(&self, m: &Match) -> bool {
        self.catalog.passes_filters(&m.provider, &m.domain)
    }

    /// Keep the matches of `provider` that satisfy all of its filters
    pub fn filter<I>(&self, provider: &str, matches: I) -> Vec<Match>
    where
        I: IntoIterator<Item = Match>,
    {
        let mut dropped = 0usize;
        let kept: Vec<Match> = matches
            .into_iter()
            .filter(|m| {
                let keep = self.catalog.passes_filters(provider, &m.domain);
                if !keep {
                    dropped += 1;
                }
                keep
            })
            .collect();
        if dropped > 0 {
            debug!("[{}] Post filters dropped {} matches", provider, dropped);
        }
        kept
    }

    /// Apply each provider's filters to a whole match set
    pub fn filter_set(&self, matches: MatchSet) -> MatchSet {
        matches.into_vec().into_iter().filter(|m| self.accepts(m)).collect()
    }
}
