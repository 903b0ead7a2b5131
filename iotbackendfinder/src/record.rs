use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain_utils;

/// Dataset a record was observed in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Dnsdb,
    Censys,
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Dnsdb => "dnsdb",
            Dataset::Censys => "censys",
        }
    }
}

/// Whether a matched value is a domain name or an address
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Domain,
    Ip,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Domain => "domain",
            ValueKind::Ip => "ip",
        }
    }
}

/// Leaf certificate fields of a TLS service in a Censys host record
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CertificateFields {
    pub subject_dn: Option<String>,
    pub issuer_dn: Option<String>,
    /// Subject alternative names
    #[serde(default)]
    pub names: Vec<String>,
    pub port: Option<u16>,
    pub service_name: Option<String>,
    pub snapshot_date: Option<String>,
    pub asn: Option<u32>,
}

/// One raw observation from the remote API or a bulk export
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawRecord {
    pub dataset: Dataset,
    /// Observed domain name (rrname for DNSDB, certificate common name for Censys)
    pub domain: String,
    pub rrtype: Option<String>,
    /// CNAME target when the record is an alias
    pub cname: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    pub time_first: Option<i64>,
    pub time_last: Option<i64>,
    pub certificate: Option<CertificateFields>,
}

impl RawRecord {
    pub fn dnsdb(domain: impl Into<String>) -> Self {
        Self {
            dataset: Dataset::Dnsdb,
            domain: domain.into(),
            rrtype: None,
            cname: None,
            addresses: Vec::new(),
            time_first: None,
            time_last: None,
            certificate: None,
        }
    }

    pub fn with_cname(mut self, target: impl Into<String>) -> Self {
        self.rrtype = Some("CNAME".to_string());
        self.cname = Some(target.into());
        self
    }

    pub fn with_addresses(mut self, rrtype: &str, addresses: Vec<String>) -> Self {
        self.rrtype = Some(rrtype.to_string());
        self.addresses = addresses;
        self
    }

    /// Normalized, deduplicated candidate strings that match rules are evaluated against.
    /// The record's own domain always comes first.
    pub fn candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |raw: &str| {
            let normalized = domain_utils::normalize_domain(raw);
            if !normalized.is_empty() && !out.contains(&normalized) {
                out.push(normalized);
            }
        };

        push(&self.domain);
        if let Some(cert) = &self.certificate {
            for name in &cert.names {
                push(name);
            }
            if let Some(cn) = cert.subject_dn.as_deref().and_then(domain_utils::common_name_from_dn) {
                push(&cn);
            }
        }
        out
    }
}

/// Evidence retained with a match for auditability
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub rrtype: Option<String>,
    pub cname: Option<String>,
    pub time_first: Option<i64>,
    pub time_last: Option<i64>,
    pub cert_subject: Option<String>,
    pub cert_issuer: Option<String>,
    pub port: Option<u16>,
    pub service_name: Option<String>,
    pub snapshot_date: Option<String>,
    pub asn: Option<u32>,
    /// Alias whose CNAME target led to this record, if any
    pub via: Option<String>,
}

impl Evidence {
    pub fn from_record(record: &RawRecord) -> Self {
        let cert = record.certificate.as_ref();
        Self {
            rrtype: record.rrtype.clone(),
            cname: record.cname.as_deref().map(domain_utils::normalize_domain),
            time_first: record.time_first,
            time_last: record.time_last,
            cert_subject: cert.and_then(|c| c.subject_dn.clone()),
            cert_issuer: cert.and_then(|c| c.issuer_dn.clone()),
            port: cert.and_then(|c| c.port),
            service_name: cert.and_then(|c| c.service_name.clone()),
            snapshot_date: cert.and_then(|c| c.snapshot_date.clone()),
            asn: cert.and_then(|c| c.asn),
            via: None,
        }
    }
}

/// A provider-labeled domain or address extracted from a raw record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub provider: String,
    /// Matched domain or IP address
    pub value: String,
    pub kind: ValueKind,
    /// Domain the firing rule matched; equals `value` for domain matches
    pub domain: String,
    pub rule_id: String,
    pub dataset: Dataset,
    pub evidence: Evidence,
    /// Number of CNAME hops between a seed query and this record
    #[serde(default)]
    pub chase_depth: u32,
}

impl Match {
    pub fn key(&self) -> MatchKey {
        MatchKey {
            provider: self.provider.clone(),
            value: self.value.clone(),
        }
    }

    /// CNAME target this match's record points to, if the record was an alias
    pub fn cname_target(&self) -> Option<&str> {
        match self.kind {
            ValueKind::Domain => self.evidence.cname.as_deref().filter(|t| !t.is_empty()),
            ValueKind::Ip => None,
        }
    }
}

/// Uniqueness key of a match
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchKey {
    pub provider: String,
    pub value: String,
}

/// Provider-keyed match accumulator, idempotent under re-insertion
#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    matches: BTreeMap<MatchKey, Match>,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a match; returns false if (provider, value) was already present.
    /// The first insertion wins.
    pub fn insert(&mut self, m: Match) -> bool {
        use std::collections::btree_map::Entry;
        match self.matches.entry(m.key()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(m);
                true
            }
        }
    }

    /// Insert a match, letting `accepted` break ties between copies of the
    /// same (provider, value): a stored copy that `accepted` rejects is
    /// replaced by an accepted one. Returns true if the key was new.
    pub fn insert_preferring<F>(&mut self, m: Match, accepted: F) -> bool
    where
        F: Fn(&Match) -> bool,
    {
        use std::collections::btree_map::Entry;
        match self.matches.entry(m.key()) {
            Entry::Occupied(mut slot) => {
                if !accepted(slot.get()) && accepted(&m) {
                    slot.insert(m);
                }
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(m);
                true
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = Match>>(&mut self, matches: I) -> usize {
        let mut added = 0;
        for m in matches {
            if self.insert(m) {
                added += 1;
            }
        }
        added
    }

    /// [`MatchSet::extend`] with [`MatchSet::insert_preferring`] semantics
    pub fn extend_preferring<I, F>(&mut self, matches: I, accepted: F) -> usize
    where
        I: IntoIterator<Item = Match>,
        F: Fn(&Match) -> bool,
    {
        let mut added = 0;
        for m in matches {
            if self.insert_preferring(m, &accepted) {
                added += 1;
            }
        }
        added
    }

    pub fn merge_preferring<F>(&mut self, other: MatchSet, accepted: F) -> usize
    where
        F: Fn(&Match) -> bool,
    {
        self.extend_preferring(other.into_vec(), accepted)
    }

    pub fn merge(&mut self, other: MatchSet) -> usize {
        self.extend(other.into_vec())
    }

    pub fn contains(&self, provider: &str, value: &str) -> bool {
        self.matches.contains_key(&MatchKey {
            provider: provider.to_string(),
            value: value.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Match> {
        self.matches.values()
    }

    pub fn for_provider<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a Match> + 'a {
        self.matches.values().filter(move |m| m.provider == provider)
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.matches.keys().map(|k| k.provider.clone()).collect();
        providers.dedup();
        providers
    }

    /// Matches ordered by (provider, value)
    pub fn into_vec(self) -> Vec<Match> {
        self.matches.into_values().collect()
    }
}

impl FromIterator<Match> for MatchSet {
    fn from_iter<I: IntoIterator<Item = Match>>(iter: I) -> Self {
        let mut set = MatchSet::new();
        set.extend(iter);
        set
    }
}

/// Non-fatal problems encountered while extracting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtractionWarning {
    /// A CNAME target lay beyond the configured chase depth and was not followed.
    /// `depth` is the hop count the target would have needed.
    ChaseDepthExceeded { alias: String, target: String, depth: u32 },
    /// A raw line or record could not be parsed and was skipped
    MalformedRecord { source: String, detail: String },
}

impl std::fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionWarning::ChaseDepthExceeded { alias, target, depth } => write!(
                f,
                "CNAME {} -> {} not followed: hop {} exceeds the chase depth",
                alias, target, depth
            ),
            ExtractionWarning::MalformedRecord { source, detail } => {
                write!(f, "Skipped malformed record from {}: {}", source, detail)
            }
        }
    }
}
