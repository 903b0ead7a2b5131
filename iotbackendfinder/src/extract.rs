//! Applies catalog rules to raw records and emits provider-labeled matches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::catalog::PatternCatalog;
use crate::domain_utils;
use crate::record::{Evidence, Match, RawRecord, ValueKind};

/// Turns raw records into matches for one provider at a time
#[derive(Debug, Clone)]
pub struct RecordExtractor {
    catalog: Arc<PatternCatalog>,
}

impl RecordExtractor {
    pub fn new(catalog: Arc<PatternCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &PatternCatalog {
        &self.catalog
    }

    /// True if `m` passes its provider's post filters
    pub fn accepts(&self, m: &Match) -> bool {
        self.catalog.passes_filters(&m.provider, &m.domain)
    }

    /// Matches produced by a single record.
    ///
    /// Every candidate name of the record is checked against the provider's
    /// rules; the first firing rule labels the match. When at least one name
    /// matched, the record's addresses are emitted as IP matches carrying the
    /// first matched name that passes the provider's post filters, or the
    /// first matched name when none does.
    pub fn extract_record(&self, provider: &str, record: &RawRecord) -> Vec<Match> {
        let Some(definition) = self.catalog.provider(provider) else {
            return Vec::new();
        };

        let evidence = Evidence::from_record(record);
        let mut matches = Vec::new();

        for candidate in record.candidates() {
            if domain_utils::is_ip_address(&candidate) {
                continue;
            }
            if let Some(rule_id) = definition.evaluate(&candidate) {
                matches.push(Match {
                    provider: definition.name.clone(),
                    value: candidate.clone(),
                    kind: ValueKind::Domain,
                    domain: candidate,
                    rule_id: rule_id.to_string(),
                    dataset: record.dataset,
                    evidence: evidence.clone(),
                    chase_depth: 0,
                });
            }
        }

        let anchor = matches
            .iter()
            .find(|m| self.accepts(m))
            .or_else(|| matches.first())
            .cloned();
        if let Some(first) = anchor {
            for address in &record.addresses {
                let address = address.trim();
                if !domain_utils::is_ip_address(address) {
                    continue;
                }
                matches.push(Match {
                    value: address.to_string(),
                    kind: ValueKind::Ip,
                    ..first.clone()
                });
            }
        }

        matches
    }

    /// Lazily extract matches from a record stream, collapsing duplicate
    /// (provider, value) pairs. A repeated value is yielded again only when
    /// its earlier copy failed the post filters and this one passes.
    pub fn extract<'a, I>(&'a self, provider: &'a str, records: I) -> Extraction<'a, I::IntoIter>
    where
        I: IntoIterator<Item = RawRecord>,
    {
        Extraction {
            extractor: self,
            provider,
            records: records.into_iter(),
            pending: VecDeque::new(),
            seen: HashMap::new(),
        }
    }
}

/// Iterator returned by [`RecordExtractor::extract`]
pub struct Extraction<'a, I> {
    extractor: &'a RecordExtractor,
    provider: &'a str,
    records: I,
    pending: VecDeque<Match>,
    /// Value to whether its yielded copy passed the post filters
    seen: HashMap<String, bool>,
}

impl<'a, I> Iterator for Extraction<'a, I>
where
    I: Iterator<Item = RawRecord>,
{
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        loop {
            while let Some(m) = self.pending.pop_front() {
                let accepted = self.extractor.accepts(&m);
                match self.seen.get(&m.value) {
                    Some(true) => continue,
                    Some(false) if !accepted => continue,
                    _ => {
                        self.seen.insert(m.value.clone(), accepted);
                        return Some(m);
                    }
                }
            }
            let record = self.records.next()?;
            self.pending
                .extend(self.extractor.extract_record(self.provider, &record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CertificateFields, Dataset, MatchSet};

    fn extractor() -> RecordExtractor {
        RecordExtractor::new(Arc::new(PatternCatalog::embedded().unwrap()))
    }

    fn records() -> Vec<RawRecord> {
        vec![
            RawRecord::dnsdb("a1.iot.us-east-1.amazonaws.com.")
                .with_addresses("A", vec!["52.0.0.1".to_string(), "52.0.0.2".to_string()]),
            RawRecord::dnsdb("A1.IOT.us-east-1.amazonaws.com"),
            RawRecord::dnsdb("www.example.com").with_addresses("A", vec!["93.184.216.34".to_string()]),
            RawRecord::dnsdb("alias.iot.eu-central-1.amazonaws.com.")
                .with_cname("b2-ats.iot.eu-central-1.amazonaws.com."),
        ]
    }

    #[test]
    fn test_extract_record_emits_domain_and_ips() {
        let ex = extractor();
        let matches = ex.extract_record("aws", &records()[0]);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].value, "a1.iot.us-east-1.amazonaws.com");
        assert_eq!(matches[0].kind, ValueKind::Domain);
        assert_eq!(matches[0].rule_id, "aws-iot-endpoint");
        assert_eq!(matches[1].kind, ValueKind::Ip);
        assert_eq!(matches[1].domain, "a1.iot.us-east-1.amazonaws.com");
        assert_eq!(matches[2].value, "52.0.0.2");
    }

    #[test]
    fn test_non_matching_record_yields_nothing() {
        let ex = extractor();
        assert!(ex.extract_record("aws", &records()[2]).is_empty());
        assert!(ex.extract_record("unknown-provider", &records()[0]).is_empty());
    }

    #[test]
    fn test_extract_deduplicates() {
        let ex = extractor();
        let values: Vec<String> = ex.extract("aws", records()).map(|m| m.value).collect();
        assert_eq!(
            values,
            vec![
                "a1.iot.us-east-1.amazonaws.com",
                "52.0.0.1",
                "52.0.0.2",
                "alias.iot.eu-central-1.amazonaws.com",
            ]
        );
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let ex = extractor();
        let first: MatchSet = ex.extract("aws", records()).collect();
        let second: MatchSet = ex.extract("aws", records()).collect();
        assert_eq!(first.len(), second.len());
        assert_eq!(first.into_vec(), second.into_vec());
    }

    #[test]
    fn test_addresses_attach_to_name_passing_filters() {
        let ex = extractor();
        let record = RawRecord {
            dataset: Dataset::Censys,
            domain: "52.9.9.9".to_string(),
            rrtype: None,
            cname: None,
            addresses: vec!["52.9.9.9".to_string()],
            time_first: None,
            time_last: None,
            certificate: Some(CertificateFields {
                names: vec![
                    "edge.amazonaws.com".to_string(),
                    "a1-ats.iot.us-east-1.amazonaws.com".to_string(),
                ],
                ..Default::default()
            }),
        };
        let matches = ex.extract_record("aws", &record);
        let ip = matches.iter().find(|m| m.kind == ValueKind::Ip).unwrap();
        assert_eq!(ip.domain, "a1-ats.iot.us-east-1.amazonaws.com");
        assert!(ex.accepts(ip));
    }

    #[test]
    fn test_shared_address_is_yielded_again_when_it_passes() {
        let ex = extractor();
        let records = vec![
            RawRecord::dnsdb("edge.amazonaws.com.").with_addresses("A", vec!["52.9.9.9".to_string()]),
            RawRecord::dnsdb("a1-ats.iot.us-east-1.amazonaws.com.")
                .with_addresses("A", vec!["52.9.9.9".to_string()]),
            RawRecord::dnsdb("edge2.amazonaws.com.").with_addresses("A", vec!["52.9.9.9".to_string()]),
        ];
        let ips: Vec<String> = ex
            .extract("aws", records)
            .filter(|m| m.kind == ValueKind::Ip)
            .map(|m| m.domain)
            .collect();
        assert_eq!(ips, vec!["edge.amazonaws.com", "a1-ats.iot.us-east-1.amazonaws.com"]);
    }

    #[test]
    fn test_cname_evidence_is_kept() {
        let ex = extractor();
        let matches = ex.extract_record("aws", &records()[3]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].cname_target(), Some("b2-ats.iot.eu-central-1.amazonaws.com"));
    }

    #[test]
    fn test_certificate_names_are_candidates() {
        let ex = extractor();
        let record = RawRecord {
            dataset: Dataset::Censys,
            domain: "203.0.113.7".to_string(),
            rrtype: None,
            cname: None,
            addresses: vec!["203.0.113.7".to_string()],
            time_first: None,
            time_last: None,
            certificate: Some(CertificateFields {
                subject_dn: Some("CN=*.azure-devices.net".to_string()),
                issuer_dn: Some("CN=Microsoft RSA TLS CA 01".to_string()),
                names: vec!["*.azure-devices.net".to_string(), "myhub.azure-devices.net".to_string()],
                port: Some(8883),
                ..Default::default()
            }),
        };
        let matches = ex.extract_record("azure", &record);
        let values: Vec<&str> = matches.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(values, vec!["azure-devices.net", "myhub.azure-devices.net", "203.0.113.7"]);
        assert_eq!(matches[0].evidence.port, Some(8883));
        assert_eq!(matches[2].dataset, Dataset::Censys);
    }
}
