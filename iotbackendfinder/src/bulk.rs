// bulk.rs - Reader for locally stored line-delimited JSON exports
//
// Handles Censys host snapshots (one host per line, flattened into one record
// per TLS service) and stored DNSDB results (one rrset object per line).
// Files may be gzip (.gz), zstd (.zst) or uncompressed. Corrupt lines are
// skipped and reported; a truncated compressed stream ends the file.

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::domain_utils;
use crate::fetch::dnsdb::DnsdbObject;
use crate::record::{CertificateFields, Dataset, ExtractionWarning, RawRecord};

/// Warnings kept per file; further malformed lines are only counted
const MAX_WARNINGS_PER_FILE: usize = 100;

const SUPPORTED_SUFFIXES: &[&str] = &[".json.gz", ".jsonl.gz", ".json.zst", ".jsonl.zst", ".json", ".jsonl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    Plain,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Compression::Gzip,
            Some("zst") | Some("zstd") => Compression::Zstd,
            _ => Compression::Plain,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CensysHost {
    host_identifier: Option<HostIdentifier>,
    autonomous_system: Option<AutonomousSystem>,
    #[serde(default)]
    services: Vec<CensysService>,
}

#[derive(Debug, Deserialize)]
struct HostIdentifier {
    ipv4: Option<String>,
    ipv6: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AutonomousSystem {
    asn: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CensysService {
    port: Option<u16>,
    service_name: Option<String>,
    snapshot_date: Option<String>,
    tls: Option<CensysTls>,
}

#[derive(Debug, Deserialize)]
struct CensysTls {
    certificates: Option<CensysCertificates>,
}

#[derive(Debug, Deserialize)]
struct CensysCertificates {
    leaf_data: Option<LeafData>,
}

#[derive(Debug, Deserialize)]
struct LeafData {
    issuer_dn: Option<String>,
    subject_dn: Option<String>,
    #[serde(default)]
    names: Vec<String>,
}

impl CensysHost {
    /// One record per TLS service carrying leaf certificate data
    fn into_records(self) -> Vec<RawRecord> {
        let ip = self
            .host_identifier
            .and_then(|h| h.ipv4.or(h.ipv6))
            .unwrap_or_default();
        let asn = self.autonomous_system.and_then(|a| a.asn);

        self.services
            .into_iter()
            .filter_map(|service| {
                let leaf = service.tls?.certificates?.leaf_data?;
                let domain = leaf
                    .subject_dn
                    .as_deref()
                    .and_then(domain_utils::common_name_from_dn)
                    .or_else(|| leaf.names.first().cloned())
                    .unwrap_or_else(|| ip.clone());
                Some(RawRecord {
                    dataset: Dataset::Censys,
                    domain,
                    rrtype: None,
                    cname: None,
                    addresses: if ip.is_empty() { Vec::new() } else { vec![ip.clone()] },
                    time_first: None,
                    time_last: None,
                    certificate: Some(CertificateFields {
                        subject_dn: leaf.subject_dn,
                        issuer_dn: leaf.issuer_dn,
                        names: leaf.names,
                        port: service.port,
                        service_name: service.service_name,
                        snapshot_date: service.snapshot_date,
                        asn,
                    }),
                })
            })
            .collect()
    }
}

/// Counters for one processed file
#[derive(Debug, Clone, Default)]
pub struct BulkStats {
    pub lines: u64,
    pub records: u64,
    pub malformed: u64,
    pub warnings: Vec<ExtractionWarning>,
}

impl BulkStats {
    pub fn merge(&mut self, other: BulkStats) {
        self.lines += other.lines;
        self.records += other.records;
        self.malformed += other.malformed;
        self.warnings.extend(other.warnings);
    }
}

/// Streams raw records out of bulk export files
pub struct BulkExportReader;

impl BulkExportReader {
    /// Files to process for `path`: the file itself, or every supported
    /// export file in the directory, sorted by name
    pub fn discover(path: &Path) -> Result<Vec<PathBuf>> {
        if !path.exists() {
            bail!("Input path does not exist: {}", path.display());
        }
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)
            .with_context(|| format!("Failed to read directory: {}", path.display()))?
        {
            let entry = entry?;
            let file_path = entry.path();
            if !file_path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if SUPPORTED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
                files.push(file_path);
            }
        }
        files.sort();
        debug!("Found {} export files in {}", files.len(), path.display());
        Ok(files)
    }

    /// Open a file with the decompressor its extension calls for
    pub fn open(path: &Path) -> Result<Box<dyn BufRead + Send>> {
        let file = File::open(path).with_context(|| format!("Failed to open export file: {}", path.display()))?;
        let reader: Box<dyn Read + Send> = match Compression::from_path(path) {
            Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
            Compression::Zstd => Box::new(
                zstd::stream::read::Decoder::new(file).context("Failed to create zstd decoder")?,
            ),
            Compression::Plain => Box::new(file),
        };
        Ok(Box::new(BufReader::new(reader)))
    }

    /// Parse one line into zero or more raw records
    pub fn parse_line(line: &str) -> std::result::Result<Vec<RawRecord>, String> {
        let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
        let Value::Object(mut object) = value else {
            return Err("line is not a JSON object".to_string());
        };

        if object.contains_key("host_identifier") || object.contains_key("services") {
            let host: CensysHost = serde_json::from_value(Value::Object(object)).map_err(|e| e.to_string())?;
            return Ok(host.into_records());
        }

        let dnsdb = if let Some(obj) = object.remove("obj") {
            obj
        } else if object.contains_key("rrname") {
            Value::Object(object)
        } else {
            return Err("neither a Censys host nor a DNSDB object".to_string());
        };
        let obj: DnsdbObject = serde_json::from_value(dnsdb).map_err(|e| e.to_string())?;
        Ok(vec![obj.into_record()])
    }

    /// Feed every record of `path` to `on_record`, skipping malformed lines
    pub fn read_records<F>(path: &Path, mut on_record: F) -> Result<BulkStats>
    where
        F: FnMut(RawRecord),
    {
        let mut reader = Self::open(path)?;
        let source = path.display().to_string();
        let mut stats = BulkStats::default();
        let mut buf: Vec<u8> = Vec::new();
        let mut line_num = 0usize;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    // Truncated compressed stream; everything recoverable was read
                    warn!("Stopped reading {} at line {}: {}", source, line_num + 1, e);
                    break;
                }
            }
            line_num += 1;
            if buf.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            stats.lines += 1;

            let parsed = std::str::from_utf8(&buf)
                .map_err(|e| format!("invalid UTF-8: {}", e))
                .and_then(Self::parse_line);
            match parsed {
                Ok(records) => {
                    for record in records {
                        stats.records += 1;
                        on_record(record);
                    }
                }
                Err(detail) => {
                    stats.malformed += 1;
                    if stats.warnings.len() < MAX_WARNINGS_PER_FILE {
                        stats.warnings.push(ExtractionWarning::MalformedRecord {
                            source: format!("{}:{}", source, line_num),
                            detail,
                        });
                    }
                }
            }
        }

        if stats.malformed > 0 {
            warn!("Skipped {} malformed lines in {}", stats.malformed, source);
        }
        debug!(
            "Read {} lines ({} records) from {}",
            stats.lines, stats.records, source
        );
        Ok(stats)
    }
}
