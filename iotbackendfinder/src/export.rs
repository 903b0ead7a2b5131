use crate::record::{Match, ValueKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::Writer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Prefix prepended to output file names
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%SZ_";

const CSV_HEADERS: [&str; 17] = [
    "provider",
    "value",
    "kind",
    "domain",
    "rule_id",
    "dataset",
    "rrtype",
    "cname",
    "time_first",
    "time_last",
    "cert_subject",
    "cert_issuer",
    "port",
    "service_name",
    "snapshot_date",
    "asn",
    "chase_depth",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("Unknown export format '{}'. Valid options: csv, json", other)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Final output path for `base`.
///
/// A missing extension is filled in from `format`; with `timestamp` the file
/// name gets the UTC run time as prefix.
pub fn output_file_path(base: &Path, format: ExportFormat, timestamp: bool, now: DateTime<Utc>) -> PathBuf {
    let mut path = base.to_path_buf();
    if path.extension().is_none() {
        path.set_extension(format.extension());
    }
    if !timestamp {
        return path;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("matches.{}", format.extension()));
    path.set_file_name(format!("{}{}", now.format(TIMESTAMP_FORMAT), name));
    path
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

pub fn export_csv(matches: &[Match], output_path: &Path) -> Result<()> {
    debug!("Exporting {} matches to CSV: {}", matches.len(), output_path.display());

    let file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;
    let mut wtr = Writer::from_writer(file);

    wtr.write_record(CSV_HEADERS)?;

    for m in matches {
        wtr.write_record([
            m.provider.clone(),
            m.value.clone(),
            m.kind.as_str().to_string(),
            m.domain.clone(),
            m.rule_id.clone(),
            m.dataset.as_str().to_string(),
            opt(&m.evidence.rrtype),
            opt(&m.evidence.cname),
            opt(&m.evidence.time_first),
            opt(&m.evidence.time_last),
            opt(&m.evidence.cert_subject),
            opt(&m.evidence.cert_issuer),
            opt(&m.evidence.port),
            opt(&m.evidence.service_name),
            opt(&m.evidence.snapshot_date),
            opt(&m.evidence.asn),
            m.chase_depth.to_string(),
        ])?;
    }

    wtr.flush()?;
    info!("Exported {} matches to CSV: {}", matches.len(), output_path.display());
    Ok(())
}

#[derive(Serialize)]
struct JsonExport<'a> {
    summary: ExportSummary,
    matches: &'a [Match],
}

#[derive(Serialize)]
struct ExportSummary {
    generated_at: DateTime<Utc>,
    catalog_version: String,
    total_matches: usize,
    domains: usize,
    ips: usize,
    per_provider: BTreeMap<String, usize>,
}

pub fn export_json(matches: &[Match], catalog_version: &str, output_path: &Path) -> Result<()> {
    debug!("Exporting {} matches to JSON: {}", matches.len(), output_path.display());

    let mut per_provider: BTreeMap<String, usize> = BTreeMap::new();
    for m in matches {
        *per_provider.entry(m.provider.clone()).or_insert(0) += 1;
    }

    let json_output = JsonExport {
        summary: ExportSummary {
            generated_at: Utc::now(),
            catalog_version: catalog_version.to_string(),
            total_matches: matches.len(),
            domains: matches.iter().filter(|m| m.kind == ValueKind::Domain).count(),
            ips: matches.iter().filter(|m| m.kind == ValueKind::Ip).count(),
            per_provider,
        },
        matches,
    };

    let json_string = serde_json::to_string_pretty(&json_output)?;
    let mut file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;
    file.write_all(json_string.as_bytes())?;

    info!("Exported {} matches to JSON: {}", matches.len(), output_path.display());
    Ok(())
}

/// Write `matches` in `format`, creating the parent directory if needed
pub fn export_results(
    matches: &[Match],
    format: ExportFormat,
    catalog_version: &str,
    output_path: &Path,
) -> Result<()> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    match format {
        ExportFormat::Csv => export_csv(matches, output_path),
        ExportFormat::Json => export_json(matches, catalog_version, output_path),
    }
}
