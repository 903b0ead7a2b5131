use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::checkpoint::ResumeMode;
use crate::config::{AppConfig, BackoffStrategy, QuerySelection};
use crate::export::ExportFormat;

#[derive(Parser, Debug)]
#[command(name = "iotbackendfinder")]
#[command(about = "Extract IoT backend provider domains and IPs from passive DNS and certificate datasets")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Create default configuration file at ./config/iotbackendfinder.toml
    #[arg(long, global = true)]
    pub init: bool,

    /// Configuration file (defaults to ./config/iotbackendfinder.toml when present)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose logging (use -v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only errors, the progress bar and the final summary
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query the DNSDB API for every selected provider
    Dnsdb(DnsdbArgs),

    /// Extract providers from local Censys host exports or stored DNSDB results
    #[command(alias = "bulk")]
    Censys(BulkArgs),

    /// Inspect the pattern catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommands {
    /// List providers, rules and filters of the active catalog
    List {
        /// Alternate catalog file
        #[arg(long, value_name = "FILE")]
        catalog: Option<PathBuf>,
    },

    /// Validate a catalog file
    Check {
        /// Catalog file to validate
        file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Basic,
    Flexible,
    Both,
}

impl From<ModeArg> for QuerySelection {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Basic => QuerySelection::Basic,
            ModeArg::Flexible => QuerySelection::Flexible,
            ModeArg::Both => QuerySelection::Both,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
        }
    }
}

/// Options shared by the run subcommands
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Comma-separated provider names (default: every catalog provider)
    #[arg(short, long, value_delimiter = ',')]
    pub providers: Vec<String>,

    /// Alternate pattern catalog file
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Output file (the extension follows --format when omitted)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "csv")]
    pub format: FormatArg,

    /// Do not prefix the output file name with the run timestamp
    #[arg(long)]
    pub no_timestamp: bool,

    /// Maximum CNAME hops followed from a match (overrides config)
    #[arg(long, value_name = "DEPTH")]
    pub max_chase_depth: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct DnsdbArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// DNSDB API key (falls back to config, then DNSDB_API_KEY)
    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,

    /// Which seed queries to run
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Providers queried concurrently (overrides config)
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Maximum API requests per second (overrides config)
    #[arg(long, value_name = "RPS")]
    pub requests_per_second: Option<u32>,

    /// Backoff strategy for retries: "linear" or "exponential" (overrides config)
    #[arg(long, value_name = "STRATEGY")]
    pub backoff_strategy: Option<String>,

    /// Maximum retry attempts for failed requests (overrides config)
    #[arg(long, value_name = "COUNT")]
    pub max_retries: Option<u32>,

    /// Auto-resume from checkpoint if one exists (skip resume prompt)
    #[arg(long, conflicts_with = "no_resume")]
    pub resume: bool,

    /// Start fresh, ignore any existing checkpoint
    #[arg(long, conflicts_with = "resume")]
    pub no_resume: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BulkArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Export file or directory of export files (overrides config)
    #[arg(short, long, value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Files processed in parallel (overrides config)
    #[arg(short, long, value_name = "N")]
    pub workers: Option<usize>,
}

impl CommonArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.providers.iter().any(|p| p.trim().is_empty()) {
            return Err("Provider names cannot be empty".to_string());
        }
        if let Some(depth) = self.max_chase_depth {
            if depth > 10 {
                return Err("Max chase depth cannot exceed 10".to_string());
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut AppConfig) {
        if !self.providers.is_empty() {
            config.run.providers = self.providers.iter().map(|p| p.trim().to_lowercase()).collect();
        }
        if let Some(catalog) = &self.catalog {
            config.run.catalog_path = Some(catalog.clone());
        }
        if let Some(output) = &self.output {
            config.run.output_path = Some(output.clone());
        }
        if self.no_timestamp {
            config.run.timestamp_output = false;
        }
        if let Some(depth) = self.max_chase_depth {
            config.analysis.max_chase_depth = depth;
        }
    }
}

impl DnsdbArgs {
    pub fn validate(&self) -> Result<(), String> {
        self.common.validate()?;

        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                return Err("Concurrency must be greater than 0".to_string());
            }
            if concurrency > 32 {
                return Err("Concurrency cannot exceed 32 to avoid exhausting the API quota".to_string());
            }
        }
        if self.requests_per_second == Some(0) {
            return Err("Requests per second must be greater than 0".to_string());
        }
        if let Some(strategy) = &self.backoff_strategy {
            strategy.parse::<BackoffStrategy>()?;
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut AppConfig) -> Result<(), String> {
        self.common.apply_to(config);
        if let Some(key) = &self.api_key {
            config.run.api_key = Some(key.clone());
        }
        if let Some(mode) = self.mode {
            config.dnsdb.query_selection = mode.into();
        }
        if let Some(concurrency) = self.concurrency {
            config.analysis.concurrency = concurrency;
        }
        if let Some(rps) = self.requests_per_second {
            config.rate_limit.requests_per_second = rps;
        }
        if let Some(strategy) = &self.backoff_strategy {
            config.rate_limit.backoff_strategy = strategy.parse()?;
        }
        if let Some(retries) = self.max_retries {
            config.rate_limit.max_retries = retries;
        }
        Ok(())
    }

    /// Get the resume mode based on CLI flags
    pub fn get_resume_mode(&self) -> ResumeMode {
        if self.resume {
            ResumeMode::AutoResume
        } else if self.no_resume {
            ResumeMode::Fresh
        } else {
            ResumeMode::Prompt
        }
    }
}

impl BulkArgs {
    pub fn validate(&self) -> Result<(), String> {
        self.common.validate()?;
        if self.workers == Some(0) {
            return Err("Workers must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut AppConfig) {
        self.common.apply_to(config);
        if let Some(input) = &self.input {
            config.run.input_file_path = Some(input.clone());
        }
        if let Some(workers) = self.workers {
            config.bulk.workers = workers;
        }
    }
}
