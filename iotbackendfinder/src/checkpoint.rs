// checkpoint.rs - Resume state for interrupted or failed runs
//
// When a provider run fails with a transient fetch error, or the run is
// cancelled with Ctrl+C, the completed seed queries, the failed query's cursor
// and the raw matches found so far are saved next to the output file. A later
// run with the same settings continues from that cursor instead of
// re-fetching everything.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::config::QuerySelection;
use crate::fetch::{PaginationCursor, Query};
use crate::record::Match;

/// Checkpoint file name - hidden file to avoid cluttering output directory
pub const CHECKPOINT_FILENAME: &str = ".iotbackendfinder-checkpoint.json";

/// Current checkpoint format version - bump when making breaking changes
pub const CHECKPOINT_VERSION: u32 = 1;

/// Persisted state of a multi-provider run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version for compatibility checking
    pub version: u32,

    /// UTC timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,

    /// Pattern catalog version the matches were extracted with
    pub catalog_version: String,

    /// Run settings hash to verify same settings on resume
    pub settings_hash: String,

    /// Progress per provider
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderProgress>,

    #[serde(skip)]
    pub checkpoint_dir: Option<PathBuf>,
}

/// Where a failed provider run stopped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumePoint {
    pub query: Query,
    pub cursor: PaginationCursor,
}

/// Saved progress of one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderProgress {
    /// Keys of seed queries that were fetched to the end
    #[serde(default)]
    pub completed_queries: BTreeSet<String>,

    /// Query and page to continue from
    pub resume_point: Option<ResumePoint>,

    /// Raw (unfiltered) matches accumulated so far
    #[serde(default)]
    pub matches: Vec<Match>,

    /// The provider run reached `Done`
    #[serde(default)]
    pub done: bool,
}

impl ProviderProgress {
    pub fn is_query_completed(&self, query: &Query) -> bool {
        self.completed_queries.contains(&query.key())
    }
}

impl Checkpoint {
    /// Create a new checkpoint for a run
    pub fn new(catalog_version: String, settings_hash: String) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            catalog_version,
            settings_hash,
            providers: BTreeMap::new(),
            checkpoint_dir: None,
        }
    }

    /// Get the checkpoint file path for a given output directory
    pub fn get_checkpoint_path(output_dir: &Path) -> PathBuf {
        output_dir.join(CHECKPOINT_FILENAME)
    }

    /// Check if a checkpoint file exists in the given directory
    pub fn exists(output_dir: &Path) -> bool {
        Self::get_checkpoint_path(output_dir).exists()
    }

    /// Load a checkpoint from the given output directory.
    /// Returns an error if the checkpoint version is incompatible.
    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = Self::get_checkpoint_path(output_dir);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
        let mut checkpoint: Checkpoint = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            anyhow::bail!(
                "Incompatible checkpoint version: file has version {} but current version is {}. \
                 Delete the checkpoint file to start fresh.",
                checkpoint.version,
                CHECKPOINT_VERSION
            );
        }
        checkpoint.checkpoint_dir = Some(output_dir.to_path_buf());
        Ok(checkpoint)
    }

    /// Save the checkpoint to its output directory using atomic write
    /// (write to temp file, then rename to prevent corruption on interrupt)
    pub fn save(&self, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create directory: {}", output_dir.display()))?;
        let path = Self::get_checkpoint_path(output_dir);
        let temp_path = output_dir.join(".iotbackendfinder-checkpoint.tmp");
        let content = serde_json::to_string_pretty(self)?;

        {
            let mut file = std::fs::File::create(&temp_path)?;
            std::io::Write::write_all(&mut file, content.as_bytes())?;
            file.sync_all()?;
        }

        std::fs::rename(&temp_path, &path)?;

        Ok(())
    }

    /// Delete the checkpoint file (called on successful completion)
    pub fn delete(output_dir: &Path) -> Result<()> {
        let path = Self::get_checkpoint_path(output_dir);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Check if this checkpoint was written with the given settings
    pub fn is_compatible(&self, settings_hash: &str) -> bool {
        self.settings_hash == settings_hash
    }

    pub fn progress(&self, provider: &str) -> Option<&ProviderProgress> {
        self.providers.get(provider)
    }

    pub fn record_progress(&mut self, provider: &str, progress: ProviderProgress) {
        self.providers.insert(provider.to_string(), progress);
    }

    /// True when every provider in the checkpoint finished
    pub fn is_finished(&self) -> bool {
        self.providers.values().all(|p| p.done)
    }

    /// Get summary statistics for the checkpoint
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            created_at: self.created_at,
            catalog_version: self.catalog_version.clone(),
            providers_total: self.providers.len(),
            providers_done: self.providers.values().filter(|p| p.done).count(),
            resumable: self.providers.values().filter(|p| p.resume_point.is_some()).count(),
            completed_queries: self.providers.values().map(|p| p.completed_queries.len()).sum(),
            matches: self.providers.values().map(|p| p.matches.len()).sum(),
        }
    }
}

/// Summary of checkpoint state for display
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub created_at: DateTime<Utc>,
    pub catalog_version: String,
    pub providers_total: usize,
    pub providers_done: usize,
    pub resumable: usize,
    pub completed_queries: usize,
    pub matches: usize,
}

impl std::fmt::Display for CheckpointSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Checkpoint from {} (catalog {}) - {}/{} providers done, {} resumable, {} queries completed, {} raw matches",
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.catalog_version,
            self.providers_done,
            self.providers_total,
            self.resumable,
            self.completed_queries,
            self.matches
        )
    }
}

/// Generate a settings hash for checkpoint compatibility checking
pub fn generate_settings_hash(
    catalog_version: &str,
    providers: &[String],
    selection: QuerySelection,
    max_chase_depth: u32,
    time_last_after: Option<i64>,
) -> String {
    let mut sorted: Vec<&String> = providers.iter().collect();
    sorted.sort();

    // Compact JSON array; field order is fixed so the digest is stable
    let canonical = serde_json::json!([catalog_version, sorted, selection, max_chase_depth, time_last_after]);
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

/// Resume mode options
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ResumeMode {
    /// Prompt user if checkpoint exists
    #[default]
    Prompt,
    /// Auto-resume if checkpoint exists
    AutoResume,
    /// Start fresh, ignore any existing checkpoint
    Fresh,
}
