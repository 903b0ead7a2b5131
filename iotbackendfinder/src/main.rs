use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use iotbackendfinder::bulk::BulkExportReader;
use iotbackendfinder::catalog::PatternCatalog;
use iotbackendfinder::checkpoint::{generate_settings_hash, Checkpoint, ResumeMode};
use iotbackendfinder::cli::{BulkArgs, CatalogCommands, Cli, Commands, DnsdbArgs};
use iotbackendfinder::config::{AppConfig, ConfigError, CONFIG_PATH};
use iotbackendfinder::export::{self, ExportFormat};
use iotbackendfinder::fetch::DnsdbSource;
use iotbackendfinder::logger::{self, VerbosityLevel};
use iotbackendfinder::pipeline::{CancelFlag, Pipeline, RunOutcome, RunSettings};

/// Default output file stem when neither config nor CLI name one
const DEFAULT_OUTPUT: &str = "iot_backends";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle --init flag first (before any other processing)
    if cli.init {
        match AppConfig::create_default_config() {
            Ok(path) => {
                println!("✅ Created default configuration file at: {}", path.display());
                println!("   Edit this file to customize settings, then run iotbackendfinder again.");
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("❌ Failed to create configuration file: {}", e);
                std::process::exit(1);
            }
        }
    }

    let verbosity = VerbosityLevel::from_flags(cli.quiet, cli.verbose);
    if let Err(e) = logger::init_logging(verbosity, cli.log_file.as_deref()) {
        eprintln!("⚠️  Warning: {:#}", e);
    }

    let Some(command) = cli.command else {
        eprintln!("❌ No command given. Run with --help for usage.");
        std::process::exit(2);
    };

    let result = match command {
        Commands::Catalog { action } => run_catalog_command(&action, cli.config.as_deref()),
        Commands::Dnsdb(args) => run_dnsdb(cli.config.as_deref(), &args).await,
        Commands::Censys(args) => run_bulk(cli.config.as_deref(), &args).await,
    };

    match result {
        Ok(code) => {
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Err(e) => {
            if e.downcast_ref::<ConfigError>().is_some() {
                eprintln!("❌ Configuration error: {}", e);
            } else {
                eprintln!("❌ {:#}", e);
            }
            std::process::exit(1);
        }
    }
}

/// Explicit file, else the default location when present, else built-in defaults
fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_from_path(path),
        None if Path::new(CONFIG_PATH).exists() => AppConfig::load(),
        None => Ok(AppConfig::default()),
    }
}

fn load_catalog(path: Option<&Path>) -> Result<Arc<PatternCatalog>, ConfigError> {
    let catalog = match path {
        Some(path) => PatternCatalog::load(path)?,
        None => PatternCatalog::embedded()?,
    };
    Ok(Arc::new(catalog))
}

fn run_catalog_command(action: &CatalogCommands, config_path: Option<&Path>) -> Result<i32> {
    match action {
        CatalogCommands::List { catalog } => {
            let config = load_config(config_path)?;
            let path = catalog.as_deref().or(config.run.catalog_path.as_deref());
            let catalog = load_catalog(path)?;

            println!("Pattern catalog version {}", catalog.version());
            for provider in catalog.providers() {
                println!();
                println!("{} ({})", provider.name, provider.display_name);
                for rule in &provider.rules {
                    println!("  rule   {:<28} {:<8} {}", rule.id, rule.kind_name(), rule.describe());
                }
                for filter in &provider.filters {
                    println!("  filter {}", filter);
                }
                for query in &provider.queries {
                    println!("  query  {}", query);
                }
            }
            Ok(0)
        }
        CatalogCommands::Check { file } => {
            let catalog = PatternCatalog::load(file)?;
            let rules: usize = catalog.providers().iter().map(|p| p.rules.len()).sum();
            println!(
                "✅ {} is valid: version {}, {} providers, {} rules",
                file.display(),
                catalog.version(),
                catalog.providers().len(),
                rules
            );
            Ok(0)
        }
    }
}

/// Directory holding the output file and the checkpoint
fn output_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn install_interrupt_handler(cancel: CancelFlag) {
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            eprintln!("⚠️  Force exiting (checkpoint may be incomplete).");
            std::process::exit(130); // 128 + SIGINT
        }
        cancel.cancel();
        eprintln!("\n⚠️  Interrupt received. Finishing current pages and saving checkpoint...");
        eprintln!("   Press Ctrl+C again to exit immediately.");
    })
    .unwrap_or_else(|e| {
        eprintln!(
            "⚠️  Warning: Failed to set Ctrl-C handler: {}. Interrupt signals may not be handled gracefully.",
            e
        );
    });
}

fn ask_yes_no(question: &str) -> bool {
    print!("{} [Y/n]: ", question);
    let _ = io::stdout().flush();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    let input = input.trim().to_lowercase();
    input.is_empty() || input == "y" || input == "yes"
}

/// Decide whether an existing checkpoint is used, following `mode`
fn resolve_checkpoint(dir: &Path, settings_hash: &str, mode: ResumeMode) -> Result<Option<Checkpoint>> {
    if !Checkpoint::exists(dir) {
        return Ok(None);
    }
    if mode == ResumeMode::Fresh {
        println!("🔄 Starting fresh run (--no-resume specified).");
        Checkpoint::delete(dir)?;
        return Ok(None);
    }

    let existing = match Checkpoint::load(dir) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!("Failed to load existing checkpoint: {:#}. Starting fresh.", e);
            Checkpoint::delete(dir)?;
            return Ok(None);
        }
    };
    let summary = existing.summary();
    let compatible = existing.is_compatible(settings_hash);

    let resume = match mode {
        ResumeMode::AutoResume => compatible,
        // Non-interactive sessions resume compatible checkpoints without asking
        ResumeMode::Prompt if !io::stdin().is_terminal() => compatible,
        ResumeMode::Prompt => {
            println!();
            println!("📋 Incomplete run checkpoint found:");
            println!("   {}", summary);
            if compatible {
                ask_yes_no("Resume from checkpoint?")
            } else {
                println!("⚠️  Checkpoint is incompatible with current settings.");
                if !ask_yes_no("Delete checkpoint and start fresh?") {
                    bail!("Cannot proceed with incompatible checkpoint");
                }
                false
            }
        }
        ResumeMode::Fresh => false,
    };

    if resume {
        println!("📋 Resuming from checkpoint: {}", summary);
        Ok(Some(existing))
    } else {
        if !compatible {
            println!("⚠️  Existing checkpoint is incompatible (different providers or settings). Starting fresh.");
        }
        Checkpoint::delete(dir)?;
        Ok(None)
    }
}

async fn run_dnsdb(config_path: Option<&Path>, args: &DnsdbArgs) -> Result<i32> {
    args.validate().map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))?;

    let mut config = load_config(config_path)?;
    args.apply_to(&mut config)
        .map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))?;
    config.validate()?;

    // Everything that can be misconfigured fails here, before any request
    let catalog = load_catalog(config.run.catalog_path.as_deref())?;
    let providers = catalog.select(&config.run.providers)?;
    let api_key = config.resolve_api_key()?;
    let source = Arc::new(DnsdbSource::new(api_key, &config.dnsdb, &config.http)?);

    let format = ExportFormat::from(args.common.format);
    let base = config
        .run
        .output_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    let output_path = export::output_file_path(&base, format, config.run.timestamp_output, Utc::now());
    let checkpoint_dir = output_dir(&base);

    let settings = RunSettings::from_config(&config);
    let settings_hash = generate_settings_hash(
        catalog.version(),
        &providers,
        settings.selection,
        settings.max_chase_depth,
        config.dnsdb.time_last_after,
    );
    let checkpoint = resolve_checkpoint(&checkpoint_dir, &settings_hash, args.get_resume_mode())?;

    info!(
        "Catalog {} - running {} providers: {}",
        catalog.version(),
        providers.len(),
        providers.join(", ")
    );

    let cancel = CancelFlag::new();
    install_interrupt_handler(cancel.clone());

    let pipeline = Pipeline::new(catalog.clone(), config.rate_limit.clone(), settings, cancel);
    let progress = logger::create_progress_bar(providers.len() as u64);
    let outcome = pipeline
        .run_remote(&providers, source, checkpoint.as_ref(), Some(progress.clone()))
        .await?;
    progress.finish_and_clear();

    let matches = outcome.matches().into_vec();
    export::export_results(&matches, format, catalog.version(), &output_path)?;

    if outcome.is_complete() {
        Checkpoint::delete(&checkpoint_dir)?;
    } else {
        let checkpoint = outcome.to_checkpoint(catalog.version(), &settings_hash);
        checkpoint
            .save(&checkpoint_dir)
            .context("Failed to save checkpoint")?;
        println!(
            "💾 Checkpoint saved to {}",
            Checkpoint::get_checkpoint_path(&checkpoint_dir).display()
        );
    }

    logger::print_run_summary(&outcome, Some(&output_path));
    Ok(exit_code(&outcome))
}

async fn run_bulk(config_path: Option<&Path>, args: &BulkArgs) -> Result<i32> {
    args.validate().map_err(|e| anyhow::anyhow!("Invalid arguments: {}", e))?;

    let mut config = load_config(config_path)?;
    args.apply_to(&mut config);
    config.validate()?;

    let catalog = load_catalog(config.run.catalog_path.as_deref())?;
    let providers = catalog.select(&config.run.providers)?;
    let Some(input) = config.run.input_file_path.clone() else {
        return Err(ConfigError::EmptyRequired {
            field: "run.input_file_path (or --input)".to_string(),
        }
        .into());
    };
    let files = BulkExportReader::discover(&input)?;
    if files.is_empty() {
        bail!("No export files (*.json.gz, *.jsonl.zst, *.json, *.jsonl) found in {}", input.display());
    }

    let format = ExportFormat::from(args.common.format);
    let base = config
        .run
        .output_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    let output_path = export::output_file_path(&base, format, config.run.timestamp_output, Utc::now());

    let cancel = CancelFlag::new();
    install_interrupt_handler(cancel.clone());

    let pipeline = Pipeline::new(
        catalog.clone(),
        config.rate_limit.clone(),
        RunSettings::from_config(&config),
        cancel,
    );
    let progress = logger::create_progress_bar(files.len() as u64);
    let outcome = pipeline
        .run_bulk(files, &providers, config.bulk.workers, Some(progress.clone()))
        .await?;
    progress.finish_and_clear();

    let matches = outcome.matches().into_vec();
    export::export_results(&matches, format, catalog.version(), &output_path)?;

    logger::print_run_summary(&outcome, Some(&output_path));
    Ok(exit_code(&outcome))
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    if outcome.cancelled {
        130
    } else if outcome.failed().next().is_some() {
        1
    } else {
        0
    }
}
