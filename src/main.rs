//! cohort-master CLI entry point

use anyhow::{Context, Result};
use cohort_master::cluster::LocalCluster;
use cohort_master::config::{cli::Cli, toml::load_config, validator::validate_config, Config};
use cohort_master::output::{json, text};
use cohort_master::storage::LocalStorage;
use cohort_master::{AppMaster, FinalStatus};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Exit status when the job ran but failed
const EXIT_JOB_FAILED: u8 = 2;

fn main() -> ExitCode {
    match run() {
        Ok(Some(FinalStatus::Failed)) => ExitCode::from(EXIT_JOB_FAILED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns the job's final status, or `None` for a dry run
fn run() -> Result<Option<FinalStatus>> {
    let cli = Cli::parse_args();
    cli.validate()?;

    let mut config = load_config(&cli)?;
    setup_logging(config.runtime.debug);

    let app_id = config.resolve_app_id();
    validate_config(&config).context("Configuration validation failed")?;

    println!("cohort-master v{}", env!("CARGO_PKG_VERSION"));
    println!("Application: {}", app_id);
    println!();
    println!("{}", config);
    println!();

    if config.runtime.debug {
        dump_environment();
    }

    if cli.dry_run {
        println!("Dry run mode - configuration validated successfully");
        return Ok(None);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let report = runtime.block_on(run_master(config.clone()))?;

    println!();
    text::print_summary(&report);

    if let Some(ref path) = config.output.json_output {
        json::write_json_output(path, &json::build_report(&report), true)?;
        println!();
        println!("JSON report written to {}", path.display());
    }

    Ok(Some(report.outcome.status))
}

async fn run_master(config: Config) -> Result<cohort_master::master::MasterReport> {
    let app_id = config.job.app_id.clone().unwrap_or_default();
    let cluster = LocalCluster::new(&app_id, &config.cluster);
    let storage = Arc::new(LocalStorage::new(&config.storage.root));

    let master = AppMaster::new(
        config,
        cluster.resource_manager,
        cluster.rm_events,
        cluster.node_manager,
        cluster.nm_events,
        storage,
    );
    master.run().await
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("cohort_master=debug,warn")
        } else {
            EnvFilter::new("cohort_master=info,warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Log the process environment and working directory contents
fn dump_environment() {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    for (key, value) in vars {
        debug!("env {}={}", key, value);
    }

    match std::env::current_dir() {
        Ok(cwd) => {
            debug!("Working directory: {}", cwd.display());
            if let Ok(entries) = std::fs::read_dir(&cwd) {
                for entry in entries.flatten() {
                    debug!("  {}", entry.file_name().to_string_lossy());
                }
            }
        }
        Err(e) => debug!("Failed to read working directory: {}", e),
    }
}
