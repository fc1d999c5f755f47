//! DeltaCopy CLI - incremental exporter for append-only objects

use clap::Parser;
use deltacopy::catalog::JsonFileCatalog;
use deltacopy::config::{
    catalog_from_cli, parse_duration, CatalogConnection, CliArgs, Commands, ConfigFile, LogFormat,
    OutputFormat, SyncConfig,
};
use deltacopy::error::{DeltaCopyError, Result};
use deltacopy::progress::PassProgress;
use deltacopy::storage::ObjectUri;
use deltacopy::sync::{PassReport, SyncOrchestrator};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    init_logging(&args);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr so JSON reports on stdout stay parseable
fn init_logging(args: &CliArgs) {
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Returns whether every pass succeeded
async fn run(args: CliArgs) -> Result<bool> {
    match &args.command {
        Commands::Run => cmd_run(&args).await,
        Commands::Watch { interval } => cmd_watch(&args, interval).await,
        Commands::Status => cmd_status(&args).await.map(|_| true),
        Commands::Track { source_id, offset } => cmd_track(&args, source_id, *offset).await.map(|_| true),
    }
}

async fn cmd_run(args: &CliArgs) -> Result<bool> {
    let config = SyncConfig::from_cli(args)?;
    if args.verbose > 0 && args.output_format == OutputFormat::Text {
        print_config(&config);
    }

    let progress = if args.progress && !args.quiet {
        Some(Arc::new(PassProgress::new()))
    } else {
        None
    };

    let mut orchestrator = SyncOrchestrator::connect(config).await?;
    if let Some(progress) = &progress {
        orchestrator = orchestrator.with_progress(progress.clone());
    }

    let result = orchestrator.run_pass().await;
    if let Some(progress) = &progress {
        progress.finish(result.as_ref().map(|r| r.is_success()).unwrap_or(false));
    }

    let report = result?;
    emit_report(args, &report)?;
    Ok(report.is_success())
}

async fn cmd_watch(args: &CliArgs, interval: &str) -> Result<bool> {
    let interval = parse_duration(interval)?;
    let config = SyncConfig::from_cli(args)?;
    if args.verbose > 0 && args.output_format == OutputFormat::Text {
        print_config(&config);
    }

    let cancelled = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(Notify::new());
    {
        let cancelled = cancelled.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; finishing rows in flight");
                cancelled.store(true, Ordering::SeqCst);
                interrupted.notify_one();
            }
        });
    }

    let orchestrator = SyncOrchestrator::connect(config)
        .await?
        .with_cancel_flag(cancelled.clone());

    info!(interval = %humantime::format_duration(interval), "Watching for appended data");

    let mut all_succeeded = true;
    loop {
        let started = Instant::now();
        match orchestrator.run_pass().await {
            Ok(report) => {
                all_succeeded &= report.is_success();
                emit_report(args, &report)?;
            }
            Err(e @ DeltaCopyError::LeaseHeld { .. }) => {
                warn!("Skipping pass: {}", e);
            }
            Err(e) if e.is_recoverable() => {
                warn!("Pass failed, retrying next interval: {}", e);
                all_succeeded = false;
            }
            Err(e) => return Err(e),
        }

        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval.saturating_sub(started.elapsed())) => {}
            _ = interrupted.notified() => break,
        }
    }

    info!("Watch stopped");
    Ok(all_succeeded)
}

async fn cmd_status(args: &CliArgs) -> Result<()> {
    let catalog = JsonFileCatalog::open(catalog_path(args)?);
    let rows = catalog.rows().await?;
    let lease = catalog.current_lease().await?;

    if args.output_format == OutputFormat::Json {
        let status = serde_json::json!({
            "catalog": catalog.path(),
            "lease": lease,
            "objects": rows,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("=== Catalog ===");
    println!("Path:     {}", catalog.path().display());
    println!("Objects:  {}", rows.len());
    match lease {
        Some(lease) => println!(
            "Lease:    {} until {}",
            lease.owner,
            lease.expires_at.to_rfc3339()
        ),
        None => println!("Lease:    free"),
    }

    if !rows.is_empty() {
        println!("\nTracked objects:");
        for row in &rows {
            print!(
                "  {} ({} exported)",
                row.source_id,
                humansize::format_size(row.offset, humansize::BINARY)
            );
            match &row.pending {
                Some(marker) if marker.start == row.offset => {
                    println!(" [uncommitted export to {}]", marker.target_id)
                }
                _ => println!(),
            }
        }
    }

    Ok(())
}

async fn cmd_track(args: &CliArgs, source_id: &str, offset: u64) -> Result<()> {
    ObjectUri::parse(source_id)?;

    let catalog = JsonFileCatalog::create(catalog_path(args)?).await?;
    catalog.track(source_id, offset).await?;

    if !args.quiet {
        println!("Tracking {} from offset {}", source_id, offset);
    }
    Ok(())
}

fn catalog_path(args: &CliArgs) -> Result<PathBuf> {
    let file = match &args.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };

    match catalog_from_cli(args, &file)? {
        CatalogConnection::JsonFile { path } => Ok(path),
        CatalogConnection::Memory => Err(DeltaCopyError::config(
            "the in-memory catalog only lives inside a single process",
        )),
    }
}

fn emit_report(args: &CliArgs, report: &PassReport) -> Result<()> {
    match args.output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string(report)?),
        OutputFormat::Text if !args.quiet => report.print_summary(),
        OutputFormat::Text => {}
    }
    Ok(())
}

fn print_config(config: &SyncConfig) {
    println!("=== Configuration ===");
    println!("Target:      {}", config.target_namespace);
    println!("Catalog:     {:?}", config.catalog);
    println!("Storage:     {:?}", config.storage);
    println!("Concurrency: {}", config.concurrency);
    println!(
        "Timeout:     {}",
        config
            .pass_timeout
            .map(|t| humantime::format_duration(t).to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    if config.use_lease {
        println!(
            "Lease:       {} (ttl {})",
            config.lease_owner,
            humantime::format_duration(config.lease_ttl)
        );
    } else {
        println!("Lease:       disabled");
    }
    if let Some(rps) = config.requests_per_second {
        println!("Rate limit:  {} req/s", rps);
    }
    println!();
}
