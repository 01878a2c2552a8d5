//! `salesim` command-line interface.
//!
//! Three subcommands drive the simulator: `setup` installs the sales schema
//! and seed data, `simulate` runs one atomic D-1 batch and writes its log
//! artifact, and `verify` reconciles the latest artifact against live state.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chinook_salesim_core::{
    find_latest_log, format_date, now_utc, read_log, resolve_d1_window, verify_log, write_log,
    BatchRequest, LogSummary, RunStats, SimulationLog, VerificationReport,
};
use chinook_salesim_store_sqlite::SqliteSalesStore;
use clap::{Args, Parser, Subcommand};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "salesim", version, about = "D-1 sales activity simulator")]
pub struct Cli {
    /// Path of the sales database file.
    #[arg(long, global = true, default_value = "./chinook_sales.sqlite3")]
    pub db: PathBuf,

    /// Directory holding one simulation log artifact per run.
    #[arg(long, global = true, default_value = "./simulation_logs")]
    pub log_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install the sales schema, sequences, routine registry, and seed data.
    Setup,
    /// Run one batch of D-1 sales activity in a single transaction.
    Simulate(SimulateArgs),
    /// Reconcile the latest simulation log against live database state.
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of new sales to insert.
    #[arg(long, default_value_t = 10)]
    pub inserts: u32,

    /// Number of existing D-1 sales to update.
    #[arg(long, default_value_t = 0)]
    pub updates: u32,

    /// Number of existing D-1 sales to delete.
    #[arg(long, default_value_t = 0)]
    pub deletes: u32,

    /// Emit the run summary as pretty-printed JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Emit the verification report as pretty-printed JSON.
    #[arg(long)]
    pub json: bool,
}

/// Dispatches one parsed invocation. Returns the process exit code so
/// `main` stays a parse-and-dispatch shim.
///
/// # Errors
/// Returns any setup, simulation, or verification failure; `verify`
/// mismatches are reported through the exit code instead.
pub fn run_cli(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Setup => run_setup(&cli.db),
        Command::Simulate(args) => run_simulate(&cli.db, &cli.log_dir, &args),
        Command::Verify(args) => run_verify(&cli.db, &cli.log_dir, &args),
    }
}

fn run_setup(db: &Path) -> Result<ExitCode> {
    let store = SqliteSalesStore::open(db)?;
    store.migrate()?;
    println!("sales schema ready at {}", db.display());
    Ok(ExitCode::SUCCESS)
}

fn run_simulate(db: &Path, log_dir: &Path, args: &SimulateArgs) -> Result<ExitCode> {
    let request = BatchRequest {
        inserts: args.inserts,
        updates: args.updates,
        deletes: args.deletes,
    };

    let mut store = SqliteSalesStore::open(db)?;
    store
        .validate()
        .context("database not ready; run `salesim setup` first")?;

    let run_start = now_utc();
    let window = resolve_d1_window(run_start)?;
    tracing::info!(
        d1_date = %format_date(window.d1_date())?,
        requested = request.total(),
        "simulating D-1 sales activity"
    );

    let mut rng = rand::thread_rng();
    let operations = store.run_batch(&request, &window, &mut rng)?;

    // The batch is committed; only now does the run become durable.
    let log = SimulationLog {
        summary: LogSummary {
            run_id: Ulid::new(),
            d1_date: format_date(window.d1_date())?,
            started_at: run_start,
            requested: request,
        },
        operations,
    };
    let path = write_log(log_dir, &log)?;

    let stats = RunStats::from_records(&log.operations);
    if args.json {
        let payload = serde_json::json!({
            "run_id": log.summary.run_id,
            "d1_date": log.summary.d1_date,
            "log_path": path,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("run {} simulated D-1 day {}", log.summary.run_id, log.summary.d1_date);
        println!(
            "committed {} operations ({} inserts, {} no-ops)",
            stats.committed_operations, stats.committed_inserts, stats.noop_operations
        );
        println!(
            "revenue {:.2}, average sale {:.2}",
            stats.total_revenue, stats.average_sale
        );
        println!("log written to {}", path.display());
    }

    Ok(ExitCode::SUCCESS)
}

fn run_verify(db: &Path, log_dir: &Path, args: &VerifyArgs) -> Result<ExitCode> {
    // Locate and parse the artifact before touching the database, so a
    // missing log never creates an empty database file as a side effect.
    let path = find_latest_log(log_dir)?;
    let log = read_log(&path)?;
    tracing::info!(
        path = %path.display(),
        run_id = %log.summary.run_id,
        operations = log.operations.len(),
        "verifying simulation log"
    );

    let store = SqliteSalesStore::open(db)?;
    let report = verify_log(&log, &store)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&path, &report);
    }

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_report(path: &Path, report: &VerificationReport) {
    println!("verified {}", path.display());
    println!(
        "checked {} inserts, {} updates, {} deletes ({} no-op records skipped)",
        report.inserts_checked, report.updates_checked, report.deletes_checked, report.noop_records
    );
    if report.passed() {
        println!("verification passed");
    } else {
        println!("verification failed with {} mismatch(es):", report.failures());
        for mismatch in &report.mismatches {
            println!("  {mismatch}");
        }
    }
}
