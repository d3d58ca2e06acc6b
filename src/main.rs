//! kvshift - migrate a user's local key-value data into a relational store
//!
//! Command-line front end over the [`Orchestrator`]: scan and validate the
//! local store, take backups, run a migration strategy, roll back, and
//! drain the hybrid sync queue.
//!
//! # Usage
//!
//! ```text
//! kvshift scan
//! kvshift health
//! kvshift migrate --strategy safe --dry-run
//! kvshift rollback --backup-id <ID>
//! kvshift status
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;

use kvshift::config::{Config, LogFormat};
use kvshift::model::ExportDataset;
use kvshift::orchestrator::{
    CheckStatus, HealthStatus, MigrationRequest, MigrationStrategy, OperationResult, Orchestrator,
};
use kvshift::recovery::BackupSource;
use kvshift::store::write_dataset;
use kvshift::validator::{users_with_errors, DatasetValidator, Priority, Recommendation};

/// Migration and recovery engine for user key-value data
#[derive(Parser, Debug)]
#[command(name = "kvshift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "KVSHIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the local store and report what would be migrated
    Scan,

    /// Export the local data and validate it
    Validate,

    /// Check readiness for a migration
    Health,

    /// Write the local data set to a JSON file
    Export {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Load a JSON data set into the local store
    Import {
        /// Data set file
        file: PathBuf,
    },

    /// Create a full backup
    Backup {
        /// Store to back up
        #[arg(long, value_enum, default_value = "local")]
        source: SourceArg,
    },

    /// Take a snapshot of the local store
    Snapshot {
        /// Event name recorded on the snapshot
        #[arg(long, default_value = "manual")]
        event: String,

        /// Free-form description
        #[arg(long)]
        description: Option<String>,
    },

    /// List backups and snapshots
    Backups,

    /// Run a migration
    Migrate {
        /// Migration strategy
        #[arg(long, value_enum, default_value = "safe")]
        strategy: StrategyArg,

        /// Export, validate and back up without writing to the remote store
        #[arg(long)]
        dry_run: bool,

        /// Continue when export validation finds errors
        #[arg(long)]
        ignore_validation_errors: bool,

        /// Skip the pre-flight health check (safe strategy)
        #[arg(long)]
        skip_health_check: bool,

        /// Switch hybrid mode on after a successful safe migration
        #[arg(long)]
        enable_hybrid: bool,
    },

    /// Restore local data from a backup
    Rollback {
        /// Backup to restore (defaults to the latest)
        #[arg(long)]
        backup_id: Option<String>,

        /// Restore only this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Switch hybrid mode on or off
    Hybrid {
        #[command(subcommand)]
        action: HybridAction,
    },

    /// Replay queued hybrid writes against the remote store
    Sync,

    /// Show migration, user and hybrid state
    Status,
}

#[derive(Subcommand, Debug)]
enum HybridAction {
    /// Mirror writes to the remote store
    Enable,
    /// Stop mirroring writes
    Disable,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Local,
    Remote,
}

impl From<SourceArg> for BackupSource {
    fn from(s: SourceArg) -> Self {
        match s {
            SourceArg::Local => BackupSource::Local,
            SourceArg::Remote => BackupSource::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Safe,
    Fast,
    Hybrid,
}

impl From<StrategyArg> for MigrationStrategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Safe => MigrationStrategy::Safe,
            StrategyArg::Fast => MigrationStrategy::Fast,
            StrategyArg::Hybrid => MigrationStrategy::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    init_logging(&config)?;

    let orchestrator = Orchestrator::from_config(config)?;
    let json = cli.json;

    match cli.command {
        Commands::Scan => cmd_scan(&orchestrator, json),
        Commands::Validate => cmd_validate(&orchestrator, json),
        Commands::Health => cmd_health(&orchestrator, json).await,
        Commands::Export { output } => cmd_export(&orchestrator, &output),
        Commands::Import { file } => cmd_import(&orchestrator, &file),
        Commands::Backup { source } => cmd_backup(&orchestrator, source.into(), json).await,
        Commands::Snapshot { event, description } => {
            cmd_snapshot(&orchestrator, &event, description, json)
        }
        Commands::Backups => cmd_backups(&orchestrator, json).await,
        Commands::Migrate {
            strategy,
            dry_run,
            ignore_validation_errors,
            skip_health_check,
            enable_hybrid,
        } => {
            let request = MigrationRequest {
                strategy: strategy.into(),
                dry_run,
                ignore_validation_errors,
                skip_health_check,
                enable_hybrid_after: enable_hybrid.then_some(true),
            };
            cmd_migrate(&orchestrator, request, json).await
        }
        Commands::Rollback { backup_id, user } => {
            cmd_rollback(&orchestrator, backup_id.as_deref(), user.as_deref(), json).await
        }
        Commands::Hybrid { action } => cmd_hybrid(&orchestrator, action, json),
        Commands::Sync => cmd_sync(&orchestrator, json).await,
        Commands::Status => cmd_status(&orchestrator, json),
    }
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(fmt::layer().json().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Unwrap an operation result, turning a failure into a CLI error
fn into_data<T>(result: OperationResult<T>) -> anyhow::Result<T> {
    match (result.success, result.data) {
        (true, Some(data)) => Ok(data),
        (_, _) => {
            let message = result
                .error
                .map(|e| format!("{} ({})", e.message, e.kind))
                .unwrap_or_else(|| format!("{} failed", result.operation));
            Err(anyhow::anyhow!(message))
        }
    }
}

// ── Scan ─────────────────────────────────────────────────────────────

fn cmd_scan(orchestrator: &Orchestrator, json: bool) -> anyhow::Result<()> {
    let scan = orchestrator.extractor().scan()?;
    if json {
        return print_json(&scan);
    }

    let health = match scan.health {
        kvshift::extractor::ScanHealth::Healthy => "healthy".green().bold(),
        kvshift::extractor::ScanHealth::Degraded => "degraded".yellow().bold(),
        kvshift::extractor::ScanHealth::Empty => "empty".dimmed(),
    };
    println!("{}", "Local Store".bold().underline());
    println!("  Health:        {}", health);
    println!("  Keys:          {} ({} app, {} engine)", scan.total_keys, scan.app_keys, scan.engine_keys);
    println!("  Size:          {}", format_bytes(scan.total_bytes as u64));
    println!("  Users:         {}", scan.user_count);
    println!("  With sessions: {}", scan.users_with_sessions);
    println!("  With stats:    {}", scan.users_with_stats);
    println!("  With meetings: {}", scan.users_with_meetings);
    println!("  Active:        {}", scan.active_sessions);
    println!();

    let issues = scan.issues();
    if !issues.is_empty() {
        println!("{}", "Issues".bold().underline());
        for issue in issues {
            println!("  {} {}", "⚠".yellow(), issue);
        }
        println!();
    }
    Ok(())
}

// ── Validate ─────────────────────────────────────────────────────────

fn cmd_validate(orchestrator: &Orchestrator, json: bool) -> anyhow::Result<()> {
    let extraction = orchestrator.extractor().extract_all()?;
    let result = DatasetValidator::new(orchestrator.validation().clone()).validate(&extraction.dataset);
    if json {
        return print_json(&result);
    }

    println!("{}", "Validation".bold().underline());
    println!("  Valid:   {}", if result.is_valid { "yes".green() } else { "no".red() });
    println!("  Score:   {}", format_score(result.score));
    println!("  Records: {}", result.total_records);
    println!("  Errors:  {}", result.error_total);
    println!("  Summary: {}", result.summary());
    if !extraction.skipped.is_empty() {
        println!("  Skipped: {} unreadable records", extraction.skipped.len());
    }
    let affected = users_with_errors(&result);
    if !affected.is_empty() {
        let names: Vec<&str> = affected.iter().map(String::as_str).collect();
        println!("  Users:   {}", names.join(", "));
    }
    println!();

    if !result.errors.is_empty() {
        println!("{}", "Errors".bold().underline());
        for issue in result.errors.all() {
            let record = issue.record_id.as_deref().unwrap_or("-");
            println!("  {} [{}] {} {}", "✗".red(), issue.rule.dimmed(), record, issue.message);
        }
        if result.truncated {
            println!("  {}", "(more errors not shown)".dimmed());
        }
        println!();
    }

    print_recommendations(&result.recommendations);
    Ok(())
}

// ── Health ───────────────────────────────────────────────────────────

async fn cmd_health(orchestrator: &Orchestrator, json: bool) -> anyhow::Result<()> {
    let report = into_data(orchestrator.perform_health_check().await)?;
    if json {
        return print_json(&report);
    }

    let status = match report.status {
        HealthStatus::Healthy => "healthy".green().bold(),
        HealthStatus::Issues => "issues".yellow().bold(),
        HealthStatus::Critical => "critical".red().bold(),
    };
    println!("{}", "Health Check".bold().underline());
    println!("  Status: {}", status);
    if let Some(score) = report.validation_score {
        println!("  Score:  {}", format_score(score));
    }
    println!();

    for check in &report.checks {
        let icon = match check.status {
            CheckStatus::Ok => "✓".green(),
            CheckStatus::Warning => "⚠".yellow(),
            CheckStatus::Error => "✗".red(),
        };
        println!("  {} {:12} {}", icon, check.name, check.message);
    }
    println!();

    print_recommendations(&report.recommendations);
    Ok(())
}

// ── Export / Import ──────────────────────────────────────────────────

fn cmd_export(orchestrator: &Orchestrator, output: &std::path::Path) -> anyhow::Result<()> {
    let extraction = orchestrator.extractor().extract_all()?;
    let contents = serde_json::to_string_pretty(&extraction.dataset)?;
    std::fs::write(output, contents)?;

    println!(
        "{} Exported {} users to {}",
        "✓".green().bold(),
        extraction.dataset.users.len(),
        output.display().to_string().yellow()
    );
    if !extraction.skipped.is_empty() {
        println!(
            "  {} {} unreadable records skipped",
            "⚠".yellow(),
            extraction.skipped.len()
        );
    }
    Ok(())
}

fn cmd_import(orchestrator: &Orchestrator, file: &std::path::Path) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(file)?;
    let dataset: ExportDataset = serde_json::from_str(&contents)?;
    write_dataset(orchestrator.context().local.as_ref(), &dataset)?;

    println!(
        "{} Imported {} users from {}",
        "✓".green().bold(),
        dataset.users.len(),
        file.display().to_string().yellow()
    );
    Ok(())
}

// ── Backups ──────────────────────────────────────────────────────────

async fn cmd_backup(orchestrator: &Orchestrator, source: BackupSource, json: bool) -> anyhow::Result<()> {
    let recovery = orchestrator.recovery();
    let backup = recovery
        .create_full_backup(source, recovery.default_backup_options())
        .await?;
    let info = backup.info();
    if json {
        return print_json(&info);
    }
    println!(
        "{} Created {} backup {} ({} entries, {} users)",
        "✓".green().bold(),
        info.source,
        info.id.cyan(),
        info.entry_count,
        info.user_count
    );
    Ok(())
}

fn cmd_snapshot(
    orchestrator: &Orchestrator,
    event: &str,
    description: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let snapshot = orchestrator.recovery().create_snapshot(event, description)?;
    let info = snapshot.info();
    if json {
        return print_json(&info);
    }
    println!(
        "{} Created snapshot {} for {} ({} entries)",
        "✓".green().bold(),
        info.id.cyan(),
        event.yellow(),
        info.entry_count
    );
    Ok(())
}

async fn cmd_backups(orchestrator: &Orchestrator, json: bool) -> anyhow::Result<()> {
    let backups = orchestrator.recovery().list_backups().await?;
    if json {
        return print_json(&backups);
    }
    if backups.is_empty() {
        println!("{}", "No backups found.".dimmed());
        return Ok(());
    }

    println!("{}", "Backups".bold().underline());
    for info in &backups {
        println!(
            "  {}  {}  {:8} {:8} {:>6} entries  {}",
            info.id.cyan(),
            info.timestamp.format("%Y-%m-%d %H:%M:%S"),
            info.kind.to_string(),
            info.source.to_string(),
            info.entry_count,
            info.event.as_deref().unwrap_or("").dimmed()
        );
    }
    Ok(())
}

// ── Migrate ──────────────────────────────────────────────────────────

async fn cmd_migrate(
    orchestrator: &Orchestrator,
    request: MigrationRequest,
    json: bool,
) -> anyhow::Result<()> {
    if !json {
        println!(
            "{} Starting {} migration{}...",
            "→".cyan().bold(),
            request.strategy.to_string().yellow(),
            if request.dry_run { " (dry run)" } else { "" }
        );
    }

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if json {
                continue;
            }
            if let kvshift::orchestrator::OrchestratorEvent::MigrationProgress {
                step,
                progress,
                message,
            } = event
            {
                println!(
                    "  [{:>3}%] {} {}",
                    progress,
                    step.unwrap_or_default().bold(),
                    message.unwrap_or_default().dimmed()
                );
            }
        }
    });

    let result = orchestrator.start_migration(request).await;
    printer.abort();

    if json {
        print_json(&result)?;
        return if result.success {
            Ok(())
        } else {
            Err(anyhow::anyhow!("migration failed"))
        };
    }

    if let Some(outcome) = &result.data {
        if let Some(report) = &outcome.report {
            println!();
            println!("{}", report.summary());
        }
        if let Some(hybrid) = &outcome.hybrid {
            println!();
            println!("{}", "Hybrid Migration".bold().underline());
            println!("  Migrated: {}", hybrid.migrated.len());
            println!("  Skipped:  {}", hybrid.skipped.len());
            println!("  Failed:   {}", hybrid.failed.len());
            for (user, errors) in &hybrid.failed {
                println!("  {} {}: {}", "✗".red(), user, errors.join("; "));
            }
        }
        if let Some(rollback) = &outcome.rolled_back {
            println!(
                "{} Rolled back to backup {} ({} keys restored)",
                "↺".yellow().bold(),
                rollback.backup_id.cyan(),
                rollback.restored_keys
            );
        }
        if outcome.hybrid_enabled {
            println!("{} Hybrid mode enabled", "✓".green());
        }
    }

    let _ = into_data(result)?;
    println!("{} Migration finished", "✓".green().bold());
    Ok(())
}

// ── Rollback ─────────────────────────────────────────────────────────

async fn cmd_rollback(
    orchestrator: &Orchestrator,
    backup_id: Option<&str>,
    user: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(user_id) = user {
        let report = into_data(orchestrator.rollback_user(user_id, backup_id).await)?;
        if json {
            return print_json(&report);
        }
        println!(
            "{} Restored user {} from {} ({} keys written, {} removed)",
            "✓".green().bold(),
            report.user_id.yellow(),
            report.backup_id.cyan(),
            report.restored_keys,
            report.removed_keys
        );
        if !report.user_in_backup {
            println!("  {} user was not in the backup", "⚠".yellow());
        }
        return Ok(());
    }

    let report = into_data(orchestrator.rollback_migration(backup_id).await)?;
    if json {
        return print_json(&report);
    }
    println!(
        "{} Restored backup {} ({} written, {} removed, {} unchanged)",
        "✓".green().bold(),
        report.backup_id.cyan(),
        report.restored_keys,
        report.removed_keys,
        report.unchanged_keys
    );
    if let Some(pre) = &report.pre_snapshot_id {
        println!("  Undo with: {}", format!("kvshift rollback --backup-id {pre}").cyan());
    }
    Ok(())
}

// ── Hybrid ───────────────────────────────────────────────────────────

fn cmd_hybrid(orchestrator: &Orchestrator, action: HybridAction, json: bool) -> anyhow::Result<()> {
    let result = match action {
        HybridAction::Enable => orchestrator.enable_hybrid_mode(),
        HybridAction::Disable => orchestrator.disable_hybrid_mode(),
    };
    let state = into_data(result)?;
    if json {
        return print_json(&state);
    }
    println!(
        "{} Hybrid mode {}",
        "✓".green().bold(),
        if state.enabled { "enabled".green() } else { "disabled".dimmed() }
    );
    Ok(())
}

async fn cmd_sync(orchestrator: &Orchestrator, json: bool) -> anyhow::Result<()> {
    let report = orchestrator.hybrid().drain().await?;
    if json {
        return print_json(&report);
    }
    if report.offline {
        println!("{}", "Remote store is offline; nothing replayed.".yellow());
        return Ok(());
    }

    println!("{}", "Sync Queue".bold().underline());
    println!("  Attempted: {}", report.attempted);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Retrying:  {}", report.retried);
    println!("  Deferred:  {}", report.deferred);
    for item in &report.permanently_failed {
        println!(
            "  {} {} for {}: {}",
            "✗".red(),
            item.operation,
            item.user_id,
            item.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

// ── Status ───────────────────────────────────────────────────────────

fn cmd_status(orchestrator: &Orchestrator, json: bool) -> anyhow::Result<()> {
    let status = into_data(orchestrator.get_status())?;
    if json {
        return print_json(&status);
    }

    match &status.migration {
        Some(migration) => {
            println!("{}", "Migration Status".bold().underline());
            println!("  Run ID:     {}", migration.run_id);
            println!("  State:      {}", migration.state);
            if let Some(step) = &migration.current_step {
                println!("  Step:       {}", step);
            }
            println!("  Progress:   {}%", migration.progress);
            if let Some(backup) = &migration.backup_id {
                println!("  Backup:     {}", backup.cyan());
            }
            if migration.dry_run {
                println!("  Dry run:    yes");
            }

            let bar_width = 40;
            let filled = (migration.progress as usize * bar_width) / 100;
            println!(
                "\n  [{}{}] {}%",
                "█".repeat(filled).green(),
                "░".repeat(bar_width - filled).dimmed(),
                migration.progress
            );

            if !migration.errors.is_empty() {
                println!();
                println!("{}", "Errors".bold().underline());
                for e in &migration.errors {
                    let step = e.step.map(|s| s.to_string()).unwrap_or_default();
                    let user = e.user_id.as_deref().unwrap_or("");
                    println!("  {} [{}] {} {}", "✗".red(), step.dimmed(), user, e.message);
                }
            }
            println!();
        }
        None => {
            println!("{}", "No migration has run.".dimmed());
            println!(
                "Use {} to start one.",
                "kvshift migrate --strategy safe".cyan()
            );
            println!();
        }
    }

    if !status.users.is_empty() {
        println!("{}", "Users".bold().underline());
        for (user_id, user) in &status.users {
            let state = if user.migrated {
                "migrated".green()
            } else if user.needs_migration {
                "pending".yellow()
            } else {
                "local".dimmed()
            };
            println!(
                "  {:24} {:10} {}",
                user_id,
                state,
                user.reason.as_deref().unwrap_or("").dimmed()
            );
        }
        println!();
    }

    println!("{}", "Engine".bold().underline());
    println!(
        "  Hybrid:     {}",
        if status.hybrid.enabled { "enabled".green() } else { "disabled".dimmed() }
    );
    println!("  Queued:     {}", status.pending_sync);
    println!("  Snapshots:  {}", status.snapshots);
    if let Some(backup) = &status.latest_backup {
        println!(
            "  Backup:     {} ({})",
            backup.id.cyan(),
            backup.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if status.busy {
        println!("  {}", "An operation is in progress".yellow());
    }
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────

fn print_recommendations(recommendations: &[Recommendation]) {
    if recommendations.is_empty() {
        return;
    }
    println!("{}", "Recommendations".bold().underline());
    for rec in recommendations {
        let priority = match rec.priority {
            Priority::Low => "LOW".dimmed(),
            Priority::Medium => "MED".yellow(),
            Priority::High => "HIGH".red(),
            Priority::Critical => "CRIT".red().bold(),
        };
        println!("  [{}] {}", priority, rec.message);
    }
    println!();
}

fn format_score(score: u8) -> colored::ColoredString {
    let text = format!("{score}/100");
    if score >= 80 {
        text.green().bold()
    } else if score >= 50 {
        text.yellow().bold()
    } else {
        text.red().bold()
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
