//! Command-line front end.
//!
//! Operator-facing output is printed here; the library only logs through
//! `tracing`.

mod args;

pub use args::{Cli, Command, CreateArgs, GlobalArgs, TemplateKind};

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result, bail};
use colored::*;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, FileConfig, redact_url};
use crate::migrations::{
    self, Event, FileState, PlanStep, RollbackPlan, RollbackSource, StatusReport, UpOptions,
};
use crate::source::{MigrationSource, RollbackOrigin};
use crate::store::{self, MigrationStore};

/// Install the stderr log subscriber. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Run the parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let file = FileConfig::discover(cli.global.config.as_deref())?;
    let config = Config::resolve(&cli.global.to_cli_config(), file)?;
    let source = MigrationSource::new(&config.migrations_dir);

    match cli.command.unwrap_or(Command::Up) {
        // Only touches the filesystem.
        Command::Create(args) => create(&config, &args),
        Command::Up => with_store(&config, async |store| up(store, &source, &config).await).await,
        Command::Status { json } => {
            with_store(&config, async |store| status(store, &source, json).await).await
        }
        Command::Reset { yes } => {
            with_store(&config, async |store| reset(store, &config, yes).await).await
        }
        Command::Down { list: true, .. } => {
            with_store(&config, async |store| history(store).await).await
        }
        Command::Down { execute, yes, .. } => {
            with_store(&config, async |store| {
                down(store, &source, &config, execute, yes).await
            })
            .await
        }
        Command::Plan => with_store(&config, async |store| plan(store, &source).await).await,
    }
}

/// Open the tracking store, run `command` against it, then close it.
async fn with_store<F>(config: &Config, command: F) -> Result<()>
where
    F: AsyncFnOnce(&mut dyn MigrationStore) -> Result<()>,
{
    let mut store = store::connect(config)
        .await
        .context("could not open the tracking store")?;
    let result = command(store.as_mut()).await;
    store.close().await;
    result
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} {} [y/N] ", "⚠".yellow(), question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_target(store: &dyn MigrationStore, config: &Config) {
    println!(
        "  Database: {} ({})",
        redact_url(&config.database_url).yellow(),
        store.backend()
    );
    println!(
        "  Migration table: {}",
        store.tracking_table().qualified().green()
    );
    println!("  Directory: {}", config.migrations_dir.display());
    println!();
}

async fn up(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
    config: &Config,
) -> Result<()> {
    println!("{}", "Migrating UP".cyan().bold());
    print_target(store, config);

    let options = UpOptions { lock: config.lock };
    let on_event = |event: &Event<'_>| match event {
        Event::Applying { filename } => {
            println!("  {} {}", "→".cyan(), filename);
        }
        Event::Applied { elapsed, .. } => {
            println!("    {} ({}ms)", "✓ applied".green(), elapsed.as_millis());
        }
        Event::AlreadyApplied { filename } => {
            println!("  {} {} {}", "○".dimmed(), filename.dimmed(), "(already applied)".dimmed());
        }
        Event::Drifted {
            filename,
            recorded,
            current,
        } => {
            println!(
                "  {} {} changed after it was applied; skipping",
                "⚠".yellow(),
                filename.yellow()
            );
            println!("      recorded checksum: {}", recorded);
            println!("      current checksum:  {}", current);
        }
    };

    let report = tokio::select! {
        report = migrations::migrate_up(store, source, options, on_event) => report,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!(
                "{}",
                "Interrupted; the open transaction is rolled back when the connection closes."
                    .red()
            );
            bail!("interrupted");
        }
    };

    let report = match report {
        Ok(report) => report,
        Err(e) => {
            if e.is_execution() {
                println!("    {}", "✗ failed, rolled back".red());
            }
            return Err(e.into());
        }
    };

    println!();
    if report.is_noop() {
        println!("{}", "No new migrations to apply.".green());
    } else {
        println!(
            "{} {} applied, {} already applied",
            "✓ Done:".green().bold(),
            report.applied.len(),
            report.already_applied.len()
        );
    }
    if !report.drifted.is_empty() {
        println!(
            "{} {} migration(s) drifted; add a new migration instead of editing applied ones",
            "⚠".yellow(),
            report.drifted.len()
        );
    }
    Ok(())
}

async fn status(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
    json: bool,
) -> Result<()> {
    let report = migrations::migrate_status(store, source).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "📋 Migration Status".cyan().bold());
    println!(
        "  Migration table: {} ({:?})",
        store.tracking_table().qualified().green(),
        report.tracking_shape
    );
    println!();
    print_status(&report);
    Ok(())
}

fn print_status(report: &StatusReport) {
    if report.entries.is_empty() {
        println!("  {} No migration files found", "○".dimmed());
    }

    for entry in &report.entries {
        let format_note = if entry.conventional {
            String::new()
        } else {
            " (invalid name format)".yellow().to_string()
        };
        match &entry.state {
            FileState::Applied { applied_at } => {
                let when = applied_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("  {} {}{} {}", "✓".green(), entry.filename, format_note, when.dimmed());
            }
            FileState::Pending => {
                println!("  {} {}{}", "○".yellow(), entry.filename, format_note);
            }
            FileState::Drifted {
                recorded, current, ..
            } => {
                println!(
                    "  {} {}{} {}",
                    "⚠".red(),
                    entry.filename,
                    format_note,
                    "(drifted)".red()
                );
                println!("      recorded: {}", recorded);
                println!("      current:  {}", current);
            }
        }
    }

    for record in &report.missing {
        println!(
            "  {} {} {}",
            "?".dimmed(),
            record.filename,
            "(recorded, file missing)".dimmed()
        );
    }

    println!();
    println!(
        "  Applied: {}  Pending: {}  Drifted: {}  Missing: {}",
        report.applied_count().to_string().green(),
        report.pending_count().to_string().yellow(),
        report.drifted_count().to_string().red(),
        report.missing.len()
    );
}

async fn plan(store: &mut dyn MigrationStore, source: &MigrationSource) -> Result<()> {
    println!("{}", "📋 Migration Plan (dry-run)".cyan().bold());
    println!();

    let plan = migrations::migrate_plan(store, source).await?;
    for step in &plan.steps {
        match step {
            PlanStep::Apply(file) => println!("  {} {}", "+ apply".green(), file.filename),
            PlanStep::AlreadyApplied { filename } => {
                println!("  {} {}", "  skip ".dimmed(), filename.dimmed())
            }
            PlanStep::Drifted { filename, .. } => {
                println!("  {} {}", "! drift".yellow(), filename)
            }
        }
    }

    println!();
    if plan.pending_count() == 0 {
        println!("{}", "No new migrations to apply.".green());
    } else {
        println!("  {} migration(s) would be applied", plan.pending_count());
    }
    Ok(())
}

async fn down(
    store: &mut dyn MigrationStore,
    source: &MigrationSource,
    config: &Config,
    execute: bool,
    yes: bool,
) -> Result<()> {
    println!("{}", "⬇️  Migration Rollback".cyan().bold());
    println!();

    let Some(plan) = migrations::migrate_down(store, source).await? else {
        println!("  {} No migrations have been applied", "○".dimmed());
        return Ok(());
    };

    println!("  Last migration: {}", plan.record.filename.cyan());
    if let Some(applied_at) = plan.record.applied_at {
        println!("  Applied at:     {}", applied_at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();

    if !print_rollback_sql(&plan) {
        if execute {
            bail!(
                "{} has no rollback SQL and cannot be rolled back safely",
                plan.record.filename
            );
        }
        return Ok(());
    }

    if !execute {
        println!(
            "  {}",
            "Run again with --execute to apply it and delete the tracking record.".yellow()
        );
        return Ok(());
    }

    if !config.environment.is_production()
        && !yes
        && !confirm(&format!(
            "Roll back {}? This action cannot be undone.",
            plan.record.filename
        ))?
    {
        println!("{}", "Rollback cancelled.".yellow());
        return Ok(());
    }

    migrations::migrate_rollback(store, &plan, &config.environment, config.lock).await?;
    println!("{} {}", "✓ Rolled back:".green(), plan.record.filename);
    Ok(())
}

/// Print the plan's rollback SQL. Returns false when there is none.
fn print_rollback_sql(plan: &RollbackPlan) -> bool {
    match (&plan.rollback_sql, plan.source) {
        (Some(sql), Some(origin)) => {
            let from = match origin {
                RollbackSource::Recorded => "tracking table",
                RollbackSource::File(RollbackOrigin::DownFile) => "down file",
                RollbackSource::File(RollbackOrigin::CommentBlock) => "ROLLBACK comment",
            };
            println!("  Rollback SQL (from {}):", from);
            for line in sql.lines() {
                println!("    {}", line);
            }
            println!();
            true
        }
        _ => {
            println!(
                "  {} No rollback SQL is available for this migration",
                "⚠".yellow()
            );
            false
        }
    }
}

async fn history(store: &mut dyn MigrationStore) -> Result<()> {
    println!("{}", "📋 Recent Migrations".cyan().bold());
    println!();

    let records = migrations::migrate_history(store, 10).await?;
    if records.is_empty() {
        println!("  {} No migrations have been applied", "○".dimmed());
    }
    for record in &records {
        let when = record
            .applied_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let rollback = if record.rollback_sql.is_some() {
            "rollback".green()
        } else {
            "no rollback".dimmed()
        };
        println!("  {} {} ({})", record.filename, when.dimmed(), rollback);
    }
    Ok(())
}

async fn reset(store: &mut dyn MigrationStore, config: &Config, yes: bool) -> Result<()> {
    if !config.environment.is_production()
        && !yes
        && !confirm(&format!(
            "Delete every record in {}? Migrations will run again on the next `up`.",
            store.tracking_table().qualified()
        ))?
    {
        println!("{}", "Reset cancelled.".yellow());
        return Ok(());
    }

    let removed = migrations::migrate_reset(store, &config.environment).await?;
    println!("{} removed {} record(s)", "✓ Reset:".green(), removed);
    Ok(())
}

fn create(config: &Config, args: &CreateArgs) -> Result<()> {
    println!("{}", "📝 Creating Migration".cyan().bold());
    println!();

    let template = args.template().map_err(anyhow::Error::msg)?;
    let created = migrations::migrate_create(
        &config.migrations_dir,
        &args.description,
        &template,
        chrono::Utc::now(),
    )?;

    println!("  {} {}", "✓ Created:".green(), created.path.display());
    println!("  {} {}", "✓ Created:".green(), created.down_path.display());
    println!();
    println!("  Template:    {}", template.name().cyan());
    println!("  Description: {}", args.description);
    println!();
    println!("  Edit the files, then run {}", "mdh-migrate up".cyan());
    Ok(())
}
