//! rowmirror command-line tool.
//!
//! Provides subcommands for replaying the file mirror into the database,
//! capturing the database into the mirror, inspecting status and run
//! history, resolving stable identifiers, and generating / validating
//! configuration files.

mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use rowmirror_core::config::AppConfig;
use rowmirror_core::models::{AffectedEntity, VpId};
use rowmirror_core::sync_engine::{SyncEngine, SyncOutcome};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// rowmirror command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "rowmirror",
    version,
    about = "Keep database tables and a file mirror of their rows in sync"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./rowmirror.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a starter configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./rowmirror.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file and its entity schema.
    Validate,

    /// Replay the file mirror into the database.
    Sync {
        /// Only synchronize these stable identifiers (and what they pull in).
        /// Repeat for several. Without it, every entity type is reconciled.
        #[arg(short, long = "entity", value_name = "VP_ID")]
        entities: Vec<String>,

        /// Print the outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write the current database state into the file mirror.
    Capture,

    /// Show per-type counts and the last run.
    Status,

    /// Resolve a stable identifier to its native key and stored record.
    Lookup {
        /// Entity type, as declared under [entities].
        entity_type: String,
        /// Stable identifier.
        vp_id: String,
    },

    /// Show recent synchronization runs.
    Log {
        /// Maximum number of runs to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            AppConfig::load_from_file(&cli.config)
                .ok()
                .map(|c| c.mirror.log_level)
        })
        .unwrap_or_else(|| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Sync { entities, json } => cmd_sync(&open_engine(&cli.config)?, &entities, json),
        Commands::Capture => cmd_capture(&open_engine(&cli.config)?),
        Commands::Status => cmd_status(&open_engine(&cli.config)?),
        Commands::Lookup { entity_type, vp_id } => {
            cmd_lookup(&open_engine(&cli.config)?, &entity_type, &vp_id)
        }
        Commands::Log { limit } => cmd_log(&open_engine(&cli.config)?, limit),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let config =
        AppConfig::load_and_validate(path).context("failed to load configuration file")?;
    tracing::debug!(
        path = %path.display(),
        entities = config.entities.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Open the database and mirror named by the config file.
fn open_engine(path: &Path) -> Result<SyncEngine> {
    let config = load_config(path)?;
    SyncEngine::from_config(&config).context("failed to open sync engine")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# rowmirror configuration
# Relative paths are resolved against the directory of this file.

[mirror]
mirror_dir = "db"
database_path = "rowmirror.db"
log_level = "info"

[sync]
propagation_depth = 1
delete_orphan_rows = true
create_missing_tables = true

# One table per entity type. Reference fields hold the native key of a row
# of another type in the database and its stable identifier in the mirror.

[entities.user]
table = "users"
id_column = "ID"
[entities.user.fields]
user_login = {}
user_email = {}

[entities.post]
table = "posts"
id_column = "ID"
[entities.post.fields]
post_title = {}
post_content = {}
post_author = { references = "user" }
post_parent = { references = "post" }

[entities.comment]
table = "comments"
id_column = "comment_ID"
[entities.comment.fields]
comment_content = {}
comment_approved = { kind = "integer" }
comment_post_ID = { references = "post" }
user_id = { references = "user" }
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Describe your tables under [entities]");
    println!(
        "  2. Validate with: rowmirror validate --config {}",
        output.display()
    );
    println!(
        "  3. Export the database: rowmirror capture --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    match config.validate() {
        Ok(()) => {
            println!("  {}", style::success("Settings and entity schema are valid"));
        }
        Err(e) => {
            println!("  {}", style::error(&format!("Validation error: {}", e)));
            anyhow::bail!("configuration validation failed");
        }
    }
    let schema = config.schema()?;

    println!();
    println!("Configuration summary:");
    println!("  Mirror directory  : {}", config.mirror.mirror_dir.display());
    println!("  Database          : {}", config.mirror.database_path.display());
    println!("  Propagation depth : {}", config.sync.propagation_depth);
    println!("  Delete orphan rows: {}", config.sync.delete_orphan_rows);
    println!(
        "  Sync order        : {}",
        schema.dependency_order().join(" -> ")
    );
    for entity in schema.entities() {
        let refs: Vec<String> = entity
            .reference_fields()
            .filter_map(|f| f.references.as_ref().map(|t| format!("{} -> {}", f.name, t)))
            .collect();
        println!(
            "  {:<18}: table {}, {} fields{}",
            entity.name,
            entity.table,
            entity.fields.len(),
            if refs.is_empty() {
                String::new()
            } else {
                format!(" ({})", refs.join(", "))
            }
        );
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_sync(engine: &SyncEngine, entities: &[String], json: bool) -> Result<()> {
    let result = if entities.is_empty() {
        engine.synchronize_all()
    } else {
        let affected = entities
            .iter()
            .map(|s| VpId::parse(s).map(AffectedEntity::changed))
            .collect::<Result<Vec<_>, _>>()
            .context("invalid stable identifier")?;
        engine.synchronize_entities(affected)
    };
    let outcome = result.context("synchronization failed")?;

    if json {
        print_outcome_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }

    if !outcome.is_success() {
        anyhow::bail!(
            "{} entities could not be synchronized",
            outcome.failures().count()
        );
    }
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Entity type",
        "Inserted",
        "Updated",
        "Deleted",
        "Unchanged",
        "Failed",
    ]);
    for report in &outcome.reports {
        let failed = if report.failures.is_empty() {
            Cell::new("0")
        } else {
            Cell::new(report.failures.len()).fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(&report.entity_type),
            Cell::new(report.inserted),
            Cell::new(report.updated),
            Cell::new(report.deleted),
            Cell::new(report.unchanged),
            failed,
        ]);
    }

    println!();
    println!("{}", style::header(&format!("Sync run {}", outcome.run_id)));
    println!("{}", table);

    let failures: Vec<_> = outcome.failures().collect();
    if !failures.is_empty() {
        println!();
        println!("{}", style::header("Failures"));
        for failure in failures {
            println!("  {}", style::error(&failure.to_string()));
        }
    }

    println!();
    let elapsed = outcome.completed_at - outcome.started_at;
    let summary = format!(
        "{} row writes in {} ms",
        outcome.total_writes(),
        elapsed.num_milliseconds()
    );
    if outcome.is_success() {
        println!("{}", style::success(&summary));
    } else {
        println!("{}", style::warn(&summary));
    }
}

fn print_outcome_json(outcome: &SyncOutcome) -> Result<()> {
    let reports: Vec<serde_json::Value> = outcome
        .reports
        .iter()
        .map(|r| {
            serde_json::json!({
                "entity_type": r.entity_type,
                "inserted": r.inserted,
                "updated": r.updated,
                "deleted": r.deleted,
                "unchanged": r.unchanged,
                "failures": r.failures.iter().map(|f| serde_json::json!({
                    "vp_id": f.vp_id.as_str(),
                    "error": f.error.to_string(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    let value = serde_json::json!({
        "run_id": outcome.run_id,
        "scope": outcome.scope.label(),
        "success": outcome.is_success(),
        "total_writes": outcome.total_writes(),
        "started_at": outcome.started_at.to_rfc3339(),
        "completed_at": outcome.completed_at.to_rfc3339(),
        "reports": reports,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&value).context("failed to render JSON")?
    );
    Ok(())
}

fn cmd_capture(engine: &SyncEngine) -> Result<()> {
    let report = engine.capture_all().context("capture failed")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Entity type", "Written", "Unchanged", "Removed", "Dangling refs"]);
    for entity in &report.entities {
        let dangling = if entity.dangling == 0 {
            Cell::new("0")
        } else {
            Cell::new(entity.dangling).fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&entity.entity_type),
            Cell::new(entity.saved),
            Cell::new(entity.unchanged),
            Cell::new(entity.removed),
            dangling,
        ]);
    }

    println!("{}", table);
    println!(
        "{}",
        style::success(&format!(
            "Mirror at {} updated ({} files changed)",
            engine.storages().root().display(),
            report.total_changes()
        ))
    );
    Ok(())
}

fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.status().context("failed to read status")?;

    println!("{}", style::header("rowmirror Status"));
    println!("=================");
    println!();
    println!(
        "  Mirror           : {}",
        engine.storages().root().display()
    );
    println!(
        "  Last sync at     : {}",
        status.last_sync_at.as_deref().unwrap_or("never")
    );
    println!(
        "  Last sync state  : {}",
        status
            .last_sync_state
            .as_deref()
            .map(style::run_status)
            .unwrap_or_else(|| "none".to_string())
    );
    if let Some(run) = &status.last_run {
        println!(
            "  Last run         : {} ({}, {} failed)",
            run.id, run.scope, run.counts.failed
        );
    }
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Entity type", "Table", "Stored", "Mapped", "Rows"]);
    for entity in &status.entities {
        let in_step = entity.stored as i64 == entity.mapped && entity.mapped == entity.rows;
        let stored = Cell::new(entity.stored);
        table.add_row(vec![
            Cell::new(&entity.entity_type),
            Cell::new(&entity.table),
            if in_step { stored } else { stored.fg(Color::Yellow) },
            Cell::new(entity.mapped),
            Cell::new(entity.rows),
        ]);
    }
    println!("{}", table);
    Ok(())
}

fn cmd_lookup(engine: &SyncEngine, entity_type: &str, vp_id: &str) -> Result<()> {
    let vp_id = VpId::parse(vp_id).context("invalid stable identifier")?;
    let found = engine
        .lookup(entity_type, &vp_id)
        .context("lookup failed")?;

    println!("Entity type : {}", found.entity_type);
    println!("vp_id       : {}", found.vp_id);
    println!(
        "Native key  : {}",
        match found.native_id {
            Some(id) => id.to_string(),
            None if found.retired => "none (retired)".to_string(),
            None => "none".to_string(),
        }
    );
    match &found.record {
        Some(record) => {
            println!("Stored record:");
            for (name, value) in &record.fields {
                println!("  {:<20} {}", name, value);
            }
        }
        None => println!("Stored record: {}", style::dim("not in mirror")),
    }
    Ok(())
}

fn cmd_log(engine: &SyncEngine, limit: u32) -> Result<()> {
    let runs = engine
        .db()
        .list_sync_runs(limit)
        .context("failed to list sync runs")?;

    if runs.is_empty() {
        println!("No sync runs recorded.");
        return Ok(());
    }

    println!("{:<22} {:<10} {:<14} {:>5} {:>5} {:>5} {:>5} ID", "STARTED", "STATUS", "SCOPE", "INS", "UPD", "DEL", "FAIL");
    println!("{}", "-".repeat(100));

    for run in &runs {
        println!(
            "{:<22} {:<10} {:<14} {:>5} {:>5} {:>5} {:>5} {}",
            truncate(&run.started_at, 19),
            run.status,
            truncate(&run.scope, 14),
            run.counts.inserted,
            run.counts.updated,
            run.counts.deleted,
            run.counts.failed,
            style::dim(&run.id),
        );
    }

    println!();
    println!("{} runs shown", runs.len());

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}
