//! # rewind CLI - snapshots and rollback for a project directory
//!
//! A thin command-line surface over the rewind library.
//!
//! ## Usage
//! ```bash
//! # Initialize storage in the current directory
//! rewind init
//!
//! # Capture the current state
//! rewind snapshot -m "Before refactor" -t refactor
//!
//! # See what a rollback would do, then do it
//! rewind preview <snapshot-id>
//! rewind rollback <snapshot-id> --preserve
//!
//! # Apply the retention policy
//! rewind cleanup --dry-run
//! ```

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use rewind::config::{CompressionAlgorithm, CONFIG_FILE_NAME};
use rewind::index::INDEX_FILE_NAME;
use rewind::utils::format_bytes;
use rewind::{
    ActionContext, EngineBuilder, RewindConfig, RewindError, RollbackOptions, RollbackPreview,
    SnapshotEngine, SnapshotFilter, SnapshotMetadata,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Snapshot, storage and rollback for project directories
#[derive(Parser)]
#[command(name = "rewind")]
#[command(version)]
#[command(about = "Capture project snapshots and roll back without losing manual edits")]
#[command(long_about = None)]
struct Cli {
    /// Project directory (defaults to current)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Storage directory (defaults to <path>/.rewind)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize storage and write a default config.toml
    Init {
        /// Blob compression
        #[arg(long, value_enum, default_value = "zstd")]
        compression: CompressionMode,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Capture the current state
    #[command(alias = "snap")]
    Snapshot {
        /// Description
        #[arg(short, long)]
        message: Option<String>,

        /// Action type recorded with the snapshot
        #[arg(short, long, default_value = "manual")]
        action: String,

        /// Tags
        #[arg(short, long)]
        tag: Vec<String>,

        /// Show a spinner
        #[arg(long)]
        progress: bool,
    },

    /// List snapshots, oldest first
    #[command(alias = "ls")]
    List {
        /// Keep snapshots with this tag
        #[arg(short, long)]
        tag: Vec<String>,

        /// Keep snapshots with this action type
        #[arg(short, long)]
        action: Vec<String>,

        /// Keep snapshots that changed a path matching this glob
        #[arg(short, long)]
        file: Vec<String>,

        /// Only bookmarked snapshots
        #[arg(long)]
        bookmarked: bool,

        /// Show the most recent N snapshots
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show a snapshot and its changes
    Show {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Also list every file in the manifest
        #[arg(long)]
        files: bool,
    },

    /// Print a file as captured in a snapshot
    Cat {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Project-relative path
        file: PathBuf,
    },

    /// Preview a rollback
    Preview {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Restrict to these files
        #[arg(short, long)]
        files: Vec<PathBuf>,
    },

    /// Roll back to a snapshot
    #[command(alias = "rb")]
    Rollback {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Restrict to these files
        #[arg(short, long)]
        files: Vec<PathBuf>,

        /// Leave manually edited files untouched
        #[arg(long)]
        preserve: bool,

        /// Only report what would change
        #[arg(long)]
        dry_run: bool,

        /// Discard the backup of replaced files
        #[arg(long)]
        no_backup: bool,

        /// Capture a pre_rollback snapshot first
        #[arg(long)]
        safety: bool,

        /// Show a spinner
        #[arg(long)]
        progress: bool,
    },

    /// Delete a snapshot
    #[command(alias = "rm")]
    Delete {
        /// Snapshot id or unique prefix
        snapshot: String,
    },

    /// Apply the retention policy
    Cleanup {
        /// Report candidates without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove blobs no snapshot references
    Gc {
        /// Report orphans without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Show storage statistics
    Stats,

    /// Cross-check the blob store against the index
    Verify,

    /// Manage bookmarks
    #[command(subcommand)]
    Bookmark(BookmarkCommand),
}

#[derive(Subcommand)]
enum BookmarkCommand {
    /// Bookmark a snapshot
    Add {
        /// Snapshot id or unique prefix
        snapshot: String,

        /// Bookmark name
        name: String,

        /// Description
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Remove a bookmark
    Remove {
        /// Snapshot id or unique prefix
        snapshot: String,
    },

    /// List bookmarks
    List,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CompressionMode {
    None,
    Lz4,
    Zstd,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<RewindError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let root = cli.path.unwrap_or_else(|| PathBuf::from("."));
    let storage = cli
        .storage
        .unwrap_or_else(|| root.join(rewind::engine::DEFAULT_STORAGE_DIR));

    match cli.command {
        Commands::Init { compression, force } => cmd_init(&root, &storage, compression, force),
        Commands::Snapshot {
            message,
            action,
            tag,
            progress,
        } => cmd_snapshot(&open_engine(&root, &storage)?, message, action, tag, progress),
        Commands::List {
            tag,
            action,
            file,
            bookmarked,
            limit,
        } => {
            let filter = SnapshotFilter {
                tags: tag,
                action_types: action,
                file_patterns: file,
                bookmarked_only: bookmarked,
                ..Default::default()
            };
            cmd_list(&open_engine(&root, &storage)?, filter, limit)
        }
        Commands::Show { snapshot, files } => cmd_show(&open_engine(&root, &storage)?, &snapshot, files),
        Commands::Cat { snapshot, file } => cmd_cat(&open_engine(&root, &storage)?, &snapshot, &file),
        Commands::Preview { snapshot, files } => {
            cmd_preview(&open_engine(&root, &storage)?, &snapshot, files)
        }
        Commands::Rollback {
            snapshot,
            files,
            preserve,
            dry_run,
            no_backup,
            safety,
            progress,
        } => {
            let options = RollbackOptions {
                selective_files: files,
                preserve_manual_changes: preserve,
                dry_run,
                create_backup: !no_backup,
                safety_snapshot: safety,
            };
            cmd_rollback(&open_engine(&root, &storage)?, &snapshot, options, progress)
        }
        Commands::Delete { snapshot } => cmd_delete(&open_engine(&root, &storage)?, &snapshot),
        Commands::Cleanup { dry_run } => cmd_cleanup(&open_engine(&root, &storage)?, dry_run),
        Commands::Gc { dry_run } => cmd_gc(&open_engine(&root, &storage)?, dry_run),
        Commands::Stats => cmd_stats(&open_engine(&root, &storage)?),
        Commands::Verify => cmd_verify(&open_engine(&root, &storage)?),
        Commands::Bookmark(command) => cmd_bookmark(&open_engine(&root, &storage)?, command),
    }
}

/// Create the storage directory and write `config.toml`
fn cmd_init(root: &Path, storage: &Path, compression: CompressionMode, force: bool) -> anyhow::Result<()> {
    if storage.join(CONFIG_FILE_NAME).exists() && !force {
        bail!("already initialized at {}; use --force to rewrite the configuration", storage.display());
    }

    let mut config = RewindConfig::load(storage).unwrap_or_default();
    config.storage.compression = match compression {
        CompressionMode::None => CompressionAlgorithm::None,
        CompressionMode::Lz4 => CompressionAlgorithm::Lz4,
        CompressionMode::Zstd => CompressionAlgorithm::Zstd,
    };
    std::fs::create_dir_all(storage)
        .with_context(|| format!("creating {}", storage.display()))?;
    config.save(storage)?;

    let engine = EngineBuilder::new()
        .config(config)
        .storage_path(storage)
        .background_retention(false)
        .build(root.to_path_buf())?;

    println!("{} Initialized rewind", "✓".green().bold());
    println!("  Root: {}", engine.root().display().to_string().cyan());
    println!("  Storage: {}", engine.storage_path().display().to_string().cyan());
    println!("\nNext steps:");
    println!("  - Capture a snapshot: {}", "rewind snapshot -m \"Initial state\"".yellow());
    println!("  - List snapshots: {}", "rewind list".yellow());
    Ok(())
}

fn cmd_snapshot(
    engine: &SnapshotEngine,
    message: Option<String>,
    action: String,
    tags: Vec<String>,
    show_progress: bool,
) -> anyhow::Result<()> {
    let mut context = ActionContext::new(action);
    if let Some(message) = message {
        context = context.with_description(message);
    }
    for tag in tags {
        context = context.with_tag(tag);
    }

    let start = Instant::now();
    let spinner = show_progress.then(|| spinner("Capturing snapshot...")).transpose()?;
    let id = engine.create_snapshot(context)?;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let metadata = engine.get_snapshot(&id)?;
    let stats = engine.incremental_stats();
    println!("{} Created snapshot {}", "✓".green().bold(), id.yellow().bold());
    if !metadata.description.is_empty() {
        println!("  Message: {}", metadata.description.cyan());
    }
    println!("  Files: {}", stats.tracked_files.to_string().cyan());
    println!("  Size: {}", format_bytes(metadata.total_size).cyan());
    println!("  Changed: {}", metadata.files_affected.to_string().yellow());
    println!(
        "  Hashed: {} (reused {})",
        stats.last_scan_rehashed, stats.last_scan_reused
    );
    println!("  Time: {}", format_duration(trim_millis(start.elapsed())).to_string().cyan());
    Ok(())
}

fn cmd_list(engine: &SnapshotEngine, filter: SnapshotFilter, limit: Option<usize>) -> anyhow::Result<()> {
    let mut snapshots = engine.list_snapshots(&filter)?;
    if snapshots.is_empty() {
        println!("{}", "No snapshots found.".yellow());
        return Ok(());
    }
    if let Some(limit) = limit {
        let skip = snapshots.len().saturating_sub(limit);
        snapshots.drain(..skip);
    }

    println!("{}", "Snapshots:".blue().bold());
    for snapshot in &snapshots {
        print_snapshot_line(snapshot);
    }
    println!("\n{} snapshot(s)", snapshots.len());
    Ok(())
}

fn print_snapshot_line(snapshot: &SnapshotMetadata) {
    let bookmark = snapshot
        .bookmark
        .as_ref()
        .map(|b| format!(" [{}]", b.name).magenta().to_string())
        .unwrap_or_default();
    println!(
        "  {} {} {:<14} {:>4} changed  {}{}",
        snapshot.id.yellow(),
        snapshot.timestamp.format("%Y-%m-%d %H:%M:%S"),
        snapshot.action_type.cyan(),
        snapshot.files_affected,
        snapshot.description,
        bookmark
    );
}

fn cmd_show(engine: &SnapshotEngine, prefix: &str, show_files: bool) -> anyhow::Result<()> {
    let id = resolve_id(engine, prefix)?;
    let snapshot = engine.get_snapshot(&id)?;

    println!("{} {}", "Snapshot".blue().bold(), snapshot.id.yellow());
    println!("  Time: {}", snapshot.timestamp.to_rfc3339());
    println!("  Action: {}", snapshot.action_type.cyan());
    if !snapshot.description.is_empty() {
        println!("  Description: {}", snapshot.description);
    }
    if !snapshot.tags.is_empty() {
        let tags: Vec<&str> = snapshot.tags.iter().map(String::as_str).collect();
        println!("  Tags: {}", tags.join(", "));
    }
    if let Some(parent) = &snapshot.parent_snapshot {
        println!("  Parent: {}", parent);
    }
    if let Some(bookmark) = &snapshot.bookmark {
        println!("  Bookmark: {}", bookmark.name.magenta());
    }
    println!("  Total size: {}", format_bytes(snapshot.total_size));
    println!("  Compression: {:.2}", snapshot.compression_ratio);

    let changes = engine.get_file_changes(&id)?;
    println!("\n{} ({})", "Changes".blue().bold(), changes.len());
    for change in &changes {
        let marker = match change.change_type {
            rewind::ChangeType::Added => "+".green(),
            rewind::ChangeType::Modified => "~".yellow(),
            rewind::ChangeType::Deleted => "-".red(),
        };
        println!("  {} {}", marker, change.file_path.display());
    }

    if show_files {
        let files = engine.get_snapshot_files(&id)?;
        println!("\n{} ({})", "Files".blue().bold(), files.len());
        for file in &files {
            println!(
                "  {} {:>10}  {}",
                &file.content_hash[..12],
                format_bytes(file.size),
                file.path.display()
            );
        }
    }
    Ok(())
}

fn cmd_cat(engine: &SnapshotEngine, prefix: &str, file: &Path) -> anyhow::Result<()> {
    let id = resolve_id(engine, prefix)?;
    let content = engine
        .get_file_content_lazy(&id, file)?
        .ok_or_else(|| anyhow!("{} is not in snapshot {}", file.display(), id))?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&content)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_preview(engine: &SnapshotEngine, prefix: &str, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let id = resolve_id(engine, prefix)?;
    let preview = engine.preview_rollback(&id, &RollbackOptions::selective(files))?;
    print_preview(&preview);
    Ok(())
}

fn print_preview(preview: &RollbackPreview) {
    println!("{} {}", "Rollback to".blue().bold(), preview.target_id.yellow());
    if !preview.has_changes() {
        println!("  Working tree already matches the snapshot");
        return;
    }
    for path in &preview.to_restore {
        let marker = if preview.is_conflicted(path) { "!".red() } else { "~".yellow() };
        println!("  {} {}", marker, path.display());
    }
    for path in &preview.to_delete {
        let marker = if preview.is_conflicted(path) { "!".red() } else { "-".red() };
        println!("  {} {}", marker, path.display());
    }
    println!(
        "\n  {} to restore, {} to delete, {} to write",
        preview.to_restore.len(),
        preview.to_delete.len(),
        format_bytes(preview.bytes_to_write)
    );
    if !preview.conflicts.is_empty() {
        println!(
            "  {} {} file(s) were edited since the last snapshot",
            "Conflicts:".red().bold(),
            preview.conflicts.len()
        );
    }
}

fn cmd_rollback(
    engine: &SnapshotEngine,
    prefix: &str,
    options: RollbackOptions,
    show_progress: bool,
) -> anyhow::Result<()> {
    let id = resolve_id(engine, prefix)?;

    let spinner = show_progress.then(|| spinner("Rolling back...")).transpose()?;
    let result = engine.execute_rollback(&id, &options)?;
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let verb = if result.dry_run { "Would roll back" } else { "Rolled back" };
    println!("{} {} to {}", "✓".green().bold(), verb, id.yellow());
    println!("  Files restored: {}", result.files_restored.len().to_string().cyan());
    println!("  Files deleted: {}", result.files_deleted.len().to_string().yellow());
    println!("  Bytes written: {}", format_bytes(result.bytes_written).cyan());
    if !result.conflicts_preserved.is_empty() {
        println!("  Preserved manual edits:");
        for conflict in &result.conflicts_preserved {
            println!("    {}", conflict.path.display().to_string().magenta());
        }
    }
    if !result.conflicts_overwritten.is_empty() {
        println!("  Overwrote manual edits:");
        for conflict in &result.conflicts_overwritten {
            println!("    {}", conflict.path.display().to_string().red());
        }
    }
    if let Some(backup) = &result.backup_path {
        println!("  Backup: {}", backup.display());
    }
    if let Some(safety) = &result.safety_snapshot {
        println!("  Safety snapshot: {}", safety.yellow());
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );
    for warning in &result.warnings {
        println!("  {} {}", "warning:".yellow().bold(), warning);
    }
    Ok(())
}

fn cmd_delete(engine: &SnapshotEngine, prefix: &str) -> anyhow::Result<()> {
    let id = resolve_id(engine, prefix)?;
    let stats = engine.delete_snapshot(&id)?;
    println!("{} Deleted snapshot {}", "✓".green().bold(), id.yellow());
    println!(
        "  Reclaimed {} blob(s), {}",
        stats.blobs_removed,
        format_bytes(stats.bytes_reclaimed)
    );
    Ok(())
}

fn cmd_cleanup(engine: &SnapshotEngine, dry_run: bool) -> anyhow::Result<()> {
    let report = if dry_run {
        engine.preview_retention()?
    } else {
        engine.enforce_retention()?
    };

    if report.candidates.is_empty() {
        println!("{}", "Nothing to clean up.".green());
        return Ok(());
    }
    let header = if dry_run { "Would delete:" } else { "Deleted:" };
    println!("{}", header.blue().bold());
    for candidate in &report.candidates {
        let reasons: Vec<String> = candidate.reasons.iter().map(|r| r.to_string()).collect();
        println!("  {} ({})", candidate.id.yellow(), reasons.join(", "));
    }
    println!(
        "\n  Storage: {} -> {}",
        format_bytes(report.disk_usage_before),
        format_bytes(report.disk_usage_after)
    );
    if !dry_run {
        println!(
            "  Reclaimed {} blob(s), {}",
            report.blobs_reclaimed,
            format_bytes(report.bytes_reclaimed)
        );
    }
    Ok(())
}

fn cmd_gc(engine: &SnapshotEngine, dry_run: bool) -> anyhow::Result<()> {
    let stats = engine.cleanup_orphans(dry_run)?;
    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{} {} {} orphaned blob(s) of {} examined ({})",
        "✓".green().bold(),
        verb,
        stats.unreferenced.len(),
        stats.blobs_scanned,
        format_bytes(stats.bytes_reclaimed)
    );
    Ok(())
}

fn cmd_stats(engine: &SnapshotEngine) -> anyhow::Result<()> {
    let stats = engine.storage_stats()?;
    println!("{}", "Storage".blue().bold());
    println!("  Snapshots: {}", stats.index.snapshot_count.to_string().cyan());
    println!("  Bookmarks: {}", stats.index.bookmark_count);
    println!("  Blobs: {}", stats.store.object_count.to_string().cyan());
    println!("  Blob bytes: {}", format_bytes(stats.store.total_size).cyan());
    println!("  Index size: {}", format_bytes(stats.index.db_size_bytes));
    println!("  Tracked file states: {}", stats.index.file_state_count);
    println!("  Recorded changes: {}", stats.index.file_change_count);

    let incremental = engine.incremental_stats();
    println!("\n{}", "Incremental".blue().bold());
    match &incremental.last_snapshot {
        Some(id) => println!("  Latest snapshot: {}", id.yellow()),
        None => println!("  Latest snapshot: none"),
    }
    println!("  Tracked files: {}", incremental.tracked_files);
    Ok(())
}

fn cmd_verify(engine: &SnapshotEngine) -> anyhow::Result<()> {
    let report = engine.validate_integrity()?;
    println!("{}", "Integrity".blue().bold());
    println!("  Objects checked: {}", report.objects_checked);

    for hash in &report.missing_objects {
        println!("  {} missing {}", "✗".red(), hash);
    }
    for hash in &report.corrupted_objects {
        println!("  {} corrupted {}", "✗".red(), hash);
    }
    if !report.orphaned_objects.is_empty() {
        println!(
            "  {} orphaned object(s); run {} to reclaim",
            report.orphaned_objects.len(),
            "rewind gc".yellow()
        );
    }

    if report.is_valid() {
        println!("  {}", "✓ Valid".green());
        Ok(())
    } else {
        bail!(
            "{} missing and {} corrupted object(s)",
            report.missing_objects.len(),
            report.corrupted_objects.len()
        )
    }
}

fn cmd_bookmark(engine: &SnapshotEngine, command: BookmarkCommand) -> anyhow::Result<()> {
    match command {
        BookmarkCommand::Add {
            snapshot,
            name,
            description,
        } => {
            let id = resolve_id(engine, &snapshot)?;
            let bookmark = engine.add_bookmark(&id, &name, &description)?;
            println!(
                "{} Bookmarked {} as {}",
                "✓".green().bold(),
                bookmark.snapshot_id.yellow(),
                bookmark.name.magenta()
            );
        }
        BookmarkCommand::Remove { snapshot } => {
            let id = resolve_id(engine, &snapshot)?;
            if engine.remove_bookmark(&id)? {
                println!("{} Removed bookmark from {}", "✓".green().bold(), id.yellow());
            } else {
                println!("{} has no bookmark", id.yellow());
            }
        }
        BookmarkCommand::List => {
            let bookmarks = engine.list_bookmarks()?;
            if bookmarks.is_empty() {
                println!("{}", "No bookmarks.".yellow());
            }
            for bookmark in &bookmarks {
                println!(
                    "  {} {}  {}",
                    bookmark.snapshot_id.yellow(),
                    bookmark.name.magenta(),
                    bookmark.description
                );
            }
        }
    }
    Ok(())
}

/// Open an initialized engine for a short-lived command
fn open_engine(root: &Path, storage: &Path) -> anyhow::Result<SnapshotEngine> {
    if !storage.join(INDEX_FILE_NAME).exists() {
        return Err(RewindError::StorageNotInitialized(storage.to_path_buf()).into());
    }
    Ok(EngineBuilder::new()
        .storage_path(storage)
        .background_retention(false)
        .build(root.to_path_buf())?)
}

/// Resolve a full id, id prefix or short id to a snapshot id
fn resolve_id(engine: &SnapshotEngine, prefix: &str) -> anyhow::Result<String> {
    let snapshots = engine.list_snapshots(&SnapshotFilter::default())?;
    if let Some(exact) = snapshots.iter().find(|s| s.id == prefix) {
        return Ok(exact.id.clone());
    }

    let matches: Vec<&SnapshotMetadata> = snapshots
        .iter()
        .filter(|s| s.id.starts_with(prefix) || s.short_id().starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Err(RewindError::SnapshotNotFound(prefix.to_string()).into()),
        many => bail!("'{}' is ambiguous ({} snapshots match)", prefix, many.len()),
    }
}

fn spinner(message: &'static str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn trim_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
