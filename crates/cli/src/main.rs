//! scopesync command-line tool.
//!
//! Thin wrapper over [`scopesync_core::Engine`]: parses arguments, runs one
//! workspace operation and prints a short summary.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use scopesync_core::config::{WorkspaceConfig, CONFIG_FILE_NAME};
use scopesync_core::engine::{Engine, ExportOptions, ImportOptions, TagOptions};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Tag, export and import independently versioned components.
#[derive(Parser, Debug)]
#[command(name = "scopesync", version, about = "Component-level version control")]
struct Cli {
    /// Workspace root.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Log filter (e.g. `debug`, `scopesync_core=trace`). Falls back to
    /// RUST_LOG, then `workspace.log_level` in scopesync.toml, then `warn`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a workspace in the current directory.
    Init {
        /// Scope new components belong to.
        #[arg(long)]
        scope: String,

        /// Where imported components land.
        #[arg(long, default_value = "components")]
        default_directory: String,
    },

    /// Track a directory as a new component.
    Add {
        /// Component name within the default scope.
        name: String,
        /// Directory holding the component's files.
        dir: PathBuf,
    },

    /// Snapshot components into the local scope.
    Tag {
        /// Components to tag; all tracked components when omitted.
        ids: Vec<String>,

        /// Version to assign instead of the next patch.
        #[arg(long = "ver", value_name = "VERSION")]
        version: Option<String>,

        /// Tag components even if nothing changed.
        #[arg(long)]
        unmodified: bool,

        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Push tagged versions to a remote scope.
    Export {
        /// Components to export; all staged components when omitted.
        ids: Vec<String>,

        #[arg(long, default_value = "origin")]
        remote: String,
    },

    /// Bring remote versions into the workspace.
    Import {
        /// Components to import; all tracked components when omitted.
        ids: Vec<String>,

        #[arg(long, default_value = "origin")]
        remote: String,

        /// Merge diverged components: manual, theirs or ours. Without a value
        /// the configured default strategy is used.
        #[arg(long, num_args = 0..=1, value_name = "STRATEGY")]
        merge: Option<Option<String>>,

        /// Directory to write the component to (single component only).
        #[arg(long)]
        path: Option<String>,

        /// Replace non-empty directories that no component tracks.
        #[arg(long = "override")]
        override_dir: bool,

        /// Merge histories that share no common ancestor.
        #[arg(long)]
        allow_unrelated: bool,
    },

    /// Show the state of every tracked component.
    Status {
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Stop tracking components. Files stay on disk.
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Manage remote scopes.
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },

    /// Run a named action against a remote and print its answer.
    Action {
        /// Action name, e.g. list-components.
        name: String,
        /// Remote name.
        remote: String,

        /// Option passed to the action; the value is parsed as JSON when
        /// possible.
        #[arg(long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum RemoteAction {
    /// Add or replace a remote.
    Add { name: String, location: String },
    /// List configured remotes.
    List,
    /// Remove a remote.
    Remove { name: String },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let directive = log_directive(
        cli.log_level.as_deref(),
        std::env::var("RUST_LOG").ok(),
        &cli.workspace,
    );
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Log filter: `--log-level`, then RUST_LOG, then the workspace's configured
/// level, then `warn` outside a workspace.
fn log_directive(flag: Option<&str>, env: Option<String>, workspace: &Path) -> String {
    if let Some(level) = flag {
        return level.to_string();
    }
    if let Some(env) = env.filter(|e| !e.is_empty()) {
        return env;
    }
    WorkspaceConfig::load_from_file(workspace.join(CONFIG_FILE_NAME))
        .map(|config| config.workspace.log_level)
        .unwrap_or_else(|_| "warn".to_string())
}

fn open(root: &Path) -> Result<Engine> {
    Engine::open(root).with_context(|| format!("failed to open workspace at {}", root.display()))
}

fn run(cli: Cli) -> Result<()> {
    tracing::debug!(workspace = %cli.workspace.display(), command = ?cli.command, "running");
    let root = cli.workspace;

    match cli.command {
        Commands::Init {
            scope,
            default_directory,
        } => cmd_init(&root, &scope, &default_directory),
        Commands::Add { name, dir } => cmd_add(&open(&root)?, &name, &dir),
        Commands::Tag {
            ids,
            version,
            unmodified,
            message,
        } => cmd_tag(
            &open(&root)?,
            TagOptions {
                ids,
                version,
                unmodified,
                message,
            },
        ),
        Commands::Export { ids, remote } => cmd_export(&open(&root)?, ExportOptions { ids, remote }),
        Commands::Import {
            ids,
            remote,
            merge,
            path,
            override_dir,
            allow_unrelated,
        } => {
            let engine = open(&root)?;
            let merge = match merge {
                None => None,
                Some(raw) => Some(engine.merge_strategy(raw.as_deref())?),
            };
            cmd_import(
                &engine,
                ImportOptions {
                    ids,
                    remote,
                    merge,
                    path,
                    override_dir,
                    allow_unrelated,
                },
            )
        }
        Commands::Status { json } => cmd_status(&open(&root)?, json),
        Commands::Remove { ids } => cmd_remove(&open(&root)?, &ids),
        Commands::Remote { action } => cmd_remote(&open(&root)?, action),
        Commands::Action {
            name,
            remote,
            options,
        } => cmd_action(&open(&root)?, &name, &remote, &options),
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(root: &Path, scope: &str, default_directory: &str) -> Result<()> {
    let mut config = WorkspaceConfig::new(scope);
    config.workspace.default_directory = default_directory.to_string();
    Engine::init(root, config).context("failed to initialize workspace")?;
    println!("Initialized workspace in {}", root.display());
    Ok(())
}

fn cmd_add(engine: &Engine, name: &str, dir: &Path) -> Result<()> {
    let entry = engine
        .add(name, dir)
        .with_context(|| format!("failed to add {name}"))?;
    println!("added {} at {}", entry.full_name(), entry.root_dir);
    Ok(())
}

fn cmd_tag(engine: &Engine, options: TagOptions) -> Result<()> {
    let tagged = engine.tag(&options).context("tag failed")?;
    if tagged.is_empty() {
        println!("nothing to tag, use --unmodified to tag unchanged components");
        return Ok(());
    }
    println!("{} component(s) tagged", tagged.len());
    for id in tagged {
        println!("  {id}");
    }
    Ok(())
}

fn cmd_export(engine: &Engine, options: ExportOptions) -> Result<()> {
    let report = engine.export(&options)?;
    if report.exported.is_empty() {
        println!("nothing to export");
    } else {
        println!("exported {} component(s) to {}", report.exported.len(), options.remote);
        for id in &report.exported {
            println!("  {id}");
        }
    }
    Ok(())
}

fn cmd_import(engine: &Engine, options: ImportOptions) -> Result<()> {
    let report = engine.import(&options)?;
    for c in &report.imported {
        let mut line = format!("  {}@{} -> {}", c.id, c.version, c.root);
        if let Some(from) = &c.renamed_from {
            line.push_str(&format!(" (renamed from {from})"));
        }
        if let Some(strategy) = c.strategy {
            line.push_str(&format!(" [merged: {strategy}]"));
        }
        println!("{line}");
        for path in &c.conflicted_files {
            println!("      CONFLICT {path}");
        }
    }
    for id in &report.up_to_date {
        println!("  {id} is up to date");
    }
    Ok(())
}

fn cmd_status(engine: &Engine, json: bool) -> Result<()> {
    let report = engine.status().context("failed to compute status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if report.stale {
        println!("note: the workspace map was out of sync with the local scope and has been updated");
    }
    if report.components.is_empty() {
        println!("no tracked components");
        return Ok(());
    }
    for c in &report.components {
        let mut flags = Vec::new();
        if c.new {
            flags.push("new");
        }
        if c.modified {
            flags.push("modified");
        }
        if c.staged {
            flags.push("staged");
        }
        let state = if flags.is_empty() {
            "ok".to_string()
        } else {
            flags.join(", ")
        };
        println!(
            "  {:<40} {:<10} {}",
            c.id,
            c.version.as_deref().unwrap_or("-"),
            state
        );
    }
    Ok(())
}

fn cmd_remove(engine: &Engine, ids: &[String]) -> Result<()> {
    for id in engine.remove(ids).context("remove failed")? {
        println!("removed {id}");
    }
    Ok(())
}

fn cmd_remote(engine: &Engine, action: RemoteAction) -> Result<()> {
    match action {
        RemoteAction::Add { name, location } => {
            engine.add_remote(&name, &location)?;
            println!("remote {name} -> {location}");
        }
        RemoteAction::List => {
            let remotes = engine.remotes()?;
            if remotes.is_empty() {
                println!("no remotes configured");
            }
            for r in remotes {
                println!("  {:<16} {}", r.name, r.location);
            }
        }
        RemoteAction::Remove { name } => {
            if !engine.remove_remote(&name)? {
                anyhow::bail!("no remote named {name}");
            }
            println!("removed remote {name}");
        }
    }
    Ok(())
}

fn cmd_action(engine: &Engine, name: &str, remote: &str, raw: &[String]) -> Result<()> {
    let options = parse_options(raw)?;
    let answer = engine.run_action(name, remote, options)?;
    println!("{}", serde_json::to_string_pretty(&answer)?);
    Ok(())
}

/// Turn `key=value` pairs into an options object.
fn parse_options(raw: &[String]) -> Result<Map<String, Value>> {
    let mut options = Map::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("option '{pair}' must look like KEY=VALUE"))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        options.insert(key.to_string(), value);
    }
    Ok(options)
}
