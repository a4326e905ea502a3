//! plugin-repo - private WordPress plugin repository client.
//!
//! Every subcommand that touches the pipeline is turned into an operation
//! name plus JSON parameters and sent through the dispatch table.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plugin_repo_client::core::{envelope, AppContext, Config, Router};
use plugin_repo_client::plugin::RepositoryConfig;

/// Private WordPress plugin repository client
#[derive(Parser)]
#[command(name = "plugin-repo")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the JSON response envelope instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file
    #[arg(short, long, global = true, env = "PLUGIN_REPO_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List every plugin offered by the configured repositories
    Scan {
        /// Ignore cached manifests
        #[arg(short, long)]
        force: bool,
    },

    /// Show available updates and installable plugins
    Plan {
        /// Ignore cached manifests
        #[arg(short, long)]
        force: bool,
    },

    /// Update an installed plugin
    Update {
        /// Main plugin file, e.g. acme-seo/acme-seo.php
        plugin_file: String,

        /// Reinstall even if already up to date
        #[arg(short, long)]
        force: bool,
    },

    /// Install a plugin from a repository
    Install {
        /// Plugin slug
        slug: String,
    },

    /// Activate an installed plugin
    Activate {
        /// Main plugin file
        plugin_file: String,
    },

    /// List backups of a plugin
    Backups {
        /// Plugin folder name
        slug: String,
    },

    /// Restore a plugin from a backup
    Restore {
        /// Plugin folder name
        slug: String,

        /// Backup archive file name (see `backups`)
        backup_file: String,
    },

    /// Inspect or clear the manifest cache
    Cache {
        /// Cache operation
        #[command(subcommand)]
        operation: CacheOperation,
    },

    /// Update every plugin with a newer version available
    AutoUpdate,

    /// Show the number of pending updates
    Count {
        /// Ignore the cached count and manifests
        #[arg(short, long)]
        force: bool,
    },

    /// Manage connected repositories
    Repos {
        /// Repository operation
        #[command(subcommand)]
        operation: ReposOperation,
    },

    /// Change update and cache settings
    Settings {
        /// Enable or disable automatic updates
        #[arg(long)]
        auto_update: Option<bool>,

        /// Manifest cache lifetime in seconds (0 disables caching)
        #[arg(long)]
        cache_ttl: Option<u64>,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheOperation {
    /// Show cache state per repository
    Info,

    /// Drop every cached manifest
    Clear,

    /// Drop the cached manifest of one repository (all if omitted)
    Invalidate {
        /// Repository URL
        url: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReposOperation {
    /// List connected repositories
    List,

    /// Connect a repository
    Add {
        /// Manifest endpoint URL
        url: String,

        /// Access token
        #[arg(short, long)]
        token: Option<String>,
    },

    /// Disconnect a repository
    Remove {
        /// Manifest endpoint URL
        url: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };

    tracing_subscriber::registry().with(fmt::layer().with_target(false).with_writer(io::stderr)).with(filter).init();

    match &cli.command {
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            return Ok(());
        }
        Commands::Config { path } => return cmd_config(cli.config.as_deref(), *path),
        Commands::Repos { operation: ReposOperation::List } => return cmd_repos_list(cli.config.as_deref(), cli.json),
        _ => {}
    }

    let config = Config::load(cli.config.as_deref())?;
    let (operation, params) = request(&cli.command, &config)?;

    let ctx = AppContext::from_config(config)?;
    let result = Router::new().dispatch(&ctx, operation, &params);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&envelope(&result))?);
        if result.is_err() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let data = result?;
    render(&cli.command, &data);
    Ok(())
}

/// Translate a subcommand into an operation name and its parameters.
fn request(command: &Commands, config: &Config) -> Result<(&'static str, Value)> {
    let request = match command {
        Commands::Scan { force } => ("scan", json!({ "force": force })),
        Commands::Plan { force } => ("plan", json!({ "force": force })),
        Commands::Update { plugin_file, force } => {
            let operation = if *force { "force_update" } else { "update_plugin" };
            (operation, json!({ "plugin_file": plugin_file }))
        }
        Commands::Install { slug } => ("install_plugin", json!({ "slug": slug })),
        Commands::Activate { plugin_file } => ("activate_plugin", json!({ "plugin_file": plugin_file })),
        Commands::Backups { slug } => ("get_backups", json!({ "slug": slug })),
        Commands::Restore { slug, backup_file } => {
            ("rollback_plugin", json!({ "slug": slug, "backup_file": backup_file }))
        }
        Commands::Cache { operation } => match operation {
            CacheOperation::Info => ("cache_info", json!({})),
            CacheOperation::Clear => ("clear_cache", json!({})),
            CacheOperation::Invalidate { url } => ("invalidate_cache", json!({ "url": url })),
        },
        Commands::AutoUpdate => ("auto_update", json!({})),
        Commands::Count { force } => ("update_count", json!({ "force": force })),
        Commands::Repos { operation } => {
            let mut settings = config.settings();
            match operation {
                ReposOperation::Add { url, token } => {
                    settings.repositories.retain(|r| r.url != *url);
                    settings.repositories.push(RepositoryConfig::new(url.clone(), token.clone()));
                }
                ReposOperation::Remove { url } => {
                    let before = settings.repositories.len();
                    settings.repositories.retain(|r| r.url != *url);
                    if settings.repositories.len() == before {
                        anyhow::bail!("Repository not configured: {url}");
                    }
                }
                ReposOperation::List => anyhow::bail!("listing repositories does not use the pipeline"),
            }
            ("save_settings", serde_json::to_value(settings)?)
        }
        Commands::Settings { auto_update, cache_ttl } => {
            let mut settings = config.settings();
            if let Some(enabled) = auto_update {
                settings.auto_update_enabled = *enabled;
            }
            if let Some(ttl) = cache_ttl {
                settings.cache_ttl_seconds = *ttl;
            }
            ("save_settings", serde_json::to_value(settings)?)
        }
        Commands::Config { .. } | Commands::Completions { .. } => {
            anyhow::bail!("command does not use the pipeline")
        }
    };

    Ok(request)
}

/// Print a handler response as text.
fn render(command: &Commands, data: &Value) {
    match command {
        Commands::Scan { .. } => render_scan(data),
        Commands::Plan { .. } => render_plan(data),
        Commands::Update { .. } | Commands::Install { .. } => render_install(data),
        Commands::Activate { plugin_file } => println!("Activated {plugin_file}"),
        Commands::Backups { slug } => render_backups(slug, data),
        Commands::Restore { slug, backup_file } => println!("Restored {slug} from {backup_file}"),
        Commands::Cache { operation } => match operation {
            CacheOperation::Info => render_cache_info(data),
            CacheOperation::Clear => println!("Removed {} cache entries", data["removed"]),
            CacheOperation::Invalidate { .. } => {
                println!("Invalidated {} repository caches", data["invalidated"]);
            }
        },
        Commands::AutoUpdate => render_batch(data),
        Commands::Count { .. } => println!("{}", data["count"]),
        Commands::Repos { .. } | Commands::Settings { .. } => {
            println!("Settings saved. Caches cleared.");
        }
        Commands::Config { .. } | Commands::Completions { .. } => {}
    }
}

fn text<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("")
}

fn render_repository_errors(data: &Value) {
    for error in data["repository_errors"].as_array().into_iter().flatten() {
        eprintln!("warning: {} ({})", text(error, "message"), text(error, "url"));
    }
}

fn render_scan(data: &Value) {
    render_repository_errors(data);

    let plugins = data["plugins"].as_object();
    match plugins {
        Some(plugins) if !plugins.is_empty() => {
            println!("Available plugins:\n");
            for (slug, entry) in plugins {
                let access = if entry["user_has_access"].as_bool().unwrap_or(true) { "" } else { " (no access)" };
                println!("  {slug:<30} {:<12} {}{access}", text(entry, "version"), text(entry, "name"));
            }
        }
        _ => println!("No plugins available."),
    }
}

fn render_plan(data: &Value) {
    render_repository_errors(data);
    let plan = &data["plan"];

    let updates = plan["updates"].as_array().cloned().unwrap_or_default();
    let installs = plan["installs"].as_array().cloned().unwrap_or_default();
    let current = plan["up_to_date"].as_array().map_or(0, Vec::len);

    if updates.is_empty() {
        println!("All plugins are up to date ({current} checked).");
    } else {
        println!("Updates available:\n");
        for update in &updates {
            println!(
                "  {:<40} {} -> {}",
                text(&update["installed"], "path"),
                text(&update["installed"], "version"),
                text(&update["entry"], "version")
            );
        }
    }

    if !installs.is_empty() {
        println!("\nNot installed:\n");
        for entry in &installs {
            println!("  {:<30} {:<12} {}", text(entry, "slug"), text(entry, "version"), text(entry, "name"));
        }
    }
}

fn render_install(data: &Value) {
    println!("Installed into {}", text(data, "folder"));
    if let Some(previous) = data["previous_version"].as_str() {
        println!("  previous version: {previous}");
    }
    if let Some(backup) = data["backup"].as_object() {
        println!("  backup: {}", backup.get("archive_file").and_then(Value::as_str).unwrap_or(""));
    }
    if data["reactivated"].as_bool().unwrap_or(false) {
        println!("  reactivated: {}", text(data, "plugin_file"));
    }
}

fn render_backups(slug: &str, data: &Value) {
    match data.as_array() {
        Some(backups) if !backups.is_empty() => {
            println!("Backups for {slug}:\n");
            for backup in backups {
                println!(
                    "  {:<50} {:<12} {} ({} bytes)",
                    text(backup, "archive_file"),
                    text(backup, "version"),
                    text(backup, "created_at"),
                    backup["size_bytes"]
                );
            }
        }
        _ => println!("No backups for {slug}."),
    }
}

fn render_cache_info(data: &Value) {
    match data.as_array() {
        Some(repos) if !repos.is_empty() => {
            for repo in repos {
                let state = if repo["exists"].as_bool().unwrap_or(false) {
                    format!("cached, expires in {}s", repo["expires_in"])
                } else {
                    "not cached".to_string()
                };
                println!("  {:<50} {state}", text(repo, "url"));
            }
        }
        _ => println!("No repositories configured."),
    }
}

fn render_batch(data: &Value) {
    if !data["enabled"].as_bool().unwrap_or(false) {
        println!("Automatic updates are disabled.");
        return;
    }
    render_repository_errors(data);

    for (label, key) in [("updated", "updated"), ("skipped", "skipped"), ("failed", "failed")] {
        for item in data[key].as_array().into_iter().flatten() {
            let message = item["message"].as_str().map(|m| format!(": {m}")).unwrap_or_default();
            println!(
                "  {label:<8} {} {} -> {}{message}",
                text(item, "plugin_file"),
                text(item, "from_version"),
                text(item, "to_version")
            );
        }
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "plugin-repo", &mut io::stdout());
}

/// Show configuration.
fn cmd_config(explicit: Option<&Path>, show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::lookup_path(explicit) {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = Config::load(explicit)?;
    let toml = toml::to_string_pretty(&config.redacted())?;
    println!("{toml}");

    Ok(())
}

/// List connected repositories without touching the network.
fn cmd_repos_list(explicit: Option<&Path>, as_json: bool) -> Result<()> {
    let config = Config::load(explicit)?;

    if as_json {
        let response = envelope(&Ok(serde_json::to_value(&config.redacted().repositories)?));
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if config.repositories.is_empty() {
        println!("No repositories configured.");
        println!("\nConnect one with:");
        println!("  plugin-repo repos add <url> --token <token>");
    } else {
        for repo in &config.repositories {
            let token = if repo.token.is_some() { " (token)" } else { "" };
            println!("  {}{token}", repo.url);
        }
    }

    Ok(())
}
