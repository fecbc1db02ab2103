//! inkplug - plugin runtime for a novel-writing app.
//!
//! Installs, activates and inspects plugins from the command line. Every
//! invocation opens the runtime over the data directory, performs one
//! operation and exits; states and grants persist between runs.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use inkplug::plugin::{Plugin, PluginManager};
use inkplug::Config;

/// Plugin runtime for a novel-writing app
#[derive(Parser)]
#[command(name = "inkplug")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Managed plugins directory
    #[arg(long, global = true, env = "INKPLUG_PLUGINS_DIR")]
    plugins_dir: Option<PathBuf>,

    /// Directory holding the registry, grants and plugin storage
    #[arg(long, global = true, env = "INKPLUG_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a plugin from a directory or its plugin.json
    Install {
        /// Plugin directory or manifest path
        path: PathBuf,
    },

    /// Uninstall a plugin and remove its files
    Uninstall {
        /// Plugin id
        id: String,
    },

    /// Activate an installed plugin
    Activate {
        /// Plugin id
        id: String,
    },

    /// Deactivate an active plugin
    Deactivate {
        /// Plugin id
        id: String,
    },

    /// Deactivate and activate a plugin again
    Reload {
        /// Plugin id
        id: String,
    },

    /// Clear a plugin's error state
    Recover {
        /// Plugin id
        id: String,
    },

    /// List installed plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show details of an installed plugin
    Info {
        /// Plugin id
        id: String,
    },

    /// Search installed plugins
    Search {
        /// Search query
        query: String,
    },

    /// Register plugin folders already present in the plugins directory
    Discover,

    /// Show a plugin's permissions and grant state
    Permissions {
        /// Plugin id
        id: String,
    },

    /// Grant a declared permission
    Grant {
        /// Plugin id
        id: String,
        /// Permission name
        permission: String,
    },

    /// Revoke a permission
    Revoke {
        /// Plugin id
        id: String,
        /// Permission name
        permission: String,
    },

    /// List registered commands
    Commands {
        /// Only commands of this plugin
        #[arg(short, long)]
        plugin: Option<String>,
    },

    /// Show or update plugin settings
    Settings {
        /// Plugin id
        id: String,

        /// JSON object to merge into the settings (null removes a key)
        #[arg(long)]
        set: Option<String>,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,

        /// Write the effective configuration to the global config file
        #[arg(long, conflicts_with = "path")]
        init: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(&config.logging.level)
        }
    });

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    if let Some(dir) = cli.plugins_dir {
        config.runtime.plugins_dir = Some(dir);
    }
    if let Some(dir) = cli.data_dir {
        config.runtime.data_dir = Some(dir);
    }

    match cli.command {
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(())
        }
        Commands::Config { path, init } => cmd_config(&config, path, init),
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run(command, &config))
        }
    }
}

/// Run one runtime operation.
async fn run(command: Commands, config: &Config) -> Result<()> {
    let manager = PluginManager::open(config).await?;
    let result = dispatch(command, &manager).await;
    manager.shutdown();
    result
}

async fn dispatch(command: Commands, manager: &PluginManager) -> Result<()> {
    match command {
        Commands::Install { path } => {
            let plugin = manager.install(&path).await?;
            println!("Installed {} v{}", plugin.id(), plugin.manifest.info.version);

            let pending = manager.pending_permissions(plugin.id())?;
            if !pending.is_empty() {
                println!("\nPermissions requested:");
                for request in &pending {
                    let confirm = if request.requires_confirmation { " (needs confirmation)" } else { "" };
                    println!("  {} [{}]{}", request.name, request.risk, confirm);
                }
                println!("\nGrant with: inkplug grant {} <permission>", plugin.id());
            }
        }

        Commands::Uninstall { id } => {
            let report = manager.uninstall(&id).await?;
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            println!("Uninstalled {id}");
        }

        Commands::Activate { id } => {
            let commands = manager.activate(&id).await?;
            println!("Activated {id} ({} command(s))", commands.len());
        }

        Commands::Deactivate { id } => {
            manager.deactivate(&id).await?;
            println!("Deactivated {id}");
        }

        Commands::Reload { id } => {
            let commands = manager.reload(&id).await?;
            println!("Reloaded {id} ({} command(s))", commands.len());
        }

        Commands::Recover { id } => {
            manager.recover(&id).await?;
            println!("Recovered {id}");
        }

        Commands::List { json } => {
            let plugins = manager.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&plugins)?);
            } else if plugins.is_empty() {
                println!("No plugins installed.");
                println!("\nInstall plugins with:");
                println!("  inkplug install ./my-plugin");
            } else {
                println!("Installed plugins:\n");
                for plugin in &plugins {
                    print_plugin_line(plugin);
                }
                println!("\nTotal: {} plugin(s)", plugins.len());
            }
        }

        Commands::Info { id } => {
            let plugin = manager.get(&id)?;
            cmd_info(&plugin);
            let usage = manager.resource_usage(&id)?;
            println!(
                "Memory:      {} / {} bytes",
                usage.memory_bytes, usage.memory_limit_bytes
            );
        }

        Commands::Search { query } => {
            let hits = manager.search_hits(&query);
            if hits.is_empty() {
                println!("No plugins found matching '{query}'.");
            } else {
                println!("Found {} plugin(s):\n", hits.len());
                for hit in &hits {
                    let info = &hit.plugin.manifest.info;
                    println!("  {:<24} v{:<10} {}", info.id, info.version, info.name);
                }
            }
        }

        Commands::Discover => {
            let found = manager.discover().await?;
            if found.is_empty() {
                println!("No plugin folders found in {}", manager.plugins_dir().display());
            }
            for plugin in &found {
                match (&plugin.id, &plugin.error) {
                    (_, Some(error)) => println!("  ✗ {}: {error}", plugin.path.display()),
                    (Some(id), None) => println!("  ✓ {id} ({})", plugin.path.display()),
                    (None, None) => {}
                }
            }
        }

        Commands::Permissions { id } => {
            let permissions = manager.list_permissions(&id)?;
            if permissions.is_empty() {
                println!("{id} declares no permissions.");
            }
            for permission in &permissions {
                let mark = if permission.granted { "x" } else { " " };
                print!("  [{mark}] {} ({})", permission.name, permission.risk);
                if permission.description.is_empty() {
                    println!();
                } else {
                    println!(" - {}", permission.description);
                }
            }
        }

        Commands::Grant { id, permission } => {
            if manager.grant_permission(&id, &permission)? {
                println!("Granted {permission} to {id}");
            } else {
                println!("{id} already has {permission}");
            }
        }

        Commands::Revoke { id, permission } => {
            if manager.revoke_permission(&id, &permission)? {
                println!("Revoked {permission} from {id}");
            } else {
                println!("{id} does not have {permission}");
            }
        }

        Commands::Commands { plugin } => {
            let commands = manager.list_commands(plugin.as_deref())?;
            if commands.is_empty() {
                println!("No commands registered.");
            }
            for command in &commands {
                println!("  {:<32} {} [{}]", command.command_id, command.title, command.plugin_id);
            }
        }

        Commands::Settings { id, set } => {
            let settings = match set {
                Some(patch) => {
                    let patch: Value =
                        serde_json::from_str(&patch).context("--set expects a JSON object")?;
                    let Value::Object(patch) = patch else {
                        anyhow::bail!("--set expects a JSON object");
                    };
                    manager.update_settings(&id, patch)?
                }
                None => manager.get_settings(&id)?,
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }

        Commands::Config { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn print_plugin_line(plugin: &Plugin) {
    let info = &plugin.manifest.info;
    let state_icon = match plugin.state.name() {
        "activated" => "✓",
        "error" => "✗",
        _ => "○",
    };
    println!("  {} {} v{} [{}]", state_icon, info.id, info.version, plugin.state.name());
    if !info.description.is_empty() {
        println!("      {}", info.description);
    }
    if let Some(error) = plugin.error() {
        println!("      Error: {error}");
    }
}

fn cmd_info(plugin: &Plugin) {
    let info = &plugin.manifest.info;
    println!("{} ({})", info.name, info.id);
    println!("Version:     {}", info.version);
    println!("Type:        {}", info.plugin_type.display_name());
    println!("Author:      {}", info.author.name);
    println!("State:       {}", plugin.state);
    println!("Path:        {}", plugin.path.display());
    println!("Installed:   {}", plugin.installed_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(at) = plugin.last_activated {
        println!("Activated:   {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if !info.description.is_empty() {
        println!("\n{}", info.description);
    }
    let commands = plugin.state.commands();
    if !commands.is_empty() {
        println!("\nCommands:    {}", commands.join(", "));
    }
    println!();
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "inkplug", &mut io::stdout());
}

/// Show configuration.
fn cmd_config(config: &Config, show_path: bool, init: bool) -> Result<()> {
    if init {
        config.save()?;
        if let Some(path) = Config::config_dir() {
            println!("Wrote {}", path.join("config.toml").display());
        }
        return Ok(());
    }

    if show_path {
        if let Some(path) = Config::config_dir() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let toml = toml::to_string_pretty(config)?;
    println!("{toml}");
    Ok(())
}
