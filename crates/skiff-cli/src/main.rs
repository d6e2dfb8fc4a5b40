//! Skiff CLI - plugin administration and host daemon

mod host;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use host::Host;
use serde::Serialize;
use skiff_core::billing::{RefundSubject, quote_refund};
use skiff_core::config::HostConfig;
use skiff_core::security::MasterKey;
use skiff_plugins::{Category, PluginKey, as_config_validation_error};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(author, version, about = "Skiff cloud console host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Config file (defaults to $SKIFF_CONFIG_DIR/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap plugins and run enabled instances until Ctrl-C
    Serve,

    /// Manage plugins and plugin instances
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Payment providers and method switches
    Payments {
        #[command(subcommand)]
        action: PaymentAction,
    },

    /// Refund valuation
    Refund {
        #[command(subcommand)]
        action: RefundAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Config vault key management
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List installation records with runtime state
    List,
    /// Show plugin directories that have no installation record
    Discover,
    /// Install a .zip or .tar.gz package
    Install { package: PathBuf },
    /// Import an on-disk plugin as its default instance
    Import {
        category: String,
        plugin_id: String,
        /// Accept unsigned or untrusted packages
        #[arg(long)]
        allow_unofficial: bool,
    },
    /// Create another instance of an installed plugin
    CreateInstance {
        category: String,
        plugin_id: String,
        #[arg(long)]
        instance_id: Option<String>,
    },
    /// Validate config, start and enable an instance
    Enable { key: String },
    /// Stop and disable an instance
    Disable { key: String },
    /// Delete an instance; files go with the last instance
    Delete {
        key: String,
        #[arg(long)]
        force: bool,
    },
    /// Instance configuration
    Config {
        #[command(subcommand)]
        action: PluginConfigAction,
    },
}

#[derive(Subcommand)]
enum PluginConfigAction {
    /// Show config with secrets redacted
    Get { key: String },
    /// Replace config; blank secrets keep their stored value. `@path` reads a file
    Set { key: String, json: String },
    /// Show the JSON and UI schema
    Schema { key: String },
}

#[derive(Subcommand)]
enum PaymentAction {
    /// List payment providers
    Providers {
        /// Include disabled providers
        #[arg(long)]
        all: bool,
    },
    /// Turn a built-in or legacy provider on
    Enable { key: String },
    /// Turn a built-in or legacy provider off
    Disable { key: String },
    /// Switch one method of a payment plugin instance
    Method {
        plugin_id: String,
        method: String,
        #[arg(long, default_value = "default")]
        instance: String,
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },
    /// Show per-method overrides of a payment plugin instance
    Methods {
        plugin_id: String,
        #[arg(long, default_value = "default")]
        instance: String,
    },
}

#[derive(Subcommand)]
enum RefundAction {
    /// Quote a refund under the configured policy
    Quote {
        /// Instance creation time (RFC 3339)
        #[arg(long)]
        created_at: Option<DateTime<Utc>>,
        /// Instance expiry time (RFC 3339)
        #[arg(long)]
        expire_at: Option<DateTime<Utc>>,
        /// Monthly price in minor units
        #[arg(long, default_value_t = 0)]
        monthly_price: i64,
        /// Order item amount in minor units
        #[arg(long, default_value_t = 0)]
        order_amount: i64,
        /// Evaluate at this time instead of now
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// List all configuration values
    List,
    /// Show config file path
    Path,
    /// Write the default config file
    Init,
}

#[derive(Subcommand)]
enum VaultAction {
    /// Print a fresh base64url master key
    GenerateKey,
}

/// `category:plugin_id[:instance_id]`
fn parse_key(raw: &str) -> anyhow::Result<PluginKey> {
    let mut parts = raw.splitn(3, ':');
    let (Some(category), Some(plugin_id)) = (parts.next(), parts.next()) else {
        return Err(anyhow!(
            "expected category:plugin_id[:instance_id], got {raw:?}"
        ));
    };
    let category: Category = category.parse()?;
    let key = match parts.next() {
        Some(instance) => PluginKey::new(category, plugin_id, instance)?,
        None => PluginKey::default_instance(category, plugin_id)?,
    };
    Ok(key)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HostConfig> {
    match path {
        Some(path) => HostConfig::load_from(path),
        None => HostConfig::load(),
    }
}

fn read_json_arg(raw: &str) -> anyhow::Result<String> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str::<serde_json::Value>(&text).context("Config must be valid JSON")?;
    Ok(text)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_category(raw: &str) -> anyhow::Result<Category> {
    Ok(raw.parse()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve => cmd_serve(load_config(config_path)?).await,
        Commands::Plugins { action } => {
            let host = Host::open(load_config(config_path)?).await?;
            let result = cmd_plugins(&host, action, cli.format).await;
            host.close().await;
            result
        }
        Commands::Payments { action } => {
            let host = Host::open(load_config(config_path)?).await?;
            let result = cmd_payments(&host, action, cli.format).await;
            host.close().await;
            result
        }
        Commands::Refund { action } => cmd_refund(&load_config(config_path)?, action, cli.format),
        Commands::Config { action } => cmd_config(config_path, action, cli.format),
        Commands::Vault { action } => match action {
            VaultAction::GenerateKey => {
                println!("{}", MasterKey::generate().to_base64url());
                Ok(())
            }
        },
    }
}

async fn cmd_serve(config: HostConfig) -> anyhow::Result<()> {
    let host = Host::open(config).await?;
    let imported = host.manager.bootstrap_from_disk().await?;
    let started = host.manager.start_enabled().await?;
    info!(
        imported = imported.len(),
        started,
        base_dir = %host.config.plugins.base_dir.display(),
        "skiff host running"
    );
    for provider in host.registry.list_providers(false).await? {
        info!(provider = %provider.key, source = provider.source.as_str(), "payment provider available");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    host.close().await;
    Ok(())
}

async fn cmd_plugins(host: &Host, action: PluginAction, format: OutputFormat) -> anyhow::Result<()> {
    let manager = &host.manager;
    match action {
        PluginAction::List => {
            let views = manager.list_installations().await?;
            match format {
                OutputFormat::Json => print_json(&views)?,
                OutputFormat::Text => {
                    if views.is_empty() {
                        println!("No plugins installed.");
                    }
                    for view in views {
                        let record = &view.installation;
                        let health = view
                            .last_health
                            .as_ref()
                            .map(|h| format!("{:?}", h.status).to_lowercase())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<40} {:<10} {:<8} {:<9} {:<10} {}",
                            record.key().to_string(),
                            record.version,
                            if record.enabled { "enabled" } else { "disabled" },
                            if view.running { "running" } else { "stopped" },
                            record.signature_status.as_str(),
                            health
                        );
                    }
                }
            }
        }
        PluginAction::Discover => {
            let found = manager.discover_on_disk().await?;
            match format {
                OutputFormat::Json => print_json(&found)?,
                OutputFormat::Text => {
                    if found.is_empty() {
                        println!("No unimported plugins on disk.");
                    }
                    for plugin in found {
                        println!(
                            "{}/{} {} ({}){}",
                            plugin.category.as_str(),
                            plugin.plugin_id,
                            plugin.version,
                            plugin.signature.as_str(),
                            if plugin.runnable { "" } else { " - not runnable on this host" }
                        );
                    }
                }
            }
        }
        PluginAction::Install { package } => {
            let filename = package
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("invalid package path {}", package.display()))?
                .to_string();
            let bytes = tokio::fs::read(&package)
                .await
                .with_context(|| format!("Failed to read {}", package.display()))?;
            let record = manager.install(&filename, bytes).await?;
            if !record.signature_status.is_official() {
                warn!(plugin = %record.key(), signature = record.signature_status.as_str(), "installed package is not official");
            }
            match format {
                OutputFormat::Json => print_json(&record)?,
                OutputFormat::Text => println!("Installed {} {}", record.key(), record.version),
            }
        }
        PluginAction::Import {
            category,
            plugin_id,
            allow_unofficial,
        } => {
            let record = manager
                .import_from_disk(parse_category(&category)?, &plugin_id, allow_unofficial)
                .await?;
            match format {
                OutputFormat::Json => print_json(&record)?,
                OutputFormat::Text => println!("Imported {}", record.key()),
            }
        }
        PluginAction::CreateInstance {
            category,
            plugin_id,
            instance_id,
        } => {
            let record = manager
                .create_instance(parse_category(&category)?, &plugin_id, instance_id.as_deref())
                .await?;
            match format {
                OutputFormat::Json => print_json(&record)?,
                OutputFormat::Text => println!("Created {}", record.key()),
            }
        }
        PluginAction::Enable { key } => {
            let key = parse_key(&key)?;
            if let Err(err) = manager.enable_instance(&key).await {
                if let Some(validation) = as_config_validation_error(&err) {
                    if matches!(format, OutputFormat::Json) {
                        print_json(validation)?;
                    }
                    return Err(anyhow!(
                        "{} ({}); fix it with `skiff plugins config set {}`",
                        validation.message,
                        validation.code,
                        key
                    ));
                }
                return Err(err.into());
            }
            println!("Enabled {key}");
        }
        PluginAction::Disable { key } => {
            let key = parse_key(&key)?;
            manager.disable_instance(&key).await?;
            println!("Disabled {key}");
        }
        PluginAction::Delete { key, force } => {
            let key = parse_key(&key)?;
            if !force {
                return Err(anyhow!("Refusing to delete {key} without --force"));
            }
            manager.delete_instance(&key).await?;
            println!("Deleted {key}");
        }
        PluginAction::Config { action } => match action {
            PluginConfigAction::Get { key } => {
                let config = manager.get_config_instance(&parse_key(&key)?).await?;
                print_json(&config)?;
            }
            PluginConfigAction::Set { key, json } => {
                let key = parse_key(&key)?;
                let json = read_json_arg(&json)?;
                if let Err(err) = manager.update_config_instance(&key, &json).await {
                    if let Some(validation) = as_config_validation_error(&err) {
                        if matches!(format, OutputFormat::Json) {
                            print_json(validation)?;
                        }
                        let fields = validation.missing_fields.join(", ");
                        return Err(anyhow!(
                            "{} ({}){}",
                            validation.message,
                            validation.code,
                            if fields.is_empty() { String::new() } else { format!(": {fields}") }
                        ));
                    }
                    return Err(err.into());
                }
                println!("Updated config of {key}");
            }
            PluginConfigAction::Schema { key } => {
                let schema = manager.get_config_schema_instance(&parse_key(&key)?).await?;
                print_json(&schema)?;
            }
        },
    }
    Ok(())
}

async fn cmd_payments(host: &Host, action: PaymentAction, format: OutputFormat) -> anyhow::Result<()> {
    let registry = &host.registry;
    match action {
        PaymentAction::Providers { all } => {
            let providers = registry.list_providers(all).await?;
            match format {
                OutputFormat::Json => print_json(&providers)?,
                OutputFormat::Text => {
                    for p in providers {
                        println!(
                            "{:<24} {:<8} {:<8} {}",
                            p.key,
                            p.source.as_str(),
                            if p.enabled { "enabled" } else { "disabled" },
                            p.name
                        );
                    }
                }
            }
        }
        PaymentAction::Enable { key } => {
            registry.set_provider_enabled(&key, true).await?;
            println!("Enabled {key}");
        }
        PaymentAction::Disable { key } => {
            registry.set_provider_enabled(&key, false).await?;
            println!("Disabled {key}");
        }
        PaymentAction::Method {
            plugin_id,
            method,
            instance,
            enable,
            disable,
        } => {
            if enable == disable {
                return Err(anyhow!("pass exactly one of --enable or --disable"));
            }
            registry
                .set_method_enabled(&plugin_id, &instance, &method, enable)
                .await?;
            println!(
                "{}.{method} on {instance}: {}",
                plugin_id,
                if enable { "enabled" } else { "disabled" }
            );
        }
        PaymentAction::Methods { plugin_id, instance } => {
            let overrides = registry.list_method_overrides(&plugin_id, &instance).await?;
            match format {
                OutputFormat::Json => print_json(&overrides)?,
                OutputFormat::Text => {
                    if overrides.is_empty() {
                        println!("No overrides; every advertised method is enabled.");
                    }
                    for o in overrides {
                        println!("{:<16} {}", o.method, if o.enabled { "enabled" } else { "disabled" });
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_refund(config: &HostConfig, action: RefundAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        RefundAction::Quote {
            created_at,
            expire_at,
            monthly_price,
            order_amount,
            now,
        } => {
            let subject = RefundSubject {
                created_at,
                expire_at,
                monthly_price,
                order_item_amount: order_amount,
            };
            let quote = quote_refund(&config.refund, &subject, now.unwrap_or_else(Utc::now));
            match format {
                OutputFormat::Json => print_json(&quote)?,
                OutputFormat::Text => {
                    println!("Refund: {} of {}", quote.amount, quote.base_amount);
                    println!("Rule: {:?}", quote.rule);
                    if let Some(ratio) = quote.elapsed_ratio {
                        println!("Elapsed: {:.1}%", ratio * 100.0);
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_config(path: Option<&Path>, action: ConfigAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            println!("{}", load_config(path)?.get(&key)?);
        }
        ConfigAction::List => {
            let entries = load_config(path)?.list()?;
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, serde_json::Value> = entries
                        .into_iter()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect();
                    print_json(&map)?;
                }
                OutputFormat::Text => {
                    for (key, value) in entries {
                        println!("{key} = {value}");
                    }
                }
            }
        }
        ConfigAction::Path => match path {
            Some(path) => println!("{}", path.display()),
            None => println!("{}", HostConfig::config_path()?.display()),
        },
        ConfigAction::Init => {
            if path.is_some() {
                return Err(anyhow!("`config init` writes to the default location only"));
            }
            let target = HostConfig::config_path()?;
            if target.exists() {
                return Err(anyhow!("{} already exists", target.display()));
            }
            HostConfig::default().save()?;
            println!("Wrote {}", target.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod main_tests;
