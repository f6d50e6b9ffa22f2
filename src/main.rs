// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: (C) 2025 Cranky Kernel <crankykernel@proton.me>

use anyhow::Result;
use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use iptv_core::Config;

mod cli;
use cli::{AdsCommand, CacheCommand, CommandContext, LogosCommand, OutputFormat, PlayCommand};

fn cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Green.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default())
}

#[derive(Parser)]
#[command(name = "iptv-core")]
#[command(about = "Live TV playback, channel logo and ad caching for an IPTV service")]
#[command(version)]
#[command(styles = cargo_style())]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging to file (iptv_core_debug.log)
    #[arg(long, global = true)]
    debug_log: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a channel or a manifest URL in mpv
    Play {
        /// Channel ID to resolve through the API
        #[arg(short, long)]
        channel: Option<String>,
        /// Channel number sent along with the channel ID
        #[arg(short, long)]
        number: Option<u32>,
        /// Manifest URL to play directly
        #[arg(short, long)]
        url: Option<String>,
        /// Extra request header, "Name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Channel logo cache
    #[command(subcommand)]
    Logos(LogosSubcommand),

    /// Show the ads for a display context
    Ads {
        /// Context key, e.g. "home" or "channels"
        context: String,
        /// Fetch now instead of serving the cached set
        #[arg(short, long)]
        refresh: bool,
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Manage the local cache
    #[command(subcommand)]
    Cache(CacheSubcommand),

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum LogosSubcommand {
    /// Fetch logos into the cache
    Preload {
        urls: Vec<String>,
        /// File with one URL per line
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print the cached data URI for a logo, fetching it if needed
    Get {
        url: String,
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
enum CacheSubcommand {
    /// Remove expired entries
    Purge,
    /// Clear cache
    Clear,
    /// Show cache usage
    Stats {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if cli.debug_log {
        let file = File::create("iptv_core_debug.log")?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_level(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(
                EnvFilter::from_default_env()
                    .add_directive("iptv_core=debug".parse()?)
                    .add_directive("hyper_util=error".parse()?),
            )
            .init();
    } else if cli.verbose {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(tracing::Level::DEBUG.into())
                    .add_directive("hyper_util=error".parse()?),
            )
            .init();
    } else if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                EnvFilter::from_default_env().add_directive("hyper_util=error".parse()?),
            )
            .init();
    }

    // Load configuration
    let config_path = cli.config.unwrap_or_else(Config::default_path);

    if let Commands::InitConfig { force } = cli.command {
        if config_path.exists() && !force {
            anyhow::bail!(
                "{} already exists, use --force to overwrite",
                config_path.display()
            );
        }
        Config::default().save(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let config = Config::load_or_default(&config_path)?;

    let context = CommandContext::new(config)?;

    // Execute command
    match cli.command {
        Commands::Play {
            channel,
            number,
            url,
            headers,
        } => {
            PlayCommand {
                channel,
                number,
                url,
                headers,
            }
            .execute(context)
            .await?;
        }

        Commands::Logos(logos) => {
            let cmd = match logos {
                LogosSubcommand::Preload { urls, file } => LogosCommand::Preload { urls, file },
                LogosSubcommand::Get { url, format } => LogosCommand::Get {
                    url,
                    format: OutputFormat::from_str(&format)?,
                },
            };
            cmd.execute(context).await?;
        }

        Commands::Ads {
            context: ad_context,
            refresh,
            format,
        } => {
            AdsCommand {
                context: ad_context,
                refresh,
                format: OutputFormat::from_str(&format)?,
            }
            .execute(context)
            .await?;
        }

        Commands::Cache(cache_cmd) => {
            let cmd = match cache_cmd {
                CacheSubcommand::Purge => CacheCommand::Purge,
                CacheSubcommand::Clear => CacheCommand::Clear,
                CacheSubcommand::Stats { format } => {
                    CacheCommand::Stats(OutputFormat::from_str(&format)?)
                }
            };
            cmd.execute(context).await?;
        }

        Commands::InitConfig { .. } => {}
    }

    Ok(())
}
