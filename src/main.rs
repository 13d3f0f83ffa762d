#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use inquiry_broker::broker::housekeeping::prune_snapshot;
use inquiry_broker::broker::{InquiryStatus, TopicRegistry};
use inquiry_broker::config::{self, Config, CONFIG_DIR_ENV};
use inquiry_broker::daemon;
use inquiry_broker::store::{JsonFileStore, StateStore};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Fan out buyer inquiries to groups and collect private seller replies.
#[derive(Parser, Debug)]
#[command(name = "inquiry-broker")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Directory holding config.toml, topics.json and state.json
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook gateway, message dispatch and housekeeping
    Daemon {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// List configured topics and their destination groups
    Topics,

    /// Print the persisted inquiry ledger
    Inquiries {
        /// Include closed inquiries
        #[arg(long)]
        all: bool,
    },

    /// Drop stale recent-topic entries from the persisted state
    Sweep,

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the JSON Schema of config.toml
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var(CONFIG_DIR_ENV, config_dir);
    }

    // Schema output must stay clean stdout.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        println!("{}", config::schema_json()?);
        return Ok(());
    }

    // Respects RUST_LOG, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Config { .. } => unreachable!(),

        Commands::Daemon { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            if port == 0 {
                info!("📨 Starting inquiry broker on {host} (random port)");
            } else {
                info!("📨 Starting inquiry broker on {host}:{port}");
            }
            daemon::run(config, host, port).await
        }

        Commands::Topics => {
            let path = config.topics_path();
            let topics = TopicRegistry::load_or_seed(&path).await?;
            println!("Topics ({}):", path.display());
            if topics.is_empty() {
                println!("  (none)");
            }
            for (topic, destinations) in topics.iter() {
                println!("  {topic}: {} group(s)", destinations.len());
                for destination in destinations {
                    println!("    - {destination}");
                }
            }
            Ok(())
        }

        Commands::Inquiries { all } => {
            let store = JsonFileStore::new(config.state_path());
            let snapshot = store.load()?.unwrap_or_default();
            println!("Inquiry counter: {}", snapshot.counter);
            let mut shown = 0usize;
            for record in snapshot.inquiries.values() {
                if !all && record.status != InquiryStatus::Active {
                    continue;
                }
                shown += 1;
                println!(
                    "  #{} [{}] {} ({}): \"{}\" - {} response(s)",
                    record.sequence,
                    match record.status {
                        InquiryStatus::Active => "active",
                        InquiryStatus::Closed => "closed",
                    },
                    record.topic,
                    record.issued_at.format("%Y-%m-%d %H:%M UTC"),
                    record.body,
                    record.responses.len()
                );
            }
            if shown == 0 {
                println!("  (no {}inquiries)", if all { "" } else { "active " });
            }
            Ok(())
        }

        Commands::Sweep => {
            let store = JsonFileStore::new(config.state_path());
            let Some(mut snapshot) = store.load()? else {
                println!("No persisted state at {}", config.state_path().display());
                return Ok(());
            };
            let cutoff = chrono::Utc::now()
                .checked_sub_signed(config.housekeeping.topic_retention())
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
            let pruned = prune_snapshot(&mut snapshot, cutoff);
            store.save(&snapshot).context("Failed to save swept state")?;
            if pruned.is_empty() {
                println!("Nothing to prune");
            } else {
                println!("Pruned recent topics: {}", pruned.join(", "));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_daemon_flags_and_global_config_dir() {
        let cli = Cli::try_parse_from([
            "inquiry-broker",
            "daemon",
            "--port",
            "8080",
            "--config-dir",
            "/tmp/broker",
        ])
        .unwrap();
        assert_eq!(cli.config_dir.as_deref(), Some("/tmp/broker"));
        assert!(matches!(
            cli.command,
            Commands::Daemon {
                port: Some(8080),
                host: None
            }
        ));
    }

    #[test]
    fn parses_inquiries_all() {
        let cli = Cli::try_parse_from(["inquiry-broker", "inquiries", "--all"]).unwrap();
        assert!(matches!(cli.command, Commands::Inquiries { all: true }));
    }
}
