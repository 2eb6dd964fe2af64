use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use luna_voice::scenarios::ScenarioCatalog;
use luna_voice::Config;

/// Luna voice onboarding gateway.
#[derive(Parser, Debug)]
#[command(name = "luna-voice")]
#[command(author = "Luna")]
#[command(version)]
#[command(about = "Real-time voice relay and onboarding interview orchestrator.", long_about = None)]
struct Cli {
    /// Config file (defaults to $LUNA_CONFIG, then ~/.luna/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List interview topics in exploration order
    Scenarios {
        /// Comma-separated topic ids already covered
        #[arg(long, value_delimiter = ',')]
        completed: Vec<String>,
    },

    /// Print the effective configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("luna_voice=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            luna_voice::gateway::run_gateway(&host, port, config).await
        }
        Commands::Scenarios { completed } => {
            let catalog = ScenarioCatalog::builtin();
            let next = catalog.next_topic(&completed).map(|t| t.id.clone());
            for topic in catalog.topics() {
                let mark = if completed.contains(&topic.id) {
                    "x"
                } else if next.as_deref() == Some(topic.id.as_str()) {
                    ">"
                } else {
                    " "
                };
                let mut flags = Vec::new();
                if topic.required {
                    flags.push("required");
                }
                if topic.sensitive {
                    flags.push("sensitive");
                }
                println!(
                    "[{mark}] {:>2}  {:<20} {}{}",
                    topic.rank,
                    topic.id,
                    topic.name,
                    if flags.is_empty() {
                        String::new()
                    } else {
                        format!("  ({})", flags.join(", "))
                    }
                );
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.redacted().to_toml()?);
            Ok(())
        }
    }
}
