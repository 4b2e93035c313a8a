use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ambit_config::AppConfig;
use ambit_llm::Message;
use ambit_runtime::Router;

#[derive(Debug, Parser)]
#[command(name = "ambit", version, about = "Agent execution core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read lines from stdin, feed each to the Router, print the resulting messages.
    Run {
        #[arg(long, default_value = ".ambit/config.toml")]
        config: PathBuf,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, workspace } => run(config, workspace).await,
    }
}

async fn run(config_path: PathBuf, workspace: PathBuf) -> Result<()> {
    let config = AppConfig::load_from(&config_path)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut router = Router::new(config, workspace, session_id).await?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let messages = router.chat_stream(&line).await?;
        print_messages(&mut out, &messages)?;
    }
    Ok(())
}

fn print_messages(out: &mut impl Write, messages: &[Message]) -> Result<()> {
    for message in messages {
        writeln!(out, "{}", serde_json::to_string(message)?)?;
    }
    out.flush()?;
    Ok(())
}
