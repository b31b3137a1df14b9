use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use medchat_cli::cli::{run_command, watch, CliCommand, CliConfig};
use medchat_core::{tracing_setup, ChannelListener, ChatRuntime};

#[derive(Parser)]
#[command(name = "medchat")]
#[command(about = "Patient-practitioner chat over a FHIR server")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Path to JSON config file (baseUrl, accessToken, profile, ...)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Act as this identity instead of the configured one (e.g. Patient/123)
    #[arg(long)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List threads, most recently active first
    ListThreads,

    /// List messages in a thread (marks incoming ones as received)
    ListMessages {
        /// Thread ID (Communication id)
        thread_id: String,
    },

    /// Send a message to a thread
    SendMessage {
        /// Thread ID (Communication id)
        thread_id: String,
        /// Message text
        text: String,
    },

    /// Create a new thread (Patient profiles only)
    CreateThread {
        /// Thread topic
        topic: String,
    },

    /// Mark an incoming message as read
    MarkRead {
        /// Thread ID (Communication id)
        thread_id: String,
        /// Message ID (Communication id)
        message_id: String,
    },

    /// Subscribe and print live events as JSON lines
    Watch,
}

#[tokio::main]
async fn main() {
    tracing_setup::init_tracing_with_service("medchat-cli");

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = CliConfig::resolve(cli.config.as_deref())?;
    if cli.profile.is_some() {
        config.profile = cli.profile;
    }
    let profile = config.profile()?;

    let (listener, events) = ChannelListener::new();
    let runtime = ChatRuntime::with_medplum(&config.core, Arc::new(listener))?;

    let command = match cli.command {
        Commands::Watch => return watch(&runtime, profile, events, cli.pretty).await,
        Commands::ListThreads => CliCommand::ListThreads,
        Commands::ListMessages { thread_id } => CliCommand::ListMessages { thread_id },
        Commands::SendMessage { thread_id, text } => CliCommand::SendMessage { thread_id, text },
        Commands::CreateThread { topic } => CliCommand::CreateThread { topic },
        Commands::MarkRead {
            thread_id,
            message_id,
        } => CliCommand::MarkRead {
            thread_id,
            message_id,
        },
    };

    run_command(command, &runtime, profile, events, cli.pretty).await
}
