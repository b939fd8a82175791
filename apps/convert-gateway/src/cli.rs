use anyhow::Result;
use clap::{Parser, Subcommand};
use sandbox_broker::{ConnectionRecord, SandboxBroker};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "convert-gateway")]
#[command(about = "Image conversion gateway backed by a shared sandbox")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Serve the HTTP API (default when no command is given)
    Serve,
    /// Resolve a live sandbox, provisioning one if needed, and print it
    Ensure {
        /// Include the passphrase in the output
        #[arg(long)]
        show_secret: bool,
    },
    /// Print the cached sandbox record without probing or provisioning
    Status,
    /// Drop the cached sandbox record
    Forget,
}

#[derive(Debug, Serialize)]
struct RecordView<'a> {
    public_url: &'a str,
    sandbox_id: &'a str,
    pass_phrase: &'a str,
}

impl<'a> RecordView<'a> {
    fn new(record: &'a ConnectionRecord, show_secret: bool) -> Self {
        Self {
            public_url: &record.public_url,
            sandbox_id: &record.sandbox_id,
            pass_phrase: if show_secret {
                &record.pass_phrase
            } else {
                "<redacted>"
            },
        }
    }
}

fn render(record: &ConnectionRecord, show_secret: bool) -> Result<String> {
    Ok(serde_json::to_string_pretty(&RecordView::new(
        record,
        show_secret,
    ))?)
}

/// Runs a maintenance command against the broker and returns what to print.
pub async fn run_command(broker: &SandboxBroker, command: Commands) -> Result<String> {
    match command {
        Commands::Serve => anyhow::bail!("serve is handled by the server entrypoint"),
        Commands::Ensure { show_secret } => {
            let record = broker.ensure_ready().await?;
            render(&record, show_secret)
        }
        Commands::Status => match broker.cached().await? {
            Some(record) => render(&record, false),
            None => Ok("no cached sandbox".to_string()),
        },
        Commands::Forget => {
            broker.invalidate().await?;
            Ok("cached sandbox forgotten".to_string())
        }
    }
}
