//! Command-line utility for operating a running herald instance
//!
//! This tool talks to the control socket to:
//! - Show delivery statistics, campaigns and queue metrics
//! - Inspect and requeue dead letter jobs
//! - Reset the circuit breaker
//! - Publish campaigns and request drafts

use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use herald_control::{
    ControlClient, DEFAULT_CONTROL_SOCKET, NewsletterCommand, Report, RequestCommand,
    SystemCommand, hash_token,
};

/// Command-line utility for operating herald
#[derive(Parser, Debug)]
#[command(name = "heraldctl")]
#[command(about = "Operate the herald newsletter pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: String,

    /// Bearer token for the control socket
    #[arg(short, long, env = "HERALD_TOKEN")]
    token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check if herald is responding
    Ping,
    /// Delivery totals, for one campaign or all of them
    Stats {
        /// Campaign to report on
        #[arg(long)]
        campaign: Option<String>,
    },
    /// Queue depths, breaker state and worker usage
    Queue {
        /// Watch mode - continuously update
        #[arg(long)]
        watch: bool,

        /// Update interval in seconds (for watch mode)
        #[arg(long, default_value = "2")]
        interval: u64,
    },
    /// Recent campaigns with their totals
    Campaigns {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Dead letter queue management
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
    /// Force the circuit breaker closed
    ResetCircuit,
    /// Queue a campaign for sending
    Publish { campaign_id: String },
    /// Queue newsletter draft generation
    Draft {
        /// Date to generate for (YYYY-MM-DD)
        date: NaiveDate,
    },
    /// Print the SHA-256 hash of a token, for the config file
    HashToken { token: String },
}

#[derive(Subcommand, Debug)]
enum DlqAction {
    /// List dead jobs, most recent first
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Move a dead job back to pending
    Retry { job_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::HashToken { token } => {
            println!("{}", hash_token(&token));
            return Ok(());
        }
        Commands::Queue { watch: true, interval } => {
            let client = client(&cli.control_socket, cli.token, cli.timeout)?;
            return watch_queue(&client, interval).await;
        }
        Commands::Ping => RequestCommand::System(SystemCommand::Ping),
        Commands::Stats { campaign } => RequestCommand::Newsletter(NewsletterCommand::Stats {
            campaign_id: campaign,
        }),
        Commands::Queue { watch: false, .. } => {
            RequestCommand::Newsletter(NewsletterCommand::QueueMetrics)
        }
        Commands::Campaigns { limit } => {
            RequestCommand::Newsletter(NewsletterCommand::Campaigns { limit })
        }
        Commands::Dlq {
            action: DlqAction::List { limit },
        } => RequestCommand::Newsletter(NewsletterCommand::FailedJobs { limit }),
        Commands::Dlq {
            action: DlqAction::Retry { job_id },
        } => RequestCommand::Newsletter(NewsletterCommand::RetryFailedJob { job_id }),
        Commands::ResetCircuit => RequestCommand::Newsletter(NewsletterCommand::ResetCircuitBreaker),
        Commands::Publish { campaign_id } => {
            RequestCommand::Newsletter(NewsletterCommand::Publish { campaign_id })
        }
        Commands::Draft { date } => {
            RequestCommand::Newsletter(NewsletterCommand::GenerateDraft { date })
        }
    };

    let client = client(&cli.control_socket, cli.token, cli.timeout)?;
    match client.execute(command).await? {
        Some(data) => print!("{}", Report(&data)),
        None => println!("OK"),
    }

    Ok(())
}

fn client(socket: &str, token: Option<String>, timeout: u64) -> anyhow::Result<ControlClient> {
    let client = ControlClient::new(socket).with_timeout(Duration::from_secs(timeout));
    client.check_socket_exists()?;
    Ok(match token {
        Some(token) => client.with_token(token),
        None => client,
    })
}

async fn watch_queue(client: &ControlClient, interval: u64) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let data = client
                    .execute(RequestCommand::Newsletter(NewsletterCommand::QueueMetrics))
                    .await?;
                // Clear screen, cursor to top-left
                print!("\x1B[2J\x1B[1;1H");
                if let Some(data) = data {
                    print!("{}", Report(&data));
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
