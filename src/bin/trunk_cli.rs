//! Command-line client for trunk queues
//!
//! Handy for poking at a queue by hand: enqueue a message, claim one,
//! check sizes, or watch a notification channel.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use trunk::config::TrunkConfig;
use trunk::logging::{init_logging, verbosity_level};
use trunk::queue::PgQueue;

#[derive(Parser)]
#[command(name = "trunk-cli")]
#[command(about = "Inspect and drive trunk message queues")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults, `config/trunk.*` and TRUNK_* env otherwise)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a message on a queue
    Put {
        queue: String,
        message: String,
    },
    /// Claim the oldest message of a queue
    Get(GetArgs),
    /// Number of pending messages
    Size { queue: String },
    /// Delete every pending message
    Purge { queue: String },
    /// Print notifications as they arrive
    Listen(ListenArgs),
    /// Subscribe to the given channels and show what the server reports
    Channels { channels: Vec<String> },
}

#[derive(Args)]
struct GetArgs {
    queue: String,

    /// Wait for a message instead of returning immediately
    #[arg(short, long)]
    block: bool,

    /// Give up waiting after this many seconds (waits forever when omitted)
    #[arg(short, long, requires = "block", value_parser = parse_timeout)]
    timeout: Option<Duration>,
}

#[derive(Args)]
struct ListenArgs {
    /// Channels to subscribe to
    #[arg(required = true)]
    channels: Vec<String>,

    /// Stop after this many notifications
    #[arg(short = 'n', long)]
    count: Option<usize>,
}

/// Seconds as a finite, non-negative duration
fn parse_timeout(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("{value}: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TrunkConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => TrunkConfig::load().context("loading configuration")?,
    };
    if cli.verbose > 0 {
        config.logging.level = verbosity_level(cli.verbose).to_string();
    }
    init_logging(&config.logging);

    let mut queue = PgQueue::connect(&config)
        .await
        .with_context(|| format!("connecting to {}", config.masked_database_url()))?;

    let outcome = run(&mut queue, cli.command).await;
    queue.close().await;
    outcome
}

async fn run(queue: &mut PgQueue, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Put { queue: name, message } => {
            queue.put(&name, message.as_bytes()).await?;
            println!("queued on {name}");
        }
        Commands::Get(args) => {
            queue.create(&args.queue).await;
            match queue.get(&args.queue, args.block, args.timeout).await {
                Ok(message) => println!("{}\t{}", message.id, String::from_utf8_lossy(&message.payload)),
                Err(e) if e.is_empty() => println!("{} is empty", args.queue),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Size { queue: name } => {
            println!("{}", queue.qsize(&name).await?);
        }
        Commands::Purge { queue: name } => {
            let deleted = queue.purge(&name).await?;
            println!("purged {deleted} message(s) from {name}");
        }
        Commands::Listen(args) => {
            let client = queue.notifications();
            for channel in &args.channels {
                client.listen(channel).await;
            }
            let limit = args.count.unwrap_or(usize::MAX);
            let mut notifications = Box::pin(client.stream(None).take(limit));
            while let Some(notification) = notifications.next().await {
                let notification = notification?;
                println!("{}\t{}", notification.channel, notification.payload);
            }
        }
        Commands::Channels { channels } => {
            let client = queue.notifications();
            for channel in &channels {
                client.listen(channel).await;
            }
            for channel in client.channels().await? {
                println!("{channel}");
            }
        }
    }
    Ok(())
}
