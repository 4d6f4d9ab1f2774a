use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use noticias_sync::RunOutcome;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "noticias")]
#[command(about = "Noticias content pipeline")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Raise log verbosity (-v debug, -vv trace). Ignored when RUST_LOG is set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Sync {
        /// Print the run outcome as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline on the SYNC_CRON schedule until interrupted.
    Schedule,
    /// Summarize the accumulated store.
    Report {
        /// Number of newest items to list.
        #[arg(long, default_value_t = 10)]
        newest: usize,
    },
    /// Repair truncated JSON read from stdin and print it.
    Repair,
}

fn init_tracing(format: LogFormat, verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "noticias_cli={default_level},noticias_sync={default_level},noticias_adapters={default_level},noticias_storage={default_level},warn"
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::NoNewCandidates { run_id } => {
            println!("sync complete: run_id={run_id} no new candidates; store unchanged");
        }
        RunOutcome::NoValidItems {
            run_id,
            attempts,
            discarded,
        } => {
            println!(
                "sync complete: run_id={run_id} no valid items (attempts={attempts} discarded={discarded}); store unchanged"
            );
        }
        RunOutcome::Persisted(summary) => {
            println!(
                "sync complete: run_id={} new={} discarded={} total={} store={} sha256={}",
                summary.run_id,
                summary.new_items,
                summary.discarded_items,
                summary.total_items,
                summary.store_path,
                summary.store_sha256
            );
            if let Some(lesson) = &summary.lesson_path {
                println!("lesson: {lesson}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    let command = cli.command.unwrap_or(Commands::Sync { json: false });
    tracing::debug!(?command, "dispatching command");
    match command {
        Commands::Sync { json } => {
            let outcome = noticias_sync::run_sync_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
        }
        Commands::Schedule => {
            noticias_sync::run_scheduler_from_env().await?;
        }
        Commands::Report { newest } => {
            let report = noticias_sync::report_from_env(newest).await?;
            println!("{report}");
        }
        Commands::Repair => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("reading stdin")?;
            let repaired = noticias_sync::repair_truncated(noticias_sync::extract_payload(&input));
            println!("{repaired}");
            if serde_json::from_str::<serde_json::Value>(&repaired).is_err() {
                bail!("input could not be repaired into valid JSON");
            }
        }
    }

    Ok(())
}
