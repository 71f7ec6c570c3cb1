use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fireperim_kml::KmlRenderer;
use fireperim_sync::{load_config, FeatureReducer, PollLoop, PublishStatus};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fireperim")]
#[command(about = "Poll wildfire perimeters and publish them as KML")]
struct Cli {
    /// YAML file overriding environment configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write the document but never touch git.
    #[arg(long, global = true)]
    no_publish: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll forever (default).
    Run,
    /// Run a single cycle and print its summary.
    Once,
    /// Render a saved query response to stdout without network or git.
    Render { input: PathBuf },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = load_config(cli.config.as_deref())?;
    if cli.no_publish {
        config.publish_enabled = false;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let poll = Arc::new(PollLoop::from_config(&config)?);
            info!(
                output = %config.output_dir.join(&config.output_file_name).display(),
                publish = config.publish_enabled,
                "starting poll loop"
            );
            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %err, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            };
            let cycles = poll.run_until(shutdown, None).await;
            info!(cycles, "poll loop stopped");
        }
        Commands::Once => {
            let report = PollLoop::from_config(&config)?.run_cycle().await;
            let publish = match &report.publish {
                PublishStatus::NotAttempted => "not attempted".to_string(),
                PublishStatus::Done(outcome) => format!("{outcome:?}"),
                PublishStatus::Failed(err) => format!("failed: {err}"),
            };
            println!(
                "cycle complete: run_id={} kind={:?} fetched={} kept={} shapes={} publish={} next_delay={}s",
                report.run_id,
                report.kind,
                report.fetched,
                report.reduction.kept,
                report.shapes,
                publish,
                report.next_delay.as_secs()
            );
            if let Some(err) = &report.fetch_error {
                eprintln!("fetch error: {err}");
            }
            if let Some(failure) = report.failure {
                anyhow::bail!("cycle failed: {failure}");
            }
        }
        Commands::Render { input } => {
            let parsed = fireperim_adapters::load_response_file(&input)?;
            let (reduced, stats) = FeatureReducer::new().apply(parsed.features);
            info!(
                skipped_records = parsed.skipped,
                skipped_features = stats.skipped,
                kept = stats.kept,
                "rendering saved response"
            );
            let kml = KmlRenderer::new(config.output_file_name.clone())
                .render(&reduced)
                .with_context(|| format!("rendering {}", input.display()))?;
            print!("{kml}");
        }
    }

    Ok(())
}
