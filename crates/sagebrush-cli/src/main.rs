use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use sagebrush_core::TargetEntity;
use sagebrush_sync::{
    connect_pool, run_migrations, EnrichConfig, EnrichOverrides, EnrichmentPipeline,
    EnrichmentSummary, EntityOutcome, EntityReport, FailureKind, ShutdownSignal,
    DEFAULT_DATABASE_URL,
};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sagebrush")]
#[command(about = "Enrich Western movies with crew credits from TMDB")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch credits for every target movie and write derived crew (default)
    Enrich(EnrichArgs),
    /// Apply database migrations
    Migrate,
}

#[derive(Debug, Default, Args)]
struct EnrichArgs {
    /// Updates per committed transaction
    #[arg(long)]
    batch_size: Option<usize>,
    /// JSONL credits cache
    #[arg(long)]
    cache_path: Option<PathBuf>,
    /// Newline-separated list of ids that are permanently missing upstream
    #[arg(long)]
    dead_letter_path: Option<PathBuf>,
    /// YAML crew-role rules
    #[arg(long)]
    rules: Option<PathBuf>,
}

impl From<EnrichArgs> for EnrichOverrides {
    fn from(args: EnrichArgs) -> Self {
        Self {
            batch_size: args.batch_size,
            cache_path: args.cache_path,
            dead_letter_path: args.dead_letter_path,
            rules_path: args.rules,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let progress = ProgressBar::hidden();
    let log_progress = progress.clone();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(move || {
            SuspendingWriter::new(log_progress.clone(), io::stderr())
        }))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Enrich(EnrichArgs::default())) {
        Commands::Enrich(args) => enrich(args.into(), progress).await,
        Commands::Migrate => {
            let database_url =
                std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
            let pool = connect_pool(&database_url).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn enrich(overrides: EnrichOverrides, pb: ProgressBar) -> Result<()> {
    let config = EnrichConfig::from_env()?.with_overrides(&overrides);
    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_ctrl_c();

    let mut pipeline = EnrichmentPipeline::from_config(config, shutdown).await?;
    let targets = pipeline.load_targets().await?;
    info!(
        targets = targets.len(),
        cache = %pipeline.driver().cache().location(),
        dead_letters = %pipeline.driver().dead_letters().location(),
        "loaded target movies"
    );

    pb.set_length(targets.len() as u64);
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::with_template("  {bar:40.cyan/blue} {pos}/{len} {msg}")
            .context("building progress style")?
            .progress_chars("=> "),
    );
    let summary = pipeline
        .run_with_progress(&targets, |report| {
            pb.set_message(describe(report));
            pb.inc(1);
        })
        .await;
    pb.finish_and_clear();
    let summary = summary?;

    print_summary(&summary, &pipeline);
    Ok(())
}

/// Log sink that hides the progress bar while a line is written, then redraws it.
struct SuspendingWriter<W> {
    progress: ProgressBar,
    inner: W,
}

impl<W> SuspendingWriter<W> {
    fn new(progress: ProgressBar, inner: W) -> Self {
        Self { progress, inner }
    }
}

impl<W: Write> Write for SuspendingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = &mut self.inner;
        self.progress.suspend(|| inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let inner = &mut self.inner;
        self.progress.suspend(|| inner.flush())
    }
}

fn describe(report: &EntityReport) -> String {
    let TargetEntity {
        local_id,
        remote_id,
    } = report.target;
    let state = match report.outcome {
        EntityOutcome::Skipped(_) => "skipped (dead letter)",
        EntityOutcome::FetchFailed(FailureKind::NotFound) => "not found",
        EntityOutcome::FetchFailed(FailureKind::Transient) => "fetch failed",
        EntityOutcome::Updated { .. } => "updated",
        EntityOutcome::NoOp { .. } => "no crew",
    };
    match report.flushed {
        Some(count) => format!("movie {local_id} (tmdb {remote_id}): {state}, committed {count}"),
        None => format!("movie {local_id} (tmdb {remote_id}): {state}"),
    }
}

fn print_summary(summary: &EnrichmentSummary, pipeline: &EnrichmentPipeline) {
    let driver = pipeline.driver();
    if summary.interrupted {
        println!(
            "interrupted after {} of {} movies; rerun to resume",
            summary.processed(),
            summary.targets
        );
    }
    println!(
        "{} enrichment complete: run_id={} updated={} no_op={} skipped={} failed={} (not_found={} transient={}) batches={}",
        pipeline.config().genre,
        summary.run_id,
        summary.updated_count,
        summary.noop_count,
        summary.skipped_count,
        summary.fetch_failed_count,
        summary.not_found_count,
        summary.transient_count,
        summary.batches_committed,
    );
    println!(
        "cache: {} ({} records, {} hits this run)",
        driver.cache().location(),
        driver.cache().len(),
        summary.cache_hits
    );
    println!(
        "dead letters: {} ({} ids)",
        driver.dead_letters().location(),
        driver.dead_letters().len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_pass_through_without_moving_the_bar() {
        let progress = ProgressBar::hidden();
        progress.set_length(10);
        progress.inc(3);

        let mut writer = SuspendingWriter::new(progress.clone(), Vec::new());
        writer
            .write_all(b"WARN fetch failed; will retry next run\n")
            .expect("write");
        writer.flush().expect("flush");

        assert_eq!(writer.inner, b"WARN fetch failed; will retry next run\n");
        assert_eq!(progress.position(), 3);
        assert!(!progress.is_finished());
    }

    #[test]
    fn enrich_flags_become_overrides() {
        let cli = Cli::parse_from(["sagebrush", "enrich", "--batch-size", "5", "--rules", "r.yaml"]);
        let Some(Commands::Enrich(args)) = cli.command else {
            panic!("expected enrich");
        };
        let overrides = EnrichOverrides::from(args);
        assert_eq!(overrides.batch_size, Some(5));
        assert_eq!(overrides.rules_path, Some(PathBuf::from("r.yaml")));
        assert!(overrides.cache_path.is_none());
    }
}
