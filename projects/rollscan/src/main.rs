mod artifacts;
mod cli;
mod config;
mod pipeline;
mod session;
mod video;

use anyhow::{Context, Result};
use artifacts::DefectRow;
use cli::{Args, Command};
use config::PipelineConfig;
use pipeline::detection::{HttpClassifier, HttpClassifierConfig};
use pipeline::detection_worker::DetectionWorker;
use pipeline::orchestrator::PipelineScheduler;
use pipeline::reader::FrameExtractor;
use pipeline::rollmap::RollmapGenerator;
use pipeline::store::DefectStore;
use session::{DataRoot, SessionManager};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse_args();
    let config = Arc::new(PipelineConfig::load(args.pipeline_config.as_deref())?);
    let data_root = DataRoot::new(&args.data_root);

    match args.command {
        Command::Run {
            classifier_url,
            classifier_timeout_secs,
            poll_interval_secs,
        } => {
            let classifier_config = HttpClassifierConfig {
                base_url: classifier_url,
                timeout: Duration::from_secs(classifier_timeout_secs),
            };
            run_pipeline(
                data_root,
                config,
                classifier_config,
                Duration::from_secs(poll_interval_secs),
            )
            .await?;
        }
        Command::Register { video } => {
            let ctx = session::register_upload(&data_root, &video, chrono::Local::now())?;
            println!("{}", ctx.id);
        }
        Command::Reset => {
            session::reset_sessions(&data_root)?;
        }
        Command::Summary => {
            let ctx = session::active_session(&data_root)?;
            let summary = ctx.store().summarize(&ctx.id, config.speed)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Export { out } => {
            let ctx = session::active_session(&data_root)?;
            export_csv(&ctx.store(), out.as_deref())?;
        }
        Command::Rollmap => {
            let ctx = session::active_session(&data_root)?;
            let written =
                RollmapGenerator::new(&config).regenerate(&ctx.store(), &ctx.rollmaps_dir)?;
            tracing::info!("Wrote {} rollmap windows for session {}", written.len(), ctx.id);
        }
        Command::TakeFrame => {
            let ctx = session::active_session(&data_root)?;
            if let Some(path) = session::take_ready_frame(&ctx)? {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}

async fn run_pipeline(
    data_root: DataRoot,
    config: Arc<PipelineConfig>,
    classifier_config: HttpClassifierConfig,
    interval: Duration,
) -> Result<()> {
    tracing::info!(
        "Starting pipeline on {:?}, classifier at {}",
        data_root.working_dir(),
        classifier_config.base_url
    );

    // The blocking HTTP client must not be created on the async runtime.
    let classifier = tokio::task::spawn_blocking(move || HttpClassifier::new(classifier_config))
        .await?
        .context("Failed to create classifier client")?;

    let manager = SessionManager::new(data_root);
    let session = manager.subscribe();

    let mut scheduler = PipelineScheduler::new(interval);
    scheduler.spawn(manager);
    scheduler.spawn(FrameExtractor::new(session.clone(), config.clone()));
    scheduler.spawn(DetectionWorker::new(session, config, Box::new(classifier)));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down {} workers", scheduler.worker_count());
    tokio::task::spawn_blocking(move || scheduler.shutdown()).await?;

    Ok(())
}

fn export_csv(store: &DefectStore, out: Option<&Path>) -> Result<()> {
    let records = store.read_all()?;
    let sink: Box<dyn Write> = match out {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = csv::Writer::from_writer(sink);
    for record in &records {
        writer.serialize(DefectRow::from(record))?;
    }
    writer.flush()?;
    tracing::info!("Exported {} defect records from {:?}", records.len(), store.path());
    Ok(())
}
