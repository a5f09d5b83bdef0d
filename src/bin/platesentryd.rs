//! platesentryd - plate-sentry daemon
//!
//! This daemon:
//! 1. Loads the JSON configuration document
//! 2. Builds the source/filter/recorder registries from it
//! 3. Runs the pipeline (transcoder supervision, demux, filters,
//!    recognition, recording)
//! 4. Periodically sweeps the file sink's retention window
//! 5. Shuts sources and sinks down on ctrl-c

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use plate_sentry::{
    build_detector, build_filter, build_recorder, build_source, ConfigStore, FilePlateRecorder,
    Pipeline, PlateRecorder, RecorderConfig, Registry,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervised ALPR capture pipeline")]
struct Args {
    /// Path to the JSON configuration document.
    #[arg(long, env = "PLATE_SENTRY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Override the configured data directory.
    #[arg(long, env = "PLATE_SENTRY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override the configured recognition endpoint.
    #[arg(long, env = "PLATE_SENTRY_ALPR_URL")]
    alpr_url: Option<String>,

    /// Seconds between file-sink retention sweeps.
    #[arg(long, env = "PLATE_SENTRY_SWEEP_SECS", default_value_t = 3600)]
    sweep_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let store = ConfigStore::load(&args.config)?;
    let mut config = store.snapshot();
    if let Some(url) = &args.alpr_url {
        config.alpr.url = url.clone();
    }
    let data_dir = args.data_dir.clone().unwrap_or_else(|| config.data_dir());
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;

    let sources: Arc<plate_sentry::Sources> = Arc::new(Registry::new());
    let filters: Arc<plate_sentry::Filters> = Arc::new(Registry::new());
    let recorders: Arc<plate_sentry::Recorders> = Arc::new(Registry::new());

    for filter_config in &config.filters {
        filters.add(Arc::new(build_filter(filter_config)?));
    }

    // File recorders are kept concretely as well so the sweep loop can run
    // their cleanup.
    let mut file_recorders: Vec<Arc<FilePlateRecorder>> = Vec::new();
    for recorder_config in &config.recorders {
        match recorder_config {
            RecorderConfig::File {
                pattern,
                retain_days,
            } => {
                let recorder = Arc::new(FilePlateRecorder::new(&data_dir, pattern, *retain_days)?);
                file_recorders.push(Arc::clone(&recorder));
                recorders.add(recorder as Arc<dyn PlateRecorder>);
            }
            other => recorders.add(build_recorder(other, &data_dir)?),
        }
    }

    for source_config in &config.sources {
        sources.add(Arc::new(build_source(source_config)?));
    }

    let detector = Arc::new(build_detector(&config.alpr)?);
    let pipeline = Pipeline::new(
        Arc::clone(&sources),
        Arc::clone(&filters),
        Arc::clone(&recorders),
        detector,
        data_dir.clone(),
    );
    pipeline.run();

    log::info!(
        "platesentryd running: {} source(s), {} filter(s), {} recorder(s), data dir {}",
        sources.len(),
        filters.len(),
        recorders.len(),
        data_dir.display()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("install ctrl-c handler")?;

    let sweep_interval = Duration::from_secs(args.sweep_secs.max(1));
    let mut last_sweep = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
        if last_sweep.elapsed() >= sweep_interval {
            for recorder in &file_recorders {
                if let Err(e) = recorder.cleanup() {
                    log::warn!("file sink sweep failed: {:#}", e);
                }
            }
            last_sweep = Instant::now();
        }
    }

    log::info!("shutting down");
    pipeline.shutdown();
    Ok(())
}
