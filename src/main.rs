use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, info, warn};
use road_sensor_recorder::sources::build_sources;
use road_sensor_recorder::trigger::watch_stop_requests;
use road_sensor_recorder::{
    JsonStateStore, LifecycleController, LiveStatus, Notifier, ReadingKind, RecorderConfig,
    RecorderError, SessionSummary, SourceBackend, StartOutcome, StateStore, StopOutcome,
    StopRequestFile, StopTrigger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "road_recorder")]
#[command(about = "Background recorder for motion and position readings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record until Ctrl-C, the duration elapses, or a stop request arrives
    Run(RunArgs),
    /// Ask a running recorder to stop
    Stop(CommonArgs),
    /// Show the persisted lifecycle flag and the last live status
    Status(CommonArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output directory (overrides the configuration file)
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Duration in seconds (0 = continuous)
    #[arg(long, value_name = "SECS", default_value = "0")]
    duration: u64,

    /// Where readings come from
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    #[arg(long)]
    no_accelerometer: bool,

    #[arg(long)]
    no_gyroscope: bool,

    #[arg(long)]
    no_location: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Simulated,
    Termux,
}

impl From<BackendArg> for SourceBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Simulated => SourceBackend::Simulated,
            BackendArg::Termux => SourceBackend::Termux,
        }
    }
}

fn load_config(common: &CommonArgs) -> Result<RecorderConfig> {
    let mut config = match &common.config {
        Some(path) => RecorderConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RecorderConfig::default(),
    };
    if let Some(dir) = &common.output_dir {
        config.output_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Stop(common) => request_stop(&common),
        Command::Status(common) => print_status(&common),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    config.enable_accelerometer &= !args.no_accelerometer;
    config.enable_gyroscope &= !args.no_gyroscope;
    config.enable_location &= !args.no_location;
    config.validate()?;

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;

    info!("Road recorder starting");
    info!("  Duration: {} seconds (0=continuous)", args.duration);
    info!("  Backend: {:?}", config.backend);
    info!("  Output Dir: {}", config.output_dir.display());

    let stop_file = StopRequestFile::new(config.stop_request_file());

    let status_path = config.status_file();
    let notifier = Arc::new(Notifier::new());
    let events = notifier.subscribe();
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(config.state_file()));
    let sources = build_sources(&config);
    let controller = Arc::new(LifecycleController::new(
        config.clone(),
        sources,
        store,
        notifier,
    )?);

    // A stop request pending for another recorder must survive a refused start
    match controller.start() {
        Ok(StartOutcome::Started {
            session_id,
            skipped,
        }) => {
            info!("Session {} recording", session_id);
            for s in &skipped {
                warn!("  {} skipped: {}", s.name, s.reason);
            }
        }
        Ok(StartOutcome::AlreadyRunning) => warn!("Recorder was already running"),
        Err(RecorderError::AlreadyRunning) => bail!(
            "another recorder is already running in {}",
            config.output_dir.display()
        ),
        Err(e) => return Err(e.into()),
    }
    stop_file
        .clear()
        .with_context(|| format!("clearing {}", stop_file.path().display()))?;

    let mut watcher = tokio::spawn(watch_stop_requests(
        stop_file,
        StopTrigger::new(Arc::clone(&controller)),
        config.trigger_poll(),
    ));
    let mut status_tick = tokio::time::interval(config.status_interval());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = wait_for_duration(args.duration);
    tokio::pin!(deadline);

    let mut trigger_summary: Option<SessionSummary> = None;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, stopping...");
                break;
            }
            _ = &mut deadline => {
                info!("Duration reached, stopping...");
                break;
            }
            result = &mut watcher => {
                match result {
                    Ok(Ok(StopOutcome::Stopped(summary))) => {
                        info!("Stop request received");
                        trigger_summary = Some(summary);
                    }
                    Ok(Ok(StopOutcome::AlreadyStopped)) => info!("Stop request received"),
                    Ok(Err(e)) => warn!("Stop request failed: {}", e),
                    Err(e) => warn!("Stop watcher ended: {}", e),
                }
                break;
            }
            _ = status_tick.tick() => {
                save_status(&controller, &status_path);
            }
        }
    }
    watcher.abort();

    let stopping = Arc::clone(&controller);
    let outcome = tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("stop task panicked")??;
    let summary = match outcome {
        StopOutcome::Stopped(summary) => Some(summary),
        StopOutcome::AlreadyStopped => trigger_summary.or_else(|| controller.last_summary()),
    };

    save_status(&controller, &status_path);
    for event in events.try_iter() {
        debug!("Lifecycle event: {:?}", event);
    }

    match summary {
        Some(summary) => print_summary(&summary),
        None => warn!("No session summary available"),
    }
    Ok(())
}

async fn wait_for_duration(seconds: u64) {
    if seconds == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }
}

fn save_status(controller: &LifecycleController, path: &Path) {
    match controller.live_status() {
        Ok(status) => {
            if let Err(e) = status.save(path) {
                warn!("Failed to write {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("Live status unavailable: {}", e),
    }
}

fn print_summary(summary: &SessionSummary) {
    println!("\n=== Session {} ===", summary.session_id);
    match &summary.log_path {
        Some(path) => println!("  Log: {}", path.display()),
        None => println!("  Log: (not written)"),
    }
    println!("  Duration: {:.1}s", summary.duration_seconds());
    for kind in ReadingKind::ALL {
        println!("  {} lines: {}", kind.label(), summary.lines(kind));
    }
    if summary.dropped > 0 {
        println!("  Dropped (queue full): {}", summary.dropped);
    }
    if summary.writer_failed || summary.write_errors > 0 {
        println!(
            "  Storage problems: writer_failed={} write_errors={} lost_lines={}",
            summary.writer_failed, summary.write_errors, summary.lost_lines
        );
    }
    for s in &summary.skipped_sources {
        println!("  Skipped {}: {}", s.name, s.reason);
    }
}

fn request_stop(common: &CommonArgs) -> Result<()> {
    let config = load_config(common)?;
    let file = StopRequestFile::new(config.stop_request_file());
    file.request()
        .with_context(|| format!("writing {}", file.path().display()))?;
    println!("Stop requested ({})", file.path().display());
    Ok(())
}

fn print_status(common: &CommonArgs) -> Result<()> {
    let config = load_config(common)?;
    let store = JsonStateStore::new(config.state_file());
    let state = store
        .load()
        .with_context(|| format!("reading {}", store.path().display()))?;
    println!(
        "Recording: {}",
        if state.is_recording { "yes" } else { "no" }
    );
    if let Some(at) = state.last_transition_ms {
        println!("Last transition: {} ms", at);
    }
    if let Some(owner) = state.owner {
        let liveness = if owner.is_alive() { "alive" } else { "gone" };
        println!("Owner: pid {} ({})", owner.pid, liveness);
    }

    let status_path = config.status_file();
    match LiveStatus::load(&status_path) {
        Ok(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        Err(_) => println!("No live status at {}", status_path.display()),
    }
    Ok(())
}
