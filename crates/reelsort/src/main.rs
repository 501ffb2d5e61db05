use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use reelsort::config::{default_config_path, load_config, ConfigWatcher, SharedConfig};
use reelsort::error::WorkerError;
use reelsort::library_hook::ConfiguredNotifier;
use reelsort::logging::{init_logging, LogFormat};
use reelsort::{DryRunClassifier, Engine};

/// Watches download folders and files finished media into a library.
#[derive(Debug, Parser)]
#[command(name = "reelsort", version, about)]
struct Cli {
    /// Configuration file [default: <config dir>/reelsort/config.json]
    #[arg(short, long, env = "REELSORT_CONFIG")]
    config: Option<PathBuf>,

    /// Complete jobs without moving any file
    #[arg(long)]
    dry_run: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format) {
        eprintln!("reelsort: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> reelsort::Result<()> {
    info!("Starting reelsort v{}", env!("CARGO_PKG_VERSION"));

    let path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = load_config(&path)?;
    info!("Loaded configuration from {}", path.display());

    config.dry_run |= cli.dry_run;
    if config.dry_run {
        info!("Dry run: jobs complete without moving files");
    }

    let shared = SharedConfig::new(config);
    let notifier = Arc::new(ConfiguredNotifier::new(shared.clone()));

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(WorkerError::from)?;

    let mut engine = Engine::start(shared.clone(), Arc::new(DryRunClassifier), notifier)?;

    let config_watcher = Arc::new(ConfigWatcher::new(&path, shared).force_dry_run(cli.dry_run));
    let watcher = Arc::clone(&config_watcher);
    let config_thread = std::thread::Builder::new()
        .name("config-watcher".to_string())
        .spawn(move || {
            if let Err(e) = watcher.watch() {
                error!("Configuration watcher stopped: {}", e);
            }
        })
        .map_err(|source| WorkerError::SpawnFailed {
            name: "config-watcher".to_string(),
            source,
        })?;

    info!("Running, press Ctrl+C to stop");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    let counts = engine.registry().counts();
    info!("Stopping with {} job(s) tracked", counts.total());

    config_watcher.stop();
    if config_thread.join().is_err() {
        error!("Configuration watcher panicked");
    }
    engine.shutdown();

    Ok(())
}
