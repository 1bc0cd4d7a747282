use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use airpipe::{Config, NowPlayingService, PgrepProbe};

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    log::info!("Starting airpipe metadata decoder");

    let config = Config::from_env();
    log::info!(
        "Transport: {:?} ({:?}), framing: {:?}",
        config.transport,
        config.pipe_path,
        config.framing
    );

    let service = NowPlayingService::new(config, Arc::new(PgrepProbe));
    service.start().context("failed to start decode loop")?;

    // Setup signal handler for Ctrl+C (SIGINT)
    let service_for_signal = service.clone();
    ctrlc::set_handler(move || {
        log::info!("Received interrupt signal, stopping decode loop...");
        service_for_signal.stop();
        std::process::exit(0);
    })
    .context("failed to set Ctrl+C handler")?;

    // Surface snapshot changes as JSON lines until interrupted.
    let mut last = service.get_snapshot();
    loop {
        std::thread::sleep(Duration::from_secs(2));
        let snapshot = service.get_snapshot();
        if snapshot != last {
            let state = if service.is_playing() { "playing" } else { "idle" };
            match serde_json::to_string(&snapshot) {
                Ok(json) => log::info!("Now playing ({}): {}", state, json),
                Err(e) => log::error!("Failed to serialize snapshot: {}", e),
            }
            last = snapshot;
        }
    }
}
