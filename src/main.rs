// src/main.rs

use log::{error, info, warn};

use sscs_node::{Config, Coordinator, StopReason};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "sscs.toml".into());

    let cfg = Config::load(&cfg_path)?;
    info!("[sscs] loaded {}", cfg_path);

    // ------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------
    let coordinator = Coordinator::from_config(&cfg);
    coordinator.install_signal_handler()?;

    info!("[sscs] recording to {} – Ctrl+C to stop", cfg.recorder.recordings_dir.display());
    let report = coordinator.run()?;

    // ------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------
    if let Some(segment) = &report.final_segment {
        info!("[sscs] last chunk {}", segment.path.display());
    }
    match (report.reason, report.recorder_error) {
        (StopReason::SessionEnded, Some(e)) => {
            error!("[sscs] session lost: {:#}", e);
            std::process::exit(1);
        }
        (reason, Some(e)) => warn!("[sscs] stopped ({:?}), recorder reported: {:#}", reason, e),
        (reason, None) => info!("[sscs] stopped ({:?})", reason),
    }

    Ok(())
}
