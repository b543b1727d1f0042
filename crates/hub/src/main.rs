mod channel;
mod clock;
mod config;
mod constants;
mod control;
mod effector;
mod handshake;
mod manager;
mod persist;
mod protocol;
mod sensors;
mod sim;
mod sync;

use anyhow::{bail, Result};
use std::{env, path::Path, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use channel::ActuationChannel;
use clock::SystemClock;
use manager::EffectorManager;
use persist::{CsvStore, Recorder};
use sim::{Scenario, SimChannel};
use sync::Uploader;

const DEFAULT_DEVICE: &str = if cfg!(feature = "serial") { "serial" } else { "sim" };

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;

    // ── Env overrides ───────────────────────────────────────────────
    if let Ok(port) = env::var("SERIAL_PORT") {
        cfg.serial.port = port;
    }
    if let Some(baud) = env::var("SERIAL_BAUD").ok().and_then(|s| s.parse().ok()) {
        cfg.serial.baud_rate = baud;
    }
    cfg.validate()?;
    let device = env::var("DEVICE").unwrap_or_else(|_| DEFAULT_DEVICE.to_string());

    // ── CSV logs ────────────────────────────────────────────────────
    let file_lock = Arc::new(Mutex::new(()));
    let store = CsvStore::open(
        &cfg.logs.dir,
        &cfg.logs.sensor_file,
        &cfg.logs.effector_file,
        Arc::clone(&file_lock),
    )
    .await?;
    let log_files: Vec<_> = store.paths().iter().map(|p| p.to_path_buf()).collect();
    let (recorder, writer) = persist::spawn_writer(store);

    // ── Git sync ────────────────────────────────────────────────────
    if cfg.sync.enabled {
        let repo_dir = Path::new(&cfg.sync.repo_dir);
        if !sync::is_git_repo(repo_dir) {
            warn!(repo = %repo_dir.display(), "sync repo has no .git, pushes will fail until it does");
        }
        let uploader = Uploader::new(
            repo_dir,
            cfg.sync.remote.clone(),
            cfg.sync.branch.clone(),
            log_files,
            Arc::clone(&file_lock),
        )?;
        let every = Duration::from_secs(cfg.sync.interval_hours * 3600);
        tokio::spawn(uploader.run(every));
    }

    // ── Manager ─────────────────────────────────────────────────────
    let manager = EffectorManager::new(SystemClock, cfg.quiet_hours()?);
    let self_test = cfg.self_test_byte();
    info!(%device, config = %config_path, "compost hub starting");

    // ── Device link ─────────────────────────────────────────────────
    let result = match device.as_str() {
        "serial" => {
            let channel = open_serial(&cfg)?;
            drive(manager, channel, &recorder, self_test).await
        }
        "sim" => {
            let sample_every: u64 = env::var("SIM_SAMPLE_EVERY_S")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2)
                .max(1);
            let ack_drop: f32 = env::var("SIM_ACK_DROP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            let scenario = Scenario::from_str_lossy(
                &env::var("SIM_SCENARIO").unwrap_or_else(|_| "nominal".to_string()),
            );
            let channel = SimChannel::new(scenario, Duration::from_secs(sample_every), ack_drop);
            drive(manager, channel, &recorder, self_test).await
        }
        other => bail!("unknown DEVICE '{other}' (use serial or sim)"),
    };

    // Let the writer flush whatever is still queued.
    drop(recorder);
    if let Err(e) = writer.await {
        warn!("row writer task failed: {e}");
    }
    result
}

/// Control loop until the link dies or Ctrl-C.
async fn drive<Ch: ActuationChannel>(
    mut manager: EffectorManager<SystemClock>,
    mut channel: Ch,
    recorder: &Recorder,
    self_test: Option<u8>,
) -> Result<()> {
    tokio::select! {
        res = control::run(&mut manager, &mut channel, recorder, self_test) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}

#[cfg(feature = "serial")]
fn open_serial(cfg: &config::Config) -> Result<channel::SerialChannel> {
    channel::SerialChannel::open(&cfg.serial.port, cfg.serial.baud_rate)
}

#[cfg(not(feature = "serial"))]
fn open_serial(_cfg: &config::Config) -> Result<SimChannel> {
    bail!("built without the `serial` feature; rebuild with --features serial or set DEVICE=sim")
}
