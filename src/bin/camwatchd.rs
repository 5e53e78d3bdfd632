//! camwatchd - live camera stream daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file, env overrides, CLI flags)
//! 2. Serves the control page, MJPEG feed and control endpoints
//! 3. Optionally starts the camera right away (`--start`)
//! 4. Releases the camera and stops serving on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use camwatch::{net, ApiConfig, ApiServer, CamwatchConfig, DetectorKind, Session};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream a local camera to browsers on the LAN, with optional object detection"
)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP server to (overrides the config file).
    #[arg(long)]
    addr: Option<String>,

    /// Camera device path, or stub://name for a synthetic camera.
    #[arg(long)]
    device: Option<String>,

    /// Start the camera at launch instead of waiting for /start_camera.
    #[arg(long)]
    start: bool,

    /// With --start, begin with detection turned off.
    #[arg(long, requires = "start")]
    no_detection: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = CamwatchConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.addr = addr;
    }
    if let Some(device) = args.device {
        cfg.camera.device = device;
    }

    let bind: SocketAddr = cfg
        .addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", cfg.addr))?;
    let server_ip = net::advertised_ip(&cfg);
    let session = Arc::new(Session::from_config(&cfg, server_ip.clone(), bind.port()));

    let api_config = ApiConfig {
        addr: cfg.addr.clone(),
        stream: cfg.stream.clone(),
    };
    let api_handle = ApiServer::new(api_config, session.clone()).spawn()?;
    log::info!(
        "camwatchd ready: open http://{}:{} from any device on this network",
        server_ip,
        api_handle.addr.port()
    );
    log::info!(
        "camera {} ({}x{} @ {} fps), detector {:?}",
        cfg.camera.device,
        cfg.camera.width,
        cfg.camera.height,
        cfg.camera.fps,
        cfg.detector.kind
    );

    if cfg.detector.kind == DetectorKind::Tract && !cfg.detector.model_path.exists() {
        log::warn!(
            "model file {} not found; /start_camera will fail until it is present",
            cfg.detector.model_path.display()
        );
    }

    if args.start {
        if let Err(err) = session.start(!args.no_detection) {
            log::error!("could not start camera at launch: {}", err);
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("camwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    session.stop();
    api_handle.stop()?;

    Ok(())
}
