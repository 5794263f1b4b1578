//! CLI Entry Point for ct_scan
//!
//! Provides command-line interface for:
//! - Serving both device links and running scans from an operator console
//! - Simulating the positioner and camera controllers
//! - A self-contained demo scan against simulated devices
//! - One-off device checks (move, capture, status)
//!
//! # Usage
//!
//! Serve the links and control a scan from stdin:
//! ```bash
//! ct_scan serve --projections 360
//! ```
//!
//! Simulate both devices against a running server:
//! ```bash
//! ct_scan simulate
//! ```

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::Local;
use clap::{Parser, Subcommand};
use ct_scan::config::Settings;
use ct_scan::experiment::{
    ProjectionWriter, ScanContext, ScanOrchestrator, ScanRecord, ScanState,
};
use ct_scan::hardware::{
    CaptureDevice, CaptureLink, CaptureListener, DeviceRole, Positioner, PositionerLink,
    PositionerListener, SimulatedCamera, SimulatedPositioner,
};
use ct_scan::logging;
use ct_scan::network::protocol::Token;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ct_scan")]
#[command(about = "CT scan device links and scan orchestration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = ct_scan::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve both device links and control scans from the console
    Serve {
        #[command(flatten)]
        scan: ScanArgs,

        /// Start the scan as soon as both devices are connected
        #[arg(long)]
        auto_start: bool,
    },

    /// Run simulated devices that connect to the configured links
    Simulate,

    /// Run a complete scan against simulated devices on localhost
    Demo {
        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Rotate the positioner to an angle and wait for it
    Move {
        /// Target angle in degrees
        angle: f64,

        /// Seconds to wait for the device to connect and answer
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Take a single test image
    Capture {
        /// File receiving the raw image
        #[arg(long)]
        output: Option<PathBuf>,

        /// Seconds to wait for the device to connect and answer
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Ask the positioner for its current angle
    Status {
        /// Seconds to wait for the device to connect and answer
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Print the effective configuration
    Config,
}

#[derive(clap::Args)]
struct ScanArgs {
    /// Existing scan file to run
    #[arg(long)]
    scan: Option<PathBuf>,

    /// Number of projections (overrides configuration)
    #[arg(long)]
    projections: Option<u32>,

    /// Total rotation in degrees (overrides configuration)
    #[arg(long)]
    max_angle: Option<f64>,

    /// Output directory (overrides configuration)
    #[arg(long)]
    output: Option<PathBuf>,
}

impl ScanArgs {
    /// Loads or creates the scan and returns it with its output directory.
    fn resolve(&self, settings: &Settings) -> Result<(ScanRecord, PathBuf)> {
        if let Some(path) = &self.scan {
            let scan = ScanRecord::load(path)
                .with_context(|| format!("Failed to load scan from {}", path.display()))?;
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Ok((scan, dir));
        }

        let mut defaults = settings.scan.clone();
        if let Some(projections) = self.projections {
            defaults.projection_count = projections;
        }
        if let Some(max_angle) = self.max_angle {
            defaults.max_angle = max_angle;
        }
        let root = self.output.clone().unwrap_or(defaults.output_dir.clone());
        let dir = root.join(Local::now().format("scan_%Y%m%d_%H%M%S").to_string());
        let scan = defaults.record().with_path(dir.join("scan.json"));
        scan.validate()?;
        Ok((scan, dir))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Serve { scan, auto_start } => serve(settings, scan, auto_start).await,
        Commands::Simulate => simulate(settings).await,
        Commands::Demo { scan } => demo(settings, scan).await,
        Commands::Move { angle, timeout } => move_once(settings, angle, timeout).await,
        Commands::Capture { output, timeout } => capture_once(settings, output, timeout).await,
        Commands::Status { timeout } => status_once(settings, timeout).await,
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

/// Builds an orchestrator over both links that stores projections under `dir`.
fn orchestrator_for(
    positioner: &Arc<PositionerLink>,
    capture: &Arc<CaptureLink>,
    scan: ScanRecord,
    dir: &Path,
) -> Result<ScanOrchestrator> {
    let context = ScanContext::with_devices(positioner.clone(), capture.clone());
    context.set_scan(scan)?;

    let orchestrator = ScanOrchestrator::new();
    orchestrator.set_context(context)?;
    orchestrator.set_projection_sink(ProjectionWriter::new(dir).into_sink());
    orchestrator.set_state_callback(Arc::new(|state: ScanState| info!(%state, "Scan state")));
    Ok(orchestrator)
}

async fn serve(settings: Settings, args: ScanArgs, auto_start: bool) -> Result<()> {
    let (scan, dir) = args.resolve(&settings)?;
    let positioner = Arc::new(PositionerLink::from_config(&settings.devices)?);
    let capture = Arc::new(CaptureLink::from_config(&settings.devices)?);
    positioner.start().await.context("Failed to start positioner link")?;
    capture.start().await.context("Failed to start capture link")?;

    let orchestrator = orchestrator_for(&positioner, &capture, scan, &dir)?;
    info!(output = %dir.display(), "Ready. Commands: start, pause, resume, abort, reset, status, quit");

    if auto_start {
        let wait = Duration::from_secs(24 * 3600);
        tokio::join!(positioner.wait_ready(wait), capture.wait_ready(wait));
        if let Err(e) = orchestrator.start() {
            error!(error = %e, "Could not start scan");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !console_command(&orchestrator, line.trim()) {
                    break;
                }
            }
        }
    }

    orchestrator.stop();
    positioner.stop().await;
    capture.stop().await;
    Ok(())
}

/// Runs one console command. Returns false when the operator asked to quit.
fn console_command(orchestrator: &ScanOrchestrator, command: &str) -> bool {
    let result = match command {
        "" => Ok(()),
        "start" => orchestrator.start(),
        "pause" => orchestrator.pause(),
        "resume" => orchestrator.resume(),
        "abort" | "stop" => {
            orchestrator.stop();
            Ok(())
        }
        "reset" => orchestrator.reset(),
        "status" => {
            let status = orchestrator.status();
            match serde_json::to_string(&status) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "Could not format status"),
            }
            Ok(())
        }
        "quit" | "exit" => return false,
        other => {
            warn!(command = other, "Unknown command");
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(command, error = %e, "Command rejected");
    }
    true
}

async fn simulate(settings: Settings) -> Result<()> {
    let sim = &settings.simulator;
    let positioner = SimulatedPositioner::new(sim.connect_addr(&settings.devices, DeviceRole::Positioner)?)
        .with_speed(sim.move_speed_deg_per_sec)
        .spawn();
    let camera = SimulatedCamera::new(sim.connect_addr(&settings.devices, DeviceRole::Capture)?)
        .with_image_size(sim.image_width, sim.image_height)
        .with_delay(sim.capture_delay())
        .spawn();

    info!("Simulated devices running. Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    positioner.shutdown().await;
    camera.shutdown().await;
    Ok(())
}

async fn demo(mut settings: Settings, args: ScanArgs) -> Result<()> {
    settings.devices.bind_host = "127.0.0.1".to_string();
    settings.devices.positioner_port = 0;
    settings.devices.capture_port = 0;
    if args.projections.is_none() && args.scan.is_none() {
        settings.scan.projection_count = 12;
    }
    let (scan, dir) = args.resolve(&settings)?;

    let positioner = Arc::new(PositionerLink::from_config(&settings.devices)?);
    let capture = Arc::new(CaptureLink::from_config(&settings.devices)?);
    positioner.start().await?;
    capture.start().await?;
    let (Some(positioner_addr), Some(capture_addr)) = (positioner.local_addr(), capture.local_addr())
    else {
        bail!("Links did not report their addresses");
    };

    let sim = &settings.simulator;
    let sim_positioner = SimulatedPositioner::new(positioner_addr)
        .with_speed(sim.move_speed_deg_per_sec)
        .spawn();
    let sim_camera = SimulatedCamera::new(capture_addr)
        .with_image_size(sim.image_width, sim.image_height)
        .with_delay(sim.capture_delay())
        .spawn();

    let ready = Duration::from_secs(5);
    if !positioner.wait_ready(ready).await || !capture.wait_ready(ready).await {
        bail!("Simulated devices did not connect");
    }

    let orchestrator = orchestrator_for(&positioner, &capture, scan, &dir)?;
    orchestrator.start()?;
    let finished = tokio::select! {
        state = orchestrator.wait_for(|s| *s == ScanState::Done) => Some(state),
        _ = tokio::signal::ctrl_c() => None,
    };
    if finished.is_none() {
        orchestrator.stop();
    }

    let status = orchestrator.status();
    info!(
        captured = status.captured,
        total = status.total,
        output = %dir.display(),
        "Demo finished"
    );

    sim_positioner.shutdown().await;
    sim_camera.shutdown().await;
    positioner.stop().await;
    capture.stop().await;
    Ok(())
}

/// Listener forwarding the first matching completion to a oneshot channel.
struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
    token: Option<Token>,
}

impl<T> Completion<T> {
    fn new(token: Option<Token>) -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            token,
        });
        (completion, rx)
    }

    fn complete(&self, token: Option<Token>, value: T) {
        if self.token.is_some() && token != self.token {
            return;
        }
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(value);
        }
    }
}

impl PositionerListener for Completion<f64> {
    fn on_position_done(&self, angle: f64, token: Token) {
        self.complete(Some(token), angle);
    }

    fn on_status(&self, angle: f64) {
        self.complete(None, angle);
    }
}

impl CaptureListener for Completion<Option<Bytes>> {
    fn on_capture_done(
        &self,
        data: Option<Bytes>,
        _stride_pixel: u32,
        _stride_row: u32,
        _sensor: u32,
        token: Token,
    ) {
        self.complete(Some(token), data);
    }
}

async fn connected_positioner(settings: &Settings, timeout: Duration) -> Result<PositionerLink> {
    let link = PositionerLink::from_config(&settings.devices)?;
    link.start().await?;
    info!("Waiting for the positioner to connect");
    if !link.wait_ready(timeout).await {
        link.stop().await;
        bail!("Positioner did not connect within {:?}", timeout);
    }
    Ok(link)
}

async fn move_once(settings: Settings, angle: f64, timeout: u64) -> Result<()> {
    let timeout = Duration::from_secs(timeout);
    let link = connected_positioner(&settings, timeout).await?;

    let token = Token::random();
    let (completion, rx) = Completion::<f64>::new(Some(token));
    link.add_listener(completion);
    link.move_to(angle, token)?;

    let reached = tokio::time::timeout(timeout, rx).await;
    link.stop().await;
    match reached {
        Ok(Ok(reached)) => {
            println!("Reached {reached:.2}°");
            Ok(())
        }
        _ => bail!("No move completion within {:?}", timeout),
    }
}

async fn status_once(settings: Settings, timeout: u64) -> Result<()> {
    let timeout = Duration::from_secs(timeout);
    let link = connected_positioner(&settings, timeout).await?;

    let (completion, rx) = Completion::<f64>::new(None);
    link.add_listener(completion);
    link.request_status()?;

    let angle = tokio::time::timeout(timeout, rx).await;
    link.stop().await;
    match angle {
        Ok(Ok(angle)) => {
            println!("Positioner at {angle:.2}°");
            Ok(())
        }
        _ => bail!("No status report within {:?}", timeout),
    }
}

async fn capture_once(settings: Settings, output: Option<PathBuf>, timeout: u64) -> Result<()> {
    let timeout = Duration::from_secs(timeout);
    let link = CaptureLink::from_config(&settings.devices)?;
    link.start().await?;
    info!("Waiting for the camera to connect");
    if !link.wait_ready(timeout).await {
        link.stop().await;
        bail!("Camera did not connect within {:?}", timeout);
    }

    let token = Token::random();
    let (completion, rx) = Completion::<Option<Bytes>>::new(Some(token));
    link.add_listener(completion);
    link.capture(&settings.scan.params(), token)?;

    let data = tokio::time::timeout(timeout, rx).await;
    link.stop().await;
    let data = match data {
        Ok(Ok(data)) => data,
        _ => bail!("No capture completion within {:?}", timeout),
    };

    match (data, output) {
        (Some(data), Some(path)) => {
            std::fs::write(&path, &data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Saved {} bytes to {}", data.len(), path.display());
        }
        (Some(data), None) => println!("Received {} bytes", data.len()),
        (None, _) => println!("Capture done, no image data"),
    }
    Ok(())
}
