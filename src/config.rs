//! Configuration using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. `config/ct_scan.toml` (optional)
//! 3. environment variables prefixed with `CT_SCAN_`, nested keys separated
//!    by `__` (e.g. `CT_SCAN_DEVICES__POSITIONER_PORT=26000`)
//!
//! # Example
//! ```no_run
//! use ct_scan::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Positioner port: {}", settings.devices.positioner_port);
//! # Ok::<(), ct_scan::error::ScanError>(())
//! ```

use crate::error::{AppResult, ScanError};
use crate::experiment::scan::ScanRecord;
use crate::hardware::capabilities::CaptureParams;
use crate::hardware::{DeviceRole, CAPTURE_PORT, POSITIONER_PORT};
use crate::logging::OutputFormat;
use crate::network::link::DEFAULT_MAX_PAYLOAD_BYTES;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/ct_scan.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device link endpoints
    #[serde(default)]
    pub devices: DevicesConfig,
    /// Defaults for new scans
    #[serde(default)]
    pub scan: ScanDefaults,
    /// Simulated devices
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Where the device links listen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Interface both links bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Positioner link port
    #[serde(default = "default_positioner_port")]
    pub positioner_port: u16,
    /// Capture link port
    #[serde(default = "default_capture_port")]
    pub capture_port: u16,
    /// Largest raw payload accepted after a capture frame
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

/// Parameters for scans created from the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDefaults {
    /// Number of projections
    #[serde(default = "default_projection_count")]
    pub projection_count: u32,
    /// Total rotation in degrees
    #[serde(default = "default_max_angle")]
    pub max_angle: f64,
    /// Shutter hold time in milliseconds
    #[serde(default = "default_timing_ms")]
    pub shutter_ms: u32,
    /// Exposure time in milliseconds
    #[serde(default = "default_timing_ms")]
    pub exposure_ms: u32,
    /// Auto focus time in milliseconds
    #[serde(default = "default_timing_ms")]
    pub focus_ms: u32,
    /// Directory receiving the scan file and raw projections
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Behaviour of the simulated devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Host the simulated devices connect to
    #[serde(default = "default_sim_host")]
    pub host: String,
    /// Rotation speed of the simulated positioner
    #[serde(default = "default_move_speed")]
    pub move_speed_deg_per_sec: f64,
    /// Time the simulated camera needs per image
    #[serde(default = "default_capture_delay_ms")]
    pub capture_delay_ms: u64,
    /// Simulated image width in pixels
    #[serde(default = "default_image_side")]
    pub image_width: u32,
    /// Simulated image height in pixels
    #[serde(default = "default_image_side")]
    pub image_height: u32,
}

// Default value functions
fn default_name() -> String {
    "CT Scan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_positioner_port() -> u16 {
    POSITIONER_PORT
}

fn default_capture_port() -> u16 {
    CAPTURE_PORT
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

fn default_projection_count() -> u32 {
    180
}

fn default_max_angle() -> f64 {
    360.0
}

fn default_timing_ms() -> u32 {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("scans")
}

fn default_sim_host() -> String {
    "127.0.0.1".to_string()
}

fn default_move_speed() -> f64 {
    90.0
}

fn default_capture_delay_ms() -> u64 {
    50
}

fn default_image_side() -> u32 {
    64
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            positioner_port: default_positioner_port(),
            capture_port: default_capture_port(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl Default for ScanDefaults {
    fn default() -> Self {
        Self {
            projection_count: default_projection_count(),
            max_angle: default_max_angle(),
            shutter_ms: default_timing_ms(),
            exposure_ms: default_timing_ms(),
            focus_ms: default_timing_ms(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: default_sim_host(),
            move_speed_deg_per_sec: default_move_speed(),
            capture_delay_ms: default_capture_delay_ms(),
            image_width: default_image_side(),
            image_height: default_image_side(),
        }
    }
}

fn resolve(host: &str, port: u16) -> AppResult<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        ScanError::Configuration(format!("Host '{host}' did not resolve to an address"))
    })
}

impl DevicesConfig {
    /// Port configured for `role`.
    pub fn port(&self, role: DeviceRole) -> u16 {
        match role {
            DeviceRole::Positioner => self.positioner_port,
            DeviceRole::Capture => self.capture_port,
        }
    }

    /// Address the link for `role` listens on.
    pub fn bind_addr(&self, role: DeviceRole) -> AppResult<SocketAddr> {
        resolve(&self.bind_host, self.port(role))
    }
}

impl ScanDefaults {
    /// Capture timings.
    pub fn params(&self) -> CaptureParams {
        CaptureParams {
            shutter_ms: self.shutter_ms,
            exposure_ms: self.exposure_ms,
            focus_ms: self.focus_ms,
        }
    }

    /// New scan with these defaults.
    pub fn record(&self) -> ScanRecord {
        ScanRecord::new(self.projection_count, self.max_angle).with_params(self.params())
    }
}

impl SimulatorConfig {
    /// Address the simulated device for `role` connects to.
    pub fn connect_addr(&self, devices: &DevicesConfig, role: DeviceRole) -> AppResult<SocketAddr> {
        resolve(&self.host, devices.port(role))
    }

    /// Capture delay as a duration.
    pub fn capture_delay(&self) -> Duration {
        Duration::from_millis(self.capture_delay_ms)
    }
}

impl Settings {
    /// Load configuration from `config/ct_scan.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CT_SCAN_").split("__"))
            .extract()?;
        settings.validate().map_err(ScanError::Configuration)?;
        Ok(settings)
    }

    /// Effective configuration rendered as TOML, in the layout of the config file
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ScanError::Configuration(format!("Failed to render settings: {e}")))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.devices.positioner_port != 0
            && self.devices.positioner_port == self.devices.capture_port
        {
            return Err(format!(
                "positioner_port and capture_port must differ (both {})",
                self.devices.positioner_port
            ));
        }

        if self.devices.max_payload_bytes == 0 {
            return Err("max_payload_bytes must be greater than 0".to_string());
        }

        if let Err(e) = self.scan.record().validate() {
            return Err(format!("Invalid scan defaults: {e}"));
        }

        let speed = self.simulator.move_speed_deg_per_sec;
        if speed.is_nan() || speed < 0.0 {
            return Err(format!(
                "Invalid move_speed_deg_per_sec {speed}. Must be >= 0"
            ));
        }

        Ok(())
    }
}
