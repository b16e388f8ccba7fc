use config::{Config, ConfigError, Environment, File};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::prior::{AxisConfig, ProScanBuilder, SerialSettings};
use crate::scheduler::SchedulerOptions;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub stage: StageConfig,
    pub camera: CameraConfig,
    pub acquisition: AcquisitionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StageConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub move_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Consecutive idle status reads that end a move.
    pub settle_reads: u32,
    pub ack: String,
    pub joystick_interlock: bool,
    /// Micro-Manager Z (µm) to controller steps.
    pub z_scale: f64,
    pub axes: Vec<AxisConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AcquisitionConfig {
    pub max_trigger_retries: u32,
    pub status_interval_s: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write `acquisition_log.log` into the data folder.
    pub log_to_file: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: "COM8".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            move_timeout_ms: 5000,
            poll_interval_ms: 100,
            settle_reads: 3,
            ack: "0".to_string(),
            joystick_interlock: true,
            z_scale: 10.0,
            axes: vec![AxisConfig::h117ex(), AxisConfig::fb203e()],
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_trigger_retries: 3,
            status_interval_s: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: true,
        }
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stage = &self.stage;
        if stage.port.trim().is_empty() {
            return Err(ConfigError::Message("stage.port is empty".to_string()));
        }
        if stage.baud_rate == 0 {
            return Err(ConfigError::Message("stage.baud_rate must be positive".to_string()));
        }
        if stage.read_timeout_ms == 0 || stage.move_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "stage timeouts must be positive".to_string(),
            ));
        }
        if stage.poll_interval_ms == 0 || stage.poll_interval_ms > stage.move_timeout_ms {
            return Err(ConfigError::Message(format!(
                "stage.poll_interval_ms must be in 1..={}",
                stage.move_timeout_ms
            )));
        }
        if stage.settle_reads == 0 {
            return Err(ConfigError::Message("stage.settle_reads must be at least 1".to_string()));
        }
        if stage.ack.trim().is_empty() {
            return Err(ConfigError::Message("stage.ack is empty".to_string()));
        }
        if !stage.z_scale.is_finite() || stage.z_scale <= 0.0 {
            return Err(ConfigError::Message(format!(
                "stage.z_scale must be positive, got {}",
                stage.z_scale
            )));
        }
        for axis in &stage.axes {
            axis.validate()
                .map_err(|e| ConfigError::Message(format!("Invalid axis {}: {}", axis.name, e)))?;
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Message("camera frame size must be positive".to_string()));
        }
        if self.logging.level.parse::<LevelFilter>().is_err() {
            return Err(ConfigError::Message(format!(
                "Unknown log level '{}'",
                self.logging.level
            )));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.stage.port.clone(),
            baud_rate: self.stage.baud_rate,
            read_timeout: Duration::from_millis(self.stage.read_timeout_ms),
        }
    }

    pub fn controller_builder(&self, clock: Arc<dyn Clock>) -> ProScanBuilder {
        ProScanBuilder::default()
            .ack(&self.stage.ack)
            .move_timeout(Duration::from_millis(self.stage.move_timeout_ms))
            .poll_interval(Duration::from_millis(self.stage.poll_interval_ms))
            .settle_reads(self.stage.settle_reads)
            .clock(clock)
            .axes(self.stage.axes.iter().cloned())
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            max_trigger_retries: self.acquisition.max_trigger_retries,
            joystick_interlock: self.stage.joystick_interlock,
            status_interval: Duration::from_secs(self.acquisition.status_interval_s),
            ..SchedulerOptions::default()
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else if Path::new("timelapse.toml").exists() {
        builder = builder.add_source(File::with_name("timelapse.toml"));
    }

    // e.g. TIMELAPSE__STAGE__PORT=/dev/ttyUSB0
    builder = builder.add_source(
        Environment::with_prefix("TIMELAPSE")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
