//! Configuration surface for the orchestration engine.
//!
//! Defaults mirror the production deployment: VP8 + Opus routers,
//! 300 kbps initial uplink (1 Mbps for proctors), a 700 kbps
//! proctor-bound layer over a 150 kbps peer layer, four active student
//! streams, and a 5% / 1% loss hysteresis band sampled every 2 s.

use crate::engine::{CodecCapability, WorkerSettings};
use crate::types::MediaKind;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub transport: TransportConfig,
    pub qos: QosConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of media-engine worker processes. 0 means one per CPU core.
    pub count: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            count: 0,
            rtc_min_port: 3100,
            // more ports for more workers
            rtc_max_port: 3200 + (cores as u16).saturating_mul(100),
            log_level: "warn".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Resolved worker count (`0` ⇒ one per core).
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        if self.count == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            self.count
        }
    }

    #[must_use]
    pub fn engine_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            log_level: self.log_level.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub media_codecs: Vec<CodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![
                CodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90_000,
                    channels: None,
                    parameters: json!({ "x-google-start-bitrate": 300 }),
                },
                CodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48_000,
                    channels: Some(2),
                    parameters: json!({ "minptime": 10, "useinbandfec": 1 }),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Initial available outgoing bitrate for student transports (bps).
    pub initial_outgoing_bitrate: u32,
    /// Proctor transports start higher so supervision video ramps fast.
    pub proctor_initial_outgoing_bitrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_outgoing_bitrate: 300_000,
            proctor_initial_outgoing_bitrate: 1_000_000,
        }
    }
}

/// One simulcast layer profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayerProfile {
    pub max_bitrate: u32,
    pub scale_resolution_down_by: u8,
    pub max_framerate: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// High-quality layer, only ever bound for proctors.
    pub proctor_layer: LayerProfile,
    /// Low-quality layer bound for other students.
    pub peer_layer: LayerProfile,
    /// How many student streams stay at elevated quality for student
    /// viewers (the active-speaker ranking capacity).
    pub max_active_student_streams: usize,
    /// Producer audio score above which a member counts as speaking.
    pub audio_activity_threshold: u8,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            proctor_layer: LayerProfile {
                max_bitrate: 700_000,
                scale_resolution_down_by: 1,
                max_framerate: 25,
            },
            peer_layer: LayerProfile {
                max_bitrate: 150_000,
                scale_resolution_down_by: 2,
                max_framerate: 15,
            },
            max_active_student_streams: 4,
            audio_activity_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Stats poll interval in milliseconds.
    pub stats_interval_ms: u64,
    /// Packet loss rate that triggers degradation.
    pub degrade_threshold: f64,
    /// Packet loss rate below which a degraded stream recovers.
    pub recover_threshold: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 2000,
            degrade_threshold: 0.05,
            recover_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" for production, anything else is pretty-printed.
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load from a config file, layering `OMNIVIEW_*` environment
    /// variables on top.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            return Err(ConfigError::NotFound(path.to_string()));
        }
        ConfigBuilder::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("OMNIVIEW").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Load from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigBuilder::builder()
            .add_source(Environment::with_prefix("OMNIVIEW").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Fail fast on misconfigurations. Returns every problem found, not
    /// just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.worker.rtc_min_port >= self.worker.rtc_max_port {
            errors.push(format!(
                "worker.rtc_min_port ({}) must be below worker.rtc_max_port ({})",
                self.worker.rtc_min_port, self.worker.rtc_max_port
            ));
        }
        if self.router.media_codecs.is_empty() {
            errors.push("router.media_codecs must not be empty".to_string());
        }
        if self.qos.max_active_student_streams == 0 {
            errors.push("qos.max_active_student_streams must be at least 1".to_string());
        }
        if self.monitoring.stats_interval_ms == 0 {
            errors.push("monitoring.stats_interval_ms must be positive".to_string());
        }
        if self.monitoring.recover_threshold >= self.monitoring.degrade_threshold {
            errors.push(format!(
                "monitoring.recover_threshold ({}) must be below degrade_threshold ({})",
                self.monitoring.recover_threshold, self.monitoring.degrade_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.monitoring.degrade_threshold) {
            errors.push("monitoring.degrade_threshold must be within [0, 1]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from a config file or environment variables.
///
/// Search order:
/// 1. `OMNIVIEW_CONFIG_PATH` environment variable (explicit path)
/// 2. `./omniview.yaml` (current working directory)
/// 3. Fall back to environment variables only
pub fn load_config() -> Result<Config, ConfigError> {
    let config_path = std::env::var("OMNIVIEW_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "omniview.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        });

    match config_path {
        Some(path) => Config::from_file(&path),
        None => Config::from_env(),
    }
}
