use crate::error::ConfigError;
use crate::frame::PixelFormat;
use crate::sampler::Point;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Synthetic,
    Still,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_preview_max_width")]
    pub preview_max_width: u32,
    #[serde(default = "default_source")]
    pub source: SourceKind,
    pub still_image: Option<PathBuf>,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,
}

fn default_preview_max_width() -> u32 {
    960
}

fn default_source() -> SourceKind {
    SourceKind::Synthetic
}

fn default_pixel_format() -> PixelFormat {
    PixelFormat::Rgb
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub data_root: PathBuf,
    pub record_interval_secs: f64,
    pub image_interval_secs: f64,
    #[serde(default = "default_true")]
    pub save_image: bool,
    #[serde(default = "default_image_format")]
    pub image_format: ImageFormat,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl LoggingConfig {
    pub fn record_interval(&self) -> Duration {
        secs(self.record_interval_secs)
    }

    pub fn image_interval(&self) -> Duration {
        secs(self.image_interval_secs)
    }
}

/// Upper bound for every configured interval and grace period: one week.
pub const MAX_INTERVAL_SECS: f64 = 7.0 * 24.0 * 3600.0;

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_INTERVAL_SECS)).unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_image_format() -> ImageFormat {
    ImageFormat::Jpeg
}

fn default_jpeg_quality() -> u8 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    /// Storage target to watch; falls back to `logging.data_root`.
    pub path: Option<PathBuf>,
    #[serde(default = "default_disk_interval")]
    pub update_interval_secs: f64,
    #[serde(default)]
    pub low_space_warn_bytes: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            path: None,
            update_interval_secs: default_disk_interval(),
            low_space_warn_bytes: 0,
        }
    }
}

impl DiskConfig {
    pub fn update_interval(&self) -> Duration {
        secs(self.update_interval_secs)
    }
}

fn default_disk_interval() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub removable_root: PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: f64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            removable_root: PathBuf::from("/media/usb"),
            namespace: default_namespace(),
            shutdown_grace_secs: default_grace(),
        }
    }
}

impl ExportConfig {
    pub fn shutdown_grace(&self) -> Duration {
        secs(self.shutdown_grace_secs)
    }
}

fn default_namespace() -> String {
    "rgb-point-logger".to_string()
}

fn default_grace() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_frame_errors")]
    pub max_consecutive_frame_errors: u32,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
    pub points: Vec<Point>,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

fn default_tick_ms() -> u64 {
    30
}

fn default_max_frame_errors() -> u32 {
    50
}

impl AppConfig {
    pub fn load_default() -> Result<Self, ConfigError> {
        let default = include_str!("../config/default.toml");
        Self::from_toml(default)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let p = path.into();
        let s = fs::read_to_string(&p).map_err(|source| ConfigError::Read {
            path: p.clone(),
            source,
        })?;
        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be positive".into());
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture resolution must be non-zero".into());
        }
        for (name, value) in [
            ("logging.record_interval_secs", self.logging.record_interval_secs),
            ("logging.image_interval_secs", self.logging.image_interval_secs),
            ("disk.update_interval_secs", self.disk.update_interval_secs),
        ] {
            if !(value > 0.0 && value <= MAX_INTERVAL_SECS) {
                return invalid(format!(
                    "{} must be in (0, {}] seconds, got {}",
                    name, MAX_INTERVAL_SECS, value
                ));
            }
        }
        let grace = self.export.shutdown_grace_secs;
        if !(0.0..=MAX_INTERVAL_SECS).contains(&grace) {
            return invalid(format!(
                "export.shutdown_grace_secs must be in [0, {}], got {}",
                MAX_INTERVAL_SECS, grace
            ));
        }
        if !(1..=100).contains(&self.logging.jpeg_quality) {
            return invalid(format!(
                "logging.jpeg_quality must be 1..=100, got {}",
                self.logging.jpeg_quality
            ));
        }
        if self.capture.source == SourceKind::Still && self.capture.still_image.is_none() {
            return invalid(
                "capture.still_image is required when capture.source = \"still\"".into(),
            );
        }
        if self.points.is_empty() {
            return invalid("at least one point must be configured".into());
        }
        let mut seen = HashSet::new();
        for p in &self.points {
            if p.id.trim().is_empty() {
                return invalid("point ids must not be empty".into());
            }
            if !seen.insert(p.id.as_str()) {
                return invalid(format!("duplicate point id {:?}", p.id));
            }
        }
        Ok(())
    }

    pub fn disk_path(&self) -> PathBuf {
        self.disk.path.clone().unwrap_or_else(|| self.logging.data_root.clone())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
