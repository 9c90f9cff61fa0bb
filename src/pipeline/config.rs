use crate::pipeline::FailurePolicy;
use crate::raster::geotiff::GeoKeys;
use crate::vector::geometry::CoordinateSpace;
use crate::vector::layer::CoordinateReference;
use crate::vector::overlap::OverlapStrategy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Overlap strategy selectable from a config file or the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Union,
    #[value(name = "first_wins")]
    FirstWins,
    #[default]
    Nms,
    Keep,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_num_threads() -> usize {
    4
}

fn default_confidence() -> f32 {
    0.2
}

fn default_iou_threshold() -> f32 {
    0.65
}

fn default_score_threshold() -> f32 {
    0.2
}

fn default_input_size() -> u32 {
    640
}

fn default_true() -> bool {
    true
}

/// Settings of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub classes_path: Option<PathBuf>,
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default)]
    pub class_aware_nms: bool,
    #[serde(default)]
    pub strategy: StrategyKind,
    /// CRS label for the vector outputs. Falls back to the source EPSG code, then EPSG:3857.
    #[serde(default)]
    pub crs: Option<String>,
    #[serde(default)]
    pub coordinate_space: CoordinateSpace,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub skip_mosaic: bool,
    #[serde(default = "default_true")]
    pub keep_tiles: bool,
}

impl PipelineConfig {
    /// Defaults for everything but the source raster.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        PipelineConfig {
            source: source.into(),
            output_dir: default_output_dir(),
            model_path: None,
            classes_path: None,
            input_width: default_input_size(),
            input_height: default_input_size(),
            num_threads: default_num_threads(),
            confidence: default_confidence(),
            iou_threshold: default_iou_threshold(),
            score_threshold: default_score_threshold(),
            class_aware_nms: false,
            strategy: StrategyKind::default(),
            crs: None,
            coordinate_space: CoordinateSpace::default(),
            fail_fast: false,
            skip_mosaic: false,
            keep_tiles: true,
        }
    }

    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.as_os_str().is_empty() {
            return Err(invalid("source", "path is empty"));
        }
        if self.num_threads == 0 {
            return Err(invalid("num_threads", "must be at least 1"));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(invalid("input_width/input_height", "must be positive"));
        }
        for (field, value) in [
            ("confidence", self.confidence),
            ("iou_threshold", self.iou_threshold),
            ("score_threshold", self.score_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{value} is outside [0, 1]")));
            }
        }
        if let Some(crs) = &self.crs {
            if crs.trim().is_empty() {
                return Err(invalid("crs", "label is empty"));
            }
        }
        Ok(())
    }

    pub fn overlap_strategy(&self) -> OverlapStrategy {
        match self.strategy {
            StrategyKind::Union => OverlapStrategy::Union,
            StrategyKind::FirstWins => OverlapStrategy::FirstWins,
            StrategyKind::Nms => OverlapStrategy::Nms {
                score_threshold: self.score_threshold,
                iou_threshold: self.iou_threshold,
                class_aware: self.class_aware_nms,
            },
            StrategyKind::Keep => OverlapStrategy::Keep,
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        if self.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::BestEffort
        }
    }

    /// Configured label, else the EPSG code of the source GeoKeys, else the default label.
    pub fn coordinate_reference(&self, geo_keys: &GeoKeys) -> CoordinateReference {
        match (&self.crs, geo_keys.epsg()) {
            (Some(label), _) => CoordinateReference::new(label.trim()),
            (None, Some(code)) => CoordinateReference::from_epsg(code),
            (None, None) => CoordinateReference::default(),
        }
    }

    pub fn tiles_dir(&self) -> PathBuf {
        self.output_dir.join("tiles")
    }

    pub fn detections_dir(&self) -> PathBuf {
        self.output_dir.join("detections")
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
