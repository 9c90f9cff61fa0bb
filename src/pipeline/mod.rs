//! End-to-end orchestration: tiling, parallel detection, overlap resolution and merging.

pub mod config;
pub mod dispatcher;
pub mod run;

use crate::image_utils::tiling::TileId;
use crate::raster::mosaic::MergeError;
use crate::raster::tiler::TilingError;
use config::ConfigError;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// What happens to the rest of the run once one tile fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Attempt every tile and report the failures at the end.
    #[default]
    BestEffort,
    /// Stop at the first failure; tiles not yet started are reported as cancelled.
    FailFast,
}

/// Stage of the pipeline a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Tiling,
    Dispatch,
    Merge,
    Output,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Tiling => "tiling",
            Phase::Dispatch => "dispatch",
            Phase::Merge => "merge",
            Phase::Output => "output",
        };
        f.write_str(name)
    }
}

/// A tile that produced no result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TileFailure {
    pub row: u32,
    pub col: u32,
    pub phase: Phase,
    /// True when the tile was never attempted because a fail-fast run was already aborting.
    pub cancelled: bool,
    pub message: String,
}

impl TileFailure {
    pub fn new(tile: TileId, phase: Phase, message: impl Into<String>) -> Self {
        TileFailure {
            row: tile.row,
            col: tile.col,
            phase,
            cancelled: false,
            message: message.into(),
        }
    }

    pub fn cancelled(tile: TileId, phase: Phase) -> Self {
        TileFailure {
            cancelled: true,
            ..TileFailure::new(tile, phase, "cancelled after an earlier failure")
        }
    }

    pub fn tile(&self) -> TileId {
        TileId {
            row: self.row,
            col: self.col,
        }
    }
}

/// A run-level error that stopped the pipeline after detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FatalFailure {
    pub phase: Phase,
    pub message: String,
}

/// Per-tile failures of one run, written next to the outputs.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FailureReport {
    pub tiles_planned: usize,
    pub tiles_detected: usize,
    pub failures: Vec<TileFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FatalFailure>,
}

impl FailureReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.fatal.is_none()
    }

    /// Records `err` as the reason the run stopped.
    pub fn record_fatal(&mut self, err: &PipelineError) {
        self.fatal = Some(FatalFailure {
            phase: err.phase(),
            message: err.to_string(),
        });
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
    }
}

/// Fatal errors of a pipeline run, tagged by the phase that raised them.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("tiling failed: {0}")]
    Tiling(#[from] TilingError),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("dispatch aborted at tile ({}, {}): {}", .failure.row, .failure.col, .failure.message)]
    TileAborted {
        failure: TileFailure,
        report: FailureReport,
    },

    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("failed to write {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn phase(&self) -> Phase {
        match self {
            PipelineError::Config(_) | PipelineError::Tiling(_) => Phase::Tiling,
            PipelineError::WorkerPool(_) | PipelineError::TileAborted { .. } => Phase::Dispatch,
            PipelineError::Merge(_) => Phase::Merge,
            PipelineError::Output { .. } => Phase::Output,
        }
    }
}
