use crate::annotations::bounding_box::BoundingBox;
use crate::annotations::detection::Detection;
use crate::object_detection::detection_adapter::DetectionAdapter;
use crate::object_detection::object_detection_model::{DetectionError, ObjectDetectionModel};
use crate::pipeline::{FailurePolicy, Phase, TileFailure};
use crate::raster::tiler::TileRecord;
use log::{debug, error, info};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, Ordering};

/// Detections of one tile, boxes in tile pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionSet {
    pub tile: TileRecord,
    pub detections: Vec<Detection<BoundingBox>>,
}

/// Result of running detection over every tile: successes and failures, both ordered by tile.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub sets: Vec<DetectionSet>,
    pub failures: Vec<TileFailure>,
}

impl DispatchOutcome {
    /// First failure that was actually attempted, as opposed to cancelled.
    pub fn first_failure(&self) -> Option<&TileFailure> {
        self.failures.iter().find(|f| !f.cancelled)
    }
}

/// Runs the detector over tiles on a fixed-size worker pool.
pub struct TileDispatcher {
    pool: ThreadPool,
    policy: FailurePolicy,
}

impl TileDispatcher {
    pub fn new(num_threads: usize, policy: FailurePolicy) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("tile-worker-{index}"))
            .build()?;
        Ok(TileDispatcher { pool, policy })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Detects objects on every tile and waits for all workers to finish.
    ///
    /// Each worker reads its tile from disk, so at most `num_threads` tiles are decoded at a
    /// time. Under fail-fast, tiles picked up after the first failure are not attempted and are
    /// reported as cancelled.
    pub fn dispatch<M: ObjectDetectionModel>(
        &self,
        adapter: &DetectionAdapter<M>,
        tiles: &[TileRecord],
    ) -> DispatchOutcome {
        info!(
            "Dispatching {} tiles to {} workers",
            tiles.len(),
            self.num_threads()
        );
        let abort = AtomicBool::new(false);
        let results: Vec<Result<DetectionSet, TileFailure>> = self.pool.install(|| {
            tiles
                .par_iter()
                .map(|record| {
                    if abort.load(Ordering::Acquire) {
                        return Err(TileFailure::cancelled(record.id(), Phase::Dispatch));
                    }
                    let detections = record
                        .load()
                        .map_err(DetectionError::from)
                        .and_then(|tile| adapter.detect(&tile));
                    match detections {
                        Ok(detections) => {
                            debug!("{}: {} detections", record.id(), detections.len());
                            Ok(DetectionSet {
                                tile: record.clone(),
                                detections,
                            })
                        }
                        Err(err) => {
                            error!("{}: detection failed: {err}", record.id());
                            if self.policy == FailurePolicy::FailFast {
                                abort.store(true, Ordering::Release);
                            }
                            Err(TileFailure::new(record.id(), Phase::Dispatch, err.to_string()))
                        }
                    }
                })
                .collect()
        });

        let mut outcome = DispatchOutcome::default();
        for result in results {
            match result {
                Ok(set) => outcome.sets.push(set),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome.sets.sort_by_key(|set| set.tile.id());
        outcome.failures.sort_by_key(|failure| failure.tile());
        info!(
            "Detection finished: {} tiles succeeded, {} failed",
            outcome.sets.len(),
            outcome.failures.len()
        );
        outcome
    }
}
