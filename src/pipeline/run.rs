use crate::image_utils::tiling::{bytes_to_megabytes, calculate_grid_size, GridSpec};
use crate::object_detection::detection_adapter::DetectionAdapter;
use crate::object_detection::object_detection_model::ObjectDetectionModel;
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::dispatcher::{DispatchOutcome, TileDispatcher};
use crate::pipeline::{FailurePolicy, FailureReport, Phase, PipelineError, TileFailure};
use crate::raster::geotiff::GeoTiffReader;
use crate::raster::mosaic::{merge_rasters, MosaicSummary};
use crate::raster::tiler::{tile_raster, TileRecord, TilingError};
use crate::vector::geometry::{CoordinateSpace, GeometryBuilder};
use crate::vector::layer::{merge_layers, CoordinateReference, VectorLayer};
use crate::vector::overlap::{resolve, OverlapStrategy};
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MOSAIC_FILE_NAME: &str = "mosaic.tif";
pub const DETECTIONS_FILE_NAME: &str = "detections.geojson";
pub const REPORT_FILE_NAME: &str = "report.json";

/// Everything a successful run produced.
#[derive(Debug)]
pub struct PipelineOutput {
    pub grid: GridSpec,
    pub tiles: Vec<TileRecord>,
    /// Merged layer after overlap resolution.
    pub detections: VectorLayer,
    pub detections_path: PathBuf,
    pub mosaic: Option<MosaicSummary>,
    pub report: FailureReport,
    pub report_path: PathBuf,
}

fn output_error(path: &Path) -> impl FnOnce(io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Output {
        path: path.to_path_buf(),
        source,
    }
}

struct RunOutputs {
    detections: VectorLayer,
    detections_path: PathBuf,
    mosaic: Option<MosaicSummary>,
}

/// Resolves the detections and merges the mosaic, then writes the vector outputs.
///
/// Vector files are only written once the mosaic succeeded, so a fatal merge leaves no
/// detection layers behind.
fn write_outputs(
    config: &PipelineConfig,
    crs: CoordinateReference,
    dispatch: &DispatchOutcome,
    tiles: &[TileRecord],
) -> Result<RunOutputs, PipelineError> {
    let strategy = config.overlap_strategy();
    if config.coordinate_space == CoordinateSpace::TilePixel && strategy != OverlapStrategy::Keep {
        warn!("Tile pixel coordinates of different tiles are not comparable; overlaps between tiles are meaningless");
    }
    let builder = GeometryBuilder::new(config.coordinate_space, crs.clone());
    let layers: Vec<VectorLayer> = dispatch.sets.iter().map(|set| builder.build(set)).collect();
    let merged = if layers.is_empty() {
        warn!("No tile produced detections output");
        VectorLayer::new(crs, config.coordinate_space)
    } else {
        merge_layers(layers.clone())?
    };
    let detections = resolve(merged, &strategy);

    let mosaic = if config.skip_mosaic {
        None
    } else {
        let tile_paths: Vec<PathBuf> = tiles.iter().map(|t| t.path.clone()).collect();
        Some(merge_rasters(
            &tile_paths,
            &config.output_dir.join(MOSAIC_FILE_NAME),
        )?)
    };

    let detections_dir = config.detections_dir();
    fs::create_dir_all(&detections_dir).map_err(output_error(&detections_dir))?;
    for (set, layer) in dispatch.sets.iter().zip(&layers) {
        let path = detections_dir.join(format!("{}.geojson", set.tile.id()));
        layer.write_geojson(&path).map_err(output_error(&path))?;
    }
    let detections_path = config.output_dir.join(DETECTIONS_FILE_NAME);
    detections
        .write_geojson(&detections_path)
        .map_err(output_error(&detections_path))?;
    info!(
        "Wrote {} detections to {detections_path:?}",
        detections.len()
    );

    if !config.keep_tiles {
        let tiles_dir = config.tiles_dir();
        fs::remove_dir_all(&tiles_dir).map_err(output_error(&tiles_dir))?;
        info!("Removed tile directory {tiles_dir:?}");
    }

    Ok(RunOutputs {
        detections,
        detections_path,
        mosaic,
    })
}

/// Tiles the source, detects on every tile, then merges and resolves the results.
///
/// The model is loaded once by the caller and shared by every worker.
pub fn run_pipeline<M: ObjectDetectionModel>(
    config: &PipelineConfig,
    model: &M,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    let policy = config.failure_policy();
    fs::create_dir_all(&config.output_dir).map_err(output_error(&config.output_dir))?;

    let mut reader = GeoTiffReader::open(&config.source).map_err(|source| TilingError::SourceRead {
        path: config.source.clone(),
        source,
    })?;
    let crs = config.coordinate_reference(&reader.profile().geo_keys);
    let file_size_mb = bytes_to_megabytes(reader.byte_size());
    let grid = calculate_grid_size(file_size_mb);
    info!(
        "{:?} is {file_size_mb:.2} MB, using a {grid} grid; vectors labelled {crs}",
        config.source
    );
    let tiling = tile_raster(&mut reader, &config.tiles_dir(), grid, policy)?;
    drop(reader);

    let mut report = FailureReport {
        tiles_planned: tiling.tiles.len() + tiling.failures.len(),
        ..FailureReport::default()
    };
    report
        .failures
        .extend(tiling.failures.iter().filter_map(|failure| match failure {
            TilingError::TileWrite { tile, .. } => {
                Some(TileFailure::new(*tile, Phase::Tiling, failure.to_string()))
            }
            _ => None,
        }));

    let dispatcher = TileDispatcher::new(config.num_threads, policy)?;
    let adapter = DetectionAdapter::new(model, config.confidence);
    let dispatch = dispatcher.dispatch(&adapter, &tiling.tiles);
    report.tiles_detected = dispatch.sets.len();
    report.failures.extend(dispatch.failures.iter().cloned());
    let report_path = config.output_dir.join(REPORT_FILE_NAME);
    if policy == FailurePolicy::FailFast {
        if let Some(failure) = dispatch.first_failure().cloned() {
            if let Err(err) = report.write_json(&report_path) {
                warn!("Could not write failure report {report_path:?}: {err}");
            }
            return Err(PipelineError::TileAborted { failure, report });
        }
    }

    let outputs = match write_outputs(config, crs, &dispatch, &tiling.tiles) {
        Ok(outputs) => outputs,
        Err(err) => {
            report.record_fatal(&err);
            if let Err(write_err) = report.write_json(&report_path) {
                warn!("Could not write failure report {report_path:?}: {write_err}");
            }
            return Err(err);
        }
    };

    report
        .write_json(&report_path)
        .map_err(output_error(&report_path))?;
    if !report.is_clean() {
        warn!(
            "{} tiles failed, see {report_path:?}",
            report.failures.len()
        );
    }

    Ok(PipelineOutput {
        grid: tiling.grid,
        tiles: tiling.tiles,
        detections: outputs.detections,
        detections_path: outputs.detections_path,
        mosaic: outputs.mosaic,
        report,
        report_path,
    })
}
