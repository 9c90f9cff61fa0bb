use crate::image_utils::tiling::{
    bytes_to_megabytes, calculate_grid_size, plan_windows, GridSpec, TileId, TileWindow,
};
use crate::pipeline::FailurePolicy;
use crate::raster::geo_transform::GeoTransform;
use crate::raster::geotiff::{write_geotiff_compressed, GeoTiffReader};
use crate::raster::RasterError;
use log::{error, info};
use ndarray::Array3;
use std::fs;
use std::path::{Path, PathBuf};

/// Errors raised while cutting the source raster into tiles.
#[derive(thiserror::Error, Debug)]
pub enum TilingError {
    #[error("failed to read source raster {path:?}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: RasterError,
    },

    #[error("failed to create tile directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write tile ({}, {}) to {path:?}: {source}", .tile.row, .tile.col)]
    TileWrite {
        tile: TileId,
        path: PathBuf,
        #[source]
        source: RasterError,
    },
}

/// A tile held in memory: band-major pixels plus its place in the source raster.
#[derive(Clone, Debug, PartialEq)]
pub struct Tile {
    pub window: TileWindow,
    pub transform: GeoTransform,
    pub pixels: Array3<u8>,
}

impl Tile {
    pub fn id(&self) -> TileId {
        self.window.id()
    }

    pub fn bands(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn height(&self) -> u32 {
        self.pixels.dim().1 as u32
    }

    pub fn width(&self) -> u32 {
        self.pixels.dim().2 as u32
    }
}

/// A tile persisted on disk, identified by its window in the source raster.
#[derive(Clone, Debug, PartialEq)]
pub struct TileRecord {
    pub window: TileWindow,
    pub transform: GeoTransform,
    pub path: PathBuf,
}

impl TileRecord {
    pub fn id(&self) -> TileId {
        self.window.id()
    }

    /// Reads the tile file back, keeping the window it was cut from.
    pub fn load(&self) -> Result<Tile, RasterError> {
        let mut reader = GeoTiffReader::open(&self.path)?;
        let pixels = reader.read_all()?;
        Ok(Tile {
            window: self.window,
            transform: reader.profile().transform,
            pixels,
        })
    }
}

/// Tiles written plus per-tile write failures.
#[derive(Debug)]
pub struct TilingOutcome {
    pub grid: GridSpec,
    pub tiles: Vec<TileRecord>,
    pub failures: Vec<TilingError>,
}

pub fn tile_file_name(tile: TileId) -> String {
    format!("{tile}.tif")
}

/// Reads one window of the source and derives its transform.
pub fn read_tile(reader: &mut GeoTiffReader, window: &TileWindow) -> Result<Tile, RasterError> {
    let pixels = reader.read_window(window)?;
    let transform = reader
        .profile()
        .transform
        .for_window(window.col_off as f64, window.row_off as f64);
    Ok(Tile {
        window: *window,
        transform,
        pixels,
    })
}

/// Cuts the raster behind `reader` into `grid` and writes `tile_{row}_{col}.tif` files.
///
/// Source read failures abort the whole run. A tile that cannot be written is recorded and
/// skipped, unless `policy` is fail-fast, in which case the first one is returned as the error.
pub fn tile_raster(
    reader: &mut GeoTiffReader,
    output_dir: &Path,
    grid: GridSpec,
    policy: FailurePolicy,
) -> Result<TilingOutcome, TilingError> {
    fs::create_dir_all(output_dir).map_err(|source| TilingError::OutputDir {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let profile = reader.profile().clone();
    let windows = plan_windows(profile.width, profile.height, grid);
    info!(
        "Splitting {:?} ({}x{}, {} bands) into a {} grid: {} tiles",
        reader.path(),
        profile.width,
        profile.height,
        profile.bands,
        grid,
        windows.len()
    );

    let mut outcome = TilingOutcome {
        grid,
        tiles: Vec::with_capacity(windows.len()),
        failures: Vec::new(),
    };
    for window in &windows {
        let tile = read_tile(reader, window).map_err(|source| TilingError::SourceRead {
            path: reader.path().to_path_buf(),
            source,
        })?;
        let path = output_dir.join(tile_file_name(window.id()));
        match write_geotiff_compressed(
            &path,
            tile.pixels.view(),
            &tile.transform,
            &profile.geo_keys,
            profile.compression,
        ) {
            Ok(()) => {
                info!("Saved tile: {path:?}");
                outcome.tiles.push(TileRecord {
                    window: *window,
                    transform: tile.transform,
                    path,
                });
            }
            Err(source) => {
                let failure = TilingError::TileWrite {
                    tile: window.id(),
                    path,
                    source,
                };
                if policy == FailurePolicy::FailFast {
                    return Err(failure);
                }
                error!("{failure}");
                outcome.failures.push(failure);
            }
        }
    }
    Ok(outcome)
}

/// Opens `source_path`, sizes the grid from the file size and tiles it into `output_dir`.
pub fn split_tif_to_tif(
    source_path: &Path,
    output_dir: &Path,
    policy: FailurePolicy,
) -> Result<TilingOutcome, TilingError> {
    let mut reader = GeoTiffReader::open(source_path).map_err(|source| TilingError::SourceRead {
        path: source_path.to_path_buf(),
        source,
    })?;
    let file_size_mb = bytes_to_megabytes(reader.byte_size());
    let grid = calculate_grid_size(file_size_mb);
    info!("{source_path:?} is {file_size_mb:.2} MB, using a {grid} grid");
    tile_raster(&mut reader, output_dir, grid, policy)
}
