use crate::image_utils::tiling::{parse_tile_file_name, TileId};
use crate::raster::geo_transform::GeoTransform;
use crate::raster::geotiff::{write_geotiff_rows, GeoTiffReader, RasterProfile};
use crate::raster::RasterError;
use log::{info, warn};
use ndarray::Array3;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Tiles are snapped to the mosaic grid when their origin is within this many pixels of it.
const GRID_ALIGNMENT_TOLERANCE: f64 = 1e-3;

/// Errors raised while combining tiles or vector layers.
#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error("no tiles to merge")]
    NoTiles,

    #[error("{path:?} has {found} bands, expected {expected}")]
    BandMismatch {
        path: PathBuf,
        expected: u16,
        found: u16,
    },

    #[error("{path:?} does not share the pixel grid of the first tile")]
    PixelGridMismatch { path: PathBuf },

    #[error("{path:?} has a degenerate transform")]
    DegenerateTransform { path: PathBuf },

    #[error("cannot merge vector layers: {0}")]
    LayerMismatch(String),

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: RasterError,
    },

    #[error("failed to write mosaic {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: RasterError,
    },

    #[error("failed to scan tile directory {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Description of a written mosaic.
#[derive(Clone, Debug, PartialEq)]
pub struct MosaicSummary {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub tiles: usize,
    pub transform: GeoTransform,
}

/// A tile placed on the mosaic pixel grid.
struct Placement {
    path: PathBuf,
    col: i64,
    row: i64,
    width: u32,
    height: u32,
}

/// Finds `tile_{row}_{col}.tif` files directly inside `dir`, ordered by (row, col).
pub fn collect_tile_paths(dir: &Path) -> Result<Vec<PathBuf>, MergeError> {
    let mut tiles: Vec<(TileId, PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|source| MergeError::Scan {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let is_tiff = name.ends_with(".tif") || name.ends_with(".tiff");
        if let Some(id) = parse_tile_file_name(name).filter(|_| is_tiff) {
            tiles.push((id, entry.into_path()));
        }
    }
    tiles.sort();
    Ok(tiles.into_iter().map(|(_, path)| path).collect())
}

/// Merges tile GeoTIFFs into one raster covering the union of their extents.
///
/// All tiles must share band count and pixel grid. Rows are streamed to `output`, keeping only
/// the tiles that overlap the current row in memory. Where tiles overlap, the one later in
/// `tile_paths` wins; pixels no tile covers are 0. The first tile's compression is reused. The mosaic is written under a temporary
/// name and renamed at the end, so a failed merge leaves no partial file at `output`.
pub fn merge_rasters(tile_paths: &[PathBuf], output: &Path) -> Result<MosaicSummary, MergeError> {
    let first_path = tile_paths.first().ok_or(MergeError::NoTiles)?;
    let profiles = tile_paths
        .iter()
        .map(|path| {
            GeoTiffReader::open(path)
                .map(|reader| reader.profile().clone())
                .map_err(|source| MergeError::Read {
                    path: path.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<RasterProfile>, MergeError>>()?;

    let reference = &profiles[0];
    let to_reference_pixels =
        reference
            .transform
            .inverse()
            .ok_or_else(|| MergeError::DegenerateTransform {
                path: first_path.clone(),
            })?;

    let mut placements = Vec::with_capacity(profiles.len());
    for (path, profile) in tile_paths.iter().zip(&profiles) {
        if profile.bands != reference.bands {
            return Err(MergeError::BandMismatch {
                path: path.clone(),
                expected: reference.bands,
                found: profile.bands,
            });
        }
        if !profile.transform.same_pixel_grid(&reference.transform) {
            return Err(MergeError::PixelGridMismatch { path: path.clone() });
        }
        let (x, y) = profile.transform.apply(0.0, 0.0);
        let (col, row) = to_reference_pixels.apply(x, y);
        let (snapped_col, snapped_row) = (col.round(), row.round());
        if (col - snapped_col).abs() > GRID_ALIGNMENT_TOLERANCE
            || (row - snapped_row).abs() > GRID_ALIGNMENT_TOLERANCE
        {
            return Err(MergeError::PixelGridMismatch { path: path.clone() });
        }
        placements.push(Placement {
            path: path.clone(),
            col: snapped_col as i64,
            row: snapped_row as i64,
            width: profile.width,
            height: profile.height,
        });
    }

    let min_col = placements.iter().map(|p| p.col).min().unwrap_or(0);
    let min_row = placements.iter().map(|p| p.row).min().unwrap_or(0);
    let max_col = placements
        .iter()
        .map(|p| p.col + p.width as i64)
        .max()
        .unwrap_or(0);
    let max_row = placements
        .iter()
        .map(|p| p.row + p.height as i64)
        .max()
        .unwrap_or(0);
    let width = (max_col - min_col) as u32;
    let height = (max_row - min_row) as u32;
    let bands = reference.bands;
    let transform = reference
        .transform
        .for_window(min_col as f64, min_row as f64);
    info!(
        "Merging {} tiles into a {}x{} mosaic at {:?}",
        placements.len(),
        width,
        height,
        output
    );

    // Tiles in the order they start, so the active set can be filled with a single cursor.
    let mut by_start: Vec<usize> = (0..placements.len()).collect();
    by_start.sort_by_key(|&i| placements[i].row);
    let mut next_start = 0;
    let mut active: BTreeMap<usize, Array3<u8>> = BTreeMap::new();

    let partial = output.with_extension("tif.partial");
    let result = write_geotiff_rows(
        &partial,
        width,
        height,
        bands,
        &transform,
        &reference.geo_keys,
        reference.compression,
        |row, buffer| {
            let row = min_row + row as i64;
            active.retain(|&i, _| row < placements[i].row + placements[i].height as i64);
            while next_start < by_start.len() && placements[by_start[next_start]].row <= row {
                let index = by_start[next_start];
                let mut reader = GeoTiffReader::open(&placements[index].path)?;
                active.insert(index, reader.read_all()?);
                next_start += 1;
            }

            buffer.fill(0);
            let bands = bands as usize;
            // Ascending input order, so later tiles overwrite earlier ones.
            for (&index, pixels) in &active {
                let placement = &placements[index];
                let local_row = (row - placement.row) as usize;
                let col_start = (placement.col - min_col) as usize;
                for x in 0..placement.width as usize {
                    let dst = (col_start + x) * bands;
                    for band in 0..bands {
                        buffer[dst + band] = pixels[[band, local_row, x]];
                    }
                }
            }
            Ok(())
        },
    );

    if let Err(source) = result {
        if partial.exists() {
            if let Err(cleanup) = fs::remove_file(&partial) {
                warn!("could not remove partial mosaic {partial:?}: {cleanup}");
            }
        }
        return Err(MergeError::Write {
            path: output.to_path_buf(),
            source,
        });
    }
    fs::rename(&partial, output).map_err(|source| MergeError::Write {
        path: output.to_path_buf(),
        source: source.into(),
    })?;

    Ok(MosaicSummary {
        path: output.to_path_buf(),
        width,
        height,
        bands,
        tiles: placements.len(),
        transform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FailurePolicy;
    use crate::raster::geotiff::{write_geotiff, write_geotiff_compressed, GeoKeys, TiffCompression};
    use crate::raster::tiler::split_tif_to_tif;

    fn source_pixels(width: usize, height: usize) -> Array3<u8> {
        Array3::from_shape_fn((3, height, width), |(b, y, x)| {
            (b * 50 + y * 5 + x * 3) as u8
        })
    }

    fn utm(x: f64, y: f64) -> GeoTransform {
        GeoTransform::new([x, 0.5, 0.0, y, 0.0, -0.5])
    }

    #[test]
    fn tiles_reassemble_into_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("ortho.tif");
        let pixels = source_pixels(19, 13);
        let transform = utm(1000.0, 2000.0);
        write_geotiff(&source, pixels.view(), &transform, &GeoKeys::default()).unwrap();
        let tiles_dir = dir.path().join("tiles");
        split_tif_to_tif(&source, &tiles_dir, FailurePolicy::BestEffort).unwrap();

        let paths = collect_tile_paths(&tiles_dir).unwrap();
        assert_eq!(paths.len(), 25);
        assert!(paths[0].ends_with("tile_0_0.tif"));
        assert!(paths[24].ends_with("tile_4_4.tif"));

        let output = dir.path().join("mosaic.tif");
        let summary = merge_rasters(&paths, &output).unwrap();
        assert_eq!((summary.width, summary.height, summary.bands), (19, 13, 3));
        assert_eq!(summary.transform, transform);
        assert!(!output.with_extension("tif.partial").exists());

        let mut reader = GeoTiffReader::open(&output).unwrap();
        assert_eq!(reader.read_all().unwrap(), pixels);
    }

    #[test]
    fn compressed_tiles_give_a_compressed_mosaic() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("deflate.tif");
        let pixels = source_pixels(11, 9);
        write_geotiff_compressed(
            &source,
            pixels.view(),
            &utm(0.0, 0.0),
            &GeoKeys::default(),
            TiffCompression::Deflate,
        )
        .unwrap();
        let tiles_dir = dir.path().join("tiles");
        split_tif_to_tif(&source, &tiles_dir, FailurePolicy::BestEffort).unwrap();

        let output = dir.path().join("mosaic.tif");
        merge_rasters(&collect_tile_paths(&tiles_dir).unwrap(), &output).unwrap();
        let mut reader = GeoTiffReader::open(&output).unwrap();
        assert_eq!(reader.profile().compression, TiffCompression::Deflate);
        assert_eq!(reader.read_all().unwrap(), pixels);
    }

    #[test]
    fn single_tile_merges() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("pixel.tif");
        let pixels = source_pixels(1, 1);
        write_geotiff(&source, pixels.view(), &utm(0.0, 0.0), &GeoKeys::default()).unwrap();
        let tiles_dir = dir.path().join("tiles");
        let outcome = split_tif_to_tif(&source, &tiles_dir, FailurePolicy::BestEffort).unwrap();
        assert_eq!(outcome.tiles.len(), 1);

        let output = dir.path().join("mosaic.tif");
        let summary = merge_rasters(&collect_tile_paths(&tiles_dir).unwrap(), &output).unwrap();
        assert_eq!((summary.width, summary.height, summary.tiles), (1, 1, 1));
        assert_eq!(GeoTiffReader::open(&output).unwrap().read_all().unwrap(), pixels);
    }

    #[test]
    fn empty_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("mosaic.tif");
        assert!(matches!(merge_rasters(&[], &output), Err(MergeError::NoTiles)));
        assert!(!output.exists());
    }

    #[test]
    fn later_tiles_win_and_gaps_stay_empty() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        let ones = Array3::from_elem((1, 2, 2), 1u8);
        let twos = Array3::from_elem((1, 2, 2), 2u8);
        // b sits one pixel right and two pixels down from a, leaving corners uncovered.
        write_geotiff(&a, ones.view(), &utm(0.0, 0.0), &GeoKeys::default()).unwrap();
        write_geotiff(&b, twos.view(), &utm(0.5, -1.0), &GeoKeys::default()).unwrap();

        let output = dir.path().join("mosaic.tif");
        let summary = merge_rasters(&[a.clone(), b.clone()], &output).unwrap();
        assert_eq!((summary.width, summary.height), (3, 4));
        let merged = GeoTiffReader::open(&output).unwrap().read_all().unwrap();
        let rows: Vec<Vec<u8>> = (0..4)
            .map(|y| (0..3).map(|x| merged[[0, y, x]]).collect())
            .collect();
        assert_eq!(
            rows,
            vec![vec![1, 1, 0], vec![1, 1, 0], vec![0, 2, 2], vec![0, 2, 2]]
        );

        let overlapping = dir.path().join("c.tif");
        write_geotiff(&overlapping, twos.view(), &utm(0.5, 0.0), &GeoKeys::default()).unwrap();
        merge_rasters(&[a, overlapping], &output).unwrap();
        let merged = GeoTiffReader::open(&output).unwrap().read_all().unwrap();
        assert_eq!(merged[[0, 0, 0]], 1);
        assert_eq!(merged[[0, 0, 1]], 2);
    }

    #[test]
    fn mismatched_bands_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rgb = dir.path().join("rgb.tif");
        let grey = dir.path().join("grey.tif");
        write_geotiff(&rgb, source_pixels(2, 2).view(), &utm(0.0, 0.0), &GeoKeys::default())
            .unwrap();
        write_geotiff(
            &grey,
            Array3::<u8>::zeros((1, 2, 2)).view(),
            &utm(1.0, 0.0),
            &GeoKeys::default(),
        )
        .unwrap();
        let output = dir.path().join("mosaic.tif");
        assert!(matches!(
            merge_rasters(&[rgb, grey], &output),
            Err(MergeError::BandMismatch { expected: 3, found: 1, .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn mismatched_pixel_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        let pixels = source_pixels(2, 2);
        write_geotiff(&a, pixels.view(), &utm(0.0, 0.0), &GeoKeys::default()).unwrap();
        write_geotiff(
            &b,
            pixels.view(),
            &GeoTransform::new([1.0, 0.25, 0.0, 0.0, 0.0, -0.25]),
            &GeoKeys::default(),
        )
        .unwrap();
        assert!(matches!(
            merge_rasters(&[a, b], &dir.path().join("mosaic.tif")),
            Err(MergeError::PixelGridMismatch { .. })
        ));
    }
}
