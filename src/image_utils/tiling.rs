use itertools::iproduct;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Files up to this size are always split into the base grid.
pub const BASE_GRID_LIMIT_MB: f64 = 500.0;
pub const BASE_GRID_SIZE: u32 = 5;

/// Number of tile rows and columns a source raster is cut into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSpec {
    pub rows: u32,
    pub cols: u32,
}

impl fmt::Display for GridSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Identity of a tile inside the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileId {
    pub row: u32,
    pub col: u32,
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile_{}_{}", self.row, self.col)
    }
}

/// A pixel-space rectangle of the source raster.
///
/// `col_off + width` and `row_off + height` never exceed the source extent, and both extents are
/// strictly positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileWindow {
    pub row: u32,
    pub col: u32,
    pub col_off: u32,
    pub row_off: u32,
    pub width: u32,
    pub height: u32,
}

impl TileWindow {
    /// A window covering a whole `width` x `height` image.
    pub fn full(width: u32, height: u32) -> Self {
        TileWindow {
            row: 0,
            col: 0,
            col_off: 0,
            row_off: 0,
            width,
            height,
        }
    }

    pub fn id(&self) -> TileId {
        TileId {
            row: self.row,
            col: self.col,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Computes the size of the grid from the size of the TIFF file.
///
/// Small files use a 5x5 grid. Above 500 MB both dimensions grow by the same integer factor,
/// ceil(sqrt(size / 500)), which keeps the bytes per tile roughly bounded.
pub fn calculate_grid_size(file_size_mb: f64) -> GridSpec {
    let base = GridSpec {
        rows: BASE_GRID_SIZE,
        cols: BASE_GRID_SIZE,
    };
    if file_size_mb.is_nan() || file_size_mb <= BASE_GRID_LIMIT_MB {
        return base;
    }
    let factor = (file_size_mb / BASE_GRID_LIMIT_MB).sqrt().ceil() as u32;
    GridSpec {
        rows: base.rows * factor,
        cols: base.cols * factor,
    }
}

pub fn bytes_to_megabytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Splits a `width` x `height` raster into the windows of `grid`, row-major.
///
/// Tile size is the ceiling division of the raster by the grid, so the last row/column absorbs
/// the remainder and windows that would start past the raster edge are skipped.
pub fn plan_windows(width: u32, height: u32, grid: GridSpec) -> Vec<TileWindow> {
    if width == 0 || height == 0 || grid.rows == 0 || grid.cols == 0 {
        return Vec::new();
    }
    let tile_width = width.div_ceil(grid.cols);
    let tile_height = height.div_ceil(grid.rows);

    iproduct!(0..grid.rows, 0..grid.cols)
        .filter_map(|(row, col)| {
            let col_off = col as u64 * tile_width as u64;
            let row_off = row as u64 * tile_height as u64;
            if col_off >= width as u64 || row_off >= height as u64 {
                return None;
            }
            let col_off = col_off as u32;
            let row_off = row_off as u32;
            Some(TileWindow {
                row,
                col,
                col_off,
                row_off,
                width: tile_width.min(width - col_off),
                height: tile_height.min(height - row_off),
            })
        })
        .collect()
}

/// Parses `tile_{row}_{col}.<ext>` file names.
pub fn parse_tile_file_name(file_name: &str) -> Option<TileId> {
    let stem = file_name.strip_prefix("tile_")?;
    let stem = stem.split_once('.').map_or(stem, |(stem, _)| stem);
    let (row, col) = stem.split_once('_')?;
    Some(TileId {
        row: row.parse().ok()?,
        col: col.parse().ok()?,
    })
}
