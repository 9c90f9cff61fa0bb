//! GeoTIFF access: windowed reads, georeferenced writes, tiling and mosaicking.

pub mod geo_transform;
pub mod geotiff;
pub mod mosaic;
pub mod tiler;

/// Errors raised while reading or writing raster files.
#[derive(thiserror::Error, Debug)]
pub enum RasterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tiff(#[from] tiff::TiffError),

    #[error("unsupported raster layout: {0}")]
    UnsupportedLayout(String),

    #[error(
        "window {width}x{height}+{col_off}+{row_off} lies outside the {raster_width}x{raster_height} raster"
    )]
    WindowOutOfBounds {
        col_off: u32,
        row_off: u32,
        width: u32,
        height: u32,
        raster_width: u32,
        raster_height: u32,
    },
}
