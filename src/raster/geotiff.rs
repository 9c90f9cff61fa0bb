use crate::image_utils::tiling::TileWindow;
use crate::raster::geo_transform::{GeoTiffTransformTags, GeoTransform};
use crate::raster::RasterError;
use log::warn;
use ndarray::{Array3, ArrayView3};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::compression::{Compression, Deflate, Lzw, Packbits, Uncompressed};
use tiff::encoder::{colortype, DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::{CompressionMethod, Tag};
use tiff::ColorType;

const MODEL_PIXEL_SCALE_TAG: u16 = 33550;
const MODEL_TIEPOINT_TAG: u16 = 33922;
const MODEL_TRANSFORMATION_TAG: u16 = 34264;
const GEO_KEY_DIRECTORY_TAG: u16 = 34735;
const GEO_DOUBLE_PARAMS_TAG: u16 = 34736;
const GEO_ASCII_PARAMS_TAG: u16 = 34737;

const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const USER_DEFINED_GEO_KEY_VALUE: u16 = 32767;

/// Largest output, in bytes, held in memory so it can be compressed. Bigger rasters are
/// streamed row by row and written uncompressed.
const BUFFERED_COMPRESSION_LIMIT: usize = 1 << 30;

fn geotiff_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// The GeoKey tags of a GeoTIFF, carried through unchanged so tiles and mosaics keep the
/// source's coordinate reference system.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GeoKeys {
    pub directory: Option<Vec<u16>>,
    pub double_params: Option<Vec<f64>>,
    pub ascii_params: Option<String>,
}

impl GeoKeys {
    /// EPSG code of the projected (preferred) or geographic CRS, if declared inline.
    pub fn epsg(&self) -> Option<u16> {
        let directory = self.directory.as_ref()?;
        let key_count = *directory.get(3)? as usize;
        let entries: Vec<&[u16]> = directory
            .get(4..)?
            .chunks_exact(4)
            .take(key_count)
            .collect();
        let lookup = |wanted: u16| {
            entries
                .iter()
                .find(|entry| entry[0] == wanted && entry[1] == 0)
                .map(|entry| entry[3])
                .filter(|&value| value != 0 && value != USER_DEFINED_GEO_KEY_VALUE)
        };
        lookup(PROJECTED_CS_TYPE_GEO_KEY).or_else(|| lookup(GEOGRAPHIC_TYPE_GEO_KEY))
    }
}

/// Compression of the pixel data, carried from a source into its tiles and mosaic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TiffCompression {
    #[default]
    None,
    Lzw,
    Deflate,
    Packbits,
}

impl TiffCompression {
    /// Maps a decoded compression tag to one the encoder can write; JPEG and other lossy or
    /// exotic methods fall back to Deflate.
    pub fn from_method(method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => TiffCompression::None,
            CompressionMethod::LZW => TiffCompression::Lzw,
            CompressionMethod::Deflate | CompressionMethod::OldDeflate => TiffCompression::Deflate,
            CompressionMethod::PackBits => TiffCompression::Packbits,
            other => {
                warn!("{other:?} compression cannot be written, using Deflate instead");
                TiffCompression::Deflate
            }
        }
    }

    pub fn method(self) -> CompressionMethod {
        match self {
            TiffCompression::None => CompressionMethod::None,
            TiffCompression::Lzw => CompressionMethod::LZW,
            TiffCompression::Deflate => CompressionMethod::Deflate,
            TiffCompression::Packbits => CompressionMethod::PackBits,
        }
    }
}

/// Everything needed to describe a raster without its pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterProfile {
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub transform: GeoTransform,
    pub georeferenced: bool,
    pub geo_keys: GeoKeys,
    pub compression: TiffCompression,
}

/// A GeoTIFF opened for windowed reads.
///
/// Only the strips or tiles intersecting a requested window are decoded, so rasters far larger
/// than memory can be cut up.
pub struct GeoTiffReader {
    path: PathBuf,
    decoder: Decoder<BufReader<File>>,
    profile: RasterProfile,
    byte_size: u64,
}

impl GeoTiffReader {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path)?;
        let byte_size = file.metadata()?.len();
        let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());
        let (width, height) = decoder.dimensions()?;
        let bands = match decoder.colortype()? {
            ColorType::Gray(8) => 1,
            ColorType::RGB(8) => 3,
            ColorType::RGBA(8) => 4,
            other => {
                return Err(RasterError::UnsupportedLayout(format!(
                    "color type {other:?}; only 8-bit gray, RGB or RGBA rasters are supported, \
                     16-bit and floating point sources must be converted to 8 bits first"
                )));
            }
        };
        let compression = decoder
            .find_tag_unsigned::<u16>(Tag::Compression)?
            .map(|code| TiffCompression::from_method(CompressionMethod::from_u16_exhaustive(code)))
            .unwrap_or_default();
        if let Some(planar) = decoder.find_tag(Tag::PlanarConfiguration)? {
            if planar.into_u16()? != 1 {
                return Err(RasterError::UnsupportedLayout(
                    "planar sample layout".to_string(),
                ));
            }
        }

        let pixel_scale = find_f64_vec(&mut decoder, MODEL_PIXEL_SCALE_TAG)?;
        let tiepoint = find_f64_vec(&mut decoder, MODEL_TIEPOINT_TAG)?;
        let transformation = find_f64_vec(&mut decoder, MODEL_TRANSFORMATION_TAG)?;
        let transform = GeoTransform::from_geotiff_tags(
            pixel_scale.as_deref(),
            tiepoint.as_deref(),
            transformation.as_deref(),
        );
        if transform.is_none() {
            warn!("{path:?} carries no georeferencing tags, using pixel coordinates");
        }

        let geo_keys = GeoKeys {
            directory: decoder
                .find_tag(geotiff_tag(GEO_KEY_DIRECTORY_TAG))?
                .map(|value| value.into_u16_vec())
                .transpose()?,
            double_params: find_f64_vec(&mut decoder, GEO_DOUBLE_PARAMS_TAG)?,
            ascii_params: decoder
                .find_tag(geotiff_tag(GEO_ASCII_PARAMS_TAG))?
                .map(|value| value.into_string())
                .transpose()?,
        };

        Ok(GeoTiffReader {
            path: path.to_path_buf(),
            decoder,
            profile: RasterProfile {
                width,
                height,
                bands,
                transform: transform.unwrap_or_default(),
                georeferenced: transform.is_some(),
                geo_keys,
                compression,
            },
            byte_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn profile(&self) -> &RasterProfile {
        &self.profile
    }

    /// Size of the file on disk in bytes.
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn read_window(&mut self, window: &TileWindow) -> Result<Array3<u8>, RasterError> {
        self.read_region(window.col_off, window.row_off, window.width, window.height)
    }

    pub fn read_all(&mut self) -> Result<Array3<u8>, RasterError> {
        self.read_region(0, 0, self.profile.width, self.profile.height)
    }

    /// Reads a (bands, height, width) block starting at pixel (col_off, row_off).
    pub fn read_region(
        &mut self,
        col_off: u32,
        row_off: u32,
        width: u32,
        height: u32,
    ) -> Result<Array3<u8>, RasterError> {
        let RasterProfile {
            width: raster_width,
            height: raster_height,
            bands,
            ..
        } = self.profile;
        if width == 0
            || height == 0
            || col_off as u64 + width as u64 > raster_width as u64
            || row_off as u64 + height as u64 > raster_height as u64
        {
            return Err(RasterError::WindowOutOfBounds {
                col_off,
                row_off,
                width,
                height,
                raster_width,
                raster_height,
            });
        }

        let bands = bands as usize;
        let mut pixels = Array3::<u8>::zeros((bands, height as usize, width as usize));
        let (chunk_width, chunk_height) = self.decoder.chunk_dimensions();
        let chunks_across = raster_width.div_ceil(chunk_width);
        let (col_end, row_end) = (col_off + width, row_off + height);

        for chunk_row in row_off / chunk_height..=(row_end - 1) / chunk_height {
            for chunk_col in col_off / chunk_width..=(col_end - 1) / chunk_width {
                let chunk_index = chunk_row * chunks_across + chunk_col;
                let (data_width, data_height) = self.decoder.chunk_data_dimensions(chunk_index);
                let data = match self.decoder.read_chunk(chunk_index)? {
                    DecodingResult::U8(data) => data,
                    _ => {
                        return Err(RasterError::UnsupportedLayout(
                            "non 8-bit sample data".to_string(),
                        ));
                    }
                };
                let (x0, y0) = (chunk_col * chunk_width, chunk_row * chunk_height);
                let xs = x0.max(col_off)..(x0 + data_width).min(col_end);
                for y in y0.max(row_off)..(y0 + data_height).min(row_end) {
                    for x in xs.clone() {
                        let src = ((y - y0) as usize * data_width as usize + (x - x0) as usize)
                            * bands;
                        for band in 0..bands {
                            pixels[[band, (y - row_off) as usize, (x - col_off) as usize]] =
                                data[src + band];
                        }
                    }
                }
            }
        }
        Ok(pixels)
    }
}

fn find_f64_vec(
    decoder: &mut Decoder<BufReader<File>>,
    code: u16,
) -> Result<Option<Vec<f64>>, RasterError> {
    Ok(decoder
        .find_tag(geotiff_tag(code))?
        .map(|value| value.into_f64_vec())
        .transpose()?)
}

/// Writes a (bands, height, width) buffer as an uncompressed georeferenced TIFF.
pub fn write_geotiff(
    path: &Path,
    pixels: ArrayView3<u8>,
    transform: &GeoTransform,
    geo_keys: &GeoKeys,
) -> Result<(), RasterError> {
    write_geotiff_compressed(path, pixels, transform, geo_keys, TiffCompression::None)
}

/// Writes a (bands, height, width) buffer as a georeferenced TIFF with the given compression.
pub fn write_geotiff_compressed(
    path: &Path,
    pixels: ArrayView3<u8>,
    transform: &GeoTransform,
    geo_keys: &GeoKeys,
    compression: TiffCompression,
) -> Result<(), RasterError> {
    let (bands, height, width) = pixels.dim();
    write_geotiff_rows(
        path,
        width as u32,
        height as u32,
        bands as u16,
        transform,
        geo_keys,
        compression,
        |row, buffer| {
            let row = pixels.index_axis(ndarray::Axis(1), row as usize);
            for ((band, col), value) in row.indexed_iter() {
                buffer[col * bands + band] = *value;
            }
            Ok(())
        },
    )
}

fn unsupported_bands(bands: u16) -> RasterError {
    RasterError::UnsupportedLayout(format!("{bands} bands, expected 1, 3 or 4"))
}

/// Writes a georeferenced TIFF one row at a time.
///
/// `fill_row` receives the row index and an interleaved `width * bands` buffer to fill; rows are
/// requested top to bottom, each exactly once. Uncompressed output is streamed one row per strip.
/// Compressed output is assembled in memory first, since the encoder only compresses whole
/// images; past `BUFFERED_COMPRESSION_LIMIT` bytes it is streamed uncompressed instead.
#[allow(clippy::too_many_arguments)]
pub fn write_geotiff_rows<F>(
    path: &Path,
    width: u32,
    height: u32,
    bands: u16,
    transform: &GeoTransform,
    geo_keys: &GeoKeys,
    compression: TiffCompression,
    mut fill_row: F,
) -> Result<(), RasterError>
where
    F: FnMut(u32, &mut [u8]) -> Result<(), RasterError>,
{
    if !matches!(bands, 1 | 3 | 4) {
        return Err(unsupported_bands(bands));
    }
    let row_len = width as usize * bands as usize;
    let total = row_len * height as usize;
    let compression = if compression != TiffCompression::None && total > BUFFERED_COMPRESSION_LIMIT
    {
        warn!("{path:?} is too large to compress in memory ({total} bytes), writing it uncompressed");
        TiffCompression::None
    } else {
        compression
    };

    if compression == TiffCompression::None {
        let writer = BufWriter::new(File::create(path)?);
        return match bands {
            1 => write_rows_as::<colortype::Gray8, _, _>(
                writer, width, height, transform, geo_keys, fill_row,
            ),
            3 => write_rows_as::<colortype::RGB8, _, _>(
                writer, width, height, transform, geo_keys, fill_row,
            ),
            4 => write_rows_as::<colortype::RGBA8, _, _>(
                writer, width, height, transform, geo_keys, fill_row,
            ),
            other => Err(unsupported_bands(other)),
        };
    }

    let mut data = vec![0u8; total];
    if row_len > 0 {
        for (row, buffer) in data.chunks_exact_mut(row_len).enumerate() {
            fill_row(row as u32, buffer)?;
        }
    }
    let writer = BufWriter::new(File::create(path)?);
    let image = ImageParts {
        width,
        height,
        bands,
        transform,
        geo_keys,
        data: &data,
    };
    match compression {
        TiffCompression::None => image.write(writer, Uncompressed),
        TiffCompression::Lzw => image.write(writer, Lzw),
        TiffCompression::Deflate => image.write(writer, Deflate::default()),
        TiffCompression::Packbits => image.write(writer, Packbits),
    }
}

/// A fully assembled interleaved image waiting to be encoded.
struct ImageParts<'a> {
    width: u32,
    height: u32,
    bands: u16,
    transform: &'a GeoTransform,
    geo_keys: &'a GeoKeys,
    data: &'a [u8],
}

impl ImageParts<'_> {
    fn write<W: Write + Seek, D: Compression>(
        &self,
        writer: W,
        compression: D,
    ) -> Result<(), RasterError> {
        match self.bands {
            1 => self.write_as::<colortype::Gray8, W, D>(writer, compression),
            3 => self.write_as::<colortype::RGB8, W, D>(writer, compression),
            4 => self.write_as::<colortype::RGBA8, W, D>(writer, compression),
            other => Err(unsupported_bands(other)),
        }
    }

    fn write_as<C, W, D>(&self, writer: W, compression: D) -> Result<(), RasterError>
    where
        C: colortype::ColorType<Inner = u8>,
        W: Write + Seek,
        D: Compression,
    {
        let mut encoder = TiffEncoder::new(writer)?;
        let mut image =
            encoder.new_image_with_compression::<C, D>(self.width, self.height, compression)?;
        write_geo_tags(image.encoder(), self.transform, self.geo_keys)?;
        image.write_data(self.data)?;
        Ok(())
    }
}

fn write_rows_as<C, W, F>(
    writer: W,
    width: u32,
    height: u32,
    transform: &GeoTransform,
    geo_keys: &GeoKeys,
    mut fill_row: F,
) -> Result<(), RasterError>
where
    C: colortype::ColorType<Inner = u8>,
    W: Write + Seek,
    F: FnMut(u32, &mut [u8]) -> Result<(), RasterError>,
{
    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<C>(width, height)?;
    write_geo_tags(image.encoder(), transform, geo_keys)?;
    image.rows_per_strip(1)?;
    let mut buffer = vec![0u8; width as usize * C::SAMPLE_FORMAT.len()];
    for row in 0..height {
        fill_row(row, &mut buffer)?;
        image.write_strip(&buffer)?;
    }
    image.finish()?;
    Ok(())
}

fn write_geo_tags<W: Write + Seek, K: TiffKind>(
    directory: &mut DirectoryEncoder<'_, W, K>,
    transform: &GeoTransform,
    geo_keys: &GeoKeys,
) -> Result<(), RasterError> {
    match transform.to_geotiff_tags() {
        GeoTiffTransformTags::ScaleTiepoint { scale, tiepoint } => {
            directory.write_tag(geotiff_tag(MODEL_PIXEL_SCALE_TAG), &scale[..])?;
            directory.write_tag(geotiff_tag(MODEL_TIEPOINT_TAG), &tiepoint[..])?;
        }
        GeoTiffTransformTags::Transformation(matrix) => {
            directory.write_tag(geotiff_tag(MODEL_TRANSFORMATION_TAG), &matrix[..])?;
        }
    }
    if let Some(directory_keys) = &geo_keys.directory {
        directory.write_tag(geotiff_tag(GEO_KEY_DIRECTORY_TAG), &directory_keys[..])?;
    }
    if let Some(double_params) = &geo_keys.double_params {
        directory.write_tag(geotiff_tag(GEO_DOUBLE_PARAMS_TAG), &double_params[..])?;
    }
    if let Some(ascii_params) = &geo_keys.ascii_params {
        directory.write_tag(geotiff_tag(GEO_ASCII_PARAMS_TAG), ascii_params.as_str())?;
    }
    Ok(())
}
