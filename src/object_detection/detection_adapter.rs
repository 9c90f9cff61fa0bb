use crate::annotations::bounding_box::BoundingBox;
use crate::annotations::detection::Detection;
use crate::image_utils::image_conversion::{
    convert_band_array_to_rgb_image, convert_rgb_image_to_owned_array,
};
use crate::image_utils::padding::letterbox_rgb8;
use crate::image_utils::tiling::TileWindow;
use crate::object_detection::object_detection_model::{DetectionError, ObjectDetectionModel};
use crate::raster::geotiff::GeoTiffReader;
use crate::raster::tiler::Tile;
use log::{debug, warn};
use std::path::Path;

/// Runs a detector on whole tiles.
///
/// Tiles rarely match the model input, so each one is letterboxed into it and the returned
/// boxes are mapped back to tile pixels. Boxes that end up malformed or outside the tile are
/// dropped with a warning. The model is borrowed, so one loaded model serves every tile.
pub struct DetectionAdapter<'m, M: ObjectDetectionModel> {
    model: &'m M,
    confidence: f32,
}

impl<'m, M: ObjectDetectionModel> DetectionAdapter<'m, M> {
    pub fn new(model: &'m M, confidence: f32) -> Self {
        DetectionAdapter { model, confidence }
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Detects objects on an in-memory tile. Boxes are in tile pixel coordinates.
    pub fn detect(&self, tile: &Tile) -> Result<Vec<Detection<BoundingBox>>, DetectionError> {
        if tile.bands() == 0 || tile.width() == 0 || tile.height() == 0 {
            return Err(DetectionError::EmptyTile);
        }
        let rgb = convert_band_array_to_rgb_image(tile.pixels.view());
        let (input_width, input_height) = self.model.input_size();
        let letterbox = letterbox_rgb8(&rgb, input_width, input_height);
        let input_array = convert_rgb_image_to_owned_array(&letterbox.image);
        let predictions = self.model.run_inference(input_array.view(), self.confidence)?;
        debug!(
            "{}: {} raw detections at scale {:.3}",
            tile.id(),
            predictions.len(),
            letterbox.scale
        );

        let (tile_width, tile_height) = (tile.width() as f64, tile.height() as f64);
        Ok(predictions
            .into_iter()
            .filter(|pred| pred.confidence >= self.confidence)
            .filter_map(|pred| {
                let annotation = pred
                    .annotation
                    .scaled(1.0 / letterbox.scale)
                    .and_then(|bbox| bbox.clipped(tile_width, tile_height));
                match annotation {
                    Ok(annotation) => Some(Detection {
                        annotation,
                        confidence: pred.confidence,
                    }),
                    Err(err) => {
                        warn!("{}: dropping detection: {err}", tile.id());
                        None
                    }
                }
            })
            .collect())
    }

    /// Detects objects on a tile image read from disk.
    pub fn detect_path(&self, path: &Path) -> Result<Vec<Detection<BoundingBox>>, DetectionError> {
        let mut reader = GeoTiffReader::open(path)?;
        let pixels = reader.read_all()?;
        let (_, height, width) = pixels.dim();
        let tile = Tile {
            window: TileWindow::full(width as u32, height as u32),
            transform: reader.profile().transform,
            pixels,
        };
        self.detect(&tile)
    }
}
