use crate::annotations::bounding_box::BoundingBox;
use crate::annotations::detection::Detection;
use crate::raster::RasterError;
use ndarray::ArrayView4;

/// Errors raised while running a detector on one tile.
#[derive(thiserror::Error, Debug)]
pub enum DetectionError {
    #[error(transparent)]
    Model(#[from] ort::Error),

    #[error("failed to read tile image: {0}")]
    TileRead(#[from] RasterError),

    #[error("unexpected model output shape {shape:?}")]
    OutputShape { shape: Vec<usize> },

    #[error("tile has no pixels")]
    EmptyTile,

    #[error("inference session lock was poisoned by a panicking worker")]
    SessionPoisoned,
}

/// Defines a trait that all object detection models must follow.
///
/// A single model instance is shared by every tile worker, so implementations must be usable
/// through `&self` from several threads at once.
pub trait ObjectDetectionModel: Send + Sync {
    /// Fixed (width, height) of the tensor the model expects.
    fn input_size(&self) -> (u32, u32);

    /// run_inference takes a view into a (1, 3, height, width) array scaled to [0, 1] and
    /// returns boxes in the pixel space of that array, keeping only those whose confidence is
    /// at least `confidence`.
    fn run_inference(
        &self,
        input_array: ArrayView4<f32>,
        confidence: f32,
    ) -> Result<Vec<Detection<BoundingBox>>, DetectionError>;
}
