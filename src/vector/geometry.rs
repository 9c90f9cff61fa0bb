use crate::annotations::bounding_box::{BoundingBox, BoundingBoxGeometry, GeometryError};
use crate::annotations::detection::Detection;
use crate::pipeline::dispatcher::DetectionSet;
use crate::vector::layer::{CoordinateReference, DetectionFeature, VectorLayer};
use geo::{LineString, MultiPolygon, Polygon};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinate space detection polygons are expressed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// Pixels of the tile the detection came from. Polygons of different tiles are not
    /// comparable in this space.
    TilePixel,
    /// Pixels of the source raster.
    SourcePixel,
    /// Model space of the source raster (its affine transform applied).
    #[default]
    Georeferenced,
}

impl fmt::Display for CoordinateSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinateSpace::TilePixel => "tile_pixel",
            CoordinateSpace::SourcePixel => "source_pixel",
            CoordinateSpace::Georeferenced => "georeferenced",
        };
        f.write_str(name)
    }
}

/// Closed ring through the four corners, first corner repeated at the end.
pub fn rectangle_polygon(corners: [(f64, f64); 4]) -> Polygon<f64> {
    let mut ring: Vec<(f64, f64)> = corners.to_vec();
    ring.push(corners[0]);
    Polygon::new(LineString::from(ring), vec![])
}

/// Turns per-tile detections into polygons in one coordinate space with one CRS label.
#[derive(Clone, Debug)]
pub struct GeometryBuilder {
    space: CoordinateSpace,
    crs: CoordinateReference,
}

impl GeometryBuilder {
    pub fn new(space: CoordinateSpace, crs: CoordinateReference) -> Self {
        GeometryBuilder { space, crs }
    }

    pub fn space(&self) -> CoordinateSpace {
        self.space
    }

    /// Builds the vector layer of one tile. Detections whose corners cannot be mapped to finite
    /// coordinates are dropped with a warning.
    pub fn build(&self, set: &DetectionSet) -> VectorLayer {
        let mut layer = VectorLayer::new(self.crs.clone(), self.space);
        for detection in &set.detections {
            match self.place(set, detection) {
                Ok(feature) => layer.features.push(feature),
                Err(err) => warn!("{}: dropping detection: {err}", set.tile.id()),
            }
        }
        layer
    }

    fn place(
        &self,
        set: &DetectionSet,
        detection: &Detection<BoundingBox>,
    ) -> Result<DetectionFeature, GeometryError> {
        let window = set.tile.window;
        let corners = detection.annotation.corners().map(|(x, y)| match self.space {
            CoordinateSpace::TilePixel => (x, y),
            CoordinateSpace::SourcePixel => (x + window.col_off as f64, y + window.row_off as f64),
            CoordinateSpace::Georeferenced => set.tile.transform.apply(x, y),
        });
        let envelope = BoundingBox::enclosing(
            &corners,
            detection.annotation.class_id(),
            detection.annotation.category().to_string(),
        )?;
        Ok(DetectionFeature {
            geometry: MultiPolygon::new(vec![rectangle_polygon(corners)]),
            envelope,
            confidence: detection.confidence,
            tile: window.id(),
            merged_count: 1,
        })
    }
}
