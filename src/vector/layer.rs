use crate::annotations::bounding_box::{BoundingBox, BoundingBoxGeometry};
use crate::image_utils::tiling::TileId;
use crate::object_detection::object_detection_utils::Scored;
use crate::raster::mosaic::MergeError;
use crate::vector::geometry::CoordinateSpace;
use geo::{MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Label used when neither the configuration nor the source raster names a CRS.
pub const DEFAULT_CRS: &str = "EPSG:3857";

/// A CRS label carried through to the outputs. No reprojection is ever done with it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordinateReference(String);

impl CoordinateReference {
    pub fn new(label: impl Into<String>) -> Self {
        CoordinateReference(label.into())
    }

    pub fn from_epsg(code: u16) -> Self {
        CoordinateReference(format!("EPSG:{code}"))
    }

    pub fn label(&self) -> &str {
        &self.0
    }
}

impl Default for CoordinateReference {
    fn default() -> Self {
        CoordinateReference::new(DEFAULT_CRS)
    }
}

impl fmt::Display for CoordinateReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One detection as a polygon, or several overlapping detections merged into one.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionFeature {
    pub geometry: MultiPolygon<f64>,
    /// Axis-aligned extent of `geometry`, carrying the class of the feature.
    pub envelope: BoundingBox,
    pub confidence: f32,
    /// Tile the (best) detection came from.
    pub tile: TileId,
    /// Number of detections folded into this feature.
    pub merged_count: usize,
}

impl Scored for DetectionFeature {
    type Annotation = BoundingBox;

    fn annotation(&self) -> &BoundingBox {
        &self.envelope
    }

    fn score(&self) -> f32 {
        self.confidence
    }
}

/// Ordered features sharing one coordinate space and one CRS label.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorLayer {
    pub crs: CoordinateReference,
    pub space: CoordinateSpace,
    pub features: Vec<DetectionFeature>,
}

impl VectorLayer {
    pub fn new(crs: CoordinateReference, space: CoordinateSpace) -> Self {
        VectorLayer {
            crs,
            space,
            features: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// GeoJSON FeatureCollection with a named `crs` member.
    pub fn to_geojson(&self) -> Value {
        let features: Vec<Value> = self
            .features
            .iter()
            .map(|feature| {
                json!({
                    "type": "Feature",
                    "geometry": geometry_to_geojson(&feature.geometry),
                    "properties": {
                        "class_id": feature.envelope.class_id(),
                        "category": feature.envelope.category(),
                        "confidence": feature.confidence,
                        "tile_row": feature.tile.row,
                        "tile_col": feature.tile.col,
                        "merged_count": feature.merged_count,
                    },
                })
            })
            .collect();
        json!({
            "type": "FeatureCollection",
            "crs": {
                "type": "name",
                "properties": { "name": self.crs.label() },
            },
            "coordinate_space": self.space,
            "features": features,
        })
    }

    pub fn write_geojson(&self, path: &Path) -> io::Result<()> {
        let text = serde_json::to_string_pretty(&self.to_geojson())?;
        fs::write(path, text)
    }
}

fn polygon_rings(polygon: &Polygon<f64>) -> Vec<Vec<[f64; 2]>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
        .collect()
}

fn geometry_to_geojson(geometry: &MultiPolygon<f64>) -> Value {
    match geometry.0.as_slice() {
        [polygon] => json!({
            "type": "Polygon",
            "coordinates": polygon_rings(polygon),
        }),
        polygons => json!({
            "type": "MultiPolygon",
            "coordinates": polygons.iter().map(polygon_rings).collect::<Vec<_>>(),
        }),
    }
}

/// Concatenates per-tile layers in the order given.
pub fn merge_layers(layers: Vec<VectorLayer>) -> Result<VectorLayer, MergeError> {
    let mut layers = layers.into_iter();
    let Some(mut merged) = layers.next() else {
        return Err(MergeError::NoTiles);
    };
    for layer in layers {
        if layer.crs != merged.crs {
            return Err(MergeError::LayerMismatch(format!(
                "CRS {} differs from {}",
                layer.crs, merged.crs
            )));
        }
        if layer.space != merged.space {
            return Err(MergeError::LayerMismatch(format!(
                "coordinate space {} differs from {}",
                layer.space, merged.space
            )));
        }
        merged.features.extend(layer.features);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::geometry::rectangle_polygon;

    fn feature(left: f64, top: f64, right: f64, bottom: f64) -> DetectionFeature {
        let envelope = BoundingBox::new(left, top, right, bottom, 1, "crop".to_string()).unwrap();
        DetectionFeature {
            geometry: MultiPolygon::new(vec![rectangle_polygon(envelope.corners())]),
            envelope,
            confidence: 0.75,
            tile: TileId { row: 0, col: 3 },
            merged_count: 1,
        }
    }

    fn layer(space: CoordinateSpace, features: Vec<DetectionFeature>) -> VectorLayer {
        VectorLayer {
            crs: CoordinateReference::from_epsg(32633),
            space,
            features,
        }
    }

    #[test]
    fn geojson_feature_collection() {
        let layer = layer(CoordinateSpace::SourcePixel, vec![feature(0.0, 0.0, 2.0, 1.0)]);
        let value = layer.to_geojson();
        assert_eq!(value["type"], "FeatureCollection");
        assert_eq!(value["crs"]["properties"]["name"], "EPSG:32633");
        assert_eq!(value["coordinate_space"], "source_pixel");
        let feature = &value["features"][0];
        assert_eq!(feature["geometry"]["type"], "Polygon");
        assert_eq!(
            feature["geometry"]["coordinates"],
            json!([[[0.0, 0.0], [2.0, 0.0], [2.0, 1.0], [0.0, 1.0], [0.0, 0.0]]])
        );
        assert_eq!(feature["properties"]["category"], "crop");
        assert_eq!(feature["properties"]["tile_col"], 3);
    }

    #[test]
    fn multi_part_geometry_is_a_multipolygon() {
        let mut merged = feature(0.0, 0.0, 1.0, 1.0);
        merged
            .geometry
            .0
            .push(rectangle_polygon([(5.0, 5.0), (6.0, 5.0), (6.0, 6.0), (5.0, 6.0)]));
        let value = layer(CoordinateSpace::TilePixel, vec![merged]).to_geojson();
        assert_eq!(value["features"][0]["geometry"]["type"], "MultiPolygon");
        assert_eq!(
            value["features"][0]["geometry"]["coordinates"]
                .as_array()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn writes_geojson_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("detections.geojson");
        let layer = layer(CoordinateSpace::Georeferenced, vec![feature(0.0, 0.0, 1.0, 1.0)]);
        layer.write_geojson(&path).unwrap();
        let read: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, layer.to_geojson());
    }

    #[test]
    fn merging_concatenates_in_order() {
        let merged = merge_layers(vec![
            layer(CoordinateSpace::Georeferenced, vec![feature(0.0, 0.0, 1.0, 1.0)]),
            layer(CoordinateSpace::Georeferenced, vec![]),
            layer(
                CoordinateSpace::Georeferenced,
                vec![feature(2.0, 2.0, 3.0, 3.0), feature(4.0, 4.0, 5.0, 5.0)],
            ),
        ])
        .unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.features[1].envelope.left(), 2.0);
    }

    #[test]
    fn merging_rejects_mixed_spaces_and_labels() {
        assert!(matches!(merge_layers(vec![]), Err(MergeError::NoTiles)));
        let mixed_space = merge_layers(vec![
            layer(CoordinateSpace::Georeferenced, vec![]),
            layer(CoordinateSpace::TilePixel, vec![]),
        ]);
        assert!(matches!(mixed_space, Err(MergeError::LayerMismatch(_))));
        let mut other_crs = layer(CoordinateSpace::Georeferenced, vec![]);
        other_crs.crs = CoordinateReference::default();
        let mixed_crs = merge_layers(vec![layer(CoordinateSpace::Georeferenced, vec![]), other_crs]);
        assert!(matches!(mixed_crs, Err(MergeError::LayerMismatch(_))));
    }
}
