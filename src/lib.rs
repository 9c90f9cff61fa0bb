//! Tiled object detection over large GeoTIFF orthomosaics.
//!
//! A source raster is cut into a grid of georeferenced tiles, a detector runs on each tile in a
//! bounded worker pool, detections become polygons, and the per-tile results are merged back into
//! one raster mosaic and one vector layer with seam duplicates resolved.

pub mod annotations;
pub mod image_utils;
pub mod object_detection;
pub mod pipeline;
pub mod raster;
pub mod vector;
