//! Detection polygons: construction, per-tile layers and overlap resolution.

pub mod geometry;
pub mod layer;
pub mod overlap;
