pub mod image_conversion;
pub mod padding;
pub mod tiling;
