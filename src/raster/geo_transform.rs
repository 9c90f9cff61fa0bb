use serde::{Deserialize, Serialize};

/// Affine mapping from pixel (column, row) to model space, in GDAL coefficient order:
///
/// x = c[0] + col * c[1] + row * c[2]
/// y = c[3] + col * c[4] + row * c[5]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub coefficients: [f64; 6],
}

/// How a transform is written back into GeoTIFF tags.
#[derive(Clone, Debug, PartialEq)]
pub enum GeoTiffTransformTags {
    /// ModelPixelScaleTag + ModelTiepointTag, for north-up rasters.
    ScaleTiepoint { scale: [f64; 3], tiepoint: [f64; 6] },
    /// ModelTransformationTag, a row-major 4x4 matrix.
    Transformation([f64; 16]),
}

impl Default for GeoTransform {
    fn default() -> Self {
        GeoTransform::identity()
    }
}

impl GeoTransform {
    pub fn new(coefficients: [f64; 6]) -> Self {
        GeoTransform { coefficients }
    }

    pub fn identity() -> Self {
        GeoTransform::new([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    /// Builds a transform from the GeoTIFF georeferencing tags.
    ///
    /// ModelTransformationTag wins when present; otherwise the first tiepoint is combined with
    /// the pixel scale (y scale is stored positive and points south).
    pub fn from_geotiff_tags(
        pixel_scale: Option<&[f64]>,
        tiepoint: Option<&[f64]>,
        transformation: Option<&[f64]>,
    ) -> Option<Self> {
        if let Some(m) = transformation.filter(|m| m.len() >= 16) {
            return Some(GeoTransform::new([m[3], m[0], m[1], m[7], m[4], m[5]]));
        }
        let scale = pixel_scale.filter(|s| s.len() >= 2)?;
        let tiepoint = tiepoint.filter(|t| t.len() >= 6)?;
        let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
        Some(GeoTransform::new([
            x - i * scale[0],
            scale[0],
            0.0,
            y + j * scale[1],
            0.0,
            -scale[1],
        ]))
    }

    pub fn to_geotiff_tags(&self) -> GeoTiffTransformTags {
        let c = self.coefficients;
        if self.is_north_up() && c[1] > 0.0 && c[5] < 0.0 {
            GeoTiffTransformTags::ScaleTiepoint {
                scale: [c[1], -c[5], 0.0],
                tiepoint: [0.0, 0.0, 0.0, c[0], c[3], 0.0],
            }
        } else {
            GeoTiffTransformTags::Transformation([
                c[1], c[2], 0.0, c[0], //
                c[4], c[5], 0.0, c[3], //
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ])
        }
    }

    /// Maps a pixel position to model space.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let c = self.coefficients;
        (c[0] + col * c[1] + row * c[2], c[3] + col * c[4] + row * c[5])
    }

    /// Transform of a window whose top-left pixel sits at (col_off, row_off) of this raster.
    pub fn for_window(&self, col_off: f64, row_off: f64) -> Self {
        let (x, y) = self.apply(col_off, row_off);
        let c = self.coefficients;
        GeoTransform::new([x, c[1], c[2], y, c[4], c[5]])
    }

    /// The inverse mapping (model space to pixel), if the linear part is invertible.
    pub fn inverse(&self) -> Option<Self> {
        let [c0, c1, c2, c3, c4, c5] = self.coefficients;
        let det = c1 * c5 - c2 * c4;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let (i1, i2, i4, i5) = (c5 / det, -c2 / det, -c4 / det, c1 / det);
        Some(GeoTransform::new([
            -(i1 * c0 + i2 * c3),
            i1,
            i2,
            -(i4 * c0 + i5 * c3),
            i4,
            i5,
        ]))
    }

    /// True when there is no rotation or shear.
    pub fn is_north_up(&self) -> bool {
        self.coefficients[2] == 0.0 && self.coefficients[4] == 0.0
    }

    /// True when both transforms describe the same pixel grid spacing and orientation.
    pub fn same_pixel_grid(&self, other: &GeoTransform) -> bool {
        let linear = [1, 2, 4, 5];
        let magnitude = linear
            .iter()
            .map(|&i| self.coefficients[i].abs())
            .fold(0.0, f64::max);
        let tolerance = magnitude * 1e-9;
        linear
            .iter()
            .all(|&i| (self.coefficients[i] - other.coefficients[i]).abs() <= tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn utm() -> GeoTransform {
        GeoTransform::new([500000.0, 0.05, 0.0, 4100000.0, 0.0, -0.05])
    }

    #[test]
    fn reads_scale_and_tiepoint() {
        let transform = GeoTransform::from_geotiff_tags(
            Some(&[0.05, 0.05, 0.0]),
            Some(&[0.0, 0.0, 0.0, 500000.0, 4100000.0, 0.0]),
            None,
        )
        .unwrap();
        assert_eq!(transform, utm());
    }

    #[test]
    fn tiepoint_away_from_origin() {
        let transform = GeoTransform::from_geotiff_tags(
            Some(&[2.0, 2.0, 0.0]),
            Some(&[10.0, 5.0, 0.0, 100.0, 50.0, 0.0]),
            None,
        )
        .unwrap();
        assert_eq!(transform.apply(10.0, 5.0), (100.0, 50.0));
        assert_eq!(transform.apply(0.0, 0.0), (80.0, 60.0));
    }

    #[test]
    fn transformation_tag_wins() {
        let matrix = [
            1.0, 0.5, 0.0, 10.0, //
            0.25, -1.0, 0.0, 20.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        let transform =
            GeoTransform::from_geotiff_tags(Some(&[9.0, 9.0, 0.0]), None, Some(&matrix)).unwrap();
        assert_eq!(transform.apply(2.0, 4.0), (14.0, 16.5));
        assert_eq!(
            transform.to_geotiff_tags(),
            GeoTiffTransformTags::Transformation(matrix)
        );
    }

    #[test]
    fn missing_tags_give_none() {
        assert!(GeoTransform::from_geotiff_tags(None, None, None).is_none());
        assert!(GeoTransform::from_geotiff_tags(Some(&[1.0, 1.0, 0.0]), None, None).is_none());
    }

    #[test]
    fn north_up_round_trips_through_tags() {
        let tags = utm().to_geotiff_tags();
        let GeoTiffTransformTags::ScaleTiepoint { scale, tiepoint } = tags else {
            panic!("expected scale/tiepoint tags");
        };
        assert_eq!(
            GeoTransform::from_geotiff_tags(Some(&scale), Some(&tiepoint), None),
            Some(utm())
        );
    }

    #[test]
    fn window_transform_matches_direct_mapping() {
        let source = utm();
        let tile = source.for_window(400.0, 200.0);
        for (col, row) in [(0.0, 0.0), (13.0, 7.5), (199.0, 199.0)] {
            let (tx, ty) = tile.apply(col, row);
            let (sx, sy) = source.apply(400.0 + col, 200.0 + row);
            assert_relative_eq!(tx, sx, epsilon = 1e-6);
            assert_relative_eq!(ty, sy, epsilon = 1e-6);
        }
    }

    #[test]
    fn window_composition_is_associative() {
        let source = GeoTransform::new([10.0, 0.3, 0.1, 20.0, -0.05, -0.3]);
        let nested = source.for_window(100.0, 40.0).for_window(7.0, 3.0);
        let direct = source.for_window(107.0, 43.0);
        for i in 0..6 {
            assert_relative_eq!(
                nested.coefficients[i],
                direct.coefficients[i],
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn inverse_undoes_apply() {
        let source = GeoTransform::new([10.0, 0.3, 0.1, 20.0, -0.05, -0.3]);
        let inverse = source.inverse().unwrap();
        let (x, y) = source.apply(12.0, 34.0);
        let (col, row) = inverse.apply(x, y);
        assert_relative_eq!(col, 12.0, epsilon = 1e-9);
        assert_relative_eq!(row, 34.0, epsilon = 1e-9);
        assert!(GeoTransform::new([0.0; 6]).inverse().is_none());
    }

    #[test]
    fn pixel_grid_comparison() {
        assert!(utm().same_pixel_grid(&utm().for_window(10.0, 10.0)));
        assert!(!utm().same_pixel_grid(&GeoTransform::identity()));
    }
}
