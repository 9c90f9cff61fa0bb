use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayView3};

/// Converts a band-major tile buffer (bands, rows, columns) into an rgb8 image.
///
/// Single band rasters are replicated into grey, rasters with three or more bands use the first
/// three (an alpha or near-infrared band is ignored).
pub fn convert_band_array_to_rgb_image(pixels: ArrayView3<u8>) -> RgbImage {
    let (bands, height, width) = pixels.dim();
    let mut rgb_image = RgbImage::new(width as u32, height as u32);
    if bands == 0 {
        return rgb_image;
    }
    let green_band = if bands >= 3 { 1 } else { 0 };
    let blue_band = if bands >= 3 { 2 } else { 0 };
    for (x, y, pixel) in rgb_image.enumerate_pixels_mut() {
        let (row, col) = (y as usize, x as usize);
        *pixel = Rgb([
            pixels[[0, row, col]],
            pixels[[green_band, row, col]],
            pixels[[blue_band, row, col]],
        ]);
    }
    rgb_image
}

/// Converts an rgb8 image to a (1, 3, height, width) tensor scaled to [0, 1].
pub fn convert_rgb_image_to_owned_array(rgb_image: &RgbImage) -> Array4<f32> {
    let mut image_array = Array4::zeros((
        1,
        3,
        rgb_image.height() as usize,
        rgb_image.width() as usize,
    ));
    for (x, y, pixel) in rgb_image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        image_array[[0, 0, y, x]] = (r as f32) / 255.;
        image_array[[0, 1, y, x]] = (g as f32) / 255.;
        image_array[[0, 2, y, x]] = (b as f32) / 255.;
    }
    image_array
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn three_band_buffer_to_rgb() {
        let mut pixels = Array3::<u8>::zeros((3, 2, 3));
        pixels[[0, 1, 2]] = 255;
        pixels[[1, 0, 1]] = 128;
        pixels[[2, 1, 0]] = 7;
        let img = convert_band_array_to_rgb_image(pixels.view());
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1), &Rgb([255, 0, 0]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([0, 128, 0]));
        assert_eq!(img.get_pixel(0, 1), &Rgb([0, 0, 7]));
    }

    #[test]
    fn grey_buffer_is_replicated() {
        let mut pixels = Array3::<u8>::zeros((1, 1, 2));
        pixels[[0, 0, 1]] = 90;
        let img = convert_band_array_to_rgb_image(pixels.view());
        assert_eq!(img.get_pixel(1, 0), &Rgb([90, 90, 90]));
    }

    #[test]
    fn alpha_band_is_ignored() {
        let mut pixels = Array3::<u8>::zeros((4, 1, 1));
        pixels[[0, 0, 0]] = 1;
        pixels[[1, 0, 0]] = 2;
        pixels[[2, 0, 0]] = 3;
        pixels[[3, 0, 0]] = 255;
        let img = convert_band_array_to_rgb_image(pixels.view());
        assert_eq!(img.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn rgb_image_to_tensor_layout() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([255, 0, 51]));
        let arr = convert_rgb_image_to_owned_array(&img);
        assert_eq!(arr.shape(), &[1, 3, 2, 3]);
        assert_eq!(arr[[0, 0, 1, 2]], 1.0);
        assert_eq!(arr[[0, 1, 1, 2]], 0.0);
        assert_eq!(arr[[0, 2, 1, 2]], 0.2);
        assert_eq!(arr[[0, 0, 0, 0]], 0.0);
    }
}
