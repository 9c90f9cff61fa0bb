use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Grey used by YOLO models for letterbox borders.
pub const LETTERBOX_FILL: Rgb<u8> = Rgb([114, 114, 114]);

/// Pads an rgb8 image by adding pixels to the right and bottom of the image.
pub fn pad_right_bottom_img_rgb8(
    original_image: &RgbImage,
    new_width: u32,
    new_height: u32,
) -> RgbImage {
    let mut padded_image = RgbImage::from_pixel(new_width, new_height, LETTERBOX_FILL);
    for (x, y, pixel) in original_image.enumerate_pixels() {
        if x < new_width && y < new_height {
            padded_image.put_pixel(x, y, *pixel);
        }
    }
    padded_image
}

/// Result of fitting a tile into a fixed model input.
pub struct Letterbox {
    pub image: RgbImage,
    /// Factor applied to tile pixels; divide model coordinates by it to get back.
    pub scale: f64,
}

/// Resizes the image to fit inside `input_width` x `input_height` keeping its aspect ratio, then
/// pads the right and bottom edges.
pub fn letterbox_rgb8(original_image: &RgbImage, input_width: u32, input_height: u32) -> Letterbox {
    let (width, height) = original_image.dimensions();
    let scale = (input_width as f64 / width as f64).min(input_height as f64 / height as f64);
    let scaled_width = ((width as f64 * scale).round() as u32).clamp(1, input_width);
    let scaled_height = ((height as f64 * scale).round() as u32).clamp(1, input_height);
    let image = if (scaled_width, scaled_height) == (width, height) {
        pad_right_bottom_img_rgb8(original_image, input_width, input_height)
    } else {
        let resized = imageops::resize(
            original_image,
            scaled_width,
            scaled_height,
            FilterType::Triangle,
        );
        pad_right_bottom_img_rgb8(&resized, input_width, input_height)
    };
    Letterbox { image, scale }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_with_letterbox_grey() {
        let img = RgbImage::from_pixel(2, 1, Rgb([10, 20, 30]));
        let padded = pad_right_bottom_img_rgb8(&img, 3, 2);
        assert_eq!(padded.dimensions(), (3, 2));
        assert_eq!(padded.get_pixel(1, 0), &Rgb([10, 20, 30]));
        assert_eq!(padded.get_pixel(2, 0), &LETTERBOX_FILL);
        assert_eq!(padded.get_pixel(0, 1), &LETTERBOX_FILL);
    }

    #[test]
    fn letterbox_downscales_large_tiles() {
        let img = RgbImage::new(1280, 640);
        let letterbox = letterbox_rgb8(&img, 640, 640);
        assert_eq!(letterbox.image.dimensions(), (640, 640));
        assert_eq!(letterbox.scale, 0.5);
        assert_eq!(letterbox.image.get_pixel(0, 319), &Rgb([0, 0, 0]));
        assert_eq!(letterbox.image.get_pixel(0, 320), &LETTERBOX_FILL);
    }

    #[test]
    fn letterbox_upscales_small_tiles() {
        let img = RgbImage::new(320, 160);
        let letterbox = letterbox_rgb8(&img, 640, 640);
        assert_eq!(letterbox.scale, 2.0);
        assert_eq!(letterbox.image.get_pixel(639, 319), &Rgb([0, 0, 0]));
        assert_eq!(letterbox.image.get_pixel(639, 320), &LETTERBOX_FILL);
    }
}
