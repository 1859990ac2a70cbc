//! Optional lossy recompression of large images at archive-write time.

use image::{DynamicImage, ImageFormat, ImageOutputFormat};

/// Re-encodes big opaque images as bounded JPEGs when that actually shrinks
/// them; anything else passes through untouched.
#[derive(Debug, Clone)]
pub struct LossyCompressor {
    skip_files_below: usize,
    max_image_width: u32,
    max_image_height: u32,
    jpeg_quality: u8,
}

impl Default for LossyCompressor {
    fn default() -> Self {
        Self {
            skip_files_below: 100 << 10,
            max_image_width: 1280,
            max_image_height: 720,
            jpeg_quality: 75,
        }
    }
}

impl LossyCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(bytes)` only when the result is strictly smaller than the input.
    pub fn try_compress(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < self.skip_files_below {
            return None;
        }
        let format = image::guess_format(data).ok()?;
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp) {
            return None;
        }
        let decoded = image::load_from_memory_with_format(data, format).ok()?;
        if decoded.color().has_alpha() {
            return None;
        }

        let oversized = decoded.width() > self.max_image_width
            || decoded.height() > self.max_image_height;
        if !oversized && format == ImageFormat::Jpeg {
            // nothing would change
            return None;
        }
        let image = if oversized {
            decoded.resize(
                self.max_image_width,
                self.max_image_height,
                image::imageops::FilterType::Triangle,
            )
        } else {
            decoded
        };

        let mut out = Vec::new();
        DynamicImage::ImageRgb8(image.to_rgb8())
            .write_to(
                &mut std::io::Cursor::new(&mut out),
                ImageOutputFormat::Jpeg(self.jpeg_quality),
            )
            .ok()?;
        (out.len() < data.len()).then_some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        // deterministic noise compresses badly as PNG, well as JPEG
        let mut seed = 0x2545f491u32;
        let image = RgbImage::from_fn(width, height, |_, _| {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let bytes = seed.to_le_bytes();
            image::Rgb([bytes[0], bytes[1], bytes[2]])
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut std::io::Cursor::new(&mut out), ImageOutputFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn small_inputs_are_skipped() {
        let compressor = LossyCompressor::new();
        assert_eq!(compressor.try_compress(&noisy_png(16, 16)), None);
    }

    #[test]
    fn non_images_are_skipped() {
        let compressor = LossyCompressor::new();
        let data = vec![0u8; 200 << 10];
        assert_eq!(compressor.try_compress(&data), None);
    }

    #[test]
    fn large_opaque_images_shrink_into_bounded_jpegs() {
        let compressor = LossyCompressor::new();
        let png = noisy_png(2000, 1000);
        assert!(png.len() >= 100 << 10, "fixture should exceed the size gate");

        let jpeg = compressor.try_compress(&png).expect("expected a smaller encoding");
        assert!(jpeg.len() < png.len());

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        assert!(decoded.width() <= 1280 && decoded.height() <= 720);
        // aspect ratio is preserved
        assert_eq!(decoded.width(), 1280);
        assert_eq!(decoded.height(), 640);
    }
}
