//! Raw pixel frames and crop lineage.
//!
//! A `RawImage` is a decoded RGB frame plus the cumulative region (`Roi`)
//! that successive filter crops have narrowed it to, relative to the frame
//! as originally decoded. A cleared image (empty buffer, zero dimensions)
//! signals that no further processing should happen for this frame.

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, GenericImageView, Rgb, RgbImage};

const JPEG_QUALITY: u8 = 90;
const OUTLINE_THICKNESS: u32 = 3;
const OUTLINE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// A rectangle within a frame. Used both for crop requests (relative to the
/// current image) and for crop lineage (relative to the original frame).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roi {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// The full extent of a `width`x`height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Compose a crop expressed relative to the already-cropped frame into
    /// this lineage rectangle. Offsets accumulate; extents are replaced.
    pub fn compose(&mut self, inner: &Roi) {
        self.left += inner.left;
        self.top += inner.top;
        self.width = inner.width;
        self.height = inner.height;
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Decoded RGB frame with crop lineage.
#[derive(Clone)]
pub struct RawImage {
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    crop: Roi,
}

impl RawImage {
    /// Decode a JPEG byte buffer into an RGB frame with a full-extent
    /// lineage.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).map_err(|e| anyhow!("decode jpeg: {}", e))?;
        let (width, height) = decoded.dimensions();
        let rgb = decoded.into_rgb8();
        Ok(Self {
            buffer: rgb.into_raw(),
            width,
            height,
            channels: 3,
            crop: Roi::full(width, height),
        })
    }

    /// Wrap an RGB8 buffer. The buffer length must be `width * height * 3`.
    pub fn from_rgb(buffer: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if buffer.len() != expected {
            return Err(anyhow!(
                "rgb buffer length {} does not match {}x{}x3",
                buffer.len(),
                width,
                height
            ));
        }
        Ok(Self {
            buffer,
            width,
            height,
            channels: 3,
            crop: Roi::full(width, height),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Cumulative crop rectangle relative to the originally decoded frame.
    pub fn crop_lineage(&self) -> Roi {
        self.crop
    }

    /// True once `clear()` has run: empty buffer, zero dimensions.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Empty the frame. Downstream stages treat this as "do not proceed".
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.width = 0;
        self.height = 0;
        self.channels = 0;
    }

    fn as_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match declared dimensions"))
    }

    fn load(&mut self, img: RgbImage) {
        self.width = img.width();
        self.height = img.height();
        self.channels = 3;
        self.buffer = img.into_raw();
    }

    /// Crop in place. `roi` is relative to the current image and is composed
    /// into the crop lineage, so the lineage keeps pointing into the
    /// original frame.
    pub fn crop(&mut self, roi: &Roi) -> Result<()> {
        if self.is_empty() {
            return Err(anyhow!("cannot crop a cleared frame"));
        }
        if roi.width == 0 || roi.height == 0 {
            return Err(anyhow!("crop rectangle must be non-empty"));
        }
        if roi.left + roi.width > self.width || roi.top + roi.height > self.height {
            return Err(anyhow!(
                "crop {}x{}+{}+{} exceeds frame {}x{}",
                roi.width,
                roi.height,
                roi.left,
                roi.top,
                self.width,
                self.height
            ));
        }
        let img = self.as_image()?;
        let cropped = imageops::crop_imm(&img, roi.left, roi.top, roi.width, roi.height).to_image();
        self.load(cropped);
        self.crop.compose(roi);
        Ok(())
    }

    /// Extract a region as an independent frame (fresh lineage). Used for
    /// plate crops attached to detection results.
    pub fn region(&self, roi: &Roi) -> Result<RawImage> {
        if roi.width == 0 || roi.height == 0 {
            return Err(anyhow!("region rectangle must be non-empty"));
        }
        if roi.left + roi.width > self.width || roi.top + roi.height > self.height {
            return Err(anyhow!("region exceeds frame bounds"));
        }
        let img = self.as_image()?;
        let out = imageops::crop_imm(&img, roi.left, roi.top, roi.width, roi.height).to_image();
        RawImage::from_rgb(out.into_raw(), roi.width, roi.height)
    }

    /// Draw a rectangle outline over the frame, clamped to its bounds.
    pub fn outline(&mut self, roi: &Roi) -> Result<()> {
        if self.is_empty() {
            return Err(anyhow!("cannot outline a cleared frame"));
        }
        let mut img = self.as_image()?;
        let right = (roi.left + roi.width).min(self.width);
        let bottom = (roi.top + roi.height).min(self.height);
        let left = roi.left.min(self.width);
        let top = roi.top.min(self.height);
        for t in 0..OUTLINE_THICKNESS {
            for x in left..right {
                if top + t < bottom {
                    img.put_pixel(x, top + t, OUTLINE_COLOR);
                }
                if bottom > top + t + 1 {
                    img.put_pixel(x, bottom - t - 1, OUTLINE_COLOR);
                }
            }
            for y in top..bottom {
                if left + t < right {
                    img.put_pixel(left + t, y, OUTLINE_COLOR);
                }
                if right > left + t + 1 {
                    img.put_pixel(right - t - 1, y, OUTLINE_COLOR);
                }
            }
        }
        self.load(img);
        Ok(())
    }

    /// Write a pixel directly. Out-of-bounds writes are ignored.
    pub(crate) fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        self.buffer[idx..idx + 3].copy_from_slice(&rgb);
    }

    /// Encode to JPEG. A cleared frame encodes to an empty buffer.
    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        encoder
            .encode(
                &self.buffer,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| anyhow!("encode jpeg: {}", e))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> RawImage {
        RawImage::from_rgb(
            vec![value; width as usize * height as usize * 3],
            width,
            height,
        )
        .expect("frame")
    }

    #[test]
    fn lineage_starts_at_full_extent() {
        let frame = solid_frame(64, 48, 10);
        assert_eq!(frame.crop_lineage(), Roi::full(64, 48));
    }

    #[test]
    fn crops_compose_against_the_original_frame() -> Result<()> {
        let mut frame = solid_frame(100, 80, 10);
        frame.crop(&Roi::new(10, 20, 50, 40))?;
        assert_eq!(frame.width(), 50);
        assert_eq!(frame.height(), 40);
        assert_eq!(frame.crop_lineage(), Roi::new(10, 20, 50, 40));

        // A second crop is relative to the already-cropped frame.
        frame.crop(&Roi::new(5, 5, 20, 10))?;
        assert_eq!(frame.crop_lineage(), Roi::new(15, 25, 20, 10));

        // Lineage never exceeds the original dimensions.
        let lineage = frame.crop_lineage();
        assert!(lineage.left + lineage.width <= 100);
        assert!(lineage.top + lineage.height <= 80);
        Ok(())
    }

    #[test]
    fn crop_out_of_bounds_is_rejected() {
        let mut frame = solid_frame(32, 32, 0);
        assert!(frame.crop(&Roi::new(20, 20, 20, 20)).is_err());
        assert!(frame.crop(&Roi::new(0, 0, 0, 5)).is_err());
    }

    #[test]
    fn clear_empties_the_frame() {
        let mut frame = solid_frame(16, 16, 200);
        frame.clear();
        assert!(frame.is_empty());
        assert_eq!(frame.width(), 0);
        assert_eq!(frame.height(), 0);
        assert_eq!(frame.channels(), 0);
        assert!(frame.to_jpeg().expect("encode").is_empty());
        assert!(frame.crop(&Roi::new(0, 0, 1, 1)).is_err());
    }

    #[test]
    fn outline_clamps_to_frame_bounds() -> Result<()> {
        let mut frame = solid_frame(40, 30, 0);
        // Rectangle extends past the right and bottom edges.
        frame.outline(&Roi::new(30, 20, 50, 50))?;
        assert_eq!(frame.width(), 40);
        assert_eq!(frame.height(), 30);
        // Top-left corner of the outline region was painted green.
        let idx = (20 * 40 + 30) * 3;
        assert_eq!(&frame.buffer()[idx..idx + 3], &[0, 255, 0]);
        Ok(())
    }

    #[test]
    fn region_extraction_leaves_source_untouched() -> Result<()> {
        let mut frame = solid_frame(20, 20, 7);
        frame.put_pixel(5, 5, [9, 9, 9]);
        let region = frame.region(&Roi::new(4, 4, 4, 4))?;
        assert_eq!(region.width(), 4);
        assert_eq!(region.height(), 4);
        assert_eq!(frame.width(), 20);
        // The marked pixel lands at (1, 1) of the region.
        let idx = (4 + 1) * 3;
        assert_eq!(&region.buffer()[idx..idx + 3], &[9, 9, 9]);
        Ok(())
    }

    #[test]
    fn jpeg_round_trip_preserves_dimensions() -> Result<()> {
        let frame = solid_frame(24, 18, 128);
        let jpeg = frame.to_jpeg()?;
        let decoded = RawImage::from_jpeg(&jpeg)?;
        assert_eq!(decoded.width(), 24);
        assert_eq!(decoded.height(), 18);
        assert_eq!(decoded.channels(), 3);
        Ok(())
    }
}
