//! Privacy masking.
//!
//! `MaskImageFilter` blacks out an ordered list of polygon shapes, hiding
//! regions (a neighbour's driveway, a hedge that waves in the wind) from
//! motion detection and recognition.

use anyhow::{anyhow, Result};

use super::ImageFilter;
use crate::frame::RawImage;

const MASK_COLOR: [u8; 3] = [0, 0, 0];

/// Fills configured polygons with black.
pub struct MaskImageFilter {
    shapes: Vec<Vec<(u16, u16)>>,
}

impl MaskImageFilter {
    pub fn new(shapes: Vec<Vec<(u16, u16)>>) -> Self {
        Self { shapes }
    }

    pub fn shapes(&self) -> &[Vec<(u16, u16)>] {
        &self.shapes
    }
}

impl ImageFilter for MaskImageFilter {
    fn kind(&self) -> &'static str {
        "mask"
    }

    fn apply(&mut self, frame: &mut RawImage) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        for shape in &self.shapes {
            fill_polygon(frame, shape);
        }
        Ok(())
    }
}

/// Parse a shape config string: a comma-separated list of coordinates,
/// alternating x and y. Requires an even count and at least three points.
pub fn parse_shape(value: &str) -> Result<Vec<(u16, u16)>> {
    let coords: Vec<u16> = value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| anyhow!("shape coordinates must be integers between 0 and 65535"))
        })
        .collect::<Result<_>>()?;
    if coords.len() % 2 != 0 {
        return Err(anyhow!("shape must contain an even number of coordinates"));
    }
    if coords.len() < 6 {
        return Err(anyhow!("shape must contain at least three points"));
    }
    Ok(coords.chunks(2).map(|pair| (pair[0], pair[1])).collect())
}

/// Even-odd scanline fill over pixel centers.
fn fill_polygon(frame: &mut RawImage, points: &[(u16, u16)]) {
    if points.len() < 3 {
        return;
    }
    let height = frame.height();
    let width = frame.width();
    for y in 0..height {
        let yc = y as f64 + 0.5;
        let mut crossings = Vec::new();
        for i in 0..points.len() {
            let (x1, y1) = points[i];
            let (x2, y2) = points[(i + 1) % points.len()];
            let (x1, y1, x2, y2) = (x1 as f64, y1 as f64, x2 as f64, y2 as f64);
            if (y1 <= yc) == (y2 <= yc) {
                continue;
            }
            crossings.push(x1 + (yc - y1) * (x2 - x1) / (y2 - y1));
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).expect("finite crossing"));
        for pair in crossings.chunks(2) {
            let [start, end] = pair else { continue };
            let from = (start - 0.5).ceil().max(0.0) as u32;
            let to = ((end - 0.5).floor() as i64).min(width as i64 - 1);
            if to < 0 {
                continue;
            }
            for x in from..=to as u32 {
                frame.put_pixel(x, y, MASK_COLOR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(frame: &RawImage, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * frame.width() as usize + x as usize) * 3;
        let buf = frame.buffer();
        [buf[idx], buf[idx + 1], buf[idx + 2]]
    }

    #[test]
    fn square_shape_is_blacked_out() -> Result<()> {
        let mut frame = RawImage::from_rgb(vec![100; 20 * 20 * 3], 20, 20)?;
        let mut filter = MaskImageFilter::new(vec![vec![(5, 5), (15, 5), (15, 15), (5, 15)]]);
        filter.apply(&mut frame)?;

        assert_eq!(pixel(&frame, 10, 10), [0, 0, 0]);
        assert_eq!(pixel(&frame, 6, 6), [0, 0, 0]);
        // Outside the polygon is untouched.
        assert_eq!(pixel(&frame, 2, 2), [100, 100, 100]);
        assert_eq!(pixel(&frame, 18, 18), [100, 100, 100]);
        Ok(())
    }

    #[test]
    fn triangle_fill_respects_edges() -> Result<()> {
        let mut frame = RawImage::from_rgb(vec![50; 30 * 30 * 3], 30, 30)?;
        let mut filter = MaskImageFilter::new(vec![vec![(0, 0), (20, 0), (0, 20)]]);
        filter.apply(&mut frame)?;

        assert_eq!(pixel(&frame, 2, 2), [0, 0, 0]);
        // Beyond the hypotenuse stays untouched.
        assert_eq!(pixel(&frame, 15, 15), [50, 50, 50]);
        assert_eq!(pixel(&frame, 25, 25), [50, 50, 50]);
        Ok(())
    }

    #[test]
    fn cleared_frames_pass_through() -> Result<()> {
        let mut frame = RawImage::from_rgb(vec![0; 4 * 4 * 3], 4, 4)?;
        frame.clear();
        let mut filter = MaskImageFilter::new(vec![vec![(0, 0), (3, 0), (3, 3)]]);
        filter.apply(&mut frame)?;
        assert!(frame.is_empty());
        Ok(())
    }

    #[test]
    fn shape_strings_are_validated() {
        assert_eq!(
            parse_shape("0,0, 10,0, 10,10").expect("valid shape"),
            vec![(0, 0), (10, 0), (10, 10)]
        );
        assert!(parse_shape("1,2,3").is_err());
        assert!(parse_shape("1,2,3,4").is_err());
        assert!(parse_shape("a,b,c,d,e,f").is_err());
        assert!(parse_shape("1,2,3,4,5,70000").is_err());
    }
}
