//! Motion-gated cropping.
//!
//! `MotionImageFilter` suppresses frames with no significant change from
//! the immediately preceding frame and crops the rest to the largest
//! changed region. Filter work may be driven concurrently, so an admission
//! queue enforces strict FIFO processing: frame N's diff is always computed
//! against frame N-1's snapshot, never against a baseline clobbered by an
//! out-of-order completion of frame N+1.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::ImageFilter;
use crate::frame::{RawImage, Roi};

/// Working width frames are downscaled to before diffing.
const PROCESSING_WIDTH: u32 = 640;
/// Gaussian blur strength (15x15-kernel equivalent).
const BLUR_SIGMA: f32 = 2.5;
/// Per-pixel absolute-difference threshold for the binary change mask.
const DIFF_THRESHOLD: u8 = 25;
/// Square dilation radius (5x5 kernel) merging nearby changed regions.
const DILATE_RADIUS: u32 = 2;

/// FIFO discipline for asynchronous filter work. Tickets are issued and
/// enqueued under one lock, so submission order is queue order; a ticket
/// only gets its turn at the head of the queue and is removed once its job
/// completes.
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    turn: Condvar,
}

struct QueueState {
    next_ticket: u64,
    waiting: VecDeque<u64>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_ticket: 0,
                waiting: VecDeque::new(),
            }),
            turn: Condvar::new(),
        }
    }

    /// Record a unit of work in submission order.
    pub fn submit(&self) -> u64 {
        let mut state = self.state.lock().expect("admission lock");
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push_back(ticket);
        ticket
    }

    /// Block until `ticket` reaches the head of the queue.
    pub fn wait_turn(&self, ticket: u64) {
        let mut state = self.state.lock().expect("admission lock");
        while state.waiting.front() != Some(&ticket) {
            state = self.turn.wait(state).expect("admission lock");
        }
    }

    /// Mark `ticket`'s job complete and admit the next in line.
    pub fn complete(&self, ticket: u64) {
        let mut state = self.state.lock().expect("admission lock");
        debug_assert_eq!(state.waiting.front(), Some(&ticket));
        state.waiting.pop_front();
        self.turn.notify_all();
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Motion-gated cropper with a per-instance previous-frame baseline.
pub struct MotionImageFilter {
    queue: AdmissionQueue,
    prior: Mutex<Option<RawImage>>,
}

impl MotionImageFilter {
    pub fn new() -> Self {
        Self {
            queue: AdmissionQueue::new(),
            prior: Mutex::new(None),
        }
    }

    /// Run one frame through the gate. Safe to call from multiple threads;
    /// frames are processed strictly in submission order.
    pub fn process(&self, frame: &mut RawImage) -> Result<()> {
        let ticket = self.queue.submit();
        self.process_ticketed(ticket, frame)
    }

    fn process_ticketed(&self, ticket: u64, frame: &mut RawImage) -> Result<()> {
        self.queue.wait_turn(ticket);
        let result = self.run_gated(frame);
        self.queue.complete(ticket);
        result
    }

    fn run_gated(&self, frame: &mut RawImage) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        // Snapshot the input as the new baseline before diffing: the
        // baseline is this filter step's input, not its output.
        let prior = {
            let mut guard = self.prior.lock().expect("prior lock");
            guard.replace(frame.clone())
        };
        let Some(prior) = prior else {
            return Ok(());
        };

        let scale = PROCESSING_WIDTH as f64 / frame.width() as f64;
        let target_h = ((frame.height() as f64 * scale).round() as u32).max(1);

        let current = to_processing_gray(frame, PROCESSING_WIDTH, target_h)?;
        let baseline = to_processing_gray(&prior, PROCESSING_WIDTH, target_h)?;

        let mut mask = vec![0u8; current.len()];
        for (out, (a, b)) in mask.iter_mut().zip(current.iter().zip(baseline.iter())) {
            let diff = a.abs_diff(*b);
            *out = if diff > DIFF_THRESHOLD { 255 } else { 0 };
        }
        let mask = dilate(&mask, PROCESSING_WIDTH, target_h, DILATE_RADIUS);

        let regions = connected_regions(&mask, PROCESSING_WIDTH, target_h);
        let Some(largest) = largest_region(&regions) else {
            // No motion: empty the frame so nothing downstream runs.
            frame.clear();
            return Ok(());
        };

        let crop = scale_region_up(&largest, scale, frame.width(), frame.height());
        frame.crop(&crop)
    }
}

impl Default for MotionImageFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFilter for MotionImageFilter {
    fn kind(&self) -> &'static str {
        "motion"
    }

    fn apply(&mut self, frame: &mut RawImage) -> Result<()> {
        self.process(frame)
    }
}

/// Downscale to the working size, grayscale, blur. Returns the raw
/// luminance buffer.
fn to_processing_gray(frame: &RawImage, width: u32, height: u32) -> Result<Vec<u8>> {
    let rgb = RgbImage::from_raw(frame.width(), frame.height(), frame.buffer().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match declared dimensions"))?;
    let resized = imageops::resize(&rgb, width, height, FilterType::Triangle);
    let gray: GrayImage = imageops::grayscale(&resized);
    let blurred = imageops::blur(&gray, BLUR_SIGMA);
    Ok(blurred.into_raw())
}

/// Binary dilation with a square kernel of the given radius.
fn dilate(mask: &[u8], width: u32, height: u32, radius: u32) -> Vec<u8> {
    let (w, h, r) = (width as i64, height as i64, radius as i64);
    let mut out = vec![0u8; mask.len()];
    for y in 0..h {
        for x in 0..w {
            if mask[(y * w + x) as usize] == 0 {
                continue;
            }
            for dy in -r..=r {
                let ny = y + dy;
                if ny < 0 || ny >= h {
                    continue;
                }
                for dx in -r..=r {
                    let nx = x + dx;
                    if nx < 0 || nx >= w {
                        continue;
                    }
                    out[(ny * w + nx) as usize] = 255;
                }
            }
        }
    }
    out
}

/// Bounding boxes of 8-connected changed regions, in raster discovery
/// order.
fn connected_regions(mask: &[u8], width: u32, height: u32) -> Vec<Roi> {
    let (w, h) = (width as usize, height as usize);
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if mask[start] == 0 || visited[start] {
            continue;
        }
        let (mut min_x, mut min_y) = (w, h);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        visited[start] = true;
        stack.push(start);
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let nidx = ny as usize * w + nx as usize;
                    if mask[nidx] != 0 && !visited[nidx] {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }
        regions.push(Roi::new(
            min_x as u32,
            min_y as u32,
            (max_x - min_x + 1) as u32,
            (max_y - min_y + 1) as u32,
        ));
    }
    regions
}

/// Largest bounding box by area; ties keep the first encountered.
fn largest_region(regions: &[Roi]) -> Option<Roi> {
    let mut best: Option<Roi> = None;
    for region in regions {
        match best {
            Some(current) if region.area() <= current.area() => {}
            _ => best = Some(*region),
        }
    }
    best
}

/// Map a working-resolution box back to original resolution, clamped to the
/// frame.
fn scale_region_up(region: &Roi, scale: f64, frame_w: u32, frame_h: u32) -> Roi {
    let left = ((region.left as f64 / scale).round() as u32).min(frame_w.saturating_sub(1));
    let top = ((region.top as f64 / scale).round() as u32).min(frame_h.saturating_sub(1));
    let width = ((region.width as f64 / scale).round() as u32)
        .max(1)
        .min(frame_w - left);
    let height = ((region.height as f64 / scale).round() as u32)
        .max(1)
        .min(frame_h - top);
    Roi::new(left, top, width, height)
}
