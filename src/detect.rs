//! Plate recognition boundary.
//!
//! Recognition itself is an external HTTP service: we upload the filtered
//! frame as JPEG with a country hint and get plate matches back. The
//! pipeline derives a bounding rectangle from each match's corner
//! coordinates (clamped to the frame) and attaches a cropped plate image.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::frame::Roi;

const MULTIPART_BOUNDARY: &str = "----plate-sentry-frame";
const DEFAULT_COUNTRY_CODE: &str = "us";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One corner of a detected plate's quadrilateral, in frame pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Corner {
    pub x: f64,
    pub y: f64,
}

/// A single plate match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlateResult {
    pub plate: String,
    pub confidence: f64,
    #[serde(default)]
    pub processing_time_ms: f64,
    pub coordinates: [Corner; 4],
    /// Cropped plate image attached by the pipeline. Never serialized into
    /// detect payloads; sinks that want it publish the bytes separately.
    #[serde(skip)]
    pub jpeg: Option<Vec<u8>>,
}

/// Recognition service response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub epoch_time: u64,
    #[serde(default)]
    pub img_width: u32,
    #[serde(default)]
    pub img_height: u32,
    #[serde(default)]
    pub results: Vec<PlateResult>,
}

/// Seam between the pipeline and the recognition collaborator.
pub trait PlateDetector: Send + Sync {
    fn detect(&self, jpeg: &[u8]) -> Result<DetectionResult>;
}

/// HTTP client for an OpenALPR-compatible recognition endpoint.
pub struct AlprClient {
    url: Url,
    country_code: String,
    agent: ureq::Agent,
}

impl AlprClient {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
        }
    }

    pub fn with_country_code(mut self, country_code: &str) -> Self {
        self.country_code = country_code.to_string();
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl PlateDetector for AlprClient {
    fn detect(&self, jpeg: &[u8]) -> Result<DetectionResult> {
        let body = multipart_body(jpeg, &self.country_code);
        let response = self
            .agent
            .post(self.url.as_str())
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
            )
            .send_bytes(&body)
            .with_context(|| format!("recognition request to {}", self.url))?;
        let result: DetectionResult = serde_json::from_reader(response.into_reader())
            .context("parse recognition response")?;
        Ok(result)
    }
}

/// Assemble the multipart/form-data request: the frame as an `upload` file
/// part plus the `country_code` text part.
fn multipart_body(jpeg: &[u8], country_code: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(jpeg.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"upload\"; filename=\"frame.jpeg\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"country_code\"\r\n\r\n");
    body.extend_from_slice(country_code.as_bytes());
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

/// Bounding rectangle of a plate quadrilateral, clamped to the frame.
/// Returns an error when the corners collapse outside the frame entirely.
pub fn bounding_rect(corners: &[Corner; 4], frame_w: u32, frame_h: u32) -> Result<Roi> {
    let xs = corners.iter().map(|c| c.x);
    let ys = corners.iter().map(|c| c.y);
    let min_x = xs.clone().fold(f64::INFINITY, f64::min).max(0.0);
    let max_x = xs.fold(f64::NEG_INFINITY, f64::max).min(frame_w as f64);
    let min_y = ys.clone().fold(f64::INFINITY, f64::min).max(0.0);
    let max_y = ys.fold(f64::NEG_INFINITY, f64::max).min(frame_h as f64);

    let left = min_x.floor() as i64;
    let top = min_y.floor() as i64;
    let width = max_x.ceil() as i64 - left;
    let height = max_y.ceil() as i64 - top;
    if width <= 0 || height <= 0 || left >= frame_w as i64 || top >= frame_h as i64 {
        return Err(anyhow!("plate corners lie outside the frame"));
    }
    let left = left as u32;
    let top = top as u32;
    Ok(Roi::new(
        left,
        top,
        (width as u32).min(frame_w - left),
        (height as u32).min(frame_h - top),
    ))
}
