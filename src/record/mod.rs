//! Detection sinks.
//!
//! Recorders consume `(detection, source, original, filtered)` tuples for
//! every non-empty detection and persist or forward them. Each recorder
//! owns its external resource (database connection, broker session, index
//! log) and contains its own operational errors; a failing sink must not
//! take down the pipeline or its sibling sinks.

pub mod file;
pub mod mqtt;
pub mod sqlite;

use anyhow::Result;

use crate::detect::DetectionResult;
use crate::frame::RawImage;
use crate::ingest::CaptureSource;

/// A detection sink with an independent lifecycle: `start` runs when the
/// recorder is attached to the registry, `stop` when it is removed.
pub trait PlateRecorder: Send + Sync {
    /// Stable kind tag (`sqlite`, `mqtt`, `file`).
    fn kind(&self) -> &'static str;

    /// Open connections / spawn the sink's worker. Default: nothing to do.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Persist one detection. `original` carries the crop-lineage outline;
    /// `filtered` is the frame recognition actually saw.
    fn record(
        &self,
        detection: &DetectionResult,
        source: &CaptureSource,
        original: &RawImage,
        filtered: &RawImage,
    ) -> Result<()>;

    /// Release external resources. Default: nothing to do.
    fn stop(&self) {}
}
