//! plate-sentry
//!
//! A supervised streaming-media pipeline for automatic license plate
//! recognition:
//!
//! 1. Each configured source keeps an external transcoder subprocess
//!    alive, turning a camera stream or video file into a continuous
//!    MJPEG byte stream (`ingest`).
//! 2. A demuxer splits that stream into discrete JPEG frames (`demux`).
//! 3. Frames run through an ordered filter chain: motion gating, privacy
//!    masking (`filter`, `frame`).
//! 4. Surviving frames go to an external recognition service (`detect`).
//! 5. Detections fan out to SQLite / MQTT / file sinks (`record`).
//!
//! Sources, filters and recorders live in observable registries
//! (`registry`) so stages can be attached and detached while the pipeline
//! runs (`pipeline`). Configuration is a JSON document with an explicit
//! in-memory store (`config`).

pub mod config;
pub mod demux;
pub mod detect;
pub mod filter;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod record;
pub mod registry;

pub use config::{
    build_detector, build_filter, build_recorder, build_source, AlprConfig, Config, ConfigStore,
    FilterConfig, RecorderConfig, SourceConfig,
};
pub use demux::FrameDemuxer;
pub use detect::{AlprClient, Corner, DetectionResult, PlateDetector, PlateResult};
pub use filter::{FilterHandle, FilterSpec, ImageFilter};
pub use frame::{RawImage, Roi};
pub use ingest::{CaptureSource, RunState, SourceEvent, SourceFailure, SourceOrigin};
pub use pipeline::Pipeline;
pub use record::file::FilePlateRecorder;
pub use record::mqtt::{MqttPlateRecorder, MqttRecorderConfig};
pub use record::sqlite::SqlitePlateRecorder;
pub use record::PlateRecorder;
pub use registry::{Registry, RegistryEvent};

/// The three pipeline registries.
pub type Sources = Registry<CaptureSource>;
pub type Filters = Registry<FilterHandle>;
pub type Recorders = Registry<dyn PlateRecorder>;

/// Returned when capture settings are mutated while a restart is already
/// pending. Callers can retry once the relaunch has completed.
#[derive(Clone, Copy, Debug)]
pub struct RestartingError;

impl std::fmt::Display for RestartingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "currently restarting; try again in a moment")
    }
}

impl std::error::Error for RestartingError {}
