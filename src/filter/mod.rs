//! Per-frame image filters.
//!
//! Filters transform (or empty) the working copy of a frame before it is
//! offered to plate recognition. The registry holds `FilterHandle`s —
//! configuration plus identity — while each source worker instantiates its
//! own `ImageFilter` chain from them, so cross-frame filter state (the
//! motion baseline) is never shared between sources.

pub mod mask;
pub mod motion;

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::RawImage;
use mask::MaskImageFilter;
use motion::MotionImageFilter;

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// A per-frame transformation stage. Implementations may mutate the frame
/// in place or clear it to stop further processing.
pub trait ImageFilter: Send {
    /// Stable kind tag (`motion`, `mask`), used for debug artifact naming.
    fn kind(&self) -> &'static str;

    fn apply(&mut self, frame: &mut RawImage) -> Result<()>;
}

/// Filter variant and its configuration.
#[derive(Clone, Debug)]
pub enum FilterSpec {
    Motion,
    Mask { shapes: Vec<Vec<(u16, u16)>> },
}

impl FilterSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            FilterSpec::Motion => "motion",
            FilterSpec::Mask { .. } => "mask",
        }
    }
}

/// Registry-held filter description: spec, debug flag and a process-unique
/// identity so per-source instances can be matched to their handle.
pub struct FilterHandle {
    id: u64,
    debug: bool,
    spec: FilterSpec,
}

impl FilterHandle {
    pub fn new(spec: FilterSpec, debug: bool) -> Self {
        Self {
            id: NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed),
            debug,
            spec,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn kind(&self) -> &'static str {
        self.spec.kind()
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    /// Build a fresh filter instance for one source's chain.
    pub fn instantiate(&self) -> Box<dyn ImageFilter> {
        match &self.spec {
            FilterSpec::Motion => Box::new(MotionImageFilter::new()),
            FilterSpec::Mask { shapes } => Box::new(MaskImageFilter::new(shapes.clone())),
        }
    }
}
