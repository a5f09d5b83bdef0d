//! Per-frame orchestration.
//!
//! The pipeline ties the stages together: every demuxed frame from a
//! capture source is decoded, pushed through the filter chain, offered to
//! plate recognition unless a filter emptied it, and fanned out to every
//! recorder when matches come back. Registry subscriptions wire and unwire
//! sources and recorders while the pipeline runs.
//!
//! Errors in any stage are logged and drop that frame only; other sources
//! and subsequent frames keep flowing.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::demux::FrameDemuxer;
use crate::detect::{bounding_rect, PlateDetector};
use crate::filter::{FilterHandle, ImageFilter};
use crate::frame::RawImage;
use crate::ingest::{CaptureSource, SourceEvent};
use crate::record::PlateRecorder;
use crate::registry::{Registry, RegistryEvent};

/// Bounded wait while a source's byte queue is empty.
const POLL_WAIT: Duration = Duration::from_millis(250);

/// Per-source instances built from the registry's filter handles. Keeping
/// instances per source isolates cross-frame filter state (the motion
/// baseline) to that source's frame sequence.
struct FilterChain {
    instances: HashMap<u64, Box<dyn ImageFilter>>,
}

impl FilterChain {
    fn new() -> Self {
        Self {
            instances: HashMap::new(),
        }
    }

    fn instance_for(&mut self, handle: &FilterHandle) -> &mut Box<dyn ImageFilter> {
        self.instances
            .entry(handle.id())
            .or_insert_with(|| handle.instantiate())
    }

    fn retain(&mut self, live: &HashSet<u64>) {
        self.instances.retain(|id, _| live.contains(id));
    }
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
}

/// Drives frames from sources through filters, recognition and recorders.
pub struct Pipeline {
    sources: Arc<Registry<CaptureSource>>,
    filters: Arc<Registry<FilterHandle>>,
    recorders: Arc<Registry<dyn PlateRecorder>>,
    detector: Arc<dyn PlateDetector>,
    data_dir: PathBuf,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl Pipeline {
    pub fn new(
        sources: Arc<Registry<CaptureSource>>,
        filters: Arc<Registry<FilterHandle>>,
        recorders: Arc<Registry<dyn PlateRecorder>>,
        detector: Arc<dyn PlateDetector>,
        data_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            sources,
            filters,
            recorders,
            detector,
            data_dir,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Wire existing members, then keep wiring registry changes. Returns
    /// immediately; processing happens on per-source worker threads.
    pub fn run(self: &Arc<Self>) {
        for recorder in self.recorders.items() {
            if let Err(e) = recorder.start() {
                log::error!("recorder {}: start failed: {:#}", recorder.kind(), e);
            }
        }
        let recorder_events = self.recorders.subscribe();
        std::thread::spawn(move || {
            for event in recorder_events {
                match event {
                    RegistryEvent::Added(recorder) => {
                        if let Err(e) = recorder.start() {
                            log::error!("recorder {}: start failed: {:#}", recorder.kind(), e);
                        }
                    }
                    RegistryEvent::Removed(recorder) => recorder.stop(),
                }
            }
        });

        for source in self.sources.items() {
            self.attach_source(source);
        }
        let source_events = self.sources.subscribe();
        let pipeline = Arc::clone(self);
        std::thread::spawn(move || {
            for event in source_events {
                match event {
                    RegistryEvent::Added(source) => pipeline.attach_source(source),
                    RegistryEvent::Removed(source) => pipeline.detach_source(&source),
                }
            }
        });
    }

    /// Stop all sources and recorders and wind down the workers.
    pub fn shutdown(&self) {
        for source in self.sources.items() {
            source.stop();
        }
        let mut workers = self.workers.lock().expect("workers lock");
        for handle in workers.values() {
            handle.stop.store(true, Ordering::Relaxed);
        }
        workers.clear();
        drop(workers);
        for recorder in self.recorders.items() {
            recorder.stop();
        }
    }

    fn attach_source(self: &Arc<Self>, source: Arc<CaptureSource>) {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut workers = self.workers.lock().expect("workers lock");
            if let Some(previous) = workers.insert(
                source.name().to_string(),
                WorkerHandle {
                    stop: Arc::clone(&stop),
                },
            ) {
                previous.stop.store(true, Ordering::Relaxed);
            }
        }

        let pipeline = Arc::clone(self);
        let worker_source = Arc::clone(&source);
        std::thread::spawn(move || pipeline.worker_loop(worker_source, stop));

        if let Err(e) = source.start() {
            log::error!("source {}: start failed: {:#}", source.name(), e);
        }
        log::info!("source {}: attached to pipeline", source.name());
    }

    fn detach_source(&self, source: &Arc<CaptureSource>) {
        source.stop();
        let mut workers = self.workers.lock().expect("workers lock");
        if let Some(handle) = workers.remove(source.name()) {
            handle.stop.store(true, Ordering::Relaxed);
        }
        log::info!("source {}: detached from pipeline", source.name());
    }

    fn worker_loop(&self, source: Arc<CaptureSource>, stop: Arc<AtomicBool>) {
        let failures = source.subscribe();
        let mut demuxer = FrameDemuxer::new();
        let mut chain = FilterChain::new();

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            while let Ok(SourceEvent::Failed { name, code, .. }) = failures.try_recv() {
                log::debug!("supervisor: source {} failed with code {:?}", name, code);
            }
            let Some(chunk) = source.read_chunk(POLL_WAIT) else {
                continue;
            };
            for jpeg in demuxer.push(&chunk) {
                if let Err(e) = self.process_frame(&source, &jpeg, &mut chain) {
                    log::warn!("source {}: frame dropped: {:#}", source.name(), e);
                }
            }
        }
        log::info!("source {}: worker stopped", source.name());
    }

    fn process_frame(
        &self,
        source: &CaptureSource,
        jpeg: &[u8],
        chain: &mut FilterChain,
    ) -> Result<()> {
        let mut original = RawImage::from_jpeg(jpeg)?;
        let mut filtered = original.clone();

        let handles = self.filters.items();
        let live: HashSet<u64> = handles.iter().map(|h| h.id()).collect();
        chain.retain(&live);

        for handle in &handles {
            chain
                .instance_for(handle)
                .apply(&mut filtered)
                .with_context(|| format!("filter {}", handle.kind()))?;
            if handle.debug() {
                let path = self
                    .data_dir
                    .join(format!("{}_{}.jpeg", source.name(), handle.kind()));
                match filtered.to_jpeg() {
                    Ok(bytes) => {
                        if let Err(e) = std::fs::write(&path, bytes) {
                            log::warn!("debug artifact {} failed: {}", path.display(), e);
                        }
                    }
                    Err(e) => log::warn!("debug artifact encode failed: {:#}", e),
                }
            }
        }

        // A filter emptied the frame: nothing to recognize.
        if filtered.is_empty() {
            return Ok(());
        }

        let mut detection = self
            .detector
            .detect(&filtered.to_jpeg()?)
            .context("plate recognition")?;
        if detection.results.is_empty() {
            return Ok(());
        }

        // Attach a cropped plate image per match, from the frame the
        // recognizer actually saw.
        for plate in &mut detection.results {
            match bounding_rect(&plate.coordinates, filtered.width(), filtered.height()) {
                Ok(rect) => match filtered.region(&rect).and_then(|img| img.to_jpeg()) {
                    Ok(bytes) => plate.jpeg = Some(bytes),
                    Err(e) => log::warn!("plate crop failed: {:#}", e),
                },
                Err(e) => log::warn!("plate {}: {:#}", plate.plate, e),
            }
        }

        original.outline(&filtered.crop_lineage())?;

        for recorder in self.recorders.items() {
            if let Err(e) = recorder.record(&detection, source, &original, &filtered) {
                log::warn!("recorder {}: record failed: {:#}", recorder.kind(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Corner, DetectionResult, PlateResult};
    use crate::filter::FilterSpec;
    use crate::ingest::SourceOrigin;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct FakeDetector {
        calls: AtomicUsize,
        response: Mutex<DetectionResult>,
    }

    impl FakeDetector {
        fn returning(response: DetectionResult) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                response: Mutex::new(response),
            })
        }

        fn empty() -> Arc<Self> {
            Self::returning(DetectionResult::default())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PlateDetector for FakeDetector {
        fn detect(&self, _jpeg: &[u8]) -> Result<DetectionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.lock().expect("response").clone())
        }
    }

    #[derive(Default)]
    struct FakeRecorder {
        recorded: Mutex<Vec<(DetectionResult, RawImage)>>,
    }

    impl FakeRecorder {
        fn count(&self) -> usize {
            self.recorded.lock().expect("recorded").len()
        }
    }

    impl PlateRecorder for FakeRecorder {
        fn kind(&self) -> &'static str {
            "fake"
        }

        fn record(
            &self,
            detection: &DetectionResult,
            _source: &CaptureSource,
            original: &RawImage,
            _filtered: &RawImage,
        ) -> Result<()> {
            self.recorded
                .lock()
                .expect("recorded")
                .push((detection.clone(), original.clone()));
            Ok(())
        }
    }

    fn one_plate(width: f64, height: f64) -> DetectionResult {
        DetectionResult {
            epoch_time: 1_650_000_000_000,
            img_width: width as u32,
            img_height: height as u32,
            results: vec![PlateResult {
                plate: "TEST123".to_string(),
                confidence: 90.0,
                processing_time_ms: 8.0,
                coordinates: [
                    Corner { x: 2.0, y: 2.0 },
                    Corner {
                        x: width - 2.0,
                        y: 2.0,
                    },
                    Corner {
                        x: width - 2.0,
                        y: height - 2.0,
                    },
                    Corner {
                        x: 2.0,
                        y: height - 2.0,
                    },
                ],
                jpeg: None,
            }],
        }
    }

    struct Fixture {
        sources: Arc<Registry<CaptureSource>>,
        filters: Arc<Registry<FilterHandle>>,
        recorders: Arc<Registry<dyn PlateRecorder>>,
        pipeline: Arc<Pipeline>,
        recorder: Arc<FakeRecorder>,
        _dir: tempfile::TempDir,
    }

    fn fixture(detector: Arc<dyn PlateDetector>) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let sources: Arc<Registry<CaptureSource>> = Arc::new(Registry::new());
        let filters: Arc<Registry<FilterHandle>> = Arc::new(Registry::new());
        let recorders: Arc<Registry<dyn PlateRecorder>> = Arc::new(Registry::new());
        let recorder = Arc::new(FakeRecorder::default());
        let recorder_dyn: Arc<dyn PlateRecorder> = Arc::clone(&recorder) as Arc<dyn PlateRecorder>;
        recorders.add(recorder_dyn);
        let pipeline = Pipeline::new(
            Arc::clone(&sources),
            Arc::clone(&filters),
            Arc::clone(&recorders),
            detector,
            dir.path().to_path_buf(),
        );
        Fixture {
            sources,
            filters,
            recorders,
            pipeline,
            recorder,
            _dir: dir,
        }
    }

    fn test_jpeg(value: u8) -> Vec<u8> {
        RawImage::from_rgb(vec![value; 64 * 48 * 3], 64, 48)
            .expect("frame")
            .to_jpeg()
            .expect("jpeg")
    }

    fn test_source(name: &str) -> Arc<CaptureSource> {
        Arc::new(
            CaptureSource::new(name, 1.0, SourceOrigin::TestPattern)
                .expect("source")
                .with_transcoder("/nonexistent/transcoder-for-tests"),
        )
    }

    #[test]
    fn cleared_frame_short_circuits_recognition_and_recording() -> Result<()> {
        let detector = FakeDetector::empty();
        let fx = fixture(detector.clone() as Arc<dyn PlateDetector>);
        fx.filters
            .add(Arc::new(FilterHandle::new(FilterSpec::Motion, false)));

        let source = test_source("static scene");
        let mut chain = FilterChain::new();
        let jpeg = test_jpeg(40);

        // First frame passes the motion gate (no baseline yet).
        fx.pipeline.process_frame(&source, &jpeg, &mut chain)?;
        // An identical second frame is cleared by the gate.
        fx.pipeline.process_frame(&source, &jpeg, &mut chain)?;

        assert_eq!(detector.calls(), 1);
        assert_eq!(fx.recorder.count(), 0);
        Ok(())
    }

    #[test]
    fn zero_matches_short_circuit_recorders() -> Result<()> {
        let detector = FakeDetector::empty();
        let fx = fixture(detector.clone() as Arc<dyn PlateDetector>);

        let source = test_source("no plates");
        let mut chain = FilterChain::new();
        fx.pipeline
            .process_frame(&source, &test_jpeg(90), &mut chain)?;

        assert_eq!(detector.calls(), 1);
        assert_eq!(fx.recorder.count(), 0);
        Ok(())
    }

    #[test]
    fn matches_reach_every_recorder_with_crops_and_outline() -> Result<()> {
        let detector = FakeDetector::returning(one_plate(64.0, 48.0));
        let fx = fixture(detector.clone() as Arc<dyn PlateDetector>);

        let source = test_source("hit");
        let mut chain = FilterChain::new();
        fx.pipeline
            .process_frame(&source, &test_jpeg(120), &mut chain)?;

        assert_eq!(fx.recorder.count(), 1);
        let recorded = fx.recorder.recorded.lock().expect("recorded");
        let (detection, original) = &recorded[0];
        assert!(detection.results[0].jpeg.is_some(), "plate crop attached");
        // With no filters the lineage is the full frame, so the outline
        // lands on the original's border.
        let buf = original.buffer();
        assert_eq!(&buf[0..3], &[0, 255, 0]);
        Ok(())
    }

    #[test]
    fn debug_filters_persist_post_filter_state() -> Result<()> {
        let detector = FakeDetector::empty();
        let fx = fixture(detector.clone() as Arc<dyn PlateDetector>);
        fx.filters.add(Arc::new(FilterHandle::new(
            FilterSpec::Mask { shapes: vec![] },
            true,
        )));

        let source = test_source("debug cam");
        let mut chain = FilterChain::new();
        fx.pipeline
            .process_frame(&source, &test_jpeg(10), &mut chain)?;

        let artifact = fx._dir.path().join("debug cam_mask.jpeg");
        assert!(artifact.exists());
        Ok(())
    }

    #[test]
    fn registry_wiring_attaches_and_detaches_at_runtime() -> Result<()> {
        let detector = FakeDetector::returning(one_plate(64.0, 48.0));
        let fx = fixture(detector.clone() as Arc<dyn PlateDetector>);
        fx.pipeline.run();

        // Adding a source begins routing its frames, even though its
        // transcoder cannot launch here: bytes injected into its queue
        // stand in for subprocess output.
        let source = test_source("hotplug");
        fx.sources.add(Arc::clone(&source));
        std::thread::sleep(Duration::from_millis(100));

        source.inject_bytes(test_jpeg(33));
        wait_until(|| detector.calls() >= 1);
        wait_until(|| fx.recorder.count() >= 1);
        let recorded_before = fx.recorder.count();

        // Removing the recorder stops further invocations of that sink.
        let recorder_dyn = fx.recorders.get(0).expect("recorder present");
        assert!(fx.recorders.remove(&recorder_dyn));
        source.inject_bytes(test_jpeg(200));
        wait_until(|| detector.calls() >= 2);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fx.recorder.count(), recorded_before);

        // Removing the source stops its worker.
        let calls_before = detector.calls();
        fx.sources.remove(&source);
        std::thread::sleep(Duration::from_millis(600));
        source.inject_bytes(test_jpeg(77));
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(detector.calls(), calls_before);

        fx.pipeline.shutdown();
        Ok(())
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not reached within timeout");
    }
}
