//! Capture sources: transcoder subprocess supervision.
//!
//! A `CaptureSource` keeps exactly one external transcoder process alive
//! per configured video origin and is responsible for:
//! - Spawning the transcoder with the fixed MJPEG argument template
//! - Harvesting stdout bytes into a queue the demuxer side drains
//! - Retaining the most recent stderr text as diagnostic detail
//! - Detecting abnormal exits and scheduling a single delayed retry
//! - Controlled start/stop/restart with a graceful `q` quit directive
//!
//! Shutdown is graceful only: a wedged subprocess that ignores the quit
//! directive can stall teardown.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::RestartingError;

/// Delay between an abnormal exit and the relaunch attempt.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 8192;
const STDERR_TAIL: usize = 2048;

/// Source names may only contain alphanumerics, underscores, hyphens or
/// spaces, and must be non-empty.
pub fn validate_source_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_\- ]+$").unwrap());
    if name.is_empty() {
        return Err(anyhow!("source name cannot be empty"));
    }
    if !re.is_match(name) {
        return Err(anyhow!(
            "source name may only contain alphanumerics, underscores, hyphens or spaces"
        ));
    }
    Ok(())
}

/// Where a source's video comes from. An unbound source plays the built-in
/// synthetic test pattern.
#[derive(Clone, Debug)]
pub enum SourceOrigin {
    TestPattern,
    File { path: String },
    Rtsp { url: url::Url },
}

/// Lifecycle notifications published to subscribed supervisors.
#[derive(Clone, Debug)]
pub enum SourceEvent {
    Failed {
        name: String,
        code: Option<i32>,
        detail: String,
    },
}

/// Last recorded subprocess failure: exit code plus stderr tail.
#[derive(Clone, Debug)]
pub struct SourceFailure {
    pub code: Option<i32>,
    pub detail: String,
}

/// Supervision state of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    RetryPending,
}

/// Queue of raw stdout chunks between the reader thread and the demuxer
/// side. Consumers block with a bounded wait instead of spinning.
struct ByteQueue {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
}

impl ByteQueue {
    fn new() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, chunk: Vec<u8>) {
        let mut chunks = self.chunks.lock().expect("byte queue lock");
        chunks.push_back(chunk);
        self.available.notify_all();
    }

    fn pop_timeout(&self, wait: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + wait;
        let mut chunks = self.chunks.lock().expect("byte queue lock");
        loop {
            if let Some(chunk) = chunks.pop_front() {
                return Some(chunk);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(chunks, deadline - now)
                .expect("byte queue lock");
            chunks = guard;
        }
    }
}

struct State {
    capture_interval: f64,
    pre_input_args: Vec<String>,
    pre_output_args: Vec<String>,
    always_restart: bool,
    run_state: RunState,
    restarting: bool,
    stdin: Option<ChildStdin>,
    stderr_tail: String,
    last_failure: Option<SourceFailure>,
    retry_count: u64,
    retry_generation: u64,
}

struct Shared {
    name: String,
    origin: SourceOrigin,
    transcoder: String,
    retry_delay: Duration,
    bytes: ByteQueue,
    state: Mutex<State>,
    retry_cond: Condvar,
    events: Mutex<Vec<Sender<SourceEvent>>>,
}

/// Supervisor for one transcoder subprocess.
pub struct CaptureSource {
    shared: Arc<Shared>,
}

impl CaptureSource {
    pub fn new(name: &str, capture_interval: f64, origin: SourceOrigin) -> Result<Self> {
        validate_source_name(name)?;
        if !capture_interval.is_finite() {
            return Err(anyhow!("capture interval must be numeric"));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                origin,
                transcoder: "ffmpeg".to_string(),
                retry_delay: RETRY_DELAY,
                bytes: ByteQueue::new(),
                state: Mutex::new(State {
                    capture_interval: capture_interval.abs(),
                    pre_input_args: Vec::new(),
                    pre_output_args: Vec::new(),
                    always_restart: false,
                    run_state: RunState::Stopped,
                    restarting: false,
                    stdin: None,
                    stderr_tail: String::new(),
                    last_failure: None,
                    retry_count: 0,
                    retry_generation: 0,
                }),
                retry_cond: Condvar::new(),
                events: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Override the transcoder binary (default `ffmpeg`).
    pub fn with_transcoder(mut self, path: &str) -> Self {
        Arc::get_mut(&mut self.shared)
            .expect("with_transcoder before sharing")
            .transcoder = path.to_string();
        self
    }

    /// Override the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        Arc::get_mut(&mut self.shared)
            .expect("with_retry_delay before sharing")
            .retry_delay = delay;
        self
    }

    pub fn with_pre_input_args(self, args: Vec<String>) -> Self {
        self.shared.state.lock().expect("state lock").pre_input_args = args;
        self
    }

    pub fn with_pre_output_args(self, args: Vec<String>) -> Self {
        self.shared.state.lock().expect("state lock").pre_output_args = args;
        self
    }

    /// Relaunch even after a clean exit (finite file inputs loop forever).
    pub fn with_always_restart(self, always: bool) -> Self {
        self.shared.state.lock().expect("state lock").always_restart = always;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn origin(&self) -> &SourceOrigin {
        &self.shared.origin
    }

    pub fn capture_interval(&self) -> f64 {
        self.shared.state.lock().expect("state lock").capture_interval
    }

    pub fn run_state(&self) -> RunState {
        self.shared.state.lock().expect("state lock").run_state
    }

    pub fn running(&self) -> bool {
        matches!(self.run_state(), RunState::Running | RunState::Starting)
    }

    pub fn restarting(&self) -> bool {
        self.shared.state.lock().expect("state lock").restarting
    }

    pub fn last_failure(&self) -> Option<SourceFailure> {
        self.shared.state.lock().expect("state lock").last_failure.clone()
    }

    pub fn retry_count(&self) -> u64 {
        self.shared.state.lock().expect("state lock").retry_count
    }

    /// Subscribe to lifecycle events (subprocess failures).
    pub fn subscribe(&self) -> Receiver<SourceEvent> {
        let (tx, rx) = channel();
        self.shared.events.lock().expect("events lock").push(tx);
        rx
    }

    /// Pull the next stdout chunk, waiting up to `wait` when the queue is
    /// empty. `None` means no bytes arrived within the window.
    pub fn read_chunk(&self, wait: Duration) -> Option<Vec<u8>> {
        self.shared.bytes.pop_timeout(wait)
    }

    /// Launch the transcoder. No-op while already running; clears prior
    /// failure state.
    pub fn start(&self) -> Result<()> {
        Shared::start(&self.shared)
    }

    /// Cancel any pending retry and ask the subprocess to quit gracefully.
    /// Does not block for exit.
    pub fn stop(&self) {
        let mut st = self.shared.state.lock().expect("state lock");
        st.retry_generation += 1;
        self.shared.retry_cond.notify_all();
        if st.run_state == RunState::RetryPending {
            st.run_state = RunState::Stopped;
        }
        if st.stdin.is_some() {
            if st.run_state == RunState::Running {
                st.run_state = RunState::Stopping;
            }
            let stdin = st.stdin.as_mut().unwrap();
            if let Err(e) = stdin.write_all(b"q").and_then(|_| stdin.flush()) {
                log::warn!(
                    "source {}: failed to send quit directive: {}",
                    self.shared.name,
                    e
                );
            }
        }
    }

    /// Mark intent to relaunch and trigger a stop. Idempotent; the waiter
    /// relaunches once the exit completes.
    pub fn restart(&self) {
        {
            let mut st = self.shared.state.lock().expect("state lock");
            if st.restarting {
                return;
            }
            st.restarting = true;
            if st.run_state == RunState::Running {
                st.run_state = RunState::Restarting;
            }
        }
        self.stop();
    }

    /// Update the capture interval (stored as its absolute value). Fails
    /// with `RestartingError` while a restart is pending; triggers a
    /// restart when the source is running.
    pub fn set_capture_interval(&self, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(anyhow!("capture interval must be numeric"));
        }
        let was_running = {
            let mut st = self.shared.state.lock().expect("state lock");
            if st.restarting {
                return Err(RestartingError.into());
            }
            st.capture_interval = value.abs();
            matches!(st.run_state, RunState::Running | RunState::Starting)
        };
        if was_running {
            self.restart();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_bytes(&self, chunk: Vec<u8>) {
        self.shared.bytes.push(chunk);
    }
}

impl Shared {
    fn start(shared: &Arc<Shared>) -> Result<()> {
        let args = {
            let mut st = shared.state.lock().expect("state lock");
            if matches!(st.run_state, RunState::Running | RunState::Starting) {
                return Ok(());
            }
            st.run_state = RunState::Starting;
            st.last_failure = None;
            st.stderr_tail.clear();
            build_args(
                &shared.origin,
                st.capture_interval,
                &st.pre_input_args,
                &st.pre_output_args,
            )
        };

        log::info!(
            "source {}: launching {} {}",
            shared.name,
            shared.transcoder,
            args.join(" ")
        );
        let spawned = Command::new(&shared.transcoder)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                shared.state.lock().expect("state lock").run_state = RunState::Stopped;
                return Err(anyhow!(
                    "source {}: failed to spawn transcoder {}: {}",
                    shared.name,
                    shared.transcoder,
                    e
                ));
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut st = shared.state.lock().expect("state lock");
            st.stdin = stdin;
            st.run_state = RunState::Running;
        }

        // Reader: stdout chunks feed the byte queue until EOF.
        if let Some(mut stdout) = stdout {
            let reader_shared = Arc::clone(shared);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => reader_shared.bytes.push(buf[..n].to_vec()),
                    }
                }
            });
        }

        // Stderr: retain the tail as the most recent diagnostic text.
        let stderr_handle = stderr.map(|mut stderr| {
            let stderr_shared = Arc::clone(shared);
            std::thread::spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match stderr.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                            let mut st = stderr_shared.state.lock().expect("state lock");
                            st.stderr_tail.push_str(&text);
                            if st.stderr_tail.len() > STDERR_TAIL {
                                let cut = st.stderr_tail.len() - STDERR_TAIL;
                                st.stderr_tail.drain(..cut);
                            }
                        }
                    }
                }
            })
        });

        // Waiter: classify the exit, relaunch or schedule a retry.
        let waiter_shared = Arc::clone(shared);
        std::thread::spawn(move || {
            let status = child.wait();
            if let Some(handle) = stderr_handle {
                let _ = handle.join();
            }

            let (code, success) = match status {
                Ok(status) => (status.code(), status.success()),
                Err(_) => (None, false),
            };

            let (restart_requested, record_failure, detail) = {
                let mut st = waiter_shared.state.lock().expect("state lock");
                st.stdin = None;
                st.run_state = RunState::Stopped;
                let restart_requested = st.restarting;
                st.restarting = false;
                let record_failure = !success || st.always_restart;
                let detail = st.stderr_tail.clone();
                if !restart_requested && record_failure {
                    st.last_failure = Some(SourceFailure {
                        code,
                        detail: detail.clone(),
                    });
                }
                (restart_requested, record_failure, detail)
            };

            if restart_requested {
                log::info!("source {}: relaunching after requested restart", waiter_shared.name);
                if let Err(e) = Shared::start(&waiter_shared) {
                    log::error!("source {}: relaunch failed: {}", waiter_shared.name, e);
                }
                return;
            }

            if record_failure {
                log::warn!(
                    "source {}: transcoder exited (code {:?}): {}",
                    waiter_shared.name,
                    code,
                    detail.trim()
                );
                Shared::emit(
                    &waiter_shared,
                    SourceEvent::Failed {
                        name: waiter_shared.name.clone(),
                        code,
                        detail,
                    },
                );
                Shared::schedule_retry(&waiter_shared);
            } else {
                log::info!("source {}: transcoder exited cleanly", waiter_shared.name);
            }
        });

        Ok(())
    }

    fn emit(shared: &Arc<Shared>, event: SourceEvent) {
        shared
            .events
            .lock()
            .expect("events lock")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Arm a single delayed relaunch. Cancelled when the retry generation
    /// advances (a `stop()` or a newer schedule).
    fn schedule_retry(shared: &Arc<Shared>) {
        let generation = {
            let mut st = shared.state.lock().expect("state lock");
            st.run_state = RunState::RetryPending;
            st.retry_generation += 1;
            st.retry_generation
        };
        let timer_shared = Arc::clone(shared);
        std::thread::spawn(move || {
            let deadline = Instant::now() + timer_shared.retry_delay;
            let mut st = timer_shared.state.lock().expect("state lock");
            loop {
                if st.retry_generation != generation {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = timer_shared
                    .retry_cond
                    .wait_timeout(st, deadline - now)
                    .expect("state lock");
                st = guard;
            }
            st.retry_count += 1;
            drop(st);
            log::info!("source {}: retrying transcoder launch", timer_shared.name);
            if let Err(e) = Shared::start(&timer_shared) {
                log::error!("source {}: retry launch failed: {}", timer_shared.name, e);
            }
        });
    }
}

/// Fixed transcoder argument template. Output is a continuous MJPEG byte
/// stream on stdout at one frame per `capture_interval` seconds.
fn build_args(
    origin: &SourceOrigin,
    capture_interval: f64,
    pre_input: &[String],
    pre_output: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];
    args.extend(pre_input.iter().cloned());
    match origin {
        SourceOrigin::TestPattern => {
            args.extend(["-f", "lavfi", "-i", "smptebars"].map(String::from));
        }
        SourceOrigin::File { path } => {
            args.extend(["-re", "-i"].map(String::from));
            args.push(path.clone());
        }
        SourceOrigin::Rtsp { url } => {
            args.push("-i".to_string());
            args.push(url.to_string());
        }
    }
    args.extend(["-f", "mjpeg", "-q:v", "4", "-r"].map(String::from));
    args.push(format!("1/{}", format_interval(capture_interval)));
    args.push("-an".to_string());
    args.extend(pre_output.iter().cloned());
    args.push("-".to_string());
    args
}

fn format_interval(value: f64) -> String {
    if value.fract() == 0.0 && value < u64::MAX as f64 {
        format!("{}", value as u64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_names_are_validated() {
        assert!(validate_source_name("driveway cam-1_a").is_ok());
        assert!(validate_source_name("").is_err());
        assert!(validate_source_name("bad/name").is_err());
        assert!(validate_source_name("semi;colon").is_err());

        assert!(CaptureSource::new("", 1.0, SourceOrigin::TestPattern).is_err());
        assert!(CaptureSource::new("ok name", 1.0, SourceOrigin::TestPattern).is_ok());
    }

    #[test]
    fn capture_interval_is_stored_absolute() -> Result<()> {
        let source = CaptureSource::new("abs", -2.5, SourceOrigin::TestPattern)?;
        assert_eq!(source.capture_interval(), 2.5);

        source.set_capture_interval(-4.0)?;
        assert_eq!(source.capture_interval(), 4.0);

        assert!(source.set_capture_interval(f64::NAN).is_err());
        assert!(CaptureSource::new("nan", f64::INFINITY, SourceOrigin::TestPattern).is_err());
        Ok(())
    }

    #[test]
    fn interval_mutation_while_restarting_is_a_distinct_error() -> Result<()> {
        let source = CaptureSource::new("pending", 1.0, SourceOrigin::TestPattern)?;
        source.restart();
        assert!(source.restarting());

        let err = source.set_capture_interval(2.0).unwrap_err();
        assert!(err.downcast_ref::<RestartingError>().is_some());
        // The stored value is untouched.
        assert_eq!(source.capture_interval(), 1.0);
        Ok(())
    }

    #[test]
    fn argument_template_is_fixed() {
        let args = build_args(
            &SourceOrigin::Rtsp {
                url: url::Url::parse("rtsp://cam.local/stream").unwrap(),
            },
            5.0,
            &["-rtsp_transport".to_string(), "tcp".to_string()],
            &["-vf".to_string(), "hflip".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "-hide_banner",
                "-loglevel",
                "error",
                "-rtsp_transport",
                "tcp",
                "-i",
                "rtsp://cam.local/stream",
                "-f",
                "mjpeg",
                "-q:v",
                "4",
                "-r",
                "1/5",
                "-an",
                "-vf",
                "hflip",
                "-"
            ]
        );
    }

    #[test]
    fn file_and_unbound_input_specs() {
        let file_args = build_args(
            &SourceOrigin::File {
                path: "/videos/demo.mp4".to_string(),
            },
            2.5,
            &[],
            &[],
        );
        let spec: Vec<&str> = file_args[3..6].iter().map(String::as_str).collect();
        assert_eq!(spec, ["-re", "-i", "/videos/demo.mp4"]);
        assert!(file_args.contains(&"1/2.5".to_string()));

        let unbound = build_args(&SourceOrigin::TestPattern, 1.0, &[], &[]);
        let spec: Vec<&str> = unbound[3..7].iter().map(String::as_str).collect();
        assert_eq!(spec, ["-f", "lavfi", "-i", "smptebars"]);
    }

    #[test]
    fn missing_transcoder_fails_synchronously() -> Result<()> {
        let source = CaptureSource::new("missing", 1.0, SourceOrigin::TestPattern)?
            .with_transcoder("/nonexistent/transcoder-binary");
        assert!(source.start().is_err());
        assert_eq!(source.run_state(), RunState::Stopped);
        Ok(())
    }

    #[test]
    fn abnormal_exit_schedules_exactly_one_delayed_retry() -> Result<()> {
        // `false` ignores the argument template and exits with code 1,
        // standing in for a transcoder that dies immediately.
        let delay = Duration::from_millis(400);
        let source = CaptureSource::new("flaky", 1.0, SourceOrigin::TestPattern)?
            .with_transcoder("false")
            .with_retry_delay(delay);
        let events = source.subscribe();

        source.start()?;
        let started = Instant::now();

        let first = events.recv_timeout(Duration::from_secs(5)).expect("failure event");
        let SourceEvent::Failed { name, code, .. } = first;
        assert_eq!(name, "flaky");
        assert_eq!(code, Some(1));
        // The waiter arms the retry right after emitting the event.
        std::thread::sleep(Duration::from_millis(50));

        // Failure state is exposed until the next successful start.
        let failure = source.last_failure().expect("failure recorded");
        assert_eq!(failure.code, Some(1));
        assert_eq!(source.run_state(), RunState::RetryPending);

        // No second attempt before the delay elapses...
        assert!(events.recv_timeout(delay / 4).is_err());
        // ...then exactly one retry fires (and fails again).
        let _second = events.recv_timeout(Duration::from_secs(5)).expect("retry event");
        assert!(started.elapsed() >= delay);
        assert_eq!(source.retry_count(), 1);

        source.stop();
        Ok(())
    }

    #[test]
    fn stop_cancels_a_pending_retry() -> Result<()> {
        let delay = Duration::from_millis(200);
        let source = CaptureSource::new("cancelled", 1.0, SourceOrigin::TestPattern)?
            .with_transcoder("false")
            .with_retry_delay(delay);
        let events = source.subscribe();

        source.start()?;
        let _first = events.recv_timeout(Duration::from_secs(5)).expect("failure event");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(source.run_state(), RunState::RetryPending);

        source.stop();
        assert_eq!(source.run_state(), RunState::Stopped);

        // The cancelled timer never relaunches.
        assert!(events.recv_timeout(delay * 3).is_err());
        assert_eq!(source.retry_count(), 0);
        Ok(())
    }
}
