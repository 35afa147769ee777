//! Multi-frame capture sequences.
//!
//! A sequence runs `count` exposures back to back on a dedicated worker thread,
//! with an optional pause between frames. Every wait is a short sleep followed
//! by a check of the shared abort flag, so [`SequenceOrchestrator::stop_sequence`]
//! returns within roughly one polling period.
//!
//! Per frame the worker:
//!
//! 1. starts the exposure and waits (bounded) for it to begin
//! 2. polls until the exposure is no longer running
//! 3. waits a short grace for the frame to be stored, then reports it
//! 4. sleeps out the interval, in abortable chunks
//!
//! The completion callback fires exactly once per sequence: `true` only when
//! every frame was captured.

use super::exposure::{ExposureComponent, ExposureOutcome};
use super::Component;
use crate::config::SequenceConfig;
use crate::error::{AppResult, CameraError, ErrorRecord, LastError};
use crate::frame::Frame;
use crate::session::PropertyEvent;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Called with the 1-based frame index and the captured frame.
pub type FrameCallback = Arc<dyn Fn(u32, Arc<Frame>) + Send + Sync>;
/// Called once per sequence with the overall success.
pub type CompletionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Frames captured so far out of the requested total.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SequenceProgress {
    /// Frames captured so far.
    pub completed: u32,
    /// Frames requested.
    pub total: u32,
}

/// Polling and timeout parameters of the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceTiming {
    /// Bound on waiting for an exposure to begin.
    pub start_timeout: Duration,
    /// Poll period while waiting for the start.
    pub start_poll: Duration,
    /// Poll period while waiting for the end.
    pub finish_poll: Duration,
    /// Wait for the frame after the exposure ended.
    pub frame_grace: Duration,
    /// Granularity of abortable sleeps.
    pub interval_chunk: Duration,
}

impl Default for SequenceTiming {
    fn default() -> Self {
        Self::from(&SequenceConfig::default())
    }
}

impl From<&SequenceConfig> for SequenceTiming {
    fn from(cfg: &SequenceConfig) -> Self {
        Self {
            start_timeout: Duration::from_millis(cfg.start_timeout_ms),
            start_poll: Duration::from_millis(cfg.start_poll_ms),
            finish_poll: Duration::from_millis(cfg.finish_poll_ms),
            frame_grace: Duration::from_millis(cfg.frame_grace_ms),
            interval_chunk: Duration::from_millis(cfg.interval_chunk_ms),
        }
    }
}

/// State shared by one run and its worker.
#[derive(Default)]
struct RunState {
    abort: AtomicBool,
    /// Held while starting a frame and while raising the abort, so a stop
    /// either sees the frame's exposure running or prevents it from starting.
    gate: Mutex<()>,
    completed: AtomicU32,
    total: AtomicU32,
    reported: AtomicBool,
}

impl RunState {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Invoke the completion callback unless already done for this run.
    fn report(&self, callback: Option<&CompletionCallback>, success: bool) {
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(success))).is_err() {
                tracing::error!("Sequence completion callback panicked");
            }
        }
    }
}

enum RunEnd {
    Finished,
    Aborted,
    Failed(CameraError),
}

/// Runs exposure sequences on a background worker.
pub struct SequenceOrchestrator {
    exposure: RwLock<Option<Arc<ExposureComponent>>>,
    timing: SequenceTiming,
    running: Arc<AtomicBool>,
    run: Mutex<Option<Arc<RunState>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    on_frame: RwLock<Option<FrameCallback>>,
    on_complete: RwLock<Option<CompletionCallback>>,
    progress: Arc<watch::Sender<SequenceProgress>>,
    last_error: Arc<LastError>,
}

impl SequenceOrchestrator {
    /// Idle orchestrator; attach an exposure component before starting.
    pub fn new(timing: SequenceTiming) -> Self {
        let (progress, _) = watch::channel(SequenceProgress::default());
        Self {
            exposure: RwLock::new(None),
            timing,
            running: Arc::new(AtomicBool::new(false)),
            run: Mutex::new(None),
            worker: Mutex::new(None),
            on_frame: RwLock::new(None),
            on_complete: RwLock::new(None),
            progress: Arc::new(progress),
            last_error: Arc::new(LastError::default()),
        }
    }

    /// Attach the exposure component the sequence drives.
    pub fn set_exposure_component(&self, exposure: Arc<ExposureComponent>) {
        *self.exposure.write() = Some(exposure);
    }

    /// Install the per-frame callback (applies to sequences started afterwards).
    pub fn set_frame_callback(&self, callback: FrameCallback) {
        *self.on_frame.write() = Some(callback);
    }

    /// Install the completion callback (applies to sequences started afterwards).
    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        *self.on_complete.write() = Some(callback);
    }

    /// Start capturing `count` frames of `exposure_s` seconds, `interval_s` apart.
    pub fn start_sequence(&self, count: u32, exposure_s: f64, interval_s: f64) -> AppResult<()> {
        self.last_error
            .track(self.try_start(count, exposure_s, interval_s))
    }

    fn try_start(&self, count: u32, exposure_s: f64, interval_s: f64) -> AppResult<()> {
        if count == 0 {
            return Err(CameraError::InvalidArgument("frame count must be positive".into()));
        }
        if !(exposure_s.is_finite() && exposure_s > 0.0) {
            return Err(CameraError::InvalidArgument(format!(
                "exposure duration must be positive, got {exposure_s}"
            )));
        }
        if !(interval_s.is_finite() && interval_s >= 0.0) {
            return Err(CameraError::InvalidArgument(format!(
                "interval must be non-negative, got {interval_s}"
            )));
        }
        let exposure = self
            .exposure
            .read()
            .clone()
            .ok_or_else(|| CameraError::InvalidArgument("no exposure component attached".into()))?;

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CameraError::AlreadyInProgress("Sequence"));
        }

        self.reap_worker();

        let run = Arc::new(RunState::default());
        run.total.store(count, Ordering::SeqCst);
        *self.run.lock() = Some(Arc::clone(&run));
        self.progress.send_replace(SequenceProgress {
            completed: 0,
            total: count,
        });

        let worker = SequenceWorker {
            exposure,
            timing: self.timing,
            run,
            running: Arc::clone(&self.running),
            on_frame: self.on_frame.read().clone(),
            on_complete: self.on_complete.read().clone(),
            progress: Arc::clone(&self.progress),
            last_error: Arc::clone(&self.last_error),
            count,
            exposure_s,
            interval: Duration::from_secs_f64(interval_s),
        };

        let spawned = thread::Builder::new()
            .name("sequence-worker".into())
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                tracing::info!(count, exposure_s, interval_s, "Sequence started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stop the running sequence and wait for the worker to exit.
    ///
    /// Reports `false` to the completion callback unless the worker already
    /// reported. Does nothing when no sequence is running.
    pub fn stop_sequence(&self) -> AppResult<()> {
        let Some(run) = self.run.lock().clone() else {
            return Ok(());
        };
        if !self.is_sequence_running() {
            self.reap_worker();
            return Ok(());
        }

        tracing::info!("Stopping sequence");
        {
            let _gate = run.gate.lock();
            run.abort.store(true, Ordering::SeqCst);

            if let Some(exposure) = self.exposure.read().clone() {
                if exposure.is_exposing() {
                    if let Err(e) = exposure.abort_exposure() {
                        tracing::warn!(error = %e, "Abort during sequence stop failed");
                    }
                }
            }
        }

        self.reap_worker();
        self.running.store(false, Ordering::SeqCst);
        run.report(self.on_complete.read().as_ref(), false);
        Ok(())
    }

    /// Join the last worker, unless called from the worker itself.
    fn reap_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Sequence worker panicked");
            }
        }
    }

    /// Whether a worker is running.
    pub fn is_sequence_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Frames captured in the current (or last) sequence.
    pub fn current_frame(&self) -> u32 {
        self.run
            .lock()
            .as_ref()
            .map_or(0, |r| r.completed.load(Ordering::SeqCst))
    }

    /// Requested frame count of the current (or last) sequence.
    pub fn total_frames(&self) -> u32 {
        self.run
            .lock()
            .as_ref()
            .map_or(0, |r| r.total.load(Ordering::SeqCst))
    }

    /// Observe progress updates.
    pub fn subscribe_progress(&self) -> watch::Receiver<SequenceProgress> {
        self.progress.subscribe()
    }

    /// Most recent failure, including those raised on the worker.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }
}

impl Drop for SequenceOrchestrator {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().as_ref() {
            run.abort.store(true, Ordering::SeqCst);
        }
    }
}

impl Component for SequenceOrchestrator {
    fn name(&self) -> &str {
        "SequenceOrchestrator"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[]
    }

    fn handle_event(&self, _event: &PropertyEvent) -> AppResult<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.exposure.read().as_ref().is_some_and(|e| e.is_ready())
    }

    fn on_session_lost(&self, code: i32) {
        if let Some(run) = self.run.lock().as_ref() {
            if self.is_sequence_running() {
                tracing::warn!(code, "Session lost during sequence");
                run.abort.store(true, Ordering::SeqCst);
                self.last_error.record(&CameraError::SessionLost(code));
            }
        }
    }
}

/// Everything the worker thread needs, detached from the orchestrator.
struct SequenceWorker {
    exposure: Arc<ExposureComponent>,
    timing: SequenceTiming,
    run: Arc<RunState>,
    running: Arc<AtomicBool>,
    on_frame: Option<FrameCallback>,
    on_complete: Option<CompletionCallback>,
    progress: Arc<watch::Sender<SequenceProgress>>,
    last_error: Arc<LastError>,
    count: u32,
    exposure_s: f64,
    interval: Duration,
}

impl SequenceWorker {
    fn run(self) {
        let end = self.capture_all();
        self.conclude(end);
    }

    /// Log the end of the run and report it. An abort raised after the last
    /// frame still counts as a stopped sequence.
    fn conclude(&self, end: RunEnd) {
        let end = match end {
            RunEnd::Finished if self.run.aborted() => RunEnd::Aborted,
            other => other,
        };
        let success = match &end {
            RunEnd::Finished => {
                tracing::info!(frames = self.count, "Sequence completed");
                true
            }
            RunEnd::Aborted => {
                tracing::info!(
                    completed = self.run.completed.load(Ordering::SeqCst),
                    "Sequence aborted"
                );
                false
            }
            RunEnd::Failed(e) => {
                tracing::error!(error = %e, "Sequence failed");
                self.last_error.record(e);
                false
            }
        };
        self.running.store(false, Ordering::SeqCst);
        self.run.report(self.on_complete.as_ref(), success);
    }

    fn capture_all(&self) -> RunEnd {
        for index in 1..=self.count {
            if self.run.aborted() {
                return RunEnd::Aborted;
            }
            match self.capture_one(index) {
                RunEnd::Finished => {}
                other => return other,
            }
            if index < self.count && !self.interval.is_zero() && !self.sleep(self.interval) {
                return RunEnd::Aborted;
            }
        }
        RunEnd::Finished
    }

    fn capture_one(&self, index: u32) -> RunEnd {
        let baseline = self.exposure.frames_received();
        tracing::debug!(index, total = self.count, "Starting sequence frame");

        {
            let _gate = self.run.gate.lock();
            if self.run.aborted() {
                return RunEnd::Aborted;
            }
            if let Err(e) = self.exposure.start_exposure(self.exposure_s) {
                return RunEnd::Failed(e);
            }
        }

        // wait for the cycle to begin
        let deadline = Instant::now() + self.timing.start_timeout;
        while !self.started(baseline) {
            if self.run.aborted() {
                return RunEnd::Aborted;
            }
            if Instant::now() >= deadline {
                return RunEnd::Failed(CameraError::Timeout(format!(
                    "frame {index} did not start within {} ms",
                    self.timing.start_timeout.as_millis()
                )));
            }
            thread::sleep(self.timing.start_poll);
        }

        // wait for the exposure to end
        while self.exposure.is_exposing() {
            if self.run.aborted() {
                return RunEnd::Aborted;
            }
            thread::sleep(self.timing.finish_poll);
        }

        // give the attachment a moment to land
        let deadline = Instant::now() + self.timing.frame_grace;
        while self.exposure.frames_received() == baseline && Instant::now() < deadline {
            if self.run.aborted() {
                return RunEnd::Aborted;
            }
            thread::sleep(self.timing.start_poll);
        }
        if self.run.aborted() {
            return RunEnd::Aborted;
        }

        let result = self.exposure.last_result();
        match result.as_ref().map(|r| &r.outcome) {
            Some(ExposureOutcome::Aborted) if self.exposure.frames_received() == baseline => {
                tracing::warn!(index, "Exposure aborted outside the sequence");
                return RunEnd::Aborted;
            }
            Some(ExposureOutcome::Failed(reason))
                if self.exposure.frames_received() == baseline =>
            {
                return RunEnd::Failed(CameraError::ProtocolAlert(format!(
                    "frame {index}: {reason}"
                )));
            }
            _ => {}
        }

        let frame = match result.and_then(|r| r.frame) {
            Some(frame) if self.exposure.frames_received() > baseline => frame,
            _ => {
                return RunEnd::Failed(CameraError::Timeout(format!(
                    "frame {index} was not received within {} ms",
                    self.timing.frame_grace.as_millis()
                )))
            }
        };

        let completed = self.run.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.send_replace(SequenceProgress {
            completed,
            total: self.count,
        });
        tracing::info!(index, total = self.count, bytes = frame.size(), "Sequence frame captured");

        if let Some(callback) = &self.on_frame {
            if catch_unwind(AssertUnwindSafe(|| callback(index, frame))).is_err() {
                tracing::error!(index, "Sequence frame callback panicked");
            }
        }
        RunEnd::Finished
    }

    fn started(&self, baseline: u64) -> bool {
        self.exposure.is_exposing()
            || self.exposure.frames_received() > baseline
            || self.exposure.state().is_active()
    }

    /// Sleep `total` in abortable chunks. `false` if aborted.
    fn sleep(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.run.aborted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(self.timing.interval_chunk));
        }
    }
}
