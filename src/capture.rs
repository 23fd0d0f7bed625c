//! Capture loop: one worker thread that reads, processes, and publishes frames.
//!
//! ```text
//! Idle -> Running <-> Paused
//!            |          |
//!            +-> Stopping -> Idle
//! ```
//!
//! End of stream and read errors end the loop on their own and return it to `Idle`.
//! `stop` closes the run's gate, then waits at most `stop_timeout` for the worker. A
//! worker stuck inside a read or a detector is detached: its device claim is released
//! right away, and the closed gate keeps it from arming alerts or publishing anything.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::{DeviceClaim, SourceFactory, SourceInfo, VideoSource, VideoSourceHandle};
use crate::processor::{FrameProcessor, RunGate};
use crate::publish::{latest, Publisher, Subscriber};
use crate::settings::SettingsHandle;

const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Running,
    Paused,
    Stopping,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::Running,
            2 => CaptureState::Paused,
            3 => CaptureState::Stopping,
            _ => CaptureState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CaptureState::Idle => 0,
            CaptureState::Running => 1,
            CaptureState::Paused => 2,
            CaptureState::Stopping => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureOptions {
    /// Sleep between pause-flag checks; bounds resume latency.
    pub pause_poll: Duration,
    /// Longest `stop` waits for the worker before detaching it.
    pub stop_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            pause_poll: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(1),
        }
    }
}

/// Consumer ends of the worker's coalescing channels.
pub struct CaptureUpdates {
    /// Display-annotated frames.
    pub frames: Subscriber<Frame>,
    /// Sorted, deduplicated labels; only published when non-empty.
    pub detections: Subscriber<Vec<String>>,
    pub fps: Subscriber<f32>,
    /// Playback progress in percent, for seekable sources.
    pub progress: Subscriber<f32>,
}

#[derive(Clone)]
struct Publishers {
    frames: Publisher<Frame>,
    detections: Publisher<Vec<String>>,
    fps: Publisher<f32>,
    progress: Publisher<f32>,
}

impl Publishers {
    fn reset_indicators(&self) {
        self.progress.publish(0.0);
        self.fps.publish(0.0);
    }
}

/// Flags shared with one worker. Each `start` gets a fresh set, so a detached worker
/// can never observe a later run's flags.
struct WorkerShared {
    running: AtomicBool,
    state: AtomicU8,
    pending_seek: Mutex<Option<u64>>,
    gate: RunGate,
}

impl WorkerShared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            state: AtomicU8::new(CaptureState::Running.as_u8()),
            pending_seek: Mutex::new(None),
            gate: RunGate::new(),
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CaptureState, to: CaptureState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_seek(&self) -> Option<u64> {
        self.pending_seek
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    info: SourceInfo,
    claim: Option<DeviceClaim>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

pub struct CaptureLoop {
    factory: SourceFactory,
    processor: Arc<FrameProcessor>,
    settings: SettingsHandle,
    options: CaptureOptions,
    publishers: Publishers,
    worker: Option<Worker>,
}

impl CaptureLoop {
    pub fn new(
        factory: SourceFactory,
        processor: Arc<FrameProcessor>,
        settings: SettingsHandle,
        options: CaptureOptions,
    ) -> (Self, CaptureUpdates) {
        let (frames, frames_rx) = latest();
        let (detections, detections_rx) = latest();
        let (fps, fps_rx) = latest();
        let (progress, progress_rx) = latest();
        let capture = Self {
            factory,
            processor,
            settings,
            options,
            publishers: Publishers {
                frames,
                detections,
                fps,
                progress,
            },
            worker: None,
        };
        let updates = CaptureUpdates {
            frames: frames_rx,
            detections: detections_rx,
            fps: fps_rx,
            progress: progress_rx,
        };
        (capture, updates)
    }

    pub fn state(&self) -> CaptureState {
        match &self.worker {
            Some(worker) => worker.shared.state(),
            None => CaptureState::Idle,
        }
    }

    /// Info of the source the current (or last finished) run was reading.
    pub fn source(&self) -> Option<&SourceInfo> {
        self.worker.as_ref().map(|worker| &worker.info)
    }

    /// Open `handle` and start the worker. Any previous run is stopped first.
    pub fn start(&mut self, handle: &VideoSourceHandle) -> Result<SourceInfo, PipelineError> {
        let source = self.open(handle)?;
        self.start_with(source)
    }

    /// Stop any previous run and open `handle` without starting a worker.
    pub fn open(
        &mut self,
        handle: &VideoSourceHandle,
    ) -> Result<Box<dyn VideoSource>, PipelineError> {
        self.stop();
        self.factory.open(handle).map_err(|err| {
            let failure = PipelineError::source_unavailable(format!("{}: {:#}", handle, err));
            log::error!("{}", failure);
            failure
        })
    }

    /// Start the worker on an already opened source.
    pub fn start_with(
        &mut self,
        source: Box<dyn VideoSource>,
    ) -> Result<SourceInfo, PipelineError> {
        self.stop();
        let info = source.describe();
        let claim = source.claim();
        let shared = Arc::new(WorkerShared::new());
        let (done_tx, done) = bounded(1);

        let run = WorkerRun {
            source,
            info: info.clone(),
            shared: Arc::clone(&shared),
            processor: Arc::clone(&self.processor),
            settings: self.settings.clone(),
            publishers: self.publishers.clone(),
            pause_poll: self.options.pause_poll,
            done: done_tx,
        };
        let handle = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || run.run())
            .map_err(|err| {
                PipelineError::source_unavailable(format!("failed to spawn capture worker: {}", err))
            })?;

        log::info!(
            "capture started on {} (seekable: {}, frames: {})",
            info.label(),
            info.seekable,
            info.total_frames
        );
        self.worker = Some(Worker {
            shared,
            info: info.clone(),
            claim,
            done,
            handle,
        });
        Ok(info)
    }

    pub fn pause(&self) {
        if let Some(worker) = &self.worker {
            worker
                .shared
                .transition(CaptureState::Running, CaptureState::Paused);
        }
    }

    pub fn resume(&self) {
        if let Some(worker) = &self.worker {
            worker
                .shared
                .transition(CaptureState::Paused, CaptureState::Running);
        }
    }

    /// Flip between running and paused. Returns the new state.
    pub fn toggle_pause(&self) -> CaptureState {
        match self.state() {
            CaptureState::Running => self.pause(),
            CaptureState::Paused => self.resume(),
            CaptureState::Idle | CaptureState::Stopping => {}
        }
        self.state()
    }

    /// Reposition a seekable source to `percent` of its length.
    ///
    /// `percent` is clamped to `[0, 100]`; 100 maps to the last frame. Returns the
    /// target frame index, or `None` when the source is not seekable or not running.
    pub fn seek(&self, percent: f64) -> Option<u64> {
        let worker = self.active_worker()?;
        let total = worker.info.total_frames;
        if !worker.info.seekable || total == 0 {
            return None;
        }
        let index = frame_for_percent(total, percent);
        *worker
            .shared
            .pending_seek
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(index);
        Some(index)
    }

    /// Stop the worker, waiting at most `stop_timeout`. FPS and progress are reset.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let was_running = worker
                .shared
                .transition(CaptureState::Running, CaptureState::Stopping)
                || worker
                    .shared
                    .transition(CaptureState::Paused, CaptureState::Stopping);
            worker.shared.running.store(false, Ordering::Release);
            worker.shared.gate.close();

            match worker.done.recv_timeout(self.options.stop_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "capture worker on {} did not stop within {:?}; detaching",
                        worker.info.label(),
                        self.options.stop_timeout
                    );
                    if let Some(claim) = &worker.claim {
                        claim.release();
                    }
                }
            }
            worker.shared.set_state(CaptureState::Idle);
            if was_running {
                log::info!("capture stopped on {}", worker.info.label());
            }
        }
        self.publishers.reset_indicators();
    }

    fn active_worker(&self) -> Option<&Worker> {
        self.worker.as_ref().filter(|worker| {
            matches!(
                worker.shared.state(),
                CaptureState::Running | CaptureState::Paused
            )
        })
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Frame index for a playback percentage: `floor(total * p / 100)`, capped at the last frame.
pub fn frame_for_percent(total: u64, percent: f64) -> u64 {
    if total == 0 {
        return 0;
    }
    let percent = if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    };
    let index = (total as f64 * percent / 100.0).floor() as u64;
    index.min(total - 1)
}

fn progress_percent(position: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    ((position as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as f32
}

struct WorkerRun {
    source: Box<dyn VideoSource>,
    info: SourceInfo,
    shared: Arc<WorkerShared>,
    processor: Arc<FrameProcessor>,
    settings: SettingsHandle,
    publishers: Publishers,
    pause_poll: Duration,
    done: Sender<()>,
}

impl WorkerRun {
    fn run(mut self) {
        let mut window_start = Instant::now();
        let mut window_frames = 0u32;

        while self.shared.running.load(Ordering::Acquire) {
            if let Some(index) = self.shared.take_seek() {
                match self.source.set_position(index) {
                    Ok(()) => {
                        self.shared.gate.while_open(|| self.publish_progress());
                    }
                    Err(err) => log::warn!("seek on {} failed: {:#}", self.info.label(), err),
                }
            }
            if self.shared.state() == CaptureState::Paused {
                std::thread::sleep(self.pause_poll);
                window_start = Instant::now();
                window_frames = 0;
                continue;
            }

            let frame = match self.source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::info!("end of stream on {}", self.info.label());
                    break;
                }
                Err(err) => {
                    log::warn!("read from {} failed: {:#}", self.info.label(), err);
                    break;
                }
            };
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }

            let settings = self.settings.snapshot();
            let processed = self
                .processor
                .process_within(&frame, &settings, &self.shared.gate);

            window_frames += 1;
            let elapsed = window_start.elapsed();
            let fps = (elapsed >= FPS_WINDOW)
                .then(|| (window_frames as f64 / elapsed.as_secs_f64()) as f32);
            if fps.is_some() {
                window_start = Instant::now();
                window_frames = 0;
            }

            let published = self.shared.gate.while_open(|| {
                let labels = processed.label_set();
                self.publishers.frames.publish(processed.display);
                if !labels.is_empty() {
                    self.publishers.detections.publish(labels);
                }
                if let Some(fps) = fps {
                    self.publishers.fps.publish(fps);
                }
                self.publish_progress();
            });
            if published.is_none() {
                break;
            }
        }

        // Release the device before reporting completion.
        let label = self.info.label();
        drop(self.source);
        if self.shared.state() != CaptureState::Stopping {
            log::info!("capture on {} finished", label);
        }
        // A stopped run leaves the indicators to `stop`; they may belong to a newer run.
        self.shared
            .gate
            .while_open(|| self.publishers.reset_indicators());
        self.shared.set_state(CaptureState::Idle);
        let _ = self.done.send(());
    }

    fn publish_progress(&self) {
        if self.info.seekable {
            self.publishers.progress.publish(progress_percent(
                self.source.position(),
                self.info.total_frames,
            ));
        }
    }
}
