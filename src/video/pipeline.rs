//! Capture-to-sinks pipeline loop
//!
//! One thread of control, one frame at a time:
//!
//! ```text
//! WaitingForFrame ──ready──> FrameReady ──acquire──> Dispatching ──requeue──┐
//!        ^                                                                 │
//!        └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every sink sees frame N before frame N+1 is dequeued. A sink failing on a
//! frame only costs that sink that frame; the capture buffer is requeued
//! after every dispatch no matter what the sinks did.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::buffer_pool::{RawQueue, Readiness};
use super::device::DeviceHandle;
use super::format::PixelFormat;
use super::frame::CapturedFrame;
use super::sink::{Delivery, Sink, SinkStats};
use super::v4l2::V4l2Queue;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Pipeline loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    WaitingForFrame,
    FrameReady,
    Dispatching,
    Shutdown,
}

/// Result of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A frame went through every sink
    Frame { sequence: u64 },
    /// Signal or spurious wakeup; no frame was consumed
    Idle,
}

/// Pipeline statistics
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Frames dequeued from the capture device
    pub frames_captured: u64,
    /// Frames per second over the last full window
    pub current_fps: f32,
    /// Per-sink counters, in registration order
    pub sinks: Vec<(String, SinkStats)>,
}

/// Capture device plus ordered sinks
pub struct Pipeline<Q: RawQueue = V4l2Queue> {
    capture: DeviceHandle<Q>,
    capture_format: PixelFormat,
    sinks: Vec<Sink<Q>>,
    timeout: Duration,
    state: PipelineState,
    frames_captured: u64,
    current_fps: f32,
    fps_frame_count: u64,
    fps_window_start: Instant,
    throttler: LogThrottler,
}

const FPS_WINDOW: Duration = Duration::from_secs(1);

impl<Q: RawQueue> Pipeline<Q> {
    /// Build a pipeline from a negotiated capture device and opened sinks
    pub fn new(capture: DeviceHandle<Q>, sinks: Vec<Sink<Q>>, timeout: Duration) -> Result<Self> {
        let capture_format = capture.format().ok_or_else(|| {
            AppError::VideoError(format!("{}: format not negotiated", capture.name()))
        })?;
        Ok(Self {
            capture,
            capture_format,
            sinks,
            timeout,
            state: PipelineState::WaitingForFrame,
            frames_captured: 0,
            current_fps: 0.0,
            fps_frame_count: 0,
            fps_window_start: Instant::now(),
            throttler: LogThrottler::with_secs(5),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn capture(&self) -> &DeviceHandle<Q> {
        &self.capture
    }

    pub fn sinks(&self) -> &[Sink<Q>] {
        &self.sinks
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.frames_captured,
            current_fps: self.current_fps,
            sinks: self
                .sinks
                .iter()
                .map(|sink| (sink.name().to_string(), sink.stats()))
                .collect(),
        }
    }

    /// Start streaming on every sink, then on the capture device
    pub fn start(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.start()?;
        }
        self.capture.start()?;
        self.state = PipelineState::WaitingForFrame;
        self.fps_window_start = Instant::now();
        info!(
            "Pipeline started: {} {} -> {} sink(s)",
            self.capture.name(),
            self.capture_format,
            self.sinks.len()
        );
        Ok(())
    }

    /// Run until `stop` is set or a fatal error occurs
    ///
    /// Returns the number of frames captured.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<u64> {
        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.step() {
                self.state = PipelineState::Shutdown;
                return Err(e);
            }
        }
        info!("Pipeline stopping after {} frames", self.frames_captured);
        Ok(self.frames_captured)
    }

    /// Wait for one frame, dispatch it to every sink and requeue it
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.state = PipelineState::WaitingForFrame;
        match self.capture.wait_ready(self.timeout)? {
            Readiness::Ready => {}
            Readiness::Interrupted => return Ok(StepOutcome::Idle),
            Readiness::TimedOut => {
                return Err(AppError::DeviceTimeout {
                    device: self.capture.name().to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }

        self.state = PipelineState::FrameReady;
        let Some(buffer) = self.capture.acquire()? else {
            debug!("{}: spurious wakeup", self.capture.name());
            self.state = PipelineState::WaitingForFrame;
            return Ok(StepOutcome::Idle);
        };
        let sequence = buffer.sequence();

        self.state = PipelineState::Dispatching;
        match self.capture.payload(&buffer) {
            Ok(data) => {
                let frame = CapturedFrame::new(
                    data,
                    self.capture_format,
                    self.capture.resolution(),
                    sequence,
                );
                if !frame.is_complete() {
                    crate::warn_throttled!(
                        self.throttler,
                        "short_frame",
                        "{}: short frame {} ({} bytes)",
                        self.capture.name(),
                        sequence,
                        frame.len()
                    );
                }
                dispatch(&mut self.sinks, &frame, &mut self.throttler);
            }
            Err(e) => error!("{}: cannot read frame {}: {}", self.capture.name(), sequence, e),
        }

        self.capture
            .release(buffer, 0)
            .map_err(|e| AppError::RingViolation {
                device: self.capture.name().to_string(),
                reason: format!("capture requeue failed: {}", e),
            })?;

        self.frames_captured += 1;
        self.update_fps();
        self.state = PipelineState::WaitingForFrame;
        Ok(StepOutcome::Frame { sequence })
    }

    fn update_fps(&mut self) {
        self.fps_frame_count += 1;
        let elapsed = self.fps_window_start.elapsed();
        if elapsed >= FPS_WINDOW {
            self.current_fps = self.fps_frame_count as f32 / elapsed.as_secs_f32();
            debug!(
                "{}: {:.1} fps ({} frames total)",
                self.capture.name(),
                self.current_fps,
                self.frames_captured
            );
            self.fps_frame_count = 0;
            self.fps_window_start = Instant::now();
        }
    }

    /// Stop and release the capture device and every sink
    ///
    /// All devices are released even if some fail; the first error is
    /// returned.
    pub fn shutdown(&mut self) -> Result<()> {
        self.state = PipelineState::Shutdown;
        let mut first_error = self.capture.shutdown().err();
        for sink in &mut self.sinks {
            if let Err(e) = sink.shutdown() {
                error!("Sink {}: shutdown failed: {}", sink.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Hand a frame to every sink in order; failures stay with their sink
fn dispatch<Q: RawQueue>(
    sinks: &mut [Sink<Q>],
    frame: &CapturedFrame<'_>,
    throttler: &mut LogThrottler,
) {
    for sink in sinks.iter_mut() {
        match sink.deliver(frame) {
            Ok(Delivery::Delivered { truncated: false, .. }) => {}
            Ok(Delivery::Delivered {
                bytes,
                truncated: true,
            }) => {
                crate::warn_throttled!(
                    throttler,
                    &truncation_key(sink.name()),
                    "Sink {}: frame {} truncated to {} bytes",
                    sink.name(),
                    frame.sequence,
                    bytes
                );
            }
            Ok(Delivery::Busy) => {
                crate::warn_throttled!(
                    throttler,
                    sink.name(),
                    "Sink {}: no free output buffer, frame {} dropped",
                    sink.name(),
                    frame.sequence
                );
            }
            Err(e) if e.is_sink_local() => {
                sink.record_skip();
                crate::warn_throttled!(
                    throttler,
                    sink.name(),
                    "Sink {}: frame {} skipped: {}",
                    sink.name(),
                    frame.sequence,
                    e
                );
            }
            Err(e) => {
                sink.record_skip();
                crate::error_throttled!(
                    throttler,
                    sink.name(),
                    "Sink {}: device error on frame {}: {}",
                    sink.name(),
                    frame.sequence,
                    e
                );
            }
        }
    }
}

fn truncation_key(sink: &str) -> String {
    format!("{} truncated", sink)
}
