//! Output sinks
//!
//! A sink is one loopback output device plus what it needs to turn a
//! captured frame into the bytes it publishes:
//!
//! - raw sinks either pass the captured bytes through unchanged (same
//!   format) or convert straight into a mapped output buffer
//! - encoded sinks convert into their encoder's input buffer, encode, and
//!   copy the bitstream into an output buffer
//!
//! An optional tee file receives exactly the bytes queued on the device.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::buffer_pool::{Direction, RawQueue};
use super::convert::{convert_into, ConvertError};
use super::device::DeviceHandle;
use super::encoder::{create_encoder, FrameEncoder};
use super::format::{PixelFormat, Resolution};
use super::frame::CapturedFrame;
use super::v4l2::V4l2Queue;
use crate::config::SinkConfig;
use crate::error::{AppError, Result};

/// Outcome of handing one frame to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame queued on the device
    Delivered {
        /// Bytes handed to the driver
        bytes: usize,
        /// The frame did not fit and was cut
        truncated: bool,
    },
    /// Every output buffer is still held by the consumer
    Busy,
}

/// Per-sink counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub delivered: u64,
    pub skipped: u64,
    pub truncated: u64,
    pub bytes: u64,
}

/// Append-only copy of a sink's output
///
/// Bytes are staged while the output buffer is filled and only written once
/// the driver accepted the buffer.
pub struct Tee {
    path: PathBuf,
    writer: BufWriter<File>,
    staged: Vec<u8>,
    failed: bool,
}

impl Tee {
    /// Create (truncating) the tee file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        info!("Writing sink copy to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            staged: Vec::new(),
            failed: false,
        })
    }

    /// Replace the pending frame
    fn stage(&mut self, bytes: &[u8]) {
        self.staged.clear();
        self.staged.extend_from_slice(bytes);
    }

    /// Write the pending frame
    fn commit(&mut self) {
        if let Err(e) = self.writer.write_all(&self.staged) {
            if !self.failed {
                warn!("Failed to write {}: {}", self.path.display(), e);
                self.failed = true;
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// One output device with its encoder and tee
pub struct Sink<Q: RawQueue = V4l2Queue> {
    config: SinkConfig,
    device: DeviceHandle<Q>,
    encoder: Option<Box<dyn FrameEncoder>>,
    tee: Option<Tee>,
    /// Conversion target when a mapped buffer is smaller than a frame
    scratch: Vec<u8>,
    stats: SinkStats,
}

impl Sink<V4l2Queue> {
    /// Open and configure the output device, encoder and tee of one sink
    ///
    /// `resolution` is the capture resolution, which every sink publishes.
    pub fn open(config: &SinkConfig, resolution: Resolution) -> Result<Self> {
        let device = DeviceHandle::open_configured(
            &config.device,
            Direction::Output,
            resolution,
            config.format,
            config.buffer_count,
        )?;

        let encoder = config
            .encoder
            .as_ref()
            .map(|kind| create_encoder(kind, resolution))
            .transpose()?;

        let tee = config.tee_path.as_ref().map(Tee::create).transpose()?;

        Ok(Self::from_parts(config.clone(), device, encoder, tee))
    }
}

impl<Q: RawQueue> Sink<Q> {
    /// Assemble a sink from an already configured device
    pub fn from_parts(
        config: SinkConfig,
        device: DeviceHandle<Q>,
        encoder: Option<Box<dyn FrameEncoder>>,
        tee: Option<Tee>,
    ) -> Self {
        if let Some(encoder) = &encoder {
            info!(
                "Sink {}: {} -> {} via {}",
                config.name,
                encoder.input_format(),
                config.format,
                encoder.name()
            );
        }
        Self {
            config,
            device,
            encoder,
            tee,
            scratch: Vec::new(),
            stats: SinkStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceHandle<Q> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut DeviceHandle<Q> {
        &mut self.device
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Format the captured frame must be in before this sink uses it
    pub fn intermediate_format(&self) -> PixelFormat {
        self.encoder
            .as_ref()
            .map_or(self.config.format, |encoder| encoder.input_format())
    }

    pub fn start(&mut self) -> Result<()> {
        self.device.start()
    }

    /// Publish one captured frame
    ///
    /// Errors concern this sink and this frame only; nothing is queued on
    /// the device when one is returned.
    pub fn deliver(&mut self, frame: &CapturedFrame<'_>) -> Result<Delivery> {
        let delivery = match self.encoder.as_deref_mut() {
            Some(encoder) => {
                encode(encoder, frame).map_err(|e| AppError::SinkEncodeFailure {
                    sink: self.config.name.clone(),
                    reason: e.to_string(),
                })?;
                let output = &encoder.output()[..encoder.output_len()];
                queue_output(&mut self.device, &mut self.tee, |data| {
                    Ok(copy_truncated(output, data))
                })?
            }
            None if frame.format == self.config.format => {
                // Passthrough: exactly what the driver filled
                queue_output(&mut self.device, &mut self.tee, |data| {
                    Ok(copy_truncated(frame.data, data))
                })?
            }
            None => {
                let sink_format = self.config.format;
                let scratch = &mut self.scratch;
                queue_output(&mut self.device, &mut self.tee, |data| {
                    convert_to_output(frame, sink_format, data, scratch)
                })?
            }
        };

        match delivery {
            Delivery::Delivered { bytes, truncated } => {
                self.stats.delivered += 1;
                self.stats.bytes += bytes as u64;
                if truncated {
                    self.stats.truncated += 1;
                }
            }
            Delivery::Busy => self.stats.skipped += 1,
        }
        Ok(delivery)
    }

    /// Count a frame this sink did not publish
    pub fn record_skip(&mut self) {
        self.stats.skipped += 1;
    }

    /// Stop the device, free its buffers and flush the tee
    pub fn shutdown(&mut self) -> Result<()> {
        let flushed = match self.tee.as_mut() {
            Some(tee) => tee.flush(),
            None => Ok(()),
        };
        self.device.shutdown()?;
        flushed
    }
}

/// Convert one frame into the encoder's input buffer and encode it
fn encode(encoder: &mut dyn FrameEncoder, frame: &CapturedFrame<'_>) -> Result<()> {
    convert_into(
        frame.format,
        encoder.input_format(),
        frame.resolution,
        frame.data,
        encoder.input_buffer(),
    )?;
    encoder.encode_current_input()
}

/// Copy as much of `src` as fits, returning the full length wanted
fn copy_truncated(src: &[u8], dst: &mut [u8]) -> usize {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
    src.len()
}

/// Convert a captured frame into a mapped output buffer
///
/// Reports `w*h*12/8` bytes. A buffer too small for the whole frame gets the
/// leading part of it.
fn convert_to_output(
    frame: &CapturedFrame<'_>,
    sink_format: PixelFormat,
    data: &mut [u8],
    scratch: &mut Vec<u8>,
) -> Result<usize> {
    let frame_len = frame.resolution.yuv420_size();
    match convert_into(frame.format, sink_format, frame.resolution, frame.data, data) {
        Ok(_) => Ok(frame_len),
        Err(ConvertError::DestinationTooSmall { expected, .. }) => {
            scratch.resize(expected, 0);
            convert_into(frame.format, sink_format, frame.resolution, frame.data, scratch)?;
            Ok(copy_truncated(&scratch[..frame_len.min(expected)], data))
        }
        Err(e) => Err(e.into()),
    }
}

/// Acquire an output buffer, let `fill` write it, queue it and copy it to
/// the tee
///
/// `fill` returns the length it wanted to write; the pool clamps it to the
/// buffer size. On error the buffer goes back to the pool unqueued and the
/// tee is left untouched.
fn queue_output<Q: RawQueue>(
    device: &mut DeviceHandle<Q>,
    tee: &mut Option<Tee>,
    fill: impl FnOnce(&mut [u8]) -> Result<usize>,
) -> Result<Delivery> {
    let Some(buffer) = device.acquire_output()? else {
        return Ok(Delivery::Busy);
    };

    let filled = device.data_mut(&buffer).and_then(|data| {
        let wanted = fill(data)?;
        if let Some(tee) = tee.as_mut() {
            // The mapping belongs to the driver once queued
            tee.stage(&data[..wanted.min(data.len())]);
        }
        Ok((wanted, data.len()))
    });

    match filled {
        Ok((wanted, capacity)) => {
            let bytes = device.release(buffer, wanted)?;
            if let Some(tee) = tee.as_mut() {
                tee.commit();
            }
            Ok(Delivery::Delivered {
                bytes,
                truncated: wanted > capacity,
            })
        }
        Err(e) => {
            device.discard(buffer)?;
            Err(e)
        }
    }
}
