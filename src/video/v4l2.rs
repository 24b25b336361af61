//! V4L2 device queue using v4l2r (ioctl layer).

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l2r::bindings::{v4l2_requestbuffers, v4l2_streamparm};
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, DqBufError, DqBufIoctlError,
    MemoryConsistency, PlaneMapping, QBufPlane, QBuffer, QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{MemoryType, MmapHandle};
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat, QueueType};

use crate::error::{AppError, Result};
use crate::video::buffer_pool::{Dequeued, Direction, Negotiated, RawQueue, Readiness};
use crate::video::format::{PixelFormat, Resolution};

/// `v4l2_std_id` bits, from `linux/videodev2.h`
const STD_UNKNOWN: u64 = 0;
const STD_PAL: u64 = 0x0000_00ff;
const STD_NTSC: u64 = 0x0000_b000;
const STD_SECAM: u64 = 0x00ff_0000;
const STD_ALL: u64 = 0x00ff_ffff;

/// Attempts while the decoder still reports every standard as possible
const STD_DETECT_ATTEMPTS: u32 = 10;
const STD_DETECT_INTERVAL: Duration = Duration::from_millis(100);

nix::ioctl_read!(vidioc_g_std, b'V', 23, u64);
nix::ioctl_write_ptr!(vidioc_s_std, b'V', 24, u64);

/// One V4L2 buffer queue (capture or output) of an opened device node
pub struct V4l2Queue {
    fd: File,
    name: String,
    direction: Direction,
    queue: QueueType,
    /// Buffers granted by the last request
    buffer_count: u32,
}

impl V4l2Queue {
    /// Open a device node and check it supports streaming in `direction`
    pub fn open(device_path: impl AsRef<Path>, direction: Direction) -> Result<Self> {
        let path = device_path.as_ref();
        let name = path.display().to_string();
        let unavailable = |reason: String| AppError::DeviceUnavailable {
            device: name.clone(),
            reason,
        };

        let mut options = File::options();
        options.read(true).write(true);
        if direction == Direction::Capture {
            // Readiness is polled first; a spurious wakeup must not block DQBUF
            options.custom_flags(libc::O_NONBLOCK);
        }
        let fd = options
            .open(path)
            .map_err(|e| unavailable(format!("cannot open: {}", e)))?;

        let caps: V4l2rCapability = ioctl::querycap(&fd)
            .map_err(|e| unavailable(format!("not a V4L2 device: {}", e)))?;
        let flags = caps.device_caps();

        let queue = match direction {
            Direction::Capture if flags.contains(Capabilities::VIDEO_CAPTURE) => {
                QueueType::VideoCapture
            }
            Direction::Capture if flags.contains(Capabilities::VIDEO_CAPTURE_MPLANE) => {
                QueueType::VideoCaptureMplane
            }
            Direction::Output if flags.contains(Capabilities::VIDEO_OUTPUT) => {
                QueueType::VideoOutput
            }
            Direction::Output if flags.contains(Capabilities::VIDEO_OUTPUT_MPLANE) => {
                QueueType::VideoOutputMplane
            }
            _ => return Err(unavailable(format!("no video {} queue", direction))),
        };

        if !flags.contains(Capabilities::STREAMING) {
            return Err(unavailable("does not support streaming i/o".to_string()));
        }

        info!(
            "Opened {} ({}, driver {}) as {}",
            name, caps.card, caps.driver, direction
        );

        Ok(Self {
            fd,
            name,
            direction,
            queue,
            buffer_count: 0,
        })
    }

    /// Lock onto the analog video standard reported by the decoder
    ///
    /// Decoders report every standard while they are still syncing, so the
    /// query is repeated for a short while. Devices without an analog front
    /// end reject the ioctl; that is logged and ignored.
    pub fn detect_standard(&self) {
        let raw = self.fd.as_raw_fd();
        let mut std_id: u64 = STD_UNKNOWN;

        // SAFETY: VIDIOC_G_STD writes one v4l2_std_id into `std_id`
        if let Err(e) = unsafe { vidioc_g_std(raw, &mut std_id) } {
            debug!("{}: VIDIOC_G_STD failed: {}", self.name, e);
            return;
        }

        for _ in 0..STD_DETECT_ATTEMPTS {
            if std_id != STD_ALL {
                break;
            }
            std::thread::sleep(STD_DETECT_INTERVAL);
            // SAFETY: as above
            if let Err(e) = unsafe { vidioc_g_std(raw, &mut std_id) } {
                debug!("{}: VIDIOC_G_STD failed: {}", self.name, e);
                return;
            }
        }

        if std_id == STD_UNKNOWN {
            warn!("{}: no analog video standard detected", self.name);
            return;
        }

        // SAFETY: VIDIOC_S_STD reads one v4l2_std_id from `std_id`
        if let Err(e) = unsafe { vidioc_s_std(raw, &std_id) } {
            warn!("{}: VIDIOC_S_STD failed: {}", self.name, e);
        }
        info!("{}: video standard {}", self.name, standard_name(std_id));
    }

    /// Frame rate currently configured on the capture queue, if reported
    pub fn frame_rate(&self) -> Option<f64> {
        let params: v4l2_streamparm = match ioctl::g_parm(&self.fd, self.queue) {
            Ok(params) => params,
            Err(e) => {
                warn!("{}: failed to read frame interval: {}", self.name, e);
                return None;
            }
        };
        // SAFETY: the capture member is the active one for capture queues
        let interval = unsafe { params.parm.capture.timeperframe };
        if interval.numerator == 0 {
            return None;
        }
        Some(interval.denominator as f64 / interval.numerator as f64)
    }

    fn format_request(&self, resolution: Resolution, format: PixelFormat) -> Result<V4l2rFormat> {
        let mut fmt: V4l2rFormat = ioctl::g_fmt(&self.fd, self.queue).map_err(|e| {
            AppError::VideoError(format!("{}: failed to get format: {}", self.name, e))
        })?;
        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.pixelformat = V4l2rPixelFormat::from_u32(u32::from_le_bytes(*format.fourcc()));
        Ok(fmt)
    }

    fn wait_flags(&self) -> PollFlags {
        match self.direction {
            Direction::Capture => PollFlags::POLLIN,
            Direction::Output => PollFlags::POLLOUT,
        }
    }
}

fn negotiated(fmt: &V4l2rFormat) -> Negotiated {
    Negotiated {
        resolution: Resolution::new(fmt.width, fmt.height),
        fourcc: fmt.pixelformat.to_u32(),
    }
}

/// How a failed DQBUF is handled
#[derive(Debug, PartialEq, Eq)]
enum DqbufFailure {
    /// Signal arrived, try again
    Interrupted,
    /// EAGAIN on a non-blocking descriptor
    NotReady,
    Fatal,
}

fn dqbuf_failure<CE: std::fmt::Debug>(error: &DqBufError<CE>) -> DqbufFailure {
    // v4l2r's own nix, which may differ from ours
    use v4l2r::nix::errno::Errno as V4l2rErrno;

    match error {
        DqBufError::IoctlError(DqBufIoctlError::NotReady) => DqbufFailure::NotReady,
        DqBufError::IoctlError(DqBufIoctlError::Other(V4l2rErrno::EINTR)) => {
            DqbufFailure::Interrupted
        }
        _ => DqbufFailure::Fatal,
    }
}

fn standard_name(std_id: u64) -> &'static str {
    if std_id & STD_NTSC != 0 {
        "NTSC"
    } else if std_id & STD_SECAM != 0 {
        "SECAM"
    } else if std_id & STD_PAL != 0 {
        "PAL"
    } else {
        "other"
    }
}

impl RawQueue for V4l2Queue {
    type Mapping = PlaneMapping;

    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn try_format(&mut self, resolution: Resolution, format: PixelFormat) -> Result<Negotiated> {
        let fmt = self.format_request(resolution, format)?;
        let tried: V4l2rFormat = ioctl::try_fmt(&self.fd, (self.queue, &fmt)).map_err(|e| {
            AppError::VideoError(format!("{}: failed to try format: {}", self.name, e))
        })?;
        Ok(negotiated(&tried))
    }

    fn set_format(&mut self, resolution: Resolution, format: PixelFormat) -> Result<Negotiated> {
        let fmt = self.format_request(resolution, format)?;
        let _: V4l2rFormat = ioctl::s_fmt(&mut self.fd, (self.queue, &fmt)).map_err(|e| {
            AppError::VideoError(format!("{}: failed to set format: {}", self.name, e))
        })?;
        // Read back what the driver kept
        let actual: V4l2rFormat = ioctl::g_fmt(&self.fd, self.queue).map_err(|e| {
            AppError::VideoError(format!("{}: failed to get format: {}", self.name, e))
        })?;
        Ok(negotiated(&actual))
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32> {
        let req: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            self.queue,
            MemoryType::Mmap,
            count,
            MemoryConsistency::empty(),
        )
        .map_err(|e| {
            AppError::VideoError(format!("{}: failed to request buffers: {}", self.name, e))
        })?;
        self.buffer_count = req.count;
        Ok(req.count)
    }

    fn map_buffer(&mut self, index: u32) -> Result<PlaneMapping> {
        let query: QueryBuffer = ioctl::querybuf(&self.fd, self.queue, index as usize)
            .map_err(|e| {
                AppError::VideoError(format!(
                    "{}: failed to query buffer {}: {}",
                    self.name, index, e
                ))
            })?;

        // Packed and semi-planar frames live in a single plane
        let plane = match query.planes.as_slice() {
            [plane] => plane,
            planes => {
                return Err(AppError::VideoError(format!(
                    "{}: buffer {} has {} planes, expected 1",
                    self.name,
                    index,
                    planes.len()
                )))
            }
        };

        ioctl::mmap(&self.fd, plane.mem_offset, plane.length).map_err(|e| {
            AppError::VideoError(format!("{}: failed to mmap buffer {}: {}", self.name, index, e))
        })
    }

    fn queue_buffer(&mut self, index: u32, bytes_used: usize) -> Result<()> {
        let query: QueryBuffer = ioctl::querybuf(&self.fd, self.queue, index as usize)
            .map_err(|e| {
                AppError::VideoError(format!(
                    "{}: failed to query buffer {}: {}",
                    self.name, index, e
                ))
            })?;
        let handle = MmapHandle::default();
        let planes = query
            .planes
            .iter()
            .map(|info| {
                let mut plane = QBufPlane::new_from_handle(&handle, bytes_used);
                plane.0.length = info.length;
                plane
            })
            .collect();
        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(self.queue, index);
        qbuf.planes = planes;
        ioctl::qbuf::<_, ()>(&self.fd, qbuf).map_err(|e| {
            AppError::VideoError(format!("{}: failed to queue buffer {}: {}", self.name, index, e))
        })
    }

    fn dequeue_buffer(&mut self) -> Result<Option<Dequeued>> {
        loop {
            match ioctl::dqbuf::<V4l2Buffer>(&self.fd, self.queue) {
                Ok(buffer) => {
                    let raw = buffer.as_v4l2_buffer();
                    let bytes_used = buffer
                        .planes_iter()
                        .next()
                        .map(|plane| *plane.bytesused as usize)
                        .unwrap_or(0);
                    return Ok(Some(Dequeued {
                        index: raw.index,
                        bytes_used,
                        sequence: raw.sequence as u64,
                    }));
                }
                Err(e) => match dqbuf_failure(&e) {
                    DqbufFailure::Interrupted => continue,
                    DqbufFailure::NotReady => return Ok(None),
                    DqbufFailure::Fatal => {
                        return Err(AppError::VideoError(format!(
                            "{}: dqbuf failed: {}",
                            self.name, e
                        )))
                    }
                },
            }
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let mut fds = [PollFd::new(self.fd.as_fd(), self.wait_flags())];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(Readiness::TimedOut),
            Ok(_) => Ok(Readiness::Ready),
            Err(Errno::EINTR) => Ok(Readiness::Interrupted),
            Err(e) => Err(AppError::VideoError(format!(
                "{}: poll failed: {}",
                self.name, e
            ))),
        }
    }

    fn stream_on(&mut self) -> Result<()> {
        ioctl::streamon(&self.fd, self.queue).map_err(|e| {
            AppError::VideoError(format!("{}: failed to start stream: {}", self.name, e))
        })?;
        info!("{}: streaming started", self.name);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        ioctl::streamoff(&self.fd, self.queue).map_err(|e| {
            AppError::VideoError(format!("{}: failed to stop stream: {}", self.name, e))
        })?;
        info!("{}: streaming stopped", self.name);
        Ok(())
    }

    fn free_buffers(&mut self) -> Result<()> {
        let _: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            self.queue,
            MemoryType::Mmap,
            0,
            MemoryConsistency::empty(),
        )
        .map_err(|e| {
            AppError::VideoError(format!("{}: failed to free buffers: {}", self.name, e))
        })?;
        debug!("{}: freed {} buffers", self.name, self.buffer_count);
        self.buffer_count = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_name() {
        assert_eq!(standard_name(0x1000), "NTSC");
        assert_eq!(standard_name(0x0001), "PAL");
        assert_eq!(standard_name(0x0001_0000), "SECAM");
        assert_eq!(standard_name(0x0100_0000), "other");
    }

    #[test]
    fn test_dqbuf_failure_classes() {
        use v4l2r::nix::errno::Errno as V4l2rErrno;

        let eagain: DqBufError<()> = DqBufError::IoctlError(V4l2rErrno::EAGAIN.into());
        let eintr: DqBufError<()> = DqBufError::IoctlError(V4l2rErrno::EINTR.into());
        let eio: DqBufError<()> = DqBufError::IoctlError(V4l2rErrno::EIO.into());
        let eos: DqBufError<()> = DqBufError::IoctlError(DqBufIoctlError::Eos);
        let convert: DqBufError<()> = DqBufError::ConversionError(());

        assert_eq!(dqbuf_failure(&eagain), DqbufFailure::NotReady);
        assert_eq!(dqbuf_failure(&eintr), DqbufFailure::Interrupted);
        assert_eq!(dqbuf_failure(&eio), DqbufFailure::Fatal);
        assert_eq!(dqbuf_failure(&eos), DqbufFailure::Fatal);
        assert_eq!(dqbuf_failure(&convert), DqbufFailure::Fatal);
    }

    #[test]
    fn test_open_missing_device() {
        let err = V4l2Queue::open("/dev/v4l-fanout-missing", Direction::Capture).unwrap_err();
        assert!(matches!(err, AppError::DeviceUnavailable { .. }));
        assert!(err.is_startup());
    }
}
