//! Device handle: one opened V4L2 node, its negotiated format and buffer ring

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::buffer_pool::{AcquiredBuffer, BufferPool, Direction, RawQueue, Readiness};
use super::format::{PixelFormat, Resolution};
use super::v4l2::V4l2Queue;
use crate::error::{AppError, Result};

/// An opened capture or output device
///
/// Dropping the handle stops streaming and releases every buffer, so all
/// exit paths give the driver its memory back.
pub struct DeviceHandle<Q: RawQueue = V4l2Queue> {
    name: String,
    resolution: Resolution,
    format: Option<PixelFormat>,
    pool: BufferPool<Q>,
}

impl DeviceHandle<V4l2Queue> {
    /// Open a device node for `direction`
    pub fn open(path: impl AsRef<Path>, direction: Direction) -> Result<Self> {
        let queue = V4l2Queue::open(path, direction)?;
        Ok(Self::from_queue(queue))
    }

    /// Open, negotiate and allocate in one go
    ///
    /// Capture devices additionally lock onto the analog standard and report
    /// their frame rate.
    pub fn open_configured(
        path: impl AsRef<Path>,
        direction: Direction,
        resolution: Resolution,
        format: PixelFormat,
        buffer_count: u32,
    ) -> Result<Self> {
        let mut device = Self::open(path, direction)?;
        if direction == Direction::Capture {
            device.pool.queue().detect_standard();
        }

        device.negotiate_format(resolution, format)?;

        if direction == Direction::Capture {
            if let Some(fps) = device.pool.queue().frame_rate() {
                info!("{}: capturing at {:.2} fps", device.name, fps);
            }
        }

        device.allocate_buffers(buffer_count)?;
        Ok(device)
    }
}

impl<Q: RawQueue> DeviceHandle<Q> {
    /// Wrap an already opened driver queue
    pub fn from_queue(queue: Q) -> Self {
        Self {
            name: queue.name().to_string(),
            resolution: Resolution::new(0, 0),
            format: None,
            pool: BufferPool::new(queue),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.pool.direction()
    }

    /// Negotiated resolution
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Negotiated pixel format, `None` before negotiation
    pub fn format(&self) -> Option<PixelFormat> {
        self.format
    }

    pub fn pool(&self) -> &BufferPool<Q> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool<Q> {
        &mut self.pool
    }

    /// Try the format, then commit it and read back what the driver chose
    ///
    /// The driver may substitute the resolution (the actual one is returned)
    /// but never the pixel format.
    pub fn negotiate_format(
        &mut self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<Resolution> {
        if !self.pool.is_empty() {
            return Err(AppError::RingViolation {
                device: self.name.clone(),
                reason: "format change with buffers allocated".to_string(),
            });
        }

        let tried = self.pool.queue_mut().try_format(resolution, format)?;
        self.check_fourcc(format, tried.fourcc)?;

        let actual = self.pool.queue_mut().set_format(resolution, format)?;
        self.check_fourcc(format, actual.fourcc)?;

        if actual.resolution != resolution {
            warn!(
                "{}: requested {}, driver selected {}",
                self.name, resolution, actual.resolution
            );
        }

        self.resolution = actual.resolution;
        self.format = Some(format);
        info!(
            "{}: format {} {}",
            self.name, format, self.resolution
        );
        Ok(self.resolution)
    }

    fn check_fourcc(&self, format: PixelFormat, offered: u32) -> Result<()> {
        // Aliases such as I420/YU12 count as the same format
        if PixelFormat::from_fourcc(&offered.to_le_bytes()) == Some(format) {
            return Ok(());
        }
        Err(AppError::FormatUnsupported {
            device: self.name.clone(),
            requested: format.to_string(),
            actual: PixelFormat::fourcc_string(offered),
        })
    }

    /// Map `count` buffers; at least two must be granted
    pub fn allocate_buffers(&mut self, count: u32) -> Result<usize> {
        self.pool.allocate(count)
    }

    pub fn start(&mut self) -> Result<()> {
        self.pool.start()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.pool.stop()
    }

    pub fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        self.pool.wait_ready(timeout)
    }

    /// Take a filled capture buffer; `None` on a spurious wakeup
    pub fn acquire(&mut self) -> Result<Option<AcquiredBuffer>> {
        self.pool.acquire()
    }

    /// Take an output buffer to fill; `None` if the consumer holds them all
    pub fn acquire_output(&mut self) -> Result<Option<AcquiredBuffer>> {
        self.pool.acquire_output()
    }

    pub fn payload(&self, buffer: &AcquiredBuffer) -> Result<&[u8]> {
        self.pool.payload(buffer)
    }

    pub fn data_mut(&mut self, buffer: &AcquiredBuffer) -> Result<&mut [u8]> {
        self.pool.data_mut(buffer)
    }

    /// Requeue a buffer; returns the byte count handed to the driver
    pub fn release(&mut self, buffer: AcquiredBuffer, bytes_used: usize) -> Result<usize> {
        self.pool.release(buffer, bytes_used)
    }

    /// Return a buffer to the pool unfilled
    pub fn discard(&mut self, buffer: AcquiredBuffer) -> Result<()> {
        self.pool.discard(buffer)
    }

    /// Stop streaming and free every buffer; the handle is unusable afterwards
    pub fn shutdown(&mut self) -> Result<()> {
        self.pool.release_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::buffer_pool::testing::MemoryQueue;
    use crate::video::buffer_pool::BufferState;

    fn output_device(buffer_size: usize) -> DeviceHandle<MemoryQueue> {
        DeviceHandle::from_queue(MemoryQueue::output("/dev/video3", buffer_size))
    }

    #[test]
    fn test_negotiate_accepts_substituted_resolution() {
        let mut queue = MemoryQueue::capture("/dev/video0", vec![0; 16]);
        queue.forced_resolution = Some(Resolution::new(720, 480));
        let mut device = DeviceHandle::from_queue(queue);

        let actual = device
            .negotiate_format(Resolution::VGA, PixelFormat::Uyvy)
            .unwrap();
        assert_eq!(actual, Resolution::new(720, 480));
        assert_eq!(device.resolution(), actual);
        assert_eq!(device.format(), Some(PixelFormat::Uyvy));
    }

    #[test]
    fn test_negotiate_rejects_other_fourcc() {
        let mut queue = MemoryQueue::capture("/dev/video0", vec![0; 16]);
        queue.forced_fourcc = Some(u32::from_le_bytes(*b"YUYV"));
        let mut device = DeviceHandle::from_queue(queue);

        let err = device
            .negotiate_format(Resolution::VGA, PixelFormat::Uyvy)
            .unwrap_err();
        match err {
            AppError::FormatUnsupported {
                requested, actual, ..
            } => {
                assert_eq!(requested, "UYVY");
                assert_eq!(actual, "YUYV");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(device.format(), None);
    }

    #[test]
    fn test_negotiate_accepts_fourcc_alias() {
        let mut queue = MemoryQueue::output("/dev/video3", 16);
        queue.forced_fourcc = Some(u32::from_le_bytes(*b"I420"));
        let mut device = DeviceHandle::from_queue(queue);

        assert!(device
            .negotiate_format(Resolution::VGA, PixelFormat::Yuv420)
            .is_ok());
    }

    #[test]
    fn test_format_locked_after_allocation() {
        let mut device = output_device(16);
        device.allocate_buffers(2).unwrap();
        assert!(matches!(
            device.negotiate_format(Resolution::VGA, PixelFormat::Nv12),
            Err(AppError::RingViolation { .. })
        ));
    }

    #[test]
    fn test_drop_releases_streaming_device() {
        let mut device = output_device(16);
        device.allocate_buffers(3).unwrap();
        device.start().unwrap();
        let buffer = device.acquire_output().unwrap().unwrap();
        device.release(buffer, 16).unwrap();

        device.shutdown().unwrap();
        assert!(device.pool().queue().freed);
        assert_eq!(device.pool().queue().stream_off_calls, 1);
        assert!(matches!(device.acquire_output(), Err(AppError::Released(_))));
    }

    #[test]
    fn test_discard_returns_buffer_unqueued() {
        let mut device = output_device(16);
        device.allocate_buffers(2).unwrap();
        device.start().unwrap();

        let buffer = device.acquire_output().unwrap().unwrap();
        let index = buffer.index();
        device.discard(buffer).unwrap();

        assert_eq!(device.pool().state(index), Some(BufferState::Idle));
        assert!(device.pool().queue().queued.is_empty());
    }
}
