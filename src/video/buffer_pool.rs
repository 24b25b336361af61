//! Memory-mapped buffer ring bookkeeping
//!
//! A [`BufferPool`] owns the driver queue of one device together with the
//! mappings of every buffer in its ring, and tracks who owns each index:
//!
//! ```text
//!            queue_buffer                 dequeue_buffer
//!   Idle ─────────────────> Queued ──────────────────────> Acquired
//!    ^                        │  (driver owned)            (application owned)
//!    │        stream_off      │                               │
//!    └────────────────────────┘<──────────── release ─────────┘
//! ```
//!
//! Only [`AcquiredBuffer`] tokens grant access to buffer memory, and a token
//! is consumed by [`BufferPool::release`] or [`BufferPool::discard`], so the
//! same acquisition can never be released twice.

use std::ops::DerefMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Minimum ring size: one buffer filled by hardware while one is processed
pub const MIN_BUFFERS: u32 = 2;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Transfer direction of a device queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Driver fills, application drains
    Capture,
    /// Application fills, driver/consumer drains
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Capture => write!(f, "capture"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Result of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// Interrupted by a signal; nothing was consumed
    Interrupted,
}

/// Format reported back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub resolution: Resolution,
    /// Raw FourCC as returned by the driver
    pub fourcc: u32,
}

impl Negotiated {
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(&self.fourcc.to_le_bytes())
    }
}

/// A buffer handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u64,
}

/// Driver side of one device queue
///
/// Implemented by [`crate::video::v4l2::V4l2Queue`] for real devices.
pub trait RawQueue {
    /// Memory of one mapped buffer
    type Mapping: DerefMut<Target = [u8]>;

    /// Device name for diagnostics
    fn name(&self) -> &str;

    fn direction(&self) -> Direction;

    /// Ask the driver whether it would accept a format, without applying it
    fn try_format(&mut self, resolution: Resolution, format: PixelFormat) -> Result<Negotiated>;

    /// Apply a format and read back what the driver actually selected
    fn set_format(&mut self, resolution: Resolution, format: PixelFormat) -> Result<Negotiated>;

    /// Request `count` buffers, returns how many the driver granted
    fn request_buffers(&mut self, count: u32) -> Result<u32>;

    /// Map buffer `index` into the process
    fn map_buffer(&mut self, index: u32) -> Result<Self::Mapping>;

    /// Hand buffer `index` to the driver
    fn queue_buffer(&mut self, index: u32, bytes_used: usize) -> Result<()>;

    /// Take a buffer back from the driver; `None` if none is ready yet.
    /// Signal interruptions are retried inside.
    fn dequeue_buffer(&mut self) -> Result<Option<Dequeued>>;

    /// Wait until a buffer can be dequeued
    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness>;

    fn stream_on(&mut self) -> Result<()>;

    fn stream_off(&mut self) -> Result<()>;

    /// Free the driver allocation (mappings must already be dropped)
    fn free_buffers(&mut self) -> Result<()>;
}

/// Ownership state of one buffer index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the driver; must not be touched
    Queued,
    /// Owned by the application, not handed out
    Idle,
    /// Handed out through an [`AcquiredBuffer`]
    Acquired,
}

struct Slot<M> {
    mapping: M,
    state: BufferState,
}

/// Exclusive claim on one acquired buffer
#[must_use = "acquired buffers must be released back to their pool"]
#[derive(Debug)]
pub struct AcquiredBuffer {
    pool_id: u64,
    index: u32,
    bytes_used: usize,
    sequence: u64,
}

impl AcquiredBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bytes filled by the driver (capture direction)
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Fixed ring of mapped buffers bound to one device queue
pub struct BufferPool<Q: RawQueue> {
    // Mappings are declared first so they drop before the queue
    slots: Vec<Slot<Q::Mapping>>,
    queue: Q,
    id: u64,
    streaming: bool,
    released: bool,
}

impl<Q: RawQueue> BufferPool<Q> {
    /// Wrap a driver queue; no buffers are allocated yet
    pub fn new(queue: Q) -> Self {
        Self {
            slots: Vec::new(),
            queue,
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            streaming: false,
            released: false,
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    pub fn direction(&self) -> Direction {
        self.queue.direction()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.slots.get(index as usize).map(|slot| slot.state)
    }

    /// Number of buffers currently in `state`
    pub fn count(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Mapped size of buffer `index`
    pub fn capacity(&self, index: u32) -> Option<usize> {
        self.slots.get(index as usize).map(|slot| slot.mapping.len())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(AppError::Released(self.queue.name().to_string()));
        }
        Ok(())
    }

    fn violation(&self, reason: impl Into<String>) -> AppError {
        AppError::RingViolation {
            device: self.queue.name().to_string(),
            reason: reason.into(),
        }
    }

    /// Request, map and (for capture) queue `count` buffers
    ///
    /// Returns the number of buffers granted by the driver.
    pub fn allocate(&mut self, count: u32) -> Result<usize> {
        self.ensure_live()?;
        if !self.slots.is_empty() {
            return Err(self.violation("buffers already allocated"));
        }

        let granted = self.queue.request_buffers(count)?;
        if granted < MIN_BUFFERS {
            if let Err(e) = self.queue.free_buffers() {
                debug!("Failed to free short buffer allocation: {}", e);
            }
            return Err(AppError::InsufficientBuffers {
                device: self.queue.name().to_string(),
                granted,
            });
        }

        let mut slots = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let mapping = self.queue.map_buffer(index)?;
            slots.push(Slot {
                mapping,
                state: BufferState::Idle,
            });
        }
        self.slots = slots;

        if self.direction() == Direction::Capture {
            self.queue_idle()?;
        }

        debug!(
            "{}: {} {} buffers mapped ({} requested)",
            self.queue.name(),
            granted,
            self.direction(),
            count
        );
        Ok(granted as usize)
    }

    fn queue_idle(&mut self) -> Result<()> {
        for index in 0..self.slots.len() {
            if self.slots[index].state == BufferState::Idle {
                self.queue.queue_buffer(index as u32, 0)?;
                self.slots[index].state = BufferState::Queued;
            }
        }
        Ok(())
    }

    /// Start streaming; capture buffers left idle by a previous stop are requeued
    pub fn start(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.streaming {
            return Ok(());
        }
        if self.slots.is_empty() {
            return Err(self.violation("streaming requested before buffers were allocated"));
        }
        if self.direction() == Direction::Capture {
            self.queue_idle()?;
        }
        self.queue.stream_on()?;
        self.streaming = true;
        Ok(())
    }

    /// Stop streaming; the driver gives every queued buffer back
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_live()?;
        if !self.streaming {
            return Ok(());
        }
        self.queue.stream_off()?;
        self.streaming = false;
        for slot in &mut self.slots {
            if slot.state == BufferState::Queued {
                slot.state = BufferState::Idle;
            }
        }
        Ok(())
    }

    pub fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        self.ensure_live()?;
        self.queue.wait_ready(timeout)
    }

    /// Dequeue a filled capture buffer; `None` when the driver had nothing ready
    pub fn acquire(&mut self) -> Result<Option<AcquiredBuffer>> {
        self.ensure_live()?;
        match self.queue.dequeue_buffer()? {
            Some(dequeued) => self.claim(dequeued).map(Some),
            None => Ok(None),
        }
    }

    /// Get an output buffer to fill: an idle one if any, else one the
    /// consumer has finished with
    pub fn acquire_output(&mut self) -> Result<Option<AcquiredBuffer>> {
        self.ensure_live()?;
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.state == BufferState::Idle)
        {
            self.slots[index].state = BufferState::Acquired;
            return Ok(Some(AcquiredBuffer {
                pool_id: self.id,
                index: index as u32,
                bytes_used: 0,
                sequence: 0,
            }));
        }
        match self.queue.dequeue_buffer()? {
            Some(dequeued) => self.claim(dequeued).map(Some),
            None => Ok(None),
        }
    }

    fn claim(&mut self, dequeued: Dequeued) -> Result<AcquiredBuffer> {
        let state = self.state(dequeued.index);
        if state != Some(BufferState::Queued) {
            return Err(self.violation(format!(
                "driver returned buffer {} in state {:?}",
                dequeued.index, state
            )));
        }
        self.slots[dequeued.index as usize].state = BufferState::Acquired;
        Ok(AcquiredBuffer {
            pool_id: self.id,
            index: dequeued.index,
            bytes_used: dequeued.bytes_used,
            sequence: dequeued.sequence,
        })
    }

    fn check_owned(&self, buffer: &AcquiredBuffer) -> Result<()> {
        if buffer.pool_id != self.id {
            return Err(self.violation(format!(
                "buffer {} belongs to another pool",
                buffer.index
            )));
        }
        if self.state(buffer.index) != Some(BufferState::Acquired) {
            return Err(self.violation(format!("buffer {} is not acquired", buffer.index)));
        }
        Ok(())
    }

    /// Whole mapped region of an acquired buffer
    pub fn data(&self, buffer: &AcquiredBuffer) -> Result<&[u8]> {
        self.ensure_live()?;
        self.check_owned(buffer)?;
        Ok(&self.slots[buffer.index as usize].mapping)
    }

    /// Bytes filled by the driver, clamped to the mapping
    pub fn payload(&self, buffer: &AcquiredBuffer) -> Result<&[u8]> {
        let data = self.data(buffer)?;
        Ok(&data[..buffer.bytes_used.min(data.len())])
    }

    pub fn data_mut(&mut self, buffer: &AcquiredBuffer) -> Result<&mut [u8]> {
        self.ensure_live()?;
        self.check_owned(buffer)?;
        Ok(&mut self.slots[buffer.index as usize].mapping)
    }

    /// Requeue an acquired buffer
    ///
    /// For output queues `bytes_used` tells the driver how much is valid; it
    /// is clamped to the buffer capacity, and the caller compares the return
    /// value to spot truncation. Capture buffers are requeued
    /// unconditionally. Returns the byte count handed to the driver.
    pub fn release(&mut self, buffer: AcquiredBuffer, bytes_used: usize) -> Result<usize> {
        self.ensure_live()?;
        self.check_owned(&buffer)?;

        let index = buffer.index as usize;
        let used = match self.direction() {
            Direction::Capture => 0,
            Direction::Output => bytes_used.min(self.slots[index].mapping.len()),
        };

        if let Err(e) = self.queue.queue_buffer(buffer.index, used) {
            // The driver did not take it, so it is still ours
            self.slots[index].state = BufferState::Idle;
            return Err(e);
        }
        self.slots[index].state = BufferState::Queued;
        Ok(used)
    }

    /// Give an acquired buffer back to the pool without queueing it
    pub fn discard(&mut self, buffer: AcquiredBuffer) -> Result<()> {
        self.ensure_live()?;
        self.check_owned(&buffer)?;
        self.slots[buffer.index as usize].state = BufferState::Idle;
        Ok(())
    }

    /// Stop streaming, unmap every buffer and free the driver allocation
    pub fn release_all(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if self.streaming {
            self.queue.stream_off()?;
            self.streaming = false;
        }
        let outstanding = self.count(BufferState::Acquired);
        if outstanding > 0 {
            warn!(
                "{}: releasing pool with {} buffer(s) still acquired",
                self.queue.name(),
                outstanding
            );
        }
        let had_buffers = !self.slots.is_empty();
        self.slots.clear();
        self.released = true;
        if had_buffers {
            self.queue.free_buffers()?;
        }
        Ok(())
    }
}

impl<Q: RawQueue> Drop for BufferPool<Q> {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            debug!("Failed to release buffers of {}: {}", self.queue.name(), e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryQueue;
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn capture_pool(buffers: u32) -> BufferPool<MemoryQueue> {
        let mut queue = MemoryQueue::capture("/dev/video0", vec![7u8; 64]);
        queue.max_buffers = buffers;
        let mut pool = BufferPool::new(queue);
        pool.allocate(buffers).unwrap();
        pool
    }

    #[test]
    fn test_capture_allocation_queues_everything() {
        let pool = capture_pool(4);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.count(BufferState::Queued), 4);
        assert_eq!(pool.queue().in_driver(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_output_allocation_leaves_buffers_idle() {
        let mut pool = BufferPool::new(MemoryQueue::output("/dev/video3", 32));
        pool.allocate(4).unwrap();
        assert_eq!(pool.count(BufferState::Idle), 4);
        assert!(pool.queue().queued.is_empty());
    }

    #[test]
    fn test_insufficient_buffers() {
        let mut queue = MemoryQueue::capture("/dev/video0", vec![0u8; 16]);
        queue.max_buffers = 1;
        let mut pool = BufferPool::new(queue);

        let err = pool.allocate(4).unwrap_err();
        assert!(matches!(err, AppError::InsufficientBuffers { granted: 1, .. }));
        assert!(pool.queue().freed);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_acquire_reads_driver_payload() {
        let mut pool = capture_pool(2);
        pool.start().unwrap();

        let buffer = pool.acquire().unwrap().unwrap();
        assert_eq!(buffer.index(), 0);
        assert_eq!(pool.payload(&buffer).unwrap(), &[7u8; 64][..]);
        assert_eq!(pool.state(0), Some(BufferState::Acquired));

        pool.release(buffer, 123).unwrap();
        assert_eq!(pool.state(0), Some(BufferState::Queued));
        // capture requeues ignore bytes_used
        assert_eq!(pool.queue().queued.last(), Some(&(0, 0)));
    }

    #[test]
    fn test_output_release_truncates_to_capacity() {
        let mut pool = BufferPool::new(MemoryQueue::output("/dev/video3", 8));
        pool.allocate(2).unwrap();
        pool.start().unwrap();

        let buffer = pool.acquire_output().unwrap().unwrap();
        pool.data_mut(&buffer).unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let used = pool.release(buffer, 100).unwrap();

        assert_eq!(used, 8);
        assert_eq!(pool.queue().delivered, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
    }

    #[test]
    fn test_output_reuses_consumed_buffers() {
        let mut pool = BufferPool::new(MemoryQueue::output("/dev/video3", 4));
        pool.allocate(2).unwrap();
        pool.start().unwrap();

        let a = pool.acquire_output().unwrap().unwrap();
        let b = pool.acquire_output().unwrap().unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(pool.queue().dequeue_calls, 0);
        pool.release(a, 4).unwrap();
        pool.release(b, 4).unwrap();

        // Idle buffers exhausted: the next one comes back from the consumer
        let c = pool.acquire_output().unwrap().unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(pool.queue().dequeue_calls, 1);
        pool.discard(c).unwrap();
        assert_eq!(pool.state(0), Some(BufferState::Idle));
    }

    #[test]
    fn test_foreign_token_rejected() {
        let mut first = capture_pool(2);
        let mut second = capture_pool(2);
        first.start().unwrap();
        second.start().unwrap();

        let token = first.acquire().unwrap().unwrap();
        assert!(matches!(
            second.data(&token),
            Err(AppError::RingViolation { .. })
        ));
        assert!(matches!(
            second.release(token, 0),
            Err(AppError::RingViolation { .. })
        ));
        assert_eq!(first.state(0), Some(BufferState::Acquired));
    }

    #[test]
    fn test_failed_requeue_keeps_buffer_owned() {
        let mut pool = capture_pool(2);
        pool.start().unwrap();
        let buffer = pool.acquire().unwrap().unwrap();
        pool.queue_mut().fail_queue_index = Some(buffer.index());

        assert!(pool.release(buffer, 0).is_err());
        assert_eq!(pool.state(0), Some(BufferState::Idle));
    }

    #[test]
    fn test_stop_then_start_requeues_capture_ring() {
        let mut pool = capture_pool(3);
        pool.start().unwrap();
        let held = pool.acquire().unwrap().unwrap();

        pool.stop().unwrap();
        assert_eq!(pool.count(BufferState::Idle), 2);
        assert_eq!(pool.count(BufferState::Acquired), 1);

        pool.release(held, 0).unwrap();
        pool.start().unwrap();
        assert_eq!(pool.count(BufferState::Queued), 3);
    }

    #[test]
    fn test_use_after_release_all() {
        let mut pool = capture_pool(2);
        pool.start().unwrap();
        pool.release_all().unwrap();

        assert!(pool.queue().freed);
        assert_eq!(pool.queue().stream_off_calls, 1);
        assert!(matches!(pool.acquire(), Err(AppError::Released(_))));
        assert!(matches!(pool.start(), Err(AppError::Released(_))));
        // idempotent
        pool.release_all().unwrap();
    }

    #[test]
    fn test_random_acquire_release_sequences_keep_ring_invariant() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for round in 0..50 {
            let buffers = rng.gen_range(2..=6);
            let mut pool = capture_pool(buffers);
            pool.start().unwrap();
            let mut held: Vec<AcquiredBuffer> = Vec::new();
            let mut owned = std::collections::HashSet::new();

            for _ in 0..200 {
                let can_acquire = pool.count(BufferState::Queued) > 0;
                if can_acquire && (held.is_empty() || rng.gen_bool(0.5)) {
                    let buffer = pool.acquire().unwrap().unwrap();
                    assert!(
                        owned.insert(buffer.index()),
                        "round {}: index {} acquired twice without release",
                        round,
                        buffer.index()
                    );
                    held.push(buffer);
                } else if !held.is_empty() {
                    let buffer = held.swap_remove(rng.gen_range(0..held.len()));
                    owned.remove(&buffer.index());
                    pool.release(buffer, 0).unwrap();
                }

                assert_eq!(pool.count(BufferState::Acquired), held.len());
                assert_eq!(
                    pool.count(BufferState::Queued) + held.len(),
                    buffers as usize
                );
            }

            for buffer in held.drain(..) {
                pool.release(buffer, 0).unwrap();
            }
            assert_eq!(pool.count(BufferState::Queued), buffers as usize);
        }
    }
}
