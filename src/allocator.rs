//! Per-stream frame buffer allocation.
//!
//! Every stream owns a [`FrameAllocator`]. It pairs frame slots from the
//! shared [`FramePool`] with raw pixel buffers obtained from the stream's
//! active strategy: by default a free list of buffers of the stream's
//! required size, or a user-installed allocate/free pair.
//!
//! The allocator keeps a registry of the frames it has handed out. When the
//! stream is reconfigured or torn down, those frames are *detached* rather
//! than destroyed: consumers may still hold references, so the frame stays
//! alive but its buffer will be freed outright instead of being recycled into
//! a free list that no longer matches the stream.

use std::{
    collections::HashSet,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{debug, warn};

use crate::{
    frames::{FrameData, SensorType, VideoMode},
    pool::{BufferDisposal, FrameId, FramePool, FrameRef, FreeBufferFn, ReturnHook},
    Error, Result,
};

/// Allocates a raw frame buffer of the requested size.
///
/// Returning `None` reports allocation failure; the frame is then skipped for
/// this cycle.
pub type AllocBufferFn = Arc<dyn Fn(usize) -> Option<Box<[u8]>> + Send + Sync>;

#[derive(Clone)]
enum Strategy {
    Pooled,
    Custom {
        alloc: AllocBufferFn,
        free: FreeBufferFn,
    },
}

struct AllocatorState {
    strategy: Strategy,
    required_size: usize,
    idle: Vec<Box<[u8]>>,
    in_flight: HashSet<FrameId>,
    active: bool,
}

impl AllocatorState {
    /// Detaches every in-flight frame and frees the idle buffers.
    fn release_all(&mut self, pool: &FramePool) {
        for id in self.in_flight.drain() {
            pool.detach(id);
        }
        self.idle.clear();
    }
}

/// Buffer strategy and bookkeeping for one producing stream.
///
/// Cloning yields another handle to the same allocator.
#[derive(Clone)]
pub struct FrameAllocator {
    pool: FramePool,
    state: Arc<Mutex<AllocatorState>>,
    recycle: FreeBufferFn,
}

impl fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("FrameAllocator")
            .field("custom", &matches!(state.strategy, Strategy::Custom { .. }))
            .field("required_size", &state.required_size)
            .field("idle", &state.idle.len())
            .field("in_flight", &state.in_flight.len())
            .field("active", &state.active)
            .finish()
    }
}

fn lock_state(state: &Mutex<AllocatorState>) -> MutexGuard<'_, AllocatorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn alloc_zeroed(size: usize) -> Option<Box<[u8]>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(size).ok()?;
    buffer.resize(size, 0u8);
    Some(buffer.into_boxed_slice())
}

impl FrameAllocator {
    pub fn new(pool: FramePool, required_size: usize) -> Self {
        let state = Arc::new(Mutex::new(AllocatorState {
            strategy: Strategy::Pooled,
            required_size,
            idle: Vec::new(),
            in_flight: HashSet::new(),
            active: false,
        }));

        let weak = Arc::downgrade(&state);
        let recycle: FreeBufferFn = Arc::new(move |buffer: Box<[u8]>| {
            if let Some(state) = weak.upgrade() {
                let mut state = lock_state(&state);
                if matches!(state.strategy, Strategy::Pooled) && buffer.len() == state.required_size
                {
                    state.idle.push(buffer);
                }
            }
        });

        Self {
            pool,
            state,
            recycle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        lock_state(&self.state)
    }

    /// Installs a custom allocate/free pair, or resets to the default pool.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfFlow`] while the owning stream is producing. The active
    ///   strategy is left untouched.
    /// - [`Error::BadParameter`] if only one of the two functions is given.
    pub fn set_allocator(
        &self,
        alloc: Option<AllocBufferFn>,
        free: Option<FreeBufferFn>,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.active {
            warn!("frame buffer allocator change rejected while streaming");
            return Err(Error::OutOfFlow(
                "cannot change the frame buffer allocator while the stream is started".into(),
            ));
        }

        match (alloc, free) {
            (Some(alloc), Some(free)) => {
                state.idle.clear();
                state.strategy = Strategy::Custom { alloc, free };
                debug!("custom frame buffer allocator installed");
            }
            (None, None) => {
                state.strategy = Strategy::Pooled;
                debug!("frame buffer allocator reset to default pool");
            }
            _ => {
                warn!("one-sided frame buffer allocator override rejected");
                return Err(Error::BadParameter(
                    "allocate and free functions must be given together".into(),
                ));
            }
        }
        Ok(())
    }

    /// Changes the size of the buffers handed out from now on.
    ///
    /// A different size drops every idle buffer and detaches the in-flight
    /// frames; frames consumers still hold stay valid.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfFlow`] while the owning stream is producing. The size is
    /// left untouched.
    pub fn set_required_size(&self, size: usize) -> Result<()> {
        let mut state = self.lock();
        if state.active {
            warn!(size, "buffer size change rejected while streaming");
            return Err(Error::OutOfFlow(
                "cannot change the buffer size while the stream is started".into(),
            ));
        }
        if state.required_size != size {
            debug!(from = state.required_size, to = size, "required buffer size changed");
            state.release_all(&self.pool);
            state.required_size = size;
        }
        Ok(())
    }

    pub fn required_size(&self) -> usize {
        self.lock().required_size
    }

    /// Detaches every in-flight frame and frees every idle buffer.
    pub(crate) fn release_all_frames(&self) {
        self.lock().release_all(&self.pool);
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.lock().active = active;
    }

    /// Number of pooled buffers waiting for reuse.
    pub fn idle_buffers(&self) -> usize {
        self.lock().idle.len()
    }

    /// Number of frames handed out and not yet reclaimed.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Acquires a frame slot with a buffer of the required size.
    ///
    /// Returns `None` if either the slot or the buffer could not be obtained;
    /// the caller should treat that as "no frame this cycle".
    pub fn acquire_frame(&self, sensor_type: SensorType, video_mode: VideoMode) -> Option<NewFrame> {
        let id = self.pool.acquire()?;

        let (strategy, size, pooled) = {
            let mut state = self.lock();
            let pooled = match state.strategy {
                Strategy::Pooled => state.idle.pop(),
                Strategy::Custom { .. } => None,
            };
            (state.strategy.clone(), state.required_size, pooled)
        };

        let (buffer, disposal) = match strategy {
            Strategy::Pooled => (
                pooled.or_else(|| alloc_zeroed(size)),
                BufferDisposal::Recycle(Arc::clone(&self.recycle)),
            ),
            Strategy::Custom { alloc, free } => (alloc(size), BufferDisposal::Custom(free)),
        };

        let Some(buffer) = buffer else {
            warn!(size, "frame buffer allocation failed");
            if let Err(e) = self.pool.release(id) {
                warn!(error = %e, "releasing unused frame slot failed");
            }
            return None;
        };

        let on_return: ReturnHook = {
            let weak: Weak<Mutex<AllocatorState>> = Arc::downgrade(&self.state);
            Box::new(move |id: FrameId| {
                if let Some(state) = weak.upgrade() {
                    lock_state(&state).in_flight.remove(&id);
                }
            })
        };

        {
            // Registered under the allocator lock so a concurrent
            // release_all_frames either sees the frame or runs before its
            // hooks exist.
            let mut state = self.lock();
            if let Err(e) = self.pool.set_hooks(id, Some(on_return), disposal) {
                warn!(error = %e, "installing frame hooks failed");
                drop(state);
                if let Err(e) = self.pool.release(id) {
                    warn!(error = %e, "releasing unhooked frame slot failed");
                }
                return None;
            }
            state.in_flight.insert(id);
        }

        Some(NewFrame {
            pool: self.pool.clone(),
            id,
            data: Some(FrameData::new(sensor_type, video_mode, buffer)),
        })
    }
}

/// A frame being filled by its producer.
///
/// Dereferences mutably to [`FrameData`] so the producer can set metadata
/// and write pixels. [`NewFrame::publish`] freezes it into a shareable
/// [`FrameRef`]. Dropping an unpublished frame releases it.
pub struct NewFrame {
    pool: FramePool,
    id: FrameId,
    data: Option<FrameData>,
}

impl NewFrame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Sets the capture timestamp in microseconds.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.payload_mut().timestamp = timestamp;
        self
    }

    /// Sets the sequence number.
    pub fn with_frame_index(mut self, frame_index: u64) -> Self {
        self.payload_mut().frame_index = frame_index;
        self
    }

    /// Hands the frame off. The returned reference owns the producer's count.
    pub fn publish(mut self) -> Result<FrameRef> {
        let data = self.take_payload();
        let data = self.pool.publish(self.id, data)?;
        Ok(FrameRef::adopt(self.pool.clone(), self.id, data))
    }

    fn take_payload(&mut self) -> FrameData {
        match self.data.take() {
            Some(data) => data,
            None => unreachable!("NewFrame payload is only taken once"),
        }
    }

    fn payload(&self) -> &FrameData {
        match &self.data {
            Some(data) => data,
            None => unreachable!("NewFrame payload is only taken on publish"),
        }
    }

    fn payload_mut(&mut self) -> &mut FrameData {
        match &mut self.data {
            Some(data) => data,
            None => unreachable!("NewFrame payload is only taken on publish"),
        }
    }
}

impl Deref for NewFrame {
    type Target = FrameData;

    fn deref(&self) -> &FrameData {
        self.payload()
    }
}

impl DerefMut for NewFrame {
    fn deref_mut(&mut self) -> &mut FrameData {
        self.payload_mut()
    }
}

impl Drop for NewFrame {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            // Store the payload so its buffer goes through the disposal path.
            let _ = self.pool.publish(self.id, data);
            if let Err(e) = self.pool.release(self.id) {
                warn!(error = %e, "release of unpublished frame failed");
            }
        }
    }
}

impl fmt::Debug for NewFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewFrame")
            .field("id", &self.id)
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::PixelFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mode() -> VideoMode {
        VideoMode::new(PixelFormat::Gray8, 4, 4, 30)
    }

    #[test]
    fn test_default_pool_recycles_buffers() {
        let pool = FramePool::new();
        let allocator = FrameAllocator::new(pool.clone(), 16);

        let frame = allocator.acquire_frame(SensorType::Ir, mode()).unwrap();
        assert_eq!(frame.data_size(), 16);
        assert_eq!(allocator.in_flight(), 1);

        let published = frame.publish().unwrap();
        drop(published);

        assert_eq!(allocator.in_flight(), 0);
        assert_eq!(allocator.idle_buffers(), 1);
        assert_eq!(pool.live_frames(), 0);

        let _again = allocator.acquire_frame(SensorType::Ir, mode()).unwrap();
        assert_eq!(allocator.idle_buffers(), 0);
    }

    #[test]
    fn test_one_sided_override_rejected() {
        let allocator = FrameAllocator::new(FramePool::new(), 8);
        let alloc: AllocBufferFn = Arc::new(|size: usize| Some(vec![0u8; size].into_boxed_slice()));
        let err = allocator.set_allocator(Some(alloc), None).unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
    }

    #[test]
    fn test_override_rejected_while_active() {
        let allocator = FrameAllocator::new(FramePool::new(), 8);
        allocator.set_active(true);
        assert!(matches!(
            allocator.set_allocator(None, None),
            Err(Error::OutOfFlow(_))
        ));
    }

    #[test]
    fn test_size_change_rejected_while_active() {
        let allocator = FrameAllocator::new(FramePool::new(), 8);
        allocator.set_active(true);
        assert!(matches!(
            allocator.set_required_size(99),
            Err(Error::OutOfFlow(_))
        ));
        assert_eq!(allocator.required_size(), 8);
        let frame = allocator.acquire_frame(SensorType::Ir, mode()).unwrap();
        assert_eq!(frame.data_size(), 8);

        allocator.set_active(false);
        allocator.set_required_size(99).unwrap();
        assert_eq!(allocator.required_size(), 99);
    }

    #[test]
    fn test_custom_allocator_receives_buffers() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&freed);
        let allocator = FrameAllocator::new(FramePool::new(), 8);
        allocator
            .set_allocator(
                Some(Arc::new(|size: usize| Some(vec![7u8; size].into_boxed_slice()))),
                Some(Arc::new(move |_: Box<[u8]>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let frame = allocator.acquire_frame(SensorType::Color, mode()).unwrap();
        assert_eq!(frame.data()[0], 7);
        drop(frame.publish().unwrap());

        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.idle_buffers(), 0);
    }

    #[test]
    fn test_allocation_failure_yields_none() {
        let pool = FramePool::new();
        let allocator = FrameAllocator::new(pool.clone(), 8);
        allocator
            .set_allocator(
                Some(Arc::new(|_: usize| None)),
                Some(Arc::new(|_: Box<[u8]>| {})),
            )
            .unwrap();

        assert!(allocator.acquire_frame(SensorType::Depth, mode()).is_none());
        assert_eq!(pool.live_frames(), 0);
    }

    #[test]
    fn test_size_change_detaches_in_flight_frames() {
        let pool = FramePool::new();
        let allocator = FrameAllocator::new(pool.clone(), 16);

        let held = allocator
            .acquire_frame(SensorType::Depth, mode())
            .unwrap()
            .publish()
            .unwrap();
        let spare = allocator.acquire_frame(SensorType::Depth, mode()).unwrap();
        drop(spare.publish().unwrap());
        assert_eq!(allocator.idle_buffers(), 1);

        allocator.set_required_size(32).unwrap();
        assert_eq!(allocator.idle_buffers(), 0);
        assert_eq!(allocator.in_flight(), 0);

        // The held frame is still readable and is freed, not recycled.
        assert_eq!(held.data_size(), 16);
        drop(held);
        assert_eq!(allocator.idle_buffers(), 0);
        assert_eq!(pool.live_frames(), 0);
    }

    #[test]
    fn test_unpublished_frame_is_released_on_drop() {
        let pool = FramePool::new();
        let allocator = FrameAllocator::new(pool.clone(), 4);
        let mut frame = allocator.acquire_frame(SensorType::Ir, mode()).unwrap();
        frame.data_mut()[0] = 1;
        drop(frame);

        assert_eq!(pool.live_frames(), 0);
        assert_eq!(allocator.in_flight(), 0);
        assert_eq!(allocator.idle_buffers(), 1);
    }
}
