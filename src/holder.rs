//! Frame delivery policies.
//!
//! A stream hands every published frame to its current [`FrameHolder`], and
//! readers take frames back out of it. Two policies exist:
//!
//! - [`SingleStreamHolder`] keeps only the newest frame of one stream.
//! - [`SyncedGroupHolder`] latches frames with the same sequence number
//!   across a fixed set of member streams.
//!
//! Streams are rewired between the two when frame sync is enabled or
//! disabled. A holder never owns a stream; it only owns the frame references
//! it currently keeps.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    event::{FrameEvent, WaitResult},
    fps::FpsCounter,
    framesync::SyncedGroupHolder,
    pool::FrameRef,
    stream::StreamId,
    wait::WaitCoordinator,
    Error, Result,
};

/// Frames averaged by a stream's rate counter unless configured otherwise.
pub const DEFAULT_FPS_WINDOW: usize = 180;

/// Callback run after a frame was delivered to a stream's holder.
pub type NewFrameCallback = Arc<dyn Fn(StreamId) + Send + Sync>;

/// Identifies a registered new-frame listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next: u64,
    entries: Vec<(ListenerId, NewFrameCallback)>,
}

/// Wake-up side of a stream, shared by the stream and every holder it has
/// been wired to.
pub(crate) struct StreamSignal {
    id: StreamId,
    event: FrameEvent,
    coordinator: Arc<WaitCoordinator>,
    fps: Mutex<FpsCounter>,
    fps_log_interval: Option<Duration>,
    listeners: Mutex<Listeners>,
}

impl fmt::Debug for StreamSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSignal")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}

impl StreamSignal {
    pub(crate) fn new(id: StreamId, coordinator: Arc<WaitCoordinator>) -> Self {
        Self {
            id,
            event: FrameEvent::new(),
            coordinator,
            fps: Mutex::new(FpsCounter::new(DEFAULT_FPS_WINDOW)),
            fps_log_interval: None,
            listeners: Mutex::new(Listeners::default()),
        }
    }

    pub(crate) fn with_fps(mut self, window: usize, log_interval: Option<Duration>) -> Self {
        self.fps = Mutex::new(FpsCounter::new(window));
        self.fps_log_interval = log_interval;
        self
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    /// Wakes readers of this stream and every thread in a multi-stream wait.
    pub(crate) fn wake(&self) {
        self.event.signal();
        self.coordinator.notify_all();
    }

    /// A frame became readable: count it, wake waiters, run listeners.
    pub(crate) fn deliver(&self) {
        let now = Instant::now();
        let report = {
            let mut fps = lock(&self.fps);
            fps.record_at(now);
            match self.fps_log_interval {
                Some(interval) if fps.report_due(interval, now) => Some(fps.fps()),
                _ => None,
            }
        };
        if let Some(fps) = report {
            debug!(stream = %self.id, fps = format_args!("{fps:.1}"), "stream frame rate");
        }

        self.wake();

        let listeners: Vec<NewFrameCallback> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in listeners {
            callback(self.id);
        }
    }

    pub(crate) fn fps(&self) -> f64 {
        lock(&self.fps).fps()
    }

    pub(crate) fn add_listener(&self, callback: NewFrameCallback) -> ListenerId {
        let mut listeners = lock(&self.listeners);
        let id = ListenerId(listeners.next);
        listeners.next += 1;
        listeners.entries.push((id, callback));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(entry, _)| *entry != id);
        listeners.entries.len() != before
    }

    /// Blocks until the next wake-up.
    pub(crate) fn wait(&self) -> Result<()> {
        match self.event.wait() {
            WaitResult::Signaled | WaitResult::TimedOut => Ok(()),
            WaitResult::Closed => Err(Error::ShutDown(format!("stream {}", self.id))),
        }
    }

    pub(crate) fn close(&self) {
        self.event.close();
        lock(&self.listeners).entries.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.event.is_closed()
    }
}

/// Result of a holder-level read.
#[derive(Debug)]
pub(crate) enum HolderRead {
    Frame(FrameRef),
    /// The holder was disabled, typically because the stream was rewired.
    Disabled,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The delivery policy a stream is currently wired to.
///
/// Cloning shares the underlying holder.
#[derive(Debug, Clone)]
pub(crate) enum FrameHolder {
    Single(Arc<SingleStreamHolder>),
    Synced(Arc<SyncedGroupHolder>),
}

impl FrameHolder {
    pub(crate) fn single(signal: Arc<StreamSignal>) -> Self {
        FrameHolder::Single(Arc::new(SingleStreamHolder::new(signal)))
    }

    pub(crate) fn process_new_frame(&self, stream: StreamId, frame: FrameRef) -> Result<()> {
        match self {
            FrameHolder::Single(holder) => holder.process_new_frame(stream, frame),
            FrameHolder::Synced(holder) => holder.process_new_frame(stream, frame),
        }
    }

    pub(crate) fn read_frame(&self, stream: StreamId) -> Result<HolderRead> {
        match self {
            FrameHolder::Single(holder) => holder.read_frame(stream),
            FrameHolder::Synced(holder) => holder.read_frame(stream),
        }
    }

    pub(crate) fn peek_frame(&self, stream: StreamId) -> Option<FrameRef> {
        match self {
            FrameHolder::Single(holder) => holder.peek_frame(stream),
            FrameHolder::Synced(holder) => holder.peek_frame(stream),
        }
    }

    /// Timestamp of the frame a read would return next, without taking a
    /// reference.
    pub(crate) fn peek_timestamp(&self, stream: StreamId) -> Option<u64> {
        match self {
            FrameHolder::Single(holder) => holder.peek_timestamp(stream),
            FrameHolder::Synced(holder) => holder.peek_timestamp(stream),
        }
    }

    pub(crate) fn clear(&self) {
        match self {
            FrameHolder::Single(holder) => holder.clear(),
            FrameHolder::Synced(holder) => holder.clear(),
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        match self {
            FrameHolder::Single(holder) => holder.set_enabled(enabled),
            FrameHolder::Synced(holder) => holder.set_enabled(enabled),
        }
    }

    pub(crate) fn set_stream_enabled(&self, stream: StreamId, enabled: bool) {
        match self {
            FrameHolder::Single(holder) => holder.set_stream_enabled(stream, enabled),
            FrameHolder::Synced(holder) => holder.set_stream_enabled(stream, enabled),
        }
    }

    pub(crate) fn members(&self) -> Vec<StreamId> {
        match self {
            FrameHolder::Single(holder) => vec![holder.signal.id()],
            FrameHolder::Synced(holder) => holder.members(),
        }
    }

    pub(crate) fn is_synced(&self) -> bool {
        matches!(self, FrameHolder::Synced(_))
    }

    pub(crate) fn same_as(&self, other: &FrameHolder) -> bool {
        match (self, other) {
            (FrameHolder::Single(a), FrameHolder::Single(b)) => Arc::ptr_eq(a, b),
            (FrameHolder::Synced(a), FrameHolder::Synced(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct SingleState {
    enabled: bool,
    pending: Option<FrameRef>,
}

/// Keeps the newest frame of one stream; older undelivered frames are
/// released as soon as a newer one arrives.
#[derive(Debug)]
pub(crate) struct SingleStreamHolder {
    signal: Arc<StreamSignal>,
    state: Mutex<SingleState>,
}

impl SingleStreamHolder {
    pub(crate) fn new(signal: Arc<StreamSignal>) -> Self {
        Self {
            signal,
            state: Mutex::new(SingleState {
                enabled: true,
                pending: None,
            }),
        }
    }

    fn check_stream(&self, stream: StreamId) -> Result<()> {
        if stream == self.signal.id() {
            Ok(())
        } else {
            debug_assert!(false, "stream {stream} routed to holder of {}", self.signal.id());
            Err(Error::BadParameter(format!(
                "stream {stream} is not held by this holder"
            )))
        }
    }

    pub(crate) fn process_new_frame(&self, stream: StreamId, frame: FrameRef) -> Result<()> {
        self.check_stream(stream)?;
        {
            let mut state = lock(&self.state);
            if !state.enabled {
                return Ok(());
            }
            state.pending = Some(frame);
        }
        self.signal.deliver();
        Ok(())
    }

    pub(crate) fn read_frame(&self, stream: StreamId) -> Result<HolderRead> {
        self.check_stream(stream)?;
        loop {
            {
                let mut state = lock(&self.state);
                if !state.enabled {
                    return Ok(HolderRead::Disabled);
                }
                if let Some(frame) = state.pending.take() {
                    return Ok(HolderRead::Frame(frame));
                }
            }
            self.signal.wait()?;
        }
    }

    pub(crate) fn peek_frame(&self, stream: StreamId) -> Option<FrameRef> {
        if stream != self.signal.id() {
            return None;
        }
        let state = lock(&self.state);
        if !state.enabled {
            return None;
        }
        state.pending.clone()
    }

    pub(crate) fn peek_timestamp(&self, stream: StreamId) -> Option<u64> {
        if stream != self.signal.id() {
            return None;
        }
        let state = lock(&self.state);
        if !state.enabled {
            return None;
        }
        state.pending.as_ref().map(|frame| frame.timestamp)
    }

    pub(crate) fn clear(&self) {
        let pending = lock(&self.state).pending.take();
        drop(pending);
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        let pending = {
            let mut state = lock(&self.state);
            state.enabled = enabled;
            if enabled {
                None
            } else {
                state.pending.take()
            }
        };
        drop(pending);
        if !enabled {
            // Let a blocked reader observe the change.
            self.signal.wake();
        }
    }

    pub(crate) fn set_stream_enabled(&self, stream: StreamId, enabled: bool) {
        if stream == self.signal.id() && !enabled {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocator::FrameAllocator,
        frames::{PixelFormat, SensorType, VideoMode},
        pool::FramePool,
    };
    use std::{thread, time::Duration};

    fn setup() -> (FramePool, FrameAllocator, Arc<StreamSignal>) {
        let pool = FramePool::new();
        let allocator = FrameAllocator::new(pool.clone(), 4);
        let signal = Arc::new(StreamSignal::new(
            StreamId::from_raw(1),
            Arc::new(WaitCoordinator::new()),
        ));
        (pool, allocator, signal)
    }

    fn frame(allocator: &FrameAllocator, index: u64) -> FrameRef {
        allocator
            .acquire_frame(SensorType::Depth, VideoMode::new(PixelFormat::Gray8, 2, 2, 30))
            .unwrap()
            .with_frame_index(index)
            .with_timestamp(index * 1000)
            .publish()
            .unwrap()
    }

    #[test]
    fn test_latest_frame_wins() {
        let (pool, allocator, signal) = setup();
        let holder = SingleStreamHolder::new(signal);
        let id = StreamId::from_raw(1);

        for index in 1..=5 {
            holder.process_new_frame(id, frame(&allocator, index)).unwrap();
        }
        assert_eq!(pool.live_frames(), 1);
        assert_eq!(holder.peek_timestamp(id), Some(5000));

        match holder.read_frame(id).unwrap() {
            HolderRead::Frame(frame) => assert_eq!(frame.frame_index, 5),
            HolderRead::Disabled => panic!("holder unexpectedly disabled"),
        }
        assert!(holder.peek_frame(id).is_none());
        assert_eq!(pool.live_frames(), 0);
    }

    #[test]
    fn test_read_blocks_until_frame_arrives() {
        let (_pool, allocator, signal) = setup();
        let holder = Arc::new(SingleStreamHolder::new(signal));
        let id = StreamId::from_raw(1);

        let reader = Arc::clone(&holder);
        let handle = thread::spawn(move || match reader.read_frame(id).unwrap() {
            HolderRead::Frame(frame) => frame.frame_index,
            HolderRead::Disabled => 0,
        });

        thread::sleep(Duration::from_millis(20));
        holder.process_new_frame(id, frame(&allocator, 9)).unwrap();
        assert_eq!(handle.join().unwrap(), 9);
    }

    #[test]
    fn test_disable_releases_and_wakes_reader() {
        let (pool, allocator, signal) = setup();
        let holder = Arc::new(SingleStreamHolder::new(signal));
        let id = StreamId::from_raw(1);

        holder.process_new_frame(id, frame(&allocator, 1)).unwrap();
        holder.set_enabled(false);
        assert_eq!(pool.live_frames(), 0);

        holder.process_new_frame(id, frame(&allocator, 2)).unwrap();
        assert_eq!(pool.live_frames(), 0);
        assert!(matches!(holder.read_frame(id).unwrap(), HolderRead::Disabled));
    }

    #[test]
    fn test_closed_signal_aborts_read() {
        let (_pool, _allocator, signal) = setup();
        let holder = Arc::new(SingleStreamHolder::new(Arc::clone(&signal)));
        let id = StreamId::from_raw(1);

        let reader = Arc::clone(&holder);
        let handle = thread::spawn(move || reader.read_frame(id));
        thread::sleep(Duration::from_millis(10));
        signal.close();

        assert!(matches!(handle.join().unwrap(), Err(Error::ShutDown(_))));
    }
}
