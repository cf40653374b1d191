//! The top-level context.
//!
//! A [`Context`] owns the frame pool shared by all its streams, the stream
//! registry, the multi-stream wait coordinator and the per-device
//! depth/color sync state. Every rewiring of streams between holders (frame
//! sync on and off, stream destruction) is serialized on one lock.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    allocator::FrameAllocator,
    device::{same_device, DeviceRef},
    framesync::{FrameSyncGroup, SyncedGroupHolder},
    holder::{FrameHolder, StreamSignal, DEFAULT_FPS_WINDOW},
    pool::{FrameId, FramePool, FrameRef},
    stream::{Stream, StreamId, StreamOptions},
    wait::WaitCoordinator,
    Error, Result,
};

/// Context-wide settings.
///
/// # Examples
///
/// ```
/// use framelatch::ContextOptions;
/// use std::time::Duration;
///
/// let options = ContextOptions::builder()
///     .fps_window(60)
///     .fps_log_interval(Some(Duration::from_secs(5)))
///     .build();
/// assert_eq!(options.fps_window, 60);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Number of frames each stream's rate counter averages over.
    pub fps_window: usize,
    /// How often each stream logs its frame rate; `None` disables it.
    pub fps_log_interval: Option<Duration>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        ContextOptionsBuilder::new().build()
    }
}

impl ContextOptions {
    /// Create a builder for configuring context options
    pub fn builder() -> ContextOptionsBuilder {
        ContextOptionsBuilder::new()
    }
}

/// Builder for configuring ContextOptions with ergonomic method chaining
#[derive(Debug, Clone)]
pub struct ContextOptionsBuilder {
    fps_window: Option<usize>,
    fps_log_interval: Option<Option<Duration>>,
}

impl ContextOptionsBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - `fps_window`: 180 frames
    /// - `fps_log_interval`: once per second
    pub fn new() -> Self {
        Self {
            fps_window: None,
            fps_log_interval: None,
        }
    }

    #[must_use]
    pub fn fps_window(mut self, frames: usize) -> Self {
        self.fps_window = Some(frames);
        self
    }

    #[must_use]
    pub fn fps_log_interval(mut self, interval: Option<Duration>) -> Self {
        self.fps_log_interval = Some(interval);
        self
    }

    /// Build the ContextOptions
    #[must_use]
    pub fn build(self) -> ContextOptions {
        ContextOptions {
            fps_window: self.fps_window.unwrap_or(DEFAULT_FPS_WINDOW),
            fps_log_interval: self
                .fps_log_interval
                .unwrap_or(Some(Duration::from_secs(1))),
        }
    }
}

impl Default for ContextOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Depth/color auto-sync state of one device.
struct DepthColorSync {
    device: DeviceRef,
    group: Option<FrameSyncGroup>,
}

#[derive(Default)]
struct Rewire {
    depth_color: Vec<DepthColorSync>,
}

pub(crate) struct ContextShared {
    options: ContextOptions,
    pool: FramePool,
    coordinator: Arc<WaitCoordinator>,
    next_stream_id: AtomicU64,
    streams: Mutex<Vec<Stream>>,
    rewire: Mutex<Rewire>,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ContextShared {
    fn find_stream(&self, id: StreamId) -> Option<Stream> {
        lock(&self.streams).iter().find(|s| s.id() == id).cloned()
    }

    /// Wires `streams` to a new sync group. Caller holds the rewire lock
    /// and has validated the list.
    fn form_group(&self, streams: &[Stream]) -> Result<FrameSyncGroup> {
        let ids: Vec<StreamId> = streams.iter().map(Stream::id).collect();
        streams[0].device().enable_frame_sync(&ids)?;

        let holder = Arc::new(SyncedGroupHolder::new(
            streams
                .iter()
                .map(|stream| (stream.signal(), stream.is_started()))
                .collect(),
        ));
        for stream in streams {
            let previous = stream.replace_holder(FrameHolder::Synced(Arc::clone(&holder)));
            self.retire(previous, streams);
        }

        debug!(members = ?ids, "frame sync group formed");
        Ok(FrameSyncGroup {
            holder,
            streams: streams.to_vec(),
        })
    }

    /// Disables a holder a stream was moved off. Other members of a retired
    /// sync group fall back to single-stream holders.
    fn retire(&self, previous: FrameHolder, moving: &[Stream]) {
        if previous.is_synced() {
            for id in previous.members() {
                if moving.iter().any(|stream| stream.id() == id) {
                    continue;
                }
                if let Some(stream) = self.find_stream(id) {
                    if stream.holder().same_as(&previous) {
                        stream.rewire_single();
                    }
                }
            }
        }
        // Readers woken by the disable retry on their new holder.
        previous.set_enabled(false);
    }

    /// Tears a sync group down and rewires its surviving members to
    /// single-stream holders. Caller holds the rewire lock.
    fn dissolve_group(&self, group: &FrameSyncGroup) {
        if let Some(first) = group.streams.first() {
            first.device().disable_frame_sync();
        }
        let holder = FrameHolder::Synced(Arc::clone(&group.holder));
        for stream in &group.streams {
            if !stream.is_destroyed() && stream.holder().same_as(&holder) {
                stream.rewire_single();
            }
        }
        holder.set_enabled(false);
        debug!(
            members = ?group.streams.iter().map(Stream::id).collect::<Vec<_>>(),
            dropped_sets = group.dropped_sets(),
            "frame sync group torn down"
        );
    }

    /// Rebuilds the depth/color group of `device` from its started depth and
    /// color streams, if auto-sync is on for it.
    pub(crate) fn refresh_depth_color_sync(&self, device: &DeviceRef) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let mut rewire = lock(&self.rewire);
        let Some(pos) = rewire
            .depth_color
            .iter()
            .position(|entry| same_device(&entry.device, device))
        else {
            return;
        };
        if let Some(group) = rewire.depth_color[pos].group.take() {
            self.dissolve_group(&group);
        }

        let members: Vec<Stream> = lock(&self.streams)
            .iter()
            .filter(|s| same_device(s.device(), device))
            .filter(|s| s.sensor_type().is_depth_or_color() && s.is_started())
            .cloned()
            .collect();
        if members.is_empty() {
            return;
        }
        match self.form_group(&members) {
            Ok(group) => rewire.depth_color[pos].group = Some(group),
            Err(e) => warn!(error = %e, "depth/color sync could not be re-established"),
        }
    }

    fn destroy_stream(&self, stream: &Stream) {
        stream.stop();
        lock(&self.streams).retain(|s| s != stream);
        // Blocked readers of this stream must see the closed signal, not
        // just a disabled holder.
        stream.mark_destroyed();

        let _rewire = lock(&self.rewire);
        let holder = stream.holder();
        if holder.is_synced() {
            for id in holder.members() {
                if id == stream.id() {
                    continue;
                }
                if let Some(other) = self.find_stream(id) {
                    if other.holder().same_as(&holder) {
                        other.rewire_single();
                    }
                }
            }
        }
        holder.set_enabled(false);
        debug!(stream = %stream.id(), "stream destroyed");
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let streams: Vec<Stream> = lock(&self.streams).clone();
        for stream in &streams {
            self.destroy_stream(stream);
        }
        lock(&self.rewire).depth_color.clear();
        self.coordinator.shutdown();
        debug!(streams = streams.len(), "context shut down");
    }
}

impl Drop for ContextShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Entry point: creates streams and coordinates reads across them.
///
/// Cloning is cheap; all clones share the same state. The context shuts
/// down when [`Context::shutdown`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("options", &self.shared.options)
            .field("streams", &lock(&self.shared.streams).len())
            .field("pool", &self.shared.pool)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextOptions::default())
    }
}

impl Context {
    pub fn new(options: ContextOptions) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                options,
                pool: FramePool::new(),
                coordinator: Arc::new(WaitCoordinator::new()),
                next_stream_id: AtomicU64::new(1),
                streams: Mutex::new(Vec::new()),
                rewire: Mutex::new(Rewire::default()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &ContextOptions {
        &self.shared.options
    }

    /// The frame pool shared by every stream of this context.
    pub fn pool(&self) -> &FramePool {
        &self.shared.pool
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::ShutDown("context".into()))
        } else {
            Ok(())
        }
    }

    /// Creates a stopped stream on `device`, wired to a single-stream holder.
    pub fn create_stream(&self, device: DeviceRef, options: &StreamOptions) -> Result<Stream> {
        self.check_running()?;
        let shared = &self.shared;
        let id = StreamId::from_raw(shared.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let signal = Arc::new(
            StreamSignal::new(id, Arc::clone(&shared.coordinator))
                .with_fps(shared.options.fps_window, shared.options.fps_log_interval),
        );
        let allocator = FrameAllocator::new(
            shared.pool.clone(),
            options.video_mode.required_buffer_size(),
        );
        let stream = Stream::new(
            id,
            device,
            options,
            signal,
            allocator,
            Arc::downgrade(shared),
        );
        lock(&shared.streams).push(stream.clone());
        debug!(stream = %id, sensor = options.sensor_type.name(), "stream created");
        Ok(stream)
    }

    /// Stops and unregisters a stream.
    ///
    /// Readers blocked on it fail with [`Error::ShutDown`]; other members of
    /// its sync group fall back to single-stream delivery. Frames consumers
    /// still hold stay valid. Destroying a stream twice does nothing.
    pub fn destroy_stream(&self, stream: &Stream) {
        if stream.is_destroyed() || !stream.belongs_to(&self.shared) {
            return;
        }
        self.shared.destroy_stream(stream);
    }

    /// Streams currently registered with this context.
    pub fn streams(&self) -> Vec<Stream> {
        lock(&self.shared.streams).clone()
    }

    /// Waits forever for `stream` to have a frame ready, then reads it.
    pub fn read_frame(&self, stream: &Stream) -> Result<FrameRef> {
        self.wait_for_any_stream(&[Some(stream)], None)?;
        stream.read_frame()
    }

    /// Blocks until one of `streams` has a frame ready and returns its index.
    ///
    /// `None` entries are skipped. When several are ready, the one whose
    /// frame has the lowest timestamp wins; equal timestamps go to the
    /// earlier entry. While waiting, the streams' devices are poked so they
    /// can surface buffered data. `timeout` of `None` waits forever.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupported`] for more than [`crate::MAX_WAITED_STREAMS`]
    ///   entries; nothing is waited on.
    /// - [`Error::TimedOut`] if nothing became ready in time.
    /// - [`Error::ShutDown`] if the context shuts down while waiting.
    pub fn wait_for_any_stream(
        &self,
        streams: &[Option<&Stream>],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        self.shared.coordinator.wait_for_any(streams, timeout)
    }

    /// Frame-syncs `streams`: readers of each member receive frames with
    /// matching sequence numbers.
    ///
    /// # Errors
    ///
    /// - [`Error::BadParameter`] for an empty list, a stream listed twice, a
    ///   stream of another context, or a destroyed stream.
    /// - [`Error::NotSupported`] if the streams belong to different drivers.
    /// - Whatever the device's driver-level sync hook returns.
    pub fn enable_frame_sync(&self, streams: &[Stream]) -> Result<FrameSyncGroup> {
        self.check_running()?;
        let Some(first) = streams.first() else {
            return Err(Error::BadParameter("no streams to synchronize".into()));
        };
        if let Some(foreign) = streams
            .iter()
            .find(|s| !s.belongs_to(&self.shared) || s.is_destroyed())
        {
            return Err(Error::BadParameter(format!(
                "stream {} is not a live stream of this context",
                foreign.id()
            )));
        }
        let mut seen = HashSet::with_capacity(streams.len());
        if let Some(repeated) = streams.iter().find(|s| !seen.insert(s.id())) {
            return Err(Error::BadParameter(format!(
                "stream {} is listed more than once",
                repeated.id()
            )));
        }
        let driver = first.device().driver_id();
        if streams.iter().any(|s| s.device().driver_id() != driver) {
            warn!("frame sync across different drivers rejected");
            return Err(Error::NotSupported(
                "cannot synchronize streams from different drivers".into(),
            ));
        }

        let _rewire = lock(&self.shared.rewire);
        self.shared.form_group(streams)
    }

    /// Tears down a frame sync group; its streams go back to independent
    /// delivery.
    pub fn disable_frame_sync(&self, group: FrameSyncGroup) {
        let _rewire = lock(&self.shared.rewire);
        self.shared.dissolve_group(&group);
    }

    /// Turns automatic depth/color sync on or off for `device`.
    ///
    /// While on, the started depth and color streams of the device form one
    /// sync group, rebuilt whenever one of them starts, stops or is
    /// destroyed.
    pub fn set_depth_color_sync(&self, device: &DeviceRef, enabled: bool) -> Result<()> {
        self.check_running()?;
        {
            let mut rewire = lock(&self.shared.rewire);
            let pos = rewire
                .depth_color
                .iter()
                .position(|entry| same_device(&entry.device, device));
            match (pos, enabled) {
                (Some(_), true) => return Ok(()),
                (None, false) => return Ok(()),
                (None, true) => rewire.depth_color.push(DepthColorSync {
                    device: Arc::clone(device),
                    group: None,
                }),
                (Some(pos), false) => {
                    let entry = rewire.depth_color.remove(pos);
                    if let Some(group) = entry.group {
                        self.shared.dissolve_group(&group);
                    }
                    return Ok(());
                }
            }
        }
        self.shared.refresh_depth_color_sync(device);
        Ok(())
    }

    pub fn is_depth_color_sync_enabled(&self, device: &DeviceRef) -> bool {
        lock(&self.shared.rewire)
            .depth_color
            .iter()
            .any(|entry| same_device(&entry.device, device))
    }

    /// Adds a reference to a frame by id.
    pub fn frame_add_ref(&self, id: FrameId) -> Result<()> {
        self.shared.pool.add_ref(id)
    }

    /// Releases a reference to a frame by id.
    pub fn frame_release(&self, id: FrameId) -> Result<()> {
        self.shared.pool.release(id)
    }

    /// Wraps a reference previously leaked with [`FrameRef::into_raw`].
    pub fn frame_from_raw(&self, id: FrameId) -> Result<FrameRef> {
        let data = self.shared.pool.payload(id)?;
        Ok(FrameRef::adopt(self.shared.pool.clone(), id, data))
    }

    /// Destroys every stream, wakes every blocked reader and waiter with
    /// [`Error::ShutDown`] and drops the per-thread wait events.
    ///
    /// Idempotent; also runs when the last clone is dropped.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}
