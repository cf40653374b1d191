//! Producing streams.
//!
//! A [`Stream`] ties together one sensor of a device, its frame allocator,
//! its wake-up signal and the holder it is currently wired to. Producers
//! acquire frames from the stream, fill them and hand them back through
//! [`Stream::process_new_frame`]; consumers read them with
//! [`Stream::read_frame`] or wait on several streams at once through the
//! owning [`crate::Context`].

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{debug, warn};

use crate::{
    allocator::{AllocBufferFn, FrameAllocator, NewFrame},
    context::ContextShared,
    device::DeviceRef,
    frames::{Cropping, SensorType, VideoMode},
    holder::{FrameHolder, HolderRead, ListenerId, StreamSignal},
    pool::{FrameRef, FreeBufferFn},
    Error, Result,
};

/// Identifies a stream within its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Configuration of a stream, fixed at creation and adjustable while the
/// stream is stopped.
///
/// # Examples
///
/// ```
/// use framelatch::{PixelFormat, SensorType, StreamOptions, VideoMode};
///
/// let options = StreamOptions::builder(SensorType::Color)
///     .video_mode(VideoMode::new(PixelFormat::Rgb888, 640, 480, 30))
///     .build();
/// assert_eq!(options.video_mode.required_buffer_size(), 640 * 480 * 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub sensor_type: SensorType,
    pub video_mode: VideoMode,
    /// Cropping stamped on every frame the stream acquires.
    pub cropping: Cropping,
    /// Row stride override; `None` derives it from the video mode.
    pub stride: Option<usize>,
}

impl StreamOptions {
    /// Create a builder for configuring stream options
    pub fn builder(sensor_type: SensorType) -> StreamOptionsBuilder {
        StreamOptionsBuilder::new(sensor_type)
    }
}

/// Builder for configuring StreamOptions with ergonomic method chaining
#[derive(Debug, Clone)]
pub struct StreamOptionsBuilder {
    sensor_type: SensorType,
    video_mode: Option<VideoMode>,
    cropping: Option<Cropping>,
    stride: Option<usize>,
}

impl StreamOptionsBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - `video_mode`: 640x480 at 30 fps, 1 mm depth pixels
    /// - `cropping`: disabled
    /// - `stride`: derived from the video mode
    pub fn new(sensor_type: SensorType) -> Self {
        Self {
            sensor_type,
            video_mode: None,
            cropping: None,
            stride: None,
        }
    }

    #[must_use]
    pub fn video_mode(mut self, mode: VideoMode) -> Self {
        self.video_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn cropping(mut self, cropping: Cropping) -> Self {
        self.cropping = Some(cropping);
        self
    }

    #[must_use]
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = Some(stride);
        self
    }

    /// Build the StreamOptions
    #[must_use]
    pub fn build(self) -> StreamOptions {
        StreamOptions {
            sensor_type: self.sensor_type,
            video_mode: self.video_mode.unwrap_or_default(),
            cropping: self.cropping.unwrap_or_default(),
            stride: self.stride,
        }
    }
}

#[derive(Debug)]
struct StreamState {
    video_mode: VideoMode,
    cropping: Cropping,
    stride: Option<usize>,
    /// Explicit buffer size; otherwise the video mode decides on start.
    buffer_size: Option<usize>,
    started: bool,
    destroyed: bool,
}

struct StreamInner {
    id: StreamId,
    sensor_type: SensorType,
    device: DeviceRef,
    signal: Arc<StreamSignal>,
    allocator: FrameAllocator,
    holder: Mutex<FrameHolder>,
    state: Mutex<StreamState>,
    context: Weak<ContextShared>,
}

/// Handle to a producing stream.
///
/// Cloning is cheap; all clones refer to the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("sensor_type", &self.inner.sensor_type)
            .field("video_mode", &state.video_mode)
            .field("started", &state.started)
            .finish()
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stream {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        device: DeviceRef,
        options: &StreamOptions,
        signal: Arc<StreamSignal>,
        allocator: FrameAllocator,
        context: Weak<ContextShared>,
    ) -> Self {
        let holder = FrameHolder::single(Arc::clone(&signal));
        Self {
            inner: Arc::new(StreamInner {
                id,
                sensor_type: options.sensor_type,
                device,
                signal,
                allocator,
                holder: Mutex::new(holder),
                state: Mutex::new(StreamState {
                    video_mode: options.video_mode,
                    cropping: options.cropping,
                    stride: options.stride,
                    buffer_size: None,
                    started: false,
                    destroyed: false,
                }),
                context,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        lock(&self.inner.state)
    }

    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    pub fn sensor_type(&self) -> SensorType {
        self.inner.sensor_type
    }

    pub fn device(&self) -> &DeviceRef {
        &self.inner.device
    }

    pub fn video_mode(&self) -> VideoMode {
        self.state().video_mode
    }

    /// Changes the video mode.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfFlow`] while the stream is started.
    pub fn set_video_mode(&self, mode: VideoMode) -> Result<()> {
        let mut state = self.state();
        if state.started {
            return Err(Error::OutOfFlow(
                "cannot change the video mode of a started stream".into(),
            ));
        }
        state.video_mode = mode;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// The stream's allocator, for diagnostics.
    pub fn allocator(&self) -> &FrameAllocator {
        &self.inner.allocator
    }

    /// Starts accepting frames. Starting a started stream does nothing.
    ///
    /// The holder is cleared, the buffer size is fixed from the video mode
    /// (unless set explicitly) and the allocator is locked against changes.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.destroyed {
                return Err(Error::Failed(format!("stream {} was destroyed", self.id())));
            }
            if state.started {
                return Ok(());
            }

            let holder = self.holder();
            holder.clear();
            let size = state
                .buffer_size
                .unwrap_or_else(|| state.video_mode.required_buffer_size());
            self.inner.allocator.set_required_size(size)?;
            self.inner.allocator.set_active(true);
            holder.set_stream_enabled(self.id(), true);
            state.started = true;
        }
        debug!(stream = %self.id(), sensor = self.sensor_type().name(), "stream started");
        self.refresh_depth_color_sync();
        Ok(())
    }

    /// Stops accepting frames and releases whatever the holder kept for this
    /// stream. Stopping a stopped stream does nothing.
    pub fn stop(&self) {
        {
            let mut state = self.state();
            if !state.started {
                return;
            }
            state.started = false;
            self.inner.allocator.set_active(false);
            self.holder().set_stream_enabled(self.id(), false);
        }
        debug!(stream = %self.id(), "stream stopped");
        self.refresh_depth_color_sync();
    }

    fn refresh_depth_color_sync(&self) {
        if !self.sensor_type().is_depth_or_color() {
            return;
        }
        if let Some(context) = self.inner.context.upgrade() {
            context.refresh_depth_color_sync(self.device());
        }
    }

    /// Installs a custom buffer allocator, or resets to the default pool
    /// when both are `None`.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfFlow`] while the stream is started.
    /// - [`Error::BadParameter`] if only one function is supplied.
    pub fn set_frame_buffer_allocator(
        &self,
        alloc: Option<AllocBufferFn>,
        free: Option<FreeBufferFn>,
    ) -> Result<()> {
        self.inner.allocator.set_allocator(alloc, free)
    }

    /// Overrides the buffer size derived from the video mode.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfFlow`] while the stream is started.
    pub fn set_required_buffer_size(&self, size: usize) -> Result<()> {
        let mut state = self.state();
        if state.started {
            warn!(stream = %self.id(), size, "buffer size change rejected while streaming");
            return Err(Error::OutOfFlow(
                "cannot change the buffer size of a started stream".into(),
            ));
        }
        self.inner.allocator.set_required_size(size)?;
        state.buffer_size = Some(size);
        Ok(())
    }

    /// Acquires a frame for the producer to fill, stamped with the stream's
    /// sensor type, video mode, cropping and stride.
    ///
    /// `None` means no buffer was available this cycle.
    pub fn acquire_frame(&self) -> Option<NewFrame> {
        let (video_mode, cropping, stride) = {
            let state = self.state();
            (state.video_mode, state.cropping, state.stride)
        };
        let mut frame = self
            .inner
            .allocator
            .acquire_frame(self.sensor_type(), video_mode)?;
        frame.cropping = cropping;
        if let Some(stride) = stride {
            frame.stride = stride;
        }
        Some(frame)
    }

    /// Hands a published frame to the stream's holder.
    ///
    /// Frames arriving while the stream is stopped are dropped.
    pub fn process_new_frame(&self, frame: FrameRef) -> Result<()> {
        if !self.is_started() {
            return Ok(());
        }
        self.holder().process_new_frame(self.id(), frame)
    }

    /// Blocks until the stream's holder has a frame for this stream and
    /// takes it.
    ///
    /// # Errors
    ///
    /// - [`Error::ShutDown`] if the stream is destroyed while waiting.
    /// - [`Error::Failed`] if the stream's holder was disabled without a
    ///   replacement.
    pub fn read_frame(&self) -> Result<FrameRef> {
        loop {
            let holder = self.holder();
            match holder.read_frame(self.id())? {
                HolderRead::Frame(frame) => return Ok(frame),
                HolderRead::Disabled => {
                    if self.inner.signal.is_closed() {
                        return Err(Error::ShutDown(format!("stream {}", self.id())));
                    }
                    // Rewired while we were reading; retry on the new holder.
                    if !self.holder().same_as(&holder) {
                        continue;
                    }
                    return Err(Error::Failed(format!(
                        "frame holder of stream {} is disabled",
                        self.id()
                    )));
                }
            }
        }
    }

    /// The frame a read would return next, without consuming it.
    ///
    /// For a frame-synced stream only frames of a matched set are visible.
    pub fn peek_frame(&self) -> Option<FrameRef> {
        self.holder().peek_frame(self.id())
    }

    pub(crate) fn peek_timestamp(&self) -> Option<u64> {
        self.holder().peek_timestamp(self.id())
    }

    /// Average delivered frames per second over the recent window.
    pub fn current_fps(&self) -> f64 {
        self.inner.signal.fps()
    }

    /// Registers a callback run on the delivering thread every time a frame
    /// becomes readable on this stream.
    ///
    /// The callback runs outside every internal lock and may read frames.
    pub fn on_new_frame<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(StreamId) + Send + Sync + 'static,
    {
        self.inner.signal.add_listener(Arc::new(callback))
    }

    /// Removes a listener. Returns `false` if it was not registered.
    pub fn remove_new_frame_listener(&self, id: ListenerId) -> bool {
        self.inner.signal.remove_listener(id)
    }

    /// True if the stream is currently wired to a frame sync group.
    pub fn is_frame_synced(&self) -> bool {
        self.holder().is_synced()
    }

    pub(crate) fn signal(&self) -> Arc<StreamSignal> {
        Arc::clone(&self.inner.signal)
    }

    pub(crate) fn holder(&self) -> FrameHolder {
        lock(&self.inner.holder).clone()
    }

    /// Wires the stream to `holder` and returns the previous one.
    pub(crate) fn replace_holder(&self, holder: FrameHolder) -> FrameHolder {
        std::mem::replace(&mut *lock(&self.inner.holder), holder)
    }

    /// Wires the stream to a fresh single-stream holder.
    pub(crate) fn rewire_single(&self) -> FrameHolder {
        self.replace_holder(FrameHolder::single(self.signal()))
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    pub(crate) fn belongs_to(&self, context: &Arc<ContextShared>) -> bool {
        std::ptr::eq(self.inner.context.as_ptr(), Arc::as_ptr(context))
    }

    /// Final teardown once the stream is stopped and unwired: wakes blocked
    /// readers and detaches the allocator's frames.
    pub(crate) fn mark_destroyed(&self) {
        self.state().destroyed = true;
        self.inner.signal.close();
        self.inner.allocator.release_all_frames();
    }
}
