//! Frame ownership and synchronized delivery for depth, color and IR sensor
//! streams.
//!
//! Producers (device drivers) fill pooled, reference-counted frame buffers
//! and hand them to their stream. Consumers read the newest frame of a
//! stream, wait on several streams at once, or frame-sync a group of streams
//! so that every member delivers frames with matching sequence numbers.
//!
//! # Quick Start
//!
//! ```
//! use framelatch::{Context, ContextOptions, Device, SensorType, StreamOptions};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Camera;
//!
//! impl Device for Camera {
//!     fn driver_id(&self) -> &str {
//!         "camera"
//!     }
//! }
//!
//! # fn main() -> Result<(), framelatch::Error> {
//! let context = Context::new(ContextOptions::default());
//! let stream = context.create_stream(
//!     Arc::new(Camera),
//!     &StreamOptions::builder(SensorType::Depth).build(),
//! )?;
//! stream.start()?;
//!
//! // Producer side: fill a buffer and hand it over
//! if let Some(mut frame) = stream.acquire_frame() {
//!     frame.data_mut().fill(0x7f);
//!     let frame = frame.with_frame_index(1).with_timestamp(33_000).publish()?;
//!     stream.process_new_frame(frame)?;
//! }
//!
//! // Consumer side: wait for data, then take it
//! let ready = context.wait_for_any_stream(&[Some(&stream)], Some(Duration::from_millis(100)))?;
//! assert_eq!(ready, 0);
//! let frame = stream.read_frame()?;
//! assert_eq!(frame.frame_index, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Core Concepts
//!
//! ## Frames
//!
//! Frame buffers come from a [`FramePool`] shared by every stream of a
//! [`Context`]. A [`FrameRef`] is one counted reference; the buffer goes back
//! to its stream's allocator when the last reference is dropped. Ids can be
//! leaked with [`FrameRef::into_raw`] and managed by hand through
//! [`Context::frame_add_ref`] and [`Context::frame_release`].
//!
//! ## Delivery
//!
//! Each stream is wired to a holder. By default it keeps only the newest
//! frame. Streams joined with [`Context::enable_frame_sync`] share a synced
//! holder that only releases complete sets of frames with one sequence
//! number. Depth and color streams of one device can be grouped
//! automatically with [`Context::set_depth_color_sync`].
//!
//! ## Waiting
//!
//! [`Context::wait_for_any_stream`] blocks on up to [`MAX_WAITED_STREAMS`]
//! streams and returns the one whose ready frame is oldest.
//!
//! # Thread Safety
//!
//! [`Context`], [`Stream`] and [`FrameRef`] are `Send + Sync`. Producers and
//! consumers are expected to run on different threads; new-frame listeners
//! run on the producer's thread outside every internal lock.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

// Internal modules
mod error;
mod holder;
mod wait;

// Public modules
pub mod allocator;
pub mod async_runtime;
pub mod context;
pub mod device;
pub mod event;
pub mod fps;
pub mod frames;
pub mod framesync;
pub mod pool;
pub mod runtime;
pub mod stream;

#[cfg(feature = "tokio")]
pub use async_runtime::tokio;

// Re-exports
pub use {
    allocator::{AllocBufferFn, FrameAllocator, NewFrame},
    context::{Context, ContextOptions, ContextOptionsBuilder},
    device::{Device, DeviceRef},
    error::*,
    event::{FrameEvent, WaitResult},
    fps::FpsCounter,
    frames::{Cropping, FrameData, PixelFormat, SensorType, VideoMode},
    framesync::FrameSyncGroup,
    holder::{ListenerId, NewFrameCallback, DEFAULT_FPS_WINDOW},
    pool::{FrameId, FramePool, FrameRef, FreeBufferFn},
    runtime::Runtime,
    stream::{Stream, StreamId, StreamOptions, StreamOptionsBuilder},
    wait::MAX_WAITED_STREAMS,
};

/// Alias for Result with our Error type
pub type Result<T> = std::result::Result<T, crate::error::Error>;
