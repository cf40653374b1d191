//! Async runtime integration for Tokio.
//!
//! Reads and multi-stream waits block the calling thread, so these wrappers
//! run them through `spawn_blocking` to keep the async runtime responsive.
//!
//! # Features
//!
//! - `tokio` - Enable Tokio runtime support
//!
//! # Example with Tokio
//!
//! ```no_run
//! # #[cfg(feature = "tokio")]
//! # {
//! use framelatch::{Context, ContextOptions, tokio::AsyncStream};
//! # use framelatch::{Device, SensorType, StreamOptions};
//! # use std::sync::Arc;
//! # struct Camera;
//! # impl Device for Camera {
//! #     fn driver_id(&self) -> &str { "camera" }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), framelatch::Error> {
//!     let context = Context::new(ContextOptions::default());
//!     let stream = context.create_stream(
//!         Arc::new(Camera),
//!         &StreamOptions::builder(SensorType::Depth).build(),
//!     )?;
//!     stream.start()?;
//!
//!     let async_stream = AsyncStream::new(stream);
//!     let frame = async_stream.read_frame().await?;
//!     println!("frame {} at {} us", frame.frame_index, frame.timestamp);
//!
//!     Ok(())
//! }
//! # }
//! ```

#[cfg(feature = "tokio")]
pub mod tokio {
    //! Tokio async runtime integration.
    //!
    //! Provides `AsyncStream` and `AsyncContext` wrappers that use
    //! `tokio::task::spawn_blocking` for the blocking calls.

    use std::time::Duration;

    use crate::{Context, Error, FrameRef, Result, Stream};

    fn join_error(e: ::tokio::task::JoinError) -> Error {
        Error::Failed(format!("blocking task failed: {e}"))
    }

    /// Async wrapper around a [`Stream`].
    #[derive(Debug, Clone)]
    pub struct AsyncStream {
        inner: Stream,
    }

    impl AsyncStream {
        pub fn new(stream: Stream) -> Self {
            Self { inner: stream }
        }

        pub fn stream(&self) -> &Stream {
            &self.inner
        }

        /// Async version of [`Stream::read_frame`].
        pub async fn read_frame(&self) -> Result<FrameRef> {
            let stream = self.inner.clone();
            ::tokio::task::spawn_blocking(move || stream.read_frame())
                .await
                .map_err(join_error)?
        }
    }

    /// Async wrapper around a [`Context`].
    #[derive(Debug, Clone)]
    pub struct AsyncContext {
        inner: Context,
    }

    impl AsyncContext {
        pub fn new(context: Context) -> Self {
            Self { inner: context }
        }

        pub fn context(&self) -> &Context {
            &self.inner
        }

        /// Async version of [`Context::wait_for_any_stream`].
        ///
        /// Takes owned stream handles since the wait runs on another thread.
        pub async fn wait_for_any_stream(
            &self,
            streams: Vec<Option<Stream>>,
            timeout: Option<Duration>,
        ) -> Result<usize> {
            let context = self.inner.clone();
            ::tokio::task::spawn_blocking(move || {
                let borrowed: Vec<Option<&Stream>> = streams.iter().map(Option::as_ref).collect();
                context.wait_for_any_stream(&borrowed, timeout)
            })
            .await
            .map_err(join_error)?
        }

        /// Async version of [`Context::read_frame`].
        pub async fn read_frame(&self, stream: &Stream) -> Result<FrameRef> {
            let context = self.inner.clone();
            let stream = stream.clone();
            ::tokio::task::spawn_blocking(move || context.read_frame(&stream))
                .await
                .map_err(join_error)?
        }
    }
}
