//! The device seam.
//!
//! Drivers and transport live outside this crate. A [`Device`] is the little
//! a stream needs from the hardware it belongs to: an identity for grouping,
//! a non-blocking nudge, and driver-level frame sync hooks.

use std::{fmt, sync::Arc};

use crate::{stream::StreamId, Result};

/// A physical or virtual device that owns producing streams.
///
/// Implementations must be cheap and non-blocking in [`Device::poke`]; it is
/// called from consumer threads while they wait for data.
pub trait Device: Send + Sync {
    /// Identifier of the driver that serves this device. Streams can only be
    /// frame-synced if they share a driver.
    fn driver_id(&self) -> &str;

    /// Hints the device to surface any buffered data now.
    ///
    /// Failures are ignored by callers.
    fn poke(&self) -> Result<()> {
        Ok(())
    }

    /// Asks the driver to synchronize capture of `streams`.
    fn enable_frame_sync(&self, _streams: &[StreamId]) -> Result<()> {
        Ok(())
    }

    /// Undoes [`Device::enable_frame_sync`].
    fn disable_frame_sync(&self) {}
}

/// Shared handle to a device.
pub type DeviceRef = Arc<dyn Device>;

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("driver_id", &self.driver_id())
            .finish()
    }
}

/// True if both handles point at the same device.
pub(crate) fn same_device(a: &DeviceRef, b: &DeviceRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
