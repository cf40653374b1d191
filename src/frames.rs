//! Frame payload and descriptor types.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use std::fmt;

/// Kind of sensor a stream captures from.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SensorType {
    /// Infrared.
    Ir = 1,
    /// Color camera.
    Color = 2,
    /// Depth sensor.
    Depth = 3,
}

impl SensorType {
    /// Depth and color streams take part in automatic depth/color sync.
    pub fn is_depth_or_color(self) -> bool {
        matches!(self, SensorType::Depth | SensorType::Color)
    }

    /// Short human-readable name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            SensorType::Ir => "IR",
            SensorType::Color => "Color",
            SensorType::Depth => "Depth",
        }
    }
}

/// Pixel format of a video mode.
///
/// This enum is marked `#[non_exhaustive]` so drivers may surface new formats
/// later. Always use a wildcard pattern when matching.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum PixelFormat {
    /// Depth in millimeters, 16 bits per pixel.
    Depth1Mm = 100,
    /// Depth in 100 micrometer units, 16 bits per pixel.
    Depth100Um = 101,
    /// Packed 9.2 shift values.
    Shift9_2 = 102,
    /// Packed 9.3 shift values.
    Shift9_3 = 103,
    /// 24-bit RGB.
    Rgb888 = 200,
    /// YUV 4:2:2, UYVY ordering.
    Yuv422 = 201,
    /// 8-bit grayscale.
    Gray8 = 202,
    /// 16-bit grayscale.
    Gray16 = 203,
    /// Compressed JPEG.
    Jpeg = 204,
    /// YUV 4:2:2, YUYV ordering.
    Yuyv = 205,
}

impl PixelFormat {
    /// Bytes used by one pixel in a frame buffer.
    ///
    /// JPEG frames are sized as if each pixel took one byte, which bounds the
    /// compressed payload.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Depth1Mm
            | PixelFormat::Depth100Um
            | PixelFormat::Shift9_2
            | PixelFormat::Shift9_3
            | PixelFormat::Gray16
            | PixelFormat::Yuv422
            | PixelFormat::Yuyv => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Gray8 | PixelFormat::Jpeg => 1,
        }
    }
}

/// Resolution, frame rate and pixel format of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoMode {
    pub pixel_format: PixelFormat,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub fps: u32,
}

impl VideoMode {
    pub fn new(pixel_format: PixelFormat, resolution_x: u32, resolution_y: u32, fps: u32) -> Self {
        Self {
            pixel_format,
            resolution_x,
            resolution_y,
            fps,
        }
    }

    /// Size in bytes of a frame buffer holding one full frame in this mode.
    pub fn required_buffer_size(&self) -> usize {
        self.resolution_x as usize * self.resolution_y as usize * self.pixel_format.bytes_per_pixel()
    }

    /// Default row stride in bytes.
    pub fn stride(&self) -> usize {
        self.resolution_x as usize * self.pixel_format.bytes_per_pixel()
    }
}

impl Default for VideoMode {
    fn default() -> Self {
        Self::new(PixelFormat::Depth1Mm, 640, 480, 30)
    }
}

/// Region of interest applied by the producer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cropping {
    pub enabled: bool,
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Cropping {
    pub fn new(origin_x: u32, origin_y: u32, width: u32, height: u32) -> Self {
        Self {
            enabled: true,
            origin_x,
            origin_y,
            width,
            height,
        }
    }
}

/// A captured frame: metadata plus the raw buffer.
///
/// A producer fills this through [`crate::NewFrame`]; after hand-off it is
/// only reachable behind a [`crate::FrameRef`] and is immutable.
pub struct FrameData {
    pub sensor_type: SensorType,
    /// Device-clock capture instant in microseconds, monotonic within a stream.
    pub timestamp: u64,
    /// Sequence number, strictly increasing per producing stream.
    pub frame_index: u64,
    pub video_mode: VideoMode,
    pub cropping: Cropping,
    /// Row stride in bytes.
    pub stride: usize,
    pub width: u32,
    pub height: u32,
    pub(crate) data: Box<[u8]>,
}

impl FrameData {
    pub(crate) fn new(sensor_type: SensorType, video_mode: VideoMode, data: Box<[u8]>) -> Self {
        Self {
            sensor_type,
            timestamp: 0,
            frame_index: 0,
            video_mode,
            cropping: Cropping::default(),
            stride: video_mode.stride(),
            width: video_mode.resolution_x,
            height: video_mode.resolution_y,
            data,
        }
    }

    /// The frame's pixel buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the pixel buffer, only reachable before hand-off.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Size of the pixel buffer in bytes.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn take_buffer(&mut self) -> Box<[u8]> {
        std::mem::take(&mut self.data)
    }
}

impl fmt::Debug for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameData")
            .field("sensor_type", &self.sensor_type)
            .field("timestamp", &self.timestamp)
            .field("frame_index", &self.frame_index)
            .field("video_mode", &self.video_mode)
            .field("cropping", &self.cropping)
            .field("stride", &self.stride)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("data (bytes)", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_buffer_size() {
        let mode = VideoMode::new(PixelFormat::Rgb888, 640, 480, 30);
        assert_eq!(mode.required_buffer_size(), 640 * 480 * 3);
        assert_eq!(mode.stride(), 640 * 3);

        let depth = VideoMode::new(PixelFormat::Depth1Mm, 320, 240, 60);
        assert_eq!(depth.required_buffer_size(), 320 * 240 * 2);
    }

    #[test]
    fn test_enum_codes() {
        assert_eq!(SensorType::try_from(3), Ok(SensorType::Depth));
        assert_eq!(i32::from(PixelFormat::Yuyv), 205);
        assert!(PixelFormat::try_from(999).is_err());
    }

    #[test]
    fn test_frame_data_defaults_from_mode() {
        let mode = VideoMode::new(PixelFormat::Gray8, 4, 2, 30);
        let frame = FrameData::new(SensorType::Ir, mode, vec![0u8; 8].into_boxed_slice());
        assert_eq!(frame.stride, 4);
        assert_eq!(frame.data_size(), 8);
        assert!(!frame.cropping.enabled);
    }
}
