//! Rendering surfaces on both ends of a codec.
//!
//! Encoders are fed through an [`InputSurface`] that a [`SurfaceBinder`] turns
//! into a [`RenderSurface`]; decoders render into an [`OutputSurface`]. The
//! pipelines treat both as opaque.

use crate::CodecError;
use crate::software::SoftwareInput;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// An RGBA color with components in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    /// Red.
    pub r: f32,
    /// Green.
    pub g: f32,
    /// Blue.
    pub b: f32,
    /// Alpha.
    pub a: f32,
}

impl Color {
    /// Opaque black.
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0);
    /// Opaque red.
    pub const RED: Self = Self::new(1.0, 0.0, 0.0);
    /// Opaque green.
    pub const GREEN: Self = Self::new(0.0, 1.0, 0.0);

    /// Opaque color from float components.
    #[must_use]
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    /// Opaque color from 8-bit components.
    #[must_use]
    pub fn rgb8(r: u8, g: u8, b: u8) -> Self {
        Self::new(f32::from(r) / 255.0, f32::from(g) / 255.0, f32::from(b) / 255.0)
    }

    /// Opaque gray of the given luma.
    #[must_use]
    pub const fn gray(luma: f32) -> Self {
        Self::new(luma, luma, luma)
    }

    /// Quantize to 8-bit RGBA.
    #[must_use]
    pub fn to_rgba8(self) -> [u8; 4] {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let quantize = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        [
            quantize(self.r),
            quantize(self.g),
            quantize(self.b),
            quantize(self.a),
        ]
    }
}

/// A rectangle in surface coordinates, origin at the bottom-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Bottom edge.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Build a rectangle.
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Drawing commands accepted by a bound rendering surface.
///
/// The model is the GL clear pipeline: a clear color, an optional scissor
/// rectangle and a clear that fills the scissored area.
pub trait Canvas {
    /// Surface size in pixels.
    fn size(&self) -> (u32, u32);

    /// Color used by the next [`Canvas::clear`].
    fn set_clear_color(&mut self, color: Color);

    /// Restrict clears to `rect`, or lift the restriction with `None`.
    fn set_scissor(&mut self, rect: Option<Rect>);

    /// Fill the scissored area (or the whole surface) with the clear color.
    fn clear(&mut self);
}

/// A rendering context bound to an encoder's input surface.
pub trait RenderSurface: Send {
    /// Make this surface the current drawing target.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Surface`] if the surface was released.
    fn make_current(&mut self) -> Result<(), CodecError>;

    /// Drawing target for the next frame.
    fn canvas(&mut self) -> &mut dyn Canvas;

    /// Presentation time attached to the next swap.
    fn set_presentation_time(&mut self, nsecs: i64);

    /// Submit the drawn frame to the encoder.
    ///
    /// May block until the encoder has room for another frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Surface`] if the frame cannot be submitted.
    fn swap_buffers(&mut self) -> Result<(), CodecError>;

    /// Release the context and the surface. Safe to call more than once.
    fn release(&mut self);
}

impl fmt::Debug for dyn RenderSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RenderSurface")
    }
}

/// Binds encoder input surfaces to rendering contexts.
pub trait SurfaceBinder: Send + Sync {
    /// Wrap `surface` in a rendering context.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] for surfaces this binder cannot drive.
    fn bind(&self, surface: InputSurface) -> Result<Box<dyn RenderSurface>, CodecError>;
}

/// Surface produced by an encoder to receive frames.
pub enum InputSurface {
    /// Frame queue of the software encoder.
    Software(SoftwareInput),
    /// Native window of a platform encoder.
    #[cfg(target_os = "android")]
    Window(ndk::native_window::NativeWindow),
}

impl fmt::Debug for InputSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software(input) => f.debug_tuple("Software").field(input).finish(),
            #[cfg(target_os = "android")]
            Self::Window(window) => f.debug_tuple("Window").field(window).finish(),
        }
    }
}

/// One decoded frame as delivered to a [`FrameSink`].
#[derive(Clone)]
pub struct DecodedFrame {
    /// RGBA pixels, rows top to bottom.
    pub data: Arc<Vec<u8>>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Presentation time in microseconds.
    pub presentation_time_us: i64,
}

impl DecodedFrame {
    /// RGBA value at `(x, y)`, `y` counted from the top row.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y as usize * self.width as usize + x as usize) * 4;
        self.data
            .get(at..at + 4)
            .map(|px| [px[0], px[1], px[2], px[3]])
    }
}

impl fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("presentation_time_us", &self.presentation_time_us)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Receives frames rendered by a decoder.
pub trait FrameSink: Send + Sync {
    /// Called once per buffer released with `render = true`.
    fn render(&self, frame: &DecodedFrame);
}

/// Render target of a decoder.
#[derive(Clone)]
pub enum OutputSurface {
    /// Frames are handed to a Rust sink.
    Sink(Arc<dyn FrameSink>),
    /// Frames are posted to a native window.
    #[cfg(target_os = "android")]
    Window(ndk::native_window::NativeWindow),
}

impl fmt::Debug for OutputSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sink(_) => f.write_str("Sink"),
            #[cfg(target_os = "android")]
            Self::Window(window) => f.debug_tuple("Window").field(window).finish(),
        }
    }
}

impl<S: FrameSink + 'static> From<Arc<S>> for OutputSurface {
    fn from(sink: Arc<S>) -> Self {
        Self::Sink(sink)
    }
}

/// A sink that keeps every rendered frame.
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<DecodedFrame>>,
}

impl RecordingSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames rendered so far.
    #[must_use]
    pub fn frames(&self) -> Vec<DecodedFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Presentation times of the frames rendered so far.
    #[must_use]
    pub fn timestamps(&self) -> Vec<i64> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|frame| frame.presentation_time_us)
            .collect()
    }

    /// Number of frames rendered so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True if nothing was rendered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for RecordingSink {
    fn render(&self, frame: &DecodedFrame) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());
    }
}
