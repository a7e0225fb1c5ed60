//! Video codecs driven through an asynchronous buffer-exchange protocol.
//!
//! Every backend exposes the same small state machine that hardware codecs use:
//! input buffers are dequeued, filled and queued back, output buffers are
//! dequeued, consumed and released, and the codec announces its negotiated
//! output format once before (or while) producing data.
//!
//! Backends:
//! - **Android**: `MediaCodec` through the NDK
//! - **Software**: an uncompressed RGBA codec (`video/raw`) available everywhere
//!
//! The [`exchange`] module contains the output-draining loop shared by the
//! encode and decode pipelines.

#![warn(missing_docs)]

pub mod exchange;
pub mod format;
pub mod software;
pub mod surface;

/// Platform-specific implementations.
pub mod sys;

use std::fmt;
use std::ops::BitOr;
use std::time::Duration;
use thiserror::Error;

pub use exchange::{BufferExchange, OutputBuffer, OutputHandler, PollEvent};
pub use format::{MediaFormat, MIME_AVC, MIME_HEVC, MIME_RAW};
pub use software::{SoftwareBinder, SoftwareCodecFactory, SoftwareCodecOptions};
pub use surface::{
    Canvas, Color, DecodedFrame, FrameSink, InputSurface, OutputSurface, Rect, RecordingSink,
    RenderSurface, SurfaceBinder,
};

/// Common error type for codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The codec or format is not supported.
    #[error("unsupported codec or format: {0}")]
    Unsupported(String),
    /// Initialization failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// The codec rejected its configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The codec broke the buffer-exchange contract.
    #[error("codec protocol violation: {0}")]
    Protocol(String),
    /// An operation was issued in the wrong codec state.
    #[error("invalid codec state: {0}")]
    InvalidState(String),
    /// The input or output surface could not be used.
    #[error("surface error: {0}")]
    Surface(String),
    /// A platform call returned an error status.
    #[error("{op} failed with status {code}")]
    Platform {
        /// Name of the failing call.
        op: &'static str,
        /// Raw status code.
        code: i64,
    },
}

/// Whether a codec compresses or decompresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecDirection {
    /// Raw frames in, compressed samples out.
    Encode,
    /// Compressed samples in, frames out.
    Decode,
}

/// Flag bits attached to a codec buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// The buffer holds a sync sample.
    pub const KEY_FRAME: Self = Self(1);
    /// The buffer holds codec-specific data rather than media data.
    pub const CODEC_CONFIG: Self = Self(2);
    /// The buffer terminates the stream.
    pub const END_OF_STREAM: Self = Self(4);

    /// Build flags from raw platform bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw platform bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Metadata describing one dequeued output buffer.
///
/// A single instance is reused for every dequeue; nothing in it survives the
/// next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// Start of the payload inside the buffer.
    pub offset: usize,
    /// Payload length in bytes.
    pub size: usize,
    /// Presentation time in microseconds.
    pub presentation_time_us: i64,
    /// Buffer flags.
    pub flags: BufferFlags,
}

impl BufferInfo {
    /// Overwrite every field.
    pub const fn set(
        &mut self,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) {
        self.offset = offset;
        self.size = size;
        self.presentation_time_us = presentation_time_us;
        self.flags = flags;
    }

    /// True if this buffer terminates the stream.
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }

    /// True if this buffer holds codec-specific data.
    #[must_use]
    pub const fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    /// True if this buffer holds a sync sample.
    #[must_use]
    pub const fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }
}

/// Result of polling a codec's output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStatus {
    /// No output is available yet.
    TryAgainLater,
    /// The set of output buffers was replaced.
    BuffersChanged,
    /// The output format is now known (or changed).
    FormatChanged,
    /// The output buffer at this index is ready.
    Buffer(usize),
    /// Any other negative status.
    Unknown(i64),
}

impl OutputStatus {
    /// Map a raw `dequeueOutputBuffer` return value.
    #[must_use]
    pub const fn from_raw(code: isize) -> Self {
        match code {
            -1 => Self::TryAgainLater,
            -2 => Self::FormatChanged,
            -3 => Self::BuffersChanged,
            index if index >= 0 => Self::Buffer(index.unsigned_abs()),
            other => Self::Unknown(other as i64),
        }
    }
}

/// A live codec instance speaking the buffer-exchange protocol.
///
/// Buffers are addressed by index. Slices returned by [`Codec::input_buffer`]
/// and [`Codec::output_buffer`] are only valid until the buffer is handed back.
pub trait Codec: Send {
    /// Component name reported by the platform.
    fn name(&self) -> &str;

    /// True if the component is a software implementation.
    fn is_software(&self) -> bool;

    /// Configure the codec.
    ///
    /// `surface` is the render target of a decoder; encoders pass `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Configuration`] if the format is rejected.
    fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<OutputSurface>,
        direction: CodecDirection,
    ) -> Result<(), CodecError>;

    /// Request a surface that feeds the encoder. Must be called between
    /// `configure` and `start`.
    ///
    /// # Errors
    ///
    /// Fails if the component cannot accept surface input.
    fn create_input_surface(&mut self) -> Result<InputSurface, CodecError>;

    /// Start processing.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] if the codec is not configured.
    fn start(&mut self) -> Result<(), CodecError>;

    /// Stop processing. The codec can be configured again afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses to stop.
    fn stop(&mut self) -> Result<(), CodecError>;

    /// Drop every queued buffer and reset stream state.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] if the codec is not running.
    fn flush(&mut self) -> Result<(), CodecError>;

    /// Free all resources. Safe to call more than once.
    fn release(&mut self);

    /// Signal end of input for surface-fed encoders.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidState`] if the codec has no input surface.
    fn signal_end_of_input(&mut self) -> Result<(), CodecError>;

    /// Wait up to `timeout` for a free input buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is not running.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError>;

    /// Writable view of a dequeued input buffer.
    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]>;

    /// Hand a filled input buffer back to the codec.
    ///
    /// # Errors
    ///
    /// Returns an error if the index was not dequeued or the range is invalid.
    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    /// Wait up to `timeout` for an output event, filling `info` for buffers.
    fn dequeue_output_buffer(&mut self, info: &mut BufferInfo, timeout: Duration) -> OutputStatus;

    /// Readable view of a dequeued output buffer.
    fn output_buffer(&self, index: usize) -> Option<&[u8]>;

    /// The current output format.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is not known yet.
    fn output_format(&self) -> Result<MediaFormat, CodecError>;

    /// Return an output buffer, optionally rendering it to the output surface.
    ///
    /// # Errors
    ///
    /// Returns an error if the index was not dequeued.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError>;
}

impl fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("name", &self.name())
            .field("software", &self.is_software())
            .finish_non_exhaustive()
    }
}

/// Creates codecs by mime type.
pub trait CodecFactory: Send + Sync {
    /// Create an encoder producing `mime`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] if no encoder exists for `mime`.
    fn create_encoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError>;

    /// Create a decoder consuming `mime`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] if no decoder exists for `mime`.
    fn create_decoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError>;
}
