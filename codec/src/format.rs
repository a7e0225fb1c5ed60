//! Media format descriptions exchanged with codecs and containers.

use std::fmt;

/// H.264 / AVC.
pub const MIME_AVC: &str = "video/avc";
/// H.265 / HEVC.
pub const MIME_HEVC: &str = "video/hevc";
/// Uncompressed RGBA frames, handled by the software codec.
pub const MIME_RAW: &str = "video/raw";

/// `COLOR_FormatSurface`: the encoder is fed from a surface.
pub const COLOR_FORMAT_SURFACE: i32 = 0x7F00_0789;
/// `COLOR_Format32bitABGR8888`: byte order R, G, B, A.
pub const COLOR_FORMAT_RGBA: i32 = 0x7F00_A000;

/// Negotiated parameters of one elementary stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaFormat {
    /// Mime type, e.g. `video/avc`.
    pub mime: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Target bit rate (encode only).
    pub bit_rate: Option<u32>,
    /// Nominal frame rate (encode only).
    pub frame_rate: Option<u32>,
    /// Seconds between sync frames (encode only).
    pub i_frame_interval: Option<u32>,
    /// Pixel layout of raw buffers.
    pub color_format: Option<i32>,
    /// Largest compressed sample the decoder has to accept.
    pub max_input_size: Option<usize>,
    /// Stream duration in microseconds.
    pub duration_us: Option<i64>,
    /// Codec-specific data (`csd-0`, `csd-1`, ...).
    pub csd: Vec<Vec<u8>>,
}

impl MediaFormat {
    /// A video format with only mime type and dimensions set.
    #[must_use]
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width,
            height,
            ..Self::default()
        }
    }

    /// Set the target bit rate.
    #[must_use]
    pub const fn with_bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = Some(bit_rate);
        self
    }

    /// Set the nominal frame rate.
    #[must_use]
    pub const fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    /// Set the sync frame interval in seconds.
    #[must_use]
    pub const fn with_i_frame_interval(mut self, seconds: u32) -> Self {
        self.i_frame_interval = Some(seconds);
        self
    }

    /// Set the color format.
    #[must_use]
    pub const fn with_color_format(mut self, color_format: i32) -> Self {
        self.color_format = Some(color_format);
        self
    }

    /// True for `video/*` mime types.
    #[must_use]
    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    /// Bytes of one RGBA frame at this size.
    #[must_use]
    pub const fn rgba_frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.mime, self.width, self.height)?;
        if let Some(bit_rate) = self.bit_rate {
            write!(f, " {bit_rate}bps")?;
        }
        if let Some(frame_rate) = self.frame_rate {
            write!(f, " {frame_rate}fps")?;
        }
        if !self.csd.is_empty() {
            write!(f, " csd×{}", self.csd.len())?;
        }
        Ok(())
    }
}
