//! Settings for content generation, loadable from JSON.

use crate::ContentError;
use crate::generator::MovieSpec;
use crate::registry::ContentKind;
use moviekit_codec::SoftwareCodecOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level content configuration.
///
/// Every field has a default, so an empty JSON object is a valid file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Directory generated movies are written to.
    pub output_dir: PathBuf,
    /// Mime type used for every generated movie instead of the platform's
    /// preferred one.
    pub mime: Option<String>,
    /// Overrides for [`ContentKind::EightRects`].
    pub eight_rects: MovieOverrides,
    /// Overrides for [`ContentKind::Sliders`].
    pub sliders: MovieOverrides,
    /// Software codec tuning.
    pub software_codec: SoftwareTuning,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("content"),
            mime: None,
            eight_rects: MovieOverrides::default(),
            sliders: MovieOverrides::default(),
            software_codec: SoftwareTuning::default(),
        }
    }
}

impl ContentConfig {
    /// Read a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the file cannot be read and
    /// [`ContentError::Config`] if it is not valid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ContentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        log::debug!("loaded content config from {}", path.display());
        Ok(config)
    }

    /// Configuration writing into `output_dir`, everything else default.
    #[must_use]
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Overrides for `kind`.
    #[must_use]
    pub const fn overrides(&self, kind: ContentKind) -> &MovieOverrides {
        match kind {
            ContentKind::EightRects => &self.eight_rects,
            ContentKind::Sliders => &self.sliders,
        }
    }

    /// Apply the mime override and the overrides of `kind` to `spec`.
    #[must_use]
    pub fn apply(&self, kind: ContentKind, mut spec: MovieSpec) -> MovieSpec {
        if let Some(mime) = &self.mime {
            spec.encoder.mime.clone_from(mime);
        }
        let overrides = self.overrides(kind);
        let encoder = &mut spec.encoder;
        encoder.width = overrides.width.unwrap_or(encoder.width);
        encoder.height = overrides.height.unwrap_or(encoder.height);
        encoder.bit_rate = overrides.bit_rate.unwrap_or(encoder.bit_rate);
        encoder.frame_rate = overrides.frame_rate.unwrap_or(encoder.frame_rate);
        spec.frame_count = overrides.frame_count.unwrap_or(spec.frame_count);
        spec
    }
}

/// Optional replacements for a generated movie's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MovieOverrides {
    /// Frame width.
    pub width: Option<u32>,
    /// Frame height.
    pub height: Option<u32>,
    /// Bit rate in bits per second.
    pub bit_rate: Option<u32>,
    /// Nominal frame rate.
    pub frame_rate: Option<u32>,
    /// Number of frames.
    pub frame_count: Option<u32>,
}

/// Queue depths of the software codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareTuning {
    /// Queued input frames.
    pub input_buffers: usize,
    /// Output buffers held at once.
    pub output_buffers: usize,
    /// Frames kept by the encoder before it emits output.
    pub encoder_latency: usize,
}

impl Default for SoftwareTuning {
    fn default() -> Self {
        SoftwareCodecOptions::default().into()
    }
}

impl From<SoftwareCodecOptions> for SoftwareTuning {
    fn from(options: SoftwareCodecOptions) -> Self {
        Self {
            input_buffers: options.input_buffers,
            output_buffers: options.output_buffers,
            encoder_latency: options.encoder_latency,
        }
    }
}

impl From<SoftwareTuning> for SoftwareCodecOptions {
    fn from(tuning: SoftwareTuning) -> Self {
        Self {
            input_buffers: tuning.input_buffers,
            output_buffers: tuning.output_buffers,
            encoder_latency: tuning.encoder_latency,
        }
    }
}
