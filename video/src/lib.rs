//! Movie encode and playback pipelines.
//!
//! This crate provides:
//! - **Muxing**: write encoded video into MP4/MOV containers ([`Muxer`])
//! - **Demuxing**: read samples back in decode order ([`Extractor`])
//! - **Encoding**: drive a surface-fed encoder into a muxer ([`MovieEncoder`])
//! - **Playback**: decode a movie to an output surface on a worker thread
//!   ([`MoviePlayer`], [`PlayTask`]) with frame pacing ([`SpeedController`])

#![warn(missing_docs)]

mod encoder;
mod extractor;
mod muxer;
pub mod nal;
mod pacing;
mod player;

use std::path::PathBuf;

pub use encoder::{EncoderConfig, MovieEncoder};
pub use extractor::{Extractor, SeekMode, select_video_track};
pub use muxer::{MEDIA_TIMESCALE, Muxer, VideoFormat};
pub use pacing::{Clock, PacingMode, SpeedController, SystemClock, refresh_interval};
pub use player::{
    ChannelFeedback, FrameCallback, MoviePlayer, PlayTask, PlaybackResult, PlaybackStats,
    PlayerFeedback, StopHandle,
};

pub use moviekit_codec as codec;

/// Errors that can occur with video operations.
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    /// IO error during file operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// MP4 container error.
    #[error(transparent)]
    Mp4(#[from] mp4::Error),

    /// Container format error.
    #[error("container error: {0}")]
    Container(String),

    /// The source file does not exist.
    #[error("unable to read {}", .0.display())]
    NotFound(PathBuf),

    /// The container holds no video track.
    #[error("no video track found in {}", .0.display())]
    NoVideoTrack(PathBuf),

    /// A muxer call was made in the wrong state.
    #[error("muxer misuse: {0}")]
    MuxerState(String),

    /// Codec error during encode/decode.
    #[error(transparent)]
    Codec(#[from] moviekit_codec::CodecError),

    /// The playback worker panicked.
    #[error("playback worker panicked")]
    WorkerPanicked,
}

/// Errors raised while producing a movie.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// A software encoder could not provide an input surface.
    #[error("software codec {codec} cannot provide an input surface")]
    SoftwareCodecSurface {
        /// Component name.
        codec: String,
        /// Underlying failure.
        #[source]
        source: moviekit_codec::CodecError,
    },

    /// The encoder could not provide an input surface.
    #[error("failed to create encoder input surface")]
    InputSurface(#[source] moviekit_codec::CodecError),

    /// Codec failure.
    #[error(transparent)]
    Codec(#[from] moviekit_codec::CodecError),

    /// Container failure.
    #[error(transparent)]
    Video(#[from] VideoError),
}
