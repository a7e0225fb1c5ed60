//! # Moviekit
//!
//! Programmatic movie generation and paced playback on top of codecs that
//! speak the hardware buffer-exchange protocol.
//!
//! ## Features
//!
//! Moviekit is modular. Enable only the layers you need:
//!
//! - `codec`: The codec protocol, the Android `MediaCodec` backend and a
//!   portable software codec.
//! - `video`: MP4 muxing and extraction, the encode pipeline and the
//!   playback pipeline with frame pacing.
//! - `content`: Generated test movies and the registry that prepares them.
//!
//! Use the `full` feature to enable everything.
//!
//! ## Example
//!
//! ```toml
//! [dependencies]
//! moviekit = { version = "0.1", features = ["video"] }
//! ```
//!
//! ```rust,no_run
//! # #[cfg(feature = "video")]
//! # fn main() -> Result<(), moviekit::video::VideoError> {
//! use moviekit::codec::{RecordingSink, sys};
//! use moviekit::video::{MoviePlayer, PacingMode, SpeedController};
//! use std::sync::Arc;
//!
//! let sink = Arc::new(RecordingSink::new());
//! let mut player = MoviePlayer::new(
//!     "movie.mp4",
//!     sys::default_factory(),
//!     sink.into(),
//!     SpeedController::new(PacingMode::Timestamps),
//! )?;
//! let stats = player.play()?;
//! println!("rendered {} frames", stats.frames_rendered);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "video"))]
//! # fn main() {}
//! ```

#[cfg(feature = "codec")]
pub use moviekit_codec as codec;

#[cfg(feature = "content")]
pub use moviekit_content as content;

#[cfg(feature = "video")]
pub use moviekit_video as video;
