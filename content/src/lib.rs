//! Generated test movies.
//!
//! Two procedurally drawn movies ([`EightRects`], [`Sliders`]) are encoded
//! into MP4 files by a [`ContentRegistry`], either one at a time with
//! [`ContentRegistry::prepare`] or as a background batch
//! ([`ContentRegistry::generate`]) reporting progress over a channel.
//!
//! ```no_run
//! use moviekit_content::{ContentConfig, ContentRegistry};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ContentRegistry::software(ContentConfig::with_output_dir("movies")));
//! let movies = registry.create_all()?.wait()?;
//! println!("generated {} movies", movies.len());
//! # Ok::<(), moviekit_content::ContentError>(())
//! ```

#![warn(missing_docs)]

mod config;
mod generator;
mod registry;
mod task;

pub use config::{ContentConfig, MovieOverrides, SoftwareTuning};
pub use generator::{EightRects, FrameSource, MovieSpec, Sliders, generate_movie};
pub use registry::{ContentKind, ContentRegistry, MovieArtifact};
pub use task::{GenerateEvent, GenerateResult, GenerateTask};

/// Errors raised while preparing content.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// No content kind has this id.
    #[error("unknown content id {0}")]
    UnknownContent(u32),

    /// Encoding the movie failed.
    #[error("failed to generate content")]
    Encode(#[from] moviekit_video::EncodeError),

    /// File system failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The configuration file is invalid.
    #[error("invalid content configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The generation worker panicked.
    #[error("content generation worker panicked")]
    TaskPanicked,
}
