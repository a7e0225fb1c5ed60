//! The set of generated movies and where they live.

use crate::config::ContentConfig;
use crate::generator::{EightRects, FrameSource, MovieSpec, Sliders, generate_movie};
use crate::task::GenerateTask;
use crate::ContentError;
use moviekit_codec::{CodecFactory, SoftwareBinder, SoftwareCodecFactory, SurfaceBinder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// A kind of generated movie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    /// See [`EightRects`].
    EightRects,
    /// See [`Sliders`].
    Sliders,
}

impl ContentKind {
    /// Every kind, in id order.
    pub const ALL: [Self; 2] = [Self::EightRects, Self::Sliders];

    /// Stable numeric id.
    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::EightRects => 0,
            Self::Sliders => 1,
        }
    }

    /// Kind with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::UnknownContent`] for an unknown id.
    pub fn from_id(id: u32) -> Result<Self, ContentError> {
        match id {
            0 => Ok(Self::EightRects),
            1 => Ok(Self::Sliders),
            other => Err(ContentError::UnknownContent(other)),
        }
    }

    /// File name of the generated movie.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::EightRects => "gen-eight-rects.mp4",
            Self::Sliders => "gen-sliders.mp4",
        }
    }

    /// Generator for this kind with `config` applied.
    #[must_use]
    pub fn source(self, config: &ContentConfig) -> Box<dyn FrameSource> {
        match self {
            Self::EightRects => {
                let spec = config.apply(self, EightRects::default().config().clone());
                Box::new(EightRects::new(spec))
            }
            Self::Sliders => {
                let spec = config.apply(self, Sliders::default().config().clone());
                Box::new(Sliders::new(spec))
            }
        }
    }

    const fn slot(self) -> usize {
        self.id() as usize
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

const SLOTS: usize = ContentKind::ALL.len();

/// A movie produced by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieArtifact {
    /// Which movie this is.
    pub kind: ContentKind,
    /// Location of the file.
    pub path: PathBuf,
    /// Parameters it was generated with.
    pub spec: MovieSpec,
    /// Encoded samples in the file.
    pub samples: u64,
}

/// Generates movies on demand and remembers the ones it produced.
///
/// Owned by the application and shared with worker threads through an
/// [`Arc`].
pub struct ContentRegistry {
    config: ContentConfig,
    factory: Arc<dyn CodecFactory>,
    binder: Arc<dyn SurfaceBinder>,
    items: Mutex<[Option<MovieArtifact>; SLOTS]>,
}

impl fmt::Debug for ContentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentRegistry")
            .field("output_dir", &self.config.output_dir)
            .finish_non_exhaustive()
    }
}

impl ContentRegistry {
    /// Registry generating with `factory` and `binder`.
    #[must_use]
    pub fn new(
        config: ContentConfig,
        factory: Arc<dyn CodecFactory>,
        binder: Arc<dyn SurfaceBinder>,
    ) -> Self {
        Self {
            config,
            factory,
            binder,
            items: Mutex::new([None, None]),
        }
    }

    /// Registry backed by the software codec, tuned by `config`.
    #[must_use]
    pub fn software(config: ContentConfig) -> Self {
        let factory = SoftwareCodecFactory::new(config.software_codec.into());
        Self::new(config, Arc::new(factory), Arc::new(SoftwareBinder))
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ContentConfig {
        &self.config
    }

    /// Where the movie of `kind` is stored.
    #[must_use]
    pub fn path_for(&self, kind: ContentKind) -> PathBuf {
        self.config.output_dir.join(kind.file_name())
    }

    /// True if this registry has generated `kind`.
    #[must_use]
    pub fn has(&self, kind: ContentKind) -> bool {
        self.lock()[kind.slot()].is_some()
    }

    /// The generated movie of `kind`, if any.
    #[must_use]
    pub fn get(&self, kind: ContentKind) -> Option<MovieArtifact> {
        self.lock()[kind.slot()].clone()
    }

    /// True if a readable file exists for every kind.
    #[must_use]
    pub fn is_created(&self) -> bool {
        ContentKind::ALL.iter().all(|&kind| {
            let path = self.path_for(kind);
            let readable = File::open(&path).is_ok();
            if !readable {
                log::debug!("can't find readable {}", path.display());
            }
            readable
        })
    }

    /// Generate the movie of `kind` on the calling thread and store it.
    ///
    /// `progress` receives percentages as frames are encoded.
    ///
    /// # Errors
    ///
    /// Fails if the output directory cannot be created or encoding fails.
    pub fn prepare(
        &self,
        kind: ContentKind,
        progress: &mut dyn FnMut(u32),
    ) -> Result<MovieArtifact, ContentError> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.path_for(kind);
        let source = kind.source(&self.config);
        log::info!("generating {kind} into {}", path.display());

        let samples = generate_movie(
            source.as_ref(),
            self.factory.as_ref(),
            self.binder.as_ref(),
            &path,
            progress,
        )?;
        let artifact = MovieArtifact {
            kind,
            path,
            spec: source.config().clone(),
            samples,
        };
        self.lock()[kind.slot()] = Some(artifact.clone());
        Ok(artifact)
    }

    /// Generate `kinds` in order on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the worker cannot be spawned.
    pub fn generate(self: &Arc<Self>, kinds: &[ContentKind]) -> Result<GenerateTask, ContentError> {
        GenerateTask::spawn(Arc::clone(self), kinds.to_vec())
    }

    /// Generate every kind on a worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the worker cannot be spawned.
    pub fn create_all(self: &Arc<Self>) -> Result<GenerateTask, ContentError> {
        self.generate(&ContentKind::ALL)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [Option<MovieArtifact>; SLOTS]> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
