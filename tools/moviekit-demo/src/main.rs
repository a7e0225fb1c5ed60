use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use moviekit_codec::{DecodedFrame, FrameSink, OutputSurface};
use moviekit_content::{ContentConfig, ContentKind, ContentRegistry, GenerateEvent};
use moviekit_video::{
    ChannelFeedback, Extractor, MoviePlayer, PacingMode, PlayTask, SpeedController,
    refresh_interval, select_video_track,
};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "moviekit-demo")]
#[command(about = "Generate and play back moviekit test movies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate test movies
    Generate {
        /// JSON content configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output directory, overrides the configuration
        #[arg(long)]
        out: Option<PathBuf>,
        /// Movies to generate (all if omitted)
        #[arg(long, value_enum)]
        kind: Vec<Kind>,
    },
    /// Decode a movie and report its frames
    Play {
        /// Movie to play
        path: PathBuf,
        /// How frames are paced
        #[arg(long, value_enum, default_value_t = Pacing::Timestamps)]
        pacing: Pacing,
        /// Frame rate for fixed pacing, display rate for display pacing
        #[arg(long, default_value_t = 60)]
        rate: u32,
        /// Restart at the end and stop after this many seconds
        #[arg(long)]
        loop_for: Option<u64>,
    },
    /// Print the tracks and samples of a movie
    Info {
        /// Movie to inspect
        path: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    EightRects,
    Sliders,
}

impl From<Kind> for ContentKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::EightRects => Self::EightRects,
            Kind::Sliders => Self::Sliders,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Pacing {
    Free,
    Timestamps,
    Fixed,
    Display,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Generate { config, out, kind } => generate(config.as_deref(), out, &kind),
        Commands::Play {
            path,
            pacing,
            rate,
            loop_for,
        } => play(&path, pacing, rate, loop_for),
        Commands::Info { path } => info(&path),
    }
}

fn generate(config: Option<&Path>, out: Option<PathBuf>, kinds: &[Kind]) -> Result<()> {
    let mut config = match config {
        Some(path) => ContentConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ContentConfig::default(),
    };
    if let Some(out) = out {
        config.output_dir = out;
    }
    let kinds: Vec<ContentKind> = if kinds.is_empty() {
        ContentKind::ALL.to_vec()
    } else {
        kinds.iter().copied().map(ContentKind::from).collect()
    };

    println!("{}", "🔨 Generating content...".yellow().bold());
    let registry = Arc::new(ContentRegistry::software(config));
    let task = registry.generate(&kinds)?;

    let result = loop {
        match task.events().recv_blocking() {
            Ok(GenerateEvent::Progress { index, percent }) => {
                if percent == 0 {
                    println!("{}", kinds[index].file_name().cyan());
                }
                log::debug!("{} {percent}%", kinds[index]);
            }
            Ok(GenerateEvent::Finished(result)) => break result,
            Err(_) => anyhow::bail!("Generator stopped without a result"),
        }
    };

    let movies = result.context("Unable to generate content")?;
    for movie in &movies {
        println!(
            "  {} {} ({} samples)",
            "✓".green(),
            movie.path.display(),
            movie.samples
        );
    }
    println!("{}", "✅ Content ready.".green().bold());
    Ok(())
}

/// Counts rendered frames.
#[derive(Debug, Default)]
struct CountingSink {
    frames: AtomicU64,
}

impl FrameSink for CountingSink {
    fn render(&self, frame: &DecodedFrame) {
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "frame {count} at {}us ({}x{})",
            frame.presentation_time_us,
            frame.width,
            frame.height
        );
    }
}

fn play(path: &Path, pacing: Pacing, rate: u32, loop_for: Option<u64>) -> Result<()> {
    let mode = match pacing {
        Pacing::Free => PacingMode::FreeRunning,
        Pacing::Timestamps => PacingMode::Timestamps,
        Pacing::Fixed => PacingMode::FixedRate { fps: rate },
        Pacing::Display => PacingMode::DisplaySynced {
            refresh: refresh_interval(f64::from(rate)),
        },
    };

    let sink = Arc::new(CountingSink::default());
    let pacer = SpeedController::new(mode);
    let player = MoviePlayer::new(
        path,
        moviekit_codec::sys::default_factory(),
        OutputSurface::Sink(sink.clone()),
        pacer,
    )
    .with_context(|| format!("Failed to open {}", path.display()))?;
    let (width, height) = player.video_size();
    println!("{} {width}x{height}", "▶ Playing".green().bold());
    player.set_loop_mode(loop_for.is_some());

    let (feedback, results) = ChannelFeedback::new();
    let task = PlayTask::execute(player, feedback)?;
    if let Some(seconds) = loop_for {
        std::thread::sleep(Duration::from_secs(seconds));
        task.request_stop();
    }
    task.wait_for_stop();

    let stats = results
        .recv_blocking()
        .context("Player stopped without a result")?
        .context("Playback failed")?;
    task.join()?;
    println!(
        "{} {} frames rendered, {} loops",
        "⏹".green(),
        stats.frames_rendered,
        stats.loops
    );
    Ok(())
}

fn info(path: &Path) -> Result<()> {
    let mut extractor =
        Extractor::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    println!("{}", path.display().bold());
    for index in 0..extractor.track_count() {
        println!("  track {index}: {}", extractor.track_format(index)?);
    }

    let Some(track) = select_video_track(&extractor) else {
        println!("{}", "⚠️ No video track".yellow());
        return Ok(());
    };
    extractor.select_track(track)?;
    let (mut samples, mut sync, mut last) = (0u64, 0u64, 0i64);
    while let Some(time) = extractor.sample_time() {
        samples += 1;
        if extractor.is_sync_sample() {
            sync += 1;
        }
        last = time;
        extractor.advance();
    }
    println!("  {samples} samples, {sync} sync, last at {last}us");
    Ok(())
}
