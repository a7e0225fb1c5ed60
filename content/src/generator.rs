//! Procedurally drawn movies.

use moviekit_codec::{Canvas, CodecFactory, Color, Rect, SurfaceBinder};
use moviekit_video::{EncodeError, EncoderConfig, MovieEncoder};
use std::path::Path;

const ONE_BILLION: i64 = 1_000_000_000;

/// Encoder parameters and length of a generated movie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieSpec {
    /// Encoder configuration, including frame size.
    pub encoder: EncoderConfig,
    /// Number of frames to generate.
    pub frame_count: u32,
}

/// Draws the frames of a generated movie.
pub trait FrameSource: Send {
    /// Encoder parameters and frame count.
    fn config(&self) -> &MovieSpec;

    /// Draw frame `index` onto `canvas`.
    fn render_frame(&self, index: u32, canvas: &mut dyn Canvas);

    /// Presentation time of frame `index` in nanoseconds.
    fn presentation_time_nsec(&self, index: u32) -> i64;
}

fn coord(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// A highlighted cell walking around a 4x2 grid.
///
/// The first eight frames run at 8 fps, the next eight at 16 fps and the
/// rest at 30 fps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EightRects {
    spec: MovieSpec,
}

impl EightRects {
    /// Cell background.
    pub const BASE: [u8; 3] = [0, 136, 0];
    /// Highlighted cell.
    pub const HIGHLIGHT: [u8; 3] = [236, 50, 186];

    /// Generator with a custom spec.
    #[must_use]
    pub const fn new(spec: MovieSpec) -> Self {
        Self { spec }
    }
}

impl Default for EightRects {
    fn default() -> Self {
        Self::new(MovieSpec {
            encoder: EncoderConfig {
                width: 320,
                height: 240,
                bit_rate: 2_000_000,
                frame_rate: 30,
                ..EncoderConfig::default()
            },
            frame_count: 32,
        })
    }
}

impl FrameSource for EightRects {
    fn config(&self) -> &MovieSpec {
        &self.spec
    }

    fn render_frame(&self, index: u32, canvas: &mut dyn Canvas) {
        let (width, height) = canvas.size();
        let cell = index % 8;
        // (0,0) is bottom-left.
        let (x, y) = if cell < 4 {
            (cell * (width / 4), height / 2)
        } else {
            ((7 - cell) * (width / 4), 0)
        };

        let [r, g, b] = Self::BASE;
        canvas.set_scissor(None);
        canvas.set_clear_color(Color::rgb8(r, g, b));
        canvas.clear();

        let [r, g, b] = Self::HIGHLIGHT;
        canvas.set_scissor(Some(Rect::new(coord(x), coord(y), width / 4, height / 2)));
        canvas.set_clear_color(Color::rgb8(r, g, b));
        canvas.clear();
        canvas.set_scissor(None);
    }

    fn presentation_time_nsec(&self, index: u32) -> i64 {
        let index = i64::from(index);
        if index < 8 {
            index * ONE_BILLION / 8
        } else if index < 16 {
            ONE_BILLION + (index - 8) * ONE_BILLION / 16
        } else {
            ONE_BILLION + ONE_BILLION / 2 + (index - 16) * ONE_BILLION / 30
        }
    }
}

/// A red and a green box sliding across a pulsing gray background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sliders {
    spec: MovieSpec,
}

impl Sliders {
    /// Edge length of both boxes.
    pub const BOX_SIZE: u32 = 80;

    /// Generator with a custom spec.
    #[must_use]
    pub const fn new(spec: MovieSpec) -> Self {
        Self { spec }
    }
}

impl Default for Sliders {
    fn default() -> Self {
        Self::new(MovieSpec {
            encoder: EncoderConfig {
                width: 480,
                height: 640,
                bit_rate: 5_000_000,
                frame_rate: 30,
                ..EncoderConfig::default()
            },
            frame_count: 240,
        })
    }
}

impl FrameSource for Sliders {
    fn config(&self) -> &MovieSpec {
        &self.spec
    }

    fn render_frame(&self, index: u32, canvas: &mut dyn Canvas) {
        let (width, height) = canvas.size();
        let offset = (index % 240).abs_diff(120);
        let x = offset * width / 120;
        let y = offset * height / 120;
        #[allow(clippy::cast_precision_loss)]
        let luma = offset as f32 / 120.0;

        canvas.set_scissor(None);
        canvas.set_clear_color(Color::gray(luma));
        canvas.clear();

        let half = Self::BOX_SIZE / 2;
        canvas.set_scissor(Some(Rect::new(
            coord(half),
            coord(y),
            Self::BOX_SIZE,
            Self::BOX_SIZE,
        )));
        canvas.set_clear_color(Color::RED);
        canvas.clear();

        canvas.set_scissor(Some(Rect::new(
            coord(x),
            coord(half),
            Self::BOX_SIZE,
            Self::BOX_SIZE,
        )));
        canvas.set_clear_color(Color::GREEN);
        canvas.clear();
        canvas.set_scissor(None);
    }

    fn presentation_time_nsec(&self, index: u32) -> i64 {
        let fps = i64::from(self.spec.encoder.frame_rate.max(1));
        i64::from(index) * ONE_BILLION / fps
    }
}

/// Encode every frame of `source` into `path`.
///
/// `progress` receives the completed percentage before each frame is
/// encoded. Returns the number of samples written.
///
/// # Errors
///
/// Any encoder or container failure aborts generation; the encoder is
/// released either way.
pub fn generate_movie(
    source: &dyn FrameSource,
    factory: &dyn CodecFactory,
    binder: &dyn SurfaceBinder,
    path: &Path,
    progress: &mut dyn FnMut(u32),
) -> Result<u64, EncodeError> {
    let spec = source.config();
    let frames = spec.frame_count;
    let mut encoder = MovieEncoder::configure(factory, binder, &spec.encoder, path)?;

    for index in 0..frames {
        encoder.drain(false)?;
        source.render_frame(index, encoder.canvas()?);
        encoder.submit_frame(source.presentation_time_nsec(index))?;
        progress(u32::try_from(u64::from(index) * 100 / u64::from(frames)).unwrap_or(100));
    }
    encoder.drain(true)?;

    let samples = encoder.samples_written();
    encoder.finish()?;
    log::info!("generated {} ({samples} samples)", path.display());
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Canvas that records the area of every clear.
    #[derive(Default)]
    struct Trace {
        size: (u32, u32),
        color: Option<Color>,
        scissor: Option<Rect>,
        clears: Vec<(Option<Rect>, Color)>,
    }

    impl Canvas for Trace {
        fn size(&self) -> (u32, u32) {
            self.size
        }

        fn set_clear_color(&mut self, color: Color) {
            self.color = Some(color);
        }

        fn set_scissor(&mut self, rect: Option<Rect>) {
            self.scissor = rect;
        }

        fn clear(&mut self) {
            self.clears
                .push((self.scissor, self.color.unwrap_or(Color::BLACK)));
        }
    }

    fn trace(source: &dyn FrameSource, index: u32) -> Vec<(Option<Rect>, Color)> {
        let encoder = &source.config().encoder;
        let mut canvas = Trace {
            size: (encoder.width, encoder.height),
            ..Trace::default()
        };
        source.render_frame(index, &mut canvas);
        canvas.clears
    }

    #[test]
    fn eight_rects_timing_changes_rate() {
        let movie = EightRects::default();
        assert_eq!(movie.presentation_time_nsec(0), 0);
        assert_eq!(movie.presentation_time_nsec(1), 125_000_000);
        assert_eq!(movie.presentation_time_nsec(7), 875_000_000);
        assert_eq!(movie.presentation_time_nsec(8), 1_000_000_000);
        assert_eq!(movie.presentation_time_nsec(9), 1_062_500_000);
        assert_eq!(movie.presentation_time_nsec(15), 1_437_500_000);
        assert_eq!(movie.presentation_time_nsec(16), 1_500_000_000);
        assert_eq!(movie.presentation_time_nsec(17), 1_533_333_333);
        assert_eq!(movie.presentation_time_nsec(31), 2_000_000_000);
    }

    #[test]
    fn eight_rects_timestamps_increase() {
        let movie = EightRects::default();
        let pts: Vec<i64> = (0..32).map(|i| movie.presentation_time_nsec(i)).collect();
        assert!(pts.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn sliders_timestamps_follow_frame_rate() {
        let movie = Sliders::default();
        let pts: Vec<i64> = (0..240).map(|i| movie.presentation_time_nsec(i)).collect();
        assert!(pts.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(pts[1], 33_333_333);
        assert_eq!(pts[239], 239 * ONE_BILLION / 30);
    }

    #[test]
    fn eight_rects_walks_the_grid() {
        let movie = EightRects::default();
        let highlight = |index| trace(&movie, index)[1].0;
        assert_eq!(highlight(0), Some(Rect::new(0, 120, 80, 120)));
        assert_eq!(highlight(3), Some(Rect::new(240, 120, 80, 120)));
        assert_eq!(highlight(4), Some(Rect::new(240, 0, 80, 120)));
        assert_eq!(highlight(7), Some(Rect::new(0, 0, 80, 120)));
        assert_eq!(highlight(8), highlight(0));
    }

    #[test]
    fn sliders_bounce() {
        let movie = Sliders::default();
        let clears = trace(&movie, 0);
        assert_eq!(clears[0], (None, Color::gray(1.0)));
        assert_eq!(clears[1], (Some(Rect::new(40, 640, 80, 80)), Color::RED));
        assert_eq!(clears[2], (Some(Rect::new(480, 40, 80, 80)), Color::GREEN));

        let clears = trace(&movie, 120);
        assert_eq!(clears[0], (None, Color::gray(0.0)));
        assert_eq!(clears[1].0, Some(Rect::new(40, 0, 80, 80)));
        assert_eq!(trace(&movie, 60), trace(&movie, 180));
        assert_eq!(movie.presentation_time_nsec(30), ONE_BILLION);
    }
}
