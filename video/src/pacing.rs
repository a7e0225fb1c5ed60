//! Frame pacing for playback.
//!
//! A decoder produces frames as fast as it can; [`SpeedController`] holds each
//! frame back until its presentation time, measured from the previous frame.

use crate::player::{FrameCallback, StopHandle};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const ONE_MILLION: i64 = 1_000_000;
const MAX_SLEEP_US: i64 = 500_000;
/// Sleep slice while a stop handle is attached.
const STOP_POLL_US: i64 = 10_000;
const EARLY_WAKE_US: i64 = 100;
const LONG_PAUSE_US: i64 = 10 * ONE_MILLION;
const CAPPED_PAUSE_US: i64 = 5 * ONE_MILLION;
/// Gap assumed between the last frame of a loop and the first of the next.
const LOOP_GAP_US: i64 = ONE_MILLION / 30;

/// Monotonic time source.
pub trait Clock: Send {
    /// Monotonic time in microseconds.
    fn now_us(&self) -> i64;

    /// Block for `us` microseconds.
    fn sleep_us(&self, us: i64);
}

/// The process clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
        i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX)
    }

    fn sleep_us(&self, us: i64) {
        if let Ok(us) = u64::try_from(us) {
            std::thread::sleep(Duration::from_micros(us));
        }
    }
}

/// How frames are spaced in time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PacingMode {
    /// Render as fast as the decoder delivers.
    FreeRunning,
    /// Follow presentation time deltas.
    #[default]
    Timestamps,
    /// Ignore timestamps and render at a fixed rate.
    FixedRate {
        /// Frames per second.
        fps: u32,
    },
    /// Follow presentation time deltas, rounded up to whole display refreshes.
    DisplaySynced {
        /// Display refresh interval.
        refresh: Duration,
    },
}

/// Frame interval of a display refreshing `display_fps` times per second.
#[must_use]
pub fn refresh_interval(display_fps: f64) -> Duration {
    if display_fps.is_finite() && display_fps > 0.0 {
        Duration::from_secs_f64(1.0 / display_fps)
    } else {
        Duration::ZERO
    }
}

/// Whole microseconds, rounded to nearest so a 60 Hz refresh is 16 667us.
fn duration_us(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos().saturating_add(500) / 1000).unwrap_or(i64::MAX)
}

/// Paces rendering by sleeping in [`FrameCallback::pre_render`].
#[derive(Debug)]
pub struct SpeedController<C: Clock = SystemClock> {
    clock: C,
    mode: PacingMode,
    stop: Option<StopHandle>,
    prev_present_us: Option<i64>,
    prev_mono_us: i64,
    loop_reset: bool,
}

impl SpeedController<SystemClock> {
    /// Controller on the system clock.
    #[must_use]
    pub const fn new(mode: PacingMode) -> Self {
        Self::with_clock(mode, SystemClock)
    }
}

impl<C: Clock> SpeedController<C> {
    /// Controller on a custom clock.
    #[must_use]
    pub const fn with_clock(mode: PacingMode, clock: C) -> Self {
        Self {
            clock,
            mode,
            stop: None,
            prev_present_us: None,
            prev_mono_us: 0,
            loop_reset: false,
        }
    }

    /// Cut waits short once `stop` is requested. [`MoviePlayer`] attaches
    /// its own handle, so this is only needed when pacing outside a player.
    ///
    /// [`MoviePlayer`]: crate::MoviePlayer
    #[must_use]
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Change the pacing mode; takes effect on the next frame.
    pub const fn set_mode(&mut self, mode: PacingMode) {
        self.mode = mode;
    }

    /// The current pacing mode.
    #[must_use]
    pub const fn mode(&self) -> PacingMode {
        self.mode
    }

    fn stopping(&self) -> bool {
        self.stop.as_ref().is_some_and(StopHandle::is_stop_requested)
    }

    fn frame_delta(&self, presentation_time_us: i64, prev_present_us: i64) -> i64 {
        match self.mode {
            PacingMode::FixedRate { fps } if fps > 0 => ONE_MILLION / i64::from(fps),
            PacingMode::DisplaySynced { refresh } => {
                let delta = presentation_time_us - prev_present_us;
                let refresh = duration_us(refresh);
                if refresh > 0 && delta > 0 {
                    (delta + refresh - 1) / refresh * refresh
                } else {
                    delta
                }
            }
            _ => presentation_time_us - prev_present_us,
        }
    }

    fn wait_until(&self, desired_us: i64) {
        let slice = if self.stop.is_some() {
            STOP_POLL_US
        } else {
            MAX_SLEEP_US
        };
        let mut now = self.clock.now_us();
        while now < desired_us - EARLY_WAKE_US && !self.stopping() {
            self.clock.sleep_us((desired_us - now).min(slice));
            now = self.clock.now_us();
        }
    }
}

impl<C: Clock> FrameCallback for SpeedController<C> {
    fn pre_render(&mut self, presentation_time_us: i64) {
        if self.mode == PacingMode::FreeRunning {
            return;
        }
        let Some(mut prev_present) = self.prev_present_us else {
            // First frame: latch both clocks and render immediately.
            self.prev_mono_us = self.clock.now_us();
            self.prev_present_us = Some(presentation_time_us);
            return;
        };

        if self.loop_reset {
            prev_present = presentation_time_us - LOOP_GAP_US;
            self.loop_reset = false;
        }

        let mut delta = self.frame_delta(presentation_time_us, prev_present);
        if delta < 0 {
            log::warn!(
                "presentation time went backward ({presentation_time_us}us after {prev_present}us), re-anchoring"
            );
            self.prev_mono_us = self.clock.now_us();
            self.prev_present_us = Some(presentation_time_us);
            return;
        } else if delta == 0 {
            log::debug!("frame at {presentation_time_us}us repeats the previous timestamp");
        } else if delta > LONG_PAUSE_US {
            log::info!(
                "inter-frame pause of {}s capped at {}s",
                delta / ONE_MILLION,
                CAPPED_PAUSE_US / ONE_MILLION
            );
            delta = CAPPED_PAUSE_US;
        }

        self.wait_until(self.prev_mono_us + delta);
        self.prev_mono_us += delta;
        self.prev_present_us = Some(prev_present + delta);
    }

    fn loop_reset(&mut self) {
        self.loop_reset = true;
    }

    fn attach_stop(&mut self, stop: StopHandle) {
        self.stop = Some(stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A clock that only moves when slept on.
    #[derive(Debug, Clone, Default)]
    struct ManualClock {
        state: Arc<Mutex<(i64, Vec<i64>)>>,
    }

    impl ManualClock {
        fn sleeps(&self) -> Vec<i64> {
            self.state.lock().unwrap().1.clone()
        }

        fn advance(&self, us: i64) {
            self.state.lock().unwrap().0 += us;
        }

        fn total_slept(&self) -> i64 {
            self.sleeps().iter().sum()
        }
    }

    impl Clock for ManualClock {
        fn now_us(&self) -> i64 {
            self.state.lock().unwrap().0
        }

        fn sleep_us(&self, us: i64) {
            let mut state = self.state.lock().unwrap();
            state.0 += us;
            state.1.push(us);
        }
    }

    #[test]
    fn follows_timestamp_deltas() {
        let clock = ManualClock::default();
        let mut pacing = SpeedController::with_clock(PacingMode::Timestamps, clock.clone());
        pacing.pre_render(0);
        assert!(clock.sleeps().is_empty());
        pacing.pre_render(125_000);
        pacing.pre_render(250_000);
        assert_eq!(clock.sleeps(), vec![125_000, 125_000]);
    }

    #[test]
    fn long_waits_are_chunked() {
        let clock = ManualClock::default();
        let mut pacing = SpeedController::with_clock(PacingMode::Timestamps, clock.clone());
        pacing.pre_render(0);
        pacing.pre_render(1_200_000);
        assert_eq!(clock.sleeps(), vec![500_000, 500_000, 200_000]);
    }

    #[test]
    fn pauses_are_capped() {
        let clock = ManualClock::default();
        let mut pacing = SpeedController::with_clock(PacingMode::Timestamps, clock.clone());
        pacing.pre_render(0);
        pacing.pre_render(60 * ONE_MILLION);
        assert_eq!(clock.total_slept(), CAPPED_PAUSE_US);
    }

    #[test]
    fn decoding_time_counts_against_the_wait() {
        let clock = ManualClock::default();
        let mut pacing = SpeedController::with_clock(PacingMode::Timestamps, clock.clone());
        pacing.pre_render(0);
        clock.advance(100_000);
        pacing.pre_render(125_000);
        assert_eq!(clock.sleeps(), vec![25_000]);
        // Already late: no wait at all.
        clock.advance(200_000);
        pacing.pre_render(250_000);
        assert_eq!(clock.sleeps(), vec![25_000]);
    }

    #[test]
    fn loop_reset_waits_one_nominal_frame() {
        let clock = ManualClock::default();
        let mut pacing = SpeedController::with_clock(PacingMode::Timestamps, clock.clone());
        pacing.pre_render(0);
        pacing.pre_render(2_000_000);
        pacing.loop_reset();
        pacing.pre_render(0);
        assert_eq!(clock.sleeps().last(), Some(&LOOP_GAP_US));
    }

    #[test]
    fn backward_timestamps_never_wait() {
        let clock = ManualClock::default();
        let mut pacing = SpeedController::with_clock(PacingMode::Timestamps, clock.clone());
        pacing.pre_render(0);
        pacing.pre_render(1_000_000);
        let before = clock.sleeps().len();
        pacing.pre_render(100_000);
        assert_eq!(clock.sleeps().len(), before);
        // Pacing resumes from the new anchor.
        pacing.pre_render(200_000);
        assert_eq!(clock.sleeps().last(), Some(&100_000));
    }

    #[test]
    fn stop_handle_shortens_and_cancels_waits() {
        let clock = ManualClock::default();
        let stop = StopHandle::default();
        let mut pacing = SpeedController::with_clock(PacingMode::Timestamps, clock.clone());
        pacing.attach_stop(stop.clone());
        pacing.pre_render(0);
        pacing.pre_render(35_000);
        assert_eq!(clock.sleeps(), vec![10_000, 10_000, 10_000, 5_000]);

        stop.request_stop();
        pacing.pre_render(4_000_000);
        assert_eq!(clock.total_slept(), 35_000);
    }

    #[test]
    fn fixed_rate_ignores_timestamps() {
        let clock = ManualClock::default();
        let mut pacing =
            SpeedController::with_clock(PacingMode::FixedRate { fps: 10 }, clock.clone());
        pacing.pre_render(0);
        pacing.pre_render(5);
        pacing.pre_render(5);
        assert_eq!(clock.sleeps(), vec![100_000, 100_000]);
    }

    #[test]
    fn display_sync_rounds_up_to_refreshes() {
        let clock = ManualClock::default();
        let mode = PacingMode::DisplaySynced {
            refresh: Duration::from_micros(16_000),
        };
        let mut pacing = SpeedController::with_clock(mode, clock.clone());
        pacing.pre_render(0);
        pacing.pre_render(33_333);
        assert_eq!(clock.sleeps(), vec![48_000]);
    }

    #[test]
    fn display_sync_keeps_one_refresh_frames_on_one_refresh() {
        let clock = ManualClock::default();
        let mode = PacingMode::DisplaySynced {
            refresh: refresh_interval(60.0),
        };
        let mut pacing = SpeedController::with_clock(mode, clock.clone());
        pacing.pre_render(0);
        pacing.pre_render(16_667);
        pacing.pre_render(50_000);
        assert_eq!(clock.sleeps(), vec![16_667, 33_334]);
    }

    #[test]
    fn free_running_never_sleeps() {
        let clock = ManualClock::default();
        let mut pacing = SpeedController::with_clock(PacingMode::FreeRunning, clock.clone());
        for pts in [0, 1_000_000, 2_000_000] {
            pacing.pre_render(pts);
        }
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn refresh_interval_from_rate() {
        assert_eq!(refresh_interval(50.0), Duration::from_millis(20));
        assert_eq!(refresh_interval(0.0), Duration::ZERO);
    }
}
