//! Movie playback: decode a file to an output surface, optionally looping.

use crate::VideoError;
use crate::extractor::{Extractor, SeekMode, select_video_track};
use moviekit_codec::exchange::{BufferExchange, DEFAULT_TIMEOUT, OutputBuffer, OutputHandler, PollEvent};
use moviekit_codec::{
    BufferFlags, Codec, CodecDirection, CodecError, CodecFactory, MediaFormat, OutputSurface,
};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

/// Outcome of a playback run.
pub type PlaybackResult = Result<PlaybackStats, VideoError>;

/// Hooks around each rendered frame.
pub trait FrameCallback: Send {
    /// Called before a frame with `presentation_time_us` is rendered. May
    /// block to pace playback.
    fn pre_render(&mut self, presentation_time_us: i64);

    /// Called after the frame was released for rendering.
    fn post_render(&mut self) {}

    /// Called when playback restarts from the beginning.
    fn loop_reset(&mut self) {}

    /// Receives the player's stop handle once, when the player is created.
    /// Blocking in [`FrameCallback::pre_render`] should end early once a stop
    /// is requested.
    fn attach_stop(&mut self, stop: StopHandle) {
        let _ = stop;
    }
}

/// Counters reported when playback ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackStats {
    /// Frames released with `render = true`.
    pub frames_rendered: u64,
    /// Times playback wrapped around to the start.
    pub loops: u64,
}

#[derive(Debug, Default)]
struct Control {
    stop: AtomicBool,
    looping: AtomicBool,
}

/// Cooperative stop and loop switch for a running player.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    /// Ask playback to end at the next iteration.
    pub fn request_stop(&self) {
        self.control.stop.store(true, Ordering::Release);
    }

    /// True once a stop was requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.control.stop.load(Ordering::Acquire)
    }

    /// Restart from the beginning instead of ending at end of stream.
    pub fn set_loop_mode(&self, looping: bool) {
        self.control.looping.store(looping, Ordering::Release);
    }

    fn looping(&self) -> bool {
        self.control.looping.load(Ordering::Acquire)
    }
}

/// Plays one movie file through a decoder.
pub struct MoviePlayer {
    source: PathBuf,
    factory: Arc<dyn CodecFactory>,
    output: OutputSurface,
    callback: Box<dyn FrameCallback>,
    handle: StopHandle,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for MoviePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoviePlayer")
            .field("source", &self.source)
            .field("output", &self.output)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl MoviePlayer {
    /// Prepare playback of `source`, reading its video size.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::NotFound`] if the file cannot be opened and
    /// [`VideoError::NoVideoTrack`] if it contains no video.
    pub fn new(
        source: impl Into<PathBuf>,
        factory: Arc<dyn CodecFactory>,
        output: OutputSurface,
        callback: impl FrameCallback + 'static,
    ) -> Result<Self, VideoError> {
        let source = source.into();
        let extractor = Extractor::open(&source)?;
        let track = select_video_track(&extractor)
            .ok_or_else(|| VideoError::NoVideoTrack(source.clone()))?;
        let format = extractor.track_format(track)?;
        log::info!("video size is {}x{}", format.width, format.height);
        let handle = StopHandle::default();
        let mut callback: Box<dyn FrameCallback> = Box::new(callback);
        callback.attach_stop(handle.clone());
        Ok(Self {
            source,
            factory,
            output,
            callback,
            handle,
            width: format.width,
            height: format.height,
        })
    }

    /// Width and height of the video track.
    #[must_use]
    pub const fn video_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Source file.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Restart from the beginning at end of stream.
    pub fn set_loop_mode(&self, looping: bool) {
        self.handle.set_loop_mode(looping);
    }

    /// Handle to stop playback from another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.handle.clone()
    }

    /// Ask playback to stop at the next iteration.
    pub fn request_stop(&self) {
        self.handle.request_stop();
    }

    /// Decode the whole movie, blocking until the end of stream (or forever
    /// in loop mode) unless a stop is requested.
    ///
    /// # Errors
    ///
    /// Fails if the file, the decoder or the codec protocol fail. The decoder
    /// is released on every exit path.
    pub fn play(&mut self) -> PlaybackResult {
        let mut extractor = Extractor::open(&self.source)?;
        let track = select_video_track(&extractor)
            .ok_or_else(|| VideoError::NoVideoTrack(self.source.clone()))?;
        extractor.select_track(track)?;
        let format = extractor.track_format(track)?;

        let mut decoder = self.factory.create_decoder(&format.mime)?;
        log::info!("playing {} with {}", self.source.display(), decoder.name());
        let result = self.run_decoder(decoder.as_mut(), &format, &mut extractor, track);

        if let Err(err) = decoder.stop() {
            log::warn!("decoder stop failed: {err}");
        }
        decoder.release();
        result
    }

    fn run_decoder(
        &mut self,
        decoder: &mut dyn Codec,
        format: &MediaFormat,
        extractor: &mut Extractor,
        track: usize,
    ) -> PlaybackResult {
        decoder.configure(format, Some(self.output.clone()), CodecDirection::Decode)?;
        decoder.start()?;
        self.decode_loop(extractor, track, decoder)
    }

    fn decode_loop(
        &mut self,
        extractor: &mut Extractor,
        track: usize,
        decoder: &mut dyn Codec,
    ) -> PlaybackResult {
        let mut exchange = BufferExchange::new(CodecDirection::Decode);
        let mut stats = PlaybackStats::default();
        let mut input_done = false;
        let mut samples = 0u64;
        let mut first_input: Option<Instant> = None;
        let mut first_output = false;

        loop {
            if self.handle.is_stop_requested() {
                log::info!("stop requested");
                return Ok(stats);
            }

            if !input_done {
                if let Some(index) = decoder.dequeue_input_buffer(DEFAULT_TIMEOUT)? {
                    first_input.get_or_insert_with(Instant::now);
                    let buffer = decoder.input_buffer(index).ok_or_else(|| {
                        CodecError::Protocol(format!("input buffer {index} is missing"))
                    })?;
                    if let Some(size) = extractor.read_sample_data(buffer)? {
                        if extractor.sample_track_index() != Some(track) {
                            log::warn!(
                                "extractor returned a sample of track {:?}, expected {track}",
                                extractor.sample_track_index()
                            );
                        }
                        let pts = extractor.sample_time().unwrap_or(0);
                        decoder.queue_input_buffer(index, 0, size, pts, BufferFlags::NONE)?;
                        log::debug!("submitted sample {samples} to decoder, size={size}");
                        samples += 1;
                        extractor.advance();
                    } else {
                        decoder.queue_input_buffer(index, 0, 0, 0, BufferFlags::END_OF_STREAM)?;
                        input_done = true;
                        log::debug!("sent input end of stream");
                    }
                } else {
                    log::debug!("input buffer not available");
                }
            }

            let mut handler = RenderStep {
                callback: self.callback.as_mut(),
            };
            if let PollEvent::Buffer {
                rendered,
                end_of_stream,
            } = exchange.poll(decoder, &mut handler)?
            {
                if !first_output {
                    first_output = true;
                    if let Some(started) = first_input {
                        log::info!("startup lag {}ms", started.elapsed().as_millis());
                    }
                }
                if rendered {
                    self.callback.post_render();
                    stats.frames_rendered += 1;
                }
                if end_of_stream {
                    if !self.handle.looping() {
                        log::info!("output end of stream after {} frames", stats.frames_rendered);
                        return Ok(stats);
                    }
                    log::info!("reached end of stream, looping");
                    extractor.seek_to(0, SeekMode::ClosestSync)?;
                    input_done = false;
                    decoder.flush()?;
                    self.callback.loop_reset();
                    stats.loops += 1;
                }
            }
        }
    }
}

/// Decides rendering for decoded buffers and runs the pre-render hook.
struct RenderStep<'a> {
    callback: &'a mut dyn FrameCallback,
}

impl OutputHandler for RenderStep<'_> {
    type Error = VideoError;

    fn buffer_ready(&mut self, buffer: &OutputBuffer<'_>) -> Result<bool, VideoError> {
        let render = buffer.info.size != 0;
        if render {
            self.callback.pre_render(buffer.info.presentation_time_us);
        }
        Ok(render)
    }
}

/// Receives the final result of a [`PlayTask`].
pub trait PlayerFeedback: Send + 'static {
    /// Called exactly once, after the worker released its resources.
    fn playback_stopped(self: Box<Self>, result: PlaybackResult);
}

impl<F> PlayerFeedback for F
where
    F: FnOnce(PlaybackResult) + Send + 'static,
{
    fn playback_stopped(self: Box<Self>, result: PlaybackResult) {
        (*self)(result);
    }
}

/// Forwards the playback result onto a channel.
#[derive(Debug, Clone)]
pub struct ChannelFeedback {
    sender: async_channel::Sender<PlaybackResult>,
}

impl ChannelFeedback {
    /// Create the feedback and the receiving end.
    #[must_use]
    pub fn new() -> (Self, async_channel::Receiver<PlaybackResult>) {
        let (sender, receiver) = async_channel::bounded(1);
        (Self { sender }, receiver)
    }
}

impl PlayerFeedback for ChannelFeedback {
    fn playback_stopped(self: Box<Self>, result: PlaybackResult) {
        if self.sender.send_blocking(result).is_err() {
            log::debug!("playback result dropped, receiver is gone");
        }
    }
}

/// A [`MoviePlayer`] running on its own thread.
#[derive(Debug)]
pub struct PlayTask {
    handle: StopHandle,
    stopped: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl PlayTask {
    /// Start `player` on a worker thread named "movie player".
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Io`] if the thread cannot be spawned.
    pub fn execute(
        mut player: MoviePlayer,
        feedback: impl PlayerFeedback,
    ) -> Result<Self, VideoError> {
        let handle = player.stop_handle();
        let stopped = Arc::new((Mutex::new(false), Condvar::new()));
        let worker_stopped = Arc::clone(&stopped);

        let thread = std::thread::Builder::new()
            .name("movie player".into())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| player.play()))
                    .unwrap_or_else(|_| Err(VideoError::WorkerPanicked));
                if let Err(err) = &result {
                    log::error!("playback failed: {err}");
                }
                drop(player);
                {
                    let (lock, condvar) = &*worker_stopped;
                    *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
                    condvar.notify_all();
                }
                Box::new(feedback).playback_stopped(result);
            })?;

        Ok(Self {
            handle,
            stopped,
            thread: Some(thread),
        })
    }

    /// Ask the worker to stop. Returns immediately.
    pub fn request_stop(&self) {
        self.handle.request_stop();
    }

    /// Stop handle shared with the worker.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.handle.clone()
    }

    /// Block until the worker has finished.
    pub fn wait_for_stop(&self) {
        let (lock, condvar) = &*self.stopped;
        let mut stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            stopped = condvar
                .wait(stopped)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// True once the worker has finished.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stopped.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the worker thread to exit.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::WorkerPanicked`] if the thread died outside of
    /// playback.
    pub fn join(mut self) -> Result<(), VideoError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| VideoError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::{Muxer, VideoFormat};
    use crate::pacing::{PacingMode, SpeedController};
    use moviekit_codec::{BufferInfo, MIME_RAW, RecordingSink, SoftwareCodecFactory};
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl FrameCallback for Recorder {
        fn pre_render(&mut self, presentation_time_us: i64) {
            self.events.lock().unwrap().push(format!("pre {presentation_time_us}"));
        }

        fn post_render(&mut self) {
            self.events.lock().unwrap().push("post".into());
        }

        fn loop_reset(&mut self) {
            self.events.lock().unwrap().push("loop".into());
        }
    }

    /// Slows playback down so a stop request lands mid-stream.
    struct Sleepy;

    impl FrameCallback for Sleepy {
        fn pre_render(&mut self, _presentation_time_us: i64) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn write_raw_movie_at(path: &Path, times: &[i64]) {
        let mut muxer = Muxer::create(path, VideoFormat::Mp4).unwrap();
        muxer.add_track(&MediaFormat::video(MIME_RAW, 2, 1)).unwrap();
        muxer.start().unwrap();
        for (i, &pts) in times.iter().enumerate() {
            let info = BufferInfo {
                offset: 0,
                size: 8,
                presentation_time_us: pts,
                flags: BufferFlags::KEY_FRAME,
            };
            muxer.write_sample_data(0, &[i as u8; 8], &info).unwrap();
        }
        muxer.stop().unwrap();
    }

    fn write_raw_movie(path: &Path, frames: u8) {
        let times: Vec<i64> = (0..frames).map(|i| i64::from(i) * 40_000).collect();
        write_raw_movie_at(path, &times);
    }

    fn player(path: &Path, sink: &Arc<RecordingSink>, callback: impl FrameCallback + 'static) -> MoviePlayer {
        MoviePlayer::new(
            path,
            Arc::new(SoftwareCodecFactory::default()),
            OutputSurface::Sink(sink.clone()),
            callback,
        )
        .unwrap()
    }

    #[test]
    fn missing_source_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = MoviePlayer::new(
            dir.path().join("nope.mp4"),
            Arc::new(SoftwareCodecFactory::default()),
            OutputSurface::Sink(Arc::new(RecordingSink::new())),
            Recorder::default(),
        )
        .unwrap_err();
        assert!(matches!(err, VideoError::NotFound(_)));
    }

    #[test]
    fn plays_every_frame_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        write_raw_movie(&path, 4);

        let sink = Arc::new(RecordingSink::new());
        let recorder = Recorder::default();
        let mut player = player(&path, &sink, recorder.clone());
        assert_eq!(player.video_size(), (2, 1));

        let stats = player.play().unwrap();
        assert_eq!(stats, PlaybackStats { frames_rendered: 4, loops: 0 });
        assert_eq!(sink.timestamps(), vec![0, 40_000, 80_000, 120_000]);
        assert_eq!(sink.frames()[2].pixel(1, 0), Some([2, 2, 2, 2]));
        assert_eq!(
            recorder.events(),
            vec!["pre 0", "post", "pre 40000", "post", "pre 80000", "post", "pre 120000", "post"]
        );
    }

    #[test]
    fn stop_request_ends_looping_playback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        write_raw_movie(&path, 3);

        let sink = Arc::new(RecordingSink::new());
        let player = player(&path, &sink, Sleepy);
        player.set_loop_mode(true);
        let (feedback, results) = ChannelFeedback::new();
        let task = PlayTask::execute(player, feedback).unwrap();

        while sink.len() < 7 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!task.is_stopped());
        task.request_stop();
        task.wait_for_stop();
        assert!(task.is_stopped());

        let stats = results.recv_blocking().unwrap().unwrap();
        assert!(stats.loops >= 2);
        assert!(stats.frames_rendered >= 7);
        // Every loop restarts at the first frame.
        let timestamps = sink.timestamps();
        assert_eq!(&timestamps[..7], &[0, 40_000, 80_000, 0, 40_000, 80_000, 0]);
        task.join().unwrap();
    }

    #[test]
    fn stop_cuts_a_pacing_wait_short() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.mp4");
        write_raw_movie_at(&path, &[0, 4_000_000, 8_000_000]);

        let sink = Arc::new(RecordingSink::new());
        let pacer = SpeedController::new(PacingMode::Timestamps);
        let task = PlayTask::execute(player(&path, &sink, pacer), |_: PlaybackResult| {}).unwrap();

        while sink.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        // The second frame is held back for four seconds.
        let requested = Instant::now();
        task.request_stop();
        task.wait_for_stop();
        assert!(requested.elapsed() < Duration::from_millis(500));
        assert!(sink.len() < 3);
        task.join().unwrap();
    }

    #[test]
    fn closure_feedback_is_called_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        write_raw_movie(&path, 2);

        let sink = Arc::new(RecordingSink::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let task = PlayTask::execute(player(&path, &sink, Recorder::default()), move |result: PlaybackResult| {
            seen.lock().unwrap().push(result.map(|stats| stats.frames_rendered).ok());
        })
        .unwrap();
        task.wait_for_stop();
        task.join().unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![Some(2)]);
    }
}
