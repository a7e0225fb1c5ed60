//! The output-draining loop shared by encode and decode pipelines.
//!
//! [`BufferExchange`] polls a codec's output queue and turns its four kinds of
//! outcome (nothing yet, buffers changed, format changed, buffer ready) into
//! calls on an [`OutputHandler`]. Every buffer that is dequeued is released
//! exactly once, after the handler has decided whether to render it.

use crate::{BufferInfo, Codec, CodecDirection, CodecError, MediaFormat, OutputStatus};
use std::time::Duration;

/// Poll timeout used by both pipelines.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

/// A dequeued output buffer as seen by an [`OutputHandler`].
#[derive(Debug, Clone, Copy)]
pub struct OutputBuffer<'a> {
    /// Codec buffer index.
    pub index: usize,
    /// Metadata. Codec-config buffers arrive with `size == 0`.
    pub info: &'a BufferInfo,
    /// Buffer contents; only fetched when encoding.
    pub data: Option<&'a [u8]>,
}

impl OutputBuffer<'_> {
    /// The `offset..offset + size` window of the buffer, empty when no data
    /// was fetched.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.data
            .and_then(|data| data.get(self.info.offset..self.info.offset + self.info.size))
            .unwrap_or_default()
    }
}

/// Receives the events of a [`BufferExchange`].
pub trait OutputHandler {
    /// Error type of the handler; codec failures convert into it.
    type Error: From<CodecError>;

    /// The codec announced its output format. Called once when encoding;
    /// decoders may announce again, for instance after a flush.
    ///
    /// # Errors
    ///
    /// Any error aborts the exchange.
    fn format_changed(&mut self, format: &MediaFormat) -> Result<(), Self::Error> {
        let _ = format;
        Ok(())
    }

    /// A buffer is ready. Returns whether it should be rendered on release.
    ///
    /// # Errors
    ///
    /// Any error aborts the exchange; the buffer is still released.
    fn buffer_ready(&mut self, buffer: &OutputBuffer<'_>) -> Result<bool, Self::Error>;
}

/// Outcome of a single [`BufferExchange::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// Nothing was available within the timeout.
    Empty,
    /// The codec replaced its output buffers.
    BuffersChanged,
    /// The output format was announced.
    FormatChanged,
    /// A buffer was handled and released.
    Buffer {
        /// Whether it was released with `render = true`.
        rendered: bool,
        /// Whether it carried the end-of-stream flag.
        end_of_stream: bool,
    },
    /// An unknown status was reported and ignored.
    Ignored(i64),
}

/// Output side of the codec buffer-exchange protocol.
#[derive(Debug)]
pub struct BufferExchange {
    direction: CodecDirection,
    info: BufferInfo,
    timeout: Duration,
    format_seen: bool,
}

impl BufferExchange {
    /// Exchange for a codec working in `direction`.
    #[must_use]
    pub const fn new(direction: CodecDirection) -> Self {
        Self {
            direction,
            info: BufferInfo {
                offset: 0,
                size: 0,
                presentation_time_us: 0,
                flags: crate::BufferFlags::NONE,
            },
            timeout: DEFAULT_TIMEOUT,
            format_seen: false,
        }
    }

    /// Use a different poll timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True once the output format has been announced.
    #[must_use]
    pub const fn format_seen(&self) -> bool {
        self.format_seen
    }

    /// Dequeue one output event and dispatch it to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Protocol`] if an encoder announces its format
    /// twice, if an encoded sample precedes the format, or if a ready buffer
    /// cannot be read.
    /// Handler errors are passed through.
    pub fn poll<H: OutputHandler>(
        &mut self,
        codec: &mut dyn Codec,
        handler: &mut H,
    ) -> Result<PollEvent, H::Error> {
        match codec.dequeue_output_buffer(&mut self.info, self.timeout) {
            OutputStatus::TryAgainLater => Ok(PollEvent::Empty),
            OutputStatus::BuffersChanged => {
                // Buffers are looked up by index on every access.
                log::debug!("{}: output buffers changed", codec.name());
                Ok(PollEvent::BuffersChanged)
            }
            OutputStatus::FormatChanged => {
                if self.format_seen {
                    if self.direction == CodecDirection::Encode {
                        return Err(CodecError::Protocol(format!(
                            "{} changed its output format twice",
                            codec.name()
                        ))
                        .into());
                    }
                    log::warn!("{}: decoder announced its output format again", codec.name());
                }
                self.format_seen = true;
                let format = codec.output_format()?;
                log::info!("{}: output format {format}", codec.name());
                handler.format_changed(&format)?;
                Ok(PollEvent::FormatChanged)
            }
            OutputStatus::Buffer(index) => self.dispatch(codec, index, handler),
            OutputStatus::Unknown(code) => {
                log::warn!(
                    "{}: unexpected status from dequeue_output_buffer: {code}",
                    codec.name()
                );
                Ok(PollEvent::Ignored(code))
            }
        }
    }

    fn dispatch<H: OutputHandler>(
        &self,
        codec: &mut dyn Codec,
        index: usize,
        handler: &mut H,
    ) -> Result<PollEvent, H::Error> {
        let mut info = self.info;
        if info.is_codec_config() {
            // Codec data was delivered with the format change.
            log::debug!("{}: ignoring codec config buffer", codec.name());
            info.size = 0;
        }

        let outcome = self.hand_over(codec, index, &info, handler);
        let render = match outcome {
            Ok(render) => render,
            Err(err) => {
                if let Err(release) = codec.release_output_buffer(index, false) {
                    log::warn!("{}: releasing buffer {index}: {release}", codec.name());
                }
                return Err(err);
            }
        };
        codec.release_output_buffer(index, render)?;

        log::debug!(
            "{}: buffer {index} size={} pts={}us rendered={render}",
            codec.name(),
            info.size,
            info.presentation_time_us
        );
        Ok(PollEvent::Buffer {
            rendered: render,
            end_of_stream: info.is_end_of_stream(),
        })
    }

    fn hand_over<H: OutputHandler>(
        &self,
        codec: &dyn Codec,
        index: usize,
        info: &BufferInfo,
        handler: &mut H,
    ) -> Result<bool, H::Error> {
        let data = match self.direction {
            CodecDirection::Encode => {
                if info.size != 0 && !self.format_seen {
                    return Err(CodecError::Protocol(format!(
                        "{} produced a sample before its output format",
                        codec.name()
                    ))
                    .into());
                }
                Some(codec.output_buffer(index).ok_or_else(|| {
                    CodecError::Protocol(format!(
                        "{}: output buffer {index} is missing",
                        codec.name()
                    ))
                })?)
            }
            CodecDirection::Decode => None,
        };
        handler.buffer_ready(&OutputBuffer { index, info, data })
    }

    /// Pull all pending output. With `end_of_stream`, first signal end of
    /// input and keep polling until the terminal buffer arrives.
    ///
    /// # Errors
    ///
    /// See [`BufferExchange::poll`].
    pub fn drain<H: OutputHandler>(
        &mut self,
        codec: &mut dyn Codec,
        end_of_stream: bool,
        handler: &mut H,
    ) -> Result<(), H::Error> {
        if end_of_stream {
            log::debug!("{}: signaling end of input", codec.name());
            codec.signal_end_of_input()?;
        }
        loop {
            match self.poll(codec, handler)? {
                PollEvent::Empty if !end_of_stream => return Ok(()),
                PollEvent::Buffer {
                    end_of_stream: true,
                    ..
                } => {
                    if end_of_stream {
                        log::debug!("{}: end of stream reached", codec.name());
                    } else {
                        log::warn!("{}: reached end of stream unexpectedly", codec.name());
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{InputSurface, OutputSurface};
    use crate::BufferFlags;
    use std::collections::{HashMap, VecDeque};

    /// Replays a fixed sequence of dequeue outcomes.
    #[derive(Default)]
    struct ScriptedCodec {
        script: VecDeque<(OutputStatus, BufferInfo)>,
        buffers: HashMap<usize, Vec<u8>>,
        released: Vec<(usize, bool)>,
        end_of_input: bool,
        polls: usize,
    }

    impl ScriptedCodec {
        fn status(mut self, status: OutputStatus) -> Self {
            self.script.push_back((status, BufferInfo::default()));
            self
        }

        fn buffer(mut self, index: usize, data: &[u8], pts: i64, flags: BufferFlags) -> Self {
            let mut info = BufferInfo::default();
            info.set(0, data.len(), pts, flags);
            self.buffers.insert(index, data.to_vec());
            self.script.push_back((OutputStatus::Buffer(index), info));
            self
        }
    }

    impl Codec for ScriptedCodec {
        fn name(&self) -> &str {
            "scripted"
        }

        fn is_software(&self) -> bool {
            true
        }

        fn configure(
            &mut self,
            _format: &MediaFormat,
            _surface: Option<OutputSurface>,
            _direction: CodecDirection,
        ) -> Result<(), CodecError> {
            Ok(())
        }

        fn create_input_surface(&mut self) -> Result<InputSurface, CodecError> {
            Err(CodecError::Unsupported("scripted".into()))
        }

        fn start(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn stop(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), CodecError> {
            Ok(())
        }

        fn release(&mut self) {}

        fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
            self.end_of_input = true;
            Ok(())
        }

        fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
            Ok(None)
        }

        fn input_buffer(&mut self, _index: usize) -> Option<&mut [u8]> {
            None
        }

        fn queue_input_buffer(
            &mut self,
            _index: usize,
            _offset: usize,
            _size: usize,
            _presentation_time_us: i64,
            _flags: BufferFlags,
        ) -> Result<(), CodecError> {
            Ok(())
        }

        fn dequeue_output_buffer(&mut self, info: &mut BufferInfo, _timeout: Duration) -> OutputStatus {
            self.polls += 1;
            match self.script.pop_front() {
                Some((status, scripted)) => {
                    *info = scripted;
                    status
                }
                None => OutputStatus::TryAgainLater,
            }
        }

        fn output_buffer(&self, index: usize) -> Option<&[u8]> {
            self.buffers.get(&index).map(Vec::as_slice)
        }

        fn output_format(&self) -> Result<MediaFormat, CodecError> {
            Ok(MediaFormat::video("video/test", 2, 2))
        }

        fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
            self.released.push((index, render));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        formats: usize,
        samples: Vec<(usize, Vec<u8>, i64)>,
        render: bool,
    }

    impl OutputHandler for Recorder {
        type Error = CodecError;

        fn format_changed(&mut self, _format: &MediaFormat) -> Result<(), CodecError> {
            self.formats += 1;
            Ok(())
        }

        fn buffer_ready(&mut self, buffer: &OutputBuffer<'_>) -> Result<bool, CodecError> {
            self.samples.push((
                buffer.info.size,
                buffer.payload().to_vec(),
                buffer.info.presentation_time_us,
            ));
            Ok(self.render)
        }
    }

    #[test]
    fn encode_drain_stops_when_nothing_is_pending() {
        let mut codec = ScriptedCodec::default()
            .status(OutputStatus::FormatChanged)
            .buffer(0, b"cfg", 0, BufferFlags::CODEC_CONFIG)
            .buffer(1, b"frame", 100, BufferFlags::KEY_FRAME)
            .status(OutputStatus::TryAgainLater)
            .buffer(2, b"later", 200, BufferFlags::NONE);
        let mut exchange = BufferExchange::new(CodecDirection::Encode);
        let mut recorder = Recorder::default();

        exchange.drain(&mut codec, false, &mut recorder).unwrap();

        assert_eq!(recorder.formats, 1);
        assert_eq!(recorder.samples[0], (0, Vec::new(), 0));
        assert_eq!(recorder.samples[1], (5, b"frame".to_vec(), 100));
        assert_eq!(recorder.samples.len(), 2);
        assert_eq!(codec.released, vec![(0, false), (1, false)]);
        assert!(!codec.end_of_input);
    }

    #[test]
    fn end_of_stream_drain_spins_until_terminal_buffer() {
        let mut codec = ScriptedCodec::default()
            .status(OutputStatus::FormatChanged)
            .status(OutputStatus::TryAgainLater)
            .status(OutputStatus::BuffersChanged)
            .status(OutputStatus::TryAgainLater)
            .buffer(3, b"", 0, BufferFlags::END_OF_STREAM);
        let mut exchange = BufferExchange::new(CodecDirection::Encode);
        let mut recorder = Recorder::default();

        exchange.drain(&mut codec, true, &mut recorder).unwrap();

        assert!(codec.end_of_input);
        assert_eq!(codec.polls, 5);
        assert_eq!(codec.released, vec![(3, false)]);
    }

    #[test]
    fn second_format_change_is_fatal() {
        let mut codec = ScriptedCodec::default()
            .status(OutputStatus::FormatChanged)
            .status(OutputStatus::FormatChanged);
        let mut exchange = BufferExchange::new(CodecDirection::Encode);
        let mut recorder = Recorder::default();

        let err = exchange.drain(&mut codec, false, &mut recorder).unwrap_err();
        assert!(matches!(err, CodecError::Protocol(_)));
        assert_eq!(recorder.formats, 1);
    }

    #[test]
    fn decoder_may_announce_format_again() {
        let mut codec = ScriptedCodec::default()
            .status(OutputStatus::FormatChanged)
            .buffer(0, b"", 0, BufferFlags::NONE)
            .status(OutputStatus::FormatChanged)
            .buffer(1, b"", 40, BufferFlags::END_OF_STREAM);
        let mut exchange = BufferExchange::new(CodecDirection::Decode);
        let mut recorder = Recorder::default();

        exchange.drain(&mut codec, false, &mut recorder).unwrap();
        assert_eq!(recorder.formats, 2);
        assert_eq!(codec.released, vec![(0, false), (1, false)]);
    }

    #[test]
    fn encoded_sample_before_format_is_fatal_and_released() {
        let mut codec =
            ScriptedCodec::default().buffer(0, b"early", 0, BufferFlags::KEY_FRAME);
        let mut exchange = BufferExchange::new(CodecDirection::Encode);
        let mut recorder = Recorder::default();

        let err = exchange.drain(&mut codec, false, &mut recorder).unwrap_err();
        assert!(matches!(err, CodecError::Protocol(_)));
        assert!(recorder.samples.is_empty());
        assert_eq!(codec.released, vec![(0, false)]);
    }

    #[test]
    fn unknown_status_is_ignored() {
        let mut codec = ScriptedCodec::default()
            .status(OutputStatus::Unknown(-1000))
            .status(OutputStatus::FormatChanged);
        let mut exchange = BufferExchange::new(CodecDirection::Decode);
        let mut recorder = Recorder::default();

        assert_eq!(
            exchange.poll(&mut codec, &mut recorder).unwrap(),
            PollEvent::Ignored(-1000)
        );
        assert_eq!(
            exchange.poll(&mut codec, &mut recorder).unwrap(),
            PollEvent::FormatChanged
        );
        assert!(exchange.format_seen());
    }

    #[test]
    fn decode_buffers_carry_no_data_and_honor_render_decision() {
        let mut codec = ScriptedCodec::default()
            .buffer(4, b"pixels", 42, BufferFlags::NONE)
            .buffer(5, b"", 43, BufferFlags::END_OF_STREAM);
        let mut exchange = BufferExchange::new(CodecDirection::Decode);
        let mut recorder = Recorder {
            render: true,
            ..Recorder::default()
        };

        assert_eq!(
            exchange.poll(&mut codec, &mut recorder).unwrap(),
            PollEvent::Buffer {
                rendered: true,
                end_of_stream: false
            }
        );
        assert_eq!(recorder.samples[0], (6, Vec::new(), 42));

        exchange.drain(&mut codec, false, &mut recorder).unwrap();
        assert_eq!(codec.released, vec![(4, true), (5, true)]);
    }
}
