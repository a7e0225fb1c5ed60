use crate::muxer::{Muxer, VideoFormat};
use crate::{EncodeError, VideoError};
use moviekit_codec::exchange::{BufferExchange, OutputBuffer, OutputHandler};
use moviekit_codec::format::COLOR_FORMAT_SURFACE;
use moviekit_codec::{
    Canvas, Codec, CodecDirection, CodecError, CodecFactory, MediaFormat, RenderSurface,
    SurfaceBinder,
};
use std::path::Path;

/// Parameters of an encoded movie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Output mime type.
    pub mime: String,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Target bit rate in bits per second.
    pub bit_rate: u32,
    /// Nominal frame rate.
    pub frame_rate: u32,
    /// Seconds between sync frames.
    pub i_frame_interval: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            mime: moviekit_codec::sys::preferred_video_mime().to_owned(),
            width: 320,
            height: 240,
            bit_rate: 2_000_000,
            frame_rate: 30,
            i_frame_interval: 5,
        }
    }
}

impl EncoderConfig {
    fn media_format(&self) -> MediaFormat {
        MediaFormat::video(&self.mime, self.width, self.height)
            .with_color_format(COLOR_FORMAT_SURFACE)
            .with_bit_rate(self.bit_rate)
            .with_frame_rate(self.frame_rate)
            .with_i_frame_interval(self.i_frame_interval)
    }
}

/// Feeds encoder output into the muxer.
struct MuxerSink<'a> {
    muxer: &'a mut Muxer,
    track: &'a mut Option<usize>,
    samples: &'a mut u64,
}

impl OutputHandler for MuxerSink<'_> {
    type Error = EncodeError;

    fn format_changed(&mut self, format: &MediaFormat) -> Result<(), EncodeError> {
        let track = self.muxer.add_track(format)?;
        self.muxer.start()?;
        *self.track = Some(track);
        Ok(())
    }

    fn buffer_ready(&mut self, buffer: &OutputBuffer<'_>) -> Result<bool, EncodeError> {
        if buffer.info.size == 0 {
            return Ok(false);
        }
        let track = self
            .track
            .ok_or_else(|| CodecError::Protocol("muxer hasn't started".into()))?;
        self.muxer
            .write_sample_data(track, buffer.payload(), buffer.info)?;
        *self.samples += 1;
        log::debug!(
            "sent {} bytes to muxer, pts={}us",
            buffer.info.size,
            buffer.info.presentation_time_us
        );
        Ok(false)
    }
}

/// A surface-fed encoder writing into an MP4 file.
///
/// Frames are drawn on [`MovieEncoder::canvas`], submitted with
/// [`MovieEncoder::submit_frame`] and pulled into the muxer by
/// [`MovieEncoder::drain`]. Resources are released on [`MovieEncoder::release`]
/// or drop.
#[derive(Debug)]
pub struct MovieEncoder {
    codec: Option<Box<dyn Codec>>,
    surface: Option<Box<dyn RenderSurface>>,
    muxer: Option<Muxer>,
    track: Option<usize>,
    exchange: BufferExchange,
    samples: u64,
}

impl MovieEncoder {
    /// Create and start an encoder for `config`, writing to `output`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::SoftwareCodecSurface`] or
    /// [`EncodeError::InputSurface`] if the encoder cannot be fed from a
    /// surface, and other errors if the codec or the output file fail.
    pub fn configure(
        factory: &dyn CodecFactory,
        binder: &dyn SurfaceBinder,
        config: &EncoderConfig,
        output: &Path,
    ) -> Result<Self, EncodeError> {
        let format = config.media_format();
        log::info!("configuring encoder: {format}");

        let mut encoder = Self {
            codec: None,
            surface: None,
            muxer: None,
            track: None,
            exchange: BufferExchange::new(CodecDirection::Encode),
            samples: 0,
        };

        let mut codec = factory.create_encoder(&config.mime)?;
        codec.configure(&format, None, CodecDirection::Encode)?;
        let input = match codec.create_input_surface() {
            Ok(input) => input,
            Err(source) => {
                let name = codec.name().to_owned();
                let software = codec.is_software();
                codec.release();
                return Err(if software {
                    EncodeError::SoftwareCodecSurface {
                        codec: name,
                        source,
                    }
                } else {
                    EncodeError::InputSurface(source)
                });
            }
        };
        log::info!("encoder {} created", codec.name());
        encoder.codec = Some(codec);

        let mut surface = binder.bind(input)?;
        surface.make_current()?;
        encoder.surface = Some(surface);

        encoder.codec_mut()?.start()?;
        // Added as a track and started once the encoder reports its format.
        encoder.muxer = Some(Muxer::create(output, VideoFormat::Mp4)?);
        Ok(encoder)
    }

    fn codec_mut(&mut self) -> Result<&mut Box<dyn Codec>, EncodeError> {
        self.codec
            .as_mut()
            .ok_or_else(|| CodecError::InvalidState("encoder was released".into()).into())
    }

    fn surface_mut(&mut self) -> Result<&mut Box<dyn RenderSurface>, EncodeError> {
        self.surface
            .as_mut()
            .ok_or_else(|| CodecError::InvalidState("input surface was released".into()).into())
    }

    /// Drawing target of the next frame.
    ///
    /// # Errors
    ///
    /// Fails after [`MovieEncoder::release`].
    pub fn canvas(&mut self) -> Result<&mut dyn Canvas, EncodeError> {
        Ok(self.surface_mut()?.canvas())
    }

    /// Stamp the drawn frame with `presentation_time_ns` and submit it.
    ///
    /// # Errors
    ///
    /// Fails if the surface rejects the frame.
    pub fn submit_frame(&mut self, presentation_time_ns: i64) -> Result<(), EncodeError> {
        let surface = self.surface_mut()?;
        surface.set_presentation_time(presentation_time_ns);
        surface.swap_buffers()?;
        Ok(())
    }

    /// Move pending encoder output into the muxer. With `end_of_stream`, end
    /// the input and wait for the encoder to finish.
    ///
    /// # Errors
    ///
    /// Fails on codec protocol violations and muxer errors.
    pub fn drain(&mut self, end_of_stream: bool) -> Result<(), EncodeError> {
        let (Some(codec), Some(muxer)) = (self.codec.as_deref_mut(), self.muxer.as_mut()) else {
            return Err(CodecError::InvalidState("encoder was released".into()).into());
        };
        let mut sink = MuxerSink {
            muxer,
            track: &mut self.track,
            samples: &mut self.samples,
        };
        self.exchange.drain(codec, end_of_stream, &mut sink)
    }

    /// Samples written to the muxer so far.
    #[must_use]
    pub const fn samples_written(&self) -> u64 {
        self.samples
    }

    /// Finalize the file and release everything.
    ///
    /// # Errors
    ///
    /// Returns the muxer error if the file cannot be completed.
    pub fn finish(mut self) -> Result<(), EncodeError> {
        let stopped = match self.muxer.as_mut() {
            Some(muxer) if muxer.is_started() => muxer.stop(),
            Some(_) => Err(VideoError::MuxerState(
                "encoder never reported an output format".into(),
            )),
            None => Ok(()),
        };
        self.release();
        stopped.map_err(EncodeError::from)
    }

    /// Stop and release the encoder, the input surface and the muxer. Each is
    /// released independently; safe to call more than once.
    pub fn release(&mut self) {
        log::debug!("releasing encoder objects");
        if let Some(mut codec) = self.codec.take() {
            if let Err(err) = codec.stop() {
                log::warn!("encoder stop failed: {err}");
            }
            codec.release();
        }
        if let Some(mut surface) = self.surface.take() {
            surface.release();
        }
        if let Some(mut muxer) = self.muxer.take() {
            muxer.release();
        }
    }
}

impl Drop for MovieEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
