//! Software codec for uncompressed RGBA video (`video/raw`).
//!
//! The codec performs no compression, but it follows the buffer-exchange
//! protocol of a hardware codec: it announces its output format only after
//! the first frame, emits a codec-config buffer ahead of media data, holds a
//! configurable number of frames in flight, bounds its input and output
//! queues and terminates the stream with an empty end-of-stream buffer.
//!
//! Output never requires waiting, so dequeue timeouts are ignored.

use crate::format::{COLOR_FORMAT_RGBA, COLOR_FORMAT_SURFACE, MIME_RAW};
use crate::surface::{
    Canvas, Color, DecodedFrame, FrameSink, InputSurface, OutputSurface, Rect, RenderSurface,
    SurfaceBinder,
};
use crate::{
    BufferFlags, BufferInfo, Codec, CodecDirection, CodecError, CodecFactory, MediaFormat,
    OutputStatus,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Status returned when output is polled outside the running state.
const STATUS_INVALID_OPERATION: i64 = -38;

const CONFIG_MAGIC: &[u8; 4] = b"RGBA";

/// Queue sizes and latency of the software codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftwareCodecOptions {
    /// Input buffers (decoder) or queued surface frames (encoder).
    pub input_buffers: usize,
    /// Output buffers the client may hold at once.
    pub output_buffers: usize,
    /// Frames the encoder keeps before emitting output.
    pub encoder_latency: usize,
}

impl Default for SoftwareCodecOptions {
    fn default() -> Self {
        Self {
            input_buffers: 4,
            output_buffers: 4,
            encoder_latency: 2,
        }
    }
}

/// Creates software codecs for [`MIME_RAW`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareCodecFactory {
    options: SoftwareCodecOptions,
}

impl SoftwareCodecFactory {
    /// Factory producing codecs with the given options.
    #[must_use]
    pub const fn new(options: SoftwareCodecOptions) -> Self {
        Self { options }
    }

    /// Options handed to every codec.
    #[must_use]
    pub const fn options(&self) -> SoftwareCodecOptions {
        self.options
    }
}

fn check_mime(mime: &str) -> Result<(), CodecError> {
    if mime == MIME_RAW {
        Ok(())
    } else {
        Err(CodecError::Unsupported(format!(
            "software codec cannot handle {mime}"
        )))
    }
}

impl CodecFactory for SoftwareCodecFactory {
    fn create_encoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError> {
        check_mime(mime)?;
        Ok(Box::new(SoftwareCodec::new(
            CodecDirection::Encode,
            self.options,
        )))
    }

    fn create_decoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError> {
        check_mime(mime)?;
        Ok(Box::new(SoftwareCodec::new(
            CodecDirection::Decode,
            self.options,
        )))
    }
}

/// Codec-specific data: magic followed by big-endian width and height.
fn config_record(width: u32, height: u32) -> Vec<u8> {
    let mut record = Vec::with_capacity(12);
    record.extend_from_slice(CONFIG_MAGIC);
    record.extend_from_slice(&width.to_be_bytes());
    record.extend_from_slice(&height.to_be_bytes());
    record
}

fn parse_config_record(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() != 12 || &data[..4] != CONFIG_MAGIC {
        return None;
    }
    let width = u32::from_be_bytes(data[4..8].try_into().ok()?);
    let height = u32::from_be_bytes(data[8..12].try_into().ok()?);
    Some((width, height))
}

struct RawFrame {
    pixels: Vec<u8>,
    presentation_time_us: i64,
}

#[derive(Default)]
struct InputQueue {
    frames: VecDeque<RawFrame>,
    capacity: usize,
    end_of_stream: bool,
    closed: bool,
}

/// Frame queue connecting a [`SoftwareSurface`] to the software encoder.
#[derive(Clone)]
pub struct SoftwareInput {
    shared: Arc<Mutex<InputQueue>>,
    width: u32,
    height: u32,
}

impl SoftwareInput {
    fn new(width: u32, height: u32, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(InputQueue {
                capacity: capacity.max(1),
                ..InputQueue::default()
            })),
            width,
            height,
        }
    }

    /// Frame size expected by the encoder.
    #[must_use]
    pub const fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Frames submitted but not yet taken by the encoder.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().frames.len()
    }

    fn lock(&self) -> MutexGuard<'_, InputQueue> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, frame: RawFrame) -> Result<(), CodecError> {
        let mut queue = self.lock();
        if queue.closed {
            return Err(CodecError::Surface("input surface was released".into()));
        }
        if queue.end_of_stream {
            return Err(CodecError::InvalidState(
                "frame submitted after end of input".into(),
            ));
        }
        if queue.frames.len() >= queue.capacity {
            return Err(CodecError::Surface(
                "encoder input is full; drain output before submitting".into(),
            ));
        }
        queue.frames.push_back(frame);
        Ok(())
    }

    fn pop(&self) -> Option<RawFrame> {
        self.lock().frames.pop_front()
    }

    fn signal_end_of_stream(&self) {
        self.lock().end_of_stream = true;
    }

    fn end_of_stream(&self) -> bool {
        let queue = self.lock();
        queue.end_of_stream && queue.frames.is_empty()
    }

    fn close(&self) {
        let mut queue = self.lock();
        queue.closed = true;
        queue.frames.clear();
    }
}

impl fmt::Debug for SoftwareInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareInput")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pending", &self.pending())
            .finish()
    }
}

/// CPU rendering context writing into a [`SoftwareInput`].
pub struct SoftwareSurface {
    input: SoftwareInput,
    pixels: Vec<u8>,
    clear_color: [u8; 4],
    scissor: Option<Rect>,
    presentation_time_ns: i64,
    released: bool,
}

impl SoftwareSurface {
    /// Create a surface drawing frames for `input`.
    #[must_use]
    pub fn new(input: SoftwareInput) -> Self {
        let (width, height) = input.size();
        Self {
            input,
            pixels: vec![0; width as usize * height as usize * 4],
            clear_color: Color::BLACK.to_rgba8(),
            scissor: None,
            presentation_time_ns: 0,
            released: false,
        }
    }

    /// Current frame contents, rows top to bottom.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl fmt::Debug for SoftwareSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareSurface")
            .field("input", &self.input)
            .field("presentation_time_ns", &self.presentation_time_ns)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Canvas for SoftwareSurface {
    fn size(&self) -> (u32, u32) {
        self.input.size()
    }

    fn set_clear_color(&mut self, color: Color) {
        self.clear_color = color.to_rgba8();
    }

    fn set_scissor(&mut self, rect: Option<Rect>) {
        self.scissor = rect;
    }

    fn clear(&mut self) {
        let (width, height) = self.input.size();
        let (w, h) = (i64::from(width), i64::from(height));
        let (x0, y0, x1, y1) = match self.scissor {
            Some(rect) => {
                let x = i64::from(rect.x);
                let y = i64::from(rect.y);
                (
                    x.clamp(0, w),
                    y.clamp(0, h),
                    (x + i64::from(rect.width)).clamp(0, w),
                    (y + i64::from(rect.height)).clamp(0, h),
                )
            }
            None => (0, 0, w, h),
        };
        // Surface coordinates grow upwards; rows are stored top to bottom.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        for gl_y in y0..y1 {
            let row = (h - 1 - gl_y) as usize;
            let start = (row * width as usize + x0 as usize) * 4;
            let end = (row * width as usize + x1 as usize) * 4;
            for px in self.pixels[start..end].chunks_exact_mut(4) {
                px.copy_from_slice(&self.clear_color);
            }
        }
    }
}

impl RenderSurface for SoftwareSurface {
    fn make_current(&mut self) -> Result<(), CodecError> {
        if self.released {
            return Err(CodecError::Surface("surface was released".into()));
        }
        Ok(())
    }

    fn canvas(&mut self) -> &mut dyn Canvas {
        self
    }

    fn set_presentation_time(&mut self, nsecs: i64) {
        self.presentation_time_ns = nsecs;
    }

    fn swap_buffers(&mut self) -> Result<(), CodecError> {
        if self.released {
            return Err(CodecError::Surface("surface was released".into()));
        }
        self.input.push(RawFrame {
            pixels: self.pixels.clone(),
            presentation_time_us: self.presentation_time_ns / 1000,
        })
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.input.close();
        }
    }
}

/// Binds software input surfaces to [`SoftwareSurface`] contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareBinder;

impl SurfaceBinder for SoftwareBinder {
    fn bind(&self, surface: InputSurface) -> Result<Box<dyn RenderSurface>, CodecError> {
        match surface {
            InputSurface::Software(input) => Ok(Box::new(SoftwareSurface::new(input))),
            #[cfg(target_os = "android")]
            InputSurface::Window(_) => Err(CodecError::Unsupported(
                "software binder cannot drive a native window".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Configured,
    Running,
    Released,
}

struct Packet {
    data: Vec<u8>,
    presentation_time_us: i64,
    flags: BufferFlags,
}

enum Event {
    FormatChanged,
    Buffer(Packet),
}

struct InputSlot {
    data: Vec<u8>,
    dequeued: bool,
}

/// A software codec instance. See the module documentation.
pub struct SoftwareCodec {
    direction: CodecDirection,
    options: SoftwareCodecOptions,
    state: State,
    format: Option<MediaFormat>,
    output_format: Option<MediaFormat>,
    input: Option<SoftwareInput>,
    sink: Option<Arc<dyn FrameSink>>,
    input_slots: Vec<InputSlot>,
    free_inputs: VecDeque<usize>,
    queued: VecDeque<Packet>,
    in_flight: VecDeque<RawFrame>,
    events: VecDeque<Event>,
    outputs: Vec<Option<Packet>>,
    format_announced: bool,
    config_sent: bool,
    input_done: bool,
    eos_sent: bool,
    last_pts_us: i64,
}

impl fmt::Debug for SoftwareCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareCodec")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("format", &self.format)
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl SoftwareCodec {
    /// Create an unconfigured codec.
    #[must_use]
    pub fn new(direction: CodecDirection, options: SoftwareCodecOptions) -> Self {
        Self {
            direction,
            options,
            state: State::Uninitialized,
            format: None,
            output_format: None,
            input: None,
            sink: None,
            input_slots: Vec::new(),
            free_inputs: VecDeque::new(),
            queued: VecDeque::new(),
            in_flight: VecDeque::new(),
            events: VecDeque::new(),
            outputs: Vec::new(),
            format_announced: false,
            config_sent: false,
            input_done: false,
            eos_sent: false,
            last_pts_us: 0,
        }
    }

    fn require(&self, state: State, op: &str) -> Result<(), CodecError> {
        if self.state == state {
            Ok(())
        } else {
            Err(CodecError::InvalidState(format!(
                "{op} called in state {:?}",
                self.state
            )))
        }
    }

    fn configured_format(&self) -> Result<&MediaFormat, CodecError> {
        self.format
            .as_ref()
            .ok_or_else(|| CodecError::InvalidState("codec is not configured".into()))
    }

    fn reset_stream(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
        self.events.clear();
        self.outputs.iter_mut().for_each(|slot| *slot = None);
        self.free_inputs = (0..self.input_slots.len()).collect();
        for slot in &mut self.input_slots {
            slot.dequeued = false;
        }
        self.input_done = false;
        self.eos_sent = false;
    }

    fn announce_format(&mut self) {
        if self.format_announced {
            return;
        }
        if let Some(format) = &self.format {
            let mut output = format.clone();
            output.color_format = Some(COLOR_FORMAT_RGBA);
            output.csd = vec![config_record(format.width, format.height)];
            self.output_format = Some(output);
        }
        self.events.push_back(Event::FormatChanged);
        self.format_announced = true;
    }

    fn push_end_of_stream(&mut self) {
        self.events.push_back(Event::Buffer(Packet {
            data: Vec::new(),
            presentation_time_us: self.last_pts_us,
            flags: BufferFlags::END_OF_STREAM,
        }));
        self.eos_sent = true;
    }

    /// Move work from the input side to the output event queue.
    fn pump(&mut self) {
        match self.direction {
            CodecDirection::Encode => self.pump_encoder(),
            CodecDirection::Decode => self.pump_decoder(),
        }
    }

    fn pump_encoder(&mut self) {
        let Some(input) = self.input.clone() else {
            return;
        };
        while let Some(frame) = input.pop() {
            self.in_flight.push_back(frame);
        }
        if input.end_of_stream() {
            self.input_done = true;
        }
        let hold = if self.input_done {
            0
        } else {
            self.options.encoder_latency
        };
        while self.in_flight.len() > hold {
            let Some(frame) = self.in_flight.pop_front() else {
                break;
            };
            self.announce_format();
            if !self.config_sent {
                let (width, height) = input.size();
                self.events.push_back(Event::Buffer(Packet {
                    data: config_record(width, height),
                    presentation_time_us: 0,
                    flags: BufferFlags::CODEC_CONFIG,
                }));
                self.config_sent = true;
            }
            self.last_pts_us = frame.presentation_time_us;
            self.events.push_back(Event::Buffer(Packet {
                data: frame.pixels,
                presentation_time_us: frame.presentation_time_us,
                flags: BufferFlags::KEY_FRAME,
            }));
        }
        if self.input_done && self.in_flight.is_empty() && !self.eos_sent {
            self.push_end_of_stream();
        }
    }

    fn pump_decoder(&mut self) {
        let expected = self.format.as_ref().map_or(0, MediaFormat::rgba_frame_len);
        while let Some(packet) = self.queued.pop_front() {
            if packet.flags.contains(BufferFlags::CODEC_CONFIG) {
                if parse_config_record(&packet.data).is_none() {
                    log::warn!("software decoder ignored malformed codec config");
                }
                continue;
            }
            if packet.flags.contains(BufferFlags::END_OF_STREAM) && packet.data.is_empty() {
                self.push_end_of_stream();
                continue;
            }
            if packet.data.len() != expected {
                log::warn!(
                    "software decoder dropped sample of {} bytes, expected {expected}",
                    packet.data.len()
                );
                continue;
            }
            self.announce_format();
            self.last_pts_us = packet.presentation_time_us;
            let end_of_stream = packet.flags.contains(BufferFlags::END_OF_STREAM);
            self.events.push_back(Event::Buffer(Packet {
                flags: BufferFlags::from_bits(
                    packet.flags.bits() & !BufferFlags::END_OF_STREAM.bits(),
                ),
                ..packet
            }));
            if end_of_stream {
                self.push_end_of_stream();
            }
        }
    }
}

impl Codec for SoftwareCodec {
    fn name(&self) -> &str {
        match self.direction {
            CodecDirection::Encode => "sw.raw.encoder",
            CodecDirection::Decode => "sw.raw.decoder",
        }
    }

    fn is_software(&self) -> bool {
        true
    }

    fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<OutputSurface>,
        direction: CodecDirection,
    ) -> Result<(), CodecError> {
        self.require(State::Uninitialized, "configure")?;
        if direction != self.direction {
            return Err(CodecError::Configuration(format!(
                "{} cannot be configured for {direction:?}",
                self.name()
            )));
        }
        check_mime(&format.mime)?;
        if format.width == 0 || format.height == 0 {
            return Err(CodecError::Configuration(format!(
                "invalid frame size {}x{}",
                format.width, format.height
            )));
        }
        match direction {
            CodecDirection::Encode => {
                if format.color_format != Some(COLOR_FORMAT_SURFACE) {
                    return Err(CodecError::Configuration(
                        "software encoder only accepts surface input".into(),
                    ));
                }
            }
            CodecDirection::Decode => {
                if let Some(csd) = format.csd.first() {
                    let declared = parse_config_record(csd).ok_or_else(|| {
                        CodecError::Configuration("malformed codec-specific data".into())
                    })?;
                    if declared != (format.width, format.height) {
                        return Err(CodecError::Configuration(format!(
                            "codec data declares {}x{}, format declares {}x{}",
                            declared.0, declared.1, format.width, format.height
                        )));
                    }
                }
                self.sink = match surface {
                    Some(OutputSurface::Sink(sink)) => Some(sink),
                    #[cfg(target_os = "android")]
                    Some(OutputSurface::Window(_)) => {
                        return Err(CodecError::Unsupported(
                            "software decoder cannot render to a native window".into(),
                        ));
                    }
                    None => None,
                };
                let capacity = format
                    .max_input_size
                    .unwrap_or(0)
                    .max(format.rgba_frame_len());
                self.input_slots = (0..self.options.input_buffers.max(1))
                    .map(|_| InputSlot {
                        data: vec![0; capacity],
                        dequeued: false,
                    })
                    .collect();
            }
        }
        self.outputs = (0..self.options.output_buffers.max(1))
            .map(|_| None)
            .collect();
        self.format = Some(format.clone());
        self.reset_stream();
        self.state = State::Configured;
        log::debug!("{} configured: {format}", self.name());
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<InputSurface, CodecError> {
        self.require(State::Configured, "create_input_surface")?;
        if self.direction != CodecDirection::Encode || self.input.is_some() {
            return Err(CodecError::InvalidState(
                "input surface is only available once, on encoders".into(),
            ));
        }
        let format = self.configured_format()?;
        let input = SoftwareInput::new(format.width, format.height, self.options.input_buffers);
        self.input = Some(input.clone());
        Ok(InputSurface::Software(input))
    }

    fn start(&mut self) -> Result<(), CodecError> {
        self.require(State::Configured, "start")?;
        self.state = State::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        if matches!(self.state, State::Released | State::Uninitialized) {
            return Ok(());
        }
        self.reset_stream();
        if let Some(input) = self.input.take() {
            input.close();
        }
        self.sink = None;
        self.format = None;
        self.output_format = None;
        self.format_announced = false;
        self.config_sent = false;
        self.state = State::Uninitialized;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.require(State::Running, "flush")?;
        self.reset_stream();
        Ok(())
    }

    fn release(&mut self) {
        if self.state == State::Released {
            return;
        }
        if let Some(input) = self.input.take() {
            input.close();
        }
        self.reset_stream();
        self.sink = None;
        self.state = State::Released;
    }

    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        self.require(State::Running, "signal_end_of_input")?;
        let input = self.input.as_ref().ok_or_else(|| {
            CodecError::InvalidState("end of input needs an input surface".into())
        })?;
        input.signal_end_of_stream();
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        self.require(State::Running, "dequeue_input_buffer")?;
        if self.direction == CodecDirection::Encode {
            return Err(CodecError::InvalidState(
                "encoder is fed through its input surface".into(),
            ));
        }
        let index = self.free_inputs.pop_front();
        if let Some(index) = index {
            self.input_slots[index].dequeued = true;
        }
        Ok(index)
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]> {
        self.input_slots
            .get_mut(index)
            .filter(|slot| slot.dequeued)
            .map(|slot| slot.data.as_mut_slice())
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        self.require(State::Running, "queue_input_buffer")?;
        if self.input_done {
            return Err(CodecError::InvalidState(
                "input queued after end of stream".into(),
            ));
        }
        let slot = self
            .input_slots
            .get_mut(index)
            .filter(|slot| slot.dequeued)
            .ok_or_else(|| CodecError::InvalidState(format!("input buffer {index} not dequeued")))?;
        let data = slot
            .data
            .get(offset..offset + size)
            .ok_or_else(|| {
                CodecError::Configuration(format!(
                    "range {offset}+{size} exceeds input buffer of {} bytes",
                    slot.data.len()
                ))
            })?
            .to_vec();
        slot.dequeued = false;
        self.free_inputs.push_back(index);
        if flags.contains(BufferFlags::END_OF_STREAM) {
            self.input_done = true;
        }
        self.queued.push_back(Packet {
            data,
            presentation_time_us,
            flags,
        });
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, info: &mut BufferInfo, _timeout: Duration) -> OutputStatus {
        if self.state != State::Running {
            return OutputStatus::Unknown(STATUS_INVALID_OPERATION);
        }
        self.pump();
        match self.events.front() {
            None => OutputStatus::TryAgainLater,
            Some(Event::FormatChanged) => {
                self.events.pop_front();
                OutputStatus::FormatChanged
            }
            Some(Event::Buffer(_)) => {
                let Some(index) = self.outputs.iter().position(Option::is_none) else {
                    return OutputStatus::TryAgainLater;
                };
                let Some(Event::Buffer(packet)) = self.events.pop_front() else {
                    return OutputStatus::TryAgainLater;
                };
                info.set(
                    0,
                    packet.data.len(),
                    packet.presentation_time_us,
                    packet.flags,
                );
                self.outputs[index] = Some(packet);
                OutputStatus::Buffer(index)
            }
        }
    }

    fn output_buffer(&self, index: usize) -> Option<&[u8]> {
        self.outputs
            .get(index)?
            .as_ref()
            .map(|packet| packet.data.as_slice())
    }

    fn output_format(&self) -> Result<MediaFormat, CodecError> {
        self.output_format
            .clone()
            .ok_or_else(|| CodecError::InvalidState("output format not known yet".into()))
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        let packet = self
            .outputs
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| {
                CodecError::InvalidState(format!("output buffer {index} not dequeued"))
            })?;
        if render && self.direction == CodecDirection::Decode && !packet.data.is_empty() {
            if let (Some(sink), Some(format)) = (&self.sink, &self.format) {
                sink.render(&DecodedFrame {
                    data: Arc::new(packet.data),
                    width: format.width,
                    height: format.height,
                    presentation_time_us: packet.presentation_time_us,
                });
            }
        }
        Ok(())
    }
}

impl Drop for SoftwareCodec {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::RecordingSink;

    const TIMEOUT: Duration = Duration::from_millis(10);

    fn encoder(options: SoftwareCodecOptions) -> (Box<dyn Codec>, Box<dyn RenderSurface>) {
        let mut codec = SoftwareCodecFactory::new(options)
            .create_encoder(MIME_RAW)
            .unwrap();
        let format = MediaFormat::video(MIME_RAW, 4, 2).with_color_format(COLOR_FORMAT_SURFACE);
        codec
            .configure(&format, None, CodecDirection::Encode)
            .unwrap();
        let surface = SoftwareBinder
            .bind(codec.create_input_surface().unwrap())
            .unwrap();
        codec.start().unwrap();
        (codec, surface)
    }

    fn next(codec: &mut dyn Codec, info: &mut BufferInfo) -> OutputStatus {
        codec.dequeue_output_buffer(info, TIMEOUT)
    }

    #[test]
    fn encoder_announces_format_after_latency() {
        let options = SoftwareCodecOptions {
            encoder_latency: 1,
            ..SoftwareCodecOptions::default()
        };
        let (mut codec, mut surface) = encoder(options);
        let mut info = BufferInfo::default();

        surface.set_presentation_time(0);
        surface.swap_buffers().unwrap();
        assert_eq!(next(codec.as_mut(), &mut info), OutputStatus::TryAgainLater);
        assert!(codec.output_format().is_err());

        surface.set_presentation_time(33_000_000);
        surface.swap_buffers().unwrap();
        assert_eq!(next(codec.as_mut(), &mut info), OutputStatus::FormatChanged);
        assert_eq!(codec.output_format().unwrap().csd.len(), 1);

        let OutputStatus::Buffer(config) = next(codec.as_mut(), &mut info) else {
            panic!("expected codec config buffer");
        };
        assert!(info.is_codec_config());
        codec.release_output_buffer(config, false).unwrap();

        let OutputStatus::Buffer(first) = next(codec.as_mut(), &mut info) else {
            panic!("expected first frame");
        };
        assert_eq!(info.presentation_time_us, 0);
        assert_eq!(info.size, 4 * 2 * 4);
        assert!(info.is_key_frame());
        codec.release_output_buffer(first, false).unwrap();
        assert_eq!(next(codec.as_mut(), &mut info), OutputStatus::TryAgainLater);

        codec.signal_end_of_input().unwrap();
        let OutputStatus::Buffer(second) = next(codec.as_mut(), &mut info) else {
            panic!("expected held frame");
        };
        assert_eq!(info.presentation_time_us, 33_000);
        codec.release_output_buffer(second, false).unwrap();
        let OutputStatus::Buffer(eos) = next(codec.as_mut(), &mut info) else {
            panic!("expected end of stream");
        };
        assert!(info.is_end_of_stream());
        assert_eq!(info.size, 0);
        codec.release_output_buffer(eos, false).unwrap();
    }

    #[test]
    fn full_input_queue_rejects_frames() {
        let options = SoftwareCodecOptions {
            input_buffers: 2,
            ..SoftwareCodecOptions::default()
        };
        let (_codec, mut surface) = encoder(options);
        surface.swap_buffers().unwrap();
        surface.swap_buffers().unwrap();
        assert!(matches!(
            surface.swap_buffers(),
            Err(CodecError::Surface(_))
        ));
    }

    #[test]
    fn held_output_buffers_block_further_output() {
        let options = SoftwareCodecOptions {
            output_buffers: 1,
            encoder_latency: 0,
            ..SoftwareCodecOptions::default()
        };
        let (mut codec, mut surface) = encoder(options);
        let mut info = BufferInfo::default();
        surface.swap_buffers().unwrap();
        assert_eq!(next(codec.as_mut(), &mut info), OutputStatus::FormatChanged);
        let OutputStatus::Buffer(index) = next(codec.as_mut(), &mut info) else {
            panic!("expected buffer");
        };
        assert_eq!(next(codec.as_mut(), &mut info), OutputStatus::TryAgainLater);
        codec.release_output_buffer(index, false).unwrap();
        assert!(matches!(
            next(codec.as_mut(), &mut info),
            OutputStatus::Buffer(_)
        ));
    }

    #[test]
    fn canvas_uses_bottom_left_origin() {
        let input = SoftwareInput::new(4, 2, 1);
        let mut surface = SoftwareSurface::new(input);
        let canvas = surface.canvas();
        canvas.set_clear_color(Color::GREEN);
        canvas.clear();
        canvas.set_scissor(Some(Rect::new(0, 0, 2, 1)));
        canvas.set_clear_color(Color::RED);
        canvas.clear();

        let pixels = surface.pixels();
        // Bottom row is the second stored row.
        assert_eq!(&pixels[16..20], &[255, 0, 0, 255]);
        assert_eq!(&pixels[20..24], &[255, 0, 0, 255]);
        assert_eq!(&pixels[24..28], &[0, 255, 0, 255]);
        assert_eq!(&pixels[0..4], &[0, 255, 0, 255]);
    }

    #[test]
    fn decoder_renders_released_buffers() {
        let sink = Arc::new(RecordingSink::new());
        let mut codec = SoftwareCodecFactory::default()
            .create_decoder(MIME_RAW)
            .unwrap();
        let mut format = MediaFormat::video(MIME_RAW, 1, 1);
        format.csd.push(config_record(1, 1));
        codec
            .configure(
                &format,
                Some(OutputSurface::Sink(sink.clone())),
                CodecDirection::Decode,
            )
            .unwrap();
        codec.start().unwrap();

        let index = codec.dequeue_input_buffer(TIMEOUT).unwrap().unwrap();
        codec
            .input_buffer(index)
            .unwrap()
            .copy_from_slice(&[9, 8, 7, 255]);
        codec
            .queue_input_buffer(index, 0, 4, 1_000, BufferFlags::KEY_FRAME)
            .unwrap();
        let index = codec.dequeue_input_buffer(TIMEOUT).unwrap().unwrap();
        codec
            .queue_input_buffer(index, 0, 0, 0, BufferFlags::END_OF_STREAM)
            .unwrap();

        let mut info = BufferInfo::default();
        assert_eq!(next(codec.as_mut(), &mut info), OutputStatus::FormatChanged);
        let OutputStatus::Buffer(frame) = next(codec.as_mut(), &mut info) else {
            panic!("expected frame");
        };
        codec.release_output_buffer(frame, true).unwrap();
        let OutputStatus::Buffer(eos) = next(codec.as_mut(), &mut info) else {
            panic!("expected end of stream");
        };
        assert!(info.is_end_of_stream());
        codec.release_output_buffer(eos, false).unwrap();

        assert_eq!(sink.timestamps(), vec![1_000]);
        assert_eq!(sink.frames()[0].pixel(0, 0), Some([9, 8, 7, 255]));
    }

    #[test]
    fn unsupported_mime_is_rejected() {
        let factory = SoftwareCodecFactory::default();
        assert!(matches!(
            factory.create_encoder(crate::MIME_AVC),
            Err(CodecError::Unsupported(_))
        ));
    }
}
