use crate::format::MediaFormat;
use crate::surface::{InputSurface, OutputSurface};
use crate::{
    BufferFlags, BufferInfo, Codec, CodecDirection, CodecError, CodecFactory, OutputStatus,
};
use ndk::native_window::NativeWindow;
use ndk_sys as ffi;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr::{self, NonNull};
use std::time::Duration;

const CONFIGURE_FLAG_ENCODE: u32 = 1;

/// Component name prefixes of the platform's software codecs.
const SOFTWARE_PREFIXES: [&str; 2] = ["OMX.google.", "c2.android."];

const KEY_MIME: &CStr = c"mime";
const KEY_WIDTH: &CStr = c"width";
const KEY_HEIGHT: &CStr = c"height";
const KEY_BIT_RATE: &CStr = c"bitrate";
const KEY_FRAME_RATE: &CStr = c"frame-rate";
const KEY_I_FRAME_INTERVAL: &CStr = c"i-frame-interval";
const KEY_COLOR_FORMAT: &CStr = c"color-format";
const KEY_MAX_INPUT_SIZE: &CStr = c"max-input-size";
const KEY_DURATION: &CStr = c"durationUs";
const KEY_CSD: [&CStr; 3] = [c"csd-0", c"csd-1", c"csd-2"];

fn check(op: &'static str, status: ffi::media_status_t) -> Result<(), CodecError> {
    if status == ffi::media_status_t::AMEDIA_OK {
        Ok(())
    } else {
        Err(CodecError::Platform {
            op,
            code: i64::from(status.0),
        })
    }
}

fn int(key: &CStr, value: impl TryInto<i32>) -> Result<i32, CodecError> {
    value.try_into().map_err(|_| {
        CodecError::Configuration(format!("{} is out of range", key.to_string_lossy()))
    })
}

/// Owned `AMediaFormat`.
struct NativeFormat(NonNull<ffi::AMediaFormat>);

impl NativeFormat {
    fn new() -> Result<Self, CodecError> {
        // SAFETY: no preconditions.
        NonNull::new(unsafe { ffi::AMediaFormat_new() })
            .map(Self)
            .ok_or_else(|| CodecError::InitializationFailed("AMediaFormat_new returned null".into()))
    }

    fn from_format(format: &MediaFormat) -> Result<Self, CodecError> {
        let native = Self::new()?;
        let mime = CString::new(format.mime.as_str())
            .map_err(|_| CodecError::Configuration("mime contains a nul byte".into()))?;
        // SAFETY: both pointers are valid nul-terminated strings; the value is copied.
        unsafe { ffi::AMediaFormat_setString(native.as_ptr(), KEY_MIME.as_ptr(), mime.as_ptr()) };
        native.set_i32(KEY_WIDTH, int(KEY_WIDTH, format.width)?);
        native.set_i32(KEY_HEIGHT, int(KEY_HEIGHT, format.height)?);
        if let Some(bit_rate) = format.bit_rate {
            native.set_i32(KEY_BIT_RATE, int(KEY_BIT_RATE, bit_rate)?);
        }
        if let Some(frame_rate) = format.frame_rate {
            native.set_i32(KEY_FRAME_RATE, int(KEY_FRAME_RATE, frame_rate)?);
        }
        if let Some(interval) = format.i_frame_interval {
            native.set_i32(KEY_I_FRAME_INTERVAL, int(KEY_I_FRAME_INTERVAL, interval)?);
        }
        if let Some(color_format) = format.color_format {
            native.set_i32(KEY_COLOR_FORMAT, color_format);
        }
        if let Some(max_input_size) = format.max_input_size {
            native.set_i32(KEY_MAX_INPUT_SIZE, int(KEY_MAX_INPUT_SIZE, max_input_size)?);
        }
        if let Some(duration) = format.duration_us {
            // SAFETY: valid format and key.
            unsafe { ffi::AMediaFormat_setInt64(native.as_ptr(), KEY_DURATION.as_ptr(), duration) };
        }
        for (key, csd) in KEY_CSD.iter().zip(&format.csd) {
            // SAFETY: the buffer is copied into the format.
            unsafe {
                ffi::AMediaFormat_setBuffer(
                    native.as_ptr(),
                    key.as_ptr(),
                    csd.as_ptr().cast::<c_void>(),
                    csd.len(),
                );
            }
        }
        Ok(native)
    }

    const fn as_ptr(&self) -> *mut ffi::AMediaFormat {
        self.0.as_ptr()
    }

    fn set_i32(&self, key: &CStr, value: i32) {
        // SAFETY: valid format and key.
        unsafe { ffi::AMediaFormat_setInt32(self.as_ptr(), key.as_ptr(), value) };
    }

    fn get_i32(&self, key: &CStr) -> Option<i32> {
        let mut value = 0;
        // SAFETY: valid format, key and out pointer.
        unsafe { ffi::AMediaFormat_getInt32(self.as_ptr(), key.as_ptr(), &mut value) }
            .then_some(value)
    }

    fn get_i64(&self, key: &CStr) -> Option<i64> {
        let mut value = 0;
        // SAFETY: valid format, key and out pointer.
        unsafe { ffi::AMediaFormat_getInt64(self.as_ptr(), key.as_ptr(), &mut value) }
            .then_some(value)
    }

    fn get_string(&self, key: &CStr) -> Option<String> {
        let mut value: *const c_char = ptr::null();
        // SAFETY: the returned string is owned by the format and copied out
        // before the format can be modified.
        unsafe {
            if !ffi::AMediaFormat_getString(self.as_ptr(), key.as_ptr(), &mut value)
                || value.is_null()
            {
                return None;
            }
            Some(CStr::from_ptr(value).to_string_lossy().into_owned())
        }
    }

    fn get_buffer(&self, key: &CStr) -> Option<Vec<u8>> {
        let mut data: *mut c_void = ptr::null_mut();
        let mut size = 0usize;
        // SAFETY: the returned buffer is owned by the format and copied out.
        unsafe {
            if !ffi::AMediaFormat_getBuffer(self.as_ptr(), key.as_ptr(), &mut data, &mut size)
                || data.is_null()
            {
                return None;
            }
            Some(std::slice::from_raw_parts(data.cast::<u8>(), size).to_vec())
        }
    }

    fn to_format(&self) -> MediaFormat {
        let dimension = |key| {
            self.get_i32(key)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(0)
        };
        let positive = |key| self.get_i32(key).and_then(|value| u32::try_from(value).ok());
        MediaFormat {
            mime: self.get_string(KEY_MIME).unwrap_or_default(),
            width: dimension(KEY_WIDTH),
            height: dimension(KEY_HEIGHT),
            bit_rate: positive(KEY_BIT_RATE),
            frame_rate: positive(KEY_FRAME_RATE),
            i_frame_interval: positive(KEY_I_FRAME_INTERVAL),
            color_format: self.get_i32(KEY_COLOR_FORMAT),
            max_input_size: self
                .get_i32(KEY_MAX_INPUT_SIZE)
                .and_then(|value| usize::try_from(value).ok()),
            duration_us: self.get_i64(KEY_DURATION),
            csd: KEY_CSD
                .iter()
                .map_while(|key| self.get_buffer(key))
                .collect(),
        }
    }
}

impl Drop for NativeFormat {
    fn drop(&mut self) {
        // SAFETY: the format is owned and deleted exactly once.
        unsafe { ffi::AMediaFormat_delete(self.as_ptr()) };
    }
}

/// A platform codec instance.
#[derive(Debug)]
pub struct AndroidCodec {
    raw: NonNull<ffi::AMediaCodec>,
    name: String,
    direction: CodecDirection,
    output_window: Option<NativeWindow>,
    released: bool,
}

// SAFETY: AMediaCodec may be driven from any thread as long as calls are not
// concurrent, which `&mut self` guarantees.
unsafe impl Send for AndroidCodec {}

impl AndroidCodec {
    /// Create the default encoder or decoder for `mime`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] if the platform has no codec for `mime`.
    pub fn create(mime: &str, direction: CodecDirection) -> Result<Self, CodecError> {
        let c_mime = CString::new(mime)
            .map_err(|_| CodecError::Configuration("mime contains a nul byte".into()))?;
        // SAFETY: `c_mime` is a valid nul-terminated string.
        let raw = unsafe {
            match direction {
                CodecDirection::Encode => ffi::AMediaCodec_createEncoderByType(c_mime.as_ptr()),
                CodecDirection::Decode => ffi::AMediaCodec_createDecoderByType(c_mime.as_ptr()),
            }
        };
        let raw = NonNull::new(raw).ok_or_else(|| {
            CodecError::Unsupported(format!("no {direction:?} codec for {mime}"))
        })?;
        let name = component_name(raw).unwrap_or_else(|| format!("{mime} {direction:?}"));
        log::info!("created {direction:?} codec {name}");
        Ok(Self {
            raw,
            name,
            direction,
            output_window: None,
            released: false,
        })
    }

    fn ptr(&self) -> Result<*mut ffi::AMediaCodec, CodecError> {
        if self.released {
            Err(CodecError::InvalidState(format!("{} was released", self.name)))
        } else {
            Ok(self.raw.as_ptr())
        }
    }
}

fn component_name(raw: NonNull<ffi::AMediaCodec>) -> Option<String> {
    let mut name: *mut c_char = ptr::null_mut();
    // SAFETY: the name is copied before being handed back with `releaseName`.
    unsafe {
        check(
            "AMediaCodec_getName",
            ffi::AMediaCodec_getName(raw.as_ptr(), &mut name),
        )
        .ok()?;
        if name.is_null() {
            return None;
        }
        let owned = CStr::from_ptr(name).to_string_lossy().into_owned();
        ffi::AMediaCodec_releaseName(raw.as_ptr(), name);
        Some(owned)
    }
}

fn timeout_us(timeout: Duration) -> i64 {
    i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX)
}

impl Codec for AndroidCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_software(&self) -> bool {
        SOFTWARE_PREFIXES
            .iter()
            .any(|prefix| self.name.starts_with(prefix))
    }

    fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<OutputSurface>,
        direction: CodecDirection,
    ) -> Result<(), CodecError> {
        if direction != self.direction {
            return Err(CodecError::Configuration(format!(
                "{} cannot be configured for {direction:?}",
                self.name
            )));
        }
        let window = match surface {
            None => None,
            Some(OutputSurface::Window(window)) => Some(window),
            Some(OutputSurface::Sink(_)) => {
                return Err(CodecError::Unsupported(
                    "MediaCodec renders to native windows only".into(),
                ));
            }
        };
        let native = NativeFormat::from_format(format)?;
        let flags = match direction {
            CodecDirection::Encode => CONFIGURE_FLAG_ENCODE,
            CodecDirection::Decode => 0,
        };
        let window_ptr = window
            .as_ref()
            .map_or(ptr::null_mut(), |window| window.ptr().as_ptr());
        // SAFETY: codec, format and window are valid for the duration of the
        // call; the window is kept alive in `output_window`.
        check("AMediaCodec_configure", unsafe {
            ffi::AMediaCodec_configure(
                self.ptr()?,
                native.as_ptr(),
                window_ptr,
                ptr::null_mut(),
                flags,
            )
        })?;
        self.output_window = window;
        log::debug!("{} configured: {format}", self.name);
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<InputSurface, CodecError> {
        let mut window: *mut ffi::ANativeWindow = ptr::null_mut();
        // SAFETY: valid codec and out pointer.
        check("AMediaCodec_createInputSurface", unsafe {
            ffi::AMediaCodec_createInputSurface(self.ptr()?, &mut window)
        })?;
        let window = NonNull::new(window)
            .ok_or_else(|| CodecError::Surface("codec returned a null input surface".into()))?;
        // SAFETY: the codec hands over one reference to the new window.
        Ok(InputSurface::Window(unsafe { NativeWindow::from_ptr(window) }))
    }

    fn start(&mut self) -> Result<(), CodecError> {
        // SAFETY: valid codec.
        check("AMediaCodec_start", unsafe { ffi::AMediaCodec_start(self.ptr()?) })
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        // SAFETY: valid codec.
        check("AMediaCodec_stop", unsafe { ffi::AMediaCodec_stop(self.ptr()?) })
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        // SAFETY: valid codec.
        check("AMediaCodec_flush", unsafe { ffi::AMediaCodec_flush(self.ptr()?) })
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // SAFETY: the codec is deleted exactly once.
        let status = unsafe { ffi::AMediaCodec_delete(self.raw.as_ptr()) };
        if let Err(err) = check("AMediaCodec_delete", status) {
            log::warn!("{}: {err}", self.name);
        }
        self.output_window = None;
    }

    fn signal_end_of_input(&mut self) -> Result<(), CodecError> {
        // SAFETY: valid codec.
        check("AMediaCodec_signalEndOfInputStream", unsafe {
            ffi::AMediaCodec_signalEndOfInputStream(self.ptr()?)
        })
    }

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError> {
        // SAFETY: valid codec.
        let index = unsafe { ffi::AMediaCodec_dequeueInputBuffer(self.ptr()?, timeout_us(timeout)) };
        match index {
            index if index >= 0 => Ok(Some(index.unsigned_abs())),
            -1 => Ok(None),
            code => Err(CodecError::Platform {
                op: "AMediaCodec_dequeueInputBuffer",
                code: code as i64,
            }),
        }
    }

    fn input_buffer(&mut self, index: usize) -> Option<&mut [u8]> {
        let raw = self.ptr().ok()?;
        let mut size = 0usize;
        // SAFETY: the buffer stays valid until queued back; the slice borrows
        // `self` mutably until then.
        unsafe {
            let data = ffi::AMediaCodec_getInputBuffer(raw, index, &mut size);
            (!data.is_null()).then(|| std::slice::from_raw_parts_mut(data, size))
        }
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        let offset = offset
            .try_into()
            .map_err(|_| CodecError::Configuration("input offset out of range".into()))?;
        let time = u64::try_from(presentation_time_us).unwrap_or(0);
        // SAFETY: valid codec; the codec validates index and range.
        check("AMediaCodec_queueInputBuffer", unsafe {
            ffi::AMediaCodec_queueInputBuffer(self.ptr()?, index, offset, size, time, flags.bits())
        })
    }

    fn dequeue_output_buffer(&mut self, info: &mut BufferInfo, timeout: Duration) -> OutputStatus {
        let Ok(raw) = self.ptr() else {
            return OutputStatus::Unknown(i64::from(ffi::media_status_t::AMEDIA_ERROR_INVALID_OBJECT.0));
        };
        let mut raw_info = ffi::AMediaCodecBufferInfo {
            offset: 0,
            size: 0,
            presentationTimeUs: 0,
            flags: 0,
        };
        // SAFETY: valid codec and out pointer.
        let code = unsafe { ffi::AMediaCodec_dequeueOutputBuffer(raw, &mut raw_info, timeout_us(timeout)) };
        let status = OutputStatus::from_raw(code);
        if let OutputStatus::Buffer(_) = status {
            info.set(
                usize::try_from(raw_info.offset).unwrap_or(0),
                usize::try_from(raw_info.size).unwrap_or(0),
                raw_info.presentationTimeUs,
                BufferFlags::from_bits(raw_info.flags),
            );
        }
        status
    }

    fn output_buffer(&self, index: usize) -> Option<&[u8]> {
        let raw = self.ptr().ok()?;
        let mut size = 0usize;
        // SAFETY: the buffer stays valid until released; the slice borrows
        // `self` until then.
        unsafe {
            let data = ffi::AMediaCodec_getOutputBuffer(raw, index, &mut size);
            (!data.is_null()).then(|| std::slice::from_raw_parts(data.cast_const(), size))
        }
    }

    fn output_format(&self) -> Result<MediaFormat, CodecError> {
        // SAFETY: valid codec; the returned format is owned by the caller.
        let raw = unsafe { ffi::AMediaCodec_getOutputFormat(self.ptr()?) };
        let native = NonNull::new(raw)
            .map(NativeFormat)
            .ok_or_else(|| CodecError::InvalidState("no output format".into()))?;
        Ok(native.to_format())
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        // SAFETY: valid codec; the codec validates the index.
        check("AMediaCodec_releaseOutputBuffer", unsafe {
            ffi::AMediaCodec_releaseOutputBuffer(self.ptr()?, index, render)
        })
    }
}

impl Drop for AndroidCodec {
    fn drop(&mut self) {
        self.release();
    }
}

/// Creates `MediaCodec` instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct AndroidCodecFactory;

impl CodecFactory for AndroidCodecFactory {
    fn create_encoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError> {
        Ok(Box::new(AndroidCodec::create(mime, CodecDirection::Encode)?))
    }

    fn create_decoder(&self, mime: &str) -> Result<Box<dyn Codec>, CodecError> {
        Ok(Box::new(AndroidCodec::create(mime, CodecDirection::Decode)?))
    }
}
