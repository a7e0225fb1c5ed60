use crate::VideoError;
use crate::nal::{AvcConfig, annexb_to_length_prefixed, has_start_code};
use byteorder::{BigEndian, WriteBytesExt};
use moviekit_codec::{BufferInfo, MIME_AVC, MIME_RAW, MediaFormat};
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Ticks per second of the media timeline (microseconds).
pub const MEDIA_TIMESCALE: u32 = 1_000_000;
const MOVIE_TIMESCALE: u32 = 1000;
const DEFAULT_SAMPLE_DURATION_US: u64 = 33_333;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Video container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoFormat {
    /// MP4 container (most compatible).
    #[default]
    Mp4,
    /// MOV container (Apple QuickTime).
    Mov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialized,
    Started,
    Stopped,
    Released,
}

#[derive(Debug)]
enum SampleEntry {
    Avc(Vec<u8>),
    Raw,
}

#[derive(Debug)]
struct Sample {
    offset: u64,
    size: u32,
    time_us: u64,
    sync: bool,
}

#[derive(Debug)]
struct Track {
    format: MediaFormat,
    entry: SampleEntry,
    samples: Vec<Sample>,
}

/// Writes one video track into an MP4/MOV file.
///
/// Samples are streamed into `mdat` as they arrive; the sample tables are
/// written when the muxer is stopped. The lifecycle mirrors a platform muxer:
/// `create` → `add_track` (once) → `start` → `write_sample_data`* → `stop` →
/// `release`.
#[derive(Debug)]
pub struct Muxer {
    path: PathBuf,
    format: VideoFormat,
    writer: Option<BufWriter<File>>,
    state: State,
    track: Option<Track>,
    mdat_start: u64,
    position: u64,
}

impl Muxer {
    /// Create the output file and write the file type box.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Io`] if the file cannot be created.
    pub fn create(path: impl AsRef<Path>, format: VideoFormat) -> Result<Self, VideoError> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);

        let mut ftyp = Vec::new();
        write_box(&mut ftyp, b"ftyp", |w| match format {
            VideoFormat::Mp4 => {
                w.write_all(b"isom")?;
                w.write_u32::<BigEndian>(0x200)?;
                w.write_all(b"isomiso2avc1mp41")
            }
            VideoFormat::Mov => {
                w.write_all(b"qt  ")?;
                w.write_u32::<BigEndian>(0x2005_0300)?;
                w.write_all(b"qt  ")
            }
        })?;
        writer.write_all(&ftyp)?;
        log::debug!("muxer created for {}", path.display());

        Ok(Self {
            path,
            format,
            writer: Some(writer),
            state: State::Initialized,
            track: None,
            mdat_start: 0,
            position: ftyp.len() as u64,
        })
    }

    /// Output path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True between `start` and `stop`.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state == State::Started
    }

    /// Number of samples written so far.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.track.as_ref().map_or(0, |track| track.samples.len())
    }

    fn expect_state(&self, expected: State, op: &str) -> Result<(), VideoError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VideoError::MuxerState(format!(
                "{op} called while {:?}",
                self.state
            )))
        }
    }

    /// Add the video track described by `format`. Returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::MuxerState`] after `start` or for a second track,
    /// and [`VideoError::Container`] for formats that cannot be stored.
    pub fn add_track(&mut self, format: &MediaFormat) -> Result<usize, VideoError> {
        self.expect_state(State::Initialized, "add_track")?;
        if self.track.is_some() {
            return Err(VideoError::MuxerState(
                "only one video track is supported".into(),
            ));
        }
        let entry = match format.mime.as_str() {
            MIME_AVC => SampleEntry::Avc(AvcConfig::from_csd(&format.csd)?.to_avcc()?),
            MIME_RAW => SampleEntry::Raw,
            other => {
                return Err(VideoError::Container(format!(
                    "cannot store {other} samples"
                )));
            }
        };
        if u16::try_from(format.width).is_err() || u16::try_from(format.height).is_err() {
            return Err(VideoError::Container(format!(
                "frame size {}x{} too large",
                format.width, format.height
            )));
        }
        log::info!("muxer track added: {format}");
        self.track = Some(Track {
            format: format.clone(),
            entry,
            samples: Vec::new(),
        });
        Ok(0)
    }

    /// Begin the media data box.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::MuxerState`] if no track was added.
    pub fn start(&mut self) -> Result<(), VideoError> {
        self.expect_state(State::Initialized, "start")?;
        if self.track.is_none() {
            return Err(VideoError::MuxerState("start called without a track".into()));
        }
        let writer = self.writer()?;
        // Large-size header; the size is patched on stop.
        writer.write_u32::<BigEndian>(1)?;
        writer.write_all(b"mdat")?;
        writer.write_u64::<BigEndian>(0)?;
        self.mdat_start = self.position;
        self.position += 16;
        self.state = State::Started;
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, VideoError> {
        self.writer
            .as_mut()
            .ok_or_else(|| VideoError::MuxerState("muxer was released".into()))
    }

    /// Append one encoded sample to `track`.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::MuxerState`] outside `start`/`stop`, for an unknown
    /// track or for a presentation time earlier than the previous sample.
    pub fn write_sample_data(
        &mut self,
        track: usize,
        data: &[u8],
        info: &BufferInfo,
    ) -> Result<(), VideoError> {
        self.expect_state(State::Started, "write_sample_data")?;
        if track != 0 {
            return Err(VideoError::MuxerState(format!("unknown track {track}")));
        }
        if info.is_codec_config() {
            log::debug!("muxer skipped codec config buffer");
            return Ok(());
        }
        let time_us = u64::try_from(info.presentation_time_us).map_err(|_| {
            VideoError::MuxerState(format!(
                "negative presentation time {}",
                info.presentation_time_us
            ))
        })?;

        let (payload, last_time) = {
            let Some(track) = self.track.as_ref() else {
                return Err(VideoError::MuxerState("no track".into()));
            };
            let payload = match track.entry {
                SampleEntry::Avc(_) if has_start_code(data) => annexb_to_length_prefixed(data)?,
                _ => data.to_vec(),
            };
            (payload, track.samples.last().map(|sample| sample.time_us))
        };
        if let Some(last) = last_time.filter(|&last| time_us < last) {
            return Err(VideoError::MuxerState(format!(
                "presentation time went backward: {time_us}us after {last}us"
            )));
        }
        let size = u32::try_from(payload.len())
            .map_err(|_| VideoError::Container("sample too large".into()))?;

        self.writer()?.write_all(&payload)?;
        let offset = self.position;
        self.position += u64::from(size);
        if let Some(track) = self.track.as_mut() {
            track.samples.push(Sample {
                offset,
                size,
                time_us,
                sync: info.is_key_frame(),
            });
        }
        Ok(())
    }

    /// Finish the media data and write the sample tables.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::MuxerState`] if the muxer was not started.
    pub fn stop(&mut self) -> Result<(), VideoError> {
        self.expect_state(State::Started, "stop")?;
        self.state = State::Stopped;

        let mdat_size = self.position - self.mdat_start;
        let moov = match &self.track {
            Some(track) => build_moov(track)?,
            None => return Err(VideoError::MuxerState("no track".into())),
        };
        let mdat_start = self.mdat_start;
        let writer = self.writer()?;
        writer.write_all(&moov)?;
        writer.seek(SeekFrom::Start(mdat_start + 8))?;
        writer.write_u64::<BigEndian>(mdat_size)?;
        writer.seek(SeekFrom::End(0))?;
        writer.flush()?;
        log::info!(
            "muxer finished {} with {} samples",
            self.path.display(),
            self.sample_count()
        );
        Ok(())
    }

    /// Close the file. Safe to call more than once; a started muxer is stopped
    /// first.
    pub fn release(&mut self) {
        if self.state == State::Started {
            if let Err(err) = self.stop() {
                log::warn!("muxer stop during release failed: {err}");
            }
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.flush() {
                log::warn!("muxer flush failed: {err}");
            }
        }
        self.state = State::Released;
    }

    /// Container flavor being written.
    #[must_use]
    pub const fn container(&self) -> VideoFormat {
        self.format
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Append a box of type `kind` whose body is produced by `body`.
fn write_box(
    out: &mut Vec<u8>,
    kind: &[u8; 4],
    body: impl FnOnce(&mut Vec<u8>) -> io::Result<()>,
) -> io::Result<()> {
    let start = out.len();
    out.write_u32::<BigEndian>(0)?;
    out.write_all(kind)?;
    body(out)?;
    let size = u32::try_from(out.len() - start)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "box too large"))?;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
    Ok(())
}

fn write_full_box(
    out: &mut Vec<u8>,
    kind: &[u8; 4],
    flags: u32,
    body: impl FnOnce(&mut Vec<u8>) -> io::Result<()>,
) -> io::Result<()> {
    write_box(out, kind, |w| {
        w.write_u32::<BigEndian>(flags)?;
        body(w)
    })
}

fn write_matrix(w: &mut Vec<u8>) -> io::Result<()> {
    for value in UNITY_MATRIX {
        w.write_u32::<BigEndian>(value)?;
    }
    Ok(())
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Per-sample durations in media ticks; the last sample repeats the previous
/// delta.
fn sample_durations(track: &Track) -> Vec<u64> {
    let times: Vec<u64> = track.samples.iter().map(|sample| sample.time_us).collect();
    let mut durations: Vec<u64> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    let last = durations.last().copied().unwrap_or_else(|| {
        track
            .format
            .frame_rate
            .filter(|&fps| fps > 0)
            .map_or(DEFAULT_SAMPLE_DURATION_US, |fps| 1_000_000 / u64::from(fps))
    });
    if !times.is_empty() {
        durations.push(last);
    }
    durations
}

fn run_lengths(values: &[u64]) -> Vec<(u32, u64)> {
    let mut runs: Vec<(u32, u64)> = Vec::new();
    for &value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}

fn build_moov(track: &Track) -> Result<Vec<u8>, VideoError> {
    let durations = sample_durations(track);
    let media_duration: u64 = durations.iter().sum();
    let movie_duration = media_duration * u64::from(MOVIE_TIMESCALE) / u64::from(MEDIA_TIMESCALE);
    let first_time = track.samples.first().map_or(0, |sample| sample.time_us);
    let composition_offset = i32::try_from(first_time)
        .map_err(|_| VideoError::Container("first presentation time too large".into()))?;
    let width = track.format.width;
    let height = track.format.height;

    let mut moov = Vec::new();
    write_box(&mut moov, b"moov", |w| {
        write_full_box(w, b"mvhd", 0, |w| {
            w.write_u32::<BigEndian>(0)?; // creation time
            w.write_u32::<BigEndian>(0)?; // modification time
            w.write_u32::<BigEndian>(MOVIE_TIMESCALE)?;
            w.write_u32::<BigEndian>(saturate(movie_duration))?;
            w.write_u32::<BigEndian>(0x0001_0000)?; // rate 1.0
            w.write_u16::<BigEndian>(0x0100)?; // volume 1.0
            w.write_all(&[0u8; 10])?;
            write_matrix(w)?;
            w.write_all(&[0u8; 24])?;
            w.write_u32::<BigEndian>(2) // next track id
        })?;
        write_box(w, b"trak", |w| {
            // Enabled, in movie, in preview.
            write_full_box(w, b"tkhd", 0x0000_0007, |w| {
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(1)?; // track id
                w.write_u32::<BigEndian>(0)?;
                w.write_u32::<BigEndian>(saturate(movie_duration))?;
                w.write_all(&[0u8; 8])?;
                w.write_u16::<BigEndian>(0)?; // layer
                w.write_u16::<BigEndian>(0)?; // alternate group
                w.write_u16::<BigEndian>(0)?; // volume
                w.write_u16::<BigEndian>(0)?;
                write_matrix(w)?;
                w.write_u32::<BigEndian>(width << 16)?;
                w.write_u32::<BigEndian>(height << 16)
            })?;
            write_box(w, b"mdia", |w| {
                write_full_box(w, b"mdhd", 0, |w| {
                    w.write_u32::<BigEndian>(0)?;
                    w.write_u32::<BigEndian>(0)?;
                    w.write_u32::<BigEndian>(MEDIA_TIMESCALE)?;
                    w.write_u32::<BigEndian>(saturate(media_duration))?;
                    w.write_u16::<BigEndian>(0x55c4)?; // "und"
                    w.write_u16::<BigEndian>(0)
                })?;
                write_full_box(w, b"hdlr", 0, |w| {
                    w.write_u32::<BigEndian>(0)?;
                    w.write_all(b"vide")?;
                    w.write_all(&[0u8; 12])?;
                    w.write_all(b"VideoHandle\0")
                })?;
                write_box(w, b"minf", |w| {
                    write_full_box(w, b"vmhd", 1, |w| w.write_all(&[0u8; 8]))?;
                    write_box(w, b"dinf", |w| {
                        write_full_box(w, b"dref", 0, |w| {
                            w.write_u32::<BigEndian>(1)?;
                            // Media data lives in this file.
                            write_full_box(w, b"url ", 1, |_| Ok(()))
                        })
                    })?;
                    write_box(w, b"stbl", |w| {
                        write_stbl(w, track, &durations, composition_offset)
                    })
                })
            })
        })
    })?;
    Ok(moov)
}

fn write_stbl(
    w: &mut Vec<u8>,
    track: &Track,
    durations: &[u64],
    composition_offset: i32,
) -> io::Result<()> {
    let width = u16::try_from(track.format.width).unwrap_or(u16::MAX);
    let height = u16::try_from(track.format.height).unwrap_or(u16::MAX);
    let count = saturate(track.samples.len() as u64);

    write_full_box(w, b"stsd", 0, |w| {
        w.write_u32::<BigEndian>(1)?;
        let kind = match track.entry {
            SampleEntry::Avc(_) => b"avc1",
            SampleEntry::Raw => b"raw ",
        };
        write_box(w, kind, |w| {
            w.write_all(&[0u8; 6])?;
            w.write_u16::<BigEndian>(1)?; // data reference index
            w.write_all(&[0u8; 16])?;
            w.write_u16::<BigEndian>(width)?;
            w.write_u16::<BigEndian>(height)?;
            w.write_u32::<BigEndian>(0x0048_0000)?; // 72 dpi
            w.write_u32::<BigEndian>(0x0048_0000)?;
            w.write_u32::<BigEndian>(0)?;
            w.write_u16::<BigEndian>(1)?; // frame count
            w.write_all(&[0u8; 32])?; // compressor name
            w.write_u16::<BigEndian>(0x0018)?; // depth
            w.write_i16::<BigEndian>(-1)?;
            if let SampleEntry::Avc(avcc) = &track.entry {
                write_box(w, b"avcC", |w| w.write_all(avcc))?;
            }
            Ok(())
        })
    })?;

    let runs = run_lengths(durations);
    write_full_box(w, b"stts", 0, |w| {
        w.write_u32::<BigEndian>(saturate(runs.len() as u64))?;
        for (samples, delta) in &runs {
            w.write_u32::<BigEndian>(*samples)?;
            w.write_u32::<BigEndian>(saturate(*delta))?;
        }
        Ok(())
    })?;

    if composition_offset != 0 {
        write_full_box(w, b"ctts", 0, |w| {
            w.write_u32::<BigEndian>(1)?;
            w.write_u32::<BigEndian>(count)?;
            w.write_i32::<BigEndian>(composition_offset)
        })?;
    }

    if track.samples.iter().any(|sample| !sample.sync) {
        write_full_box(w, b"stss", 0, |w| {
            let sync: Vec<u32> = (1..=count)
                .zip(&track.samples)
                .filter(|(_, sample)| sample.sync)
                .map(|(id, _)| id)
                .collect();
            w.write_u32::<BigEndian>(saturate(sync.len() as u64))?;
            for id in sync {
                w.write_u32::<BigEndian>(id)?;
            }
            Ok(())
        })?;
    }

    // One sample per chunk.
    write_full_box(w, b"stsc", 0, |w| {
        w.write_u32::<BigEndian>(1)?;
        w.write_u32::<BigEndian>(1)?;
        w.write_u32::<BigEndian>(1)?;
        w.write_u32::<BigEndian>(1)
    })?;

    write_full_box(w, b"stsz", 0, |w| {
        w.write_u32::<BigEndian>(0)?;
        w.write_u32::<BigEndian>(count)?;
        for sample in &track.samples {
            w.write_u32::<BigEndian>(sample.size)?;
        }
        Ok(())
    })?;

    let large = track
        .samples
        .last()
        .is_some_and(|sample| sample.offset > u64::from(u32::MAX));
    if large {
        write_full_box(w, b"co64", 0, |w| {
            w.write_u32::<BigEndian>(count)?;
            for sample in &track.samples {
                w.write_u64::<BigEndian>(sample.offset)?;
            }
            Ok(())
        })
    } else {
        write_full_box(w, b"stco", 0, |w| {
            w.write_u32::<BigEndian>(count)?;
            for sample in &track.samples {
                w.write_u32::<BigEndian>(saturate(sample.offset))?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moviekit_codec::BufferFlags;

    fn raw_format() -> MediaFormat {
        MediaFormat::video(MIME_RAW, 2, 2)
    }

    fn info(pts: i64, flags: BufferFlags) -> BufferInfo {
        BufferInfo {
            offset: 0,
            size: 16,
            presentation_time_us: pts,
            flags,
        }
    }

    #[test]
    fn lifecycle_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut muxer = Muxer::create(dir.path().join("out.mp4"), VideoFormat::Mp4).unwrap();

        assert!(matches!(muxer.start(), Err(VideoError::MuxerState(_))));
        assert!(matches!(
            muxer.write_sample_data(0, &[0; 16], &info(0, BufferFlags::KEY_FRAME)),
            Err(VideoError::MuxerState(_))
        ));

        assert_eq!(muxer.add_track(&raw_format()).unwrap(), 0);
        assert!(matches!(
            muxer.add_track(&raw_format()),
            Err(VideoError::MuxerState(_))
        ));
        muxer.start().unwrap();
        assert!(matches!(
            muxer.add_track(&raw_format()),
            Err(VideoError::MuxerState(_))
        ));
        assert!(matches!(
            muxer.write_sample_data(1, &[0; 16], &info(0, BufferFlags::KEY_FRAME)),
            Err(VideoError::MuxerState(_))
        ));
        muxer.stop().unwrap();
        assert!(matches!(muxer.stop(), Err(VideoError::MuxerState(_))));
        muxer.release();
        muxer.release();
    }

    #[test]
    fn backward_timestamps_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut muxer = Muxer::create(dir.path().join("out.mp4"), VideoFormat::Mp4).unwrap();
        muxer.add_track(&raw_format()).unwrap();
        muxer.start().unwrap();
        muxer
            .write_sample_data(0, &[0; 16], &info(1_000, BufferFlags::KEY_FRAME))
            .unwrap();
        muxer
            .write_sample_data(0, &[0; 16], &info(1_000, BufferFlags::KEY_FRAME))
            .unwrap();
        assert!(matches!(
            muxer.write_sample_data(0, &[0; 16], &info(999, BufferFlags::KEY_FRAME)),
            Err(VideoError::MuxerState(_))
        ));
        assert_eq!(muxer.sample_count(), 2);
    }

    #[test]
    fn unsupported_track_formats_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut muxer = Muxer::create(dir.path().join("out.mp4"), VideoFormat::Mp4).unwrap();
        assert!(matches!(
            muxer.add_track(&MediaFormat::video(moviekit_codec::MIME_HEVC, 2, 2)),
            Err(VideoError::Container(_))
        ));
        // AVC needs parameter sets.
        assert!(matches!(
            muxer.add_track(&MediaFormat::video(MIME_AVC, 2, 2)),
            Err(VideoError::Container(_))
        ));
    }

    #[test]
    fn durations_repeat_last_delta() {
        let track = Track {
            format: raw_format(),
            entry: SampleEntry::Raw,
            samples: [0, 125_000, 250_000, 312_500]
                .into_iter()
                .map(|time_us| Sample {
                    offset: 0,
                    size: 1,
                    time_us,
                    sync: true,
                })
                .collect(),
        };
        let durations = sample_durations(&track);
        assert_eq!(durations, vec![125_000, 125_000, 62_500, 62_500]);
        assert_eq!(run_lengths(&durations), vec![(2, 125_000), (2, 62_500)]);
    }

    #[test]
    fn stopped_file_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let mut muxer = Muxer::create(&path, VideoFormat::Mp4).unwrap();
        muxer.add_track(&raw_format()).unwrap();
        muxer.start().unwrap();
        for (i, pts) in [0, 40_000, 80_000].into_iter().enumerate() {
            let flags = if i == 1 {
                BufferFlags::NONE
            } else {
                BufferFlags::KEY_FRAME
            };
            muxer.write_sample_data(0, &[i as u8; 16], &info(pts, flags)).unwrap();
        }
        muxer.stop().unwrap();
        muxer.release();

        let file = File::open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        let mut reader = mp4::Mp4Reader::read_header(io::BufReader::new(file), size).unwrap();
        let track = reader.tracks().get(&1).unwrap();
        assert_eq!(track.sample_count(), 3);
        assert_eq!(track.timescale(), MEDIA_TIMESCALE);
        let second = reader.read_sample(1, 2).unwrap().unwrap();
        assert_eq!(second.start_time, 40_000);
        assert!(!second.is_sync);
        assert_eq!(&second.bytes[..], &[1u8; 16]);
    }
}
