//! Sample-level access to MP4/MOV files.

use crate::VideoError;
use crate::nal::{AvcConfig, length_prefixed_to_annexb};
use moviekit_codec::{MIME_AVC, MIME_HEVC, MIME_RAW, MediaFormat};
use mp4::{Mp4Reader, Mp4Track, TrackType};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

const MIME_VP9: &str = "video/x-vnd.on2.vp9";
const MIME_AAC: &str = "audio/mp4a-latm";
const MIME_TIMED_TEXT: &str = "text/3gpp-tt";
const MIME_UNKNOWN: &str = "application/octet-stream";

/// Where [`Extractor::seek_to`] lands relative to the requested time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
    /// Last sync sample at or before the time.
    PreviousSync,
    /// First sync sample at or after the time.
    NextSync,
    /// Whichever sync sample is nearer.
    #[default]
    ClosestSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    LengthPrefixed(u8),
    Plain,
}

#[derive(Debug)]
struct TrackInfo {
    id: u32,
    format: MediaFormat,
    framing: Framing,
    times_us: Vec<i64>,
    sync: Vec<bool>,
}

/// Reads encoded samples of one selected track, in decode order.
pub struct Extractor {
    reader: Mp4Reader<BufReader<File>>,
    tracks: Vec<TrackInfo>,
    selected: Option<usize>,
    cursor: usize,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("tracks", &self.tracks.len())
            .field("selected", &self.selected)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl Extractor {
    /// Open a container and index its tracks.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::NotFound`] if `path` does not exist and
    /// [`VideoError::Mp4`] if it is not a readable container.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VideoError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => VideoError::NotFound(path.to_path_buf()),
            _ => VideoError::Io(err),
        })?;
        let size = file.metadata()?.len();
        let reader = Mp4Reader::read_header(BufReader::new(file), size)?;

        let mut tracks: Vec<&Mp4Track> = reader.tracks().values().collect();
        tracks.sort_by_key(|track| track.track_id());
        let tracks = tracks
            .into_iter()
            .map(index_track)
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("opened {} with {} tracks", path.display(), tracks.len());

        Ok(Self {
            reader,
            tracks,
            selected: None,
            cursor: 0,
        })
    }

    /// Number of tracks in the container.
    #[must_use]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Format of track `index`.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Container`] for an out-of-range index.
    pub fn track_format(&self, index: usize) -> Result<MediaFormat, VideoError> {
        self.track(index).map(|track| track.format.clone())
    }

    fn track(&self, index: usize) -> Result<&TrackInfo, VideoError> {
        self.tracks
            .get(index)
            .ok_or_else(|| VideoError::Container(format!("no track {index}")))
    }

    /// Read samples from track `index`, starting at its first sample.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Container`] for an out-of-range index.
    pub fn select_track(&mut self, index: usize) -> Result<(), VideoError> {
        self.track(index)?;
        self.selected = Some(index);
        self.cursor = 0;
        Ok(())
    }

    fn current(&self) -> Option<&TrackInfo> {
        self.selected
            .and_then(|index| self.tracks.get(index))
            .filter(|track| self.cursor < track.times_us.len())
    }

    /// Presentation time of the current sample, `None` at end of stream.
    #[must_use]
    pub fn sample_time(&self) -> Option<i64> {
        self.current().map(|track| track.times_us[self.cursor])
    }

    /// Track of the current sample, `None` at end of stream.
    #[must_use]
    pub fn sample_track_index(&self) -> Option<usize> {
        self.current().and(self.selected)
    }

    /// True if the current sample is a sync sample.
    #[must_use]
    pub fn is_sync_sample(&self) -> bool {
        self.current().is_some_and(|track| track.sync[self.cursor])
    }

    /// Copy the current sample into `buffer`. Returns its size, or `None` at
    /// end of stream. AVC samples are returned in Annex-B framing.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Container`] if `buffer` is too small.
    pub fn read_sample_data(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, VideoError> {
        let Some(track) = self.current() else {
            return Ok(None);
        };
        let (id, framing) = (track.id, track.framing);
        let sample_id = u32::try_from(self.cursor + 1)
            .map_err(|_| VideoError::Container("sample index overflow".into()))?;
        let Some(sample) = self.reader.read_sample(id, sample_id)? else {
            return Ok(None);
        };
        let data = match framing {
            Framing::LengthPrefixed(size) => length_prefixed_to_annexb(&sample.bytes, size)?,
            Framing::Plain => sample.bytes.to_vec(),
        };
        let capacity = buffer.len();
        let target = buffer.get_mut(..data.len()).ok_or_else(|| {
            VideoError::Container(format!(
                "sample of {} bytes exceeds input buffer of {capacity}",
                data.len()
            ))
        })?;
        target.copy_from_slice(&data);
        Ok(Some(data.len()))
    }

    /// Move to the next sample. Returns false once past the last sample.
    pub fn advance(&mut self) -> bool {
        if self.current().is_some() {
            self.cursor += 1;
        }
        self.current().is_some()
    }

    /// Position at a sync sample near `time_us`.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Container`] if no track is selected.
    pub fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<(), VideoError> {
        let index = self
            .selected
            .ok_or_else(|| VideoError::Container("no track selected".into()))?;
        let track = self.track(index)?;
        let syncs: Vec<(usize, i64)> = track
            .times_us
            .iter()
            .zip(&track.sync)
            .enumerate()
            .filter(|(_, (_, sync))| **sync)
            .map(|(at, (time, _))| (at, *time))
            .collect();
        let previous = syncs.iter().rev().find(|(_, time)| *time <= time_us).copied();
        let next = syncs.iter().find(|(_, time)| *time >= time_us).copied();
        let end = track.times_us.len();

        self.cursor = match mode {
            SeekMode::PreviousSync => previous.or(next).map_or(end, |(at, _)| at),
            SeekMode::NextSync => next.map_or(end, |(at, _)| at),
            SeekMode::ClosestSync => match (previous, next) {
                (Some((before, t0)), Some((after, t1))) => {
                    if time_us - t0 <= t1 - time_us {
                        before
                    } else {
                        after
                    }
                }
                (Some((at, _)), None) | (None, Some((at, _))) => at,
                (None, None) => end,
            },
        };
        log::debug!("seek to {time_us}us ({mode:?}) landed on sample {}", self.cursor);
        Ok(())
    }
}

/// Index of the first video track, if any.
#[must_use]
pub fn select_video_track(extractor: &Extractor) -> Option<usize> {
    extractor
        .tracks
        .iter()
        .position(|track| track.format.is_video())
}

fn ticks_to_us(ticks: i128, timescale: u32) -> i64 {
    if timescale == 0 {
        return 0;
    }
    let us = ticks * 1_000_000 / i128::from(timescale);
    i64::try_from(us).unwrap_or(i64::MAX)
}

fn index_track(track: &Mp4Track) -> Result<TrackInfo, VideoError> {
    let stbl = &track.trak.mdia.minf.stbl;
    let stsd = &stbl.stsd;
    let is_video = matches!(track.track_type(), Ok(TrackType::Video));

    let (mime, framing, csd) = if let Some(avc1) = &stsd.avc1 {
        let config = AvcConfig {
            sps: avc1
                .avcc
                .sequence_parameter_sets
                .iter()
                .map(|nal| nal.bytes.clone())
                .collect(),
            pps: avc1
                .avcc
                .picture_parameter_sets
                .iter()
                .map(|nal| nal.bytes.clone())
                .collect(),
            length_size: avc1.avcc.length_size_minus_one + 1,
        };
        (
            MIME_AVC,
            Framing::LengthPrefixed(config.length_size),
            config.to_csd(),
        )
    } else if stsd.hev1.is_some() {
        (MIME_HEVC, Framing::LengthPrefixed(4), Vec::new())
    } else if stsd.vp09.is_some() {
        (MIME_VP9, Framing::Plain, Vec::new())
    } else if stsd.mp4a.is_some() {
        (MIME_AAC, Framing::Plain, Vec::new())
    } else if stsd.tx3g.is_some() {
        (MIME_TIMED_TEXT, Framing::Plain, Vec::new())
    } else if is_video {
        (MIME_RAW, Framing::Plain, Vec::new())
    } else {
        (MIME_UNKNOWN, Framing::Plain, Vec::new())
    };

    let count = track.sample_count() as usize;
    let timescale = track.timescale();

    let mut decode_times = Vec::with_capacity(count);
    let mut dts: i128 = 0;
    for entry in &stbl.stts.entries {
        for _ in 0..entry.sample_count {
            decode_times.push(dts);
            dts += i128::from(entry.sample_delta);
        }
    }
    decode_times.resize(count, dts);

    let mut offsets = Vec::with_capacity(count);
    if let Some(ctts) = &stbl.ctts {
        for entry in &ctts.entries {
            offsets.extend(std::iter::repeat_n(
                i128::from(entry.sample_offset),
                entry.sample_count as usize,
            ));
        }
    }
    offsets.resize(count, 0);

    let times_us = decode_times
        .iter()
        .zip(&offsets)
        .map(|(dts, offset)| ticks_to_us(dts + offset, timescale))
        .collect();

    let sync = match &stbl.stss {
        Some(stss) => {
            let mut sync = vec![false; count];
            for &id in &stss.entries {
                if let Some(flag) = (id as usize).checked_sub(1).and_then(|at| sync.get_mut(at)) {
                    *flag = true;
                }
            }
            sync
        }
        None => vec![true; count],
    };

    let max_sample = match stbl.stsz.sample_size {
        0 => stbl.stsz.sample_sizes.iter().copied().max().unwrap_or(0),
        fixed => fixed,
    } as usize;
    let max_input_size = match framing {
        // Start codes may replace shorter length prefixes.
        Framing::LengthPrefixed(_) => max_sample + max_sample / 2 + 64,
        Framing::Plain => max_sample,
    };

    let duration_us = ticks_to_us(i128::from(track.trak.mdia.mdhd.duration), timescale);
    let format = MediaFormat {
        mime: mime.to_owned(),
        width: u32::from(track.width()),
        height: u32::from(track.height()),
        max_input_size: Some(max_input_size),
        duration_us: Some(duration_us),
        csd,
        ..MediaFormat::default()
    };
    log::debug!("track {}: {format}, {count} samples", track.track_id());

    Ok(TrackInfo {
        id: track.track_id(),
        format,
        framing,
        times_us,
        sync,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::{Muxer, VideoFormat};
    use moviekit_codec::{BufferFlags, BufferInfo};

    /// Raw 1x1 track with the given presentation times; every third sample
    /// starting at zero is a sync sample.
    fn write_movie(path: &Path, times: &[i64]) {
        let mut muxer = Muxer::create(path, VideoFormat::Mp4).unwrap();
        muxer
            .add_track(&MediaFormat::video(MIME_RAW, 1, 1))
            .unwrap();
        muxer.start().unwrap();
        for (i, &pts) in times.iter().enumerate() {
            let flags = if i % 3 == 0 {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::NONE
            };
            let info = BufferInfo {
                offset: 0,
                size: 4,
                presentation_time_us: pts,
                flags,
            };
            muxer.write_sample_data(0, &[i as u8; 4], &info).unwrap();
        }
        muxer.stop().unwrap();
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Extractor::open(dir.path().join("absent.mp4")),
            Err(VideoError::NotFound(_))
        ));
    }

    #[test]
    fn samples_are_read_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        write_movie(&path, &[500, 1_000, 2_000]);

        let mut extractor = Extractor::open(&path).unwrap();
        assert_eq!(extractor.track_count(), 1);
        let track = select_video_track(&extractor).unwrap();
        let format = extractor.track_format(track).unwrap();
        assert_eq!(format.mime, MIME_RAW);
        assert_eq!((format.width, format.height), (1, 1));

        assert_eq!(extractor.sample_time(), None);
        extractor.select_track(track).unwrap();

        let mut buffer = [0u8; 16];
        let mut seen = Vec::new();
        while let Some(size) = extractor.read_sample_data(&mut buffer).unwrap() {
            assert_eq!(extractor.sample_track_index(), Some(track));
            seen.push((extractor.sample_time().unwrap(), buffer[..size].to_vec()));
            extractor.advance();
        }
        assert_eq!(
            seen,
            vec![
                (500, vec![0; 4]),
                (1_000, vec![1; 4]),
                (2_000, vec![2; 4]),
            ]
        );
        assert!(!extractor.advance());
        assert_eq!(extractor.sample_track_index(), None);
    }

    #[test]
    fn seek_modes_land_on_sync_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        // Sync samples at 0 and 300.
        let times: Vec<i64> = (0..6).map(|i| i * 100).collect();
        write_movie(&path, &times);

        let mut extractor = Extractor::open(&path).unwrap();
        extractor.select_track(0).unwrap();

        extractor.seek_to(250, SeekMode::PreviousSync).unwrap();
        assert_eq!(extractor.sample_time(), Some(0));
        extractor.seek_to(250, SeekMode::NextSync).unwrap();
        assert_eq!(extractor.sample_time(), Some(300));
        extractor.seek_to(200, SeekMode::ClosestSync).unwrap();
        assert_eq!(extractor.sample_time(), Some(300));
        extractor.seek_to(100, SeekMode::ClosestSync).unwrap();
        assert_eq!(extractor.sample_time(), Some(0));
        assert!(extractor.is_sync_sample());
        extractor.seek_to(400, SeekMode::NextSync).unwrap();
        assert_eq!(extractor.sample_time(), None);
    }

    #[test]
    fn small_buffer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        write_movie(&path, &[0]);

        let mut extractor = Extractor::open(&path).unwrap();
        extractor.select_track(0).unwrap();
        let mut buffer = [0u8; 2];
        let Err(VideoError::Container(message)) = extractor.read_sample_data(&mut buffer) else {
            panic!("expected a container error");
        };
        assert_eq!(message, "sample of 4 bytes exceeds input buffer of 2");
        // The cursor stays put so a larger buffer can retry.
        let mut buffer = [0u8; 4];
        assert_eq!(extractor.read_sample_data(&mut buffer).unwrap(), Some(4));
    }
}
