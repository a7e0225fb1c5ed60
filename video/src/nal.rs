//! H.264 NAL unit framing.
//!
//! Encoders emit Annex-B byte streams (start-code delimited) while MP4 stores
//! length-prefixed NAL units plus an `avcC` decoder configuration record.

use crate::VideoError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Four-byte Annex-B start code.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Sequence parameter set.
pub const NAL_SPS: u8 = 7;
/// Picture parameter set.
pub const NAL_PPS: u8 = 8;
/// Instantaneous decoder refresh slice.
pub const NAL_IDR: u8 = 5;

/// NAL unit type of `nal` (lower five bits of the header byte).
#[must_use]
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1f)
}

/// True if `data` begins with a three- or four-byte start code.
#[must_use]
pub fn has_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&START_CODE)
}

/// Split an Annex-B stream into NAL units, without start codes.
#[must_use]
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(begin) = start {
                units.push(trim_trailing_zeros(&data[begin..i]));
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(begin) = start {
        if begin < data.len() {
            units.push(&data[begin..]);
        }
    }
    units.retain(|unit| !unit.is_empty());
    units
}

// The zero byte of a four-byte start code belongs to the next unit.
fn trim_trailing_zeros(unit: &[u8]) -> &[u8] {
    let end = unit.iter().rposition(|&b| b != 0).map_or(0, |at| at + 1);
    &unit[..end]
}

/// Convert an Annex-B stream to four-byte length-prefixed NAL units.
///
/// # Errors
///
/// Returns [`VideoError::Container`] if a NAL unit exceeds 4 GiB.
pub fn annexb_to_length_prefixed(data: &[u8]) -> Result<Vec<u8>, VideoError> {
    let units = split_annexb(data);
    let mut out = Vec::with_capacity(data.len() + units.len() * 4);
    for unit in units {
        let len = u32::try_from(unit.len())
            .map_err(|_| VideoError::Container("NAL unit too large".into()))?;
        out.write_u32::<BigEndian>(len)?;
        out.extend_from_slice(unit);
    }
    Ok(out)
}

/// Convert length-prefixed NAL units (prefix of `length_size` bytes) to Annex-B.
///
/// # Errors
///
/// Returns [`VideoError::Container`] for an unsupported prefix size or a
/// truncated unit.
pub fn length_prefixed_to_annexb(data: &[u8], length_size: u8) -> Result<Vec<u8>, VideoError> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(VideoError::Container(format!(
            "unsupported NAL length size {length_size}"
        )));
    }
    let mut out = Vec::with_capacity(data.len() + 8);
    let mut reader = Cursor::new(data);
    while usize::try_from(reader.position()).unwrap_or(usize::MAX) < data.len() {
        let len = match length_size {
            1 => u32::from(reader.read_u8()?),
            2 => u32::from(reader.read_u16::<BigEndian>()?),
            _ => reader.read_u32::<BigEndian>()?,
        } as usize;
        let at = usize::try_from(reader.position()).unwrap_or(usize::MAX);
        let unit = data
            .get(at..at.saturating_add(len))
            .ok_or_else(|| VideoError::Container("truncated NAL unit".into()))?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(unit);
        reader.set_position((at + len) as u64);
    }
    Ok(out)
}

/// Parameter sets of an `avcC` decoder configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvcConfig {
    /// Sequence parameter sets, without start codes.
    pub sps: Vec<Vec<u8>>,
    /// Picture parameter sets, without start codes.
    pub pps: Vec<Vec<u8>>,
    /// Bytes of the length prefix in samples.
    pub length_size: u8,
}

impl AvcConfig {
    /// Collect parameter sets from codec-specific data buffers.
    ///
    /// Encoders deliver SPS and PPS as Annex-B streams, in one buffer or in
    /// `csd-0` and `csd-1`.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Container`] if no SPS or no PPS is present.
    pub fn from_csd(csd: &[Vec<u8>]) -> Result<Self, VideoError> {
        let mut config = Self {
            length_size: 4,
            ..Self::default()
        };
        for buffer in csd {
            let units = if has_start_code(buffer) {
                split_annexb(buffer)
            } else {
                vec![buffer.as_slice()]
            };
            for unit in units {
                match nal_type(unit) {
                    Some(NAL_SPS) => config.sps.push(unit.to_vec()),
                    Some(NAL_PPS) => config.pps.push(unit.to_vec()),
                    other => log::debug!("ignoring NAL type {other:?} in codec data"),
                }
            }
        }
        if config.sps.is_empty() || config.pps.is_empty() {
            return Err(VideoError::Container(
                "codec data lacks SPS or PPS".into(),
            ));
        }
        Ok(config)
    }

    /// Serialize as an `avcC` record body.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Container`] if the SPS is too short or a parameter
    /// set exceeds 64 KiB.
    pub fn to_avcc(&self) -> Result<Vec<u8>, VideoError> {
        let sps = self
            .sps
            .first()
            .filter(|sps| sps.len() >= 4)
            .ok_or_else(|| VideoError::Container("SPS too short".into()))?;
        let mut out = Vec::new();
        out.write_u8(1)?;
        out.write_u8(sps[1])?;
        out.write_u8(sps[2])?;
        out.write_u8(sps[3])?;
        out.write_u8(0xfc | (self.length_size.saturating_sub(1) & 0x03))?;
        write_parameter_sets(&mut out, &self.sps, 0xe0)?;
        write_parameter_sets(&mut out, &self.pps, 0)?;
        Ok(out)
    }

    /// Parse an `avcC` record body.
    ///
    /// # Errors
    ///
    /// Returns [`VideoError::Container`] on truncated input.
    pub fn parse_avcc(data: &[u8]) -> Result<Self, VideoError> {
        let mut reader = Cursor::new(data);
        let mut header = [0u8; 5];
        reader
            .read_exact(&mut header)
            .map_err(|_| VideoError::Container("truncated avcC".into()))?;
        let length_size = (header[4] & 0x03) + 1;
        let sps = read_parameter_sets(&mut reader, 0x1f)?;
        let pps = read_parameter_sets(&mut reader, 0xff)?;
        Ok(Self {
            sps,
            pps,
            length_size,
        })
    }

    /// Parameter sets as Annex-B buffers: `csd-0` holds the SPS, `csd-1` the PPS.
    #[must_use]
    pub fn to_csd(&self) -> Vec<Vec<u8>> {
        let join = |sets: &[Vec<u8>]| {
            sets.iter().fold(Vec::new(), |mut out, set| {
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(set);
                out
            })
        };
        vec![join(&self.sps), join(&self.pps)]
    }
}

fn write_parameter_sets(out: &mut Vec<u8>, sets: &[Vec<u8>], marker: u8) -> Result<(), VideoError> {
    let count = u8::try_from(sets.len())
        .ok()
        .filter(|&count| count <= 0x1f || marker == 0)
        .ok_or_else(|| VideoError::Container("too many parameter sets".into()))?;
    out.write_u8(marker | count)?;
    for set in sets {
        let len = u16::try_from(set.len())
            .map_err(|_| VideoError::Container("parameter set too large".into()))?;
        out.write_u16::<BigEndian>(len)?;
        out.extend_from_slice(set);
    }
    Ok(())
}

fn read_parameter_sets(reader: &mut Cursor<&[u8]>, mask: u8) -> Result<Vec<Vec<u8>>, VideoError> {
    let truncated = |_| VideoError::Container("truncated avcC".into());
    let count = reader.read_u8().map_err(truncated)? & mask;
    let mut sets = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len = reader.read_u16::<BigEndian>().map_err(truncated)?;
        let mut set = vec![0; usize::from(len)];
        reader.read_exact(&mut set).map_err(truncated)?;
        sets.push(set);
    }
    Ok(sets)
}
