//! H.264 decoder configuration record (avcC) parsing
//!
//! The initialization sample carries an `AVCDecoderConfigurationRecord`.
//! We pull out the parameter sets, the NAL length prefix size and the coded
//! picture size (read from the first SPS) so the decoder session can be
//! described before any access unit is submitted.

use bytes::Bytes;
use thiserror::Error;

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Largest picture edge we accept from an SPS
const MAX_DIMENSION: u64 = 16_384;

/// Profiles that carry the chroma format / bit depth / scaling list extension
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvccError {
    #[error("Configuration record truncated at byte {0}")]
    Truncated(usize),
    #[error("Unsupported configuration version: {0}")]
    UnsupportedVersion(u8),
    #[error("Invalid NAL length size: {0}")]
    InvalidLengthSize(u8),
    #[error("Missing parameter set: {0}")]
    MissingParameterSet(&'static str),
    #[error("Invalid parameter set: {0}")]
    InvalidParameterSet(String),
    #[error("Malformed access unit: {0}")]
    MalformedFraming(String),
}

/// Codec configuration derived from the initialization sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    /// Size in bytes of the big-endian length prefix in front of each NAL unit
    pub nal_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    /// Display width after SPS cropping
    pub width: u32,
    /// Display height after SPS cropping
    pub height: u32,
}

impl CodecConfig {
    /// Parse an avcC record
    pub fn parse(record: &[u8]) -> Result<Self, AvccError> {
        let mut reader = ByteReader::new(record);

        let version = reader.u8()?;
        if version != 1 {
            return Err(AvccError::UnsupportedVersion(version));
        }

        let profile = reader.u8()?;
        let compatibility = reader.u8()?;
        let level = reader.u8()?;

        let nal_length_size = (reader.u8()? & 0x03) + 1;
        if nal_length_size == 3 {
            return Err(AvccError::InvalidLengthSize(nal_length_size));
        }

        let sps_count = reader.u8()? & 0x1f;
        let sps = read_parameter_sets(&mut reader, sps_count, NAL_TYPE_SPS)?;
        if sps.is_empty() {
            return Err(AvccError::MissingParameterSet("SPS"));
        }

        let pps_count = reader.u8()?;
        let pps = read_parameter_sets(&mut reader, pps_count, NAL_TYPE_PPS)?;
        if pps.is_empty() {
            return Err(AvccError::MissingParameterSet("PPS"));
        }

        // Anything after the PPS list (high profile extension) is ignored
        let info = SpsInfo::parse(&sps[0])?;

        Ok(Self {
            profile,
            compatibility,
            level,
            nal_length_size,
            sps,
            pps,
            width: info.width,
            height: info.height,
        })
    }

    /// Whether a session built for `self` can keep decoding a stream described by `other`
    pub fn same_parameter_sets(&self, other: &CodecConfig) -> bool {
        self.nal_length_size == other.nal_length_size && self.sps == other.sps && self.pps == other.pps
    }
}

/// Picture parameters read from a sequence parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u8,
    pub frame_mbs_only: bool,
    pub width: u32,
    pub height: u32,
}

impl SpsInfo {
    /// Parse an SPS NAL unit (including its one byte header)
    pub fn parse(nal: &[u8]) -> Result<Self, AvccError> {
        let (&header, payload) = nal
            .split_first()
            .ok_or_else(|| sps_error("empty NAL unit"))?;
        if header & 0x1f != NAL_TYPE_SPS {
            return Err(sps_error(format!("NAL type {} is not an SPS", header & 0x1f)));
        }

        let rbsp = unescape_rbsp(payload);
        let mut bits = BitReader::new(&rbsp);

        let profile_idc = bits.read_bits(8)? as u8;
        let _constraint_flags = bits.read_bits(8)?;
        let level_idc = bits.read_bits(8)? as u8;

        let sps_id = bits.read_ue()?;
        if sps_id > 31 {
            return Err(sps_error(format!("SPS id {} out of range", sps_id)));
        }

        let mut chroma_format_idc = 1;
        let mut separate_colour_plane = false;
        if HIGH_PROFILES.contains(&profile_idc) {
            chroma_format_idc = bits.read_ue()?;
            if chroma_format_idc > 3 {
                return Err(sps_error(format!("chroma_format_idc {}", chroma_format_idc)));
            }
            if chroma_format_idc == 3 {
                separate_colour_plane = bits.read_flag()?;
            }
            let _bit_depth_luma_minus8 = bits.read_ue()?;
            let _bit_depth_chroma_minus8 = bits.read_ue()?;
            let _qpprime_y_zero_transform_bypass = bits.read_flag()?;

            if bits.read_flag()? {
                let lists = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..lists {
                    if bits.read_flag()? {
                        skip_scaling_list(&mut bits, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let _log2_max_frame_num_minus4 = bits.read_ue()?;
        match bits.read_ue()? {
            0 => {
                let _log2_max_poc_lsb_minus4 = bits.read_ue()?;
            }
            1 => {
                let _delta_pic_order_always_zero = bits.read_flag()?;
                let _offset_for_non_ref_pic = bits.read_se()?;
                let _offset_for_top_to_bottom_field = bits.read_se()?;
                let cycle = bits.read_ue()?;
                if cycle > 255 {
                    return Err(sps_error("POC cycle too long"));
                }
                for _ in 0..cycle {
                    bits.read_se()?;
                }
            }
            2 => {}
            other => return Err(sps_error(format!("pic_order_cnt_type {}", other))),
        }

        let _max_num_ref_frames = bits.read_ue()?;
        let _gaps_in_frame_num_allowed = bits.read_flag()?;
        let width_mbs = u64::from(bits.read_ue()?) + 1;
        let height_map_units = u64::from(bits.read_ue()?) + 1;
        let frame_mbs_only = bits.read_flag()?;
        if !frame_mbs_only {
            let _mb_adaptive_frame_field = bits.read_flag()?;
        }
        let _direct_8x8_inference = bits.read_flag()?;

        let (crop_left, crop_right, crop_top, crop_bottom) = if bits.read_flag()? {
            (
                u64::from(bits.read_ue()?),
                u64::from(bits.read_ue()?),
                u64::from(bits.read_ue()?),
                u64::from(bits.read_ue()?),
            )
        } else {
            (0, 0, 0, 0)
        };
        // VUI is not needed for session setup

        let field_factor: u64 = if frame_mbs_only { 1 } else { 2 };
        let (crop_unit_x, crop_unit_y) = if chroma_format_idc == 0 || separate_colour_plane {
            (1, field_factor)
        } else {
            let sub_width = if chroma_format_idc == 3 { 1 } else { 2 };
            let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };
            (sub_width, sub_height * field_factor)
        };

        let coded_width = width_mbs * 16;
        let coded_height = field_factor * height_map_units * 16;
        let width = coded_width
            .checked_sub(crop_unit_x * (crop_left + crop_right))
            .filter(|w| (1..=MAX_DIMENSION).contains(w))
            .ok_or_else(|| sps_error("picture width out of range"))?;
        let height = coded_height
            .checked_sub(crop_unit_y * (crop_top + crop_bottom))
            .filter(|h| (1..=MAX_DIMENSION).contains(h))
            .ok_or_else(|| sps_error("picture height out of range"))?;

        Ok(Self {
            profile_idc,
            level_idc,
            chroma_format_idc: chroma_format_idc as u8,
            frame_mbs_only,
            width: width as u32,
            height: height as u32,
        })
    }
}

/// Split a length-prefixed access unit into its NAL units
pub fn split_nal_units(data: &[u8], length_size: u8) -> Result<Vec<&[u8]>, AvccError> {
    let prefix = length_size as usize;
    if !matches!(prefix, 1 | 2 | 4) {
        return Err(AvccError::InvalidLengthSize(length_size));
    }
    if data.is_empty() {
        return Err(AvccError::MalformedFraming("empty access unit".to_string()));
    }

    let mut units = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let Some(length_bytes) = data.get(offset..offset + prefix) else {
            return Err(AvccError::MalformedFraming(format!(
                "length prefix truncated at byte {}",
                offset
            )));
        };
        let length = length_bytes
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | b as usize);
        offset += prefix;

        if length == 0 {
            return Err(AvccError::MalformedFraming(format!("zero-length NAL unit at byte {}", offset)));
        }
        let Some(unit) = data.get(offset..offset + length) else {
            return Err(AvccError::MalformedFraming(format!(
                "NAL unit of {} bytes overruns access unit ({} bytes left)",
                length,
                data.len() - offset
            )));
        };
        units.push(unit);
        offset += length;
    }

    Ok(units)
}

/// Strip emulation prevention bytes (`00 00 03`) from a NAL payload
pub fn unescape_rbsp(payload: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(payload.len());
    let mut zeros = 0;
    for &byte in payload {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        rbsp.push(byte);
    }
    rbsp
}

fn read_parameter_sets(
    reader: &mut ByteReader<'_>,
    count: u8,
    nal_type: u8,
) -> Result<Vec<Bytes>, AvccError> {
    let mut sets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let length = reader.u16()? as usize;
        let nal = reader.take(length)?;
        match nal.first() {
            Some(header) if header & 0x1f == nal_type => sets.push(Bytes::copy_from_slice(nal)),
            Some(header) => {
                return Err(AvccError::InvalidParameterSet(format!(
                    "expected NAL type {}, found {}",
                    nal_type,
                    header & 0x1f
                )));
            }
            None => {
                return Err(AvccError::InvalidParameterSet("empty parameter set".to_string()));
            }
        }
    }
    Ok(sets)
}

fn skip_scaling_list(bits: &mut BitReader<'_>, size: usize) -> Result<(), AvccError> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = bits.read_se()?;
            next_scale = (last_scale + delta).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

fn sps_error(msg: impl Into<String>) -> AvccError {
    AvccError::InvalidParameterSet(format!("SPS: {}", msg.into()))
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], AvccError> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(AvccError::Truncated(self.pos))?;
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, AvccError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, AvccError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// MSB-first bit reader over an RBSP
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<u32, AvccError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| sps_error("truncated"))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(u32::from(bit))
    }

    fn read_flag(&mut self) -> Result<bool, AvccError> {
        Ok(self.read_bit()? == 1)
    }

    fn read_bits(&mut self, count: u32) -> Result<u32, AvccError> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Unsigned Exp-Golomb
    fn read_ue(&mut self) -> Result<u32, AvccError> {
        let mut leading_zeros = 0;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(sps_error("Exp-Golomb code too long"));
            }
        }
        let suffix = u64::from(self.read_bits(leading_zeros)?);
        Ok(((1u64 << leading_zeros) - 1 + suffix) as u32)
    }

    /// Signed Exp-Golomb
    fn read_se(&mut self) -> Result<i32, AvccError> {
        let code = i64::from(self.read_ue()?);
        let value = if code % 2 == 1 { (code + 1) / 2 } else { -(code / 2) };
        Ok(value as i32)
    }
}
