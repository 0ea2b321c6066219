// Synthetic H.264-shaped stream
// Builds a valid avcC record plus length-prefixed access units with
// monotonic timestamps. Slice payloads are filler: only the framing and the
// parameter sets are meaningful.

use super::{MemorySource, Sample, SourceError};
use bytes::{BufMut, Bytes, BytesMut};

const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;

/// Description of a generated stream
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames: usize,
    /// An IDR slice is emitted every `gop` frames
    pub gop: usize,
    /// Filler bytes per slice
    pub payload_size: usize,
}

impl Default for SyntheticStream {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            frames: 300,
            gop: 30,
            payload_size: 256,
        }
    }
}

impl SyntheticStream {
    pub fn new(width: u32, height: u32, fps: u32, frames: usize) -> Self {
        Self {
            width,
            height,
            fps,
            frames,
            ..Default::default()
        }
    }

    /// Frame duration in microseconds
    pub fn frame_duration(&self) -> i64 {
        1_000_000 / i64::from(self.fps.max(1))
    }

    /// Generate the stream into an in-memory source
    pub fn build(&self) -> Result<MemorySource, SourceError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(SourceError::InvalidStream(format!(
                "Picture size must be even and non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(SourceError::InvalidStream("Frame rate must be non-zero".to_string()));
        }

        let init = Sample::new(
            Bytes::from(build_avcc(&build_sps(self.width, self.height), &build_pps(), 4)),
            0,
            0,
        );

        let duration = self.frame_duration();
        let gop = self.gop.max(1);
        let samples = (0..self.frames)
            .map(|index| {
                let nal_type = if index % gop == 0 { NAL_IDR } else { NAL_NON_IDR };
                let data = build_access_unit(nal_type, index, self.payload_size);
                Sample::new(data, index as i64 * duration, duration)
            })
            .collect();

        MemorySource::new(init, samples)
    }
}

/// One length-prefixed (4 byte) slice NAL with filler payload
fn build_access_unit(nal_type: u8, index: usize, payload_size: usize) -> Bytes {
    let nal_len = 1 + payload_size;
    let mut au = BytesMut::with_capacity(4 + nal_len);
    au.put_u32(nal_len as u32);
    au.put_u8(nal_type);
    // 0xA5 never forms a start code prefix
    au.extend(std::iter::repeat_n(0xA5, payload_size));
    if payload_size > 0 {
        au[5] = (index % 251) as u8 | 0x01;
    }
    au.freeze()
}

/// Build a constrained-baseline SPS NAL (header included) describing `width`x`height`.
/// Both dimensions must be even.
pub fn build_sps(width: u32, height: u32) -> Vec<u8> {
    let width_mbs = width.div_ceil(16);
    let height_mbs = height.div_ceil(16);
    let crop_right = (width_mbs * 16 - width) / 2;
    let crop_bottom = (height_mbs * 16 - height) / 2;
    let level = if u64::from(width) * u64::from(height) <= 1280 * 720 { 31 } else { 40 };

    let mut bits = BitWriter::default();
    bits.write_bits(66, 8); // profile_idc
    bits.write_bits(0xC0, 8); // constraint_set0/1
    bits.write_bits(level, 8);
    bits.write_ue(0); // seq_parameter_set_id
    bits.write_ue(0); // log2_max_frame_num_minus4
    bits.write_ue(2); // pic_order_cnt_type
    bits.write_ue(1); // max_num_ref_frames
    bits.write_bits(0, 1); // gaps_in_frame_num_value_allowed_flag
    bits.write_ue(width_mbs - 1);
    bits.write_ue(height_mbs - 1);
    bits.write_bits(1, 1); // frame_mbs_only_flag
    bits.write_bits(1, 1); // direct_8x8_inference_flag
    if crop_right > 0 || crop_bottom > 0 {
        bits.write_bits(1, 1);
        bits.write_ue(0);
        bits.write_ue(crop_right);
        bits.write_ue(0);
        bits.write_ue(crop_bottom);
    } else {
        bits.write_bits(0, 1);
    }
    bits.write_bits(0, 1); // vui_parameters_present_flag

    let mut nal = vec![0x67];
    nal.extend(escape_rbsp(&bits.finish_rbsp()));
    nal
}

/// A minimal PPS NAL (header included)
pub fn build_pps() -> Vec<u8> {
    vec![0x68, 0xCE, 0x3C, 0x80]
}

/// Wrap one SPS and one PPS into an avcC record
pub fn build_avcc(sps: &[u8], pps: &[u8], nal_length_size: u8) -> Vec<u8> {
    let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
    record.push(1);
    record.push(sps.get(1).copied().unwrap_or(66));
    record.push(sps.get(2).copied().unwrap_or(0));
    record.push(sps.get(3).copied().unwrap_or(31));
    record.push(0xFC | (nal_length_size.saturating_sub(1) & 0x03));
    record.push(0xE0 | 1);
    record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    record.extend_from_slice(sps);
    record.push(1);
    record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    record.extend_from_slice(pps);
    record
}

/// Insert emulation prevention bytes so the payload never contains a start code
fn escape_rbsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + 4);
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    fn write_bits(&mut self, value: u32, count: u32) {
        for shift in (0..count).rev() {
            self.current = (self.current << 1) | ((value >> shift) & 1) as u8;
            self.used += 1;
            if self.used == 8 {
                self.bytes.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    fn write_ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        let length = 64 - code.leading_zeros();
        self.write_bits(0, length - 1);
        for shift in (0..length).rev() {
            self.write_bits(((code >> shift) & 1) as u32, 1);
        }
    }

    /// Append the stop bit and pad to a byte boundary
    fn finish_rbsp(mut self) -> Vec<u8> {
        self.write_bits(1, 1);
        while self.used != 0 {
            self.write_bits(0, 1);
        }
        self.bytes
    }
}
