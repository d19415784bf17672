//! `SPLC` v1: fixed-stride stream for the web viewer.
//!
//! ```text
//! header (16 bytes, little-endian)
//!   0..4   magic  b"SPLC"
//!   4..6   version u16 = 1
//!   6..8   flags   u16 = 0
//!   8..12  count   u32
//!   12..16 stride  u32 = 32
//! record (32 bytes)
//!   0..12  position  3 x f32
//!   12..24 scale     3 x f32, exp() of the stored log-scale
//!   24..28 rgba      4 x u8, rgb from the SH DC terms, a = opacity
//!   28..32 rotation  4 x u8, normalized quaternion mapped from [-1, 1]
//! ```
//!
//! All color and opacity math is done here so the renderer only unpacks.

use bytes::{BufMut, BytesMut};

use super::{OpacityEncoding, PointCloud, PointRecord, reencode_opacity};

pub const COMPACT_MAGIC: &[u8; 4] = b"SPLC";
pub const COMPACT_VERSION: u16 = 1;
pub const COMPACT_HEADER_LEN: usize = 16;
pub const COMPACT_STRIDE: usize = 32;

pub(super) fn write(cloud: &PointCloud) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(COMPACT_HEADER_LEN + cloud.len() * COMPACT_STRIDE);
    out.put_slice(COMPACT_MAGIC);
    out.put_u16_le(COMPACT_VERSION);
    out.put_u16_le(0);
    out.put_u32_le(u32::try_from(cloud.len()).unwrap_or(u32::MAX));
    out.put_u32_le(COMPACT_STRIDE as u32);

    for record in &cloud.records {
        write_record(&mut out, record, cloud.opacity);
    }
    out.to_vec()
}

fn write_record(out: &mut BytesMut, record: &PointRecord, opacity: OpacityEncoding) {
    record.position.iter().for_each(|v| out.put_f32_le(*v));
    for s in record.scale {
        let linear = s.exp();
        out.put_f32_le(if linear.is_finite() { linear } else { f32::MAX });
    }

    let [r, g, b] = record.rgb();
    let alpha = reencode_opacity(record.opacity, opacity, OpacityEncoding::Linear).clamp(0.0, 1.0);
    for channel in [r, g, b, alpha] {
        out.put_u8(unit_to_u8(channel));
    }

    let norm = record
        .rotation
        .iter()
        .map(|v| f64::from(*v).powi(2))
        .sum::<f64>()
        .sqrt();
    for q in record.rotation {
        let q = if norm > f64::EPSILON {
            (f64::from(q) / norm) as f32
        } else {
            0.0
        };
        out.put_u8(((q.clamp(-1.0, 1.0) * 127.5) + 127.5).round() as u8);
    }
}

fn unit_to_u8(v: f32) -> u8 {
    if v.is_nan() {
        return 0;
    }
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}
