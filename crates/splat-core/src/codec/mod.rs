//! Binary point-cloud codec.
//!
//! Reads the fixed-schema gaussian-splat PLY produced by the generation tool,
//! drops corrupt points, and re-encodes either as a cleaned PLY or as the
//! compact `SPLC` stream consumed by the web viewer. Everything here is pure:
//! callers hand in byte buffers and get byte buffers back.

mod clean;
mod compact;
mod ply;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub use clean::{CleanReport, clean};
pub use compact::{COMPACT_HEADER_LEN, COMPACT_MAGIC, COMPACT_STRIDE, COMPACT_VERSION};
pub use ply::{MAX_HEADER_BYTES, PLY_PROPERTIES, RECORD_STRIDE, parse};

/// Zeroth-order spherical-harmonic basis constant.
pub const SH_C0: f64 = 0.282_094_791_773_878_14;

/// Number of `f32` fields in one input record.
pub const FLOATS_PER_RECORD: usize = 14;

/// One gaussian point as laid out in the input schema.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointRecord {
    pub position: [f32; 3],
    pub scale: [f32; 3],
    /// Quaternion, `w` first.
    pub rotation: [f32; 4],
    pub opacity: f32,
    /// Order-0 spherical-harmonic color terms.
    pub sh_dc: [f32; 3],
}

impl PointRecord {
    /// Renderer-ready RGB triple derived from the SH DC terms.
    pub fn rgb(&self) -> [f32; 3] {
        self.sh_dc.map(sh_to_rgb)
    }

    fn is_finite(&self) -> bool {
        self.position
            .iter()
            .chain(&self.scale)
            .chain(&self.rotation)
            .chain(std::iter::once(&self.opacity))
            .chain(&self.sh_dc)
            .all(|v| v.is_finite())
    }
}

/// How the `opacity` property of a cloud is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OpacityEncoding {
    /// Pre-sigmoid logit, the convention of 3DGS training output.
    #[default]
    Logit,
    /// Already in `[0, 1]`.
    Linear,
}

/// A decoded cloud together with the opacity convention its records use.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    pub records: Vec<PointRecord>,
    /// Encoding of `records[..].opacity` right now.
    pub opacity: OpacityEncoding,
    /// Encoding the source file used; PLY output is written back in it.
    pub source_opacity: OpacityEncoding,
}

impl PointCloud {
    pub fn new(records: Vec<PointRecord>, opacity: OpacityEncoding) -> Self {
        Self {
            records,
            opacity,
            source_opacity: opacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Output layout for [`serialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TargetFormat {
    /// The input schema, re-emitted with a normalized header.
    #[default]
    Ply,
    /// Versioned fixed-stride `SPLC` stream.
    Compact,
}

impl TargetFormat {
    /// File extension used for artifacts in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Ply => "ply",
            TargetFormat::Compact => "splat",
        }
    }
}

/// File-level decode failures. Per-record corruption never shows up here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("header terminator `end_header` not found within {limit} bytes")]
    MissingHeaderEnd { limit: usize },

    #[error("header is not valid ASCII")]
    NonAsciiHeader,

    #[error("not a PLY file (first line {found:?})")]
    BadMagic { found: String },

    #[error("unsupported format line {found:?}, expected binary_little_endian 1.0")]
    UnsupportedFormat { found: String },

    #[error("malformed header line {line:?}")]
    MalformedHeader { line: String },

    #[error("no `element vertex` declaration")]
    MissingVertexElement,

    #[error("element {name:?} precedes the vertex element")]
    ElementBeforeVertex { name: String },

    #[error("vertex property list mismatch: expected {expected:?}, found {found:?}")]
    PropertyMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("payload truncated: {vertices} vertices need {expected} bytes, found {actual}")]
    Truncated {
        vertices: usize,
        expected: usize,
        actual: usize,
    },
}

/// Derive one display channel from a SH DC coefficient.
pub fn sh_to_rgb(sh_dc: f32) -> f32 {
    (0.5 + SH_C0 * f64::from(sh_dc)).clamp(0.0, 1.0) as f32
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn logit(p: f32) -> f32 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

/// Convert an opacity value between storage conventions.
pub(crate) fn reencode_opacity(value: f32, from: OpacityEncoding, to: OpacityEncoding) -> f32 {
    match (from, to) {
        (OpacityEncoding::Linear, OpacityEncoding::Logit) => logit(value),
        (OpacityEncoding::Logit, OpacityEncoding::Linear) => sigmoid(value),
        _ => value,
    }
}

/// Encode `cloud` in the requested layout.
pub fn serialize(cloud: &PointCloud, format: TargetFormat) -> Vec<u8> {
    match format {
        TargetFormat::Ply => ply::write(cloud),
        TargetFormat::Compact => compact::write(cloud),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_zero_maps_to_half_exactly() {
        assert_eq!(sh_to_rgb(0.0), 0.5);
    }

    #[test]
    fn sh_extremes_clamp() {
        assert_eq!(sh_to_rgb(1.0e6), 1.0);
        assert_eq!(sh_to_rgb(-1.0e6), 0.0);
        assert_eq!(sh_to_rgb(f32::MAX), 1.0);
    }

    #[test]
    fn sh_is_linear_inside_the_clamp_range() {
        let v = sh_to_rgb(1.0);
        assert!((v - 0.782_094_8).abs() < 1e-6, "got {v}");
    }

    #[test]
    fn logit_inverts_sigmoid() {
        for x in [-5.0_f32, -0.5, 0.0, 0.25, 3.0] {
            assert!((logit(sigmoid(x)) - x).abs() < 1e-3, "x = {x}");
        }
    }

    #[test]
    fn target_format_parses_from_config_strings() {
        assert_eq!("compact".parse::<TargetFormat>().unwrap(), TargetFormat::Compact);
        assert_eq!("PLY".parse::<TargetFormat>().unwrap(), TargetFormat::Ply);
        assert_eq!(TargetFormat::Compact.extension(), "splat");
        assert_eq!("linear".parse::<OpacityEncoding>().unwrap(), OpacityEncoding::Linear);
    }
}
