use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use super::{CodecError, FLOATS_PER_RECORD, OpacityEncoding, PointCloud, PointRecord};

/// Upper bound on the ASCII header, terminator included.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Bytes per input record.
pub const RECORD_STRIDE: usize = FLOATS_PER_RECORD * std::mem::size_of::<f32>();

/// Vertex properties in declaration order.
pub const PLY_PROPERTIES: [&str; FLOATS_PER_RECORD] = [
    "x", "y", "z", "scale_0", "scale_1", "scale_2", "rot_0", "rot_1", "rot_2", "rot_3", "opacity",
    "f_dc_0", "f_dc_1", "f_dc_2",
];

const END_HEADER: &[u8] = b"\nend_header\n";

/// Decode a binary little-endian gaussian PLY.
///
/// `opacity` states how the file stores its opacity column; the records are
/// returned untouched so that re-serializing them reproduces the input bytes.
pub fn parse(bytes: &[u8], opacity: OpacityEncoding) -> Result<PointCloud, CodecError> {
    let header_len = header_len(bytes)?;
    let header = std::str::from_utf8(&bytes[..header_len])
        .ok()
        .filter(|h| h.is_ascii())
        .ok_or(CodecError::NonAsciiHeader)?;
    let vertices = parse_header(header)?;

    let payload = &bytes[header_len..];
    let expected = vertices.checked_mul(RECORD_STRIDE).unwrap_or(usize::MAX);
    if payload.len() < expected {
        return Err(CodecError::Truncated {
            vertices,
            expected,
            actual: payload.len(),
        });
    }
    if payload.len() > expected {
        debug!(
            trailing = payload.len() - expected,
            "ignoring data after the vertex block"
        );
    }

    let mut buf = &payload[..expected];
    let mut records = Vec::with_capacity(vertices);
    while buf.has_remaining() {
        records.push(read_record(&mut buf));
    }
    Ok(PointCloud::new(records, opacity))
}

/// Offset of the first payload byte.
fn header_len(bytes: &[u8]) -> Result<usize, CodecError> {
    let window = &bytes[..bytes.len().min(MAX_HEADER_BYTES)];
    window
        .windows(END_HEADER.len())
        .position(|w| w == END_HEADER)
        .map(|pos| pos + END_HEADER.len())
        .ok_or(CodecError::MissingHeaderEnd {
            limit: MAX_HEADER_BYTES,
        })
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Vertex,
    Other,
}

/// Validate the header and return the vertex count.
fn parse_header(header: &str) -> Result<usize, CodecError> {
    let mut lines = header.lines();
    let magic = lines.next().unwrap_or_default().trim_end();
    if magic != "ply" {
        return Err(CodecError::BadMagic {
            found: magic.to_owned(),
        });
    }

    let mut format_seen = false;
    let mut section = Section::Preamble;
    let mut vertices = None;
    let mut found = Vec::new();

    for line in lines {
        let line = line.trim_end();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let malformed = || CodecError::MalformedHeader {
            line: line.to_owned(),
        };
        match tokens.as_slice() {
            ["format", "binary_little_endian", "1.0"] => format_seen = true,
            ["format", ..] => {
                return Err(CodecError::UnsupportedFormat {
                    found: line.to_owned(),
                });
            }
            ["comment", ..] | ["obj_info", ..] | [] => {}
            ["element", "vertex", count] => {
                if vertices.is_some() {
                    return Err(malformed());
                }
                vertices = Some(count.parse::<usize>().map_err(|_| malformed())?);
                section = Section::Vertex;
            }
            ["element", name, count] => {
                if vertices.is_none() {
                    return Err(CodecError::ElementBeforeVertex {
                        name: (*name).to_owned(),
                    });
                }
                count.parse::<usize>().map_err(|_| malformed())?;
                section = Section::Other;
            }
            ["property", rest @ ..] => match section {
                Section::Vertex => found.push(normalize_property(rest)),
                Section::Other => {}
                Section::Preamble => return Err(malformed()),
            },
            ["end_header"] => break,
            _ => return Err(malformed()),
        }
    }

    if !format_seen {
        return Err(CodecError::UnsupportedFormat {
            found: String::new(),
        });
    }
    let vertices = vertices.ok_or(CodecError::MissingVertexElement)?;

    let expected: Vec<String> = PLY_PROPERTIES.iter().map(|p| format!("float {p}")).collect();
    if found != expected {
        return Err(CodecError::PropertyMismatch { expected, found });
    }
    Ok(vertices)
}

fn normalize_property(tokens: &[&str]) -> String {
    match tokens {
        ["float32", name] => format!("float {name}"),
        other => other.join(" "),
    }
}

fn read_record(buf: &mut impl Buf) -> PointRecord {
    let mut next = || buf.get_f32_le();
    PointRecord {
        position: [next(), next(), next()],
        scale: [next(), next(), next()],
        rotation: [next(), next(), next(), next()],
        opacity: next(),
        sh_dc: [next(), next(), next()],
    }
}

/// Emit the fixed-schema header followed by the records.
pub(super) fn write(cloud: &PointCloud) -> Vec<u8> {
    let mut header = format!(
        "ply\nformat binary_little_endian 1.0\nelement vertex {}\n",
        cloud.len()
    );
    for property in PLY_PROPERTIES {
        header.push_str("property float ");
        header.push_str(property);
        header.push('\n');
    }
    header.push_str("end_header\n");

    let mut out = BytesMut::with_capacity(header.len() + cloud.len() * RECORD_STRIDE);
    out.put_slice(header.as_bytes());
    for record in &cloud.records {
        let opacity = super::reencode_opacity(record.opacity, cloud.opacity, cloud.source_opacity);
        record.position.iter().for_each(|v| out.put_f32_le(*v));
        record.scale.iter().for_each(|v| out.put_f32_le(*v));
        record.rotation.iter().for_each(|v| out.put_f32_le(*v));
        out.put_f32_le(opacity);
        record.sh_dc.iter().for_each(|v| out.put_f32_le(*v));
    }
    out.to_vec()
}
