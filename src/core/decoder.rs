//! Tracker notification decoding
//! A notification payload is a concatenation of self-describing samples. A leading
//! tag byte selects a fixed little-endian layout:
//!
//! | tag | layout                                   | columns   |
//! |-----|------------------------------------------|-----------|
//! | 0   | `u32` timestamp + 6 × `i16` gyro, accel  | 1, 2..=7  |
//! | 1   | `u32` timestamp + 4 × `f16` quaternion   | 1, 8..=11 |
//! | 2   | `u32` timestamp + 3 × `i16` magnetometer | 1, 12..=14|
//! | 66  | `u8` length + UTF-8 diagnostic text      | no row    |
//!
//! Column 0 carries the wall-clock receipt time of the whole notification. Columns a
//! sample does not produce are zero-filled. Decoding is stateless: a sample split
//! across two notifications is reported as truncated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One decoded row, sized to the characteristic's column count.
pub type Row = Vec<f64>;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("unknown sample tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },
    #[error("truncated sample (tag {tag}) at offset {offset}: need {needed} bytes, have {available}")]
    Truncated {
        tag: u8,
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// Decoders a characteristic can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    /// Tagged IMU / quaternion / magnetometer / text samples.
    Motion,
}

impl DecoderKind {
    /// Number of columns every emitted row has.
    pub fn column_count(self) -> usize {
        match self {
            DecoderKind::Motion => MOTION_ROW_LEN,
        }
    }

    pub fn decode(self, payload: &[u8], receipt_time: f64) -> Result<DecodedFrame, DecodeError> {
        match self {
            DecoderKind::Motion => decode_tagged(MOTION_LAYOUTS, MOTION_ROW_LEN, payload, receipt_time),
        }
    }
}

/// Rows decoded from one notification, plus any diagnostic text it carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    pub rows: Vec<Row>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    I16,
    F16,
}

impl Field {
    fn size(self) -> usize {
        2
    }

    fn read(self, bytes: &[u8]) -> f64 {
        let raw = [bytes[0], bytes[1]];
        match self {
            Field::I16 => i16::from_le_bytes(raw) as f64,
            Field::F16 => f16_to_f32(u16::from_le_bytes(raw)) as f64,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Body {
    /// Device timestamp followed by `count` values written from `first_column` on.
    Timestamped {
        field: Field,
        count: usize,
        first_column: usize,
    },
    /// Length-prefixed UTF-8, not emitted as a row.
    Text,
}

#[derive(Debug, Clone, Copy)]
struct SampleLayout {
    tag: u8,
    body: Body,
}

const MOTION_ROW_LEN: usize = 15;
const TIMESTAMP_LEN: usize = 4;
const RECEIPT_COLUMN: usize = 0;
const DEVICE_TIME_COLUMN: usize = 1;

const MOTION_LAYOUTS: &[SampleLayout] = &[
    SampleLayout {
        tag: 0,
        body: Body::Timestamped {
            field: Field::I16,
            count: 6,
            first_column: 2,
        },
    },
    SampleLayout {
        tag: 1,
        body: Body::Timestamped {
            field: Field::F16,
            count: 4,
            first_column: 8,
        },
    },
    SampleLayout {
        tag: 2,
        body: Body::Timestamped {
            field: Field::I16,
            count: 3,
            first_column: 12,
        },
    },
    SampleLayout {
        tag: 66,
        body: Body::Text,
    },
];

fn decode_tagged(
    layouts: &[SampleLayout],
    row_len: usize,
    payload: &[u8],
    receipt_time: f64,
) -> Result<DecodedFrame, DecodeError> {
    let mut frame = DecodedFrame::default();
    let mut offset = 0;

    while offset < payload.len() {
        let tag = payload[offset];
        let layout = layouts
            .iter()
            .find(|l| l.tag == tag)
            .ok_or(DecodeError::UnknownTag { tag, offset })?;
        let body = &payload[offset + 1..];
        let truncated = |needed: usize| DecodeError::Truncated {
            tag,
            offset,
            needed,
            available: body.len(),
        };

        let consumed = match layout.body {
            Body::Timestamped {
                field,
                count,
                first_column,
            } => {
                let needed = TIMESTAMP_LEN + count * field.size();
                if body.len() < needed {
                    return Err(truncated(needed));
                }
                let mut row = vec![0.0; row_len];
                row[RECEIPT_COLUMN] = receipt_time;
                row[DEVICE_TIME_COLUMN] =
                    u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as f64;
                for (i, chunk) in body[TIMESTAMP_LEN..needed]
                    .chunks_exact(field.size())
                    .enumerate()
                {
                    row[first_column + i] = field.read(chunk);
                }
                frame.rows.push(row);
                needed
            }
            Body::Text => {
                let Some(&len) = body.first() else {
                    return Err(truncated(1));
                };
                let needed = 1 + len as usize;
                if body.len() < needed {
                    return Err(truncated(needed));
                }
                frame
                    .diagnostics
                    .push(String::from_utf8_lossy(&body[1..needed]).into_owned());
                needed
            }
        };
        offset += 1 + consumed;
    }

    Ok(frame)
}

/// IEEE 754 binary16 to binary32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) as u32) << 31;
    let exponent = ((bits >> 10) & 0x1f) as u32;
    let mantissa = (bits & 0x3ff) as u32;

    let bits32 = match (exponent, mantissa) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalise into the f32 range.
            let shift = mantissa.leading_zeros() - 21;
            let mantissa = (mantissa << shift) & 0x3ff;
            let exponent = 127 - 15 + 1 - shift;
            sign | (exponent << 23) | (mantissa << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, _) => sign | 0x7fc0_0000 | (mantissa << 13),
        _ => sign | ((exponent + 127 - 15) << 23) | (mantissa << 13),
    };
    f32::from_bits(bits32)
}
