//! Self-describing typed fields.
//!
//! Every field starts with a one byte type tag. Integer fields follow the
//! tag with their big-endian value. Strings and binary blobs carry a
//! big-endian `u32` length between the tag and the payload: a byte count
//! for blobs, a count of UTF-16 code units for strings.

use std::{
    convert::{TryFrom, TryInto},
    io::{self, Write},
};

use byteorder::{BigEndian, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::Display;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on variable length payloads used by [`read_field`].
pub const DEFAULT_MAX_FIELD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Display, Eq, FromPrimitive, Hash, PartialEq)]
#[repr(u8)]
pub enum FieldType {
    UInt8 = 0x0f,
    UInt16 = 0x10,
    UInt32 = 0x11,
    Binary = 0x14,
    String = 0x26,
}

impl FieldType {
    pub fn from_tag(tag: u8) -> Option<FieldType> {
        FieldType::from_u8(tag)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Payload size implied by the tag, `None` for length-prefixed types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::UInt8 => Some(1),
            Self::UInt16 => Some(2),
            Self::UInt32 => Some(4),
            Self::Binary | Self::String => None,
        }
    }

    /// Bytes per unit of the length prefix.
    fn unit_size(self) -> u64 {
        match self {
            Self::String => 2,
            _ => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum FieldError {
    #[error("malformed {ty} field: {reason}")]
    MalformedField { ty: FieldType, reason: String },

    #[error("unknown field type 0x{0:02x}")]
    UnknownFieldType(u8),

    #[error("expected {expected} field, found {actual}")]
    UnexpectedFieldType {
        expected: FieldType,
        actual: FieldType,
    },

    #[error("stream ended before field was complete")]
    TruncatedStream,

    #[error("field length {len} exceeds limit of {max} bytes")]
    OversizedField { len: u64, max: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Field {
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    Binary(Vec<u8>),
    String(String),
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::UInt8(_) => FieldType::UInt8,
            Self::UInt16(_) => FieldType::UInt16,
            Self::UInt32(_) => FieldType::UInt32,
            Self::Binary(_) => FieldType::Binary,
            Self::String(_) => FieldType::String,
        }
    }

    /// Wire payload without the tag or length prefix.
    pub fn raw(&self) -> Vec<u8> {
        match self {
            Self::UInt8(val) => vec![*val],
            Self::UInt16(val) => val.to_be_bytes().to_vec(),
            Self::UInt32(val) => val.to_be_bytes().to_vec(),
            Self::Binary(val) => val.clone(),
            Self::String(val) => val.encode_utf16().flat_map(u16::to_be_bytes).collect(),
        }
    }

    pub fn encode(&self, mut w: impl Write) -> Result<(), FieldError> {
        w.write_u8(self.field_type().tag())?;
        match self {
            Self::UInt8(val) => w.write_u8(*val)?,
            Self::UInt16(val) => w.write_u16::<BigEndian>(*val)?,
            Self::UInt32(val) => w.write_u32::<BigEndian>(*val)?,
            Self::Binary(_) | Self::String(_) => {
                let payload = self.raw();
                let units = payload.len() as u64 / self.field_type().unit_size();
                let len = u32::try_from(units).map_err(|_| FieldError::OversizedField {
                    len: payload.len() as u64,
                    max: u32::MAX as u64,
                })?;
                w.write_u32::<BigEndian>(len)?;
                w.write_all(&payload)?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FieldError> {
        let mut data = Vec::new();
        self.encode(&mut data)?;
        Ok(data)
    }

    /// Builds a `U32` from a device, menu, slot and track type quadruple.
    pub fn dmst(d: u8, m: u8, s: u8, t: u8) -> Field {
        Field::UInt32(u32::from_be_bytes([d, m, s, t]))
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::UInt8(val) => Some(*val as u32),
            Self::UInt16(val) => Some(*val as u32),
            Self::UInt32(val) => Some(*val),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(val) => Some(val),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(val) => Some(val),
            _ => None,
        }
    }
}

/// Decodes a payload whose type tag has already been consumed.
pub fn decode(ty: FieldType, payload: &[u8]) -> Result<Field, FieldError> {
    let field = match ty {
        FieldType::UInt8 => Field::UInt8(u8::from_be_bytes(fixed(ty, payload)?)),
        FieldType::UInt16 => Field::UInt16(u16::from_be_bytes(fixed(ty, payload)?)),
        FieldType::UInt32 => Field::UInt32(u32::from_be_bytes(fixed(ty, payload)?)),
        FieldType::Binary => Field::Binary(payload.to_vec()),
        FieldType::String => Field::String(decode_utf16(payload)?),
    };
    Ok(field)
}

fn fixed<const N: usize>(ty: FieldType, payload: &[u8]) -> Result<[u8; N], FieldError> {
    payload.try_into().map_err(|_| FieldError::MalformedField {
        ty,
        reason: format!("expected {} payload bytes, got {}", N, payload.len()),
    })
}

fn decode_utf16(payload: &[u8]) -> Result<String, FieldError> {
    if payload.len() % 2 != 0 {
        return Err(FieldError::MalformedField {
            ty: FieldType::String,
            reason: format!("odd UTF-16 payload length {}", payload.len()),
        });
    }

    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    String::from_utf16(&units).map_err(|e| FieldError::MalformedField {
        ty: FieldType::String,
        reason: e.to_string(),
    })
}

/// Reads one field, bounding variable payloads by [`DEFAULT_MAX_FIELD_LEN`].
pub async fn read_field<R>(r: &mut R, expected: Option<FieldType>) -> Result<Field, FieldError>
where
    R: AsyncRead + Unpin,
{
    read_field_limited(r, expected, DEFAULT_MAX_FIELD_LEN).await
}

/// Reads one field from `r`.
///
/// A mismatch against `expected` is reported after consuming only the tag
/// byte. Payloads longer than `max_len` bytes are rejected before any of
/// the payload is read or allocated.
pub async fn read_field_limited<R>(
    r: &mut R,
    expected: Option<FieldType>,
    max_len: u32,
) -> Result<Field, FieldError>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    read_exact(r, &mut tag).await?;
    let ty = FieldType::from_tag(tag[0]).ok_or(FieldError::UnknownFieldType(tag[0]))?;

    if let Some(expected) = expected {
        if expected != ty {
            return Err(FieldError::UnexpectedFieldType {
                expected,
                actual: ty,
            });
        }
    }

    let len = match ty.fixed_size() {
        Some(size) => size,
        None => {
            let mut len_buf = [0u8; 4];
            read_exact(r, &mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as u64 * ty.unit_size();
            if len > max_len as u64 {
                return Err(FieldError::OversizedField {
                    len,
                    max: max_len as u64,
                });
            }
            len as usize
        }
    };

    // Grow the buffer as bytes arrive so a lying length prefix on a short
    // stream never costs more than the bytes actually sent.
    let mut payload = Vec::new();
    (&mut *r).take(len as u64).read_to_end(&mut payload).await?;
    if payload.len() != len {
        return Err(FieldError::TruncatedStream);
    }

    decode(ty, &payload)
}

async fn read_exact<R>(r: &mut R, buf: &mut [u8]) -> Result<(), FieldError>
where
    R: AsyncRead + Unpin,
{
    match r.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FieldError::TruncatedStream),
        Err(e) => Err(e.into()),
    }
}
