//! Field primitives for the method and content codecs.
//!
//! All integers are big-endian (network order). Strings come in two
//! flavors: short (u8 length prefix) and long (u32 length prefix).
//! Adjacent boolean fields are packed into a single octet, low bit first.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};

pub const MAX_SHORT_STR: usize = 255;

pub fn put_short_str(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<()> {
    if value.len() > MAX_SHORT_STR {
        return Err(ProtoError::FieldTooLong {
            field,
            len: value.len(),
            max: MAX_SHORT_STR,
        });
    }
    dst.put_u8(value.len() as u8);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub fn get_short_str(src: &mut Bytes) -> Result<String> {
    if src.remaining() < 1 {
        return Err(ProtoError::MalformedField("short string length"));
    }
    let len = src.get_u8() as usize;
    if src.remaining() < len {
        return Err(ProtoError::MalformedField("short string body"));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtoError::MalformedField("short string utf8"))
}

pub fn put_long_str(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

pub fn get_long_str(src: &mut Bytes) -> Result<Bytes> {
    if src.remaining() < 4 {
        return Err(ProtoError::MalformedField("long string length"));
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(ProtoError::MalformedField("long string body"));
    }
    Ok(src.split_to(len))
}

/// Pack up to eight adjacent booleans into one octet, low bit first.
pub fn put_bits(dst: &mut BytesMut, bits: &[bool]) {
    debug_assert!(bits.len() <= 8);
    let mut octet = 0u8;
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            octet |= 1 << i;
        }
    }
    dst.put_u8(octet);
}

/// Unpack an octet of adjacent booleans, low bit first.
pub fn get_bits<const N: usize>(src: &mut Bytes) -> Result<[bool; N]> {
    if src.remaining() < 1 {
        return Err(ProtoError::MalformedField("bit octet"));
    }
    let octet = src.get_u8();
    let mut out = [false; N];
    for (i, bit) in out.iter_mut().enumerate() {
        *bit = octet & (1 << i) != 0;
    }
    Ok(out)
}

pub fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(ProtoError::MalformedField(field));
    }
    Ok(src.get_u8())
}

pub fn get_u16(src: &mut Bytes, field: &'static str) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(ProtoError::MalformedField(field));
    }
    Ok(src.get_u16())
}

pub fn get_u32(src: &mut Bytes, field: &'static str) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(ProtoError::MalformedField(field));
    }
    Ok(src.get_u32())
}

pub fn get_u64(src: &mut Bytes, field: &'static str) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(ProtoError::MalformedField(field));
    }
    Ok(src.get_u64())
}
