//! Order-preserving tuple codec.
//!
//! Composite keys are typed tuples serialized so that the bytewise order of
//! the packed form agrees with the element-by-element order of the values.
//! That property is what lets every store answer range queries with one
//! scan: a tuple prefix is a byte prefix, and `next_prefix` turns a byte
//! prefix into an exclusive upper bound.
//!
//! Supported element kinds: null, byte string, text string, signed integer
//! (variable width, up to 64 bits), single and double precision floats
//! (with a sign remapping so negative values sort before positive, NaN
//! included), booleans, UUIDs, nested tuples, and 10-byte versionstamps
//! which may be incomplete until the engine assigns them at commit time.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::error::{CResult, Error};

mod value;

pub use value::{Value, Versionstamp};

// Type codes. The codes themselves define the cross-kind ordering.
const NIL: u8 = 0x00;
const BYTES: u8 = 0x01;
const TEXT: u8 = 0x02;
const NESTED: u8 = 0x05;
const INT_ZERO: u8 = 0x14;
const FLOAT: u8 = 0x20;
const DOUBLE: u8 = 0x21;
const FALSE: u8 = 0x26;
const TRUE: u8 = 0x27;
const UUID: u8 = 0x30;
const VERSIONSTAMP: u8 = 0x33;

const ESCAPE: u8 = 0xff;

/// Packs a tuple of values into its order-preserving byte form.
pub fn pack(values: &[Value]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    let mut stamps = Vec::new();
    for value in values {
        encode(value, &mut buf, false, &mut stamps);
    }
    buf.to_vec()
}

/// Packs a tuple containing exactly one incomplete versionstamp, and appends
/// the little-endian offset of its placeholder so the engine can splice the
/// assigned stamp in at commit time (the form `set_versionstamped_key`
/// expects).
pub fn pack_with_versionstamp(values: &[Value]) -> CResult<Vec<u8>> {
    let mut buf = BytesMut::new();
    let mut stamps = Vec::new();
    for value in values {
        encode(value, &mut buf, false, &mut stamps);
    }
    match stamps.as_slice() {
        [offset] => {
            buf.put_u32_le(*offset as u32);
            Ok(buf.to_vec())
        }
        [] => Err(Error::InvalidInput("tuple has no incomplete versionstamp".to_string())),
        _ => Err(Error::InvalidInput("tuple has more than one incomplete versionstamp".to_string())),
    }
}

/// Reports whether any element, at any nesting depth, is a versionstamp
/// still waiting for its committed value.
pub fn has_incomplete_versionstamp(values: &[Value]) -> bool {
    values.iter().any(|value| match value {
        Value::Versionstamp(stamp) => !stamp.is_complete(),
        Value::Tuple(inner) => has_incomplete_versionstamp(inner),
        _ => false,
    })
}

/// Unpacks a packed tuple back into its values. Round trips with `pack`.
pub fn unpack(bytes: &[u8]) -> CResult<Vec<Value>> {
    let mut decoder = Decoder { bytes, pos: 0 };
    let mut out = Vec::new();
    while !decoder.done() {
        out.push(decoder.decode()?);
    }
    Ok(out)
}

/// The smallest byte string strictly greater than every string starting
/// with `key`. Fails on an empty key and on keys made only of 0xff, since
/// no such bound exists for them.
pub fn next_prefix(key: &[u8]) -> CResult<Vec<u8>> {
    let end = match key.iter().rposition(|b| *b != 0xff) {
        Some(i) => i,
        None => {
            return Err(Error::InvalidInput(
                "key must contain at least one byte not equal to 0xff".to_string(),
            ))
        }
    };
    let mut out = key[..=end].to_vec();
    out[end] += 1;
    Ok(out)
}

fn encode(value: &Value, buf: &mut BytesMut, nested: bool, stamps: &mut Vec<usize>) {
    match value {
        Value::Nil => {
            buf.put_u8(NIL);
            // inside a nested tuple, a bare 0x00 would read as the
            // terminator, so null gets an escape byte
            if nested {
                buf.put_u8(ESCAPE);
            }
        }
        Value::Bytes(bytes) => {
            buf.put_u8(BYTES);
            encode_escaped(bytes, buf);
        }
        Value::Text(text) => {
            buf.put_u8(TEXT);
            encode_escaped(text.as_bytes(), buf);
        }
        Value::Int(int) => encode_int(*int, buf),
        Value::Float(float) => {
            buf.put_u8(FLOAT);
            let mut bits = float.to_bits();
            if bits & 0x8000_0000 != 0 {
                bits = !bits;
            } else {
                bits ^= 0x8000_0000;
            }
            buf.put_u32(bits);
        }
        Value::Double(double) => {
            buf.put_u8(DOUBLE);
            let mut bits = double.to_bits();
            if bits & 0x8000_0000_0000_0000 != 0 {
                bits = !bits;
            } else {
                bits ^= 0x8000_0000_0000_0000;
            }
            buf.put_u64(bits);
        }
        Value::Bool(false) => buf.put_u8(FALSE),
        Value::Bool(true) => buf.put_u8(TRUE),
        Value::Uuid(uuid) => {
            buf.put_u8(UUID);
            buf.put_slice(uuid.as_bytes());
        }
        Value::Tuple(values) => {
            buf.put_u8(NESTED);
            for value in values {
                encode(value, buf, true, stamps);
            }
            buf.put_u8(NIL);
        }
        Value::Versionstamp(stamp) => {
            buf.put_u8(VERSIONSTAMP);
            if !stamp.is_complete() {
                stamps.push(buf.len());
            }
            buf.put_slice(&stamp.transaction_bytes());
            buf.put_u16(stamp.user_version());
        }
    }
}

fn encode_escaped(bytes: &[u8], buf: &mut BytesMut) {
    for b in bytes {
        buf.put_u8(*b);
        if *b == 0x00 {
            buf.put_u8(ESCAPE);
        }
    }
    buf.put_u8(0x00);
}

// Integers use a variable width: the code encodes the sign and the byte
// count, the payload is big-endian, and negative payloads are offset so
// that the whole family sorts numerically across widths.
fn encode_int(int: i64, buf: &mut BytesMut) {
    if int == 0 {
        buf.put_u8(INT_ZERO);
        return;
    }
    let magnitude = (int as i128).unsigned_abs();
    let mut width = 1;
    while (1u128 << (8 * width)) - 1 < magnitude {
        width += 1;
    }
    let payload = if int > 0 {
        int as u64
    } else {
        (((1i128 << (8 * width)) - 1) + int as i128) as u64
    };
    let code = if int > 0 { INT_ZERO + width as u8 } else { INT_ZERO - width as u8 };
    buf.put_u8(code);
    buf.put_slice(&payload.to_be_bytes()[8 - width..]);
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, count: usize) -> CResult<&'a [u8]> {
        if self.pos + count > self.bytes.len() {
            return Err(Error::InvalidData("truncated tuple encoding".to_string()));
        }
        let out = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(out)
    }

    fn decode(&mut self) -> CResult<Value> {
        let code = self.take(1)?[0];
        match code {
            NIL => Ok(Value::Nil),
            BYTES => Ok(Value::Bytes(self.decode_escaped()?)),
            TEXT => Ok(Value::Text(String::from_utf8(self.decode_escaped()?)?)),
            FLOAT => {
                let mut bits = BigEndian::read_u32(self.take(4)?);
                if bits & 0x8000_0000 != 0 {
                    bits ^= 0x8000_0000;
                } else {
                    bits = !bits;
                }
                Ok(Value::Float(f32::from_bits(bits)))
            }
            DOUBLE => {
                let mut bits = BigEndian::read_u64(self.take(8)?);
                if bits & 0x8000_0000_0000_0000 != 0 {
                    bits ^= 0x8000_0000_0000_0000;
                } else {
                    bits = !bits;
                }
                Ok(Value::Double(f64::from_bits(bits)))
            }
            FALSE => Ok(Value::Bool(false)),
            TRUE => Ok(Value::Bool(true)),
            UUID => Ok(Value::Uuid(Uuid::from_slice(self.take(16)?)?)),
            NESTED => {
                let mut values = Vec::new();
                loop {
                    if self.done() {
                        return Err(Error::InvalidData("unterminated nested tuple".to_string()));
                    }
                    if self.bytes[self.pos] == NIL {
                        if self.pos + 1 < self.bytes.len() && self.bytes[self.pos + 1] == ESCAPE {
                            self.pos += 2;
                            values.push(Value::Nil);
                            continue;
                        }
                        self.pos += 1;
                        break;
                    }
                    values.push(self.decode()?);
                }
                Ok(Value::Tuple(values))
            }
            VERSIONSTAMP => {
                let mut transaction = [0u8; 10];
                transaction.copy_from_slice(self.take(10)?);
                let user_version = BigEndian::read_u16(self.take(2)?);
                if transaction == [0xff; 10] {
                    Ok(Value::Versionstamp(Versionstamp::incomplete(user_version)))
                } else {
                    Ok(Value::Versionstamp(Versionstamp::complete(transaction, user_version)))
                }
            }
            code if (0x0c..=0x13).contains(&code) => {
                let width = (INT_ZERO - code) as usize;
                let payload = read_be(self.take(width)?);
                let int = payload as i128 - ((1i128 << (8 * width)) - 1);
                i64::try_from(int)
                    .map(Value::Int)
                    .map_err(|_| Error::InvalidData("integer out of range".to_string()))
            }
            code if (0x15..=0x1c).contains(&code) => {
                let width = (code - INT_ZERO) as usize;
                let payload = read_be(self.take(width)?);
                i64::try_from(payload)
                    .map(Value::Int)
                    .map_err(|_| Error::InvalidData("integer out of range".to_string()))
            }
            code => Err(Error::InvalidData(format!("unknown tuple type code {:#04x}", code))),
        }
    }

    fn decode_escaped(&mut self) -> CResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let b = self.take(1)?[0];
            if b != 0x00 {
                out.push(b);
                continue;
            }
            if self.pos < self.bytes.len() && self.bytes[self.pos] == ESCAPE {
                out.push(0x00);
                self.pos += 1;
                continue;
            }
            return Ok(out);
        }
    }
}

fn read_be(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out[8 - bytes.len()..].copy_from_slice(bytes);
    BigEndian::read_u64(&out)
}

/// Reads the little-endian placeholder offset off a `pack_with_versionstamp`
/// encoding and returns the key with the offset suffix stripped.
pub(crate) fn split_versionstamp_offset(bytes: &[u8]) -> CResult<(&[u8], usize)> {
    if bytes.len() < 4 {
        return Err(Error::InvalidData("versionstamped key too short".to_string()));
    }
    let (key, suffix) = bytes.split_at(bytes.len() - 4);
    let offset = LittleEndian::read_u32(suffix) as usize;
    if offset + 10 > key.len() {
        return Err(Error::InvalidData("versionstamp offset out of bounds".to_string()));
    }
    Ok((key, offset))
}
