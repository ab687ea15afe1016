//! Fixed-width integers and base-128 variable-length integers.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::field::ByteOrder;
use crate::structure::StructureOptions;
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

/// A two's-complement integer of 1 to 8 bytes. The byte order falls back to
/// the structure default; single-byte fields need none.
#[derive(Debug, Clone)]
pub struct IntegerField {
    pub(crate) length: usize,
    pub(crate) byte_order: Option<ByteOrder>,
    pub(crate) signed: bool,
}

impl IntegerField {
    pub fn new(length: usize) -> Self {
        IntegerField { length, byte_order: None, signed: false }
    }

    pub fn big_endian(mut self) -> Self {
        self.byte_order = Some(ByteOrder::Big);
        self
    }

    pub fn little_endian(mut self) -> Self {
        self.byte_order = Some(ByteOrder::Little);
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = Some(byte_order);
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        if self.byte_order.is_none() {
            self.byte_order = options.byte_order;
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.length == 0 || self.length > 8 {
            return Err(Error::definition(format!(
                "integer field {} must be 1 to 8 bytes, not {}",
                name, self.length
            )));
        }
        if self.length > 1 && self.byte_order.is_none() {
            return Err(Error::definition(format!(
                "integer field {} needs a byte order",
                name
            )));
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> Result<u64> {
        Ok(self.length as u64)
    }

    fn order(&self) -> ByteOrder {
        self.byte_order.unwrap_or(ByteOrder::Big)
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let stream = ctx.stream()?;
        let read = stream.borrow_mut().read_up_to(self.length)?;
        if read.len() < self.length {
            return Err(Error::stream_exhausted(format!(
                "field {}: tried to read {} bytes, only {} available",
                name,
                self.length,
                read.len()
            )));
        }
        let value = if self.signed {
            let v = match self.order() {
                ByteOrder::Big => BigEndian::read_int(&read, self.length),
                ByteOrder::Little => LittleEndian::read_int(&read, self.length),
            };
            Value::Int(v)
        } else {
            let v = match self.order() {
                ByteOrder::Big => BigEndian::read_uint(&read, self.length),
                ByteOrder::Little => LittleEndian::read_uint(&read, self.length),
            };
            Value::Uint(v)
        };
        Ok((value, self.length as u64))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let mut buf = vec![0u8; self.length];
        if self.signed {
            let v = match value {
                Value::None => 0,
                v => v.as_int().ok_or_else(|| {
                    Error::overflow(format!("field {}: {} is not a signed integer", name, v))
                })?,
            };
            let (min, max) = signed_range(self.length);
            if v < min || v > max {
                return Err(Error::overflow(format!(
                    "field {}: {} out of range {}..={}",
                    name, v, min, max
                )));
            }
            match self.order() {
                ByteOrder::Big => BigEndian::write_int(&mut buf, v, self.length),
                ByteOrder::Little => LittleEndian::write_int(&mut buf, v, self.length),
            }
        } else {
            let v = match value {
                Value::None => 0,
                v => v.as_uint().ok_or_else(|| {
                    Error::overflow(format!("field {}: {} is not an unsigned integer", name, v))
                })?,
            };
            let max = unsigned_max(self.length);
            if v > max {
                return Err(Error::overflow(format!(
                    "field {}: {} out of range 0..={}",
                    name, v, max
                )));
            }
            match self.order() {
                ByteOrder::Big => BigEndian::write_uint(&mut buf, v, self.length),
                ByteOrder::Little => LittleEndian::write_uint(&mut buf, v, self.length),
            }
        }
        let stream = ctx.stream()?;
        stream.borrow_mut().write(&buf)?;
        Ok(self.length as u64)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        let prefix = if self.signed { "" } else { "u" };
        format!("{}int{}_t {}", prefix, self.length * 8, name)
    }
}

fn signed_range(length: usize) -> (i64, i64) {
    if length == 8 {
        (i64::MIN, i64::MAX)
    } else {
        let max = (1i64 << (length * 8 - 1)) - 1;
        (-max - 1, max)
    }
}

fn unsigned_max(length: usize) -> u64 {
    if length == 8 {
        u64::MAX
    } else {
        (1u64 << (length * 8)) - 1
    }
}

/// A non-negative integer in base-128 groups of 7 bits, most significant
/// group first; each byte except the last sets the continuation bit. Overlong
/// encodings are accepted on read; writes are minimal-length.
#[derive(Debug, Clone, Default)]
pub struct VarintField;

impl VarintField {
    pub fn new() -> Self {
        VarintField
    }

    pub(crate) fn len(&self) -> Result<u64> {
        Err(Error::unknown_length("varint length depends on the value"))
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let stream = ctx.stream()?;
        let mut value: u64 = 0;
        let mut consumed: u64 = 0;
        loop {
            let byte = stream.borrow_mut().read_up_to(1)?;
            let byte = *byte.first().ok_or_else(|| {
                Error::stream_exhausted(format!("field {}: stream ended inside a varint", name))
            })?;
            if value > u64::MAX >> 7 {
                return Err(Error::overflow(format!(
                    "field {}: varint does not fit in 64 bits",
                    name
                )));
            }
            value = (value << 7) | (byte & 0x7f) as u64;
            consumed += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
        Ok((Value::Uint(value), consumed))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let v = match value {
            Value::None => 0,
            v => v.as_uint().ok_or_else(|| {
                Error::overflow(format!("field {}: {} is not a non-negative integer", name, v))
            })?,
        };
        let mut groups = Vec::new();
        let mut rest = v;
        loop {
            groups.push((rest & 0x7f) as u8);
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        groups.reverse();
        let last = groups.len() - 1;
        for g in &mut groups[..last] {
            *g |= 0x80;
        }
        let stream = ctx.stream()?;
        stream.borrow_mut().write(&groups)?;
        Ok(groups.len() as u64)
    }

    /// A varint's end is found by skimming bytes until the continuation bit
    /// clears, without decoding.
    pub(crate) fn seek_end(&self, ctx: &Context) -> Result<Option<u64>> {
        let stream = ctx.stream()?;
        loop {
            let byte = stream.borrow_mut().read_up_to(1)?;
            let byte = *byte
                .first()
                .ok_or_else(|| Error::stream_exhausted("stream ended inside a varint"))?;
            if byte & 0x80 == 0 {
                break;
            }
        }
        let pos = stream.borrow_mut().tell()?;
        Ok(Some(pos))
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        format!("varint {}", name)
    }
}
