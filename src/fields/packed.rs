//! Packed-struct format fields.
//!
//! The format grammar is a subset of the classic packed-struct one: an
//! optional byte-order prefix (`@`, `=`, `<`, `>`, `!`) followed by item
//! letters, each optionally preceded by a decimal repeat count:
//!
//! | letter | type | bytes |
//! |---|---|---|
//! | `c` | one-byte bytes value | 1 |
//! | `b` / `B` | signed/unsigned byte | 1 |
//! | `?` | bool | 1 |
//! | `h` / `H` | signed/unsigned short | 2 |
//! | `i` / `I` / `l` / `L` | signed/unsigned int | 4 |
//! | `q` / `Q` | signed/unsigned long long | 8 |
//! | `n` / `N` | signed/unsigned, fixed 8 here | 8 |
//! | `e` / `f` / `d` | binary16 / binary32 / binary64 | 2 / 4 / 8 |
//!
//! There are no native-alignment padding semantics; padding must be declared
//! explicitly. `@` and `=` select the host byte order, `!` network (big).

use crate::context::Context;
use crate::error::{Error, Result};
use crate::field::ByteOrder;
use crate::structure::StructureOptions;
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

/// A field interpreting bytes according to a packed-struct format string.
/// Formats with more than one item require `multibyte` and yield a list.
#[derive(Debug, Clone)]
pub struct PackedField {
    pub(crate) format: String,
    pub(crate) byte_order: Option<ByteOrder>,
    pub(crate) multibyte: bool,
}

#[derive(Debug, Clone, Copy)]
struct Item {
    code: char,
    count: usize,
}

impl PackedField {
    pub fn new(format: impl Into<String>) -> Self {
        PackedField { format: format.into(), byte_order: None, multibyte: false }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = Some(byte_order);
        self
    }

    /// Allows formats with more than one item; the value becomes a list.
    pub fn multibyte(mut self) -> Self {
        self.multibyte = true;
        self
    }

    fn with_prefix(letter: char, byte_order: ByteOrder) -> Self {
        let prefix = match byte_order {
            ByteOrder::Big => '>',
            ByteOrder::Little => '<',
        };
        Self::new(format!("{}{}", prefix, letter))
    }

    pub fn char() -> Self {
        Self::new("c")
    }

    pub fn byte() -> Self {
        Self::new("b")
    }

    pub fn ubyte() -> Self {
        Self::new("B")
    }

    pub fn boolean() -> Self {
        Self::new("?")
    }

    pub fn short(byte_order: ByteOrder) -> Self {
        Self::with_prefix('h', byte_order)
    }

    pub fn ushort(byte_order: ByteOrder) -> Self {
        Self::with_prefix('H', byte_order)
    }

    pub fn int(byte_order: ByteOrder) -> Self {
        Self::with_prefix('i', byte_order)
    }

    pub fn uint(byte_order: ByteOrder) -> Self {
        Self::with_prefix('I', byte_order)
    }

    pub fn long(byte_order: ByteOrder) -> Self {
        Self::with_prefix('q', byte_order)
    }

    pub fn ulong(byte_order: ByteOrder) -> Self {
        Self::with_prefix('Q', byte_order)
    }

    pub fn half_float(byte_order: ByteOrder) -> Self {
        Self::with_prefix('e', byte_order)
    }

    pub fn float(byte_order: ByteOrder) -> Self {
        Self::with_prefix('f', byte_order)
    }

    pub fn double(byte_order: ByteOrder) -> Self {
        Self::with_prefix('d', byte_order)
    }

    fn parse_format(&self) -> Result<(Option<ByteOrder>, Vec<Item>)> {
        let mut chars = self.format.chars().peekable();
        let order = match chars.peek() {
            Some('>') | Some('!') => {
                chars.next();
                Some(ByteOrder::Big)
            }
            Some('<') => {
                chars.next();
                Some(ByteOrder::Little)
            }
            Some('@') | Some('=') => {
                chars.next();
                Some(host_byte_order())
            }
            _ => None,
        };
        let mut items = Vec::new();
        let mut count: Option<usize> = None;
        for c in chars {
            if c.is_ascii_digit() {
                let digit = (c as u8 - b'0') as usize;
                count = Some(count.unwrap_or(0) * 10 + digit);
                continue;
            }
            if item_size(c).is_none() {
                return Err(Error::definition(format!(
                    "unknown format letter {:?} in {:?}",
                    c, self.format
                )));
            }
            items.push(Item { code: c, count: count.take().unwrap_or(1) });
        }
        if count.is_some() {
            return Err(Error::definition(format!(
                "trailing repeat count in format {:?}",
                self.format
            )));
        }
        if items.is_empty() {
            return Err(Error::definition(format!("empty format {:?}", self.format)));
        }
        Ok((order, items))
    }

    fn resolved_order(&self, prefix: Option<ByteOrder>) -> Option<ByteOrder> {
        prefix.or(self.byte_order)
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        if self.byte_order.is_none() {
            self.byte_order = options.byte_order;
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        let (prefix, items) = self.parse_format().map_err(|e| {
            Error::definition(format!("field {}: {}", name, e))
        })?;
        let total: usize = items.iter().map(|i| i.count).sum();
        if total > 1 && !self.multibyte {
            return Err(Error::definition(format!(
                "field {}: format {:?} has {} items; set multibyte to allow this",
                name, self.format, total
            )));
        }
        let needs_order = items
            .iter()
            .any(|i| item_size(i.code).unwrap_or(1) > 1);
        if needs_order && self.resolved_order(prefix).is_none() {
            return Err(Error::definition(format!(
                "field {}: format {:?} has multi-byte items and no byte order",
                name, self.format
            )));
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> Result<u64> {
        let (_, items) = self.parse_format()?;
        let total: usize = items
            .iter()
            .map(|i| i.count * item_size(i.code).unwrap_or(0))
            .sum();
        Ok(total as u64)
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let (prefix, items) = self.parse_format()?;
        let order = self.resolved_order(prefix).unwrap_or(ByteOrder::Big);
        let total = self.len()?;
        let stream = ctx.stream()?;
        let read = stream.borrow_mut().read_up_to(total as usize)?;
        if (read.len() as u64) < total {
            return Err(Error::stream_exhausted(format!(
                "field {}: tried to read {} bytes, only {} available",
                name,
                total,
                read.len()
            )));
        }
        let mut values = Vec::new();
        let mut pos = 0;
        for item in &items {
            let size = item_size(item.code).unwrap_or(0);
            for _ in 0..item.count {
                values.push(unpack_one(item.code, order, &read[pos..pos + size]));
                pos += size;
            }
        }
        let value = if values.len() == 1 && !self.multibyte {
            values.pop().unwrap_or(Value::None)
        } else {
            Value::List(values)
        };
        Ok((value, total))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let (prefix, items) = self.parse_format()?;
        let order = self.resolved_order(prefix).unwrap_or(ByteOrder::Big);
        let total: usize = items
            .iter()
            .map(|i| i.count * item_size(i.code).unwrap_or(0))
            .sum();
        let item_count: usize = items.iter().map(|i| i.count).sum();

        let scalars: Vec<Value> = match value {
            Value::None => Vec::new(),
            Value::List(l) if self.multibyte || item_count > 1 => l.clone(),
            v => vec![v.clone()],
        };
        if !scalars.is_empty() && scalars.len() != item_count {
            return Err(Error::write(format!(
                "field {}: format {:?} packs {} values, got {}",
                name,
                self.format,
                item_count,
                scalars.len()
            )));
        }

        let mut out = Vec::with_capacity(total);
        let mut idx = 0;
        for item in &items {
            for _ in 0..item.count {
                let v = scalars.get(idx).unwrap_or(&Value::None);
                pack_one(name, item.code, order, v, &mut out)?;
                idx += 1;
            }
        }
        let stream = ctx.stream()?;
        stream.borrow_mut().write(&out)?;
        Ok(out.len() as u64)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        let ctype = match self.format.trim_start_matches(['@', '=', '<', '>', '!'].as_slice()) {
            "c" => "char",
            "b" => "int8_t",
            "B" => "uint8_t",
            "?" => "_Bool",
            "h" => "int16_t",
            "H" => "uint16_t",
            "i" | "l" => "int32_t",
            "I" | "L" => "uint32_t",
            "q" | "n" => "int64_t",
            "Q" | "N" => "uint64_t",
            "e" => "binary16",
            "f" => "float",
            "d" => "double",
            _ => "struct",
        };
        format!("{} {}", ctype, name)
    }
}

fn host_byte_order() -> ByteOrder {
    if cfg!(target_endian = "little") {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    }
}

fn item_size(code: char) -> Option<usize> {
    Some(match code {
        'c' | 'b' | 'B' | '?' => 1,
        'h' | 'H' | 'e' => 2,
        'i' | 'I' | 'l' | 'L' | 'f' => 4,
        'q' | 'Q' | 'n' | 'N' | 'd' => 8,
        _ => return None,
    })
}

fn unpack_one(code: char, order: ByteOrder, data: &[u8]) -> Value {
    let uint = |data: &[u8]| match order {
        ByteOrder::Big => BigEndian::read_uint(data, data.len()),
        ByteOrder::Little => LittleEndian::read_uint(data, data.len()),
    };
    let int = |data: &[u8]| match order {
        ByteOrder::Big => BigEndian::read_int(data, data.len()),
        ByteOrder::Little => LittleEndian::read_int(data, data.len()),
    };
    match code {
        'c' => Value::Bytes(data.to_vec()),
        'b' => Value::Int(data[0] as i8 as i64),
        'B' => Value::Uint(data[0] as u64),
        '?' => Value::Bool(data[0] != 0),
        'h' | 'i' | 'l' | 'q' | 'n' => Value::Int(int(data)),
        'H' | 'I' | 'L' | 'Q' | 'N' => Value::Uint(uint(data)),
        'e' => Value::Float(f16_bits_to_f32(uint(data) as u16) as f64),
        'f' => Value::Float(f32::from_bits(uint(data) as u32) as f64),
        'd' => Value::Float(f64::from_bits(uint(data))),
        _ => Value::None,
    }
}

fn pack_one(name: &str, code: char, order: ByteOrder, value: &Value, out: &mut Vec<u8>) -> Result<()> {
    let size = item_size(code).unwrap_or(0);
    let write_uint = |out: &mut Vec<u8>, v: u64| {
        let mut buf = vec![0u8; size];
        match order {
            ByteOrder::Big => BigEndian::write_uint(&mut buf, v, size),
            ByteOrder::Little => LittleEndian::write_uint(&mut buf, v, size),
        }
        out.extend_from_slice(&buf);
    };
    let write_int = |out: &mut Vec<u8>, v: i64| {
        let mut buf = vec![0u8; size];
        match order {
            ByteOrder::Big => BigEndian::write_int(&mut buf, v, size),
            ByteOrder::Little => LittleEndian::write_int(&mut buf, v, size),
        }
        out.extend_from_slice(&buf);
    };
    match code {
        'c' => {
            let b = match value {
                Value::None => vec![0],
                v => v
                    .as_bytes()
                    .map(|b| b.to_vec())
                    .ok_or_else(|| Error::write(format!("field {}: expected one byte", name)))?,
            };
            if b.len() != 1 {
                return Err(Error::write(format!(
                    "field {}: expected exactly one byte, got {}",
                    name,
                    b.len()
                )));
            }
            out.extend_from_slice(&b);
        }
        '?' => out.push(value.is_truthy() as u8),
        'b' | 'h' | 'i' | 'l' | 'q' | 'n' => {
            let v = value.as_int().unwrap_or(0);
            let bits = size * 8;
            let (min, max) = if size == 8 {
                (i64::MIN, i64::MAX)
            } else {
                ((-1i64) << (bits - 1), (1i64 << (bits - 1)) - 1)
            };
            if v < min || v > max {
                return Err(Error::overflow(format!(
                    "field {}: {} out of range {}..={}",
                    name, v, min, max
                )));
            }
            write_int(out, v);
        }
        'B' | 'H' | 'I' | 'L' | 'Q' | 'N' => {
            let v = match value {
                Value::None => 0,
                v => v.as_uint().ok_or_else(|| {
                    Error::overflow(format!("field {}: {} is not unsigned", name, v))
                })?,
            };
            if size < 8 && v > (1u64 << (size * 8)) - 1 {
                return Err(Error::overflow(format!(
                    "field {}: {} does not fit in {} bytes",
                    name, v, size
                )));
            }
            write_uint(out, v);
        }
        'e' => {
            let v = value.as_f64().unwrap_or(0.0);
            write_uint(out, f32_to_f16_bits(v as f32) as u64);
        }
        'f' => {
            let v = value.as_f64().unwrap_or(0.0);
            write_uint(out, (v as f32).to_bits() as u64);
        }
        'd' => {
            let v = value.as_f64().unwrap_or(0.0);
            write_uint(out, v.to_bits());
        }
        _ => {
            return Err(Error::definition(format!(
                "unknown format letter {:?}",
                code
            )))
        }
    }
    Ok(())
}

/// IEEE 754 binary16 to binary32.
fn f16_bits_to_f32(h: u16) -> f32 {
    let sign = ((h & 0x8000) as u32) << 16;
    let exp = (h >> 10) & 0x1f;
    let frac = (h & 0x3ff) as u32;
    match (exp, frac) {
        (0, 0) => f32::from_bits(sign),
        (0, f) => {
            let v = f as f32 * (-24f32).exp2();
            if sign != 0 {
                -v
            } else {
                v
            }
        }
        (0x1f, 0) => f32::from_bits(sign | 0x7f80_0000),
        (0x1f, _) => f32::from_bits(sign | 0x7fc0_0000),
        _ => f32::from_bits(sign | (((exp as u32 + 112) << 23) | (frac << 13))),
    }
}

/// IEEE 754 binary32 to binary16, round-to-nearest.
fn f32_to_f16_bits(f: f32) -> u16 {
    let x = f.to_bits();
    let sign = ((x >> 16) & 0x8000) as u16;
    let mag = x & 0x7fff_ffff;
    if mag >= 0x7f80_0000 {
        // Inf or NaN; preserve a NaN payload bit.
        let payload = if mag > 0x7f80_0000 { 0x0200 } else { 0 };
        return sign | 0x7c00 | payload;
    }
    if mag >= 0x4780_0000 {
        // Too large for binary16.
        return sign | 0x7c00;
    }
    if mag < 0x3880_0000 {
        // Subnormal target (or zero).
        if mag < 0x3300_0000 {
            return sign;
        }
        let e = mag >> 23;
        let shift = 126 - e;
        let mant = (mag & 0x007f_ffff) | 0x0080_0000;
        let half = mant >> shift;
        let round = (mant >> (shift - 1)) & 1;
        return sign | (half + round) as u16;
    }
    let half = ((mag as i64 - 0x3800_0000) >> 13) as u32;
    let round = (mag >> 12) & 1;
    sign | (half + round) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_round_trips_exact_values() {
        for v in [0.0f32, 1.0, -1.0, 0.5, 65504.0, -0.25, 1024.0] {
            let bits = f32_to_f16_bits(v);
            assert_eq!(f16_bits_to_f32(bits), v, "value {}", v);
        }
    }

    #[test]
    fn half_precision_specials() {
        assert_eq!(f32_to_f16_bits(f32::INFINITY), 0x7c00);
        assert_eq!(f32_to_f16_bits(f32::NEG_INFINITY), 0xfc00);
        assert!(f16_bits_to_f32(0x7e00).is_nan());
        assert_eq!(f32_to_f16_bits(100000.0), 0x7c00);
    }

    #[test]
    fn half_precision_subnormals() {
        // Smallest positive binary16 subnormal: 2^-24.
        let tiny = (-24f32).exp2();
        assert_eq!(f32_to_f16_bits(tiny), 0x0001);
        assert_eq!(f16_bits_to_f32(0x0001), tiny);
    }
}
