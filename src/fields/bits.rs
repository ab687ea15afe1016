//! Sub-byte fields sharing a bit cursor.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::expr::Spec;
use crate::value::Value;

/// A field of `bits` bits, MSB-first, sharing the stream's bit cursor with
/// neighbouring bit fields. The bit count may be a constant, a sibling-field
/// reference, or an expression; referencing a field installs an automatic
/// bit-length override on it, mirroring the byte-length behavior of
/// [`BytesField`](crate::fields::bytes::BytesField). With `realign` set, the
/// partial byte left after this field is discarded on read and zero-padded on
/// write, advancing the byte cursor. Bit fields cannot be lazy, and
/// offsets/skips next to them must land on byte boundaries.
#[derive(Debug, Clone)]
pub struct BitField {
    pub(crate) bits: Spec,
    pub(crate) realign: bool,
}

impl BitField {
    pub fn new(bits: impl Into<Spec>) -> Self {
        BitField { bits: bits.into(), realign: false }
    }

    pub fn realign(mut self) -> Self {
        self.realign = true;
        self
    }

    fn const_bits(&self) -> Option<u64> {
        self.bits.as_const().and_then(|v| v.as_uint())
    }

    /// Length in bits, when it does not depend on a context.
    pub fn bit_len(&self) -> Result<u64> {
        self.const_bits()
            .ok_or_else(|| Error::unknown_length("bit length depends on context"))
    }

    /// Byte length; only whole bytes convert.
    pub(crate) fn len(&self) -> Result<u64> {
        match self.const_bits() {
            Some(bits) if bits % 8 == 0 => Ok(bits / 8),
            Some(bits) => Err(Error::unknown_length(format!(
                "{} bits is not a whole number of bytes",
                bits
            ))),
            None => Err(Error::unknown_length("bit length depends on context")),
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if let Some(bits) = self.const_bits() {
            if bits == 0 || bits > 64 {
                return Err(Error::definition(format!(
                    "bit field {} must be 1 to 64 bits, not {}",
                    name, bits
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        self.bits.referenced_fields(out);
    }

    pub(crate) fn length_field_ref(&self) -> Option<&str> {
        self.bits.as_field_ref()
    }

    pub(crate) fn from_stream(&self, _name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let bits = self.bits.resolve_uint(ctx, "length")? as usize;
        let stream = ctx.stream()?;
        let mut stream = stream.borrow_mut();
        let (value, bytes_read) = stream.read_bits(bits)?;
        if self.realign {
            stream.discard_read_bits();
        }
        Ok((Value::Uint(value), bytes_read))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let bits = self.bits.resolve_uint(ctx, "length")? as usize;
        let v = match value {
            Value::None => 0,
            v => v.as_uint().ok_or_else(|| {
                Error::write(format!("field {} expects an unsigned value, got {}", name, v))
            })?,
        };
        if bits < 64 && v >= 1u64 << bits {
            return Err(Error::overflow(format!(
                "field {}: {} does not fit in {} bits",
                name, v, bits
            )));
        }
        let stream = ctx.stream()?;
        let mut stream = stream.borrow_mut();
        let mut written = stream.write_bits(v, bits)?;
        if self.realign {
            written += stream.finalize_bits()?;
        }
        Ok(written)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        match self.const_bits() {
            Some(bits) => format!("unsigned {} : {}", name, bits),
            None => format!("unsigned {} : _", name),
        }
    }
}
