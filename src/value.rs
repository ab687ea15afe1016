//! Runtime values produced by parsing and accepted by emitting.

use crate::context::LazyValue;
use crate::error::{Error, Result};
use crate::structure::StructValue;
use std::fmt;

/// A single decoded value (field or compound).
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value: unset field, falsy conditional fallback.
    None,
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Struct(StructValue),
    Enum(EnumValue),
    /// Deferred value; resolves against the retained stream on first use.
    Lazy(LazyValue),
}

/// A decoded enum member (or flag combination) with its raw value.
#[derive(Debug, Clone)]
pub struct EnumValue {
    /// Member name; flag combinations join names with `|`.
    pub name: String,
    pub value: u64,
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Truthiness used by conditions: `None`, `false`, zero, and empty
    /// containers are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Uint(x) => *x != 0,
            Value::Int(x) => *x != 0,
            Value::Float(x) => *x != 0.0,
            Value::Bytes(b) => !b.is_empty(),
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Struct(_) => true,
            Value::Enum(e) => e.value != 0,
            Value::Lazy(l) => l.forced().map(|v| v.is_truthy()).unwrap_or(true),
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(x) => Some(*x),
            Value::Int(x) => (*x).try_into().ok(),
            Value::Bool(b) => Some(*b as u64),
            Value::Enum(e) => Some(e.value),
            Value::Lazy(l) => l.forced().and_then(|v| v.as_uint()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(x) => Some(*x),
            Value::Uint(x) => (*x).try_into().ok(),
            Value::Bool(b) => Some(*b as i64),
            Value::Enum(e) => e.value.try_into().ok(),
            Value::Lazy(l) => l.forced().and_then(|v| v.as_int()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Uint(x) => Some(*x as f64),
            Value::Int(x) => Some(*x as f64),
            Value::Lazy(l) => l.forced().and_then(|v| v.as_f64()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Resolves a lazy proxy to its concrete value; other values pass through.
    pub fn resolve(self) -> Result<Value> {
        match self {
            Value::Lazy(l) => l.force(),
            other => Ok(other),
        }
    }

    /// Logical length: byte count for bytes/strings, element count for lists,
    /// field count for structs.
    pub fn length(&self) -> Result<u64> {
        match self {
            Value::Bytes(b) => Ok(b.len() as u64),
            Value::Str(s) => Ok(s.len() as u64),
            Value::List(l) => Ok(l.len() as u64),
            Value::Struct(s) => Ok(s.len() as u64),
            Value::Lazy(l) => l.force()?.length(),
            other => Err(Error::parse(format!("value {} has no length", other))),
        }
    }

    /// Number of bits needed to represent the value's magnitude; zero for
    /// zero.
    pub fn bit_length(&self) -> Result<u64> {
        match self.numeric()? {
            Numeric::Int(x) => Ok((128 - x.unsigned_abs().leading_zeros()) as u64),
            Numeric::Float(_) => {
                Err(Error::parse("floating point values have no bit length"))
            }
        }
    }

    /// Numeric view used by expression arithmetic. Integers (and bools and
    /// enum members) widen to i128 so mixed signedness cannot overflow.
    fn numeric(&self) -> Result<Numeric> {
        match self {
            Value::Bool(b) => Ok(Numeric::Int(*b as i128)),
            Value::Uint(x) => Ok(Numeric::Int(*x as i128)),
            Value::Int(x) => Ok(Numeric::Int(*x as i128)),
            Value::Enum(e) => Ok(Numeric::Int(e.value as i128)),
            Value::Float(x) => Ok(Numeric::Float(*x)),
            Value::Lazy(l) => l.force()?.numeric(),
            other => Err(Error::parse(format!("value {} is not numeric", other))),
        }
    }

    fn from_i128(x: i128) -> Result<Value> {
        if x >= 0 {
            u64::try_from(x)
                .map(Value::Uint)
                .map_err(|_| Error::overflow(format!("{} does not fit in 64 bits", x)))
        } else {
            i64::try_from(x)
                .map(Value::Int)
                .map_err(|_| Error::overflow(format!("{} does not fit in 64 bits", x)))
        }
    }

    pub(crate) fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value> {
        use ArithOp::*;
        // Concatenation shortcuts before the numeric path.
        if op == Add {
            match (lhs, rhs) {
                (Value::Bytes(a), Value::Bytes(b)) => {
                    let mut out = a.clone();
                    out.extend_from_slice(b);
                    return Ok(Value::Bytes(out));
                }
                (Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{}{}", a, b))),
                _ => {}
            }
        }
        let (a, b) = (lhs.numeric()?, rhs.numeric()?);
        match (a, b) {
            (Numeric::Int(a), Numeric::Int(b)) => {
                let r = match op {
                    Add => a.checked_add(b),
                    Sub => a.checked_sub(b),
                    Mul => a.checked_mul(b),
                    Div | FloorDiv => {
                        if b == 0 {
                            return Err(Error::parse("division by zero"));
                        }
                        Some(a.div_euclid(b))
                    }
                    Rem => {
                        if b == 0 {
                            return Err(Error::parse("division by zero"));
                        }
                        Some(a.rem_euclid(b))
                    }
                    Shl => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)),
                    Shr => u32::try_from(b).ok().and_then(|s| a.checked_shr(s)),
                    BitAnd => Some(a & b),
                    BitOr => Some(a | b),
                    BitXor => Some(a ^ b),
                };
                let r = r.ok_or_else(|| Error::overflow(format!("{:?} of {} and {}", op, a, b)))?;
                Value::from_i128(r)
            }
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                let r = match op {
                    Add => a + b,
                    Sub => a - b,
                    Mul => a * b,
                    Div => a / b,
                    FloorDiv => (a / b).floor(),
                    Rem => a.rem_euclid(b),
                    _ => {
                        return Err(Error::parse(format!(
                            "{:?} is not defined for floating point values",
                            op
                        )))
                    }
                };
                Ok(Value::Float(r))
            }
        }
    }

    pub(crate) fn neg(&self) -> Result<Value> {
        match self.numeric()? {
            Numeric::Int(x) => Value::from_i128(-x),
            Numeric::Float(x) => Ok(Value::Float(-x)),
        }
    }

    pub(crate) fn invert(&self) -> Result<Value> {
        match self.numeric()? {
            Numeric::Int(x) => Value::from_i128(!x),
            Numeric::Float(_) => Err(Error::parse("~ is not defined for floating point values")),
        }
    }

    /// Ordering used by comparison expressions; numeric values compare by
    /// magnitude, bytes and strings lexicographically.
    pub(crate) fn compare(&self, other: &Value) -> Result<std::cmp::Ordering> {
        match (self, other) {
            (Value::Bytes(a), Value::Bytes(b)) => Ok(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            _ => {
                let (a, b) = (self.numeric()?, other.numeric()?);
                match (a, b) {
                    (Numeric::Int(a), Numeric::Int(b)) => Ok(a.cmp(&b)),
                    (a, b) => a
                        .as_f64()
                        .partial_cmp(&b.as_f64())
                        .ok_or_else(|| Error::parse("NaN is not comparable")),
                }
            }
        }
    }

    /// Index into a list (by number) or a struct (by name).
    pub(crate) fn index(&self, idx: &Value) -> Result<Value> {
        match self {
            Value::List(l) => {
                let i = idx
                    .as_uint()
                    .ok_or_else(|| Error::parse(format!("invalid list index {}", idx)))?;
                l.get(i as usize)
                    .cloned()
                    .ok_or_else(|| Error::parse(format!("list index {} out of range", i)))
            }
            Value::Struct(s) => {
                let name = idx
                    .as_str()
                    .ok_or_else(|| Error::parse(format!("invalid struct index {}", idx)))?;
                s.get(name)
                    .cloned()
                    .ok_or_else(|| Error::field_not_found(name))
            }
            Value::Lazy(l) => l.force()?.index(idx),
            other => Err(Error::parse(format!("value {} is not indexable", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Clone, Copy)]
enum Numeric {
    Int(i128),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(x) => x as f64,
            Numeric::Float(x) => x,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (None, None) => true,
            (Bytes(a), Bytes(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Struct(a), Struct(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Lazy(a), _) => a.forced().map(|v| &v == other).unwrap_or(false),
            (_, Lazy(b)) => b.forced().map(|v| self == &v).unwrap_or(false),
            // Numeric variants (including bools and enum members) compare by
            // magnitude, so Uint(5) == Int(5) == Enum{value: 5}.
            _ => match (self.numeric(), other.numeric()) {
                (Ok(Numeric::Int(a)), Ok(Numeric::Int(b))) => a == b,
                (Ok(a), Ok(b)) => a.as_f64() == b.as_f64(),
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "none"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Uint(x) => write!(f, "{}", x),
            Value::Int(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bytes(b) => {
                write!(f, "b\"")?;
                for byte in b {
                    if byte.is_ascii_graphic() || *byte == b' ' {
                        write!(f, "{}", *byte as char)?;
                    } else {
                        write!(f, "\\x{:02x}", byte)?;
                    }
                }
                write!(f, "\"")
            }
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Struct(s) => write!(f, "{}", s),
            Value::Enum(e) => write!(f, "{}", e.name),
            Value::Lazy(_) => write!(f, "(lazy)"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! value_from_uint {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Uint(v as u64)
            }
        }
    )*};
}

macro_rules! value_from_int {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                if v >= 0 { Value::Uint(v as u64) } else { Value::Int(v as i64) }
            }
        }
    )*};
}

value_from_uint!(u8, u16, u32, u64, usize);
value_from_int!(i8, i16, i32, i64);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Value {
    fn from(v: &[u8; N]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<EnumValue> for Value {
    fn from(v: EnumValue) -> Self {
        Value::Enum(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_sign_equality() {
        assert_eq!(Value::Uint(5), Value::Int(5));
        assert_ne!(Value::Uint(5), Value::Int(-5));
        assert_eq!(Value::Bool(true), Value::Uint(1));
    }

    #[test]
    fn arithmetic_narrows_by_sign() {
        let r = Value::arith(ArithOp::Sub, &Value::Uint(3), &Value::Uint(5)).unwrap();
        assert_eq!(r, Value::Int(-2));
        let r = Value::arith(ArithOp::Add, &Value::Int(-2), &Value::Uint(5)).unwrap();
        assert_eq!(r, Value::Uint(3));
    }

    #[test]
    fn bytes_concatenation() {
        let r = Value::arith(
            ArithOp::Add,
            &Value::Bytes(b"ab".to_vec()),
            &Value::Bytes(b"cd".to_vec()),
        )
        .unwrap();
        assert_eq!(r, Value::Bytes(b"abcd".to_vec()));
    }

    #[test]
    fn division_by_zero_reported() {
        assert!(Value::arith(ArithOp::Div, &Value::Uint(1), &Value::Uint(0)).is_err());
    }
}
