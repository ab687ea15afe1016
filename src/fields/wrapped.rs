//! Fields that wrap another field or a whole structure: constants, arrays,
//! conditionals, switches, enums, and sub-structures.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::expr::{Expr, Spec};
use crate::field::{Field, SeekMode};
use crate::stream::{share, Substream};
use crate::structure::{StructureDef, StructureOptions};
use crate::value::{EnumValue, Value};
use std::io::SeekFrom;
use std::sync::Arc;

/// A field whose parsed bytes must match a fixed value. Reading anything else
/// is a check failure; writing anything else is a write error. Without an
/// explicit base field, a bytes value implies a fixed-length field of its
/// size.
#[derive(Debug, Clone)]
pub struct ConstantField {
    pub(crate) value: Value,
    pub(crate) base: Option<Box<Field>>,
}

impl ConstantField {
    pub fn new(value: impl Into<Value>) -> Self {
        ConstantField { value: value.into(), base: None }
    }

    pub fn with_base(mut self, base: impl Into<Field>) -> Self {
        self.base = Some(Box::new(base.into()));
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    fn base(&self, name: &str) -> Result<&Field> {
        self.base.as_deref().ok_or_else(|| {
            Error::definition(format!(
                "constant field {} needs a base field for non-bytes values",
                name
            ))
        })
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        if self.base.is_none() {
            if let Value::Bytes(b) = &self.value {
                self.base = Some(Box::new(
                    crate::fields::bytes::BytesField::fixed(b.len()).into(),
                ));
            }
        }
        if let Some(base) = &mut self.base {
            base.bind(options);
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        self.base(name)?.validate(name)
    }

    pub(crate) fn len(&self) -> Result<u64> {
        match &self.base {
            Some(base) => base.len(),
            None => match &self.value {
                Value::Bytes(b) => Ok(b.len() as u64),
                _ => Err(Error::unknown_length("constant has no base field")),
            },
        }
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let (value, consumed) = self.base(name)?.decode_from_stream(name, ctx)?;
        if value != self.value {
            return Err(Error::check(format!(
                "field {}: expected constant {}, found {}",
                name, self.value, value
            )));
        }
        Ok((value, consumed))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let value = if value.is_none() { &self.value } else { value };
        if *value != self.value {
            return Err(Error::write(format!(
                "field {}: expected constant {}, found {}",
                name, self.value, value
            )));
        }
        self.base(name)?.encode_to_stream(name, value, ctx)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        format!("const {} = {}", name, self.value)
    }
}

/// A repetition of a base field. Bounded by an element `count`, a byte
/// `length` (negative for until-end-of-stream), and/or an `until` condition
/// evaluated against each parsed element.
#[derive(Debug, Clone)]
pub struct ArrayField {
    pub(crate) base: Box<Field>,
    pub(crate) count: Option<Spec>,
    pub(crate) length: Option<Spec>,
    pub(crate) until: Option<Expr>,
}

impl ArrayField {
    pub fn new(base: impl Into<Field>) -> Self {
        ArrayField { base: Box::new(base.into()), count: None, length: None, until: None }
    }

    /// Exactly `count` elements.
    pub fn counted(base: impl Into<Field>, count: impl Into<Spec>) -> Self {
        Self::new(base).with_count(count)
    }

    /// Elements until `length` bytes are consumed.
    pub fn sized(base: impl Into<Field>, length: impl Into<Spec>) -> Self {
        Self::new(base).with_length(length)
    }

    /// Elements until end-of-stream.
    pub fn greedy(base: impl Into<Field>) -> Self {
        Self::new(base).with_length(Spec::Const(Value::Int(-1)))
    }

    pub fn with_count(mut self, count: impl Into<Spec>) -> Self {
        self.count = Some(count.into());
        self
    }

    pub fn with_length(mut self, length: impl Into<Spec>) -> Self {
        self.length = Some(length.into());
        self
    }

    /// Stops after an element for which the condition (with [`Expr::Current`]
    /// bound to that element) is truthy.
    pub fn until(mut self, condition: Expr) -> Self {
        self.until = Some(condition);
        self
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        self.base.bind(options);
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.count.is_none() && self.length.is_none() && self.until.is_none() {
            return Err(Error::definition(format!(
                "array field {} needs a count, a length, or an until condition",
                name
            )));
        }
        if self.count.is_some() && self.length.is_some() {
            return Err(Error::definition(format!(
                "array field {} cannot have both a count and a length",
                name
            )));
        }
        if let Some(c) = self.count.as_ref().and_then(|c| c.as_const()) {
            if c.as_int().map(|c| c < 0).unwrap_or(false) {
                return Err(Error::definition(format!(
                    "array field {} has a negative count",
                    name
                )));
            }
        }
        self.base.validate(name)
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        if let Some(c) = &self.count {
            c.referenced_fields(out);
        }
        if let Some(l) = &self.length {
            l.referenced_fields(out);
        }
        self.base.referenced_fields(out);
    }

    pub(crate) fn count_field_ref(&self) -> Option<&str> {
        self.count.as_ref().and_then(|c| c.as_field_ref())
    }

    pub(crate) fn len(&self) -> Result<u64> {
        if let Some(c) = self.count.as_ref().and_then(|c| c.as_const()).and_then(|v| v.as_uint()) {
            return Ok(c * self.base.len()?);
        }
        if let Some(l) = self.length.as_ref().and_then(|l| l.as_const()).and_then(|v| v.as_int()) {
            if l >= 0 {
                return Ok(l as u64);
            }
        }
        Err(Error::unknown_length("array length depends on context"))
    }

    pub(crate) fn seek_end(&self, ctx: &Context) -> Result<Option<u64>> {
        if let Some(spec) = &self.length {
            if let Ok(len) = spec.resolve_int(ctx, "length") {
                if len >= 0 {
                    let pos = ctx.stream()?.borrow_mut().seek(SeekFrom::Current(len))?;
                    return Ok(Some(pos));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let stream = ctx.stream()?;
        let field_start = stream.borrow_mut().tell()?;
        let count = match &self.count {
            Some(spec) => Some(spec.resolve_uint(ctx, "count")?),
            None => None,
        };
        let length = match &self.length {
            Some(spec) => Some(spec.resolve_int(ctx, "length")?),
            None => None,
        };

        // Elements of a bounded array read through a windowed view so a
        // misdeclared element cannot run past the array's extent.
        let item_stream = match length {
            Some(len) if len >= 0 => {
                share(Box::new(Substream::new(stream.clone(), Some(len as u64))?))
            }
            _ => stream.clone(),
        };
        let capture = ctx.data().capture_raw;
        let subctx = Context::new(
            Some(item_stream),
            Some(ctx.clone()),
            Some(name.to_string()),
            true,
            capture,
            field_start,
        );
        ctx.set_subcontext(name, subctx.clone());
        let base = Arc::new((*self.base).clone());

        let mut result = Vec::new();
        let mut total: u64 = 0;
        let mut index: u64 = 0;
        loop {
            if let Some(c) = count {
                if index >= c {
                    break;
                }
            } else if let Some(len) = length {
                if len >= 0 && total >= len as u64 {
                    break;
                }
            }
            let slot = subctx.push_field(index.to_string(), Some(base.clone()));
            let parsed = base
                .seek_start(&subctx, total as i64, 0, &SeekMode::Read)
                .and_then(|offset| {
                    base.decode_from_stream(&index.to_string(), &subctx)
                        .map(|r| (offset, r))
                });
            match parsed {
                Ok((offset, (value, consumed))) => {
                    subctx.add_parse_info(
                        slot,
                        Some(value.clone()),
                        offset as i64,
                        Some(consumed),
                        false,
                    );
                    total += consumed;
                    let stop = match &self.until {
                        Some(cond) => cond.eval(&subctx, Some(&value))?.is_truthy(),
                        None => false,
                    };
                    result.push(value);
                    index += 1;
                    if stop {
                        break;
                    }
                }
                Err(e) => {
                    let unbounded = length.map(|l| l < 0).unwrap_or(false);
                    if unbounded && e.is_stream_exhausted() {
                        // End of stream mid-element on an unbounded read:
                        // rewind to the end of the last complete element.
                        subctx.pop_field();
                        stream
                            .borrow_mut()
                            .seek(SeekFrom::Start(field_start + total))?;
                        break;
                    }
                    return Err(e.in_field(&format!("[{}]", index)));
                }
            }
        }
        // A bounded view may leave the parent cursor short of the consumed
        // region; realign it. Unbounded reads already sit at the right spot.
        if matches!(length, Some(len) if len >= 0) {
            stream.borrow_mut().seek(SeekFrom::Start(field_start + total))?;
        }
        Ok((Value::List(result), total))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let items: Vec<Value> = match value {
            Value::None => Vec::new(),
            Value::List(l) => l.clone(),
            v => {
                return Err(Error::write(format!(
                    "field {} expects a list, got {}",
                    name, v
                )))
            }
        };
        if let Some(spec) = &self.count {
            let c = spec.resolve_uint(ctx, "count")?;
            if items.len() as u64 != c {
                return Err(Error::write(format!(
                    "field {}: count is {}, value has {} elements",
                    name,
                    c,
                    items.len()
                )));
            }
        }
        let length = match &self.length {
            Some(spec) => Some(spec.resolve_int(ctx, "length")?),
            None => None,
        };
        let stream = ctx.stream()?;
        let field_start = stream.borrow_mut().tell()?;
        let item_stream = match length {
            Some(len) if len >= 0 => {
                share(Box::new(Substream::new(stream.clone(), Some(len as u64))?))
            }
            _ => stream.clone(),
        };
        let subctx = Context::new(
            Some(item_stream),
            Some(ctx.clone()),
            Some(name.to_string()),
            true,
            false,
            field_start,
        );
        ctx.set_subcontext(name, subctx.clone());
        let base = Arc::new((*self.base).clone());

        let mut total: u64 = 0;
        for (i, item) in items.iter().enumerate() {
            let slot = subctx.push_field(i.to_string(), Some(base.clone()));
            subctx.set_value(slot, item.clone());
            let offset = base
                .seek_start(
                    &subctx,
                    total as i64,
                    0,
                    &SeekMode::Write {
                        policy: crate::structure::NegativeOffsetPolicy::Reject,
                        length: None,
                    },
                )
                .map_err(|e| e.in_field(&format!("[{}]", i)))?;
            let written = base
                .encode_to_stream(&i.to_string(), item, &subctx)
                .map_err(|e| e.in_field(&format!("[{}]", i)))?;
            subctx.add_parse_info(slot, None, offset as i64, Some(written), false);
            total += written;
        }
        if let Some(len) = length {
            if len >= 0 {
                if total < len as u64 {
                    return Err(Error::write(format!(
                        "field {}: wrote {} bytes, expected {}",
                        name, total, len
                    )));
                }
                stream.borrow_mut().seek(SeekFrom::Start(field_start + total))?;
            }
        }
        Ok(total)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        let count = self
            .count
            .as_ref()
            .and_then(|c| c.as_const())
            .and_then(|v| v.as_uint())
            .map(|c| c.to_string())
            .unwrap_or_default();
        format!("{}[{}]", self.base.ctype(name), count)
    }
}

/// A field that is only present when a condition holds; otherwise it yields
/// the fallback value and touches no bytes.
#[derive(Debug, Clone)]
pub struct ConditionalField {
    pub(crate) base: Box<Field>,
    pub(crate) condition: Spec,
    pub(crate) fallback: Value,
}

impl ConditionalField {
    pub fn new(base: impl Into<Field>, condition: impl Into<Spec>) -> Self {
        ConditionalField {
            base: Box::new(base.into()),
            condition: condition.into(),
            fallback: Value::None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<Value>) -> Self {
        self.fallback = fallback.into();
        self
    }

    fn present(&self, ctx: &Context) -> Result<bool> {
        Ok(self.condition.resolve(ctx)?.resolve()?.is_truthy())
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        self.base.bind(options);
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        self.base.validate(name)
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        self.condition.referenced_fields(out);
        self.base.referenced_fields(out);
    }

    pub(crate) fn len(&self) -> Result<u64> {
        Err(Error::unknown_length("conditional presence depends on context"))
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        if self.present(ctx)? {
            self.base.decode_from_stream(name, ctx)
        } else {
            Ok((self.fallback.clone(), 0))
        }
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        if self.present(ctx)? {
            self.base.encode_to_stream(name, value, ctx)
        } else {
            Ok(0)
        }
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        format!("{} (conditional)", self.base.ctype(name))
    }
}

/// A field that delegates to one of several cases keyed by a switch value.
/// A missing case falls back to `other`; without one it is a check failure.
#[derive(Debug, Clone)]
pub struct SwitchField {
    pub(crate) switch: Spec,
    pub(crate) cases: Vec<(Value, Field)>,
    pub(crate) other: Option<Box<Field>>,
}

impl SwitchField {
    pub fn new(switch: impl Into<Spec>) -> Self {
        SwitchField { switch: switch.into(), cases: Vec::new(), other: None }
    }

    pub fn case(mut self, key: impl Into<Value>, field: impl Into<Field>) -> Self {
        self.cases.push((key.into(), field.into()));
        self
    }

    pub fn other(mut self, field: impl Into<Field>) -> Self {
        self.other = Some(Box::new(field.into()));
        self
    }

    fn select(&self, name: &str, ctx: &Context) -> Result<&Field> {
        let key = self.switch.resolve(ctx)?.resolve()?;
        for (k, field) in &self.cases {
            if *k == key {
                return Ok(field);
            }
        }
        self.other.as_deref().ok_or_else(|| {
            Error::check(format!("field {}: no case for switch value {}", name, key))
        })
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        for (_, field) in &mut self.cases {
            field.bind(options);
        }
        if let Some(other) = &mut self.other {
            other.bind(options);
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.cases.is_empty() && self.other.is_none() {
            return Err(Error::definition(format!(
                "switch field {} has no cases",
                name
            )));
        }
        for (_, field) in &self.cases {
            field.validate(name)?;
        }
        if let Some(other) = &self.other {
            other.validate(name)?;
        }
        Ok(())
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        self.switch.referenced_fields(out);
    }

    /// Known only when every branch has the same static length.
    pub(crate) fn len(&self) -> Result<u64> {
        let mut len = None;
        for (_, field) in &self.cases {
            let l = field.len()?;
            if *len.get_or_insert(l) != l {
                return Err(Error::unknown_length("switch branches differ in length"));
            }
        }
        if let Some(other) = &self.other {
            let l = other.len()?;
            if *len.get_or_insert(l) != l {
                return Err(Error::unknown_length("switch branches differ in length"));
            }
        }
        len.ok_or_else(|| Error::unknown_length("switch has no branches"))
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        self.select(name, ctx)?.decode_from_stream(name, ctx)
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        self.select(name, ctx)?.encode_to_stream(name, value, ctx)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        format!("union {}", name)
    }
}

/// A named member table mapping values to names; in `flags` mode a value
/// decodes to the combination of set members.
#[derive(Debug, Clone)]
pub struct EnumType {
    pub(crate) name: String,
    pub(crate) members: Vec<(String, u64)>,
    pub(crate) flags: bool,
}

impl EnumType {
    pub fn new(name: impl Into<String>) -> Self {
        EnumType { name: name.into(), members: Vec::new(), flags: false }
    }

    /// A flag enum: values decode to `|`-combinations of members.
    pub fn flags(name: impl Into<String>) -> Self {
        EnumType { name: name.into(), members: Vec::new(), flags: true }
    }

    pub fn member(mut self, name: impl Into<String>, value: u64) -> Self {
        self.members.push((name.into(), value));
        self
    }

    /// A member for a raw value; flag mode combines set members in definition
    /// order, with any leftover bits rendered as a trailing number.
    pub fn decode(&self, raw: u64) -> Result<EnumValue> {
        if !self.flags {
            for (name, value) in &self.members {
                if *value == raw {
                    return Ok(EnumValue { name: name.clone(), value: raw });
                }
            }
            return Err(Error::parse(format!(
                "{} is not a member of enum {}",
                raw, self.name
            )));
        }
        if raw == 0 {
            let name = self
                .members
                .iter()
                .find(|(_, v)| *v == 0)
                .map(|(n, _)| n.clone())
                .unwrap_or_else(|| "0".to_string());
            return Ok(EnumValue { name, value: 0 });
        }
        let mut names = Vec::new();
        let mut rest = raw;
        for (name, value) in &self.members {
            if *value != 0 && rest & *value == *value {
                names.push(name.clone());
                rest &= !*value;
            }
        }
        if rest != 0 {
            names.push(rest.to_string());
        }
        Ok(EnumValue { name: names.join("|"), value: raw })
    }

    /// Accepts a decoded member, a name (or `|`-joined names in flag mode), or
    /// a raw value.
    pub fn encode(&self, value: &Value) -> Result<u64> {
        match value {
            Value::None => Ok(0),
            Value::Enum(e) => Ok(e.value),
            Value::Str(s) => {
                if self.flags {
                    let mut out = 0;
                    for part in s.split('|') {
                        out |= self.member_value(part.trim())?;
                    }
                    Ok(out)
                } else {
                    self.member_value(s)
                }
            }
            v => v
                .as_uint()
                .ok_or_else(|| Error::write(format!("{} is not valid for enum {}", v, self.name))),
        }
    }

    fn member_value(&self, name: &str) -> Result<u64> {
        self.members
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| {
                Error::write(format!("{} is not a member of enum {}", name, self.name))
            })
    }
}

/// A field whose numeric base value is interpreted as an enum member.
#[derive(Debug, Clone)]
pub struct EnumField {
    pub(crate) base: Box<Field>,
    pub(crate) enum_type: EnumType,
}

impl EnumField {
    pub fn new(base: impl Into<Field>, enum_type: EnumType) -> Self {
        EnumField { base: Box::new(base.into()), enum_type }
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        self.base.bind(options);
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        self.base.validate(name)
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        self.base.referenced_fields(out);
    }

    pub(crate) fn len(&self) -> Result<u64> {
        self.base.len()
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let (value, consumed) = self.base.decode_from_stream(name, ctx)?;
        let raw = value.as_uint().ok_or_else(|| {
            Error::parse(format!("field {}: {} is not an enum value", name, value))
        })?;
        Ok((Value::Enum(self.enum_type.decode(raw)?), consumed))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let raw = self.enum_type.encode(value)?;
        self.base.encode_to_stream(name, &Value::Uint(raw), ctx)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        format!("enum {} {}", self.enum_type.name, name)
    }
}

/// A nested structure. With a `length`, parsing is confined to a window of
/// that many bytes and the cursor always ends up past the whole window.
#[derive(Debug, Clone)]
pub struct StructureField {
    pub(crate) def: Arc<StructureDef>,
    pub(crate) length: Option<Spec>,
}

impl StructureField {
    pub fn new(def: impl Into<Arc<StructureDef>>) -> Self {
        StructureField { def: def.into(), length: None }
    }

    pub fn with_length(mut self, length: impl Into<Spec>) -> Self {
        self.length = Some(length.into());
        self
    }

    pub fn def(&self) -> &Arc<StructureDef> {
        &self.def
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        if let Some(l) = &self.length {
            l.referenced_fields(out);
        }
    }

    pub(crate) fn len(&self) -> Result<u64> {
        if let Some(len) = self.length.as_ref().and_then(|l| l.as_const()).and_then(|v| v.as_uint())
        {
            return Ok(len);
        }
        self.def.byte_len()
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let length = match &self.length {
            Some(spec) => Some(spec.resolve_uint(ctx, "length")?),
            None => None,
        };
        let start = ctx.stream()?.borrow_mut().tell()?;
        let (value, consumed) = self.def.parse_nested(ctx, name, length)?;
        let consumed = match length {
            Some(len) => {
                ctx.stream()?.borrow_mut().seek(SeekFrom::Start(start + len))?;
                len
            }
            None => consumed,
        };
        Ok((Value::Struct(value), consumed))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let own;
        let value = match value {
            Value::None => {
                own = self.def.new_value();
                &own
            }
            Value::Struct(s) => s,
            v => {
                return Err(Error::write(format!(
                    "field {} expects a {} structure, got {}",
                    name,
                    self.def.name(),
                    v
                )))
            }
        };
        let length = match &self.length {
            Some(spec) => Some(spec.resolve_uint(ctx, "length")?),
            None => None,
        };
        let start = ctx.stream()?.borrow_mut().tell()?;
        let written = self.def.emit_nested(value, ctx, name, length)?;
        match length {
            Some(len) => {
                let stream = ctx.stream()?;
                let mut stream = stream.borrow_mut();
                if written < len {
                    // Zero-fill the rest of the window so the field always
                    // occupies exactly `length` bytes.
                    stream.seek(SeekFrom::Start(start + written))?;
                    stream.write(&vec![0u8; (len - written) as usize])?;
                } else {
                    stream.seek(SeekFrom::Start(start + len))?;
                }
                Ok(len)
            }
            None => Ok(written),
        }
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        format!("struct {} {}", self.def.name(), name)
    }
}
