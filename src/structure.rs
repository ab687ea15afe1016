//! Structure definitions, structure values, and the parse/emit engine.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::expr::{Expr, Spec};
use crate::field::{ByteOrder, Field, FieldKind, SeekMode};
use crate::stream::{share, SharedStream, Stream, Substream};
use crate::value::Value;
use encoding_rs::Encoding;
use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, SeekFrom};
use std::rc::Rc;
use std::sync::Arc;

/// What to do with a field whose offset counts from the end of the stream
/// when writing. Reading is unambiguous; writing is not, so the behavior is a
/// configuration choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegativeOffsetPolicy {
    /// Fail the write.
    #[default]
    Reject,
    /// Translate against the declared structure length; the length must be
    /// known.
    RequireLength,
}

/// Structure-level metadata.
#[derive(Debug, Clone)]
pub struct StructureOptions {
    /// Default byte order for fields that do not set their own.
    pub byte_order: Option<ByteOrder>,
    /// Default text encoding for string fields.
    pub encoding: &'static Encoding,
    /// Field alignment in bytes; 0 disables alignment.
    pub alignment: usize,
    /// Fixed total length; parsing and emitting are confined to a window of
    /// this many bytes.
    pub length: Option<Spec>,
    /// Post-parse (and pre-write) invariant checks.
    pub checks: Vec<Expr>,
    /// Capture the raw bytes of every parsed field.
    pub capture_raw: bool,
    pub negative_write_offsets: NegativeOffsetPolicy,
}

impl Default for StructureOptions {
    fn default() -> Self {
        StructureOptions {
            byte_order: None,
            encoding: encoding_rs::UTF_8,
            alignment: 0,
            length: None,
            checks: Vec::new(),
            capture_raw: false,
            negative_write_offsets: NegativeOffsetPolicy::default(),
        }
    }
}

/// An immutable structure definition: an ordered list of named fields plus
/// metadata. Built once through [`StructureDef::builder`], then used for any
/// number of parse and emit operations.
#[derive(Debug, Clone)]
pub struct StructureDef {
    name: String,
    fields: Vec<(String, Arc<Field>)>,
    by_name: HashMap<String, usize>,
    options: StructureOptions,
}

/// Builder for [`StructureDef`]; the structure-declaration surface.
pub struct StructureBuilder {
    name: String,
    fields: Vec<(String, Field)>,
    options: StructureOptions,
}

impl StructureBuilder {
    pub fn field(mut self, name: impl Into<String>, field: impl Into<Field>) -> Self {
        self.fields.push((name.into(), field.into()));
        self
    }

    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.options.byte_order = Some(byte_order);
        self
    }

    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.options.encoding = encoding;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.options.alignment = alignment;
        self
    }

    pub fn length(mut self, length: impl Into<Spec>) -> Self {
        self.options.length = Some(length.into());
        self
    }

    /// Adds a post-parse invariant; a falsy result fails the operation.
    pub fn check(mut self, check: Expr) -> Self {
        self.options.checks.push(check);
        self
    }

    pub fn capture_raw(mut self) -> Self {
        self.options.capture_raw = true;
        self
    }

    pub fn negative_write_offsets(mut self, policy: NegativeOffsetPolicy) -> Self {
        self.options.negative_write_offsets = policy;
        self
    }

    pub fn build(mut self) -> Result<StructureDef> {
        if !is_valid_name(&self.name) {
            return Err(Error::definition(format!(
                "invalid structure name {:?}",
                self.name
            )));
        }
        let mut by_name = HashMap::new();
        for (i, (name, _)) in self.fields.iter().enumerate() {
            if !is_valid_name(name) {
                return Err(Error::definition(format!("invalid field name {:?}", name)));
            }
            if by_name.insert(name.clone(), i).is_some() {
                return Err(Error::definition(format!("duplicate field name {:?}", name)));
            }
        }

        for (_, field) in &mut self.fields {
            field.bind(&self.options);
        }

        // Install auto-overrides: a field referenced as a length/count spec
        // mirrors the referring field's derived quantity when left unset.
        let mut implied = Vec::new();
        for (name, field) in &self.fields {
            if let Some((target, override_)) = field.implied_override(name) {
                implied.push((name.clone(), target, override_));
            }
        }
        for (source, target, override_) in implied {
            let idx = *by_name.get(&target).ok_or_else(|| {
                Error::definition(format!(
                    "field {} references unknown field {}",
                    source, target
                ))
            })?;
            let target_field = &mut self.fields[idx].1;
            if !target_field.has_override() {
                target_field.override_ = Some(override_);
            }
        }

        for (name, field) in &self.fields {
            field.validate(name)?;
            let mut refs = Vec::new();
            field.referenced_fields(&mut refs);
            for r in refs {
                if !by_name.contains_key(&r) {
                    return Err(Error::definition(format!(
                        "field {} references unknown field {}",
                        name, r
                    )));
                }
            }
        }
        for check in &self.options.checks {
            let mut refs = Vec::new();
            check.referenced_fields(&mut refs);
            for r in refs {
                if !by_name.contains_key(&r) {
                    return Err(Error::definition(format!(
                        "check {} references unknown field {}",
                        check, r
                    )));
                }
            }
        }

        Ok(StructureDef {
            name: self.name,
            fields: self
                .fields
                .into_iter()
                .map(|(n, f)| (n, Arc::new(f)))
                .collect(),
            by_name,
            options: self.options,
        })
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A populated structure: ordered named values, produced by parsing or built
/// by hand for emitting. After a parse it retains the parsing context, giving
/// access to per-field offsets, lengths, and raw bytes.
#[derive(Debug, Clone)]
pub struct StructValue {
    pub(crate) name: String,
    pub(crate) values: Vec<(String, Value)>,
    pub(crate) context: Option<Context>,
}

impl StructValue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v)
    }

    /// Sets a field value; the field must exist in the structure.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        match self.values.iter_mut().find(|(n, _)| n.as_str() == name) {
            Some((_, slot)) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(Error::field_not_found(name)),
        }
    }

    /// Resolves a (possibly lazy) field value in place and returns it.
    pub fn force(&mut self, name: &str) -> Result<Value> {
        let slot = self
            .values
            .iter_mut()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::field_not_found(name))?;
        let resolved = slot.clone().resolve()?;
        *slot = resolved.clone();
        Ok(resolved)
    }

    /// Resolves every lazy value in place. The retained stream must still be
    /// open.
    pub fn resolve_all(&mut self) -> Result<()> {
        for (_, v) in &mut self.values {
            let resolved = v.clone().resolve()?;
            *v = resolved;
        }
        Ok(())
    }

    /// The parsing context this value came from, when it was produced by a
    /// parse.
    pub fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl PartialEq for StructValue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.values == other.values
    }
}

impl fmt::Display for StructValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        write!(f, ")")
    }
}

impl StructureDef {
    pub fn builder(name: impl Into<String>) -> StructureBuilder {
        StructureBuilder {
            name: name.into(),
            fields: Vec::new(),
            options: StructureOptions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StructureOptions {
        &self.options
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(n, f)| (n.as_str(), f.as_ref()))
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&i| self.fields[i].1.as_ref())
    }

    /// Total byte length, when every field's length is known statically.
    pub fn byte_len(&self) -> Result<u64> {
        if let Some(len) = self
            .options
            .length
            .as_ref()
            .and_then(|l| l.as_const())
            .and_then(|v| v.as_uint())
        {
            return Ok(len);
        }
        let mut total = 0;
        for (_, field) in &self.fields {
            total += field.len()?;
        }
        Ok(total)
    }

    /// A fresh value with declaration defaults where they are context-free,
    /// and unset fields elsewhere.
    pub fn new_value(&self) -> StructValue {
        let ctx = Context::new(None, None, None, false, false, 0);
        let values = self
            .fields
            .iter()
            .map(|(name, field)| {
                let v = field
                    .get_default(&ctx)
                    .ok()
                    .flatten()
                    .unwrap_or(Value::None);
                (name.clone(), v)
            })
            .collect();
        StructValue { name: self.name.clone(), values, context: None }
    }

    /// A fresh value with the given fields set.
    pub fn value_of(&self, entries: Vec<(&str, Value)>) -> Result<StructValue> {
        let mut value = self.new_value();
        for (name, v) in entries {
            value.set(name, v)?;
        }
        Ok(value)
    }

    /// Parses a structure out of a byte slice.
    pub fn from_bytes(&self, data: &[u8]) -> Result<StructValue> {
        let shared = share(Box::new(Cursor::new(data.to_vec())));
        let (value, _) = self.parse_shared(shared, None, None)?;
        Ok(value)
    }

    /// Parses a structure from a stream, consuming it. The stream is retained
    /// by the result for lazy fields; it stays open as long as the value (or
    /// its context) is alive. Returns the value and the number of bytes
    /// consumed, measured to the highest offset read.
    pub fn from_stream<S: Stream>(&self, stream: S) -> Result<(StructValue, u64)> {
        self.parse_shared(share(Box::new(stream)), None, None)
    }

    /// Emits a structure to a fresh byte vector.
    pub fn to_bytes(&self, value: &StructValue) -> Result<Vec<u8>> {
        let (_, cursor) = self.to_stream(value, Cursor::new(Vec::new()))?;
        Ok(cursor.into_inner())
    }

    /// Emits a structure to a stream, returning the number of bytes written
    /// (measured to the highest offset touched) and the stream.
    pub fn to_stream<S: Stream>(&self, value: &StructValue, stream: S) -> Result<(u64, S)> {
        let shared = share(Box::new(stream));
        let written = self.emit_shared(value, shared.clone(), None, None)?;
        let bits = Rc::try_unwrap(shared)
            .map_err(|_| Error::parse("stream is still shared after emit"))?
            .into_inner();
        match bits.into_inner().into_any().downcast::<S>() {
            Ok(s) => Ok((written, *s)),
            Err(_) => Err(Error::parse("stream type changed during emit")),
        }
    }

    /// A C-style rendition of the declaration.
    pub fn to_c_string(&self) -> String {
        let mut out = format!("struct {} {{\n", self.name);
        for (name, field) in &self.fields {
            out.push_str("   ");
            out.push_str(&field.ctype(name));
            out.push_str(";\n");
        }
        out.push('}');
        out
    }

    pub(crate) fn parse_nested(
        &self,
        parent: &Context,
        name: &str,
        length: Option<u64>,
    ) -> Result<(StructValue, u64)> {
        let parent_stream = parent.stream()?;
        let shared = match length {
            Some(len) => share(Box::new(Substream::new(parent_stream, Some(len))?)),
            None => parent_stream,
        };
        let (value, consumed) = self.parse_shared(shared, Some(parent.clone()), Some(name))?;
        if let Some(ctx) = &value.context {
            parent.set_subcontext(name, ctx.clone());
        }
        Ok((value, consumed))
    }

    pub(crate) fn emit_nested(
        &self,
        value: &StructValue,
        parent: &Context,
        name: &str,
        length: Option<u64>,
    ) -> Result<u64> {
        let parent_stream = parent.stream()?;
        let shared = match length {
            Some(len) => share(Box::new(Substream::new(parent_stream, Some(len))?)),
            None => parent_stream,
        };
        self.emit_shared(value, shared, Some(parent.clone()), Some(name))
    }

    /// The declared structure length, resolved as far as possible: constants
    /// always, dependent specs against the parent context when one exists.
    fn resolved_length(&self, parent: Option<&Context>) -> Option<u64> {
        let spec = self.options.length.as_ref()?;
        if let Some(v) = spec.as_const() {
            return v.as_uint();
        }
        parent.and_then(|p| spec.resolve_uint(p, "structure length").ok())
    }

    fn parse_shared(
        &self,
        shared: SharedStream,
        parent: Option<Context>,
        parent_field: Option<&str>,
    ) -> Result<(StructValue, u64)> {
        let shared = match self.resolved_length(parent.as_ref()) {
            Some(len) => share(Box::new(Substream::new(shared, Some(len))?)),
            None => shared,
        };
        let start = shared.borrow_mut().tell()?;
        let ctx = Context::new(
            Some(shared.clone()),
            parent,
            parent_field.map(str::to_string),
            false,
            self.options.capture_raw,
            start,
        );
        ctx.initialize_from_fields(&self.fields);

        // Forward references: lazy fields at constant offsets become
        // available to every other field before the main pass starts.
        for (i, (_, field)) in self.fields.iter().enumerate() {
            if field.is_lazy() {
                if let Some(off) = field
                    .offset
                    .as_ref()
                    .and_then(|o| o.as_const())
                    .and_then(|v| v.as_int())
                {
                    ctx.add_parse_info(i, None, off, None, true);
                }
            }
        }

        let mut max_offset = start;
        let mut prev_was_bits = false;
        for (i, (name, field)) in self.fields.iter().enumerate() {
            let is_bits = matches!(field.kind(), FieldKind::Bit(_));
            // Alignment is ignored between consecutive bit fields.
            let alignment = if is_bits && prev_was_bits {
                0
            } else {
                self.options.alignment
            };
            prev_was_bits = is_bits;
            let rel = shared.borrow_mut().tell()? as i64 - start as i64;
            let abs = field
                .seek_start(&ctx, rel, alignment, &SeekMode::Read)
                .map_err(|e| e.in_field(name))?;

            // A forward-referenced lazy field that another field already
            // forced: skip past its recorded extent.
            let (already_resolved, known_len) = {
                let data = ctx.data();
                let fc = &data.fields[i];
                (fc.resolved(), fc.length)
            };
            if already_resolved {
                let end = shared
                    .borrow_mut()
                    .seek(SeekFrom::Current(known_len.unwrap_or(0) as i64))?;
                max_offset = max_offset.max(end);
                continue;
            }

            if field.is_lazy() && !is_bits {
                // Committing to laziness requires knowing where the next
                // field starts: either this field's end is skippable, or the
                // next field seeks on its own.
                let next_needs_cursor = self
                    .fields
                    .get(i + 1)
                    .map(|(_, f)| !f.has_offset())
                    .unwrap_or(false);
                let lazy_end = if next_needs_cursor {
                    field.seek_end(&ctx).map_err(|e| e.in_field(name))?
                } else {
                    None
                };
                if !next_needs_cursor || lazy_end.is_some() {
                    let length = lazy_end.map(|end| end.saturating_sub(abs));
                    let offset = { ctx.data().fields[i].offset }.unwrap_or(abs as i64);
                    ctx.add_parse_info(i, None, offset, length, true);
                    if let Some(end) = lazy_end {
                        max_offset = max_offset.max(end);
                    }
                    continue;
                }
            }

            let (value, consumed) = field
                .decode_from_stream(name, &ctx)
                .map_err(|e| e.in_field(name).at_offset(abs))?;
            ctx.add_parse_info(i, Some(value), abs as i64, Some(consumed), false);
            if self.options.capture_raw && consumed > 0 {
                let raw = {
                    let mut s = shared.borrow_mut();
                    s.seek(SeekFrom::Current(-(consumed as i64)))?;
                    s.read_up_to(consumed as usize)?
                };
                ctx.data_mut().fields[i].raw = Some(raw);
            }
            let end = shared.borrow_mut().tell()?;
            max_offset = max_offset.max(end);
        }

        for check in &self.options.checks {
            if !check.eval(&ctx, None)?.is_truthy() {
                return Err(Error::check(format!(
                    "check {} failed for {}",
                    check, self.name
                )));
            }
        }

        let mut values = Vec::with_capacity(self.fields.len());
        for (i, (name, _)) in self.fields.iter().enumerate() {
            values.push((name.clone(), ctx.slot_value(i)?));
        }
        ctx.finish();
        Ok((
            StructValue {
                name: self.name.clone(),
                values,
                context: Some(ctx),
            },
            max_offset - start,
        ))
    }

    fn emit_shared(
        &self,
        value: &StructValue,
        shared: SharedStream,
        parent: Option<Context>,
        parent_field: Option<&str>,
    ) -> Result<u64> {
        let declared_length = self.resolved_length(parent.as_ref());
        let shared = match declared_length {
            Some(len) => share(Box::new(Substream::new(shared, Some(len))?)),
            None => shared,
        };
        let start = shared.borrow_mut().tell()?;
        let ctx = Context::new(
            Some(shared.clone()),
            parent,
            parent_field.map(str::to_string),
            false,
            false,
            start,
        );
        ctx.initialize_from_fields(&self.fields);

        // Current values; lazy proxies resolve now, while their retained
        // stream is still reachable.
        for (i, (name, _)) in self.fields.iter().enumerate() {
            let v = value.get(name).cloned().unwrap_or(Value::None);
            ctx.set_value(i, v.resolve()?);
        }

        // Final values in declaration order: default where unset, then
        // override. Later fields observe earlier fields' final values.
        for (i, (name, field)) in self.fields.iter().enumerate() {
            let current = ctx.slot_value(i)?;
            let current = if current.is_none() {
                field.get_default(&ctx)?.unwrap_or(Value::None)
            } else {
                current
            };
            let final_value = field
                .apply_override(&ctx, current)
                .map_err(|e| e.in_field(name))?;
            ctx.set_value(i, final_value);
        }

        for check in &self.options.checks {
            if !check.eval(&ctx, None)?.is_truthy() {
                return Err(Error::check(format!(
                    "check {} failed for {}",
                    check, self.name
                )));
            }
        }

        let mode = SeekMode::Write {
            policy: self.options.negative_write_offsets,
            length: declared_length,
        };
        let mut max_offset = start;
        let mut prev_was_bits = false;
        for (i, (name, field)) in self.fields.iter().enumerate() {
            let is_bits = matches!(field.kind(), FieldKind::Bit(_));
            let alignment = if is_bits && prev_was_bits {
                0
            } else {
                self.options.alignment
            };
            prev_was_bits = is_bits;
            let rel = shared.borrow_mut().tell()? as i64 - start as i64;
            let abs = field
                .seek_start(&ctx, rel, alignment, &mode)
                .map_err(|e| e.in_field(name))?;
            let v = ctx.slot_value(i)?;
            let written = field
                .encode_to_stream(name, &v, &ctx)
                .map_err(|e| e.in_field(name).at_offset(abs))?;
            ctx.add_parse_info(i, None, abs as i64, Some(written), false);
            let end = shared.borrow_mut().tell()?;
            max_offset = max_offset.max(end);
        }
        let flushed = shared.borrow_mut().finalize_bits()?;
        if flushed > 0 {
            let end = shared.borrow_mut().tell()?;
            max_offset = max_offset.max(end);
        }
        ctx.finish();
        Ok(max_offset - start)
    }
}
