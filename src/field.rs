//! The field descriptor and its parse/emit pipeline.
//!
//! A [`Field`] couples a concrete variant ([`FieldKind`]) with the option
//! slots every field shares: default, override, decoder/encoder, offset/skip,
//! and laziness. The engine drives fields through a fixed pipeline — seek to
//! the start position, read/write the variant's bytes, run the value
//! transformers — and every variant upholds the cursor contract: after a
//! successful read or write the stream sits exactly at start plus the
//! reported byte count.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::expr::{Expr, Spec};
use crate::fields::bits::BitField;
use crate::fields::bytes::{BytesField, StringField};
use crate::fields::integer::{IntegerField, VarintField};
use crate::fields::packed::PackedField;
use crate::fields::wrapped::{
    ArrayField, ConditionalField, ConstantField, EnumField, StructureField, SwitchField,
};
use crate::structure::{NegativeOffsetPolicy, StructureOptions};
use crate::value::Value;
use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;

/// Byte order for multi-byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// A one-argument value transformer used as a field decoder or encoder.
#[derive(Clone)]
pub struct Transform {
    f: Arc<dyn Fn(Value) -> Result<Value>>,
}

impl Transform {
    pub fn new(f: impl Fn(Value) -> Result<Value> + 'static) -> Self {
        Transform { f: Arc::new(f) }
    }

    pub fn apply(&self, value: Value) -> Result<Value> {
        (self.f)(value)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform(..)")
    }
}

/// A spec mutating a field's value just before emit.
#[derive(Debug, Clone)]
pub enum Override {
    Const(Value),
    /// Evaluated with [`Expr::Current`] bound to the field's current value.
    Expr(Expr),
    /// Byte length of the named field's value, substituted only when the
    /// current value is none. Installed automatically when another field uses
    /// this one as its length.
    LengthOf(String),
    /// Element count of the named field's value, substituted only when the
    /// current value is none. Installed automatically by arrays with a
    /// field-referenced count.
    CountOf(String),
    /// Bit length of the named field's value, substituted only when the
    /// current value is none. Installed automatically by bit fields with a
    /// field-referenced bit count.
    BitLengthOf(String),
}

impl From<Expr> for Override {
    fn from(e: Expr) -> Self {
        Override::Expr(e)
    }
}

macro_rules! override_from_const {
    ($($t:ty),*) => {$(
        impl From<$t> for Override {
            fn from(v: $t) -> Self {
                Override::Const(v.into())
            }
        }
    )*};
}

override_from_const!(
    bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, Vec<u8>, &[u8], &str, String, Value
);

impl<const N: usize> From<&[u8; N]> for Override {
    fn from(v: &[u8; N]) -> Self {
        Override::Const(v.into())
    }
}

/// One declared field: a variant plus the shared option slots.
#[derive(Debug, Clone)]
pub struct Field {
    pub(crate) kind: FieldKind,
    pub(crate) default: Option<Spec>,
    pub(crate) override_: Option<Override>,
    pub(crate) decoder: Option<Transform>,
    pub(crate) encoder: Option<Transform>,
    /// Absolute stream position to seek to; negative counts from the end.
    pub(crate) offset: Option<Spec>,
    /// Bytes to skip forward from the cursor; exclusive with `offset`.
    pub(crate) skip: Option<Spec>,
    pub(crate) lazy: bool,
}

/// The built-in field variants.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Bytes(BytesField),
    String(StringField),
    Integer(IntegerField),
    Varint(VarintField),
    Bit(BitField),
    Packed(PackedField),
    Constant(ConstantField),
    Structure(StructureField),
    Array(ArrayField),
    Conditional(ConditionalField),
    Switch(SwitchField),
    Enum(EnumField),
}

pub(crate) enum SeekMode {
    Read,
    Write {
        policy: NegativeOffsetPolicy,
        /// Fixed total structure length, when declared.
        length: Option<u64>,
    },
}

impl Field {
    pub fn new(kind: FieldKind) -> Self {
        Field {
            kind,
            default: None,
            override_: None,
            decoder: None,
            encoder: None,
            offset: None,
            skip: None,
            lazy: false,
        }
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// Sets the default, used when emitting a field whose value is unset.
    pub fn with_default(mut self, default: impl Into<Spec>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Sets the override applied to the value just before emit.
    pub fn with_override(mut self, override_: impl Into<Override>) -> Self {
        self.override_ = Some(override_.into());
        self
    }

    /// Transformer applied to the raw value after reading.
    pub fn with_decoder(mut self, f: impl Fn(Value) -> Result<Value> + 'static) -> Self {
        self.decoder = Some(Transform::new(f));
        self
    }

    /// Transformer applied to the value before writing.
    pub fn with_encoder(mut self, f: impl Fn(Value) -> Result<Value> + 'static) -> Self {
        self.encoder = Some(Transform::new(f));
        self
    }

    /// Seeks to this stream position before the field; negative positions
    /// count from the end of the stream.
    pub fn at_offset(mut self, offset: impl Into<Spec>) -> Self {
        self.offset = Some(offset.into());
        self
    }

    /// Skips this many bytes forward before the field.
    pub fn with_skip(mut self, skip: impl Into<Spec>) -> Self {
        self.skip = Some(skip.into());
        self
    }

    /// Defers parsing of this field until its value is first used.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub(crate) fn has_offset(&self) -> bool {
        self.offset.is_some()
    }

    /// Byte length, when determinable without a context.
    pub fn len(&self) -> Result<u64> {
        match &self.kind {
            FieldKind::Bytes(f) => f.len(),
            FieldKind::String(f) => f.len(),
            FieldKind::Integer(f) => f.len(),
            FieldKind::Varint(f) => f.len(),
            FieldKind::Bit(f) => f.len(),
            FieldKind::Packed(f) => f.len(),
            FieldKind::Constant(f) => f.len(),
            FieldKind::Structure(f) => f.len(),
            FieldKind::Array(f) => f.len(),
            FieldKind::Conditional(f) => f.len(),
            FieldKind::Switch(f) => f.len(),
            FieldKind::Enum(f) => f.len(),
        }
    }

    /// Computes the absolute start position of this field and seeks there.
    /// Resolution order: explicit offset, then skip, then enclosing-structure
    /// alignment, then the current position.
    pub(crate) fn seek_start(
        &self,
        ctx: &Context,
        rel_offset: i64,
        alignment: usize,
        mode: &SeekMode,
    ) -> Result<u64> {
        let stream = ctx.stream()?;
        if let Some(spec) = &self.offset {
            let off = spec.resolve_int(ctx, "offset")?;
            if off < 0 {
                return match mode {
                    SeekMode::Read => stream.borrow_mut().seek(SeekFrom::End(off)),
                    SeekMode::Write { policy, length } => match policy {
                        NegativeOffsetPolicy::Reject => Err(Error::write(format!(
                            "offset {} from the end is ambiguous when writing; \
                             set negative_write_offsets to allow it",
                            off
                        ))),
                        NegativeOffsetPolicy::RequireLength => {
                            let len = length.ok_or_else(|| {
                                Error::write(
                                    "offsets from the end require a fixed structure length \
                                     when writing",
                                )
                            })?;
                            let target = (ctx.origin() + len).saturating_add_signed(off);
                            stream.borrow_mut().seek(SeekFrom::Start(target))
                        }
                    },
                };
            }
            return stream.borrow_mut().seek(SeekFrom::Start(off as u64));
        }
        if let Some(spec) = &self.skip {
            let skip = spec.resolve_int(ctx, "skip")?;
            if skip < 0 {
                return Err(Error::definition(format!("negative skip {}", skip)));
            }
            return stream.borrow_mut().seek(SeekFrom::Current(skip));
        }
        if alignment > 0 {
            let rem = rel_offset.rem_euclid(alignment as i64);
            if rem != 0 {
                return stream
                    .borrow_mut()
                    .seek(SeekFrom::Current(alignment as i64 - rem));
            }
        }
        let pos = stream.borrow_mut().tell();
        pos
    }

    /// Advances the stream to the end of this field without parsing it.
    /// `Ok(None)` means the end cannot be found without a full parse.
    pub(crate) fn seek_end(&self, ctx: &Context) -> Result<Option<u64>> {
        match &self.kind {
            FieldKind::Bytes(f) => f.seek_end(ctx),
            FieldKind::String(f) => f.seek_end(ctx),
            FieldKind::Varint(f) => f.seek_end(ctx),
            FieldKind::Array(f) => f.seek_end(ctx),
            _ => self.seek_end_by_len(ctx),
        }
    }

    pub(crate) fn seek_end_by_len(&self, ctx: &Context) -> Result<Option<u64>> {
        match self.len() {
            Ok(len) => Ok(Some(
                ctx.stream()?.borrow_mut().seek(SeekFrom::Current(len as i64))?,
            )),
            Err(_) => Ok(None),
        }
    }

    /// Variant-specific byte consumption: the parsed value and the number of
    /// bytes consumed.
    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        match &self.kind {
            FieldKind::Bytes(f) => f.from_stream(name, ctx),
            FieldKind::String(f) => f.from_stream(name, ctx),
            FieldKind::Integer(f) => f.from_stream(name, ctx),
            FieldKind::Varint(f) => f.from_stream(name, ctx),
            FieldKind::Bit(f) => f.from_stream(name, ctx),
            FieldKind::Packed(f) => f.from_stream(name, ctx),
            FieldKind::Constant(f) => f.from_stream(name, ctx),
            FieldKind::Structure(f) => f.from_stream(name, ctx),
            FieldKind::Array(f) => f.from_stream(name, ctx),
            FieldKind::Conditional(f) => f.from_stream(name, ctx),
            FieldKind::Switch(f) => f.from_stream(name, ctx),
            FieldKind::Enum(f) => f.from_stream(name, ctx),
        }
    }

    /// [`Field::from_stream`] followed by the decoder, when one is set.
    pub(crate) fn decode_from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let (value, consumed) = self.from_stream(name, ctx)?;
        let value = match &self.decoder {
            Some(t) => t.apply(value)?,
            None => value,
        };
        Ok((value, consumed))
    }

    /// Serializes the value, returning the number of bytes written. Variants
    /// substitute their intrinsic default when handed [`Value::None`].
    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        match &self.kind {
            FieldKind::Bytes(f) => f.to_stream(name, value, ctx),
            FieldKind::String(f) => f.to_stream(name, value, ctx),
            FieldKind::Integer(f) => f.to_stream(name, value, ctx),
            FieldKind::Varint(f) => f.to_stream(name, value, ctx),
            FieldKind::Bit(f) => f.to_stream(name, value, ctx),
            FieldKind::Packed(f) => f.to_stream(name, value, ctx),
            FieldKind::Constant(f) => f.to_stream(name, value, ctx),
            FieldKind::Structure(f) => f.to_stream(name, value, ctx),
            FieldKind::Array(f) => f.to_stream(name, value, ctx),
            FieldKind::Conditional(f) => f.to_stream(name, value, ctx),
            FieldKind::Switch(f) => f.to_stream(name, value, ctx),
            FieldKind::Enum(f) => f.to_stream(name, value, ctx),
        }
    }

    /// The encoder, when one is set, followed by [`Field::to_stream`].
    pub(crate) fn encode_to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        match &self.encoder {
            Some(t) => {
                let encoded = t.apply(value.clone())?;
                self.to_stream(name, &encoded, ctx)
            }
            None => self.to_stream(name, value, ctx),
        }
    }

    pub(crate) fn get_default(&self, ctx: &Context) -> Result<Option<Value>> {
        match &self.default {
            Some(spec) => spec.resolve(ctx).map(Some),
            None => Ok(None),
        }
    }

    /// Applies the override to the in-flight emit value.
    pub(crate) fn apply_override(&self, ctx: &Context, current: Value) -> Result<Value> {
        match &self.override_ {
            None => Ok(current),
            Some(Override::Const(v)) => Ok(v.clone()),
            Some(Override::Expr(e)) => e.eval(ctx, Some(&current)),
            Some(Override::LengthOf(of)) => {
                if current.is_none() {
                    Ok(Value::Uint(ctx.lookup(of)?.length()?))
                } else {
                    Ok(current)
                }
            }
            Some(Override::CountOf(of)) => {
                if current.is_none() {
                    Ok(Value::Uint(ctx.lookup(of)?.length()?))
                } else {
                    Ok(current)
                }
            }
            Some(Override::BitLengthOf(of)) => {
                if current.is_none() {
                    Ok(Value::Uint(ctx.lookup(of)?.bit_length()?))
                } else {
                    Ok(current)
                }
            }
        }
    }

    /// Binds structure-level defaults (byte order, text encoding) into the
    /// variant and installs the constant field's implicit default. Called once
    /// at structure build time.
    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        match &mut self.kind {
            FieldKind::Integer(f) => f.bind(options),
            FieldKind::Packed(f) => f.bind(options),
            FieldKind::String(f) => f.bind(options),
            FieldKind::Constant(f) => {
                if self.default.is_none() {
                    self.default = Some(Spec::Const(f.value().clone()));
                }
                f.bind(options);
            }
            FieldKind::Array(f) => f.bind(options),
            FieldKind::Conditional(f) => f.bind(options),
            FieldKind::Switch(f) => f.bind(options),
            FieldKind::Enum(f) => f.bind(options),
            _ => {}
        }
    }

    /// Declaration-time validation of this field and any wrapped base fields.
    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.offset.is_some() && self.skip.is_some() {
            return Err(Error::definition(format!(
                "field {} specifies both offset and skip",
                name
            )));
        }
        if let Some(skip) = self.skip.as_ref().and_then(|s| s.as_const()) {
            if skip.as_int().map(|s| s < 0).unwrap_or(false) {
                return Err(Error::definition(format!(
                    "field {} specifies a negative skip",
                    name
                )));
            }
        }
        if self.lazy && matches!(self.kind, FieldKind::Bit(_)) {
            return Err(Error::definition(format!(
                "bit field {} cannot be lazy; bit state must be tracked",
                name
            )));
        }
        match &self.kind {
            FieldKind::Bytes(f) => f.validate(name),
            FieldKind::String(f) => f.validate(name),
            FieldKind::Integer(f) => f.validate(name),
            FieldKind::Bit(f) => f.validate(name),
            FieldKind::Packed(f) => f.validate(name),
            FieldKind::Constant(f) => f.validate(name),
            FieldKind::Array(f) => f.validate(name),
            FieldKind::Conditional(f) => f.validate(name),
            FieldKind::Switch(f) => f.validate(name),
            FieldKind::Enum(f) => f.validate(name),
            _ => Ok(()),
        }
    }

    /// Same-context field names referenced by this field's specs; used for
    /// build-time validation.
    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        if let Some(s) = &self.offset {
            s.referenced_fields(out);
        }
        if let Some(s) = &self.skip {
            s.referenced_fields(out);
        }
        if let Some(s) = &self.default {
            s.referenced_fields(out);
        }
        if let Some(Override::Expr(e)) = &self.override_ {
            e.referenced_fields(out);
        }
        match &self.kind {
            FieldKind::Bytes(f) => f.referenced_fields(out),
            FieldKind::String(f) => f.referenced_fields(out),
            FieldKind::Bit(f) => f.referenced_fields(out),
            FieldKind::Structure(f) => f.referenced_fields(out),
            FieldKind::Array(f) => f.referenced_fields(out),
            FieldKind::Conditional(f) => f.referenced_fields(out),
            FieldKind::Switch(f) => f.referenced_fields(out),
            FieldKind::Enum(f) => f.referenced_fields(out),
            _ => {}
        }
    }

    /// The field-ref auto-override this field implies on another field:
    /// `(referenced field, override to install)`.
    pub(crate) fn implied_override(&self, name: &str) -> Option<(String, Override)> {
        match &self.kind {
            FieldKind::Bytes(f) => f
                .length_field_ref()
                .map(|r| (r.to_string(), Override::LengthOf(name.to_string()))),
            FieldKind::String(f) => f
                .length_field_ref()
                .map(|r| (r.to_string(), Override::LengthOf(name.to_string()))),
            FieldKind::Array(f) => f
                .count_field_ref()
                .map(|r| (r.to_string(), Override::CountOf(name.to_string()))),
            FieldKind::Bit(f) => f
                .length_field_ref()
                .map(|r| (r.to_string(), Override::BitLengthOf(name.to_string()))),
            _ => None,
        }
    }

    pub(crate) fn has_override(&self) -> bool {
        self.override_.is_some()
    }

    /// C-style description of the field, used by structure dumps.
    pub(crate) fn ctype(&self, name: &str) -> String {
        match &self.kind {
            FieldKind::Bytes(f) => f.ctype(name),
            FieldKind::String(f) => f.ctype(name),
            FieldKind::Integer(f) => f.ctype(name),
            FieldKind::Varint(f) => f.ctype(name),
            FieldKind::Bit(f) => f.ctype(name),
            FieldKind::Packed(f) => f.ctype(name),
            FieldKind::Constant(f) => f.ctype(name),
            FieldKind::Structure(f) => f.ctype(name),
            FieldKind::Array(f) => f.ctype(name),
            FieldKind::Conditional(f) => f.ctype(name),
            FieldKind::Switch(f) => f.ctype(name),
            FieldKind::Enum(f) => f.ctype(name),
        }
    }
}

macro_rules! field_from_kind {
    ($($variant:ident => $ty:ty),* $(,)?) => {$(
        impl From<$ty> for Field {
            fn from(f: $ty) -> Self {
                Field::new(FieldKind::$variant(f))
            }
        }
    )*};
}

field_from_kind!(
    Bytes => BytesField,
    String => StringField,
    Integer => IntegerField,
    Varint => VarintField,
    Bit => BitField,
    Packed => PackedField,
    Constant => ConstantField,
    Structure => StructureField,
    Array => ArrayField,
    Conditional => ConditionalField,
    Switch => SwitchField,
    Enum => EnumField,
);
