//! Raw byte fields and their text-decoding counterpart.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::expr::Spec;
use crate::structure::StructureOptions;
use crate::value::Value;
use encoding_rs::Encoding;
use std::io::SeekFrom;

/// How a found terminator relates to the field's value and the stream cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminatorHandler {
    /// The terminator is consumed from the stream but not part of the value.
    #[default]
    Consume,
    /// The terminator is consumed and kept at the end of the value.
    Include,
    /// The cursor stops in front of the terminator; it is not consumed.
    Until,
}

/// A run of raw bytes, delimited by a length, a terminator, or end-of-stream.
///
/// With both a length and a terminator, exactly `length` bytes are consumed
/// and the terminator is searched within them; with only a terminator the
/// stream is scanned forward in `step`-sized chunks; a negative length reads
/// until end-of-stream.
#[derive(Debug, Clone)]
pub struct BytesField {
    pub(crate) length: Option<Spec>,
    pub(crate) terminator: Option<Vec<u8>>,
    pub(crate) strict: bool,
    pub(crate) padding: Option<Vec<u8>>,
    pub(crate) step: usize,
    pub(crate) handler: TerminatorHandler,
}

impl BytesField {
    fn empty() -> Self {
        BytesField {
            length: None,
            terminator: None,
            strict: true,
            padding: None,
            step: 1,
            handler: TerminatorHandler::Consume,
        }
    }

    /// A field of exactly `length` bytes.
    pub fn fixed(length: impl Into<Spec>) -> Self {
        let mut f = Self::empty();
        f.length = Some(length.into());
        f
    }

    /// A field delimited by `terminator`.
    pub fn terminated(terminator: impl Into<Vec<u8>>) -> Self {
        let mut f = Self::empty();
        f.terminator = Some(terminator.into());
        f
    }

    /// A field delimited by a NUL byte.
    pub fn null_terminated() -> Self {
        Self::terminated(b"\0".to_vec())
    }

    /// A field consuming everything up to end-of-stream.
    pub fn until_eof() -> Self {
        let mut f = Self::empty();
        f.length = Some(Spec::Const(Value::Int(-1)));
        f
    }

    pub fn with_length(mut self, length: impl Into<Spec>) -> Self {
        self.length = Some(length.into());
        self
    }

    pub fn with_terminator(mut self, terminator: impl Into<Vec<u8>>) -> Self {
        self.terminator = Some(terminator.into());
        self
    }

    /// Tolerates short reads and missing terminators instead of failing.
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    /// Padding unit stripped from the tail on read and appended on write.
    pub fn with_padding(mut self, padding: impl Into<Vec<u8>>) -> Self {
        self.padding = Some(padding.into());
        self
    }

    /// Terminator scan granularity; scan positions are field-start aligned
    /// multiples of `step`.
    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    pub fn with_handler(mut self, handler: TerminatorHandler) -> Self {
        self.handler = handler;
        self
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.length.is_none() && self.terminator.is_none() {
            return Err(Error::definition(format!(
                "bytes field {} needs a length or a terminator",
                name
            )));
        }
        if self.step == 0 {
            return Err(Error::definition(format!(
                "bytes field {} has a zero step",
                name
            )));
        }
        if self.terminator.as_ref().map(|t| t.is_empty()).unwrap_or(false) {
            return Err(Error::definition(format!(
                "bytes field {} has an empty terminator",
                name
            )));
        }
        if self.padding.as_ref().map(|p| p.is_empty()).unwrap_or(false) {
            return Err(Error::definition(format!(
                "bytes field {} has empty padding",
                name
            )));
        }
        Ok(())
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        if let Some(l) = &self.length {
            l.referenced_fields(out);
        }
    }

    pub(crate) fn length_field_ref(&self) -> Option<&str> {
        self.length.as_ref().and_then(|l| l.as_field_ref())
    }

    pub(crate) fn len(&self) -> Result<u64> {
        match self.length.as_ref().and_then(|l| l.as_const()).and_then(|v| v.as_int()) {
            Some(len) if len >= 0 => Ok(len as u64),
            _ => Err(Error::unknown_length("bytes length depends on context")),
        }
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let length = match &self.length {
            Some(spec) => Some(spec.resolve_int(ctx, "length")?),
            None => None,
        };
        match (length, &self.terminator) {
            (Some(len), _) if len >= 0 => self.read_fixed(name, ctx, len as usize),
            (_, Some(_)) => self.scan_stream(name, ctx, false),
            (Some(_), None) => {
                // negative length: until end-of-stream
                let stream = ctx.stream()?;
                let read = stream.borrow_mut().read_until_eof()?;
                let consumed = read.len() as u64;
                Ok((Value::Bytes(read), consumed))
            }
            (None, None) => Err(Error::definition(format!(
                "bytes field {} needs a length or a terminator",
                name
            ))),
        }
    }

    fn read_fixed(&self, name: &str, ctx: &Context, len: usize) -> Result<(Value, u64)> {
        let stream = ctx.stream()?;
        let read = stream.borrow_mut().read_up_to(len)?;
        if read.len() < len && self.strict {
            return Err(Error::stream_exhausted(format!(
                "field {}: tried to read {} bytes, only {} available",
                name,
                len,
                read.len()
            )));
        }
        let consumed = read.len() as u64;
        let value = if self.terminator.is_some() {
            self.split_at_terminator(name, &read)?
        } else if let Some(pad) = &self.padding {
            let mut v = read;
            while v.len() >= pad.len() && v.ends_with(pad) {
                v.truncate(v.len() - pad.len());
            }
            v
        } else {
            read
        };
        Ok((Value::Bytes(value), consumed))
    }

    /// Searches `data` for the terminator at step-aligned positions.
    fn split_at_terminator(&self, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let term = self.terminator.as_ref().expect("caller checked");
        let mut pos = 0;
        while pos + term.len() <= data.len() {
            if &data[pos..pos + term.len()] == term.as_slice() {
                return Ok(match self.handler {
                    TerminatorHandler::Consume | TerminatorHandler::Until => data[..pos].to_vec(),
                    TerminatorHandler::Include => data[..pos + term.len()].to_vec(),
                });
            }
            pos += self.step;
        }
        if self.strict {
            Err(Error::stream_exhausted(format!(
                "field {}: terminator not found",
                name
            )))
        } else {
            Ok(data.to_vec())
        }
    }

    /// Scans the stream forward until the terminator. With `skim` set only the
    /// cursor is moved (used to skip lazy fields); the value is not retained.
    fn scan_stream(&self, name: &str, ctx: &Context, skim: bool) -> Result<(Value, u64)> {
        let term = self.terminator.as_ref().expect("caller checked");
        let stream = ctx.stream()?;
        let mut buf = Vec::new();
        loop {
            let chunk = stream.borrow_mut().read_up_to(self.step)?;
            let short = chunk.len() < self.step;
            buf.extend_from_slice(&chunk);
            if !short && buf.len() >= term.len() && buf.ends_with(term) {
                let consumed = match self.handler {
                    TerminatorHandler::Consume | TerminatorHandler::Include => buf.len() as u64,
                    TerminatorHandler::Until => {
                        stream
                            .borrow_mut()
                            .seek(SeekFrom::Current(-(term.len() as i64)))?;
                        (buf.len() - term.len()) as u64
                    }
                };
                let value = if skim {
                    Vec::new()
                } else {
                    match self.handler {
                        TerminatorHandler::Include => buf,
                        _ => {
                            buf.truncate(buf.len() - term.len());
                            buf
                        }
                    }
                };
                return Ok((Value::Bytes(value), consumed));
            }
            if short {
                if self.strict {
                    return Err(Error::stream_exhausted(format!(
                        "field {}: terminator not found before end of stream",
                        name
                    )));
                }
                let consumed = buf.len() as u64;
                return Ok((Value::Bytes(buf), consumed));
            }
        }
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let bytes = match value {
            Value::None => Vec::new(),
            v => v
                .as_bytes()
                .map(|b| b.to_vec())
                .ok_or_else(|| Error::write(format!("field {} expects bytes, got {}", name, v)))?,
        };
        self.write_bytes(name, bytes, ctx)
    }

    /// Shared write path: terminator handling, length/padding enforcement.
    pub(crate) fn write_bytes(&self, name: &str, bytes: Vec<u8>, ctx: &Context) -> Result<u64> {
        let mut out = bytes;
        if let Some(term) = &self.terminator {
            match self.handler {
                TerminatorHandler::Consume => out.extend_from_slice(term),
                TerminatorHandler::Include => {
                    if !out
                        .windows(term.len())
                        .any(|w| w == term.as_slice())
                    {
                        return Err(Error::write(format!(
                            "field {}: value does not include its terminator",
                            name
                        )));
                    }
                }
                TerminatorHandler::Until => {}
            }
        }
        // A constant length constrains the value; a dependent length (field
        // reference or expression) describes it and follows the value via the
        // auto-override, so it imposes nothing here.
        let length = self.length.as_ref().and_then(|l| l.as_const()).and_then(|v| v.as_int());
        if let Some(len) = length {
            if len >= 0 {
                let len = len as usize;
                if out.len() > len {
                    return Err(Error::write(format!(
                        "field {}: value is {} bytes, at most {} fit",
                        name,
                        out.len(),
                        len
                    )));
                }
                if out.len() < len {
                    match &self.padding {
                        Some(pad) => {
                            while out.len() + pad.len() <= len {
                                out.extend_from_slice(pad);
                            }
                            if out.len() != len {
                                return Err(Error::write(format!(
                                    "field {}: padding does not evenly fill {} bytes",
                                    name, len
                                )));
                            }
                        }
                        None => {
                            return Err(Error::write(format!(
                                "field {}: value is {} bytes, expected {} and no padding is set",
                                name,
                                out.len(),
                                len
                            )));
                        }
                    }
                }
            }
        }
        let stream = ctx.stream()?;
        let written = stream.borrow_mut().write(&out)?;
        Ok(written as u64)
    }

    pub(crate) fn seek_end(&self, ctx: &Context) -> Result<Option<u64>> {
        if let Some(spec) = &self.length {
            match spec.resolve_int(ctx, "length") {
                Ok(len) if len >= 0 => {
                    let pos = ctx.stream()?.borrow_mut().seek(SeekFrom::Current(len))?;
                    return Ok(Some(pos));
                }
                Ok(_) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
        if self.terminator.is_some() {
            let (_, _) = self.scan_stream("(skip)", ctx, true)?;
            return Ok(Some(ctx.stream()?.borrow_mut().tell()?));
        }
        Ok(None)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        match self.length.as_ref().and_then(|l| l.as_const()).and_then(|v| v.as_int()) {
            Some(len) if len >= 0 => format!("char {}[{}]", name, len),
            _ => format!("char {}[]", name),
        }
    }
}

/// Error policy for text decoding and encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextErrors {
    /// Malformed input or unmappable characters fail the operation.
    #[default]
    Strict,
    /// Malformed input or unmappable characters use replacement characters.
    Replace,
}

/// A [`BytesField`] whose value is text in a configurable encoding. Without an
/// explicit encoding the structure's default (UTF-8 unless overridden) is
/// used.
#[derive(Debug, Clone)]
pub struct StringField {
    pub(crate) bytes: BytesField,
    pub(crate) encoding: Option<&'static Encoding>,
    pub(crate) errors: TextErrors,
}

impl StringField {
    pub fn fixed(length: impl Into<Spec>) -> Self {
        StringField { bytes: BytesField::fixed(length), encoding: None, errors: TextErrors::Strict }
    }

    pub fn terminated(terminator: impl Into<Vec<u8>>) -> Self {
        StringField {
            bytes: BytesField::terminated(terminator),
            encoding: None,
            errors: TextErrors::Strict,
        }
    }

    pub fn from_bytes_field(bytes: BytesField) -> Self {
        StringField { bytes, encoding: None, errors: TextErrors::Strict }
    }

    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_errors(mut self, errors: TextErrors) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_padding(mut self, padding: impl Into<Vec<u8>>) -> Self {
        self.bytes = self.bytes.with_padding(padding);
        self
    }

    fn encoding(&self) -> &'static Encoding {
        self.encoding.unwrap_or(encoding_rs::UTF_8)
    }

    pub(crate) fn bind(&mut self, options: &StructureOptions) {
        if self.encoding.is_none() {
            self.encoding = Some(options.encoding);
        }
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        self.bytes.validate(name)
    }

    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        self.bytes.referenced_fields(out);
    }

    pub(crate) fn length_field_ref(&self) -> Option<&str> {
        self.bytes.length_field_ref()
    }

    pub(crate) fn len(&self) -> Result<u64> {
        self.bytes.len()
    }

    pub(crate) fn from_stream(&self, name: &str, ctx: &Context) -> Result<(Value, u64)> {
        let (value, consumed) = self.bytes.from_stream(name, ctx)?;
        let raw = value.as_bytes().unwrap_or(&[]);
        let (text, had_errors) = self.encoding().decode_without_bom_handling(raw);
        if had_errors && self.errors == TextErrors::Strict {
            return Err(Error::parse(format!(
                "field {}: invalid {} data",
                name,
                self.encoding().name()
            )));
        }
        Ok((Value::Str(text.into_owned()), consumed))
    }

    pub(crate) fn to_stream(&self, name: &str, value: &Value, ctx: &Context) -> Result<u64> {
        let text = match value {
            Value::None => "",
            v => v
                .as_str()
                .ok_or_else(|| Error::write(format!("field {} expects a string, got {}", name, v)))?,
        };
        let (encoded, _, unmappable) = self.encoding().encode(text);
        if unmappable && self.errors == TextErrors::Strict {
            return Err(Error::write(format!(
                "field {}: string not representable in {}",
                name,
                self.encoding().name()
            )));
        }
        self.bytes.write_bytes(name, encoded.into_owned(), ctx)
    }

    pub(crate) fn seek_end(&self, ctx: &Context) -> Result<Option<u64>> {
        self.bytes.seek_end(ctx)
    }

    pub(crate) fn ctype(&self, name: &str) -> String {
        self.bytes.ctype(name)
    }
}
