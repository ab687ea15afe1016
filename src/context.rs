//! Per-operation parsing state: field-by-field parse records, parent/root
//! navigation links, and the lazy proxy that defers reads until first use.

use crate::error::{Error, Result};
use crate::expr::Scope;
use crate::field::Field;
use crate::stream::SharedStream;
use crate::value::Value;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Shared handle to the state of one parse or emit operation. Cloning the
/// handle shares the state; contexts form a tree through `parent` links.
#[derive(Clone)]
pub struct Context {
    inner: Rc<RefCell<ContextData>>,
}

pub(crate) struct ContextData {
    pub fields: Vec<FieldContext>,
    pub by_name: HashMap<String, usize>,
    /// Weak: the parent owns its children through subcontext links, so a
    /// strong back-edge would leak the whole context tree.
    pub parent: Option<Weak<RefCell<ContextData>>>,
    /// Name of the field in the parent that created this subcontext.
    pub parent_field: Option<String>,
    /// Flat subcontexts fall through to the parent on unbound lookups.
    pub flat: bool,
    pub stream: Option<SharedStream>,
    pub capture_raw: bool,
    /// Set once the engine finishes; lazy fields can no longer be upgraded.
    pub done: bool,
    /// Stream position at the start of this context's operation.
    pub origin: u64,
}

/// The parse record for a single field.
#[derive(Clone)]
pub struct FieldContext {
    pub(crate) field: Option<Arc<Field>>,
    /// The name the field was parsed under; array elements use their index.
    pub name: String,
    pub(crate) value: Option<Value>,
    /// True once the field has been read/written or its laziness committed.
    pub parsed: bool,
    pub lazy: bool,
    /// Stream position at field start. Negative values count from the end of
    /// the stream and occur only for unforced forward references.
    pub offset: Option<i64>,
    pub length: Option<u64>,
    /// Raw bytes of the field, when `capture_raw` is enabled.
    pub raw: Option<Vec<u8>>,
    pub(crate) subcontext: Option<Context>,
}

impl FieldContext {
    pub(crate) fn new(field: Option<Arc<Field>>, name: impl Into<String>) -> Self {
        FieldContext {
            field,
            name: name.into(),
            value: None,
            parsed: false,
            lazy: false,
            offset: None,
            length: None,
            raw: None,
            subcontext: None,
        }
    }

    /// Whether a value (possibly a lazy proxy) is available.
    pub fn has_value(&self) -> bool {
        self.lazy || self.value.is_some()
    }

    /// Whether the value has been read from/written to the stream.
    pub fn resolved(&self) -> bool {
        self.parsed && !self.lazy
    }

    pub fn subcontext(&self) -> Option<&Context> {
        self.subcontext.as_ref()
    }
}

impl Context {
    pub(crate) fn new(
        stream: Option<SharedStream>,
        parent: Option<Context>,
        parent_field: Option<String>,
        flat: bool,
        capture_raw: bool,
        origin: u64,
    ) -> Self {
        Context {
            inner: Rc::new(RefCell::new(ContextData {
                fields: Vec::new(),
                by_name: HashMap::new(),
                parent: parent.map(|c| Rc::downgrade(&c.inner)),
                parent_field,
                flat,
                stream,
                capture_raw,
                done: false,
                origin,
            })),
        }
    }

    /// Registers one field context per declared field, in declaration order.
    pub(crate) fn initialize_from_fields(&self, fields: &[(String, Arc<Field>)]) {
        let mut data = self.inner.borrow_mut();
        data.fields.clear();
        data.by_name.clear();
        for (name, field) in fields {
            let idx = data.fields.len();
            data.fields.push(FieldContext::new(Some(field.clone()), name.clone()));
            data.by_name.insert(name.clone(), idx);
        }
    }

    pub(crate) fn data(&self) -> Ref<'_, ContextData> {
        self.inner.borrow()
    }

    pub(crate) fn data_mut(&self) -> RefMut<'_, ContextData> {
        self.inner.borrow_mut()
    }

    pub fn parent(&self) -> Option<Context> {
        self.inner
            .borrow()
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Context { inner })
    }

    /// The topmost ancestor context; may be this context itself.
    pub fn root(&self) -> Context {
        let mut cur = self.clone();
        while let Some(p) = cur.parent() {
            cur = p;
        }
        cur
    }

    pub(crate) fn navigate(&self, scope: Scope) -> Result<Context> {
        match scope {
            Scope::This => Ok(self.clone()),
            Scope::Parent(n) => {
                let mut cur = self.clone();
                for _ in 0..n {
                    cur = cur
                        .parent()
                        .ok_or_else(|| Error::parse("context has no parent"))?;
                }
                Ok(cur)
            }
            Scope::Root => Ok(self.root()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.borrow().done
    }

    pub(crate) fn finish(&self) {
        self.inner.borrow_mut().done = true;
    }

    pub(crate) fn origin(&self) -> u64 {
        self.inner.borrow().origin
    }

    pub(crate) fn stream(&self) -> Result<SharedStream> {
        self.inner
            .borrow()
            .stream
            .clone()
            .ok_or_else(|| Error::parse("context has no stream attached"))
    }

    /// Looks up a field value by name, resolving lazy proxies. Unbound names
    /// fall through to the parent in flat subcontexts.
    pub fn lookup(&self, name: &str) -> Result<Value> {
        let slot = {
            let data = self.inner.borrow();
            match data.by_name.get(name) {
                Some(&i) if data.fields[i].has_value() => Some(i),
                _ => None,
            }
        };
        if let Some(i) = slot {
            return self.slot_value(i)?.resolve();
        }
        let flat = self.inner.borrow().flat;
        if flat {
            if let Some(parent) = self.parent() {
                return parent.lookup(name);
            }
        }
        Err(Error::field_not_found(name))
    }

    /// The value recorded for a slot; lazy fields yield an unforced proxy.
    pub(crate) fn slot_value(&self, slot: usize) -> Result<Value> {
        let data = self.inner.borrow();
        let fc = &data.fields[slot];
        if fc.lazy {
            let field = fc
                .field
                .clone()
                .ok_or_else(|| Error::parse(format!("lazy field {} has no descriptor", fc.name)))?;
            let stream = data
                .stream
                .clone()
                .ok_or_else(|| Error::parse(format!("lazy field {} has no stream", fc.name)))?;
            let offset = fc
                .offset
                .ok_or_else(|| Error::parse(format!("lazy field {} has no offset", fc.name)))?;
            Ok(Value::Lazy(LazyValue {
                inner: Rc::new(LazyInner {
                    stream,
                    offset,
                    field,
                    name: fc.name.clone(),
                    context: Rc::downgrade(&self.inner),
                    slot,
                    cache: RefCell::new(None),
                }),
            }))
        } else {
            fc.value
                .clone()
                .ok_or_else(|| Error::parse(format!("field {} has no value", fc.name)))
        }
    }

    /// Clone of the parse record for a field, for introspection.
    pub fn field(&self, name: &str) -> Option<FieldContext> {
        let data = self.inner.borrow();
        data.by_name.get(name).map(|&i| data.fields[i].clone())
    }

    pub(crate) fn set_value(&self, slot: usize, value: Value) {
        let mut data = self.inner.borrow_mut();
        data.fields[slot].value = Some(value);
    }

    /// Appends a field context (used for array elements parsed under their
    /// index) and returns its slot.
    pub(crate) fn push_field(&self, name: String, field: Option<Arc<Field>>) -> usize {
        let mut data = self.inner.borrow_mut();
        let idx = data.fields.len();
        data.fields.push(FieldContext::new(field, name.clone()));
        data.by_name.insert(name, idx);
        idx
    }

    /// Drops the most recently appended field context (incomplete array
    /// element).
    pub(crate) fn pop_field(&self) {
        let mut data = self.inner.borrow_mut();
        if let Some(fc) = data.fields.pop() {
            data.by_name.remove(&fc.name);
        }
    }

    /// Links a child context into the named field's parse record.
    pub(crate) fn set_subcontext(&self, name: &str, sub: Context) {
        let mut data = self.inner.borrow_mut();
        if let Some(&i) = data.by_name.get(name) {
            data.fields[i].subcontext = Some(sub);
        }
    }

    /// Records the outcome of parsing or writing a field.
    pub(crate) fn add_parse_info(
        &self,
        slot: usize,
        value: Option<Value>,
        offset: i64,
        length: Option<u64>,
        lazy: bool,
    ) {
        let mut data = self.inner.borrow_mut();
        let fc = &mut data.fields[slot];
        fc.parsed = true;
        if let Some(v) = value {
            fc.value = Some(v);
        }
        fc.offset = Some(offset);
        fc.length = length;
        fc.lazy = lazy;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.inner.borrow();
        f.debug_struct("Context")
            .field("fields", &data.fields.iter().map(|fc| &fc.name).collect::<Vec<_>>())
            .field("flat", &data.flat)
            .field("done", &data.done)
            .finish()
    }
}

impl fmt::Debug for FieldContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("FieldContext");
        s.field("name", &self.name);
        if self.lazy {
            s.field("value", &"(lazy)");
        } else {
            s.field("value", &self.value);
        }
        s.field("parsed", &self.parsed)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// A deferred value: the stream position and field descriptor needed to read
/// it on first use. Forcing before the containing context is done upgrades the
/// field's parse record; forcing afterwards only caches the value here.
#[derive(Clone)]
pub struct LazyValue {
    inner: Rc<LazyInner>,
}

struct LazyInner {
    stream: SharedStream,
    /// Stream position; negative counts from the end of the stream.
    offset: i64,
    field: Arc<Field>,
    name: String,
    context: Weak<RefCell<ContextData>>,
    slot: usize,
    cache: RefCell<Option<Value>>,
}

impl LazyValue {
    /// Reads the deferred value, caching it. The stream position is restored
    /// afterwards regardless of the outcome.
    pub fn force(&self) -> Result<Value> {
        if let Some(v) = self.inner.cache.borrow().clone() {
            return Ok(v);
        }
        let ctx = self
            .inner
            .context
            .upgrade()
            .map(|inner| Context { inner })
            .ok_or_else(|| {
                Error::parse(format!(
                    "lazy field {} outlived its parsing context",
                    self.inner.name
                ))
            })?;
        let saved = self.inner.stream.borrow_mut().tell()?;
        let start = {
            let mut stream = self.inner.stream.borrow_mut();
            if self.inner.offset < 0 {
                stream.seek(SeekFrom::End(self.inner.offset))?
            } else {
                stream.seek(SeekFrom::Start(self.inner.offset as u64))?
            }
        };
        let outcome = self
            .inner
            .field
            .decode_from_stream(&self.inner.name, &ctx);
        self.inner.stream.borrow_mut().seek(SeekFrom::Start(saved))?;
        let (value, length) =
            outcome.map_err(|e| e.in_field(&self.inner.name).at_offset(start))?;
        if !ctx.is_done() {
            ctx.add_parse_info(
                self.inner.slot,
                Some(value.clone()),
                start as i64,
                Some(length),
                false,
            );
        }
        *self.inner.cache.borrow_mut() = Some(value.clone());
        Ok(value)
    }

    /// The cached value, if this proxy has been forced before.
    pub fn forced(&self) -> Option<Value> {
        self.inner.cache.borrow().clone()
    }

    /// The stream position this proxy will read from.
    pub fn offset(&self) -> i64 {
        self.inner.offset
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyValue")
            .field("field", &self.inner.name)
            .field("offset", &self.inner.offset)
            .field("forced", &self.inner.cache.borrow().is_some())
            .finish()
    }
}
