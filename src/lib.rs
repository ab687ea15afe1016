//! # bytespec — declarative binary structures
//!
//! Describe a binary format as an ordered list of named fields, then parse
//! byte streams into structure values and emit structure values back into
//! bytes. Each field controls how many bytes it occupies, how raw bytes map
//! to a value, how it depends on sibling or ancestor fields, whether its
//! parsing may be deferred, and which invariants it enforces.
//!
//! ## Field toolbox
//!
//! - Bytes: fixed-length, terminated, padded, until end-of-stream
//!   ([`BytesField`]), with a text layer on top ([`StringField`])
//! - Integers: fixed-width with byte order and signedness ([`IntegerField`]),
//!   base-128 varints ([`VarintField`]), packed-struct format strings
//!   ([`PackedField`])
//! - Sub-byte values sharing a bit cursor ([`BitField`])
//! - Composition: constants, arrays, conditionals, switches, enums, and
//!   nested structures ([`fields::wrapped`])
//!
//! Dependent attributes (lengths, counts, conditions, offsets) are [`Spec`]s:
//! constants, references to sibling fields by name, or composed expressions
//! over the parsing context ([`expr`]).
//!
//! ## Example
//!
//! ```
//! use bytespec::{BytesField, IntegerField, StructureDef};
//!
//! let def = StructureDef::builder("message")
//!     .field("length", IntegerField::new(1))
//!     .field("content", BytesField::fixed("length"))
//!     .build()
//!     .unwrap();
//!
//! let msg = def.from_bytes(b"\x05hello").unwrap();
//! assert_eq!(msg.get("content").unwrap().as_bytes().unwrap(), b"hello");
//!
//! // The length field mirrors the content automatically when emitting.
//! let out = def
//!     .to_bytes(&def.value_of(vec![("content", b"hi".into())]).unwrap())
//!     .unwrap();
//! assert_eq!(out, b"\x02hi");
//! ```

pub mod context;
pub mod error;
pub mod expr;
pub mod field;
pub mod fields;
pub mod stream;
pub mod structure;
pub mod value;

pub use context::{Context, FieldContext, LazyValue};
pub use error::{Error, ErrorKind, Result};
pub use expr::{current, len_, parent, root, this, Expr, Spec};
pub use field::{ByteOrder, Field, FieldKind, Override, Transform};
pub use fields::{
    ArrayField, BitField, BytesField, ConditionalField, ConstantField, EnumField, EnumType,
    IntegerField, PackedField, StringField, StructureField, SwitchField, TerminatorHandler,
    TextErrors, VarintField,
};
pub use stream::{BitStream, CaptureStream, Stream};
pub use structure::{
    NegativeOffsetPolicy, StructValue, StructureBuilder, StructureDef, StructureOptions,
};
pub use value::{EnumValue, Value};
