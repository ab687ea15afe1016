//! Built-in field variants.

pub mod bits;
pub mod bytes;
pub mod integer;
pub mod packed;
pub mod wrapped;

pub use bits::BitField;
pub use bytes::{BytesField, StringField, TerminatorHandler, TextErrors};
pub use integer::{IntegerField, VarintField};
pub use packed::PackedField;
pub use wrapped::{
    ArrayField, ConditionalField, ConstantField, EnumField, EnumType, StructureField, SwitchField,
};
