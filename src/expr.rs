//! Dependent-attribute specs and the expression AST they may carry.
//!
//! Field attributes that can depend on other fields (length, count, offset,
//! skip, condition, switch, default) are a [`Spec`]: a constant, a reference to
//! a sibling field by name, or a composed [`Expr`]. Expressions are symbolic —
//! a small AST over field lookups, the usual arithmetic/bitwise operators,
//! comparisons, and a length operator — and are pure: evaluating one never
//! mutates the context. Keeping them symbolic lets the structure builder
//! inspect which fields an expression references, which drives build-time
//! validation and auto-override inference.
//!
//! ```
//! use bytespec::expr::{this, len_};
//!
//! let total = len_(this("content")) + 4u64;
//! let is_v2 = this("version").ge_(2u64);
//! ```

use crate::context::Context;
use crate::error::{Error, Result};
use crate::value::{ArithOp, Value};
use std::fmt;

/// A dependent attribute: constant, sibling-field reference, or expression.
#[derive(Debug, Clone)]
pub enum Spec {
    Const(Value),
    /// Lookup of a sibling (or, in flat subcontexts, ancestor) field by name.
    FieldRef(String),
    Expr(Expr),
}

impl Spec {
    pub fn resolve(&self, ctx: &Context) -> Result<Value> {
        match self {
            Spec::Const(v) => Ok(v.clone()),
            Spec::FieldRef(name) => ctx.lookup(name),
            Spec::Expr(e) => e.eval(ctx, None),
        }
    }

    pub(crate) fn resolve_int(&self, ctx: &Context, what: &str) -> Result<i64> {
        let v = self.resolve(ctx)?.resolve()?;
        v.as_int()
            .ok_or_else(|| Error::parse(format!("{} resolved to non-integer value {}", what, v)))
    }

    pub(crate) fn resolve_uint(&self, ctx: &Context, what: &str) -> Result<u64> {
        let v = self.resolve(ctx)?.resolve()?;
        v.as_uint()
            .ok_or_else(|| Error::parse(format!("{} resolved to non-integer value {}", what, v)))
    }

    /// The constant value, when this spec does not depend on a context.
    pub fn as_const(&self) -> Option<&Value> {
        match self {
            Spec::Const(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn as_field_ref(&self) -> Option<&str> {
        match self {
            Spec::FieldRef(name) => Some(name),
            _ => None,
        }
    }

    /// Collects same-context field names this spec depends on.
    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            Spec::Const(_) => {}
            Spec::FieldRef(name) => out.push(name.clone()),
            Spec::Expr(e) => e.referenced_fields(out),
        }
    }
}

impl From<Expr> for Spec {
    fn from(e: Expr) -> Self {
        Spec::Expr(e)
    }
}

/// A bare string in a spec position is a field reference, mirroring the
/// `length = "len"` declaration shorthand.
impl From<&str> for Spec {
    fn from(name: &str) -> Self {
        Spec::FieldRef(name.to_string())
    }
}

macro_rules! spec_from_const {
    ($($t:ty),*) => {$(
        impl From<$t> for Spec {
            fn from(v: $t) -> Self {
                Spec::Const(v.into())
            }
        }
    )*};
}

spec_from_const!(bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, Vec<u8>, &[u8]);

impl<const N: usize> From<&[u8; N]> for Spec {
    fn from(v: &[u8; N]) -> Self {
        Spec::Const(v.into())
    }
}

impl From<Value> for Spec {
    fn from(v: Value) -> Self {
        Spec::Const(v)
    }
}

/// Which context a field lookup starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    This,
    /// `n` levels up; `Parent(1)` is the immediate parent context.
    Parent(u32),
    Root,
}

/// A field lookup with scope navigation.
#[derive(Debug, Clone)]
pub struct Path {
    pub scope: Scope,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    /// Logical negation on truthiness.
    Not,
    /// Bitwise inversion.
    Invert,
}

/// A pure expression over a parsing context.
#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Value),
    Path(Path),
    /// The in-flight value: the current value inside an override, the last
    /// element inside an array `until` condition.
    Current,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Logical length of the operand (bytes for byte values, element count
    /// for lists).
    Len(Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
}

/// Reference to a field of the current context.
pub fn this(name: impl Into<String>) -> Expr {
    Expr::Path(Path { scope: Scope::This, name: name.into() })
}

/// Reference to a field of the parent context.
pub fn parent(name: impl Into<String>) -> Expr {
    Expr::Path(Path { scope: Scope::Parent(1), name: name.into() })
}

/// Reference to a field of the root context.
pub fn root(name: impl Into<String>) -> Expr {
    Expr::Path(Path { scope: Scope::Root, name: name.into() })
}

/// The in-flight value (see [`Expr::Current`]).
pub fn current() -> Expr {
    Expr::Current
}

/// Logical length of an expression's value.
pub fn len_(operand: impl Into<Expr>) -> Expr {
    Expr::Len(Box::new(operand.into()))
}

impl Expr {
    pub fn eval(&self, ctx: &Context, current: Option<&Value>) -> Result<Value> {
        match self {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Path(path) => ctx.navigate(path.scope)?.lookup(&path.name),
            Expr::Current => Ok(current.cloned().unwrap_or(Value::None)),
            Expr::Unary(op, e) => {
                let v = e.eval(ctx, current)?.resolve()?;
                match op {
                    UnaryOp::Neg => v.neg(),
                    UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
                    UnaryOp::Invert => v.invert(),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                // Boolean combinators short-circuit on the left value.
                if let BinOp::And | BinOp::Or = *op {
                    let l = lhs.eval(ctx, current)?.resolve()?;
                    let short = match *op {
                        BinOp::And => !l.is_truthy(),
                        _ => l.is_truthy(),
                    };
                    if short {
                        return Ok(l);
                    }
                    return rhs.eval(ctx, current)?.resolve();
                }
                let l = lhs.eval(ctx, current)?.resolve()?;
                let r = rhs.eval(ctx, current)?.resolve()?;
                use std::cmp::Ordering::*;
                let arith = |op| Value::arith(op, &l, &r);
                match op {
                    BinOp::Add => arith(ArithOp::Add),
                    BinOp::Sub => arith(ArithOp::Sub),
                    BinOp::Mul => arith(ArithOp::Mul),
                    BinOp::Div => arith(ArithOp::Div),
                    BinOp::FloorDiv => arith(ArithOp::FloorDiv),
                    BinOp::Rem => arith(ArithOp::Rem),
                    BinOp::Shl => arith(ArithOp::Shl),
                    BinOp::Shr => arith(ArithOp::Shr),
                    BinOp::BitAnd => arith(ArithOp::BitAnd),
                    BinOp::BitOr => arith(ArithOp::BitOr),
                    BinOp::BitXor => arith(ArithOp::BitXor),
                    BinOp::Eq => Ok(Value::Bool(l == r)),
                    BinOp::Ne => Ok(Value::Bool(l != r)),
                    BinOp::Lt => Ok(Value::Bool(l.compare(&r)? == Less)),
                    BinOp::Le => Ok(Value::Bool(l.compare(&r)? != Greater)),
                    BinOp::Gt => Ok(Value::Bool(l.compare(&r)? == Greater)),
                    BinOp::Ge => Ok(Value::Bool(l.compare(&r)? != Less)),
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                }
            }
            Expr::Len(e) => Ok(Value::Uint(e.eval(ctx, current)?.resolve()?.length()?)),
            Expr::Index(e, idx) => {
                let v = e.eval(ctx, current)?.resolve()?;
                let i = idx.eval(ctx, current)?.resolve()?;
                v.index(&i)
            }
        }
    }

    fn binary(op: BinOp, lhs: Expr, rhs: impl Into<Expr>) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs.into()))
    }

    pub fn eq_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Eq, self, rhs)
    }

    pub fn ne_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ne, self, rhs)
    }

    pub fn lt_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Lt, self, rhs)
    }

    pub fn le_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Le, self, rhs)
    }

    pub fn gt_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Gt, self, rhs)
    }

    pub fn ge_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Ge, self, rhs)
    }

    pub fn and_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::And, self, rhs)
    }

    pub fn or_(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::Or, self, rhs)
    }

    pub fn not_(self) -> Expr {
        Expr::Unary(UnaryOp::Not, Box::new(self))
    }

    pub fn floor_div(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinOp::FloorDiv, self, rhs)
    }

    /// Index into a list value.
    pub fn at(self, idx: impl Into<Expr>) -> Expr {
        Expr::Index(Box::new(self), Box::new(idx.into()))
    }

    /// Access a member of a sub-structure value.
    pub fn get(self, name: impl Into<String>) -> Expr {
        Expr::Index(Box::new(self), Box::new(Expr::Lit(Value::Str(name.into()))))
    }

    /// Collects This-scoped field names this expression depends on; parent and
    /// root references resolve outside the structure being built.
    pub(crate) fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            Expr::Lit(_) | Expr::Current => {}
            Expr::Path(p) => {
                if p.scope == Scope::This {
                    out.push(p.name.clone());
                }
            }
            Expr::Unary(_, e) | Expr::Len(e) => e.referenced_fields(out),
            Expr::Binary(_, l, r) | Expr::Index(l, r) => {
                l.referenced_fields(out);
                r.referenced_fields(out);
            }
        }
    }
}

macro_rules! expr_from_lit {
    ($($t:ty),*) => {$(
        impl From<$t> for Expr {
            fn from(v: $t) -> Self {
                Expr::Lit(v.into())
            }
        }
    )*};
}

expr_from_lit!(
    bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, f32, f64, Vec<u8>, &[u8], &str, String,
    Value
);

impl<const N: usize> From<&[u8; N]> for Expr {
    fn from(v: &[u8; N]) -> Self {
        Expr::Lit(v.into())
    }
}

macro_rules! expr_binop {
    ($trait:ident, $method:ident, $op:ident) => {
        impl<R: Into<Expr>> std::ops::$trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::binary(BinOp::$op, self, rhs)
            }
        }
    };
}

expr_binop!(Add, add, Add);
expr_binop!(Sub, sub, Sub);
expr_binop!(Mul, mul, Mul);
expr_binop!(Div, div, Div);
expr_binop!(Rem, rem, Rem);
expr_binop!(Shl, shl, Shl);
expr_binop!(Shr, shr, Shr);
expr_binop!(BitAnd, bitand, BitAnd);
expr_binop!(BitOr, bitor, BitOr);
expr_binop!(BitXor, bitxor, BitXor);

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Unary(UnaryOp::Neg, Box::new(self))
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        Expr::Unary(UnaryOp::Invert, Box::new(self))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Lit(v) => write!(f, "{}", v),
            Expr::Path(p) => match p.scope {
                Scope::This => write!(f, "this.{}", p.name),
                Scope::Parent(n) => {
                    for _ in 0..n {
                        write!(f, "parent.")?;
                    }
                    write!(f, "{}", p.name)
                }
                Scope::Root => write!(f, "root.{}", p.name),
            },
            Expr::Current => write!(f, "current"),
            Expr::Unary(op, e) => {
                let sym = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "not ",
                    UnaryOp::Invert => "~",
                };
                write!(f, "({}{})", sym, e)
            }
            Expr::Binary(op, l, r) => {
                use BinOp::*;
                let sym = match op {
                    Add => "+",
                    Sub => "-",
                    Mul => "*",
                    Div => "/",
                    FloorDiv => "//",
                    Rem => "%",
                    Shl => "<<",
                    Shr => ">>",
                    BitAnd => "&",
                    BitOr => "|",
                    BitXor => "^",
                    Eq => "==",
                    Ne => "!=",
                    Lt => "<",
                    Le => "<=",
                    Gt => ">",
                    Ge => ">=",
                    And => "and",
                    Or => "or",
                };
                write!(f, "({} {} {})", l, sym, r)
            }
            Expr::Len(e) => write!(f, "len({})", e),
            Expr::Index(e, i) => write!(f, "{}[{}]", e, i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_reads_like_the_declaration() {
        let e = len_(this("content")) + 4u64;
        assert_eq!(e.to_string(), "(len(this.content) + 4)");
        let c = this("version").ge_(2u64).and_(this("flags").ne_(0u64));
        assert_eq!(c.to_string(), "((this.version >= 2) and (this.flags != 0))");
    }

    #[test]
    fn referenced_fields_sees_through_operators() {
        let e = (this("a") + this("b")) * len_(this("c"));
        let mut refs = Vec::new();
        e.referenced_fields(&mut refs);
        assert_eq!(refs, vec!["a", "b", "c"]);
    }

    #[test]
    fn parent_refs_are_not_local() {
        let e = parent("a") + this("b");
        let mut refs = Vec::new();
        e.referenced_fields(&mut refs);
        assert_eq!(refs, vec!["b"]);
    }
}
