//! Tagged values of any registered type.
//!
//! A [`Variant`] pairs a type with a [`Value`]. What a type's variants can
//! do is decided by the [`VariantOps`] table registered for it (or for its
//! nearest ancestor that has one) and advertised through [`OpFlags`].
//! Conversions between types go through a sparse table of converters keyed
//! by the exact `(source, destination)` pair; there is no chaining and no
//! automatic reverse direction.
//!
//! # Example
//!
//! ```rust
//! use oxmeta::{Runtime, Value, Variant, builtin};
//!
//! let rt = Runtime::new().unwrap();
//! let n = Variant::new(&rt, 42u32).unwrap();
//! let mut s = Variant::construct_default(&rt, builtin::STRING).unwrap();
//! n.convert(&rt, &mut s).unwrap();
//! assert_eq!(s.peek().unwrap(), &Value::from("42"));
//! ```

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::bit_struct;
use crate::runtime::boxed::BoxRef;
use crate::runtime::table;
use crate::runtime::types::{TypeId, TypeNode, builtin};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Payload of a variant.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Char(char),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    /// An opaque address.
    Pointer(usize),
    Type(TypeId),
    /// Value of a registered enum type.
    Enum(u32),
    /// Bits of a registered flags type.
    Flags(u32),
    Boxed(BoxRef),
    /// Address owned through an opaque type's copy and free hooks.
    Opaque(usize),
    /// Packed fields of a registered bit struct.
    BitStruct(u64),
}

/// Discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Bool,
    Char,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Pointer,
    Type,
    Enum,
    Flags,
    Boxed,
    Opaque,
    BitStruct,
}

impl ValueKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "bool",
            ValueKind::Char => "char",
            ValueKind::U8 => "u8",
            ValueKind::I16 => "i16",
            ValueKind::U16 => "u16",
            ValueKind::I32 => "i32",
            ValueKind::U32 => "u32",
            ValueKind::I64 => "i64",
            ValueKind::U64 => "u64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::String => "string",
            ValueKind::Pointer => "pointer",
            ValueKind::Type => "type",
            ValueKind::Enum => "enum",
            ValueKind::Flags => "flags",
            ValueKind::Boxed => "box",
            ValueKind::Opaque => "opaque",
            ValueKind::BitStruct => "bit_struct",
        }
    }

    /// Builtin type that holds values of this kind, if there is one.
    #[must_use]
    pub const fn builtin_type(self) -> Option<TypeId> {
        Some(match self {
            ValueKind::Nil => builtin::NIL,
            ValueKind::Bool => builtin::BOOL,
            ValueKind::Char => builtin::CHAR,
            ValueKind::U8 => builtin::U8,
            ValueKind::I16 => builtin::I16,
            ValueKind::U16 => builtin::U16,
            ValueKind::I32 => builtin::I32,
            ValueKind::U32 => builtin::U32,
            ValueKind::I64 => builtin::I64,
            ValueKind::U64 => builtin::U64,
            ValueKind::F32 => builtin::F32,
            ValueKind::F64 => builtin::F64,
            ValueKind::String => builtin::STRING,
            ValueKind::Pointer => builtin::POINTER,
            ValueKind::Type => builtin::TYPE,
            ValueKind::Enum
            | ValueKind::Flags
            | ValueKind::Boxed
            | ValueKind::Opaque
            | ValueKind::BitStruct => return None,
        })
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Char(_) => ValueKind::Char,
            Value::U8(_) => ValueKind::U8,
            Value::I16(_) => ValueKind::I16,
            Value::U16(_) => ValueKind::U16,
            Value::I32(_) => ValueKind::I32,
            Value::U32(_) => ValueKind::U32,
            Value::I64(_) => ValueKind::I64,
            Value::U64(_) => ValueKind::U64,
            Value::F32(_) => ValueKind::F32,
            Value::F64(_) => ValueKind::F64,
            Value::String(_) => ValueKind::String,
            Value::Pointer(_) => ValueKind::Pointer,
            Value::Type(_) => ValueKind::Type,
            Value::Enum(_) => ValueKind::Enum,
            Value::Flags(_) => ValueKind::Flags,
            Value::Boxed(_) => ValueKind::Boxed,
            Value::Opaque(_) => ValueKind::Opaque,
            Value::BitStruct(_) => ValueKind::BitStruct,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer payload widened to `i128`. Enums, flags and bit
    /// structs count.
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        Some(match self {
            Value::U8(v) => i128::from(*v),
            Value::I16(v) => i128::from(*v),
            Value::U16(v) => i128::from(*v),
            Value::I32(v) => i128::from(*v),
            Value::U32(v) | Value::Enum(v) | Value::Flags(v) => i128::from(*v),
            Value::I64(v) => i128::from(*v),
            Value::U64(v) | Value::BitStruct(v) => i128::from(*v),
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_type(&self) -> Option<TypeId> {
        match self {
            Value::Type(ty) => Some(*ty),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_boxed(&self) -> Option<&BoxRef> {
        match self {
            Value::Boxed(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    char => Char,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    TypeId => Type,
    BoxRef => Boxed,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// Operations a type supports on its variants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpFlags(u32);

impl OpFlags {
    pub const NONE: OpFlags = OpFlags(0);
    /// Values can be moved by memcpy.
    pub const RELOCATABLE: OpFlags = OpFlags(1 << 0);
    pub const CONSTRUCT_DEFAULT: OpFlags = OpFlags(1 << 1);
    pub const CONSTRUCT_COPY: OpFlags = OpFlags(1 << 2);
    pub const CONSTRUCT_MOVE: OpFlags = OpFlags(1 << 3);
    pub const CONSTRUCT_VALUE_COPY: OpFlags = OpFlags(1 << 4);
    pub const CONSTRUCT_VALUE_MOVE: OpFlags = OpFlags(1 << 5);
    pub const SET_COPY: OpFlags = OpFlags(1 << 6);
    pub const SET_MOVE: OpFlags = OpFlags(1 << 7);
    pub const SET_VALUE_COPY: OpFlags = OpFlags(1 << 8);
    pub const SET_VALUE_MOVE: OpFlags = OpFlags(1 << 9);
    pub const GET_VALUE_COPY: OpFlags = OpFlags(1 << 10);
    pub const GET_VALUE_PEEK: OpFlags = OpFlags(1 << 11);
    pub const GET_VALUE_MOVE: OpFlags = OpFlags(1 << 12);
    /// The type has no payload.
    pub const VALUELESS_TYPE: OpFlags = OpFlags(1 << 13);
    pub const COMPARE: OpFlags = OpFlags(1 << 14);
    pub const SAVE: OpFlags = OpFlags(1 << 15);
    pub const LOAD: OpFlags = OpFlags(1 << 16);

    pub const CONSTRUCT_ALL: OpFlags = OpFlags(
        Self::CONSTRUCT_DEFAULT.0
            | Self::CONSTRUCT_COPY.0
            | Self::CONSTRUCT_MOVE.0
            | Self::CONSTRUCT_VALUE_COPY.0
            | Self::CONSTRUCT_VALUE_MOVE.0,
    );
    pub const SET_ALL: OpFlags =
        OpFlags(Self::SET_COPY.0 | Self::SET_MOVE.0 | Self::SET_VALUE_COPY.0 | Self::SET_VALUE_MOVE.0);
    pub const GET_ALL: OpFlags =
        OpFlags(Self::GET_VALUE_COPY.0 | Self::GET_VALUE_PEEK.0 | Self::GET_VALUE_MOVE.0);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn without(self, other: OpFlags) -> OpFlags {
        OpFlags(self.0 & !other.0)
    }
}

impl BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: OpFlags) -> OpFlags {
        OpFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpFlags {
    fn bitor_assign(&mut self, rhs: OpFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpFlags({:#x})", self.0)
    }
}

fn unimplemented<T>(node: &TypeNode, operation: &'static str) -> Result<T> {
    fail(Error::Unimplemented {
        type_name: node.name().to_string(),
        operation,
    })
}

/// Per-type variant operations.
///
/// Only the operations named in [`VariantOps::flags`] are ever called;
/// the defaults fail with [`Error::Unimplemented`].
pub trait VariantOps: Send + Sync {
    fn flags(&self) -> OpFlags;

    /// Value of a default-constructed variant.
    fn default_value(&self, node: &Arc<TypeNode>) -> Result<Value> {
        unimplemented(node, "construct_default")
    }

    /// Validates an incoming value for construction or assignment and
    /// returns the value to store.
    fn accept(&self, node: &TypeNode, value: Value) -> Result<Value> {
        let _ = value;
        unimplemented(node, "construct_value")
    }

    /// Validates a borrowed value for construction or assignment by copy.
    /// The default clones it into [`VariantOps::accept`].
    fn accept_copy(&self, node: &TypeNode, value: &Value) -> Result<Value> {
        self.accept(node, value.clone())
    }

    /// Copy of a stored value.
    fn duplicate(&self, node: &TypeNode, value: &Value) -> Result<Value> {
        let _ = node;
        Ok(value.clone())
    }

    /// Releases a stored value. The default just drops it.
    fn destruct(&self, node: &TypeNode, value: Value) -> Result<()> {
        let _ = (node, value);
        Ok(())
    }

    fn compare(&self, node: &TypeNode, a: &Value, b: &Value) -> Result<Ordering> {
        let _ = (a, b);
        unimplemented(node, "compare")
    }

    /// Appends a text form of `value` to `out`.
    fn save(&self, node: &TypeNode, value: &Value, out: &mut String) -> Result<()> {
        let _ = (value, out);
        unimplemented(node, "save")
    }

    /// Parses a value written by [`VariantOps::save`].
    fn load(&self, node: &TypeNode, input: &str) -> Result<Value> {
        let _ = input;
        unimplemented(node, "load")
    }
}

/// Converts `src` into `dst`, which already carries the target type.
pub type Converter = Arc<dyn Fn(&Runtime, &Variant, &mut Variant) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct Typed {
    node: Arc<TypeNode>,
    ops: Arc<dyn VariantOps>,
}

/// A value tagged with its type.
///
/// An invalid variant has no type and holds [`Value::Nil`]. Dropping a
/// variant destructs its value through the type's operations.
#[derive(Default)]
pub struct Variant {
    typed: Option<Typed>,
    value: Value,
}

impl Variant {
    /// A variant with no type.
    #[must_use]
    pub fn invalid() -> Self {
        Variant::default()
    }

    fn typed(rt: &Runtime, ty: TypeId) -> Result<Typed> {
        let node = rt.types().node(ty)?;
        match rt.variants().ops_for(&node) {
            Some(ops) => Ok(Typed { node, ops }),
            None => fail(Error::InvalidType {
                context: format!("{} has no variant operations", node.name()),
            }),
        }
    }

    fn require(typed: &Typed, flag: OpFlags, operation: &'static str) -> Result<()> {
        if typed.ops.flags().contains(flag) {
            Ok(())
        } else {
            unimplemented(&typed.node, operation)
        }
    }

    fn require_valid(&self) -> Result<&Typed> {
        match &self.typed {
            Some(typed) => Ok(typed),
            None => fail(Error::InvalidType {
                context: "variant has no type".to_string(),
            }),
        }
    }

    /// Constructs a variant of a builtin type inferred from `value`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for enum, flags, opaque and bit-struct values,
    /// which need an explicit type; see [`Variant::construct_value_move`].
    pub fn new(rt: &Runtime, value: impl Into<Value>) -> Result<Self> {
        let value = value.into();
        match value.kind().builtin_type() {
            Some(ty) => Self::construct_value_move(rt, ty, value),
            None => match &value {
                Value::Boxed(b) => {
                    let ty = b.type_id();
                    Self::construct_value_move(rt, ty, value)
                }
                _ => fail(Error::InvalidType {
                    context: format!("a {} value needs an explicit type", value.kind()),
                }),
            },
        }
    }

    /// Default-constructs a variant of `ty`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if `ty` is unknown or has no operations
    /// - [`Error::Unimplemented`] if the type has no default
    pub fn construct_default(rt: &Runtime, ty: TypeId) -> Result<Self> {
        let typed = Self::typed(rt, ty)?;
        Self::require(&typed, OpFlags::CONSTRUCT_DEFAULT, "construct_default")?;
        let value = typed.ops.default_value(&typed.node)?;
        Ok(Variant {
            typed: Some(typed),
            value,
        })
    }

    /// Constructs a copy of `src`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for an invalid source, [`Error::Unimplemented`]
    /// if the type cannot be copied.
    pub fn construct_copy(src: &Variant) -> Result<Self> {
        let typed = src.require_valid()?.clone();
        Self::require(&typed, OpFlags::CONSTRUCT_COPY, "construct_copy")?;
        let value = typed.ops.duplicate(&typed.node, &src.value)?;
        Ok(Variant {
            typed: Some(typed),
            value,
        })
    }

    /// Takes the value out of `src`, which is left holding its type's
    /// default (or invalid, if the type has none).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for an invalid source, [`Error::Unimplemented`]
    /// if the type cannot be moved.
    pub fn construct_move(src: &mut Variant) -> Result<Self> {
        let typed = src.require_valid()?.clone();
        Self::require(&typed, OpFlags::CONSTRUCT_MOVE, "construct_move")?;
        let value = src.take_value();
        Ok(Variant {
            typed: Some(typed),
            value,
        })
    }

    /// Constructs a variant of `ty` from a copy of `value`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if `ty` is unknown or rejects the kind of value
    /// - [`Error::Unimplemented`] if the type cannot be built from a value
    /// - [`Error::OutOfRange`] if the type range-checks and the value is outside
    pub fn construct_value_copy(rt: &Runtime, ty: TypeId, value: &Value) -> Result<Self> {
        let typed = Self::typed(rt, ty)?;
        Self::require(&typed, OpFlags::CONSTRUCT_VALUE_COPY, "construct_value_copy")?;
        let value = typed.ops.accept_copy(&typed.node, value)?;
        Ok(Variant {
            typed: Some(typed),
            value,
        })
    }

    /// Constructs a variant of `ty` that takes ownership of `value`.
    ///
    /// # Errors
    ///
    /// Same as [`Variant::construct_value_copy`].
    pub fn construct_value_move(rt: &Runtime, ty: TypeId, value: Value) -> Result<Self> {
        let typed = Self::typed(rt, ty)?;
        Self::require(&typed, OpFlags::CONSTRUCT_VALUE_MOVE, "construct_value_move")?;
        let value = typed.ops.accept(&typed.node, value)?;
        Ok(Variant {
            typed: Some(typed),
            value,
        })
    }

    /// A variant of `ty` holding a placeholder, for converters to fill in.
    pub(crate) fn placeholder(rt: &Runtime, ty: TypeId) -> Result<Self> {
        let typed = Self::typed(rt, ty)?;
        let value = if typed.ops.flags().contains(OpFlags::CONSTRUCT_DEFAULT) {
            typed.ops.default_value(&typed.node)?
        } else {
            Value::Nil
        };
        Ok(Variant {
            typed: Some(typed),
            value,
        })
    }

    /// Destructs the value and leaves the variant invalid.
    pub fn destruct(&mut self) {
        let value = std::mem::take(&mut self.value);
        if let Some(typed) = self.typed.take()
            && let Err(err) = typed.ops.destruct(&typed.node, value)
        {
            oxmeta_log::warn!("destructing {} variant: {}", typed.node.name(), err);
        }
    }

    /// Takes the value, leaving the type's default or an invalid variant.
    fn take_value(&mut self) -> Value {
        let reset = self.typed.as_ref().and_then(|typed| {
            if typed.ops.flags().contains(OpFlags::CONSTRUCT_DEFAULT) {
                typed.ops.default_value(&typed.node).ok()
            } else {
                None
            }
        });
        match reset {
            Some(default) => std::mem::replace(&mut self.value, default),
            None => {
                self.typed = None;
                std::mem::take(&mut self.value)
            }
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.typed.is_some()
    }

    /// Type of the variant, [`TypeId::INVALID`] if it has none.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.typed.as_ref().map_or(TypeId::INVALID, |typed| typed.node.id())
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.typed.as_ref().map_or("invalid", |typed| typed.node.name())
    }

    #[must_use]
    pub fn flags(&self) -> OpFlags {
        self.typed.as_ref().map_or(OpFlags::NONE, |typed| typed.ops.flags())
    }

    /// Replaces `self` with a copy of `src`, type included.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for an invalid source, [`Error::Unimplemented`]
    /// if the source type does not support it.
    pub fn set_copy(&mut self, src: &Variant) -> Result<()> {
        let typed = src.require_valid()?.clone();
        Self::require(&typed, OpFlags::SET_COPY, "set_copy")?;
        let value = typed.ops.duplicate(&typed.node, &src.value)?;
        self.replace(typed, value);
        Ok(())
    }

    /// Replaces `self` with the value of `src`, resetting `src` to default.
    ///
    /// # Errors
    ///
    /// Same as [`Variant::set_copy`].
    pub fn set_move(&mut self, src: &mut Variant) -> Result<()> {
        let typed = src.require_valid()?.clone();
        Self::require(&typed, OpFlags::SET_MOVE, "set_move")?;
        let value = src.take_value();
        self.replace(typed, value);
        Ok(())
    }

    /// Stores a copy of `value`, keeping the variant's type.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for an invalid variant or a value the type
    /// rejects, plus whatever the type's validation reports.
    pub fn set_value_copy(&mut self, value: &Value) -> Result<()> {
        let typed = self.require_valid()?.clone();
        Self::require(&typed, OpFlags::SET_VALUE_COPY, "set_value_copy")?;
        let value = typed.ops.accept_copy(&typed.node, value)?;
        self.replace(typed, value);
        Ok(())
    }

    /// Stores `value`, keeping the variant's type.
    ///
    /// # Errors
    ///
    /// Same as [`Variant::set_value_copy`].
    pub fn set_value_move(&mut self, value: Value) -> Result<()> {
        let typed = self.require_valid()?.clone();
        Self::require(&typed, OpFlags::SET_VALUE_MOVE, "set_value_move")?;
        let value = typed.ops.accept(&typed.node, value)?;
        self.replace(typed, value);
        Ok(())
    }

    fn replace(&mut self, typed: Typed, value: Value) {
        self.destruct();
        self.typed = Some(typed);
        self.value = value;
    }

    /// A copy of the stored value.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for an invalid variant, [`Error::Unimplemented`]
    /// if the type does not support it.
    pub fn get_value_copy(&self) -> Result<Value> {
        let typed = self.require_valid()?;
        Self::require(typed, OpFlags::GET_VALUE_COPY, "get_value_copy")?;
        typed.ops.duplicate(&typed.node, &self.value)
    }

    /// Moves the stored value out, leaving the type's default behind.
    ///
    /// # Errors
    ///
    /// Same as [`Variant::get_value_copy`].
    pub fn get_value_move(&mut self) -> Result<Value> {
        let typed = self.require_valid()?;
        Self::require(typed, OpFlags::GET_VALUE_MOVE, "get_value_move")?;
        Ok(self.take_value())
    }

    /// Borrows the stored value without copying it.
    ///
    /// # Errors
    ///
    /// Same as [`Variant::get_value_copy`].
    pub fn peek(&self) -> Result<&Value> {
        let typed = self.require_valid()?;
        Self::require(typed, OpFlags::GET_VALUE_PEEK, "peek")?;
        Ok(&self.value)
    }

    /// Orders two variants of the same type.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if either variant is invalid
    /// - [`Error::InvalidOperation`] if the types differ
    /// - [`Error::Unimplemented`] if the type has no ordering
    pub fn compare(&self, other: &Variant) -> Result<Ordering> {
        let a = self.require_valid()?;
        let b = other.require_valid()?;
        if a.node.id() != b.node.id() {
            return fail(Error::InvalidOperation {
                reason: format!("cannot compare {} with {}", self.type_name(), other.type_name()),
            });
        }
        Self::require(a, OpFlags::COMPARE, "compare")?;
        a.ops.compare(&a.node, &self.value, &other.value)
    }

    /// True if [`Variant::compare`] succeeds with `Equal`.
    #[must_use]
    pub fn equals(&self, other: &Variant) -> bool {
        matches!(self.compare(other), Ok(Ordering::Equal))
    }

    /// Converts `self` into `dst`, whose type is the target.
    ///
    /// Same-type conversion copies. Otherwise the converter registered for
    /// exactly `(self type, dst type)` runs.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if either variant is invalid
    /// - [`Error::InvalidConversion`] if no converter is registered
    /// - Whatever the converter reports
    pub fn convert(&self, rt: &Runtime, dst: &mut Variant) -> Result<()> {
        let from = self.require_valid()?.node.id();
        let to = dst.require_valid()?.node.id();
        if from == to {
            return dst.set_copy(self);
        }
        match rt.variants().converter(from, to) {
            Some(converter) => converter(rt, self, dst),
            None => fail(Error::InvalidConversion {
                from: self.type_name().to_string(),
                to: dst.type_name().to_string(),
            }),
        }
    }

    /// Converts `self` into a new variant of type `ty`.
    ///
    /// # Errors
    ///
    /// Same as [`Variant::convert`].
    pub fn convert_to(&self, rt: &Runtime, ty: TypeId) -> Result<Variant> {
        let mut dst = Variant::placeholder(rt, ty)?;
        self.convert(rt, &mut dst)?;
        Ok(dst)
    }

    /// Appends the type's text form of the value to `out`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for an invalid variant, [`Error::Unimplemented`]
    /// if the type cannot save.
    pub fn save(&self, out: &mut String) -> Result<()> {
        let typed = self.require_valid()?;
        Self::require(typed, OpFlags::SAVE, "save")?;
        typed.ops.save(&typed.node, &self.value, out)
    }

    /// Replaces the value with one parsed from `input`, keeping the type.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] for an invalid variant, [`Error::Unimplemented`]
    /// if the type cannot load, or the type's parse error.
    pub fn load(&mut self, input: &str) -> Result<()> {
        let typed = self.require_valid()?.clone();
        Self::require(&typed, OpFlags::LOAD, "load")?;
        let value = typed.ops.load(&typed.node, input)?;
        self.replace(typed, value);
        Ok(())
    }

    /// Looks `key` up in a boxed table value, or reads the bit-struct field
    /// named by `key`. Anything else, or a box without the table
    /// interface, yields an invalid variant.
    ///
    /// # Errors
    ///
    /// Whatever the table implementation reports.
    pub fn index(&self, rt: &Runtime, key: &Variant) -> Result<Variant> {
        match (&self.value, &self.typed) {
            (Value::Boxed(boxed), _) => table::index(rt, boxed, key),
            (Value::BitStruct(bits), Some(typed)) => bit_struct::index(rt, &typed.node, *bits, key),
            _ => Ok(Variant::invalid()),
        }
    }

    /// Stores `value` under `key` in a boxed table value.
    ///
    /// # Errors
    ///
    /// [`Error::Unimplemented`] if the value is not a box implementing
    /// `set_index`, or whatever the implementation reports.
    pub fn set_index(&self, rt: &Runtime, key: &Variant, value: Variant) -> Result<()> {
        match &self.value {
            Value::Boxed(boxed) => table::set_index(rt, boxed, key, value),
            _ => unimplemented_for(self, "set_index"),
        }
    }

    /// Advances a table iteration. Start with an invalid `key`; the
    /// iteration is over when `key` comes back invalid.
    ///
    /// # Errors
    ///
    /// Whatever the table implementation reports.
    pub fn next(&self, rt: &Runtime, key: &mut Variant, value: &mut Variant) -> Result<()> {
        match (&self.value, &self.typed) {
            (Value::Boxed(boxed), _) => table::next(rt, boxed, key, value),
            (Value::BitStruct(bits), Some(typed)) => {
                bit_struct::next(rt, &typed.node, *bits, key, value)
            }
            _ => {
                key.destruct();
                value.destruct();
                Ok(())
            }
        }
    }

    /// Number of entries in a boxed table value or fields in a bit struct,
    /// `0` for anything else.
    #[must_use]
    pub fn count(&self) -> usize {
        match (&self.value, &self.typed) {
            (Value::Boxed(boxed), _) => table::count(boxed),
            (Value::BitStruct(_), Some(typed)) => bit_struct::count(&typed.node),
            _ => 0,
        }
    }
}

fn unimplemented_for<T>(variant: &Variant, operation: &'static str) -> Result<T> {
    fail(Error::Unimplemented {
        type_name: variant.type_name().to_string(),
        operation,
    })
}

impl Drop for Variant {
    fn drop(&mut self) {
        if self.typed.is_some() {
            self.destruct();
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("type", &self.type_name())
            .field("value", &self.value)
            .finish()
    }
}

/// Operation tables and converters of one runtime.
pub struct VariantRegistry {
    ops: RwLock<FxHashMap<TypeId, Arc<dyn VariantOps>>>,
    converters: RwLock<FxHashMap<(TypeId, TypeId), Converter>>,
}

impl VariantRegistry {
    #[must_use]
    pub fn with_capacity(types: usize, converters: usize) -> Self {
        let mut ops = FxHashMap::default();
        ops.reserve(types);
        let mut table = FxHashMap::default();
        table.reserve(converters);
        VariantRegistry {
            ops: RwLock::new(ops),
            converters: RwLock::new(table),
        }
    }

    /// Registers the operation table of `ty`. Subtypes without their own
    /// table use the nearest ancestor's.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOperation`] if `ty` already has a table.
    pub fn register_ops(&self, ty: TypeId, ops: Arc<dyn VariantOps>) -> Result<()> {
        let mut table = self.ops.write();
        if table.contains_key(&ty) {
            return fail(Error::InvalidOperation {
                reason: format!("{ty} already has variant operations"),
            });
        }
        table.insert(ty, ops);
        Ok(())
    }

    /// Removes the operation table of `ty`. Returns false if it had none.
    pub fn unregister_ops(&self, ty: TypeId) -> bool {
        self.ops.write().remove(&ty).is_some()
    }

    /// The table used for variants of `node`: its own, or the nearest
    /// ancestor's.
    #[must_use]
    pub fn ops_for(&self, node: &TypeNode) -> Option<Arc<dyn VariantOps>> {
        let table = self.ops.read();
        let mut current = Some(node);
        while let Some(level) = current {
            if let Some(ops) = table.get(&level.id()) {
                return Some(Arc::clone(ops));
            }
            current = level.parent().map(|p| &**p);
        }
        None
    }

    /// Registers the converter for exactly `from -> to`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOperation`] if the pair already has one.
    pub fn register_converter(
        &self,
        from: TypeId,
        to: TypeId,
        converter: impl Fn(&Runtime, &Variant, &mut Variant) -> Result<()> + Send + Sync + 'static,
    ) -> Result<()> {
        let mut table = self.converters.write();
        if table.contains_key(&(from, to)) {
            return fail(Error::InvalidOperation {
                reason: format!("converter {from} -> {to} already registered"),
            });
        }
        table.insert((from, to), Arc::new(converter));
        oxmeta_log::trace!("registered converter {} -> {}", from, to);
        Ok(())
    }

    /// Removes the converter for `from -> to`. Returns false if there was none.
    pub fn unregister_converter(&self, from: TypeId, to: TypeId) -> bool {
        self.converters.write().remove(&(from, to)).is_some()
    }

    #[must_use]
    pub fn converter(&self, from: TypeId, to: TypeId) -> Option<Converter> {
        self.converters.read().get(&(from, to)).cloned()
    }

    /// True if a variant of `from` can be converted to `to`.
    #[must_use]
    pub fn can_convert(&self, from: TypeId, to: TypeId) -> bool {
        from == to || self.converters.read().contains_key(&(from, to))
    }

    #[must_use]
    pub fn converter_count(&self) -> usize {
        self.converters.read().len()
    }

    /// Drops the operation table of `ty` and every converter naming it.
    pub(crate) fn remove_type(&self, ty: TypeId) {
        self.ops.write().remove(&ty);
        self.converters
            .write()
            .retain(|(from, to), _| *from != ty && *to != ty);
    }
}
