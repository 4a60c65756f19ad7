//! Registered enumerations.
//!
//! [`register_enum`] derives a type from [`builtin::ENUM`] whose class holds
//! the entry table, and wires up variant support: values are `u32`s checked
//! against the table, saved by entry name, and convertible to and from the
//! integer types and strings.
//!
//! # Example
//!
//! ```rust
//! use oxmeta::{EnumEntry, Runtime, Value, Variant, builtin};
//! use oxmeta::runtime::enums::{self, EnumClass};
//!
//! let rt = Runtime::new().unwrap();
//! let color = enums::register_enum(
//!     &rt,
//!     "Color",
//!     &[
//!         EnumEntry::new(1, "RED", "red"),
//!         EnumEntry::new(5, "GREEN", "green"),
//!         EnumEntry::new(10, "BLUE", "blue"),
//!     ],
//! )
//! .unwrap();
//!
//! let class = enums::enum_class(&rt, color).unwrap();
//! assert_eq!(class.get::<EnumClass>().unwrap().value_from_name("BLUE"), Some(10));
//!
//! let blue = Variant::construct_value_move(&rt, color, Value::U32(10)).unwrap();
//! let name = blue.convert_to(&rt, builtin::STRING).unwrap();
//! assert_eq!(name.peek().unwrap(), &Value::from("BLUE"));
//! ```

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassRef, ClassSlice, ClassStruct};
use crate::runtime::primitives::{self, Num};
use crate::runtime::types::{ClassData, TypeFlags, TypeId, TypeInfo, TypeNode, builtin};
use crate::runtime::variant::{OpFlags, Value, ValueKind, VariantOps};
use oxmeta_mem::Quark;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// One named value of an enum.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EnumEntry {
    value: u32,
    name: Quark,
    nick: Quark,
}

impl EnumEntry {
    #[must_use]
    pub fn new(value: u32, name: &str, nick: &str) -> Self {
        EnumEntry {
            value,
            name: Quark::intern(name),
            nick: Quark::intern(nick),
        }
    }

    #[must_use]
    pub fn value(&self) -> u32 {
        self.value
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name.as_str()
    }

    #[must_use]
    pub fn nick(&self) -> &'static str {
        self.nick.as_str()
    }
}

impl fmt::Debug for EnumEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) = {}", self.name(), self.nick(), self.value)
    }
}

/// Entries of one enum type, kept as its class data.
#[derive(Debug)]
pub(crate) struct EnumTable {
    entries: Vec<EnumEntry>,
    min: u32,
    max: u32,
}

impl EnumTable {
    fn new(entries: &[EnumEntry]) -> Self {
        EnumTable {
            entries: entries.to_vec(),
            min: entries.iter().map(|e| e.value).min().unwrap_or(0),
            max: entries.iter().map(|e| e.value).max().unwrap_or(0),
        }
    }

    fn find(&self, value: u32) -> Option<&EnumEntry> {
        if value < self.min || value > self.max {
            return None;
        }
        self.entries.iter().find(|e| e.value == value)
    }

    fn by_name(&self, name: &str) -> Option<u32> {
        let quark = Quark::try_get(name)?;
        self.entries.iter().find(|e| e.name == quark).map(|e| e.value)
    }

    fn by_nick(&self, nick: &str) -> Option<u32> {
        let quark = Quark::try_get(nick)?;
        self.entries.iter().find(|e| e.nick == quark).map(|e| e.value)
    }

    fn out_of_range(&self, value: u32) -> Error {
        Error::OutOfRange {
            value: i128::from(value),
            min: i128::from(self.min),
            max: i128::from(self.max),
        }
    }
}

/// Class of every enum type.
///
/// The abstract [`builtin::ENUM`] class has no entries and accepts every
/// value.
#[repr(C)]
pub struct EnumClass {
    base: Class,
    value_min: u32,
    value_max: u32,
    table: *const EnumTable,
}

// SAFETY: starts with `Class`; zeroed counters and a null table are valid.
unsafe impl ClassStruct for EnumClass {}

impl EnumClass {
    fn table(&self) -> Option<&EnumTable> {
        // SAFETY: set by `class_init` from the type's class data, which the
        // class header keeps alive through its node.
        unsafe { self.table.as_ref() }
    }

    /// Entries in registration order.
    #[must_use]
    pub fn entries(&self) -> &[EnumEntry] {
        self.table().map_or(&[], |t| &t.entries)
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn value_min(&self) -> u32 {
        self.value_min
    }

    #[must_use]
    pub fn value_max(&self) -> u32 {
        self.value_max
    }

    #[must_use]
    pub fn value_from_name(&self, name: &str) -> Option<u32> {
        self.table()?.by_name(name)
    }

    #[must_use]
    pub fn value_from_nick(&self, nick: &str) -> Option<u32> {
        self.table()?.by_nick(nick)
    }

    #[must_use]
    pub fn value_from_index(&self, index: usize) -> Option<u32> {
        self.entries().get(index).map(EnumEntry::value)
    }

    #[must_use]
    pub fn name_from_value(&self, value: u32) -> Option<&'static str> {
        self.table()?.find(value).map(EnumEntry::name)
    }

    #[must_use]
    pub fn nick_from_value(&self, value: u32) -> Option<&'static str> {
        self.table()?.find(value).map(EnumEntry::nick)
    }

    /// True if `value` names an entry. Values outside `[min, max]` are
    /// rejected before the table is scanned.
    #[must_use]
    pub fn value_check(&self, value: u32) -> bool {
        match self.table() {
            Some(table) => table.find(value).is_some(),
            None => true,
        }
    }
}

impl fmt::Debug for EnumClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnumClass")
            .field("type", &self.base.type_name())
            .field("entries", &self.entries())
            .finish()
    }
}

fn class_init(slice: &mut ClassSlice<'_>, data: Option<&ClassData>) -> Result<()> {
    let Some(table) = data.and_then(|d| d.downcast_ref::<EnumTable>()) else {
        return fail(Error::InvalidType {
            context: format!("{} has no enum entries", slice.class_type()),
        });
    };
    let class = slice.get_mut::<EnumClass>()?;
    class.value_min = table.min;
    class.value_max = table.max;
    class.table = std::ptr::from_ref(table);
    Ok(())
}

/// Acquires the class of enum type `ty`.
///
/// # Errors
///
/// [`Error::InvalidType`] if `ty` is not an enum type.
pub fn enum_class(rt: &Runtime, ty: TypeId) -> Result<ClassRef> {
    if !rt.types().is_a(ty, builtin::ENUM) {
        return fail(Error::InvalidType {
            context: format!("{} is not an enum", rt.types().describe(ty)),
        });
    }
    ClassRef::acquire(rt, ty)
}

struct EnumOps {
    table: Arc<EnumTable>,
}

impl VariantOps for EnumOps {
    fn flags(&self) -> OpFlags {
        OpFlags::CONSTRUCT_ALL
            | OpFlags::SET_ALL
            | OpFlags::GET_ALL
            | OpFlags::COMPARE
            | OpFlags::SAVE
            | OpFlags::LOAD
            | OpFlags::RELOCATABLE
    }

    fn default_value(&self, _: &Arc<TypeNode>) -> Result<Value> {
        Ok(Value::Enum(self.table.entries.first().map_or(0, |e| e.value)))
    }

    fn accept(&self, node: &TypeNode, value: Value) -> Result<Value> {
        match value {
            Value::U32(v) | Value::Enum(v) if self.table.find(v).is_some() => Ok(Value::Enum(v)),
            Value::U32(v) | Value::Enum(v) => Err(crate::error::record(self.table.out_of_range(v))),
            other => fail(Error::InvalidType {
                context: format!("{} takes u32 values, not {}", node.name(), other.kind()),
            }),
        }
    }

    fn compare(&self, node: &TypeNode, a: &Value, b: &Value) -> Result<Ordering> {
        match (a, b) {
            (Value::Enum(x), Value::Enum(y)) => Ok(x.cmp(y)),
            _ => fail(Error::InvalidOperation {
                reason: format!("{} compares enum values only", node.name()),
            }),
        }
    }

    fn save(&self, node: &TypeNode, value: &Value, out: &mut String) -> Result<()> {
        match enum_value(value).and_then(|v| self.table.find(v)) {
            Some(entry) => {
                out.push_str(entry.name());
                Ok(())
            }
            None => fail(Error::InvalidProperty {
                name: format!("{} value {value:?}", node.name()),
            }),
        }
    }

    fn load(&self, node: &TypeNode, input: &str) -> Result<Value> {
        match self.table.by_name(input.trim()) {
            Some(v) => Ok(Value::Enum(v)),
            None => fail(Error::InvalidProperty {
                name: format!("{} entry {input:?}", node.name()),
            }),
        }
    }
}

pub(crate) const NUMERIC_TARGETS: [ValueKind; 7] = [
    ValueKind::U8,
    ValueKind::I16,
    ValueKind::U16,
    ValueKind::I32,
    ValueKind::U32,
    ValueKind::I64,
    ValueKind::U64,
];

fn enum_value(value: &Value) -> Option<u32> {
    match value {
        Value::Enum(v) => Some(*v),
        _ => None,
    }
}

fn register_converters(rt: &Runtime, ty: TypeId, table: &Arc<EnumTable>) -> Result<()> {
    let variants = rt.variants();

    let check = Arc::clone(table);
    variants.register_converter(ty, builtin::BOOL, move |_, src, dst| {
        let valid = enum_value(src.peek()?).is_some_and(|v| check.find(v).is_some());
        dst.set_value_move(Value::Bool(valid))
    })?;

    for kind in NUMERIC_TARGETS {
        let Some(to) = kind.builtin_type() else { continue };
        variants.register_converter(ty, to, move |_, src, dst| match enum_value(src.peek()?) {
            Some(v) => dst.set_value_move(primitives::from_num(kind, Num::Int(i128::from(v)))?),
            None => primitives::conversion_failed(src, dst),
        })?;
    }

    let names = Arc::clone(table);
    variants.register_converter(ty, builtin::STRING, move |_, src, dst| {
        match enum_value(src.peek()?).and_then(|v| names.find(v)) {
            Some(entry) => dst.set_value_move(Value::from(entry.name())),
            None => primitives::conversion_failed(src, dst),
        }
    })?;

    let parse = Arc::clone(table);
    variants.register_converter(builtin::STRING, ty, move |_, src, dst| {
        let text = src.peek()?.as_str().map(str::trim);
        match text.and_then(|t| parse.by_name(t).or_else(|| parse.by_nick(t))) {
            Some(v) => dst.set_value_move(Value::Enum(v)),
            None => primitives::conversion_failed(src, dst),
        }
    })
}

/// Registers an enum type named `name` with the given entries.
///
/// The first entry is the default value.
///
/// # Errors
///
/// - [`Error::InvalidTypeInfo`] for an empty entry list or repeated names
/// - Any error of [`TypeRegistry::register`](crate::runtime::types::TypeRegistry::register)
pub fn register_enum(rt: &Runtime, name: &str, entries: &[EnumEntry]) -> Result<TypeId> {
    validate(name, entries.iter().map(|e| e.name))?;
    let table = Arc::new(EnumTable::new(entries));
    let info = TypeInfo::new()
        .with_class_init(class_init)
        .with_class_data(Arc::clone(&table) as Arc<ClassData>);
    let ty = rt.types().register(name, builtin::ENUM, info, TypeFlags::NONE)?;

    let support = rt
        .variants()
        .register_ops(ty, Arc::new(EnumOps { table: Arc::clone(&table) }))
        .and_then(|()| register_converters(rt, ty, &table));
    if let Err(err) = support {
        if let Err(cleanup) = rt.unregister(ty) {
            oxmeta_log::warn!("rolling back enum {}: {}", name, cleanup);
        }
        return Err(err);
    }
    oxmeta_log::debug!("registered enum {} with {} entries", name, entries.len());
    Ok(ty)
}

/// Rejects empty entry lists and repeated names.
pub(crate) fn validate(name: &str, names: impl Iterator<Item = Quark>) -> Result<()> {
    let mut seen: Vec<Quark> = Vec::new();
    for entry in names {
        if seen.contains(&entry) {
            return fail(Error::InvalidTypeInfo {
                name: name.to_string(),
                reason: format!("entry {} appears twice", entry.as_str()),
            });
        }
        seen.push(entry);
    }
    if seen.is_empty() {
        return fail(Error::InvalidTypeInfo {
            name: name.to_string(),
            reason: "no entries".to_string(),
        });
    }
    Ok(())
}
