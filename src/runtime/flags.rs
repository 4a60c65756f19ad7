//! Registered flag sets.
//!
//! Like [`enums`](crate::runtime::enums), but values are bit masks: any
//! combination of entry bits is valid, and the text form joins entry names
//! with `|`.

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassRef, ClassSlice, ClassStruct};
use crate::runtime::enums::validate;
use crate::runtime::primitives;
use crate::runtime::types::{ClassData, TypeFlags, TypeId, TypeInfo, TypeNode, builtin};
use crate::runtime::variant::{OpFlags, Value, VariantOps};
use oxmeta_mem::Quark;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// One named bit pattern of a flag set.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FlagsEntry {
    value: u32,
    name: Quark,
    nick: Quark,
}

impl FlagsEntry {
    #[must_use]
    pub fn new(value: u32, name: &str, nick: &str) -> Self {
        FlagsEntry {
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

impl fmt::Debug for FlagsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) = {:#x}", self.name(), self.nick(), self.value)
    }
}

#[derive(Debug)]
pub(crate) struct FlagsTable {
    entries: Vec<FlagsEntry>,
    mask: u32,
}

impl FlagsTable {
    fn new(entries: &[FlagsEntry]) -> Self {
        FlagsTable {
            entries: entries.to_vec(),
            mask: entries.iter().fold(0, |mask, e| mask | e.value),
        }
    }

    fn check(&self, value: u32) -> bool {
        value & !self.mask == 0
    }

    fn exact(&self, value: u32) -> Option<&FlagsEntry> {
        self.entries.iter().find(|e| e.value == value)
    }

    fn lookup(&self, word: &str) -> Option<u32> {
        let quark = Quark::try_get(word)?;
        self.entries
            .iter()
            .find(|e| e.name == quark || e.nick == quark)
            .map(|e| e.value)
    }

    fn parse(&self, text: &str) -> Option<u32> {
        let text = text.trim();
        if text.is_empty() {
            return Some(0);
        }
        text.split('|')
            .try_fold(0, |acc, word| self.lookup(word.trim()).map(|bits| acc | bits))
    }

    fn format(&self, value: u32) -> String {
        if value == 0 {
            return self.exact(0).map_or_else(String::new, |e| e.name().to_string());
        }
        let mut out = String::new();
        for entry in self.entries.iter().filter(|e| e.value != 0 && value & e.value == e.value) {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(entry.name());
        }
        out
    }
}

/// Class of every flags type.
///
/// The abstract [`builtin::FLAGS`] class has no entries and accepts every
/// value.
#[repr(C)]
pub struct FlagsClass {
    base: Class,
    value_mask: u32,
    table: *const FlagsTable,
}

// SAFETY: starts with `Class`; a zero mask and a null table are valid.
unsafe impl ClassStruct for FlagsClass {}

impl FlagsClass {
    fn table(&self) -> Option<&FlagsTable> {
        // SAFETY: points into the type's class data, kept alive by the node
        // the class header holds.
        unsafe { self.table.as_ref() }
    }

    #[must_use]
    pub fn entries(&self) -> &[FlagsEntry] {
        self.table().map_or(&[], |t| &t.entries)
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    /// Union of every entry's bits.
    #[must_use]
    pub fn mask(&self) -> u32 {
        self.value_mask
    }

    #[must_use]
    pub fn value_from_name(&self, name: &str) -> Option<u32> {
        let quark = Quark::try_get(name)?;
        self.entries().iter().find(|e| e.name == quark).map(FlagsEntry::value)
    }

    #[must_use]
    pub fn value_from_nick(&self, nick: &str) -> Option<u32> {
        let quark = Quark::try_get(nick)?;
        self.entries().iter().find(|e| e.nick == quark).map(FlagsEntry::value)
    }

    #[must_use]
    pub fn value_from_index(&self, index: usize) -> Option<u32> {
        self.entries().get(index).map(FlagsEntry::value)
    }

    /// Name of the entry whose bits are exactly `value`.
    #[must_use]
    pub fn name_from_value(&self, value: u32) -> Option<&'static str> {
        self.table()?.exact(value).map(FlagsEntry::name)
    }

    #[must_use]
    pub fn nick_from_value(&self, value: u32) -> Option<&'static str> {
        self.table()?.exact(value).map(FlagsEntry::nick)
    }

    /// Parses `"A|B"` style text. Words may be names or nicks; an empty
    /// string is `0`. Returns `None` on an unknown word.
    #[must_use]
    pub fn value_from_string(&self, text: &str) -> Option<u32> {
        self.table()?.parse(text)
    }

    /// Joins the names of the entries set in `value` with `|`.
    #[must_use]
    pub fn value_to_string(&self, value: u32) -> String {
        self.table().map_or_else(String::new, |t| t.format(value))
    }

    /// True if `value` sets no bits outside the mask.
    #[must_use]
    pub fn value_check(&self, value: u32) -> bool {
        self.table().is_none_or(|t| t.check(value))
    }
}

impl fmt::Debug for FlagsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagsClass")
            .field("type", &self.base.type_name())
            .field("mask", &format_args!("{:#x}", self.value_mask))
            .field("entries", &self.entries())
            .finish()
    }
}

fn class_init(slice: &mut ClassSlice<'_>, data: Option<&ClassData>) -> Result<()> {
    let Some(table) = data.and_then(|d| d.downcast_ref::<FlagsTable>()) else {
        return fail(Error::InvalidType {
            context: format!("{} has no flag entries", slice.class_type()),
        });
    };
    let class = slice.get_mut::<FlagsClass>()?;
    class.value_mask = table.mask;
    class.table = std::ptr::from_ref(table);
    Ok(())
}

/// Acquires the class of flags type `ty`.
///
/// # Errors
///
/// [`Error::InvalidType`] if `ty` is not a flags type.
pub fn flags_class(rt: &Runtime, ty: TypeId) -> Result<ClassRef> {
    if !rt.types().is_a(ty, builtin::FLAGS) {
        return fail(Error::InvalidType {
            context: format!("{} is not a flags type", rt.types().describe(ty)),
        });
    }
    ClassRef::acquire(rt, ty)
}

struct FlagsOps {
    table: Arc<FlagsTable>,
}

fn flags_value(value: &Value) -> Option<u32> {
    match value {
        Value::Flags(v) => Some(*v),
        _ => None,
    }
}

impl VariantOps for FlagsOps {
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
        Ok(Value::Flags(0))
    }

    fn accept(&self, node: &TypeNode, value: Value) -> Result<Value> {
        match value {
            Value::U32(v) | Value::Flags(v) if self.table.check(v) => Ok(Value::Flags(v)),
            Value::U32(v) | Value::Flags(v) => fail(Error::OutOfRange {
                value: i128::from(v),
                min: 0,
                max: i128::from(self.table.mask),
            }),
            other => fail(Error::InvalidType {
                context: format!("{} takes u32 values, not {}", node.name(), other.kind()),
            }),
        }
    }

    fn compare(&self, node: &TypeNode, a: &Value, b: &Value) -> Result<Ordering> {
        match (flags_value(a), flags_value(b)) {
            (Some(x), Some(y)) => Ok(x.cmp(&y)),
            _ => fail(Error::InvalidOperation {
                reason: format!("{} compares flag values only", node.name()),
            }),
        }
    }

    fn save(&self, node: &TypeNode, value: &Value, out: &mut String) -> Result<()> {
        match flags_value(value) {
            Some(v) => {
                out.push_str(&self.table.format(v));
                Ok(())
            }
            None => fail(Error::InvalidProperty {
                name: format!("{} value {value:?}", node.name()),
            }),
        }
    }

    fn load(&self, node: &TypeNode, input: &str) -> Result<Value> {
        match self.table.parse(input) {
            Some(v) => Ok(Value::Flags(v)),
            None => fail(Error::InvalidProperty {
                name: format!("{} text {input:?}", node.name()),
            }),
        }
    }
}

fn register_converters(rt: &Runtime, ty: TypeId, table: &Arc<FlagsTable>) -> Result<()> {
    let variants = rt.variants();

    variants.register_converter(ty, builtin::U32, |_, src, dst| match flags_value(src.peek()?) {
        Some(v) => dst.set_value_move(Value::U32(v)),
        None => primitives::conversion_failed(src, dst),
    })?;
    variants.register_converter(ty, builtin::U64, |_, src, dst| match flags_value(src.peek()?) {
        Some(v) => dst.set_value_move(Value::U64(u64::from(v))),
        None => primitives::conversion_failed(src, dst),
    })?;

    let names = Arc::clone(table);
    variants.register_converter(ty, builtin::STRING, move |_, src, dst| {
        match flags_value(src.peek()?) {
            Some(v) => dst.set_value_move(Value::String(names.format(v))),
            None => primitives::conversion_failed(src, dst),
        }
    })?;

    let parse = Arc::clone(table);
    variants.register_converter(builtin::STRING, ty, move |_, src, dst| {
        match src.peek()?.as_str().and_then(|text| parse.parse(text)) {
            Some(v) => dst.set_value_move(Value::Flags(v)),
            None => primitives::conversion_failed(src, dst),
        }
    })
}

/// Registers a flags type named `name` with the given entries.
///
/// # Errors
///
/// - [`Error::InvalidTypeInfo`] for an empty entry list or repeated names
/// - Any error of [`TypeRegistry::register`](crate::runtime::types::TypeRegistry::register)
pub fn register_flags(rt: &Runtime, name: &str, entries: &[FlagsEntry]) -> Result<TypeId> {
    validate(name, entries.iter().map(|e| e.name))?;
    let table = Arc::new(FlagsTable::new(entries));
    let info = TypeInfo::new()
        .with_class_init(class_init)
        .with_class_data(Arc::clone(&table) as Arc<ClassData>);
    let ty = rt.types().register(name, builtin::FLAGS, info, TypeFlags::NONE)?;

    let support = rt
        .variants()
        .register_ops(ty, Arc::new(FlagsOps { table: Arc::clone(&table) }))
        .and_then(|()| register_converters(rt, ty, &table));
    if let Err(err) = support {
        if let Err(cleanup) = rt.unregister(ty) {
            oxmeta_log::warn!("rolling back flags {}: {}", name, cleanup);
        }
        return Err(err);
    }
    oxmeta_log::debug!("registered flags {} with mask {:#x}", name, table.mask);
    Ok(ty)
}
