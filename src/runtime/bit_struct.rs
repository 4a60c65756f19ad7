//! Registered bit structs.
//!
//! A bit struct packs named fields into one `u64`. Each field owns a
//! contiguous run of bits given by its mask and reads back as a variant of
//! its value type, so a bit-struct variant can be indexed by field name
//! like a small table.
//!
//! ```rust
//! use oxmeta::runtime::bit_struct::register_bit_struct;
//! use oxmeta::{BitStructField, Runtime, Value, Variant, builtin};
//!
//! let rt = Runtime::new().unwrap();
//! let header = register_bit_struct(
//!     &rt,
//!     "Header",
//!     &[
//!         BitStructField::new("VALID", 0x1, builtin::BOOL),
//!         BitStructField::new("LEN", 0xff0, builtin::U8),
//!     ],
//! )
//! .unwrap();
//!
//! let v = Variant::construct_value_move(&rt, header, Value::U64(0x2a1)).unwrap();
//! let len = v.index(&rt, &Variant::new(&rt, "LEN").unwrap()).unwrap();
//! assert_eq!(len.peek().unwrap(), &Value::U8(0x2a));
//! ```

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassRef, ClassSlice, ClassStruct};
use crate::runtime::enums::{NUMERIC_TARGETS, validate};
use crate::runtime::primitives::{self, Num};
use crate::runtime::types::{ClassData, TypeFlags, TypeId, TypeInfo, TypeNode, builtin};
use crate::runtime::variant::{OpFlags, Value, Variant, VariantOps};
use oxmeta_mem::Quark;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// One named field of a bit struct.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BitStructField {
    name: Quark,
    mask: u64,
    value_type: TypeId,
}

impl BitStructField {
    /// A field stored in the bits of `mask`, read back as `value_type`.
    #[must_use]
    pub fn new(name: &str, mask: u64, value_type: TypeId) -> Self {
        BitStructField {
            name: Quark::intern(name),
            mask,
            value_type,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name.as_str()
    }

    #[must_use]
    pub fn mask(&self) -> u64 {
        self.mask
    }

    #[must_use]
    pub fn value_type(&self) -> TypeId {
        self.value_type
    }

    /// Largest value the field can hold.
    #[must_use]
    pub fn max(&self) -> u64 {
        self.mask >> self.mask.trailing_zeros()
    }

    /// The field's bits of `value`, shifted down.
    #[must_use]
    pub fn extract(&self, value: u64) -> u64 {
        (value & self.mask) >> self.mask.trailing_zeros()
    }

    /// `value` with the field replaced by `bits`, or `None` if `bits` does
    /// not fit.
    #[must_use]
    pub fn insert(&self, value: u64, bits: u64) -> Option<u64> {
        (bits <= self.max()).then(|| (value & !self.mask) | (bits << self.mask.trailing_zeros()))
    }
}

impl fmt::Debug for BitStructField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} @ {:#x}", self.name(), self.value_type, self.mask)
    }
}

#[derive(Debug)]
pub(crate) struct BitStructTable {
    fields: Vec<BitStructField>,
    mask: u64,
}

impl BitStructTable {
    fn new(fields: &[BitStructField]) -> Self {
        BitStructTable {
            fields: fields.to_vec(),
            mask: fields.iter().fold(0, |mask, f| mask | f.mask),
        }
    }

    fn of(node: &TypeNode) -> Option<&BitStructTable> {
        node.info().class_data.as_deref()?.downcast_ref::<BitStructTable>()
    }

    fn check(&self, value: u64) -> bool {
        value & !self.mask == 0
    }

    fn position(&self, name: &str) -> Option<usize> {
        let quark = Quark::try_get(name)?;
        self.fields.iter().position(|f| f.name == quark)
    }

    fn by_name(&self, name: &str) -> Option<&BitStructField> {
        self.position(name).map(|i| &self.fields[i])
    }

    fn by_mask(&self, mask: u64) -> Option<&BitStructField> {
        self.fields.iter().find(|f| f.mask == mask)
    }

    fn parse(&self, text: &str) -> Option<u64> {
        let text = text.trim();
        if text.is_empty() {
            return Some(0);
        }
        text.split(',').try_fold(0, |acc, pair| {
            let (name, bits) = pair.split_once('=')?;
            let bits = bits.trim().parse::<u64>().ok()?;
            self.by_name(name.trim())?.insert(acc, bits)
        })
    }

    fn format(&self, value: u64) -> String {
        let mut out = String::new();
        for field in &self.fields {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(field.name());
            out.push('=');
            out.push_str(&field.extract(value).to_string());
        }
        out
    }
}

/// Class of every bit-struct type.
///
/// The abstract [`builtin::BIT_STRUCT`] class has no fields and accepts
/// every value.
#[repr(C)]
pub struct BitStructClass {
    base: Class,
    value_mask: u64,
    table: *const BitStructTable,
}

// SAFETY: starts with `Class`; a zero mask and a null table are valid.
unsafe impl ClassStruct for BitStructClass {}

impl BitStructClass {
    fn table(&self) -> Option<&BitStructTable> {
        // SAFETY: points into the type's class data, kept alive by the node
        // the class header holds.
        unsafe { self.table.as_ref() }
    }

    #[must_use]
    pub fn fields(&self) -> &[BitStructField] {
        self.table().map_or(&[], |t| &t.fields)
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields().len()
    }

    /// Union of every field's mask.
    #[must_use]
    pub fn value_mask(&self) -> u64 {
        self.value_mask
    }

    #[must_use]
    pub fn name_from_index(&self, index: usize) -> Option<&'static str> {
        self.fields().get(index).map(BitStructField::name)
    }

    /// Name of the field whose mask is exactly `mask`.
    #[must_use]
    pub fn name_from_mask(&self, mask: u64) -> Option<&'static str> {
        self.table()?.by_mask(mask).map(BitStructField::name)
    }

    #[must_use]
    pub fn mask_from_index(&self, index: usize) -> Option<u64> {
        self.fields().get(index).map(BitStructField::mask)
    }

    #[must_use]
    pub fn mask_from_name(&self, name: &str) -> Option<u64> {
        self.table()?.by_name(name).map(BitStructField::mask)
    }

    #[must_use]
    pub fn type_from_index(&self, index: usize) -> Option<TypeId> {
        self.fields().get(index).map(BitStructField::value_type)
    }

    #[must_use]
    pub fn type_from_name(&self, name: &str) -> Option<TypeId> {
        self.table()?.by_name(name).map(BitStructField::value_type)
    }

    #[must_use]
    pub fn type_from_mask(&self, mask: u64) -> Option<TypeId> {
        self.table()?.by_mask(mask).map(BitStructField::value_type)
    }

    /// Raw bits of field `name` in `value`.
    #[must_use]
    pub fn field(&self, value: u64, name: &str) -> Option<u64> {
        self.table()?.by_name(name).map(|f| f.extract(value))
    }

    /// `value` with field `name` set to `bits`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidProperty`] for an unknown field
    /// - [`Error::OutOfRange`] if `bits` does not fit the field
    pub fn set_field(&self, value: u64, name: &str, bits: u64) -> Result<u64> {
        let Some(field) = self.table().and_then(|t| t.by_name(name)) else {
            return fail(Error::InvalidProperty {
                name: format!("{}.{name}", self.base.type_name()),
            });
        };
        match field.insert(value, bits) {
            Some(packed) => Ok(packed),
            None => fail(Error::OutOfRange {
                value: i128::from(bits),
                min: 0,
                max: i128::from(field.max()),
            }),
        }
    }

    /// Parses `"A=1,B=2"` style text; fields left out are zero.
    #[must_use]
    pub fn value_from_string(&self, text: &str) -> Option<u64> {
        self.table()?.parse(text)
    }

    /// Every field as `NAME=bits`, in declaration order, joined with `,`.
    #[must_use]
    pub fn value_to_string(&self, value: u64) -> String {
        self.table().map_or_else(String::new, |t| t.format(value))
    }

    /// True if `value` sets no bits outside the fields.
    #[must_use]
    pub fn value_check(&self, value: u64) -> bool {
        self.table().is_none_or(|t| t.check(value))
    }
}

impl fmt::Debug for BitStructClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitStructClass")
            .field("type", &self.base.type_name())
            .field("mask", &format_args!("{:#x}", self.value_mask))
            .field("fields", &self.fields())
            .finish()
    }
}

fn class_init(slice: &mut ClassSlice<'_>, data: Option<&ClassData>) -> Result<()> {
    let Some(table) = data.and_then(|d| d.downcast_ref::<BitStructTable>()) else {
        return fail(Error::InvalidType {
            context: format!("{} has no bit fields", slice.class_type()),
        });
    };
    let class = slice.get_mut::<BitStructClass>()?;
    class.value_mask = table.mask;
    class.table = std::ptr::from_ref(table);
    Ok(())
}

/// Acquires the class of bit-struct type `ty`.
///
/// # Errors
///
/// [`Error::InvalidType`] if `ty` is not a bit-struct type.
pub fn bit_struct_class(rt: &Runtime, ty: TypeId) -> Result<ClassRef> {
    if !rt.types().is_a(ty, builtin::BIT_STRUCT) {
        return fail(Error::InvalidType {
            context: format!("{} is not a bit struct", rt.types().describe(ty)),
        });
    }
    ClassRef::acquire(rt, ty)
}

fn field_value(rt: &Runtime, field: &BitStructField, value: u64) -> Result<Variant> {
    Variant::new(rt, field.extract(value))?.convert_to(rt, field.value_type)
}

fn unknown_field<T>(node: &TypeNode, key: &Variant) -> Result<T> {
    fail(Error::InvalidProperty {
        name: format!("{}[{key:?}]", node.name()),
    })
}

/// Reads the field named by the string `key`.
pub(crate) fn index(rt: &Runtime, node: &TypeNode, value: u64, key: &Variant) -> Result<Variant> {
    let name = key.peek().ok().and_then(Value::as_str);
    match BitStructTable::of(node).zip(name).and_then(|(t, n)| t.by_name(n)) {
        Some(field) => field_value(rt, field, value),
        None => unknown_field(node, key),
    }
}

/// Steps through the fields in declaration order.
pub(crate) fn next(
    rt: &Runtime,
    node: &TypeNode,
    value: u64,
    key: &mut Variant,
    out: &mut Variant,
) -> Result<()> {
    let Some(table) = BitStructTable::of(node) else {
        key.destruct();
        out.destruct();
        return Ok(());
    };
    let start = if key.is_valid() {
        match key.peek().ok().and_then(Value::as_str).and_then(|n| table.position(n)) {
            Some(i) => i + 1,
            None => return unknown_field(node, key),
        }
    } else {
        0
    };
    match table.fields.get(start) {
        Some(field) => {
            *out = field_value(rt, field, value)?;
            *key = Variant::new(rt, field.name())?;
        }
        None => {
            key.destruct();
            out.destruct();
        }
    }
    Ok(())
}

pub(crate) fn count(node: &TypeNode) -> usize {
    BitStructTable::of(node).map_or(0, |t| t.fields.len())
}

struct BitStructOps {
    table: Arc<BitStructTable>,
}

fn bit_struct_value(value: &Value) -> Option<u64> {
    match value {
        Value::BitStruct(v) => Some(*v),
        _ => None,
    }
}

impl VariantOps for BitStructOps {
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
        Ok(Value::BitStruct(0))
    }

    fn accept(&self, node: &TypeNode, value: Value) -> Result<Value> {
        let bits = match value {
            Value::U64(v) | Value::BitStruct(v) => v,
            Value::U32(v) => u64::from(v),
            other => {
                return fail(Error::InvalidType {
                    context: format!("{} takes u64 values, not {}", node.name(), other.kind()),
                });
            }
        };
        if self.table.check(bits) {
            Ok(Value::BitStruct(bits))
        } else {
            fail(Error::OutOfRange {
                value: i128::from(bits),
                min: 0,
                max: i128::from(self.table.mask),
            })
        }
    }

    fn compare(&self, node: &TypeNode, a: &Value, b: &Value) -> Result<Ordering> {
        match (bit_struct_value(a), bit_struct_value(b)) {
            (Some(x), Some(y)) => Ok(x.cmp(&y)),
            _ => fail(Error::InvalidOperation {
                reason: format!("{} compares bit-struct values only", node.name()),
            }),
        }
    }

    fn save(&self, node: &TypeNode, value: &Value, out: &mut String) -> Result<()> {
        match bit_struct_value(value) {
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
            Some(v) => Ok(Value::BitStruct(v)),
            None => fail(Error::InvalidProperty {
                name: format!("{} text {input:?}", node.name()),
            }),
        }
    }
}

fn register_converters(rt: &Runtime, ty: TypeId, table: &Arc<BitStructTable>) -> Result<()> {
    let variants = rt.variants();

    variants.register_converter(ty, builtin::BOOL, |_, src, dst| match bit_struct_value(src.peek()?) {
        Some(v) => dst.set_value_move(Value::Bool(v != 0)),
        None => primitives::conversion_failed(src, dst),
    })?;

    for kind in NUMERIC_TARGETS {
        let Some(to) = kind.builtin_type() else { continue };
        variants.register_converter(ty, to, move |_, src, dst| match bit_struct_value(src.peek()?) {
            Some(v) => dst.set_value_move(primitives::from_num(kind, Num::Int(i128::from(v)))?),
            None => primitives::conversion_failed(src, dst),
        })?;
    }

    // Range checking happens in `accept`.
    variants.register_converter(builtin::U64, ty, |_, src, dst| match src.peek()? {
        Value::U64(v) => dst.set_value_move(Value::U64(*v)),
        _ => primitives::conversion_failed(src, dst),
    })?;

    let names = Arc::clone(table);
    variants.register_converter(ty, builtin::STRING, move |_, src, dst| {
        match bit_struct_value(src.peek()?) {
            Some(v) => dst.set_value_move(Value::String(names.format(v))),
            None => primitives::conversion_failed(src, dst),
        }
    })?;

    let parse = Arc::clone(table);
    variants.register_converter(builtin::STRING, ty, move |_, src, dst| {
        match src.peek()?.as_str().and_then(|text| parse.parse(text)) {
            Some(v) => dst.set_value_move(Value::BitStruct(v)),
            None => primitives::conversion_failed(src, dst),
        }
    })
}

fn check_fields(rt: &Runtime, name: &str, fields: &[BitStructField]) -> Result<()> {
    validate(name, fields.iter().map(|f| f.name))?;
    let invalid = |reason: String| {
        fail(Error::InvalidTypeInfo {
            name: name.to_string(),
            reason,
        })
    };
    let mut taken = 0u64;
    for field in fields {
        let mask = field.mask;
        if mask == 0 {
            return invalid(format!("field {} has an empty mask", field.name()));
        }
        if mask.count_ones() != 64 - mask.leading_zeros() - mask.trailing_zeros() {
            return invalid(format!("field {} mask {mask:#x} is not contiguous", field.name()));
        }
        if taken & mask != 0 {
            return invalid(format!("field {} overlaps an earlier field", field.name()));
        }
        taken |= mask;
        let ty = field.value_type;
        if ty != builtin::U64 && !rt.variants().can_convert(builtin::U64, ty) {
            return invalid(format!(
                "field {} type {} cannot be built from u64",
                field.name(),
                rt.types().describe(ty)
            ));
        }
    }
    Ok(())
}

/// Registers a bit-struct type named `name` with the given fields.
///
/// Every field type must be [`builtin::U64`] or convertible from it.
///
/// # Errors
///
/// - [`Error::InvalidTypeInfo`] for an empty field list, repeated names,
///   empty, split or overlapping masks, or a field type that cannot be
///   built from `u64`
/// - Any error of [`TypeRegistry::register`](crate::runtime::types::TypeRegistry::register)
pub fn register_bit_struct(rt: &Runtime, name: &str, fields: &[BitStructField]) -> Result<TypeId> {
    check_fields(rt, name, fields)?;
    let table = Arc::new(BitStructTable::new(fields));
    let info = TypeInfo::new()
        .with_class_init(class_init)
        .with_class_data(Arc::clone(&table) as Arc<ClassData>);
    let ty = rt.types().register(name, builtin::BIT_STRUCT, info, TypeFlags::NONE)?;

    let support = rt
        .variants()
        .register_ops(ty, Arc::new(BitStructOps { table: Arc::clone(&table) }))
        .and_then(|()| register_converters(rt, ty, &table));
    if let Err(err) = support {
        if let Err(cleanup) = rt.unregister(ty) {
            oxmeta_log::warn!("rolling back bit struct {}: {}", name, cleanup);
        }
        return Err(err);
    }
    oxmeta_log::debug!(
        "registered bit struct {} with {} fields, mask {:#x}",
        name,
        table.fields.len(),
        table.mask
    );
    Ok(ty)
}
