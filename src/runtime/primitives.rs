//! Variant operations and converters of the builtin value types.

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::boxed::BoxRef;
use crate::runtime::types::{TypeId, TypeNode, builtin};
use crate::runtime::variant::{OpFlags, Value, ValueKind, Variant, VariantOps};
use std::cmp::Ordering;
use std::fmt::Write;
use std::sync::Arc;

/// Kinds that take part in the numeric conversion matrix.
const NUMERIC: [ValueKind; 10] = [
    ValueKind::Bool,
    ValueKind::U8,
    ValueKind::I16,
    ValueKind::U16,
    ValueKind::I32,
    ValueKind::U32,
    ValueKind::I64,
    ValueKind::U64,
    ValueKind::F32,
    ValueKind::F64,
];

/// Every builtin value kind with an operation table.
const PRIMITIVES: [ValueKind; 15] = [
    ValueKind::Nil,
    ValueKind::Bool,
    ValueKind::Char,
    ValueKind::U8,
    ValueKind::I16,
    ValueKind::U16,
    ValueKind::I32,
    ValueKind::U32,
    ValueKind::I64,
    ValueKind::U64,
    ValueKind::F32,
    ValueKind::F64,
    ValueKind::String,
    ValueKind::Pointer,
    ValueKind::Type,
];

/// Operations shared by all plain-value builtin types.
struct PrimitiveOps {
    kind: ValueKind,
}

impl PrimitiveOps {
    fn zero(&self) -> Value {
        match self.kind {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Char => Value::Char('\0'),
            ValueKind::U8 => Value::U8(0),
            ValueKind::I16 => Value::I16(0),
            ValueKind::U16 => Value::U16(0),
            ValueKind::I32 => Value::I32(0),
            ValueKind::U32 => Value::U32(0),
            ValueKind::I64 => Value::I64(0),
            ValueKind::U64 => Value::U64(0),
            ValueKind::F32 => Value::F32(0.0),
            ValueKind::F64 => Value::F64(0.0),
            ValueKind::String => Value::String(String::new()),
            ValueKind::Pointer => Value::Pointer(0),
            ValueKind::Type => Value::Type(TypeId::INVALID),
            _ => Value::Nil,
        }
    }
}

impl VariantOps for PrimitiveOps {
    fn flags(&self) -> OpFlags {
        let all = OpFlags::CONSTRUCT_ALL
            | OpFlags::SET_ALL
            | OpFlags::GET_ALL
            | OpFlags::COMPARE
            | OpFlags::SAVE
            | OpFlags::LOAD;
        match self.kind {
            ValueKind::Nil => all | OpFlags::VALUELESS_TYPE | OpFlags::RELOCATABLE,
            ValueKind::String => all,
            _ => all | OpFlags::RELOCATABLE,
        }
    }

    fn default_value(&self, _: &Arc<TypeNode>) -> Result<Value> {
        Ok(self.zero())
    }

    fn accept(&self, node: &TypeNode, value: Value) -> Result<Value> {
        if value.kind() == self.kind {
            Ok(value)
        } else {
            fail(Error::InvalidType {
                context: format!("{} does not hold {} values", node.name(), value.kind()),
            })
        }
    }

    fn compare(&self, node: &TypeNode, a: &Value, b: &Value) -> Result<Ordering> {
        let ordering = match (a, b) {
            (Value::Nil, Value::Nil) => Some(Ordering::Equal),
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            (Value::Char(x), Value::Char(y)) => Some(x.cmp(y)),
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            (Value::Pointer(x), Value::Pointer(y)) => Some(x.cmp(y)),
            (Value::Type(x), Value::Type(y)) => Some(x.cmp(y)),
            (Value::F32(x), Value::F32(y)) => Some(x.total_cmp(y)),
            (Value::F64(x), Value::F64(y)) => Some(x.total_cmp(y)),
            _ => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) if a.kind() == b.kind() => Some(x.cmp(&y)),
                _ => None,
            },
        };
        match ordering {
            Some(ordering) => Ok(ordering),
            None => fail(Error::InvalidOperation {
                reason: format!("{} cannot order {} and {}", node.name(), a.kind(), b.kind()),
            }),
        }
    }

    fn save(&self, node: &TypeNode, value: &Value, out: &mut String) -> Result<()> {
        let written = match value {
            Value::Nil => Ok(()),
            Value::Pointer(p) => write!(out, "{p:#x}"),
            Value::Type(ty) => write!(out, "{}", ty.as_u32()),
            Value::String(s) => {
                out.push_str(s);
                Ok(())
            }
            other => match display_scalar(other) {
                Some(text) => {
                    out.push_str(&text);
                    Ok(())
                }
                None => {
                    return fail(Error::InvalidType {
                        context: format!("{} cannot save a {} value", node.name(), other.kind()),
                    });
                }
            },
        };
        written.map_err(|_| {
            crate::error::record(Error::InvalidOperation {
                reason: "formatting failed".to_string(),
            })
        })
    }

    fn load(&self, node: &TypeNode, input: &str) -> Result<Value> {
        let input = input.trim_end_matches(['\r', '\n']);
        let parsed = match self.kind {
            ValueKind::Nil => input.is_empty().then_some(Value::Nil),
            ValueKind::String => Some(Value::String(input.to_string())),
            ValueKind::Pointer => {
                let digits = input.strip_prefix("0x").unwrap_or(input);
                usize::from_str_radix(digits, 16).ok().map(Value::Pointer)
            }
            ValueKind::Type => input.parse::<u32>().ok().map(|raw| Value::Type(TypeId::from_raw(raw))),
            ValueKind::Char => single_char(input).map(Value::Char),
            kind => parse_numeric(kind, input).ok(),
        };
        match parsed {
            Some(value) => Ok(value),
            None => fail(Error::InvalidProperty {
                name: format!("{} text {input:?}", node.name()),
            }),
        }
    }
}

/// Variant operations of [`builtin::BOX`] and every box subtype.
///
/// Copies share the box; comparison orders by address.
struct BoxOps;

impl VariantOps for BoxOps {
    fn flags(&self) -> OpFlags {
        OpFlags::CONSTRUCT_ALL | OpFlags::SET_ALL | OpFlags::GET_ALL | OpFlags::COMPARE | OpFlags::RELOCATABLE
    }

    fn default_value(&self, node: &Arc<TypeNode>) -> Result<Value> {
        BoxRef::create_node(Arc::clone(node)).map(Value::Boxed)
    }

    fn accept(&self, node: &TypeNode, value: Value) -> Result<Value> {
        let fits = matches!(&value, Value::Boxed(boxed) if boxed.instance().node().is_a(node.id()));
        if fits {
            Ok(value)
        } else {
            fail(Error::InvalidType {
                context: format!("{} cannot hold this {} value", node.name(), value.kind()),
            })
        }
    }

    fn compare(&self, node: &TypeNode, a: &Value, b: &Value) -> Result<Ordering> {
        match (a.as_boxed(), b.as_boxed()) {
            (Some(x), Some(y)) => Ok(x.as_ptr().cmp(&y.as_ptr())),
            _ => fail(Error::InvalidOperation {
                reason: format!("{} compares boxes only", node.name()),
            }),
        }
    }
}

fn display_scalar(value: &Value) -> Option<String> {
    Some(match value {
        Value::Bool(v) => v.to_string(),
        Value::Char(v) => v.to_string(),
        Value::U8(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        _ => return None,
    })
}

fn single_char(input: &str) -> Option<char> {
    let mut chars = input.chars();
    let c = chars.next()?;
    chars.next().is_none().then_some(c)
}

/// Inclusive range of an integer kind.
fn int_bounds(kind: ValueKind) -> Option<(i128, i128)> {
    Some(match kind {
        ValueKind::Bool => (0, 1),
        ValueKind::U8 => (0, i128::from(u8::MAX)),
        ValueKind::I16 => (i128::from(i16::MIN), i128::from(i16::MAX)),
        ValueKind::U16 => (0, i128::from(u16::MAX)),
        ValueKind::I32 => (i128::from(i32::MIN), i128::from(i32::MAX)),
        ValueKind::U32 => (0, i128::from(u32::MAX)),
        ValueKind::I64 => (i128::from(i64::MIN), i128::from(i64::MAX)),
        ValueKind::U64 => (0, i128::from(u64::MAX)),
        _ => return None,
    })
}

/// Common ground of the numeric conversions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Num {
    Int(i128),
    Float(f64),
}

pub(crate) fn to_num(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(i128::from(*b))),
        Value::F32(_) | Value::F64(_) => value.as_f64().map(Num::Float),
        other => other.as_i128().map(Num::Int),
    }
}

/// Narrows `num` into `kind`, failing [`Error::OutOfRange`] when it does
/// not fit. Floats truncate toward zero; any non-zero value is `true`.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub(crate) fn from_num(kind: ValueKind, num: Num) -> Result<Value> {
    match (kind, num) {
        (ValueKind::Bool, Num::Int(i)) => return Ok(Value::Bool(i != 0)),
        (ValueKind::Bool, Num::Float(f)) => return Ok(Value::Bool(f != 0.0)),
        (ValueKind::F32, Num::Int(i)) => return Ok(Value::F32(i as f32)),
        (ValueKind::F32, Num::Float(f)) => return Ok(Value::F32(f as f32)),
        (ValueKind::F64, Num::Int(i)) => return Ok(Value::F64(i as f64)),
        (ValueKind::F64, Num::Float(f)) => return Ok(Value::F64(f)),
        _ => {}
    }
    let Some((min, max)) = int_bounds(kind) else {
        return fail(Error::InvalidType {
            context: format!("{kind} is not numeric"),
        });
    };
    let int = match num {
        Num::Int(i) => i,
        Num::Float(f) if f.is_nan() => {
            return fail(Error::OutOfRange { value: 0, min, max });
        }
        // Saturating cast; out-of-range floats land outside [min, max].
        Num::Float(f) => f.trunc() as i128,
    };
    if int < min || int > max {
        return fail(Error::OutOfRange { value: int, min, max });
    }
    // The range check above makes every narrowing below lossless.
    Ok(match kind {
        ValueKind::U8 => Value::U8(int as u8),
        ValueKind::I16 => Value::I16(int as i16),
        ValueKind::U16 => Value::U16(int as u16),
        ValueKind::I32 => Value::I32(int as i32),
        ValueKind::U32 => Value::U32(int as u32),
        ValueKind::I64 => Value::I64(int as i64),
        _ => Value::U64(int as u64),
    })
}

fn parse_numeric(kind: ValueKind, text: &str) -> Result<Value> {
    let text = text.trim();
    let num = match kind {
        ValueKind::Bool => match text {
            "true" | "TRUE" | "1" => Some(Num::Int(1)),
            "false" | "FALSE" | "0" => Some(Num::Int(0)),
            _ => None,
        },
        ValueKind::F32 | ValueKind::F64 => text.parse::<f64>().ok().map(Num::Float),
        _ => text.parse::<i128>().ok().map(Num::Int),
    };
    match num {
        Some(num) => from_num(kind, num),
        None => fail(Error::InvalidConversion {
            from: format!("string {text:?}"),
            to: kind.name().to_string(),
        }),
    }
}

fn kind_type(kind: ValueKind) -> TypeId {
    kind.builtin_type().unwrap_or(TypeId::INVALID)
}

/// Registers the builtin operation tables.
pub(crate) fn register_ops(rt: &Runtime) -> Result<()> {
    let variants = rt.variants();
    for kind in PRIMITIVES {
        variants.register_ops(kind_type(kind), Arc::new(PrimitiveOps { kind }))?;
    }
    variants.register_ops(builtin::BOX, Arc::new(BoxOps))
}

/// Registers the builtin converter matrix.
pub(crate) fn register_converters(rt: &Runtime) -> Result<()> {
    let variants = rt.variants();

    for from in NUMERIC {
        for to in NUMERIC {
            if from == to {
                continue;
            }
            variants.register_converter(kind_type(from), kind_type(to), move |_, src, dst| {
                let value = src.peek()?;
                let Some(num) = to_num(value) else {
                    return conversion_failed(src, dst);
                };
                dst.set_value_move(from_num(to, num)?)
            })?;
        }
    }

    for kind in PRIMITIVES {
        if kind == ValueKind::String {
            continue;
        }
        variants.register_converter(kind_type(kind), builtin::STRING, |rt, src, dst| {
            let text = match src.peek()? {
                Value::Type(ty) => rt.types().name(*ty).unwrap_or("invalid").to_string(),
                value => match display_scalar(value) {
                    Some(text) => text,
                    None => {
                        let mut out = String::new();
                        src.save(&mut out)?;
                        out
                    }
                },
            };
            dst.set_value_move(Value::String(text))
        })?;
    }

    for to in NUMERIC {
        variants.register_converter(builtin::STRING, kind_type(to), move |_, src, dst| {
            let Some(text) = src.peek()?.as_str() else {
                return conversion_failed(src, dst);
            };
            dst.set_value_move(parse_numeric(to, text)?)
        })?;
    }

    variants.register_converter(builtin::STRING, builtin::CHAR, |_, src, dst| {
        match src.peek()?.as_str().and_then(single_char) {
            Some(c) => dst.set_value_move(Value::Char(c)),
            None => conversion_failed(src, dst),
        }
    })?;
    variants.register_converter(builtin::STRING, builtin::TYPE, |rt, src, dst| {
        match src.peek()?.as_str().and_then(|name| rt.types().find(name)) {
            Some(ty) => dst.set_value_move(Value::Type(ty)),
            None => conversion_failed(src, dst),
        }
    })?;

    variants.register_converter(builtin::CHAR, builtin::U32, |_, src, dst| match src.peek()? {
        Value::Char(c) => dst.set_value_move(Value::U32(u32::from(*c))),
        _ => conversion_failed(src, dst),
    })?;
    variants.register_converter(builtin::CHAR, builtin::U8, |_, src, dst| match src.peek()? {
        Value::Char(c) => match u8::try_from(*c) {
            Ok(b) => dst.set_value_move(Value::U8(b)),
            Err(_) => fail(Error::OutOfRange {
                value: i128::from(u32::from(*c)),
                min: 0,
                max: i128::from(u8::MAX),
            }),
        },
        _ => conversion_failed(src, dst),
    })?;
    variants.register_converter(builtin::U8, builtin::CHAR, |_, src, dst| match src.peek()? {
        Value::U8(b) => dst.set_value_move(Value::Char(char::from(*b))),
        _ => conversion_failed(src, dst),
    })?;
    variants.register_converter(builtin::U32, builtin::CHAR, |_, src, dst| match src.peek()? {
        Value::U32(v) => match char::from_u32(*v) {
            Some(c) => dst.set_value_move(Value::Char(c)),
            None => fail(Error::OutOfRange {
                value: i128::from(*v),
                min: 0,
                max: i128::from(u32::from(char::MAX)),
            }),
        },
        _ => conversion_failed(src, dst),
    })?;

    oxmeta_log::debug!("registered {} builtin converters", variants.converter_count());
    Ok(())
}

pub(crate) fn conversion_failed<T>(src: &Variant, dst: &Variant) -> Result<T> {
    fail(Error::InvalidConversion {
        from: src.type_name().to_string(),
        to: dst.type_name().to_string(),
    })
}
