// Enum and Flags Integration Tests
//
// Registered enumerations and flag sets: class tables, lookups, variant
// values and conversions to and from strings.

mod common;

use common::{register_color, runtime, unique_name};
use oxmeta::runtime::enums::{enum_class, register_enum};
use oxmeta::runtime::flags::{flags_class, register_flags};
use oxmeta::{EnumClass, EnumEntry, Error, FlagsClass, FlagsEntry, Runtime, TypeId, Value, Variant, builtin};
use std::cmp::Ordering;

/// Test lookups on the color class
#[test]
fn test_color_lookups() {
    let rt = runtime();
    let color = register_color(&rt);
    assert!(rt.types().is_a(color, builtin::ENUM));

    let class = enum_class(&rt, color).unwrap();
    let table = class.get::<EnumClass>().unwrap();

    assert_eq!(table.entry_count(), 3);
    assert_eq!(table.value_min(), 1);
    assert_eq!(table.value_max(), 10);
    assert_eq!(table.value_from_name("BLUE"), Some(10));
    assert_eq!(table.value_from_nick("green"), Some(5));
    assert_eq!(table.value_from_index(0), Some(1));
    assert_eq!(table.value_from_index(3), None);
    assert_eq!(table.name_from_value(5), Some("GREEN"));
    assert_eq!(table.nick_from_value(1), Some("red"));
    assert_eq!(table.name_from_value(7), None);

    assert!(table.value_check(10));
    // In range but not an entry.
    assert!(!table.value_check(7));
    assert!(!table.value_check(9999));

    let names: Vec<_> = table.entries().iter().map(EnumEntry::name).collect();
    assert_eq!(names, vec!["RED", "GREEN", "BLUE"]);
}

/// Test that enum values round-trip through their names
#[test]
fn test_color_string_roundtrip() {
    let rt = runtime();
    let color = register_color(&rt);

    let blue = Variant::construct_value_move(&rt, color, Value::Enum(10)).unwrap();
    let text = blue.convert_to(&rt, builtin::STRING).unwrap();
    assert_eq!(text.peek().unwrap(), &Value::from("BLUE"));

    let back = text.convert_to(&rt, color).unwrap();
    assert!(back.equals(&blue));

    // Nicks are accepted as well.
    let by_nick = Variant::new(&rt, " green ").unwrap().convert_to(&rt, color).unwrap();
    assert_eq!(by_nick.peek().unwrap(), &Value::Enum(5));

    let unknown = Variant::new(&rt, "PURPLE").unwrap();
    assert!(matches!(unknown.convert_to(&rt, color), Err(Error::InvalidConversion { .. })));
}

/// Test enum variants: default, validation, ordering and numeric views
#[test]
fn test_color_variants() {
    let rt = runtime();
    let color = register_color(&rt);

    let mut value = Variant::construct_default(&rt, color).unwrap();
    assert_eq!(value.peek().unwrap(), &Value::Enum(1));

    value.set_value_move(Value::U32(5)).unwrap();
    assert_eq!(value.peek().unwrap(), &Value::Enum(5));
    assert!(matches!(
        value.set_value_move(Value::U32(9999)),
        Err(Error::OutOfRange { value: 9999, min: 1, max: 10 })
    ));
    assert!(value.set_value_move(Value::U32(7)).is_err());
    assert_eq!(value.peek().unwrap(), &Value::Enum(5));

    let red = Variant::construct_default(&rt, color).unwrap();
    assert_eq!(red.compare(&value).unwrap(), Ordering::Less);

    assert_eq!(value.convert_to(&rt, builtin::I64).unwrap().peek().unwrap(), &Value::I64(5));
    assert_eq!(value.convert_to(&rt, builtin::BOOL).unwrap().peek().unwrap(), &Value::Bool(true));

    let mut saved = String::new();
    value.save(&mut saved).unwrap();
    assert_eq!(saved, "GREEN");
    let mut loaded = Variant::construct_default(&rt, color).unwrap();
    loaded.load("BLUE").unwrap();
    assert_eq!(loaded.peek().unwrap(), &Value::Enum(10));
    assert!(matches!(loaded.load("teal"), Err(Error::InvalidProperty { .. })));

    // Enum values need an explicit type.
    assert!(matches!(Variant::new(&rt, Value::Enum(1)), Err(Error::InvalidType { .. })));
}

/// Test enum registration failures and unregistration
#[test]
fn test_enum_registration() {
    let rt = runtime();
    assert!(matches!(
        register_enum(&rt, &unique_name("Empty"), &[]),
        Err(Error::InvalidTypeInfo { .. })
    ));
    assert!(matches!(
        register_enum(
            &rt,
            &unique_name("Doubled"),
            &[EnumEntry::new(0, "SAME", "a"), EnumEntry::new(1, "SAME", "b")]
        ),
        Err(Error::InvalidTypeInfo { .. })
    ));
    assert!(matches!(enum_class(&rt, builtin::U32), Err(Error::InvalidType { .. })));

    let color = register_color(&rt);
    rt.unregister(color).unwrap();
    assert!(!rt.variants().can_convert(color, builtin::STRING));
    assert!(!rt.variants().can_convert(builtin::STRING, color));
}

/// Test that the abstract enum root accepts any value
#[test]
fn test_enum_root_class() {
    let rt = runtime();
    let root = enum_class(&rt, builtin::ENUM).unwrap();
    let class = root.get::<EnumClass>().unwrap();
    assert_eq!(class.entry_count(), 0);
    assert!(class.value_check(12_345));
}

// ============================================================================
// Flags
// ============================================================================

fn register_access(rt: &Runtime) -> TypeId {
    register_flags(
        rt,
        &unique_name("Access"),
        &[
            FlagsEntry::new(0, "NONE", "none"),
            FlagsEntry::new(1, "READ", "read"),
            FlagsEntry::new(2, "WRITE", "write"),
            FlagsEntry::new(4, "EXEC", "exec"),
        ],
    )
    .unwrap()
}

/// Test lookups and text forms on a flags class
#[test]
fn test_access_flags() {
    let rt = runtime();
    let access = register_access(&rt);
    let class = flags_class(&rt, access).unwrap();
    let table = class.get::<FlagsClass>().unwrap();

    assert_eq!(table.mask(), 7);
    assert_eq!(table.value_from_name("WRITE"), Some(2));
    assert_eq!(table.value_from_nick("exec"), Some(4));
    assert_eq!(table.value_to_string(3), "READ|WRITE");
    assert_eq!(table.value_to_string(0), "NONE");
    assert_eq!(table.value_from_string("READ | exec"), Some(5));
    assert_eq!(table.value_from_string("READ|DELETE"), None);
    assert!(table.value_check(7));
    assert!(!table.value_check(8));
}

/// Test flags variants and their conversions
#[test]
fn test_access_variants() {
    let rt = runtime();
    let access = register_access(&rt);

    let mut rights = Variant::construct_default(&rt, access).unwrap();
    assert_eq!(rights.peek().unwrap(), &Value::Flags(0));
    rights.set_value_move(Value::U32(6)).unwrap();
    assert!(matches!(
        rights.set_value_move(Value::U32(8)),
        Err(Error::OutOfRange { value: 8, min: 0, max: 7 })
    ));

    let text = rights.convert_to(&rt, builtin::STRING).unwrap();
    assert_eq!(text.peek().unwrap(), &Value::from("WRITE|EXEC"));
    let back = text.convert_to(&rt, access).unwrap();
    assert!(back.equals(&rights));

    assert_eq!(rights.convert_to(&rt, builtin::U64).unwrap().peek().unwrap(), &Value::U64(6));
    assert!(matches!(flags_class(&rt, builtin::ENUM), Err(Error::InvalidType { .. })));
}
