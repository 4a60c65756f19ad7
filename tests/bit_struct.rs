// Bit Struct Integration Tests
//
// Registered bit structs: field tables, field reads through variant
// indexing, text forms, conversions and unregistration.

mod common;

use common::{runtime, unique_name};
use oxmeta::runtime::bit_struct::{bit_struct_class, register_bit_struct};
use oxmeta::{BitStructClass, BitStructField, Error, Runtime, TypeId, Value, Variant, builtin};

/// A 16-bit RGB565 pixel plus a visibility bit.
fn register_pixel(rt: &Runtime) -> TypeId {
    register_bit_struct(
        rt,
        &unique_name("Pixel"),
        &[
            BitStructField::new("RED", 0xf800, builtin::U8),
            BitStructField::new("GREEN", 0x07e0, builtin::U8),
            BitStructField::new("BLUE", 0x001f, builtin::U8),
            BitStructField::new("VISIBLE", 0x1_0000, builtin::BOOL),
        ],
    )
    .expect("pixel registers")
}

fn pixel(red: u64, green: u64, blue: u64, visible: bool) -> u64 {
    (red << 11) | (green << 5) | blue | (u64::from(visible) << 16)
}

/// Test the pixel class tables
#[test]
fn test_pixel_lookups() {
    let rt = runtime();
    let ty = register_pixel(&rt);
    assert!(rt.types().is_a(ty, builtin::BIT_STRUCT));

    {
        let class = bit_struct_class(&rt, ty).unwrap();
        let table = class.get::<BitStructClass>().unwrap();
        assert_eq!(table.field_count(), 4);
        assert_eq!(table.value_mask(), 0x1_ffff);
        assert_eq!(table.name_from_mask(0x07e0), Some("GREEN"));
        assert_eq!(table.type_from_name("VISIBLE"), Some(builtin::BOOL));
        assert_eq!(table.field(pixel(31, 63, 0, false), "GREEN"), Some(63));

        let names: Vec<_> = table.fields().iter().map(BitStructField::name).collect();
        assert_eq!(names, vec!["RED", "GREEN", "BLUE", "VISIBLE"]);
        let widths: Vec<_> = table.fields().iter().map(BitStructField::max).collect();
        assert_eq!(widths, vec![31, 63, 31, 1]);
    }
    assert_eq!(rt.types().class_ref_count(ty), 0);
}

/// Test that indexing a pixel reads fields as their declared types
#[test]
fn test_field_reads() {
    let rt = runtime();
    let ty = register_pixel(&rt);
    let v = Variant::construct_value_move(&rt, ty, Value::U64(pixel(31, 40, 7, true))).unwrap();

    let read = |name: &str| v.index(&rt, &Variant::new(&rt, name).unwrap()).unwrap();
    assert_eq!(read("RED").peek().unwrap(), &Value::U8(31));
    assert_eq!(read("GREEN").peek().unwrap(), &Value::U8(40));
    assert_eq!(read("BLUE").peek().unwrap(), &Value::U8(7));
    assert_eq!(read("VISIBLE").peek().unwrap(), &Value::Bool(true));
    assert_eq!(v.count(), 4);

    let mut fields = Vec::new();
    let mut key = Variant::invalid();
    let mut value = Variant::invalid();
    loop {
        v.next(&rt, &mut key, &mut value).unwrap();
        if !key.is_valid() {
            break;
        }
        fields.push(key.peek().unwrap().as_str().unwrap().to_string());
    }
    assert_eq!(fields, vec!["RED", "GREEN", "BLUE", "VISIBLE"]);

    // Writes go through the class, not the variant.
    let key = Variant::new(&rt, "RED").unwrap();
    let zero = Variant::new(&rt, 0u8).unwrap();
    assert!(matches!(v.set_index(&rt, &key, zero), Err(Error::Unimplemented { .. })));
}

/// Test editing fields through the class and storing the result
#[test]
fn test_field_writes() {
    let rt = runtime();
    let ty = register_pixel(&rt);
    let class = bit_struct_class(&rt, ty).unwrap();
    let table = class.get::<BitStructClass>().unwrap();

    let mut v = Variant::construct_default(&rt, ty).unwrap();
    let Value::BitStruct(bits) = v.peek().unwrap().clone() else {
        panic!("pixel holds bit-struct values");
    };
    let bits = table.set_field(bits, "GREEN", 63).unwrap();
    let bits = table.set_field(bits, "VISIBLE", 1).unwrap();
    v.set_value_move(Value::BitStruct(bits)).unwrap();
    assert_eq!(v.peek().unwrap(), &Value::BitStruct(pixel(0, 63, 0, true)));

    assert_eq!(
        table.set_field(bits, "BLUE", 32).unwrap_err(),
        Error::OutOfRange { value: 32, min: 0, max: 31 }
    );
    assert!(matches!(
        v.set_value_move(Value::U64(1 << 20)),
        Err(Error::OutOfRange { .. })
    ));
}

/// Test the text form through save, load and string conversion
#[test]
fn test_text_roundtrip() {
    let rt = runtime();
    let ty = register_pixel(&rt);
    let v = Variant::construct_value_move(&rt, ty, Value::U64(pixel(1, 2, 3, false))).unwrap();

    let text = v.convert_to(&rt, builtin::STRING).unwrap();
    assert_eq!(text.peek().unwrap(), &Value::from("RED=1,GREEN=2,BLUE=3,VISIBLE=0"));
    assert!(text.convert_to(&rt, ty).unwrap().equals(&v));

    let mut loaded = Variant::construct_default(&rt, ty).unwrap();
    loaded.load("BLUE=3, RED=1,GREEN=2").unwrap();
    assert!(loaded.equals(&v));
    assert!(matches!(loaded.load("RED=32"), Err(Error::InvalidProperty { .. })));
    assert!(matches!(loaded.load("ALPHA=1"), Err(Error::InvalidProperty { .. })));

    let bad = Variant::new(&rt, "RED=1;GREEN=2").unwrap();
    assert!(matches!(bad.convert_to(&rt, ty), Err(Error::InvalidConversion { .. })));
}

/// Test that string-typed fields read back as text
#[test]
fn test_string_field() {
    let rt = runtime();
    let ty = register_bit_struct(
        &rt,
        &unique_name("Version"),
        &[
            BitStructField::new("MAJOR", 0xff00, builtin::STRING),
            BitStructField::new("MINOR", 0x00ff, builtin::U64),
        ],
    )
    .unwrap();

    let v = Variant::construct_value_move(&rt, ty, Value::U64(0x0312)).unwrap();
    let major = v.index(&rt, &Variant::new(&rt, "MAJOR").unwrap()).unwrap();
    assert_eq!(major.peek().unwrap(), &Value::from("3"));
    let minor = v.index(&rt, &Variant::new(&rt, "MINOR").unwrap()).unwrap();
    assert_eq!(minor.peek().unwrap(), &Value::U64(0x12));
}

/// Test that unregistering a bit struct drops its converters
#[test]
fn test_unregister_drops_converters() {
    let rt = runtime();
    let ty = register_pixel(&rt);
    assert!(rt.variants().can_convert(ty, builtin::STRING));
    assert!(rt.variants().can_convert(builtin::U64, ty));

    rt.unregister(ty).unwrap();
    assert!(!rt.types().verify(ty));
    assert!(!rt.variants().can_convert(ty, builtin::STRING));
    assert!(!rt.variants().can_convert(builtin::U64, ty));
}
