// Variant benchmarks for the oxmeta runtime
//
// These benchmarks measure variant construction, copies, comparisons and
// converter dispatch, including string parsing and enum name lookup.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxmeta::runtime::enums::register_enum;
use oxmeta::{BoxRef, EnumEntry, Runtime, TypeId, Value, Variant, builtin};

/// Benchmark constructing variants of a few builtin types.
fn bench_construct(c: &mut Criterion) {
    let mut group = c.benchmark_group("construct");
    let rt = Runtime::new().unwrap();

    group.bench_function("u32", |b| {
        b.iter(|| Variant::new(&rt, black_box(42u32)).unwrap());
    });
    group.bench_function("string", |b| {
        b.iter(|| Variant::new(&rt, black_box("a short string")).unwrap());
    });
    group.bench_function("default_f64", |b| {
        b.iter(|| Variant::construct_default(&rt, builtin::F64).unwrap());
    });

    group.finish();
}

/// Benchmark copies and comparisons.
///
/// Boxed copies only bump a reference count; string copies allocate.
fn bench_copy_compare(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy");
    let rt = Runtime::new().unwrap();

    let text = Variant::new(&rt, "x".repeat(64)).unwrap();
    let boxed = Variant::new(&rt, BoxRef::create(&rt, builtin::BOX).unwrap()).unwrap();
    let a = Variant::new(&rt, 1.5f64).unwrap();
    let z = Variant::new(&rt, 2.5f64).unwrap();

    group.bench_function("string", |b| {
        b.iter(|| Variant::construct_copy(black_box(&text)).unwrap());
    });
    group.bench_function("boxed", |b| {
        b.iter(|| Variant::construct_copy(black_box(&boxed)).unwrap());
    });
    group.bench_function("compare_f64", |b| {
        b.iter(|| black_box(&a).compare(black_box(&z)).unwrap());
    });

    group.finish();
}

/// Benchmark numeric conversions through the converter table.
fn bench_numeric(c: &mut Criterion) {
    let mut group = c.benchmark_group("numeric");
    let rt = Runtime::new().unwrap();
    let pairs: [(&str, Value, TypeId); 4] = [
        ("u8_to_i64", Value::U8(200), builtin::I64),
        ("i64_to_u16", Value::I64(1_000), builtin::U16),
        ("f64_to_i32", Value::F64(12.75), builtin::I32),
        ("bool_to_f32", Value::Bool(true), builtin::F32),
    ];

    for (name, value, to) in pairs {
        let src = Variant::new(&rt, value).unwrap();
        let mut dst = Variant::construct_default(&rt, to).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(name), &src, |b, src| {
            b.iter(|| src.convert(&rt, &mut dst).unwrap());
        });
    }

    group.finish();
}

/// Benchmark conversions to and from text.
fn bench_text(c: &mut Criterion) {
    let mut group = c.benchmark_group("text");
    let rt = Runtime::new().unwrap();
    let color = register_enum(
        &rt,
        "BenchColor",
        &[
            EnumEntry::new(1, "RED", "red"),
            EnumEntry::new(5, "GREEN", "green"),
            EnumEntry::new(10, "BLUE", "blue"),
        ],
    )
    .unwrap();

    let number = Variant::new(&rt, 123_456u32).unwrap();
    let digits = Variant::new(&rt, "123456").unwrap();
    let blue = Variant::construct_value_move(&rt, color, Value::Enum(10)).unwrap();
    let name = Variant::new(&rt, "blue").unwrap();

    group.bench_function("u32_to_string", |b| {
        b.iter(|| number.convert_to(&rt, builtin::STRING).unwrap());
    });
    group.bench_function("string_to_u32", |b| {
        b.iter(|| digits.convert_to(&rt, builtin::U32).unwrap());
    });
    group.bench_function("enum_to_string", |b| {
        b.iter(|| blue.convert_to(&rt, builtin::STRING).unwrap());
    });
    group.bench_function("string_to_enum", |b| {
        b.iter(|| name.convert_to(&rt, color).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_construct, bench_copy_compare, bench_numeric, bench_text);
criterion_main!(benches);
