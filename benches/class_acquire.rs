// Class and instance benchmarks for the oxmeta runtime
//
// These benchmarks measure the hot paths of the class system: taking a
// reference on a live class, building a class from scratch, constructing
// instances, casts and interface lookup.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxmeta::runtime::instance;
use oxmeta::{
    Class, ClassRef, ClassStruct, Instance, InstanceStorage, InstanceStruct, Interface, Runtime,
    TypeFlags, TypeId, TypeInfo, builtin, query_interface,
};
use std::mem::offset_of;

#[repr(C)]
struct Iface {
    base: Interface,
    call: Option<fn() -> u32>,
}

unsafe impl ClassStruct for Iface {}

#[repr(C)]
struct NodeClass {
    base: Class,
    iface: Iface,
}

unsafe impl ClassStruct for NodeClass {}

#[repr(C)]
struct Node {
    base: Instance,
    payload: [u64; 4],
}

unsafe impl InstanceStruct for Node {}

/// Registers a chain of `depth` types below `Instance`, the first of which
/// embeds an interface. Returns the interface and the leaf.
fn register_chain(rt: &Runtime, depth: usize) -> (TypeId, TypeId) {
    let iface = rt
        .types()
        .register(
            &format!("BenchIface{depth}"),
            builtin::INTERFACE,
            TypeInfo::new().with_class::<Iface>(),
            TypeFlags::NONE,
        )
        .unwrap();
    let mut parent = rt
        .types()
        .register(
            &format!("BenchRoot{depth}"),
            builtin::INSTANCE,
            TypeInfo::new()
                .with_class::<NodeClass>()
                .with_instance::<Node>()
                .with_interface(iface, offset_of!(NodeClass, iface)),
            TypeFlags::NONE,
        )
        .unwrap();
    for level in 1..depth {
        parent = rt
            .types()
            .register(&format!("BenchLevel{depth}_{level}"), parent, TypeInfo::new(), TypeFlags::NONE)
            .unwrap();
    }
    (iface, parent)
}

/// Benchmark acquiring a class that is already alive.
///
/// Only an atomic increment and decrement under the lifecycle lock.
fn bench_acquire_live(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_, leaf) = register_chain(&rt, 4);
    let _anchor = ClassRef::acquire(&rt, leaf).unwrap();

    c.bench_function("acquire_live_class", |b| {
        b.iter(|| ClassRef::acquire(&rt, black_box(leaf)).unwrap());
    });
}

/// Benchmark building and tearing down a class each iteration.
///
/// Grows with the depth of the hierarchy, since every ancestor class is
/// built too.
fn bench_build_class(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_class");
    let rt = Runtime::new().unwrap();

    for depth in [1, 4, 16] {
        let (_, leaf) = register_chain(&rt, depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &leaf, |b, leaf| {
            b.iter(|| drop(ClassRef::acquire(&rt, *leaf).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark constructing and destructing an instance in reused storage.
fn bench_construct(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (_, leaf) = register_chain(&rt, 4);
    let _anchor = ClassRef::acquire(&rt, leaf).unwrap();
    let mut storage = InstanceStorage::new(&rt, leaf).unwrap();

    c.bench_function("construct_destruct", |b| {
        b.iter(|| {
            storage.construct().unwrap();
            storage.destruct().unwrap();
        });
    });
}

/// Benchmark type checks and interface lookup on a live instance.
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let rt = Runtime::new().unwrap();
    let (iface, leaf) = register_chain(&rt, 8);
    let storage = instance::create(&rt, leaf).unwrap();
    let inst = storage.instance().unwrap();

    group.bench_function("check_root", |b| {
        b.iter(|| instance::check(Some(black_box(inst)), builtin::INSTANCE));
    });
    group.bench_function("check_miss", |b| {
        b.iter(|| instance::check(Some(black_box(inst)), builtin::BOX));
    });
    group.bench_function("query_interface", |b| {
        b.iter(|| query_interface(black_box(inst), iface).unwrap().class_offset());
    });

    group.finish();
}

criterion_group!(benches, bench_acquire_live, bench_build_class, bench_construct, bench_dispatch);
criterion_main!(benches);
