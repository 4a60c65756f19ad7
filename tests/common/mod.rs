// Common test utilities for integration tests
//
// Shared type hierarchies and helpers used across the integration tests.

#![allow(dead_code)]

use oxmeta::runtime::enums;
use oxmeta::runtime::types::ClassData;
use oxmeta::{
    Class, ClassSlice, ClassStruct, EnumEntry, Instance, InstanceLevel, InstancePtr,
    InstanceStruct, PrivateStruct, Result, Runtime, TypeFlags, TypeId, TypeInfo, builtin,
};
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

static NAME_ID: AtomicUsize = AtomicUsize::new(0);

/// A type name no other test uses.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}_{}", NAME_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn runtime() -> Runtime {
    Runtime::new().expect("runtime should build")
}

thread_local! {
    static EVENTS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub fn record(event: impl Into<String>) {
    EVENTS.with(|events| events.borrow_mut().push(event.into()));
}

/// Drains the events recorded on this thread.
pub fn take_events() -> Vec<String> {
    EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()))
}

// ============================================================================
// Animal -> Dog
// ============================================================================

#[repr(C)]
pub struct AnimalClass {
    pub base: Class,
    pub legs: u32,
    pub speak: Option<fn(InstancePtr<'_>) -> String>,
}

unsafe impl ClassStruct for AnimalClass {}

#[repr(C)]
pub struct Animal {
    pub base: Instance,
    pub age: u32,
}

unsafe impl InstanceStruct for Animal {}

#[repr(C)]
pub struct AnimalPrivate {
    pub serial: u64,
}

unsafe impl PrivateStruct for AnimalPrivate {}

#[repr(C)]
pub struct DogClass {
    pub base: AnimalClass,
    pub fetch: Option<fn(InstancePtr<'_>) -> u32>,
}

unsafe impl ClassStruct for DogClass {}

#[repr(C)]
pub struct Dog {
    pub base: Animal,
    pub tricks: u32,
}

unsafe impl InstanceStruct for Dog {}

#[repr(C)]
pub struct DogPrivate {
    pub good: bool,
}

unsafe impl PrivateStruct for DogPrivate {}

fn animal_class_init(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    record("animal class init");
    let class = slice.get_mut::<AnimalClass>()?;
    class.legs = 4;
    class.speak = Some(|_| "...".to_string());
    Ok(())
}

fn animal_class_final(_: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    record("animal class final");
    Ok(())
}

fn animal_init(level: &mut InstanceLevel<'_>) -> Result<()> {
    record("animal init");
    level.fields_mut::<Animal>()?.age = 1;
    level.private_mut::<AnimalPrivate>()?.serial = 0xA11;
    Ok(())
}

fn animal_final(_: &mut InstanceLevel<'_>) -> Result<()> {
    record("animal final");
    Ok(())
}

fn dog_class_init(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    record("dog class init");
    let class = slice.get_mut::<DogClass>()?;
    // The animal level already ran.
    assert_eq!(class.base.legs, 4);
    class.base.speak = Some(|_| "woof".to_string());
    class.fetch = Some(|inst| inst.fields::<Dog>().map_or(0, |dog| dog.tricks));
    Ok(())
}

fn dog_class_final(_: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    record("dog class final");
    Ok(())
}

fn dog_init(level: &mut InstanceLevel<'_>) -> Result<()> {
    record("dog init");
    let dog = level.fields_mut::<Dog>()?;
    // Base fields are valid before the derived level runs.
    assert_eq!(dog.base.age, 1);
    dog.tricks = 3;
    level.private_mut::<DogPrivate>()?.good = true;
    Ok(())
}

fn dog_final(_: &mut InstanceLevel<'_>) -> Result<()> {
    record("dog final");
    Ok(())
}

pub struct Zoo {
    pub animal: TypeId,
    pub dog: TypeId,
}

/// Registers an `Animal` root under `Instance` and a `Dog` below it, both
/// with private data and init/final callbacks that log to this thread.
pub fn register_animals(rt: &Runtime) -> Zoo {
    let animal = rt
        .types()
        .register(
            &unique_name("Animal"),
            builtin::INSTANCE,
            TypeInfo::new()
                .with_class::<AnimalClass>()
                .with_instance::<Animal>()
                .with_private::<AnimalPrivate>()
                .with_class_init(animal_class_init)
                .with_class_final(animal_class_final)
                .with_instance_init(animal_init)
                .with_instance_final(animal_final),
            TypeFlags::NONE,
        )
        .expect("animal registers");
    let dog = rt
        .types()
        .register(
            &unique_name("Dog"),
            animal,
            TypeInfo::new()
                .with_class::<DogClass>()
                .with_instance::<Dog>()
                .with_private::<DogPrivate>()
                .with_class_init(dog_class_init)
                .with_class_final(dog_class_final)
                .with_instance_init(dog_init)
                .with_instance_final(dog_final),
            TypeFlags::NONE,
        )
        .expect("dog registers");
    Zoo { animal, dog }
}

/// A plain instantiable type with no callbacks.
pub fn register_plain(rt: &Runtime, prefix: &str) -> TypeId {
    rt.types()
        .register(&unique_name(prefix), builtin::INSTANCE, TypeInfo::new(), TypeFlags::NONE)
        .expect("plain type registers")
}

/// Registers `Color {RED=1, GREEN=5, BLUE=10}` under a unique name.
pub fn register_color(rt: &Runtime) -> TypeId {
    enums::register_enum(
        rt,
        &unique_name("Color"),
        &[
            EnumEntry::new(1, "RED", "red"),
            EnumEntry::new(5, "GREEN", "green"),
            EnumEntry::new(10, "BLUE", "blue"),
        ],
    )
    .expect("color registers")
}
