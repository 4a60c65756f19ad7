// Interface Integration Tests
//
// Embedded interface blocks: lookup from instances, defaults, overrides,
// inheritance of implementations and derived interfaces.

mod common;

use common::{runtime, unique_name};
use oxmeta::runtime::instance;
use oxmeta::runtime::types::ClassData;
use oxmeta::{
    Class, ClassRef, ClassSlice, ClassStruct, Error, Instance, InstancePtr, InstanceStruct, Interface,
    Result, Runtime, TypeFlags, TypeId, TypeInfo, builtin, query_interface, try_query_interface,
};
use std::mem::offset_of;
use std::sync::Arc;

#[repr(C)]
struct Speaker {
    base: Interface,
    speak: Option<fn(InstancePtr<'_>) -> String>,
    volume: Option<fn(InstancePtr<'_>) -> u8>,
}

unsafe impl ClassStruct for Speaker {}

#[repr(C)]
struct LoudSpeaker {
    base: Speaker,
    shout: Option<fn(InstancePtr<'_>) -> String>,
}

unsafe impl ClassStruct for LoudSpeaker {}

#[repr(C)]
struct RobotClass {
    base: Class,
    model: u32,
    speaker: Speaker,
}

unsafe impl ClassStruct for RobotClass {}

#[repr(C)]
struct Robot {
    base: Instance,
    serial: u32,
}

unsafe impl InstanceStruct for Robot {}

#[repr(C)]
struct SirenClass {
    base: Class,
    speaker: LoudSpeaker,
}

unsafe impl ClassStruct for SirenClass {}

fn speaker_defaults(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    let speaker = slice.get_mut::<Speaker>()?;
    speaker.speak = Some(|_| "...".to_string());
    speaker.volume = Some(|_| 1);
    Ok(())
}

fn loud_defaults(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    let loud = slice.get_mut::<LoudSpeaker>()?;
    // The base interface level already ran.
    assert!(loud.base.speak.is_some());
    loud.base.volume = Some(|_| 11);
    loud.shout = Some(|_| "WEE-OO".to_string());
    Ok(())
}

fn robot_class_init(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    let class = slice.get_mut::<RobotClass>()?;
    class.model = 9;
    class.speaker.speak = Some(|inst| {
        let serial = inst.fields::<Robot>().map_or(0, |robot| robot.serial);
        format!("beep {serial}")
    });
    // Unset slots fall back to the interface default.
    class.speaker.volume = None;
    Ok(())
}

fn polite_class_init(slice: &mut ClassSlice<'_>, data: Option<&ClassData>) -> Result<()> {
    let Some(&speaker) = data.and_then(|data| data.downcast_ref::<TypeId>()) else {
        return Err(Error::InvalidPointer);
    };
    slice.interface_mut::<Speaker>(speaker)?.speak = Some(|_| "good day".to_string());
    Ok(())
}

struct Fixture {
    speaker: TypeId,
    loud: TypeId,
    robot: TypeId,
    siren: TypeId,
}

fn register(rt: &Runtime) -> Fixture {
    let speaker = rt
        .types()
        .register(
            &unique_name("Speaker"),
            builtin::INTERFACE,
            TypeInfo::new().with_class::<Speaker>().with_class_init(speaker_defaults),
            TypeFlags::NONE,
        )
        .unwrap();
    let loud = rt
        .types()
        .register(
            &unique_name("LoudSpeaker"),
            speaker,
            TypeInfo::new().with_class::<LoudSpeaker>().with_class_init(loud_defaults),
            TypeFlags::NONE,
        )
        .unwrap();
    let robot = rt
        .types()
        .register(
            &unique_name("Robot"),
            builtin::INSTANCE,
            TypeInfo::new()
                .with_class::<RobotClass>()
                .with_instance::<Robot>()
                .with_class_init(robot_class_init)
                .with_interface(speaker, offset_of!(RobotClass, speaker)),
            TypeFlags::NONE,
        )
        .unwrap();
    let siren = rt
        .types()
        .register(
            &unique_name("Siren"),
            builtin::INSTANCE,
            TypeInfo::new()
                .with_class::<SirenClass>()
                .with_interface(loud, offset_of!(SirenClass, speaker)),
            TypeFlags::NONE,
        )
        .unwrap();
    Fixture {
        speaker,
        loud,
        robot,
        siren,
    }
}

/// Test that the interface block sits at its offset inside the class
#[test]
fn test_block_address_is_class_plus_offset() {
    let rt = runtime();
    let fx = register(&rt);
    let mut storage = instance::create(&rt, fx.robot).unwrap();
    storage.fields_mut::<Robot>().unwrap().serial = 5;
    let inst = storage.instance().unwrap();

    let iface = query_interface(inst, fx.speaker).unwrap();
    let block = iface.as_ptr().as_ptr() as usize;
    let class = inst.class_ptr().as_ptr() as usize;
    assert_eq!(block - iface.class_offset(), class);
    assert_eq!(iface.class_offset(), offset_of!(RobotClass, speaker));
    assert_eq!(iface.outer_class(), inst.class_ptr());
    assert_eq!(iface.interface_type(), fx.speaker);

    // Calls receive the instance, not the block.
    let speak = iface.dispatch(|vt: &Speaker| vt.speak).unwrap();
    assert_eq!(speak(iface.instance()), "beep 5");
}

/// Test that cleared slots fall back to the interface defaults
#[test]
fn test_override_and_default() {
    let rt = runtime();
    let fx = register(&rt);
    let storage = instance::create(&rt, fx.robot).unwrap();
    let inst = storage.instance().unwrap();
    let iface = query_interface(inst, fx.speaker).unwrap();

    assert!(iface.vtable::<Speaker>().unwrap().volume.is_none());
    let volume = iface.dispatch(|vt: &Speaker| vt.volume).unwrap();
    assert_eq!(volume(inst), 1);

    let defaults = iface.defaults::<Speaker>().unwrap();
    assert_eq!((defaults.speak.unwrap())(inst), "...");
    assert_eq!(inst.class_as::<RobotClass>().unwrap().model, 9);
}

/// Test that subclasses inherit their parent's interface block
#[test]
fn test_implementation_inherited() {
    let rt = runtime();
    let fx = register(&rt);
    let polite = rt
        .types()
        .register(
            &unique_name("PoliteRobot"),
            fx.robot,
            TypeInfo::new()
                .with_class_init(polite_class_init)
                .with_class_data(Arc::new(fx.speaker)),
            TypeFlags::NONE,
        )
        .unwrap();
    assert!(rt.types().implements(polite, fx.speaker));
    assert!(rt.types().check(polite, fx.speaker));

    let storage = instance::create(&rt, polite).unwrap();
    let inst = storage.instance().unwrap();
    assert!(instance::check(Some(inst), fx.speaker));

    let iface = query_interface(inst, fx.speaker).unwrap();
    let speak = iface.dispatch(|vt: &Speaker| vt.speak).unwrap();
    assert_eq!(speak(inst), "good day");

    // The parent class keeps its own override.
    let robot = instance::create(&rt, fx.robot).unwrap();
    let robot_iface = query_interface(robot.instance().unwrap(), fx.speaker).unwrap();
    let speak = robot_iface.dispatch(|vt: &Speaker| vt.speak).unwrap();
    assert_eq!(speak(robot.instance().unwrap()), "beep 0");
}

/// Test that an embedded derived interface answers for its base
#[test]
fn test_derived_interface_matches_base() {
    let rt = runtime();
    let fx = register(&rt);
    let storage = instance::create(&rt, fx.siren).unwrap();
    let inst = storage.instance().unwrap();

    let as_base = query_interface(inst, fx.speaker).unwrap();
    let as_loud = query_interface(inst, fx.loud).unwrap();
    assert_eq!(as_base.as_ptr(), as_loud.as_ptr());
    assert_eq!(as_base.interface_type(), fx.loud);

    let loud = as_loud.vtable::<LoudSpeaker>().unwrap();
    assert_eq!((loud.shout.unwrap())(inst), "WEE-OO");
    assert_eq!((loud.base.volume.unwrap())(inst), 11);
    assert_eq!((loud.base.speak.unwrap())(inst), "...");
}

/// Test lookups that must fail
#[test]
fn test_missing_interface() {
    let rt = runtime();
    let fx = register(&rt);
    let storage = instance::create(&rt, fx.robot).unwrap();
    let inst = storage.instance().unwrap();

    // A robot embeds the base interface, not the derived one.
    assert!(matches!(
        query_interface(inst, fx.loud),
        Err(Error::Unimplemented { .. })
    ));
    assert!(try_query_interface(inst, fx.loud).is_none());
    assert!(!instance::check(Some(inst), fx.loud));
}

/// Test that every embedding class holds the interface's default class
#[test]
fn test_default_class_reference_counting() {
    let rt = runtime();
    let fx = register(&rt);
    assert_eq!(rt.types().class_ref_count(fx.speaker), 0);

    let robot = ClassRef::acquire(&rt, fx.robot).unwrap();
    assert_eq!(rt.types().class_ref_count(fx.speaker), 1);

    let siren = ClassRef::acquire(&rt, fx.siren).unwrap();
    // The loud speaker default class holds its parent's.
    assert_eq!(rt.types().class_ref_count(fx.loud), 1);
    assert_eq!(rt.types().class_ref_count(fx.speaker), 2);

    drop(robot);
    drop(siren);
    assert_eq!(rt.types().class_ref_count(fx.speaker), 0);
    assert_eq!(rt.types().class_ref_count(fx.loud), 0);
}

/// Test registration checks on interface embedding
#[test]
fn test_bad_embeddings_rejected() {
    let rt = runtime();
    let fx = register(&rt);

    // Offset inside the class header.
    let result = rt.types().register(
        &unique_name("Overlapping"),
        builtin::INSTANCE,
        TypeInfo::new().with_class::<RobotClass>().with_interface(fx.speaker, 0),
        TypeFlags::NONE,
    );
    assert!(matches!(result, Err(Error::InvalidTypeInfo { .. })));

    // Implemented twice along the chain.
    let result = rt.types().register(
        &unique_name("Twice"),
        fx.robot,
        TypeInfo::new()
            .with_class::<RobotClass>()
            .with_interface(fx.speaker, offset_of!(RobotClass, speaker)),
        TypeFlags::NONE,
    );
    assert!(matches!(result, Err(Error::InvalidTypeInfo { .. })));

    // Not an interface.
    let result = rt.types().register(
        &unique_name("NotAnInterface"),
        builtin::INSTANCE,
        TypeInfo::new()
            .with_class::<RobotClass>()
            .with_interface(fx.robot, offset_of!(RobotClass, speaker)),
        TypeFlags::NONE,
    );
    assert!(matches!(result, Err(Error::InvalidTypeInfo { .. })));
}
