//! Interface lookup and dispatch.
//!
//! An interface is a classed, non-instantiable type. A class implements it
//! by embedding an interface-shaped block at a fixed offset; the block is
//! first filled from the interface's own `class_init` chain (its defaults)
//! and may then be overridden by the implementing level's `class_init`.
//!
//! [`query_interface`] finds that block for an instance. Functions read
//! from it are called with the original instance pointer, never an
//! adjusted one.

use crate::error::{Error, Result, fail};
use crate::runtime::class::{self, Class, ClassStruct, Interface};
use crate::runtime::instance::InstancePtr;
use crate::runtime::types::TypeId;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// An instance paired with the interface block its class embeds.
#[derive(Clone, Copy)]
pub struct InterfaceRef<'a> {
    block: NonNull<Interface>,
    instance: InstancePtr<'a>,
}

impl<'a> InterfaceRef<'a> {
    /// The instance the interface was queried on, unadjusted.
    #[must_use]
    pub fn instance(&self) -> InstancePtr<'a> {
        self.instance
    }

    /// Address of the interface block inside the concrete class.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<Interface> {
        self.block
    }

    /// The interface block header.
    #[must_use]
    pub fn interface(&self) -> &'a Interface {
        // SAFETY: the block lives as long as the instance's class.
        unsafe { self.block.as_ref() }
    }

    /// Type of the embedded interface. May derive from the queried one.
    #[must_use]
    pub fn interface_type(&self) -> TypeId {
        self.interface().class().type_id()
    }

    /// Byte offset of the block within the concrete class.
    #[must_use]
    pub fn class_offset(&self) -> usize {
        self.interface().outer_offset().unsigned_abs()
    }

    /// The concrete class that embeds the block.
    #[must_use]
    pub fn outer_class(&self) -> NonNull<Class> {
        // SAFETY: outer_offset leads back to the start of the same block.
        unsafe { self.block.cast::<u8>().offset(self.interface().outer_offset()) }.cast()
    }

    /// Reads the block as the interface struct `I`.
    #[must_use]
    pub fn vtable<I: ClassStruct>(&self) -> Option<&'a I> {
        class::view(self.block.cast())
    }

    /// Reads the interface's default block, as built by its own class init
    /// chain without any overrides.
    #[must_use]
    pub fn defaults<I: ClassStruct>(&self) -> Option<&'a I> {
        let node = self.interface().class().node();
        // The embedded block holds a reference on the default class.
        let class = NonNull::new(node.class.load(Ordering::Acquire))?;
        class::view(class)
    }

    /// Picks a function out of the interface block, falling back to the
    /// interface default when the class cleared the slot.
    ///
    /// # Errors
    ///
    /// [`Error::Unimplemented`] if neither the class nor the interface
    /// provides the slot, or the block is smaller than `I`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let draw = iface.dispatch(|vt: &DrawableIface| vt.draw)?;
    /// draw(iface.instance());
    /// ```
    pub fn dispatch<I: ClassStruct, F>(&self, select: impl Fn(&I) -> Option<F>) -> Result<F> {
        if let Some(f) = self.vtable::<I>().and_then(&select) {
            return Ok(f);
        }
        if let Some(f) = self.defaults::<I>().and_then(&select) {
            return Ok(f);
        }
        fail(Error::Unimplemented {
            type_name: self.instance.type_name().to_string(),
            operation: "interface method",
        })
    }
}

impl fmt::Debug for InterfaceRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceRef")
            .field("interface", &self.interface().class().type_name())
            .field("class_offset", &self.class_offset())
            .field("instance", &self.instance)
            .finish()
    }
}

/// Finds the block of `iface` in the class of `instance`.
///
/// Searches the concrete type's interface map and then each ancestor's. An
/// embedded interface derived from `iface` also matches.
///
/// # Errors
///
/// [`Error::Unimplemented`] if no level of the type implements `iface`.
pub fn query_interface(instance: InstancePtr<'_>, iface: TypeId) -> Result<InterfaceRef<'_>> {
    match class::interface_block(instance.class_ptr(), iface) {
        Some(block) => Ok(InterfaceRef { block, instance }),
        None => fail(Error::Unimplemented {
            type_name: instance.type_name().to_string(),
            operation: "interface",
        }),
    }
}

/// Like [`query_interface`], but returns `None` instead of failing.
#[must_use]
pub fn try_query_interface(instance: InstancePtr<'_>, iface: TypeId) -> Option<InterfaceRef<'_>> {
    class::interface_block(instance.class_ptr(), iface).map(|block| InterfaceRef { block, instance })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::runtime::class::{ClassRef, ClassSlice};
    use crate::runtime::instance::{self, Instance, InstanceStruct};
    use crate::runtime::types::{ClassData, TypeFlags, TypeInfo, builtin};

    #[repr(C)]
    struct Drawable {
        base: Interface,
        draw: Option<fn(InstancePtr<'_>) -> String>,
        layer: Option<fn(InstancePtr<'_>) -> u32>,
    }

    unsafe impl ClassStruct for Drawable {}

    #[repr(C)]
    struct ShapeClass {
        base: Class,
        sides: u32,
        drawable: Drawable,
    }

    unsafe impl ClassStruct for ShapeClass {}

    #[repr(C)]
    struct Shape {
        base: Instance,
        id: u32,
    }

    unsafe impl InstanceStruct for Shape {}

    fn drawable_defaults(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
        let iface = slice.get_mut::<Drawable>()?;
        iface.draw = Some(|_| "default".to_string());
        iface.layer = Some(|_| 0);
        Ok(())
    }

    fn overriding_init(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
        let class = slice.get_mut::<ShapeClass>()?;
        class.sides = 4;
        class.drawable.draw = Some(|inst| format!("square #{}", inst.fields::<Shape>().map_or(0, |s| s.id)));
        class.drawable.layer = None;
        Ok(())
    }

    fn offset_of_drawable() -> usize {
        std::mem::offset_of!(ShapeClass, drawable)
    }

    fn register(rt: &Runtime) -> (TypeId, TypeId) {
        let drawable = rt
            .types()
            .register(
                "Drawable",
                builtin::INTERFACE,
                TypeInfo::new().with_class::<Drawable>().with_class_init(drawable_defaults),
                TypeFlags::NONE,
            )
            .unwrap();
        let square = rt
            .types()
            .register(
                "Square",
                builtin::INSTANCE,
                TypeInfo::new()
                    .with_class::<ShapeClass>()
                    .with_instance::<Shape>()
                    .with_interface(drawable, offset_of_drawable()),
                TypeFlags::NONE,
            )
            .unwrap();
        (drawable, square)
    }

    #[test]
    fn test_query_returns_embedded_block() {
        let rt = Runtime::new().unwrap();
        let (drawable, square) = register(&rt);
        let storage = instance::create(&rt, square).unwrap();
        let inst = storage.instance().unwrap();

        let iface = query_interface(inst, drawable).unwrap();
        assert_eq!(iface.instance(), inst);
        assert_eq!(iface.interface_type(), drawable);
        assert_eq!(iface.class_offset(), offset_of_drawable());
        assert_eq!(iface.outer_class(), inst.class_ptr());
        assert_eq!(
            iface.as_ptr().as_ptr() as usize - offset_of_drawable(),
            inst.class_ptr().as_ptr() as usize
        );
        // Without an override the interface defaults are in place.
        let draw = iface.dispatch(|vt: &Drawable| vt.draw).unwrap();
        assert_eq!(draw(iface.instance()), "default");
    }

    #[test]
    fn test_unimplemented_interface() {
        let rt = Runtime::new().unwrap();
        let (drawable, _) = register(&rt);
        let storage = instance::create(&rt, builtin::INSTANCE).unwrap();
        let inst = storage.instance().unwrap();
        assert!(matches!(
            query_interface(inst, drawable),
            Err(Error::Unimplemented { .. })
        ));
        assert!(try_query_interface(inst, drawable).is_none());
    }

    #[test]
    fn test_interface_holds_default_class() {
        let rt = Runtime::new().unwrap();
        let (drawable, square) = register(&rt);
        let class = ClassRef::acquire(&rt, square).unwrap();
        assert_eq!(rt.types().class_ref_count(drawable), 1);
        assert_eq!(class.get::<ShapeClass>().unwrap().drawable.base.outer_offset(), -(offset_of_drawable() as isize));
        drop(class);
        assert_eq!(rt.types().class_ref_count(drawable), 0);
    }

    #[test]
    fn test_override_and_default_fallback() {
        let rt = Runtime::new().unwrap();
        let (drawable, shape) = register(&rt);
        let overriding = rt
            .types()
            .register(
                "OverridingSquare",
                shape,
                TypeInfo::new().with_class_init(overriding_init),
                TypeFlags::NONE,
            )
            .unwrap();

        let storage = instance::create(&rt, overriding).unwrap();
        let iface = query_interface(storage.instance().unwrap(), drawable).unwrap();
        let draw = iface.dispatch(|vt: &Drawable| vt.draw).unwrap();
        assert_eq!(draw(iface.instance()), "square #0");
        // The cleared slot falls back to the interface default.
        let layer = iface.dispatch(|vt: &Drawable| vt.layer).unwrap();
        assert_eq!(layer(iface.instance()), 0);
        assert!(iface.vtable::<Drawable>().unwrap().layer.is_none());
    }
}
