//! Opaque types.
//!
//! An opaque type stores a user address in a variant and manages it through
//! the hooks of its [`OpaqueVTable`]: copying a variant calls `copy`,
//! destructing it calls `free`. The hooks decide whether that means a deep
//! copy or a reference count. The null address is never handed to them.
//!
//! [`OpaqueVTable::boxed`] gives `Box<T>` value semantics for any
//! `T: Clone`.

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassRef, ClassSlice, ClassStruct};
use crate::runtime::primitives;
use crate::runtime::types::{ClassData, TypeFlags, TypeId, TypeInfo, TypeNode, builtin};
use crate::runtime::variant::{OpFlags, Value, VariantOps};
use std::cmp::Ordering;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

/// Produces an address the caller owns from a live one.
pub type OpaqueCopyFn = unsafe fn(usize) -> Result<usize>;
/// Releases an address produced by the type.
pub type OpaqueFreeFn = unsafe fn(usize) -> Result<()>;
/// Orders the values behind two live addresses.
pub type OpaqueCompareFn = unsafe fn(usize, usize) -> Ordering;

/// Lifetime hooks of an opaque type.
#[derive(Clone, Copy)]
pub struct OpaqueVTable {
    pub copy: OpaqueCopyFn,
    pub free: OpaqueFreeFn,
    /// Without it, values order by address.
    pub compare: Option<OpaqueCompareFn>,
}

unsafe fn copy_boxed<T: Clone>(addr: usize) -> Result<usize> {
    // SAFETY: the caller passes an address made by `box_value::<T>`.
    let value = unsafe { &*std::ptr::with_exposed_provenance::<T>(addr) };
    Ok(Box::into_raw(Box::new(value.clone())).expose_provenance())
}

unsafe fn free_boxed<T>(addr: usize) -> Result<()> {
    // SAFETY: as in `copy_boxed`; the address is not used again.
    drop(unsafe { Box::from_raw(std::ptr::with_exposed_provenance_mut::<T>(addr)) });
    Ok(())
}

unsafe fn compare_boxed<T: Ord>(a: usize, b: usize) -> Ordering {
    // SAFETY: as in `copy_boxed`.
    let (a, b) = unsafe {
        (
            &*std::ptr::with_exposed_provenance::<T>(a),
            &*std::ptr::with_exposed_provenance::<T>(b),
        )
    };
    a.cmp(b)
}

impl OpaqueVTable {
    /// Hooks for addresses made by [`box_value::<T>`]: copies clone the
    /// box, frees drop it.
    #[must_use]
    pub fn boxed<T: Clone + Send + Sync + 'static>() -> Self {
        OpaqueVTable {
            copy: copy_boxed::<T>,
            free: free_boxed::<T>,
            compare: None,
        }
    }

    /// Like [`OpaqueVTable::boxed`], ordering values with `T`'s `Ord`.
    #[must_use]
    pub fn boxed_ord<T: Clone + Ord + Send + Sync + 'static>() -> Self {
        OpaqueVTable {
            compare: Some(compare_boxed::<T>),
            ..Self::boxed::<T>()
        }
    }
}

impl fmt::Debug for OpaqueVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueVTable")
            .field("compare", &self.compare.is_some())
            .finish_non_exhaustive()
    }
}

/// Moves `value` to the heap as a value for a [`OpaqueVTable::boxed`] type.
/// The box leaks unless a variant of such a type takes it.
#[must_use]
pub fn box_value<T>(value: T) -> Value {
    Value::Opaque(Box::into_raw(Box::new(value)).expose_provenance())
}

/// Borrows the `T` behind an opaque value made by [`box_value`].
///
/// # Safety
///
/// A non-null address in `value` must come from [`box_value::<T>`] (or a
/// copy of one) and still be owned by a live variant.
#[must_use]
pub unsafe fn boxed_ref<T>(value: &Value) -> Option<&T> {
    match value {
        Value::Opaque(addr) if *addr != 0 => {
            // SAFETY: guaranteed by the caller.
            Some(unsafe { &*std::ptr::with_exposed_provenance::<T>(*addr) })
        }
        _ => None,
    }
}

/// Class of every opaque type.
///
/// The abstract [`builtin::OPAQUE`] class has no hooks.
#[repr(C)]
pub struct OpaqueClass {
    base: Class,
    vtable: *const OpaqueVTable,
}

// SAFETY: starts with `Class`; a null vtable is valid.
unsafe impl ClassStruct for OpaqueClass {}

impl OpaqueClass {
    #[must_use]
    pub fn vtable(&self) -> Option<&OpaqueVTable> {
        // SAFETY: points into the type's class data, kept alive by the node
        // the class header holds.
        unsafe { self.vtable.as_ref() }
    }

    /// Copies `addr` through the type's hook. Null copies to null.
    ///
    /// # Errors
    ///
    /// [`Error::Unimplemented`] on the abstract root, or the hook's error.
    ///
    /// # Safety
    ///
    /// A non-null `addr` must be one the type's hooks accept.
    pub unsafe fn copy(&self, addr: usize) -> Result<usize> {
        let vtable = self.require_vtable("copy")?;
        if addr == 0 {
            return Ok(0);
        }
        // SAFETY: guaranteed by the caller.
        unsafe { (vtable.copy)(addr) }
    }

    /// Frees `addr` through the type's hook. Null is ignored.
    ///
    /// # Errors
    ///
    /// Same as [`OpaqueClass::copy`].
    ///
    /// # Safety
    ///
    /// As for [`OpaqueClass::copy`]; `addr` must not be used afterwards.
    pub unsafe fn free(&self, addr: usize) -> Result<()> {
        let vtable = self.require_vtable("free")?;
        if addr == 0 {
            return Ok(());
        }
        // SAFETY: guaranteed by the caller.
        unsafe { (vtable.free)(addr) }
    }

    fn require_vtable(&self, operation: &'static str) -> Result<&OpaqueVTable> {
        match self.vtable() {
            Some(vtable) => Ok(vtable),
            None => fail(Error::Unimplemented {
                type_name: self.base.type_name().to_string(),
                operation,
            }),
        }
    }
}

impl fmt::Debug for OpaqueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueClass")
            .field("type", &self.base.type_name())
            .field("vtable", &self.vtable())
            .finish()
    }
}

fn class_init(slice: &mut ClassSlice<'_>, data: Option<&ClassData>) -> Result<()> {
    let Some(vtable) = data.and_then(|d| d.downcast_ref::<OpaqueVTable>()) else {
        return fail(Error::InvalidType {
            context: format!("{} has no opaque vtable", slice.class_type()),
        });
    };
    slice.get_mut::<OpaqueClass>()?.vtable = std::ptr::from_ref(vtable);
    Ok(())
}

/// Acquires the class of opaque type `ty`.
///
/// # Errors
///
/// [`Error::InvalidType`] if `ty` is not an opaque type.
pub fn opaque_class(rt: &Runtime, ty: TypeId) -> Result<ClassRef> {
    if !rt.types().is_a(ty, builtin::OPAQUE) {
        return fail(Error::InvalidType {
            context: format!("{} is not an opaque type", rt.types().describe(ty)),
        });
    }
    ClassRef::acquire(rt, ty)
}

struct OpaqueOps {
    vtable: Arc<OpaqueVTable>,
}

fn opaque_addr(value: &Value) -> Option<usize> {
    match value {
        Value::Opaque(addr) => Some(*addr),
        _ => None,
    }
}

impl OpaqueOps {
    fn stored(node: &TypeNode, value: &Value) -> Result<usize> {
        match opaque_addr(value) {
            Some(addr) => Ok(addr),
            None => fail(Error::InvalidOperation {
                reason: format!("{} holds opaque values only", node.name()),
            }),
        }
    }

    fn copy(&self, addr: usize) -> Result<usize> {
        if addr == 0 {
            return Ok(0);
        }
        // SAFETY: non-null addresses reach a variant only under the
        // contract of `register_opaque`.
        unsafe { (self.vtable.copy)(addr) }
    }
}

impl VariantOps for OpaqueOps {
    fn flags(&self) -> OpFlags {
        OpFlags::CONSTRUCT_ALL
            | OpFlags::SET_ALL
            | OpFlags::GET_ALL
            | OpFlags::COMPARE
            | OpFlags::SAVE
            | OpFlags::RELOCATABLE
    }

    fn default_value(&self, _: &Arc<TypeNode>) -> Result<Value> {
        Ok(Value::Opaque(0))
    }

    fn accept(&self, node: &TypeNode, value: Value) -> Result<Value> {
        match value {
            Value::Opaque(addr) | Value::Pointer(addr) => Ok(Value::Opaque(addr)),
            Value::Nil => Ok(Value::Opaque(0)),
            other => fail(Error::InvalidType {
                context: format!("{} takes addresses, not {}", node.name(), other.kind()),
            }),
        }
    }

    fn accept_copy(&self, node: &TypeNode, value: &Value) -> Result<Value> {
        let borrowed = self.accept(node, value.clone())?;
        Ok(Value::Opaque(self.copy(Self::stored(node, &borrowed)?)?))
    }

    fn duplicate(&self, node: &TypeNode, value: &Value) -> Result<Value> {
        Ok(Value::Opaque(self.copy(Self::stored(node, value)?)?))
    }

    fn destruct(&self, node: &TypeNode, value: Value) -> Result<()> {
        match Self::stored(node, &value)? {
            0 => Ok(()),
            // SAFETY: as in `copy`; the variant gives the address up here.
            addr => unsafe { (self.vtable.free)(addr) },
        }
    }

    fn compare(&self, node: &TypeNode, a: &Value, b: &Value) -> Result<Ordering> {
        let (x, y) = (Self::stored(node, a)?, Self::stored(node, b)?);
        Ok(match self.vtable.compare {
            Some(compare) if x != 0 && y != 0 => {
                // SAFETY: as in `copy`.
                unsafe { compare(x, y) }
            }
            _ => x.cmp(&y),
        })
    }

    fn save(&self, node: &TypeNode, value: &Value, out: &mut String) -> Result<()> {
        let addr = Self::stored(node, value)?;
        write!(out, "{addr:#x}").map_err(|_| {
            crate::error::record(Error::InvalidOperation {
                reason: "formatting failed".to_string(),
            })
        })
    }
}

fn register_converters(rt: &Runtime, ty: TypeId) -> Result<()> {
    let variants = rt.variants();

    variants.register_converter(ty, builtin::BOOL, |_, src, dst| match opaque_addr(src.peek()?) {
        Some(addr) => dst.set_value_move(Value::Bool(addr != 0)),
        None => primitives::conversion_failed(src, dst),
    })?;
    // The pointer borrows the address; the opaque variant keeps owning it.
    variants.register_converter(ty, builtin::POINTER, |_, src, dst| match opaque_addr(src.peek()?) {
        Some(addr) => dst.set_value_move(Value::Pointer(addr)),
        None => primitives::conversion_failed(src, dst),
    })?;
    variants.register_converter(ty, builtin::STRING, |_, src, dst| {
        let mut text = String::new();
        src.save(&mut text)?;
        dst.set_value_move(Value::String(text))
    })?;
    // Copies through the hooks, so the pointer's owner keeps its value.
    variants.register_converter(builtin::POINTER, ty, |_, src, dst| match src.peek()? {
        Value::Pointer(addr) => dst.set_value_copy(&Value::Pointer(*addr)),
        _ => primitives::conversion_failed(src, dst),
    })
}

/// Registers an opaque type named `name` managed by `vtable`.
///
/// # Errors
///
/// Any error of [`TypeRegistry::register`](crate::runtime::types::TypeRegistry::register).
///
/// # Safety
///
/// The hooks run on every non-null address stored in or copied out of a
/// variant of the new type, including addresses that arrive as
/// [`Value::Pointer`]. The caller must make sure only addresses the hooks
/// accept reach such variants.
pub unsafe fn register_opaque(rt: &Runtime, name: &str, vtable: OpaqueVTable) -> Result<TypeId> {
    let vtable = Arc::new(vtable);
    let info = TypeInfo::new()
        .with_class_init(class_init)
        .with_class_data(Arc::clone(&vtable) as Arc<ClassData>);
    let ty = rt.types().register(name, builtin::OPAQUE, info, TypeFlags::NONE)?;

    let support = rt
        .variants()
        .register_ops(ty, Arc::new(OpaqueOps { vtable }))
        .and_then(|()| register_converters(rt, ty));
    if let Err(err) = support {
        if let Err(cleanup) = rt.unregister(ty) {
            oxmeta_log::warn!("rolling back opaque {}: {}", name, cleanup);
        }
        return Err(err);
    }
    oxmeta_log::debug!("registered opaque {}", name);
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::variant::Variant;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Default)]
    struct Counts {
        clones: AtomicUsize,
        drops: AtomicUsize,
    }

    struct Tracked {
        label: &'static str,
        counts: Arc<Counts>,
    }

    impl Clone for Tracked {
        fn clone(&self) -> Self {
            self.counts.clones.fetch_add(1, AtomicOrdering::SeqCst);
            Tracked {
                label: self.label,
                counts: Arc::clone(&self.counts),
            }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.counts.drops.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn tracked(label: &'static str) -> (Value, Arc<Counts>) {
        let counts = Arc::new(Counts::default());
        let value = box_value(Tracked {
            label,
            counts: Arc::clone(&counts),
        });
        (value, counts)
    }

    fn register_tracked(rt: &Runtime) -> TypeId {
        // SAFETY: every address stored below comes from `box_value::<Tracked>`.
        unsafe { register_opaque(rt, "Tracked", OpaqueVTable::boxed::<Tracked>()) }.unwrap()
    }

    fn label(variant: &Variant) -> &'static str {
        // SAFETY: the variant owns a `Tracked` box.
        unsafe { boxed_ref::<Tracked>(variant.peek().unwrap()) }.unwrap().label
    }

    #[test]
    fn test_move_takes_ownership() {
        let rt = Runtime::new().unwrap();
        let ty = register_tracked(&rt);
        let (value, counts) = tracked("moved");

        let v = Variant::construct_value_move(&rt, ty, value).unwrap();
        assert_eq!(label(&v), "moved");
        assert_eq!(counts.clones.load(AtomicOrdering::SeqCst), 0);
        drop(v);
        assert_eq!(counts.drops.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_copies_go_through_the_hooks() {
        let rt = Runtime::new().unwrap();
        let ty = register_tracked(&rt);
        let (value, counts) = tracked("copied");

        let original = Variant::construct_value_move(&rt, ty, value).unwrap();
        let copy = Variant::construct_copy(&original).unwrap();
        assert_ne!(copy.peek().unwrap(), original.peek().unwrap());
        assert_eq!(label(&copy), "copied");

        let borrowed = original.peek().unwrap().clone();
        let mut assigned = Variant::construct_default(&rt, ty).unwrap();
        assigned.set_value_copy(&borrowed).unwrap();
        assert_eq!(counts.clones.load(AtomicOrdering::SeqCst), 2);

        drop((original, copy, assigned));
        assert_eq!(counts.drops.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn test_null_skips_the_hooks() {
        let rt = Runtime::new().unwrap();
        let ty = register_tracked(&rt);

        let null = Variant::construct_default(&rt, ty).unwrap();
        assert_eq!(null.peek().unwrap(), &Value::Opaque(0));
        let copy = Variant::construct_copy(&null).unwrap();
        assert!(copy.equals(&null));
        assert_eq!(null.convert_to(&rt, builtin::BOOL).unwrap().peek().unwrap(), &Value::Bool(false));
        assert!(matches!(
            Variant::construct_value_move(&rt, ty, Value::U32(1)),
            Err(Error::InvalidType { .. })
        ));
    }

    #[test]
    fn test_compare_uses_the_vtable() {
        let rt = Runtime::new().unwrap();
        // SAFETY: every address stored below comes from `box_value::<String>`.
        let ty = unsafe { register_opaque(&rt, "Name", OpaqueVTable::boxed_ord::<String>()) }.unwrap();

        let a = Variant::construct_value_move(&rt, ty, box_value("alpha".to_string())).unwrap();
        let b = Variant::construct_value_move(&rt, ty, box_value("beta".to_string())).unwrap();
        let a2 = Variant::construct_copy(&a).unwrap();
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert!(a.equals(&a2));

        let class = opaque_class(&rt, ty).unwrap();
        assert!(class.get::<OpaqueClass>().unwrap().vtable().unwrap().compare.is_some());
    }

    #[test]
    fn test_root_class() {
        let rt = Runtime::new().unwrap();
        let class = opaque_class(&rt, builtin::OPAQUE).unwrap();
        let root = class.get::<OpaqueClass>().unwrap();
        assert!(root.vtable().is_none());
        // SAFETY: the root has no hooks to run.
        assert!(matches!(unsafe { root.copy(0) }, Err(Error::Unimplemented { .. })));
        assert!(matches!(opaque_class(&rt, builtin::POINTER), Err(Error::InvalidType { .. })));
    }
}
