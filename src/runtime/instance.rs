//! Instance construction, destruction and casting.
//!
//! An instance is one allocation holding the private blocks of every level
//! below the instance pointer and the public fields above it:
//!
//! ```text
//! base                       instance pointer
//! |                          |
//! v                          v
//! +-----------+--------------+----------------+------------------+
//! | padding   | leaf private | root private   | Instance header  |
//! |           | (offset -48) | (offset -16)   | public fields... |
//! +-----------+--------------+----------------+------------------+
//! ```
//!
//! Public fields use prefix layout, like classes: a derived instance
//! struct starts with its parent's, so casting never adjusts the pointer.
//!
//! Construction and destruction of one instance are not synchronized; the
//! owner of an [`InstanceStorage`] has exclusive access through `&mut`.

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::class::{self, Class, ClassRef, ClassStruct};
use crate::runtime::types::{PRIVATE_ALIGN, TypeFlags, TypeId, TypeNode};
use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Header at the instance pointer of every instance.
#[repr(C)]
pub struct Instance {
    class: *const Class,
}

impl Instance {
    /// Type of the instance, or [`TypeId::INVALID`] if it is not constructed.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.class().map_or(TypeId::INVALID, Class::type_id)
    }

    /// The instance's class, if constructed.
    #[must_use]
    pub fn class(&self) -> Option<&Class> {
        // SAFETY: a non-null header points at the class this instance holds
        // a reference to.
        unsafe { self.class.as_ref() }
    }
}

/// Marker for `#[repr(C)]` public instance structs.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, start with their parent's instance
/// struct (ultimately [`Instance`]), and accept the all-zero bit pattern.
/// Their `Drop` never runs; release owned resources in `instance_final`.
pub unsafe trait InstanceStruct: Sized + 'static {}

// SAFETY: a single nullable pointer.
unsafe impl InstanceStruct for Instance {}

/// Marker for private instance blocks.
///
/// # Safety
///
/// Implementors must accept the all-zero bit pattern, need at most
/// [`PRIVATE_ALIGN`] alignment, and not rely on `Drop`.
pub unsafe trait PrivateStruct: Sized + 'static {}

/// Borrowed handle to a constructed instance.
///
/// The lifetime ties the handle to the storage or box that owns the
/// instance, so the handle cannot outlive it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstancePtr<'a> {
    ptr: NonNull<Instance>,
    _owner: PhantomData<&'a Instance>,
}

// SAFETY: the handle only reads the class header and hands out shared
// references; the class is immutable and reference counted atomically.
unsafe impl Send for InstancePtr<'_> {}
unsafe impl Sync for InstancePtr<'_> {}

impl<'a> InstancePtr<'a> {
    /// Wraps a raw instance pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a constructed instance that stays alive and
    /// constructed for `'a`.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<Instance>) -> Self {
        InstancePtr {
            ptr,
            _owner: PhantomData,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> NonNull<Instance> {
        self.ptr
    }

    /// Class pointer stored in the header.
    #[must_use]
    pub fn class_ptr(self) -> NonNull<Class> {
        // SAFETY: constructed instances always hold a class.
        unsafe { NonNull::new_unchecked(self.ptr.as_ref().class.cast_mut()) }
    }

    /// The class of the instance.
    #[must_use]
    pub fn class(self) -> &'a Class {
        // SAFETY: the class outlives every instance holding a reference.
        unsafe { self.class_ptr().as_ref() }
    }

    /// A new owning reference to the instance's class.
    #[must_use]
    pub fn class_ref(self) -> ClassRef {
        // SAFETY: the instance keeps its class alive for the call.
        unsafe { ClassRef::retain_raw(self.class_ptr()) }
    }

    /// Reads the class as `C`, `None` if the class is smaller than `C`.
    #[must_use]
    pub fn class_as<C: ClassStruct>(self) -> Option<&'a C> {
        class::view(self.class_ptr())
    }

    #[must_use]
    pub fn type_id(self) -> TypeId {
        self.class().type_id()
    }

    #[must_use]
    pub fn type_name(self) -> &'static str {
        self.class().type_name()
    }

    pub(crate) fn node(self) -> &'a TypeNode {
        self.class().node()
    }

    /// Reads the public fields as `T`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if the instance is smaller than `T`.
    pub fn fields<T: InstanceStruct>(self) -> Result<&'a T> {
        let node = self.node();
        check_public::<T>(node, node)?;
        // SAFETY: checked against the constructed layout; shared access only.
        Ok(unsafe { self.ptr.cast::<T>().as_ref() })
    }

    /// Reads the private block that level `ty` registered.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if the instance is not a `ty`, the level has
    /// no private block, or the block is smaller than `P`.
    pub fn private<P: PrivateStruct>(self, ty: TypeId) -> Result<&'a P> {
        let block = private(self, ty)?;
        let level = level_node(self.node(), ty)?;
        check_private::<P>(level)?;
        // SAFETY: checked above; shared access only.
        Ok(unsafe { block.cast::<P>().as_ref() })
    }
}

impl fmt::Debug for InstancePtr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePtr")
            .field("ptr", &self.ptr)
            .field("type", &self.type_name())
            .finish()
    }
}

fn check_public<T>(owner: &TypeNode, level: &TypeNode) -> Result<()> {
    if size_of::<T>() > level.instance_size || align_of::<T>() > level.instance_align {
        return fail(Error::InvalidType {
            context: format!(
                "{} does not fit the {} instance of {}",
                std::any::type_name::<T>(),
                level.name(),
                owner.name()
            ),
        });
    }
    Ok(())
}

fn check_private<P>(level: &TypeNode) -> Result<()> {
    if size_of::<P>() > level.info().instance_private_size || align_of::<P>() > PRIVATE_ALIGN {
        return fail(Error::InvalidType {
            context: format!(
                "{} does not fit the private block of {}",
                std::any::type_name::<P>(),
                level.name()
            ),
        });
    }
    Ok(())
}

fn level_node(node: &TypeNode, ty: TypeId) -> Result<&TypeNode> {
    let mut current = Some(node);
    while let Some(level) = current {
        if level.id == ty {
            return Ok(level);
        }
        current = level.parent.as_deref();
    }
    fail(Error::InvalidType {
        context: format!("{} is not a {ty}", node.name()),
    })
}

/// The view of an instance handed to `instance_init` and `instance_final`.
pub struct InstanceLevel<'a> {
    instance: NonNull<Instance>,
    owner: &'a TypeNode,
    level: &'a TypeNode,
}

impl InstanceLevel<'_> {
    /// Concrete type of the instance.
    #[must_use]
    pub fn instance_type(&self) -> TypeId {
        self.owner.id
    }

    /// Level whose callback is running.
    #[must_use]
    pub fn level(&self) -> TypeId {
        self.level.id
    }

    #[must_use]
    pub fn instance(&self) -> InstancePtr<'_> {
        // SAFETY: the class header is set before any level runs and the
        // borrow ends with the callback.
        unsafe { InstancePtr::from_raw(self.instance) }
    }

    /// Reads the public fields as this level's struct `T`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if this level's instance is smaller than `T`.
    pub fn fields<T: InstanceStruct>(&self) -> Result<&T> {
        check_public::<T>(self.owner, self.level)?;
        // SAFETY: checked against this level's layout.
        Ok(unsafe { self.instance.cast::<T>().as_ref() })
    }

    /// Writes the public fields as this level's struct `T`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if this level's instance is smaller than `T`.
    pub fn fields_mut<T: InstanceStruct>(&mut self) -> Result<&mut T> {
        check_public::<T>(self.owner, self.level)?;
        // SAFETY: checked against this level's layout; construction has
        // exclusive access to the storage.
        Ok(unsafe { self.instance.cast::<T>().as_mut() })
    }

    /// Writes this level's private block as `P`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if this level declared no private block or
    /// the block is smaller than `P`.
    pub fn private_mut<P: PrivateStruct>(&mut self) -> Result<&mut P> {
        if self.level.private_size == 0 {
            return fail(Error::InvalidType {
                context: format!("{} has no private data", self.level.name()),
            });
        }
        check_private::<P>(self.level)?;
        // SAFETY: the block lies inside the allocation, below the instance
        // pointer, 16-byte aligned.
        Ok(unsafe {
            self.instance
                .cast::<u8>()
                .offset(self.level.private_offset)
                .cast::<P>()
                .as_mut()
        })
    }
}

/// Storage for one instance of a fixed type.
///
/// Owns a zeroed allocation sized for the type's public and private data.
/// The instance is constructed and destructed explicitly; dropping
/// constructed storage destructs it first.
///
/// # Example
///
/// ```rust
/// use oxmeta::{InstanceStorage, Runtime, TypeFlags, TypeInfo, builtin};
///
/// let rt = Runtime::new().unwrap();
/// let point = rt
///     .types()
///     .register("Point", builtin::INSTANCE, TypeInfo::new(), TypeFlags::NONE)
///     .unwrap();
///
/// let mut storage = InstanceStorage::new(&rt, point).unwrap();
/// storage.construct().unwrap();
/// assert_eq!(storage.instance().unwrap().type_id(), point);
/// storage.destruct().unwrap();
/// assert!(storage.as_bytes().iter().all(|b| *b == 0));
/// ```
pub struct InstanceStorage {
    base: NonNull<u8>,
    layout: Layout,
    prefix: usize,
    node: Arc<TypeNode>,
}

// SAFETY: the storage owns its allocation exclusively.
unsafe impl Send for InstanceStorage {}
unsafe impl Sync for InstanceStorage {}

fn storage_layout(node: &TypeNode) -> Result<(Layout, usize)> {
    let align = if node.private_total > 0 {
        node.instance_align.max(PRIVATE_ALIGN)
    } else {
        node.instance_align
    };
    let prefix = node.private_total.div_ceil(align) * align;
    match Layout::from_size_align(prefix + node.instance_size, align) {
        Ok(layout) => Ok((layout, prefix)),
        Err(_) => fail(Error::InvalidTypeInfo {
            name: node.name().to_string(),
            reason: "instance layout overflows".to_string(),
        }),
    }
}

impl InstanceStorage {
    /// Allocates zeroed storage for an instance of `ty`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if `ty` is unregistered, abstract or not
    /// instantiable.
    pub fn new(rt: &Runtime, ty: TypeId) -> Result<Self> {
        let node = rt.types().node(ty)?;
        Self::for_node(node)
    }

    pub(crate) fn for_node(node: Arc<TypeNode>) -> Result<Self> {
        if !node.flags().contains(TypeFlags::INSTANTIABLE) || node.flags().contains(TypeFlags::ABSTRACT) {
            return fail(Error::InvalidType {
                context: format!("{} cannot be instantiated", node.name()),
            });
        }
        let (layout, prefix) = storage_layout(&node)?;
        // SAFETY: instantiable types are at least one header in size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Ok(InstanceStorage {
            base,
            layout,
            prefix,
            node,
        })
    }

    /// Type the storage was sized for.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.node.id
    }

    fn header(&self) -> NonNull<Instance> {
        // SAFETY: prefix is inside the allocation.
        unsafe { self.base.add(self.prefix) }.cast()
    }

    #[must_use]
    pub fn is_constructed(&self) -> bool {
        // SAFETY: the header is always inside the allocation.
        !unsafe { self.header().as_ref() }.class.is_null()
    }

    /// Handle to the instance, `None` before construction.
    #[must_use]
    pub fn instance(&self) -> Option<InstancePtr<'_>> {
        // SAFETY: constructed, and borrowed from `self`.
        self.is_constructed()
            .then(|| unsafe { InstancePtr::from_raw(self.header()) })
    }

    /// The whole allocation, private blocks included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the allocation is initialized (zeroed, then written
        // through typed views of plain data).
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.layout.size()) }
    }

    /// Writes the public fields as `T`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if the instance is smaller than `T`.
    pub fn fields_mut<T: InstanceStruct>(&mut self) -> Result<&mut T> {
        check_public::<T>(&self.node, &self.node)?;
        // SAFETY: checked; `&mut self` is exclusive.
        Ok(unsafe { self.header().cast::<T>().as_mut() })
    }

    /// Writes the private block of level `ty` as `P`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if `ty` is not an ancestor level with a
    /// private block large enough for `P`.
    pub fn private_mut<P: PrivateStruct>(&mut self, ty: TypeId) -> Result<&mut P> {
        let level = level_node(&self.node, ty)?;
        if level.private_size == 0 {
            return fail(Error::InvalidType {
                context: format!("{} has no private data", level.name()),
            });
        }
        check_private::<P>(level)?;
        // SAFETY: the block is inside the allocation; `&mut self` is exclusive.
        Ok(unsafe { self.header().cast::<u8>().offset(level.private_offset).cast::<P>().as_mut() })
    }

    /// Constructs the instance: takes a class reference, then runs
    /// `instance_init` from the root level down.
    ///
    /// If a level fails, the levels that completed are finalized leaf to
    /// root, the class is released and the storage is zeroed again.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOperation`] if already constructed
    /// - Any error from acquiring the class or from an `instance_init`
    pub fn construct(&mut self) -> Result<()> {
        if self.is_constructed() {
            return fail(Error::InvalidOperation {
                reason: format!("{} instance is already constructed", self.node.name()),
            });
        }

        let class = ClassRef::acquire_node(&self.node)?;
        let instance = self.header();
        // SAFETY: exclusive access; the header is in bounds.
        unsafe { (*instance.as_ptr()).class = class.into_raw().as_ptr() };

        let node = Arc::clone(&self.node);
        let chain = node.chain();
        for (done, level) in chain.iter().enumerate() {
            let Some(init) = level.info().instance_init else {
                continue;
            };
            let mut view = InstanceLevel {
                instance,
                owner: &node,
                level,
            };
            if let Err(err) = init(&mut view) {
                oxmeta_log::debug!("{} instance_init failed: {}", level.name(), err);
                let _ = finalize_levels(instance, &node, &chain[..done]);
                self.release_and_zero();
                return Err(err);
            }
        }

        node.instances.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Destructs the instance: runs `instance_final` from the leaf level up,
    /// releases the class and zeroes the storage.
    ///
    /// Every level is finalized even if one fails; the first failure is
    /// returned.
    ///
    /// # Errors
    ///
    /// The first error returned by an `instance_final`.
    ///
    /// # Panics
    ///
    /// Panics if the storage is not constructed (never constructed, or
    /// destructed twice).
    pub fn destruct(&mut self) -> Result<()> {
        assert!(
            self.is_constructed(),
            "destructing a {} instance that is not constructed",
            self.node.name()
        );

        let node = Arc::clone(&self.node);
        let result = finalize_levels(self.header(), &node, &node.chain());
        self.node.instances.fetch_sub(1, Ordering::AcqRel);
        self.release_and_zero();
        result
    }

    /// Destructs the instance and frees the storage.
    ///
    /// # Errors
    ///
    /// Same as [`InstanceStorage::destruct`]; the storage is freed anyway.
    pub fn destroy(mut self) -> Result<()> {
        if self.is_constructed() { self.destruct() } else { Ok(()) }
    }

    fn release_and_zero(&mut self) {
        let instance = self.header();
        // SAFETY: the header holds the class reference taken in `construct`.
        let class = unsafe {
            let raw = (*instance.as_ptr()).class;
            (*instance.as_ptr()).class = std::ptr::null();
            NonNull::new(raw.cast_mut())
        };
        // SAFETY: exclusive access to the whole allocation.
        unsafe { std::ptr::write_bytes(self.base.as_ptr(), 0, self.layout.size()) };
        if let Some(class) = class {
            // SAFETY: the reference was leaked into the header by `construct`.
            drop(unsafe { ClassRef::from_raw(class) });
        }
    }

    /// Gives up the storage, returning the instance pointer.
    ///
    /// Only constructed storage can be turned into a raw pointer, because
    /// [`InstanceStorage::from_raw`] recovers the layout from the class.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOperation`] if the storage is not constructed.
    pub fn into_raw(self) -> Result<NonNull<Instance>> {
        if !self.is_constructed() {
            return fail(Error::InvalidOperation {
                reason: format!("{} storage is not constructed", self.node.name()),
            });
        }
        let this = ManuallyDrop::new(self);
        let ptr = this.header();
        // SAFETY: the node Arc is dropped exactly once here; the class keeps
        // another count alive.
        drop(unsafe { std::ptr::read(&this.node) });
        Ok(ptr)
    }

    /// Takes back storage given up with [`InstanceStorage::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw`, still be constructed, and not have
    /// been reclaimed before.
    pub unsafe fn from_raw(ptr: NonNull<Instance>) -> Self {
        // SAFETY: caller guarantees a constructed instance.
        let node = unsafe { InstancePtr::from_raw(ptr) }.class().node_arc();
        // Registered layouts are immutable, so this matches the allocation.
        let (layout, prefix) = storage_layout(&node)
            .unwrap_or_else(|err| panic!("instance layout of {} changed: {err}", node.name()));
        InstanceStorage {
            // SAFETY: the instance sits `prefix` bytes into its allocation.
            base: unsafe { ptr.cast::<u8>().sub(prefix) },
            layout,
            prefix,
            node,
        }
    }
}

fn finalize_levels(instance: NonNull<Instance>, owner: &TypeNode, levels: &[&TypeNode]) -> Result<()> {
    let mut first = Ok(());
    for level in levels.iter().rev() {
        let Some(fini) = level.info().instance_final else {
            continue;
        };
        let mut view = InstanceLevel {
            instance,
            owner,
            level,
        };
        if let Err(err) = fini(&mut view) {
            oxmeta_log::debug!("{} instance_final failed: {}", level.name(), err);
            if first.is_ok() {
                first = Err(err);
            }
        }
    }
    first
}

impl Drop for InstanceStorage {
    fn drop(&mut self) {
        if self.is_constructed()
            && let Err(err) = self.destruct()
        {
            oxmeta_log::warn!("dropping {} instance: {}", self.node.name(), err);
        }
        // SAFETY: allocated in `for_node` with this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for InstanceStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStorage")
            .field("type", &self.node.name())
            .field("size", &self.layout.size())
            .field("constructed", &self.is_constructed())
            .finish()
    }
}

/// Allocates and constructs an instance of `ty` on the heap.
///
/// # Errors
///
/// Same as [`InstanceStorage::new`] and [`InstanceStorage::construct`].
pub fn create(rt: &Runtime, ty: TypeId) -> Result<InstanceStorage> {
    let mut storage = InstanceStorage::new(rt, ty)?;
    storage.construct()?;
    Ok(storage)
}

/// True if `instance` is a `ty` or implements it.
///
/// A missing instance passes every check.
#[must_use]
pub fn check(instance: Option<InstancePtr<'_>>, ty: TypeId) -> bool {
    instance.is_none_or(|inst| inst.node().check(ty))
}

/// Returns `instance` unchanged if it is a `ty`.
///
/// # Errors
///
/// [`Error::InvalidType`] if the check fails.
pub fn cast(instance: InstancePtr<'_>, ty: TypeId) -> Result<InstancePtr<'_>> {
    if instance.node().check(ty) {
        Ok(instance)
    } else {
        fail(Error::InvalidType {
            context: format!("cannot cast {} to {ty}", instance.type_name()),
        })
    }
}

/// Like [`cast`], but returns `None` instead of failing.
#[must_use]
pub fn try_cast(instance: InstancePtr<'_>, ty: TypeId) -> Option<InstancePtr<'_>> {
    instance.node().check(ty).then_some(instance)
}

/// Address of the private block registered by level `ty`.
///
/// # Errors
///
/// [`Error::InvalidType`] if the instance is not a `ty` or that level
/// declared no private data.
pub fn private(instance: InstancePtr<'_>, ty: TypeId) -> Result<NonNull<u8>> {
    let level = level_node(instance.node(), ty)?;
    if level.private_size == 0 {
        return fail(Error::InvalidType {
            context: format!("{} has no private data", level.name()),
        });
    }
    // SAFETY: the block lies inside the instance's allocation.
    Ok(unsafe { instance.as_raw().cast::<u8>().offset(level.private_offset) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::{TypeInfo, builtin};
    use std::cell::RefCell;

    thread_local! {
        static EVENTS: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    }

    fn log_event(event: &'static str) {
        EVENTS.with(|events| events.borrow_mut().push(event));
    }

    fn take_events() -> Vec<&'static str> {
        EVENTS.with(|events| std::mem::take(&mut *events.borrow_mut()))
    }

    #[repr(C)]
    struct Widget {
        base: Instance,
        width: u32,
        height: u32,
    }

    unsafe impl InstanceStruct for Widget {}

    #[repr(C)]
    struct Button {
        base: Widget,
        clicks: u64,
    }

    unsafe impl InstanceStruct for Button {}

    #[derive(Debug)]
    struct WidgetPrivate {
        serial: u64,
    }

    unsafe impl PrivateStruct for WidgetPrivate {}

    struct ButtonPrivate {
        pressed: bool,
        label: [u8; 24],
    }

    unsafe impl PrivateStruct for ButtonPrivate {}

    fn widget_init(level: &mut InstanceLevel<'_>) -> Result<()> {
        log_event("init widget");
        let widget = level.fields_mut::<Widget>()?;
        widget.width = 10;
        widget.height = 20;
        level.private_mut::<WidgetPrivate>()?.serial = 99;
        Ok(())
    }

    fn widget_final(_: &mut InstanceLevel<'_>) -> Result<()> {
        log_event("final widget");
        Ok(())
    }

    fn button_init(level: &mut InstanceLevel<'_>) -> Result<()> {
        // The widget level ran first.
        assert_eq!(level.fields::<Widget>()?.width, 10);
        log_event("init button");
        level.fields_mut::<Button>()?.clicks = 1;
        level.private_mut::<ButtonPrivate>()?.pressed = true;
        Ok(())
    }

    fn button_final(_: &mut InstanceLevel<'_>) -> Result<()> {
        log_event("final button");
        Ok(())
    }

    fn failing_init(_: &mut InstanceLevel<'_>) -> Result<()> {
        log_event("init broken");
        fail(Error::InvalidOperation {
            reason: "broken".into(),
        })
    }

    fn register(rt: &Runtime) -> (TypeId, TypeId) {
        let widget = rt
            .types()
            .register(
                "Widget",
                builtin::INSTANCE,
                TypeInfo::new()
                    .with_instance::<Widget>()
                    .with_private::<WidgetPrivate>()
                    .with_instance_init(widget_init)
                    .with_instance_final(widget_final),
                TypeFlags::NONE,
            )
            .unwrap();
        let button = rt
            .types()
            .register(
                "Button",
                widget,
                TypeInfo::new()
                    .with_instance::<Button>()
                    .with_private::<ButtonPrivate>()
                    .with_instance_init(button_init)
                    .with_instance_final(button_final),
                TypeFlags::NONE,
            )
            .unwrap();
        (widget, button)
    }

    #[test]
    fn test_construct_runs_levels_in_order() {
        let rt = Runtime::new().unwrap();
        let (widget, button) = register(&rt);
        take_events();

        let mut storage = InstanceStorage::new(&rt, button).unwrap();
        storage.construct().unwrap();
        assert_eq!(take_events(), vec!["init widget", "init button"]);
        assert_eq!(rt.types().instance_count(button), 1);
        assert_eq!(rt.types().class_ref_count(button), 1);

        let inst = storage.instance().unwrap();
        assert_eq!(inst.type_id(), button);
        let fields = inst.fields::<Button>().unwrap();
        assert_eq!((fields.base.width, fields.base.height, fields.clicks), (10, 20, 1));
        assert_eq!(inst.private::<WidgetPrivate>(widget).unwrap().serial, 99);
        assert!(inst.private::<ButtonPrivate>(button).unwrap().pressed);

        storage.destruct().unwrap();
        assert_eq!(take_events(), vec!["final button", "final widget"]);
        assert_eq!(rt.types().instance_count(button), 0);
        assert_eq!(rt.types().class_ref_count(button), 0);
    }

    #[test]
    fn test_destruct_restores_zeroed_storage() {
        let rt = Runtime::new().unwrap();
        let (_, button) = register(&rt);
        let mut storage = InstanceStorage::new(&rt, button).unwrap();
        let before = storage.as_bytes().to_vec();
        assert!(before.iter().all(|b| *b == 0));

        storage.construct().unwrap();
        assert_ne!(storage.as_bytes(), &before[..]);
        storage.destruct().unwrap();
        assert_eq!(storage.as_bytes(), &before[..]);
        assert!(!storage.is_constructed());
    }

    #[test]
    fn test_private_blocks_are_aligned() {
        let rt = Runtime::new().unwrap();
        let (widget, button) = register(&rt);
        let storage = create(&rt, button).unwrap();
        let inst = storage.instance().unwrap();

        let widget_block = private(inst, widget).unwrap();
        let button_block = private(inst, button).unwrap();
        assert_eq!(widget_block.as_ptr() as usize % PRIVATE_ALIGN, 0);
        assert_eq!(button_block.as_ptr() as usize % PRIVATE_ALIGN, 0);
        assert!(button_block < widget_block);
        assert!((widget_block.as_ptr() as usize) < inst.as_raw().as_ptr() as usize);

        assert!(matches!(private(inst, builtin::INSTANCE), Err(Error::InvalidType { .. })));
    }

    #[test]
    fn test_check_cast_and_null_instance() {
        let rt = Runtime::new().unwrap();
        let (widget, button) = register(&rt);
        let storage = create(&rt, widget).unwrap();
        let inst = storage.instance().unwrap();

        assert!(check(Some(inst), widget));
        assert!(check(Some(inst), builtin::INSTANCE));
        assert!(!check(Some(inst), button));
        assert!(check(None, button));
        assert!(check(None, TypeId::INVALID));

        assert_eq!(cast(inst, builtin::INSTANCE).unwrap(), inst);
        assert!(matches!(cast(inst, button), Err(Error::InvalidType { .. })));
        assert_eq!(try_cast(inst, button), None);
        assert!(inst.fields::<Button>().is_err());
    }

    #[test]
    fn test_failed_construct_unwinds_completed_levels() {
        let rt = Runtime::new().unwrap();
        let (widget, _) = register(&rt);
        let broken = rt
            .types()
            .register(
                "BrokenWidget",
                widget,
                TypeInfo::new().with_instance_init(failing_init),
                TypeFlags::NONE,
            )
            .unwrap();
        take_events();

        let mut storage = InstanceStorage::new(&rt, broken).unwrap();
        assert!(matches!(storage.construct(), Err(Error::InvalidOperation { .. })));
        assert_eq!(take_events(), vec!["init widget", "init broken", "final widget"]);
        assert!(!storage.is_constructed());
        assert!(storage.as_bytes().iter().all(|b| *b == 0));
        assert_eq!(rt.types().class_ref_count(broken), 0);
        assert_eq!(rt.types().instance_count(broken), 0);
    }

    #[test]
    fn test_abstract_and_uninstantiable_rejected() {
        let rt = Runtime::new().unwrap();
        let shape = rt
            .types()
            .register("AbstractShape", builtin::INSTANCE, TypeInfo::new(), TypeFlags::ABSTRACT)
            .unwrap();
        assert!(matches!(InstanceStorage::new(&rt, shape), Err(Error::InvalidType { .. })));
        assert!(matches!(InstanceStorage::new(&rt, builtin::INTERFACE), Err(Error::InvalidType { .. })));
        assert!(matches!(create(&rt, builtin::U32), Err(Error::InvalidType { .. })));
    }

    #[test]
    #[should_panic(expected = "not constructed")]
    fn test_double_destruct_panics() {
        let rt = Runtime::new().unwrap();
        let mut storage = create(&rt, builtin::INSTANCE).unwrap();
        storage.destruct().unwrap();
        let _ = storage.destruct();
    }

    #[test]
    fn test_raw_roundtrip_and_drop() {
        let rt = Runtime::new().unwrap();
        let (_, button) = register(&rt);
        let raw = create(&rt, button).unwrap().into_raw().unwrap();
        assert_eq!(rt.types().instance_count(button), 1);

        let storage = unsafe { InstanceStorage::from_raw(raw) };
        assert_eq!(storage.type_id(), button);
        take_events();
        drop(storage);
        assert_eq!(take_events(), vec!["final button", "final widget"]);
        assert_eq!(rt.types().instance_count(button), 0);
    }
}
