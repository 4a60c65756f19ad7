//! Class composition and lifecycle.
//!
//! A class is one zeroed, aligned block per type, shared by every instance
//! and every subclass level:
//!
//! ```text
//! +---------------------+  offset 0
//! | Class header        |  type pointer
//! | root level fields   |
//! | ...                 |
//! | leaf level fields   |
//! | interface blocks    |  at the offsets recorded in each level's map
//! +---------------------+  class_size
//! ```
//!
//! A descendant's class always starts with its ancestor's full class, so a
//! class pointer can be read as any ancestor's class struct without
//! adjustment.
//!
//! # Lifecycle
//!
//! The first [`ClassRef::acquire`] for a type allocates the block, takes a
//! reference on the parent class, constructs each embedded interface from
//! its defaults, and runs `class_init` from the root level down to the
//! type itself. Releasing the last reference runs `class_final` from the
//! leaf back up, tears the interfaces down, drops the parent reference and
//! frees the block. Creation and teardown are serialized by the registry's
//! lifecycle lock; plain reference counting is atomic.

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::types::{TypeFlags, TypeId, TypeNode};
use std::alloc::{self, Layout};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Header at offset 0 of every class block.
#[repr(C)]
pub struct Class {
    /// Type whose class this is. Holds one strong count on the node.
    meta: *const TypeNode,
}

impl Class {
    /// The type this class belongs to.
    #[must_use]
    pub fn node(&self) -> &TypeNode {
        // SAFETY: the header is written before a block is published and
        // keeps a strong count on the node until the block is freed.
        unsafe { &*self.meta }
    }

    /// A new strong handle on the class's type node.
    pub(crate) fn node_arc(&self) -> Arc<TypeNode> {
        // SAFETY: `meta` came from `Arc::into_raw` and its count is still held.
        unsafe {
            Arc::increment_strong_count(self.meta);
            Arc::from_raw(self.meta)
        }
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.node().id
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.node().name()
    }

    /// True if this class belongs to `ty` or a type derived from it.
    #[must_use]
    pub fn is_a(&self, ty: TypeId) -> bool {
        self.node().is_a(ty)
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class").field("type", &self.type_name()).finish()
    }
}

/// Header of an interface block.
///
/// Embedded in an implementing class, `outer_offset` is the negative
/// distance back to the start of that class. In an interface's own default
/// class it is `0`.
#[repr(C)]
pub struct Interface {
    base: Class,
    outer_offset: isize,
}

impl Interface {
    /// The class header of this block; its type is the interface type.
    #[must_use]
    pub fn class(&self) -> &Class {
        &self.base
    }

    #[must_use]
    pub fn outer_offset(&self) -> isize {
        self.outer_offset
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("type", &self.base.type_name())
            .field("outer_offset", &self.outer_offset)
            .finish()
    }
}

/// Marker for `#[repr(C)]` structs laid out over a class block.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, start with their parent's class
/// struct (ultimately [`Class`], or [`Interface`] for interface types),
/// accept the all-zero bit pattern as a valid value, and not rely on
/// `Drop`: class blocks are freed without running destructors. Virtual
/// functions are `Option<fn(..)>` so that an unset slot is `None`.
pub unsafe trait ClassStruct: Sized + 'static {}

// SAFETY: a single raw pointer; null is a valid bit pattern.
unsafe impl ClassStruct for Class {}
// SAFETY: starts with `Class`, followed by an integer.
unsafe impl ClassStruct for Interface {}

fn check_fit<C: ClassStruct>(block: NonNull<u8>, size: usize, ty: &TypeNode) -> Result<()> {
    if size_of::<C>() > size {
        return fail(Error::InvalidType {
            context: format!(
                "{} class block is {size} bytes, {} needs {}",
                ty.name(),
                std::any::type_name::<C>(),
                size_of::<C>()
            ),
        });
    }
    if block.as_ptr().align_offset(align_of::<C>()) != 0 {
        return fail(Error::InvalidPointer);
    }
    Ok(())
}

/// The part of a class block a `class_init` or `class_final` callback works on.
///
/// For a class this is the whole block of the type being built; for an
/// embedded interface it is just the interface block.
pub struct ClassSlice<'a> {
    block: NonNull<u8>,
    size: usize,
    owner: &'a TypeNode,
    level: &'a TypeNode,
}

impl ClassSlice<'_> {
    /// Type the block belongs to (the concrete type, or the interface).
    #[must_use]
    pub fn class_type(&self) -> TypeId {
        self.owner.id
    }

    /// Level whose callback is running.
    #[must_use]
    pub fn level(&self) -> TypeId {
        self.level.id
    }

    /// Reads the block as `C`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if the block is smaller than `C`.
    pub fn get<C: ClassStruct>(&self) -> Result<&C> {
        check_fit::<C>(self.block, self.size, self.owner)?;
        // SAFETY: size and alignment checked; the block is zero-initialized
        // and `C` accepts zeroes; `&self` keeps writers out.
        Ok(unsafe { self.block.cast::<C>().as_ref() })
    }

    /// Writes the block as `C`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if the block is smaller than `C`.
    pub fn get_mut<C: ClassStruct>(&mut self) -> Result<&mut C> {
        check_fit::<C>(self.block, self.size, self.owner)?;
        // SAFETY: as in `get`; `&mut self` makes the borrow exclusive and
        // the block is not published while callbacks run.
        Ok(unsafe { self.block.cast::<C>().as_mut() })
    }

    /// Writes the embedded block of `iface` as `I`, e.g. to override
    /// interface defaults from a class init.
    ///
    /// # Errors
    ///
    /// - [`Error::Unimplemented`] if the class does not embed `iface`
    /// - [`Error::InvalidType`] if the interface block is smaller than `I`
    pub fn interface_mut<I: ClassStruct>(&mut self, iface: TypeId) -> Result<&mut I> {
        let Some((node, offset)) = self.owner.find_interface(iface) else {
            return fail(Error::Unimplemented {
                type_name: self.owner.name().to_string(),
                operation: "interface",
            });
        };
        // SAFETY: offsets were bounds-checked against the class size at
        // registration.
        let at = unsafe { self.block.add(offset) };
        check_fit::<I>(at, node.class_size, node)?;
        // SAFETY: checked above; exclusive through `&mut self`.
        Ok(unsafe { at.cast::<I>().as_mut() })
    }
}

/// Reads a published class block as `C`, if it is large enough.
pub(crate) fn view<'a, C: ClassStruct>(class: NonNull<Class>) -> Option<&'a C> {
    // SAFETY: a published class is live while the caller holds a reference
    // or an instance of it.
    let node = unsafe { class.as_ref() }.node();
    check_fit::<C>(class.cast(), node.class_size, node).ok()?;
    // SAFETY: checked above; published classes are never written again.
    Some(unsafe { class.cast::<C>().as_ref() })
}

/// Finds the block of `iface` inside a published class.
pub(crate) fn interface_block(class: NonNull<Class>, iface: TypeId) -> Option<NonNull<Interface>> {
    // SAFETY: see `view`.
    let node = unsafe { class.as_ref() }.node();
    let (_, offset) = node.find_interface(iface)?;
    // SAFETY: offset is inside the block.
    Some(unsafe { class.cast::<u8>().add(offset) }.cast())
}

/// Owning reference to a shared class.
///
/// Cloning adds a reference, dropping releases one. The last release
/// destroys the class.
pub struct ClassRef {
    ptr: NonNull<Class>,
}

// SAFETY: class blocks are immutable once published and the count is atomic.
unsafe impl Send for ClassRef {}
unsafe impl Sync for ClassRef {}

impl ClassRef {
    /// Returns the class of `ty`, creating it on first use.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if `ty` is unregistered or has no class
    /// - Any error returned by a `class_init` callback, after the partially
    ///   built class has been torn down again
    ///
    /// # Example
    ///
    /// ```rust
    /// use oxmeta::{ClassRef, Runtime, builtin};
    ///
    /// let rt = Runtime::new().unwrap();
    /// let a = ClassRef::acquire(&rt, builtin::BOX).unwrap();
    /// let b = ClassRef::acquire(&rt, builtin::BOX).unwrap();
    /// assert_eq!(a.as_ptr(), b.as_ptr());
    /// assert_eq!(a.ref_count(), 2);
    /// ```
    pub fn acquire(rt: &Runtime, ty: TypeId) -> Result<ClassRef> {
        let node = rt.types().node(ty)?;
        Self::acquire_node(&node)
    }

    pub(crate) fn acquire_node(node: &Arc<TypeNode>) -> Result<ClassRef> {
        node.acquire_class().map(|ptr| ClassRef { ptr })
    }

    /// Takes an extra reference on an already-live class.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a published class that stays alive for the call.
    pub(crate) unsafe fn retain_raw(ptr: NonNull<Class>) -> ClassRef {
        // SAFETY: caller guarantees the class is alive.
        retain(unsafe { ptr.as_ref() }.node());
        ClassRef { ptr }
    }

    #[must_use]
    pub fn as_ptr(&self) -> NonNull<Class> {
        self.ptr
    }

    /// Current number of references to this class.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.node().class_ref_count()
    }

    /// Reads the class as `C`. `None` if the class is smaller than `C`.
    #[must_use]
    pub fn get<C: ClassStruct>(&self) -> Option<&C> {
        view(self.ptr)
    }

    /// The embedded block of `iface`, if the class implements it.
    #[must_use]
    pub fn interface(&self, iface: TypeId) -> Option<&Interface> {
        // SAFETY: blocks live as long as the class.
        interface_block(self.ptr, iface).map(|block| unsafe { block.as_ref() })
    }

    /// Reads the embedded block of `iface` as `I`.
    #[must_use]
    pub fn interface_vtable<I: ClassStruct>(&self, iface: TypeId) -> Option<&I> {
        view(interface_block(self.ptr, iface)?.cast())
    }

    /// Gives up ownership without releasing the reference.
    #[must_use]
    pub fn into_raw(self) -> NonNull<Class> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// Takes back a reference given up with [`ClassRef::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` and not have been reclaimed before.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<Class>) -> ClassRef {
        ClassRef { ptr }
    }
}

impl Deref for ClassRef {
    type Target = Class;

    fn deref(&self) -> &Class {
        // SAFETY: we hold a reference, so the block is alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for ClassRef {
    fn clone(&self) -> Self {
        retain(self.node());
        ClassRef { ptr: self.ptr }
    }
}

impl Drop for ClassRef {
    fn drop(&mut self) {
        let node = self.node() as *const TypeNode;
        // SAFETY: the class keeps the node alive until its teardown, which
        // happens inside this call at the earliest.
        unsafe { (*node).release_class() };
    }
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRef")
            .field("type", &self.type_name())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Adds one reference and returns the previous count.
///
/// # Panics
///
/// Panics on overflow. The count is left untouched.
pub(crate) fn count_retain(count: &AtomicU32, owner: &str) -> u32 {
    match count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1)) {
        Ok(old) => old,
        Err(_) => panic!("Reference count overflow in {owner}"),
    }
}

/// Drops one reference and returns the previous count.
///
/// # Panics
///
/// Panics if the count is already zero. The count is left untouched.
pub(crate) fn count_release(count: &AtomicU32, owner: &str) -> u32 {
    match count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
        Ok(old) => old,
        Err(_) => panic!("Reference count underflow in {owner}"),
    }
}

fn retain(node: &TypeNode) {
    count_retain(&node.class_refs, node.name());
}

impl TypeNode {
    /// Returns the class block, creating it if this is the first reference.
    pub(crate) fn acquire_class(self: &Arc<Self>) -> Result<NonNull<Class>> {
        if !self.flags().contains(TypeFlags::CLASSED) {
            return fail(Error::InvalidType {
                context: format!("{} has no class", self.name()),
            });
        }

        let _lifecycle = self.lifecycle.lock();
        if let Some(ptr) = NonNull::new(self.class.load(Ordering::Acquire)) {
            retain(self);
            return Ok(ptr);
        }

        let ptr = compose(self)?;
        self.class_refs.store(1, Ordering::Release);
        self.class.store(ptr.as_ptr(), Ordering::Release);
        Ok(ptr)
    }

    /// Drops one class reference and returns how many remain.
    ///
    /// # Panics
    ///
    /// Panics if no reference is outstanding.
    pub(crate) fn release_class(&self) -> u32 {
        let old = count_release(&self.class_refs, self.name());

        if old == 1 {
            // Teardown may drop the last strong count on `self`.
            let lifecycle = Arc::clone(&self.lifecycle);
            let _lifecycle = lifecycle.lock();
            // A racing acquire may have revived the class before we got the lock.
            if self.class_refs.load(Ordering::Acquire) == 0
                && let Some(ptr) = NonNull::new(self.class.swap(std::ptr::null_mut(), Ordering::AcqRel))
            {
                decompose(self, ptr);
            }
        }
        old - 1
    }
}

/// How far construction of a class got.
struct Progress {
    parent: bool,
    levels: usize,
    interfaces: usize,
}

fn class_layout(node: &TypeNode) -> Layout {
    // Sizes and alignments were validated at registration.
    Layout::from_size_align(node.class_size, node.class_align)
        .unwrap_or_else(|_| panic!("invalid class layout for {}", node.name()))
}

fn compose(node: &Arc<TypeNode>) -> Result<NonNull<Class>> {
    let layout = class_layout(node);
    // SAFETY: classed types always have a non-zero class size.
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    let Some(block) = NonNull::new(raw) else {
        alloc::handle_alloc_error(layout);
    };

    // SAFETY: the block is large and aligned enough for the header.
    unsafe {
        block.cast::<Class>().as_ptr().write(Class {
            meta: Arc::into_raw(Arc::clone(node)),
        });
    }

    let mut progress = Progress {
        parent: false,
        levels: 0,
        interfaces: 0,
    };
    match build(node, block, &mut progress) {
        Ok(()) => {
            oxmeta_log::trace!("created class of {} ({} bytes)", node.name(), node.class_size);
            Ok(block.cast())
        }
        Err(err) => {
            oxmeta_log::debug!("class of {} failed to build: {}", node.name(), err);
            teardown(node, block, &progress);
            Err(err)
        }
    }
}

fn build(node: &TypeNode, block: NonNull<u8>, progress: &mut Progress) -> Result<()> {
    if let Some(parent) = &node.parent {
        parent.acquire_class()?;
        progress.parent = true;
    }

    for level in node.chain() {
        for (iface, offset) in &level.interfaces {
            construct_interface(block, iface, *offset)?;
            progress.interfaces += 1;
        }
        if let Some(init) = level.info().class_init {
            let mut slice = ClassSlice {
                block,
                size: node.class_size,
                owner: node,
                level,
            };
            init(&mut slice, level.info().class_data.as_deref())?;
        }
        progress.levels += 1;
    }
    Ok(())
}

fn decompose(node: &TypeNode, class: NonNull<Class>) {
    let chain_len = node.depth() + 1;
    let interfaces = node.chain().iter().map(|level| level.interfaces.len()).sum();
    oxmeta_log::trace!("destroying class of {}", node.name());
    teardown(
        node,
        class.cast(),
        &Progress {
            parent: node.parent.is_some(),
            levels: chain_len,
            interfaces,
        },
    );
}

fn teardown(node: &TypeNode, block: NonNull<u8>, progress: &Progress) {
    let chain = node.chain();
    let mut iface_index: usize = chain.iter().map(|level| level.interfaces.len()).sum();

    for (depth, level) in chain.iter().enumerate().rev() {
        if depth < progress.levels
            && let Some(fini) = level.info().class_final
        {
            let mut slice = ClassSlice {
                block,
                size: node.class_size,
                owner: node,
                level,
            };
            if let Err(err) = fini(&mut slice, level.info().class_data.as_deref()) {
                oxmeta_log::warn!("class_final of {} failed: {}", level.name(), err);
            }
        }
        for (iface, offset) in level.interfaces.iter().rev() {
            iface_index -= 1;
            if iface_index < progress.interfaces {
                // SAFETY: offset is inside the block and the interface was constructed.
                let at = unsafe { block.add(*offset) };
                finalize_interface(at, iface, iface.depth() + 1);
            }
        }
    }

    if progress.parent
        && let Some(parent) = &node.parent
    {
        parent.release_class();
    }

    // `node` may not outlive the header's count.
    let layout = class_layout(node);
    // SAFETY: the header was written by `compose` and this is its only release.
    unsafe {
        let meta = block.cast::<Class>().as_ref().meta;
        alloc::dealloc(block.as_ptr(), layout);
        drop(Arc::from_raw(meta));
    }
}

fn construct_interface(block: NonNull<u8>, iface: &Arc<TypeNode>, offset: usize) -> Result<()> {
    iface.acquire_class()?;

    // SAFETY: offset and size were validated against the class layout.
    let at = unsafe { block.add(offset) };
    // SAFETY: the interface block is large and aligned enough for its header.
    unsafe {
        at.cast::<Interface>().as_ptr().write(Interface {
            base: Class {
                meta: Arc::into_raw(Arc::clone(iface)),
            },
            outer_offset: -(offset as isize),
        });
    }

    let mut done = 0;
    for level in iface.chain() {
        if let Some(init) = level.info().class_init {
            let mut slice = ClassSlice {
                block: at,
                size: iface.class_size,
                owner: iface,
                level,
            };
            if let Err(err) = init(&mut slice, level.info().class_data.as_deref()) {
                finalize_interface(at, iface, done);
                return Err(err);
            }
        }
        done += 1;
    }
    Ok(())
}

/// Runs `class_final` over the first `levels` levels of an embedded
/// interface (leaf first), then releases what `construct_interface` took.
fn finalize_interface(at: NonNull<u8>, iface: &TypeNode, levels: usize) {
    for level in iface.chain().into_iter().take(levels).rev() {
        if let Some(fini) = level.info().class_final {
            let mut slice = ClassSlice {
                block: at,
                size: iface.class_size,
                owner: iface,
                level,
            };
            if let Err(err) = fini(&mut slice, level.info().class_data.as_deref()) {
                oxmeta_log::warn!("class_final of interface {} failed: {}", level.name(), err);
            }
        }
    }

    // SAFETY: the header was written by `construct_interface`.
    unsafe { drop(Arc::from_raw(at.cast::<Interface>().as_ref().base.meta)) };
    iface.release_class();
}
