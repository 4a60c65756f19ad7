//! Reference-counted heap instances.
//!
//! Every type derived from [`builtin::BOX`] starts its instance with a
//! [`BoxInstance`]: an atomic reference count and a lazily allocated table
//! of extension fields. Instances are created on the heap with a count of
//! one; the release that brings the count to zero calls the class's
//! `destructor`, which by default destructs the instance and frees it.
//!
//! [`BoxRef`] is the owning handle. The raw [`add_ref`] and [`unref`]
//! functions exist for code that keeps boxes behind plain pointers.

use crate::error::{Error, Result, fail};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassSlice, ClassStruct, count_release, count_retain};
use crate::runtime::instance::{Instance, InstanceLevel, InstancePtr, InstanceStorage, InstanceStruct};
use crate::runtime::types::{ClassData, TypeId, TypeNode, builtin};
use fxhash::FxHashMap;
use oxmeta_mem::Quark;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

type FieldMap = FxHashMap<Quark, Box<dyn Any + Send + Sync>>;

/// Extension fields attached to one box.
struct FieldTable {
    fields: Mutex<FieldMap>,
}

/// Instance header of every box.
#[repr(C)]
pub struct BoxInstance {
    base: Instance,
    refcount: AtomicU32,
    fields: AtomicPtr<FieldTable>,
}

// SAFETY: starts with `Instance`; atomics and a nullable pointer are valid
// when zeroed.
unsafe impl InstanceStruct for BoxInstance {}

/// Called when the last reference to a box is released.
///
/// # Safety
///
/// The pointer is a constructed box with a count of zero that nothing else
/// will touch again; the function takes ownership of it.
pub type BoxDestructor = unsafe fn(NonNull<BoxInstance>) -> Result<()>;

/// Class of every box type.
#[repr(C)]
pub struct BoxClass {
    base: Class,
    /// Tears the box down once its count reaches zero.
    pub destructor: Option<BoxDestructor>,
}

// SAFETY: starts with `Class`; `None` is all zeroes.
unsafe impl ClassStruct for BoxClass {}

/// Default [`BoxClass::destructor`]: destructs the instance and frees it.
///
/// # Safety
///
/// See [`BoxDestructor`].
pub unsafe fn destroy(ptr: NonNull<BoxInstance>) -> Result<()> {
    // SAFETY: the box was built from `InstanceStorage::into_raw` and the
    // caller hands over ownership.
    unsafe { InstanceStorage::from_raw(ptr.cast()) }.destroy()
}

pub(crate) fn class_init(slice: &mut ClassSlice<'_>, _: Option<&ClassData>) -> Result<()> {
    slice.get_mut::<BoxClass>()?.destructor = Some(destroy);
    Ok(())
}

pub(crate) fn instance_init(level: &mut InstanceLevel<'_>) -> Result<()> {
    level.fields_mut::<BoxInstance>()?.refcount.store(1, Ordering::Release);
    Ok(())
}

pub(crate) fn instance_final(level: &mut InstanceLevel<'_>) -> Result<()> {
    let header = level.fields_mut::<BoxInstance>()?;
    let table = header.fields.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !table.is_null() {
        // SAFETY: allocated by `field_table` and detached above.
        drop(unsafe { Box::from_raw(table) });
    }
    Ok(())
}

/// Adds a reference to a box and returns the same pointer.
///
/// # Safety
///
/// `ptr` must be a live box.
///
/// # Panics
///
/// Panics if the count would overflow.
pub unsafe fn add_ref(ptr: NonNull<BoxInstance>) -> NonNull<BoxInstance> {
    // SAFETY: caller guarantees the box is live.
    let header = unsafe { ptr.as_ref() };
    count_retain(&header.refcount, "box");
    ptr
}

/// Releases a reference and returns the remaining count.
///
/// At zero the class destructor runs and the box must not be used again.
///
/// # Safety
///
/// `ptr` must be a live box on which the caller owns a reference.
///
/// # Panics
///
/// Panics if the count is already zero.
pub unsafe fn unref(ptr: NonNull<BoxInstance>) -> u32 {
    // SAFETY: caller owns a reference, so the box is live.
    let header = unsafe { ptr.as_ref() };
    let old = count_release(&header.refcount, "box");
    if old > 1 {
        return old - 1;
    }

    // SAFETY: the count was positive, so the box is still constructed.
    let instance = unsafe { InstancePtr::from_raw(ptr.cast()) };
    let destructor = instance
        .class_as::<BoxClass>()
        .and_then(|class| class.destructor)
        .unwrap_or(destroy);
    let type_name = instance.type_name();
    // SAFETY: last reference; ownership passes to the destructor.
    if let Err(err) = unsafe { destructor(ptr) } {
        oxmeta_log::warn!("destroying {} box: {}", type_name, err);
    }
    0
}

/// Owning handle to a box.
///
/// `Clone` adds a reference and `Drop` releases one.
pub struct BoxRef {
    ptr: NonNull<BoxInstance>,
}

// SAFETY: the count is atomic, the field table is locked, and everything
// else in a box is read-only once constructed.
unsafe impl Send for BoxRef {}
unsafe impl Sync for BoxRef {}

impl BoxRef {
    /// Creates a box of type `ty` with a count of one.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if `ty` is not a box type or is abstract
    /// - Any error from constructing the instance
    ///
    /// # Example
    ///
    /// ```rust
    /// use oxmeta::{BoxRef, Runtime, builtin};
    ///
    /// let rt = Runtime::new().unwrap();
    /// let a = BoxRef::create(&rt, builtin::BOX).unwrap();
    /// let b = a.clone();
    /// assert_eq!(a.ref_count(), 2);
    /// drop(b);
    /// assert_eq!(a.ref_count(), 1);
    /// ```
    pub fn create(rt: &Runtime, ty: TypeId) -> Result<BoxRef> {
        let node = rt.types().node(ty)?;
        Self::create_node(node)
    }

    pub(crate) fn create_node(node: Arc<TypeNode>) -> Result<BoxRef> {
        if !node.is_a(builtin::BOX) {
            return fail(Error::InvalidType {
                context: format!("{} is not a box type", node.name()),
            });
        }
        let mut storage = InstanceStorage::for_node(node)?;
        storage.construct()?;
        let ptr = storage.into_raw()?.cast();
        Ok(BoxRef { ptr })
    }

    /// Wraps a box whose reference the caller owns.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live box and the caller's reference passes to the
    /// returned handle.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<BoxInstance>) -> BoxRef {
        BoxRef { ptr }
    }

    /// Gives up the handle without releasing its reference.
    #[must_use]
    pub fn into_raw(self) -> NonNull<BoxInstance> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    #[must_use]
    pub fn as_ptr(&self) -> NonNull<BoxInstance> {
        self.ptr
    }

    #[must_use]
    pub fn instance(&self) -> InstancePtr<'_> {
        // SAFETY: our reference keeps the box constructed.
        unsafe { InstancePtr::from_raw(self.ptr.cast()) }
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.instance().type_id()
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.instance().type_name()
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.header().refcount.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same box.
    #[must_use]
    pub fn ptr_eq(a: &BoxRef, b: &BoxRef) -> bool {
        a.ptr == b.ptr
    }

    fn header(&self) -> &BoxInstance {
        // SAFETY: our reference keeps the box alive.
        unsafe { self.ptr.as_ref() }
    }

    fn field_table(&self) -> &FieldTable {
        let slot = &self.header().fields;
        let mut table = slot.load(Ordering::Acquire);
        if table.is_null() {
            let fresh = Box::into_raw(Box::new(FieldTable {
                fields: Mutex::new(FieldMap::default()),
            }));
            match slot.compare_exchange(std::ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => table = fresh,
                Err(existing) => {
                    // SAFETY: never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    table = existing;
                }
            }
        }
        // SAFETY: the table lives until instance_final, which needs the
        // last reference.
        unsafe { &*table }
    }

    fn existing_fields(&self) -> Option<&FieldTable> {
        // SAFETY: as in `field_table`.
        unsafe { self.header().fields.load(Ordering::Acquire).as_ref() }
    }

    /// Attaches `value` under `key`, dropping any previous value.
    pub fn set_field<T: Any + Send + Sync>(&self, key: &str, value: T) {
        let old = self
            .field_table()
            .fields
            .lock()
            .insert(Quark::intern(key), Box::new(value));
        // Dropped outside the lock.
        drop(old);
    }

    /// Returns a copy of the field under `key`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidProperty`] if the field is missing or holds another type.
    pub fn get_field<T: Any + Clone>(&self, key: &str) -> Result<T> {
        self.with_field(key, T::clone)
    }

    /// Calls `f` with the field under `key` while the table is locked.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidProperty`] if the field is missing or holds another type.
    pub fn with_field<T: Any, R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Result<R> {
        let value = Quark::try_get(key).and_then(|quark| {
            let table = self.existing_fields()?;
            let fields = table.fields.lock();
            fields.get(&quark)?.downcast_ref::<T>().map(f)
        });
        match value {
            Some(value) => Ok(value),
            None => fail(Error::InvalidProperty {
                name: key.to_string(),
            }),
        }
    }

    /// Removes the field under `key` and returns it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidProperty`] if the field is missing or holds another
    /// type; a field of another type is left in place.
    pub fn take_field<T: Any>(&self, key: &str) -> Result<T> {
        let taken = Quark::try_get(key).and_then(|quark| {
            let table = self.existing_fields()?;
            let mut fields = table.fields.lock();
            if !fields.get(&quark)?.is::<T>() {
                return None;
            }
            fields.remove(&quark)?.downcast::<T>().ok()
        });
        match taken {
            Some(value) => Ok(*value),
            None => fail(Error::InvalidProperty {
                name: key.to_string(),
            }),
        }
    }

    /// Drops the field under `key`. Returns false if there was none.
    pub fn clear_field(&self, key: &str) -> bool {
        let Some(quark) = Quark::try_get(key) else {
            return false;
        };
        let Some(table) = self.existing_fields() else {
            return false;
        };
        let old = table.fields.lock().remove(&quark);
        old.is_some()
    }

    #[must_use]
    pub fn has_field(&self, key: &str) -> bool {
        Quark::try_get(key)
            .zip(self.existing_fields())
            .is_some_and(|(quark, table)| table.fields.lock().contains_key(&quark))
    }

    #[must_use]
    pub fn field_count(&self) -> usize {
        self.existing_fields().map_or(0, |table| table.fields.lock().len())
    }
}

impl Clone for BoxRef {
    fn clone(&self) -> Self {
        // SAFETY: we own a reference.
        BoxRef {
            ptr: unsafe { add_ref(self.ptr) },
        }
    }
}

impl Drop for BoxRef {
    fn drop(&mut self) {
        // SAFETY: we own a reference and give it up here.
        unsafe { unref(self.ptr) };
    }
}

impl PartialEq for BoxRef {
    fn eq(&self, other: &Self) -> bool {
        BoxRef::ptr_eq(self, other)
    }
}

impl fmt::Debug for BoxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxRef")
            .field("type", &self.type_name())
            .field("refs", &self.ref_count())
            .field("fields", &self.field_count())
            .finish()
    }
}
