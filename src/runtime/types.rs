//! Type registry.
//!
//! Every type known to a [`Runtime`](crate::Runtime) has a [`TypeNode`]
//! holding its name, parent, flags, resolved layout and lifecycle counters.
//! Nodes are shared through `Arc`, so a class or instance can reach its type
//! metadata without going back through the registry.
//!
//! # Ids
//!
//! [`TypeId`]s are dense integers. `0` is [`TypeId::INVALID`], the builtin
//! types occupy the fixed ids in [`builtin`], and user types are numbered
//! upward from there. Ids are never reused after unregistration.
//!
//! # Layout
//!
//! Sizes in [`TypeInfo`] are totals, not deltas: a child's class size
//! includes its parent's class bytes. A size of `0` means "same as the
//! parent". Private instance data is laid out below the instance pointer,
//! one 16-byte aligned block per level that declares any.

use crate::error::{Error, Result, fail};
use crate::runtime::class::{Class, ClassSlice, ClassStruct, Interface};
use crate::runtime::instance::{Instance, InstanceLevel, InstanceStruct, PrivateStruct};
use fxhash::FxHashMap;
use oxmeta_mem::Quark;
use parking_lot::{ReentrantMutex, RwLock};
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Alignment of every private instance block.
pub const PRIVATE_ALIGN: usize = 16;

/// Opaque handle to a registered type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TypeId(u32);

impl TypeId {
    /// The id no type ever has.
    pub const INVALID: TypeId = TypeId(0);

    /// Wraps a raw id. The result is only meaningful if it came from [`TypeId::as_u32`].
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        TypeId(raw)
    }

    /// Raw id, usable as a map key or switch discriminant.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns false for [`TypeId::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// Ids of the types every runtime registers on construction.
pub mod builtin {
    use super::TypeId;

    /// Root of all interface types.
    pub const INTERFACE: TypeId = TypeId(1);
    /// Root of all instantiable types.
    pub const INSTANCE: TypeId = TypeId(2);
    /// Interface for keyed access on boxed variants.
    pub const TABLE_VARIANT: TypeId = TypeId(3);
    /// Valueless type.
    pub const NIL: TypeId = TypeId(4);
    pub const BOOL: TypeId = TypeId(5);
    pub const CHAR: TypeId = TypeId(6);
    pub const U8: TypeId = TypeId(7);
    pub const I16: TypeId = TypeId(8);
    pub const U16: TypeId = TypeId(9);
    pub const I32: TypeId = TypeId(10);
    pub const U32: TypeId = TypeId(11);
    pub const I64: TypeId = TypeId(12);
    pub const U64: TypeId = TypeId(13);
    pub const F32: TypeId = TypeId(14);
    pub const F64: TypeId = TypeId(15);
    pub const STRING: TypeId = TypeId(16);
    /// Opaque address.
    pub const POINTER: TypeId = TypeId(17);
    /// A [`TypeId`] as a value.
    pub const TYPE: TypeId = TypeId(18);
    /// Abstract root of registered enums.
    pub const ENUM: TypeId = TypeId(19);
    /// Abstract root of registered flag sets.
    pub const FLAGS: TypeId = TypeId(20);
    /// Reference-counted heap instance.
    pub const BOX: TypeId = TypeId(21);
    /// Abstract root of addresses with copy and free hooks.
    pub const OPAQUE: TypeId = TypeId(22);
    /// Abstract root of named bit fields packed into a `u64`.
    pub const BIT_STRUCT: TypeId = TypeId(23);

    /// Number of builtin ids.
    pub const COUNT: u32 = 23;
}

/// Type flags.
///
/// `CLASSED`, `INSTANTIABLE`, `INTERFACED`, `DERIVABLE` and `DEEP_DERIVABLE`
/// are root flags: they are taken from the fundamental (root) type and
/// ignored on derived registrations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeFlags(u16);

impl TypeFlags {
    pub const NONE: TypeFlags = TypeFlags(0);
    /// Instances cannot be constructed.
    pub const ABSTRACT: TypeFlags = TypeFlags(1 << 0);
    /// The type has a class.
    pub const CLASSED: TypeFlags = TypeFlags(1 << 1);
    /// The type has instances.
    pub const INSTANTIABLE: TypeFlags = TypeFlags(1 << 2);
    /// The type is an interface that classes can embed.
    pub const INTERFACED: TypeFlags = TypeFlags(1 << 3);
    /// The root accepts direct children.
    pub const DERIVABLE: TypeFlags = TypeFlags(1 << 4);
    /// The root accepts descendants at any depth.
    pub const DEEP_DERIVABLE: TypeFlags = TypeFlags(1 << 5);
    /// The type accepts no children.
    pub const FINAL: TypeFlags = TypeFlags(1 << 6);
    /// The type info is borrowed for `'static` instead of copied.
    pub const TYPEINFO_STATIC: TypeFlags = TypeFlags(1 << 7);

    /// Flags inherited from the root type.
    pub const ROOT_MASK: TypeFlags = TypeFlags(
        Self::CLASSED.0
            | Self::INSTANTIABLE.0
            | Self::INTERFACED.0
            | Self::DERIVABLE.0
            | Self::DEEP_DERIVABLE.0,
    );

    const NAMES: [(TypeFlags, &'static str); 8] = [
        (Self::ABSTRACT, "ABSTRACT"),
        (Self::CLASSED, "CLASSED"),
        (Self::INSTANTIABLE, "INSTANTIABLE"),
        (Self::INTERFACED, "INTERFACED"),
        (Self::DERIVABLE, "DERIVABLE"),
        (Self::DEEP_DERIVABLE, "DEEP_DERIVABLE"),
        (Self::FINAL, "FINAL"),
        (Self::TYPEINFO_STATIC, "TYPEINFO_STATIC"),
    ];

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: TypeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set.
    #[must_use]
    pub const fn intersects(self, other: TypeFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// `self` without the bits of `other`.
    #[must_use]
    pub const fn without(self, other: TypeFlags) -> TypeFlags {
        TypeFlags(self.0 & !other.0)
    }
}

impl BitOr for TypeFlags {
    type Output = TypeFlags;

    fn bitor(self, rhs: TypeFlags) -> TypeFlags {
        TypeFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TypeFlags {
    fn bitor_assign(&mut self, rhs: TypeFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TypeFlags {
    type Output = TypeFlags;

    fn bitand(self, rhs: TypeFlags) -> TypeFlags {
        TypeFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for TypeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// Static data handed to class init/final callbacks.
pub type ClassData = dyn Any + Send + Sync;

/// Fills in one level of a class block.
pub type ClassInitFn = fn(&mut ClassSlice<'_>, Option<&ClassData>) -> Result<()>;

/// Tears down one level of a class block.
pub type ClassFinalFn = fn(&mut ClassSlice<'_>, Option<&ClassData>) -> Result<()>;

/// Initializes one level of an instance.
pub type InstanceInitFn = fn(&mut InstanceLevel<'_>) -> Result<()>;

/// Finalizes one level of an instance.
pub type InstanceFinalFn = fn(&mut InstanceLevel<'_>) -> Result<()>;

/// An interface embedded in a class at a fixed byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceImpl {
    /// The interface type.
    pub interface: TypeId,
    /// Byte offset of the interface block from the start of the class.
    pub class_offset: usize,
}

/// Layout and callbacks of a type, supplied at registration.
#[derive(Clone, Default)]
pub struct TypeInfo {
    pub class_init: Option<ClassInitFn>,
    pub class_final: Option<ClassFinalFn>,
    /// Total class size, `0` to reuse the parent's.
    pub class_size: usize,
    /// Class alignment, `0` to reuse the parent's.
    pub class_align: usize,
    pub class_data: Option<Arc<ClassData>>,
    /// Interfaces introduced at this level.
    pub interfaces: Cow<'static, [InterfaceImpl]>,
    pub instance_init: Option<InstanceInitFn>,
    pub instance_final: Option<InstanceFinalFn>,
    /// Total public instance size, `0` to reuse the parent's.
    pub instance_size: usize,
    /// Public instance alignment, `0` to reuse the parent's.
    pub instance_align: usize,
    /// Size of the private block this level adds.
    pub instance_private_size: usize,
    /// Alignment the private block needs, at most [`PRIVATE_ALIGN`].
    pub instance_private_align: usize,
}

impl TypeInfo {
    /// Empty info: everything inherited from the parent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the class layout from `C`.
    #[must_use]
    pub fn with_class<C: ClassStruct>(mut self) -> Self {
        self.class_size = size_of::<C>();
        self.class_align = align_of::<C>();
        self
    }

    /// Sets the public instance layout from `I`.
    #[must_use]
    pub fn with_instance<I: InstanceStruct>(mut self) -> Self {
        self.instance_size = size_of::<I>();
        self.instance_align = align_of::<I>();
        self
    }

    /// Adds a private block shaped like `P` at this level.
    #[must_use]
    pub fn with_private<P: PrivateStruct>(mut self) -> Self {
        self.instance_private_size = size_of::<P>();
        self.instance_private_align = align_of::<P>();
        self
    }

    #[must_use]
    pub fn with_class_init(mut self, init: ClassInitFn) -> Self {
        self.class_init = Some(init);
        self
    }

    #[must_use]
    pub fn with_class_final(mut self, fini: ClassFinalFn) -> Self {
        self.class_final = Some(fini);
        self
    }

    #[must_use]
    pub fn with_class_data(mut self, data: Arc<ClassData>) -> Self {
        self.class_data = Some(data);
        self
    }

    #[must_use]
    pub fn with_instance_init(mut self, init: InstanceInitFn) -> Self {
        self.instance_init = Some(init);
        self
    }

    #[must_use]
    pub fn with_instance_final(mut self, fini: InstanceFinalFn) -> Self {
        self.instance_final = Some(fini);
        self
    }

    /// Embeds `interface` at `class_offset` bytes into the class.
    #[must_use]
    pub fn with_interface(mut self, interface: TypeId, class_offset: usize) -> Self {
        self.interfaces.to_mut().push(InterfaceImpl {
            interface,
            class_offset,
        });
        self
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("class_size", &self.class_size)
            .field("class_align", &self.class_align)
            .field("interfaces", &self.interfaces)
            .field("instance_size", &self.instance_size)
            .field("instance_align", &self.instance_align)
            .field("instance_private_size", &self.instance_private_size)
            .finish_non_exhaustive()
    }
}

enum InfoSlot {
    Owned(TypeInfo),
    Static(&'static TypeInfo),
}

impl InfoSlot {
    fn get(&self) -> &TypeInfo {
        match self {
            InfoSlot::Owned(info) => info,
            InfoSlot::Static(info) => info,
        }
    }
}

/// Registered metadata of one type.
pub struct TypeNode {
    pub(crate) id: TypeId,
    name: Quark,
    flags: TypeFlags,
    pub(crate) parent: Option<Arc<TypeNode>>,
    depth: usize,
    info: InfoSlot,
    /// Interfaces introduced at this level, resolved.
    pub(crate) interfaces: Vec<(Arc<TypeNode>, usize)>,
    pub(crate) class_size: usize,
    pub(crate) class_align: usize,
    pub(crate) instance_size: usize,
    pub(crate) instance_align: usize,
    /// Rounded size of this level's private block.
    pub(crate) private_size: usize,
    /// Offset of this level's private block from the instance pointer.
    pub(crate) private_offset: isize,
    /// Bytes of private data below the instance pointer for this type.
    pub(crate) private_total: usize,
    pub(crate) class: AtomicPtr<Class>,
    pub(crate) class_refs: AtomicU32,
    pub(crate) instances: AtomicU32,
    children: AtomicU32,
    pub(crate) lifecycle: Arc<ReentrantMutex<()>>,
}

// SAFETY: the class pointer is only created and destroyed under the shared
// lifecycle mutex and class blocks are immutable once published. Everything
// else is immutable or atomic.
unsafe impl Send for TypeNode {}
unsafe impl Sync for TypeNode {}

impl TypeNode {
    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name.as_str()
    }

    #[must_use]
    pub fn name_quark(&self) -> Quark {
        self.name
    }

    #[must_use]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<TypeNode>> {
        self.parent.as_ref()
    }

    /// Number of ancestors.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn info(&self) -> &TypeInfo {
        self.info.get()
    }

    #[must_use]
    pub fn class_size(&self) -> usize {
        self.class_size
    }

    #[must_use]
    pub fn instance_size(&self) -> usize {
        self.instance_size
    }

    /// Bytes of private data for this type, all levels included.
    #[must_use]
    pub fn instance_private_size(&self) -> usize {
        self.private_total
    }

    /// Outstanding class references.
    #[must_use]
    pub fn class_ref_count(&self) -> u32 {
        self.class_refs.load(Ordering::Acquire)
    }

    /// Live instances of exactly this type.
    #[must_use]
    pub fn instance_count(&self) -> u32 {
        self.instances.load(Ordering::Acquire)
    }

    /// The fundamental type this one ultimately derives from.
    #[must_use]
    pub fn root(&self) -> &TypeNode {
        let mut node = self;
        while let Some(parent) = &node.parent {
            node = parent;
        }
        node
    }

    /// Ancestry from the root down to `self`.
    pub(crate) fn chain(&self) -> Vec<&TypeNode> {
        let mut chain = Vec::with_capacity(self.depth + 1);
        let mut node = Some(self);
        while let Some(current) = node {
            chain.push(current);
            node = current.parent.as_deref();
        }
        chain.reverse();
        chain
    }

    /// True if `base` is `self` or one of its ancestors.
    #[must_use]
    pub fn is_a(&self, base: TypeId) -> bool {
        let mut node = Some(self);
        while let Some(current) = node {
            if current.id == base {
                return true;
            }
            node = current.parent.as_deref();
        }
        false
    }

    /// Finds the block implementing `iface` (or an interface derived from
    /// it) anywhere in the ancestry. Returns the implemented interface and
    /// its class offset.
    pub(crate) fn find_interface(&self, iface: TypeId) -> Option<(&Arc<TypeNode>, usize)> {
        let mut node = Some(self);
        while let Some(current) = node {
            for (implemented, offset) in &current.interfaces {
                if implemented.is_a(iface) {
                    return Some((implemented, *offset));
                }
            }
            node = current.parent.as_deref();
        }
        None
    }

    /// True if the type embeds `iface` or an interface derived from it.
    #[must_use]
    pub fn implements(&self, iface: TypeId) -> bool {
        self.find_interface(iface).is_some()
    }

    /// True if the type derives from or implements `other`.
    #[must_use]
    pub fn check(&self, other: TypeId) -> bool {
        self.is_a(other) || self.implements(other)
    }
}

impl fmt::Debug for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeNode")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("flags", &self.flags)
            .field("depth", &self.depth)
            .field("class_size", &self.class_size)
            .field("instance_size", &self.instance_size)
            .field("private_total", &self.private_total)
            .finish_non_exhaustive()
    }
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

struct Layout {
    class_size: usize,
    class_align: usize,
    instance_size: usize,
    instance_align: usize,
    private_size: usize,
    private_offset: isize,
}

fn invalid_info<T>(name: &str, reason: impl Into<String>) -> Result<T> {
    fail(Error::InvalidTypeInfo {
        name: name.to_string(),
        reason: reason.into(),
    })
}

fn resolve_layout(
    name: &str,
    parent: Option<&TypeNode>,
    info: &TypeInfo,
    flags: TypeFlags,
) -> Result<Layout> {
    for (what, align) in [
        ("class", info.class_align),
        ("instance", info.instance_align),
        ("private", info.instance_private_align),
    ] {
        if align != 0 && !align.is_power_of_two() {
            return invalid_info(name, format!("{what} alignment {align} is not a power of two"));
        }
    }

    let (parent_class_size, parent_class_align) =
        parent.map_or((0, 1), |p| (p.class_size, p.class_align));
    let header = if flags.contains(TypeFlags::INTERFACED) {
        size_of::<Interface>()
    } else if flags.contains(TypeFlags::CLASSED) {
        size_of::<Class>()
    } else {
        0
    };

    let class_size = match info.class_size {
        0 => parent_class_size.max(header),
        size => size,
    };
    if class_size < parent_class_size {
        return invalid_info(
            name,
            format!("class size {class_size} is smaller than the parent's {parent_class_size}"),
        );
    }
    if class_size < header {
        return invalid_info(name, format!("class size {class_size} cannot hold the class header"));
    }
    if class_size > 0 && !flags.contains(TypeFlags::CLASSED) {
        return invalid_info(name, "only classed types can have a class");
    }
    let class_align = info
        .class_align
        .max(parent_class_align)
        .max(if header > 0 { align_of::<Class>() } else { 1 });

    let instantiable = flags.contains(TypeFlags::INSTANTIABLE);
    if !instantiable
        && (info.instance_size != 0
            || info.instance_private_size != 0
            || info.instance_init.is_some()
            || info.instance_final.is_some())
    {
        return invalid_info(name, "only instantiable types can have instance data");
    }

    let (parent_instance_size, parent_instance_align, parent_offset) =
        parent.map_or((0, 1, 0), |p| (p.instance_size, p.instance_align, p.private_offset));
    let (instance_size, instance_align) = if instantiable {
        let size = match info.instance_size {
            0 => parent_instance_size.max(size_of::<Instance>()),
            size => size,
        };
        if size < parent_instance_size.max(size_of::<Instance>()) {
            return invalid_info(
                name,
                format!("instance size {size} is smaller than the parent's {parent_instance_size}"),
            );
        }
        let align = info
            .instance_align
            .max(parent_instance_align)
            .max(align_of::<Instance>());
        (size, align)
    } else {
        (0, 1)
    };

    if info.instance_private_align > PRIVATE_ALIGN {
        return invalid_info(
            name,
            format!("private alignment {} exceeds {PRIVATE_ALIGN}", info.instance_private_align),
        );
    }
    let private_size = round_up(info.instance_private_size, PRIVATE_ALIGN);
    let private_offset = parent_offset - private_size as isize;

    Ok(Layout {
        class_size,
        class_align,
        instance_size,
        instance_align,
        private_size,
        private_offset,
    })
}

struct RegistryInner {
    nodes: Vec<Option<Arc<TypeNode>>>,
    by_name: FxHashMap<Quark, TypeId>,
    builtin_count: usize,
}

/// Name -> [`TypeId`] -> [`TypeNode`] registry.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
    lifecycle: Arc<ReentrantMutex<()>>,
}

impl TypeRegistry {
    /// Creates an empty registry with room for `capacity` types.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity.max(1));
        nodes.push(None);
        TypeRegistry {
            inner: RwLock::new(RegistryInner {
                nodes,
                by_name: FxHashMap::default(),
                builtin_count: 0,
            }),
            lifecycle: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Registers a type and returns its id.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique type name
    /// * `parent` - Parent type, or [`TypeId::INVALID`] for a new root
    /// * `info` - Layout and callbacks
    /// * `flags` - Type flags; root flags only count on roots
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateType`] if the name is taken
    /// - [`Error::InvalidParent`] if the parent is unknown, final, or its
    ///   root does not allow derivation at this depth
    /// - [`Error::InvalidTypeInfo`] if the layout is inconsistent
    ///
    /// # Example
    ///
    /// ```rust
    /// use oxmeta::{Runtime, TypeFlags, TypeInfo, builtin};
    ///
    /// let rt = Runtime::new().unwrap();
    /// let shape = rt
    ///     .types()
    ///     .register("Shape", builtin::INSTANCE, TypeInfo::new(), TypeFlags::ABSTRACT)
    ///     .unwrap();
    /// assert!(rt.types().is_a(shape, builtin::INSTANCE));
    /// ```
    pub fn register(
        &self,
        name: &str,
        parent: TypeId,
        info: TypeInfo,
        flags: TypeFlags,
    ) -> Result<TypeId> {
        self.insert(name, parent, InfoSlot::Owned(info), flags.without(TypeFlags::TYPEINFO_STATIC), false)
    }

    /// Registers a type whose info is borrowed for the life of the process.
    ///
    /// Same checks as [`TypeRegistry::register`]; the resulting type carries
    /// [`TypeFlags::TYPEINFO_STATIC`].
    ///
    /// # Errors
    ///
    /// Same as [`TypeRegistry::register`].
    pub fn register_static(
        &self,
        name: &str,
        parent: TypeId,
        info: &'static TypeInfo,
        flags: TypeFlags,
    ) -> Result<TypeId> {
        self.insert(name, parent, InfoSlot::Static(info), flags | TypeFlags::TYPEINFO_STATIC, false)
    }

    pub(crate) fn register_builtin(
        &self,
        expected: TypeId,
        name: &str,
        parent: TypeId,
        info: TypeInfo,
        flags: TypeFlags,
    ) -> Result<()> {
        let id = self.insert(name, parent, InfoSlot::Owned(info), flags, true)?;
        if id != expected {
            return fail(Error::InvalidOperation {
                reason: format!("builtin {name} registered as {id}, expected {expected}"),
            });
        }
        Ok(())
    }

    fn insert(
        &self,
        name: &str,
        parent: TypeId,
        info: InfoSlot,
        flags: TypeFlags,
        builtin: bool,
    ) -> Result<TypeId> {
        if name.is_empty() {
            return invalid_info(name, "type names cannot be empty");
        }

        let mut inner = self.inner.write();
        let quark = Quark::intern(name);
        if inner.by_name.contains_key(&quark) {
            return fail(Error::DuplicateType {
                name: name.to_string(),
            });
        }

        let parent_node = if parent.is_valid() {
            let Some(node) = inner.nodes.get(parent.index()).and_then(Option::as_ref) else {
                return fail(Error::InvalidParent {
                    name: name.to_string(),
                    reason: "parent type is not registered",
                });
            };
            Some(Arc::clone(node))
        } else {
            None
        };

        let flags = match &parent_node {
            Some(parent) => {
                let root = parent.root();
                if parent.flags.contains(TypeFlags::FINAL) {
                    return fail(Error::InvalidParent {
                        name: name.to_string(),
                        reason: "parent type is final",
                    });
                }
                let allowed = if parent.depth == 0 {
                    root.flags.intersects(TypeFlags::DERIVABLE | TypeFlags::DEEP_DERIVABLE)
                } else {
                    root.flags.contains(TypeFlags::DEEP_DERIVABLE)
                };
                if !allowed {
                    return fail(Error::InvalidParent {
                        name: name.to_string(),
                        reason: "root type does not allow derivation at this depth",
                    });
                }
                flags.without(TypeFlags::ROOT_MASK) | (root.flags & TypeFlags::ROOT_MASK)
            }
            None => flags,
        };

        let layout = resolve_layout(name, parent_node.as_deref(), info.get(), flags)?;

        let mut interfaces = Vec::with_capacity(info.get().interfaces.len());
        for entry in info.get().interfaces.iter() {
            let iface = match inner.nodes.get(entry.interface.index()).and_then(Option::as_ref) {
                Some(node) if node.flags.contains(TypeFlags::INTERFACED) => Arc::clone(node),
                _ => {
                    return invalid_info(
                        name,
                        format!("{} is not a registered interface", entry.interface),
                    );
                }
            };
            if flags.contains(TypeFlags::INTERFACED) {
                return invalid_info(name, "interfaces cannot embed other interfaces");
            }
            if parent_node.as_ref().is_some_and(|p| p.implements(iface.id))
                || interfaces.iter().any(|(other, _): &(Arc<TypeNode>, usize)| other.id == iface.id)
            {
                return invalid_info(name, format!("{} is implemented twice", iface.name()));
            }
            let offset = entry.class_offset;
            if offset < size_of::<Class>()
                || offset % iface.class_align != 0
                || offset + iface.class_size > layout.class_size
            {
                return invalid_info(
                    name,
                    format!("{} block at offset {offset} does not fit the class", iface.name()),
                );
            }
            interfaces.push((iface, offset));
        }

        let id = TypeId(u32::try_from(inner.nodes.len()).map_err(|_| {
            crate::error::record(Error::InvalidOperation {
                reason: "type id space exhausted".to_string(),
            })
        })?);
        let node = Arc::new(TypeNode {
            id,
            name: quark,
            flags,
            depth: parent_node.as_ref().map_or(0, |p| p.depth + 1),
            parent: parent_node,
            info,
            interfaces,
            class_size: layout.class_size,
            class_align: layout.class_align,
            instance_size: layout.instance_size,
            instance_align: layout.instance_align,
            private_size: layout.private_size,
            private_offset: layout.private_offset,
            private_total: layout.private_offset.unsigned_abs(),
            class: AtomicPtr::new(std::ptr::null_mut()),
            class_refs: AtomicU32::new(0),
            instances: AtomicU32::new(0),
            children: AtomicU32::new(0),
            lifecycle: Arc::clone(&self.lifecycle),
        });

        if let Some(parent) = &node.parent {
            parent.children.fetch_add(1, Ordering::AcqRel);
        }
        oxmeta_log::debug!(
            "registered {} as {} (class {} bytes, instance {} bytes, private {} bytes)",
            name,
            id,
            node.class_size,
            node.instance_size,
            node.private_total
        );
        inner.nodes.push(Some(node));
        inner.by_name.insert(quark, id);
        if builtin {
            inner.builtin_count += 1;
        }
        Ok(id)
    }

    /// Removes a type from the registry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidType`] if `ty` is not registered
    /// - [`Error::InvalidOperation`] for builtin types
    /// - [`Error::InUse`] while classes, instances or subtypes of `ty` exist
    pub fn unregister(&self, ty: TypeId) -> Result<()> {
        // Same order as class acquisition: lifecycle first, then the table.
        // A class_init holding the lifecycle lock may still read the table.
        let _lifecycle = self.lifecycle.lock();
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get(ty.index()).and_then(Option::as_ref).cloned() else {
            return fail(Error::InvalidType {
                context: format!("cannot unregister unknown {ty}"),
            });
        };
        if ty.index() <= inner.builtin_count {
            return fail(Error::InvalidOperation {
                reason: format!("builtin type {} cannot be unregistered", node.name()),
            });
        }

        let class_refs = node.class_ref_count();
        let instances = node.instance_count();
        let children = node.children.load(Ordering::Acquire);
        if class_refs > 0 || instances > 0 || children > 0 {
            return fail(Error::InUse {
                type_name: node.name().to_string(),
                class_refs,
                instances,
                children,
            });
        }

        let name = node.name_quark();
        if let Some(parent) = &node.parent {
            parent.children.fetch_sub(1, Ordering::AcqRel);
        }
        inner.nodes[ty.index()] = None;
        inner.by_name.remove(&name);
        oxmeta_log::debug!("unregistered {} ({})", name, ty);
        Ok(())
    }

    /// Returns the node of `ty`, or `None` if it is not registered.
    #[must_use]
    pub fn get(&self, ty: TypeId) -> Option<Arc<TypeNode>> {
        self.inner.read().nodes.get(ty.index()).and_then(Clone::clone)
    }

    /// Returns the node of `ty`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidType`] if `ty` is not registered.
    #[track_caller]
    pub fn node(&self, ty: TypeId) -> Result<Arc<TypeNode>> {
        match self.get(ty) {
            Some(node) => Ok(node),
            None => fail(Error::InvalidType {
                context: format!("{ty} is not registered"),
            }),
        }
    }

    /// Looks a type up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<TypeId> {
        let quark = Quark::try_get(name)?;
        self.inner.read().by_name.get(&quark).copied()
    }

    /// True if `ty` is currently registered.
    #[must_use]
    pub fn verify(&self, ty: TypeId) -> bool {
        self.get(ty).is_some()
    }

    #[must_use]
    pub fn name(&self, ty: TypeId) -> Option<&'static str> {
        self.get(ty).map(|node| node.name())
    }

    /// Display name for diagnostics: the type name or the raw id.
    pub(crate) fn describe(&self, ty: TypeId) -> String {
        self.name(ty).map_or_else(|| ty.to_string(), str::to_string)
    }

    #[must_use]
    pub fn parent(&self, ty: TypeId) -> Option<TypeId> {
        self.get(ty)?.parent.as_ref().map(|p| p.id)
    }

    /// The fundamental type `ty` derives from.
    #[must_use]
    pub fn root(&self, ty: TypeId) -> Option<TypeId> {
        self.get(ty).map(|node| node.root().id)
    }

    #[must_use]
    pub fn depth(&self, ty: TypeId) -> Option<usize> {
        self.get(ty).map(|node| node.depth)
    }

    /// The ancestor of `ty` at `depth` counted from the root (`0` is the root).
    #[must_use]
    pub fn base(&self, ty: TypeId, depth: usize) -> Option<TypeId> {
        let node = self.get(ty)?;
        node.chain().get(depth).map(|n| n.id)
    }

    /// The ancestor `level` steps above `ty` (`0` is `ty` itself).
    #[must_use]
    pub fn ancestor(&self, ty: TypeId, level: usize) -> Option<TypeId> {
        let node = self.get(ty)?;
        let mut current: &TypeNode = &node;
        for _ in 0..level {
            current = current.parent.as_deref()?;
        }
        Some(current.id)
    }

    /// True if `base` is `sub` or one of its ancestors.
    #[must_use]
    pub fn is_a(&self, sub: TypeId, base: TypeId) -> bool {
        self.get(sub).is_some_and(|node| node.is_a(base))
    }

    /// True if `ty` embeds `iface` somewhere in its class.
    #[must_use]
    pub fn implements(&self, ty: TypeId, iface: TypeId) -> bool {
        self.get(ty).is_some_and(|node| node.implements(iface))
    }

    /// True if `ty` derives from or implements `other`.
    #[must_use]
    pub fn check(&self, ty: TypeId, other: TypeId) -> bool {
        self.get(ty).is_some_and(|node| node.check(other))
    }

    #[must_use]
    pub fn flags(&self, ty: TypeId) -> TypeFlags {
        self.get(ty).map_or(TypeFlags::NONE, |node| node.flags)
    }

    /// True if every flag in `mask` is set on `ty`.
    #[must_use]
    pub fn flags_check(&self, ty: TypeId, mask: TypeFlags) -> bool {
        self.flags(ty).contains(mask)
    }

    /// Class size including every ancestor level.
    #[must_use]
    pub fn class_size(&self, ty: TypeId) -> usize {
        self.get(ty).map_or(0, |node| node.class_size)
    }

    /// Public instance size including every ancestor level.
    #[must_use]
    pub fn instance_size(&self, ty: TypeId) -> usize {
        self.get(ty).map_or(0, |node| node.instance_size)
    }

    /// Private instance bytes including every ancestor level.
    #[must_use]
    pub fn instance_private_size(&self, ty: TypeId) -> usize {
        self.get(ty).map_or(0, |node| node.private_total)
    }

    #[must_use]
    pub fn class_ref_count(&self, ty: TypeId) -> u32 {
        self.get(ty).map_or(0, |node| node.class_ref_count())
    }

    #[must_use]
    pub fn instance_count(&self, ty: TypeId) -> u32 {
        self.get(ty).map_or(0, |node| node.instance_count())
    }

    /// Number of registered types, builtins included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().by_name.len()
    }

    #[must_use]
    pub fn builtin_count(&self) -> usize {
        self.inner.read().builtin_count
    }

    /// Registered ids in registration order.
    #[must_use]
    pub fn types(&self) -> Vec<TypeId> {
        self.inner
            .read()
            .nodes
            .iter()
            .flatten()
            .map(|node| node.id)
            .collect()
    }
}
