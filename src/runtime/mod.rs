//! The `oxmeta` type runtime.
//!
//! A [`Runtime`] owns everything a program registers: the type table and
//! the variant operation and converter tables. It is an ordinary value, so
//! independent runtimes can coexist (tests make heavy use of this). It is
//! `Send + Sync` and meant to be shared by reference or through an `Arc`.
//!
//! # Architecture
//!
//! - [`types`]: type ids, flags, layout resolution and the registry
//! - [`class`]: shared, lazily built, reference-counted class blocks
//! - [`instance`]: instance storage, construction order, casts
//! - [`interface`]: interface blocks embedded in classes, dispatch
//! - [`variant`]: tagged values, per-type operations, converters
//! - [`boxed`]: reference-counted heap instances with field tables
//! - [`table`]: the table interface used by boxed variants
//! - [`enums`] and [`flags`]: registered enumerations and flag sets
//! - [`opaque`]: addresses whose copies go through per-type hooks
//! - [`bit_struct`]: named bit fields packed into one integer
//!
//! # Example
//!
//! ```rust
//! use oxmeta::{ClassRef, Runtime, TypeFlags, TypeInfo, builtin};
//!
//! let rt = Runtime::new().unwrap();
//! let widget = rt
//!     .types()
//!     .register("Widget", builtin::INSTANCE, TypeInfo::new(), TypeFlags::NONE)
//!     .unwrap();
//!
//! let a = ClassRef::acquire(&rt, widget).unwrap();
//! let b = ClassRef::acquire(&rt, widget).unwrap();
//! assert_eq!(a.as_ptr(), b.as_ptr());
//! assert_eq!(rt.types().class_ref_count(widget), 2);
//! ```

pub mod bit_struct;
pub mod boxed;
pub mod class;
pub mod enums;
pub mod flags;
pub mod instance;
pub mod interface;
pub mod opaque;
mod primitives;
pub mod table;
pub mod types;
pub mod variant;

pub use bit_struct::{BitStructClass, BitStructField};
pub use boxed::{BoxClass, BoxInstance, BoxRef};
pub use class::{Class, ClassRef, ClassSlice, ClassStruct, Interface};
pub use enums::{EnumClass, EnumEntry};
pub use flags::{FlagsClass, FlagsEntry};
pub use instance::{Instance, InstanceLevel, InstancePtr, InstanceStorage, InstanceStruct, PrivateStruct};
pub use interface::{InterfaceRef, query_interface, try_query_interface};
pub use opaque::{OpaqueClass, OpaqueVTable};
pub use table::TableVariantClass;
pub use types::{TypeFlags, TypeId, TypeInfo, TypeNode, TypeRegistry, builtin};
pub use variant::{OpFlags, Value, ValueKind, Variant, VariantOps, VariantRegistry};

use crate::config::Config;
use crate::error::Result;
use std::fmt;

/// Owner of all type and variant metadata.
pub struct Runtime {
    types: TypeRegistry,
    variants: VariantRegistry,
}

impl Runtime {
    /// Builds a runtime with the default [`Config`].
    ///
    /// # Errors
    ///
    /// Only fails if builtin registration fails, which indicates a bug.
    pub fn new() -> Result<Self> {
        Self::with_config(&Config::default())
    }

    /// Builds a runtime configured from the environment.
    ///
    /// # Errors
    ///
    /// Same as [`Runtime::new`].
    pub fn from_env() -> Result<Self> {
        Self::with_config(&Config::from_env())
    }

    /// Builds a runtime: applies the log level, sizes the tables, then
    /// registers the builtin types, their operations and converters.
    ///
    /// # Errors
    ///
    /// Same as [`Runtime::new`].
    pub fn with_config(config: &Config) -> Result<Self> {
        if let Some(level) = config.log_level {
            oxmeta_log::set_level(level);
        }
        let rt = Runtime {
            types: TypeRegistry::with_capacity(config.type_capacity),
            variants: VariantRegistry::with_capacity(config.type_capacity, config.converter_capacity),
        };
        rt.register_builtins()?;
        primitives::register_ops(&rt)?;
        primitives::register_converters(&rt)?;
        oxmeta_log::info!(
            "runtime ready: {} builtin types, {} converters",
            rt.types.builtin_count(),
            rt.variants.converter_count()
        );
        Ok(rt)
    }

    fn register_builtins(&self) -> Result<()> {
        let types = &self.types;
        let deep = TypeFlags::DERIVABLE | TypeFlags::DEEP_DERIVABLE;

        types.register_builtin(
            builtin::INTERFACE,
            "Interface",
            TypeId::INVALID,
            TypeInfo::new(),
            TypeFlags::CLASSED | TypeFlags::INTERFACED | TypeFlags::ABSTRACT | deep,
        )?;
        types.register_builtin(
            builtin::INSTANCE,
            "Instance",
            TypeId::INVALID,
            TypeInfo::new(),
            TypeFlags::CLASSED | TypeFlags::INSTANTIABLE | deep,
        )?;
        types.register_builtin(
            builtin::TABLE_VARIANT,
            "TableVariant",
            builtin::INTERFACE,
            TypeInfo::new().with_class::<TableVariantClass>(),
            TypeFlags::NONE,
        )?;

        const VALUES: [(TypeId, &str); 15] = [
            (builtin::NIL, "nil"),
            (builtin::BOOL, "bool"),
            (builtin::CHAR, "char"),
            (builtin::U8, "u8"),
            (builtin::I16, "i16"),
            (builtin::U16, "u16"),
            (builtin::I32, "i32"),
            (builtin::U32, "u32"),
            (builtin::I64, "i64"),
            (builtin::U64, "u64"),
            (builtin::F32, "f32"),
            (builtin::F64, "f64"),
            (builtin::STRING, "string"),
            (builtin::POINTER, "pointer"),
            (builtin::TYPE, "type"),
        ];
        for (id, name) in VALUES {
            types.register_builtin(id, name, TypeId::INVALID, TypeInfo::new(), TypeFlags::NONE)?;
        }

        let enumerated = TypeFlags::CLASSED | TypeFlags::ABSTRACT | TypeFlags::DERIVABLE;
        types.register_builtin(
            builtin::ENUM,
            "Enum",
            TypeId::INVALID,
            TypeInfo::new().with_class::<EnumClass>(),
            enumerated,
        )?;
        types.register_builtin(
            builtin::FLAGS,
            "Flags",
            TypeId::INVALID,
            TypeInfo::new().with_class::<FlagsClass>(),
            enumerated,
        )?;

        types.register_builtin(
            builtin::BOX,
            "Box",
            builtin::INSTANCE,
            TypeInfo::new()
                .with_class::<BoxClass>()
                .with_instance::<BoxInstance>()
                .with_class_init(boxed::class_init)
                .with_instance_init(boxed::instance_init)
                .with_instance_final(boxed::instance_final),
            TypeFlags::NONE,
        )?;

        types.register_builtin(
            builtin::OPAQUE,
            "Opaque",
            TypeId::INVALID,
            TypeInfo::new().with_class::<OpaqueClass>(),
            enumerated,
        )?;
        types.register_builtin(
            builtin::BIT_STRUCT,
            "BitStruct",
            TypeId::INVALID,
            TypeInfo::new().with_class::<BitStructClass>(),
            enumerated,
        )
    }

    /// The type registry.
    #[must_use]
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Variant operation tables and converters.
    #[must_use]
    pub fn variants(&self) -> &VariantRegistry {
        &self.variants
    }

    /// Unregisters `ty` along with its variant operations and every
    /// converter to or from it.
    ///
    /// # Errors
    ///
    /// Same as [`TypeRegistry::unregister`].
    pub fn unregister(&self, ty: TypeId) -> Result<()> {
        self.types.unregister(ty)?;
        self.variants.remove_type(ty);
        Ok(())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("types", &self.types.count())
            .field("converters", &self.variants.converter_count())
            .finish()
    }
}
