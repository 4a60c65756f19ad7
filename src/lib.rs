//! `oxmeta`: a class/instance/interface type runtime for Rust
//!
//! `oxmeta` is a meta-type system in the GObject mould. It provides:
//!
//! - **Type registry** with single inheritance, root-type flags and stable builtin ids
//! - **Shared classes** built on first use, reference counted, torn down at zero
//! - **Instances** with per-level public fields and private blocks
//! - **Interfaces** embedded in classes at fixed offsets, with default slots
//! - **Variants** holding any registered type, with pluggable operations and converters
//! - **Boxes**: reference-counted heap instances with quark-keyed side fields
//! - **Opaque types and bit structs**: user-managed addresses and packed bit fields as variants
//!
//! # Architecture
//!
//! Everything hangs off an explicit [`Runtime`] value. Classes and
//! instances reach their type metadata through shared [`TypeNode`]s, so the
//! hot paths (casts, interface lookup, refcounts) never take the registry
//! lock.
//!
//! Class blocks and instances are raw, `#[repr(C)]` prefix layouts: a
//! derived class starts with its parent's class, a derived instance with its
//! parent's fields. Unsafe code stays inside the runtime; the public API
//! hands out checked views.
//!
//! # Example
//!
//! ```rust
//! use oxmeta::{Runtime, Value, Variant, builtin};
//!
//! let rt = Runtime::new().unwrap();
//! let n = Variant::new(&rt, 300u32).unwrap();
//! assert!(n.convert_to(&rt, builtin::U8).is_err());
//! let s = n.convert_to(&rt, builtin::STRING).unwrap();
//! assert_eq!(s.peek().unwrap(), &Value::from("300"));
//! ```

pub mod config;
pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, ErrorRecord, Result, clear_last_error, last_error, log_last_error};
pub use runtime::{
    BitStructClass, BitStructField, BoxRef, Class, ClassRef, ClassSlice, ClassStruct, EnumClass,
    EnumEntry, FlagsClass, FlagsEntry, Instance, InstanceLevel, InstancePtr, InstanceStorage,
    InstanceStruct, Interface, InterfaceRef, OpFlags, OpaqueClass, OpaqueVTable, PrivateStruct,
    Runtime, TypeFlags, TypeId, TypeInfo, TypeNode, Value, ValueKind, Variant, VariantOps, builtin,
    query_interface, try_query_interface,
};
pub use oxmeta_mem::Quark;
