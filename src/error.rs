//! Error types for the `oxmeta` runtime.
//!
//! Every fallible operation returns [`Result`]. Failures raised inside the
//! runtime also land in a thread-local [`ErrorRecord`], so a caller that only
//! kept a boolean around can still ask what went wrong last.

use std::cell::RefCell;
use std::fmt;
use std::panic::Location;

/// Errors produced by the type runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The type is unknown, unregistered, or cannot do what was asked.
    InvalidType {
        /// What was being attempted and on which type.
        context: String,
    },

    /// A null or foreign pointer was handed to the runtime.
    InvalidPointer,

    /// A named property or field does not exist or has another type.
    InvalidProperty {
        /// The property or field name.
        name: String,
    },

    /// A value is outside the range its type accepts.
    OutOfRange {
        /// The rejected value.
        value: i128,
        /// Smallest accepted value.
        min: i128,
        /// Largest accepted value.
        max: i128,
    },

    /// The type does not provide the requested operation.
    Unimplemented {
        /// Name of the type that was asked.
        type_name: String,
        /// The missing operation.
        operation: &'static str,
    },

    /// No converter is registered for the pair, or the converter rejected the value.
    InvalidConversion {
        /// Source type name.
        from: String,
        /// Destination type name.
        to: String,
    },

    /// The operation is not defined for its operands.
    InvalidOperation {
        /// Why the operation was rejected.
        reason: String,
    },

    /// A type with the same name is already registered.
    DuplicateType {
        /// The clashing name.
        name: String,
    },

    /// The parent type is missing or refuses children.
    InvalidParent {
        /// Name of the type being registered.
        name: String,
        /// Why the parent was rejected.
        reason: &'static str,
    },

    /// The type still has live classes, instances or subtypes.
    InUse {
        /// Name of the type.
        type_name: String,
        /// Outstanding class references.
        class_refs: u32,
        /// Live instances.
        instances: u32,
        /// Registered direct subtypes.
        children: u32,
    },

    /// The layout or callbacks supplied at registration are inconsistent.
    InvalidTypeInfo {
        /// Name of the type being registered.
        name: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidType { context } => write!(f, "Invalid type: {context}"),
            Error::InvalidPointer => write!(f, "Invalid pointer"),
            Error::InvalidProperty { name } => write!(f, "Invalid property: {name}"),
            Error::OutOfRange { value, min, max } => {
                write!(f, "Value {value} out of range [{min}, {max}]")
            }
            Error::Unimplemented { type_name, operation } => {
                write!(f, "{type_name} does not implement {operation}")
            }
            Error::InvalidConversion { from, to } => {
                write!(f, "Cannot convert {from} to {to}")
            }
            Error::InvalidOperation { reason } => write!(f, "Invalid operation: {reason}"),
            Error::DuplicateType { name } => write!(f, "Type {name} is already registered"),
            Error::InvalidParent { name, reason } => {
                write!(f, "Invalid parent for {name}: {reason}")
            }
            Error::InUse {
                type_name,
                class_refs,
                instances,
                children,
            } => write!(
                f,
                "Type {type_name} is in use ({class_refs} class refs, {instances} instances, {children} subtypes)"
            ),
            Error::InvalidTypeInfo { name, reason } => {
                write!(f, "Invalid type info for {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The most recent failure seen on a thread.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// The error itself.
    pub error: Error,
    /// Source file that raised it.
    pub file: &'static str,
    /// Line that raised it.
    pub line: u32,
    /// Resolved backtrace at the point of failure.
    #[cfg(feature = "error_backtrace")]
    pub backtrace: String,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.error, self.file, self.line)?;
        #[cfg(feature = "error_backtrace")]
        {
            write!(f, "\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<ErrorRecord>> = const { RefCell::new(None) };
}

/// Records `error` as this thread's last error and returns it as `Err`.
#[track_caller]
pub(crate) fn fail<T>(error: Error) -> Result<T> {
    Err(record(error))
}

/// Records `error` as this thread's last error and hands it back.
#[track_caller]
pub(crate) fn record(error: Error) -> Error {
    let location = Location::caller();
    oxmeta_log::debug!("{} at {}:{}", error, location.file(), location.line());

    let entry = ErrorRecord {
        error: error.clone(),
        file: location.file(),
        line: location.line(),
        #[cfg(feature = "error_backtrace")]
        backtrace: format!("{:?}", backtrace::Backtrace::new()),
    };
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(entry));
    error
}

/// Returns the last error recorded on this thread.
pub fn last_error() -> Option<ErrorRecord> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Forgets the last error recorded on this thread.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

/// Prints the last error of this thread at error level, if there is one.
pub fn log_last_error() {
    if let Some(entry) = last_error() {
        oxmeta_log::error!("{entry}");
    }
}
