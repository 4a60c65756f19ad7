//! Interned strings for the `oxmeta` runtime.
//!
//! - [`StrArena`]: append-only storage that hands out `&'static str`
//! - [`Quark`]: a 32-bit handle to an interned string
//! - [`QuarkTable`]: the bidirectional string <-> quark map
//!
//! Type names, enum entry names and box field keys are all quarks, so
//! comparing them is an integer compare.

pub mod arena;
pub mod quark;

pub use arena::StrArena;
pub use quark::{Quark, QuarkTable, quark_table};
