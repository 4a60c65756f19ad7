//! Quarks: process-wide interned strings.
//!
//! A [`Quark`] is a 32-bit id for a string stored in the global
//! [`QuarkTable`]. Equal strings always intern to the same quark, so quarks
//! work as cheap map keys and compare in O(1).
//!
//! # Examples
//!
//! ```
//! use oxmeta_mem::Quark;
//!
//! let a = Quark::intern("BLUE");
//! let b = Quark::intern("BLUE");
//! assert_eq!(a, b);
//! assert_eq!(a.as_str(), "BLUE");
//! assert_eq!(Quark::try_get("never interned here"), None);
//! ```

use crate::arena::StrArena;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::OnceLock;

/// Handle to an interned string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quark(u32);

impl Quark {
    /// Interns `s` in the global table.
    pub fn intern(s: &str) -> Quark {
        quark_table().intern(s)
    }

    /// Looks `s` up without interning it.
    #[must_use]
    pub fn try_get(s: &str) -> Option<Quark> {
        quark_table().get(s)
    }

    /// The string this quark stands for. The invalid quark maps to `""`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        quark_table().resolve(self).unwrap_or("")
    }

    /// Raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Sentinel quark that never names a string.
    #[must_use]
    pub const fn invalid() -> Self {
        Quark(u32::MAX)
    }

    /// Returns true for [`Quark::invalid`].
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == u32::MAX
    }
}

impl fmt::Display for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Quark {
    fn from(s: &str) -> Self {
        Quark::intern(s)
    }
}

struct Inner {
    arena: StrArena,
    strings: Vec<&'static str>,
    ids: HashMap<&'static str, Quark>,
}

/// Bidirectional string <-> [`Quark`] map.
///
/// Lookups take a read lock; only first-time interning takes the write lock.
pub struct QuarkTable {
    inner: RwLock<Inner>,
}

impl QuarkTable {
    /// Creates an empty table. Most code wants [`quark_table`] instead.
    #[must_use]
    pub fn new() -> Self {
        QuarkTable {
            inner: RwLock::new(Inner {
                arena: StrArena::default(),
                strings: Vec::new(),
                ids: HashMap::new(),
            }),
        }
    }

    /// Returns the quark for `s`, interning it on first use.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX - 1` distinct strings are interned.
    pub fn intern(&self, s: &str) -> Quark {
        if let Some(quark) = self.get(s) {
            return quark;
        }

        let mut inner = self.inner.write();
        // Another thread may have won the race between the two locks.
        if let Some(&quark) = inner.ids.get(s) {
            return quark;
        }

        let id = u32::try_from(inner.strings.len())
            .ok()
            .filter(|id| *id != u32::MAX)
            .unwrap_or_else(|| panic!("quark table exhausted"));
        let stored = inner.arena.alloc_str(s);
        let quark = Quark(id);
        inner.strings.push(stored);
        inner.ids.insert(stored, quark);
        quark
    }

    /// Looks `s` up without interning it.
    pub fn get(&self, s: &str) -> Option<Quark> {
        self.inner.read().ids.get(s).copied()
    }

    /// Returns the interned string for `quark`.
    pub fn resolve(&self, quark: Quark) -> Option<&'static str> {
        self.inner.read().strings.get(quark.0 as usize).copied()
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.inner.read().strings.len()
    }

    /// Returns true if nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of string data held by the table.
    pub fn bytes_used(&self) -> usize {
        self.inner.read().arena.bytes_used()
    }
}

impl Default for QuarkTable {
    fn default() -> Self {
        Self::new()
    }
}

static QUARKS: OnceLock<QuarkTable> = OnceLock::new();

/// The process-wide quark table.
pub fn quark_table() -> &'static QuarkTable {
    QUARKS.get_or_init(QuarkTable::new)
}
