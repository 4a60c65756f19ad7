//! Append-only string storage.
//!
//! Strings copied into a [`StrArena`] are never moved or freed, which is what
//! lets the quark table hand out `&'static str`. Chunks are leaked on
//! purpose: interned names live for the whole process.

/// Smallest chunk the arena will request.
pub const MIN_CHUNK_SIZE: usize = 4096;

/// Largest chunk the arena grows to. Longer strings get a dedicated chunk.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Bump allocator for string bytes.
///
/// Not synchronized; the owner (normally the [`QuarkTable`](crate::QuarkTable))
/// serializes access.
///
/// # Examples
///
/// ```
/// use oxmeta_mem::StrArena;
///
/// let mut arena = StrArena::new(4096);
/// let a = arena.alloc_str("Color");
/// let b = arena.alloc_str("Shape");
/// assert_eq!(a, "Color");
/// assert_eq!(b, "Shape");
/// assert_eq!(arena.bytes_used(), 10);
/// ```
pub struct StrArena {
    /// Unused tail of the current chunk.
    free: &'static mut [u8],
    /// Size of the most recently requested chunk.
    chunk_size: usize,
    chunks: usize,
    used: usize,
}

impl StrArena {
    /// Creates an arena whose first chunk holds `chunk_size` bytes
    /// (clamped to `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`).
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        StrArena {
            free: Self::leak_chunk(chunk_size),
            chunk_size,
            chunks: 1,
            used: 0,
        }
    }

    fn leak_chunk(size: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; size].into_boxed_slice())
    }

    /// Copies `s` into the arena and returns the stable copy.
    pub fn alloc_str(&mut self, s: &str) -> &'static str {
        let len = s.len();
        if len > self.free.len() {
            let next = (self.chunk_size * 2).min(MAX_CHUNK_SIZE).max(len);
            self.free = Self::leak_chunk(next);
            self.chunk_size = next;
            self.chunks += 1;
        }

        let (head, tail) = std::mem::take(&mut self.free).split_at_mut(len);
        head.copy_from_slice(s.as_bytes());
        self.free = tail;
        self.used += len;

        // SAFETY: `head` holds an exact copy of the bytes of a `&str`, so it
        // is valid UTF-8, and the chunk it lives in is never freed.
        unsafe { std::str::from_utf8_unchecked(head) }
    }

    /// Total string bytes handed out.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.used
    }

    /// Number of chunks requested so far.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }
}

impl Default for StrArena {
    fn default() -> Self {
        Self::new(MIN_CHUNK_SIZE)
    }
}
