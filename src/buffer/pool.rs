//! Fixed-size storage buffers and the shared pool that recycles them.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::trace;

/// Chunks a pool pre-allocates, and the size of each overflow batch.
pub const EMBEDDED_COUNT: usize = 8;

/// Released chunks kept beyond the embedded slots.
const MAX_OVERFLOW: usize = 4 * EMBEDDED_COUNT;

/// Default capacity of a pooled buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8144;

/// A fixed-capacity byte region with independent read and write cursors.
///
/// The storage is reference counted so packet clones can share it. Cloning a
/// `Buffer` copies the cursors and shares the bytes; any mutation through a
/// shared buffer copies the storage first.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Arc<Vec<u8>>,
    read: usize,
    write: usize,
}

impl Buffer {
    fn from_storage(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of readable bytes.
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Number of bytes that can still be appended.
    pub fn available(&self) -> usize {
        self.capacity() - self.write
    }

    pub fn is_full(&self) -> bool {
        self.write == self.capacity()
    }

    /// Whether another buffer shares this storage.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    /// Readable bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Readable bytes, mutably. Copies the storage if it is shared.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (read, write) = (self.read, self.write);
        &mut Arc::make_mut(&mut self.data)[read..write]
    }

    /// Copy as much of `src` as fits after the write cursor.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.available());
        if n == 0 {
            return 0;
        }
        let write = self.write;
        Arc::make_mut(&mut self.data)[write..write + n].copy_from_slice(&src[..n]);
        self.write += n;
        n
    }

    /// Advance the read cursor by `n` bytes.
    pub fn read_move(&mut self, n: usize) {
        self.read = (self.read + n).min(self.write);
    }

    /// Advance the write cursor by `n` bytes without copying anything in.
    pub fn write_move(&mut self, n: usize) {
        self.write = (self.write + n).min(self.capacity());
    }

    /// Keep only the first `len` readable bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.write = self.read + len;
        }
    }

    /// A buffer sharing this storage, restricted to `start..end` of the
    /// readable bytes.
    pub fn window(&self, start: usize, end: usize) -> Buffer {
        let end = end.min(self.len());
        let start = start.min(end);
        Buffer {
            data: Arc::clone(&self.data),
            read: self.read + start,
            write: self.read + end,
        }
    }
}

/// Recycles chunk storage for every view drawing from it.
///
/// The embedded slots are filled at construction. Once they run dry,
/// storage is allocated `EMBEDDED_COUNT` chunks at a time and the spares
/// are parked on the overflow list. Views share a pool through an `Arc` and
/// hand their chunks back as they trim or drop them; a chunk still shared by
/// another view is left to the last holder.
pub struct Pool {
    buffer_size: usize,
    free: Mutex<FreeList>,
}

#[derive(Default)]
struct FreeList {
    embedded: [Option<Vec<u8>>; EMBEDDED_COUNT],
    overflow: Vec<Vec<u8>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let mut free = FreeList::default();
        for slot in free.embedded.iter_mut() {
            *slot = Some(vec![0; buffer_size]);
        }
        Self {
            buffer_size,
            free: Mutex::new(free),
        }
    }

    /// The process-wide pool behind views created without one.
    pub fn shared() -> Arc<Pool> {
        static SHARED: LazyLock<Arc<Pool>> = LazyLock::new(|| Arc::new(Pool::new()));
        Arc::clone(&SHARED)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of chunks ready to be handed out.
    pub fn cached(&self) -> usize {
        let free = self.free.lock();
        free.embedded.iter().filter(|s| s.is_some()).count() + free.overflow.len()
    }

    /// Hand out zeroed storage with room for at least `size` bytes.
    ///
    /// Requests larger than the pool's buffer size get dedicated storage
    /// that is never recycled.
    pub fn acquire(&self, size: usize) -> Buffer {
        if size > self.buffer_size {
            return Buffer::from_storage(vec![0; size]);
        }
        let mut free = self.free.lock();
        if let Some(storage) = free.embedded.iter_mut().find_map(Option::take) {
            return Buffer::from_storage(storage);
        }
        if let Some(storage) = free.overflow.pop() {
            return Buffer::from_storage(storage);
        }
        let spares = (1..EMBEDDED_COUNT).map(|_| vec![0; self.buffer_size]);
        free.overflow.extend(spares);
        trace!(size = self.buffer_size, count = EMBEDDED_COUNT, "allocated chunk batch");
        Buffer::from_storage(vec![0; self.buffer_size])
    }

    /// Return a buffer. Taking it by value makes a double release impossible.
    pub fn release(&self, buf: Buffer) {
        let Ok(mut storage) = Arc::try_unwrap(buf.data) else {
            return;
        };
        if storage.len() != self.buffer_size {
            return;
        }
        storage.fill(0);
        let mut free = self.free.lock();
        if let Some(slot) = free.embedded.iter_mut().find(|s| s.is_none()) {
            *slot = Some(storage);
        } else if free.overflow.len() < MAX_OVERFLOW {
            free.overflow.push(storage);
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("buffer_size", &self.buffer_size)
            .field("cached", &self.cached())
            .finish()
    }
}
