//! Non-linear byte container built from pooled buffers.

use super::pool::{Buffer, Pool};
use crate::{Error, Result};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

/// A logically contiguous byte sequence stored as a chain of buffers.
///
/// Cloning a `View` is cheap: buffers are shared and copied only when one of
/// the clones writes into them. Clones and sub-views draw from the same
/// pool, and every chunk goes back to it once the last view holding it
/// lets go.
#[derive(Debug)]
pub struct View {
    bufs: VecDeque<Buffer>,
    size: usize,
    pool: Arc<Pool>,
}

impl View {
    pub fn new() -> Self {
        Self::with_pool(Pool::shared())
    }

    pub fn with_pool(pool: Arc<Pool>) -> Self {
        Self {
            bufs: VecDeque::new(),
            size: 0,
            pool,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of buffers backing this view.
    pub fn buffer_count(&self) -> usize {
        self.bufs.len()
    }

    /// Copy `data` onto the end, filling the tail buffer first when this
    /// view owns it exclusively.
    pub fn append(&mut self, mut data: &[u8]) {
        if let Some(tail) = self.bufs.back_mut() {
            if !tail.is_shared() {
                let n = tail.append(data);
                self.size += n;
                data = &data[n..];
            }
        }
        while !data.is_empty() {
            let mut buf = self.pool.acquire(self.pool.buffer_size());
            let n = buf.append(data);
            self.size += n;
            data = &data[n..];
            self.bufs.push_back(buf);
        }
    }

    /// Put `n` zeroed bytes in a single buffer at the front.
    pub fn prepend_zeroed(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let mut buf = self.pool.acquire(n);
        buf.write_move(n);
        self.size += n;
        self.bufs.push_front(buf);
    }

    /// Move `other`'s buffers onto the end without copying.
    pub fn append_view(&mut self, mut other: View) {
        self.size += other.size;
        self.bufs.extend(other.bufs.drain(..));
    }

    /// Drop `n` bytes from the front.
    pub fn trim_front(&mut self, n: usize) {
        let mut n = n.min(self.size);
        while n > 0 {
            let Some(front) = self.bufs.front_mut() else {
                break;
            };
            let len = front.len();
            if n >= len {
                n -= len;
                self.size -= len;
                if let Some(buf) = self.bufs.pop_front() {
                    self.pool.release(buf);
                }
            } else {
                front.read_move(n);
                self.size -= n;
                n = 0;
            }
        }
    }

    /// Shorten to `len` bytes. No-op when already shorter.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.size {
            return;
        }
        let mut kept = 0;
        let mut keep_bufs = 0;
        for buf in self.bufs.iter_mut() {
            if kept >= len {
                break;
            }
            let take = buf.len().min(len - kept);
            buf.truncate(take);
            kept += take;
            keep_bufs += 1;
        }
        while self.bufs.len() > keep_bufs {
            if let Some(buf) = self.bufs.pop_back() {
                self.pool.release(buf);
            }
        }
        self.size = len;
    }

    /// A view sharing the bytes `offset..offset + len`.
    pub fn sub_view(&self, offset: usize, len: usize) -> View {
        let mut out = View::with_pool(Arc::clone(&self.pool));
        let mut skip = offset;
        let mut remaining = len.min(self.size.saturating_sub(offset));
        for buf in &self.bufs {
            if remaining == 0 {
                break;
            }
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            let take = (buf.len() - skip).min(remaining);
            out.bufs.push_back(buf.window(skip, skip + take));
            out.size += take;
            remaining -= take;
            skip = 0;
        }
        out
    }

    /// Lazily walk the bytes `offset..offset + len` as borrowed spans.
    pub fn spans(&self, offset: usize, len: usize) -> Spans<'_> {
        Spans {
            bufs: &self.bufs,
            index: 0,
            skip: offset,
            remaining: len.min(self.size.saturating_sub(offset)),
        }
    }

    /// Copy bytes starting at `offset` into `dst`. Returns bytes copied.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for span in self.spans(offset, dst.len()) {
            dst[copied..copied + span.len()].copy_from_slice(span);
            copied += span.len();
        }
        copied
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for span in self.spans(0, self.size) {
            out.extend_from_slice(span);
        }
        out
    }

    /// The bytes `offset..offset + len`, borrowed when they sit in one
    /// buffer and copied otherwise.
    pub fn contiguous(&self, offset: usize, len: usize) -> Option<Cow<'_, [u8]>> {
        if offset + len > self.size {
            return None;
        }
        let mut spans = self.spans(offset, len);
        match spans.next() {
            None => Some(Cow::Borrowed(&[])),
            Some(first) if first.len() == len => Some(Cow::Borrowed(first)),
            Some(first) => {
                let mut out = Vec::with_capacity(len);
                out.extend_from_slice(first);
                for span in spans {
                    out.extend_from_slice(span);
                }
                Some(Cow::Owned(out))
            }
        }
    }

    /// Mutable access to `offset..offset + len` when the range sits in one
    /// buffer. A shared buffer is copied first.
    pub fn contiguous_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        if offset + len > self.size {
            return None;
        }
        if len == 0 {
            return Some(&mut []);
        }
        let mut skip = offset;
        for buf in self.bufs.iter_mut() {
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            if skip + len > buf.len() {
                return None;
            }
            return Some(&mut buf.as_mut_slice()[skip..skip + len]);
        }
        None
    }

    /// Overwrite bytes at `offset`. Shared buffers are copied before
    /// being written.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.size {
            return Err(Error::BufferTooSmall);
        }
        let mut skip = offset;
        let mut src = data;
        for buf in self.bufs.iter_mut() {
            if src.is_empty() {
                break;
            }
            if skip >= buf.len() {
                skip -= buf.len();
                continue;
            }
            let take = (buf.len() - skip).min(src.len());
            buf.as_mut_slice()[skip..skip + take].copy_from_slice(&src[..take]);
            src = &src[take..];
            skip = 0;
        }
        Ok(())
    }
}

impl Clone for View {
    fn clone(&self) -> Self {
        Self {
            bufs: self.bufs.clone(),
            size: self.size,
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        for buf in self.bufs.drain(..) {
            self.pool.release(buf);
        }
    }
}

impl Default for View {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&[u8]> for View {
    fn from(data: &[u8]) -> Self {
        let mut v = View::new();
        v.append(data);
        v
    }
}

impl From<Vec<u8>> for View {
    fn from(data: Vec<u8>) -> Self {
        View::from(data.as_slice())
    }
}

impl io::Read for View {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = self.copy_to(0, dst);
        self.trim_front(n);
        Ok(n)
    }
}

/// Borrowed spans over part of a [`View`]. Cloning restarts nothing; it
/// forks the walk at the current position.
#[derive(Debug, Clone)]
pub struct Spans<'a> {
    bufs: &'a VecDeque<Buffer>,
    index: usize,
    skip: usize,
    remaining: usize,
}

impl<'a> Iterator for Spans<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while self.remaining > 0 {
            let buf = self.bufs.get(self.index)?;
            self.index += 1;
            let bytes = buf.as_slice();
            if self.skip >= bytes.len() {
                self.skip -= bytes.len();
                continue;
            }
            let take = (bytes.len() - self.skip).min(self.remaining);
            let span = &bytes[self.skip..self.skip + take];
            self.skip = 0;
            self.remaining -= take;
            return Some(span);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EMBEDDED_COUNT;
    use std::io::Read;

    fn small_view(data: &[u8]) -> View {
        make_view(&Arc::new(Pool::with_buffer_size(4)), data)
    }

    fn make_view(pool: &Arc<Pool>, data: &[u8]) -> View {
        let mut v = View::with_pool(Arc::clone(pool));
        v.append(data);
        v
    }

    fn first_chunk(v: &View) -> *const u8 {
        v.spans(0, v.size()).next().unwrap().as_ptr()
    }

    #[test]
    fn test_append_spans_multiple_buffers() {
        let v = small_view(b"abcdefghij");
        assert_eq!(v.size(), 10);
        assert_eq!(v.buffer_count(), 3);
        assert_eq!(v.to_vec(), b"abcdefghij");
        let spans: Vec<&[u8]> = v.spans(0, v.size()).collect();
        assert_eq!(spans, vec![&b"abcd"[..], b"efgh", b"ij"]);
    }

    #[test]
    fn test_spans_sub_range() {
        let v = small_view(b"abcdefghij");
        let joined: Vec<u8> = v.spans(3, 4).flatten().copied().collect();
        assert_eq!(joined, b"defg");
        assert_eq!(v.spans(20, 4).count(), 0);
    }

    #[test]
    fn test_trim_front_and_truncate() {
        let mut v = small_view(b"abcdefghij");
        v.trim_front(5);
        assert_eq!(v.to_vec(), b"fghij");
        v.truncate(3);
        assert_eq!(v.to_vec(), b"fgh");
        assert_eq!(v.size(), 3);
    }

    #[test]
    fn test_contiguous_borrows_when_possible() {
        let v = small_view(b"abcdefgh");
        assert!(matches!(v.contiguous(0, 4), Some(Cow::Borrowed(b)) if b == b"abcd"));
        match v.contiguous(2, 4) {
            Some(Cow::Owned(bytes)) => assert_eq!(bytes, b"cdef"),
            other => panic!("expected owned copy, got {:?}", other),
        }
        assert!(v.contiguous(6, 4).is_none());
    }

    #[test]
    fn test_write_at_copy_on_write() {
        let mut v = small_view(b"abcdefgh");
        let snapshot = v.clone();
        v.write_at(3, b"XY").unwrap();
        assert_eq!(v.to_vec(), b"abcXYfgh");
        assert_eq!(snapshot.to_vec(), b"abcdefgh");
        assert!(matches!(v.write_at(7, b"XY"), Err(Error::BufferTooSmall)));
    }

    #[test]
    fn test_shared_tail_not_appended_in_place() {
        let mut v = small_view(b"ab");
        let snapshot = v.clone();
        v.append(b"cd");
        assert_eq!(v.to_vec(), b"abcd");
        assert_eq!(snapshot.to_vec(), b"ab");
    }

    #[test]
    fn test_sub_view_shares_bytes() {
        let v = small_view(b"abcdefghij");
        let sub = v.sub_view(2, 5);
        assert_eq!(sub.to_vec(), b"cdefg");
        assert_eq!(v.sub_view(8, 10).to_vec(), b"ij");
    }

    #[test]
    fn test_prepend_zeroed_is_contiguous() {
        let mut v = small_view(b"data");
        v.prepend_zeroed(20);
        assert_eq!(v.size(), 24);
        assert!(matches!(v.contiguous(0, 20), Some(Cow::Borrowed(_))));
    }

    #[test]
    fn test_read_consumes() {
        let mut v = small_view(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(v.read(&mut out).unwrap(), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(v.read(&mut out).unwrap(), 2);
        assert_eq!(v.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_dropped_chunk_reused_by_other_view() {
        let pool = Arc::new(Pool::with_buffer_size(4));
        let first = make_view(&pool, b"abcd");
        let chunk = first_chunk(&first);
        assert_eq!(pool.cached(), EMBEDDED_COUNT - 1);
        drop(first);
        assert_eq!(pool.cached(), EMBEDDED_COUNT);

        let second = make_view(&pool, b"wxyz");
        assert_eq!(first_chunk(&second), chunk);
        assert_eq!(second.to_vec(), b"wxyz");
    }

    #[test]
    fn test_chunk_returns_after_last_clone() {
        let pool = Arc::new(Pool::with_buffer_size(4));
        let v = make_view(&pool, b"abcdefgh");
        let copy = v.clone();
        let sub = v.sub_view(1, 2);
        assert!(Arc::ptr_eq(copy.pool(), &pool));
        assert!(Arc::ptr_eq(sub.pool(), &pool));

        drop(v);
        drop(copy);
        assert_eq!(pool.cached(), EMBEDDED_COUNT - 1);
        assert_eq!(sub.to_vec(), b"bc");
        drop(sub);
        assert_eq!(pool.cached(), EMBEDDED_COUNT);
    }

    #[test]
    fn test_trimmed_chunk_reused_in_place() {
        let pool = Arc::new(Pool::with_buffer_size(4));
        let mut v = make_view(&pool, b"abcdefgh");
        let chunk = first_chunk(&v);
        v.trim_front(4);
        v.append(b"ijkl");
        assert_eq!(v.to_vec(), b"efghijkl");
        assert_eq!(v.spans(4, 4).next().unwrap().as_ptr(), chunk);
    }
}
