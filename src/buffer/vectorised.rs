//! Ordered sequence of views read as one stream.

use super::view::View;
use std::collections::VecDeque;
use std::io::{self, Read};

/// A list of views plus their combined size.
///
/// Reading drains views front to back. Once everything has been read,
/// `read` returns `Ok(0)` rather than an error.
#[derive(Debug, Clone, Default)]
pub struct VectorisedView {
    views: VecDeque<View>,
    size: usize,
}

impl VectorisedView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_views(views: impl IntoIterator<Item = View>) -> Self {
        let mut vv = Self::new();
        for v in views {
            vv.append_view(v);
        }
        vv
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn append_view(&mut self, view: View) {
        if view.is_empty() {
            return;
        }
        self.size += view.size();
        self.views.push_back(view);
    }

    pub fn views(&self) -> impl Iterator<Item = &View> + Clone {
        self.views.iter()
    }

    pub fn into_views(self) -> VecDeque<View> {
        self.views
    }

    /// Drop `n` bytes from the front.
    pub fn trim_front(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.views.front_mut() else {
                break;
            };
            if n >= front.size() {
                n -= front.size();
                self.size -= front.size();
                self.views.pop_front();
            } else {
                front.trim_front(n);
                self.size -= n;
                n = 0;
            }
        }
    }

    /// Shorten to at most `len` bytes.
    pub fn cap_length(&mut self, len: usize) {
        if len >= self.size {
            return;
        }
        let mut kept = 0;
        let mut keep_views = 0;
        for v in self.views.iter_mut() {
            if kept >= len {
                break;
            }
            let take = v.size().min(len - kept);
            v.truncate(take);
            kept += take;
            keep_views += 1;
        }
        self.views.truncate(keep_views);
        self.size = len;
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for v in &self.views {
            out.extend(v.spans(0, v.size()).flatten());
        }
        out
    }
}

impl From<View> for VectorisedView {
    fn from(view: View) -> Self {
        Self::from_views([view])
    }
}

impl From<&[u8]> for VectorisedView {
    fn from(data: &[u8]) -> Self {
        Self::from(View::from(data))
    }
}

impl io::Read for VectorisedView {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.views.front_mut() else {
                break;
            };
            let n = front.read(&mut dst[copied..])?;
            copied += n;
            self.size -= n;
            if front.is_empty() {
                self.views.pop_front();
            }
            if n == 0 {
                break;
            }
        }
        Ok(copied)
    }
}
