//! Pooled storage for packet bytes.
//!
//! - [`Pool`] hands out fixed-size [`Buffer`]s and recycles them
//! - [`View`] chains buffers into one logical byte sequence
//! - [`VectorisedView`] reads a list of views as a single stream

mod pool;
mod vectorised;
mod view;

pub use pool::{Buffer, DEFAULT_BUFFER_SIZE, EMBEDDED_COUNT, Pool};
pub use vectorised::VectorisedView;
pub use view::{Spans, View};
