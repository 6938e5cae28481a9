//! Socket-level options shared by all endpoint kinds.

use crate::ports::Flags;
use parking_lot::Mutex;

/// Boolean socket options. Read and written as one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketFlags {
    pub broadcast: bool,
    pub reuse_address: bool,
    pub reuse_port: bool,
    pub keep_alive: bool,
    pub v6_only: bool,
    pub receive_packet_info: bool,
    pub receive_tos: bool,
    pub no_checksum: bool,
}

#[derive(Debug, Clone, Copy)]
struct BufferSizes {
    send: usize,
    receive: usize,
}

/// Options attached to an endpoint.
///
/// Flags and buffer sizes are guarded separately; each group is always
/// observed consistently.
#[derive(Debug)]
pub struct SocketOptions {
    flags: Mutex<SocketFlags>,
    buffers: Mutex<BufferSizes>,
}

impl SocketOptions {
    pub const DEFAULT_BUFFER_SIZE: usize = 208 * 1024;

    pub fn new() -> Self {
        Self {
            flags: Mutex::new(SocketFlags::default()),
            buffers: Mutex::new(BufferSizes {
                send: Self::DEFAULT_BUFFER_SIZE,
                receive: Self::DEFAULT_BUFFER_SIZE,
            }),
        }
    }

    /// Snapshot of the boolean options.
    pub fn flags(&self) -> SocketFlags {
        *self.flags.lock()
    }

    /// Modify the boolean options atomically.
    pub fn update(&self, f: impl FnOnce(&mut SocketFlags)) {
        f(&mut self.flags.lock());
    }

    pub fn set_reuse_address(&self, v: bool) {
        self.update(|f| f.reuse_address = v);
    }

    pub fn set_reuse_port(&self, v: bool) {
        self.update(|f| f.reuse_port = v);
    }

    pub fn set_broadcast(&self, v: bool) {
        self.update(|f| f.broadcast = v);
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.buffers.lock().receive
    }

    pub fn set_receive_buffer_size(&self, size: usize) {
        self.buffers.lock().receive = size;
    }

    pub fn send_buffer_size(&self) -> usize {
        self.buffers.lock().send
    }

    pub fn set_send_buffer_size(&self, size: usize) {
        self.buffers.lock().send = size;
    }

    /// Port-reservation flags implied by the reuse options.
    pub fn bind_flags(&self) -> Flags {
        let flags = self.flags();
        Flags {
            most_recent: flags.reuse_address,
            load_balanced: flags.reuse_port,
            tuple_only: false,
        }
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}
