//! netstack - a userspace network stack core
//!
//! Packet buffers, transport demultiplexing, port reservation, connection
//! tracking and an iptables-style packet filter, wired together by
//! [`stack::Stack`] with pluggable network and transport protocols.

pub mod buffer;
pub mod config;
pub mod error;
pub mod hash;
pub mod ilist;
pub mod link;
pub mod ports;
pub mod protocol;
pub mod stack;
pub mod tcpip;
pub mod telemetry;
pub mod waiter;

pub use error::{Error, Result};
