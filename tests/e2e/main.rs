//! End-to-end tests driving a full stack through channel links.
//!
//! Run with: cargo test --test e2e

mod filter;
mod forwarding;
mod harness;
mod udp;
