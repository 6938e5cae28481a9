//! Connection tracking for NAT.
//!
//! The table is a fixed array of buckets, each a locked list of tuples. A
//! connection owns two tuples (original and reply) which may live in
//! different buckets. Rules:
//!
//! - A bucket is chosen by a seeded hash of the tuple and never changes.
//! - A thread holding bucket `i` may only lock bucket `j` when `i < j`.
//!   Debug builds assert this on every acquisition.
//! - Bucket locks are taken before a connection's own lock.
//! - Expired connections are unlinked lazily while a bucket is scanned; a
//!   connection is unlinked from the lower of its two buckets so the
//!   ordering rule holds.

use crate::hash::hash_with_seed;
use crate::ilist::{Handle, IndexList};
use crate::tcpip::{Clock, NetworkProtocolNumber, TransportProtocolNumber};
use crate::telemetry::Counter;
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default number of buckets.
pub const DEFAULT_BUCKETS: usize = 1 << 14;

/// Default cap on tracked connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1 << 16;

/// One direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleId {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub network: NetworkProtocolNumber,
    pub transport: TransportProtocolNumber,
}

impl TupleId {
    /// The tuple seen by packets flowing the other way.
    pub fn reply(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            src_port: self.dst_port,
            dst_addr: self.src_addr,
            dst_port: self.src_port,
            network: self.network,
            transport: self.transport,
        }
    }
}

/// Which of a connection's tuples a packet matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Original,
    Reply,
}

/// Which end of a connection a NAT rule rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatType {
    /// Rewrites the source, applied on the way out (SNAT, masquerade).
    Source,
    /// Rewrites the destination, applied on the way in (DNAT, redirect).
    Destination,
}

/// Address and port substituted by a NAT rule. Port 0 keeps the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatRewrite {
    pub addr: IpAddr,
    pub port: u16,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// New connection (no reply yet)
    New,
    /// Established (bidirectional traffic seen)
    Established,
}

/// Timeout configuration for connection tracking
#[derive(Debug, Clone)]
pub struct ConnTrackTimeouts {
    /// TCP established connection (default: 2 hours)
    pub tcp_established: Duration,
    /// TCP before a reply was seen (default: 4 minutes)
    pub tcp_transitory: Duration,
    /// UDP (default: 5 minutes)
    pub udp: Duration,
    /// ICMP (default: 1 minute)
    pub icmp: Duration,
}

impl ConnTrackTimeouts {
    fn idle_limit(&self, transport: TransportProtocolNumber, state: ConnState) -> Duration {
        match transport {
            TransportProtocolNumber::TCP if state == ConnState::Established => {
                self.tcp_established
            }
            TransportProtocolNumber::TCP => self.tcp_transitory,
            TransportProtocolNumber::ICMP | TransportProtocolNumber::ICMPV6 => self.icmp,
            _ => self.udp,
        }
    }
}

impl Default for ConnTrackTimeouts {
    fn default() -> Self {
        Self {
            tcp_established: Duration::from_secs(7200),
            tcp_transitory: Duration::from_secs(240),
            udp: Duration::from_secs(300),
            icmp: Duration::from_secs(60),
        }
    }
}

/// Sizing and expiry settings.
#[derive(Debug, Clone)]
pub struct ConnTrackConfig {
    pub buckets: usize,
    pub max_connections: usize,
    pub timeouts: ConnTrackTimeouts,
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            timeouts: ConnTrackTimeouts::default(),
        }
    }
}

#[derive(Debug)]
struct ConnInner {
    reply: TupleId,
    state: ConnState,
    last_used: Instant,
    /// `None` until the NAT table has run for this type; then the rewrite,
    /// if any.
    snat: Option<Option<NatRewrite>>,
    dnat: Option<Option<NatRewrite>>,
    /// Bucket and handle of the original and reply tuples.
    links: [Option<(usize, Handle)>; 2],
}

impl ConnInner {
    fn nat_slot(&mut self, nat: NatType) -> &mut Option<Option<NatRewrite>> {
        match nat {
            NatType::Source => &mut self.snat,
            NatType::Destination => &mut self.dnat,
        }
    }
}

/// A tracked connection.
#[derive(Debug)]
pub struct Conn {
    original: TupleId,
    created_at: Instant,
    inner: Mutex<ConnInner>,
}

impl Conn {
    fn new(original: TupleId, now: Instant) -> Self {
        Self {
            original,
            created_at: now,
            inner: Mutex::new(ConnInner {
                reply: original.reply(),
                state: ConnState::New,
                last_used: now,
                snat: None,
                dnat: None,
                links: [None, None],
            }),
        }
    }

    pub fn original(&self) -> TupleId {
        self.original
    }

    /// The tuple reply packets carry, after any NAT.
    pub fn reply(&self) -> TupleId {
        self.inner.lock().reply
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Whether the NAT table has already decided this connection's
    /// rewrite of type `nat`.
    pub fn nat_decided(&self, nat: NatType) -> bool {
        self.inner.lock().nat_slot(nat).is_some()
    }

    pub fn nat(&self, nat: NatType) -> Option<NatRewrite> {
        self.inner.lock().nat_slot(nat).flatten()
    }

    fn timed_out(&self, now: Instant, timeouts: &ConnTrackTimeouts) -> bool {
        let inner = self.inner.lock();
        let limit = timeouts.idle_limit(self.original.transport, inner.state);
        now.saturating_duration_since(inner.last_used) > limit
    }

    fn touch(&self, now: Instant, direction: Direction) {
        let mut inner = self.inner.lock();
        inner.last_used = now;
        if direction == Direction::Reply {
            inner.state = ConnState::Established;
        }
    }
}

/// A connection plus the direction a packet matched it in.
#[derive(Debug, Clone)]
pub struct TrackedConn {
    pub conn: Arc<Conn>,
    pub direction: Direction,
}

impl TrackedConn {
    /// How a packet in this direction should look after every NAT
    /// rewrite recorded on the connection.
    pub fn nat_target(&self) -> TupleId {
        match self.direction {
            Direction::Original => self.conn.reply().reply(),
            Direction::Reply => self.conn.original.reply(),
        }
    }
}

/// Snapshot of one connection for the admin interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    pub original: TupleId,
    pub reply: TupleId,
    pub state: ConnState,
    pub age: Duration,
    pub idle: Duration,
}

/// Counters kept by the table.
#[derive(Debug, Default)]
pub struct ConnTrackStats {
    pub created: Counter,
    pub reaped: Counter,
    pub untracked: Counter,
}

struct TupleEntry {
    id: TupleId,
    conn: Arc<Conn>,
    direction: Direction,
}

#[derive(Default)]
struct Bucket {
    tuples: Mutex<IndexList<TupleEntry>>,
}

thread_local! {
    static HELD_BUCKET: Cell<Option<usize>> = const { Cell::new(None) };
}

/// A locked bucket. Acquisition checks the ordering rule.
struct BucketGuard<'a> {
    guard: MutexGuard<'a, IndexList<TupleEntry>>,
    prev: Option<usize>,
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        HELD_BUCKET.with(|h| h.set(self.prev));
    }
}

impl Deref for BucketGuard<'_> {
    type Target = IndexList<TupleEntry>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for BucketGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// The connection tracking table.
pub struct ConnTrack {
    seed: u32,
    buckets: Box<[Bucket]>,
    timeouts: ConnTrackTimeouts,
    max_connections: usize,
    count: AtomicUsize,
    clock: Arc<dyn Clock>,
    stats: ConnTrackStats,
}

impl ConnTrack {
    pub fn new(config: &ConnTrackConfig, seed: u32, clock: Arc<dyn Clock>) -> Self {
        let buckets = (0..config.buckets.max(1)).map(|_| Bucket::default()).collect();
        Self {
            seed,
            buckets,
            timeouts: config.timeouts.clone(),
            max_connections: config.max_connections,
            count: AtomicUsize::new(0),
            clock,
            stats: ConnTrackStats::default(),
        }
    }

    pub fn stats(&self) -> &ConnTrackStats {
        &self.stats
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, tuple: &TupleId) -> usize {
        hash_with_seed(self.seed, tuple) as usize % self.buckets.len()
    }

    fn lock_bucket(&self, index: usize) -> BucketGuard<'_> {
        let prev = HELD_BUCKET.with(|h| h.get());
        debug_assert!(
            prev.is_none_or(|held| held < index),
            "conntrack lock order violated: holding bucket {:?}, acquiring {}",
            prev,
            index
        );
        let guard = self.buckets[index].tuples.lock();
        HELD_BUCKET.with(|h| h.set(Some(index)));
        BucketGuard { guard, prev }
    }

    /// Find the live connection for `tuple` without creating one.
    pub fn lookup(&self, tuple: &TupleId) -> Option<TrackedConn> {
        let now = self.clock.now();
        let index = self.bucket_index(tuple);
        let mut bucket = self.lock_bucket(index);
        self.scan_bucket(&mut bucket, index, tuple, now)
    }

    /// Return the connection `tuple` belongs to, creating it when absent.
    ///
    /// Returns `None` when the table is full; the packet then goes through
    /// untracked.
    pub fn get_or_create(&self, tuple: &TupleId) -> Option<TrackedConn> {
        let now = self.clock.now();
        let index = self.bucket_index(tuple);
        {
            let mut bucket = self.lock_bucket(index);
            if let Some(found) = self.scan_bucket(&mut bucket, index, tuple, now) {
                found.conn.touch(now, found.direction);
                return Some(found);
            }
        }

        let reserved = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.max_connections).then_some(n + 1)
            });
        if reserved.is_err() {
            self.stats.untracked.inc();
            debug!(?tuple, "conntrack table full, packet left untracked");
            return None;
        }
        Some(self.insert_conn(Arc::new(Conn::new(*tuple, now)), now))
    }

    /// Scan one locked bucket for `tuple`, unlinking expired connections
    /// that can be removed without breaking lock order.
    fn scan_bucket(
        &self,
        bucket: &mut BucketGuard<'_>,
        index: usize,
        tuple: &TupleId,
        now: Instant,
    ) -> Option<TrackedConn> {
        let mut found = None;
        let mut expired: Vec<Handle> = Vec::new();
        for (handle, entry) in bucket.iter() {
            if entry.conn.timed_out(now, &self.timeouts) {
                expired.push(handle);
                continue;
            }
            if found.is_none() && entry.id == *tuple {
                found = Some(TrackedConn {
                    conn: Arc::clone(&entry.conn),
                    direction: entry.direction,
                });
            }
        }
        for handle in expired {
            self.reap_locked(bucket, index, handle);
        }
        found
    }

    /// Unlink the connection owning `handle` when its other tuple lives in
    /// this bucket or a later one. Returns whether it was removed.
    fn reap_locked(&self, bucket: &mut BucketGuard<'_>, index: usize, handle: Handle) -> bool {
        let Some(entry) = bucket.get(handle) else {
            return false;
        };
        let conn = Arc::clone(&entry.conn);
        let other_slot = match entry.direction {
            Direction::Original => 1,
            Direction::Reply => 0,
        };
        let other = conn.inner.lock().links[other_slot];

        match other {
            Some((other_index, _)) if other_index < index => return false,
            Some((other_index, other_handle)) if other_index == index => {
                bucket.remove(other_handle);
            }
            Some((other_index, other_handle)) => {
                let mut other_bucket = self.lock_bucket(other_index);
                other_bucket.remove(other_handle);
            }
            None => {}
        }
        bucket.remove(handle);
        conn.inner.lock().links = [None, None];
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.stats.reaped.inc();
        trace!(original = ?conn.original, "reaped connection");
        true
    }

    /// Link both tuples of a fresh connection whose slot in `count` is
    /// already reserved. If another thread inserted the same original tuple
    /// meanwhile, that connection wins and the slot is given back.
    fn insert_conn(&self, conn: Arc<Conn>, now: Instant) -> TrackedConn {
        let original = conn.original;
        let reply = conn.reply();
        let orig_index = self.bucket_index(&original);
        let reply_index = self.bucket_index(&reply);
        let lo = orig_index.min(reply_index);
        let hi = orig_index.max(reply_index);

        let mut lo_guard = self.lock_bucket(lo);
        let mut hi_guard = (hi != lo).then(|| self.lock_bucket(hi));

        {
            let list = pick(orig_index, lo, &mut lo_guard, &mut hi_guard);
            let existing = list.iter().find(|(_, e)| {
                e.id == original && !e.conn.timed_out(now, &self.timeouts)
            });
            if let Some((_, e)) = existing {
                let found = TrackedConn {
                    conn: Arc::clone(&e.conn),
                    direction: e.direction,
                };
                found.conn.touch(now, found.direction);
                self.count.fetch_sub(1, Ordering::Relaxed);
                return found;
            }
        }

        let orig_handle = pick(orig_index, lo, &mut lo_guard, &mut hi_guard).push_back(TupleEntry {
            id: original,
            conn: Arc::clone(&conn),
            direction: Direction::Original,
        });
        let reply_handle = pick(reply_index, lo, &mut lo_guard, &mut hi_guard).push_back(TupleEntry {
            id: reply,
            conn: Arc::clone(&conn),
            direction: Direction::Reply,
        });
        conn.inner.lock().links = [
            Some((orig_index, orig_handle)),
            Some((reply_index, reply_handle)),
        ];

        self.stats.created.inc();
        debug!(?original, "new connection");
        TrackedConn {
            conn,
            direction: Direction::Original,
        }
    }

    /// Record the NAT decision of type `nat` for a connection.
    ///
    /// The first call wins; later calls return `false` and change nothing.
    /// `None` records that no rewrite applies. A source rewrite with port 0
    /// keeps the original port unless that would collide with another
    /// connection, in which case a free port is searched.
    pub fn apply_nat(&self, tracked: &TrackedConn, nat: NatType, rewrite: Option<NatRewrite>) -> bool {
        let conn = &tracked.conn;
        loop {
            let old_reply = {
                let mut inner = conn.inner.lock();
                if inner.nat_slot(nat).is_some() {
                    return false;
                }
                if rewrite.is_none() {
                    *inner.nat_slot(nat) = Some(None);
                    return true;
                }
                inner.reply
            };
            let Some(rw) = rewrite else {
                return false;
            };
            let new_reply = self.unique_reply(conn, &old_reply, nat, rw);

            let old_index = self.bucket_index(&old_reply);
            let new_index = self.bucket_index(&new_reply);
            let lo = old_index.min(new_index);
            let hi = old_index.max(new_index);
            let mut lo_guard = self.lock_bucket(lo);
            let mut hi_guard = (hi != lo).then(|| self.lock_bucket(hi));

            let mut inner = conn.inner.lock();
            if inner.nat_slot(nat).is_some() {
                return false;
            }
            if inner.reply != old_reply {
                continue;
            }
            let Some((_, old_handle)) = inner.links[1] else {
                // Reaped while we were away; nothing left to rewrite.
                *inner.nat_slot(nat) = Some(Some(rw));
                return true;
            };
            pick(old_index, lo, &mut lo_guard, &mut hi_guard).remove(old_handle);
            let handle = pick(new_index, lo, &mut lo_guard, &mut hi_guard).push_back(TupleEntry {
                id: new_reply,
                conn: Arc::clone(conn),
                direction: Direction::Reply,
            });
            inner.links[1] = Some((new_index, handle));
            inner.reply = new_reply;
            *inner.nat_slot(nat) = Some(Some(rw));
            debug!(original = ?conn.original, reply = ?new_reply, ?nat, "NAT recorded");
            return true;
        }
    }

    fn unique_reply(&self, conn: &Arc<Conn>, old_reply: &TupleId, nat: NatType, rw: NatRewrite) -> TupleId {
        let mut candidate = *old_reply;
        match nat {
            NatType::Destination => {
                candidate.src_addr = rw.addr;
                if rw.port != 0 {
                    candidate.src_port = rw.port;
                }
            }
            NatType::Source => {
                candidate.dst_addr = rw.addr;
                if rw.port != 0 {
                    candidate.dst_port = rw.port;
                }
            }
        }
        if nat == NatType::Destination || rw.port != 0 {
            return candidate;
        }

        let start = candidate.dst_port;
        for step in 0..=u16::MAX {
            let port = start.wrapping_add(step);
            if port == 0 {
                continue;
            }
            candidate.dst_port = port;
            match self.lookup(&candidate) {
                Some(other) if !Arc::ptr_eq(&other.conn, conn) => continue,
                _ => return candidate,
            }
        }
        candidate.dst_port = start;
        candidate
    }

    /// Sweep up to `count` buckets starting at `start`, unlinking expired
    /// connections. Returns the bucket to resume from.
    pub fn reap_unused(&self, start: usize, count: usize) -> usize {
        let now = self.clock.now();
        let total = self.buckets.len();
        let start = start % total;
        for i in 0..count.min(total) {
            let index = (start + i) % total;
            let mut bucket = self.lock_bucket(index);
            let expired: Vec<Handle> = bucket
                .iter()
                .filter(|(_, e)| e.conn.timed_out(now, &self.timeouts))
                .map(|(h, _)| h)
                .collect();
            for handle in expired {
                self.reap_locked(&mut bucket, index, handle);
            }
        }
        (start + count.min(total)) % total
    }

    /// Snapshot every live connection.
    pub fn connections(&self) -> Vec<ConnInfo> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for index in 0..self.buckets.len() {
            let bucket = self.lock_bucket(index);
            for (_, e) in bucket.iter() {
                if e.direction != Direction::Original || e.conn.timed_out(now, &self.timeouts) {
                    continue;
                }
                let inner = e.conn.inner.lock();
                out.push(ConnInfo {
                    original: e.conn.original,
                    reply: inner.reply,
                    state: inner.state,
                    age: now.saturating_duration_since(e.conn.created_at),
                    idle: now.saturating_duration_since(inner.last_used),
                });
            }
        }
        out
    }

    /// Drop every connection.
    pub fn clear(&self) {
        for index in 0..self.buckets.len() {
            let mut bucket = self.lock_bucket(index);
            let originals = bucket
                .iter()
                .filter(|(_, e)| e.direction == Direction::Original)
                .count();
            bucket.clear();
            self.count.fetch_sub(originals, Ordering::Relaxed);
        }
    }
}

fn pick<'a, 'b>(
    index: usize,
    lo: usize,
    lo_guard: &'a mut BucketGuard<'b>,
    hi_guard: &'a mut Option<BucketGuard<'b>>,
) -> &'a mut IndexList<TupleEntry> {
    match hi_guard {
        Some(hi) if index != lo => hi,
        _ => lo_guard,
    }
}

impl std::fmt::Debug for ConnTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnTrack")
            .field("buckets", &self.buckets.len())
            .field("connections", &self.len())
            .finish()
    }
}
