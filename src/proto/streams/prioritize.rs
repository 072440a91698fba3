use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::Notify;

use crate::frame::{DEFAULT_INITIAL_WINDOW_SIZE, Reason};

use super::flow_control::FlowControl;
use super::store::{Key, Store};

/// The connection-level send window and the backlog of streams waiting for
/// credit from it.
///
/// A worker that wants to send response data asks for a reservation. When
/// the connection window cannot cover it, the stream enters the backlog
/// (with `[0, 0]` entries for its ancestors up to the connection root) and
/// the worker suspends. A connection WINDOW_UPDATE that brings the window
/// back above zero releases the backlog: small enough backlogs are granted
/// whole, otherwise the fresh credit is split along the priority tree in
/// weighted shares.
#[derive(Debug)]
pub struct Prioritize {
    /// Connection-level send window.
    pub flow: FlowControl,

    backlog: IndexMap<Node, Entry>,

    /// Sum of `remaining` over all entries.
    backlog_size: u64,

    /// Sum of `granted` over all entries: credit allocated by a release
    /// but not yet claimed by its worker. The next release waits until
    /// this drains, so credit is never handed out twice.
    granted_total: u64,
}

/// A node of the priority tree: a stream, or the connection at the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Root,
    Stream(Key),
}

/// Backlog bookkeeping for one node.
///
/// `remaining` is reservation not yet covered by any credit; `granted` is
/// credit allocated to this node but not yet claimed by its worker.
#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    remaining: u32,
    granted: u32,
}

/// What a reservation attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserved {
    /// The caller may send this many bytes now.
    Granted(u32),
    /// No credit available; suspend until woken.
    Wait,
}

impl Prioritize {
    pub fn new() -> Prioritize {
        Prioritize {
            flow: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
            backlog: IndexMap::new(),
            backlog_size: 0,
            granted_total: 0,
        }
    }

    #[cfg(test)]
    pub fn backlog_size(&self) -> u64 {
        self.backlog_size
    }

    /// One pass of the reservation protocol, run under the connection lock.
    ///
    /// `requested` is clamped by the stream's own send window before the
    /// connection window is consulted; a stream whose window is empty waits
    /// for a stream-level WINDOW_UPDATE without entering the backlog.
    pub fn try_reserve(&mut self, store: &mut Store, key: Key, requested: u32) -> Reserved {
        debug_assert!(requested > 0);

        let stream_available = store[key].send_flow.available();
        if stream_available == 0 {
            return Reserved::Wait;
        }
        let requested = requested.min(stream_available);

        let window = self.flow.window_size();
        let granted;

        if window < 1 || self.backlog_size > 0 {
            match self.backlog.get_mut(&Node::Stream(key)) {
                None => {
                    self.enter_backlog(store, key, requested);
                    return Reserved::Wait;
                }
                Some(entry) if entry.granted > 0 => {
                    // Claim previously allocated credit, bounded by what the
                    // stream window can still take.
                    granted = entry.granted.min(requested);
                    entry.granted -= granted;
                    self.granted_total -= u64::from(granted);

                    if entry.remaining == 0 && entry.granted == 0 {
                        self.backlog.swap_remove(&Node::Stream(key));
                    }
                }
                Some(_) => return Reserved::Wait,
            }
        } else if (window as u32) < requested {
            granted = window as u32;
        } else {
            granted = requested;
        }

        self.flow.consume(granted);
        store[key].send_flow.consume(granted);

        Reserved::Granted(granted)
    }

    /// Insert `key` into the backlog with the full reservation, together
    /// with `[0, 0]` entries for every ancestor up to the root so the
    /// weighted allocation can reach it.
    fn enter_backlog(&mut self, store: &Store, key: Key, requested: u32) {
        tracing::trace!(
            "stream {:?} enters backlog; requested={}",
            store[key].id,
            requested
        );

        self.backlog.insert(
            Node::Stream(key),
            Entry {
                remaining: requested,
                granted: 0,
            },
        );
        self.backlog_size += u64::from(requested);

        let mut parent = store[key].parent;
        loop {
            let node = match parent {
                Some(key) => {
                    parent = store[key].parent;
                    Node::Stream(key)
                }
                None => Node::Root,
            };

            self.backlog.entry(node).or_default();

            if node == Node::Root {
                return;
            }
        }
    }

    /// Drop any backlog state for a stream that stopped being writable.
    pub fn forget(&mut self, key: Key) {
        if let Some(entry) = self.backlog.swap_remove(&Node::Stream(key)) {
            self.backlog_size -= u64::from(entry.remaining);
            self.granted_total -= u64::from(entry.granted);
        }
    }

    /// Grow the connection send window from a WINDOW_UPDATE on stream 0.
    ///
    /// Once the window is positive again and no earlier grants are still
    /// waiting to be claimed, the backlog is released. The returned
    /// notifies are the streams to wake; they are woken *after* the
    /// connection lock is dropped.
    pub fn increment_connection_window(
        &mut self,
        store: &Store,
        increment: u32,
    ) -> Result<Vec<Arc<Notify>>, Reason> {
        self.flow.increase(increment)?;

        if self.flow.window_size() > 0 && self.backlog_size > 0 && self.granted_total == 0 {
            return Ok(self.release(store));
        }

        Ok(Vec::new())
    }

    /// Release the backlog against the now-positive connection window.
    fn release(&mut self, store: &Store) -> Vec<Arc<Notify>> {
        debug_assert_eq!(self.granted_total, 0);

        let available = self.flow.available();
        let mut wake = Vec::new();

        if self.backlog_size <= u64::from(available) {
            // The fresh credit covers every reservation: drop the whole
            // backlog and let the woken workers claim directly from the
            // window.
            tracing::trace!("backlog released whole; size={}", self.backlog_size);
            for (node, _) in std::mem::take(&mut self.backlog) {
                if let Node::Stream(key) = node {
                    wake.push(store[key].capacity.clone());
                }
            }
            self.backlog_size = 0;
        } else {
            tracing::trace!(
                "weighted release; available={} backlog={}",
                available,
                self.backlog_size
            );
            self.allocate(store, Node::Root, available);

            for (node, entry) in &self.backlog {
                if entry.granted > 0 {
                    if let Node::Stream(key) = *node {
                        wake.push(store[key].capacity.clone());
                    }
                }
            }
        }

        wake
    }

    /// Weighted tree allocation: hand `pool` bytes to `node` and its
    /// backlogged descendants, children sharing in proportion to their
    /// weights. Returns the unallocated tail.
    ///
    /// A zero share from integer division is bumped to one byte so no child
    /// can starve the loop; the slight over-allocation this can cause is
    /// absorbed by the signed pool.
    fn allocate(&mut self, store: &Store, node: Node, pool: u32) -> u32 {
        let mut pool = i64::from(pool);

        if let Some(entry) = self.backlog.get_mut(&node) {
            if i64::from(entry.remaining) >= pool {
                entry.remaining -= pool as u32;
                entry.granted += pool as u32;
                self.backlog_size -= pool as u64;
                self.granted_total += pool as u64;
                return 0;
            }

            let moved = entry.remaining;
            entry.granted += moved;
            entry.remaining = 0;
            self.backlog_size -= u64::from(moved);
            self.granted_total += u64::from(moved);
            pool -= i64::from(moved);
        }

        let mut recipients = self.backlogged_children(store, node);
        if recipients.is_empty() {
            self.backlog.swap_remove(&node);
            return pool.max(0) as u32;
        }

        while pool > 0 && !recipients.is_empty() {
            let total_weight: u64 = recipients
                .iter()
                .map(|&key| u64::from(store[key].effective_weight()))
                .sum();
            let snapshot = pool;

            let mut satisfied = Vec::new();
            for &child in &recipients {
                let weight = u64::from(store[child].effective_weight());
                let mut share = (snapshot as u64 * weight / total_weight) as i64;
                if share == 0 {
                    share = 1;
                }

                let remainder =
                    i64::from(self.allocate(store, Node::Stream(child), share as u32));
                if remainder > 0 {
                    // Fully satisfied downstream; out of the running.
                    satisfied.push(child);
                }

                pool -= share - remainder;
            }

            recipients.retain(|key| !satisfied.contains(key));
        }

        pool.max(0) as u32
    }

    fn backlogged_children(&self, store: &Store, node: Node) -> Vec<Key> {
        match node {
            Node::Root => self
                .backlog
                .keys()
                .filter_map(|n| match n {
                    Node::Stream(key) if store[*key].parent.is_none() => Some(*key),
                    _ => None,
                })
                .collect(),
            Node::Stream(key) => store[key]
                .children
                .iter()
                .copied()
                .filter(|child| self.backlog.contains_key(&Node::Stream(*child)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::StreamId;
    use crate::proto::streams::stream::Stream;

    fn store_with(windows: &[(u32, u32, u8)]) -> (Store, Vec<Key>) {
        // (id, send_window, weight)
        let mut store = Store::new();
        let mut keys = Vec::new();
        for &(id, window, weight) in windows {
            let mut stream = Stream::new(StreamId::from(id), window, 65_535);
            stream.weight = weight;
            stream.state.recv_open(false).unwrap();
            stream.state.send_open(false).unwrap();
            let key = store.insert(StreamId::from(id), stream);
            keys.push(key);
        }
        (store, keys)
    }

    #[test]
    fn grants_direct_when_window_covers() {
        let (mut store, keys) = store_with(&[(1, 65_535, 15)]);
        let mut prio = Prioritize::new();

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 1_000),
            Reserved::Granted(1_000)
        );
        assert_eq!(prio.flow.available(), 64_535);
        assert_eq!(store[keys[0]].send_flow.available(), 64_535);
    }

    #[test]
    fn partial_grant_when_window_short() {
        let (mut store, keys) = store_with(&[(1, 100_000, 15)]);
        let mut prio = Prioritize::new();

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 100_000),
            Reserved::Granted(65_535)
        );
        assert_eq!(prio.flow.available(), 0);
    }

    #[test]
    fn stream_window_caps_the_request() {
        let (mut store, keys) = store_with(&[(1, 500, 15)]);
        let mut prio = Prioritize::new();

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 2_000),
            Reserved::Granted(500)
        );
        // Connection window only paid for what the stream could take.
        assert_eq!(prio.flow.available(), 65_035);
    }

    #[test]
    fn empty_stream_window_waits_without_backlog() {
        let (mut store, keys) = store_with(&[(1, 0, 15)]);
        let mut prio = Prioritize::new();

        assert_eq!(prio.try_reserve(&mut store, keys[0], 100), Reserved::Wait);
        assert_eq!(prio.backlog_size(), 0);
    }

    #[test]
    fn exhausted_connection_window_backlogs() {
        let (mut store, keys) = store_with(&[(1, 100_000, 15), (3, 100_000, 15)]);
        let mut prio = Prioritize::new();

        // Stream 1 drains the connection window.
        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 100_000),
            Reserved::Granted(65_535)
        );

        // Stream 3 has to queue.
        assert_eq!(prio.try_reserve(&mut store, keys[1], 4_000), Reserved::Wait);
        assert_eq!(prio.backlog_size(), 4_000);

        // So does stream 1's remainder.
        assert_eq!(prio.try_reserve(&mut store, keys[0], 34_465), Reserved::Wait);
        assert_eq!(prio.backlog_size(), 38_465);
    }

    #[test]
    fn small_backlog_released_whole() {
        let (mut store, keys) = store_with(&[(1, 100_000, 15)]);
        let mut prio = Prioritize::new();

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 100_000),
            Reserved::Granted(65_535)
        );
        assert_eq!(prio.try_reserve(&mut store, keys[0], 34_465), Reserved::Wait);

        let woken = prio
            .increment_connection_window(&store, 50_000)
            .unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(prio.backlog_size(), 0);

        // The woken worker claims directly from the window.
        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 34_465),
            Reserved::Granted(34_465)
        );
        assert_eq!(prio.flow.available(), 50_000 - 34_465);
    }

    #[test]
    fn weighted_release_splits_by_weight() {
        // s1 weight 16 (wire 15), s2 weight 8 (wire 7), both under the root.
        let (mut store, keys) = store_with(&[(1, 200_000, 15), (3, 200_000, 7)]);
        let mut prio = Prioritize::new();

        // Exhaust the connection window on an unrelated grant.
        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 65_535),
            Reserved::Granted(65_535)
        );

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 100_000),
            Reserved::Wait
        );
        assert_eq!(
            prio.try_reserve(&mut store, keys[1], 100_000),
            Reserved::Wait
        );

        let woken = prio.increment_connection_window(&store, 1_500).unwrap();
        assert_eq!(woken.len(), 2);

        // Weighted shares: 16/24 and 8/24 of 1500.
        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 100_000),
            Reserved::Granted(1_000)
        );
        assert_eq!(
            prio.try_reserve(&mut store, keys[1], 100_000),
            Reserved::Granted(500)
        );

        // Their reservations are still owed the rest.
        assert_eq!(prio.backlog_size(), 200_000 - 1_500);
    }

    #[test]
    fn child_share_flows_through_parent() {
        let (mut store, keys) = store_with(&[(1, 200_000, 15), (3, 200_000, 15)]);
        // Stream 3 depends on stream 1.
        store[keys[1]].parent = Some(keys[0]);
        let children = vec![keys[1]];
        store[keys[0]].children = children;

        let mut prio = Prioritize::new();
        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 65_535),
            Reserved::Granted(65_535)
        );
        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 1_000),
            Reserved::Wait
        );
        assert_eq!(
            prio.try_reserve(&mut store, keys[1], 100_000),
            Reserved::Wait
        );

        // 10_000 fresh bytes: parent's 1_000 owed is covered first, the rest
        // flows down to the child.
        let woken = prio.increment_connection_window(&store, 10_000).unwrap();
        assert_eq!(woken.len(), 2);

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 1_000),
            Reserved::Granted(1_000)
        );
        assert_eq!(
            prio.try_reserve(&mut store, keys[1], 100_000),
            Reserved::Granted(9_000)
        );
    }

    #[test]
    fn release_recovers_after_a_grant_evaporates() {
        let (mut store, keys) = store_with(&[(1, 200_000, 15), (3, 200_000, 15)]);
        let mut prio = Prioritize::new();

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 65_535),
            Reserved::Granted(65_535)
        );
        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 100_000),
            Reserved::Wait
        );
        assert_eq!(
            prio.try_reserve(&mut store, keys[1], 100_000),
            Reserved::Wait
        );

        // 1_000 bytes get split between the two waiters...
        prio.increment_connection_window(&store, 1_000).unwrap();

        // ...but stream 1 is reset before claiming its share, so its 500
        // bytes evaporate and the window stays positive forever.
        prio.forget(keys[0]);
        assert_eq!(
            prio.try_reserve(&mut store, keys[1], 100_000),
            Reserved::Granted(500)
        );

        // The next increment must still release the rest of the backlog
        // even though the window never returned to zero.
        let woken = prio.increment_connection_window(&store, 100).unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(
            prio.try_reserve(&mut store, keys[1], 99_500),
            Reserved::Granted(600)
        );
    }

    #[test]
    fn forget_clears_reservation() {
        let (mut store, keys) = store_with(&[(1, 100_000, 15)]);
        let mut prio = Prioritize::new();

        assert_eq!(
            prio.try_reserve(&mut store, keys[0], 65_535),
            Reserved::Granted(65_535)
        );
        assert_eq!(prio.try_reserve(&mut store, keys[0], 1_000), Reserved::Wait);
        assert_eq!(prio.backlog_size(), 1_000);

        prio.forget(keys[0]);
        assert_eq!(prio.backlog_size(), 0);
    }
}
