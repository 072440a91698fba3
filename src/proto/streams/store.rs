use std::ops;

use fnv::FnvHashMap;
use slab::Slab;

use crate::frame::StreamId;

use super::stream::Stream;

/// Storage for streams: a slab arena plus a stream-id index.
///
/// Streams reference each other (priority tree parent / children links, the
/// backlog) through copyable [`Key`] indices into the arena rather than
/// through pointers.
#[derive(Debug, Default)]
pub struct Store {
    slab: Slab<Stream>,
    ids: FnvHashMap<StreamId, usize>,
}

/// References an entry in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(usize);

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn insert(&mut self, id: StreamId, val: Stream) -> Key {
        let key = self.slab.insert(val);
        let prev = self.ids.insert(id, key);
        assert!(prev.is_none(), "duplicate stream id {id:?}");

        Key(key)
    }

    pub fn find(&self, id: StreamId) -> Option<Key> {
        self.ids.get(&id).map(|&key| Key(key))
    }

    /// Non-panicking lookup. A slab slot can be vacated by pruning while a
    /// worker still holds its key, so handle-driven paths resolve through
    /// here and double-check the stream id.
    pub fn get(&self, key: Key) -> Option<&Stream> {
        self.slab.get(key.0)
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut Stream> {
        self.slab.get_mut(key.0)
    }

    pub fn remove(&mut self, key: Key) -> Stream {
        let stream = self.slab.remove(key.0);
        let removed = self.ids.remove(&stream.id);
        debug_assert_eq!(removed, Some(key.0));
        stream
    }

    /// Snapshot of every live key. Taken before sweeps that mutate the store
    /// while walking it.
    pub fn keys(&self) -> Vec<Key> {
        self.ids.values().map(|&key| Key(key)).collect()
    }
}

impl ops::Index<Key> for Store {
    type Output = Stream;

    fn index(&self, key: Key) -> &Self::Output {
        self.slab.index(key.0)
    }
}

impl ops::IndexMut<Key> for Store {
    fn index_mut(&mut self, key: Key) -> &mut Self::Output {
        self.slab.index_mut(key.0)
    }
}
