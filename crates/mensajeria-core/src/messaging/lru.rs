//! Arena-backed LRU ordering.
//!
//! Nodes live in a `Vec` and link to each other by index, forming an
//! intrusive doubly linked list from least to most recently used. Freed
//! slots are recycled through a free list. This structure only tracks
//! order; it never decides whether an entry may be dropped.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Node<K> {
    key: Option<K>,
    prev: usize,
    next: usize,
}

/// Recency list over keys of type `K`.
pub(crate) struct LruList<K> {
    nodes: Vec<Node<K>>,
    index: HashMap<K, usize>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Copy + Eq + Hash> LruList<K> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Insert `key` as most recent, or move it there if present.
    pub(crate) fn touch(&mut self, key: K) {
        if self.promote(&key) {
            return;
        }

        let node = Node {
            key: Some(key),
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_back(slot);
    }

    /// Move `key` to most recent if present. Never inserts.
    pub(crate) fn promote(&mut self, key: &K) -> bool {
        let Some(&slot) = self.index.get(key) else {
            return false;
        };
        self.unlink(slot);
        self.push_back(slot);
        true
    }

    /// Remove `key`, returning whether it was present.
    pub(crate) fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.unlink(slot);
        self.nodes[slot].key = None;
        self.free.push(slot);
        true
    }

    /// Keys from least to most recently used.
    pub(crate) fn iter(&self) -> impl Iterator<Item = K> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let node = &self.nodes[cursor];
            cursor = node.next;
            node.key
        })
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn push_back(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = NIL;
        if self.tail == NIL {
            self.head = slot;
        } else {
            self.nodes[self.tail].next = slot;
        }
        self.tail = slot;
    }
}
