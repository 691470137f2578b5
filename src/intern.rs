//! Reference-counted interning of immutable values.
//!
//! A [`Pool`] stores one copy of each distinct value and hands out small
//! integer [`Reference`]s to it. Routes keep references instead of values, so
//! the millions of routes sharing a next hop or a set of attributes share a
//! single stored copy. A value is physically dropped when its last reference
//! is taken back.

use ahash::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::num::NonZeroU32;

/// Handle to a value interned in a [`Pool`]. Handles are never zero, so
/// `Option<Reference<T>>` has the same size as the handle.
pub struct Reference<T> {
    index: NonZeroU32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Reference<T> {
    fn new(index: NonZeroU32) -> Reference<T> {
        Reference {
            index,
            _marker: PhantomData,
        }
    }

    fn slot(&self) -> usize {
        self.index.get() as usize - 1
    }

    pub fn as_u32(&self) -> u32 {
        self.index.get()
    }
}

impl<T> Clone for Reference<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Reference<T> {}

impl<T> PartialEq for Reference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Reference<T> {}

impl<T> Hash for Reference<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state)
    }
}

impl<T> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({})", self.index)
    }
}

#[derive(Clone)]
struct Entry<T> {
    value: T,
    hash: u64,
    refs: u32,
    // Neighbours sharing the same hash.
    prev: Option<Reference<T>>,
    next: Option<Reference<T>>,
}

#[derive(Clone)]
enum Slot<T> {
    Vacant,
    Occupied(Entry<T>),
}

/// Pool of interned values.
///
/// Slots live in a single vector addressed by reference. Values sharing a
/// hash are chained through their slots, and only the head of each chain is
/// kept in the bucket map. Released slots are recycled through a free list to
/// keep references small.
#[derive(Clone)]
pub struct Pool<T, S = RandomState> {
    slots: Vec<Slot<T>>,
    free: Vec<Reference<T>>,
    buckets: HashMap<u64, Reference<T>>,
    hasher: S,
}

impl<T: Hash + Eq> Pool<T> {
    pub fn new() -> Pool<T> {
        Pool::with_hasher(RandomState::new())
    }
}

impl<T: Hash + Eq> Default for Pool<T> {
    fn default() -> Self {
        Pool::new()
    }
}

impl<T: Hash + Eq, S: BuildHasher> Pool<T, S> {
    pub fn with_hasher(hasher: S) -> Pool<T, S> {
        Pool {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: HashMap::new(),
            hasher,
        }
    }

    fn entry(&self, reference: Reference<T>) -> Option<&Entry<T>> {
        match self.slots.get(reference.slot()) {
            Some(Slot::Occupied(entry)) => Some(entry),
            _ => None,
        }
    }

    fn entry_mut(&mut self, reference: Reference<T>) -> Option<&mut Entry<T>> {
        match self.slots.get_mut(reference.slot()) {
            Some(Slot::Occupied(entry)) => Some(entry),
            _ => None,
        }
    }

    // Chains only ever link live slots.
    fn linked_mut(&mut self, reference: Reference<T>) -> &mut Entry<T> {
        self.entry_mut(reference)
            .unwrap_or_else(|| unreachable!("broken intern chain at {reference:?}"))
    }

    fn allocate(&mut self, entry: Entry<T>) -> Reference<T> {
        if let Some(reference) = self.free.pop() {
            self.slots[reference.slot()] = Slot::Occupied(entry);
            return reference;
        }
        self.slots.push(Slot::Occupied(entry));
        let index = u32::try_from(self.slots.len())
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or_else(|| unreachable!("intern pool exhausted"));
        Reference::new(index)
    }

    /// Returns the stored value for a reference, if it is still live.
    pub fn get(&self, reference: Reference<T>) -> Option<&T> {
        self.entry(reference).map(|entry| &entry.value)
    }

    /// Returns the reference a value is interned under without adding it.
    pub fn reference(&self, value: &T) -> Option<Reference<T>> {
        let hash = self.hasher.hash_one(value);
        let mut cursor = self.buckets.get(&hash).copied();
        while let Some(reference) = cursor {
            let entry = self.entry(reference)?;
            if entry.value == *value {
                return Some(reference);
            }
            cursor = entry.next;
        }
        None
    }

    /// Interns a value, returning its reference. An equal value already in
    /// the pool gets one more reference instead of a new slot.
    pub fn put(&mut self, value: T) -> Reference<T> {
        let hash = self.hasher.hash_one(&value);
        let mut tail = None;
        let mut cursor = self.buckets.get(&hash).copied();
        while let Some(reference) = cursor {
            let entry = self.linked_mut(reference);
            if entry.value == value {
                entry.refs += 1;
                return reference;
            }
            tail = Some(reference);
            cursor = entry.next;
        }

        let reference = self.allocate(Entry {
            value,
            hash,
            refs: 1,
            prev: tail,
            next: None,
        });
        match tail {
            Some(tail) => self.linked_mut(tail).next = Some(reference),
            None => {
                self.buckets.insert(hash, reference);
            }
        }
        reference
    }

    /// Releases one reference. The value is dropped with its last reference.
    pub fn take(&mut self, reference: Reference<T>) {
        let Some(entry) = self.entry_mut(reference) else {
            debug_assert!(false, "take on released reference {reference:?}");
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        let (hash, prev, next) = (entry.hash, entry.prev, entry.next);

        match prev {
            Some(prev) => self.linked_mut(prev).next = next,
            None => match next {
                Some(next) => {
                    self.buckets.insert(hash, next);
                }
                None => {
                    self.buckets.remove(&hash);
                }
            },
        }
        if let Some(next) = next {
            self.linked_mut(next).prev = prev;
        }
        self.slots[reference.slot()] = Slot::Vacant;
        self.free.push(reference);
    }

    /// Number of distinct live values.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::{BuildHasherDefault, Hasher};

    // Every value lands in the same bucket.
    #[derive(Default)]
    struct CollidingHasher;

    impl Hasher for CollidingHasher {
        fn finish(&self) -> u64 {
            42
        }
        fn write(&mut self, _: &[u8]) {}
    }

    type CollidingPool = Pool<String, BuildHasherDefault<CollidingHasher>>;

    #[test]
    fn put_get() {
        let mut pool = Pool::new();
        let a = pool.put("foo".to_string());
        let b = pool.put("bar".to_string());
        assert_ne!(a, b);
        assert_eq!(pool.get(a).map(String::as_str), Some("foo"));
        assert_eq!(pool.get(b).map(String::as_str), Some("bar"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn reference_counting() {
        let mut pool = Pool::new();
        let refs: Vec<_> = (0..5).map(|_| pool.put(2038u32)).collect();
        assert!(refs.windows(2).all(|w| w[0] == w[1]));
        for reference in &refs[1..] {
            pool.take(*reference);
        }
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(refs[0]), Some(&2038));
        pool.take(refs[0]);
        assert_eq!(pool.len(), 0);
        assert!(pool.is_empty());
        assert_eq!(pool.get(refs[0]), None);
    }

    #[test]
    fn reference_lookup_does_not_insert() {
        let mut pool = Pool::new();
        assert_eq!(pool.reference(&7u32), None);
        let seven = pool.put(7u32);
        assert_eq!(pool.reference(&7u32), Some(seven));
        assert_eq!(pool.len(), 1);
        pool.take(seven);
        assert_eq!(pool.reference(&7u32), None);
    }

    #[test]
    fn slots_are_recycled() {
        let mut pool = Pool::new();
        let first = pool.put(1u64);
        let second = pool.put(2u64);
        pool.take(second);
        let third = pool.put(3u64);
        assert_eq!(third, second);
        assert_eq!(pool.get(first), Some(&1));
        assert_eq!(pool.get(third), Some(&3));

        // Putting the surviving value again must not hand out the recycled
        // slot.
        assert_eq!(pool.put(1u64), first);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn collisions_are_resolved_by_equality() {
        let mut pool = CollidingPool::default();
        let a = pool.put("a".to_string());
        let b = pool.put("b".to_string());
        let c = pool.put("c".to_string());
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.put("b".to_string()), b);
        assert_eq!(pool.reference(&"c".to_string()), Some(c));

        // Middle of the chain.
        pool.take(b);
        pool.take(b);
        assert_eq!(pool.reference(&"b".to_string()), None);
        assert_eq!(pool.reference(&"a".to_string()), Some(a));
        assert_eq!(pool.reference(&"c".to_string()), Some(c));

        // Head of the chain.
        pool.take(a);
        assert_eq!(pool.reference(&"c".to_string()), Some(c));
        let d = pool.put("d".to_string());
        assert_eq!(pool.reference(&"d".to_string()), Some(d));

        // Tail of the chain.
        pool.take(d);
        assert_eq!(pool.reference(&"c".to_string()), Some(c));
        pool.take(c);
        assert!(pool.is_empty());
        assert!(pool.buckets.is_empty());
    }

    #[test]
    fn clones_are_independent() {
        let mut pool = Pool::new();
        let a = pool.put(10u32);
        let snapshot = pool.clone();
        pool.take(a);
        assert_eq!(pool.get(a), None);
        assert_eq!(snapshot.get(a), Some(&10));
        assert_eq!(snapshot.reference(&10), Some(a));
    }

    #[test]
    fn option_reference_is_compact() {
        assert_eq!(
            std::mem::size_of::<Option<Reference<String>>>(),
            std::mem::size_of::<u32>()
        );
    }
}
