#![forbid(unsafe_code)]

//! Generation-checked index arena.
//!
//! The binding graph never stores addresses. Observer nodes, slots and
//! bindings live in [`Arena`]s and refer to each other through small `Copy`
//! keys made of a slot `index` and the slot's `generation` at insertion time.
//! Removing an entry bumps its generation, so a key that outlived its entry is
//! detected on lookup instead of aliasing whatever reused the slot.
//!
//! # Invariants
//!
//! 1. A key returned by [`Arena::insert`] resolves until [`Arena::remove`] is
//!    called with it; afterwards every lookup with it returns `None`.
//! 2. Keys stay valid across growth of the backing `Vec`.
//! 3. Freed slots are reused LIFO.

use std::fmt;
use std::marker::PhantomData;

/// Raw index + generation pair shared by all typed keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RawKey {
    index: u32,
    generation: u32,
}

impl fmt::Debug for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Typed arena key.
pub(crate) trait ArenaKey: Copy {
    fn from_raw(raw: RawKey) -> Self;
    fn raw(self) -> RawKey;
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $vis:vis struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $name($crate::arena::RawKey);

        impl $crate::arena::ArenaKey for $name {
            #[inline]
            fn from_raw(raw: $crate::arena::RawKey) -> Self {
                Self(raw)
            }

            #[inline]
            fn raw(self) -> $crate::arena::RawKey {
                self.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }
    };
}
pub(crate) use arena_key;

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Vec-backed storage addressed by generation-checked keys.
pub(crate) struct Arena<K, T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<fn() -> K>,
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    /// Store `value`, reusing a freed entry when one exists.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` entries are live at once. Freed
    /// entries are reused, so the bound is on simultaneous nodes, not on
    /// allocations over the thread's lifetime.
    pub(crate) fn insert(&mut self, value: T) -> K {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            debug_assert!(entry.value.is_none());
            entry.value = Some(value);
            return K::from_raw(RawKey {
                index,
                generation: entry.generation,
            });
        }
        let index = u32::try_from(self.entries.len()).expect("arena index overflow");
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        K::from_raw(RawKey {
            index,
            generation: 0,
        })
    }

    pub(crate) fn remove(&mut self, key: K) -> Option<T> {
        let raw = key.raw();
        let entry = self.entries.get_mut(raw.index as usize)?;
        if entry.generation != raw.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(raw.index);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub(crate) fn get(&self, key: K) -> Option<&T> {
        let raw = key.raw();
        let entry = self.entries.get(raw.index as usize)?;
        if entry.generation != raw.generation {
            return None;
        }
        entry.value.as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let raw = key.raw();
        let entry = self.entries.get_mut(raw.index as usize)?;
        if entry.generation != raw.generation {
            return None;
        }
        entry.value.as_mut()
    }

    #[inline]
    pub(crate) fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    arena_key! {
        struct TestKey;
    }

    #[test]
    fn insert_and_get() {
        let mut arena: Arena<TestKey, &str> = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn stale_key_is_rejected_after_reuse() {
        let mut arena: Arena<TestKey, u32> = Arena::new();
        let first = arena.insert(1);
        assert_eq!(arena.remove(first), Some(1));
        let second = arena.insert(2);

        // Same slot, new generation.
        assert_eq!(first.raw().index, second.raw().index);
        assert!(arena.get(first).is_none());
        assert!(arena.get_mut(first).is_none());
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.get(second), Some(&2));
    }

    #[test]
    fn double_remove_is_noop() {
        let mut arena: Arena<TestKey, u32> = Arena::new();
        let k = arena.insert(7);
        assert_eq!(arena.remove(k), Some(7));
        assert_eq!(arena.remove(k), None);
        assert_eq!(arena.len(), 0);
        assert!(!arena.contains(k));
    }

    #[test]
    fn keys_survive_growth() {
        let mut arena: Arena<TestKey, usize> = Arena::new();
        let keys: Vec<_> = (0..1000).map(|i| arena.insert(i)).collect();
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(arena.get(*k), Some(&i));
        }
    }
}
