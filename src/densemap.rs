//! A map of dense integer key to value, used as the arena for graph nodes
//! and builds.

use std::marker::PhantomData;

/// A typed handle into a `DenseMap`.
pub trait Index: From<usize> + Copy {
    fn index(&self) -> usize;
}

/// Wraps Vec<V> so that it can only be indexed by its own handle type.
/// Entries are never removed, so a handle stays valid for the life of the map.
pub struct DenseMap<K, V> {
    vec: Vec<V>,
    key_type: PhantomData<K>,
}

impl<K, V> Default for DenseMap<K, V> {
    fn default() -> Self {
        DenseMap {
            vec: Vec::new(),
            key_type: PhantomData,
        }
    }
}

impl<K: Index, V> std::ops::Index<K> for DenseMap<K, V> {
    type Output = V;

    fn index(&self, k: K) -> &Self::Output {
        &self.vec[k.index()]
    }
}

impl<K: Index, V> std::ops::IndexMut<K> for DenseMap<K, V> {
    fn index_mut(&mut self, k: K) -> &mut Self::Output {
        &mut self.vec[k.index()]
    }
}

impl<K: Index, V> DenseMap<K, V> {
    pub fn len(&self) -> usize {
        self.vec.len()
    }

    /// The id the next push() will return.
    pub fn next_id(&self) -> K {
        K::from(self.vec.len())
    }

    pub fn push(&mut self, val: V) -> K {
        let id = K::from(self.vec.len());
        self.vec.push(val);
        id
    }

    pub fn ids(&self) -> impl Iterator<Item = K> {
        (0..self.vec.len()).map(K::from)
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.vec.iter().enumerate().map(|(i, v)| (K::from(i), v))
    }
}

impl<K: Index, V: Clone> DenseMap<K, V> {
    /// A map with one `default` entry per id below `len`.
    pub fn filled(len: usize, default: V) -> Self {
        DenseMap {
            vec: vec![default; len],
            key_type: PhantomData,
        }
    }

    /// Sets an entry, growing the map with `default` to reach it.
    pub fn set_grow(&mut self, k: K, v: V, default: V) {
        if k.index() >= self.vec.len() {
            self.vec.resize(k.index() + 1, default);
        }
        self.vec[k.index()] = v
    }

    /// Reads an entry, treating ids past the end as `default`.
    pub fn get_or(&self, k: K, default: V) -> V {
        self.vec.get(k.index()).cloned().unwrap_or(default)
    }
}
