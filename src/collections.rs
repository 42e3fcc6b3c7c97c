//! Hash collections shared by the crate
//!
//! With the default `gxhash` feature, maps and sets hash with gxhash. Without
//! it (for CPUs lacking AES-NI or SSE2) they are plain std collections. Both
//! variants expose the same `new`/`with_capacity` constructors through
//! [`HashMapExt`] and [`HashSetExt`], so call sites never change.

#[cfg(feature = "gxhash")]
mod imp {
    pub use gxhash::{GxBuildHasher as FastHasher, HashMap, HashMapExt, HashSet, HashSetExt};
}

#[cfg(not(feature = "gxhash"))]
mod imp {
    /// Hasher builder for collections constructed with an explicit hasher
    pub type FastHasher = std::hash::RandomState;
    /// Map keyed with [`FastHasher`]
    pub type HashMap<K, V> = std::collections::HashMap<K, V>;
    /// Set keyed with [`FastHasher`]
    pub type HashSet<T> = std::collections::HashSet<T>;

    /// Constructors matching `gxhash::HashMapExt`
    pub trait HashMapExt {
        /// Empty map
        fn new() -> Self;
        /// Empty map with room for `capacity` entries
        fn with_capacity(capacity: usize) -> Self;
    }

    impl<K, V> HashMapExt for HashMap<K, V> {
        fn new() -> Self {
            Self::default()
        }

        fn with_capacity(capacity: usize) -> Self {
            Self::with_capacity_and_hasher(capacity, FastHasher::default())
        }
    }

    /// Constructors matching `gxhash::HashSetExt`
    pub trait HashSetExt {
        /// Empty set
        fn new() -> Self;
        /// Empty set with room for `capacity` entries
        fn with_capacity(capacity: usize) -> Self;
    }

    impl<T> HashSetExt for HashSet<T> {
        fn new() -> Self {
            Self::default()
        }

        fn with_capacity(capacity: usize) -> Self {
            Self::with_capacity_and_hasher(capacity, FastHasher::default())
        }
    }
}

pub use imp::*;
