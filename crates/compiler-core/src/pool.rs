//! Typed ids and append-only object pools.
//!
//! Every inter-entity reference in the driver is a typed `u32` id into the
//! owning pool rather than a live pointer; cyclic graphs (the dependency
//! DAG, struct fields naming other structs) are broken by that
//! indirection. Pools only grow, so an id handed out once stays valid for
//! the life of the [`Context`](crate::globals::Context).

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Behavior shared by every pool id type.
pub trait PoolId: Copy + Eq + Ord + std::hash::Hash + fmt::Debug {
    /// Wraps a raw pool index.
    fn from_index(index: u32) -> Self;
    /// The raw pool index.
    fn index(self) -> u32;
}

/// Defines a pool id newtype.
macro_rules! define_id {
    ($(#[$meta:meta])* $vis:vis struct $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(u32);

        impl $crate::pool::PoolId for $name {
            fn from_index(index: u32) -> Self {
                Self(index)
            }

            fn index(self) -> u32 {
                self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{{{}}}", self.0)
            }
        }
    };
}

define_id! {
    /// Id of a [`Global`](crate::globals::Global).
    pub struct GlobalId
}
define_id! {
    /// Id of a [`Func`](crate::fns::Func).
    pub struct FnId
}
define_id! {
    /// Id of a [`Gvar`](crate::data::Gvar).
    pub struct GvarId
}
define_id! {
    /// Id of a [`Const`](crate::data::Const).
    pub struct ConstId
}
define_id! {
    /// Id of a [`Struct`](crate::structs::Struct).
    pub struct StructId
}
define_id! {
    /// Id of a [`Group`](crate::group::Group).
    pub struct GroupId
}
define_id! {
    /// Id of a [`GroupVars`](crate::group::GroupVars).
    pub struct GroupVarsId
}
define_id! {
    /// Id of a [`GroupData`](crate::group::GroupData).
    pub struct GroupDataId
}
define_id! {
    /// Id of a [`Gmember`](crate::data::Gmember).
    pub struct GmemberId
}
define_id! {
    /// Id of a [`RomArray`](crate::data::RomArray).
    pub struct RomArrayId
}
define_id! {
    /// Id of a [`RomProc`](crate::data::RomProc).
    pub struct RomProcId
}

/// An append-only pool of shared objects keyed by a typed id.
#[derive(Debug)]
pub struct Pool<I, T> {
    items: RwLock<Vec<Arc<T>>>,
    _id: PhantomData<fn() -> I>,
}

impl<I, T> Default for Pool<I, T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            _id: PhantomData,
        }
    }
}

impl<I: PoolId, T> Pool<I, T> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item, returning its id.
    pub fn push(&self, item: T) -> I {
        self.push_with(|_| item)
    }

    /// Appends an item built from the id it will receive.
    ///
    /// The pool lock is held while `make` runs, so the id cannot be
    /// observed by other threads before the item exists.
    pub fn push_with(&self, make: impl FnOnce(I) -> T) -> I {
        let mut items = write_lock(&self.items);
        let id = I::from_index(u32::try_from(items.len()).expect("pool index overflow"));
        items.push(Arc::new(make(id)));
        id
    }

    /// Returns the item for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not issued by this pool.
    #[must_use]
    pub fn get(&self, id: I) -> Arc<T> {
        Arc::clone(&read_lock(&self.items)[id.index() as usize])
    }

    /// Number of items in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        read_lock(&self.items).len()
    }

    /// True when the pool holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The ids of every item currently in the pool, in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<I> {
        let len = u32::try_from(self.len()).expect("pool index overflow");
        (0..len).map(I::from_index).collect()
    }

    /// A snapshot of every item currently in the pool, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        read_lock(&self.items).clone()
    }
}

/// Acquires a read guard, recovering from poisoning.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Acquires a write guard, recovering from poisoning.
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Acquires a mutex guard, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::{GlobalId, Pool, PoolId};

    #[test]
    fn push_returns_sequential_ids() {
        let pool: Pool<GlobalId, &str> = Pool::new();
        assert_eq!(pool.push("a").index(), 0);
        assert_eq!(pool.push("b").index(), 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn ids_stay_valid_as_the_pool_grows() {
        let pool: Pool<GlobalId, String> = Pool::new();
        let first = pool.push("first".to_owned());
        for i in 0..100 {
            pool.push(format!("item{i}"));
        }
        assert_eq!(*pool.get(first), "first");
    }

    #[test]
    fn push_with_sees_its_own_id() {
        let pool: Pool<GlobalId, u32> = Pool::new();
        let id = pool.push_with(|id| id.index() + 10);
        assert_eq!(*pool.get(id), 10);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let pool: Pool<GlobalId, u8> = Pool::new();
        pool.push(3);
        pool.push(1);
        pool.push(2);
        let values: Vec<u8> = pool.snapshot().iter().map(|v| **v).collect();
        assert_eq!(values, vec![3, 1, 2]);
    }

    #[test]
    fn display_wraps_the_raw_index() {
        let pool: Pool<GlobalId, ()> = Pool::new();
        let id = pool.push(());
        assert_eq!(id.to_string(), "{0}");
    }
}
