//! Handle table: process-local ref-counted mapping between opaque 64-bit
//! handles and live host objects, plus the inverse identity-keyed lookup
//! (`spec.md` §3, §4.4).
//!
//! One table per connection (`spec.md` §5); `clear()` is called on
//! teardown so that a dropped connection never pins host objects alive.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rand::Rng;

use crate::{error::HandleError, ids::Handle, registry::HostObject};

/// Identity key for the inverse (object -> handle) lookup: the object's
/// `Arc` pointer address. Two `Arc`s over the same allocation share this
/// key even if the underlying value implements `PartialEq`.
type ObjectKey = usize;

fn object_key(obj: &Arc<dyn HostObject>) -> ObjectKey { Arc::as_ptr(obj).cast::<()>() as ObjectKey }

struct Entry {
    object: Arc<dyn HostObject>,
    ref_count: u64,
}

struct TableState {
    by_handle: HashMap<Handle, Entry>,
    by_identity: HashMap<ObjectKey, Handle>,
    next_handle: u64,
}

/// Thread-safe ref-counted handle table (`spec.md` §4.4).
pub struct HandleTable {
    state: Mutex<TableState>,
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable").finish_non_exhaustive()
    }
}

impl Default for HandleTable {
    fn default() -> Self { Self::new() }
}

impl HandleTable {
    /// Construct an empty table.
    ///
    /// The first handle issued is seeded from a random per-instance salt
    /// so that handles allocated by sibling connections rarely collide
    /// when logged or compared across connections (`spec.md` §3).
    #[must_use]
    pub fn new() -> Self {
        let salt: u64 = rand::thread_rng().gen_range(1..=u64::MAX / 2);
        Self {
            state: Mutex::new(TableState {
                by_handle: HashMap::new(),
                by_identity: HashMap::new(),
                next_handle: salt,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add a reference to `obj`, allocating a new handle on first sight
    /// (identity-keyed) or incrementing the existing count.
    pub fn add_ref_object(&self, obj: Arc<dyn HostObject>) -> Handle {
        let key = object_key(&obj);
        let mut state = self.lock();
        if let Some(&handle) = state.by_identity.get(&key) {
            if let Some(entry) = state.by_handle.get_mut(&handle) {
                entry.ref_count += 1;
            }
            return handle;
        }
        let mut handle = Handle(state.next_handle);
        while handle.is_null() || state.by_handle.contains_key(&handle) {
            state.next_handle = state.next_handle.wrapping_add(1);
            handle = Handle(state.next_handle);
        }
        state.next_handle = state.next_handle.wrapping_add(1);
        state.by_handle.insert(handle, Entry { object: obj, ref_count: 1 });
        state.by_identity.insert(key, handle);
        handle
    }

    /// Add a reference to an already-allocated `handle`.
    ///
    /// # Errors
    /// Returns [`HandleError::Unknown`] if `handle` is not live.
    pub fn add_ref_handle(&self, handle: Handle) -> Result<(), HandleError> {
        if handle.is_null() {
            return Ok(());
        }
        let mut state = self.lock();
        let entry = state.by_handle.get_mut(&handle).ok_or(HandleError::Unknown(handle))?;
        entry.ref_count += 1;
        Ok(())
    }

    /// Decrement `handle`'s reference count, erasing both directions on
    /// reaching zero.
    ///
    /// # Errors
    /// Returns [`HandleError::Unknown`] if `handle` is not live.
    pub fn drop_ref(&self, handle: Handle) -> Result<(), HandleError> {
        if handle.is_null() {
            return Ok(());
        }
        let mut state = self.lock();
        let remaining = {
            let entry = state.by_handle.get_mut(&handle).ok_or(HandleError::Unknown(handle))?;
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.ref_count
        };
        if remaining == 0 {
            if let Some(entry) = state.by_handle.remove(&handle) {
                let key = object_key(&entry.object);
                state.by_identity.remove(&key);
            }
        }
        Ok(())
    }

    /// Resolve `handle` to its live object, or `None` for the null handle
    /// or an unknown one.
    #[must_use]
    pub fn lookup(&self, handle: Handle) -> Option<Arc<dyn HostObject>> {
        if handle.is_null() {
            return None;
        }
        self.lock().by_handle.get(&handle).map(|entry| Arc::clone(&entry.object))
    }

    /// Current reference count for `handle`, or `None` if it is not live.
    #[must_use]
    pub fn ref_count(&self, handle: Handle) -> Option<u64> {
        self.lock().by_handle.get(&handle).map(|entry| entry.ref_count)
    }

    /// Wipe all mappings. Used on connection teardown so dropped
    /// connections do not pin objects alive (`spec.md` §4.4, §5).
    pub fn clear(&self) {
        let mut state = self.lock();
        state.by_handle.clear();
        state.by_identity.clear();
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().by_handle.len() }

    /// Whether the table holds no live handles.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().by_handle.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str);

    impl HostObject for Dummy {
        fn type_name(&self) -> &str { self.0 }
        fn as_any(&self) -> &dyn std::any::Any { self }
    }

    #[test]
    fn add_ref_object_allocates_on_first_sight() {
        let table = HandleTable::new();
        let obj: Arc<dyn HostObject> = Arc::new(Dummy("demo.A"));
        let handle = table.add_ref_object(Arc::clone(&obj));
        assert!(!handle.is_null());
        assert_eq!(table.ref_count(handle), Some(1));
    }

    #[test]
    fn add_ref_object_on_same_identity_increments_instead_of_reallocating() {
        let table = HandleTable::new();
        let obj: Arc<dyn HostObject> = Arc::new(Dummy("demo.A"));
        let first = table.add_ref_object(Arc::clone(&obj));
        let second = table.add_ref_object(Arc::clone(&obj));
        assert_eq!(first, second);
        assert_eq!(table.ref_count(first), Some(2));
    }

    #[test]
    fn add_ref_then_drop_ref_leaves_table_unchanged() {
        let table = HandleTable::new();
        let obj: Arc<dyn HostObject> = Arc::new(Dummy("demo.A"));
        let handle = table.add_ref_object(obj);
        assert_eq!(table.len(), 1);
        table.add_ref_handle(handle).expect("handle live");
        table.drop_ref(handle).expect("handle live");
        assert_eq!(table.ref_count(handle), Some(1));
        table.drop_ref(handle).expect("handle live");
        assert_eq!(table.ref_count(handle), None);
        assert!(table.is_empty());
    }

    #[test]
    fn drop_ref_on_unknown_handle_is_an_error() {
        let table = HandleTable::new();
        let err = table.drop_ref(Handle(999_999)).unwrap_err();
        assert!(matches!(err, HandleError::Unknown(Handle(999_999))));
    }

    #[test]
    fn null_handle_operations_are_no_ops() {
        let table = HandleTable::new();
        assert_eq!(table.lookup(Handle::NULL), None);
        table.add_ref_handle(Handle::NULL).expect("null is a no-op");
        table.drop_ref(Handle::NULL).expect("null is a no-op");
    }

    #[test]
    fn clear_wipes_all_mappings() {
        let table = HandleTable::new();
        let obj: Arc<dyn HostObject> = Arc::new(Dummy("demo.A"));
        let handle = table.add_ref_object(obj);
        table.clear();
        assert_eq!(table.lookup(handle), None);
        assert!(table.is_empty());
    }

    #[test]
    fn two_tables_rarely_start_at_the_same_handle() {
        let a = HandleTable::new();
        let b = HandleTable::new();
        let obj_a: Arc<dyn HostObject> = Arc::new(Dummy("demo.A"));
        let obj_b: Arc<dyn HostObject> = Arc::new(Dummy("demo.A"));
        let handle_a = a.add_ref_object(obj_a);
        let handle_b = b.add_ref_object(obj_b);
        // Not a hard guarantee, but collisions should be exceptionally rare
        // given each table seeds from a wide random range.
        assert_ne!(handle_a, handle_b);
    }
}
