//! Component storage containers.
//!
//! Two storage strategies are provided behind the type-erased
//! [`ErasedStore`] contract:
//!
//! - [`DenseStore`]: a contiguous buffer indexed directly by entity id,
//!   for components most entities hold,
//! - [`MapStore`]: a hash map keyed by entity id, for rarely-present or
//!   large components.
//!
//! ## Concurrency contract
//!
//! Structural mutation (`add_default`, `remove`, `ensure_capacity`) happens
//! only in exclusive phases: the step body and the refresh pipeline.
//! During parallel system execution the engine hands out element pointers
//! through `slot_ptr` on a shared reference; safety rests on the static
//! schedule — no writer system is concurrent with another accessor of the
//! same component kind, and subtasks of one system touch disjoint entity
//! ids.

use std::any::{type_name, TypeId};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::mem::MaybeUninit;

use crate::engine::types::EntityId;

/// Marker bounds for a component value.
///
/// Components are default-constructed on `add` and may cross worker
/// threads; `Sync` is required because read-only systems share them.
pub trait Component: Default + Send + Sync + 'static {}

impl<T: Default + Send + Sync + 'static> Component for T {}

/// Type-erased component store.
///
/// One store exists per declared component kind. Presence tracked here must
/// agree with the entity table's bitsets; the engine maintains that
/// invariant, and the stores assert it.
pub(crate) trait ErasedStore: Send + Sync {
    /// Makes `[0, capacity)` addressable.
    fn ensure_capacity(&mut self, capacity: usize);

    /// Default-constructs the component for `id` and returns a pointer to
    /// it. `id` must not already hold the component.
    fn add_default(&mut self, id: EntityId) -> *mut u8;

    /// Drops the component held by `id`. `id` must hold the component.
    fn remove(&mut self, id: EntityId);

    /// Returns `true` if the store holds a value for `id`.
    fn has(&self, id: EntityId) -> bool;

    /// Pointer to the component held by `id`.
    ///
    /// The caller is responsible for honoring the module-level concurrency
    /// contract before turning this into a reference.
    fn slot_ptr(&self, id: EntityId) -> *mut u8;

    /// `TypeId` of the element type.
    fn element_type_id(&self) -> TypeId;

    /// Name of the element type, for diagnostics.
    fn element_type_name(&self) -> &'static str;
}

/// Contiguous store indexed by entity id.
///
/// Invariant:
/// - `slots.len() == present.len()`.
/// - `slots[i]` is initialized iff `present[i]`.
pub(crate) struct DenseStore<T> {
    slots: Vec<UnsafeCell<MaybeUninit<T>>>,
    present: Vec<bool>,
}

// SAFETY: the scheduler guarantees that concurrent access through
// `slot_ptr` is either all-readers or targets disjoint entity ids; the
// UnsafeCell never sees overlapping mutation.
unsafe impl<T: Send + Sync> Sync for DenseStore<T> {}

impl<T> DenseStore<T> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), present: Vec::new() }
    }
}

impl<T: Component> ErasedStore for DenseStore<T> {
    fn ensure_capacity(&mut self, capacity: usize) {
        if self.slots.len() < capacity {
            self.slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
            self.present.resize(capacity, false);
        }
    }

    fn add_default(&mut self, id: EntityId) -> *mut u8 {
        let index = id as usize;
        self.ensure_capacity(index + 1);
        debug_assert!(!self.present[index], "double add on dense store");
        self.present[index] = true;
        let slot = self.slots[index].get_mut();
        slot.write(T::default());
        slot.as_mut_ptr() as *mut u8
    }

    fn remove(&mut self, id: EntityId) {
        let index = id as usize;
        debug_assert!(self.present[index], "double remove on dense store");
        self.present[index] = false;
        // SAFETY: the slot was initialized by `add_default` and is marked
        // absent before anyone can observe it again.
        unsafe { self.slots[index].get_mut().assume_init_drop() };
    }

    fn has(&self, id: EntityId) -> bool {
        self.present.get(id as usize).copied().unwrap_or(false)
    }

    fn slot_ptr(&self, id: EntityId) -> *mut u8 {
        let index = id as usize;
        // Checked in release too: handing out a pointer into an absent slot
        // would let callers read uninitialized memory.
        assert!(self.present[index], "access to an absent dense component");
        self.slots[index].get() as *mut u8
    }

    fn element_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn element_type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

impl<T> Drop for DenseStore<T> {
    fn drop(&mut self) {
        for (slot, present) in self.slots.iter_mut().zip(self.present.iter()) {
            if *present {
                // SAFETY: present slots are initialized.
                unsafe { slot.get_mut().assume_init_drop() };
            }
        }
    }
}

/// Sparse store keyed by entity id.
pub(crate) struct MapStore<T> {
    values: HashMap<EntityId, UnsafeCell<T>>,
}

// SAFETY: as for `DenseStore` — the map is never restructured while shared,
// and element access follows the scheduler's disjointness guarantees.
unsafe impl<T: Send + Sync> Sync for MapStore<T> {}

impl<T> MapStore<T> {
    pub(crate) fn new() -> Self {
        Self { values: HashMap::new() }
    }
}

impl<T: Component> ErasedStore for MapStore<T> {
    fn ensure_capacity(&mut self, _capacity: usize) {}

    fn add_default(&mut self, id: EntityId) -> *mut u8 {
        let previous = self.values.insert(id, UnsafeCell::new(T::default()));
        debug_assert!(previous.is_none(), "double add on map store");
        self.values[&id].get() as *mut u8
    }

    fn remove(&mut self, id: EntityId) {
        let removed = self.values.remove(&id);
        debug_assert!(removed.is_some(), "double remove on map store");
    }

    fn has(&self, id: EntityId) -> bool {
        self.values.contains_key(&id)
    }

    fn slot_ptr(&self, id: EntityId) -> *mut u8 {
        match self.values.get(&id) {
            Some(cell) => cell.get() as *mut u8,
            None => panic!("access to an absent map component (entity {id})"),
        }
    }

    fn element_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn element_type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// Allocates an empty store of the requested strategy for `T`.
pub(crate) fn new_store<T: Component>(kind: crate::engine::types::StorageKind) -> Box<dyn ErasedStore> {
    match kind {
        crate::engine::types::StorageKind::Dense => Box::new(DenseStore::<T>::new()),
        crate::engine::types::StorageKind::Map => Box::new(MapStore::<T>::new()),
    }
}

/// Reads a typed shared reference out of a store slot.
///
/// # Safety
/// Caller must ensure `T` matches the store's element type, the component
/// is present for `id`, and the concurrency contract holds for the
/// lifetime `'a`.
pub(crate) unsafe fn slot_ref<'a, T: 'static>(store: &'a dyn ErasedStore, id: EntityId) -> &'a T {
    debug_assert_eq!(store.element_type_id(), TypeId::of::<T>());
    unsafe { &*(store.slot_ptr(id) as *const T) }
}

/// Reads a typed exclusive reference out of a store slot.
///
/// # Safety
/// As [`slot_ref`], and the caller must additionally hold exclusive access
/// to this `(component, id)` pair for the lifetime `'a`.
pub(crate) unsafe fn slot_mut<'a, T: 'static>(store: &'a dyn ErasedStore, id: EntityId) -> &'a mut T {
    debug_assert_eq!(store.element_type_id(), TypeId::of::<T>());
    unsafe { &mut *(store.slot_ptr(id) as *mut T) }
}
