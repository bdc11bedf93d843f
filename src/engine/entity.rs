//! # Entity Management
//!
//! This module defines entity identity, lifecycle, and the metadata table
//! used by the execution engine.
//!
//! ## Purpose
//! Entities are lightweight dense indices referencing per-id metadata. This
//! module is responsible for:
//!
//! - Allocating and recycling entity ids from a free list
//! - Tracking which components an entity holds via a per-id bitset
//! - Tracking entity liveness and staleness via generation counters
//!
//! ## Entity Model
//! An id is alive iff it is inside the table's used range and not on the
//! free list. A [`Handle`] pairs an id with the generation observed when it
//! was created:
//!
//! - Reclaiming an id increments its generation and clears its bitset.
//! - A handle resolves iff the entity is alive and the generations match.
//!
//! This prevents use-after-free bugs when ids are recycled.
//!
//! ## Capacity
//! The table runs in one of two modes:
//!
//! - **Fixed(n)**: creation fails with a capacity error once all `n` slots
//!   are alive; no bounds growth on the allocation path.
//! - **Dynamic**: the table grows in amortized batches.
//!
//! ## Concurrency
//! The table is **not** internally synchronized. It is mutated only from
//! exclusive phases (the step body and the refresh pipeline) and read
//! concurrently during system execution, when no mutation happens.

use crate::engine::error::{CapacityError, InvalidHandleError};
use crate::engine::sparse::SparseSet;
use crate::engine::types::{
    EntityId, EntityStorage, Generation, Signature, ENTITY_GROWTH_BATCH, INVALID_ENTITY,
};

/// Opaque, versioned reference to an entity.
///
/// Cheap to copy and compare; safe to keep across steps. A handle becomes
/// invalid the moment its entity is reclaimed, even if the id is later
/// reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    id: EntityId,
    generation: Generation,
}

impl Handle {
    /// A handle that never resolves.
    pub const INVALID: Handle = Handle { id: INVALID_ENTITY, generation: 0 };

    pub(crate) fn new(id: EntityId, generation: Generation) -> Self {
        Self { id, generation }
    }

    /// The entity id this handle refers to.
    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The generation observed when the handle was created.
    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

/// Per-entity metadata record.
#[derive(Clone, Debug, Default)]
pub(crate) struct EntityMeta {
    /// Which components the entity currently holds.
    pub bitset: Signature,
    /// Incremented every time the id is reclaimed.
    pub generation: Generation,
}

/// Entity id allocator and metadata table.
///
/// ## Invariants
/// - `free` holds exactly the ids in `[0, len)` that are not alive.
/// - A reclaimed id's bitset is empty and its generation has advanced.
pub struct EntityTable {
    metadata: Vec<EntityMeta>,
    free: SparseSet,
    mode: EntityStorage,
}

impl EntityTable {
    /// Creates a table in the given sizing mode.
    pub fn new(mode: EntityStorage) -> Self {
        let initial = match mode {
            EntityStorage::Fixed(n) => n,
            EntityStorage::Dynamic { hint } => hint,
        };
        let mut table = Self { metadata: Vec::new(), free: SparseSet::new(), mode };
        table.grow(initial);
        table
    }

    /// Appends `additional` fresh slots and registers them as free.
    ///
    /// Ids are pushed in reverse so allocation pops them in ascending
    /// order.
    fn grow(&mut self, additional: usize) {
        let start = self.metadata.len();
        let end = start + additional;
        self.metadata.resize_with(end, EntityMeta::default);
        for id in (start..end).rev() {
            self.free.add(id as EntityId);
        }
    }

    /// Total number of slots (alive + free).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.metadata.len()
    }

    /// Number of alive entities.
    #[inline]
    pub fn alive_count(&self) -> usize {
        self.metadata.len() - self.free.len()
    }

    /// Allocates an id.
    ///
    /// Pops a free slot if one exists; otherwise grows (dynamic mode) or
    /// fails with [`CapacityError`] (fixed mode). Existing entities are
    /// untouched by a failed creation.
    pub fn create(&mut self) -> Result<EntityId, CapacityError> {
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        match self.mode {
            EntityStorage::Fixed(capacity) => Err(CapacityError {
                entities_needed: self.metadata.len() as u64 + 1,
                capacity: capacity as u64,
            }),
            EntityStorage::Dynamic { .. } => {
                self.grow(ENTITY_GROWTH_BATCH);
                Ok(self.free.pop().expect("growth produced no free slot"))
            }
        }
    }

    /// Returns `id` to the free list, bumps its generation, and clears its
    /// bitset. All outstanding handles to `id` become invalid.
    pub fn reclaim(&mut self, id: EntityId) {
        debug_assert!(self.alive(id), "reclaim of a dead entity {id}");
        let meta = &mut self.metadata[id as usize];
        meta.generation = meta.generation.wrapping_add(1);
        meta.bitset = Signature::default();
        self.free.add(id);
    }

    /// Returns `true` if `id` is inside the table and not on the free list.
    #[inline]
    pub fn alive(&self, id: EntityId) -> bool {
        (id as usize) < self.metadata.len() && !self.free.contains(id)
    }

    /// The component bitset of `id`.
    #[inline]
    pub fn bitset(&self, id: EntityId) -> &Signature {
        &self.metadata[id as usize].bitset
    }

    /// Mutable access to the component bitset of `id`.
    #[inline]
    pub(crate) fn bitset_mut(&mut self, id: EntityId) -> &mut Signature {
        &mut self.metadata[id as usize].bitset
    }

    /// The current generation of slot `id`.
    #[inline]
    pub fn generation(&self, id: EntityId) -> Generation {
        self.metadata[id as usize].generation
    }

    /// Creates a handle to an alive entity.
    pub fn handle(&self, id: EntityId) -> Handle {
        debug_assert!(self.alive(id), "handle to a dead entity {id}");
        Handle::new(id, self.generation(id))
    }

    /// Returns `true` if `handle` still resolves.
    pub fn valid_handle(&self, handle: Handle) -> bool {
        handle.id() != INVALID_ENTITY
            && self.alive(handle.id())
            && self.generation(handle.id()) == handle.generation()
    }

    /// Resolves `handle` to its entity id.
    pub fn access(&self, handle: Handle) -> Result<EntityId, InvalidHandleError> {
        if self.valid_handle(handle) {
            Ok(handle.id())
        } else {
            Err(InvalidHandleError { id: handle.id() })
        }
    }
}
