//! Core identifiers, capacity constants, and bit-level layouts.
//!
//! This module defines the **fundamental types and signatures** shared by
//! every subsystem of the engine: entity identifiers, dense component and
//! system identifiers, the fixed-width component bitset, and the enumerated
//! configuration options of the execution engine.
//!
//! ## Design Philosophy
//!
//! The engine is designed around:
//!
//! - **Dense integer identifiers** assigned in declaration order,
//! - **Bitset-based component signatures** for cheap matching,
//! - **Static configuration**: the component set, the system set, and the
//!   dependency DAG are closed once the engine is constructed.
//!
//! ## Entity Representation
//!
//! Entities are plain dense indices into the entity table. Staleness is
//! detected through a separate per-slot generation counter; a
//! [`Handle`](crate::engine::entity::Handle) pairs an id with the generation
//! observed at creation time.
//!
//! ## Signatures
//!
//! Component sets are fixed-size arrays of `u64`. A system's *required*
//! signature is the union of its read and write sets; an entity is matched
//! to a system iff its component bitset is a superset of the required
//! signature. The empty signature is a subset of every bitset, so a system
//! requiring nothing subscribes every alive entity.

/// Dense entity identifier in `[0, capacity)`.
pub type EntityId = u32;
/// Per-slot reuse counter; incremented every time an id is reclaimed.
pub type Generation = u64;
/// Dense component-kind identifier assigned in declaration order.
pub type ComponentId = u16;
/// Dense system identifier assigned in declaration order.
pub type SystemId = u16;

/// Sentinel entity id sitting outside every valid dense range.
pub const INVALID_ENTITY: EntityId = EntityId::MAX;

/// Maximum number of declarable component kinds.
pub const COMPONENT_CAP: usize = 256;
/// Number of `u64` words in a full component signature.
pub const SIGNATURE_SIZE: usize = (COMPONENT_CAP + 63) / 64;

/// Batch size used when a dynamically sized entity table grows.
pub const ENTITY_GROWTH_BATCH: usize = 1024;

/// Bitset representing a set of component kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    /// Packed component bitset.
    pub words: [u64; SIGNATURE_SIZE],
}

impl Default for Signature {
    fn default() -> Self {
        Self { words: [0u64; SIGNATURE_SIZE] }
    }
}

impl Signature {
    /// Sets the bit corresponding to `component_id`.
    #[inline]
    pub fn set(&mut self, component_id: ComponentId) {
        let index = (component_id as usize) / 64;
        let bit = (component_id as usize) % 64;
        self.words[index] |= 1u64 << bit;
    }

    /// Clears the bit corresponding to `component_id`.
    #[inline]
    pub fn clear(&mut self, component_id: ComponentId) {
        let index = (component_id as usize) / 64;
        let bit = (component_id as usize) % 64;
        self.words[index] &= !(1u64 << bit);
    }

    /// Returns `true` if `component_id` is present.
    #[inline]
    pub fn has(&self, component_id: ComponentId) -> bool {
        let index = (component_id as usize) / 64;
        let bit = (component_id as usize) % 64;
        (self.words[index] >> bit) & 1 == 1
    }

    /// Returns `true` if every component in `other` is also present here.
    #[inline]
    pub fn contains_all(&self, other: &Signature) -> bool {
        for (word, other_word) in self.words.iter().zip(other.words.iter()) {
            if (word & other_word) != *other_word {
                return false;
            }
        }
        true
    }

    /// Returns `true` if the two signatures share at least one component.
    #[inline]
    pub fn intersects(&self, other: &Signature) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| (a & b) != 0)
    }

    /// Returns `true` if no bit is set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Merges `other` into this signature in place.
    #[inline]
    pub fn union_with(&mut self, other: &Signature) {
        for (word, other_word) in self.words.iter_mut().zip(other.words.iter()) {
            *word |= *other_word;
        }
    }

    /// Iterates over all component IDs set in this signature.
    pub fn iter_components(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.words.iter().enumerate().flat_map(|(word_index, &word)| {
            let base = word_index * 64;
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some((base + tz) as ComponentId)
            })
        })
    }
}

/// Builds a component signature from a list of component IDs.
pub fn build_signature(component_ids: &[ComponentId]) -> Signature {
    let mut signature = Signature::default();
    for &component_id in component_ids {
        signature.set(component_id);
    }
    signature
}

/// Storage strategy bound to a component kind at declaration time.
///
/// `Dense` stores values in a contiguous buffer indexed directly by entity
/// id; `Map` stores them sparsely keyed by id, intended for rarely-present
/// large components.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Contiguous buffer indexed by entity id.
    Dense,
    /// Hash map keyed by entity id.
    Map,
}

/// Entity table sizing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityStorage {
    /// Fixed capacity; creation fails once the table is full.
    Fixed(usize),
    /// Growable capacity with an initial size hint.
    Dynamic {
        /// Initial number of preallocated slots.
        hint: usize,
    },
}

impl Default for EntityStorage {
    fn default() -> Self {
        EntityStorage::Dynamic { hint: ENTITY_GROWTH_BATCH }
    }
}

/// Global toggle for inner parallelism.
///
/// `Disallow` forces a single subtask for every system regardless of the
/// per-system policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InnerParallelismMode {
    /// Per-system policies take effect.
    #[default]
    Allow,
    /// Every system runs as one subtask.
    Disallow,
}

/// Outer scheduler selection. Only the atomic-counter scheduler is defined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulerKind {
    /// DAG driven by per-system atomic dependency counters.
    #[default]
    AtomicCounter,
}

/// Per-system inner-parallelism policy.
///
/// Decides how one system's subscribed entity range is sliced into
/// subtasks. The slice count never exceeds the subscription size; a system
/// with no subscribers still runs exactly one zero-range subtask.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InnerParallelism {
    /// Single subtask on the scheduling thread.
    None,
    /// Up to `k` roughly equal contiguous slices.
    SplitN(usize),
    /// As [`InnerParallelism::SplitN`] with the worker count as `k`.
    SplitEvenlyCores,
    /// Below `threshold` subscribers run single-subtask; otherwise the
    /// `inner` policy applies.
    NoneBelowThreshold {
        /// Subscription size below which the system runs as one subtask.
        threshold: usize,
        /// Policy applied at or above the threshold.
        inner: Box<InnerParallelism>,
    },
}

impl Default for InnerParallelism {
    fn default() -> Self {
        InnerParallelism::None
    }
}

impl InnerParallelism {
    /// Number of subtasks for a subscription of `n` entities on `workers`
    /// worker threads. Always at least 1 and at most `max(1, n)`.
    pub fn subtask_count(&self, n: usize, workers: usize) -> usize {
        match self {
            InnerParallelism::None => 1,
            InnerParallelism::SplitN(k) => (*k).max(1).min(n.max(1)),
            InnerParallelism::SplitEvenlyCores => workers.max(1).min(n.max(1)),
            InnerParallelism::NoneBelowThreshold { threshold, inner } => {
                if n < *threshold {
                    1
                } else {
                    inner.subtask_count(n, workers)
                }
            }
        }
    }
}

/// Contiguous subtask ranges over `[0, n)`: `k` slices, the first `n % k`
/// of which absorb one extra element.
pub(crate) fn slice_ranges(n: usize, k: usize) -> Vec<(usize, usize)> {
    debug_assert!(k >= 1);
    let base = n / k;
    let extra = n % k;
    let mut ranges = Vec::with_capacity(k);
    let mut begin = 0;
    for i in 0..k {
        let len = base + usize::from(i < extra);
        ranges.push((begin, begin + len));
        begin += len;
    }
    debug_assert_eq!(begin, n);
    ranges
}
