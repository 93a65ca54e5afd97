//! Object pool with generation-checked handles
//!
//! Slots are recycled through a FIFO free list, the way ogs-pool hands
//! back the oldest freed slot first. Every slot carries a generation
//! counter that is bumped on free, so an `OgsPoolId` taken before a free
//! never resolves to the object that later reuses the slot.

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use thiserror::Error;

/// Pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No free slot left
    #[error("pool '{name}' exhausted ({size} slots)")]
    Exhausted { name: String, size: usize },
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Typed handle to an object stored in an `OgsPool<T>`
pub struct OgsPoolId<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> OgsPoolId<T> {
    fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index (0-based)
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

// Manual impls: derive would require T: Clone/Eq/Hash.
impl<T> Clone for OgsPoolId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OgsPoolId<T> {}

impl<T> PartialEq for OgsPoolId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for OgsPoolId<T> {}

impl<T> Hash for OgsPoolId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for OgsPoolId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

impl<T> fmt::Display for OgsPoolId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index + 1)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

impl<T> Slot<T> {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Vacant { generation } => *generation,
        }
    }
}

/// Fixed-capacity object pool
pub struct OgsPool<T> {
    /// Name of the pool (for logging)
    name: String,
    /// Maximum number of live objects
    size: usize,
    /// Slot storage, grown lazily up to `size`
    slots: Vec<Slot<T>>,
    /// Vacant slot indices, oldest first
    free: VecDeque<usize>,
    /// Number of live objects
    allocated: usize,
}

impl<T> OgsPool<T> {
    /// Create a new pool with the given capacity
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
            slots: Vec::new(),
            free: VecDeque::new(),
            allocated: 0,
        }
    }

    /// Store `value` in a free slot and return its handle
    pub fn alloc(&mut self, value: T) -> PoolResult<OgsPoolId<T>> {
        // Reuse the oldest vacant slot before growing; fresh slots are
        // only taken while below capacity.
        let index = match self.free.pop_front() {
            Some(index) => index,
            None if self.slots.len() < self.size => {
                self.slots.push(Slot::Vacant { generation: 0 });
                self.slots.len() - 1
            }
            None => {
                return Err(PoolError::Exhausted {
                    name: self.name.clone(),
                    size: self.size,
                })
            }
        };

        let generation = self.slots[index].generation();
        self.slots[index] = Slot::Occupied { generation, value };
        self.allocated += 1;
        Ok(OgsPoolId::new(index, generation))
    }

    /// Release the object behind `id`, returning it.
    ///
    /// A stale or foreign handle is ignored and yields `None`.
    pub fn free(&mut self, id: OgsPoolId<T>) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }

        let next = Slot::Vacant {
            generation: id.generation.wrapping_add(1),
        };
        let old = std::mem::replace(slot, next);
        self.free.push_back(id.index());
        self.allocated -= 1;

        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Find the object behind `id`
    pub fn get(&self, id: OgsPoolId<T>) -> Option<&T> {
        match self.slots.get(id.index())? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Find the object behind `id` mutably
    pub fn get_mut(&mut self, id: OgsPoolId<T>) -> Option<&mut T> {
        match self.slots.get_mut(id.index())? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Whether `id` still refers to a live object
    pub fn contains(&self, id: OgsPoolId<T>) -> bool {
        self.get(id).is_some()
    }

    /// Iterate over live objects with their handles, in slot order
    pub fn iter(&self) -> impl Iterator<Item = (OgsPoolId<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((OgsPoolId::new(index, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }

    /// Handles of all live objects
    pub fn ids(&self) -> Vec<OgsPoolId<T>> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.allocated
    }

    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// Total capacity
    pub fn capacity(&self) -> usize {
        self.size
    }
}

impl<T> fmt::Debug for OgsPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OgsPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("allocated", &self.allocated)
            .finish()
    }
}

/// Next id in `[min, max]`, wrapping back to `min`
#[macro_export]
macro_rules! ogs_next_id {
    ($id:expr, $min:expr, $max:expr) => {{
        let next = if $id >= $max { $min } else { $id + 1 };
        next
    }};
}
