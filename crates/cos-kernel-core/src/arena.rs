//! Generation-checked slot arena
//!
//! Kernel objects live in fixed-capacity arenas and are named by
//! `(index, generation)` ids. Freeing a slot bumps its generation, so an id
//! kept past the object's lifetime never resolves to whatever reuses the
//! slot. Index 0 is never handed out, which keeps raw id 0 free to mean
//! "none" at the syscall boundary.

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::types::GENERATION_MASK;

/// Identifier type stored in an [`Arena`].
pub trait ArenaId: Copy + Eq {
    fn new(index: u16, generation: u16) -> Self;
    fn index(self) -> u16;
    fn generation(self) -> u16;
}

struct Slot<T> {
    generation: u16,
    value: Option<T>,
}

/// Fixed-capacity arena with free-list reuse.
pub struct Arena<K: ArenaId, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    len: usize,
    capacity: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaId, T> Arena<K, T> {
    /// Create an empty arena holding at most `capacity` live values.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity: capacity.min(u16::MAX as usize - 1),
            _key: PhantomData,
        }
    }

    /// Insert a value built from its own id. Returns `None` when full.
    pub fn insert_with(&mut self, f: impl FnOnce(K) -> T) -> Option<K> {
        if self.len >= self.capacity {
            return None;
        }
        let pos = match self.free.pop() {
            Some(pos) => pos as usize,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[pos];
        let id = K::new(pos as u16 + 1, slot.generation);
        slot.value = Some(f(id));
        self.len += 1;
        Some(id)
    }

    fn position(&self, id: K) -> Option<usize> {
        let pos = (id.index() as usize).checked_sub(1)?;
        let slot = self.slots.get(pos)?;
        (slot.generation == id.generation() && slot.value.is_some()).then_some(pos)
    }

    pub fn get(&self, id: K) -> Option<&T> {
        let pos = self.position(id)?;
        self.slots[pos].value.as_ref()
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut T> {
        let pos = self.position(id)?;
        self.slots[pos].value.as_mut()
    }

    pub fn contains(&self, id: K) -> bool {
        self.position(id).is_some()
    }

    /// Remove a value and retire its id.
    pub fn remove(&mut self, id: K) -> Option<T> {
        let pos = self.position(id)?;
        let slot = &mut self.slots[pos];
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        self.free.push(pos as u16);
        self.len -= 1;
        value
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots.iter().enumerate().filter_map(|(pos, slot)| {
            slot.value
                .as_ref()
                .map(|v| (K::new(pos as u16 + 1, slot.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (K, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(pos, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (K::new(pos as u16 + 1, generation), v))
        })
    }

    /// Ids of all live values, in slot order.
    pub fn ids(&self) -> Vec<K> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
