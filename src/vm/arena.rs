//! Generational arena for collectable objects

use std::ops::{Index, IndexMut};

/// A handle into a generational arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    /// Index into the arena
    pub index: u32,

    /// Generation count for detecting stale references
    pub generation: u32,
}

impl Handle {
    /// Create a new handle
    pub fn new(index: u32, generation: u32) -> Self {
        Handle { index, generation }
    }

    /// A stable integer identity for this handle
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

/// A slot in the generational arena
#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// A generational arena for storing values
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,

    /// Indices of empty slots
    free_list: Vec<u32>,

    occupied: usize,
}

impl<T> Arena<T> {
    /// Create a new empty arena
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free_list: Vec::new(),
            occupied: 0,
        }
    }

    /// Insert a value into the arena, returning its handle
    pub fn insert(&mut self, value: T) -> Handle {
        self.occupied += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            slot.generation = slot.generation.wrapping_add(1);
            Handle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                value: Some(value),
                generation: 0,
            });
            Handle::new(index, 0)
        }
    }

    /// Remove a value from the arena
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free_list.push(handle.index);
        self.occupied -= 1;
        Some(value)
    }

    /// Get a reference to a value in the arena
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Get a mutable reference to a value in the arena
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Check if a handle is valid
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Get the number of occupied slots
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Check if the arena is empty
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Iterate over all occupied slots
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(idx, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(idx as u32, slot.generation), value))
        })
    }

    /// Iterate mutably over all occupied slots
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(idx, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (Handle::new(idx as u32, generation), value))
        })
    }

    /// Remove every value for which `keep` returns false, returning them
    pub fn drain_unless(&mut self, mut keep: impl FnMut(&mut T) -> bool) -> Vec<(Handle, T)> {
        let mut removed = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let dead = match slot.value.as_mut() {
                Some(value) => !keep(value),
                None => false,
            };
            if dead {
                if let Some(value) = slot.value.take() {
                    removed.push((Handle::new(idx as u32, slot.generation), value));
                    self.free_list.push(idx as u32);
                }
            }
        }
        self.occupied -= removed.len();
        removed
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Handle> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {:?}", handle),
        }
    }
}

impl<T> IndexMut<Handle> for Arena<T> {
    fn index_mut(&mut self, handle: Handle) -> &mut T {
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {:?}", handle),
        }
    }
}
