//! Entry records live in a slot arena and refer to each other (index
//! collision chains, rankings links) by [`EntryId`]: a slot index plus
//! a generation.  A stale id (its slot was freed, maybe reused) simply
//! fails to resolve, so neither a racing doom nor a corrupt link can
//! ever produce a dangling reference.

/// Stable, generation-checked handle to an arena slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    /// An id that never resolves.  Stands in for links that pointed at
    /// storage we could not map back to an entry.
    pub const DANGLING: EntryId = EntryId {
        index: u32::MAX,
        generation: u32::MAX,
    };
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> EntryId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return EntryId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        EntryId {
            index,
            generation: 0,
        }
    }

    /// Frees the slot for `id`.  The slot's generation moves on, so
    /// `id` (and every copy of it) stops resolving.
    pub fn remove(&mut self, id: EntryId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, id: EntryId) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        slot.value.as_mut()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Drops every value.  Ids handed out before the call never
    /// resolve again.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }

        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    EntryId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<EntryId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
