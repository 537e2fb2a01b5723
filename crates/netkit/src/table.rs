//! Arena of live calls, addressed by generational [`CallId`].
//!
//! The scheduler owns every call through this table. Timers, transport
//! handles and queues refer to calls only by id, so a stale id simply misses.

use crate::call::CallId;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational arena.
pub(crate) struct CallTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for CallTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> CallTable<T> {
    /// Insert a value built from its freshly allocated id.
    pub(crate) fn insert_with(&mut self, build: impl FnOnce(CallId) -> T) -> CallId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = CallId::new(index, slot.generation);
        slot.value = Some(build(id));
        self.len += 1;
        id
    }

    pub(crate) fn get(&self, id: CallId) -> Option<&T> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: CallId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove a value. The slot's generation is bumped so `id` never matches again.
    pub(crate) fn remove(&mut self, id: CallId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}
