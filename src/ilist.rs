//! Arena-backed doubly linked list.
//!
//! Entries live in a slot vector and link to each other by index. A
//! [`Handle`] names a slot plus the generation it was issued for, so a handle
//! kept after its entry was removed can never reach the entry that later
//! reuses the slot. Insertion and removal are O(1); removed slots are
//! recycled, so a list that has reached its working size stops allocating.

/// Stable reference to a list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    generation: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
pub struct IndexList<T> {
    slots: Vec<Slot<T>>,
    head: Option<u32>,
    tail: Option<u32>,
    /// Free slots, chained through `next`.
    free: Option<u32>,
    len: usize,
}

impl<T> IndexList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            free: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `value` and return its handle.
    pub fn push_back(&mut self, value: T) -> Handle {
        let index = self.alloc(value);
        let slot = &mut self.slots[index as usize];
        slot.prev = self.tail;
        slot.next = None;
        match self.tail {
            Some(tail) => self.slots[tail as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        self.handle_of(index)
    }

    /// Unlink the entry named by `handle`. Stale handles return `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.live_index(handle)?;
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }

        let slot = &mut self.slots[index as usize];
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = None;
        slot.next = self.free;
        self.free = Some(index);
        self.len -= 1;
        value
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let index = self.live_index(handle)?;
        self.slots[index as usize].value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let index = self.live_index(handle)?;
        self.slots[index as usize].value.as_mut()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.live_index(handle).is_some()
    }

    pub fn front(&self) -> Option<(Handle, &T)> {
        let index = self.head?;
        let value = self.slots[index as usize].value.as_ref()?;
        Some((self.handle_of(index), value))
    }

    /// Iterate from head to tail.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Remove every entry for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            cursor = slot.next;
            let drop_it = slot.value.as_ref().is_some_and(|v| !keep(v));
            if drop_it {
                let handle = self.handle_of(index);
                self.remove(handle);
            }
        }
    }

    pub fn clear(&mut self) {
        self.retain(|_| false);
    }

    fn alloc(&mut self, value: T) -> u32 {
        match self.free {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free = slot.next;
                slot.value = Some(value);
                index
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    value: Some(value),
                    generation: 0,
                    prev: None,
                    next: None,
                });
                index
            }
        }
    }

    fn handle_of(&self, index: u32) -> Handle {
        Handle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn live_index(&self, handle: Handle) -> Option<u32> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation && slot.value.is_some()).then_some(handle.index)
    }
}

impl<T> Default for IndexList<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    list: &'a IndexList<T>,
    cursor: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.list.slots[index as usize];
        self.cursor = slot.next;
        let value = slot.value.as_ref()?;
        Some((self.list.handle_of(index), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(list: &IndexList<u32>) -> Vec<u32> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_push_and_iterate_in_order() {
        let mut list = IndexList::new();
        list.push_back(1);
        list.push_back(2);
        list.push_back(3);
        assert_eq!(values(&list), vec![1, 2, 3]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut list = IndexList::new();
        let a = list.push_back(1);
        let b = list.push_back(2);
        let c = list.push_back(3);

        assert_eq!(list.remove(b), Some(2));
        assert_eq!(values(&list), vec![1, 3]);
        assert_eq!(list.remove(a), Some(1));
        assert_eq!(values(&list), vec![3]);
        assert_eq!(list.remove(c), Some(3));
        assert!(list.is_empty());
        assert!(list.front().is_none());
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut list = IndexList::new();
        let a = list.push_back(10);
        list.remove(a);
        let b = list.push_back(20);

        // Slot was recycled but the old handle must not alias it.
        assert_eq!(list.get(a), None);
        assert_eq!(list.remove(a), None);
        assert_eq!(list.get(b), Some(&20));
    }

    #[test]
    fn test_slots_are_recycled() {
        let mut list = IndexList::new();
        for round in 0..10 {
            let h = list.push_back(round);
            list.remove(h);
        }
        assert_eq!(list.slots.len(), 1);
    }

    #[test]
    fn test_retain() {
        let mut list = IndexList::new();
        for v in 0..6 {
            list.push_back(v);
        }
        list.retain(|v| v % 2 == 0);
        assert_eq!(values(&list), vec![0, 2, 4]);
        list.push_back(7);
        assert_eq!(values(&list), vec![0, 2, 4, 7]);
    }

    #[test]
    fn test_get_mut() {
        let mut list = IndexList::new();
        let h = list.push_back(1);
        *list.get_mut(h).unwrap() = 5;
        assert_eq!(list.get(h), Some(&5));
    }
}
