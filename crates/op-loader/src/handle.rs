//! Generational handles and the table of in-flight packages

use std::collections::HashMap;
use std::fmt;

/// Generation-checked reference to a package slot
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageHandle {
    index: u32,
    generation: u32,
}

impl PackageHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for PackageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Identifier returned by `enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {}", self.0)
    }
}

enum SlotState<T> {
    Vacant,
    Present(Box<T>),
    CheckedOut,
}

struct Slot<T> {
    generation: u32,
    name: String,
    state: SlotState<T>,
}

/// Slab of packages addressed by [`PackageHandle`], indexed by name.
///
/// A package is checked out while it is being processed so the rest of the
/// table stays reachable; a handle to a checked-out or vacant slot simply
/// resolves to nothing.
pub struct PackageTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    by_name: HashMap<String, PackageHandle>,
}

impl<T> Default for PackageTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PackageTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Insert the value built by `make` under `name`
    pub fn insert_with(&mut self, name: &str, make: impl FnOnce(PackageHandle) -> T) -> PackageHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    name: String::new(),
                    state: SlotState::Vacant,
                });
                self.slots.len() as u32 - 1
            }
        };
        let slot = &mut self.slots[index as usize];
        let handle = PackageHandle::new(index, slot.generation);
        slot.name = name.to_string();
        slot.state = SlotState::Present(Box::new(make(handle)));
        self.by_name.insert(name.to_string(), handle);
        handle
    }

    fn slot(&self, handle: PackageHandle) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }

    fn slot_mut(&mut self, handle: PackageHandle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
    }

    pub fn find(&self, name: &str) -> Option<PackageHandle> {
        self.by_name.get(name).copied()
    }

    /// Whether `handle` names a live slot (present or checked out)
    pub fn contains(&self, handle: PackageHandle) -> bool {
        self.slot(handle)
            .map_or(false, |s| !matches!(s.state, SlotState::Vacant))
    }

    pub fn get(&self, handle: PackageHandle) -> Option<&T> {
        match &self.slot(handle)?.state {
            SlotState::Present(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: PackageHandle) -> Option<&mut T> {
        match &mut self.slot_mut(handle)?.state {
            SlotState::Present(value) => Some(value),
            _ => None,
        }
    }

    /// Take the value out for exclusive processing
    pub fn checkout(&mut self, handle: PackageHandle) -> Option<Box<T>> {
        let slot = self.slot_mut(handle)?;
        match std::mem::replace(&mut slot.state, SlotState::CheckedOut) {
            SlotState::Present(value) => Some(value),
            other => {
                slot.state = other;
                None
            }
        }
    }

    /// Return a checked-out value
    pub fn checkin(&mut self, handle: PackageHandle, value: Box<T>) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.state = SlotState::Present(value);
        }
    }

    /// Free the slot, invalidating every outstanding handle to it
    pub fn remove(&mut self, handle: PackageHandle) -> Option<Box<T>> {
        let slot = self.slot_mut(handle)?;
        let previous = std::mem::replace(&mut slot.state, SlotState::Vacant);
        if matches!(previous, SlotState::Vacant) {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        let name = std::mem::take(&mut slot.name);
        if self.by_name.get(&name) == Some(&handle) {
            self.by_name.remove(&name);
        }
        self.free.push(handle.index);
        match previous {
            SlotState::Present(value) => Some(value),
            _ => None,
        }
    }

    /// Handles of every live slot, in slot order
    pub fn handles(&self) -> Vec<PackageHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s.state, SlotState::Vacant))
            .map(|(i, s)| PackageHandle::new(i as u32, s.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut table = PackageTable::new();
        let a = table.insert_with("/Game/A", |h| (h, 1));
        assert_eq!(table.find("/Game/A"), Some(a));
        assert_eq!(table.get(a).unwrap().1, 1);
        assert_eq!(table.remove(a).unwrap().0, a);
        assert!(table.get(a).is_none());
        assert!(table.find("/Game/A").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut table = PackageTable::new();
        let a = table.insert_with("/Game/A", |_| 1);
        table.remove(a);
        let b = table.insert_with("/Game/B", |_| 2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert_eq!(*table.get(b).unwrap(), 2);
    }

    #[test]
    fn test_checkout_checkin() {
        let mut table = PackageTable::new();
        let a = table.insert_with("/Game/A", |_| 5);
        let value = table.checkout(a).unwrap();
        assert!(table.get(a).is_none());
        assert!(table.contains(a));
        assert!(table.checkout(a).is_none());
        table.checkin(a, value);
        assert_eq!(*table.get(a).unwrap(), 5);
        assert_eq!(table.handles(), vec![a]);
    }
}
