// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dense storage of (bounds, payload) pairs behind generational handles.

use alloc::vec::Vec;
use core::fmt::Debug;

use glam::Vec3;

use crate::error::PoolError;
use crate::types::{Aabb3, Handle, Payload};

const VACANT: u32 = u32::MAX;

#[derive(Copy, Clone, Debug)]
struct Slot {
    index: u32,
    generation: u32,
}

/// Packed array of objects addressed by stable [`Handle`]s.
///
/// Objects live in `0..len()` with no holes. Removing an object moves the last one
/// into its place; [`ObjectPool::remove`] reports the index that was vacated at the
/// end so index-based structures can follow the move.
#[derive(Clone, Default)]
pub struct ObjectPool {
    bounds: Vec<Aabb3>,
    payloads: Vec<Payload>,
    handles: Vec<Handle>,
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    max_objects: Option<usize>,
}

impl Debug for ObjectPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("len", &self.bounds.len())
            .field("slots", &self.slots.len())
            .field("free_slots", &self.free_slots.len())
            .field("max_objects", &self.max_objects)
            .finish_non_exhaustive()
    }
}

impl ObjectPool {
    /// Create an empty pool without an object limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty pool that refuses to hold more than `max_objects` objects.
    pub fn with_max_objects(max_objects: usize) -> Self {
        Self {
            max_objects: Some(max_objects),
            ..Self::default()
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Whether the pool holds no objects.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Bounds of all objects, indexed by pool index.
    pub fn bounds(&self) -> &[Aabb3] {
        &self.bounds
    }

    /// Payloads of all objects, indexed by pool index.
    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    /// Try to make room for `additional` more objects.
    pub fn reserve(&mut self, additional: usize) -> Result<(), PoolError> {
        let failed = |_| PoolError::AllocationFailed {
            requested: additional,
        };
        self.bounds.try_reserve(additional).map_err(failed)?;
        self.payloads.try_reserve(additional).map_err(failed)?;
        self.handles.try_reserve(additional).map_err(failed)?;
        let new_slots = additional.saturating_sub(self.free_slots.len());
        self.slots.try_reserve(new_slots).map_err(failed)?;
        Ok(())
    }

    /// Store a new object and return its handle.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Pool indices are 32-bit; pools never grow beyond u32::MAX objects."
    )]
    pub fn add(&mut self, bounds: Aabb3, payload: Payload) -> Result<Handle, PoolError> {
        if let Some(capacity) = self.max_objects {
            if self.len() >= capacity {
                return Err(PoolError::CapacityExceeded { capacity });
            }
        }
        self.reserve(1)?;
        let index = self.len() as u32;
        let handle = if let Some(slot) = self.free_slots.pop() {
            let s = &mut self.slots[slot];
            s.generation = s.generation.wrapping_add(1);
            s.index = index;
            Handle::new(slot, s.generation)
        } else {
            self.slots.push(Slot {
                index,
                generation: 1,
            });
            Handle::new(self.slots.len() - 1, 1)
        };
        self.bounds.push(bounds);
        self.payloads.push(payload);
        self.handles.push(handle);
        Ok(handle)
    }

    /// Current pool index of a live handle.
    pub fn index_of(&self, handle: Handle) -> Option<usize> {
        let slot = self.slots.get(handle.slot())?;
        (slot.generation == handle.generation() && slot.index != VACANT)
            .then_some(slot.index as usize)
    }

    /// Whether the handle refers to a live object.
    pub fn contains(&self, handle: Handle) -> bool {
        self.index_of(handle).is_some()
    }

    /// Handle of the object stored at `index`.
    pub fn handle_at(&self, index: usize) -> Option<Handle> {
        self.handles.get(index).copied()
    }

    /// Bounds and payload of a live handle.
    pub fn get(&self, handle: Handle) -> Option<(Aabb3, Payload)> {
        let i = self.index_of(handle)?;
        Some((self.bounds[i], self.payloads[i]))
    }

    /// Payload of a live handle.
    pub fn payload(&self, handle: Handle) -> Option<Payload> {
        self.index_of(handle).map(|i| self.payloads[i])
    }

    /// Replace the bounds of a live handle. Returns false for stale handles.
    pub fn update(&mut self, handle: Handle, bounds: Aabb3) -> bool {
        match self.index_of(handle) {
            Some(i) => {
                self.bounds[i] = bounds;
                true
            }
            None => false,
        }
    }

    /// Remove a live handle.
    ///
    /// The last object is moved into the freed index. Returns the index the last
    /// object occupied before the move; it equals the removed object's own index
    /// when the removed object was last.
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Pool indices are 32-bit; pools never grow beyond u32::MAX objects."
    )]
    pub fn remove(&mut self, handle: Handle) -> Option<usize> {
        let index = self.index_of(handle)?;
        let last = self.len() - 1;
        self.bounds.swap_remove(index);
        self.payloads.swap_remove(index);
        self.handles.swap_remove(index);
        if index != last {
            let moved = self.handles[index];
            self.slots[moved.slot()].index = index as u32;
        }
        self.slots[handle.slot()].index = VACANT;
        self.free_slots.push(handle.slot());
        Some(last)
    }

    /// Translate every stored box by `-shift`.
    pub fn shift_origin(&mut self, shift: Vec3) {
        for b in &mut self.bounds {
            *b = b.translated(-shift);
        }
    }

    /// Drop all objects and release memory. Outstanding handles become stale.
    pub fn release(&mut self) {
        // Vacated slots bump their generation on reuse, so old handles stay stale.
        for (slot, s) in self.slots.iter_mut().enumerate() {
            if s.index != VACANT {
                s.index = VACANT;
                self.free_slots.push(slot);
            }
        }
        self.bounds = Vec::new();
        self.payloads = Vec::new();
        self.handles = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(x: f32) -> Aabb3 {
        Aabb3::new(Vec3::new(x, 0.0, 0.0), Vec3::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn remove_moves_last_into_hole() {
        let mut pool = ObjectPool::new();
        let handles: Vec<_> = (0..4)
            .map(|i| pool.add(cube(i as f32), Payload::from(i)).unwrap())
            .collect();
        let relocated = pool.remove(handles[1]).unwrap();
        assert_eq!(relocated, 3, "last index should be reported");
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.index_of(handles[3]), Some(1));
        assert_eq!(pool.payloads()[1], Payload::from(3));
        assert_eq!(pool.handle_at(1), Some(handles[3]));
        assert!(!pool.contains(handles[1]));
    }

    #[test]
    fn removing_last_reports_itself() {
        let mut pool = ObjectPool::new();
        let a = pool.add(cube(0.0), Payload::from(0)).unwrap();
        let b = pool.add(cube(1.0), Payload::from(1)).unwrap();
        assert_eq!(pool.remove(b), Some(1));
        assert_eq!(pool.index_of(a), Some(0));
    }

    #[test]
    fn recycled_slot_rejects_stale_handle() {
        let mut pool = ObjectPool::new();
        let a = pool.add(cube(0.0), Payload::from(0)).unwrap();
        pool.remove(a).unwrap();
        let b = pool.add(cube(5.0), Payload::from(5)).unwrap();
        assert_eq!(a.slot(), b.slot(), "slot should be recycled");
        assert_ne!(a, b);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.remove(a), None, "double remove must be rejected");
        assert!(!pool.update(a, cube(1.0)));
        assert_eq!(pool.get(b), Some((cube(5.0), Payload::from(5))));
    }

    #[test]
    fn capacity_limit_is_reported() {
        let mut pool = ObjectPool::with_max_objects(2);
        pool.add(cube(0.0), Payload::from(0)).unwrap();
        pool.add(cube(1.0), Payload::from(1)).unwrap();
        assert_eq!(
            pool.add(cube(2.0), Payload::from(2)),
            Err(PoolError::CapacityExceeded { capacity: 2 })
        );
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn shift_origin_translates() {
        let mut pool = ObjectPool::new();
        let h = pool.add(cube(10.0), Payload::from(0)).unwrap();
        pool.shift_origin(Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(pool.get(h).unwrap().0, cube(0.0));
    }

    #[test]
    fn release_invalidates_handles() {
        let mut pool = ObjectPool::new();
        let h = pool.add(cube(0.0), Payload::from(0)).unwrap();
        pool.release();
        assert!(pool.is_empty());
        assert!(!pool.contains(h));
        let h2 = pool.add(cube(0.0), Payload::from(1)).unwrap();
        assert_ne!(h, h2);
        assert!(!pool.contains(h));
    }
}
