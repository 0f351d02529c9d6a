//! An `InlineFreelist` is the allocation-free `Land` a `Failover` uses as
//! its secondary: a fixed-capacity array of ranges with no coalescing
//! and no heap allocation to admit a new entry, so it can always accept
//! a range that is already free even when the primary's metadata
//! allocator is exhausted.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::fmt;

use crate::land::DeleteError;
use crate::land::Land;
use crate::land::LandError;
use crate::range::FindDelete;
use crate::range::FindResult;
use crate::range::Range;
use crate::range::ZoneSet;

/// A capacity-bounded, allocation-free set of disjoint ranges.
#[derive(Debug)]
pub struct InlineFreelist {
    alignment: usize,
    slots: Vec<Option<Range>>,
}

impl InlineFreelist {
    /// Reserves `capacity` slots up front; admitting a range never
    /// needs to grow the backing storage afterwards.
    pub fn new(alignment: usize, capacity: usize) -> Self {
        assert!(alignment.is_power_of_two());
        Self {
            alignment,
            slots: vec![None; capacity],
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_slot_containing(&self, range: Range) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(existing) if existing.contains(range)))
    }

    fn overlaps_any(&self, range: Range) -> bool {
        self.slots
            .iter()
            .any(|slot| matches!(slot, Some(existing) if existing.overlaps(range)))
    }

    fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    fn apply_find_delete(
        &mut self,
        found: Range,
        find_delete: FindDelete,
        size: usize,
    ) -> Result<Range, LandError> {
        let to_delete = match find_delete {
            FindDelete::None => return Ok(found),
            FindDelete::Low => unsafe { Range::new_unchecked(found.base(), found.base() + size) },
            FindDelete::High => unsafe {
                Range::new_unchecked(found.limit() - size, found.limit())
            },
            FindDelete::Entire => found,
        };

        match self.delete(to_delete) {
            Ok(_) => Ok(to_delete),
            Err(DeleteError::AllocFailure { .. }) => Err(LandError::AllocFailure),
            Err(DeleteError::NotFound) => {
                unreachable!("just found this range; it must be present")
            }
            Err(DeleteError::Other(msg)) => Err(LandError::Other(msg)),
        }
    }
}

#[contract_trait]
impl Land for InlineFreelist {
    fn size(&self) -> usize {
        self.slots.iter().flatten().map(|r| r.size()).sum()
    }

    #[requires(range.is_aligned(self.alignment), "range must be aligned")]
    fn insert(&mut self, range: Range) -> Result<Range, LandError> {
        if range.is_empty() {
            return Ok(range);
        }

        if self.overlaps_any(range) {
            return Err(LandError::Fail);
        }

        // A free list never coalesces, so a single insert needs exactly
        // one slot; if the pool is full, that is the one case where
        // admitting an already-free range would need fresh capacity.
        let slot = self
            .first_free_slot()
            .ok_or(LandError::Other("freelist exhausted"))?;
        self.slots[slot] = Some(range);
        Ok(range)
    }

    fn insert_steal(&mut self, range: &mut Range) -> Result<(), LandError> {
        match self.insert(*range) {
            Ok(_) => Ok(()),
            Err(_) => Err(LandError::Fail),
        }
    }

    #[requires(range.is_aligned(self.alignment), "range must be aligned")]
    fn delete(&mut self, range: Range) -> Result<Range, DeleteError> {
        if range.is_empty() {
            return Err(DeleteError::NotFound);
        }

        let slot = match self.find_slot_containing(range) {
            Some(s) => s,
            None => return Err(DeleteError::NotFound),
        };

        let old_range = self.slots[slot].expect("slot located by find_slot_containing is occupied");
        let (left, right) = old_range.split_around(range);

        let fragments_needed = !left.is_empty() as usize + !right.is_empty() as usize;
        // We free the slot that held `old_range`; we only need spare
        // capacity if both fragments survive.
        let spare_slots = self.slots.iter().filter(|s| s.is_none()).count() + 1;
        if fragments_needed > spare_slots {
            return Err(DeleteError::AllocFailure { old_range });
        }

        self.slots[slot] = None;
        if !left.is_empty() {
            let empty = self.first_free_slot().expect("room already checked above");
            self.slots[empty] = Some(left);
        }
        if !right.is_empty() {
            let empty = self.first_free_slot().expect("room already checked above");
            self.slots[empty] = Some(right);
        }

        Ok(old_range)
    }

    fn delete_steal(&mut self, range: &mut Range) -> Result<(), LandError> {
        match self.delete(*range) {
            Ok(_) => Ok(()),
            Err(_) => Err(LandError::Fail),
        }
    }

    fn iterate(&self, visitor: &mut dyn FnMut(Range) -> bool) -> bool {
        for range in self.slots.iter().flatten() {
            if !visitor(*range) {
                return false;
            }
        }
        true
    }

    fn find_first(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        let hit = self
            .slots
            .iter()
            .flatten()
            .filter(|r| r.size() >= size)
            .min_by_key(|r| r.base())
            .copied();

        match hit {
            None => Ok(None),
            Some(old_range) => {
                let range = self.apply_find_delete(old_range, find_delete, size)?;
                Ok(Some(FindResult { range, old_range }))
            }
        }
    }

    fn find_last(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        let hit = self
            .slots
            .iter()
            .flatten()
            .filter(|r| r.size() >= size)
            .max_by_key(|r| r.base())
            .copied();

        match hit {
            None => Ok(None),
            Some(old_range) => {
                let range = self.apply_find_delete(old_range, find_delete, size)?;
                Ok(Some(FindResult { range, old_range }))
            }
        }
    }

    fn find_largest(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        let hit = self
            .slots
            .iter()
            .flatten()
            .filter(|r| r.size() >= size)
            .max_by_key(|r| r.size())
            .copied();

        match hit {
            None => Ok(None),
            Some(old_range) => {
                let range = self.apply_find_delete(old_range, find_delete, size)?;
                Ok(Some(FindResult { range, old_range }))
            }
        }
    }

    fn find_in_zones(
        &mut self,
        size: usize,
        zones: ZoneSet,
        high: bool,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        const ZONE_SHIFT: u32 = 20;

        let mut candidates: Vec<Range> = self
            .slots
            .iter()
            .flatten()
            .filter(|r| r.size() >= size && zones.is_superset_of_range(**r, ZONE_SHIFT))
            .copied()
            .collect();
        candidates.sort_by_key(|r| r.base());
        if high {
            candidates.reverse();
        }

        let hit = candidates.first().copied();

        match hit {
            None => Ok(None),
            Some(old_range) => {
                let range = self.apply_find_delete(old_range, find_delete, size)?;
                Ok(Some(FindResult { range, old_range }))
            }
        }
    }

    fn flush(&mut self, target: &mut dyn Land) -> Result<(), LandError> {
        for slot in self.slots.iter_mut() {
            if let Some(range) = *slot {
                if target.insert(range).is_ok() {
                    *slot = None;
                }
            }
        }
        Ok(())
    }

    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> Result<(), LandError> {
        let indent = " ".repeat(depth);
        writeln!(
            out,
            "{}InlineFreelist @ {:p} ({}/{} slots, {} bytes)",
            indent,
            self,
            self.len(),
            self.capacity(),
            self.size()
        )
        .map_err(|_| LandError::Param)
    }

    fn class_name(&self) -> &'static str {
        "InlineFreelist"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn r(base: usize, limit: usize) -> Range {
        Range::new(base, limit).unwrap()
    }

    #[test]
    fn insert_and_delete() {
        let mut fl = InlineFreelist::new(1, 4);
        assert_eq!(fl.insert(r(0, 10)).unwrap(), r(0, 10));
        assert_eq!(fl.len(), 1);

        let old = fl.delete(r(0, 10)).unwrap();
        assert_eq!(old, r(0, 10));
        assert!(fl.is_empty());
    }

    #[test]
    fn no_coalescing() {
        let mut fl = InlineFreelist::new(1, 4);
        fl.insert(r(0, 10)).unwrap();
        fl.insert(r(10, 20)).unwrap();
        assert_eq!(fl.len(), 2);
        assert_eq!(fl.size(), 20);
    }

    #[test]
    fn capacity_exhaustion_surfaces_as_other() {
        let mut fl = InlineFreelist::new(1, 1);
        fl.insert(r(0, 10)).unwrap();
        match fl.insert(r(100, 110)) {
            Err(LandError::Other(_)) => {}
            other => panic!("expected Other, got {:?}", other),
        }
    }

    #[test]
    fn overlap_fails() {
        let mut fl = InlineFreelist::new(1, 4);
        fl.insert(r(0, 10)).unwrap();
        assert_eq!(fl.insert(r(5, 15)), Err(LandError::Fail));
    }

    #[test]
    fn delete_not_found() {
        let mut fl = InlineFreelist::new(1, 4);
        fl.insert(r(0, 10)).unwrap();
        assert_eq!(fl.delete(r(50, 60)), Err(DeleteError::NotFound));
    }

    #[test]
    fn delete_split_needs_spare_capacity() {
        let mut fl = InlineFreelist::new(1, 1);
        fl.insert(r(0, 100)).unwrap();
        // Deleting the middle needs two fragments but there's only one
        // total slot: the one we're about to free.
        match fl.delete(r(40, 60)) {
            Err(DeleteError::AllocFailure { old_range }) => assert_eq!(old_range, r(0, 100)),
            other => panic!("expected AllocFailure, got {:?}", other),
        }
    }

    #[test]
    fn delete_split_with_room() {
        let mut fl = InlineFreelist::new(1, 3);
        fl.insert(r(0, 100)).unwrap();
        let old = fl.delete(r(40, 60)).unwrap();
        assert_eq!(old, r(0, 100));
        assert_eq!(fl.len(), 2);
        assert_eq!(fl.size(), 80);
    }

    #[test]
    fn find_first_by_position() {
        let mut fl = InlineFreelist::new(1, 4);
        fl.insert(r(100, 110)).unwrap();
        fl.insert(r(0, 10)).unwrap();
        let found = fl.find_first(5, FindDelete::None).unwrap().unwrap();
        assert_eq!(found.range, r(0, 10));
    }
}
