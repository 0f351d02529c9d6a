//! A `CoalescingBlockSet` is the fast, indexed `Land` a `Failover`
//! typically uses as its primary: a `BTreeMap` of disjoint ranges keyed
//! by `base`, coalesced against both neighbours on insert. It may run
//! out of "metadata" (modelled as a node budget) while admitting a
//! mutation, the failure mode the Failover exists to route around.
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

use std::collections::BTreeMap;
use std::fmt;

use crate::land::DeleteError;
use crate::land::Land;
use crate::land::LandError;
use crate::range::FindDelete;
use crate::range::FindResult;
use crate::range::Range;
use crate::range::ZoneSet;

/// A coalescing, `BTreeMap`-indexed set of disjoint ranges.
#[derive(Debug)]
pub struct CoalescingBlockSet {
    alignment: usize,
    /// Maximum number of nodes this set may hold at once, simulating a
    /// bounded metadata allocator. `None` means unbounded.
    budget: Option<usize>,
    ranges: BTreeMap<usize, usize>,
}

impl CoalescingBlockSet {
    pub fn new(alignment: usize, budget: Option<usize>) -> Self {
        assert!(alignment.is_power_of_two());
        Self {
            alignment,
            budget,
            ranges: BTreeMap::new(),
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn node_count(&self) -> usize {
        self.ranges.len()
    }

    fn has_room_for_one_more_node(&self) -> bool {
        match self.budget {
            Some(budget) => self.ranges.len() < budget,
            None => true,
        }
    }

    /// Returns the entry whose key is the greatest `base <= address`.
    fn predecessor(&self, address: usize) -> Option<(usize, usize)> {
        self.ranges
            .range(..=address)
            .next_back()
            .map(|(&base, &limit)| (base, limit))
    }

    /// Returns the range (if any) that contains `range` entirely.
    fn find_containing(&self, range: Range) -> Option<Range> {
        if range.is_empty() {
            return None;
        }

        let (base, limit) = self.predecessor(range.base())?;
        if range.limit() <= limit {
            Some(unsafe { Range::new_unchecked(base, limit) })
        } else {
            None
        }
    }

    /// Inserts `range`, coalescing with neighbours that touch it.
    /// Fails with `LandError::Fail` if `range` overlaps an existing
    /// range (a double-free in the caller), and with
    /// `LandError::AllocFailure` if admitting it needs a new node and
    /// the budget is exhausted.
    fn insert_disjoint(&mut self, range: Range) -> Result<Range, LandError> {
        if range.is_empty() {
            return Ok(range);
        }

        let orig_base = range.base();
        let orig_limit = range.limit();

        // Any node starting strictly inside [orig_base, orig_limit)
        // overlaps the input; a node starting exactly at orig_limit
        // merely touches it and is handled as a merge below.
        if self.ranges.range(orig_base..orig_limit).next().is_some() {
            return Err(LandError::Fail);
        }

        let mut base = orig_base;
        let mut limit = orig_limit;
        let mut merges = 0usize;

        if let Some((prev_base, prev_limit)) = self.predecessor(orig_base) {
            if prev_limit > orig_base {
                return Err(LandError::Fail);
            }
            if prev_limit == orig_base {
                base = prev_base;
                merges += 1;
            }
        }

        if let Some(&next_limit) = self.ranges.get(&orig_limit) {
            limit = next_limit;
            merges += 1;
        }

        if merges == 0 && !self.has_room_for_one_more_node() {
            return Err(LandError::AllocFailure);
        }

        if merges > 0 {
            let to_remove: Vec<usize> = self.ranges.range(base..=limit).map(|(&b, _)| b).collect();
            for key in to_remove {
                self.ranges.remove(&key);
            }
        }

        self.ranges.insert(base, limit);
        Ok(unsafe { Range::new_unchecked(base, limit) })
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
impl Land for CoalescingBlockSet {
    fn size(&self) -> usize {
        self.ranges.iter().map(|(&b, &l)| l - b).sum()
    }

    #[requires(range.is_aligned(self.alignment), "range must be aligned")]
    fn insert(&mut self, range: Range) -> Result<Range, LandError> {
        self.insert_disjoint(range)
    }

    fn insert_steal(&mut self, range: &mut Range) -> Result<(), LandError> {
        match self.insert(*range) {
            Ok(merged) => {
                *range = merged;
                Ok(())
            }
            Err(LandError::AllocFailure) => Err(LandError::Fail),
            Err(other) => Err(other),
        }
    }

    #[requires(range.is_aligned(self.alignment), "range must be aligned")]
    fn delete(&mut self, range: Range) -> Result<Range, DeleteError> {
        if range.is_empty() {
            return Err(DeleteError::NotFound);
        }

        let old_range = match self.find_containing(range) {
            Some(r) => r,
            None => return Err(DeleteError::NotFound),
        };

        let (left, right) = old_range.split_around(range);

        let nodes_needed = !left.is_empty() as usize + !right.is_empty() as usize;
        // We always free the single node that held `old_range`; we only
        // need *new* room if we're about to store more than one
        // fragment.
        if nodes_needed > 1 && (self.ranges.len() - 1 + nodes_needed) > self.budget.unwrap_or(usize::MAX)
        {
            return Err(DeleteError::AllocFailure { old_range });
        }

        self.ranges.remove(&old_range.base());
        if !left.is_empty() {
            self.ranges.insert(left.base(), left.limit());
        }
        if !right.is_empty() {
            self.ranges.insert(right.base(), right.limit());
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
        for (&base, &limit) in self.ranges.iter() {
            let range = unsafe { Range::new_unchecked(base, limit) };
            if !visitor(range) {
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
            .ranges
            .iter()
            .find(|(&b, &l)| l - b >= size)
            .map(|(&b, &l)| unsafe { Range::new_unchecked(b, l) });

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
            .ranges
            .iter()
            .rev()
            .find(|(&b, &l)| l - b >= size)
            .map(|(&b, &l)| unsafe { Range::new_unchecked(b, l) });

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
            .ranges
            .iter()
            .filter(|(&b, &l)| l - b >= size)
            .max_by_key(|(&b, &l)| l - b)
            .map(|(&b, &l)| unsafe { Range::new_unchecked(b, l) });

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
        // Zone stripes are fixed at a 1 MiB granularity; see `range::zone_of`.
        const ZONE_SHIFT: u32 = 20;

        let mut candidates: Vec<(usize, usize)> = self
            .ranges
            .iter()
            .filter(|(&b, &l)| {
                l - b >= size
                    && zones.is_superset_of_range(unsafe { Range::new_unchecked(b, l) }, ZONE_SHIFT)
            })
            .map(|(&b, &l)| (b, l))
            .collect();

        if high {
            candidates.reverse();
        }

        let hit = candidates
            .first()
            .map(|&(b, l)| unsafe { Range::new_unchecked(b, l) });

        match hit {
            None => Ok(None),
            Some(old_range) => {
                let range = self.apply_find_delete(old_range, find_delete, size)?;
                Ok(Some(FindResult { range, old_range }))
            }
        }
    }

    fn flush(&mut self, target: &mut dyn Land) -> Result<(), LandError> {
        let entries: Vec<(usize, usize)> =
            self.ranges.iter().map(|(&b, &l)| (b, l)).collect();

        for (base, limit) in entries {
            let range = unsafe { Range::new_unchecked(base, limit) };
            if target.insert(range).is_ok() {
                self.ranges.remove(&base);
            }
        }
        Ok(())
    }

    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> Result<(), LandError> {
        let indent = " ".repeat(depth);
        writeln!(
            out,
            "{}CoalescingBlockSet @ {:p} ({} nodes, {} bytes)",
            indent,
            self,
            self.node_count(),
            self.size()
        )
        .map_err(|_| LandError::Param)
    }

    fn class_name(&self) -> &'static str {
        "CoalescingBlockSet"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn r(base: usize, limit: usize) -> Range {
        Range::new(base, limit).unwrap()
    }

    #[test]
    fn insert_and_coalesce() {
        let mut cbs = CoalescingBlockSet::new(1, None);
        assert_eq!(cbs.insert(r(0, 10)).unwrap(), r(0, 10));
        assert_eq!(cbs.insert(r(10, 20)).unwrap(), r(0, 20));
        assert_eq!(cbs.node_count(), 1);
        assert_eq!(cbs.size(), 20);
    }

    #[test]
    fn insert_overlap_fails() {
        let mut cbs = CoalescingBlockSet::new(1, None);
        cbs.insert(r(0, 10)).unwrap();
        assert_eq!(cbs.insert(r(5, 15)), Err(LandError::Fail));
    }

    #[test]
    fn budget_exhaustion_on_insert() {
        let mut cbs = CoalescingBlockSet::new(1, Some(1));
        cbs.insert(r(0, 10)).unwrap();
        // Non-adjacent range needs a second node; budget forbids it.
        assert_eq!(cbs.insert(r(100, 110)), Err(LandError::AllocFailure));
    }

    #[test]
    fn delete_splits() {
        let mut cbs = CoalescingBlockSet::new(1, None);
        cbs.insert(r(0, 100)).unwrap();
        let old = cbs.delete(r(40, 60)).unwrap();
        assert_eq!(old, r(0, 100));
        assert_eq!(cbs.node_count(), 2);
        assert_eq!(cbs.size(), 80);
    }

    #[test]
    fn delete_not_found() {
        let mut cbs = CoalescingBlockSet::new(1, None);
        cbs.insert(r(0, 10)).unwrap();
        assert_eq!(cbs.delete(r(50, 60)), Err(DeleteError::NotFound));
    }

    #[test]
    fn delete_budget_exhaustion_reports_old_range() {
        let mut cbs = CoalescingBlockSet::new(1, Some(1));
        cbs.insert(r(0, 100)).unwrap();
        match cbs.delete(r(40, 60)) {
            Err(DeleteError::AllocFailure { old_range }) => assert_eq!(old_range, r(0, 100)),
            other => panic!("expected AllocFailure, got {:?}", other),
        }
        // The failed delete must not have mutated the set.
        assert_eq!(cbs.node_count(), 1);
        assert_eq!(cbs.size(), 100);
    }

    #[test]
    fn find_largest() {
        let mut cbs = CoalescingBlockSet::new(1, None);
        cbs.insert(r(0, 10)).unwrap();
        cbs.insert(r(100, 130)).unwrap();
        let found = cbs.find_largest(15, FindDelete::None).unwrap().unwrap();
        assert_eq!(found.range, r(100, 130));
    }

    #[test]
    fn find_with_delete_entire() {
        let mut cbs = CoalescingBlockSet::new(1, None);
        cbs.insert(r(0, 10)).unwrap();
        let found = cbs.find_first(5, FindDelete::Entire).unwrap().unwrap();
        assert_eq!(found.range, r(0, 10));
        assert_eq!(cbs.size(), 0);
    }

    #[test]
    fn find_in_zones_respects_mask() {
        let mut cbs = CoalescingBlockSet::new(1, None);
        let stripe = 1usize << 20;
        cbs.insert(Range::new(0, stripe / 2).unwrap()).unwrap();
        cbs.insert(Range::new(stripe, stripe + stripe / 2).unwrap())
            .unwrap();

        let zone1 = ZoneSet::single(1);
        let found = cbs
            .find_in_zones(100, zone1, false, FindDelete::None)
            .unwrap()
            .unwrap();
        assert_eq!(found.range.base(), stripe);
    }

    #[test]
    fn flush_moves_everything_when_unbounded() {
        let mut src = CoalescingBlockSet::new(1, None);
        src.insert(r(0, 10)).unwrap();
        src.insert(r(100, 110)).unwrap();

        let mut dst = CoalescingBlockSet::new(1, None);
        src.flush(&mut dst).unwrap();

        assert_eq!(src.size(), 0);
        assert_eq!(dst.size(), 20);
    }

    proptest::proptest! {
        // Inserting a batch of pairwise-disjoint, non-adjacent ranges
        // (in any order) must leave `size()` equal to the sum of their
        // individual sizes: coalescing never loses or double-counts
        // bytes that weren't actually adjacent.
        #[test]
        fn size_is_additive_over_disjoint_inserts(
            mut starts in proptest::collection::hash_set(0usize..1_000_000, 1..20)
        ) {
            let mut cbs = CoalescingBlockSet::new(1, None);
            let mut expected = 0usize;

            // Space the ranges out so none are adjacent or overlapping:
            // each occupies [10*start, 10*start + 5).
            let mut starts: Vec<usize> = starts.drain().collect();
            starts.sort_unstable();

            for start in starts {
                let base = start * 10;
                let range = r(base, base + 5);
                cbs.insert(range).unwrap();
                expected += range.size();
            }

            proptest::prop_assert_eq!(cbs.size(), expected);
        }

        // Deleting exactly what was inserted always empties the set
        // back out, regardless of insertion order.
        #[test]
        fn delete_after_insert_empties(base in 0usize..1_000_000, len in 1usize..1000) {
            let mut cbs = CoalescingBlockSet::new(1, None);
            let range = r(base, base + len);
            cbs.insert(range).unwrap();
            let old = cbs.delete(range).unwrap();
            proptest::prop_assert_eq!(old, range);
            proptest::prop_assert_eq!(cbs.size(), 0);
        }
    }
}
