//! Coalescing set of closed `u64` ranges.
//!
//! Stored intervals never overlap and never touch: inserting `[5,10]` next to
//! `[11,20]` yields a single `[5,20]`. The backing `BTreeMap` is keyed by the
//! lower bound so predecessor lookup is logarithmic and range scans are
//! `O(log n + k)`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Closed range `[lo, hi]` of row indices.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub lo: u64,
    pub hi: u64,
}

impl RowRange {
    pub fn new(lo: u64, hi: u64) -> Result<Self, CoreError> {
        if lo > hi {
            return Err(CoreError::InvalidRange { lo, hi });
        }
        Ok(Self { lo, hi })
    }

    /// Range covering both endpoints, whichever order they come in.
    pub fn spanning(a: u64, b: u64) -> Self {
        Self {
            lo: a.min(b),
            hi: a.max(b),
        }
    }

    pub fn single(row: u64) -> Self {
        Self { lo: row, hi: row }
    }

    /// Number of rows covered. Saturates for the full `u64` domain.
    pub fn len(&self) -> u64 {
        (self.hi - self.lo).saturating_add(1)
    }

    pub fn contains(&self, row: u64) -> bool {
        self.lo <= row && row <= self.hi
    }

    pub fn contains_range(&self, other: &RowRange) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    pub fn overlaps(&self, other: &RowRange) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    /// Number of rows strictly between the two ranges, `0` when they touch
    /// and `None` when they overlap.
    pub fn gap_to(&self, other: &RowRange) -> Option<u64> {
        if self.overlaps(other) {
            None
        } else if self.hi < other.lo {
            Some(other.lo - self.hi - 1)
        } else {
            Some(self.lo - other.hi - 1)
        }
    }

    pub fn union(&self, other: &RowRange) -> RowRange {
        RowRange {
            lo: self.lo.min(other.lo),
            hi: self.hi.max(other.hi),
        }
    }

    pub fn intersection(&self, other: &RowRange) -> Option<RowRange> {
        let lo = self.lo.max(other.lo);
        let hi = self.hi.min(other.hi);
        (lo <= hi).then_some(RowRange { lo, hi })
    }
}

impl fmt::Debug for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.lo, self.hi)
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.lo, self.hi)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interval<M> {
    pub range: RowRange,
    pub meta: Option<M>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSet<M = ()> {
    // lo -> (hi, meta)
    map: BTreeMap<u64, (u64, Option<M>)>,
}

impl<M> Default for IntervalSet<M> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<M: Clone> IntervalSet<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Insert `range`, merging every stored interval it overlaps or touches.
    /// Returns how many stored intervals were absorbed into the result.
    ///
    /// The merged interval takes `meta` when given, otherwise the metadata of
    /// the first absorbed interval.
    pub fn add(&mut self, range: RowRange, meta: Option<M>) -> usize {
        let mut lo = range.lo;
        let mut hi = range.hi;
        let mut absorbed: Vec<u64> = Vec::new();
        let mut inherited: Option<M> = None;

        if let Some((&p_lo, (p_hi, p_meta))) = self.map.range(..=range.lo).next_back() {
            if p_hi.saturating_add(1) >= range.lo {
                lo = p_lo;
                hi = hi.max(*p_hi);
                absorbed.push(p_lo);
                inherited = p_meta.clone();
            }
        }

        let scan_hi = range.hi.saturating_add(1);
        if range.lo <= scan_hi {
            for (&k_lo, (k_hi, k_meta)) in self.map.range(range.lo..=scan_hi) {
                if absorbed.first() == Some(&k_lo) {
                    continue;
                }
                hi = hi.max(*k_hi);
                absorbed.push(k_lo);
                if inherited.is_none() {
                    inherited = k_meta.clone();
                }
            }
        }

        for k in &absorbed {
            self.map.remove(k);
        }
        self.map.insert(lo, (hi, meta.or(inherited)));
        absorbed.len()
    }

    /// Delete `range` from the set, trimming or splitting intervals that
    /// straddle its bounds. Returns how many stored intervals were touched.
    pub fn remove(&mut self, range: RowRange) -> usize {
        let mut touched = 0;
        let mut reinsert: Vec<(u64, u64, Option<M>)> = Vec::new();
        let mut doomed: Vec<u64> = Vec::new();

        if let Some((&p_lo, (p_hi, p_meta))) = self.map.range(..range.lo).next_back() {
            if *p_hi >= range.lo {
                touched += 1;
                doomed.push(p_lo);
                reinsert.push((p_lo, range.lo - 1, p_meta.clone()));
                if *p_hi > range.hi {
                    reinsert.push((range.hi + 1, *p_hi, p_meta.clone()));
                }
            }
        }

        for (&k_lo, (k_hi, k_meta)) in self.map.range(range.lo..=range.hi) {
            touched += 1;
            doomed.push(k_lo);
            if *k_hi > range.hi {
                reinsert.push((range.hi + 1, *k_hi, k_meta.clone()));
            }
        }

        for k in doomed {
            self.map.remove(&k);
        }
        for (lo, hi, meta) in reinsert {
            self.map.insert(lo, (hi, meta));
        }
        touched
    }

    /// Stored interval containing `row`, if any.
    pub fn find(&self, row: u64) -> Option<Interval<M>> {
        self.map
            .range(..=row)
            .next_back()
            .filter(|(_, (hi, _))| *hi >= row)
            .map(|(&lo, (hi, meta))| Interval {
                range: RowRange { lo, hi: *hi },
                meta: meta.clone(),
            })
    }

    pub fn contains(&self, row: u64) -> bool {
        self.find(row).is_some()
    }

    /// True when every row of `range` is covered. Because stored intervals
    /// never touch, full coverage means a single interval contains it.
    pub fn has(&self, range: RowRange) -> bool {
        self.find(range.lo)
            .is_some_and(|interval| interval.range.hi >= range.hi)
    }

    /// Ordered sub-ranges of `range` that are NOT covered.
    pub fn diff(&self, range: RowRange) -> Vec<RowRange> {
        let mut gaps = Vec::new();
        let mut cursor = range.lo;

        if let Some(covering) = self.find(range.lo) {
            match covering.range.hi.checked_add(1) {
                Some(next) if covering.range.hi < range.hi => cursor = next,
                _ => return gaps,
            }
        }

        for (&k_lo, (k_hi, _)) in self.map.range(cursor..=range.hi) {
            if k_lo > cursor {
                gaps.push(RowRange {
                    lo: cursor,
                    hi: k_lo - 1,
                });
            }
            match k_hi.checked_add(1) {
                Some(next) if *k_hi < range.hi => cursor = next,
                _ => return gaps,
            }
        }

        gaps.push(RowRange {
            lo: cursor,
            hi: range.hi,
        });
        gaps
    }

    /// Ordered sub-ranges of `range` that ARE covered.
    pub fn intersect(&self, range: RowRange) -> Vec<RowRange> {
        let start = self
            .find(range.lo)
            .map(|interval| interval.range.lo)
            .unwrap_or(range.lo);
        self.map
            .range(start..=range.hi)
            .filter_map(|(&lo, (hi, _))| RowRange { lo, hi: *hi }.intersection(&range))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowRange, Option<&M>)> + '_ {
        self.map
            .iter()
            .map(|(&lo, (hi, meta))| (RowRange { lo, hi: *hi }, meta.as_ref()))
    }

    /// All stored ranges in ascending order.
    pub fn get_all(&self) -> Vec<RowRange> {
        self.iter().map(|(range, _)| range).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn r(lo: u64, hi: u64) -> RowRange {
        RowRange::new(lo, hi).unwrap()
    }

    #[test]
    fn diff_reports_gaps_around_stored_ranges() {
        let mut set: IntervalSet = IntervalSet::new();
        set.add(r(5, 10), None);
        set.add(r(12, 15), None);
        assert_eq!(set.diff(r(0, 20)), vec![r(0, 4), r(11, 11), r(16, 20)]);
    }

    #[test]
    fn adjacent_ranges_merge() {
        let mut set: IntervalSet = IntervalSet::new();
        assert_eq!(set.add(r(5, 10), None), 0);
        assert_eq!(set.add(r(11, 20), None), 1);
        assert_eq!(set.get_all(), vec![r(5, 20)]);
    }

    #[test]
    fn add_bridging_many_intervals_counts_absorbed() {
        let mut set: IntervalSet = IntervalSet::new();
        set.add(r(0, 1), None);
        set.add(r(4, 5), None);
        set.add(r(8, 9), None);
        set.add(r(20, 21), None);
        assert_eq!(set.add(r(2, 7), None), 3);
        assert_eq!(set.get_all(), vec![r(0, 9), r(20, 21)]);
    }

    #[test]
    fn add_inside_existing_is_absorbed_without_growth() {
        let mut set: IntervalSet = IntervalSet::new();
        set.add(r(0, 100), None);
        assert_eq!(set.add(r(10, 20), None), 1);
        assert_eq!(set.get_all(), vec![r(0, 100)]);
    }

    #[test]
    fn remove_splits_straddling_interval() {
        let mut set: IntervalSet<&str> = IntervalSet::new();
        set.add(r(0, 20), Some("block"));
        assert_eq!(set.remove(r(5, 9)), 1);
        assert_eq!(set.get_all(), vec![r(0, 4), r(10, 20)]);
        assert_eq!(set.find(15).and_then(|i| i.meta), Some("block"));
    }

    #[test]
    fn remove_trims_multiple() {
        let mut set: IntervalSet = IntervalSet::new();
        set.add(r(0, 5), None);
        set.add(r(8, 12), None);
        set.add(r(15, 30), None);
        assert_eq!(set.remove(r(3, 20)), 3);
        assert_eq!(set.get_all(), vec![r(0, 2), r(21, 30)]);
    }

    #[test]
    fn has_requires_full_coverage() {
        let mut set: IntervalSet = IntervalSet::new();
        set.add(r(5, 10), None);
        assert!(set.has(r(5, 10)));
        assert!(set.has(r(7, 7)));
        assert!(!set.has(r(4, 6)));
        assert!(!set.has(r(10, 11)));
        assert!(set.contains(10));
        assert!(!set.contains(11));
    }

    #[test]
    fn meta_prefers_new_then_inherited() {
        let mut set: IntervalSet<u32> = IntervalSet::new();
        set.add(r(0, 4), Some(1));
        set.add(r(5, 6), None);
        assert_eq!(set.find(6).and_then(|i| i.meta), Some(1));
        set.add(r(6, 9), Some(2));
        assert_eq!(set.find(0).and_then(|i| i.meta), Some(2));
    }

    #[test]
    fn extremes_of_domain() {
        let mut set: IntervalSet = IntervalSet::new();
        set.add(r(u64::MAX - 2, u64::MAX), None);
        set.add(r(0, 0), None);
        assert_eq!(set.diff(r(u64::MAX - 5, u64::MAX)), vec![r(u64::MAX - 5, u64::MAX - 3)]);
        assert!(set.has(r(u64::MAX, u64::MAX)));
        assert_eq!(set.intersect(r(0, 3)), vec![r(0, 0)]);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Add(u64, u64),
        Remove(u64, u64),
    }

    fn step() -> impl Strategy<Value = Step> {
        (any::<bool>(), 0u64..64, 0u64..12).prop_map(|(add, lo, len)| {
            if add {
                Step::Add(lo, lo + len)
            } else {
                Step::Remove(lo, lo + len)
            }
        })
    }

    proptest! {
        #[test]
        fn matches_naive_row_set(steps in prop::collection::vec(step(), 0..40)) {
            let mut set: IntervalSet = IntervalSet::new();
            let mut model = BTreeSet::new();
            for s in &steps {
                match *s {
                    Step::Add(lo, hi) => {
                        set.add(r(lo, hi), None);
                        model.extend(lo..=hi);
                    }
                    Step::Remove(lo, hi) => {
                        set.remove(r(lo, hi));
                        for x in lo..=hi {
                            model.remove(&x);
                        }
                    }
                }
            }

            let all = set.get_all();
            for pair in all.windows(2) {
                prop_assert!(pair[0].hi + 1 < pair[1].lo, "{:?} touches {:?}", pair[0], pair[1]);
            }
            for x in 0..80u64 {
                let in_listing = all.iter().any(|range| range.contains(x));
                prop_assert_eq!(set.contains(x), model.contains(&x));
                prop_assert_eq!(in_listing, model.contains(&x));
            }
        }

        #[test]
        fn diff_and_intersect_partition_query(
            steps in prop::collection::vec(step(), 0..20),
            q_lo in 0u64..70,
            q_len in 0u64..30,
        ) {
            let mut set: IntervalSet = IntervalSet::new();
            for s in &steps {
                if let Step::Add(lo, hi) = *s {
                    set.add(r(lo, hi), None);
                }
            }
            let query = r(q_lo, q_lo + q_len);
            let mut pieces = set.diff(query);
            pieces.extend(set.intersect(query));
            pieces.sort();

            let mut cursor = query.lo;
            for piece in &pieces {
                prop_assert_eq!(piece.lo, cursor);
                cursor = piece.hi + 1;
            }
            prop_assert_eq!(cursor, query.hi + 1);
        }
    }
}
