use std::cmp;
use std::collections::btree_map::{BTreeMap, Iter};
use std::ops::Range;

/// A set of u64 values optimized for long runs and random insert/delete/contains.
#[derive(Debug, Default, Clone)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        RangeSet(BTreeMap::new())
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, end)| end > x)
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    pub fn insert(&mut self, mut x: Range<u64>) -> bool {
        if x.start == x.end {
            return false;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end >= x.end {
                // Wholly contained
                return false;
            }
            if end >= x.start {
                // Extend overlapping predecessor
                self.0.remove(&start);
                x.start = start;
            }
        }
        // Merge overlapping successors
        while let Some((start, end)) = self.succ(x.start) {
            if start > x.end {
                break;
            }
            self.0.remove(&start);
            x.end = cmp::max(x.end, end);
        }
        self.0.insert(x.start, x.end);
        true
    }

    /// Remove all of `other`'s members from this set.
    pub fn subtract(&mut self, other: &RangeSet) {
        for (&start, &end) in &other.0 {
            self.remove(start..end);
        }
    }

    pub fn remove(&mut self, x: Range<u64>) {
        if x.start == x.end {
            return;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end > x.start {
                self.0.remove(&start);
                if start < x.start {
                    self.0.insert(start, x.start);
                }
                if end > x.end {
                    self.0.insert(x.end, end);
                }
            }
        }
        while let Some((start, end)) = self.succ(x.start) {
            if start >= x.end {
                break;
            }
            self.0.remove(&start);
            if end > x.end {
                self.0.insert(x.end, end);
            }
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.0.iter().next().map(|(&start, _)| start)
    }

    pub fn max(&self) -> Option<u64> {
        self.0.iter().rev().next().map(|(_, &end)| end - 1)
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let result = self.0.iter().next().map(|(&start, &end)| start..end)?;
        self.0.remove(&result.start);
        Some(result)
    }

    /// Number of distinct ranges
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> RangeIter {
        RangeIter(self.0.iter())
    }

    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range(0..=x)
            .rev()
            .next()
            .map(|(&start, &end)| (start, end))
    }

    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0.range(x..).next().map(|(&start, &end)| (start, end))
    }
}

pub struct RangeIter<'a>(Iter<'a, u64, u64>);

impl<'a> Iterator for RangeIter<'a> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        self.0.next().map(|(&start, &end)| start..end)
    }
}

impl<'a> DoubleEndedIterator for RangeIter<'a> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        self.0.next_back().map(|(&start, &end)| start..end)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = RangeIter<'a>;
    fn into_iter(self) -> RangeIter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(set: &RangeSet) -> Vec<Range<u64>> {
        set.iter().collect()
    }

    #[test]
    fn merge_adjacent() {
        let mut set = RangeSet::new();
        assert!(set.insert(0..2));
        assert!(set.insert(2..4));
        assert_eq!(ranges(&set), &[0..4]);
    }

    #[test]
    fn merge_overlapping_successors() {
        let mut set = RangeSet::new();
        set.insert(2..4);
        set.insert(6..8);
        set.insert(10..12);
        assert!(set.insert(3..11));
        assert_eq!(ranges(&set), &[2..12]);
    }

    #[test]
    fn duplicate_is_noop() {
        let mut set = RangeSet::new();
        assert!(set.insert_one(5));
        assert!(!set.insert_one(5));
        assert!(set.contains(5));
        assert!(!set.contains(4));
    }

    #[test]
    fn subtract_splits() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        let mut other = RangeSet::new();
        other.insert(3..5);
        set.subtract(&other);
        assert_eq!(ranges(&set), &[0..3, 5..10]);
    }

    #[test]
    fn pop_min_in_order() {
        let mut set = RangeSet::new();
        set.insert(4..6);
        set.insert(0..2);
        assert_eq!(set.pop_min(), Some(0..2));
        assert_eq!(set.pop_min(), Some(4..6));
        assert_eq!(set.pop_min(), None);
    }

    #[test]
    fn min_max() {
        let mut set = RangeSet::new();
        set.insert(3..7);
        set.insert(9..10);
        assert_eq!(set.min(), Some(3));
        assert_eq!(set.max(), Some(9));
    }
}
