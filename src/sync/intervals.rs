//! Closed-interval set algebra over integer seconds.
//!
//! [`IntervalSet`] records which spans of a subject's listening history have
//! been fully retrieved and persisted. The set is normalized after every
//! mutation: sorted by start, with overlapping and touching intervals merged,
//! so for consecutive intervals `a`, `b` it always holds that
//! `a.end + 1 < b.start`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::SyncError;

/// A closed range `[start, end]` of unix seconds. Always `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "(i64, i64)", into = "(i64, i64)")]
pub struct Interval {
    start: i64,
    end: i64,
}

impl Interval {
    /// Create an interval, rejecting `start > end`.
    pub fn new(start: i64, end: i64) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidRange(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Number of whole seconds in the interval, counting both endpoints.
    pub fn len(&self) -> u64 {
        self.duration_secs().saturating_add(1)
    }

    /// Distance between the endpoints (`end - start`).
    pub fn duration_secs(&self) -> u64 {
        self.end.abs_diff(self.start)
    }

    /// Whether `self` and `other` share at least one second.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Clip `self` to `bounds`, or `None` if they don't overlap.
    pub fn clip(&self, bounds: &Interval) -> Option<Interval> {
        self.overlaps(bounds).then(|| Interval {
            start: self.start.max(bounds.start),
            end: self.end.min(bounds.end),
        })
    }
}

impl TryFrom<(i64, i64)> for Interval {
    type Error = SyncError;

    fn try_from((start, end): (i64, i64)) -> Result<Self, Self::Error> {
        Interval::new(start, end)
    }
}

impl From<Interval> for (i64, i64) {
    fn from(interval: Interval) -> Self {
        (interval.start, interval.end)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.start, self.end)
    }
}

/// Normalized set of covered intervals for one subject.
///
/// Serialized as a plain list of `[start, end]` pairs; deserialization
/// normalizes, so a hand-edited or legacy list is accepted as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Interval>", into = "Vec<Interval>")]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    /// Build a set from an arbitrary (unsorted, overlapping) list.
    pub fn from_intervals(intervals: Vec<Interval>) -> Self {
        let mut set = Self { intervals };
        set.normalize();
        set
    }

    /// Sort by start and merge overlapping or touching intervals.
    ///
    /// Two intervals merge when `a.end + 1 >= b.start`. Idempotent.
    pub fn normalize(&mut self) {
        self.intervals.sort_unstable();
        let mut merged: Vec<Interval> = Vec::with_capacity(self.intervals.len());
        for next in self.intervals.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end.saturating_add(1) >= next.start => {
                    last.end = last.end.max(next.end);
                }
                _ => merged.push(next),
            }
        }
        self.intervals = merged;
    }

    /// Covered sub-intervals overlapping `range`, clipped to its bounds.
    pub fn intersect(&self, range: Interval) -> Vec<Interval> {
        // Ends are sorted too, since the set is disjoint.
        let first = self.intervals.partition_point(|i| i.end < range.start);
        self.intervals[first..]
            .iter()
            .take_while(|i| i.start <= range.end)
            .filter_map(|i| i.clip(&range))
            .collect()
    }

    /// Sub-ranges of `range` that no interval in the set covers.
    pub fn complement(&self, range: Interval) -> Vec<Interval> {
        let covered = self.intersect(range);
        if covered.is_empty() {
            return vec![range];
        }

        let mut gaps = Vec::new();
        // First second not yet known to be covered; None once we pass i64::MAX.
        let mut cursor = Some(range.start);
        for c in &covered {
            if let Some(from) = cursor {
                if c.start > from {
                    gaps.push(Interval {
                        start: from,
                        end: c.start - 1,
                    });
                }
            }
            cursor = c.end.checked_add(1);
        }
        if let Some(from) = cursor {
            if from <= range.end {
                gaps.push(Interval {
                    start: from,
                    end: range.end,
                });
            }
        }
        gaps
    }

    /// Add intervals in any order, overlapping or duplicated, then renormalize.
    pub fn add<I>(&mut self, ranges: I)
    where
        I: IntoIterator<Item = Interval>,
    {
        self.intervals.extend(ranges);
        self.normalize();
    }

    /// Whether every second of `range` is covered.
    pub fn contains(&self, range: Interval) -> bool {
        let first = self.intervals.partition_point(|i| i.end < range.start);
        self.intervals
            .get(first)
            .is_some_and(|i| i.start <= range.start && i.end >= range.end)
    }

    /// Sum of `end - start + 1` over all intervals.
    pub fn total_covered_length(&self) -> u64 {
        self.intervals
            .iter()
            .fold(0u64, |acc, i| acc.saturating_add(i.len()))
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.as_slice().iter()
    }

    pub fn as_slice(&self) -> &[Interval] {
        &self.intervals
    }
}

impl From<Vec<Interval>> for IntervalSet {
    fn from(intervals: Vec<Interval>) -> Self {
        Self::from_intervals(intervals)
    }
}

impl From<IntervalSet> for Vec<Interval> {
    fn from(set: IntervalSet) -> Self {
        set.intervals
    }
}

impl<'a> IntoIterator for &'a IntervalSet {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.intervals.iter()
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, interval) in self.intervals.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", interval)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn iv(start: i64, end: i64) -> Interval {
        Interval::new(start, end).unwrap()
    }

    fn set(pairs: &[(i64, i64)]) -> IntervalSet {
        IntervalSet::from_intervals(pairs.iter().map(|&(s, e)| iv(s, e)).collect())
    }

    fn pairs(intervals: &[Interval]) -> Vec<(i64, i64)> {
        intervals.iter().map(|&i| i.into()).collect()
    }

    #[test]
    fn test_interval_rejects_inverted_bounds() {
        assert!(matches!(
            Interval::new(20, 10),
            Err(SyncError::InvalidRange(_))
        ));
        assert!(Interval::new(10, 10).is_ok());
    }

    #[test]
    fn test_interval_len_counts_both_endpoints() {
        assert_eq!(iv(10, 10).len(), 1);
        assert_eq!(iv(10, 20).len(), 11);
        assert_eq!(iv(i64::MIN, i64::MAX).len(), u64::MAX);
    }

    #[test]
    fn test_adjacent_intervals_merge() {
        assert_eq!(pairs(set(&[(1, 5), (6, 10)]).as_slice()), vec![(1, 10)]);
    }

    #[test]
    fn test_one_second_gap_is_preserved() {
        assert_eq!(
            pairs(set(&[(1, 5), (7, 10)]).as_slice()),
            vec![(1, 5), (7, 10)]
        );
    }

    #[test]
    fn test_normalize_sorts_and_merges_overlaps() {
        let s = set(&[(30, 40), (1, 10), (5, 12), (35, 50), (13, 13)]);
        assert_eq!(pairs(s.as_slice()), vec![(1, 13), (30, 50)]);
    }

    #[test]
    fn test_normalize_handles_contained_interval() {
        let s = set(&[(1, 100), (10, 20)]);
        assert_eq!(pairs(s.as_slice()), vec![(1, 100)]);
    }

    #[test]
    fn test_normalize_at_i64_max_does_not_overflow() {
        let s = set(&[(i64::MAX - 5, i64::MAX), (i64::MAX - 10, i64::MAX - 6)]);
        assert_eq!(pairs(s.as_slice()), vec![(i64::MAX - 10, i64::MAX)]);
    }

    #[test]
    fn test_complement_of_empty_set_is_whole_range() {
        let s = IntervalSet::default();
        assert_eq!(pairs(&s.complement(iv(10, 20))), vec![(10, 20)]);
    }

    #[test]
    fn test_complement_leading_inner_trailing() {
        let s = set(&[(10, 20), (30, 40)]);
        assert_eq!(
            pairs(&s.complement(iv(0, 50))),
            vec![(0, 9), (21, 29), (41, 50)]
        );
    }

    #[test]
    fn test_complement_fully_covered_is_empty() {
        let s = set(&[(0, 100)]);
        assert!(s.complement(iv(10, 20)).is_empty());
        assert!(s.complement(iv(0, 100)).is_empty());
    }

    #[test]
    fn test_complement_touching_boundaries() {
        let s = set(&[(0, 100)]);
        assert_eq!(pairs(&s.complement(iv(0, 200))), vec![(101, 200)]);
        assert_eq!(pairs(&s.complement(iv(100, 101))), vec![(101, 101)]);
        assert_eq!(pairs(&s.complement(iv(-5, 0))), vec![(-5, -1)]);
    }

    #[test]
    fn test_complement_single_second_hole() {
        let s = set(&[(1, 5), (7, 10)]);
        assert_eq!(pairs(&s.complement(iv(1, 10))), vec![(6, 6)]);
    }

    #[test]
    fn test_complement_range_outside_coverage() {
        let s = set(&[(100, 200)]);
        assert_eq!(pairs(&s.complement(iv(300, 400))), vec![(300, 400)]);
        assert_eq!(pairs(&s.complement(iv(0, 50))), vec![(0, 50)]);
    }

    #[test]
    fn test_complement_covered_to_i64_max() {
        let s = set(&[(0, i64::MAX)]);
        assert!(s.complement(iv(5, i64::MAX)).is_empty());
        assert_eq!(pairs(&s.complement(iv(-3, i64::MAX))), vec![(-3, -1)]);
    }

    #[test]
    fn test_intersect_clips_both_ends() {
        let s = set(&[(0, 10), (20, 30), (40, 50)]);
        assert_eq!(pairs(&s.intersect(iv(5, 45))), vec![(5, 10), (20, 30), (40, 45)]);
        assert!(s.intersect(iv(11, 19)).is_empty());
    }

    #[test]
    fn test_add_out_of_order_duplicates() {
        let mut s = IntervalSet::default();
        s.add([iv(50, 60), iv(0, 10), iv(0, 10), iv(11, 20)]);
        assert_eq!(pairs(s.as_slice()), vec![(0, 20), (50, 60)]);
    }

    #[test]
    fn test_contains() {
        let s = set(&[(0, 10), (20, 30)]);
        assert!(s.contains(iv(0, 10)));
        assert!(s.contains(iv(22, 25)));
        assert!(!s.contains(iv(5, 25)));
        assert!(!s.contains(iv(11, 11)));
    }

    #[test]
    fn test_total_covered_length() {
        assert_eq!(set(&[(1, 5), (7, 10)]).total_covered_length(), 9);
        assert_eq!(IntervalSet::default().total_covered_length(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(set(&[(7, 10), (1, 5)]).to_string(), "[(1, 5), (7, 10)]");
        assert_eq!(IntervalSet::default().to_string(), "[]");
    }

    #[test]
    fn test_serde_normalizes_on_load() {
        let s: IntervalSet = serde_json::from_str("[[6,10],[1,5],[20,30]]").unwrap();
        assert_eq!(pairs(s.as_slice()), vec![(1, 10), (20, 30)]);
        assert_eq!(serde_json::to_string(&s).unwrap(), "[[1,10],[20,30]]");
    }

    #[test]
    fn test_serde_rejects_inverted_pair() {
        assert!(serde_json::from_str::<IntervalSet>("[[10,1]]").is_err());
    }

    fn arb_interval() -> impl Strategy<Value = Interval> {
        (-500i64..500, 0i64..60).prop_map(|(start, len)| iv(start, start + len))
    }

    fn arb_set() -> impl Strategy<Value = Vec<Interval>> {
        proptest::collection::vec(arb_interval(), 0..12)
    }

    proptest! {
        #[test]
        fn normalized_sets_are_sorted_and_separated(raw in arb_set()) {
            let s = IntervalSet::from_intervals(raw);
            for w in s.as_slice().windows(2) {
                prop_assert!(w[0].start() <= w[1].start());
                prop_assert!(w[0].end() + 1 < w[1].start());
            }
        }

        #[test]
        fn normalize_is_idempotent(raw in arb_set()) {
            let once = IntervalSet::from_intervals(raw);
            let mut twice = once.clone();
            twice.normalize();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn complement_and_intersect_partition_the_range(raw in arb_set(), range in arb_interval()) {
            let s = IntervalSet::from_intervals(raw);
            let covered = s.intersect(range);
            let gaps = s.complement(range);

            // Seconds are small here, so walk them one by one.
            for t in range.start()..=range.end() {
                let in_covered = covered.iter().filter(|i| i.start() <= t && t <= i.end()).count();
                let in_gaps = gaps.iter().filter(|i| i.start() <= t && t <= i.end()).count();
                prop_assert_eq!(in_covered + in_gaps, 1, "second {} counted {} + {}", t, in_covered, in_gaps);
            }
            let total: u64 = covered.iter().chain(gaps.iter()).map(|i| i.len()).sum();
            prop_assert_eq!(total, range.len());
        }

        #[test]
        fn adding_twice_equals_adding_once(raw in arb_set(), extra in arb_set()) {
            let mut once = IntervalSet::from_intervals(raw);
            let mut twice = once.clone();
            once.add(extra.clone());
            twice.add(extra.clone());
            twice.add(extra);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn add_is_commutative(raw in arb_set(), a in arb_interval(), b in arb_interval()) {
            let mut ab = IntervalSet::from_intervals(raw);
            let mut ba = ab.clone();
            ab.add([a]);
            ab.add([b]);
            ba.add([b]);
            ba.add([a]);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn added_range_is_contained(raw in arb_set(), a in arb_interval()) {
            let mut s = IntervalSet::from_intervals(raw);
            s.add([a]);
            prop_assert!(s.contains(a));
            prop_assert!(s.complement(a).is_empty());
        }
    }
}
