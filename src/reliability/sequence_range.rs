use std::cmp::{max, min};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use anyhow::bail;


/// An inclusive range `[lower, upper]` of message numbers. Message numbers start at 1, so a valid
///  range never contains 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceRange {
    lower: u64,
    upper: u64,
}

impl SequenceRange {
    /// NB: panics for ranges that can not occur in a sequence - use [SequenceRange::try_new] for
    ///      numbers received from a peer
    pub fn new(lower: u64, upper: u64) -> SequenceRange {
        Self::try_new(lower, upper)
            .expect("this is a bug: application logic should have ensured a valid range")
    }

    pub fn try_new(lower: u64, upper: u64) -> anyhow::Result<SequenceRange> {
        if lower == 0 {
            bail!("message numbers start at 1, range starts at 0");
        }
        if lower > upper {
            bail!("range lower bound {} is above its upper bound {}", lower, upper);
        }
        Ok(SequenceRange { lower, upper })
    }

    pub fn single(number: u64) -> SequenceRange {
        Self::new(number, number)
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    pub fn contains(&self, number: u64) -> bool {
        self.lower <= number && number <= self.upper
    }

    pub fn contains_range(&self, other: &SequenceRange) -> bool {
        self.lower <= other.lower && other.upper <= self.upper
    }

    /// true if the two ranges overlap or touch, i.e. their union is a single range
    fn is_mergeable(&self, other: &SequenceRange) -> bool {
        self.lower <= other.upper.saturating_add(1) && other.lower <= self.upper.saturating_add(1)
    }
}

impl Display for SequenceRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{}]", self.lower, self.upper)
    }
}


/// An ordered set of non-overlapping, non-touching [SequenceRange]s.
///
/// A collection is never modified in place: all operations return a new collection, and a
///  collection that is shared between the receive path and the retry timer is replaced
///  wholesale. Cloning is cheap since the ranges are behind an `Arc`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SequenceRangeCollection {
    ranges: Arc<[SequenceRange]>,
}

impl Default for SequenceRangeCollection {
    fn default() -> Self {
        Self::empty()
    }
}

impl SequenceRangeCollection {
    pub fn empty() -> SequenceRangeCollection {
        SequenceRangeCollection {
            ranges: Arc::from(Vec::new()),
        }
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = SequenceRange>) -> SequenceRangeCollection {
        let mut raw = ranges.into_iter().collect::<Vec<_>>();
        raw.sort();

        let mut normalized: Vec<SequenceRange> = Vec::with_capacity(raw.len());
        for range in raw {
            match normalized.last_mut() {
                Some(last) if last.is_mergeable(&range) => {
                    last.upper = max(last.upper, range.upper);
                }
                _ => normalized.push(range),
            }
        }

        SequenceRangeCollection {
            ranges: Arc::from(normalized),
        }
    }

    pub fn ranges(&self) -> &[SequenceRange] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceRange> {
        self.ranges.iter()
    }

    /// the number of distinct ranges (not of message numbers)
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn lower_bound(&self) -> Option<u64> {
        self.ranges.first().map(|r| r.lower)
    }

    pub fn upper_bound(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.upper)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.ranges.binary_search_by(|r| {
            if r.upper < number {
                std::cmp::Ordering::Less
            }
            else if r.lower > number {
                std::cmp::Ordering::Greater
            }
            else {
                std::cmp::Ordering::Equal
            }
        }).is_ok()
    }

    pub fn contains_range(&self, range: &SequenceRange) -> bool {
        self.ranges.iter().any(|r| r.contains_range(range))
    }

    pub fn merge_number(&self, number: u64) -> SequenceRangeCollection {
        self.merge_range(SequenceRange::single(number))
    }

    pub fn merge_range(&self, range: SequenceRange) -> SequenceRangeCollection {
        if self.contains_range(&range) {
            return self.clone();
        }
        Self::from_ranges(self.ranges.iter().cloned().chain(std::iter::once(range)))
    }

    pub fn merge(&self, other: &SequenceRangeCollection) -> SequenceRangeCollection {
        if other.is_empty() || self.is_superset_of(other) {
            return self.clone();
        }
        Self::from_ranges(self.ranges.iter().chain(other.ranges.iter()).cloned())
    }

    /// true if every number in `other` is contained in `self`
    pub fn is_superset_of(&self, other: &SequenceRangeCollection) -> bool {
        other.ranges.iter().all(|r| self.contains_range(r))
    }

    /// Returns those parts of `range` that are *not* covered by this collection, i.e. the gaps
    ///  a receiver is still waiting for inside `range`.
    pub fn excluded(&self, range: SequenceRange) -> SequenceRangeCollection {
        let mut gaps = Vec::new();
        let mut cursor = range.lower;

        for r in self.ranges.iter() {
            if r.upper < cursor {
                continue;
            }
            if r.lower > range.upper {
                break;
            }
            if r.lower > cursor {
                gaps.push(SequenceRange::new(cursor, min(r.lower - 1, range.upper)));
            }
            match r.upper.checked_add(1) {
                Some(next) => cursor = next,
                None => return SequenceRangeCollection::from_ranges(gaps),
            }
            if cursor > range.upper {
                return SequenceRangeCollection::from_ranges(gaps);
            }
        }

        if cursor <= range.upper {
            gaps.push(SequenceRange::new(cursor, range.upper));
        }
        SequenceRangeCollection::from_ranges(gaps)
    }
}

impl Display for SequenceRangeCollection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", r)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn coll(ranges: &[(u64, u64)]) -> SequenceRangeCollection {
        SequenceRangeCollection::from_ranges(ranges.iter().map(|&(l, u)| SequenceRange::new(l, u)))
    }

    fn raw(c: &SequenceRangeCollection) -> Vec<(u64, u64)> {
        c.iter().map(|r| (r.lower(), r.upper())).collect()
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::inverted(5, 4)]
    fn test_try_new_invalid(#[case] lower: u64, #[case] upper: u64) {
        assert!(SequenceRange::try_new(lower, upper).is_err());
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![(1,3)], vec![(1,3)])]
    #[case::unsorted(vec![(7,9), (1,3)], vec![(1,3), (7,9)])]
    #[case::overlapping(vec![(1,5), (3,9)], vec![(1,9)])]
    #[case::adjacent(vec![(1,3), (4,6)], vec![(1,6)])]
    #[case::nested(vec![(1,10), (3,4)], vec![(1,10)])]
    #[case::gap_of_one(vec![(1,3), (5,6)], vec![(1,3), (5,6)])]
    #[case::chain(vec![(5,5), (1,1), (3,3), (2,2), (4,4)], vec![(1,5)])]
    fn test_from_ranges_normalizes(#[case] input: Vec<(u64, u64)>, #[case] expected: Vec<(u64, u64)>) {
        assert_eq!(raw(&coll(&input)), expected);
    }

    #[rstest]
    #[case::empty(vec![], 1, false)]
    #[case::below(vec![(3,5)], 2, false)]
    #[case::lower(vec![(3,5)], 3, true)]
    #[case::inner(vec![(3,5)], 4, true)]
    #[case::upper(vec![(3,5)], 5, true)]
    #[case::above(vec![(3,5)], 6, false)]
    #[case::in_gap(vec![(1,2), (5,6)], 3, false)]
    #[case::second(vec![(1,2), (5,6)], 6, true)]
    fn test_contains(#[case] ranges: Vec<(u64, u64)>, #[case] number: u64, #[case] expected: bool) {
        assert_eq!(coll(&ranges).contains(number), expected);
    }

    #[rstest]
    #[case::into_empty(vec![], (2,4))]
    #[case::contained(vec![(1,10)], (2,4))]
    #[case::bridging(vec![(1,2), (6,8)], (3,5))]
    #[case::extending(vec![(1,2)], (2,7))]
    fn test_merge_range_contains_all(#[case] ranges: Vec<(u64, u64)>, #[case] merged: (u64, u64)) {
        let result = coll(&ranges).merge_range(SequenceRange::new(merged.0, merged.1));
        for n in merged.0..=merged.1 {
            assert!(result.contains(n));
        }
        for &(l, u) in &ranges {
            assert!(result.contains(l));
            assert!(result.contains(u));
        }
    }

    #[rstest]
    #[case::single(vec![(1,5)], (2,3))]
    #[case::exact(vec![(1,5), (8,9)], (8,9))]
    #[case::whole(vec![(1,5)], (1,5))]
    fn test_merge_idempotent(#[case] ranges: Vec<(u64, u64)>, #[case] merged: (u64, u64)) {
        let original = coll(&ranges);
        let result = original.merge_range(SequenceRange::new(merged.0, merged.1));
        assert_eq!(result, original);
        assert_eq!(result.merge(&original), original);
    }

    #[test]
    fn test_merge_does_not_modify_original() {
        let original = coll(&[(1,2)]);
        let merged = original.merge_number(3);
        assert_eq!(raw(&original), vec![(1,2)]);
        assert_eq!(raw(&merged), vec![(1,3)]);
    }

    #[rstest]
    #[case::both_empty(vec![], vec![], true)]
    #[case::other_empty(vec![(1,3)], vec![], true)]
    #[case::self_empty(vec![], vec![(1,1)], false)]
    #[case::equal(vec![(1,3)], vec![(1,3)], true)]
    #[case::grown(vec![(1,5)], vec![(1,3)], true)]
    #[case::forgot_first(vec![(2,5)], vec![(1,3)], false)]
    #[case::filled_gap(vec![(1,9)], vec![(1,3), (5,9)], true)]
    #[case::lost_part(vec![(1,3), (6,9)], vec![(1,4)], false)]
    fn test_is_superset_of(#[case] a: Vec<(u64, u64)>, #[case] b: Vec<(u64, u64)>, #[case] expected: bool) {
        assert_eq!(coll(&a).is_superset_of(&coll(&b)), expected);
    }

    #[rstest]
    #[case::empty(vec![], (1,5), vec![(1,5)])]
    #[case::all_covered(vec![(1,10)], (2,5), vec![])]
    #[case::one_gap(vec![(1,3), (6,10)], (1,10), vec![(4,5)])]
    #[case::leading(vec![(4,10)], (1,10), vec![(1,3)])]
    #[case::trailing(vec![(1,4)], (1,10), vec![(5,10)])]
    #[case::several(vec![(2,2), (4,4), (6,6)], (1,7), vec![(1,1), (3,3), (5,5), (7,7)])]
    #[case::range_inside_gap(vec![(1,2), (9,10)], (4,6), vec![(4,6)])]
    #[case::clipped(vec![(1,2), (5,20)], (1,8), vec![(3,4)])]
    fn test_excluded(#[case] ranges: Vec<(u64, u64)>, #[case] range: (u64, u64), #[case] expected: Vec<(u64, u64)>) {
        let result = coll(&ranges).excluded(SequenceRange::new(range.0, range.1));
        assert_eq!(raw(&result), expected);
    }

    #[test]
    fn test_excluded_max() {
        let c = coll(&[(1, u64::MAX)]);
        assert!(c.excluded(SequenceRange::new(5, u64::MAX)).is_empty());
    }

    #[test]
    fn test_bounds_display() {
        let c = coll(&[(4,6), (1,2)]);
        assert_eq!(c.lower_bound(), Some(1));
        assert_eq!(c.upper_bound(), Some(6));
        assert_eq!(c.to_string(), "{[1..2],[4..6]}");
        assert_eq!(SequenceRangeCollection::empty().upper_bound(), None);
    }
}
