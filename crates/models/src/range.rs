//! Ranges and multiranges with explicit bound inclusivity.
//!
//! The indexer reader tracks which datetime windows of on-chain events have
//! already been synced as a set of disjoint ranges, and computes the
//! windows still missing as a multirange difference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DatetimeRange = Range<DateTime<Utc>>;
pub type DatetimeMultiRange = MultiRange<DateTime<Utc>>;

/// An interval with independently inclusive or exclusive bounds. The
/// default constructor builds the right-open `[lower, upper)` shape used
/// for block windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range<T: Copy + Ord> {
    pub lower: T,
    pub upper: T,
    pub lower_inc: bool,
    pub upper_inc: bool,
}

impl<T: Copy + Ord> Range<T> {
    pub fn half_open(lower: T, upper: T) -> Self {
        Range {
            lower,
            upper,
            lower_inc: true,
            upper_inc: false,
        }
    }

    pub fn closed(lower: T, upper: T) -> Self {
        Range {
            lower,
            upper,
            lower_inc: true,
            upper_inc: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lower > self.upper || (self.lower == self.upper && !(self.lower_inc && self.upper_inc))
    }

    /// Sort key of the lower bound: an inclusive bound starts before an
    /// exclusive bound anchored at the same point.
    fn start_key(&self) -> (T, bool) {
        (self.lower, !self.lower_inc)
    }

    fn ends_before_start_of(&self, other: &Self) -> bool {
        self.upper < other.lower
            || (self.upper == other.lower && !self.upper_inc && !other.lower_inc)
    }

    /// True when the union of two ranges is itself a range.
    fn touches(&self, other: &Self) -> bool {
        let (a, b) = if self.start_key() <= other.start_key() {
            (self, other)
        } else {
            (other, self)
        };
        b.lower < a.upper || (b.lower == a.upper && (b.lower_inc || a.upper_inc))
    }

    fn merge(&self, other: &Self) -> Self {
        let (lower, lower_inc) = {
            let a = self.start_key();
            let b = other.start_key();
            if a <= b {
                (self.lower, self.lower_inc)
            } else {
                (other.lower, other.lower_inc)
            }
        };
        let (upper, upper_inc) = {
            let a = (self.upper, self.upper_inc);
            let b = (other.upper, other.upper_inc);
            if a >= b {
                a
            } else {
                b
            }
        };
        Range {
            lower,
            upper,
            lower_inc,
            upper_inc,
        }
    }

    /// Subtracts `other`, returning the 0, 1 or 2 remaining pieces.
    fn subtract(&self, other: &Self) -> Vec<Self> {
        if other.is_empty() || !self.touches(other) {
            return vec![*self];
        }

        let mut pieces = Vec::new();

        let left = Range {
            lower: self.lower,
            upper: other.lower,
            lower_inc: self.lower_inc,
            upper_inc: !other.lower_inc,
        };
        if !left.is_empty() && left.upper >= self.lower {
            pieces.push(left);
        }

        let right = Range {
            lower: other.upper,
            upper: self.upper,
            lower_inc: !other.upper_inc,
            upper_inc: self.upper_inc,
        };
        if !right.is_empty() && right.lower <= self.upper {
            pieces.push(right);
        }

        pieces.retain(|piece| !piece.is_empty());
        pieces
    }
}

/// An ordered set of disjoint, non-adjacent ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MultiRange<T: Copy + Ord> {
    ranges: Vec<Range<T>>,
}

impl<T: Copy + Ord> MultiRange<T> {
    pub fn new() -> Self {
        MultiRange { ranges: Vec::new() }
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<T>>) -> Self {
        let mut multirange = Self::new();
        for range in ranges {
            multirange.add(range);
        }
        multirange
    }

    pub fn ranges(&self) -> &[Range<T>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Adds a range, merging it with every range it touches.
    pub fn add(&mut self, range: Range<T>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.touches(&merged) {
                merged = merged.merge(&existing);
            } else {
                result.push(existing);
            }
        }
        result.push(merged);
        result.sort_by(|a, b| a.start_key().cmp(&b.start_key()));
        self.ranges = result;
    }

    /// Set difference: the parts of `self` not covered by `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut result = Vec::new();
        for range in &self.ranges {
            let mut pieces = vec![*range];
            for subtrahend in &other.ranges {
                // Ranges are sorted; stop once the subtrahend starts after
                // every remaining piece ends.
                if pieces.is_empty() {
                    break;
                }
                pieces = pieces
                    .into_iter()
                    .flat_map(|piece| {
                        if piece.ends_before_start_of(subtrahend) {
                            vec![piece]
                        } else {
                            piece.subtract(subtrahend)
                        }
                    })
                    .collect();
            }
            result.extend(pieces);
        }
        MultiRange { ranges: result }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn range(lower: i64, upper: i64) -> Range<i64> {
        Range::half_open(lower, upper)
    }

    #[test]
    fn add_merges_overlapping_ranges() {
        let mut multirange = MultiRange::new();
        multirange.add(range(0, 10));
        multirange.add(range(5, 20));
        assert_eq!(multirange.ranges(), &[range(0, 20)]);
    }

    #[test]
    fn add_merges_adjacent_half_open_ranges() {
        let mut multirange = MultiRange::new();
        multirange.add(range(0, 10));
        multirange.add(range(10, 20));
        assert_eq!(multirange.ranges(), &[range(0, 20)]);
    }

    #[test]
    fn add_keeps_disjoint_ranges_sorted() {
        let mut multirange = MultiRange::new();
        multirange.add(range(20, 30));
        multirange.add(range(0, 10));
        assert_eq!(multirange.ranges(), &[range(0, 10), range(20, 30)]);
    }

    #[test]
    fn exclusive_bounds_do_not_touch() {
        let a = Range {
            lower: 0,
            upper: 10,
            lower_inc: true,
            upper_inc: false,
        };
        let b = Range {
            lower: 10,
            upper: 20,
            lower_inc: false,
            upper_inc: true,
        };
        let mut multirange = MultiRange::new();
        multirange.add(a);
        multirange.add(b);
        assert_eq!(multirange.ranges().len(), 2);
    }

    #[test]
    fn difference_splits_ranges() {
        let full = MultiRange::from_ranges([range(0, 100)]);
        let synced = MultiRange::from_ranges([range(10, 20), range(50, 60)]);
        let missing = full.difference(&synced);
        assert_eq!(
            missing.ranges(),
            &[
                range(0, 10),
                Range {
                    lower: 20,
                    upper: 50,
                    lower_inc: true,
                    upper_inc: false
                },
                Range {
                    lower: 60,
                    upper: 100,
                    lower_inc: true,
                    upper_inc: false
                },
            ]
        );
    }

    #[test]
    fn difference_with_closed_subtrahend_leaves_open_edges() {
        let full = MultiRange::from_ranges([Range::closed(0, 10)]);
        let synced = MultiRange::from_ranges([Range::closed(3, 5)]);
        let missing = full.difference(&synced);
        assert_eq!(
            missing.ranges(),
            &[
                Range {
                    lower: 0,
                    upper: 3,
                    lower_inc: true,
                    upper_inc: false
                },
                Range {
                    lower: 5,
                    upper: 10,
                    lower_inc: false,
                    upper_inc: true
                },
            ]
        );
    }

    #[test]
    fn empty_difference_returns_self() {
        let full = MultiRange::from_ranges([range(0, 10)]);
        let missing = full.difference(&MultiRange::new());
        assert_eq!(missing, full);
    }

    #[test]
    fn fully_covered_difference_is_empty() {
        let full = MultiRange::from_ranges([range(2, 8)]);
        let synced = MultiRange::from_ranges([range(0, 10)]);
        assert!(full.difference(&synced).is_empty());
    }
}
