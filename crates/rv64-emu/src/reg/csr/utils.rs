//! Turns any `RangeBounds<usize>` (`a..b`, `a..=b`, `..`, ...) into a concrete half-open
//! `Range`, resolving the open-ended forms against a register's bit width.
use core::ops::{Bound, Range, RangeBounds};

pub fn normalize_range<T: RangeBounds<usize>>(range: &T, width: usize) -> Range<usize> {
    let start = match range.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s + 1,
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&e) => e + 1,
        Bound::Excluded(&e) => e,
        Bound::Unbounded => width,
    };
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_range_spans_the_full_width() {
        assert_eq!(normalize_range(&(..), 64), 0..64);
    }

    #[test]
    fn inclusive_range_extends_end_by_one() {
        assert_eq!(normalize_range(&(3..=12), 64), 3..13);
    }

    #[test]
    fn exclusive_start_shifts_forward_by_one() {
        let bound = (Bound::Excluded(3usize), Bound::Included(5usize));
        assert_eq!(normalize_range(&bound, 64), 4..6);
    }
}
