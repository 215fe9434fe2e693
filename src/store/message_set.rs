//-
// Copyright (c) 2024, The Ironpost Developers
//
// This file is part of Ironpost.
//
// Ironpost is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either  version 3 of the License, or  (at your option)
// any later version.
//
// Ironpost is distributed in  the hope that it will be  useful, but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A  PARTICULAR PURPOSE. See the GNU  General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Ironpost. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::ops::Bound::{Excluded, Included, Unbounded};

/// A set of message UIDs (or sequence numbers).
///
/// Internally, this is maintained as a minimal sorted set of inclusive
/// ranges: adjacent and overlapping ranges are always fused, so the
/// representation of a given set is canonical.
///
/// The `Display` format puts this into minimal IMAP sequence-set wire
/// format. Note that IMAP has no way to represent an empty sequence set;
/// `Display` produces an empty string in that case, which is invalid.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct MessageSet {
    parts: std::collections::BTreeMap<u32, u32>,
}

impl MessageSet {
    pub fn new() -> Self {
        MessageSet::default()
    }

    /// A set containing just `item`.
    pub fn just(item: u32) -> Self {
        let mut this = Self::new();
        this.add(item);
        this
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// The number of UIDs in the set.
    pub fn count(&self) -> u32 {
        self.parts.iter().map(|(start, end)| end - start + 1).sum()
    }

    pub fn smallest(&self) -> Option<u32> {
        self.parts.keys().next().copied()
    }

    pub fn largest(&self) -> Option<u32> {
        self.parts.values().next_back().copied()
    }

    pub fn add(&mut self, item: u32) {
        self.insert_raw(item, item);
    }

    /// Insert the inclusive range `start..=end`.
    pub fn add_range(&mut self, start: u32, end: u32) {
        assert!(start <= end && start > 0);
        self.insert_raw(start, end);
    }

    pub fn add_set(&mut self, other: &MessageSet) {
        for (&start, &end) in &other.parts {
            self.insert_raw(start, end);
        }
    }

    fn insert_raw(&mut self, start_incl: u32, mut end_incl: u32) {
        // If this range overlaps or abuts any later ranges, fuse them.
        loop {
            let following = self
                .parts
                .range((Excluded(start_incl), Unbounded))
                .next()
                .map(|(&start, &end)| (start, end));

            if let Some((following_start, following_end)) = following {
                if following_start - 1 <= end_incl {
                    end_incl = end_incl.max(following_end);
                    self.parts.remove(&following_start);
                    continue;
                }
            }

            break;
        }

        let preceding = self
            .parts
            .range((Unbounded, Included(end_incl)))
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((preceding_start, preceding_end)) = preceding {
            if preceding_end >= start_incl.saturating_sub(1) {
                if start_incl < preceding_start {
                    self.parts.remove(&preceding_start);
                    self.parts.insert(start_incl, end_incl.max(preceding_end));
                } else {
                    self.parts
                        .insert(preceding_start, end_incl.max(preceding_end));
                }
                return;
            }
        }

        self.parts.insert(start_incl, end_incl);
    }

    pub fn remove(&mut self, item: u32) {
        self.remove_range(item, item);
    }

    pub fn remove_set(&mut self, other: &MessageSet) {
        for (&start, &end) in &other.parts {
            self.remove_range(start, end);
        }
    }

    fn remove_range(&mut self, lo: u32, hi: u32) {
        let affected = self
            .parts
            .range(..=hi)
            .filter(|&(_, &end)| end >= lo)
            .map(|(&start, &end)| (start, end))
            .collect::<Vec<_>>();

        for (start, end) in affected {
            self.parts.remove(&start);
            if start < lo {
                self.parts.insert(start, lo - 1);
            }
            if end > hi {
                self.parts.insert(hi + 1, end);
            }
        }
    }

    pub fn contains(&self, item: u32) -> bool {
        self.parts
            .range(..=item)
            .next_back()
            .filter(|&(_, &end)| end >= item)
            .is_some()
    }

    /// The n-th smallest UID in the set, 1-based; 0 if out of range.
    pub fn value(&self, mut n: u32) -> u32 {
        if 0 == n {
            return 0;
        }

        for (&start, &end) in &self.parts {
            let len = end - start + 1;
            if n <= len {
                return start + n - 1;
            }
            n -= len;
        }

        0
    }

    /// The 1-based position of `item` in the set, or 0 if absent.
    pub fn index(&self, item: u32) -> u32 {
        let mut preceding = 0u32;
        for (&start, &end) in &self.parts {
            if item < start {
                return 0;
            }
            if item <= end {
                return preceding + item - start + 1;
            }
            preceding += end - start + 1;
        }

        0
    }

    pub fn union(&self, other: &MessageSet) -> MessageSet {
        let mut this = self.clone();
        this.add_set(other);
        this
    }

    pub fn intersection(&self, other: &MessageSet) -> MessageSet {
        let mut out = MessageSet::new();
        let mut a = self.parts.iter();
        let mut b = other.parts.iter();
        let mut ra = a.next();
        let mut rb = b.next();
        while let (Some((&a_start, &a_end)), Some((&b_start, &b_end))) =
            (ra, rb)
        {
            let lo = a_start.max(b_start);
            let hi = a_end.min(b_end);
            if lo <= hi {
                out.push_ascending(lo, hi);
            }
            if a_end <= b_end {
                ra = a.next();
            } else {
                rb = b.next();
            }
        }

        out
    }

    pub fn difference(&self, other: &MessageSet) -> MessageSet {
        let mut this = self.clone();
        this.remove_set(other);
        this
    }

    /// Append a range known to come after everything already present,
    /// fusing with the last range where adjacent.
    fn push_ascending(&mut self, lo: u32, hi: u32) {
        let last = self
            .parts
            .iter()
            .next_back()
            .map(|(&start, &end)| (start, end));
        if let Some((start, end)) = last {
            debug_assert!(end < lo);
            if end + 1 == lo {
                self.parts.insert(start, hi);
                return;
            }
        }
        self.parts.insert(lo, hi);
    }

    /// Iterate the UIDs in ascending order.
    pub fn items(&self) -> impl Iterator<Item = u32> + '_ {
        self.parts
            .iter()
            .flat_map(|(&start, &end)| start..=end)
    }

    /// Parse the IMAP sequence-set syntax.
    ///
    /// `splat` is used as the value of elements which specify `*`.
    pub fn parse(raw: &str, splat: u32) -> Option<Self> {
        fn atom(r: &str, splat: u32) -> Option<u32> {
            if "*" == r {
                Some(splat)
            } else {
                r.parse().ok().filter(|&v| v > 0)
            }
        }

        let mut this = Self::new();
        for part in raw.split(',') {
            let mut subs = part.split(':');
            match (subs.next(), subs.next(), subs.next()) {
                (Some(only), None, None) => {
                    let only = atom(only, splat)?;
                    this.insert_raw(only, only);
                },
                (Some(start), Some(end), None) => {
                    let start = atom(start, splat)?;
                    let end = atom(end, splat)?;
                    // RFC 3501 allows the endpoints in either order.
                    this.insert_raw(start.min(end), start.max(end));
                },
                _ => return None,
            }
        }

        Some(this)
    }

    /// Render the set as the minimal IMAP sequence-set string.
    pub fn set(&self) -> String {
        self.to_string()
    }

    /// Render a SQL predicate fragment selecting the `uid` column values in
    /// this set, e.g. `` (`uid` BETWEEN 1 AND 9 OR `uid` = 11) ``.
    ///
    /// An empty set renders a predicate that matches nothing.
    pub fn where_sql(&self) -> String {
        if self.parts.is_empty() {
            return "(1 = 0)".to_owned();
        }

        let mut out = String::with_capacity(self.parts.len() * 24);
        out.push('(');
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            if ix > 0 {
                out.push_str(" OR ");
            }
            if start == end {
                out.push_str(&format!("`uid` = {}", start));
            } else {
                out.push_str(&format!(
                    "`uid` BETWEEN {} AND {}",
                    start, end
                ));
            }
        }
        out.push(')');
        out
    }
}

impl fmt::Display for MessageSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if start == end {
                write!(f, "{}{}", delim, start)?;
            } else {
                write!(f, "{}{}:{}", delim, start, end)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for MessageSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl std::iter::FromIterator<u32> for MessageSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut this = Self::new();
        for item in iter {
            this.add(item);
        }
        this
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn assert_set(
        expected_content: &[u32],
        expected_string: &str,
        set: MessageSet,
    ) {
        let actual: Vec<u32> = set.items().collect();
        assert_eq!(expected_content, &actual[..]);
        assert_eq!(expected_string, &set.to_string());
    }

    #[test]
    fn parsing() {
        assert_set(&[1], "1", MessageSet::parse("1", 10).unwrap());
        assert_set(&[10], "10", MessageSet::parse("*", 10).unwrap());
        assert_set(&[1, 2], "1:2", MessageSet::parse("1:2", 10).unwrap());
        assert_set(&[1, 2], "1:2", MessageSet::parse("2:1", 10).unwrap());
        assert_set(&[9, 10], "9:10", MessageSet::parse("9:*", 10).unwrap());
        assert_set(&[9, 10], "9:10", MessageSet::parse("*:9", 10).unwrap());
        assert_set(
            &[1, 3, 5],
            "1,3,5",
            MessageSet::parse("3,1,5", 10).unwrap(),
        );
        assert_set(
            &[1, 2, 3, 4],
            "1:4",
            MessageSet::parse("1:2,3,4", 10).unwrap(),
        );
        assert_set(
            &[1, 2, 3, 4],
            "1:4",
            MessageSet::parse("1:4,2:3", 10).unwrap(),
        );
        assert!(MessageSet::parse("", 10).is_none());
        assert!(MessageSet::parse("0", 10).is_none());
        assert!(MessageSet::parse("1:2:3", 10).is_none());
        assert!(MessageSet::parse("x", 10).is_none());
    }

    #[test]
    fn removal_splits_ranges() {
        let mut set = MessageSet::parse("1:9,11", u32::MAX).unwrap();
        set.remove(5);
        assert_set(&[1, 2, 3, 4, 6, 7, 8, 9, 11], "1:4,6:9,11", set.clone());
        set.remove(1);
        assert_set(&[2, 3, 4, 6, 7, 8, 9, 11], "2:4,6:9,11", set.clone());
        set.remove(11);
        assert_set(&[2, 3, 4, 6, 7, 8, 9], "2:4,6:9", set.clone());
        set.remove(100);
        assert_set(&[2, 3, 4, 6, 7, 8, 9], "2:4,6:9", set);
    }

    #[test]
    fn value_and_index() {
        let set = MessageSet::parse("2:4,7,9:10", u32::MAX).unwrap();
        assert_eq!(0, set.value(0));
        assert_eq!(2, set.value(1));
        assert_eq!(4, set.value(3));
        assert_eq!(7, set.value(4));
        assert_eq!(10, set.value(6));
        assert_eq!(0, set.value(7));

        assert_eq!(0, set.index(1));
        assert_eq!(1, set.index(2));
        assert_eq!(3, set.index(4));
        assert_eq!(4, set.index(7));
        assert_eq!(0, set.index(8));
        assert_eq!(6, set.index(10));

        for n in 1..=set.count() {
            assert_eq!(n, set.index(set.value(n)));
        }
    }

    #[test]
    fn set_algebra_basics() {
        let a = MessageSet::parse("1:5,9", u32::MAX).unwrap();
        let b = MessageSet::parse("4:7", u32::MAX).unwrap();
        assert_set(&[1, 2, 3, 4, 5, 6, 7, 9], "1:7,9", a.union(&b));
        assert_set(&[4, 5], "4:5", a.intersection(&b));
        assert_set(&[1, 2, 3, 9], "1:3,9", a.difference(&b));
        assert_set(&[6, 7], "6:7", b.difference(&a));
    }

    #[test]
    fn where_sql_rendering() {
        let set = MessageSet::parse("1:9,11", u32::MAX).unwrap();
        assert_eq!("(`uid` BETWEEN 1 AND 9 OR `uid` = 11)", set.where_sql());
        assert_eq!("(1 = 0)", MessageSet::new().where_sql());
    }

    fn arb_set() -> impl Strategy<Value = MessageSet> {
        prop::collection::vec((1u32..60, 0u32..8), 0..6).prop_map(|ranges| {
            let mut set = MessageSet::new();
            for (start, extent) in ranges {
                set.add_range(start, start + extent);
            }
            set
        })
    }

    proptest! {
        #[test]
        fn algebra_properties(a in arb_set(), b in arb_set()) {
            // (A ∪ B) \ B = A \ B
            prop_assert_eq!(
                a.union(&b).difference(&b),
                a.difference(&b)
            );
            // |A ∪ B| = |A| + |B| − |A ∩ B|
            prop_assert_eq!(
                a.union(&b).count(),
                a.count() + b.count() - a.intersection(&b).count()
            );
        }

        #[test]
        fn render_parse_round_trip(a in arb_set()) {
            prop_assume!(!a.is_empty());
            prop_assert_eq!(
                a.clone(),
                MessageSet::parse(&a.set(), u32::MAX).unwrap()
            );
        }

        #[test]
        fn contains_agrees_with_items(a in arb_set()) {
            for uid in 1..80 {
                prop_assert_eq!(
                    a.items().any(|v| v == uid),
                    a.contains(uid)
                );
            }
        }
    }
}
