//! Compact interval representation of a set of machine IDs (SPEC_FULL.md §3).
//!
//! Grounded on `original_source/src/machines.hpp` / the hyphenated range strings
//! used throughout `protocol.cpp` (`RESOURCE_STATE_CHANGED{resources}`, the legacy
//! `"p:<range>=<pstate>"` tag). Stored as a sorted list of disjoint, non-adjacent
//! `(first, last)` intervals so set operations and both textual forms are cheap.

use std::fmt;

pub type MachineId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineRange {
    intervals: Vec<(MachineId, MachineId)>,
}

impl MachineRange {
    pub fn empty() -> Self {
        MachineRange { intervals: Vec::new() }
    }

    pub fn single(id: MachineId) -> Self {
        MachineRange { intervals: vec![(id, id)] }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = MachineId>) -> Self {
        let mut sorted: Vec<MachineId> = ids.into_iter().collect();
        sorted.sort_unstable();
        sorted.dedup();
        let mut intervals = Vec::new();
        for id in sorted {
            match intervals.last_mut() {
                Some((_, last)) if *last + 1 == id => *last = id,
                _ => intervals.push((id, id)),
            }
        }
        MachineRange { intervals }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn cardinality(&self) -> usize {
        self.intervals.iter().map(|(a, b)| (b - a + 1) as usize).sum()
    }

    pub fn contains(&self, id: MachineId) -> bool {
        self.intervals.iter().any(|(a, b)| *a <= id && id <= *b)
    }

    pub fn first(&self) -> Option<MachineId> {
        self.intervals.first().map(|(a, _)| *a)
    }

    pub fn last(&self) -> Option<MachineId> {
        self.intervals.last().map(|(_, b)| *b)
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.intervals.iter().flat_map(|(a, b)| *a..=*b)
    }

    pub fn union(&self, other: &MachineRange) -> MachineRange {
        MachineRange::from_ids(self.iter().chain(other.iter()))
    }

    pub fn intersection(&self, other: &MachineRange) -> MachineRange {
        MachineRange::from_ids(self.iter().filter(|id| other.contains(*id)))
    }

    pub fn difference(&self, other: &MachineRange) -> MachineRange {
        MachineRange::from_ids(self.iter().filter(|id| !other.contains(*id)))
    }

    /// Space-separated integers, e.g. `"1 2 5 6 7"`.
    pub fn to_string_space(&self) -> String {
        self.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" ")
    }

    /// Hyphenated intervals, e.g. `"1-2 5-7"`; a singleton interval is written as
    /// a bare number.
    pub fn to_string_hyphen(&self) -> String {
        self.intervals
            .iter()
            .map(|(a, b)| if a == b { a.to_string() } else { format!("{a}-{b}") })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parses either textual form (detected by presence of `-` per token).
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(MachineRange::empty());
        }
        let mut ids = Vec::new();
        for token in s.split_whitespace() {
            match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo: MachineId =
                        lo.parse().map_err(|_| format!("invalid range start in '{token}'"))?;
                    let hi: MachineId =
                        hi.parse().map_err(|_| format!("invalid range end in '{token}'"))?;
                    if lo > hi {
                        return Err(format!("invalid range '{token}': start after end"));
                    }
                    ids.extend(lo..=hi);
                }
                None => {
                    let id: MachineId =
                        token.parse().map_err(|_| format!("invalid machine id '{token}'"))?;
                    ids.push(id);
                }
            }
        }
        Ok(MachineRange::from_ids(ids))
    }
}

impl fmt::Display for MachineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_hyphen())
    }
}

impl FromIterator<MachineId> for MachineRange {
    fn from_iter<T: IntoIterator<Item = MachineId>>(iter: T) -> Self {
        MachineRange::from_ids(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn from_ids_merges_adjacent_into_intervals() {
        let r = MachineRange::from_ids([1, 2, 5, 6, 7]);
        assert_eq!(r.to_string_hyphen(), "1-2 5-7");
        assert_eq!(r.to_string_space(), "1 2 5 6 7");
        assert_eq!(r.cardinality(), 5);
    }

    #[test]
    fn hyphen_round_trip_is_identity() {
        for ids in [vec![0], vec![0, 1, 2], vec![3, 7, 8, 9, 20]] {
            let r = MachineRange::from_ids(ids);
            let parsed = MachineRange::parse(&r.to_string_hyphen()).unwrap();
            assert_eq!(parsed, r);
        }
    }

    #[test]
    fn space_form_also_round_trips() {
        let r = MachineRange::from_ids([1, 2, 5, 6, 7]);
        assert_eq!(MachineRange::parse(&r.to_string_space()).unwrap(), r);
    }

    #[test]
    fn set_operations() {
        let a = MachineRange::from_ids([0, 1, 2, 3]);
        let b = MachineRange::from_ids([2, 3, 4, 5]);
        assert_eq!(a.union(&b), MachineRange::from_ids([0, 1, 2, 3, 4, 5]));
        assert_eq!(a.intersection(&b), MachineRange::from_ids([2, 3]));
        assert_eq!(a.difference(&b), MachineRange::from_ids([0, 1]));
    }

    #[test]
    fn empty_range_round_trips() {
        let r = MachineRange::empty();
        assert_eq!(MachineRange::parse(&r.to_string_hyphen()).unwrap(), r);
        assert!(r.is_empty());
    }

    proptest! {
        #[test]
        fn hyphen_round_trip_arbitrary(mut ids in prop::collection::vec(0u32..200, 0..30)) {
            ids.sort_unstable();
            ids.dedup();
            let r = MachineRange::from_ids(ids);
            let parsed = MachineRange::parse(&r.to_string_hyphen()).unwrap();
            prop_assert_eq!(parsed, r);
        }
    }
}
