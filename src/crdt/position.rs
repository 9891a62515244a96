//! `NodeId` / `Position`: a totally ordered, dense identifier for a single
//! inserted character occurrence.
//!
//! Generation algorithm grounded on the teacher's `Position::create`: copy
//! the common prefix, pick a random digit strictly between the diverging
//! components when room exists, else recurse one level deeper with a
//! fresh random element. See spec.md \S3 for the three cases.

use std::cmp::{max, min, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::id::{Id, SiteId, PAGE_MAX, PAGE_MIN};

/// A totally ordered, globally unique identifier for a character
/// occurrence. Two distinct nodes that have ever existed in the sequence
/// always compare the same way at every replica.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Position(pub Vec<Id>);

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        let (len1, len2) = (self.0.len(), other.0.len());
        for i in 0..min(len1, len2) {
            let ord = self.0[i].cmp(&other.0[i]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        len1.cmp(&len2)
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Position {
    /// The least possible position. Brackets the sequence; never mutated,
    /// never transmitted as an operation.
    pub fn begin() -> Self {
        Position(vec![Id::new(PAGE_MIN, String::new())])
    }

    /// The greatest possible position.
    pub fn end() -> Self {
        Position(vec![Id::new(PAGE_MAX, String::new())])
    }

    /// Generates a new position strictly between `before` and `after`.
    ///
    /// # Case 1: digits differ by exactly 1
    /// No integer lies strictly between them, so the common prefix is kept
    /// and generation continues one level deeper.
    /// # Case 2: digits differ by more than 1
    /// A fresh digit is chosen strictly between the two and the new
    /// position terminates there.
    /// # Case 3: same digit, different site
    /// The prefix is extended with the lower components and a new trailing
    /// component is appended using the inserting site's own virtual bounds.
    pub fn create(site: &SiteId, before: &[Id], after: &[Id]) -> Self {
        let (virtual_min, virtual_max) = (
            Id::new(PAGE_MIN, site.clone()),
            Id::new(PAGE_MAX, site.clone()),
        );
        let len = max(before.len(), after.len());
        let mut new_pos = Vec::new();
        let mut is_same_site = true;

        for i in 0..len {
            let id1 = before.get(i).unwrap_or(&virtual_min);
            let id2 = after
                .get(i)
                .filter(|_| is_same_site)
                .unwrap_or(&virtual_max);
            let diff = id2.digit - id1.digit;

            if diff > 1 {
                let new_digit = Self::generate_random_digit(id1.digit, id2.digit);
                new_pos.push(Id::new(new_digit, site.clone()));
                return Position(new_pos);
            } else {
                new_pos.push(id1.to_owned());
                is_same_site = id1.cmp(id2) == Ordering::Equal;
            }
        }

        // Exhausted both prefixes at identical digits: recurse one level
        // deeper using a fresh virtual range for this site.
        let new_digit = Self::generate_random_digit(PAGE_MIN, PAGE_MAX);
        new_pos.push(Id::new(new_digit, site.clone()));
        Position(new_pos)
    }

    fn generate_random_digit(lower_bound: u64, upper_bound: u64) -> u64 {
        let mut rng = rand::thread_rng();
        rng.gen_range(lower_bound + 1..upper_bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_position_is_between_bounds() {
        let site = "alice".to_string();
        let before = Position::begin().0;
        let after = Position::end().0;
        let mid = Position::create(&site, &before, &after);

        assert!(Position(before) < mid);
        assert!(mid < Position(after));
    }

    #[test]
    fn repeated_generation_never_collides() {
        let site = "alice".to_string();
        let mut before = Position::begin().0;
        let after = Position::end().0;

        for _ in 0..200 {
            let mid = Position::create(&site, &before, &after);
            assert!(Position(before.clone()) < mid);
            assert!(mid < Position(after.clone()));
            before = mid.0;
        }
    }

    #[test]
    fn tie_break_prefers_smaller_site() {
        let before = vec![Id::new(1, "x".into())];
        let after = vec![Id::new(1, "x".into()), Id::new(5, "x".into())];
        // Identical digit lists up to shared length; site ordering governs
        // only when digit lists are literally equal, which Id::cmp handles.
        let a = Position::create(&"a".to_string(), &before, &after);
        let b = Position::create(&"b".to_string(), &before, &after);
        // Both are generated independently but must stay within bounds;
        // the actual tie-break case is exercised at the Id level (see
        // id.rs::breaks_ties_by_site) since Position defers entirely to
        // Id's Ord impl.
        assert!(Position(before.clone()) < a);
        assert!(Position(before) < b);
    }
}
