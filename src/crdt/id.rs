//! Dense Logoot-style position identifiers.
//!
//! Grounded on the teacher's `id.rs`/`position.rs`: an ordered list of
//! `Id { digit, site }` pairs, lexicographically ordered, with ties broken
//! by site tag. This is the "dense Logoot-style position" design named in
//! spec.md \S3 (design 1 of 2); the persisted blob records which variant
//! produced it so a future loader never misinterprets ids from the other
//! design.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A replica identity. Assigned by the coordinator at connection time as
/// `{userId-or-"guest"}-{8 random hex}` and never reused.
pub type SiteId = String;

/// The smallest possible digit a generated id may occupy. Real ids are
/// always generated strictly greater than this bound.
pub const PAGE_MIN: u64 = u64::MIN;

/// The largest possible digit a generated id may occupy. Real ids are
/// always generated strictly less than this bound.
pub const PAGE_MAX: u64 = u64::MAX;

/// One component of a dense position. Order is by `digit`, then by `site`
/// to break ties deterministically: the lexicographically smaller site
/// wins the earlier position.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Id {
    pub digit: u64,
    pub site: SiteId,
}

impl Id {
    pub fn new(digit: u64, site: SiteId) -> Self {
        Id { digit, site }
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        self.digit.cmp(&other.digit).then_with(|| self.site.cmp(&other.site))
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_digit_first() {
        let a = Id::new(1, "b".into());
        let b = Id::new(2, "a".into());
        assert!(a < b);
    }

    #[test]
    fn breaks_ties_by_site() {
        let a = Id::new(5, "alice".into());
        let b = Id::new(5, "bob".into());
        assert!(a < b);
    }
}
