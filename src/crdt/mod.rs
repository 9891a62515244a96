//! The conflict-free replicated sequence at the heart of the editor.

pub mod char_node;
pub mod id;
pub mod operation;
pub mod position;
pub mod sequence;

pub use char_node::CharNode;
pub use id::{Id, SiteId};
pub use operation::{Applied, Operation};
pub use position::Position;
pub use sequence::SequenceCRDT;

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn apply_ops(site: &str, ops: &[Operation]) -> SequenceCRDT {
        let mut crdt = SequenceCRDT::new(site.to_string());
        for op in ops {
            crdt.apply_remote(op.clone());
        }
        crdt
    }

    /// Generates a random edit script against a single source-of-truth
    /// replica and records the `Operation`s it produced, so the same
    /// script can be replayed in any order against fresh replicas.
    fn gen_ops(script: Vec<(bool, usize, char)>) -> Vec<Operation> {
        let mut source = SequenceCRDT::new("source".to_string());
        let mut ops = Vec::new();
        for (is_insert, raw_index, ch) in script {
            let len = source.visible_len();
            if is_insert || len == 0 {
                let index = if len == 0 { 0 } else { raw_index % (len + 1) };
                ops.push(source.local_insert(index, ch).unwrap());
            } else {
                let index = raw_index % len;
                ops.push(source.local_delete(index).unwrap());
            }
        }
        ops
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn convergence_under_any_permutation(
            script in proptest::collection::vec((any::<bool>(), 0usize..50, 'a'..='z'), 1..40),
            seed in 0u64..1000,
        ) {
            let ops = gen_ops(script);
            let mut perm_a = ops.clone();
            let mut perm_b = ops.clone();
            shuffle(&mut perm_a, seed);
            shuffle(&mut perm_b, seed.wrapping_add(1));

            let replica_a = apply_ops("r1", &perm_a);
            let replica_b = apply_ops("r2", &perm_b);
            prop_assert_eq!(replica_a.text(), replica_b.text());
        }

        #[test]
        fn idempotent_replay(
            script in proptest::collection::vec((any::<bool>(), 0usize..50, 'a'..='z'), 1..20),
        ) {
            let ops = gen_ops(script);
            let once = apply_ops("r", &ops);

            let mut twice_ops = ops.clone();
            twice_ops.extend(ops.clone());
            let twice = apply_ops("r", &twice_ops);

            prop_assert_eq!(once.text(), twice.text());
        }
    }

    /// Deterministic Fisher-Yates shuffle seeded by a plain integer so
    /// proptest shrinking stays reproducible without pulling in a second
    /// RNG dependency.
    fn shuffle<T>(items: &mut [T], seed: u64) {
        let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for i in (1..items.len()).rev() {
            let j = (next() as usize) % (i + 1);
            items.swap(i, j);
        }
    }
}
