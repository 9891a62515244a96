//! `SequenceCRDT`: the per-document replicated sequence. Owns the local
//! replica's nodes and exposes a pure, deterministic apply function.
//!
//! Grounded on the teacher's `Document`, generalized from a hardcoded
//! two-sentinel `Vec<Char>` without tombstones into the full spec.md
//! \S4.1 contract: tombstones persist (never physically removed except by
//! bounded compaction), deletes may arrive before their matching insert
//! and are buffered, and `apply_remote` is total and idempotent.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{self, CoreResult};

use super::char_node::CharNode;
use super::id::{Id, SiteId};
use super::operation::{Applied, Operation};
use super::position::Position;

/// The NodeId variant this implementation produces and expects on
/// restore. Recorded in the persisted form so a future loader never
/// silently misinterprets ids from the other design named in spec.md \S3.
pub const VARIANT: &str = "logoot";

/// `Instant` has no portable epoch, so tombstone ages are persisted as
/// milliseconds since the Unix epoch (mirroring the original's
/// `CRDTNode.timestamp`) and converted back to the monotonic clock
/// `compact()` compares against on restore.
fn instant_to_epoch_ms(instant: Instant) -> u64 {
    let wall_now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let age = instant.elapsed();
    wall_now.saturating_sub(age).as_millis() as u64
}

fn epoch_ms_to_instant(epoch_ms: u64) -> Instant {
    let wall_now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let age = wall_now.saturating_sub(Duration::from_millis(epoch_ms));
    Instant::now().checked_sub(age).unwrap_or_else(Instant::now)
}

#[derive(Debug)]
pub struct SequenceCRDT {
    site: SiteId,
    clock: u64,
    /// Sorted by `Position`. Always starts with a `Position::begin()`
    /// sentinel and ends with a `Position::end()` sentinel, neither ever
    /// mutated or removed.
    nodes: Vec<CharNode>,
    visible_count: usize,
    /// Deletes received before their matching insert, keyed by id.
    pending_deletes: HashSet<Position>,
    /// When each currently-tombstoned node was tombstoned, for the
    /// compaction age check. Persisted (as wall-clock millis, since
    /// `Instant` has no portable epoch) so compaction keeps working on a
    /// document reloaded from storage instead of silently never removing
    /// anything older than the process's own uptime.
    tombstoned_at: HashMap<Position, Instant>,
    last_compaction: Instant,
}

impl SequenceCRDT {
    pub fn new(site: SiteId) -> Self {
        Self {
            site,
            clock: 0,
            nodes: vec![
                CharNode::sentinel(Position::begin()),
                CharNode::sentinel(Position::end()),
            ],
            visible_count: 0,
            pending_deletes: HashSet::new(),
            tombstoned_at: HashMap::new(),
            last_compaction: Instant::now(),
        }
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn visible_len(&self) -> usize {
        self.visible_count
    }

    pub fn text(&self) -> String {
        self.nodes
            .iter()
            .filter(|n| n.visible)
            .map(|n| n.value)
            .collect()
    }

    /// Locates the array index of the `visible_index`-th visible node
    /// (tombstones and sentinels are skipped).
    fn nth_visible_index(&self, visible_index: usize) -> CoreResult<usize> {
        let mut seen = 0usize;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.visible {
                if seen == visible_index {
                    return Ok(i);
                }
                seen += 1;
            }
        }
        error::OutOfBoundsSnafu {
            index: visible_index,
            len: self.visible_count,
        }
        .fail()
    }

    /// Returns the visible (or sentinel) nodes immediately bracketing
    /// `visible_index`: the node at `visible_index - 1` and the node at
    /// `visible_index`, counting only visible nodes, with `Position::begin`
    /// / `Position::end` standing in past either edge.
    fn visible_bounds(&self, visible_index: usize) -> CoreResult<(&CharNode, &CharNode)> {
        if visible_index > self.visible_count {
            return error::OutOfBoundsSnafu {
                index: visible_index,
                len: self.visible_count,
            }
            .fail();
        }
        let mut seen = 0usize;
        let mut prev = &self.nodes[0];
        for node in &self.nodes {
            if node.visible {
                if seen == visible_index {
                    return Ok((prev, node));
                }
                seen += 1;
                prev = node;
            }
        }
        let last = self.nodes.last().expect("end sentinel always present");
        Ok((prev, last))
    }

    fn binary_search(&self, id: &Position) -> Result<usize, usize> {
        self.nodes.binary_search_by(|n| n.id.cmp(id))
    }

    /// Pre: `0 <= visible_index <= visible_len()`.
    pub fn local_insert(&mut self, visible_index: usize, value: char) -> CoreResult<Operation> {
        let (prev, next) = self.visible_bounds(visible_index)?;
        let id = Position::create(&self.site, &prev.id.0, &next.id.0);
        let node = CharNode::new(id.clone(), value, true);

        match self.binary_search(&id) {
            Ok(_) => unreachable!("generated position collided with an existing node"),
            Err(idx) => {
                self.nodes.insert(idx, node.clone());
                self.visible_count += 1;
            }
        }
        self.clock += 1;

        Ok(Operation::Insert {
            node,
            origin: self.site.clone(),
        })
    }

    /// Pre: `0 <= visible_index < visible_len()`.
    pub fn local_delete(&mut self, visible_index: usize) -> CoreResult<Operation> {
        let idx = self.nth_visible_index(visible_index)?;
        self.nodes[idx].visible = false;
        self.visible_count -= 1;
        let id = self.nodes[idx].id.clone();
        self.tombstoned_at.insert(id.clone(), Instant::now());
        self.clock += 1;

        Ok(Operation::Delete {
            id,
            origin: self.site.clone(),
        })
    }

    /// Applies a remote operation. Idempotent: applying the same
    /// operation twice produces the same observable state as applying it
    /// once.
    pub fn apply_remote(&mut self, op: Operation) -> Applied {
        match op {
            Operation::Insert { node, .. } => self.apply_insert(node),
            Operation::Delete { id, .. } => self.apply_delete(id),
        }
    }

    fn apply_insert(&mut self, node: CharNode) -> Applied {
        if error::is_sentinel(&node.id) {
            return Applied::Invalid("insert cannot target a sentinel id".to_string());
        }
        match self.binary_search(&node.id) {
            Ok(_) => Applied::Duplicate,
            Err(idx) => {
                let id = node.id.clone();
                let mut node = node;
                if self.pending_deletes.remove(&id) {
                    node.visible = false;
                    self.tombstoned_at.insert(id, Instant::now());
                } else if node.visible {
                    self.visible_count += 1;
                }
                self.nodes.insert(idx, node);
                Applied::Applied
            }
        }
    }

    fn apply_delete(&mut self, id: Position) -> Applied {
        if error::is_sentinel(&id) {
            return Applied::Invalid("delete cannot target a sentinel id".to_string());
        }
        match self.binary_search(&id) {
            Ok(idx) => {
                if self.nodes[idx].visible {
                    self.nodes[idx].visible = false;
                    self.visible_count -= 1;
                }
                self.tombstoned_at.insert(id, Instant::now());
                Applied::Applied
            }
            Err(_) => {
                self.pending_deletes.insert(id);
                Applied::Deferred
            }
        }
    }

    /// Drops tombstones older than `age`, provided nothing still
    /// references them. Runs at most once per minute per document
    /// (enforced by the caller consulting `last_compaction` via
    /// `due_for_compaction`); never drops a tombstone a pending delete
    /// still refers to.
    pub fn due_for_compaction(&self, now: Instant) -> bool {
        now.duration_since(self.last_compaction) >= Duration::from_secs(60)
    }

    pub fn compact(&mut self, age: Duration, now: Instant) -> usize {
        if !self.due_for_compaction(now) {
            return 0;
        }
        let cutoff = now.checked_sub(age).unwrap_or(now);
        let mut kept = Vec::with_capacity(self.nodes.len());
        let mut removed = 0usize;

        for node in self.nodes.drain(..) {
            let is_sentinel = error::is_sentinel(&node.id);
            let removable = !node.visible
                && !is_sentinel
                && !self.pending_deletes.contains(&node.id)
                && self
                    .tombstoned_at
                    .get(&node.id)
                    .map(|t| *t <= cutoff)
                    .unwrap_or(false);

            if removable {
                self.tombstoned_at.remove(&node.id);
                removed += 1;
            } else {
                kept.push(node);
            }
        }

        self.nodes = kept;
        self.last_compaction = now;
        removed
    }

    /// Approximate serialized size in bytes, used for the
    /// `maxPersistedBytes` gate without forcing callers to keep the bytes
    /// around afterward.
    pub fn state_len_estimate(&self) -> usize {
        serde_json::to_vec(&self.to_persisted()).map(|b| b.len()).unwrap_or(0)
    }

    /// A non-cryptographic content checksum, useful only for debug
    /// logging when diagnosing an unexpected divergence between replicas.
    /// Never part of the convergence contract itself.
    pub fn checksum(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for node in &self.nodes {
            node.id.0.len().hash(&mut hasher);
            node.value.hash(&mut hasher);
            node.visible.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn snapshot(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(&self.to_persisted()).context(error::SerializationSnafu)
    }

    /// The same persisted form as `snapshot`, as a `serde_json::Value`
    /// rather than bytes, for embedding directly in an uncompressed
    /// `initial_state` wire message (spec.md \S4.5).
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_persisted()).unwrap_or(serde_json::Value::Null)
    }

    pub fn restore(bytes: &[u8]) -> CoreResult<Self> {
        let persisted: PersistedCrdt =
            serde_json::from_slice(bytes).context(error::SerializationSnafu)?;
        if persisted.variant != VARIANT {
            return error::VariantMismatchSnafu {
                found: persisted.variant,
            }
            .fail();
        }
        if !persisted.extra.is_empty() {
            warn!(
                fields = ?persisted.extra.keys().collect::<Vec<_>>(),
                "dropping unknown top-level fields from persisted CRDT blob"
            );
        }

        let mut tombstoned_at = HashMap::new();
        for n in &persisted.nodes {
            if let Some(epoch_ms) = n.tombstoned_at_epoch_ms {
                tombstoned_at.insert(Position(n.position.clone()), epoch_ms_to_instant(epoch_ms));
            }
        }

        let mut nodes: Vec<CharNode> = persisted
            .nodes
            .into_iter()
            .map(|n| CharNode::new(Position(n.position), n.value, n.visible))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let visible_count = nodes.iter().filter(|n| n.visible).count();

        let pending_deletes = persisted
            .pending_deletes
            .into_iter()
            .map(Position)
            .collect();

        Ok(Self {
            site: persisted.site_id,
            clock: persisted.clock,
            nodes,
            visible_count,
            pending_deletes,
            tombstoned_at,
            last_compaction: Instant::now(),
        })
    }

    fn to_persisted(&self) -> PersistedCrdt {
        PersistedCrdt {
            variant: VARIANT.to_string(),
            site_id: self.site.clone(),
            clock: self.clock,
            nodes: self
                .nodes
                .iter()
                .map(|n| PersistedNode {
                    position: n.id.0.clone(),
                    value: n.value,
                    visible: n.visible,
                    tombstoned_at_epoch_ms: self
                        .tombstoned_at
                        .get(&n.id)
                        .map(|&t| instant_to_epoch_ms(t)),
                })
                .collect(),
            pending_deletes: self.pending_deletes.iter().map(|p| p.0.clone()).collect(),
            extra: serde_json::Map::new(),
        }
    }
}

use snafu::ResultExt;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCrdt {
    variant: String,
    site_id: SiteId,
    clock: u64,
    nodes: Vec<PersistedNode>,
    #[serde(default)]
    pending_deletes: Vec<Vec<Id>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedNode {
    position: Vec<Id>,
    value: char,
    visible: bool,
    /// Milliseconds since the Unix epoch at which this node was
    /// tombstoned; absent for visible nodes and sentinels. Drives
    /// `compact()`'s cutoff after a restore, per the original's
    /// `CRDTNode.timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tombstoned_at_epoch_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_str(crdt: &mut SequenceCRDT, s: &str) {
        for c in s.chars() {
            crdt.local_insert(crdt.visible_len(), c).unwrap();
        }
    }

    #[test]
    fn local_insert_and_delete_roundtrip_text() {
        let mut crdt = SequenceCRDT::new("a".into());
        type_str(&mut crdt, "hello world");
        assert_eq!(crdt.text(), "hello world");

        crdt.local_delete(5).unwrap();
        assert_eq!(crdt.text(), "helloworld");
    }

    #[test]
    fn out_of_bounds_insert_is_rejected() {
        let mut crdt = SequenceCRDT::new("a".into());
        assert!(crdt.local_insert(1, 'x').is_err());
    }

    #[test]
    fn out_of_bounds_delete_is_rejected() {
        let mut crdt = SequenceCRDT::new("a".into());
        assert!(crdt.local_delete(0).is_err());
    }

    #[test]
    fn delete_before_insert_is_deferred_then_resolved() {
        let mut a = SequenceCRDT::new("a".into());
        let insert = a.local_insert(0, 'x').unwrap();
        let delete = match &insert {
            Operation::Insert { node, .. } => Operation::Delete {
                id: node.id.clone(),
                origin: "a".into(),
            },
            _ => unreachable!(),
        };

        let mut b = SequenceCRDT::new("b".into());
        let outcome = b.apply_remote(delete.clone());
        assert_eq!(outcome, Applied::Deferred);
        assert_eq!(b.text(), "");

        let outcome = b.apply_remote(insert);
        assert_eq!(outcome, Applied::Applied);
        assert_eq!(b.text(), "");
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let mut a = SequenceCRDT::new("a".into());
        let op = a.local_insert(0, 'x').unwrap();

        let mut b = SequenceCRDT::new("b".into());
        assert_eq!(b.apply_remote(op.clone()), Applied::Applied);
        for _ in 0..9 {
            assert_eq!(b.apply_remote(op.clone()), Applied::Duplicate);
        }
        assert_eq!(b.text().len(), 1);
    }

    #[test]
    fn insert_into_sentinel_is_invalid() {
        let mut crdt = SequenceCRDT::new("a".into());
        let bad = Operation::Insert {
            node: CharNode::new(Position::begin(), 'x', true),
            origin: "a".into(),
        };
        assert!(matches!(crdt.apply_remote(bad), Applied::Invalid(_)));
    }

    #[test]
    fn convergence_across_two_replicas_interleaving_inserts() {
        let mut a = SequenceCRDT::new("A".into());
        let mut b = SequenceCRDT::new("B".into());

        let op1 = a.local_insert(0, 'H').unwrap();
        let op2 = a.local_insert(1, 'i').unwrap();
        let op3 = b.local_insert(0, '!').unwrap();

        a.apply_remote(op3.clone());
        b.apply_remote(op1.clone());
        b.apply_remote(op2.clone());

        assert_eq!(a.text(), b.text());
        assert!(a.text() == "!Hi" || a.text() == "Hi!");
    }

    #[test]
    fn snapshot_round_trips() {
        let mut crdt = SequenceCRDT::new("a".into());
        type_str(&mut crdt, "round trip");
        crdt.local_delete(0).unwrap();

        let bytes = crdt.snapshot().unwrap();
        let restored = SequenceCRDT::restore(&bytes).unwrap();
        assert_eq!(restored.text(), crdt.text());

        let bytes2 = restored.snapshot().unwrap();
        let restored2 = SequenceCRDT::restore(&bytes2).unwrap();
        assert_eq!(restored2.text(), crdt.text());
    }

    #[test]
    fn compaction_respects_pending_deletes_and_age() {
        let mut crdt = SequenceCRDT::new("a".into());
        let op = crdt.local_insert(0, 'x').unwrap();
        crdt.local_delete(0).unwrap();

        // Too young: not removed even when forced past the 1/minute gate.
        crdt.last_compaction = Instant::now() - Duration::from_secs(61);
        let removed = crdt.compact(Duration::from_secs(300), Instant::now());
        assert_eq!(removed, 0);

        crdt.last_compaction = Instant::now() - Duration::from_secs(61);
        let removed = crdt.compact(Duration::from_secs(0), Instant::now());
        assert_eq!(removed, 1);
        let _ = op;
    }

    #[test]
    fn tombstone_age_survives_snapshot_restore_and_compacts() {
        let mut crdt = SequenceCRDT::new("a".into());
        type_str(&mut crdt, "xy");
        crdt.local_delete(0).unwrap();

        let bytes = crdt.snapshot().unwrap();
        let mut restored = SequenceCRDT::restore(&bytes).unwrap();

        // Without the persisted timestamp this would stay 0 forever: a
        // fresh `tombstoned_at` entry would never be older than `age`.
        restored.last_compaction = Instant::now() - Duration::from_secs(61);
        let removed = restored.compact(Duration::from_secs(0), Instant::now());
        assert_eq!(removed, 1);
        assert_eq!(restored.text(), "y");
    }
}
