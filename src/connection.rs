//! `Connection`: a subscriber attached to exactly one `DocumentRoom`.
//!
//! Grounded on the teacher's `Peer` (an identity plus a handle the room
//! actor can push outbound frames through) but decoupled from the
//! transport: sends go through a bounded `flume` channel (already in the
//! teacher's dependency list) rather than a raw socket, so the room actor
//! never blocks on a slow consumer — per spec.md \S5, a full outbound
//! queue means the connection is dropped, not that the room stalls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::auth::Identity;
use crate::codec::ServerMessage;
use crate::crdt::SiteId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique handle for one subscriber. Distinct from `SiteId`,
/// which is the CRDT-facing replica identity; `ConnectionId` exists only
/// so rooms can key their subscriber set and coordinators can key their
/// connection count without requiring the transport type to be hashable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The outbound queue capacity per connection. Sized generously enough
/// to absorb a burst of broadcast traffic without false-positive drops;
/// exceeding it means the consumer genuinely cannot keep up.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub document_id: String,
    pub identity: Identity,
    pub site_id: SiteId,
    pub joined_at: Instant,
    sender: flume::Sender<ServerMessage>,
}

impl Connection {
    pub fn new(document_id: String, identity: Identity, site_id: SiteId) -> (Self, flume::Receiver<ServerMessage>) {
        let (sender, receiver) = flume::bounded(OUTBOUND_QUEUE_CAPACITY);
        let conn = Self {
            id: ConnectionId::next(),
            document_id,
            identity,
            site_id,
            joined_at: Instant::now(),
            sender,
        };
        (conn, receiver)
    }

    /// Attempts to enqueue a message for delivery. Returns `false` when
    /// the outbound queue is full, signalling that the caller should
    /// treat this connection as dead and disconnect it rather than block
    /// the room actor.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        self.sender.try_send(message).is_ok()
    }

    pub fn username(&self) -> &str {
        self.identity.display_name()
    }
}

/// Generates the server-assigned site id: `{userId-or-"guest"}-{8 random
/// hex}`. Never reused, matching spec.md \S3.
pub fn generate_site_id(identity: &Identity) -> SiteId {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect();
    let prefix = identity.user_id().unwrap_or("guest");
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_ids_are_unique() {
        let identity = Identity::Guest;
        let a = generate_site_id(&identity);
        let b = generate_site_id(&identity);
        assert_ne!(a, b);
        assert!(a.starts_with("guest-"));
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
