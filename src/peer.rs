//! Mutable record of a remote peer shared with the session driving it.

use std::net::SocketAddr;

use bt::PeerId;

/// Error count escalation applied to non seeding peers so eviction policies
/// drop them first.
pub const MAX_PEER_ERROR: u32 = 5;

/// State of one remote peer across the lifetime of its session.
#[derive(Clone, Debug)]
pub struct Peer {
    addr: SocketAddr,
    peer_id: Option<PeerId>,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    // Eligibility input written by the external choking policy.
    choking_required: bool,
    fast_extension: bool,
    seeder: bool,
    error_count: u32,
    active: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Peer {
        Peer {
            addr: addr,
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            choking_required: true,
            fast_extension: false,
            seeder: false,
            error_count: 0,
            active: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    /// Bind the identifier received in the peer's handshake to this record.
    pub fn set_peer_id(&mut self, peer_id: PeerId) {
        self.peer_id = Some(peer_id);
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn set_am_choking(&mut self, choking: bool) {
        self.am_choking = choking;
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn set_am_interested(&mut self, interested: bool) {
        self.am_interested = interested;
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn set_peer_choking(&mut self, choking: bool) {
        self.peer_choking = choking;
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn set_peer_interested(&mut self, interested: bool) {
        self.peer_interested = interested;
    }

    /// Whether the external choking policy currently wants this peer choked.
    pub fn should_be_choking(&self) -> bool {
        self.choking_required
    }

    pub fn set_choking_required(&mut self, required: bool) {
        self.choking_required = required;
    }

    pub fn is_fast_extension_enabled(&self) -> bool {
        self.fast_extension
    }

    pub fn set_fast_extension_enabled(&mut self, enabled: bool) {
        self.fast_extension = enabled;
    }

    pub fn is_seeder(&self) -> bool {
        self.seeder
    }

    pub fn set_seeder(&mut self, seeder: bool) {
        self.seeder = seeder;
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Penalize the peer after a session failure.
    ///
    /// Non seeding peers escalate heavily to bias eviction towards them.
    pub fn mark_error(&mut self) {
        if self.seeder {
            self.error_count += 1;
        } else {
            self.error_count += MAX_PEER_ERROR;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Reset everything tied to the torn down exchange, keeping the identity
    /// and penalty accounting intact.
    pub fn reset_transient_status(&mut self) {
        self.am_choking = true;
        self.am_interested = false;
        self.peer_choking = true;
        self.peer_interested = false;
        self.fast_extension = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{Peer, MAX_PEER_ERROR};

    fn sample_peer() -> Peer {
        Peer::new("127.0.0.1:6889".parse().unwrap())
    }

    #[test]
    fn positive_seeder_error_escalation() {
        let mut seeder = sample_peer();
        seeder.set_seeder(true);
        seeder.mark_error();

        let mut leecher = sample_peer();
        leecher.mark_error();

        assert_eq!(1, seeder.error_count());
        assert_eq!(MAX_PEER_ERROR, leecher.error_count());
    }

    #[test]
    fn positive_transient_reset_keeps_penalties() {
        let mut peer = sample_peer();
        peer.set_peer_choking(false);
        peer.set_am_interested(true);
        peer.set_fast_extension_enabled(true);
        peer.mark_error();

        peer.reset_transient_status();

        assert!(peer.peer_choking());
        assert!(!peer.am_interested());
        assert!(!peer.is_fast_extension_enabled());
        assert_eq!(MAX_PEER_ERROR, peer.error_count());
    }
}
