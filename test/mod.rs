extern crate peer_wire;

mod test_session_pair;

use peer_wire::bt::{InfoHash, PeerId};
use peer_wire::engine::Engine;
use peer_wire::queue::WireQueue;
use peer_wire::session::{PeerSessionCommand, SessionConfig};
use peer_wire::storage::MemoryPieceStore;
use peer_wire::transport::{duplex, DuplexTransport};

pub type TestSession = PeerSessionCommand<WireQueue<DuplexTransport>, MemoryPieceStore>;

pub const TOTAL_PIECES: u32 = 8;

pub fn shared_info_hash() -> InfoHash {
    InfoHash::from([3u8; 20])
}

/// Two sessions wired over one in memory pair, the accepting side seeded
/// with a few pieces.
pub fn session_pair(engine: &Engine) -> (TestSession, TestSession) {
    let (side_a, side_b) = duplex();

    let queue_a = WireQueue::new(engine.new_cuid(),
                                 side_a,
                                 shared_info_hash(),
                                 PeerId::from([0xAAu8; 20]),
                                 TOTAL_PIECES);
    let session_a = PeerSessionCommand::initiate(engine,
                                                 "127.0.0.1:6881".parse().unwrap(),
                                                 queue_a,
                                                 MemoryPieceStore::new(TOTAL_PIECES),
                                                 SessionConfig::default());

    let queue_b = WireQueue::new(engine.new_cuid(),
                                 side_b,
                                 shared_info_hash(),
                                 PeerId::from([0xBBu8; 20]),
                                 TOTAL_PIECES);
    let mut store_b = MemoryPieceStore::new(TOTAL_PIECES);
    for index in 0..4 {
        store_b.complete_piece(index);
    }
    let session_b = PeerSessionCommand::accept(engine,
                                               "127.0.0.1:6882".parse().unwrap(),
                                               queue_b,
                                               store_b,
                                               SessionConfig::default());

    (session_a, session_b)
}
