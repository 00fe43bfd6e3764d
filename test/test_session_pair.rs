use peer_wire::bt::PeerId;
use peer_wire::command::PeerCommand;
use peer_wire::engine::{Command, Engine};
use peer_wire::session::Sequence;

use session_pair;

#[test]
fn positive_sessions_reach_wired_and_exchange_state() {
    let engine = Engine::new();
    let (mut session_a, mut session_b) = session_pair(&engine);

    assert_eq!(Sequence::SendHandshake, session_a.sequence());
    assert_eq!(Sequence::WaitHandshakeInbound, session_b.sequence());
    assert_eq!(2, engine.active_connections());

    for _ in 0..20 {
        session_a.step(&engine);
        session_b.step(&engine);
    }

    assert_eq!(Sequence::Wired, session_a.sequence());
    assert_eq!(Sequence::Wired, session_b.sequence());

    // Each side bound the identifier the other presented.
    assert_eq!(Some(PeerId::from([0xBBu8; 20])), session_a.peer().peer_id());
    assert_eq!(Some(PeerId::from([0xAAu8; 20])), session_b.peer().peer_id());

    // The accepting side's bitfield reached the initiator, who became
    // interested; that interest reached the accepting side.
    assert!(session_a.queue().peer_has_pieces());
    assert!(session_a.peer().am_interested());
    assert!(session_b.peer().peer_interested());

    // A non seeding bitfield never marks the peer as a seeder.
    assert!(!session_a.peer().is_seeder());

    assert!(session_a.failure().is_none());
    assert!(session_b.failure().is_none());
}
