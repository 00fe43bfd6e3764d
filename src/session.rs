//! Command driving one peer exchange from handshake to steady state.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use command::{CommandState, PeerCommand};
use engine::{Engine, StepResult};
use error::{PeerError, PeerErrorKind, PeerResult};
use handshake::HandshakeMessage;
use message::{classify_frame, MessageKind, WireMessage};
use peer::Peer;
use queue::MessageQueue;
use storage::PieceStore;
use transport::{SocketId, Transport};

/// How often steady state housekeeping runs inside the step.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(500);

/// Window over which received message frequencies are judged.
pub const FLOODING_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Fatal rate of received choke and unchoke messages, per second.
pub const CHOKE_UNCHOKE_FLOOD_RATE: f64 = 0.4;

/// Fatal rate of received keep alive messages, per second.
pub const KEEP_ALIVE_FLOOD_RATE: f64 = 1.0;

/// Piece announcements at or above this count collapse into one bitfield.
pub const HAVE_BATCH_HIGH_WATER: usize = 20;

/// Ceiling on frames drained from the socket in one step.
pub const MAX_RECEIVES_PER_STEP: usize = 50;

/// Where the session currently is in its exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sequence {
    /// Outbound session flushing its own handshake first.
    SendHandshake,
    /// Outbound session waiting for the remote handshake.
    WaitHandshakeOutbound,
    /// Accepted session waiting for the remote handshake before revealing
    /// its own.
    WaitHandshakeInbound,
    /// Handshakes exchanged, steady state message traffic.
    Wired,
}

/// Tunables for one peer session.
#[derive(Copy, Clone, Debug)]
pub struct SessionConfig {
    /// Deadline for progress while in steady state.
    pub idle_timeout: Duration,
    /// Deadline for progress while handshaking.
    pub handshake_timeout: Duration,
    /// Quiet time after which a keep alive is queued.
    pub keep_alive_interval: Duration,
    /// Download rate ceiling in bytes per second, zero for unlimited.
    pub max_download_rate: u64,
    /// Upload rate ceiling in bytes per second, zero for unlimited.
    pub max_upload_rate: u64,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(120),
            max_download_rate: 0,
            max_upload_rate: 0,
        }
    }
}

/// Cooperative command owning one peer exchange end to end.
///
/// Every step is non blocking; partial handshakes, partial frames and
/// stalled writes all resume on a later scheduler pass from state carried
/// here and in the queue.
pub struct PeerSessionCommand<Q, S>
    where Q: MessageQueue,
          S: PieceStore
{
    state: CommandState,
    peer: Peer,
    queue: Q,
    store: S,
    config: SessionConfig,
    sequence: Sequence,
    maintenance_check: Instant,
    keep_alive_check: Instant,
    freq_check: Instant,
    have_check: Instant,
    choke_unchoke_count: u32,
    keep_alive_count: u32,
    have_count: u32,
    failure: Option<PeerErrorKind>,
}

impl<Q, S> PeerSessionCommand<Q, S>
    where Q: MessageQueue,
          S: PieceStore
{
    /// Create a session for a connection we initiated.
    pub fn initiate(engine: &Engine,
                    addr: SocketAddr,
                    queue: Q,
                    store: S,
                    config: SessionConfig)
                    -> PeerSessionCommand<Q, S> {
        let mut session = PeerSessionCommand::common(engine, addr, queue, store, config, Sequence::SendHandshake);

        let (socket, open) = session.transport_status();
        session.state.set_write_check(engine, socket, open);

        session
    }

    /// Create a session for a connection a listener accepted.
    pub fn accept(engine: &Engine,
                  addr: SocketAddr,
                  queue: Q,
                  store: S,
                  config: SessionConfig)
                  -> PeerSessionCommand<Q, S> {
        let mut session =
            PeerSessionCommand::common(engine, addr, queue, store, config, Sequence::WaitHandshakeInbound);

        let (socket, open) = session.transport_status();
        session.state.set_read_check(engine, socket, open);

        session
    }

    fn common(engine: &Engine,
              addr: SocketAddr,
              queue: Q,
              store: S,
              config: SessionConfig,
              sequence: Sequence)
              -> PeerSessionCommand<Q, S> {
        let cuid = engine.new_cuid();
        let now = Instant::now();

        engine.increase_connections();

        let mut peer = Peer::new(addr);
        peer.activate();

        info!("peer_wire: CUID#{} - Session with {} starting in {:?}...",
              cuid,
              addr,
              sequence);

        PeerSessionCommand {
            state: CommandState::new(cuid, addr, config.handshake_timeout),
            peer: peer,
            queue: queue,
            store: store,
            config: config,
            sequence: sequence,
            maintenance_check: now,
            keep_alive_check: now,
            freq_check: now,
            have_check: now,
            choke_unchoke_count: 0,
            keep_alive_count: 0,
            have_count: 0,
            failure: None,
        }
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Failure kind recorded at abort, if the session failed.
    pub fn failure(&self) -> Option<PeerErrorKind> {
        self.failure
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn transport_status(&mut self) -> (SocketId, bool) {
        let transport = self.queue.transport_mut();

        (transport.socket_id(), transport.is_open())
    }

    fn handshake_step(&mut self, engine: &Engine) -> PeerResult<()> {
        match self.sequence {
            Sequence::SendHandshake => {
                // Stay put until the socket opens up; the write interest
                // registered at construction wakes us.
                let writable = self.queue
                    .transport_mut()
                    .poll_writable()
                    .map_err(PeerError::from)?;

                if writable {
                    self.queue.send_handshake()?;
                    self.enter_wait_handshake(engine, Sequence::WaitHandshakeOutbound);
                }
            }
            Sequence::WaitHandshakeOutbound => {
                if self.queue.queued_message_count() > 0 {
                    self.queue.send_messages()?;
                }

                if let Some(handshake) = self.queue.receive_handshake(false)? {
                    self.wire_up(engine, handshake)?;
                }
            }
            Sequence::WaitHandshakeInbound => {
                if let Some(handshake) = self.queue.receive_handshake(true)? {
                    self.wire_up(engine, handshake)?;
                }
            }
            Sequence::Wired => (),
        }

        Ok(())
    }

    fn enter_wait_handshake(&mut self, engine: &Engine, sequence: Sequence) {
        let (socket, open) = self.transport_status();

        self.state.disable_write_check(engine);
        self.state.set_read_check(engine, socket, open);
        self.sequence = sequence;
    }

    /// Apply the completed remote handshake and move to steady state.
    fn wire_up(&mut self, engine: &Engine, handshake: HandshakeMessage) -> PeerResult<()> {
        self.peer.set_peer_id(handshake.peer_id());
        self.peer
            .set_fast_extension_enabled(handshake.is_fast_extension_enabled());

        info!("peer_wire: CUID#{} - Handshake completed with {} ({})",
              self.state.cuid(),
              self.state.addr(),
              handshake.peer_id());

        self.queue.announce_initial_state(&self.peer, &self.store)?;

        let (socket, open) = self.transport_status();
        self.state.set_read_check(engine, socket, open);
        self.state.set_timeout(self.config.idle_timeout);
        self.state.set_upload_limit(self.config.max_upload_rate);

        let now = Instant::now();
        self.maintenance_check = now;
        self.keep_alive_check = now;
        self.freq_check = now;
        self.have_check = now;

        self.sequence = Sequence::Wired;

        Ok(())
    }

    fn wired_step(&mut self, engine: &Engine) -> PeerResult<()> {
        self.queue.sync_piece_state(&mut self.peer, &self.store)?;
        self.decide_choking();

        if self.maintenance_check.elapsed() >= MAINTENANCE_INTERVAL {
            self.detect_message_flooding()?;
            self.queue.check_request_slots(&self.peer)?;
            self.check_have()?;
            self.send_keep_alive();

            self.maintenance_check = Instant::now();
        }

        self.receive_messages(engine)?;
        self.queue.admit_requests(&self.peer, &self.store)?;
        self.queue.send_messages()?;

        Ok(())
    }

    /// Queue at most one choke state transition per step.
    fn decide_choking(&mut self) {
        if self.peer.should_be_choking() && !self.peer.am_choking() {
            self.peer.set_am_choking(true);
            self.queue.enqueue(WireMessage::Choke);
        } else if !self.peer.should_be_choking() && self.peer.am_choking() {
            self.peer.set_am_choking(false);
            self.queue.enqueue(WireMessage::UnChoke);
        }
    }

    /// Judge received message frequencies over the elapsed window, failing
    /// the session when a peer floods us.
    fn detect_message_flooding(&mut self) -> PeerResult<()> {
        let elapsed = self.freq_check.elapsed();
        if elapsed < FLOODING_CHECK_INTERVAL {
            return Ok(());
        }

        if flooding_detected(self.keep_alive_count, elapsed, KEEP_ALIVE_FLOOD_RATE) {
            return Err(PeerError::with_detail(PeerErrorKind::ProtocolViolation,
                                              "Peer Is Flooding Keep Alive Messages",
                                              format!("{} in {:?}", self.keep_alive_count, elapsed)));
        }
        if flooding_detected(self.choke_unchoke_count, elapsed, CHOKE_UNCHOKE_FLOOD_RATE) {
            return Err(PeerError::with_detail(PeerErrorKind::ProtocolViolation,
                                              "Peer Is Flooding Choke Transitions",
                                              format!("{} in {:?}", self.choke_unchoke_count, elapsed)));
        }

        // The have rate is tracked for the window but carries no fatal
        // threshold.
        self.keep_alive_count = 0;
        self.choke_unchoke_count = 0;
        self.have_count = 0;
        self.freq_check = Instant::now();

        Ok(())
    }

    /// Announce pieces completed since the last sweep, collapsing a large
    /// batch into one bitfield shaped message.
    fn check_have(&mut self) -> PeerResult<()> {
        let indexes = self.store.advertised_piece_indexes(self.have_check);
        self.have_check = Instant::now();

        if indexes.len() >= HAVE_BATCH_HIGH_WATER {
            if self.peer.is_fast_extension_enabled() && self.store.is_download_complete() {
                self.queue.enqueue(WireMessage::HaveAll);
            } else {
                self.queue.enqueue(WireMessage::BitField(self.store.bitfield_bytes()));
            }
        } else {
            for index in indexes {
                self.queue.enqueue(WireMessage::Have(index));
            }
        }

        Ok(())
    }

    /// Keep the link alive through quiet stretches, but never behind queued
    /// traffic.
    fn send_keep_alive(&mut self) {
        if self.keep_alive_check.elapsed() >= self.config.keep_alive_interval &&
           self.queue.queued_message_count() == 0 {
            self.queue.enqueue(WireMessage::KeepAlive);
            self.keep_alive_check = Instant::now();
        }
    }

    fn receive_messages(&mut self, engine: &Engine) -> PeerResult<()> {
        let mut received = 0;

        while received < MAX_RECEIVES_PER_STEP {
            if self.config.max_download_rate > 0 {
                if self.store.download_rate() > self.config.max_download_rate {
                    // Stop pulling from the socket, but keep stepping so the
                    // gate reopens the moment the rate drops.
                    self.state.disable_read_check(engine);
                    self.state.set_no_check(true);
                    break;
                }

                let (socket, open) = self.transport_status();
                self.state.set_read_check(engine, socket, open);
            }

            let payload = match self.queue.receive_message()? {
                Some(payload) => payload,
                None => break,
            };
            received += 1;

            // Only actual choke state transitions count towards the flood
            // window, a redundant frame is not a transition.
            match classify_frame(&payload) {
                MessageKind::KeepAlive => self.keep_alive_count += 1,
                MessageKind::Choke if !self.peer.peer_choking() => self.choke_unchoke_count += 1,
                MessageKind::UnChoke if self.peer.peer_choking() => self.choke_unchoke_count += 1,
                MessageKind::Have => self.have_count += 1,
                _ => (),
            }

            self.queue.handle_incoming(&mut self.peer, &payload)?;
        }

        Ok(())
    }

    /// Re-arm the one shot readiness gates from what is still pending.
    fn arm_next_step(&mut self, engine: &Engine) {
        if self.queue.queued_message_count() > 0 {
            self.state.set_no_check(true);
        }

        if self.sequence == Sequence::Wired {
            if self.queue.is_sending_in_progress() || self.queue.queued_message_count() > 0 {
                let (socket, open) = self.transport_status();
                self.state.set_write_check(engine, socket, open);
                self.state.set_upload_limit_check(self.queue.is_sending_in_progress());
            } else {
                self.state.disable_write_check(engine);
            }
        }
    }
}

impl<Q, S> PeerCommand for PeerSessionCommand<Q, S>
    where Q: MessageQueue,
          S: PieceStore
{
    fn state(&self) -> &CommandState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut CommandState {
        &mut self.state
    }

    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn peer_mut(&mut self) -> &mut Peer {
        &mut self.peer
    }

    fn transport_mut(&mut self) -> &mut Transport {
        self.queue.transport_mut()
    }

    fn step_inner(&mut self, engine: &Engine) -> PeerResult<StepResult> {
        match self.sequence {
            Sequence::Wired => self.wired_step(engine)?,
            _ => self.handshake_step(engine)?,
        }

        self.arm_next_step(engine);

        Ok(StepResult::Reschedule)
    }

    fn on_abort(&mut self, err: &PeerError) {
        self.failure = Some(err.kind());
        self.queue.release_reserved_pieces(&self.peer);
    }

    fn upload_rate(&self) -> u64 {
        self.store.upload_rate()
    }
}

/// Whether `count` events over `elapsed` meet or exceed `rate` per second.
fn flooding_detected(count: u32, elapsed: Duration, rate: f64) -> bool {
    if count == 0 {
        return false;
    }

    count as f64 / elapsed.as_secs_f64() >= rate
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::{Duration, Instant};

    use super::{flooding_detected, PeerSessionCommand, Sequence, SessionConfig, HAVE_BATCH_HIGH_WATER};
    use bt::{InfoHash, PeerId};
    use engine::Engine;
    use error::PeerErrorKind;
    use message::WireMessage;
    use queue::{MessageQueue, WireQueue};
    use storage::MemoryPieceStore;
    use transport::{duplex, DuplexTransport};

    type TestSession = PeerSessionCommand<WireQueue<DuplexTransport>, MemoryPieceStore>;

    fn sample_session(engine: &Engine, total_pieces: u32) -> (TestSession, DuplexTransport) {
        let (side_a, side_b) = duplex();
        let queue = WireQueue::new(engine.new_cuid(),
                                   side_a,
                                   InfoHash::from([1u8; 20]),
                                   PeerId::from([2u8; 20]),
                                   total_pieces);
        let store = MemoryPieceStore::new(total_pieces);

        let session = PeerSessionCommand::initiate(engine,
                                                   "127.0.0.1:6889".parse().unwrap(),
                                                   queue,
                                                   store,
                                                   SessionConfig::default());

        (session, side_b)
    }

    #[test]
    fn positive_flood_rate_boundaries() {
        let window = Duration::from_secs(5);

        assert!(flooding_detected(2, window, 0.4));
        assert!(!flooding_detected(1, window, 0.4));
        assert!(flooding_detected(5, window, 1.0));
        assert!(!flooding_detected(4, window, 1.0));
        assert!(!flooding_detected(0, window, 0.4));
    }

    #[test]
    fn negative_keep_alive_flood_fails_session() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        session.freq_check = Instant::now() - Duration::from_secs(6);
        session.keep_alive_count = 7;

        let error = session.detect_message_flooding().unwrap_err();
        assert_eq!(PeerErrorKind::ProtocolViolation, error.kind());
    }

    #[test]
    fn negative_choke_flood_fails_session() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        session.freq_check = Instant::now() - Duration::from_secs(5);
        session.choke_unchoke_count = 3;

        let error = session.detect_message_flooding().unwrap_err();
        assert_eq!(PeerErrorKind::ProtocolViolation, error.kind());
    }

    #[test]
    fn positive_flood_window_resets() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        session.freq_check = Instant::now() - Duration::from_secs(6);
        session.keep_alive_count = 1;
        session.choke_unchoke_count = 1;
        session.have_count = 50;

        session.detect_message_flooding().unwrap();

        assert_eq!(0, session.keep_alive_count);
        assert_eq!(0, session.choke_unchoke_count);
        assert_eq!(0, session.have_count);
        assert!(session.freq_check.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn positive_flood_window_not_judged_early() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        // Counts well past fatal rates, but the window has not elapsed yet.
        session.keep_alive_count = 100;
        session.choke_unchoke_count = 100;

        session.detect_message_flooding().unwrap();
        assert_eq!(100, session.keep_alive_count);
    }

    #[test]
    fn positive_have_batching_high_water() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 64);

        session.have_check = Instant::now() - Duration::from_secs(1);
        for index in 0..HAVE_BATCH_HIGH_WATER as u32 {
            session.store_mut().complete_piece(index);
        }

        session.check_have().unwrap();

        let queued = session.queue().queued_messages();
        assert_eq!(1, queued.len());
        match queued.front() {
            Some(&WireMessage::BitField(_)) => (),
            other => panic!("expected a bitfield, got {:?}", other),
        }
    }

    #[test]
    fn positive_have_below_high_water_stays_individual() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 64);

        session.have_check = Instant::now() - Duration::from_secs(1);
        for index in 0..HAVE_BATCH_HIGH_WATER as u32 - 1 {
            session.store_mut().complete_piece(index);
        }

        session.check_have().unwrap();

        let queued = session.queue().queued_messages();
        assert_eq!(HAVE_BATCH_HIGH_WATER - 1, queued.len());
        assert!(queued.iter().all(|message| match message {
            &WireMessage::Have(_) => true,
            _ => false,
        }));
    }

    #[test]
    fn positive_choking_one_transition_per_step() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        session.peer.set_am_choking(false);
        session.peer.set_choking_required(true);

        session.decide_choking();
        session.decide_choking();

        assert!(session.peer.am_choking());
        assert_eq!(1, session.queue().queued_message_count());
    }

    #[test]
    fn positive_unchoke_follows_external_policy() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        // The remote has not declared interest yet, the unchoke still goes
        // out the moment policy stops requiring the choke.
        session.peer.set_choking_required(false);
        session.decide_choking();

        assert!(!session.peer.am_choking());
        assert_eq!(Some(&WireMessage::UnChoke), session.queue().queued_messages().front());
    }

    #[test]
    fn positive_redundant_choke_frames_not_transitions() {
        let engine = Engine::new();
        let (mut session, mut remote) = sample_session(&engine, 8);

        // The remote repeats choke while it already has us choked, none of
        // these flip the state.
        remote.write(&[0, 0, 0, 1, 0]).unwrap();
        remote.write(&[0, 0, 0, 1, 0]).unwrap();
        remote.write(&[0, 0, 0, 1, 0]).unwrap();
        session.receive_messages(&engine).unwrap();

        assert_eq!(0, session.choke_unchoke_count);
        session.freq_check = Instant::now() - Duration::from_secs(6);
        session.detect_message_flooding().unwrap();

        // One unchoke and one choke back are real transitions, the repeated
        // unchoke in between is not.
        remote.write(&[0, 0, 0, 1, 1]).unwrap();
        remote.write(&[0, 0, 0, 1, 1]).unwrap();
        remote.write(&[0, 0, 0, 1, 0]).unwrap();
        session.receive_messages(&engine).unwrap();

        assert_eq!(2, session.choke_unchoke_count);
        assert!(session.peer.peer_choking());
    }

    #[test]
    fn positive_keep_alive_waits_for_empty_queue() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        session.keep_alive_check = Instant::now() - Duration::from_secs(200);
        session.queue_mut().enqueue(WireMessage::Have(1));

        session.send_keep_alive();
        assert_eq!(1, session.queue().queued_message_count());

        session.queue_mut().send_messages().unwrap();
        session.send_keep_alive();

        assert_eq!(Some(&WireMessage::KeepAlive), session.queue().queued_messages().front());
    }

    #[test]
    fn positive_initiated_session_registers_write_interest() {
        let engine = Engine::new();
        let (mut session, _remote) = sample_session(&engine, 8);

        assert_eq!(Sequence::SendHandshake, session.sequence());
        assert_eq!(1, engine.write_interest_count());
        assert_eq!(1, engine.active_connections());

        let socket = session.queue_mut().transport_mut().socket_id();
        assert!(engine.has_write_interest(socket, session.state.cuid()));
    }
}
