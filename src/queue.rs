//! Outbound message queueing and request slot bookkeeping for one peer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use bt::{InfoHash, PeerId};
use connection::PeerConnection;
use error::{PeerError, PeerErrorKind, PeerResult};
use handshake::HandshakeMessage;
use message::{classify_frame, MessageKind, WireMessage};
use peer::Peer;
use storage::PieceStore;
use transport::Transport;

/// Maximum number of block requests kept in flight at once.
const REQUEST_PIPELINE_LIMIT: usize = 16;

/// Reserved request slots older than this are considered lost and released.
const REQUEST_SLOT_TIMEOUT: Duration = Duration::from_secs(60);

const HAVE_PAYLOAD_LEN: usize = 5;

/// One block of a piece a session wants to request from its peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece_index: u32,
    pub block_offset: u32,
    pub block_length: u32,
}

/// Per peer wire traffic collaborator driven by the session command.
///
/// Owns the connection, the outbound queue and the request slots so the
/// session layer only decides *when* traffic happens, never how it is
/// framed or flushed.
pub trait MessageQueue {
    fn transport_mut(&mut self) -> &mut Transport;

    /// Queue our handshake for sending and attempt one flush.
    fn send_handshake(&mut self) -> PeerResult<()>;

    /// Accumulate the remote handshake, returning it only once whole.
    ///
    /// With `expecting_inbound` set, completing the remote handshake first
    /// triggers our reply before the record is handed back.
    fn receive_handshake(&mut self, expecting_inbound: bool) -> PeerResult<Option<HandshakeMessage>>;

    /// Whether our handshake has been staged for sending.
    fn handshake_sent(&self) -> bool;

    /// Number of messages waiting to be sent, counting a partially flushed
    /// one.
    fn queued_message_count(&self) -> usize;

    /// Whether a message has been partially written to the transport.
    fn is_sending_in_progress(&self) -> bool;

    /// Drain the outbound queue with non blocking writes until the socket
    /// stops accepting bytes.
    fn send_messages(&mut self) -> PeerResult<()>;

    /// Accumulate one incoming frame, returning its payload only once whole.
    fn receive_message(&mut self) -> PeerResult<Option<Bytes>>;

    fn enqueue(&mut self, message: WireMessage);

    /// Queue the piece availability announcement that opens the exchange.
    fn announce_initial_state(&mut self, peer: &Peer, store: &PieceStore) -> PeerResult<()>;

    /// Update the received frame's effects on the shared peer record.
    fn handle_incoming(&mut self, peer: &mut Peer, payload: &[u8]) -> PeerResult<()>;

    /// Reconcile our interest flags with current piece availability.
    fn sync_piece_state(&mut self, peer: &mut Peer, store: &PieceStore) -> PeerResult<()>;

    /// Release request slots that have been reserved for too long.
    fn check_request_slots(&mut self, peer: &Peer) -> PeerResult<()>;

    /// Promote wanted blocks into the request pipeline while slots and the
    /// peer's unchoke allow it.
    fn admit_requests(&mut self, peer: &Peer, store: &PieceStore) -> PeerResult<()>;

    /// Drop every reservation and wanted block, run at session teardown.
    fn release_reserved_pieces(&mut self, peer: &Peer);
}

/// Default [MessageQueue] over a framed peer connection.
pub struct WireQueue<T>
    where T: Transport
{
    cuid: u64,
    connection: PeerConnection<T>,
    info_hash: InfoHash,
    local_peer_id: PeerId,
    fast_extension: bool,
    total_pieces: u32,
    queue: VecDeque<WireMessage>,
    pending: Option<Bytes>,
    pending_sent: usize,
    handshake_sent: bool,
    peer_have_count: u32,
    peer_has_pieces: bool,
    wanted_blocks: VecDeque<BlockRequest>,
    reserved: Vec<(BlockRequest, Instant)>,
}

impl<T> WireQueue<T>
    where T: Transport
{
    pub fn new(cuid: u64,
               transport: T,
               info_hash: InfoHash,
               local_peer_id: PeerId,
               total_pieces: u32)
               -> WireQueue<T> {
        WireQueue {
            cuid: cuid,
            connection: PeerConnection::new(cuid, transport),
            info_hash: info_hash,
            local_peer_id: local_peer_id,
            fast_extension: false,
            total_pieces: total_pieces,
            queue: VecDeque::new(),
            pending: None,
            pending_sent: 0,
            handshake_sent: false,
            peer_have_count: 0,
            peer_has_pieces: false,
            wanted_blocks: VecDeque::new(),
            reserved: Vec::new(),
        }
    }

    /// Advertise fast extension support in our handshake.
    pub fn enable_fast_extension(&mut self) {
        self.fast_extension = true;
    }

    pub fn is_fast_extension_enabled(&self) -> bool {
        self.fast_extension
    }

    /// Register a block the session wants from this peer.
    pub fn queue_block_request(&mut self, request: BlockRequest) {
        self.wanted_blocks.push_back(request);
    }

    pub fn queued_messages(&self) -> &VecDeque<WireMessage> {
        &self.queue
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    pub fn peer_has_pieces(&self) -> bool {
        self.peer_has_pieces
    }

    fn bitfield_byte_len(&self) -> usize {
        (self.total_pieces as usize + 7) / 8
    }

    fn record_peer_piece_count(&mut self, added: u32) {
        self.peer_have_count += added;
        if added > 0 {
            self.peer_has_pieces = true;
        }
    }

    /// Flush the partially written message, returning true once it is
    /// completely on the wire.
    fn flush_pending(&mut self) -> PeerResult<bool> {
        let bytes = match self.pending.take() {
            Some(bytes) => bytes,
            None => return Ok(true),
        };

        let written = self.connection.send_bytes(&bytes[self.pending_sent..])?;
        self.pending_sent += written;

        if self.pending_sent == bytes.len() {
            self.pending_sent = 0;
            Ok(true)
        } else {
            self.pending = Some(bytes);
            Ok(false)
        }
    }

    fn stage_handshake(&mut self) -> PeerResult<()> {
        let mut handshake = HandshakeMessage::new(self.info_hash, self.local_peer_id);
        if self.fast_extension {
            handshake.enable_fast_extension();
        }

        debug!("peer_wire: CUID#{} - Sending handshake...", self.cuid);

        self.pending = Some(handshake.to_bytes());
        self.pending_sent = 0;
        self.handshake_sent = true;

        self.flush_pending()?;
        Ok(())
    }
}

impl<T> MessageQueue for WireQueue<T>
    where T: Transport
{
    fn transport_mut(&mut self) -> &mut Transport {
        self.connection.transport_mut()
    }

    fn send_handshake(&mut self) -> PeerResult<()> {
        self.stage_handshake()
    }

    fn receive_handshake(&mut self, expecting_inbound: bool) -> PeerResult<Option<HandshakeMessage>> {
        let frame = match self.connection.receive_handshake()? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        let handshake = HandshakeMessage::from_bytes(&frame)?;

        if handshake.info_hash() != self.info_hash {
            return Err(PeerError::with_detail(PeerErrorKind::ProtocolViolation,
                                              "Peer Handshake Carried The Wrong Info Hash",
                                              format!("{}", handshake.info_hash())));
        }

        debug!("peer_wire: CUID#{} - Received handshake from {}...",
               self.cuid,
               handshake.peer_id());

        // An accepting session only reveals its handshake to peers that
        // present a valid one for our torrent.
        if expecting_inbound && !self.handshake_sent {
            self.stage_handshake()?;
        }

        Ok(Some(handshake))
    }

    fn handshake_sent(&self) -> bool {
        self.handshake_sent
    }

    fn queued_message_count(&self) -> usize {
        self.queue.len() + if self.pending.is_some() { 1 } else { 0 }
    }

    fn is_sending_in_progress(&self) -> bool {
        self.pending.is_some() && self.pending_sent > 0
    }

    fn send_messages(&mut self) -> PeerResult<()> {
        loop {
            if self.pending.is_none() {
                let message = match self.queue.pop_front() {
                    Some(message) => message,
                    None => break,
                };

                debug!("peer_wire: CUID#{} - Sending {:?}", self.cuid, message);

                self.pending = Some(message.to_bytes());
                self.pending_sent = 0;
            }

            if !self.flush_pending()? {
                break;
            }
        }

        Ok(())
    }

    fn receive_message(&mut self) -> PeerResult<Option<Bytes>> {
        self.connection.receive_message()
    }

    fn enqueue(&mut self, message: WireMessage) {
        self.queue.push_back(message);
    }

    fn announce_initial_state(&mut self, peer: &Peer, store: &PieceStore) -> PeerResult<()> {
        let fast = self.fast_extension && peer.is_fast_extension_enabled();
        let bitfield = store.bitfield_bytes();
        let has_pieces = bitfield.iter().any(|&byte| byte != 0);

        if fast && store.is_download_complete() {
            self.enqueue(WireMessage::HaveAll);
        } else if fast && !has_pieces {
            self.enqueue(WireMessage::HaveNone);
        } else if has_pieces {
            self.enqueue(WireMessage::BitField(bitfield));
        }

        Ok(())
    }

    fn handle_incoming(&mut self, peer: &mut Peer, payload: &[u8]) -> PeerResult<()> {
        match classify_frame(payload) {
            MessageKind::KeepAlive => (),
            MessageKind::Choke => peer.set_peer_choking(true),
            MessageKind::UnChoke => peer.set_peer_choking(false),
            MessageKind::Interested => peer.set_peer_interested(true),
            MessageKind::UnInterested => peer.set_peer_interested(false),
            MessageKind::Have => {
                if payload.len() != HAVE_PAYLOAD_LEN {
                    return Err(PeerError::new(PeerErrorKind::ProtocolViolation,
                                              "Peer Sent A Malformed Have Message"));
                }

                self.record_peer_piece_count(1);
                if self.peer_have_count >= self.total_pieces {
                    peer.set_seeder(true);
                }
            }
            MessageKind::BitField => {
                let bitfield = &payload[1..];
                if bitfield.len() != self.bitfield_byte_len() {
                    return Err(PeerError::with_detail(PeerErrorKind::ProtocolViolation,
                                                      "Peer Sent A Bitfield Of The Wrong Length",
                                                      format!("{} bytes", bitfield.len())));
                }

                let set_bits = bitfield.iter().map(|&byte| byte.count_ones()).sum::<u32>();
                self.peer_have_count = 0;
                self.peer_has_pieces = false;
                self.record_peer_piece_count(set_bits);

                if set_bits >= self.total_pieces {
                    peer.set_seeder(true);
                }
            }
            MessageKind::HaveAll => {
                self.peer_have_count = self.total_pieces;
                self.peer_has_pieces = true;
                peer.set_seeder(true);
            }
            MessageKind::HaveNone => {
                self.peer_have_count = 0;
                self.peer_has_pieces = false;
            }
            MessageKind::Request | MessageKind::Other(_) => {
                // Traffic owned by layers above, nothing for the shared peer
                // record here.
            }
        }

        Ok(())
    }

    fn sync_piece_state(&mut self, peer: &mut Peer, store: &PieceStore) -> PeerResult<()> {
        if !peer.am_interested() && !store.is_download_complete() && self.peer_has_pieces {
            peer.set_am_interested(true);
            self.enqueue(WireMessage::Interested);
        } else if peer.am_interested() && store.is_download_complete() {
            peer.set_am_interested(false);
            self.enqueue(WireMessage::UnInterested);
        }

        Ok(())
    }

    fn check_request_slots(&mut self, _peer: &Peer) -> PeerResult<()> {
        let cuid = self.cuid;
        let before = self.reserved.len();

        self.reserved.retain(|&(request, reserved_at)| {
            if reserved_at.elapsed() >= REQUEST_SLOT_TIMEOUT {
                warn!("peer_wire: CUID#{} - Releasing timed out request slot for piece {}...",
                      cuid,
                      request.piece_index);
                false
            } else {
                true
            }
        });

        if self.reserved.len() != before {
            debug!("peer_wire: CUID#{} - {} request slot(s) released",
                   cuid,
                   before - self.reserved.len());
        }

        Ok(())
    }

    fn admit_requests(&mut self, peer: &Peer, store: &PieceStore) -> PeerResult<()> {
        if peer.peer_choking() || !peer.am_interested() || store.is_download_complete() {
            return Ok(());
        }

        while self.reserved.len() < REQUEST_PIPELINE_LIMIT {
            let request = match self.wanted_blocks.pop_front() {
                Some(request) => request,
                None => break,
            };

            self.enqueue(WireMessage::Request {
                piece_index: request.piece_index,
                block_offset: request.block_offset,
                block_length: request.block_length,
            });
            self.reserved.push((request, Instant::now()));
        }

        Ok(())
    }

    fn release_reserved_pieces(&mut self, _peer: &Peer) {
        if !self.reserved.is_empty() || !self.wanted_blocks.is_empty() {
            debug!("peer_wire: CUID#{} - Releasing {} reserved and {} wanted block(s)...",
                   self.cuid,
                   self.reserved.len(),
                   self.wanted_blocks.len());
        }

        self.reserved.clear();
        self.wanted_blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::{BlockRequest, MessageQueue, WireQueue, REQUEST_PIPELINE_LIMIT};
    use bt::{InfoHash, PeerId};
    use error::PeerErrorKind;
    use handshake::HandshakeMessage;
    use message::WireMessage;
    use peer::Peer;
    use storage::{MemoryPieceStore, PieceStore};
    use transport::{duplex, DuplexTransport};

    fn sample_queue(total_pieces: u32) -> (WireQueue<DuplexTransport>, DuplexTransport) {
        let (side_a, side_b) = duplex();
        let queue = WireQueue::new(1,
                                   side_a,
                                   InfoHash::from([1u8; 20]),
                                   PeerId::from([2u8; 20]),
                                   total_pieces);

        (queue, side_b)
    }

    fn sample_peer() -> Peer {
        Peer::new("127.0.0.1:6889".parse().unwrap())
    }

    fn drain(remote: &mut DuplexTransport) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 4096];

        while let Ok(read) = remote.read(&mut chunk) {
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
        }

        bytes
    }

    #[test]
    fn positive_handshake_flushes_immediately() {
        let (mut queue, mut remote) = sample_queue(8);

        queue.send_handshake().unwrap();

        assert!(queue.handshake_sent());
        assert_eq!(0, queue.queued_message_count());

        let bytes = drain(&mut remote);
        let handshake = HandshakeMessage::from_bytes(&bytes).unwrap();

        assert_eq!(InfoHash::from([1u8; 20]), handshake.info_hash());
        assert_eq!(PeerId::from([2u8; 20]), handshake.peer_id());
    }

    #[test]
    fn positive_inbound_handshake_triggers_reply() {
        let (mut queue, mut remote) = sample_queue(8);

        let their_handshake = HandshakeMessage::new(InfoHash::from([1u8; 20]), PeerId::from([9u8; 20]));
        use std::io::Write;
        remote.write(&their_handshake.to_bytes()[..]).unwrap();

        let received = queue.receive_handshake(true).unwrap().unwrap();

        assert_eq!(PeerId::from([9u8; 20]), received.peer_id());
        assert!(queue.handshake_sent());
        assert!(!drain(&mut remote).is_empty());
    }

    #[test]
    fn negative_wrong_info_hash_rejected() {
        let (mut queue, mut remote) = sample_queue(8);

        let their_handshake = HandshakeMessage::new(InfoHash::from([7u8; 20]), PeerId::from([9u8; 20]));
        use std::io::Write;
        remote.write(&their_handshake.to_bytes()[..]).unwrap();

        let error = queue.receive_handshake(true).unwrap_err();

        assert_eq!(PeerErrorKind::ProtocolViolation, error.kind());
        assert!(!queue.handshake_sent());
    }

    #[test]
    fn positive_stalled_send_resumes() {
        let (mut queue, mut remote) = sample_queue(8);

        queue.enqueue(WireMessage::Have(3));
        remote.set_remote_writable(false);

        queue.send_messages().unwrap();
        assert_eq!(1, queue.queued_message_count());
        assert!(!queue.is_sending_in_progress());

        remote.set_remote_writable(true);
        queue.send_messages().unwrap();

        assert_eq!(0, queue.queued_message_count());
        assert_eq!(&WireMessage::Have(3).to_bytes()[..], &drain(&mut remote)[..]);
    }

    #[test]
    fn positive_partial_send_tracked() {
        let (mut queue, mut remote) = sample_queue(8);

        queue.enqueue(WireMessage::Have(3));
        remote.set_remote_write_limit(Some(3));

        queue.send_messages().unwrap();
        assert_eq!(1, queue.queued_message_count());
        assert!(queue.is_sending_in_progress());

        remote.set_remote_write_limit(None);
        queue.send_messages().unwrap();

        assert_eq!(0, queue.queued_message_count());
        assert!(!queue.is_sending_in_progress());
        assert_eq!(&WireMessage::Have(3).to_bytes()[..], &drain(&mut remote)[..]);
    }

    #[test]
    fn positive_interested_enqueued_once() {
        let (mut queue, _remote) = sample_queue(8);
        let mut peer = sample_peer();
        let store = MemoryPieceStore::new(8);

        let mut payload = vec![4u8];
        payload.extend_from_slice(&[0, 0, 0, 2]);
        queue.handle_incoming(&mut peer, &payload).unwrap();

        queue.sync_piece_state(&mut peer, &store).unwrap();
        queue.sync_piece_state(&mut peer, &store).unwrap();

        assert!(peer.am_interested());
        assert_eq!(1,
                   queue.queued_messages()
                       .iter()
                       .filter(|message| **message == WireMessage::Interested)
                       .count());
    }

    #[test]
    fn positive_bitfield_marks_seeder() {
        let (mut queue, _remote) = sample_queue(8);
        let mut peer = sample_peer();

        let payload = vec![5u8, 0xFF];
        queue.handle_incoming(&mut peer, &payload).unwrap();

        assert!(peer.is_seeder());
        assert!(queue.peer_has_pieces());
    }

    #[test]
    fn negative_bitfield_wrong_length_rejected() {
        let (mut queue, _remote) = sample_queue(8);
        let mut peer = sample_peer();

        let payload = vec![5u8, 0xFF, 0x00];
        let error = queue.handle_incoming(&mut peer, &payload).unwrap_err();

        assert_eq!(PeerErrorKind::ProtocolViolation, error.kind());
    }

    #[test]
    fn positive_have_all_marks_seeder() {
        let (mut queue, _remote) = sample_queue(8);
        let mut peer = sample_peer();

        queue.handle_incoming(&mut peer, &[0x0E]).unwrap();

        assert!(peer.is_seeder());
        assert!(queue.peer_has_pieces());
    }

    #[test]
    fn positive_requests_gated_by_choke() {
        let (mut queue, _remote) = sample_queue(8);
        let mut peer = sample_peer();
        let store = MemoryPieceStore::new(8);

        peer.set_am_interested(true);
        queue.queue_block_request(BlockRequest {
            piece_index: 0,
            block_offset: 0,
            block_length: 16 * 1024,
        });

        // Choked, nothing admitted.
        queue.admit_requests(&peer, &store).unwrap();
        assert_eq!(0, queue.reserved_count());

        peer.set_peer_choking(false);
        queue.admit_requests(&peer, &store).unwrap();

        assert_eq!(1, queue.reserved_count());
        assert_eq!(1, queue.queued_message_count());
    }

    #[test]
    fn positive_pipeline_limit_enforced() {
        let (mut queue, _remote) = sample_queue(1024);
        let mut peer = sample_peer();
        let store = MemoryPieceStore::new(1024);

        peer.set_am_interested(true);
        peer.set_peer_choking(false);

        for index in 0..REQUEST_PIPELINE_LIMIT as u32 + 4 {
            queue.queue_block_request(BlockRequest {
                piece_index: index,
                block_offset: 0,
                block_length: 16 * 1024,
            });
        }
        queue.admit_requests(&peer, &store).unwrap();

        assert_eq!(REQUEST_PIPELINE_LIMIT, queue.reserved_count());
    }

    #[test]
    fn positive_release_clears_reservations() {
        let (mut queue, _remote) = sample_queue(8);
        let mut peer = sample_peer();
        let store = MemoryPieceStore::new(8);

        peer.set_am_interested(true);
        peer.set_peer_choking(false);
        queue.queue_block_request(BlockRequest {
            piece_index: 2,
            block_offset: 0,
            block_length: 16 * 1024,
        });
        queue.admit_requests(&peer, &store).unwrap();
        assert_eq!(1, queue.reserved_count());

        queue.release_reserved_pieces(&peer);
        assert_eq!(0, queue.reserved_count());
    }

    #[test]
    fn positive_initial_state_fast_extension() {
        let mut peer = sample_peer();
        peer.set_fast_extension_enabled(true);

        let (mut queue, _remote) = sample_queue(8);
        queue.enable_fast_extension();

        let empty_store = MemoryPieceStore::new(8);
        queue.announce_initial_state(&peer, &empty_store).unwrap();
        assert_eq!(Some(&WireMessage::HaveNone), queue.queued_messages().front());

        let (mut queue, _remote) = sample_queue(2);
        queue.enable_fast_extension();

        let mut full_store = MemoryPieceStore::new(2);
        full_store.complete_piece(0);
        full_store.complete_piece(1);
        queue.announce_initial_state(&peer, &full_store).unwrap();
        assert_eq!(Some(&WireMessage::HaveAll), queue.queued_messages().front());
    }

    #[test]
    fn positive_initial_state_without_fast_extension() {
        let peer = sample_peer();

        let (mut queue, _remote) = sample_queue(8);
        let mut store = MemoryPieceStore::new(8);
        store.complete_piece(0);

        queue.announce_initial_state(&peer, &store).unwrap();

        assert_eq!(Some(&WireMessage::BitField(store.bitfield_bytes())),
                   queue.queued_messages().front());

        // No pieces and no fast extension means silence.
        let (mut queue, _remote) = sample_queue(8);
        queue.announce_initial_state(&peer, &MemoryPieceStore::new(8)).unwrap();
        assert_eq!(0, queue.queued_message_count());
    }
}
