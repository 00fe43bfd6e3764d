//! Encoding and decoding of the fixed 68 byte handshake record.

use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};

use bytes::Bytes;

use bt::{InfoHash, PeerId, INFO_HASH_LEN, PEER_ID_LEN};
use error::{PeerError, PeerErrorKind, PeerResult};

/// Protocol name sent in every handshake.
pub const PROTOCOL_NAME: &'static str = "BitTorrent protocol";

/// Total length of a handshake record.
pub const HANDSHAKE_LEN: usize = 68;

const PROTOCOL_LEN_LEN: usize = 1;
const RESERVED_BYTES_LEN: usize = 8;

// External protocol constant: the fast extension is advertised in the last
// reserved byte.
const FAST_EXTENSION_BYTE: usize = 7;
const FAST_EXTENSION_MASK: u8 = 0x04;

/// Handshake record exchanged before any length prefixed message is trusted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandshakeMessage {
    reserved: [u8; RESERVED_BYTES_LEN],
    info_hash: InfoHash,
    peer_id: PeerId,
}

impl HandshakeMessage {
    /// Create a new HandshakeMessage with no capability bits set.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> HandshakeMessage {
        HandshakeMessage {
            reserved: [0u8; RESERVED_BYTES_LEN],
            info_hash: info_hash,
            peer_id: peer_id,
        }
    }

    /// Advertise the fast extension capability bit in the reserved bytes.
    pub fn enable_fast_extension(&mut self) {
        self.reserved[FAST_EXTENSION_BYTE] |= FAST_EXTENSION_MASK;
    }

    /// Decode a handshake record, validating the protocol name length and
    /// literal before trusting the rest of the layout.
    ///
    /// A mismatch means the peer is protocol incompatible and no identifiers
    /// are extracted.
    pub fn from_bytes(bytes: &[u8]) -> PeerResult<HandshakeMessage> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(PeerError::with_detail(PeerErrorKind::ProtocolViolation,
                                              "Handshake Record Has An Invalid Length",
                                              format!("found {} bytes", bytes.len())));
        }

        let protocol_len = bytes[0] as usize;
        if protocol_len != PROTOCOL_NAME.len() || &bytes[1..1 + protocol_len] != PROTOCOL_NAME.as_bytes() {
            return Err(PeerError::new(PeerErrorKind::ProtocolViolation,
                                      "Handshake Record Has An Invalid Protocol Name"));
        }

        let reserved_offset = PROTOCOL_LEN_LEN + protocol_len;
        let info_hash_offset = reserved_offset + RESERVED_BYTES_LEN;
        let peer_id_offset = info_hash_offset + INFO_HASH_LEN;

        let mut reserved = [0u8; RESERVED_BYTES_LEN];
        reserved.copy_from_slice(&bytes[reserved_offset..info_hash_offset]);

        let info_hash = InfoHash::from_bytes(&bytes[info_hash_offset..peer_id_offset])?;
        let peer_id = PeerId::from_bytes(&bytes[peer_id_offset..peer_id_offset + PEER_ID_LEN])?;

        Ok(HandshakeMessage {
            reserved: reserved,
            info_hash: info_hash,
            peer_id: peer_id,
        })
    }

    /// Write the 68 byte record out to the given writer.
    pub fn write_bytes<W>(&self, mut writer: W) -> io::Result<()>
        where W: Write
    {
        writer.write_all(&[PROTOCOL_NAME.len() as u8])?;
        writer.write_all(PROTOCOL_NAME.as_bytes())?;
        writer.write_all(&self.reserved[..])?;
        writer.write_all(self.info_hash.as_ref())?;
        writer.write_all(self.peer_id.as_ref())
    }

    /// Serialize the record into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = Vec::with_capacity(HANDSHAKE_LEN);

        self.write_bytes(&mut buffer)
            .expect("peer_wire: HandshakeMessage Failed To Write To A Vec");

        Bytes::from(buffer)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Whether the remote end advertised the fast extension.
    ///
    /// Only the capability bit is inspected here, interpreting the extension
    /// is up to the session layer.
    pub fn is_fast_extension_enabled(&self) -> bool {
        self.reserved[FAST_EXTENSION_BYTE] & FAST_EXTENSION_MASK != 0
    }
}

impl Display for HandshakeMessage {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.write_fmt(format_args!("handshake info_hash={} peer_id={} fast={}",
                                 self.info_hash,
                                 self.peer_id,
                                 self.is_fast_extension_enabled()))
    }
}
