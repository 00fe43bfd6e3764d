//! Serializable peer wire protocol messages.

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;

const KEEP_ALIVE_MESSAGE_LEN: u32 = 0;
const CHOKE_MESSAGE_LEN: u32 = 1;
const UNCHOKE_MESSAGE_LEN: u32 = 1;
const INTERESTED_MESSAGE_LEN: u32 = 1;
const UNINTERESTED_MESSAGE_LEN: u32 = 1;
const HAVE_MESSAGE_LEN: u32 = 5;
const BASE_BITFIELD_MESSAGE_LEN: u32 = 1;
const REQUEST_MESSAGE_LEN: u32 = 13;
const HAVE_ALL_MESSAGE_LEN: u32 = 1;
const HAVE_NONE_MESSAGE_LEN: u32 = 1;

const CHOKE_MESSAGE_ID: u8 = 0;
const UNCHOKE_MESSAGE_ID: u8 = 1;
const INTERESTED_MESSAGE_ID: u8 = 2;
const UNINTERESTED_MESSAGE_ID: u8 = 3;
const HAVE_MESSAGE_ID: u8 = 4;
const BITFIELD_MESSAGE_ID: u8 = 5;
const REQUEST_MESSAGE_ID: u8 = 6;
const HAVE_ALL_MESSAGE_ID: u8 = 0x0E;
const HAVE_NONE_MESSAGE_ID: u8 = 0x0F;

const MESSAGE_LENGTH_LEN_BYTES: usize = 4;

/// Enumeration of messages the session layer queues for a peer.
///
/// Piece and cancel traffic is owned by layers above and never
/// constructed here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// Message to keep the connection alive.
    KeepAlive,
    /// Message to tell a peer we will not be responding to their requests.
    Choke,
    /// Message to tell a peer we will now be responding to their requests.
    UnChoke,
    /// Message to tell a peer we are interested in downloading pieces from them.
    Interested,
    /// Message to tell a peer we are not interested in downloading pieces from them.
    UnInterested,
    /// Message to tell a peer we have some (validated) piece.
    Have(u32),
    /// Message to effectively send multiple HaveMessages in a single message.
    BitField(Vec<u8>),
    /// Message to request a block from a peer.
    Request {
        piece_index: u32,
        block_offset: u32,
        block_length: u32,
    },
    /// Fast extension message advertising every piece at once.
    HaveAll,
    /// Fast extension message advertising that we have no pieces yet.
    HaveNone,
}

impl WireMessage {
    pub fn is_keep_alive(&self) -> bool {
        match self {
            &WireMessage::KeepAlive => true,
            _ => false,
        }
    }

    /// Write the length prefixed form of the message to the given writer.
    pub fn write_bytes<W>(&self, mut writer: W) -> io::Result<()>
        where W: Write
    {
        match self {
            &WireMessage::KeepAlive => write_length_id_pair(writer, KEEP_ALIVE_MESSAGE_LEN, None),
            &WireMessage::Choke => write_length_id_pair(writer, CHOKE_MESSAGE_LEN, Some(CHOKE_MESSAGE_ID)),
            &WireMessage::UnChoke => write_length_id_pair(writer, UNCHOKE_MESSAGE_LEN, Some(UNCHOKE_MESSAGE_ID)),
            &WireMessage::Interested => write_length_id_pair(writer, INTERESTED_MESSAGE_LEN, Some(INTERESTED_MESSAGE_ID)),
            &WireMessage::UnInterested => {
                write_length_id_pair(writer, UNINTERESTED_MESSAGE_LEN, Some(UNINTERESTED_MESSAGE_ID))
            }
            &WireMessage::Have(piece_index) => {
                write_length_id_pair(&mut writer, HAVE_MESSAGE_LEN, Some(HAVE_MESSAGE_ID))?;
                writer.write_u32::<BigEndian>(piece_index)
            }
            &WireMessage::BitField(ref bitfield) => {
                let length = BASE_BITFIELD_MESSAGE_LEN + bitfield.len() as u32;

                write_length_id_pair(&mut writer, length, Some(BITFIELD_MESSAGE_ID))?;
                writer.write_all(&bitfield[..])
            }
            &WireMessage::Request { piece_index, block_offset, block_length } => {
                write_length_id_pair(&mut writer, REQUEST_MESSAGE_LEN, Some(REQUEST_MESSAGE_ID))?;
                writer.write_u32::<BigEndian>(piece_index)?;
                writer.write_u32::<BigEndian>(block_offset)?;
                writer.write_u32::<BigEndian>(block_length)
            }
            &WireMessage::HaveAll => write_length_id_pair(writer, HAVE_ALL_MESSAGE_LEN, Some(HAVE_ALL_MESSAGE_ID)),
            &WireMessage::HaveNone => write_length_id_pair(writer, HAVE_NONE_MESSAGE_LEN, Some(HAVE_NONE_MESSAGE_ID)),
        }
    }

    /// Serialize the message into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buffer = Vec::with_capacity(MESSAGE_LENGTH_LEN_BYTES + self.message_size());

        self.write_bytes(&mut buffer)
            .expect("peer_wire: WireMessage Failed To Write To A Vec");

        Bytes::from(buffer)
    }

    /// Size of the message payload, excluding the length prefix.
    pub fn message_size(&self) -> usize {
        let message_specific_len = match self {
            &WireMessage::KeepAlive => KEEP_ALIVE_MESSAGE_LEN as usize,
            &WireMessage::Choke => CHOKE_MESSAGE_LEN as usize,
            &WireMessage::UnChoke => UNCHOKE_MESSAGE_LEN as usize,
            &WireMessage::Interested => INTERESTED_MESSAGE_LEN as usize,
            &WireMessage::UnInterested => UNINTERESTED_MESSAGE_LEN as usize,
            &WireMessage::Have(_) => HAVE_MESSAGE_LEN as usize,
            &WireMessage::BitField(ref bitfield) => BASE_BITFIELD_MESSAGE_LEN as usize + bitfield.len(),
            &WireMessage::Request { .. } => REQUEST_MESSAGE_LEN as usize,
            &WireMessage::HaveAll => HAVE_ALL_MESSAGE_LEN as usize,
            &WireMessage::HaveNone => HAVE_NONE_MESSAGE_LEN as usize,
        };

        message_specific_len
    }
}

/// Classification of a received frame used for flood accounting and dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    KeepAlive,
    Choke,
    UnChoke,
    Interested,
    UnInterested,
    Have,
    BitField,
    Request,
    HaveAll,
    HaveNone,
    /// Any message id this layer does not act on itself.
    Other(u8),
}

/// Classify a complete frame payload by its message id.
///
/// A zero length payload is the keep alive frame, everything else carries
/// its id in the first payload byte.
pub fn classify_frame(payload: &[u8]) -> MessageKind {
    if payload.is_empty() {
        return MessageKind::KeepAlive;
    }

    match payload[0] {
        CHOKE_MESSAGE_ID => MessageKind::Choke,
        UNCHOKE_MESSAGE_ID => MessageKind::UnChoke,
        INTERESTED_MESSAGE_ID => MessageKind::Interested,
        UNINTERESTED_MESSAGE_ID => MessageKind::UnInterested,
        HAVE_MESSAGE_ID => MessageKind::Have,
        BITFIELD_MESSAGE_ID => MessageKind::BitField,
        REQUEST_MESSAGE_ID => MessageKind::Request,
        HAVE_ALL_MESSAGE_ID => MessageKind::HaveAll,
        HAVE_NONE_MESSAGE_ID => MessageKind::HaveNone,
        other => MessageKind::Other(other),
    }
}

/// Write a length and optional id out to the given writer.
fn write_length_id_pair<W>(mut writer: W, length: u32, opt_id: Option<u8>) -> io::Result<()>
    where W: Write
{
    writer.write_u32::<BigEndian>(length)?;

    if let Some(id) = opt_id {
        writer.write_u8(id)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_frame, MessageKind, WireMessage};

    #[test]
    fn positive_keep_alive_is_zero_length() {
        let bytes = WireMessage::KeepAlive.to_bytes();

        assert_eq!(&[0, 0, 0, 0][..], &bytes[..]);
    }

    #[test]
    fn positive_have_carries_index() {
        let bytes = WireMessage::Have(0x01020304).to_bytes();

        assert_eq!(&[0, 0, 0, 5, 4, 1, 2, 3, 4][..], &bytes[..]);
    }

    #[test]
    fn positive_bitfield_length_includes_payload() {
        let bytes = WireMessage::BitField(vec![0xAB, 0xCD]).to_bytes();

        assert_eq!(&[0, 0, 0, 3, 5, 0xAB, 0xCD][..], &bytes[..]);
    }

    #[test]
    fn positive_classify_round_trip() {
        let messages = [(WireMessage::Choke, MessageKind::Choke),
                        (WireMessage::UnChoke, MessageKind::UnChoke),
                        (WireMessage::Have(1), MessageKind::Have),
                        (WireMessage::HaveAll, MessageKind::HaveAll)];

        for &(ref message, kind) in messages.iter() {
            let bytes = message.to_bytes();

            assert_eq!(kind, classify_frame(&bytes[4..]));
        }
    }

    #[test]
    fn positive_classify_empty_frame_as_keep_alive() {
        assert_eq!(MessageKind::KeepAlive, classify_frame(&[]));
    }
}
