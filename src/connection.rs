//! Framing of handshake and length prefixed messages over a non blocking
//! transport.

use std::cmp;
use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use error::{PeerError, PeerErrorKind, PeerResult};
use handshake::HANDSHAKE_LEN;
use transport::Transport;

/// Maximum declared length of an incoming message.
///
/// We assume the largest legal incoming message is a "piece" message carrying
/// 16 KiB of data. Frames declaring more than that fail the connection
/// closed, the peer is not trusted to send arbitrarily large frames.
pub const MAX_PAYLOAD_LEN: usize = 9 + 16 * 1024;

const MESSAGE_LENGTH_LEN: usize = 4;
const READ_CHUNK_LEN: usize = 4096;

/// Byte frame transport over one non blocking socket.
///
/// Partial frame state persists across calls so a frame spanning many non
/// blocking reads reassembles correctly; state resets the instant a frame
/// completes. Completion is all or nothing, no frame is ever delivered
/// partially to the caller.
pub struct PeerConnection<T>
    where T: Transport
{
    cuid: u64,
    transport: T,
    lenbuf: [u8; MESSAGE_LENGTH_LEN],
    lenbuf_read: usize,
    current_payload_len: Option<usize>,
    resbuf: BytesMut,
}

impl<T> PeerConnection<T>
    where T: Transport
{
    pub fn new(cuid: u64, transport: T) -> PeerConnection<T> {
        PeerConnection {
            cuid: cuid,
            transport: transport,
            lenbuf: [0u8; MESSAGE_LENGTH_LEN],
            lenbuf_read: 0,
            current_payload_len: None,
            resbuf: BytesMut::with_capacity(MAX_PAYLOAD_LEN),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Perform one non blocking write attempt, returning the number of bytes
    /// actually written.
    ///
    /// The count may be less than requested, the caller retries the
    /// remainder on a later scheduler pass. There is no internal retry loop.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> PeerResult<usize> {
        match self.transport.write(bytes) {
            Ok(written) => Ok(written),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(PeerError::from(err)),
        }
    }

    /// Accumulate a handshake record, returning the complete frame only once
    /// all of its bytes have arrived.
    pub fn receive_handshake(&mut self) -> PeerResult<Option<Bytes>> {
        if self.fill_buffer(HANDSHAKE_LEN)? {
            Ok(Some(self.resbuf.split_to(HANDSHAKE_LEN).freeze()))
        } else {
            Ok(None)
        }
    }

    /// Accumulate one length prefixed message, returning its payload only
    /// once the frame is whole.
    ///
    /// A zero length prefix is the keep alive frame and completes
    /// immediately with an empty payload. A prefix beyond [MAX_PAYLOAD_LEN]
    /// fails the connection closed with a protocol violation.
    pub fn receive_message(&mut self) -> PeerResult<Option<Bytes>> {
        if self.current_payload_len.is_none() {
            if !self.fill_length_prefix()? {
                return Ok(None);
            }

            let payload_len = BigEndian::read_u32(&self.lenbuf) as usize;
            self.lenbuf_read = 0;

            if payload_len > MAX_PAYLOAD_LEN {
                warn!("peer_wire: CUID#{} - Peer declared an oversized frame of {} bytes...",
                      self.cuid,
                      payload_len);
                return Err(PeerError::with_detail(PeerErrorKind::ProtocolViolation,
                                                  "Peer Declared An Oversized Frame",
                                                  format!("{} bytes", payload_len)));
            }

            self.current_payload_len = Some(payload_len);
        }

        let payload_len = match self.current_payload_len {
            Some(payload_len) => payload_len,
            None => return Ok(None),
        };

        if self.fill_buffer(payload_len)? {
            self.current_payload_len = None;
            Ok(Some(self.resbuf.split_to(payload_len).freeze()))
        } else {
            Ok(None)
        }
    }

    /// Bytes buffered for the frame currently being assembled.
    pub fn buffered(&self) -> &[u8] {
        &self.resbuf
    }

    /// Read non blocking until the length prefix is whole or no more bytes
    /// are available.
    fn fill_length_prefix(&mut self) -> PeerResult<bool> {
        while self.lenbuf_read < MESSAGE_LENGTH_LEN {
            match self.transport.read(&mut self.lenbuf[self.lenbuf_read..]) {
                Ok(0) => {
                    return Err(PeerError::new(PeerErrorKind::Aborted, "Remote Peer Closed The Connection"))
                }
                Ok(read) => self.lenbuf_read += read,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(PeerError::from(err)),
            }
        }

        Ok(self.lenbuf_read == MESSAGE_LENGTH_LEN)
    }

    /// Read non blocking into the frame buffer until it holds `target` bytes
    /// or no more bytes are available.
    ///
    /// The buffer never accumulates more bytes than the frame currently
    /// being assembled requires.
    fn fill_buffer(&mut self, target: usize) -> PeerResult<bool> {
        let mut chunk = [0u8; READ_CHUNK_LEN];

        while self.resbuf.len() < target {
            let want = cmp::min(READ_CHUNK_LEN, target - self.resbuf.len());

            match self.transport.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(PeerError::new(PeerErrorKind::Aborted, "Remote Peer Closed The Connection"))
                }
                Ok(read) => self.resbuf.extend_from_slice(&chunk[..read]),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(PeerError::from(err)),
            }
        }

        Ok(self.resbuf.len() == target)
    }
}
