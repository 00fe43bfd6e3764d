//! Cooperative engine for driving bittorrent peer wire protocol sessions.
//!
//! A [session::PeerSessionCommand] owns one peer exchange end to end, from
//! the 68 byte handshake through steady state message traffic, and is
//! stepped by a single threaded [engine::Engine] without ever blocking.
//! Piece selection, verification and persistence stay behind the
//! [storage::PieceStore] seam.

#[macro_use]
extern crate log;

extern crate byteorder;
extern crate bytes;
extern crate mio;
extern crate rand;

pub mod bt;
pub mod command;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod queue;
pub mod session;
pub mod storage;
pub mod transport;

pub use bt::{HashId, InfoHash, PeerId};
pub use engine::{Command, Engine, StepResult};
pub use error::{PeerError, PeerErrorKind, PeerResult};
pub use session::{PeerSessionCommand, Sequence, SessionConfig};
