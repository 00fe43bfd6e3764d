//! Common bittorrent identifiers.

use std::fmt::{self, Display, Formatter};

use rand::Rng;

use error::{PeerError, PeerErrorKind, PeerResult};

/// Length of a peer wire identifier hash.
pub const HASH_ID_LEN: usize = 20;

/// Length of an InfoHash.
pub const INFO_HASH_LEN: usize = HASH_ID_LEN;

/// Length of a PeerId.
pub const PEER_ID_LEN: usize = HASH_ID_LEN;

/// Bittorrent InfoHash.
pub type InfoHash = HashId;

/// Bittorrent PeerId.
pub type PeerId = HashId;

/// Fixed 20 byte identifier used for both info hashes and peer ids.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct HashId {
    id: [u8; HASH_ID_LEN],
}

impl HashId {
    /// Create a HashId from the given bytes, validating the length.
    pub fn from_bytes(bytes: &[u8]) -> PeerResult<HashId> {
        if bytes.len() != HASH_ID_LEN {
            Err(PeerError::with_detail(PeerErrorKind::Aborted,
                                       "Identifier Has An Invalid Length",
                                       format!("found {} bytes", bytes.len())))
        } else {
            let mut id = [0u8; HASH_ID_LEN];
            id.copy_from_slice(bytes);

            Ok(HashId { id: id })
        }
    }
}

impl AsRef<[u8]> for HashId {
    fn as_ref(&self) -> &[u8] {
        &self.id
    }
}

impl From<[u8; HASH_ID_LEN]> for HashId {
    fn from(id: [u8; HASH_ID_LEN]) -> HashId {
        HashId { id: id }
    }
}

impl Into<[u8; HASH_ID_LEN]> for HashId {
    fn into(self) -> [u8; HASH_ID_LEN] {
        self.id
    }
}

impl Display for HashId {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        for byte in self.id.iter() {
            f.write_fmt(format_args!("{:02x}", byte))?;
        }

        Ok(())
    }
}

/// Generate a random azureus style PeerId for the local client.
pub fn random_peer_id() -> PeerId {
    let mut id = [0u8; PEER_ID_LEN];

    let prefix = b"-PW0010-";
    id[..prefix.len()].copy_from_slice(prefix);

    let mut rng = rand::thread_rng();
    for byte in id[prefix.len()..].iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }

    PeerId::from(id)
}
