//! Piece storage collaborator consumed by the session layer.

use std::time::Instant;

/// View of local piece availability and transfer rates.
///
/// Piece selection, verification and persistence live behind this trait and
/// are never performed by the wire layer.
pub trait PieceStore {
    /// Whether every piece has been downloaded and validated locally.
    fn is_download_complete(&self) -> bool;

    /// Indexes of pieces that became advertisable after the given
    /// checkpoint.
    fn advertised_piece_indexes(&self, since: Instant) -> Vec<u32>;

    /// Bitfield of locally available pieces, high bit first per byte.
    fn bitfield_bytes(&self) -> Vec<u8>;

    /// Current aggregate download rate in bytes per second.
    fn download_rate(&self) -> u64;

    /// Current aggregate upload rate in bytes per second.
    fn upload_rate(&self) -> u64;
}

/// In memory piece store used for simulation and tests.
pub struct MemoryPieceStore {
    total_pieces: u32,
    completed: Vec<(u32, Instant)>,
    download_rate: u64,
    upload_rate: u64,
}

impl MemoryPieceStore {
    pub fn new(total_pieces: u32) -> MemoryPieceStore {
        MemoryPieceStore {
            total_pieces: total_pieces,
            completed: Vec::new(),
            download_rate: 0,
            upload_rate: 0,
        }
    }

    /// Record that the given piece finished downloading just now.
    pub fn complete_piece(&mut self, piece_index: u32) {
        if self.completed.iter().all(|&(index, _)| index != piece_index) {
            self.completed.push((piece_index, Instant::now()));
        }
    }

    pub fn set_download_rate(&mut self, rate: u64) {
        self.download_rate = rate;
    }

    pub fn set_upload_rate(&mut self, rate: u64) {
        self.upload_rate = rate;
    }
}

impl PieceStore for MemoryPieceStore {
    fn is_download_complete(&self) -> bool {
        self.completed.len() as u32 == self.total_pieces
    }

    fn advertised_piece_indexes(&self, since: Instant) -> Vec<u32> {
        self.completed
            .iter()
            .filter(|&&(_, at)| at >= since)
            .map(|&(index, _)| index)
            .collect()
    }

    fn bitfield_bytes(&self) -> Vec<u8> {
        let num_bytes = (self.total_pieces as usize + 7) / 8;
        let mut bitfield = vec![0u8; num_bytes];

        for &(index, _) in self.completed.iter() {
            bitfield[index as usize / 8] |= 0x80 >> (index % 8);
        }

        bitfield
    }

    fn download_rate(&self) -> u64 {
        self.download_rate
    }

    fn upload_rate(&self) -> u64 {
        self.upload_rate
    }
}
