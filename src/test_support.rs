//! An in-memory `Torrent`/`PieceHandle` double standing in for the real
//! storage collaborator, so the codec and state-machine tests in this crate
//! exercise real trait objects without touching disk.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::Result;
use crate::torrent::{PieceHandle, Torrent};

struct PieceState {
    blocks: BTreeMap<u32, Vec<u8>>,
    valid: bool,
}

/// A torrent of `piece_count` pieces, each `piece_len` bytes (the last piece
/// is not shortened; tests that care about a ragged last piece construct one
/// explicitly via [`FixedSizeTorrent::with_piece_lens`]).
pub(crate) struct FixedSizeTorrent {
    piece_lens: Vec<u32>,
    handles: Vec<FixedPieceHandle>,
}

impl FixedSizeTorrent {
    pub(crate) fn new(piece_count: u32, piece_len: u32) -> Self {
        Self::with_piece_lens(vec![piece_len; piece_count as usize], false)
    }

    /// Like `new`, but every piece starts out already valid, for exercising
    /// the REQUEST/upload path without a prior download.
    pub(crate) fn seeded(piece_count: u32, piece_len: u32) -> Self {
        Self::with_piece_lens(vec![piece_len; piece_count as usize], true)
    }

    pub(crate) fn with_piece_lens(piece_lens: Vec<u32>, seeded: bool) -> Self {
        let handles = piece_lens
            .iter()
            .enumerate()
            .map(|(index, &size)| FixedPieceHandle {
                index: index as u32,
                size,
                state: Mutex::new(PieceState {
                    blocks: BTreeMap::new(),
                    valid: seeded,
                }),
            })
            .collect();
        Self { piece_lens, handles }
    }
}

impl Torrent for FixedSizeTorrent {
    fn piece_count(&self) -> u32 {
        self.piece_lens.len() as u32
    }

    fn piece_len(&self, index: u32) -> Option<u32> {
        self.piece_lens.get(index as usize).copied()
    }

    fn piece(&self, index: u32) -> Option<&dyn PieceHandle> {
        self.handles
            .get(index as usize)
            .map(|h| h as &dyn PieceHandle)
    }
}

pub(crate) struct FixedPieceHandle {
    index: u32,
    size: u32,
    state: Mutex<PieceState>,
}

impl PieceHandle for FixedPieceHandle {
    fn index(&self) -> u32 {
        self.index
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn read(&self, _offset: u32, len: u32) -> Result<Bytes> {
        // content doesn't matter to the codec or state-machine tests, only
        // offset/length bounds do
        Ok(Bytes::from(vec![0u8; len as usize]))
    }

    fn record(&self, block: &[u8], offset: u32) {
        self.state
            .lock()
            .unwrap()
            .blocks
            .insert(offset, block.to_vec());
    }

    fn validate(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.valid = true;
        true
    }

    fn is_valid(&self) -> bool {
        self.state.lock().unwrap().valid
    }
}
