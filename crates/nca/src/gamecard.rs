use crate::storage::{ReadableStorage, StorageError};

/// Hash-filesystem partitions a gamecard image exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameCardHfsPartition {
    Root,
    Update,
    Logo,
    Normal,
    Secure,
    Boot,
}

#[derive(Debug, Clone, Copy)]
pub struct GameCardEntry {
    pub offset: u64,
    pub size: u64,
}

/// Raw gamecard access used when the managed content reader can't be trusted.
///
/// Reads are absolute into the gamecard image; entry lookup resolves an NCA
/// filename inside a hash-FS partition to its absolute extent.
pub trait GameCardReader: Send + Sync {
    fn find_entry(&self, partition: GameCardHfsPartition, name: &str) -> Option<GameCardEntry>;
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError>;
}

/// Adapts a resolved gamecard entry into a [`ReadableStorage`] window, so the
/// NCA engine sees the same interface for gamecard and managed content.
#[derive(Debug)]
pub struct GameCardStorage<G> {
    reader: G,
    base: u64,
    size: u64,
}

impl<G: GameCardReader> GameCardStorage<G> {
    pub fn new(reader: G, entry: GameCardEntry) -> Self {
        Self {
            reader,
            base: entry.offset,
            size: entry.size,
        }
    }
}

impl<G: GameCardReader> ReadableStorage for GameCardStorage<G> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset + buf.len() as u64 > self.size {
            return Err(StorageError::OutOfBounds {});
        }
        self.reader.read(buf, self.base + offset)
    }

    fn get_size(&self) -> u64 {
        self.size
    }
}
