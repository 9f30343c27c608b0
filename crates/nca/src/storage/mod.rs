use snafu::Snafu;

mod io_storage;
mod slice_storage;
mod vec_storage;

pub use io_storage::{FileRoStorage, RoIoStorage};
pub use slice_storage::{SliceStorage, SliceStorageError};
pub use vec_storage::VecStorage;

/// Random read access over a content blob. The NCA engine never writes to its
/// backing storage; mutations leave the library as patch overlays instead.
pub trait ReadableStorage: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;
    fn get_size(&self) -> u64;
}

pub trait ReadableStorageExt: ReadableStorage {
    fn slice(self, offset: u64, size: u64) -> Result<SliceStorage<Self>, SliceStorageError>
    where
        Self: Sized,
    {
        SliceStorage::new(self, offset, size)
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0; self.get_size() as usize];
        self.read(0, &mut buf)?;
        Ok(buf)
    }
}

impl<T: ReadableStorage> ReadableStorageExt for T {}

#[derive(Snafu, Debug)]
pub enum StorageError {
    #[snafu(display("IO error in IoStorage: {}", source))]
    Io {
        source: std::io::Error,
        operation: &'static str,
    },
    #[snafu(display("Attempt to read a storage out of bounds"))]
    OutOfBounds {},
}
