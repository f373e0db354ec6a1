use crate::raw;
use thiserror::Error;

pub use raw::ItemType;

/// Errors reported by the store. Marked non-exhaustive so variants can be
/// added without breaking the API; callers typically only need to handle
/// `NamespaceNotFound` and `KeyNotFound`.
#[derive(Error, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the flash sector size (4k).
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition size has to be a multiple of the flash sector size (4k).
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// The partition needs at least two sectors: one live page plus the
    /// reserve page compaction moves entries into.
    #[error("partition too small")]
    PartitionTooSmall,

    /// The flash driver reported a failure. The store refuses further
    /// operations until it is constructed again.
    #[error("flash operation failed")]
    FlashError,

    /// Namespace not found. Either nothing was ever written under this name
    /// or the flash was corrupted and silently repaired on mount.
    #[error("namespace not found")]
    NamespaceNotFound,

    /// Key not found. Either nothing was ever written under this key or the
    /// flash was corrupted and silently repaired on mount.
    #[error("key not found")]
    KeyNotFound,

    /// A key or namespace name is empty or longer than 15 bytes.
    #[error("invalid key or namespace name")]
    InvalidName,

    /// The stored value has a different datatype; the encountered type is
    /// reported.
    #[error("item type mismatch: {0}")]
    TypeMismatch(ItemType),

    /// Write attempted through a handle opened in `OpenMode::ReadOnly`.
    #[error("handle is read-only")]
    ReadOnly,

    /// Strings and blobs are limited to 4000 bytes; a value must fit into a
    /// single page.
    #[error("value too long")]
    ValueTooLong,

    /// The caller buffer cannot hold the stored value; `required` is the
    /// stored size.
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    /// Stored bytes are inconsistent (e.g. a string that is not UTF-8).
    #[error("corrupted data")]
    CorruptedData,

    /// Flash is full and compaction cannot reclaim any capacity.
    #[error("flash full")]
    FlashFull,

    /// Used internally to indicate that the active page cannot take the
    /// record and a new page has to be allocated. Never surfaced.
    #[error("page full")]
    PageFull,

    /// The new value was written but erasing the previous copy failed. The
    /// value is live under the new record; the stale copy is cleaned up by
    /// the next mount.
    #[error("failed to remove old value")]
    RemoveFailed,
}
