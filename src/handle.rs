use crate::error::Error;
use crate::get::Get;
use crate::platform::Platform;
use crate::set::Set;
use crate::storage::Store;
use crate::Key;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Exclusive view of one namespace. All data access goes through a handle;
/// the `&mut` borrow of the store is what makes the single-caller rule a
/// compile-time property. Handles to the same namespace, opened one after
/// another, share all state.
///
/// After a driver failure every call returns `FlashError` until the store
/// is mounted again.
pub struct Handle<'s, T: Platform> {
    pub(crate) store: &'s mut Store<T>,
    pub(crate) namespace_index: u8,
    pub(crate) mode: OpenMode,
}

impl<T: Platform> Handle<'_, T> {
    /// Reads a value. Supported types are `bool`, signed and unsigned
    /// integers up to 64 bits, `String` and `Vec<u8>`.
    pub fn get<R>(&mut self, key: &Key) -> Result<R, Error>
    where
        Self: Get<R>,
    {
        if self.store.faulted {
            return Err(Error::FlashError);
        }
        let result = Get::get(self, key);
        self.latch(result)
    }

    /// Writes a value. Integers take one 32-byte record; strings and blobs
    /// may span up to a whole page (4000 bytes).
    pub fn set<V>(&mut self, key: &Key, value: V) -> Result<(), Error>
    where
        Self: Set<V>,
    {
        self.writable()?;
        let result = Set::set(self, key, value);
        self.latch(result)
    }

    /// Copies a stored string or blob into `buf` and returns the stored
    /// size. Fails with `BufferTooSmall` carrying the required size when
    /// the buffer cannot hold it.
    pub fn get_into(&mut self, key: &Key, buf: &mut [u8]) -> Result<usize, Error> {
        if self.store.faulted {
            return Err(Error::FlashError);
        }
        let result = self.store.read_into(self.namespace_index, key, buf);
        self.latch(result)
    }

    /// Stored size of a string (terminator included) or blob.
    pub fn value_size(&mut self, key: &Key) -> Result<usize, Error> {
        if self.store.faulted {
            return Err(Error::FlashError);
        }
        let result = self.store.value_size(self.namespace_index, key);
        self.latch(result)
    }

    /// Erases a key. `KeyNotFound` when there is nothing to erase.
    pub fn remove(&mut self, key: &Key) -> Result<(), Error> {
        self.writable()?;
        let result = self.store.erase_key(self.namespace_index, key);
        self.latch(result)
    }

    /// Erases every key of this namespace. The namespace itself survives.
    pub fn erase_all(&mut self) -> Result<(), Error> {
        self.writable()?;
        let result = self.store.erase_namespace(self.namespace_index);
        self.latch(result)
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn writable(&self) -> Result<(), Error> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        if self.store.faulted {
            return Err(Error::FlashError);
        }
        Ok(())
    }

    fn latch<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if matches!(result, Err(Error::FlashError | Error::RemoveFailed)) {
            self.store.faulted = true;
        }
        result
    }
}
