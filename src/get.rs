//! The `Get<T>` trait and its implementations provide a single generic,
//! overloaded `get<T>()` on handles for all supported value types.

use crate::Key;
use crate::error::Error;
use crate::handle::Handle;
use crate::platform::Platform;
use crate::raw::ItemType;
use alloc::string::String;
use alloc::vec::Vec;

pub trait Get<T> {
    fn get(&mut self, key: &Key) -> Result<T, Error>;
}

impl<T: Platform> Get<bool> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<bool, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::U8, key)?;
        Ok(value as u8 != 0)
    }
}

impl<T: Platform> Get<u8> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<u8, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::U8, key)?;
        Ok(value as u8)
    }
}

impl<T: Platform> Get<u16> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<u16, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::U16, key)?;
        Ok(value as u16)
    }
}

impl<T: Platform> Get<u32> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<u32, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::U32, key)?;
        Ok(value as u32)
    }
}

impl<T: Platform> Get<u64> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<u64, Error> {
        self.store
            .read_primitive(self.namespace_index, ItemType::U64, key)
    }
}

impl<T: Platform> Get<i8> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<i8, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::I8, key)?;
        Ok(value as u8 as i8)
    }
}

impl<T: Platform> Get<i16> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<i16, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::I16, key)?;
        Ok(value as u16 as i16)
    }
}

impl<T: Platform> Get<i32> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<i32, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::I32, key)?;
        Ok(value as u32 as i32)
    }
}

impl<T: Platform> Get<i64> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<i64, Error> {
        let value = self
            .store
            .read_primitive(self.namespace_index, ItemType::I64, key)?;
        Ok(value.cast_signed())
    }
}

impl<T: Platform> Get<String> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<String, Error> {
        self.store.read_string(self.namespace_index, key)
    }
}

impl<T: Platform> Get<Vec<u8>> for Handle<'_, T> {
    fn get(&mut self, key: &Key) -> Result<Vec<u8>, Error> {
        self.store.read_blob(self.namespace_index, key)
    }
}
