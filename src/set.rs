use crate::Key;
use crate::error::Error;
use crate::handle::Handle;
use crate::platform::Platform;
use crate::raw::ItemType;

pub trait Set<T> {
    fn set(&mut self, key: &Key, value: T) -> Result<(), Error>;
}

impl<T: Platform> Set<bool> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: bool) -> Result<(), Error> {
        self.store
            .write_primitive(self.namespace_index, ItemType::U8, key, value as u64)
    }
}

impl<T: Platform> Set<u8> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: u8) -> Result<(), Error> {
        self.store
            .write_primitive(self.namespace_index, ItemType::U8, key, value as u64)
    }
}

impl<T: Platform> Set<u16> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: u16) -> Result<(), Error> {
        self.store
            .write_primitive(self.namespace_index, ItemType::U16, key, value as u64)
    }
}

impl<T: Platform> Set<u32> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: u32) -> Result<(), Error> {
        self.store
            .write_primitive(self.namespace_index, ItemType::U32, key, value as u64)
    }
}

impl<T: Platform> Set<u64> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: u64) -> Result<(), Error> {
        self.store
            .write_primitive(self.namespace_index, ItemType::U64, key, value)
    }
}

impl<T: Platform> Set<i8> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: i8) -> Result<(), Error> {
        self.store.write_primitive(
            self.namespace_index,
            ItemType::I8,
            key,
            value.cast_unsigned() as u64,
        )
    }
}

impl<T: Platform> Set<i16> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: i16) -> Result<(), Error> {
        self.store.write_primitive(
            self.namespace_index,
            ItemType::I16,
            key,
            value.cast_unsigned() as u64,
        )
    }
}

impl<T: Platform> Set<i32> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: i32) -> Result<(), Error> {
        self.store.write_primitive(
            self.namespace_index,
            ItemType::I32,
            key,
            value.cast_unsigned() as u64,
        )
    }
}

impl<T: Platform> Set<i64> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: i64) -> Result<(), Error> {
        self.store.write_primitive(
            self.namespace_index,
            ItemType::I64,
            key,
            value.cast_unsigned(),
        )
    }
}

impl<T: Platform> Set<&str> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: &str) -> Result<(), Error> {
        self.store.write_str(self.namespace_index, key, value)
    }
}

impl<T: Platform> Set<&[u8]> for Handle<'_, T> {
    fn set(&mut self, key: &Key, value: &[u8]) -> Result<(), Error> {
        self.store.write_blob(self.namespace_index, key, value)
    }
}
