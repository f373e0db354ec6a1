use embedded_storage::nor_flash::NorFlash;

/// Everything the store needs from the outside world: word-granular NOR
/// flash access plus a CRC32 routine. See README.md for an example
/// implementation backed by an in-memory buffer.
pub trait Platform: Crc + NorFlash {}

impl<T: Crc + NorFlash> Platform for T {}

pub type FnCrc32 = fn(seed: u32, data: &[u8]) -> u32;

/// Standard CRC-32 (Ethernet/zlib polynomial, reflected, init `0xFFFF_FFFF`,
/// final XOR `0xFFFF_FFFF`). `seed` is the running value for chained
/// computation; pass 0 to start a fresh one.
pub trait Crc {
    fn crc32(seed: u32, data: &[u8]) -> u32;
}

impl<T: Crc> Crc for &mut T {
    fn crc32(seed: u32, data: &[u8]) -> u32 {
        T::crc32(seed, data)
    }
}

pub trait AlignedOps: Platform {
    fn align_read(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    fn align_write_ceil(size: usize) -> usize {
        align_ceil(size, Self::WRITE_SIZE)
    }

    fn align_write_floor(size: usize) -> usize {
        align_floor(size, Self::WRITE_SIZE)
    }
}

impl<T: Platform> AlignedOps for T {}

#[inline(always)]
const fn align_ceil(size: usize, alignment: usize) -> usize {
    size.saturating_add(alignment - 1) / alignment * alignment
}

#[inline(always)]
const fn align_floor(size: usize, alignment: usize) -> usize {
    size / alignment * alignment
}
