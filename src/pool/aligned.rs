//! Heap blocks with a caller-chosen start alignment

use super::PoolError;

/// Fixed-size heap block whose usable region starts on an `alignment` boundary.
///
/// The backing storage is over-allocated by `alignment - 1` bytes and never
/// resized, so the aligned window stays valid for the block's lifetime.
pub struct AlignedBlock {
    storage: Box<[u8]>,
    offset: usize,
    len: usize,
}

impl AlignedBlock {
    pub fn allocate(len: usize, alignment: usize) -> Result<Self, PoolError> {
        if !alignment.is_power_of_two() {
            return Err(PoolError::InvalidAlignment(alignment));
        }
        if len == 0 {
            return Err(PoolError::InvalidSize(len));
        }

        let total = len
            .checked_add(alignment - 1)
            .ok_or(PoolError::Allocation { size: len })?;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| PoolError::Allocation { size: total })?;
        storage.resize(total, 0u8);
        let storage = storage.into_boxed_slice();

        let offset = storage.as_ptr().align_offset(alignment);
        if offset > alignment - 1 {
            return Err(PoolError::Allocation { size: total });
        }

        Ok(Self {
            storage,
            offset,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}
