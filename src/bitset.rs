//! Read-only exclusion filters addressed by row id.

use roaring::RoaringBitmap;

/// Caller-owned exclusion bitset. A set bit means "skip this id".
///
/// Ids beyond the end of the bitset are never excluded.
#[derive(Debug, Clone, Copy, Default)]
pub enum BitsetView<'a> {
    /// Nothing is excluded.
    #[default]
    Empty,
    /// Packed little-endian bits: id `i` is bit `i % 8` of byte `i / 8`.
    Bytes(&'a [u8]),
    /// Compressed bitmap of excluded ids.
    Roaring(&'a RoaringBitmap),
}

impl<'a> BitsetView<'a> {
    /// View over packed bytes.
    pub fn from_bytes(data: &'a [u8]) -> Self {
        BitsetView::Bytes(data)
    }

    /// View over a roaring bitmap.
    pub fn from_roaring(bitmap: &'a RoaringBitmap) -> Self {
        BitsetView::Roaring(bitmap)
    }

    /// True when no id can be excluded.
    pub fn is_empty(&self) -> bool {
        match self {
            BitsetView::Empty => true,
            BitsetView::Bytes(data) => data.iter().all(|&b| b == 0),
            BitsetView::Roaring(bitmap) => bitmap.is_empty(),
        }
    }

    /// True when `id` must be skipped.
    #[inline]
    pub fn test(&self, id: i64) -> bool {
        if id < 0 {
            return false;
        }
        match self {
            BitsetView::Empty => false,
            BitsetView::Bytes(data) => {
                let byte = (id >> 3) as usize;
                byte < data.len() && data[byte] & (1 << (id & 7)) != 0
            }
            BitsetView::Roaring(bitmap) => {
                u32::try_from(id).map_or(false, |id| bitmap.contains(id))
            }
        }
    }

    /// Number of excluded ids.
    pub fn count(&self) -> usize {
        match self {
            BitsetView::Empty => 0,
            BitsetView::Bytes(data) => data.iter().map(|b| b.count_ones() as usize).sum(),
            BitsetView::Roaring(bitmap) => bitmap.len() as usize,
        }
    }
}

/// Packs a list of ids into a byte bitset wide enough for `n` ids.
pub fn pack_ids(n: usize, ids: impl IntoIterator<Item = usize>) -> Vec<u8> {
    let mut bits = vec![0u8; n.div_ceil(8)];
    for id in ids {
        if id < n {
            bits[id / 8] |= 1 << (id % 8);
        }
    }
    bits
}
