//! On-disk layout of one shared compressed physical block: a small fixed
//! directory of (offset, length) pairs, one per fragment slot, followed by
//! the concatenated LZ4 streams. Not named as a distinct on-disk structure
//! in spec §6 but required to make spec §8's "compressed safety" property
//! (decompressing the k-th fragment reproduces the LBN's logical contents)
//! checkable: without a directory there is no way to locate fragment k
//! inside the shared block. A malformed directory surfaces as
//! [`VdoError::InvalidFragment`] on read, per spec §7.

use crate::error::{Result, VdoError};
use crate::types::{Pbn, MAX_COMPRESSION_SLOTS, VDO_BLOCK_SIZE};

const SLOT_COUNT: usize = MAX_COMPRESSION_SLOTS as usize;
const HEADER_LEN: usize = SLOT_COUNT * 4; // (offset:u16, length:u16) per slot

/// Directory of where each fragment slot's bytes live within the shared
/// block's payload region.
#[derive(Debug, Clone, Copy)]
struct Directory {
    slots: [(u16, u16); SLOT_COUNT],
}

impl Directory {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        for (i, &(offset, len)) in self.slots.iter().enumerate() {
            out[i * 4..i * 4 + 2].copy_from_slice(&offset.to_le_bytes());
            out[i * 4 + 2..i * 4 + 4].copy_from_slice(&len.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(VdoError::InvalidFragment { pbn: Pbn::ZERO });
        }
        let mut slots = [(0u16, 0u16); SLOT_COUNT];
        for (i, slot) in slots.iter_mut().enumerate() {
            let offset = u16::from_le_bytes(bytes[i * 4..i * 4 + 2].try_into().unwrap());
            let len = u16::from_le_bytes(bytes[i * 4 + 2..i * 4 + 4].try_into().unwrap());
            *slot = (offset, len);
        }
        Ok(Self { slots })
    }
}

/// Pack up to 14 already-compressed fragments into one 4 KiB block.
/// `fragments[i]` lands in slot `i`. Fails with `InvalidFragment` if the
/// fragments don't fit (the packer should never produce a bin like this,
/// since each member was only accepted into the bin because it compressed
/// below block size, but the check is kept as a hard backstop).
pub fn build_packed_block(fragments: &[Vec<u8>], pbn: Pbn) -> Result<[u8; VDO_BLOCK_SIZE]> {
    if fragments.len() > SLOT_COUNT {
        return Err(VdoError::InvalidFragment { pbn });
    }
    let mut out = [0u8; VDO_BLOCK_SIZE];
    let mut directory = Directory { slots: [(0, 0); SLOT_COUNT] };
    let mut cursor = HEADER_LEN;
    for (i, fragment) in fragments.iter().enumerate() {
        let end = cursor + fragment.len();
        if end > VDO_BLOCK_SIZE {
            return Err(VdoError::InvalidFragment { pbn });
        }
        out[cursor..end].copy_from_slice(fragment);
        directory.slots[i] = (cursor as u16, fragment.len() as u16);
        cursor = end;
    }
    out[0..HEADER_LEN].copy_from_slice(&directory.encode());
    Ok(out)
}

/// Extract the raw (still-compressed) bytes for fragment slot `k` from a
/// shared block previously built by [`build_packed_block`].
pub fn extract_fragment(block: &[u8; VDO_BLOCK_SIZE], slot: u8, pbn: Pbn) -> Result<Vec<u8>> {
    let directory = Directory::decode(&block[0..HEADER_LEN]).map_err(|_| VdoError::InvalidFragment { pbn })?;
    let (offset, len) = directory
        .slots
        .get(slot as usize)
        .copied()
        .ok_or(VdoError::InvalidFragment { pbn })?;
    if len == 0 {
        return Err(VdoError::InvalidFragment { pbn });
    }
    let start = offset as usize;
    let end = start + len as usize;
    if end > VDO_BLOCK_SIZE || start < HEADER_LEN {
        return Err(VdoError::InvalidFragment { pbn });
    }
    Ok(block[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_extract_round_trips_each_slot() {
        let pbn = Pbn::new(1).unwrap();
        let fragments: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 16 + i]).collect();
        let block = build_packed_block(&fragments, pbn).unwrap();
        for (i, expected) in fragments.iter().enumerate() {
            let got = extract_fragment(&block, i as u8, pbn).unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[test]
    fn empty_slot_is_invalid_fragment() {
        let pbn = Pbn::new(1).unwrap();
        let fragments: Vec<Vec<u8>> = vec![vec![1, 2, 3]];
        let block = build_packed_block(&fragments, pbn).unwrap();
        assert!(matches!(extract_fragment(&block, 5, pbn), Err(VdoError::InvalidFragment { .. })));
    }

    #[test]
    fn oversized_fragment_set_is_rejected() {
        let pbn = Pbn::new(1).unwrap();
        let fragments: Vec<Vec<u8>> = (0..14).map(|_| vec![7u8; 500]).collect();
        assert!(build_packed_block(&fragments, pbn).is_err());
    }
}
