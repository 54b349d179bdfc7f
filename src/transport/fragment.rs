use anyhow::anyhow;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// Per-fragment metadata, prepended to every datagram. All numbers are network byte order.
///
/// ```ascii
/// 0:  message id (u64): shared by all fragments of one logical message
/// 8:  fragment index (u32): position of this fragment, 0-based
/// 12: fragment count (u32): total number of fragments of the message, >= 1
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FragmentHeader {
    pub message_id: u64,
    pub index: u32,
    pub count: u32,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 16;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.message_id);
        buf.put_u32(self.index);
        buf.put_u32(self.count);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        let message_id = buf.try_get_u64()?;
        let index = buf.try_get_u32()?;
        let count = buf.try_get_u32()?;

        if count == 0 {
            return Err(anyhow!("fragment with a count of zero"));
        }
        if index >= count {
            return Err(anyhow!("fragment index {} out of range for count {}", index, count));
        }

        Ok(FragmentHeader {
            message_id,
            index,
            count,
        })
    }
}

/// Number of fragments a payload of `payload_len` bytes occupies given a per-fragment payload
///  `capacity`. An empty payload still occupies one (header-only) fragment.
pub fn fragment_count(payload_len: usize, capacity: usize) -> u32 {
    debug_assert!(capacity > 0);
    payload_len.div_ceil(capacity).max(1) as u32
}
