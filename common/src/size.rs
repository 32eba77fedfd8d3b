use crate::record::MAX_RECORD_SIZE;

/// Smallest all-ones mask covering [`MAX_RECORD_SIZE`].
pub const SIZE_MASK: u64 = 0x7fff;

/// `min(total, MAX_RECORD_SIZE)`, saturating before the mask so nothing wraps.
#[inline(always)]
pub fn clamp_total(total: u64) -> u32 {
    let mut total = if total > SIZE_MASK { SIZE_MASK } else { total };
    total &= SIZE_MASK;
    if total > MAX_RECORD_SIZE as u64 {
        total = MAX_RECORD_SIZE as u64;
    }
    total as u32
}
