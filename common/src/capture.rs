//! Bounded copies of the return value and buffered arguments into the payload.
//!
//! Every copy is clamped to the destination slice it is handed, so callers pass
//! exactly the remaining payload capacity and never have to re-check bounds.

use crate::config::{ArgType, CaptureShape};
use crate::correlation::RetprobeEntry;

/// Upper bound on iovec segments walked per record.
pub const MAX_IOVEC_SEGMENTS: usize = 16;

/// `sizeof(struct iovec)` on 64-bit targets.
const IOVEC_SIZE: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadFault;

pub trait ProbeMemory {
    fn read(&self, src: u64, dst: &mut [u8]) -> Result<(), ReadFault>;
}

impl<T: ProbeMemory + ?Sized> ProbeMemory for &T {
    fn read(&self, src: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
        (**self).read(src, dst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentCapture {
    None,
    FixedBuffer { src: u64, len: u64 },
    ScatterGather { src: u64, segments: u64, limit: u64 },
}

impl ArgumentCapture {
    /// `transferred` is the byte count reported by the return value, already
    /// cleared of error returns (see [`transfer_len`]).
    pub fn from_shape(shape: CaptureShape, transferred: u64, entry: &RetprobeEntry) -> Self {
        match shape {
            CaptureShape::None => ArgumentCapture::None,
            CaptureShape::CharBuf => ArgumentCapture::FixedBuffer {
                src: entry.buffer,
                len: transferred,
            },
            CaptureShape::CharIovec => ArgumentCapture::ScatterGather {
                src: entry.buffer,
                segments: entry.count,
                limit: transferred,
            },
        }
    }

    pub fn copy_into<M: ProbeMemory + ?Sized>(&self, dst: &mut [u8], memory: &M) -> usize {
        match *self {
            ArgumentCapture::None => 0,
            ArgumentCapture::FixedBuffer { src, len } => copy_char_buf(dst, memory, src, len),
            ArgumentCapture::ScatterGather {
                src,
                segments,
                limit,
            } => copy_char_iovec(dst, memory, src, segments, limit),
        }
    }
}

/// Interprets a raw return register as a byte count. Negative values are error
/// returns and transfer nothing. 32-bit types only trust the low half of the
/// register.
pub fn transfer_len(raw: u64, ty: Option<ArgType>) -> u64 {
    let signed = match ty {
        Some(ArgType::Int) => raw as u32 as i32 as i64,
        Some(ArgType::U32) => raw as u32 as i64,
        Some(ArgType::U64) | Some(ArgType::SizeT) => return raw,
        Some(ArgType::S64) | Some(ArgType::SsizeT) | None => raw as i64,
    };
    if signed < 0 {
        0
    } else {
        signed as u64
    }
}

/// Writes `value` little-endian at the width of `ty`. Returns `0` when `dst`
/// cannot hold the full width.
pub fn write_return_value(dst: &mut [u8], ty: ArgType, value: u64) -> usize {
    match ty.width() {
        4 if dst.len() >= 4 => {
            dst[..4].copy_from_slice(&(value as u32).to_le_bytes());
            4
        }
        8 if dst.len() >= 8 => {
            dst[..8].copy_from_slice(&value.to_le_bytes());
            8
        }
        _ => 0,
    }
}

#[inline(always)]
fn bounded(len: u64, capacity: usize) -> usize {
    if len < capacity as u64 {
        len as usize
    } else {
        capacity
    }
}

/// Copies `min(len, dst.len())` bytes from `src`. A fault copies nothing.
pub fn copy_char_buf<M: ProbeMemory + ?Sized>(
    dst: &mut [u8],
    memory: &M,
    src: u64,
    len: u64,
) -> usize {
    let n = bounded(len, dst.len());
    if n == 0 || src == 0 {
        return 0;
    }
    match memory.read(src, &mut dst[..n]) {
        Ok(()) => n,
        Err(ReadFault) => 0,
    }
}

struct Iovec {
    base: u64,
    len: u64,
}

fn read_iovec<M: ProbeMemory + ?Sized>(memory: &M, src: u64, index: usize) -> Option<Iovec> {
    let mut raw = [0u8; IOVEC_SIZE as usize];
    let at = src.checked_add(index as u64 * IOVEC_SIZE)?;
    memory.read(at, &mut raw).ok()?;

    let mut base = [0u8; 8];
    let mut len = [0u8; 8];
    base.copy_from_slice(&raw[..8]);
    len.copy_from_slice(&raw[8..]);
    Some(Iovec {
        base: u64::from_le_bytes(base),
        len: u64::from_le_bytes(len),
    })
}

/// Gathers up to `segments` iovec segments (at most [`MAX_IOVEC_SEGMENTS`]) in
/// order. The total is bounded by `dst.len()` and by `limit`; the first segment
/// that does not fit is truncated and ends the walk, as does any fault.
pub fn copy_char_iovec<M: ProbeMemory + ?Sized>(
    dst: &mut [u8],
    memory: &M,
    src: u64,
    segments: u64,
    limit: u64,
) -> usize {
    let budget = bounded(limit, dst.len());
    if src == 0 {
        return 0;
    }

    let mut written = 0;
    for i in 0..MAX_IOVEC_SEGMENTS {
        if i as u64 >= segments || written >= budget {
            break;
        }
        let Some(iov) = read_iovec(memory, src, i) else {
            break;
        };
        let n = bounded(iov.len, budget - written);
        if n > 0 {
            if memory.read(iov.base, &mut dst[written..written + n]).is_err() {
                break;
            }
            written += n;
        }
        if (n as u64) < iov.len {
            break;
        }
    }
    written
}
