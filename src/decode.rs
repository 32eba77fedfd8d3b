use std::fmt;

use anyhow::ensure;
use bytes::Bytes;
use kretsnoop_common::{
    record::{FLAG_RETURN_PROBE, MSG_OP_GENERIC_KPROBE},
    ArgType, ProcessIdentity, HEADER_SIZE, MAX_RECORD_SIZE,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetprobeEvent {
    pub flags: u8,
    pub size: u32,
    pub ktime: u64,
    /// `None` when the kernel could not resolve the process identity.
    pub current: Option<ProcessIdentity>,
    pub probe_id: u32,
    pub args: Bytes,
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

impl RetprobeEvent {
    /// `buf` may be longer than the record: perf pads raw samples.
    pub fn parse(buf: &[u8]) -> anyhow::Result<Self> {
        ensure!(
            buf.len() >= HEADER_SIZE,
            "short record: {} bytes, header is {HEADER_SIZE}",
            buf.len()
        );
        ensure!(buf[0] == MSG_OP_GENERIC_KPROBE, "unexpected op {}", buf[0]);

        let size = le_u32(buf, 4) as usize;
        ensure!(
            (HEADER_SIZE..=MAX_RECORD_SIZE).contains(&size),
            "record size {size} out of range"
        );
        ensure!(
            size <= buf.len(),
            "record size {size} exceeds the {} bytes read",
            buf.len()
        );

        let pid = le_u32(buf, 16);
        let start = le_u64(buf, 20);
        let current = (pid != 0 || start != 0).then_some(ProcessIdentity { pid, ktime: start });

        Ok(RetprobeEvent {
            flags: buf[1],
            size: size as u32,
            ktime: le_u64(buf, 8),
            current,
            probe_id: le_u32(buf, 44),
            args: Bytes::copy_from_slice(&buf[HEADER_SIZE..size]),
        })
    }

    pub fn is_return(&self) -> bool {
        self.flags & FLAG_RETURN_PROBE != 0
    }

    /// Splits the payload into the return value written first (when the probe
    /// captures one) and the buffered bytes that follow it.
    pub fn split_args(&self, return_type: Option<ArgType>) -> (Option<ReturnValue>, Bytes) {
        let Some(ty) = return_type else {
            return (None, self.args.clone());
        };
        let width = ty.width();
        if self.args.len() < width {
            return (None, self.args.clone());
        }
        (
            Some(ReturnValue::decode(ty, &self.args[..width])),
            self.args.slice(width..),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnValue {
    Signed(i64),
    Unsigned(u64),
}

impl ReturnValue {
    /// `raw` is exactly `ty.width()` little-endian bytes.
    fn decode(ty: ArgType, raw: &[u8]) -> Self {
        let value = match ty.width() {
            4 => le_u32(raw, 0) as u64,
            _ => le_u64(raw, 0),
        };
        match ty {
            ArgType::Int => ReturnValue::Signed(value as u32 as i32 as i64),
            ArgType::S64 | ArgType::SsizeT => ReturnValue::Signed(value as i64),
            ArgType::U32 | ArgType::U64 | ArgType::SizeT => ReturnValue::Unsigned(value),
        }
    }
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnValue::Signed(v) => write!(f, "{v}"),
            ReturnValue::Unsigned(v) => write!(f, "{v}"),
        }
    }
}

pub fn payload_preview(bytes: &[u8], max: usize) -> String {
    let mut out: String = bytes
        .iter()
        .take(max)
        .flat_map(|&b| std::ascii::escape_default(b))
        .map(char::from)
        .collect();
    if bytes.len() > max {
        out.push_str("...");
    }
    out
}
