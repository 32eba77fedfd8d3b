//! Wire layout of the record emitted by the return probe.
//!
//! The structs here are shared verbatim between the BPF object and user space,
//! so every field offset is pinned by the `const` assertions at the bottom of
//! the file. All integers are little-endian on the wire (`bpfel`).

use core::mem::{offset_of, size_of};

pub const MAX_RECORD_SIZE: usize = 9000;

pub const MSG_OP_GENERIC_KPROBE: u8 = 13;

/// `flags` bit 0: the record was produced on the return path.
pub const FLAG_RETURN_PROBE: u8 = 1;

/// Bytes before `args`.
pub const HEADER_SIZE: usize = 48;

pub const ARGS_CAPACITY: usize = MAX_RECORD_SIZE - HEADER_SIZE;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MsgCommon {
    pub op: u8,
    pub flags: u8,
    pub pad: [u8; 2],
    pub size: u32,
    pub ktime: u64,
}

/// Process identity as laid out on the wire. `ktime` sits at a 4 byte offset,
/// so read fields by value (`{ current.ktime }`), never by reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed(4))]
pub struct MsgCurrent {
    pub pid: u32,
    pub ktime: u64,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct MessageRecord {
    pub common: MsgCommon,
    pub current: MsgCurrent,
    pub pad: [u8; 16],
    pub id: u32,
    pub args: [u8; ARGS_CAPACITY],
}

impl MessageRecord {
    pub const fn zeroed() -> Self {
        MessageRecord {
            common: MsgCommon {
                op: 0,
                flags: 0,
                pad: [0; 2],
                size: 0,
                ktime: 0,
            },
            current: MsgCurrent { pid: 0, ktime: 0 },
            pad: [0; 16],
            id: 0,
            args: [0; ARGS_CAPACITY],
        }
    }

    /// Raw view of the whole record. Callers emit only the first
    /// `common.size` bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `MessageRecord` is `repr(C)`, contains only integers and byte
        // arrays and has no padding (checked below), so every byte is initialised.
        unsafe {
            core::slice::from_raw_parts(
                self as *const MessageRecord as *const u8,
                size_of::<MessageRecord>(),
            )
        }
    }
}

const _: () = {
    assert!(size_of::<MsgCommon>() == 16);
    assert!(offset_of!(MsgCommon, op) == 0);
    assert!(offset_of!(MsgCommon, flags) == 1);
    assert!(offset_of!(MsgCommon, size) == 4);
    assert!(offset_of!(MsgCommon, ktime) == 8);

    assert!(size_of::<MsgCurrent>() == 12);

    assert!(offset_of!(MessageRecord, common) == 0);
    assert!(offset_of!(MessageRecord, current) == 16);
    assert!(offset_of!(MessageRecord, pad) == 28);
    assert!(offset_of!(MessageRecord, id) == 44);
    assert!(offset_of!(MessageRecord, args) == HEADER_SIZE);
    assert!(size_of::<MessageRecord>() == MAX_RECORD_SIZE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_land_at_wire_offsets() {
        let mut record = Box::new(MessageRecord::zeroed());
        record.common.op = MSG_OP_GENERIC_KPROBE;
        record.common.flags = FLAG_RETURN_PROBE;
        record.common.size = 0x0102_0304;
        record.common.ktime = 0x1122_3344_5566_7788;
        record.current = MsgCurrent {
            pid: 0xaabb_ccdd,
            ktime: 0x0a0b_0c0d_0e0f_1011,
        };
        record.id = 7;
        record.args[0] = 0xee;

        let bytes = record.as_bytes();
        assert_eq!(bytes.len(), MAX_RECORD_SIZE);
        assert_eq!(bytes[0], MSG_OP_GENERIC_KPROBE);
        assert_eq!(bytes[1], FLAG_RETURN_PROBE);
        assert_eq!(&bytes[4..8], &0x0102_0304u32.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &0xaabb_ccddu32.to_le_bytes());
        assert_eq!(&bytes[20..28], &0x0a0b_0c0d_0e0f_1011u64.to_le_bytes());
        assert_eq!(&bytes[28..44], &[0u8; 16]);
        assert_eq!(&bytes[44..48], &7u32.to_le_bytes());
        assert_eq!(bytes[HEADER_SIZE], 0xee);
    }

    #[test]
    fn args_fill_the_record_after_the_header() {
        assert_eq!(offset_of!(MessageRecord, args), HEADER_SIZE);
        assert_eq!(HEADER_SIZE + ARGS_CAPACITY, MAX_RECORD_SIZE);
    }
}
