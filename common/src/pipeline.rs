//! Return-path event assembly.
//!
//! [`RetprobePipeline::on_return`] runs once per traced function return:
//! scratch slot, correlation take, argument capture, identity, header, size
//! clamp, emit. It never blocks, loops only over compile-time bounds and
//! reports failures as an [`Outcome`] instead of an error.

use core::ops::DerefMut;

use crate::capture::{transfer_len, write_return_value, ArgumentCapture, ProbeMemory};
use crate::config::CaptureConfig;
use crate::correlation::{thread_key, CorrelationTable, RetprobeEntry};
use crate::identity::ProcessIdentityResolver;
use crate::record::{
    MessageRecord, MsgCommon, FLAG_RETURN_PROBE, HEADER_SIZE, MSG_OP_GENERIC_KPROBE,
};
use crate::size::clamp_total;

pub trait ReturnContext: ProbeMemory {
    fn return_value(&self) -> u64;
    fn pid_tgid(&self) -> u64;
    fn cpu(&self) -> u32;
    fn ktime_ns(&self) -> u64;
}

pub trait ScratchSlots {
    type Slot<'a>: DerefMut<Target = MessageRecord>
    where
        Self: 'a;

    /// `None` only if the slot storage was never set up. The returned record
    /// holds whatever the previous invocation left in it.
    fn acquire(&self, cpu: u32) -> Option<Self::Slot<'_>>;
}

impl<S: ScratchSlots + ?Sized> ScratchSlots for &S {
    type Slot<'a> = S::Slot<'a>
    where
        Self: 'a;

    fn acquire(&self, cpu: u32) -> Option<Self::Slot<'_>> {
        (**self).acquire(cpu)
    }
}

/// Lossy output channel. Delivery failures stay inside the channel.
pub trait EventSink {
    fn emit(&self, record: &[u8]);
}

impl<E: EventSink + ?Sized> EventSink for &E {
    fn emit(&self, record: &[u8]) {
        (**self).emit(record)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Emitted { size: u32 },
    NoSlot,
    NoEntry,
}

pub struct RetprobePipeline<S, C, R, E> {
    pub slots: S,
    pub correlation: C,
    pub identity: R,
    pub sink: E,
}

impl<S, C, R, E> RetprobePipeline<S, C, R, E>
where
    S: ScratchSlots,
    C: CorrelationTable,
    R: ProcessIdentityResolver,
    E: EventSink,
{
    pub const fn new(slots: S, correlation: C, identity: R, sink: E) -> Self {
        RetprobePipeline {
            slots,
            correlation,
            identity,
            sink,
        }
    }

    pub fn on_return<X: ReturnContext + ?Sized>(&self, ctx: &X, probe: &CaptureConfig) -> Outcome {
        let Some(mut slot) = self.slots.acquire(ctx.cpu()) else {
            return Outcome::NoSlot;
        };
        let pid_tgid = ctx.pid_tgid();
        let Some(entry) = self.correlation.take(thread_key(pid_tgid)) else {
            return Outcome::NoEntry;
        };
        let record: &mut MessageRecord = &mut slot;

        let payload = capture_payload(&mut record.args, ctx, probe, ctx.return_value(), &entry);

        record.current = self.identity.resolve((pid_tgid >> 32) as u32).into();
        record.common = MsgCommon {
            op: MSG_OP_GENERIC_KPROBE,
            flags: FLAG_RETURN_PROBE,
            pad: [0; 2],
            size: 0,
            ktime: ctx.ktime_ns(),
        };
        record.pad = [0; 16];
        record.id = probe.probe_id;

        let size = clamp_total(HEADER_SIZE as u64 + payload as u64);
        record.common.size = size;
        self.sink.emit(&record.as_bytes()[..size as usize]);
        Outcome::Emitted { size }
    }
}

/// Fills `args` with the return value (if configured) followed by the
/// buffered argument. Returns the bytes written, at most `args.len()`.
fn capture_payload<M: ProbeMemory + ?Sized>(
    args: &mut [u8],
    memory: &M,
    probe: &CaptureConfig,
    return_value: u64,
    entry: &RetprobeEntry,
) -> usize {
    let mut size = 0;
    if let Some(ty) = probe.return_type {
        size += write_return_value(args, ty, return_value);
    }
    let capture = ArgumentCapture::from_shape(
        probe.shape,
        transfer_len(return_value, probe.return_type),
        entry,
    );
    size += capture.copy_into(&mut args[size..], memory);
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ReadFault;
    use crate::config::{ArgType, CaptureShape};
    use crate::identity::ProcessIdentity;
    use crate::record::ARGS_CAPACITY;
    use std::cell::{RefCell, RefMut};
    use std::collections::HashMap;

    struct OneSlot(Option<RefCell<Box<MessageRecord>>>);

    impl ScratchSlots for OneSlot {
        type Slot<'a> = RefMut<'a, MessageRecord>;

        fn acquire(&self, _cpu: u32) -> Option<Self::Slot<'_>> {
            self.0
                .as_ref()
                .map(|slot| RefMut::map(slot.borrow_mut(), |record| &mut **record))
        }
    }

    #[derive(Default)]
    struct Entries(RefCell<HashMap<u64, RetprobeEntry>>);

    impl CorrelationTable for Entries {
        fn take(&self, key: u64) -> Option<RetprobeEntry> {
            self.0.borrow_mut().remove(&key)
        }
    }

    struct Fixed(Option<ProcessIdentity>);

    impl ProcessIdentityResolver for Fixed {
        fn resolve(&self, _pid: u32) -> Option<ProcessIdentity> {
            self.0
        }
    }

    #[derive(Default)]
    struct Collect(RefCell<Vec<Vec<u8>>>);

    impl EventSink for Collect {
        fn emit(&self, record: &[u8]) {
            self.0.borrow_mut().push(record.to_vec());
        }
    }

    struct Ctx {
        ret: u64,
        memory: Vec<u8>,
    }

    const BUF: u64 = 0x4000;
    const PID_TGID: u64 = (42 << 32) | 43;

    impl ProbeMemory for Ctx {
        fn read(&self, src: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
            let start = src.checked_sub(BUF).ok_or(ReadFault)? as usize;
            let bytes = self
                .memory
                .get(start..start + dst.len())
                .ok_or(ReadFault)?;
            dst.copy_from_slice(bytes);
            Ok(())
        }
    }

    impl ReturnContext for Ctx {
        fn return_value(&self) -> u64 {
            self.ret
        }
        fn pid_tgid(&self) -> u64 {
            PID_TGID
        }
        fn cpu(&self) -> u32 {
            0
        }
        fn ktime_ns(&self) -> u64 {
            1_000
        }
    }

    fn pipeline(
        identity: Option<ProcessIdentity>,
    ) -> RetprobePipeline<OneSlot, Entries, Fixed, Collect> {
        RetprobePipeline::new(
            OneSlot(Some(RefCell::new(Box::new(MessageRecord::zeroed())))),
            Entries::default(),
            Fixed(identity),
            Collect::default(),
        )
    }

    fn entry(pipeline: &RetprobePipeline<OneSlot, Entries, Fixed, Collect>) {
        pipeline.correlation.0.borrow_mut().insert(
            thread_key(PID_TGID),
            RetprobeEntry {
                buffer: BUF,
                count: 0,
            },
        );
    }

    const BUF_PROBE: CaptureConfig = CaptureConfig {
        probe_id: 5,
        return_type: Some(ArgType::SsizeT),
        shape: CaptureShape::CharBuf,
    };

    #[test]
    fn assembles_header_and_payload() {
        let pipeline = pipeline(Some(ProcessIdentity { pid: 42, ktime: 9 }));
        entry(&pipeline);
        let ctx = Ctx {
            ret: 3,
            memory: b"xyz!".to_vec(),
        };

        let outcome = pipeline.on_return(&ctx, &BUF_PROBE);
        let size = HEADER_SIZE + 8 + 3;
        assert_eq!(
            outcome,
            Outcome::Emitted {
                size: size as u32
            }
        );

        let emitted = pipeline.sink.0.borrow();
        let bytes = &emitted[0];
        assert_eq!(bytes.len(), size);
        assert_eq!(bytes[0], MSG_OP_GENERIC_KPROBE);
        assert_eq!(bytes[1], FLAG_RETURN_PROBE);
        assert_eq!(&bytes[4..8], &(size as u32).to_le_bytes());
        assert_eq!(&bytes[8..16], &1_000u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &42u32.to_le_bytes());
        assert_eq!(&bytes[20..28], &9u64.to_le_bytes());
        assert_eq!(&bytes[44..48], &5u32.to_le_bytes());
        assert_eq!(&bytes[48..56], &3u64.to_le_bytes());
        assert_eq!(&bytes[56..], b"xyz");
    }

    #[test]
    fn missing_slot_or_entry_emits_nothing() {
        let mut pipeline = pipeline(None);
        let ctx = Ctx {
            ret: 3,
            memory: vec![0; 8],
        };
        assert_eq!(pipeline.on_return(&ctx, &BUF_PROBE), Outcome::NoEntry);

        entry(&pipeline);
        pipeline.slots = OneSlot(None);
        assert_eq!(pipeline.on_return(&ctx, &BUF_PROBE), Outcome::NoSlot);
        assert!(pipeline.sink.0.borrow().is_empty());
    }

    #[test]
    fn payload_never_exceeds_capacity() {
        let pipeline = pipeline(None);
        entry(&pipeline);
        let ctx = Ctx {
            ret: 20_000,
            memory: vec![0xab; 20_000],
        };
        let outcome = pipeline.on_return(&ctx, &BUF_PROBE);
        assert_eq!(
            outcome,
            Outcome::Emitted {
                size: (HEADER_SIZE + ARGS_CAPACITY) as u32
            }
        );
        let emitted = pipeline.sink.0.borrow();
        assert_eq!(&emitted[0][16..28], &[0u8; 12]);
    }
}
