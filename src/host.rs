//! In-process implementations of the return pipeline's collaborators.
//!
//! These mirror the BPF maps one to one (per-cpu scratch array, correlation
//! hash map, exec and parent tables, perf channel) so the same
//! [`RetprobePipeline`] can run outside the kernel.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use kretsnoop_common::{
    capture::{ProbeMemory, ReadFault},
    correlation::CORRELATION_ENTRIES,
    identity::{AncestorResolver, AncestryWalk, IdentityTable, ProcessIdentity},
    CorrelationTable, EventSink, MessageRecord, RetprobeEntry, RetprobePipeline, ReturnContext,
    ScratchSlots,
};
use tokio::sync::mpsc;

pub type HostPipeline<'a> = RetprobePipeline<
    &'a ScratchPool,
    &'a CorrelationMap,
    AncestorResolver<&'a ProcessTable, &'a ProcessTable>,
    &'a LossyChannel,
>;

pub fn pipeline<'a>(
    slots: &'a ScratchPool,
    correlation: &'a CorrelationMap,
    processes: &'a ProcessTable,
    sink: &'a LossyChannel,
) -> HostPipeline<'a> {
    RetprobePipeline::new(
        slots,
        correlation,
        AncestorResolver::new(processes, processes),
        sink,
    )
}

pub struct ScratchPool {
    slots: Vec<Mutex<Box<MessageRecord>>>,
}

impl ScratchPool {
    pub fn new(contexts: usize) -> Self {
        let slots = (0..contexts)
            .map(|_| Mutex::new(Box::new(MessageRecord::zeroed())))
            .collect();
        ScratchPool { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct SlotGuard<'a>(MutexGuard<'a, Box<MessageRecord>>);

impl Deref for SlotGuard<'_> {
    type Target = MessageRecord;

    fn deref(&self) -> &MessageRecord {
        &self.0
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut MessageRecord {
        &mut self.0
    }
}

impl ScratchSlots for ScratchPool {
    type Slot<'a> = SlotGuard<'a>;

    fn acquire(&self, cpu: u32) -> Option<SlotGuard<'_>> {
        // Contents are undefined on acquire, so poisoning is ignored.
        let slot = self.slots.get(cpu as usize)?;
        Some(SlotGuard(slot.lock().unwrap_or_else(PoisonError::into_inner)))
    }
}

/// Bounded entry/return correlation. When full, inserting a new key evicts the
/// oldest entry, like the LRU map on the BPF side.
pub struct CorrelationMap {
    entries: DashMap<u64, (u64, RetprobeEntry)>,
    clock: AtomicU64,
    capacity: usize,
}

impl Default for CorrelationMap {
    fn default() -> Self {
        Self::with_capacity(CORRELATION_ENTRIES as usize)
    }
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        CorrelationMap {
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, key: u64, entry: RetprobeEntry) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(key, (stamp, entry));
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|item| item.value().0)
            .map(|item| *item.key());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CorrelationTable for CorrelationMap {
    fn take(&self, key: u64) -> Option<RetprobeEntry> {
        self.entries.remove(&key).map(|(_, (_, entry))| entry)
    }
}

#[derive(Default)]
pub struct ProcessTable {
    execs: DashMap<u32, u64>,
    parents: DashMap<u32, u32>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exec(&self, pid: u32, ktime: u64) {
        self.execs.insert(pid, ktime);
    }

    pub fn record_fork(&self, parent: u32, child: u32) {
        self.parents.insert(child, parent);
    }

    pub fn record_exit(&self, pid: u32) {
        self.execs.remove(&pid);
        self.parents.remove(&pid);
    }
}

impl IdentityTable for ProcessTable {
    fn lookup(&self, pid: u32) -> Option<ProcessIdentity> {
        self.execs
            .get(&pid)
            .map(|ktime| ProcessIdentity { pid, ktime: *ktime })
    }
}

impl AncestryWalk for ProcessTable {
    fn parent(&self, pid: u32) -> Option<u32> {
        self.parents.get(&pid).map(|parent| *parent)
    }
}

/// Bounded channel that drops records when full instead of blocking.
pub struct LossyChannel {
    tx: mpsc::Sender<Bytes>,
    lost: AtomicU64,
}

impl LossyChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            LossyChannel {
                tx,
                lost: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl EventSink for LossyChannel {
    fn emit(&self, record: &[u8]) {
        if self.tx.try_send(Bytes::copy_from_slice(record)).is_err() {
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Sparse image of a process' address space.
#[derive(Clone, Debug, Default)]
pub struct MemoryImage {
    regions: BTreeMap<u64, Bytes>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, addr: u64, bytes: impl Into<Bytes>) -> &mut Self {
        self.regions.insert(addr, bytes.into());
        self
    }

    /// Lays out `struct iovec` records at `addr`.
    pub fn map_iovecs(&mut self, addr: u64, iovecs: &[(u64, u64)]) -> &mut Self {
        let raw: Vec<u8> = iovecs
            .iter()
            .flat_map(|(base, len)| base.to_le_bytes().into_iter().chain(len.to_le_bytes()))
            .collect();
        self.map(addr, raw)
    }
}

impl ProbeMemory for MemoryImage {
    fn read(&self, src: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
        let (base, bytes) = self.regions.range(..=src).next_back().ok_or(ReadFault)?;
        let start = (src - base) as usize;
        let bytes = bytes.get(start..start + dst.len()).ok_or(ReadFault)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyntheticReturn {
    pub return_value: u64,
    pub pid_tgid: u64,
    pub cpu: u32,
    pub ktime: u64,
    pub memory: MemoryImage,
}

impl ProbeMemory for SyntheticReturn {
    fn read(&self, src: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
        self.memory.read(src, dst)
    }
}

impl ReturnContext for SyntheticReturn {
    fn return_value(&self) -> u64 {
        self.return_value
    }

    fn pid_tgid(&self) -> u64 {
        self.pid_tgid
    }

    fn cpu(&self) -> u32 {
        self.cpu
    }

    fn ktime_ns(&self) -> u64 {
        self.ktime
    }
}

#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;

    use super::*;

    #[test]
    fn slots_are_per_context() {
        let pool = ScratchPool::new(2);
        let first = pool.acquire(0);
        assert!(first.is_some());
        assert!(pool.acquire(1).is_some());
        assert!(pool.acquire(2).is_none());
        drop(first);
        assert!(pool.acquire(0).is_some());
    }

    #[test]
    fn poisoned_slot_stays_available() {
        let pool = ScratchPool::new(1);
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _slot = pool.acquire(0);
            panic!("invocation failed while holding the slot");
        }));
        assert!(result.is_err());
        assert!(pool.acquire(0).is_some());
    }

    #[test]
    fn full_map_evicts_oldest_entry() {
        let map = CorrelationMap::with_capacity(2);
        let entry = RetprobeEntry::default();
        map.insert(1, entry);
        map.insert(2, entry);
        map.insert(3, entry);
        assert_eq!(map.len(), 2);
        assert_eq!(map.take(1), None);
        assert!(map.take(2).is_some());
        assert!(map.take(3).is_some());
    }

    #[test]
    fn overwriting_a_key_does_not_evict() {
        let map = CorrelationMap::with_capacity(2);
        map.insert(1, RetprobeEntry::default());
        map.insert(2, RetprobeEntry::default());
        let newer = RetprobeEntry {
            buffer: 9,
            count: 0,
        };
        map.insert(2, newer);
        assert!(map.take(1).is_some());
        assert_eq!(map.take(2), Some(newer));
    }

    #[test]
    fn take_consumes_entry() {
        let map = CorrelationMap::new();
        let entry = RetprobeEntry {
            buffer: 1,
            count: 2,
        };
        map.insert(7, entry);
        assert_eq!(map.take(7), Some(entry));
        assert_eq!(map.take(7), None);
        assert!(map.is_empty());
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let (channel, mut rx) = LossyChannel::new(1);
        channel.emit(b"one");
        channel.emit(b"two");
        assert_eq!(channel.lost(), 1);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn memory_image_reads_within_regions() {
        let mut image = MemoryImage::new();
        image.map(0x1000, b"hello".to_vec());
        let mut dst = [0u8; 3];
        assert!(image.read(0x1001, &mut dst).is_ok());
        assert_eq!(&dst, b"ell");
        assert_eq!(image.read(0x1004, &mut dst), Err(ReadFault));
        assert_eq!(image.read(0x10, &mut dst), Err(ReadFault));
    }

    #[test]
    fn exit_forgets_process() {
        let table = ProcessTable::new();
        table.record_exec(5, 50);
        table.record_fork(5, 6);
        assert_eq!(table.parent(6), Some(5));
        table.record_exit(5);
        assert_eq!(table.lookup(5), None);
    }
}
