#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_smp_processor_id, bpf_ktime_get_ns,
        bpf_probe_read_user_buf,
    },
    macros::{kprobe, kretprobe, map, tracepoint},
    maps::{LruHashMap, PerCpuArray, PerfEventByteArray},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::debug;

use kretsnoop_common::{
    capture::{ProbeMemory, ReadFault},
    config::NO_ARG,
    correlation::CORRELATION_ENTRIES,
    identity::{AncestorResolver, AncestryWalk, IdentityTable, ProcessIdentity},
    thread_key, CorrelationTable, EventSink, MessageRecord, Outcome, ProbeConfig, RetprobeEntry,
    RetprobePipeline, ReturnContext, ScratchSlots,
};

/// Written by the loader before the object is loaded.
#[no_mangle]
static PROBE_CONFIG: ProbeConfig = ProbeConfig::UNSET;

#[map]
static EVENTS: PerfEventByteArray = PerfEventByteArray::new(0);

#[map]
static PROCESS_CALL_HEAP: PerCpuArray<MessageRecord> = PerCpuArray::with_max_entries(1, 0);

#[map]
static RETPROBE_MAP: LruHashMap<u64, RetprobeEntry> =
    LruHashMap::with_max_entries(CORRELATION_ENTRIES, 0);

/// tgid -> exec ktime
#[map]
static EXECVE_MAP: LruHashMap<u32, u64> = LruHashMap::with_max_entries(32768, 0);

/// child pid -> parent tgid
#[map]
static PARENT_MAP: LruHashMap<u32, u32> = LruHashMap::with_max_entries(32768, 0);

// sched_process_fork: parent_comm[16]@8 parent_pid@24 child_comm[16]@28 child_pid@44
const FORK_CHILD_PID_OFFSET: usize = 44;

#[inline(always)]
fn probe_config() -> ProbeConfig {
    unsafe { core::ptr::read_volatile(&PROBE_CONFIG) }
}

struct PerCpuSlot;

impl ScratchSlots for PerCpuSlot {
    type Slot<'a> = &'a mut MessageRecord;

    fn acquire(&self, _cpu: u32) -> Option<Self::Slot<'_>> {
        // The per-cpu entry is only touched by the invocation running on this
        // cpu, and the reference is dropped before the program returns.
        PROCESS_CALL_HEAP
            .get_ptr_mut(0)
            .map(|record| unsafe { &mut *record })
    }
}

struct RetprobeMap<'a, C>(&'a C);

impl<C: EbpfContext> CorrelationTable for RetprobeMap<'_, C> {
    fn take(&self, key: u64) -> Option<RetprobeEntry> {
        let entry = unsafe { RETPROBE_MAP.get(&key) }.copied()?;
        if let Err(e) = RETPROBE_MAP.remove(&key) {
            debug!(self.0, "retprobe map remove failed: {}", e);
        }
        Some(entry)
    }
}

struct ExecveMap;

impl IdentityTable for ExecveMap {
    fn lookup(&self, pid: u32) -> Option<ProcessIdentity> {
        let ktime = unsafe { EXECVE_MAP.get(&pid) }.copied()?;
        Some(ProcessIdentity { pid, ktime })
    }
}

struct ParentMap;

impl AncestryWalk for ParentMap {
    fn parent(&self, pid: u32) -> Option<u32> {
        unsafe { PARENT_MAP.get(&pid) }.copied()
    }
}

struct PerfSink<'a, C>(&'a C);

impl<C: EbpfContext> EventSink for PerfSink<'_, C> {
    fn emit(&self, record: &[u8]) {
        EVENTS.output(self.0, record, 0);
    }
}

struct RetCtx<'a>(&'a RetProbeContext);

impl ProbeMemory for RetCtx<'_> {
    fn read(&self, src: u64, dst: &mut [u8]) -> Result<(), ReadFault> {
        unsafe { bpf_probe_read_user_buf(src as *const u8, dst) }.map_err(|_| ReadFault)
    }
}

impl ReturnContext for RetCtx<'_> {
    fn return_value(&self) -> u64 {
        self.0.ret::<u64>().unwrap_or(0)
    }

    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    fn cpu(&self) -> u32 {
        unsafe { bpf_get_smp_processor_id() }
    }

    fn ktime_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }
}

#[kprobe]
pub fn generic_kprobe(ctx: ProbeContext) -> u32 {
    match try_generic_kprobe(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn entry_arg(ctx: &ProbeContext, index: u32) -> u64 {
    if index == NO_ARG {
        return 0;
    }
    ctx.arg::<u64>(index as usize).unwrap_or(0)
}

fn try_generic_kprobe(ctx: &ProbeContext) -> Result<u32, u32> {
    let config = probe_config();
    let entry = RetprobeEntry {
        buffer: entry_arg(ctx, config.buffer_arg),
        count: entry_arg(ctx, config.count_arg),
    };
    let key = thread_key(bpf_get_current_pid_tgid());

    RETPROBE_MAP.insert(&key, &entry, 0).map_err(|e| {
        debug!(ctx, "retprobe map insert failed: {}", e);
        1u32
    })?;
    Ok(0)
}

#[kretprobe]
pub fn generic_retkprobe(ctx: RetProbeContext) -> u32 {
    let probe = probe_config().capture();
    let pipeline = RetprobePipeline::new(
        PerCpuSlot,
        RetprobeMap(&ctx),
        AncestorResolver::new(ExecveMap, ParentMap),
        PerfSink(&ctx),
    );

    if let Outcome::NoSlot = pipeline.on_return(&RetCtx(&ctx), &probe) {
        debug!(&ctx, "scratch slot unavailable");
    }
    0
}

#[tracepoint]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    match try_sched_process_exec(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn try_sched_process_exec(_ctx: &TracePointContext) -> Result<u32, u32> {
    let tgid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let ktime = unsafe { bpf_ktime_get_ns() };
    EXECVE_MAP
        .insert(&tgid, &ktime, 0)
        .map_err(|e| e as u32)?;
    Ok(0)
}

#[tracepoint]
pub fn sched_process_fork(ctx: TracePointContext) -> u32 {
    match try_sched_process_fork(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn try_sched_process_fork(ctx: &TracePointContext) -> Result<u32, u32> {
    let parent = (bpf_get_current_pid_tgid() >> 32) as u32;
    let child: u32 = unsafe { ctx.read_at(FORK_CHILD_PID_OFFSET) }.map_err(|e| e as u32)?;
    PARENT_MAP
        .insert(&child, &parent, 0)
        .map_err(|e| e as u32)?;
    Ok(0)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
