/// Capacity of the correlation map. Entries whose return never fires are
/// evicted least recently used first.
pub const CORRELATION_ENTRIES: u32 = 10240;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RetprobeEntry {
    /// User address of the buffer (or iovec array) argument, `0` if none.
    pub buffer: u64,
    pub count: u64,
}

/// Key shared by the entry and return probes. Both sides must derive it the
/// same way from `bpf_get_current_pid_tgid()`.
#[inline(always)]
pub const fn thread_key(pid_tgid: u64) -> u64 {
    pid_tgid
}

pub trait CorrelationTable {
    /// Looks up and removes the entry for `key`. A miss is a normal outcome:
    /// the entry probe skipped this call, or the entry was already consumed.
    fn take(&self, key: u64) -> Option<RetprobeEntry>;
}

impl<T: CorrelationTable + ?Sized> CorrelationTable for &T {
    fn take(&self, key: u64) -> Option<RetprobeEntry> {
        (**self).take(key)
    }
}
