use crate::record::MsgCurrent;

/// Parent hops tried after the direct lookup misses.
pub const MAX_ANCESTRY_DEPTH: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub ktime: u64,
}

impl From<Option<ProcessIdentity>> for MsgCurrent {
    fn from(identity: Option<ProcessIdentity>) -> Self {
        match identity {
            Some(ProcessIdentity { pid, ktime }) => MsgCurrent { pid, ktime },
            None => MsgCurrent { pid: 0, ktime: 0 },
        }
    }
}

pub trait IdentityTable {
    fn lookup(&self, pid: u32) -> Option<ProcessIdentity>;
}

impl<T: IdentityTable + ?Sized> IdentityTable for &T {
    fn lookup(&self, pid: u32) -> Option<ProcessIdentity> {
        (**self).lookup(pid)
    }
}

/// Fallback used when a process' own exec was not observed.
pub trait AncestryWalk {
    fn parent(&self, pid: u32) -> Option<u32>;
}

impl<A: AncestryWalk + ?Sized> AncestryWalk for &A {
    fn parent(&self, pid: u32) -> Option<u32> {
        (**self).parent(pid)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoAncestry;

impl AncestryWalk for NoAncestry {
    fn parent(&self, _pid: u32) -> Option<u32> {
        None
    }
}

pub trait ProcessIdentityResolver {
    fn resolve(&self, pid: u32) -> Option<ProcessIdentity>;
}

/// Direct lookup, then up to [`MAX_ANCESTRY_DEPTH`] parent hops. The walk
/// stops at the first missing parent, at pid 0, or when a pid is its own parent.
#[derive(Clone, Copy, Debug, Default)]
pub struct AncestorResolver<T, A> {
    pub table: T,
    pub ancestry: A,
}

impl<T, A> AncestorResolver<T, A> {
    pub const fn new(table: T, ancestry: A) -> Self {
        AncestorResolver { table, ancestry }
    }
}

impl<T: IdentityTable, A: AncestryWalk> ProcessIdentityResolver for AncestorResolver<T, A> {
    fn resolve(&self, pid: u32) -> Option<ProcessIdentity> {
        if let Some(identity) = self.table.lookup(pid) {
            return Some(identity);
        }
        let mut pid = pid;
        for _ in 0..MAX_ANCESTRY_DEPTH {
            match self.ancestry.parent(pid) {
                Some(parent) if parent != 0 && parent != pid => pid = parent,
                _ => return None,
            }
            if let Some(identity) = self.table.lookup(pid) {
                return Some(identity);
            }
        }
        None
    }
}

impl<R: ProcessIdentityResolver + ?Sized> ProcessIdentityResolver for &R {
    fn resolve(&self, pid: u32) -> Option<ProcessIdentity> {
        (**self).resolve(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Execs(HashMap<u32, u64>);

    impl IdentityTable for Execs {
        fn lookup(&self, pid: u32) -> Option<ProcessIdentity> {
            self.0.get(&pid).map(|&ktime| ProcessIdentity { pid, ktime })
        }
    }

    struct Parents(HashMap<u32, u32>);

    impl AncestryWalk for Parents {
        fn parent(&self, pid: u32) -> Option<u32> {
            self.0.get(&pid).copied()
        }
    }

    fn chain(len: u32) -> Parents {
        // 100 <- 101 <- 102 <- ...
        Parents((1..len).map(|i| (100 + i, 100 + i - 1)).collect())
    }

    #[test]
    fn direct_hit() {
        let resolver = AncestorResolver::new(Execs([(7, 70)].into()), NoAncestry);
        assert_eq!(
            resolver.resolve(7),
            Some(ProcessIdentity { pid: 7, ktime: 70 })
        );
        assert_eq!(resolver.resolve(8), None);
    }

    #[test]
    fn walks_to_nearest_recorded_ancestor() {
        let execs = Execs([(100, 1), (102, 2)].into());
        let resolver = AncestorResolver::new(execs, chain(10));
        assert_eq!(
            resolver.resolve(104),
            Some(ProcessIdentity { pid: 102, ktime: 2 })
        );
    }

    #[test]
    fn walk_is_bounded() {
        let execs = Execs([(100, 1)].into());
        let resolver = AncestorResolver::new(execs, chain(10));
        assert_eq!(
            resolver.resolve(100 + MAX_ANCESTRY_DEPTH as u32),
            Some(ProcessIdentity { pid: 100, ktime: 1 })
        );
        assert_eq!(resolver.resolve(100 + MAX_ANCESTRY_DEPTH as u32 + 1), None);
    }

    #[test]
    fn walk_stops_on_self_parent_and_zero() {
        let execs = Execs([(0, 5)].into());
        let parents = Parents([(9, 9), (10, 0)].into());
        let resolver = AncestorResolver::new(execs, parents);
        assert_eq!(resolver.resolve(9), None);
        assert_eq!(resolver.resolve(10), None);
    }

    #[test]
    fn missing_identity_zeroes_wire_fields() {
        let current = MsgCurrent::from(None);
        assert_eq!({ current.pid }, 0);
        assert_eq!({ current.ktime }, 0);
    }
}
