/// Unique process identity within a node.
///
/// A bare pid is not stable: the kernel recycles pid numbers, so all
/// per-process state is keyed by the (agent id, pid, start time) tuple.
/// A pid whose start time changed is a different process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Upid {
    /// Node-local agent id (ASID). Constant for the lifetime of the agent.
    pub asid: u32,
    pub pid: u32,
    /// Process start time in nanoseconds since boot.
    pub start_time_ns: u64,
}

impl Upid {
    pub fn new(asid: u32, pid: u32, start_time_ns: u64) -> Self {
        Self {
            asid,
            pid,
            start_time_ns,
        }
    }
}

impl std::fmt::Display for Upid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.asid, self.pid, self.start_time_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_pid_reuse_is_distinct() {
        let a = Upid::new(1, 42, 1_000);
        let b = Upid::new(1, 42, 2_000);
        assert_ne!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.contains(&b));
    }

    #[test]
    fn test_display() {
        let u = Upid::new(7, 12345, 99);
        assert_eq!(u.to_string(), "7:12345:99");
    }
}
