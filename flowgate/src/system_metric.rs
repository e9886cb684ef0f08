//! Process memory sampling for memory adaptive rules.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;
use tracing::warn;

use crate::clock::Clock;

/// Source of the current process memory usage, in bytes.
pub trait MemoryProbe: Send + Sync + std::fmt::Debug {
    /// `None` when no sample is available.
    fn current_memory_usage(&self) -> Option<i64>;
}

/// Reads the resident set size of this process through `sysinfo`.
///
/// A sample is reused until it is older than the collect interval.
#[derive(Debug)]
pub struct SysinfoMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
    collect_interval_ms: u64,
    cached: Mutex<Option<(u64, i64)>>,
    clock: Clock,
}

impl SysinfoMemoryProbe {
    pub fn new(collect_interval_ms: u64, clock: Clock) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(%err, "cannot determine the current pid, memory usage is unavailable");
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
            collect_interval_ms,
            cached: Mutex::new(None),
            clock,
        }
    }

    fn sample(&self, pid: Pid) -> Option<i64> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| i64::try_from(process.memory()).unwrap_or(i64::MAX))
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn current_memory_usage(&self) -> Option<i64> {
        let pid = self.pid?;
        let now = self.clock.now_ms();
        if let Some((at, bytes)) = *self.cached.lock()
            && now.saturating_sub(at) < self.collect_interval_ms
        {
            return Some(bytes);
        }
        let bytes = self.sample(pid)?;
        *self.cached.lock() = Some((now, bytes));
        Some(bytes)
    }
}

/// A probe reporting whatever was last stored in it.
#[derive(Debug)]
pub struct FixedMemoryProbe {
    bytes: AtomicI64,
}

impl FixedMemoryProbe {
    pub fn new(bytes: Option<i64>) -> Self {
        let probe = Self {
            bytes: AtomicI64::new(-1),
        };
        probe.set(bytes);
        probe
    }

    pub fn set(&self, bytes: Option<i64>) {
        self.bytes
            .store(bytes.filter(|b| *b >= 0).unwrap_or(-1), Ordering::Release);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn current_memory_usage(&self) -> Option<i64> {
        let bytes = self.bytes.load(Ordering::Acquire);
        (bytes >= 0).then_some(bytes)
    }
}
