//! Monotonic event counters.

use super::Descriptor;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts events since the router started. Never goes down.
#[derive(Debug)]
pub struct Counter {
    desc: Descriptor,
    total: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn help(&self) -> &'static str {
        self.desc.help
    }

    /// Record one event.
    pub fn inc(&self) {
        self.inc_by(1);
    }

    /// Record `n` events at once, e.g. every entry persisted by one drain.
    pub fn inc_by(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub(super) fn render(&self, out: &mut String) {
        self.desc.header(out, "counter");
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
    }
}
