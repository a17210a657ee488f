//! Gauges for in-flight work.

use super::Descriptor;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, Ordering};

/// Current level of some in-flight work plus the highest level reached.
///
/// The peak lets tests check that no more than one drain ran per partition
/// without sampling the gauge at the right instant.
#[derive(Debug)]
pub struct Gauge {
    desc: Descriptor,
    level: AtomicI64,
    high_water: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            level: AtomicI64::new(0),
            high_water: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc.name
    }

    pub fn help(&self) -> &'static str {
        self.desc.help
    }

    /// Raise the level by one, returning the new level.
    pub fn inc(&self) -> i64 {
        let level = self.level.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(level, Ordering::SeqCst);
        level
    }

    pub fn dec(&self) {
        self.level.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.level.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> i64 {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Count one unit of work until the returned guard is dropped.
    pub fn track(&self) -> GaugeGuard<'_> {
        self.inc();
        GaugeGuard { gauge: self }
    }

    pub(super) fn render(&self, out: &mut String) {
        self.desc.header(out, "gauge");
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
        let _ = writeln!(out, "{}_peak {}", self.desc.name, self.peak());
    }
}

/// Lowers its gauge when dropped.
#[derive(Debug)]
pub struct GaugeGuard<'a> {
    gauge: &'a Gauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
