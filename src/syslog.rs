//! Kernel log backend for the `log` facade.
//!
//! Records are formatted into a bounded ring so late consumers (a
//! console driver, a debugger) can drain recent history. The port's
//! early console can hook `set_sink` to mirror records as they arrive.

use alloc::collections::VecDeque;
use alloc::string::String;
use core::fmt::Write;
use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// Maximum records retained
const RING_CAPACITY: usize = 256;

pub const LEVEL: Level = Level::Debug;

lazy_static::lazy_static! {
    static ref RING: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());
}

/// Optional mirror for formatted records (e.g. the port's serial
/// console)
static SINK: Mutex<Option<fn(&str)>> = Mutex::new(None);

pub fn set_sink(sink: fn(&str)) {
    *SINK.lock() = Some(sink);
}

/// Drain up to `buffer.len()` buffered records
pub fn drain(buffer: &mut [String]) -> usize {
    let mut ring = RING.lock();
    let count = ring.len().min(buffer.len());
    for slot in buffer.iter_mut().take(count) {
        *slot = ring.pop_front().unwrap();
    }
    count
}

struct SystemLogger;

impl log::Log for SystemLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = String::new();
        let uptime = crate::time::uptime_cached();
        let _ = write!(
            line,
            "[{:>6}.{:06}] {:5} {}: {}",
            uptime / 1_000_000,
            uptime % 1_000_000,
            record.level(),
            record.target(),
            record.args()
        );
        if let Some(sink) = *SINK.lock() {
            sink(&line);
        }
        let mut ring = RING.lock();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    fn flush(&self) {}
}

static LOGGER: SystemLogger = SystemLogger;

/// Install the kernel logger. Hosted tests leave the host logger in
/// place.
pub fn enable() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
