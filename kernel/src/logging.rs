//! Structured logging backend for the `log` crate facade.
//!
//! Grounded in the teacher's serial console (`serial.rs`): every record is
//! formatted with its level and target and written to COM1. There is no
//! async log buffer here -- at the IRQLs this kernel runs at, a synchronous
//! write guarded by `without_interrupts` (inside `serial::_serial_print`) is
//! simpler and sufficient, matching how the teacher's `print!`/`println!`
//! macros already serialize output.

use log::{Level, LevelFilter, Log, Metadata, Record};

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::serial_println!(
            "[{}] {}: {}",
            level,
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger as the global `log` facade backend.
///
/// Must be called once, early in boot, before any `log::info!`/`log::warn!`
/// call executes. Subsequent calls are no-ops (the `log` crate only allows
/// one logger to be set and returns an error on a second attempt, which we
/// swallow since re-initialization during the same boot is not a fault).
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
