//! Defines the kernel console that carries the log.

use alloc::boxed::Box;
use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use log::LevelFilter;
use spin::{Mutex, Once};

/// Somewhere log lines can go.
pub type Output = Box<dyn Write + Send>;

pub struct Console {
    has_output: AtomicBool,
    output: Mutex<Option<Output>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    pub const fn new() -> Self {
        Self {
            has_output: AtomicBool::new(false),
            output: Mutex::new(None),
        }
    }

    /// Installs the global console as the logger.
    pub fn init(level: LevelFilter) -> &'static Self {
        let console = Self::global();
        console.install(level);
        console
    }

    pub fn global() -> &'static Self {
        DEFAULT.call_once(Console::new)
    }

    pub fn install(&'static self, level: LevelFilter) {
        if log::set_logger(self).is_err() {
            log::warn!("a logger is already installed");
        }
        log::set_max_level(level);
    }

    pub fn has_output(&self) -> bool {
        self.has_output.load(Ordering::SeqCst)
    }

    /// Sends every following line to `output`, replacing the previous one.
    pub fn attach(&self, output: Output) {
        let mut guard = self.output.lock();
        *guard = Some(output);
        self.has_output.store(true, Ordering::SeqCst);
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for Console {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if let Some(output) = &mut *self.output.lock() {
            // There is nowhere to report a failed write.
            let _ = write_log_entry_to(output.as_mut(), record);
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(writer: &mut dyn Write, record: &log::Record) -> core::fmt::Result {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
