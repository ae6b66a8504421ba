//! Kernel configuration, taken from the boot command line.

use core::str::FromStr;

use log::LevelFilter;

use crate::timer;

/// Tunables that the bootloader can override with `key=value` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Interval between timer interrupts, in milliseconds.
    pub timer_interval_ms: u32,
    /// Pages in each process's kernel stack, not counting the guard page.
    pub kernel_stack_pages: usize,
    /// Pages mapped for a new process's user stack.
    pub user_stack_pages: usize,
    /// Largest program image `exec` will load, in pages.
    pub image_budget_pages: usize,
    /// Most processes that can exist at once, the idle process included.
    pub max_processes: usize,
    pub log_level: LevelFilter,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        timer_interval_ms: 20,
        kernel_stack_pages: 2,
        user_stack_pages: 4,
        image_budget_pages: 256,
        max_processes: 64,
        log_level: if cfg!(debug_assertions) {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        },
    };

    /// Parses whitespace-separated `key=value` tokens over the defaults.
    ///
    /// Tokens without `=` (such as the kernel path GRUB puts first) are ignored.
    /// Unknown keys and out-of-range values are logged and leave the default in
    /// place.
    pub fn from_command_line(line: &str) -> Self {
        let mut config = Self::DEFAULT;
        for token in line.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            let applied = match key {
                "timer_ms" => set(&mut config.timer_interval_ms, value, timer::INTERVAL_RANGE),
                "kstack_pages" => set(&mut config.kernel_stack_pages, value, 1..=16),
                "ustack_pages" => set(&mut config.user_stack_pages, value, 1..=256),
                "image_pages" => set(&mut config.image_budget_pages, value, 1..=4096),
                "max_procs" => set(&mut config.max_processes, value, 2..=1024),
                "log" => LevelFilter::from_str(value)
                    .map(|level| config.log_level = level)
                    .is_ok(),
                _ => {
                    log::warn!("ignoring unknown boot option {key:?}");
                    continue;
                }
            };
            if !applied {
                log::warn!("ignoring invalid value {value:?} for boot option {key:?}");
            }
        }
        config
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn set<T>(field: &mut T, value: &str, range: core::ops::RangeInclusive<T>) -> bool
where
    T: FromStr + PartialOrd,
{
    match value.parse::<T>() {
        Ok(parsed) if range.contains(&parsed) => {
            *field = parsed;
            true
        }
        _ => false,
    }
}
