//! The 8253/8254 programmable interval timer, channel 0.

use core::ops::RangeInclusive;

use crate::arch;

pub const BASE_FREQUENCY_HZ: u32 = 1_193_182;

/// Intervals that fit the 16-bit reload register.
pub const INTERVAL_RANGE: RangeInclusive<u32> = 1..=54;

const CHANNEL0_PORT: u16 = 0x40;
const COMMAND_PORT: u16 = 0x43;

const COMMAND_CHANNEL0: u8 = 0x00;
const COMMAND_ACCESS_LOHI: u8 = 0x30;
const COMMAND_MODE_SQUARE: u8 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    IntervalOutOfRange { ms: u32 },
}

impl core::fmt::Display for TimerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TimerError::IntervalOutOfRange { ms } => write!(
                f,
                "timer interval {ms} ms is outside {}..={} ms",
                INTERVAL_RANGE.start(),
                INTERVAL_RANGE.end()
            ),
        }
    }
}

/// Returns the reload value that makes channel 0 fire every `ms` milliseconds.
pub fn divisor_for(ms: u32) -> Result<u16, TimerError> {
    if !INTERVAL_RANGE.contains(&ms) {
        return Err(TimerError::IntervalOutOfRange { ms });
    }
    Ok((BASE_FREQUENCY_HZ as u64 * ms as u64 / 1000) as u16)
}

/// The periodic tick source.
#[derive(Debug, Default)]
pub struct Timer {
    interval_ms: u32,
    ticks: u64,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            interval_ms: 0,
            ticks: 0,
        }
    }

    /// Programs channel 0 as a square-wave generator with the given period.
    pub fn set_interval(&mut self, ms: u32) -> Result<(), TimerError> {
        let divisor = divisor_for(ms)?;
        // SAFETY: These ports belong to the PIT and nothing else drives it.
        unsafe {
            arch::write_port8(
                COMMAND_PORT,
                COMMAND_CHANNEL0 | COMMAND_ACCESS_LOHI | COMMAND_MODE_SQUARE,
            );
            arch::write_port8(CHANNEL0_PORT, (divisor & 0xFF) as u8);
            arch::write_port8(CHANNEL0_PORT, (divisor >> 8) as u8);
        }
        self.interval_ms = ms;
        log::debug!("PIT: tick every {ms} ms (divisor {divisor})");
        Ok(())
    }

    /// Counts one timer interrupt.
    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Returns the time since the timer was started, in milliseconds.
    pub fn uptime_ms(&self) -> u64 {
        self.ticks * self.interval_ms as u64
    }
}
