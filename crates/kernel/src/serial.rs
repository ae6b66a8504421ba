use alloc::boxed::Box;

use crate::console::Console;

/// I/O base of the first serial port.
const COM1: u16 = 0x3F8;

// cSpell:ignore uart
pub fn init(console: &Console) {
    // SAFETY: COM1 is a standard PC port and nothing else in the kernel drives it.
    let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
    port.init();
    console.attach(Box::new(port));
}
