//! COM1 serial output, the kernel's sole console on this platform.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort as Uart16550;

lazy_static! {
    static ref SERIAL1: Mutex<Uart16550> = {
        // SAFETY: 0x3F8 is the standard COM1 I/O base address.
        let mut port = unsafe { Uart16550::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    use core::fmt::Write;
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("printing to serial port failed");
    });
}
