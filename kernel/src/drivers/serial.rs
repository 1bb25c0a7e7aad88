// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! serial drives the UART on COM1, the kernel's logging console.
//!
//! All kernel text output funnels through the [`print!`] and
//! [`println!`] macros defined here, so early boot messages, panic
//! reports and the test harness all share one device. The port
//! lives behind a spin mutex and is only ever held with interrupts
//! masked, which keeps a logging interrupt handler from deadlocking
//! against whoever it interrupted.

use crate::interrupts::without_interrupts;
use crate::Guarded;
use core::fmt;
use core::fmt::Write;
use x86::io::{inb, outb};

// UART 16550 register offsets from the base port.
const DATA: u16 = 0;
const INTERRUPT_ENABLE: u16 = 1;
const FIFO_CONTROL: u16 = 2;
const LINE_CONTROL: u16 = 3;
const MODEM_CONTROL: u16 = 4;
const LINE_STATUS: u16 = 5;

// Line status bit indicating the transmit buffer is empty.
const TRANSMIT_EMPTY: u8 = 1 << 5;

/// Represents a UART 16550 serial device, addressed
/// over port I/O.
///
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// Returns a serial port for the device with the
    /// given base port address.
    ///
    /// # Safety
    ///
    /// The caller must ensure the base address is a
    /// serial device.
    ///
    pub const unsafe fn new(base: u16) -> SerialPort {
        SerialPort { base }
    }

    /// Configures the device: 38,400 baud, 8 data bits,
    /// no parity, one stop bit, FIFOs enabled.
    ///
    pub fn init(&mut self) {
        unsafe {
            outb(self.base + INTERRUPT_ENABLE, 0x00); // Disable interrupts.
            outb(self.base + LINE_CONTROL, 0x80); // Enable the divisor latch.
            outb(self.base + DATA, 0x03); // Divisor low byte (38,400 baud).
            outb(self.base + INTERRUPT_ENABLE, 0x00); // Divisor high byte.
            outb(self.base + LINE_CONTROL, 0x03); // 8 bits, no parity, one stop bit.
            outb(self.base + FIFO_CONTROL, 0xc7); // Enable and clear the FIFOs.
            outb(self.base + MODEM_CONTROL, 0x0b); // Assert DTR, RTS and OUT2.
        }
    }

    /// Writes a single byte to the device, spinning
    /// until the transmit buffer has space.
    ///
    pub fn send(&mut self, byte: u8) {
        unsafe {
            while inb(self.base + LINE_STATUS) & TRANSMIT_EMPTY == 0 {}
            outb(self.base + DATA, byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }

        Ok(())
    }
}

// The logging console. Base port 0x3f8 is COM1 on every PC.
//
static COM1: Guarded<SerialPort> = Guarded::new(unsafe { SerialPort::new(0x3f8) });

/// Configures COM1 for kernel logging.
///
pub fn init() {
    with_com1(|com1| com1.init());
}

/// Runs the given closure with exclusive access to COM1.
///
/// Interrupts are masked while the port is held, so a handler
/// cannot deadlock against the lock.
///
pub fn with_com1<F, R>(f: F) -> R
where
    F: FnOnce(&mut SerialPort) -> R,
{
    without_interrupts(|| f(&mut *COM1.lock()))
}

// The macros funnel through this helper, which formats the
// arguments while holding the console.
//
#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    with_com1(|com1| {
        com1.write_fmt(args).expect("COM1 write failed");
    });
}

/// Writes formatted text to the serial console.
///
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::drivers::serial::_print(format_args!($($arg)*))
    };
}

/// Writes formatted text to the serial console, followed by a
/// newline.
///
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}
