// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! time keeps the kernel's clock: a tick counter fed by the
//! 8254 programmable interval timer on IRQ 0.
//!
//! A tick is the kernel's unit of time (10 ms at the configured
//! [`TICKS_PER_SECOND`]). On each one, the handler charges the
//! running process, wakes any sleeper whose deadline has
//! passed, and every [`SCHEDULER_INTERVAL`]th tick asks for a
//! reschedule. [`ticks`] reads the counter; [`sleep`] parks the
//! calling process until a deadline measured in it.

use crate::multitasking::scheduler;
use crate::{interrupts, multitasking};
use core::sync::atomic::{AtomicU64, Ordering};
use x86::io::outb;

/// The timer interrupt rate, in ticks per second.
///
pub const TICKS_PER_SECOND: u64 = 100;

/// The number of ticks between scheduling events.
///
pub const SCHEDULER_INTERVAL: u64 = 10;

// The PIT's input frequency and ports.
const PIT_BASE_FREQUENCY: u32 = 1_193_180;
const PIT_CHANNEL_0: u16 = 0x40;
const PIT_MODE_COMMAND: u16 = 0x43;

// Channel 0, lobyte/hibyte access, square wave mode.
const PIT_COMMAND_SQUARE_WAVE: u8 = 0x36;

// Ticks elapsed since boot. Only the timer handler writes it.
//
static TICKER: AtomicU64 = AtomicU64::new(0);

// Records one more elapsed tick.
//
fn tick() {
    TICKER.fetch_add(1, Ordering::Relaxed);
}

/// Reads the number of ticks elapsed since boot.
///
pub fn ticks() -> u64 {
    TICKER.load(Ordering::Relaxed)
}

/// Starts the PIT at [`TICKS_PER_SECOND`] Hz and installs the
/// timer's IRQ handler.
///
/// The IRQ 0 line is unmasked by the scheduler once it is
/// ready to receive ticks.
///
pub(crate) fn init() {
    program_pit(TICKS_PER_SECOND as u32);
    interrupts::register_irq_handler(0, timer_interrupt_handler);
}

/// The PIT's interrupt handler.
///
/// The handler itself never switches process: it requests a
/// reschedule, which the interrupt dispatcher performs after
/// acknowledging the PIC.
///
fn timer_interrupt_handler(_irq: u8) {
    tick();
    let now = ticks();

    if let Some(current) = multitasking::current_process() {
        current.account_tick();
    }

    if now % SCHEDULER_INTERVAL == 0 {
        scheduler::request_reschedule();
    }

    scheduler::wake_sleepers(now);
}

/// Puts the calling process to sleep for at least the given
/// number of ticks.
///
/// The process wakes no earlier than `ticks` ticks from now,
/// once the timer observes the deadline. Called before the
/// scheduler has started, `sleep` returns immediately.
///
pub fn sleep(ticks: u64) {
    let wake_at = self::ticks() + ticks;
    scheduler::sleep_until(wake_at);
}

// Returns the PIT divisor for the given frequency.
//
fn pit_divisor(frequency: u32) -> u16 {
    (PIT_BASE_FREQUENCY / frequency) as u16
}

// Programs PIT channel 0 with the given frequency.
//
fn program_pit(frequency: u32) {
    let divisor = pit_divisor(frequency);

    unsafe {
        outb(PIT_MODE_COMMAND, PIT_COMMAND_SQUARE_WAVE);
        outb(PIT_CHANNEL_0, (divisor & 0xff) as u8);
        outb(PIT_CHANNEL_0, (divisor >> 8) as u8);
    }
}

// Tests

#[test_case]
fn pit_divisor_for_common_frequencies() {
    assert_eq!(pit_divisor(100), 11931);
    assert_eq!(pit_divisor(1000), 1193);
}

#[test_case]
fn ticker_advances() {
    // The PIT is programmed and IRQ 0 unmasked during kernel
    // init, so the ticker advances on its own. Halting waits
    // for the next interrupt without burning cycles.
    let start = ticks();
    while ticks() <= start {
        unsafe { x86::halt() };
    }

    assert!(ticks() > start);
}

#[test_case]
fn sleep_before_scheduler_start() {
    // With no current process, sleep is a no-op rather than
    // an error.
    sleep(5);
}
