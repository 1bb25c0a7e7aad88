// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! kernel implements the core of a small educational kernel for
//! 32-bit x86 in protected mode, on a single CPU.
//!
//! The kernel consists of four tightly-coupled subsystems, plus the
//! thin collaborators they expose interfaces to:
//!
//! - [`memory`]: a first-fit heap allocator with splitting and
//!   adjacent coalescing, which also backs Rust's `alloc` types.
//! - [`memory::paging`]: two-level page tables, page mapping and
//!   per-process address spaces.
//! - [`interrupts`]: IDT construction, the legacy PIC pair, IRQ
//!   dispatch and the `int 0x80` system call gateway.
//! - [`multitasking`]: preemptive processes with a multilevel
//!   feedback queue policy, driven by the PIT through [`time`].
//!
//! [`init`] brings the subsystems up in dependency order. After that,
//! the kernel's initial thread hands control to
//! [`multitasking::scheduler::start`], becoming the idle process.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(alloc_error_handler)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

pub mod boot;
pub mod drivers;
pub mod filesystem;
pub mod interrupts;
pub mod memory;
pub mod multitasking;
pub mod time;

/// init sets up critical core functions of the kernel.
///
/// The order matters: the heap underlies the page tables and the
/// process control blocks, paging underlies the per-process address
/// spaces, and the interrupt core must be ready before the scheduler
/// installs its timer handler.
///
pub fn init() {
    drivers::serial::init();

    unsafe { memory::init(memory::kernel_heap_start(), memory::KERNEL_HEAP_SIZE) };
    memory::paging::init();

    interrupts::init();
    filesystem::init();

    multitasking::init();
    interrupts::syscall::register_defaults();

    interrupts::enable();
}

#[alloc_error_handler]
fn alloc_error_handler(layout: alloc::alloc::Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout)
}

/// Stops doing useful work forever, waking only to service
/// interrupts.
///
pub fn halt_loop() -> ! {
    loop {
        unsafe { x86::halt() };
    }
}

/// A value behind a spin mutex, owned by this crate.
///
/// `spin::Mutex` is foreign, so coherence forbids implementing
/// foreign traits (such as `GlobalAlloc`) for locked values
/// directly. Wrapping the mutex in a local type lifts that
/// restriction; otherwise `Guarded` behaves exactly like the
/// mutex it wraps.
///
pub struct Guarded<T> {
    value: spin::Mutex<T>,
}

impl<T> Guarded<T> {
    pub const fn new(value: T) -> Guarded<T> {
        Guarded {
            value: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<T> {
        self.value.lock()
    }
}

/// A unit test picked up by the `#[test_case]` attribute.
///
/// The blanket implementation below covers plain functions, so a
/// test is just a function; its type name doubles as the reported
/// test name.
///
pub trait KernelTest {
    fn run(&self);
}

impl<F> KernelTest for F
where
    F: Fn(),
{
    fn run(&self) {
        print!("test {} ... ", core::any::type_name::<F>());
        self();
        println!("ok");
    }
}

/// Runs every registered test in sequence, then shuts the
/// emulator down with a success status.
///
/// A failing test never reaches the shutdown here: its panic is
/// routed through [`test_panic_handler`] instead.
///
pub fn test_runner(tests: &[&dyn KernelTest]) {
    println!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    println!("test result: ok.");
    exit_qemu(ExitCode::Success);
}

/// Reports a test panic on the serial console and shuts the
/// emulator down with a failure status.
///
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    println!("FAILED");
    println!("{}", info);
    exit_qemu(ExitCode::Failure);
    halt_loop();
}

// The port of QEMU's isa-debug-exit device.
const ISA_DEBUG_EXIT_PORT: u16 = 0xf4;

/// A status reported to the host when the kernel shuts the
/// emulator down.
///
/// QEMU turns a value written to the isa-debug-exit device into
/// the process exit status `(value << 1) | 1`, so neither variant
/// can collide with QEMU's own exit statuses.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExitCode {
    Success = 0x10,
    Failure = 0x11,
}

/// Shuts the emulator down, reporting the given status through
/// the isa-debug-exit device.
///
/// On real hardware the write hits an unused port and execution
/// simply continues.
///
pub fn exit_qemu(code: ExitCode) {
    unsafe {
        x86::io::outl(ISA_DEBUG_EXIT_PORT, code as u32);
    }
}

#[cfg(test)]
entry_point!(test_kmain);

/// Entry point for the kernel's unit test binary.
///
#[cfg(test)]
fn test_kmain() -> ! {
    init();
    test_main();
    halt_loop();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}
