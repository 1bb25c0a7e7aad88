// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// This is the entry point for the kernel, which runs the
// kernel's standard initialisation, starts the first process,
// and hands the initial thread over to the scheduler.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;
use kernel::multitasking::{create_process, scheduler, Priority};
use kernel::{entry_point, memory, println, time};

/// This function is called on panic.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);

    kernel::halt_loop();
}

entry_point!(kmain);

fn kmain() -> ! {
    println!("Kernel booting...");

    kernel::init();

    println!("Kernel ready!");
    memory::debug();

    create_process("init", init_process, Priority::Normal).expect("failed to create init process");

    // Hand over to the scheduler, becoming the idle process.
    scheduler::start();
}

/// The first process. There is no userspace yet, so it just
/// demonstrates that scheduling, sleeping and the system call
/// gateway work, then exits.
///
fn init_process() -> ! {
    println!("init: running as pid {:?}", kernel::multitasking::current_pid());

    let uptime = time::ticks();
    time::sleep(100);
    println!(
        "init: slept for {} ticks",
        time::ticks() - uptime
    );

    scheduler::debug();

    kernel::multitasking::exit(0);
}
