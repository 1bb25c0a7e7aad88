// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! boot contains the kernel's entry sequence.
//!
//! The kernel is loaded by a Multiboot loader, which leaves the CPU
//! in 32-bit protected mode with interrupts disabled and paging off.
//! The assembly stub in `boot.s` installs a flat GDT (kernel code at
//! selector 0x08, kernel data at 0x10), sets up the boot stack and
//! calls the Rust entry declared with [`entry_point!`].
//!
//! The boot stack later becomes the idle process's stack when the
//! kernel's initial thread hands over to the scheduler.

use core::arch::global_asm;

global_asm!(include_str!("boot.s"));

/// The code segment selector installed by the boot stub.
///
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// The data segment selector installed by the boot stub.
///
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// entry_point declares the typed Rust entry point called by the
/// boot stub.
///
/// The given function must never return. Declaring the entry through
/// this macro (rather than exporting `kernel_main` by hand) ensures
/// the entry has the right signature.
///
#[macro_export]
macro_rules! entry_point {
    ($path:path) => {
        #[export_name = "kernel_main"]
        pub extern "C" fn __kernel_entry(magic: u32, multiboot_info: u32) -> ! {
            // Validate the signature at compile time.
            let entry: fn() -> ! = $path;

            // The Multiboot information structure is unused: the heap
            // region is derived from the linker script instead.
            let _ = (magic, multiboot_info);

            entry()
        }
    };
}
