// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// Exercises the kernel heap through Rust's runtime allocation
// types, end to end: boxed values, growing vectors, reuse after
// drop, the aligned path, and the usage accounting.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::panic::PanicInfo;
use kernel::entry_point;
use kernel::memory;

entry_point!(main);

fn main() -> ! {
    kernel::init();

    test_main();
    kernel::halt_loop();
}

#[test_case]
fn boxes_hold_their_values() {
    let first = Box::new(0x2au32);
    let second = Box::new(u64::MAX);
    assert_eq!(*first, 0x2a);
    assert_eq!(*second, u64::MAX);
}

#[test_case]
fn vec_grows_across_reallocations() {
    let mut values = Vec::new();
    for i in 1..=500u64 {
        values.push(i * 2);
    }

    assert_eq!(values.len(), 500);
    assert_eq!(values.iter().sum::<u64>(), 500 * 501);
}

#[test_case]
fn reuse_after_drop() {
    // Allocating and dropping in a loop must not leak: each
    // freed box is coalesced and reused by the next one.
    for i in 0..100_000usize {
        let x = Box::new(i);
        assert_eq!(*x, i);
    }
}

#[repr(align(4096))]
struct PageAligned([u8; 4096]);

#[test_case]
fn page_aligned_allocations() {
    // Layouts with page alignment route through the aligned
    // allocation path.
    let before = memory::used_memory();

    let boxed: Box<PageAligned> = Box::new(PageAligned([0u8; 4096]));
    let addr = &*boxed as *const PageAligned as usize;
    assert_eq!(addr % 4096, 0);

    drop(boxed);
    assert_eq!(memory::used_memory(), before);
}

#[test_case]
fn usage_accounting() {
    let before = memory::used_memory();

    let values: Vec<Box<u64>> = (0..64u64).map(Box::new).collect();
    assert!(memory::used_memory() > before);

    drop(values);
    assert_eq!(memory::used_memory(), before);

    assert_eq!(
        memory::free_memory(),
        memory::total_memory() - memory::used_memory()
    );
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kernel::test_panic_handler(info)
}
