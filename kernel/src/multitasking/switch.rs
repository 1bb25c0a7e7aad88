// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between processes.

use core::arch::global_asm;

global_asm!(include_str!("switch.s"));

// The following function is implemented in switch.s.
//
extern "C" {
    /// switch_stack saves the outgoing process's registers and
    /// stack pointer, then resumes the incoming process from
    /// its saved stack.
    ///
    /// The outgoing registers and an EFLAGS/CS/EIP frame are
    /// pushed onto the current stack, and the resulting stack
    /// pointer is written through `outgoing_stack_pointer`. The
    /// incoming stack must carry the same layout: eight
    /// general-purpose registers below an iretd frame, which is
    /// exactly the layout built for a new process's first
    /// dispatch. Restoring EFLAGS through iretd also restores
    /// the incoming process's interrupt-enable flag.
    ///
    /// If `incoming_cr3` is non-zero and differs from the
    /// current CR3, it is installed before the stacks swap.
    ///
    /// Switching from a process to itself must not reach this
    /// function; the scheduler treats it as a no-op.
    ///
    pub fn switch_stack(outgoing_stack_pointer: *mut u32, incoming_stack_pointer: u32, incoming_cr3: u32);
}
