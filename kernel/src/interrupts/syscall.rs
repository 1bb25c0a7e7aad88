// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! syscall implements the software-interrupt system call gateway.
//!
//! A process requests a system call by raising interrupt 0x80 with
//! the call number in `eax` and up to three integer arguments in
//! `ebx`, `ecx` and `edx`. The result is returned in `eax`. An
//! unknown call number returns −1.
//!
//! The standard calls are listed in [`Syscall`] and installed by
//! [`register_defaults`]: file calls are forwarded to the
//! [`filesystem`](crate::filesystem) collaborator, `exit` ends the
//! calling process, and the unimplemented `fork` and `exec` return
//! −1.

use super::{register_interrupt_handler, InterruptContext};
use crate::drivers::serial;
use crate::{filesystem, multitasking};
use core::fmt::Write;
use core::{slice, str};

/// The interrupt vector reserved for system calls.
///
pub const SYSCALL_VECTOR: u8 = 0x80;

// File descriptors 0-2 are the standard streams; filesystem
// descriptors begin above them.
const STDIN: u32 = 0;
const STDOUT: u32 = 1;
const STDERR: u32 = 2;
const FIRST_FILE_FD: u32 = 3;

/// Represents a system call handler function, receiving the
/// three integer arguments.
///
pub type SyscallHandler = fn(u32, u32, u32) -> i32;

/// SYSCALL_HANDLERS holds the installed system calls, indexed
/// by call number.
///
static SYSCALL_HANDLERS: spin::Mutex<[Option<SyscallHandler>; 256]> =
    spin::Mutex::new([None; 256]);

/// The set of standard system calls.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Syscall {
    /// Read from a file descriptor into a buffer.
    Read = 0,

    /// Write a buffer to a file descriptor.
    Write = 1,

    /// Open a path, returning a file descriptor.
    Open = 2,

    /// Close a file descriptor.
    Close = 3,

    /// Duplicate the current process (not yet implemented).
    Fork = 4,

    /// Replace the current process image (not yet implemented).
    Exec = 5,

    /// End the current process.
    Exit = 6,
}

impl Syscall {
    /// Returns the syscall with the given numerical value
    /// or None.
    ///
    pub fn from_u32(num: u32) -> Option<Self> {
        match num {
            0 => Some(Syscall::Read),
            1 => Some(Syscall::Write),
            2 => Some(Syscall::Open),
            3 => Some(Syscall::Close),
            4 => Some(Syscall::Fork),
            5 => Some(Syscall::Exec),
            6 => Some(Syscall::Exit),
            _ => None,
        }
    }
}

// Registers the gateway's generic interrupt handler.
//
pub(super) fn init() {
    register_interrupt_handler(SYSCALL_VECTOR, handle_syscall);
}

/// Sets the handler for the given system call number.
///
pub fn register_syscall(num: u8, handler: SyscallHandler) {
    super::without_interrupts(|| {
        SYSCALL_HANDLERS.lock()[num as usize] = Some(handler);
    });
}

// The gateway: dispatches by eax and places the result back
// in the saved eax, which the stub restores on return.
//
fn handle_syscall(context: &mut InterruptContext) {
    let handler = if context.eax < 256 {
        SYSCALL_HANDLERS.lock()[context.eax as usize]
    } else {
        None
    };

    let result = match handler {
        Some(handler) => handler(context.ebx, context.ecx, context.edx),
        None => -1,
    };

    context.eax = result as u32;
}

/// Installs the standard system calls.
///
pub fn register_defaults() {
    register_syscall(Syscall::Read as u8, sys_read);
    register_syscall(Syscall::Write as u8, sys_write);
    register_syscall(Syscall::Open as u8, sys_open);
    register_syscall(Syscall::Close as u8, sys_close);
    register_syscall(Syscall::Fork as u8, sys_fork);
    register_syscall(Syscall::Exec as u8, sys_exec);
    register_syscall(Syscall::Exit as u8, sys_exit);
}

// Reads the NUL-terminated string the caller passed by
// address. Returns None for a null pointer, a string longer
// than 255 bytes, or invalid UTF-8.
//
unsafe fn user_str<'a>(addr: u32) -> Option<&'a str> {
    if addr == 0 {
        return None;
    }

    let start = addr as *const u8;
    let mut len = 0usize;
    while len < 256 {
        if start.add(len).read() == 0 {
            let bytes = slice::from_raw_parts(start, len);
            return str::from_utf8(bytes).ok();
        }

        len += 1;
    }

    None
}

fn sys_read(fd: u32, buffer: u32, size: u32) -> i32 {
    if buffer == 0 {
        return -1;
    }

    let buf = unsafe { slice::from_raw_parts_mut(buffer as *mut u8, size as usize) };
    match fd {
        // There is no input device, so the standard input
        // is permanently at end-of-file.
        STDIN => 0,
        STDOUT | STDERR => -1,
        _ => match filesystem::read((fd - FIRST_FILE_FD) as usize, buf) {
            Some(n) => n as i32,
            None => -1,
        },
    }
}

fn sys_write(fd: u32, buffer: u32, size: u32) -> i32 {
    if buffer == 0 {
        return -1;
    }

    let buf = unsafe { slice::from_raw_parts(buffer as *const u8, size as usize) };
    match fd {
        STDIN => -1,
        // The standard streams go to the serial console.
        STDOUT | STDERR => match str::from_utf8(buf) {
            Ok(text) => {
                serial::with_com1(|com1| com1.write_str(text).ok());
                size as i32
            }
            Err(_) => -1,
        },
        _ => match filesystem::write((fd - FIRST_FILE_FD) as usize, buf) {
            Some(n) => n as i32,
            None => -1,
        },
    }
}

fn sys_open(path: u32, mode: u32, _unused: u32) -> i32 {
    let path = match unsafe { user_str(path) } {
        Some(path) => path,
        None => return -1,
    };

    let mode = match filesystem::OpenMode::from_bits(mode) {
        Some(mode) => mode,
        None => return -1,
    };

    match filesystem::open(path, mode) {
        Some(fd) => (fd as u32 + FIRST_FILE_FD) as i32,
        None => -1,
    }
}

fn sys_close(fd: u32, _unused1: u32, _unused2: u32) -> i32 {
    if fd < FIRST_FILE_FD {
        return -1;
    }

    match filesystem::close((fd - FIRST_FILE_FD) as usize) {
        Some(()) => 0,
        None => -1,
    }
}

fn sys_fork(_unused1: u32, _unused2: u32, _unused3: u32) -> i32 {
    // Not yet implemented.
    -1
}

fn sys_exec(_path: u32, _argv: u32, _unused: u32) -> i32 {
    // Not yet implemented.
    -1
}

fn sys_exit(status: u32, _unused1: u32, _unused2: u32) -> i32 {
    multitasking::exit(status as i32)
}

// Tests

#[cfg(test)]
use core::arch::asm;

// Raises int 0x80 with the given call number and arguments,
// returning the result from eax.
//
#[cfg(test)]
fn raw_syscall(num: u32, arg1: u32, arg2: u32, arg3: u32) -> i32 {
    let result: i32;
    unsafe {
        asm!(
            "int 0x80",
            inout("eax") num => result,
            in("ebx") arg1,
            in("ecx") arg2,
            in("edx") arg3,
        )
    };

    result
}

#[test_case]
fn syscall_write_to_console() {
    register_defaults();

    let message = b"hello";
    let written = raw_syscall(
        Syscall::Write as u32,
        STDOUT,
        message.as_ptr() as u32,
        message.len() as u32,
    );

    assert_eq!(written, 5);
}

#[test_case]
fn syscall_unknown_number() {
    register_defaults();

    assert_eq!(raw_syscall(0xff, 0, 0, 0), -1);
    assert_eq!(raw_syscall(0x1_0000, 0, 0, 0), -1);
}

#[test_case]
fn syscall_fork_exec_unimplemented() {
    register_defaults();

    assert_eq!(raw_syscall(Syscall::Fork as u32, 0, 0, 0), -1);
    assert_eq!(raw_syscall(Syscall::Exec as u32, 0, 0, 0), -1);
}

#[test_case]
fn syscall_file_round_trip() {
    register_defaults();

    let path = b"/notes.txt\0";
    let mode = (filesystem::OpenMode::READ
        | filesystem::OpenMode::WRITE
        | filesystem::OpenMode::CREATE)
        .bits();
    let fd = raw_syscall(Syscall::Open as u32, path.as_ptr() as u32, mode, 0);
    assert!(fd >= FIRST_FILE_FD as i32);

    let message = b"syscall data";
    let written = raw_syscall(
        Syscall::Write as u32,
        fd as u32,
        message.as_ptr() as u32,
        message.len() as u32,
    );
    assert_eq!(written, message.len() as i32);

    assert_eq!(raw_syscall(Syscall::Close as u32, fd as u32, 0, 0), 0);

    // Reopen and read the contents back.
    let mode = filesystem::OpenMode::READ.bits();
    let fd = raw_syscall(Syscall::Open as u32, path.as_ptr() as u32, mode, 0);
    assert!(fd >= FIRST_FILE_FD as i32);

    let mut buffer = [0u8; 32];
    let read = raw_syscall(
        Syscall::Read as u32,
        fd as u32,
        buffer.as_mut_ptr() as u32,
        buffer.len() as u32,
    );
    assert_eq!(read, message.len() as i32);
    assert_eq!(&buffer[..message.len()], message);

    assert_eq!(raw_syscall(Syscall::Close as u32, fd as u32, 0, 0), 0);
}
