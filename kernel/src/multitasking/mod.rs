// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements preemptive multitasking, with priority-aware
//! round-robin scheduling and multilevel feedback.
//!
//! Each process is described by a [`Process`] control block: its
//! identity, scheduling state, register snapshot, 4 KiB kernel
//! stack, and address space root. Processes are created with
//! [`create_process`] and enter the ready queue immediately.
//!
//! A process leaves the CPU by exhausting its time slice (the timer
//! preempts it), by yielding, by sleeping through
//! [`time::sleep`](crate::time::sleep), or by blocking. A blocked
//! process runs again only after [`unblock_process`]; a sleeping
//! process when its wake tick passes. [`exit`] ends the calling
//! process; the idle process reaps it afterwards.
//!
//! The scheduling policy itself lives in [`scheduler`].

pub mod scheduler;
mod switch;

use crate::boot::KERNEL_CODE_SELECTOR;
use crate::interrupts::without_interrupts;
use crate::memory;
use crate::memory::paging::AddressSpace;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// The size of each process's kernel stack.
///
const KERNEL_STACK_SIZE: usize = 4096;

/// The longest process name stored, in bytes.
///
const MAX_NAME_LEN: usize = 31;

// The initial EFLAGS for a new process: interrupts enabled,
// plus the reserved bit that always reads as one.
const INITIAL_EFLAGS: u32 = 0x202;

/// The registry of living processes, keyed by id. The idle
/// process is deliberately absent: it never sits in a queue,
/// so nothing ever needs to look it up here.
///
static PROCESSES: spin::Mutex<BTreeMap<ProcessId, Arc<Process>>> =
    spin::Mutex::new(BTreeMap::new());

/// REAP_LIST holds exited processes whose stacks may still be
/// in use until the next context switch. The idle process
/// frees them.
///
static REAP_LIST: spin::Mutex<Vec<Arc<Process>>> = spin::Mutex::new(Vec::new());

/// Initialise the process scheduler, allowing the creation of
/// new processes.
///
/// No process will run until the kernel's initial thread calls
/// [`scheduler::start`] to hand control over to the scheduler.
///
pub fn init() {
    scheduler::init();
}

/// A process's identity, handed out once and never reused.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The id reserved for the idle process. Real processes
    /// count up from 1, so 0 can never collide.
    ///
    pub const IDLE: Self = ProcessId(0);

    // Mints the next unused id.
    //
    fn new() -> Self {
        static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);
        ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the id as a plain integer, for display and for
    /// the syscall boundary.
    ///
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Where a process stands in its lifecycle. Exactly one
/// process is RUNNING; every other live process is READY,
/// BLOCKED or SLEEPING, and sits in the matching queue.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ProcessState {
    /// The process is ready to run.
    Ready = 0,

    /// The process is executing on the CPU.
    Running = 1,

    /// The process is waiting to be unblocked.
    Blocked = 2,

    /// The process is asleep until its wake tick.
    Sleeping = 3,

    /// The process has exited and awaits reaping.
    Zombie = 4,
}

impl ProcessState {
    fn from_u8(value: u8) -> ProcessState {
        match value {
            0 => ProcessState::Ready,
            1 => ProcessState::Running,
            2 => ProcessState::Blocked,
            3 => ProcessState::Sleeping,
            4 => ProcessState::Zombie,
            _ => panic!("invalid process state {}", value),
        }
    }
}

/// Describes the scheduling priority of a process.
///
/// The scheduler demotes a process one level each time it
/// exhausts its time slice. Priority is never raised
/// automatically: [`scheduler::set_process_priority`] is the
/// only route up.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Realtime = 3,
}

impl Priority {
    fn from_u8(value: u8) -> Priority {
        match value {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            3 => Priority::Realtime,
            _ => panic!("invalid priority {}", value),
        }
    }

    /// Returns the next priority down, saturating at
    /// [`Priority::Low`].
    ///
    pub fn demote(self) -> Priority {
        match self {
            Priority::Realtime => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal | Priority::Low => Priority::Low,
        }
    }
}

/// The bounds of a process's kernel stack.
///
#[derive(Debug, Clone, Copy)]
struct StackBounds {
    bottom: usize,
    top: usize,
}

/// One process's control block: identity, scheduling state,
/// accounting, register snapshot, kernel stack and address
/// space root.
///
pub struct Process {
    // This process's unique id. The one exception is the
    // idle process, which has the otherwise-invalid id 0.
    id: ProcessId,

    // The process's name, truncated to MAX_NAME_LEN bytes.
    name: String,

    // The process's current scheduling state.
    state: AtomicU8,

    // The process's scheduling priority.
    priority: AtomicU8,

    // The number of scheduling rounds left before the
    // process is demoted and rotated out. Meaningful only
    // while the process is READY or RUNNING.
    remaining_slice: AtomicU32,

    // The tick at which the process should wake. Meaningful
    // only while the process is SLEEPING.
    wake_at: AtomicU64,

    // The number of timer ticks the process has spent on
    // the CPU.
    run_time: AtomicU64,

    // The process's kernel stack. The idle process adopts
    // the boot stack instead.
    stack: Option<StackBounds>,

    // The process's saved stack pointer. While the process
    // is executing, this value is stale; it is rewritten
    // when the process is switched out.
    stack_pointer: UnsafeCell<u32>,

    // The process's address space. The idle process runs on
    // the kernel's address space instead.
    address_space: Option<AddressSpace>,
}

// Process is not thread-safe by default, as its stack pointer
// is stored in an UnsafeCell. The cell is only accessed while
// the process is being switched in or out, which happens with
// interrupts disabled on a single CPU.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

// Writes one value below the given stack pointer, returning
// the lowered pointer. New process stacks are laid out with a
// chain of these, mirroring what switch_stack will pop off.
//
unsafe fn push_stack(mut esp: *mut u32, value: u32) -> *mut u32 {
    esp = esp.sub(1);
    esp.write(value);
    esp
}

impl Process {
    // Creates a new process without registering it with the
    // scheduler. Returns None if the stack or address space
    // cannot be allocated.
    //
    fn create(name: &str, entry: fn() -> !, priority: Priority) -> Option<Arc<Process>> {
        let stack = memory::alloc(KERNEL_STACK_SIZE)?;
        let bottom = stack.as_ptr() as usize;
        let top = bottom + KERNEL_STACK_SIZE;

        let address_space = match AddressSpace::new_kernel_clone() {
            Some(space) => space,
            None => {
                memory::free(stack.as_ptr());
                return None;
            }
        };

        // Build the initial stack frame. On the first dispatch,
        // switch_stack pops the eight general-purpose registers
        // and returns through iretd, which loads EIP, CS and
        // EFLAGS. With IF set in the initial EFLAGS, the process
        // starts with interrupts enabled.
        let esp = unsafe {
            let mut esp = top as *mut u32;
            esp = push_stack(esp, INITIAL_EFLAGS);
            esp = push_stack(esp, KERNEL_CODE_SELECTOR as u32);
            esp = push_stack(esp, entry as usize as u32);
            for _ in 0..8 {
                esp = push_stack(esp, 0); // EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI.
            }

            esp
        };

        let name = name.chars().take(MAX_NAME_LEN).collect();

        Some(Arc::new(Process {
            id: ProcessId::new(),
            name,
            state: AtomicU8::new(ProcessState::Ready as u8),
            priority: AtomicU8::new(priority as u8),
            remaining_slice: AtomicU32::new(scheduler::DEFAULT_QUANTUM),
            wake_at: AtomicU64::new(0),
            run_time: AtomicU64::new(0),
            stack: Some(StackBounds { bottom, top }),
            stack_pointer: UnsafeCell::new(esp as u32),
            address_space: Some(address_space),
        }))
    }

    // Creates the idle process, which adopts the kernel's
    // initial stack and address space.
    //
    // The initial stack pointer is 0: it is never read, as
    // the idle process's true stack pointer is saved the
    // first time it is switched out.
    //
    pub(super) fn new_idle() -> Arc<Process> {
        Arc::new(Process {
            id: ProcessId::IDLE,
            name: String::from("idle"),
            state: AtomicU8::new(ProcessState::Running as u8),
            priority: AtomicU8::new(Priority::Low as u8),
            remaining_slice: AtomicU32::new(0),
            wake_at: AtomicU64::new(0),
            run_time: AtomicU64::new(0),
            stack: None,
            stack_pointer: UnsafeCell::new(0),
            address_space: None,
        })
    }

    /// Returns the process's unique ProcessId.
    ///
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Returns the process's name.
    ///
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the process's current scheduling state.
    ///
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Updates the process's scheduling state.
    ///
    pub(super) fn set_state(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Returns the process's scheduling priority.
    ///
    pub fn priority(&self) -> Priority {
        Priority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub(super) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    /// Returns the number of scheduling rounds left in the
    /// process's time slice.
    ///
    pub fn remaining_slice(&self) -> u32 {
        self.remaining_slice.load(Ordering::Relaxed)
    }

    // Consumes one scheduling round of the time slice.
    //
    pub(super) fn consume_slice(&self) {
        self.remaining_slice.fetch_sub(1, Ordering::Relaxed);
    }

    // Refills the time slice to the scheduler's quantum.
    //
    pub(super) fn reset_slice(&self) {
        self.remaining_slice
            .store(scheduler::DEFAULT_QUANTUM, Ordering::Relaxed);
    }

    /// Returns the tick at which the process should wake.
    ///
    pub fn wake_at(&self) -> u64 {
        self.wake_at.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wake_at(&self, tick: u64) {
        self.wake_at.store(tick, Ordering::Relaxed);
    }

    /// Returns the number of timer ticks the process has
    /// spent on the CPU.
    ///
    pub fn run_time(&self) -> u64 {
        self.run_time.load(Ordering::Relaxed)
    }

    pub(crate) fn account_tick(&self) {
        self.run_time.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the address space root loaded into CR3 when
    /// the process runs, or 0 for processes that keep the
    /// current address space.
    ///
    pub fn address_space_root(&self) -> u32 {
        match &self.address_space {
            Some(space) => space.directory_addr(),
            None => 0,
        }
    }

    // Returns the location holding the process's saved stack
    // pointer.
    //
    pub(super) fn stack_pointer_slot(&self) -> *mut u32 {
        self.stack_pointer.get()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Return the process's stack to the heap. The address
        // space frees its directory in its own Drop.
        if let Some(stack) = self.stack {
            memory::free(stack.bottom as *mut u8);
        }
    }
}

/// Creates a new process and inserts it into the ready queue.
///
/// When the process is first dispatched, execution begins at
/// `entry` with interrupts enabled.
///
/// Returns None if the control block, stack or address space
/// cannot be allocated.
///
pub fn create_process(name: &str, entry: fn() -> !, priority: Priority) -> Option<ProcessId> {
    let process = Process::create(name, entry, priority)?;
    let id = process.id();

    without_interrupts(|| {
        PROCESSES.lock().insert(id, process);
        scheduler::enqueue_ready(id, priority);
    });

    Some(id)
}

/// Destroys the given process: it is detached from its queue
/// and its stack, address space and control block are freed.
///
/// Destroying the running process is equivalent to [`exit`].
/// Destroying an unknown process id is a no-op.
///
pub fn destroy_process(id: ProcessId) {
    if current_pid() == Some(id) {
        exit(0);
    }

    without_interrupts(|| {
        scheduler::remove_from_queues(id);
        PROCESSES.lock().remove(&id);
    });
}

/// Ends the calling process and switches to the next runnable
/// process.
///
/// The process's resources are freed by the idle process once
/// it has left the CPU for good.
///
/// # Panics
///
/// The idle process may not exit (nothing could ever halt the
/// CPU again); `exit` panics if it tries.
///
pub fn exit(_status: i32) -> ! {
    let current = current_process().expect("exit called before the scheduler started");
    if current.id() == ProcessId::IDLE {
        panic!("idle process tried to exit");
    }

    without_interrupts(|| {
        current.set_state(ProcessState::Zombie);
        PROCESSES.lock().remove(&current.id());
        drop(current);
    });

    // Leave the CPU. The zombie is in no queue, so nothing can
    // ever dispatch it again.
    scheduler::schedule();
    unreachable!("schedule returned into an exited process");
}

/// Blocks the given process: it is removed from its queue and
/// appended to the blocked queue, where it stays until
/// [`unblock_process`].
///
/// Blocking the running process switches to the next runnable
/// process.
///
pub fn block_process(id: ProcessId) {
    let blocked_current = without_interrupts(|| {
        let process = match PROCESSES.lock().get(&id) {
            Some(process) => process.clone(),
            None => return false,
        };

        scheduler::remove_from_queues(id);
        process.set_state(ProcessState::Blocked);
        scheduler::enqueue_blocked(id);

        current_pid() == Some(id)
    });

    if blocked_current {
        scheduler::schedule();
    }
}

/// Unblocks the given process: if it is blocked, it is moved
/// from the blocked queue back into the ready queue.
///
/// Unblocking a process that is not blocked is a no-op.
///
pub fn unblock_process(id: ProcessId) {
    without_interrupts(|| {
        let process = match PROCESSES.lock().get(&id) {
            Some(process) => process.clone(),
            None => return,
        };

        if process.state() != ProcessState::Blocked {
            return;
        }

        scheduler::remove_from_queues(id);
        process.set_state(ProcessState::Ready);
        scheduler::enqueue_ready(id, process.priority());
    });
}

/// Returns the currently executing process, or None before
/// the scheduler has started.
///
pub fn current_process() -> Option<Arc<Process>> {
    scheduler::current()
}

/// Returns the id of the currently executing process.
///
pub fn current_pid() -> Option<ProcessId> {
    current_process().map(|process| process.id())
}

/// Returns the process with the given id, if it is alive.
///
pub fn process(id: ProcessId) -> Option<Arc<Process>> {
    without_interrupts(|| PROCESSES.lock().get(&id).cloned())
}

/// Returns the number of living processes, not counting the
/// idle process.
///
pub fn process_count() -> usize {
    without_interrupts(|| PROCESSES.lock().len())
}

// Frees any processes that have exited. Called by the idle
// process, once the exited processes' stacks are no longer
// in use.
//
pub(crate) fn reap() {
    let reaped = without_interrupts(|| {
        let mut reap_list = REAP_LIST.lock();
        core::mem::take(&mut *reap_list)
    });

    // The handles are dropped here, outside the lock, which
    // frees each process's stack and address space.
    drop(reaped);
}

// Tests

#[cfg(test)]
fn test_entry() -> ! {
    panic!("test process was dispatched");
}

#[test_case]
fn initial_stack_frame() {
    let process = Process::create("frame", test_entry, Priority::Normal).unwrap();

    let esp = unsafe { *process.stack_pointer_slot() } as *const u32;
    let frame = unsafe { core::slice::from_raw_parts(esp, 11) };

    // Eight zeroed general-purpose registers...
    for &register in &frame[..8] {
        assert_eq!(register, 0);
    }

    // ...then the iretd frame: EIP, CS, EFLAGS.
    assert_eq!(frame[8], test_entry as usize as u32);
    assert_eq!(frame[9], KERNEL_CODE_SELECTOR as u32);
    assert_eq!(frame[10], INITIAL_EFLAGS);

    // The frame sits at the top of the 4 KiB stack.
    let stack = process.stack.unwrap();
    assert_eq!(stack.top - stack.bottom, KERNEL_STACK_SIZE);
    assert_eq!(esp as usize, stack.top - 11 * 4);
}

#[test_case]
fn process_ids_are_sequential() {
    let first = Process::create("first", test_entry, Priority::Normal).unwrap();
    let second = Process::create("second", test_entry, Priority::Normal).unwrap();

    assert!(first.id().as_u32() >= 1);
    assert_eq!(second.id().as_u32(), first.id().as_u32() + 1);
}

#[test_case]
fn process_name_is_truncated() {
    let name = "a-very-long-process-name-that-keeps-going";
    let process = Process::create(name, test_entry, Priority::Low).unwrap();

    assert_eq!(process.name().len(), MAX_NAME_LEN);
    assert_eq!(process.name(), &name[..MAX_NAME_LEN]);
}

#[test_case]
fn priority_demotion_saturates() {
    assert_eq!(Priority::Realtime.demote(), Priority::High);
    assert_eq!(Priority::High.demote(), Priority::Normal);
    assert_eq!(Priority::Normal.demote(), Priority::Low);
    assert_eq!(Priority::Low.demote(), Priority::Low);
}

#[test_case]
fn process_lifecycle_block_unblock() {
    let id = create_process("blocker", test_entry, Priority::Normal).unwrap();
    let process = process(id).unwrap();
    assert_eq!(process.state(), ProcessState::Ready);

    block_process(id);
    assert_eq!(process.state(), ProcessState::Blocked);
    assert!(scheduler::queued_processes().contains(&id));

    unblock_process(id);
    assert_eq!(process.state(), ProcessState::Ready);

    // Unblocking an already-ready process is a no-op.
    unblock_process(id);
    assert_eq!(process.state(), ProcessState::Ready);

    destroy_process(id);
    assert!(!scheduler::queued_processes().contains(&id));
    assert!(crate::multitasking::process(id).is_none());
}
