// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the process scheduler: a priority-aware round
//! robin with multilevel feedback.
//!
//! ## Queues
//!
//! Every live process that is not RUNNING sits in exactly one
//! of three queues: ready, blocked, or sleeping. Insertion into
//! the ready queue is priority-ordered: a process is placed
//! before the first process of strictly lower priority, so the
//! queue stays sorted and processes of equal priority run
//! first-in, first-out. The blocked and sleeping queues are
//! plain FIFOs.
//!
//! ## Policy
//!
//! On each scheduling event, the running process consumes one
//! round of its time slice. When the slice is exhausted, the
//! process is demoted one priority level (never below LOW), its
//! slice is refilled, and it is re-queued; the head of the ready
//! queue runs next. CPU-bound processes therefore drift towards
//! LOW, while processes that sleep or block before exhausting a
//! slice keep their priority. Priority is never raised
//! automatically; [`set_process_priority`] is the only route up.
//!
//! ## Initialisation
//!
//! The scheduler will not activate and start preempting until
//! the kernel's initial thread calls [`start`], at which point
//! the initial thread becomes the idle process and the
//! scheduler takes ownership of the flow of execution.

use super::switch::switch_stack;
use super::{Priority, Process, ProcessId, ProcessState, PROCESSES};
use crate::interrupts::without_interrupts;
use crate::time;
use crate::{interrupts, println};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Once;

/// The number of scheduling rounds in a full time slice.
///
pub const DEFAULT_QUANTUM: u32 = 10;

/// Scheduler holds the three process queues.
///
/// The RUNNING process is never in a queue; it is tracked
/// separately in [`CURRENT`].
///
pub(super) struct Scheduler {
    ready: VecDeque<(ProcessId, Priority)>,
    blocked: VecDeque<ProcessId>,
    sleeping: VecDeque<(ProcessId, u64)>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            ready: VecDeque::new(),
            blocked: VecDeque::new(),
            sleeping: VecDeque::new(),
        }
    }

    /// Inserts a process into the ready queue, before the
    /// first process of strictly lower priority. Among equal
    /// priorities, the newcomer goes last.
    ///
    pub fn enqueue_ready(&mut self, id: ProcessId, priority: Priority) {
        match self.ready.iter().position(|&(_, queued)| queued < priority) {
            Some(index) => self.ready.insert(index, (id, priority)),
            None => self.ready.push_back((id, priority)),
        }
    }

    /// Appends a process to the blocked queue.
    ///
    pub fn enqueue_blocked(&mut self, id: ProcessId) {
        self.blocked.push_back(id);
    }

    /// Appends a process to the sleeping queue with its wake
    /// tick.
    ///
    pub fn enqueue_sleeping(&mut self, id: ProcessId, wake_at: u64) {
        self.sleeping.push_back((id, wake_at));
    }

    /// Removes the process from whichever queue holds it.
    ///
    pub fn remove(&mut self, id: ProcessId) {
        self.ready.retain(|&(queued, _)| queued != id);
        self.blocked.retain(|&queued| queued != id);
        self.sleeping.retain(|&(queued, _)| queued != id);
    }
}

// Applies the multilevel feedback steps to the process losing
// consideration: consume a round of its slice if any remains,
// otherwise demote it, refill its slice, and re-queue it.
//
// Returns true if the process keeps the CPU.
//
fn charge_and_requeue(scheduler: &mut Scheduler, process: &Arc<Process>) -> bool {
    if process.remaining_slice() > 0 {
        process.consume_slice();
        return true;
    }

    if process.priority() > Priority::Low {
        process.set_priority(process.priority().demote());
    }

    process.reset_slice();
    process.set_state(ProcessState::Ready);
    scheduler.enqueue_ready(process.id(), process.priority());

    false
}

/// The scheduler's queue state, created by [`init`].
///
static SCHEDULER: Once<spin::Mutex<Scheduler>> = Once::new();

/// CURRENT is the process executing on the CPU. It is None
/// only before [`start`].
///
static CURRENT: spin::Mutex<Option<Arc<Process>>> = spin::Mutex::new(None);

/// IDLE is the idle process, to which the scheduler falls
/// back when the ready queue is empty.
///
static IDLE: Once<Arc<Process>> = Once::new();

/// Flipped once by [`start`]; until then every scheduling
/// entry point backs out without touching the CPU.
///
static ACTIVE: AtomicBool = AtomicBool::new(false);

// Set by the timer handler when the scheduler should run;
// consumed by [`preempt`] after the EOI.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// Initialise the scheduler, allowing the creation of new
/// processes, and start the scheduling timer.
///
/// The timer fires at [`time::TICKS_PER_SECOND`] Hz, but no
/// preemption happens until [`start`].
///
pub(super) fn init() {
    SCHEDULER.call_once(|| spin::Mutex::new(Scheduler::new()));
    time::init();
    interrupts::pic::unmask_irq(0);
}

/// Reports whether [`start`] has run and preemption is live.
///
pub fn ready() -> bool {
    ACTIVE.load(Ordering::Relaxed)
}

/// Returns the currently executing process, or None before
/// [`start`].
///
pub fn current() -> Option<Arc<Process>> {
    without_interrupts(|| CURRENT.lock().clone())
}

// Returns the idle process.
//
// # Panics
//
// Panics if the scheduler has not been started.
//
fn idle_process() -> Arc<Process> {
    IDLE.get().expect("scheduler not started").clone()
}

/// Turns the kernel's initial thread into the idle process and
/// activates preemption. The first ready process (if one
/// exists) is dispatched immediately.
///
/// Never returns: from here on, this stack belongs to the idle
/// process.
///
pub fn start() -> ! {
    let idle = Process::new_idle();
    IDLE.call_once(|| idle.clone());
    without_interrupts(|| {
        *CURRENT.lock() = Some(idle);
    });

    ACTIVE.store(true, Ordering::Relaxed);

    // Give the first ready process the CPU. Control comes back
    // here whenever the ready queue drains.
    schedule();

    idle_loop();
}

// The idle process's body: reap whatever has exited, then
// halt until an interrupt brings new work.
//
fn idle_loop() -> ! {
    loop {
        super::reap();
        unsafe { enable_and_halt() };
    }
}

// Sets the interrupt-enable flag and halts. The two
// instructions are back to back, so an interrupt cannot
// slip in between and leave the CPU halted forever.
//
unsafe fn enable_and_halt() {
    asm!("sti", "hlt", options(nomem, nostack));
}

/// Yields the CPU: the calling process is marked READY and the
/// scheduling policy runs.
///
/// If the process has time slice remaining, the policy lets it
/// continue; yielding does not consume the rest of the slice.
/// With an empty ready queue, the call returns immediately.
///
pub fn yield_now() {
    let current = match current() {
        Some(current) => current,
        None => return,
    };

    if current.id() != ProcessId::IDLE {
        current.set_state(ProcessState::Ready);
    }

    schedule();
}

// What schedule decided to do once the queues were consulted.
enum Decision {
    Stay,
    Switch(Arc<Process>, Arc<Process>),
}

/// Runs the scheduling policy, possibly switching to another
/// process.
///
/// May be called voluntarily (yield, sleep, block, exit) or
/// from the interrupt dispatcher for preemption. The policy
/// and queue edits run with interrupts disabled; the previous
/// interrupt-enable state is restored before returning.
///
pub fn schedule() {
    let enabled = interrupts::are_enabled();
    interrupts::disable();

    if !ready() {
        if enabled {
            interrupts::enable();
        }
        return;
    }

    let decision = {
        let mut scheduler = SCHEDULER
            .get()
            .expect("scheduler active but not initialised")
            .lock();
        let current = CURRENT
            .lock()
            .clone()
            .expect("scheduler active with no current process");

        // Apply the policy to the process leaving consideration,
        // if it is still on the CPU. A process that just went to
        // sleep, blocked, or exited is not re-queued.
        let on_cpu = matches!(
            current.state(),
            ProcessState::Running | ProcessState::Ready
        );
        if current.id() != ProcessId::IDLE && on_cpu && charge_and_requeue(&mut scheduler, &current)
        {
            current.set_state(ProcessState::Running);
            Decision::Stay
        } else {
            // Dispatch the head of the ready queue, or the idle
            // process if there is nothing to run. Entries whose
            // process has been destroyed or moved queues are
            // skipped.
            let next = loop {
                match scheduler.ready.pop_front() {
                    Some((id, _)) => {
                        let process = PROCESSES.lock().get(&id).cloned();
                        match process {
                            Some(process) if process.state() == ProcessState::Ready => {
                                break process
                            }
                            _ => continue,
                        }
                    }
                    None => break idle_process(),
                }
            };

            if Arc::ptr_eq(&current, &next) {
                next.set_state(ProcessState::Running);
                Decision::Stay
            } else {
                next.set_state(ProcessState::Running);
                *CURRENT.lock() = Some(next.clone());

                // An exiting process's stack is still in use
                // until the switch below completes, so its
                // control block is parked for the idle process
                // to free later.
                if current.state() == ProcessState::Zombie {
                    super::REAP_LIST.lock().push(current.clone());
                }

                Decision::Switch(current, next)
            }
        }
    };

    if let Decision::Switch(outgoing, incoming) = decision {
        let outgoing_slot = outgoing.stack_pointer_slot();
        let incoming_sp = unsafe { *incoming.stack_pointer_slot() };
        let incoming_cr3 = incoming.address_space_root();

        // Drop our handles before switching: the incoming
        // process is held by CURRENT, and the outgoing one by
        // the queues, PROCESSES or the reap list.
        drop(outgoing);
        drop(incoming);

        unsafe { switch_stack(outgoing_slot, incoming_sp, incoming_cr3) };
    }

    if enabled {
        interrupts::enable();
    }
}

/// Requests that the scheduler run at the next preemption
/// point. Called by the timer handler.
///
pub(crate) fn request_reschedule() {
    NEED_RESCHED.store(true, Ordering::Relaxed);
}

/// Runs the scheduler if a reschedule has been requested and
/// the scheduler is active. Called by the interrupt dispatcher
/// after the EOI, so a preemption never leaves the PIC
/// unacknowledged.
///
pub fn preempt() {
    if !ready() {
        NEED_RESCHED.store(false, Ordering::Relaxed);
        return;
    }

    if NEED_RESCHED.swap(false, Ordering::Relaxed) {
        schedule();
    }
}

/// Moves every sleeping process whose wake tick has passed
/// back into the ready queue. Called by the timer handler
/// with interrupts disabled.
///
pub(crate) fn wake_sleepers(now: u64) {
    let scheduler = match SCHEDULER.get() {
        Some(scheduler) => scheduler,
        None => return,
    };
    let mut scheduler = scheduler.lock();

    // Materialise the set of processes to wake in a single
    // pass, then mutate the queues.
    let mut awakened = Vec::new();
    scheduler.sleeping.retain(|&(id, wake_at)| {
        if wake_at <= now {
            awakened.push(id);
            false
        } else {
            true
        }
    });

    let mut woke_any = false;
    for id in awakened {
        if let Some(process) = PROCESSES.lock().get(&id).cloned() {
            process.set_state(ProcessState::Ready);
            scheduler.enqueue_ready(id, process.priority());
            woke_any = true;
        }
    }

    // A woken process should not have to wait for the next
    // scheduling interval; it may be due to run immediately.
    if woke_any {
        request_reschedule();
    }
}

/// Moves the calling process to the sleeping queue until the
/// given wake tick. Used by [`time::sleep`].
///
pub(crate) fn sleep_until(wake_at: u64) {
    let current = match current() {
        Some(current) => current,
        None => return,
    };

    if current.id() == ProcessId::IDLE {
        return;
    }

    without_interrupts(|| {
        current.set_wake_at(wake_at);
        current.set_state(ProcessState::Sleeping);

        let mut scheduler = SCHEDULER
            .get()
            .expect("scheduler not initialised")
            .lock();
        scheduler.enqueue_sleeping(current.id(), wake_at);
    });

    schedule();
}

/// Appends the given process to the blocked queue.
///
pub(super) fn enqueue_blocked(id: ProcessId) {
    without_interrupts(|| {
        if let Some(scheduler) = SCHEDULER.get() {
            scheduler.lock().enqueue_blocked(id);
        }
    });
}

/// Inserts the given process into the ready queue at its
/// priority position.
///
pub(crate) fn enqueue_ready(id: ProcessId, priority: Priority) {
    without_interrupts(|| {
        if let Some(scheduler) = SCHEDULER.get() {
            scheduler.lock().enqueue_ready(id, priority);
        }
    });
}

/// Removes the given process from whichever queue holds it.
///
pub(super) fn remove_from_queues(id: ProcessId) {
    without_interrupts(|| {
        if let Some(scheduler) = SCHEDULER.get() {
            scheduler.lock().remove(id);
        }
    });
}

/// Changes the given process's priority, repositioning it in
/// the ready queue if it is queued there.
///
/// This is the only way a priority rises; the scheduler itself
/// only ever demotes.
///
pub fn set_process_priority(id: ProcessId, priority: Priority) {
    without_interrupts(|| {
        let process = match PROCESSES.lock().get(&id).cloned() {
            Some(process) => process,
            None => return,
        };

        process.set_priority(priority);

        if let Some(scheduler) = SCHEDULER.get() {
            let mut scheduler = scheduler.lock();
            let queued = scheduler
                .ready
                .iter()
                .any(|&(queued, _)| queued == id);
            if queued {
                scheduler.ready.retain(|&(queued, _)| queued != id);
                scheduler.enqueue_ready(id, priority);
            }
        }
    });
}

/// Returns the number of living processes, as a crude load
/// signal.
///
pub fn load_average() -> usize {
    super::process_count()
}

/// Prints debug info about the scheduler's queues.
///
pub fn debug() {
    without_interrupts(|| {
        let scheduler = match SCHEDULER.get() {
            Some(scheduler) => scheduler,
            None => return,
        };
        let scheduler = scheduler.lock();

        println!("Scheduler:");
        println!("  processes: {}", PROCESSES.lock().len());
        println!("  ready:     {}", scheduler.ready.len());
        println!("  blocked:   {}", scheduler.blocked.len());
        println!("  sleeping:  {}", scheduler.sleeping.len());
        match *CURRENT.lock() {
            Some(ref current) => {
                println!("  running:   {} ({})", current.id().as_u32(), current.name())
            }
            None => println!("  running:   none"),
        }
    });
}

// Tests

// Returns every process id currently in any queue. Used by
// tests to check the exactly-one-queue invariant.
//
#[cfg(test)]
pub(crate) fn queued_processes() -> Vec<ProcessId> {
    without_interrupts(|| {
        let scheduler = SCHEDULER.get().expect("scheduler not initialised").lock();
        let mut ids = Vec::new();
        ids.extend(scheduler.ready.iter().map(|&(id, _)| id));
        ids.extend(scheduler.blocked.iter().cloned());
        ids.extend(scheduler.sleeping.iter().map(|&(id, _)| id));

        ids
    })
}

#[cfg(test)]
fn queue_membership(id: ProcessId) -> usize {
    queued_processes().iter().filter(|&&queued| queued == id).count()
}

#[cfg(test)]
fn looping_entry() -> ! {
    panic!("test process was dispatched");
}

#[test_case]
fn ready_queue_priority_order() {
    let mut scheduler = Scheduler::new();

    let a = ProcessId(101);
    let b = ProcessId(102);
    let c = ProcessId(103);
    let d = ProcessId(104);

    scheduler.enqueue_ready(a, Priority::Normal);
    scheduler.enqueue_ready(b, Priority::High);
    scheduler.enqueue_ready(c, Priority::Normal);
    scheduler.enqueue_ready(d, Priority::Low);

    // Sorted by priority; FIFO among equals.
    let order: Vec<ProcessId> = scheduler.ready.iter().map(|&(id, _)| id).collect();
    assert_eq!(order, alloc::vec![b, a, c, d]);

    // The queue is non-increasing in priority from head to
    // tail.
    let priorities: Vec<Priority> = scheduler.ready.iter().map(|&(_, p)| p).collect();
    for pair in priorities.windows(2) {
        assert!(pair[0] >= pair[1]);
    }
}

#[test_case]
fn ready_queue_overtakes_head() {
    let mut scheduler = Scheduler::new();

    let a = ProcessId(111);
    let b = ProcessId(112);

    scheduler.enqueue_ready(a, Priority::Normal);
    scheduler.enqueue_ready(b, Priority::Realtime);

    // A higher-priority newcomer becomes the new head.
    assert_eq!(scheduler.ready.front(), Some(&(b, Priority::Realtime)));
}

#[test_case]
fn mlfq_slice_consumption() {
    let mut scheduler = Scheduler::new();
    let process = Process::create("cpu-hog", looping_entry, Priority::Normal).unwrap();
    process.set_state(ProcessState::Running);

    // With slice remaining, the process keeps the CPU and
    // is not queued.
    assert_eq!(process.remaining_slice(), DEFAULT_QUANTUM);
    assert!(charge_and_requeue(&mut scheduler, &process));
    assert_eq!(process.remaining_slice(), DEFAULT_QUANTUM - 1);
    assert!(scheduler.ready.is_empty());
    assert_eq!(process.priority(), Priority::Normal);
}

#[test_case]
fn mlfq_demotion_after_exhausted_slices() {
    let mut scheduler = Scheduler::new();
    let process = Process::create("cpu-hog", looping_entry, Priority::High).unwrap();
    process.set_state(ProcessState::Running);

    // A CPU-bound process that never yields reaches LOW
    // within three exhausted slices.
    let mut exhausted = 0;
    while process.priority() > Priority::Low {
        // Run the slice dry, then hit the exhaustion path.
        while charge_and_requeue(&mut scheduler, &process) {}
        exhausted += 1;

        // The process was re-queued with a fresh slice.
        assert_eq!(process.remaining_slice(), DEFAULT_QUANTUM);
        assert_eq!(process.state(), ProcessState::Ready);
        scheduler.remove(process.id());
        process.set_state(ProcessState::Running);
    }

    assert!(exhausted <= 3);
    assert_eq!(process.priority(), Priority::Low);

    // Demotion saturates at LOW.
    while charge_and_requeue(&mut scheduler, &process) {}
    assert_eq!(process.priority(), Priority::Low);
}

#[test_case]
fn exactly_one_queue() {
    let id = super::create_process("queued", looping_entry, Priority::Normal).unwrap();
    assert_eq!(queue_membership(id), 1);

    super::block_process(id);
    assert_eq!(queue_membership(id), 1);

    super::unblock_process(id);
    assert_eq!(queue_membership(id), 1);

    super::destroy_process(id);
    assert_eq!(queue_membership(id), 0);
}

#[test_case]
fn yield_before_scheduler_start() {
    // With no current process there is nothing to yield;
    // the call must simply return.
    yield_now();
}

#[test_case]
fn set_priority_repositions_ready_process() {
    let slow = super::create_process("slow", looping_entry, Priority::Low).unwrap();
    let fast = super::create_process("fast", looping_entry, Priority::Normal).unwrap();

    // Raising the LOW process above NORMAL moves it ahead in
    // the ready queue.
    set_process_priority(slow, Priority::High);
    assert_eq!(super::process(slow).unwrap().priority(), Priority::High);

    without_interrupts(|| {
        let scheduler = SCHEDULER.get().unwrap().lock();
        let slow_index = scheduler
            .ready
            .iter()
            .position(|&(id, _)| id == slow)
            .unwrap();
        let fast_index = scheduler
            .ready
            .iter()
            .position(|&(id, _)| id == fast)
            .unwrap();
        assert!(slow_index < fast_index);
    });

    super::destroy_process(slow);
    super::destroy_process(fast);
}

#[test_case]
fn wake_sleepers_moves_due_processes() {
    let early = super::create_process("early", looping_entry, Priority::Normal).unwrap();
    let late = super::create_process("late", looping_entry, Priority::Normal).unwrap();

    without_interrupts(|| {
        let mut scheduler = SCHEDULER.get().unwrap().lock();
        scheduler.remove(early);
        scheduler.remove(late);

        super::process(early).unwrap().set_state(ProcessState::Sleeping);
        super::process(late).unwrap().set_state(ProcessState::Sleeping);
        scheduler.enqueue_sleeping(early, 100);
        scheduler.enqueue_sleeping(late, 200);
    });

    wake_sleepers(50);
    assert_eq!(super::process(early).unwrap().state(), ProcessState::Sleeping);
    assert_eq!(super::process(late).unwrap().state(), ProcessState::Sleeping);

    // Only the process whose wake tick has passed is woken.
    wake_sleepers(150);
    assert_eq!(super::process(early).unwrap().state(), ProcessState::Ready);
    assert_eq!(super::process(late).unwrap().state(), ProcessState::Sleeping);
    assert_eq!(queue_membership(early), 1);
    assert_eq!(queue_membership(late), 1);

    wake_sleepers(200);
    assert_eq!(super::process(late).unwrap().state(), ProcessState::Ready);

    super::destroy_process(early);
    super::destroy_process(late);
}
