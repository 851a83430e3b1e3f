use core::ffi::c_int;

use slopos_abi::task::{BlockReason, MAX_TASKS};
use slopos_lib::IrqMutex;

use super::scheduler::{
    is_scheduling_active, schedule, schedule_task, scheduler_get_current_task, unschedule_task,
};
use super::task::{
    INVALID_TASK_ID, TaskStatus, task_find_by_id, task_is_blocked, task_is_invalid,
    task_is_terminated, task_set_state_with_reason,
};
use crate::platform;

#[derive(Copy, Clone)]
struct SleepEntry {
    task_id: u32,
    wake_tick: u64,
    active: bool,
}

impl SleepEntry {
    const fn empty() -> Self {
        Self {
            task_id: INVALID_TASK_ID,
            wake_tick: 0,
            active: false,
        }
    }
}

struct SleepQueue {
    entries: [SleepEntry; MAX_TASKS],
}

impl SleepQueue {
    const fn new() -> Self {
        Self {
            entries: [SleepEntry::empty(); MAX_TASKS],
        }
    }

    fn clear(&mut self) {
        self.entries = [SleepEntry::empty(); MAX_TASKS];
    }

    fn upsert(&mut self, task_id: u32, wake_tick: u64) -> bool {
        let mut free_idx = None;
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            if entry.active && entry.task_id == task_id {
                entry.wake_tick = wake_tick;
                return true;
            }
            if !entry.active && free_idx.is_none() {
                free_idx = Some(idx);
            }
        }

        if let Some(idx) = free_idx {
            self.entries[idx] = SleepEntry {
                task_id,
                wake_tick,
                active: true,
            };
            true
        } else {
            false
        }
    }

    fn remove(&mut self, task_id: u32) {
        for entry in self.entries.iter_mut() {
            if entry.active && entry.task_id == task_id {
                *entry = SleepEntry::empty();
                break;
            }
        }
    }

    fn collect_due(&mut self, now_tick: u64, out: &mut [u32; MAX_TASKS]) -> usize {
        let mut count = 0usize;
        for entry in self.entries.iter_mut() {
            if !entry.active {
                continue;
            }
            if tick_reached(now_tick, entry.wake_tick) {
                if count < out.len() {
                    out[count] = entry.task_id;
                    count += 1;
                }
                *entry = SleepEntry::empty();
            }
        }
        count
    }
}

static SLEEP_QUEUE: IrqMutex<SleepQueue> = IrqMutex::new(SleepQueue::new());

#[inline]
fn tick_reached(now_tick: u64, deadline_tick: u64) -> bool {
    now_tick.wrapping_sub(deadline_tick) < (1u64 << 63)
}

fn ms_to_sleep_ticks(ms: u32) -> u64 {
    let freq = platform::timer_frequency() as u64;
    if freq == 0 {
        return 1;
    }

    let ticks = (ms as u64).saturating_mul(freq).saturating_add(999) / 1000;
    ticks.max(1)
}

fn sleep_ticks_to_ms(ticks: u64) -> u32 {
    let freq = platform::timer_frequency() as u64;
    if freq == 0 {
        return 0;
    }
    let ms = ticks.saturating_mul(1000) / freq;
    ms.min(u32::MAX as u64) as u32
}

fn task_has_pending_signal(task: *mut super::task_struct::Task) -> bool {
    if task.is_null() {
        return false;
    }
    unsafe {
        let pending = (*task).signal_pending.load(core::sync::atomic::Ordering::Acquire);
        let deliverable = pending & !(*task).signal_blocked;
        deliverable != 0
    }
}

/// Outcome of an interruptible timed sleep (nanosleep-style): either the
/// deadline was reached, or a deliverable signal cut the sleep short, in
/// which case the caller gets back how many milliseconds were left.
pub enum SleepOutcome {
    Completed,
    Interrupted { remaining_ms: u32 },
}

/// Sleep the current task for up to `ms` milliseconds, waking early if a
/// signal becomes deliverable. Used by `nanosleep`; unlike
/// `sleep_current_task_ms` this distinguishes the two wakeup causes so the
/// remainder can be reported back to user space.
pub fn sleep_current_task_ms_interruptible(ms: u32) -> SleepOutcome {
    if ms == 0 {
        return SleepOutcome::Completed;
    }

    if !is_scheduling_active() {
        platform::timer_poll_delay_ms(ms);
        return SleepOutcome::Completed;
    }

    let current = scheduler_get_current_task();
    if current.is_null() || super::per_cpu::is_idle_task(current) {
        platform::timer_poll_delay_ms(ms);
        return SleepOutcome::Completed;
    }

    let task_id = unsafe { (*current).task_id };
    if task_id == INVALID_TASK_ID {
        return SleepOutcome::Completed;
    }

    let now_tick = platform::timer_ticks();
    let wake_tick = now_tick.wrapping_add(ms_to_sleep_ticks(ms));
    if !SLEEP_QUEUE.lock().upsert(task_id, wake_tick) {
        return SleepOutcome::Completed;
    }

    if task_set_state_with_reason(task_id, TaskStatus::Blocked, BlockReason::Sleep) != 0 {
        cancel_sleep(task_id);
        return SleepOutcome::Completed;
    }

    unschedule_task(current);
    schedule();

    if task_has_pending_signal(current) {
        let now = platform::timer_ticks();
        let remaining_ticks = wake_tick.saturating_sub(now);
        cancel_sleep(task_id);
        SleepOutcome::Interrupted {
            remaining_ms: sleep_ticks_to_ms(remaining_ticks),
        }
    } else {
        SleepOutcome::Completed
    }
}

/// Block the current task indefinitely until a deliverable signal arrives.
/// Used by `pause()`, which per POSIX always returns with EINTR.
pub fn pause_current_task() {
    if !is_scheduling_active() {
        return;
    }

    let current = scheduler_get_current_task();
    if current.is_null() || super::per_cpu::is_idle_task(current) {
        return;
    }

    let task_id = unsafe { (*current).task_id };
    if task_id == INVALID_TASK_ID {
        return;
    }

    if task_set_state_with_reason(task_id, TaskStatus::Blocked, BlockReason::Generic) != 0 {
        return;
    }

    unschedule_task(current);
    schedule();
}

#[derive(Copy, Clone)]
struct AlarmEntry {
    task_id: u32,
    wake_tick: u64,
    active: bool,
}

impl AlarmEntry {
    const fn empty() -> Self {
        Self {
            task_id: INVALID_TASK_ID,
            wake_tick: 0,
            active: false,
        }
    }
}

struct AlarmQueue {
    entries: [AlarmEntry; MAX_TASKS],
}

impl AlarmQueue {
    const fn new() -> Self {
        Self {
            entries: [AlarmEntry::empty(); MAX_TASKS],
        }
    }

    fn upsert(&mut self, task_id: u32, wake_tick: Option<u64>) -> u32 {
        let mut previous_remaining = 0u32;
        let now_tick = platform::timer_ticks();
        for entry in self.entries.iter_mut() {
            if entry.active && entry.task_id == task_id {
                if tick_reached(now_tick, entry.wake_tick) {
                    previous_remaining = 0;
                } else {
                    let remaining_ticks = entry.wake_tick.saturating_sub(now_tick);
                    let freq = platform::timer_frequency().max(1) as u64;
                    previous_remaining = ((remaining_ticks.saturating_add(freq - 1)) / freq)
                        .min(u32::MAX as u64) as u32;
                }
                *entry = AlarmEntry::empty();
                break;
            }
        }

        if let Some(deadline) = wake_tick {
            for entry in self.entries.iter_mut() {
                if !entry.active {
                    *entry = AlarmEntry {
                        task_id,
                        wake_tick: deadline,
                        active: true,
                    };
                    break;
                }
            }
        }

        previous_remaining
    }

    fn collect_due(&mut self, now_tick: u64, out: &mut [u32; MAX_TASKS]) -> usize {
        let mut count = 0usize;
        for entry in self.entries.iter_mut() {
            if !entry.active {
                continue;
            }
            if tick_reached(now_tick, entry.wake_tick) {
                if count < out.len() {
                    out[count] = entry.task_id;
                    count += 1;
                }
                *entry = AlarmEntry::empty();
            }
        }
        count
    }
}

static ALARM_QUEUE: IrqMutex<AlarmQueue> = IrqMutex::new(AlarmQueue::new());

/// Arm (or, with `seconds == 0`, disarm) the calling task's real-time alarm.
/// Returns the number of seconds left on any previously pending alarm, as
/// `alarm(2)` specifies.
pub fn set_alarm_seconds(task_id: u32, seconds: u32) -> u32 {
    let deadline = if seconds == 0 {
        None
    } else {
        let freq = platform::timer_frequency() as u64;
        let ticks_per_sec = freq.max(1);
        Some(platform::timer_ticks().wrapping_add((seconds as u64).saturating_mul(ticks_per_sec)))
    };

    ALARM_QUEUE.lock().upsert(task_id, deadline)
}

/// Called from the timer tick: deliver SIGALRM to every task whose alarm
/// has expired.
pub fn wake_due_alarms(now_tick: u64) {
    let mut due = [INVALID_TASK_ID; MAX_TASKS];
    let due_count = {
        let mut queue = ALARM_QUEUE.lock();
        queue.collect_due(now_tick, &mut due)
    };

    for task_id in due.iter().take(due_count) {
        deliver_sigalrm(*task_id);
    }
}

fn deliver_sigalrm(task_id: u32) {
    if task_id == INVALID_TASK_ID {
        return;
    }
    let task = task_find_by_id(task_id);
    if task.is_null() || task_is_invalid(task) || task_is_terminated(task) {
        return;
    }
    unsafe {
        (*task)
            .signal_pending
            .fetch_or(slopos_abi::signal::sig_bit(slopos_abi::signal::SIGALRM), core::sync::atomic::Ordering::AcqRel);
    }
    let _ = super::scheduler::unblock_task(task);
}

fn wake_sleeping_task(task_id: u32) {
    if task_id == INVALID_TASK_ID {
        return;
    }

    let task = task_find_by_id(task_id);
    if task.is_null() || task_is_invalid(task) || task_is_terminated(task) {
        return;
    }

    let is_sleep_blocked =
        task_is_blocked(task) && unsafe { (*task).block_reason == BlockReason::Sleep };
    if !is_sleep_blocked {
        return;
    }

    if task_set_state_with_reason(task_id, TaskStatus::Ready, BlockReason::None) != 0 {
        return;
    }

    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    let _ = schedule_task(task);
}

pub fn wake_due_sleepers(now_tick: u64) {
    let mut due = [INVALID_TASK_ID; MAX_TASKS];
    let due_count = {
        let mut queue = SLEEP_QUEUE.lock();
        queue.collect_due(now_tick, &mut due)
    };

    for task_id in due.iter().take(due_count) {
        wake_sleeping_task(*task_id);
    }
}

pub fn reset_sleep_queue() {
    SLEEP_QUEUE.lock().clear();
}

pub fn cancel_sleep(task_id: u32) {
    if task_id == INVALID_TASK_ID {
        return;
    }
    SLEEP_QUEUE.lock().remove(task_id);
}

pub fn sleep_current_task_ms(ms: u32) -> c_int {
    if ms == 0 {
        return 0;
    }

    if !is_scheduling_active() {
        platform::timer_poll_delay_ms(ms);
        return 0;
    }

    let current = scheduler_get_current_task();
    if current.is_null() {
        return -1;
    }
    if super::per_cpu::is_idle_task(current) {
        platform::timer_poll_delay_ms(ms);
        return 0;
    }

    let task_id = unsafe { (*current).task_id };
    if task_id == INVALID_TASK_ID {
        return -1;
    }

    let now_tick = platform::timer_ticks();
    let wake_tick = now_tick.wrapping_add(ms_to_sleep_ticks(ms));
    if !SLEEP_QUEUE.lock().upsert(task_id, wake_tick) {
        return -1;
    }

    if task_set_state_with_reason(task_id, TaskStatus::Blocked, BlockReason::Sleep) != 0 {
        cancel_sleep(task_id);
        return -1;
    }

    unschedule_task(current);
    schedule();
    0
}
