use slopos_abi::syscall::{ERRNO_EFAULT, ERRNO_EINTR, ERRNO_EINVAL, Timespec};
use slopos_mm::user_copy::{copy_from_user, copy_to_user};
use slopos_mm::user_ptr::UserPtr;

use crate::scheduler::sleep::{
    SleepOutcome, pause_current_task, set_alarm_seconds, sleep_current_task_ms_interruptible,
};

define_syscall!(syscall_nanosleep(ctx, args) {
    let req_ptr = match UserPtr::<Timespec>::try_new(args.arg0) {
        Ok(p) => p,
        Err(_) => return ctx.ok(ERRNO_EFAULT),
    };
    let req = match copy_from_user(req_ptr) {
        Ok(ts) => ts,
        Err(_) => return ctx.ok(ERRNO_EFAULT),
    };

    if req.tv_nsec >= 1_000_000_000 {
        return ctx.ok(ERRNO_EINVAL);
    }

    let total_ms = req
        .tv_sec
        .saturating_mul(1000)
        .saturating_add(req.tv_nsec / 1_000_000)
        .min(u32::MAX as u64) as u32;

    match sleep_current_task_ms_interruptible(total_ms) {
        SleepOutcome::Completed => ctx.ok(0),
        SleepOutcome::Interrupted { remaining_ms } => {
            if args.arg1 != 0 {
                let rem = Timespec {
                    tv_sec: (remaining_ms / 1000) as u64,
                    tv_nsec: ((remaining_ms % 1000) * 1_000_000) as u64,
                };
                let rem_ptr = match UserPtr::<Timespec>::try_new(args.arg1) {
                    Ok(p) => p,
                    Err(_) => return ctx.ok(ERRNO_EFAULT),
                };
                if copy_to_user(rem_ptr, &rem).is_err() {
                    return ctx.ok(ERRNO_EFAULT);
                }
            }
            ctx.ok(ERRNO_EINTR)
        }
    }
});

define_syscall!(syscall_alarm(ctx, args) requires(let task_id) {
    let seconds = args.arg0 as u32;
    let previous = set_alarm_seconds(task_id, seconds);
    ctx.ok(previous as u64)
});

define_syscall!(syscall_pause(ctx, args) {
    let _ = args;
    pause_current_task();
    ctx.ok(ERRNO_EINTR)
});
