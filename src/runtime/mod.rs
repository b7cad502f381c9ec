//! Cooperative stackful-style concurrency on one thread.
//!
//! [`Runtime::block_on`] drives a root task and everything it spawns.
//! Tasks suspend inside blocking-style operations (socket I/O, [`sleep`])
//! and the scheduler resumes them as readiness events and timers fire.
//! Exactly one task executes at any instant, so task-local state needs no
//! locking.
//!
//! ```no_run
//! use coronet::runtime::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! rt.block_on(async {
//!     let handle = coronet::runtime::Handle::current();
//!     let child = handle.spawn(async { 21 * 2 });
//!     assert_eq!(child.await.unwrap(), 42);
//! });
//! ```

pub mod hook;
mod reactor;
mod scheduler;
mod task;
mod timer;

pub use hook::{HookFlags, HookTable, IoMode};
pub use scheduler::{Handle, Runtime};
pub use task::{JoinError, JoinHandle, TaskId, TaskState};

pub(crate) use reactor::Interest;
pub(crate) use scheduler::{WaitId, WaitOutcome, WaitSpec};
pub(crate) use task::SuspendReason;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Suspends the current task for at least `duration`.
///
/// With the SLEEP hook disabled, or outside a runtime, this falls back to
/// `std::thread::sleep` and blocks the whole thread.
pub async fn sleep(duration: Duration) {
    let Some(handle) = Handle::try_current() else {
        std::thread::sleep(duration);
        return;
    };
    if handle.hook_mode(HookFlags::SLEEP) == IoMode::Direct {
        std::thread::sleep(duration);
        return;
    }
    let wait = handle.register_wait(WaitSpec {
        fd: None,
        deadline: Some(Instant::now() + duration),
        reason: SuspendReason::Sleep,
    });
    match wait {
        Ok(wait) => {
            let _ = wait.await;
        }
        Err(_) => std::thread::sleep(duration),
    }
}

/// [`sleep`] taking microseconds.
pub async fn usleep(micros: u64) {
    sleep(Duration::from_micros(micros)).await;
}

/// Yields the current task's turn, letting every other ready task run
/// before this one resumes.
pub async fn yield_now() {
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                Poll::Ready(())
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    YieldNow { yielded: false }.await;
}
