//! Task identity and per-task bookkeeping.

use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub(crate) type LocalBoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Unique identifier for a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Lifecycle state of a task.
///
/// Exactly one task is `Running` at any instant; a suspended task holds no
/// CPU and is resumed only by an explicit scheduler event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned or woken, queued for its next turn on the scheduler.
    Idle,
    Running,
    SuspendedOnIo,
    SuspendedOnSleep,
    Terminated,
}

/// Why a blocking primitive suspended the current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    Io,
    Sleep,
}

impl SuspendReason {
    pub(crate) fn state(self) -> TaskState {
        match self {
            SuspendReason::Io => TaskState::SuspendedOnIo,
            SuspendReason::Sleep => TaskState::SuspendedOnSleep,
        }
    }
}

pub(crate) struct Task {
    pub future: Option<LocalBoxFuture>,
    pub state: TaskState,
    /// Deferred cleanup actions, run LIFO exactly once at termination,
    /// whether the task finished normally or was dropped at shutdown.
    pub defers: Vec<Box<dyn FnOnce()>>,
    /// The task that spawned this one, if any.
    pub parent: Option<TaskId>,
}

/// The spawned task completed without delivering its output (it was
/// dropped at runtime shutdown before finishing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinError;

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task was cancelled before completing")
    }
}

impl std::error::Error for JoinError {}

/// Handle to a spawned task; await it for the task's output.
pub struct JoinHandle<T> {
    pub(crate) id: TaskId,
    pub(crate) rx: oneshot::Receiver<T>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.map_err(|_| JoinError))
    }
}
