//! The cooperative scheduler.
//!
//! Single-threaded model: exactly one task runs at a time. A blocking
//! primitive suspends by registering a wait (descriptor interest and/or a
//! deadline) and yielding; the run loop polls ready tasks and, when none
//! are ready, blocks the whole process in the poller until an event fires.
//! Resumption order is delivery order. Whichever of {I/O ready, timer
//! fire, cancel} arrives first wins, and the loser is deactivated.

use crate::base::neterror::NetError;
use crate::runtime::hook::{HookFlags, HookTable, IoMode};
use crate::runtime::reactor::{Interest, Reactor};
use crate::runtime::task::{JoinHandle, SuspendReason, Task, TaskId, TaskState};
use crate::runtime::timer::TimerHeap;
use futures::channel::oneshot;
use parking_lot::Mutex;
use polling::Poller;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

pub(crate) type WaitId = usize;

/// What resumed a suspended operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The descriptor became ready.
    Io(Interest),
    /// The bound timer fired first.
    TimedOut,
    /// The owner cancelled the wait (e.g. the socket was closed).
    Closed,
}

/// One suspension: descriptor interest and/or a deadline.
pub(crate) struct WaitSpec {
    pub fd: Option<(RawFd, Interest)>,
    pub deadline: Option<Instant>,
    pub reason: SuspendReason,
}

struct WaitSlot {
    task: TaskId,
    waker: Option<Waker>,
    outcome: Option<WaitOutcome>,
    fd: Option<RawFd>,
    timer_generation: Option<u64>,
}

struct Shared {
    tasks: RefCell<Slab<Task>>,
    waits: RefCell<Slab<WaitSlot>>,
    /// Waker-facing; the only state a waker may touch, so the only state
    /// that needs a lock.
    ready: Arc<Mutex<VecDeque<usize>>>,
    timers: RefCell<TimerHeap>,
    reactor: Reactor,
    hooks: RefCell<HookTable>,
    current: Cell<Option<TaskId>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

struct TaskWaker {
    id: usize,
    ready: Arc<Mutex<VecDeque<usize>>>,
    poller: Arc<Poller>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.lock().push_back(self.id);
        let _ = self.poller.notify();
    }
}

/// Cloneable handle to the scheduler owning the current thread's tasks.
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Handle {
    /// The handle of the runtime currently driving this thread.
    ///
    /// # Panics
    ///
    /// Panics outside of `Runtime::block_on`. Use [`Handle::try_current`]
    /// to probe.
    pub fn current() -> Handle {
        Self::try_current().expect("no coronet runtime is driving this thread")
    }

    pub fn try_current() -> Option<Handle> {
        CONTEXT.with(|c| c.borrow().clone())
    }

    /// Spawns a task. The parent/origin task is the one running at spawn
    /// time, if any.
    pub fn spawn<T, F>(&self, future: F) -> JoinHandle<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let parent = self.shared.current.get();
        let wrapped = Box::pin(async move {
            let _ = tx.send(future.await);
        });
        let id = self.shared.tasks.borrow_mut().insert(Task {
            future: Some(wrapped),
            state: TaskState::Idle,
            defers: Vec::new(),
            parent,
        });
        self.shared.ready.lock().push_back(id);
        JoinHandle {
            id: TaskId(id),
            rx,
        }
    }

    /// The task currently executing, if the scheduler is mid-poll.
    pub fn current_task(&self) -> Option<TaskId> {
        self.shared.current.get()
    }

    /// State of a task, or None once it has terminated and been reaped.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.shared.tasks.borrow().get(id.0).map(|t| t.state)
    }

    pub fn parent_of(&self, id: TaskId) -> Option<TaskId> {
        self.shared.tasks.borrow().get(id.0).and_then(|t| t.parent)
    }

    /// Registers a cleanup action on the current task. Deferred actions
    /// run in reverse registration order exactly once, at task
    /// termination, regardless of how the task ends.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a task.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        let id = self
            .shared
            .current
            .get()
            .expect("defer() must be called from within a task");
        if let Some(task) = self.shared.tasks.borrow_mut().get_mut(id.0) {
            task.defers.push(Box::new(f));
        }
    }

    pub fn enable_hooks(&self, flags: HookFlags) -> Result<(), NetError> {
        self.shared.hooks.borrow_mut().enable(flags)
    }

    pub fn disable_hooks(&self) -> bool {
        self.shared.hooks.borrow_mut().disable()
    }

    pub fn enable_strict_mode(&self) -> Result<(), NetError> {
        self.shared.hooks.borrow_mut().enable_strict_mode()
    }

    pub fn hook_mode(&self, category: HookFlags) -> IoMode {
        self.shared.hooks.borrow().mode(category)
    }

    pub fn active_hooks(&self) -> HookFlags {
        self.shared.hooks.borrow().active()
    }

    /// Registers a wait for the current task and returns the future that
    /// resolves to its outcome. Arms the descriptor and the deadline
    /// timer immediately, so a cancel can land even before first poll.
    pub(crate) fn register_wait(&self, spec: WaitSpec) -> Result<WaitFuture, NetError> {
        let task = self
            .shared
            .current
            .get()
            .ok_or(NetError::NoRuntimeContext)?;
        let mut waits = self.shared.waits.borrow_mut();
        let entry = waits.vacant_entry();
        let id = entry.key();
        if let Some((fd, interest)) = spec.fd {
            self.shared
                .reactor
                .add(fd, id, interest)
                .map_err(|e| NetError::from_io(&e))?;
        }
        let timer_generation = spec
            .deadline
            .map(|deadline| self.shared.timers.borrow_mut().insert(id, deadline));
        entry.insert(WaitSlot {
            task,
            waker: None,
            outcome: None,
            fd: spec.fd.map(|(fd, _)| fd),
            timer_generation,
        });
        drop(waits);
        // How the task will appear once it yields.
        if let Some(t) = self.shared.tasks.borrow_mut().get_mut(task.0) {
            t.state = spec.reason.state();
        }
        Ok(WaitFuture {
            handle: self.clone(),
            id,
            done: false,
        })
    }

    pub(crate) fn complete_io(&self, id: WaitId, readiness: Interest) {
        self.complete(id, WaitOutcome::Io(readiness), None);
    }

    pub(crate) fn complete_timeout(&self, id: WaitId, generation: u64) {
        self.complete(id, WaitOutcome::TimedOut, Some(generation));
    }

    /// Resumes the waiting task with a "closed" outcome; used by
    /// `Socket::close` to cancel a pending suspend it owns.
    pub(crate) fn cancel_wait(&self, id: WaitId) {
        self.complete(id, WaitOutcome::Closed, None);
    }

    fn complete(&self, id: WaitId, outcome: WaitOutcome, generation_filter: Option<u64>) {
        let mut waits = self.shared.waits.borrow_mut();
        let Some(slot) = waits.get_mut(id) else {
            return;
        };
        if slot.outcome.is_some() {
            // First event won; this one lost the race.
            return;
        }
        if let Some(generation) = generation_filter {
            if slot.timer_generation != Some(generation) {
                return;
            }
        }
        if let Some(fd) = slot.fd.take() {
            self.shared.reactor.delete(fd);
        }
        slot.timer_generation = None;
        slot.outcome = Some(outcome);
        let waker = slot.waker.take();
        let task = slot.task;
        drop(waits);
        match waker {
            Some(w) => w.wake(),
            // Completed before first poll: queue the owning task directly.
            None => self.shared.ready.lock().push_back(task.0),
        }
    }

    /// A wait future was dropped before completion (task cancelled).
    fn discard_wait(&self, id: WaitId) {
        let mut waits = self.shared.waits.borrow_mut();
        if waits.contains(id) {
            let slot = waits.remove(id);
            if let Some(fd) = slot.fd {
                self.shared.reactor.delete(fd);
            }
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("tasks", &self.shared.tasks.borrow().len())
            .field("waits", &self.shared.waits.borrow().len())
            .finish()
    }
}

/// Future side of a wait registration. Resolves to the winning outcome;
/// dropping it before completion deactivates the registration.
pub(crate) struct WaitFuture {
    handle: Handle,
    id: WaitId,
    done: bool,
}

impl WaitFuture {
    pub fn id(&self) -> WaitId {
        self.id
    }
}

impl Future for WaitFuture {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut waits = this.handle.shared.waits.borrow_mut();
        let Some(slot) = waits.get_mut(this.id) else {
            this.done = true;
            return Poll::Ready(WaitOutcome::Closed);
        };
        if let Some(outcome) = slot.outcome.take() {
            let task = slot.task;
            waits.remove(this.id);
            drop(waits);
            this.done = true;
            if let Some(t) = this.handle.shared.tasks.borrow_mut().get_mut(task.0) {
                t.state = TaskState::Running;
            }
            Poll::Ready(outcome)
        } else {
            slot.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for WaitFuture {
    fn drop(&mut self) {
        if !self.done {
            self.handle.discard_wait(self.id);
        }
    }
}

/// The runtime: owns the scheduler state and drives it to completion.
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    /// Creates a runtime with every hook category enabled.
    pub fn new() -> io::Result<Runtime> {
        let rt = Self::with_hooks(HookFlags::ALL)?;
        Ok(rt)
    }

    /// Creates a runtime with the given hook categories enabled.
    pub fn with_hooks(flags: HookFlags) -> io::Result<Runtime> {
        let reactor = Reactor::new()?;
        let handle = Handle {
            shared: Rc::new(Shared {
                tasks: RefCell::new(Slab::new()),
                waits: RefCell::new(Slab::new()),
                ready: Arc::new(Mutex::new(VecDeque::new())),
                timers: RefCell::new(TimerHeap::new()),
                reactor,
                hooks: RefCell::new(HookTable::new()),
                current: Cell::new(None),
            }),
        };
        if !flags.is_empty() {
            // Fresh table, cannot conflict with strict mode.
            let _ = handle.shared.hooks.borrow_mut().enable(flags);
        }
        Ok(Runtime { handle })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Runs `future` as the root task until it completes, then drops any
    /// remaining tasks (running their deferred cleanups) and returns the
    /// root's output.
    pub fn block_on<T, F>(&self, future: F) -> T
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let _ctx = ContextGuard::enter(self.handle.clone());
        let out: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let slot = out.clone();
        let root = self.handle.spawn(async move {
            *slot.borrow_mut() = Some(future.await);
        });
        let root_id = root.id();
        drop(root);
        self.run_until(root_id);
        self.shutdown();
        let value = out.borrow_mut().take();
        value.expect("root task did not run to completion")
    }

    fn run_until(&self, root: TaskId) {
        let shared = &self.handle.shared;
        let mut events: Vec<(usize, Interest)> = Vec::with_capacity(64);
        loop {
            loop {
                let next = shared.ready.lock().pop_front();
                match next {
                    Some(id) => self.poll_task(TaskId(id)),
                    None => break,
                }
            }
            if !shared.tasks.borrow().contains(root.0) {
                break;
            }
            let now = Instant::now();
            let timeout = shared
                .timers
                .borrow()
                .peek_deadline()
                .map(|d| d.saturating_duration_since(now));
            if timeout.is_none() && shared.waits.borrow().is_empty() {
                // Nothing can ever wake us again.
                panic!("coronet: deadlock: no ready tasks and no pending I/O or timers");
            }
            events.clear();
            match shared.reactor.wait(&mut events, timeout) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => panic!("coronet: reactor wait failed: {e}"),
            }
            for (wait, readiness) in events.drain(..) {
                self.handle.complete_io(wait, readiness);
            }
            let now = Instant::now();
            let expired = shared.timers.borrow_mut().pop_expired(now);
            for (wait, generation) in expired {
                self.handle.complete_timeout(wait, generation);
            }
        }
    }

    fn poll_task(&self, id: TaskId) {
        let shared = &self.handle.shared;
        let mut future = {
            let mut tasks = shared.tasks.borrow_mut();
            let Some(task) = tasks.get_mut(id.0) else {
                return;
            };
            let Some(future) = task.future.take() else {
                return;
            };
            task.state = TaskState::Running;
            future
        };
        shared.current.set(Some(id));
        let waker = Waker::from(Arc::new(TaskWaker {
            id: id.0,
            ready: shared.ready.clone(),
            poller: shared.reactor.poller_arc(),
        }));
        let mut cx = Context::from_waker(&waker);
        let poll = future.as_mut().poll(&mut cx);
        shared.current.set(None);
        match poll {
            Poll::Ready(()) => {
                let mut task = shared.tasks.borrow_mut().remove(id.0);
                task.state = TaskState::Terminated;
                let mut defers = std::mem::take(&mut task.defers);
                drop(task);
                while let Some(f) = defers.pop() {
                    f();
                }
            }
            Poll::Pending => {
                let mut tasks = shared.tasks.borrow_mut();
                if let Some(task) = tasks.get_mut(id.0) {
                    task.future = Some(future);
                    if task.state == TaskState::Running {
                        task.state = TaskState::Idle;
                    }
                }
            }
        }
    }

    /// Drops every remaining task. Deferred cleanups still run; wait
    /// registrations are discarded as the futures drop.
    fn shutdown(&self) {
        let shared = &self.handle.shared;
        let leftovers: Vec<Task> = {
            let mut tasks = shared.tasks.borrow_mut();
            tasks.drain().collect()
        };
        for mut task in leftovers {
            drop(task.future.take());
            let mut defers = std::mem::take(&mut task.defers);
            while let Some(f) = defers.pop() {
                f();
            }
        }
        shared.ready.lock().clear();
        shared.timers.borrow_mut().clear();
    }
}

struct ContextGuard {
    previous: Option<Handle>,
}

impl ContextGuard {
    fn enter(handle: Handle) -> ContextGuard {
        let previous = CONTEXT.with(|c| c.borrow_mut().replace(handle));
        ContextGuard { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|c| *c.borrow_mut() = previous);
    }
}
