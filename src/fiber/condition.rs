use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::time::Duration;
use std::time::Instant;

use crate::fiber::GroupShared;
use crate::fiber::GroupStopped;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitState {
    Waiting,
    Signaled,
    TimedOut,
    Cancelled,
}

/// One suspended wait of one fiber.
///
/// The node may sit on a waiter list and on the schedule-timeout queue at the
/// same time; whichever of signal/timeout/cancel fires first moves the state
/// out of `Waiting` exactly once, and the loser finds the node already
/// completed and skips it.
pub(crate) struct WaitNode {
    state: Cell<WaitState>,
    waker: RefCell<Option<Waker>>,
}

impl WaitNode {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(WaitState::Waiting),
            waker: RefCell::new(None),
        })
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.state.get() == WaitState::Waiting
    }

    /// Move out of `Waiting` and wake the owning fiber. Returns false if the
    /// node was already completed.
    pub(crate) fn complete(&self, s: WaitState) -> bool {
        if !self.is_waiting() {
            return false;
        }
        self.state.set(s);
        if let Some(w) = self.waker.borrow_mut().take() {
            w.wake();
        }
        true
    }

    fn set_waker(&self, cx: &Context<'_>) {
        *self.waker.borrow_mut() = Some(cx.waker().clone());
    }
}

/// FIFO waiter list shared by the WaitSource family.
pub(crate) type CondCore = Rc<RefCell<VecDeque<Rc<WaitNode>>>>;

pub(crate) fn new_cond_core() -> CondCore {
    Rc::new(RefCell::new(VecDeque::new()))
}

/// Wake the first live waiter, skipping nodes already timed out or cancelled.
pub(crate) fn signal_one(core: &CondCore) {
    let mut waiters = core.borrow_mut();
    while let Some(n) = waiters.pop_front() {
        if n.complete(WaitState::Signaled) {
            break;
        }
    }
}

pub(crate) fn signal_all_waiters(core: &CondCore) {
    let mut waiters = core.borrow_mut();
    while let Some(n) = waiters.pop_front() {
        n.complete(WaitState::Signaled);
    }
}

/// A condition variable for fibers of one group.
///
/// Waiters resume in FIFO order. All operations must happen on the owning
/// dispatcher thread.
pub struct FiberCondition {
    name: String,
    shared: Rc<GroupShared>,
    core: CondCore,
}

impl FiberCondition {
    pub(crate) fn new(name: String, shared: Rc<GroupShared>) -> Self {
        Self {
            name,
            shared,
            core: new_cond_core(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) {
        if self.shared.stopped.get() {
            return;
        }
        signal_one(&self.core);
    }

    pub fn signal_all(&self) {
        if self.shared.stopped.get() {
            return;
        }
        signal_all_waiters(&self.core);
    }

    /// Suspend the calling fiber until signaled.
    pub fn wait(&self) -> CondWait {
        CondWait::new(self.shared.clone(), Some(self.core.clone()), None)
    }

    /// Suspend the calling fiber until signaled or until `timeout` elapses,
    /// whichever happens first.
    pub fn wait_timeout(&self, timeout: Duration) -> CondWait {
        let deadline = self.shared.ts.now() + timeout;
        CondWait::new(self.shared.clone(), Some(self.core.clone()), Some(deadline))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// A pending wait on a condition and/or the timeout queue.
///
/// Dropping the future cancels the wait; the abandoned node is skipped by
/// both lists.
pub struct CondWait {
    shared: Rc<GroupShared>,
    core: Option<CondCore>,
    deadline: Option<Instant>,
    node: Option<Rc<WaitNode>>,
}

impl CondWait {
    pub(crate) fn new(shared: Rc<GroupShared>, core: Option<CondCore>, deadline: Option<Instant>) -> Self {
        Self {
            shared,
            core,
            deadline,
            node: None,
        }
    }
}

impl Future for CondWait {
    type Output = Result<WaitOutcome, GroupStopped>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(node) = &this.node {
            return match node.state.get() {
                WaitState::Waiting => {
                    if this.shared.stopped.get() {
                        node.complete(WaitState::Cancelled);
                        return Poll::Ready(Err(GroupStopped));
                    }
                    node.set_waker(cx);
                    Poll::Pending
                }
                WaitState::Signaled => Poll::Ready(Ok(WaitOutcome::Signaled)),
                WaitState::TimedOut => Poll::Ready(Ok(WaitOutcome::TimedOut)),
                WaitState::Cancelled => Poll::Ready(Err(GroupStopped)),
            };
        }

        if this.shared.stopped.get() {
            return Poll::Ready(Err(GroupStopped));
        }
        let node = WaitNode::new();
        node.set_waker(cx);
        if let Some(core) = &this.core {
            core.borrow_mut().push_back(node.clone());
        }
        if let Some(deadline) = this.deadline {
            this.shared.timer.schedule(deadline, node.clone());
        }
        this.node = Some(node);
        Poll::Pending
    }
}

impl Drop for CondWait {
    fn drop(&mut self) {
        if let Some(n) = &self.node {
            n.complete(WaitState::Cancelled);
        }
    }
}
