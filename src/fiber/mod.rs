//! A single-threaded cooperative fiber runtime.
//!
//! A [`Dispatcher`] thread owns any number of [`FiberGroup`]s; each group owns
//! fibers, which are `!Send` futures polled by the dispatcher. All mutation of
//! a group's state happens on the owning dispatcher thread without locks.
//! Other threads influence a group only through the dispatcher's shared task
//! queue: fiber wakers route wakeups through it, and [`ChannelSender`] routes
//! values through it.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Waker;
use std::time::Duration;

mod channel;
mod condition;
mod dispatcher;
mod future;
mod time;

pub use channel::ChannelSender;
pub use channel::FiberChannel;
pub use condition::CondWait;
pub use condition::FiberCondition;
pub use condition::WaitOutcome;
pub use dispatcher::Dispatcher;
pub use future::FiberFuture;
pub use time::Timestamp;

pub(crate) use dispatcher::DispatcherState;
pub(crate) use dispatcher::FiberWaker;
pub(crate) use dispatcher::SharedSender;
pub(crate) use dispatcher::TimerQueue;

/// Returned by suspend points when the owning group has been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("fiber group stopped")]
pub struct GroupStopped;

/// Group state reachable from wait sources without a cycle back to the group.
pub(crate) struct GroupShared {
    pub(crate) stopped: Cell<bool>,
    pub(crate) timer: Rc<TimerQueue>,
    pub(crate) ts: Rc<Timestamp>,
}

struct Fiber {
    id: u64,
    name: String,
    daemon: bool,
    ready: Cell<bool>,
    done: Cell<bool>,
    fut: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    waker: Waker,
}

/// The consensus-group-scoped container of fibers, bound to exactly one
/// dispatcher.
///
/// Daemon fibers are cancelled (dropped) when the group stops; the group
/// finishes once it is stopped and no normal fiber remains.
pub struct FiberGroup {
    name: String,
    group_id: u64,
    shared: Rc<GroupShared>,
    sender: SharedSender,
    fibers: RefCell<HashMap<u64, Rc<Fiber>>>,
    ready: RefCell<VecDeque<u64>>,
    channels: RefCell<HashMap<u32, Rc<dyn channel::AnyChannel>>>,
    next_fiber_id: Cell<u64>,
    next_channel_key: Cell<u32>,
    normal_count: Cell<usize>,
}

impl FiberGroup {
    pub(crate) fn new(
        name: String,
        group_id: u64,
        sender: SharedSender,
        timer: Rc<TimerQueue>,
        ts: Rc<Timestamp>,
    ) -> Self {
        Self {
            name,
            group_id,
            shared: Rc::new(GroupShared {
                stopped: Cell::new(false),
                timer,
                ts,
            }),
            sender,
            fibers: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            channels: RefCell::new(HashMap::new()),
            next_fiber_id: Cell::new(0),
            next_channel_key: Cell::new(0),
            normal_count: Cell::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn timestamp(&self) -> Rc<Timestamp> {
        self.shared.ts.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.get()
    }

    /// Spawn a fiber that the group waits for before finishing.
    pub fn spawn(&self, name: impl Into<String>, fut: impl Future<Output = ()> + 'static) {
        self.spawn0(name.into(), false, fut);
    }

    /// Spawn a fiber that is cancelled when the group stops.
    pub fn spawn_daemon(&self, name: impl Into<String>, fut: impl Future<Output = ()> + 'static) {
        self.spawn0(name.into(), true, fut);
    }

    fn spawn0(&self, name: String, daemon: bool, fut: impl Future<Output = ()> + 'static) {
        if self.shared.stopped.get() && daemon {
            return;
        }
        let id = self.next_fiber_id.get();
        self.next_fiber_id.set(id + 1);
        let waker = Waker::from(Arc::new(FiberWaker {
            sender: self.sender.clone(),
            group_id: self.group_id,
            fiber_id: id,
        }));
        let fiber = Rc::new(Fiber {
            id,
            name,
            daemon,
            ready: Cell::new(false),
            done: Cell::new(false),
            fut: RefCell::new(Some(Box::pin(fut))),
            waker,
        });
        if !daemon {
            self.normal_count.set(self.normal_count.get() + 1);
        }
        self.fibers.borrow_mut().insert(id, fiber);
        self.make_ready(id);
    }

    pub fn new_condition(&self, name: impl Into<String>) -> FiberCondition {
        FiberCondition::new(name.into(), self.shared.clone())
    }

    pub fn new_future<T>(&self, name: impl Into<String>) -> FiberFuture<T> {
        FiberFuture::new(name.into(), self.shared.clone())
    }

    pub fn new_channel<T: 'static>(&self) -> FiberChannel<T> {
        let key = self.next_channel_key.get();
        self.next_channel_key.set(key + 1);
        let (chan, core) =
            FiberChannel::new(self.shared.clone(), self.group_id, key, self.sender.clone());
        self.channels.borrow_mut().insert(key, core);
        chan
    }

    /// Suspend the calling fiber for `dur`.
    pub fn sleep(&self, dur: Duration) -> CondWait {
        let deadline = self.shared.ts.now() + dur;
        CondWait::new(self.shared.clone(), None, Some(deadline))
    }

    /// Stop this group: cancel daemon fibers, wake everything else so pending
    /// waits resolve to [`GroupStopped`].
    pub fn request_stop(&self) {
        if self.shared.stopped.get() {
            return;
        }
        self.shared.stopped.set(true);
        let daemon_ids: Vec<u64> = self
            .fibers
            .borrow()
            .values()
            .filter(|f| f.daemon)
            .map(|f| f.id)
            .collect();
        {
            let mut fibers = self.fibers.borrow_mut();
            for id in daemon_ids {
                fibers.remove(&id);
            }
        }
        let ids: Vec<u64> = self.fibers.borrow().keys().copied().collect();
        for id in ids {
            self.make_ready(id);
        }
    }

    pub(crate) fn make_ready(&self, fiber_id: u64) {
        let fibers = self.fibers.borrow();
        let fiber = match fibers.get(&fiber_id) {
            Some(f) => f,
            None => return,
        };
        if fiber.done.get() || fiber.ready.get() {
            return;
        }
        fiber.ready.set(true);
        drop(fibers);
        self.ready.borrow_mut().push_back(fiber_id);
    }

    pub(crate) fn offer_from_outside(&self, key: u32, v: Box<dyn Any>) {
        let core = self.channels.borrow().get(&key).cloned();
        if let Some(core) = core {
            core.offer_boxed(v);
        }
    }

    /// Run every ready fiber, including fibers made ready while draining.
    pub(crate) fn exec_ready_fibers(&self) {
        loop {
            let id = match self.ready.borrow_mut().pop_front() {
                Some(id) => id,
                None => break,
            };
            let fiber = match self.fibers.borrow().get(&id).cloned() {
                Some(f) => f,
                None => continue,
            };
            fiber.ready.set(false);
            if fiber.done.get() {
                continue;
            }
            let fut = fiber.fut.borrow_mut().take();
            let mut fut = match fut {
                Some(f) => f,
                None => continue,
            };
            let mut cx = Context::from_waker(&fiber.waker);
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    fiber.done.set(true);
                    tracing::trace!(group = %self.name, fiber = %fiber.name, "fiber finished");
                    self.remove_fiber(&fiber);
                }
                Poll::Pending => {
                    if self.shared.stopped.get() && fiber.daemon {
                        // Cancelled at group stop; dropping the future runs
                        // its cleanup.
                        self.remove_fiber(&fiber);
                    } else {
                        *fiber.fut.borrow_mut() = Some(fut);
                    }
                }
            }
        }
    }

    fn remove_fiber(&self, fiber: &Rc<Fiber>) {
        if self.fibers.borrow_mut().remove(&fiber.id).is_some() && !fiber.daemon {
            self.normal_count.set(self.normal_count.get() - 1);
        }
    }

    pub(crate) fn finished(&self) -> bool {
        self.shared.stopped.get() && self.normal_count.get() == 0
    }

    pub(crate) fn shared(&self) -> Rc<GroupShared> {
        self.shared.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn setup<F>(f: F) -> Dispatcher
    where F: FnOnce(&Rc<FiberGroup>) + Send + 'static {
        let d = Dispatcher::spawn("test-dispatcher").unwrap();
        d.create_group("test-group", f);
        d
    }

    fn teardown(d: Dispatcher) {
        d.request_shutdown();
        d.join();
    }

    #[test]
    fn test_fiber_runs_to_completion() {
        let (tx, rx) = mpsc::channel();
        let d = setup(move |g| {
            g.spawn("f1", async move {
                tx.send(42).unwrap();
            });
        });
        assert_eq!(42, rx.recv_timeout(RECV_TIMEOUT).unwrap());
        teardown(d);
    }

    #[test]
    fn test_condition_signal_wakes_in_fifo_order() {
        let (tx, rx) = mpsc::channel();
        let d = setup(move |g| {
            let cond = Rc::new(g.new_condition("c"));
            for i in 0..3 {
                let cond = cond.clone();
                let tx = tx.clone();
                g.spawn(format!("waiter-{}", i), async move {
                    cond.wait().await.unwrap();
                    tx.send(i).unwrap();
                });
            }
            let g2 = g.clone();
            g.spawn("signaler", async move {
                // let the waiters park first
                g2.sleep(Duration::from_millis(10)).await.unwrap();
                cond.signal();
                cond.signal();
                cond.signal();
            });
        });
        assert_eq!(0, rx.recv_timeout(RECV_TIMEOUT).unwrap());
        assert_eq!(1, rx.recv_timeout(RECV_TIMEOUT).unwrap());
        assert_eq!(2, rx.recv_timeout(RECV_TIMEOUT).unwrap());
        teardown(d);
    }

    #[test]
    fn test_wait_timeout_fires() {
        let (tx, rx) = mpsc::channel();
        let d = setup(move |g| {
            let cond = g.new_condition("never-signaled");
            g.spawn("waiter", async move {
                let start = Instant::now();
                let outcome = cond.wait_timeout(Duration::from_millis(20)).await.unwrap();
                tx.send((outcome, start.elapsed())).unwrap();
            });
        });
        let (outcome, elapsed) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(WaitOutcome::TimedOut, outcome);
        assert!(elapsed >= Duration::from_millis(20));
        teardown(d);
    }

    #[test]
    fn test_signal_and_timeout_resume_exactly_once() {
        // Signal just at the timeout deadline: the fiber must resume exactly
        // once no matter which side wins.
        let (tx, rx) = mpsc::channel();
        let d = setup(move |g| {
            let cond = Rc::new(g.new_condition("racy"));
            let c2 = cond.clone();
            g.spawn("waiter", async move {
                let _ = c2.wait_timeout(Duration::from_millis(5)).await.unwrap();
                tx.send(()).unwrap();
            });
            let g2 = g.clone();
            g.spawn("signaler", async move {
                g2.sleep(Duration::from_millis(5)).await.unwrap();
                cond.signal();
            });
        });
        rx.recv_timeout(RECV_TIMEOUT).unwrap();
        // a second resume would send twice
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        teardown(d);
    }

    #[test]
    fn test_channel_cross_thread_producer() {
        let (tx, rx) = mpsc::channel();
        let (sender_tx, sender_rx) = mpsc::channel();
        let d = Dispatcher::spawn("chan-dispatcher").unwrap();
        d.create_group("chan-group", move |g| {
            let chan: FiberChannel<u64> = g.new_channel();
            sender_tx.send(chan.sender()).unwrap();
            g.spawn("consumer", async move {
                let mut got = Vec::new();
                for _ in 0..3 {
                    got.push(chan.take().await.unwrap());
                }
                tx.send(got).unwrap();
            });
        });
        let sender = sender_rx.recv_timeout(RECV_TIMEOUT).unwrap();
        let t = std::thread::spawn(move || {
            for i in 0..3u64 {
                sender.send(i);
            }
        });
        t.join().unwrap();
        assert_eq!(vec![0, 1, 2], rx.recv_timeout(RECV_TIMEOUT).unwrap());
        teardown(d);
    }

    #[test]
    fn test_daemon_cancelled_at_stop() {
        let (tx, rx) = mpsc::channel();
        let d = setup(move |g| {
            let cond = g.new_condition("forever");
            g.spawn_daemon("daemon", async move {
                // never signaled; must be cancelled at group stop
                let _ = cond.wait().await;
                tx.send("resumed").unwrap();
            });
        });
        teardown(d);
        // daemon dropped, never resumed
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_normal_fiber_sees_group_stopped() {
        let (tx, rx) = mpsc::channel();
        let d = setup(move |g| {
            let cond = g.new_condition("forever");
            g.spawn("normal", async move {
                let r = cond.wait().await;
                tx.send(r).unwrap();
            });
        });
        d.request_shutdown();
        assert_eq!(Err(GroupStopped), rx.recv_timeout(RECV_TIMEOUT).unwrap());
        d.join();
    }

    #[test]
    fn test_fiber_future_complete_and_wait() {
        let (tx, rx) = mpsc::channel();
        let d = setup(move |g| {
            let f: FiberFuture<u32> = g.new_future("answer");
            let f2 = f.clone();
            g.spawn("waiter", async move {
                let v = f2.wait().await.unwrap();
                tx.send(v).unwrap();
            });
            let g2 = g.clone();
            g.spawn("completer", async move {
                g2.sleep(Duration::from_millis(5)).await.unwrap();
                f.complete(7);
            });
        });
        assert_eq!(7, rx.recv_timeout(RECV_TIMEOUT).unwrap());
        teardown(d);
    }
}
