use std::cell::Cell;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Wake;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crate::fiber::condition::WaitNode;
use crate::fiber::condition::WaitState;
use crate::fiber::FiberGroup;
use crate::fiber::Timestamp;

/// A unit of work handed to a dispatcher thread from any other thread.
///
/// This queue is the only path by which non-owning threads influence a group:
/// I/O completions arrive as `Wake` records produced by fiber wakers, and
/// everything else (group creation, inbound requests, shutdown) arrives as a
/// closure run on the dispatcher thread.
pub(crate) enum SharedTask {
    Run(Box<dyn FnOnce(&mut DispatcherState) + Send>),
    Wake { group_id: u64, fiber_id: u64 },
}

/// Cloneable, thread-safe sender side of the dispatcher's shared queue.
#[derive(Clone)]
pub(crate) struct SharedSender {
    tx: Arc<Mutex<mpsc::Sender<SharedTask>>>,
}

impl SharedSender {
    fn new(tx: mpsc::Sender<SharedTask>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(tx)),
        }
    }

    pub(crate) fn send(&self, task: SharedTask) {
        let guard = match self.tx.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        // A send failure means the dispatcher already exited; the task is
        // dropped, which cancels whatever it carried.
        let _ = guard.send(task);
    }

    pub(crate) fn run<F>(&self, f: F)
    where F: FnOnce(&mut DispatcherState) + Send + 'static {
        self.send(SharedTask::Run(Box::new(f)));
    }
}

/// Routes a fiber wakeup through the shared queue, so that a waker invoked on
/// any thread never touches group state directly.
pub(crate) struct FiberWaker {
    pub(crate) sender: SharedSender,
    pub(crate) group_id: u64,
    pub(crate) fiber_id: u64,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.sender.send(SharedTask::Wake {
            group_id: self.group_id,
            fiber_id: self.fiber_id,
        });
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    node: Rc<WaitNode>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed, so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The schedule-timeout queue of one dispatcher thread.
///
/// Nodes completed by a signal stay in the heap and are skipped when popped;
/// this is the idempotent double-removal of the signal/timeout race.
pub(crate) struct TimerQueue {
    heap: RefCell<BinaryHeap<TimerEntry>>,
    seq: Cell<u64>,
}

impl TimerQueue {
    fn new() -> Self {
        Self {
            heap: RefCell::new(BinaryHeap::new()),
            seq: Cell::new(0),
        }
    }

    pub(crate) fn schedule(&self, deadline: Instant, node: Rc<WaitNode>) {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.heap.borrow_mut().push(TimerEntry { deadline, seq, node });
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut heap = self.heap.borrow_mut();
        while let Some(e) = heap.peek() {
            if e.node.is_waiting() {
                return Some(e.deadline);
            }
            heap.pop();
        }
        None
    }

    fn fire_due(&self, now: Instant) {
        let mut heap = self.heap.borrow_mut();
        while let Some(e) = heap.peek() {
            if !e.node.is_waiting() {
                heap.pop();
                continue;
            }
            if e.deadline > now {
                break;
            }
            let e = match heap.pop() {
                Some(e) => e,
                None => break,
            };
            e.node.complete(WaitState::TimedOut);
        }
    }
}

/// Dispatcher-thread-local state: the groups this thread owns plus the timer
/// queue shared by all of them.
pub(crate) struct DispatcherState {
    pub(crate) name: String,
    pub(crate) groups: Vec<Rc<FiberGroup>>,
    pub(crate) timer: Rc<TimerQueue>,
    pub(crate) ts: Rc<Timestamp>,
    pub(crate) sender: SharedSender,
    should_stop: bool,
    next_group_id: u64,
}

impl DispatcherState {
    pub(crate) fn group(&self, group_id: u64) -> Option<&Rc<FiberGroup>> {
        self.groups.iter().find(|g| g.group_id() == group_id)
    }

    pub(crate) fn add_group(&mut self, name: String) -> Rc<FiberGroup> {
        let id = self.next_group_id;
        self.next_group_id += 1;
        let g = Rc::new(FiberGroup::new(
            name,
            id,
            self.sender.clone(),
            self.timer.clone(),
            self.ts.clone(),
        ));
        self.groups.push(g.clone());
        if self.should_stop {
            // Shutdown already requested; the new group starts stopped.
            g.request_stop();
        }
        g
    }

    pub(crate) fn request_shutdown(&mut self) {
        self.should_stop = true;
        for g in &self.groups {
            g.request_stop();
        }
    }
}

/// Handle to a single-threaded cooperative scheduler.
///
/// One dispatcher thread may own multiple fiber groups; within a group
/// execution is strictly single-threaded and cooperative.
pub struct Dispatcher {
    name: String,
    sender: SharedSender,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start a dispatcher thread.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Dispatcher> {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        let sender = SharedSender::new(tx);
        let loop_sender = sender.clone();
        let loop_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(loop_name, rx, loop_sender))?;
        Ok(Dispatcher {
            name,
            sender,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn sender(&self) -> SharedSender {
        self.sender.clone()
    }

    /// Create a fiber group on this dispatcher. `init` runs on the dispatcher
    /// thread with the new group and is the place to spawn its first fibers.
    pub fn create_group<F>(&self, name: impl Into<String>, init: F)
    where F: FnOnce(&Rc<FiberGroup>) + Send + 'static {
        let name = name.into();
        self.sender.run(move |state| {
            let g = state.add_group(name);
            init(&g);
        });
    }

    /// Ask every group on this dispatcher to stop; the thread exits once all
    /// groups have finished.
    pub fn request_shutdown(&self) {
        self.sender.run(|state| state.request_shutdown());
    }

    /// Wait for the dispatcher thread to exit.
    pub fn join(&self) {
        let handle = {
            let mut guard = match self.join.lock() {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
            guard.take()
        };
        if let Some(h) = handle {
            if h.join().is_err() {
                tracing::error!(dispatcher = %self.name, "dispatcher thread panicked");
            }
        }
    }
}

fn run_loop(name: String, rx: mpsc::Receiver<SharedTask>, sender: SharedSender) {
    let mut state = DispatcherState {
        name,
        groups: Vec::new(),
        timer: Rc::new(TimerQueue::new()),
        ts: Rc::new(Timestamp::new()),
        sender,
        should_stop: false,
        next_group_id: 0,
    };
    let mut local: Vec<SharedTask> = Vec::with_capacity(64);
    // Adaptive poll: block with a timeout when recently idle, drain without
    // blocking when recently busy.
    let mut poll = true;
    let poll_timeout = Duration::from_millis(50);

    loop {
        let start = Instant::now();
        if poll {
            let mut timeout = poll_timeout;
            if let Some(deadline) = state.timer.next_deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(start));
            }
            match rx.recv_timeout(timeout) {
                Ok(t) => local.push(t),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => state.should_stop = true,
            }
        } else {
            while let Ok(t) = rx.try_recv() {
                local.push(t);
            }
        }
        state.ts.refresh();
        poll = start.elapsed() > Duration::from_millis(2) || local.is_empty();

        for task in local.drain(..) {
            match task {
                SharedTask::Run(f) => f(&mut state),
                SharedTask::Wake { group_id, fiber_id } => {
                    if let Some(g) = state.group(group_id) {
                        g.make_ready(fiber_id);
                    }
                }
            }
        }

        state.timer.fire_due(state.ts.now());

        let groups = state.groups.clone();
        for g in &groups {
            g.exec_ready_fibers();
        }

        state.groups.retain(|g| {
            if g.finished() {
                tracing::info!(group = %g.name(), "fiber group finished");
                false
            } else {
                true
            }
        });

        if state.should_stop && state.groups.is_empty() {
            break;
        }
    }
    tracing::info!(dispatcher = %state.name, "fiber dispatcher exit");
}
