use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::fiber::condition::new_cond_core;
use crate::fiber::condition::signal_one;
use crate::fiber::condition::CondCore;
use crate::fiber::condition::CondWait;
use crate::fiber::dispatcher::SharedSender;
use crate::fiber::GroupShared;
use crate::fiber::GroupStopped;

/// Type-erased view of a channel, for routing values that crossed threads
/// through the shared queue.
pub(crate) trait AnyChannel {
    fn offer_boxed(&self, v: Box<dyn Any>);
}

pub(crate) struct ChannelCore<T> {
    queue: RefCell<VecDeque<T>>,
    cond: CondCore,
}

impl<T> ChannelCore<T> {
    fn push(&self, v: T) {
        self.queue.borrow_mut().push_back(v);
        signal_one(&self.cond);
    }
}

impl<T: 'static> AnyChannel for ChannelCore<T> {
    fn offer_boxed(&self, v: Box<dyn Any>) {
        if let Ok(v) = v.downcast::<T>() {
            self.push(*v);
        }
    }
}

/// An unbounded queue that blocks only the consumer fiber.
///
/// Producers on the owning dispatcher thread use [`offer`](Self::offer);
/// producers on other threads obtain a [`ChannelSender`] which routes values
/// through the dispatcher's shared queue, preserving the single-writer rule.
pub struct FiberChannel<T> {
    shared: Rc<GroupShared>,
    core: Rc<ChannelCore<T>>,
    group_id: u64,
    key: u32,
    sender: SharedSender,
}

impl<T> Clone for FiberChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            core: self.core.clone(),
            group_id: self.group_id,
            key: self.key,
            sender: self.sender.clone(),
        }
    }
}

impl<T: 'static> FiberChannel<T> {
    pub(crate) fn new(shared: Rc<GroupShared>, group_id: u64, key: u32, sender: SharedSender) -> (Self, Rc<ChannelCore<T>>) {
        let core = Rc::new(ChannelCore {
            queue: RefCell::new(VecDeque::new()),
            cond: new_cond_core(),
        });
        let chan = Self {
            shared,
            core: core.clone(),
            group_id,
            key,
            sender,
        };
        (chan, core)
    }

    /// Offer from the owning dispatcher thread.
    pub fn offer(&self, v: T) {
        self.core.push(v);
    }

    /// Take one value, suspending until one is available.
    pub async fn take(&self) -> Result<T, GroupStopped> {
        loop {
            if let Some(v) = self.core.queue.borrow_mut().pop_front() {
                return Ok(v);
            }
            CondWait::new(self.shared.clone(), Some(self.core.cond.clone()), None).await?;
        }
    }

    /// Drain everything currently queued into `out`, suspending until at
    /// least one value is present.
    pub async fn take_all(&self, out: &mut Vec<T>) -> Result<(), GroupStopped> {
        loop {
            {
                let mut q = self.core.queue.borrow_mut();
                while let Some(v) = q.pop_front() {
                    out.push(v);
                }
            }
            if !out.is_empty() {
                return Ok(());
            }
            CondWait::new(self.shared.clone(), Some(self.core.cond.clone()), None).await?;
        }
    }
}

impl<T: Send + 'static> FiberChannel<T> {
    /// A producer handle usable from any thread.
    pub fn sender(&self) -> ChannelSender<T> {
        ChannelSender {
            sender: self.sender.clone(),
            group_id: self.group_id,
            key: self.key,
            _p: PhantomData,
        }
    }
}

/// Cross-thread producer side of a [`FiberChannel`].
///
/// Values are delivered in FIFO order per sending thread. If the group is
/// gone, values are silently dropped.
pub struct ChannelSender<T> {
    sender: SharedSender,
    group_id: u64,
    key: u32,
    _p: PhantomData<fn(T)>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            group_id: self.group_id,
            key: self.key,
            _p: PhantomData,
        }
    }
}

impl<T: Send + 'static> ChannelSender<T> {
    pub fn send(&self, v: T) {
        let group_id = self.group_id;
        let key = self.key;
        self.sender.run(move |state| {
            if let Some(g) = state.group(group_id) {
                g.offer_from_outside(key, Box::new(v));
            }
        });
    }
}
