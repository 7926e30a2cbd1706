use std::cell::RefCell;
use std::rc::Rc;

use crate::fiber::condition::new_cond_core;
use crate::fiber::condition::signal_all_waiters;
use crate::fiber::condition::CondCore;
use crate::fiber::condition::CondWait;
use crate::fiber::GroupShared;
use crate::fiber::GroupStopped;

struct FutInner<T> {
    result: Option<T>,
}

/// A single-completion future local to one fiber group.
///
/// Completed at most once from the owning dispatcher thread; awaited by one
/// fiber. Cross-thread completions use the transport/storage futures instead,
/// which re-enter through the shared queue.
pub struct FiberFuture<T> {
    name: String,
    shared: Rc<GroupShared>,
    inner: Rc<RefCell<FutInner<T>>>,
    cond: CondCore,
}

impl<T> Clone for FiberFuture<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            shared: self.shared.clone(),
            inner: self.inner.clone(),
            cond: self.cond.clone(),
        }
    }
}

impl<T> FiberFuture<T> {
    pub(crate) fn new(name: String, shared: Rc<GroupShared>) -> Self {
        Self {
            name,
            shared,
            inner: Rc::new(RefCell::new(FutInner { result: None })),
            cond: new_cond_core(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Complete the future. A second completion is ignored.
    pub fn complete(&self, v: T) {
        let mut inner = self.inner.borrow_mut();
        if inner.result.is_some() {
            return;
        }
        inner.result = Some(v);
        drop(inner);
        signal_all_waiters(&self.cond);
    }

    /// Suspend until completed, then take the value.
    pub async fn wait(&self) -> Result<T, GroupStopped> {
        loop {
            if let Some(v) = self.inner.borrow_mut().result.take() {
                return Ok(v);
            }
            CondWait::new(self.shared.clone(), Some(self.cond.clone()), None).await?;
        }
    }
}
