//! Task identity and end-of-task callbacks on top of tokio.
//!
//! A task is any future run through [`task_scope`] (or [`spawn`]). Inside it,
//! [`current_task`] names the task and [`defer`] registers callbacks that run
//! once when the task ends: on completion, on panic, or when the future is
//! dropped before completing (cancellation, `abort`, runtime shutdown).

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;

use crate::error::SqlTaskpoolError;

tokio::task_local! {
    static CURRENT_TASK: TaskHandle;
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

type Teardown = Box<dyn FnOnce(TaskId) + Send>;

struct TaskHandle {
    id: TaskId,
    teardowns: RefCell<Vec<Teardown>>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            teardowns: RefCell::new(Vec::new()),
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let teardowns = std::mem::take(self.teardowns.get_mut());
        for teardown in teardowns.into_iter().rev() {
            teardown(self.id);
        }
    }
}

/// Run `fut` as its own task: fresh [`TaskId`], own teardown list.
pub fn task_scope<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    CURRENT_TASK.scope(TaskHandle::new(), fut)
}

/// `tokio::spawn` wrapped in [`task_scope`].
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(task_scope(fut))
}

/// Identity of the calling task, if running inside a task scope.
#[must_use]
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.try_with(|task| task.id).ok()
}

/// Register `teardown` to run when the calling task ends. Callbacks run in
/// reverse registration order.
///
/// # Errors
/// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
pub fn defer(teardown: impl FnOnce(TaskId) + Send + 'static) -> Result<TaskId, SqlTaskpoolError> {
    CURRENT_TASK
        .try_with(|task| {
            task.teardowns.borrow_mut().push(Box::new(teardown));
            task.id
        })
        .map_err(|_| SqlTaskpoolError::NoTaskScope)
}
