pub mod task;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::SqlTaskpoolError;

pub use task::{TaskId, current_task, defer, spawn, task_scope};

type Slot = Box<dyn Any + Send>;
type Finalizer = Arc<dyn Fn(TaskId, TaskValues) + Send + Sync>;

/// The values one task stored in an [`ExecutionContext`].
#[derive(Default)]
pub struct TaskValues {
    values: HashMap<String, Slot>,
}

impl fmt::Debug for TaskValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

impl TaskValues {
    #[must_use]
    pub fn get<T: 'static>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    /// Remove and return a value; a value of another type is left in place.
    pub fn take<T: 'static>(&mut self, key: &str) -> Option<T> {
        let slot = self.values.remove(key)?;
        match slot.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(slot) => {
                self.values.insert(key.to_owned(), slot);
                None
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct Inner {
    entries: Mutex<HashMap<TaskId, TaskValues>>,
    finalizer: Option<Finalizer>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskValues>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn finish(&self, task: TaskId) {
        let values = self.lock().remove(&task);
        if let (Some(values), Some(finalizer)) = (values, &self.finalizer) {
            finalizer(task, values);
        }
    }
}

/// Key/value state private to each task.
///
/// Every operation addresses the calling task's entry (see [`task_scope`]).
/// The first write for a task registers a teardown that erases the whole
/// entry when the task ends, handing the erased values to the finalizer
/// if one was installed with [`ExecutionContext::with_finalizer`].
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.lock().iter()).finish()
    }
}

impl ExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Context whose erased task entries are passed to `finalizer`.
    #[must_use]
    pub fn with_finalizer(finalizer: impl Fn(TaskId, TaskValues) + Send + Sync + 'static) -> Self {
        Self::build(Some(Arc::new(finalizer)))
    }

    fn build(finalizer: Option<Finalizer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                finalizer,
            }),
        }
    }

    fn task() -> Result<TaskId, SqlTaskpoolError> {
        current_task().ok_or(SqlTaskpoolError::NoTaskScope)
    }

    /// Clone of the value stored under `key` for the calling task.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Result<Option<T>, SqlTaskpoolError> {
        let task = Self::task()?;
        Ok(self
            .inner
            .lock()
            .get(&task)
            .and_then(|values| values.get::<T>(key))
            .cloned())
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn contains(&self, key: &str) -> Result<bool, SqlTaskpoolError> {
        let task = Self::task()?;
        Ok(self
            .inner
            .lock()
            .get(&task)
            .is_some_and(|values| values.values.contains_key(key)))
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn set<T: Send + 'static>(&self, key: &str, value: T) -> Result<(), SqlTaskpoolError> {
        let task = Self::task()?;
        let first_write = {
            let mut entries = self.inner.lock();
            let first_write = !entries.contains_key(&task);
            entries
                .entry(task)
                .or_default()
                .values
                .insert(key.to_owned(), Box::new(value));
            first_write
        };
        if first_write {
            let inner: Weak<Inner> = Arc::downgrade(&self.inner);
            defer(move |task| {
                if let Some(inner) = inner.upgrade() {
                    inner.finish(task);
                }
            })?;
        }
        Ok(())
    }

    /// Move the value out of the calling task's entry.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn take<T: 'static>(&self, key: &str) -> Result<Option<T>, SqlTaskpoolError> {
        let task = Self::task()?;
        Ok(self
            .inner
            .lock()
            .get_mut(&task)
            .and_then(|values| values.take::<T>(key)))
    }

    /// Mutate a stored value in place. Returns `None` when there is no such value.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn update<T: 'static, R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<Option<R>, SqlTaskpoolError> {
        let task = Self::task()?;
        Ok(self
            .inner
            .lock()
            .get_mut(&task)
            .and_then(|values| values.values.get_mut(key))
            .and_then(|slot| slot.downcast_mut::<T>())
            .map(f))
    }

    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn unset(&self, key: &str) -> Result<(), SqlTaskpoolError> {
        let task = Self::task()?;
        if let Some(values) = self.inner.lock().get_mut(&task) {
            values.values.remove(key);
        }
        Ok(())
    }

    /// Remove every key of the calling task except those in `keep`.
    ///
    /// # Errors
    /// Returns [`SqlTaskpoolError::NoTaskScope`] outside of a task scope.
    pub fn clean(&self, keep: &[&str]) -> Result<(), SqlTaskpoolError> {
        let task = Self::task()?;
        if let Some(values) = self.inner.lock().get_mut(&task) {
            values.values.retain(|key, _| keep.contains(&key.as_str()));
        }
        Ok(())
    }

    /// Drop the state of every task without running the finalizer.
    ///
    /// Values are simply dropped: a task in the middle of a transaction
    /// loses it, and its connector is discarded with no rollback. A task
    /// that writes again afterwards starts from an empty entry.
    pub fn clean_all(&self) {
        self.inner.lock().clear();
    }

    /// Number of tasks that currently hold an entry.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn outside_scope_is_an_error() {
        let ctx = ExecutionContext::new();
        assert!(matches!(ctx.set("k", 1_u8), Err(SqlTaskpoolError::NoTaskScope)));
        assert!(matches!(ctx.get::<u8>("k"), Err(SqlTaskpoolError::NoTaskScope)));
    }

    #[tokio::test]
    async fn tasks_see_only_their_own_values() {
        let ctx = ExecutionContext::new();
        let mut handles = Vec::new();
        for i in 0..4_u32 {
            let ctx = ctx.clone();
            handles.push(spawn(async move {
                ctx.set("name", format!("name-{i}")).unwrap();
                tokio::task::yield_now().await;
                ctx.get::<String>("name").unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Some(format!("name-{i}")));
        }
        assert_eq!(ctx.task_count(), 0);
    }

    #[tokio::test]
    async fn clean_keeps_listed_keys() {
        let ctx = ExecutionContext::new();
        task_scope(async {
            ctx.set("a", 1_i32).unwrap();
            ctx.set("b", 2_i32).unwrap();
            ctx.set("c", 3_i32).unwrap();
            ctx.clean(&["b"]).unwrap();
            assert_eq!(ctx.get::<i32>("a").unwrap(), None);
            assert_eq!(ctx.get::<i32>("b").unwrap(), Some(2));
            ctx.clean(&[]).unwrap();
            assert!(!ctx.contains("b").unwrap());
        })
        .await;
    }

    #[tokio::test]
    async fn take_and_update() {
        let ctx = ExecutionContext::new();
        task_scope(async {
            ctx.set("log", vec![1_u8]).unwrap();
            ctx.update::<Vec<u8>, _>("log", |log| log.push(2)).unwrap();
            assert_eq!(ctx.take::<String>("log").unwrap(), None);
            assert_eq!(ctx.take::<Vec<u8>>("log").unwrap(), Some(vec![1, 2]));
            assert!(!ctx.contains("log").unwrap());
            ctx.unset("missing").unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn clean_all_drops_every_task_without_finalizing() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finalized);
        let ctx = ExecutionContext::with_finalizer(move |_, values| {
            counter.fetch_add(values.len(), Ordering::SeqCst);
        });

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (resume_tx, resume_rx) = tokio::sync::oneshot::channel::<()>();
        let other = {
            let ctx = ctx.clone();
            spawn(async move {
                ctx.set("held", 1_u8).unwrap();
                started_tx.send(()).unwrap();
                resume_rx.await.unwrap();
                let after = ctx.get::<u8>("held").unwrap();
                ctx.set("again", 2_u8).unwrap();
                after
            })
        };
        started_rx.await.unwrap();

        task_scope(async {
            ctx.set("mine", 3_u8).unwrap();
            assert_eq!(ctx.task_count(), 2);
            ctx.clean_all();
            assert_eq!(ctx.task_count(), 0);
            assert_eq!(ctx.get::<u8>("mine").unwrap(), None);
        })
        .await;
        assert_eq!(finalized.load(Ordering::SeqCst), 0);

        resume_tx.send(()).unwrap();
        assert_eq!(other.await.unwrap(), None);
        // Only the value written after the wipe reaches the finalizer.
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.task_count(), 0);
    }

    #[tokio::test]
    async fn finalizer_receives_erased_entry() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_finalizer = Arc::clone(&seen);
        let ctx = ExecutionContext::with_finalizer(move |_, mut values| {
            if let Some(n) = values.take::<usize>("n") {
                seen_in_finalizer.store(n, Ordering::SeqCst);
            }
        });
        let task_ctx = ctx.clone();
        spawn(async move { task_ctx.set("n", 42_usize).unwrap() })
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 42);
        assert_eq!(ctx.task_count(), 0);
    }
}
