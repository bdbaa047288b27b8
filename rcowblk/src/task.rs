// SPDX-License-Identifier: MIT

//! Background task runner for split requests.
//!
//! A request that decomposes into several `(host_offset, bytes)` runs
//! executes its first piece inline; the rest go through a signal-capable
//! FIFO drained by one worker, and the submitter awaits each piece on its
//! own completion channel. Tasks borrow request-local buffers, so the
//! worker lives inside the scoped-thread region of the request that
//! spawned it.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::{BlockError, BlockResult};

type TaskFn<'scope> = Box<dyn FnOnce() -> BlockResult + Send + 'scope>;

struct Task<'scope> {
    run: TaskFn<'scope>,
    done: mpsc::Sender<BlockResult>,
}

struct QueueState<'scope> {
    tasks: VecDeque<Task<'scope>>,
    shutdown: bool,
}

/// FIFO of pending tasks plus the wake signal for the worker.
pub struct TaskQueue<'scope> {
    state: Mutex<QueueState<'scope>>,
    cond: Condvar,
}

/// Lock that shrugs off poisoning: a panicked holder cannot leave metadata
/// in a torn state the next holder could not see anyway.
pub(crate) fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<'scope> TaskQueue<'scope> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enqueues a task and blocks until the worker reports its result.
    pub fn submit_and_wait(&self, run: TaskFn<'scope>) -> BlockResult {
        let (done, result) = mpsc::channel();
        {
            let mut st = relock(&self.state);
            st.tasks.push_back(Task { run, done });
        }
        self.cond.notify_one();
        result
            .recv()
            .unwrap_or_else(|_| Err(BlockError::InvalidArgument))
    }

    /// Worker side: the next task, or `None` once shut down and drained.
    fn pop_blocking(&self) -> Option<Task<'scope>> {
        let mut st = relock(&self.state);
        loop {
            if let Some(task) = st.tasks.pop_front() {
                return Some(task);
            }
            if st.shutdown {
                return None;
            }
            st = self
                .cond
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Lets the worker exit after draining what is queued.
    pub fn shutdown(&self) {
        relock(&self.state).shutdown = true;
        self.cond.notify_all();
    }
}

impl Default for TaskQueue<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker loop: run tasks until shutdown, reporting each result on the
/// task's channel. Tasks always complete; there is no cancellation.
pub fn worker_loop(queue: &TaskQueue<'_>) {
    while let Some(task) = queue.pop_blocking() {
        let result = (task.run)();
        let _ = task.done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_on_worker() {
        let counter = AtomicUsize::new(0);
        let queue = TaskQueue::new();
        std::thread::scope(|scope| {
            scope.spawn(|| worker_loop(&queue));
            for _ in 0..10 {
                let r = queue.submit_and_wait(Box::new(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
                assert!(r.is_ok());
            }
            queue.shutdown();
        });
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_errors_propagate_to_submitter() {
        let queue = TaskQueue::new();
        std::thread::scope(|scope| {
            scope.spawn(|| worker_loop(&queue));
            let r = queue.submit_and_wait(Box::new(|| Err(BlockError::NotSupported)));
            assert!(matches!(r, Err(BlockError::NotSupported)));
            queue.shutdown();
        });
    }
}
