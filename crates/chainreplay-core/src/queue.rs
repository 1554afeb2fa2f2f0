//! Serial task queue: runs one task at a time, in insertion order.

use std::collections::VecDeque;
use std::future::Future;

/// Task executed by the handler pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerTask {
    Setup,
    Log(Box<crate::types::LogEvent>),
}

/// FIFO queue drained with concurrency 1.
///
/// The first failing task clears everything still queued and stops the drain.
#[derive(Debug)]
pub struct TaskQueue<T> {
    tasks: VecDeque<T>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, task: T) {
        self.tasks.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Run queued tasks in order until the queue is empty or a task fails.
    ///
    /// Returns the number of tasks that completed successfully.
    pub async fn drain<E, F, Fut>(&mut self, mut run: F) -> Result<usize, E>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut done = 0;
        while let Some(task) = self.tasks.pop_front() {
            if let Err(err) = run(task).await {
                self.tasks.clear();
                return Err(err);
            }
            done += 1;
        }
        Ok(done)
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Extend<T> for TaskQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.tasks.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn drains_in_order() {
        let seen = Mutex::new(Vec::new());
        let mut queue = TaskQueue::new();
        queue.extend([1, 2, 3]);
        let done: Result<usize, ()> = queue
            .drain(|n| {
                seen.lock().unwrap().push(n);
                async { Ok(()) }
            })
            .await;
        assert_eq!(done, Ok(3));
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failure_clears_remaining_tasks() {
        let mut queue = TaskQueue::new();
        queue.extend([1, 2, 3, 4]);
        let result = queue
            .drain(|n| async move { if n == 2 { Err(n) } else { Ok(()) } })
            .await;
        assert_eq!(result, Err(2));
        assert_eq!(queue.len(), 0);
    }
}
