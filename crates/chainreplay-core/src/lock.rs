//! Generational lock: a mutex whose pending and current holders can be
//! invalidated wholesale.
//!
//! Each call to [`GenerationLock::cancel`] starts a new generation. A waiter
//! records the generation when it starts waiting; if the generation moves on
//! before it gets the lock, it gets `Err(Cancelled)` instead of the guard. A
//! holder can poll [`GenerationGuard::is_cancelled`] between units of work and
//! bail out early.

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::Cancelled;

#[derive(Debug)]
pub struct GenerationLock {
    mutex: Mutex<()>,
    generation: watch::Sender<u64>,
}

/// Held while a generation owns the lock.
#[derive(Debug)]
pub struct GenerationGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    generation: u64,
    rx: watch::Receiver<u64>,
}

impl GenerationLock {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            mutex: Mutex::new(()),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Invalidate every current waiter and holder.
    pub fn cancel(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Wait for the lock, unless the current generation is cancelled first.
    pub async fn acquire(&self) -> Result<GenerationGuard<'_>, Cancelled> {
        let mut rx = self.generation.subscribe();
        let generation = *rx.borrow_and_update();

        let acquired = tokio::select! {
            biased;
            guard = self.mutex.lock() => Some(guard),
            _ = rx.changed() => None,
        };

        match acquired {
            Some(guard) if *rx.borrow() == generation => Ok(GenerationGuard {
                _guard: guard,
                generation,
                rx,
            }),
            _ => Err(Cancelled { generation }),
        }
    }

    /// Cancel everyone else, then take the lock for a new generation.
    pub async fn acquire_fresh(&self) -> Result<GenerationGuard<'_>, Cancelled> {
        self.cancel();
        self.acquire().await
    }
}

impl Default for GenerationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// `true` once a newer generation has been started.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.generation
    }

    /// `Err(Cancelled)` once a newer generation has been started.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled {
                generation: self.generation,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let lock = GenerationLock::new();
        let guard = lock.acquire().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(20), lock.acquire()).await;
        assert!(second.is_err(), "second acquire should still be waiting");
        drop(guard);
        assert!(lock.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn cancel_wakes_pending_waiter_with_cancelled() {
        let lock = Arc::new(GenerationLock::new());
        let guard = lock.acquire().await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        lock.cancel();
        let result = waiter.await.unwrap();
        assert_eq!(result, Err(Cancelled { generation: 0 }));
        assert!(guard.is_cancelled());
        assert!(guard.check().is_err());
    }

    #[tokio::test]
    async fn acquire_fresh_starts_new_generation() {
        let lock = GenerationLock::new();
        {
            let guard = lock.acquire().await.unwrap();
            assert_eq!(guard.generation(), 0);
        }
        let fresh = lock.acquire_fresh().await.unwrap();
        assert_eq!(fresh.generation(), 1);
        assert!(!fresh.is_cancelled());
        assert_eq!(lock.generation(), 1);
    }

    #[tokio::test]
    async fn acquire_fresh_waits_for_current_holder() {
        let lock = Arc::new(GenerationLock::new());
        let guard = lock.acquire().await.unwrap();

        let resetter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire_fresh().await.map(|g| g.generation()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(guard.is_cancelled());
        drop(guard);

        assert_eq!(resetter.await.unwrap(), Ok(1));
    }
}
