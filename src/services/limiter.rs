use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::cancel::CancelScope;
use super::task_error::TaskError;

/// Process-wide cap on concurrent calls to the costed model API.
///
/// Backed by a tokio semaphore, which queues waiters in FIFO order. The cap is
/// local to this process; horizontally scaled workers each get their own.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one outbound call. Released on drop, so every exit
/// path (success, error, cancellation, panic unwind) gives it back.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Drop for Permit {
    fn drop(&mut self) {
        metrics::gauge!("docflow_api_calls_in_flight").decrement(1.0);
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free permit, giving up if the scope is cancelled first.
    pub async fn acquire(&self, scope: &CancelScope) -> Result<Permit, TaskError> {
        let permit = scope
            .run(self.semaphore.clone().acquire_owned())
            .await?
            .map_err(|_| TaskError::Internal("concurrency limiter closed".to_string()))?;
        metrics::gauge!("docflow_api_calls_in_flight").increment(1.0);
        Ok(Permit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let limiter = ConcurrencyLimiter::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire(&CancelScope::detached()).await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let gate = limiter.acquire(&CancelScope::detached()).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire(&CancelScope::detached()).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let waiter `i` enqueue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        drop(gate);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn waiter_is_woken_when_a_permit_is_released() {
        let limiter = ConcurrencyLimiter::new(1);
        let scope = CancelScope::detached();
        let held = limiter.acquire(&scope).await.unwrap();

        let mut waiter = tokio_test::task::spawn(limiter.acquire(&scope));
        tokio_test::assert_pending!(waiter.poll());
        assert_eq!(limiter.in_flight(), 1);

        drop(held);
        assert!(waiter.is_woken());
        let permit = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(limiter.available(), 0);

        drop(permit);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_a_permit() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire(&CancelScope::detached()).await.unwrap();

        let task = CancellationToken::new();
        let scope = CancelScope::new(CancellationToken::new(), task.clone());
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&scope).await.map(|_| ()) })
        };
        task.cancel();

        assert!(matches!(waiter.await.unwrap(), Err(TaskError::Cancelled)));
        drop(held);
        assert_eq!(limiter.available(), 1);
    }
}
