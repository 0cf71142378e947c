//! Bounded, FIFO-fair resource pool.
//!
//! One slot is acquired per concurrently executing task set; releases
//! wake the oldest waiter first. Acquisition honors cancellation: a
//! cancelled waiter is removed from the queue and gets an error.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Error returned by a cancelled [`Pool::get`].
#[derive(Debug, thiserror::Error)]
#[error("pool acquire cancelled")]
pub struct Cancelled;

struct Inner<T> {
    free: VecDeque<T>,
    waiters: VecDeque<(u64, oneshot::Sender<T>)>,
    next_id: u64,
}

/// A pool of `size` pre-built slots.
pub struct Pool<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Send> Pool<T> {
    /// Build a pool of `size` slots produced by `make(index)`.
    #[must_use]
    pub fn new(size: usize, make: impl Fn(usize) -> T) -> Self {
        let free = (0..size).map(make).collect();
        Self {
            inner: Mutex::new(Inner {
                free,
                waiters: VecDeque::new(),
                next_id: 0,
            }),
        }
    }

    /// Acquire a slot, waiting FIFO behind earlier callers.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if `cancel` fires before a slot frees up.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<T, Cancelled> {
        let (id, rx) = {
            let mut inner = self.inner.lock().expect("pool poisoned");
            if let Some(slot) = inner.free.pop_front() {
                return Ok(slot);
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.waiters.push_back((id, tx));
            (id, rx)
        };

        tokio::select! {
            slot = rx => slot.map_err(|_| Cancelled),
            () = cancel.cancelled() => {
                let mut inner = self.inner.lock().expect("pool poisoned");
                inner.waiters.retain(|(wid, _)| *wid != id);
                Err(Cancelled)
            }
        }
    }

    /// Return a slot to the pool, handing it to the oldest waiter if
    /// one is queued.
    pub fn put(&self, slot: T) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        let mut slot = slot;
        while let Some((_, tx)) = inner.waiters.pop_front() {
            match tx.send(slot) {
                Ok(()) => return,
                // The waiter raced a cancellation; try the next one.
                Err(back) => slot = back,
            }
        }
        inner.free.push_back(slot);
    }

    /// Number of currently free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().expect("pool poisoned").free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_get_and_put_roundtrip() {
        let pool = Pool::new(2, |i| i);
        let cancel = CancellationToken::new();

        let a = pool.get(&cancel).await.unwrap();
        let b = pool.get(&cancel).await.unwrap();
        assert_eq!(pool.available(), 0);

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_waiters_wake_in_fifo_order() {
        let pool = Arc::new(Pool::new(1, |i| i));
        let cancel = CancellationToken::new();
        let slot = pool.get(&cancel).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..4 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let got = pool.get(&cancel).await.unwrap();
                order.lock().unwrap().push(n);
                pool.put(got);
            }));
            // Give each waiter time to enqueue before the next arrives.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        pool.put(slot);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaves_queue() {
        let pool = Arc::new(Pool::new(1, |i| i));
        let cancel = CancellationToken::new();
        let slot = pool.get(&cancel).await.unwrap();

        let doomed = CancellationToken::new();
        let waiter = {
            let pool = Arc::clone(&pool);
            let doomed = doomed.clone();
            tokio::spawn(async move { pool.get(&doomed).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        doomed.cancel();
        assert!(waiter.await.unwrap().is_err());

        // The cancelled waiter must not swallow the released slot.
        pool.put(slot);
        assert_eq!(pool.available(), 1);
    }
}
