// src/server/shutdown.rs

use tokio::sync::watch;

/// Counter over outstanding listeners or connections, awaitable at zero.
///
/// Additions and removals happen while the server's state lock is held;
/// waiting does not take the lock. Removing below zero is a programming
/// error and panics.
pub(crate) struct WaitGroup {
    count: watch::Sender<usize>,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub(crate) fn add(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    pub(crate) fn done(&self) {
        self.count.send_modify(|count| {
            assert!(*count > 0, "wait group underflow");
            *count -= 1;
        });
    }

    /// Completes once the counter reaches zero.
    pub(crate) async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // wait_for only fails if the sender is dropped, which cannot happen
        // while `self` is borrowed.
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_at_zero() {
        let wg = WaitGroup::new();
        wg.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_drained() {
        let wg = std::sync::Arc::new(WaitGroup::new());
        wg.add();
        wg.add();

        let waiter = {
            let wg = std::sync::Arc::clone(&wg);
            tokio::spawn(async move { wg.wait().await })
        };
        wg.done();
        assert!(!waiter.is_finished());
        wg.done();
        waiter.await.unwrap();
    }

    #[test]
    #[should_panic(expected = "wait group underflow")]
    fn double_removal_panics() {
        let wg = WaitGroup::new();
        wg.add();
        wg.done();
        wg.done();
    }
}
