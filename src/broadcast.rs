// ============================================================================
// SECTION: CONFIG BROADCASTER
// ============================================================================
// One-to-many fan-out of values. Every listener owns an unbounded mailbox, so
// a slow listener never stalls the writer or its peers. A value reaches every
// listener registered before the write, exactly once. Listeners whose receiver
// was dropped are pruned on the next write.
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

/// Write side of the fan-out
pub struct Broadcaster<T> {
    listeners: Mutex<Vec<flume::Sender<T>>>,
    writes: AtomicU64,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Register a new listener. It receives every value written after this call.
    pub fn listen(&self) -> Listener<T> {
        let (tx, rx) = flume::unbounded();
        self.listeners.lock().push(tx);
        Listener { rx }
    }

    /// Deliver `value` to every live listener. Returns how many received it.
    pub fn write(&self, value: T) -> usize {
        // Holding the lock for the whole fan-out keeps writes totally ordered
        // for every listener; sends into unbounded mailboxes never block.
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.send(value.clone()).is_ok());
        self.writes.fetch_add(1, Ordering::Relaxed);

        trace!(
            target: "cerebro::broadcast",
            listeners = listeners.len(),
            "Value broadcast"
        );
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Broadcaster<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("listeners", &self.listeners.lock().len())
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .finish()
    }
}

/// Read side of one listener's mailbox
#[derive(Debug)]
pub struct Listener<T> {
    rx: flume::Receiver<T>,
}

impl<T> Listener<T> {
    /// Wait for the next value. `None` once the broadcaster is gone and the
    /// mailbox is drained.
    pub async fn recv(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Next value if one is already waiting
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Values waiting in the mailbox
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_every_listener_gets_every_value_once() {
        let broadcaster = Broadcaster::new();
        let a = broadcaster.listen();
        let b = broadcaster.listen();

        for i in 0..100 {
            assert_eq!(broadcaster.write(i), 2);
        }

        let from_a: Vec<i32> = std::iter::from_fn(|| a.try_recv()).collect();
        let from_b: Vec<i32> = std::iter::from_fn(|| b.try_recv()).collect();
        assert_eq!(from_a, (0..100).collect::<Vec<_>>());
        assert_eq!(from_a, from_b);
        assert_eq!(broadcaster.writes(), 100);
    }

    #[test]
    fn test_late_listener_misses_earlier_values() {
        let broadcaster = Broadcaster::new();
        broadcaster.write("early");
        let late = broadcaster.listen();
        broadcaster.write("late");
        assert_eq!(late.try_recv(), Some("late"));
        assert_eq!(late.try_recv(), None);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let broadcaster = Broadcaster::new();
        let kept = broadcaster.listen();
        drop(broadcaster.listen());
        assert_eq!(broadcaster.write(1u8), 1);
        assert_eq!(broadcaster.listener_count(), 1);
        assert_eq!(kept.pending(), 1);
    }

    #[test]
    fn test_recv_drains_then_ends() {
        let broadcaster = Broadcaster::new();
        let listener = broadcaster.listen();
        broadcaster.write("last");
        drop(broadcaster);

        assert_eq!(tokio_test::block_on(listener.recv()), Some("last"));
        assert_eq!(tokio_test::block_on(listener.recv()), None);
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_writer() {
        let broadcaster = Arc::new(Broadcaster::new());
        let slow = broadcaster.listen();
        let fast = broadcaster.listen();

        let writer = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for i in 0..10_000u32 {
                    broadcaster.write(i);
                }
            })
        };
        writer.await.unwrap();

        let mut seen = 0;
        while let Some(v) = fast.try_recv() {
            assert_eq!(v, seen);
            seen += 1;
        }
        assert_eq!(seen, 10_000);
        assert_eq!(slow.pending(), 10_000);
        assert_eq!(slow.recv().await, Some(0));
    }
}
