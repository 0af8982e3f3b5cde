//! Blocking hand-off queue between the multiplexer and the workers.
//!
//! Producers never block: `push` appends and wakes one consumer. Consumers
//! block in `pop` on a condition variable until an item arrives or the queue
//! is closed. The queue is shared through an `Arc`, so it cannot be dropped
//! while a consumer is still parked inside `pop`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct HandoffQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends an item. Returns it back if the queue is already closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// closed; items still queued at that point are dropped with the queue.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `pop`, but items queued before `close` are still handed out.
    /// Returns `None` once the queue is closed and empty.
    pub fn pop_draining(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of `pop`.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.items.pop_front()
    }

    /// Closes the queue and wakes every blocked consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = HandoffQueue::new();
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 5);

        let drained: Vec<_> = (0..5).map(|_| queue.pop().unwrap()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(HandoffQueue::new());

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(30));
        queue.push("ready").unwrap();

        assert_eq!(consumer.join().unwrap(), Some("ready"));
    }

    #[test]
    fn test_close_wakes_all_consumers() {
        let queue: Arc<HandoffQueue<u32>> = Arc::new(HandoffQueue::new());

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.pop())
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        queue.close();

        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
        assert!(queue.is_closed());
        assert_eq!(queue.push(1), Err(1));
    }

    #[test]
    fn test_pop_draining_hands_out_items_queued_before_close() {
        let queue = HandoffQueue::new();
        queue.push("last reply").unwrap();
        queue.close();

        assert_eq!(queue.pop(), None);
        assert_eq!(queue.pop_draining(), Some("last reply"));
        assert_eq!(queue.pop_draining(), None);
    }

    #[test]
    fn test_many_producers_many_consumers() {
        let queue = Arc::new(HandoffQueue::new());
        let received = Arc::new(AtomicUsize::new(0));
        let producers = 4;
        let per_producer = 250;

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let received = received.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.pop() {
                        seen.push(item);
                        received.fetch_add(1, Ordering::SeqCst);
                    }
                    seen
                })
            })
            .collect();

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..per_producer {
                        queue.push(p * per_producer + i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Let consumers drain before closing.
        while received.load(Ordering::SeqCst) < producers * per_producer {
            thread::sleep(Duration::from_millis(1));
        }
        queue.close();

        let mut all = HashSet::new();
        for consumer in consumers {
            for item in consumer.join().unwrap() {
                assert!(all.insert(item), "item {} delivered twice", item);
            }
        }
        assert_eq!(all.len(), producers * per_producer);
    }
}
