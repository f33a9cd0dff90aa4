//! Shared pools used by the dispatch path.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Semaphore;

/// Blocking LIFO stack of reusable items. `pop` waits until an item is
/// available; LIFO order keeps recently-used engines (and their warm
/// caches) in rotation.
#[derive(Debug)]
pub struct EngineStack<T> {
    items: Mutex<Vec<T>>,
    available: Semaphore,
}

impl<T> EngineStack<T> {
    pub fn new(items: Vec<T>) -> Self {
        let available = Semaphore::new(items.len());
        Self {
            items: Mutex::new(items),
            available,
        }
    }

    pub async fn pop(&self) -> T {
        let permit = self
            .available
            .acquire()
            .await
            .expect("engine stack semaphore closed");
        permit.forget();
        self.items
            .lock()
            .unwrap()
            .pop()
            .expect("semaphore permit guarantees an item")
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
        self.available.add_permits(1);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hands out the lowest free index, reusing released ones. Server-side
/// dispatches borrow an index per frame so relay-stream cache keys stay
/// dense instead of growing with every request.
#[derive(Debug, Default)]
pub struct IndexPool {
    state: Mutex<IndexPoolState>,
}

#[derive(Debug, Default)]
struct IndexPoolState {
    total: usize,
    free: BinaryHeap<Reverse<usize>>,
}

impl IndexPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        if let Some(Reverse(index)) = state.free.pop() {
            return index;
        }
        let index = state.total;
        state.total += 1;
        index
    }

    pub fn release(&self, index: usize) {
        self.state.lock().unwrap().free.push(Reverse(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn stack_is_lifo() {
        let stack = EngineStack::new(vec![1, 2, 3]);
        assert_eq!(stack.pop().await, 3);
        assert_eq!(stack.pop().await, 2);
        stack.push(7);
        assert_eq!(stack.pop().await, 7);
        assert_eq!(stack.pop().await, 1);
        assert_eq!(stack.len(), 0);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let stack = Arc::new(EngineStack::new(Vec::<u32>::new()));
        let popper = {
            let stack = stack.clone();
            tokio::spawn(async move { stack.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!popper.is_finished());

        stack.push(42);
        let value = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn index_pool_reuses_lowest_free() {
        let pool = IndexPool::new();
        assert_eq!(pool.acquire(), 0);
        assert_eq!(pool.acquire(), 1);
        assert_eq!(pool.acquire(), 2);

        pool.release(1);
        pool.release(0);
        assert_eq!(pool.acquire(), 0);
        assert_eq!(pool.acquire(), 1);
        assert_eq!(pool.acquire(), 3);
    }
}
