//! Fixed-capacity LIFO object pool.
//!
//! Hot allocation paths (work items in particular) acquire from a pool and
//! release back once done. The pool never grows past its capacity: releasing
//! into a full pool simply drops the object. Pooling is an optimization only,
//! a zero-capacity pool behaves exactly like plain allocation.

/// Objects that can be reset before they are handed out again.
pub trait Poolable {
    /// Resets the object to a state indistinguishable from a fresh one.
    fn clear_for_reuse(&mut self);
}

impl<T: Poolable + ?Sized> Poolable for Box<T> {
    fn clear_for_reuse(&mut self) {
        (**self).clear_for_reuse()
    }
}

#[derive(Debug)]
pub struct Pool<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T: Poolable> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Pops the most recently released object, or creates one with `create`.
    pub fn acquire(&mut self, create: impl FnOnce() -> T) -> T {
        match self.items.pop() {
            Some(item) => item,
            None => create(),
        }
    }

    /// Returns an object to the pool. Returns false if the pool was full and
    /// the object was dropped instead.
    pub fn release(&mut self, mut item: T) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        item.clear_for_reuse();
        self.items.push(item);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Slot {
        tag: u32,
        dirty: bool,
    }

    impl Poolable for Slot {
        fn clear_for_reuse(&mut self) {
            self.dirty = false;
        }
    }

    #[test]
    fn test_acquire_creates_when_empty() {
        let mut pool: Pool<Slot> = Pool::new(2);
        let slot = pool.acquire(|| Slot { tag: 7, dirty: true });
        assert_eq!(slot.tag, 7);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_release_is_lifo_and_resets() {
        let mut pool = Pool::new(4);
        pool.release(Slot { tag: 1, dirty: true });
        pool.release(Slot { tag: 2, dirty: true });

        let first = pool.acquire(|| unreachable!());
        assert_eq!(first, Slot { tag: 2, dirty: false });
        let second = pool.acquire(|| unreachable!());
        assert_eq!(second.tag, 1);
    }

    #[test]
    fn test_release_into_full_pool_drops() {
        let mut pool = Pool::new(1);
        assert!(pool.release(Slot { tag: 1, dirty: false }));
        assert!(!pool.release(Slot { tag: 2, dirty: false }));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_zero_capacity_never_retains() {
        let mut pool = Pool::new(0);
        assert!(!pool.release(Slot { tag: 1, dirty: false }));
        let created = pool.acquire(|| Slot { tag: 9, dirty: false });
        assert_eq!(created.tag, 9);
    }
}
