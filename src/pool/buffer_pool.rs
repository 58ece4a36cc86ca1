use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::error::{PipelineError, Result};

/// An object a [`BufferPool`] can recycle
pub trait Poolable: Send + Sync + 'static {
    /// Allocation shape; a pool only ever hands out one shape
    type Shape: Clone + PartialEq + fmt::Debug + Send + Sync;

    fn allocate(shape: &Self::Shape) -> Self;

    fn shape(&self) -> Self::Shape;

    /// Reset the object before it returns to the free stack
    fn uninitialize(&mut self) {}
}

/// Arena position of a checked-out buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    pub index: u32,
    pub generation: u32,
}

struct Slot<T> {
    generation: u32,
    /// Cached object while the slot is free
    value: Option<T>,
    in_use: bool,
}

struct PoolState<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    disposed: bool,
}

struct PoolInner<T: Poolable> {
    name: String,
    shape: T::Shape,
    state: Mutex<PoolState<T>>,
    allocations: AtomicU64,
}

impl<T: Poolable> PoolInner<T> {
    fn release(&self, handle: SlotHandle, mut value: T) {
        // runs before the lock is taken, so the hook may itself use pools
        value.uninitialize();

        let mut state = self.state.lock();
        let disposed = state.disposed;
        let Some(slot) = state.slots.get_mut(handle.index as usize) else {
            error!("Pool '{}': release of unknown slot {}", self.name, handle.index);
            return;
        };
        if slot.generation != handle.generation || !slot.in_use {
            error!(
                "Pool '{}': stale release of slot {} (generation {} vs {})",
                self.name, handle.index, handle.generation, slot.generation
            );
            return;
        }
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        if disposed {
            return;
        }
        slot.value = Some(value);
        state.free.push(handle.index);
    }
}

impl<T: Poolable> Drop for PoolInner<T> {
    fn drop(&mut self) {
        if !self.state.get_mut().disposed {
            warn!("Pool '{}' dropped without dispose", self.name);
        }
    }
}

/// Object pool backed by an arena of slots.
///
/// A checked-out [`PooledBuffer`] refers back to its slot by index and
/// generation; releasing it pushes the index onto the free stack and keeps the
/// object for reuse. The pool never references its buffers, so there is no
/// ownership cycle between the two.
pub struct BufferPool<T: Poolable> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Poolable> BufferPool<T> {
    pub fn new(name: &str, shape: T::Shape) -> Self {
        Self::with_capacity(name, shape, 0)
    }

    /// Pool with `preallocate` objects ready on the free stack
    pub fn with_capacity(name: &str, shape: T::Shape, preallocate: usize) -> Self {
        let mut slots = Vec::with_capacity(preallocate);
        for _ in 0..preallocate {
            slots.push(Slot {
                generation: 0,
                value: Some(T::allocate(&shape)),
                in_use: false,
            });
        }
        let free = (0..preallocate as u32).rev().collect();
        debug!("Pool '{}' created with {} buffers of {:?}", name, preallocate, shape);

        Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                shape,
                state: Mutex::new(PoolState {
                    slots,
                    free,
                    disposed: false,
                }),
                allocations: AtomicU64::new(preallocate as u64),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn shape(&self) -> &T::Shape {
        &self.inner.shape
    }

    /// Take a buffer, reusing a free slot when one exists
    pub fn acquire(&self) -> Result<PooledBuffer<T>> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(PipelineError::PoolDisposed(self.inner.name.clone()));
        }

        if let Some(index) = state.free.pop() {
            let slot = &mut state.slots[index as usize];
            slot.in_use = true;
            let generation = slot.generation;
            let value = match slot.value.take() {
                Some(value) => value,
                None => {
                    self.inner.allocations.fetch_add(1, Ordering::Relaxed);
                    T::allocate(&self.inner.shape)
                }
            };
            return Ok(PooledBuffer {
                value: Some(value),
                handle: SlotHandle { index, generation },
                pool: Arc::clone(&self.inner),
            });
        }

        let index = state.slots.len() as u32;
        state.slots.push(Slot {
            generation: 0,
            value: None,
            in_use: true,
        });
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBuffer {
            value: Some(T::allocate(&self.inner.shape)),
            handle: SlotHandle {
                index,
                generation: 0,
            },
            pool: Arc::clone(&self.inner),
        })
    }

    /// Take a buffer of `shape`; any other shape than the pool's fails fast
    pub fn acquire_with(&self, shape: &T::Shape) -> Result<PooledBuffer<T>> {
        if *shape != self.inner.shape {
            return Err(PipelineError::ShapeMismatch {
                pool: self.inner.name.clone(),
                expected: format!("{:?}", self.inner.shape),
                requested: format!("{:?}", shape),
            });
        }
        self.acquire()
    }

    /// Release every cached object. One-shot; buffers still checked out are
    /// reported as a leak.
    pub fn dispose(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(PipelineError::PoolDisposed(self.inner.name.clone()));
        }
        state.disposed = true;
        state.free.clear();
        let mut outstanding = 0;
        for slot in state.slots.iter_mut() {
            slot.value = None;
            if slot.in_use {
                outstanding += 1;
            }
        }
        if outstanding > 0 {
            error!(
                "Pool '{}' disposed with {} buffers checked out",
                self.inner.name, outstanding
            );
            return Err(PipelineError::PoolLeak {
                pool: self.inner.name.clone(),
                outstanding,
            });
        }
        debug!(
            "Pool '{}' disposed after {} allocations",
            self.inner.name,
            self.allocations()
        );
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Objects constructed over the pool's lifetime
    pub fn allocations(&self) -> u64 {
        self.inner.allocations.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    pub fn checked_out(&self) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.in_use)
            .count()
    }
}

impl<T: Poolable> fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.inner.name)
            .field("shape", &self.inner.shape)
            .field("allocations", &self.allocations())
            .finish()
    }
}

/// A checked-out pool object; returns to its slot when dropped
pub struct PooledBuffer<T: Poolable> {
    value: Option<T>,
    handle: SlotHandle,
    pool: Arc<PoolInner<T>>,
}

impl<T: Poolable> PooledBuffer<T> {
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }
}

impl<T: Poolable> Deref for PooledBuffer<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            // only taken in drop
            None => unreachable!("pooled buffer used after release"),
        }
    }
}

impl<T: Poolable> DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled buffer used after release"),
        }
    }
}

impl<T: Poolable> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(self.handle, value);
        }
    }
}

impl<T: Poolable + fmt::Debug> fmt::Debug for PooledBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("pool", &self.pool.name)
            .field("handle", &self.handle)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug)]
    struct Block {
        len: usize,
        data: Vec<u8>,
        resets: usize,
    }

    impl Poolable for Block {
        type Shape = usize;

        fn allocate(shape: &usize) -> Self {
            Block {
                len: *shape,
                data: vec![0; *shape],
                resets: 0,
            }
        }

        fn shape(&self) -> usize {
            self.len
        }

        fn uninitialize(&mut self) {
            self.data.fill(0);
            self.resets += 1;
        }
    }

    #[test]
    fn test_reuses_released_object() {
        let pool = BufferPool::<Block>::new("blocks", 16);
        let mut a = pool.acquire().unwrap();
        a.data[0] = 9;
        let first = a.handle();
        drop(a);

        let b = pool.acquire().unwrap();
        assert_eq!(b.handle().index, first.index);
        assert_ne!(b.handle().generation, first.generation);
        assert_eq!(b.data[0], 0);
        assert_eq!(b.resets, 1);
        assert_eq!(pool.allocations(), 1);
        drop(b);
        pool.dispose().unwrap();
    }

    #[test]
    fn test_acquire_after_dispose_fails() {
        let pool = BufferPool::<Block>::with_capacity("blocks", 4, 2);
        assert_eq!(pool.available(), 2);
        pool.dispose().unwrap();
        assert_eq!(
            pool.acquire().unwrap_err(),
            PipelineError::PoolDisposed("blocks".into())
        );
        assert!(pool.dispose().is_err());
    }

    #[test]
    fn test_dispose_reports_leak() {
        let pool = BufferPool::<Block>::new("blocks", 4);
        let held = pool.acquire().unwrap();
        assert_eq!(
            pool.dispose().unwrap_err(),
            PipelineError::PoolLeak {
                pool: "blocks".into(),
                outstanding: 1
            }
        );
        // late release after dispose is dropped, not cached
        drop(held);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn test_shape_mismatch_fails_fast() {
        let pool = BufferPool::<Block>::new("blocks", 4);
        let err = pool.acquire_with(&8).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhaustion);
        assert!(pool.acquire_with(&4).is_ok());
        assert_eq!(pool.allocations(), 1);
        let _ = pool.dispose();
    }

    #[test]
    fn test_buffers_cross_threads() {
        let pool = BufferPool::<Block>::new("blocks", 8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buffer = pool.acquire().unwrap();
                        assert_eq!(buffer.shape(), 8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.allocations() <= 4);
        pool.dispose().unwrap();
    }

    proptest! {
        /// Acquire/release sequences with at most `limit` live buffers never
        /// allocate more than `limit` objects.
        #[test]
        fn prop_allocations_bounded_by_live_buffers(
            limit in 1usize..8,
            ops in proptest::collection::vec(any::<bool>(), 1..200)
        ) {
            let pool = BufferPool::<Block>::new("prop", 4);
            let mut live = Vec::new();
            for acquire in ops {
                if acquire && live.len() < limit {
                    live.push(pool.acquire().unwrap());
                } else if !live.is_empty() {
                    live.swap_remove(0);
                }
            }
            prop_assert!(pool.allocations() as usize <= limit);
            live.clear();
            prop_assert!(pool.dispose().is_ok());
        }
    }
}
