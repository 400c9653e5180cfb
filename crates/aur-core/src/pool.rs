//! Audio-safe object pool with reference-counted hand-out
//!
//! Pools keep every allocation off the audio thread. `request` hands out a
//! mutable `PoolBox`; `fix` turns it into a shared, immutable `PoolRef`.
//! Cloning and dropping a `PoolRef` is the add/remove-reference pair; when the
//! last reference drops, the object runs `pre_release` and returns to its pool
//! through a lock-free channel instead of going back to the allocator.
//!
//! Thread rules: `request` may allocate and runs on the control thread only.
//! The audio thread clones and drops references; the return path is a
//! channel send and never blocks.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

/// Behavior required of pooled objects
pub trait PoolItem: Send + Sync + 'static {
    /// Restore the pristine state; called when the object is handed out
    fn reset(&mut self);

    /// Drop every reference the object itself holds; called on return
    fn pre_release(&mut self) {}
}

struct PoolCore<T: PoolItem> {
    /// Control-side free list
    free: Mutex<Vec<Box<T>>>,
    /// Lock-free return path from whichever thread drops the last reference
    returns_tx: Sender<Box<T>>,
    returns_rx: Receiver<Box<T>>,
    /// Objects currently handed out
    live: AtomicUsize,
    /// Objects fabricated so far
    created: AtomicUsize,
    grow_by: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

/// Reusable object pool
pub struct Pool<T: PoolItem> {
    core: Arc<PoolCore<T>>,
}

impl<T: PoolItem> Pool<T> {
    /// Create a pool with `initial` pre-fabricated objects, growing by
    /// `grow_by` whenever the quota runs out
    pub fn new<F>(initial: usize, grow_by: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let (returns_tx, returns_rx) = unbounded();
        let core = PoolCore {
            free: Mutex::new(Vec::with_capacity(initial)),
            returns_tx,
            returns_rx,
            live: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            grow_by: grow_by.max(1),
            factory: Box::new(factory),
        };

        let pool = Self {
            core: Arc::new(core),
        };
        {
            let mut free = pool.core.free.lock();
            for _ in 0..initial {
                free.push(Box::new((pool.core.factory)()));
            }
            pool.core.created.store(initial, Ordering::Relaxed);
        }
        pool
    }

    /// Hand out an object in reset state (control thread only)
    pub fn request(&self) -> PoolBox<T> {
        let mut free = self.core.free.lock();

        // Reclaim everything the audio thread has released since last time
        while let Ok(returned) = self.core.returns_rx.try_recv() {
            free.push(returned);
        }

        let mut obj = match free.pop() {
            Some(obj) => obj,
            None => {
                // Quota exceeded: grow opportunistically
                for _ in 1..self.core.grow_by {
                    free.push(Box::new((self.core.factory)()));
                }
                self.core
                    .created
                    .fetch_add(self.core.grow_by, Ordering::Relaxed);
                Box::new((self.core.factory)())
            }
        };
        drop(free);

        obj.reset();
        self.core.live.fetch_add(1, Ordering::Relaxed);

        PoolBox {
            obj: Some(obj),
            core: Arc::clone(&self.core),
        }
    }

    /// Objects handed out and not yet returned
    pub fn live(&self) -> usize {
        self.core.live.load(Ordering::Relaxed)
    }

    /// Objects immediately available without fabrication
    pub fn idle(&self) -> usize {
        self.core.free.lock().len() + self.core.returns_rx.len()
    }

    /// Objects fabricated over the pool's lifetime
    pub fn created(&self) -> usize {
        self.core.created.load(Ordering::Relaxed)
    }
}

impl<T: PoolItem> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

/// Exclusively owned pool object, mutable while unfixed
pub struct PoolBox<T: PoolItem> {
    obj: Option<Box<T>>,
    core: Arc<PoolCore<T>>,
}

impl<T: PoolItem> PoolBox<T> {
    /// Publish: flip to read-only shared access with one reference
    pub fn fix(self) -> PoolRef<T> {
        PoolRef {
            inner: Arc::new(self),
        }
    }
}

impl<T: PoolItem> Deref for PoolBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.obj.as_ref().expect("pool object present until drop")
    }
}

impl<T: PoolItem> DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().expect("pool object present until drop")
    }
}

impl<T: PoolItem> Drop for PoolBox<T> {
    fn drop(&mut self) {
        if let Some(mut obj) = self.obj.take() {
            obj.pre_release();
            self.core.live.fetch_sub(1, Ordering::Relaxed);
            // Send failure cannot happen: the core owns the receiver
            let _ = self.core.returns_tx.send(obj);
        }
    }
}

impl<T: PoolItem + std::fmt::Debug> std::fmt::Debug for PoolBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.deref().fmt(f)
    }
}

/// Shared reference to a fixed pool object
///
/// Clone adds a reference, drop removes one. The 1 → 0 transition returns the
/// object to its pool.
pub struct PoolRef<T: PoolItem> {
    inner: Arc<PoolBox<T>>,
}

impl<T: PoolItem> PoolRef<T> {
    /// Identity comparison: same pooled object
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Current number of references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T: PoolItem> Clone for PoolRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PoolItem> Deref for PoolRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.deref()
    }
}

impl<T: PoolItem + std::fmt::Debug> std::fmt::Debug for PoolRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.deref().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Widget {
        value: i32,
        resets: u32,
        releases: u32,
    }

    impl PoolItem for Widget {
        fn reset(&mut self) {
            self.value = 0;
            self.resets += 1;
        }
        fn pre_release(&mut self) {
            self.releases += 1;
        }
    }

    #[test]
    fn test_request_returns_reset_object() {
        let pool: Pool<Widget> = Pool::new(2, 1, Widget::default);
        let mut w = pool.request();
        assert_eq!(w.value, 0);
        w.value = 42;
        assert_eq!(pool.live(), 1);
        drop(w);
        assert_eq!(pool.live(), 0);

        // Reused object comes back reset
        let w2 = pool.request();
        assert_eq!(w2.value, 0);
        assert!(w2.resets >= 1);
    }

    #[test]
    fn test_reference_conservation() {
        let pool: Pool<Widget> = Pool::new(1, 1, Widget::default);

        let fixed = pool.request().fix();
        assert_eq!(pool.live(), 1);
        assert_eq!(fixed.ref_count(), 1);

        let extra = fixed.clone();
        assert_eq!(extra.ref_count(), 2);
        assert_eq!(pool.live(), 1);

        drop(fixed);
        assert_eq!(extra.ref_count(), 1);
        assert_eq!(pool.live(), 1);

        drop(extra);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_growth_beyond_quota() {
        let pool: Pool<Widget> = Pool::new(1, 4, Widget::default);
        let a = pool.request();
        let b = pool.request();
        let c = pool.request();
        assert_eq!(pool.live(), 3);
        assert!(pool.created() >= 3);
        drop((a, b, c));
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_pre_release_runs_on_return() {
        let pool: Pool<Widget> = Pool::new(1, 1, Widget::default);
        let w = pool.request().fix();
        drop(w);
        let w2 = pool.request();
        assert_eq!(w2.releases, 1);
    }

    #[test]
    fn test_cross_thread_release() {
        let pool: Pool<Widget> = Pool::new(4, 2, Widget::default);
        let r = pool.request().fix();
        let r2 = r.clone();

        let handle = std::thread::spawn(move || {
            // Audio thread only drops its reference
            drop(r2);
        });
        handle.join().unwrap();

        drop(r);
        assert_eq!(pool.live(), 0);
        // The object is reclaimed into the free list on the next request
        let _ = pool.request();
        assert_eq!(pool.live(), 1);
    }
}
