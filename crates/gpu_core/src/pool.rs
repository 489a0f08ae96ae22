//! Reusable resource pools for short-lived GPU handles
//!
//! Command buffers and fences are expensive to create and destroy relative
//! to reuse, so they are drawn from pools that amortize creation cost and
//! bound the number of live handles to the high-water mark. Handles are
//! recycled, never individually freed; `destroy` releases everything the
//! pool ever created.

use std::collections::VecDeque;

use crate::error::VulkanResult;

/// Creation and destruction callbacks for pooled handles.
///
/// `alloc` fills every slot of `out` with a freshly created handle;
/// `release` destroys one handle when the owning pool is torn down.
pub trait PoolAllocator<T> {
    /// Create one handle per slot in `out`
    fn alloc(&mut self, out: &mut [T]) -> VulkanResult<()>;

    /// Destroy a handle created by `alloc`
    fn release(&mut self, handle: &mut T);
}

/// Pool of homogeneous, reusable GPU handles.
///
/// A handle is in one of three states: never issued, issued, or released
/// back for reuse. Requests drain never-issued handles first, then recycled
/// ones (FIFO), and grow the backing storage by the remaining shortfall.
///
/// The pool is not internally synchronized; callers serialize access per
/// device. Releasing the same handle twice without requesting it in between
/// is a contract violation (checked in debug builds only).
pub struct ResourcePool<T, A> {
    allocator: A,
    data: Vec<T>,
    cursor: usize,
    released: VecDeque<usize>,
}

impl<T, A> ResourcePool<T, A>
where
    T: Copy + Default + PartialEq,
    A: PoolAllocator<T>,
{
    /// Create an empty pool around the given allocator
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            data: Vec::new(),
            cursor: 0,
            released: VecDeque::new(),
        }
    }

    /// Reset the pool and eagerly create `count` handles
    pub fn allocate(&mut self, count: usize) -> VulkanResult<()> {
        self.data.clear();
        self.released.clear();
        self.cursor = 0;
        self.data.resize_with(count, T::default);
        if let Err(e) = self.allocator.alloc(&mut self.data[..]) {
            self.data.clear();
            return Err(e);
        }
        Ok(())
    }

    /// Fill `out` with free handles, growing the pool if necessary.
    ///
    /// Never-issued handles are handed out first, then handles released back
    /// for reuse (oldest first). If the pool is still short, the backing
    /// storage grows by exactly the shortfall through the allocator.
    pub fn request(&mut self, out: &mut [T]) -> VulkanResult<()> {
        let mut filled = 0;

        // Never-issued handles first
        while filled < out.len() && self.cursor < self.data.len() {
            out[filled] = self.data[self.cursor];
            self.cursor += 1;
            filled += 1;
        }

        // Then recycled handles, oldest first
        while filled < out.len() {
            match self.released.pop_front() {
                Some(index) => {
                    out[filled] = self.data[index];
                    filled += 1;
                }
                None => break,
            }
        }

        // Grow by the remaining shortfall
        let shortfall = out.len() - filled;
        if shortfall > 0 {
            let old_len = self.data.len();
            self.data.resize_with(old_len + shortfall, T::default);
            if let Err(e) = self.allocator.alloc(&mut self.data[old_len..]) {
                self.data.truncate(old_len);
                return Err(e);
            }
            out[filled..].copy_from_slice(&self.data[old_len..]);
            self.cursor = self.data.len();
            log::debug!(
                "Resource pool grew by {} to {} handles",
                shortfall,
                self.data.len()
            );
        }
        Ok(())
    }

    /// Request a single handle
    pub fn request_one(&mut self) -> VulkanResult<T> {
        let mut out = [T::default()];
        self.request(&mut out)?;
        Ok(out[0])
    }

    /// Return a handle to the pool for reuse.
    ///
    /// Releasing a handle the pool does not own is a no-op. Double release
    /// corrupts the reuse queue and is rejected in debug builds.
    pub fn release(&mut self, handle: T) {
        if let Some(index) = self.data.iter().position(|h| *h == handle) {
            debug_assert!(
                !self.released.contains(&index),
                "handle released twice without an intervening request"
            );
            self.released.push_back(index);
        }
    }

    /// Return several handles to the pool for reuse
    pub fn release_all(&mut self, handles: &[T]) {
        for handle in handles {
            self.release(*handle);
        }
    }

    /// Number of free handles (never issued plus released back)
    pub fn size(&self) -> usize {
        self.data.len() - self.cursor + self.released.len()
    }

    /// Destroy every handle ever created and clear the pool
    pub fn destroy(&mut self) {
        for handle in &mut self.data {
            self.allocator.release(handle);
        }
        self.data.clear();
        self.released.clear();
        self.cursor = 0;
    }

    /// Access the underlying allocator
    pub fn allocator(&self) -> &A {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Hands out sequential ids and counts lifecycle events
    #[derive(Default)]
    struct CountingAlloc {
        next: u64,
        created: usize,
        destroyed: usize,
    }

    impl PoolAllocator<u64> for CountingAlloc {
        fn alloc(&mut self, out: &mut [u64]) -> VulkanResult<()> {
            for slot in out {
                self.next += 1;
                *slot = self.next;
                self.created += 1;
            }
            Ok(())
        }

        fn release(&mut self, _handle: &mut u64) {
            self.destroyed += 1;
        }
    }

    fn pool_with(count: usize) -> ResourcePool<u64, CountingAlloc> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut pool = ResourcePool::new(CountingAlloc::default());
        pool.allocate(count).expect("allocate");
        pool
    }

    #[test]
    fn allocate_sets_size() {
        let pool = pool_with(5);
        assert_eq!(pool.size(), 5);
        assert_eq!(pool.allocator().created, 5);
    }

    #[test]
    fn request_and_release_round_trip() {
        let mut pool = pool_with(5);

        let mut taken = [0u64; 3];
        pool.request(&mut taken).expect("request");
        assert_eq!(pool.size(), 2);

        pool.release_all(&taken);
        assert_eq!(pool.size(), 5);

        // Re-requesting returns recycled handles, never newly created ones
        let mut again = [0u64; 3];
        pool.request(&mut again).expect("request");
        assert_eq!(pool.allocator().created, 5);

        let released: HashSet<u64> = taken.iter().copied().collect();
        for handle in &again {
            // Either still-unissued or one of the recycled handles; all five
            // original values are fair game
            assert!(*handle >= 1 && *handle <= 5);
        }
        // The first two come from the unissued region, the third from reuse
        assert!(released.contains(&again[2]));
    }

    #[test]
    fn five_fence_scenario() {
        // allocate 5; request 3 -> 2 remain; release 3 -> 5 remain;
        // request 5 -> the original 5 handle values come back (set equality)
        let mut pool = pool_with(5);

        let mut first = [0u64; 3];
        pool.request(&mut first).expect("request");
        assert_eq!(pool.size(), 2);

        pool.release_all(&first);
        assert_eq!(pool.size(), 5);

        let mut all = [0u64; 5];
        pool.request(&mut all).expect("request");
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.allocator().created, 5);

        let expected: HashSet<u64> = (1..=5).collect();
        let actual: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn request_grows_by_shortfall() {
        let mut pool = pool_with(0);
        assert_eq!(pool.size(), 0);

        let mut out = [0u64; 4];
        pool.request(&mut out).expect("request");
        assert_eq!(pool.allocator().created, 4);
        // All four were issued by the same request
        assert_eq!(pool.size(), 0);

        // Growth appends; releasing and re-requesting recycles them
        pool.release_all(&out);
        assert_eq!(pool.size(), 4);
        let mut again = [0u64; 2];
        pool.request(&mut again).expect("request");
        assert_eq!(pool.allocator().created, 4);
    }

    #[test]
    fn partial_growth_mixes_sources() {
        let mut pool = pool_with(2);

        let mut out = [0u64; 5];
        pool.request(&mut out).expect("request");
        // 2 unissued + 3 grown
        assert_eq!(pool.allocator().created, 5);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn release_of_unknown_handle_is_noop() {
        let mut pool = pool_with(2);
        pool.release(9999);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn destroy_releases_everything_ever_created() {
        let mut pool = pool_with(3);
        let mut out = [0u64; 5];
        pool.request(&mut out).expect("request");
        pool.destroy();
        assert_eq!(pool.allocator().destroyed, 5);
        assert_eq!(pool.size(), 0);
    }
}
