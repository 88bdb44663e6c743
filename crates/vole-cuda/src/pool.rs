// Device Buffer Pool — caching allocator for GPU buffer reuse
//
// Repeated cudaMalloc/cudaFree round-trips are expensive, so released
// buffers are parked in per-size free lists instead of going back to the
// driver; the next allocation of the same element count reuses them.
//
// This doubles as the engine's device-buffer registry: every matrix and
// token buffer is allocated through it with a result-typed call, and
// `CudaMatrix::release` / `CudaTokens::release` hand the storage back.
//
// The engine only ever stores two element types on the device: f32 matrix
// data and i32 token ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cudarc::driver::{CudaSlice, DeviceSlice};

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Total bytes currently held in the cache (not in use by matrices).
    pub cached_bytes: usize,
    /// Number of individual buffers currently in the cache.
    pub cached_buffers: usize,
    /// Cumulative cache hits (allocations served from the cache).
    pub hits: u64,
    /// Cumulative cache misses (allocations that fell through to cudaMalloc).
    pub misses: u64,
}

/// A per-type free-list: maps element count → stack of free CudaSlice<T>.
struct TypedPool<T> {
    buckets: Mutex<HashMap<usize, Vec<CudaSlice<T>>>>,
}

impl<T> TypedPool<T> {
    fn new() -> Self {
        TypedPool {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to pop a cached buffer of exactly `n` elements.
    fn try_pop(&self, n: usize) -> Option<CudaSlice<T>> {
        let mut map = self.buckets.lock().unwrap();
        map.get_mut(&n).and_then(|stack| stack.pop())
    }

    /// Push a buffer back into the cache.
    fn push(&self, slice: CudaSlice<T>)
    where
        CudaSlice<T>: DeviceSlice<T>,
    {
        let n = slice.len();
        let mut map = self.buckets.lock().unwrap();
        map.entry(n).or_default().push(slice);
    }

    /// Drop every cached buffer, actually freeing the GPU memory.
    fn drain(&self) {
        self.buckets.lock().unwrap().drain().for_each(drop);
    }

    /// Count of cached buffers and total cached elements.
    fn stats(&self) -> (usize, usize) {
        let map = self.buckets.lock().unwrap();
        let mut count = 0usize;
        let mut elems = 0usize;
        for (n, stack) in map.iter() {
            count += stack.len();
            elems += *n * stack.len();
        }
        (count, elems)
    }
}

/// A CUDA memory caching allocator.
///
/// Maintains per-element-type free lists keyed by element count. Reuses
/// buffers when possible, falling back to `cudaMalloc` on cache miss.
pub struct CudaMemPool {
    pool_f32: TypedPool<f32>,
    pool_i32: TypedPool<i32>,

    // Atomic counters — no lock contention on the hot path
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CudaMemPool {
    /// Create a new empty memory pool.
    pub fn new() -> Self {
        CudaMemPool {
            pool_f32: TypedPool::new(),
            pool_i32: TypedPool::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Allocate `n` f32 elements and zero them, reusing a cached buffer if
    /// one of the right size is available.
    pub fn alloc_zeros_f32(
        &self,
        dev: &std::sync::Arc<cudarc::driver::CudaDevice>,
        n: usize,
    ) -> std::result::Result<CudaSlice<f32>, cudarc::driver::DriverError> {
        if let Some(mut buf) = self.pool_f32.try_pop(n) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            dev.memset_zeros(&mut buf)?;
            Ok(buf)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            dev.alloc_zeros::<f32>(n)
        }
    }

    /// Allocate `n` i32 elements and zero them.
    pub fn alloc_zeros_i32(
        &self,
        dev: &std::sync::Arc<cudarc::driver::CudaDevice>,
        n: usize,
    ) -> std::result::Result<CudaSlice<i32>, cudarc::driver::DriverError> {
        if let Some(mut buf) = self.pool_i32.try_pop(n) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            dev.memset_zeros(&mut buf)?;
            Ok(buf)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            dev.alloc_zeros::<i32>(n)
        }
    }

    /// Return an f32 buffer to the pool for reuse.
    pub fn reclaim_f32(&self, s: CudaSlice<f32>) {
        self.pool_f32.push(s);
    }

    /// Return an i32 buffer to the pool for reuse.
    pub fn reclaim_i32(&self, s: CudaSlice<i32>) {
        self.pool_i32.push(s);
    }

    /// Release all cached buffers back to the CUDA driver.
    /// This actually frees GPU memory.
    pub fn empty_cache(&self) {
        self.pool_f32.drain();
        self.pool_i32.drain();
    }

    /// Return a snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let (c_f32, e_f32) = self.pool_f32.stats();
        let (c_i32, e_i32) = self.pool_i32.stats();
        PoolStats {
            cached_bytes: e_f32 * std::mem::size_of::<f32>() + e_i32 * std::mem::size_of::<i32>(),
            cached_buffers: c_f32 + c_i32,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Reset hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for CudaMemPool {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: all interior mutability is through Mutex + Atomics.
unsafe impl Send for CudaMemPool {}
unsafe impl Sync for CudaMemPool {}
