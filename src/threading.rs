use std::ops::Range;
use std::sync::OnceLock;

use rayon::prelude::*;
use vkern_base::iter::balanced_ranges;

use crate::env::env_usize;

/// A wrapper around the Rayon thread pool used to execute primitives.
///
/// On platforms where threads are not supported (eg. WebAssembly) this runs
/// operations directly on the calling thread.
pub struct ThreadPool {
    /// The wrapped thread pool, or None if we failed to construct one.
    pool: Option<rayon::ThreadPool>,
}

impl ThreadPool {
    /// Run a function in the thread pool.
    ///
    /// Kernels executed inside `op` partition their work over this pool's
    /// threads.
    pub fn run<R: Send, Op: FnOnce() -> R + Send>(&self, op: Op) -> R {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(op)
        } else {
            op()
        }
    }

    /// Create a thread pool with a given number of threads.
    pub fn with_num_threads(num_threads: usize) -> ThreadPool {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("vkern-{}", index))
            .build();

        ThreadPool { pool: pool.ok() }
    }

    /// Number of worker threads. This is 1 if the pool could not be created.
    pub fn num_threads(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or(1)
    }
}

/// Return the optimal number of cores to use for maximum performance.
fn optimal_core_count() -> usize {
    num_cpus::get_physical().max(1)
}

/// Environment variable which overrides the size of [`thread_pool`].
pub const NUM_THREADS_VAR: &str = "VKERN_NUM_THREADS";

/// Return the [Rayon][rayon] thread pool which is used to execute primitives.
///
/// The pool size defaults to the number of physical cores, since kernels are
/// CPU-bound. It can be overridden at the process level by setting the
/// `VKERN_NUM_THREADS` environment variable, whose value is clamped to
/// between 1 and the logical core count.
///
/// To run a primitive in a different pool, call `execute` inside
/// [`ThreadPool::run`] for that pool.
///
/// [rayon]: https://github.com/rayon-rs/rayon
pub fn thread_pool() -> &'static ThreadPool {
    static THREAD_POOL: OnceLock<ThreadPool> = OnceLock::new();
    THREAD_POOL.get_or_init(|| {
        let num_threads = env_usize(NUM_THREADS_VAR)
            .map(|n| n.clamp(1, num_cpus::get().max(1)))
            .unwrap_or_else(optimal_core_count);
        tracing::debug!(num_threads, "creating thread pool");
        ThreadPool::with_num_threads(num_threads)
    })
}

/// Return the number of threads that kernels called from the current thread
/// will use.
///
/// This is the size of the enclosing Rayon pool if called from within one,
/// or of [`thread_pool`] otherwise. Primitives size per-thread scratch space
/// using this value.
pub fn max_threads() -> usize {
    if rayon::current_thread_index().is_some() {
        rayon::current_num_threads()
    } else {
        thread_pool().num_threads()
    }
}

/// Run `f(ithr, nthr)` once for each thread id `ithr` in `0..nthr`, where
/// `nthr` is `n_threads` or [`max_threads`] if `n_threads` is zero.
///
/// The calls run concurrently in the current Rayon pool, or in
/// [`thread_pool`] if the caller is not in a pool, and this returns once all
/// of them have completed. With a single thread `f` runs inline.
pub fn parallel<F>(n_threads: usize, f: F)
where
    F: Fn(usize, usize) + Send + Sync,
{
    let nthr = if n_threads == 0 {
        max_threads()
    } else {
        n_threads
    };

    if nthr == 1 {
        f(0, 1);
        return;
    }

    in_pool(|| (0..nthr).into_par_iter().for_each(|ithr| f(ithr, nthr)));
}

/// Run `op` in the current Rayon pool if the caller is in one, or in
/// [`thread_pool`] otherwise.
///
/// Kernels which use Rayon's parallel iterators directly wrap them in this.
pub fn in_pool<R: Send, Op: FnOnce() -> R + Send>(op: Op) -> R {
    if rayon::current_thread_index().is_some() {
        op()
    } else {
        thread_pool().run(op)
    }
}

/// Call `f(i)` for each `i` in `0..n`, statically partitioning the range
/// over threads with [`balanced_ranges`].
pub fn parallel_for<F>(n: usize, f: F)
where
    F: Fn(usize) + Send + Sync,
{
    parallel_for_ranges(n, |range| range.for_each(&f));
}

/// Partition `0..n` over threads and call `f` once per thread with that
/// thread's contiguous sub-range.
///
/// At most `n` threads are used, so `f` never receives an empty range unless
/// `n` is zero, in which case it is not called.
pub fn parallel_for_ranges<F>(n: usize, f: F)
where
    F: Fn(Range<usize>) + Send + Sync,
{
    if n == 0 {
        return;
    }
    let nthr = max_threads().min(n);
    if nthr == 1 {
        f(0..n);
        return;
    }
    in_pool(|| balanced_ranges(n, nthr).into_par_iter().for_each(f));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::{
        max_threads, optimal_core_count, parallel, parallel_for, parallel_for_ranges, ThreadPool,
    };

    #[test]
    fn test_optimal_core_count() {
        let max_cores = num_cpus::get_physical();
        let opt_cores = optimal_core_count();
        assert!(opt_cores >= 1 && opt_cores <= max_cores);
    }

    #[test]
    fn test_parallel_visits_each_thread_id() {
        let seen = Mutex::new(Vec::new());
        parallel(5, |ithr, nthr| {
            assert_eq!(nthr, 5);
            seen.lock().unwrap().push(ithr);
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_parallel_for() {
        let counts: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
        parallel_for(counts.len(), |i| {
            counts[i].fetch_add(1, Ordering::Relaxed);
        });
        assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_parallel_for_ranges() {
        let ranges = Mutex::new(Vec::new());
        parallel_for_ranges(3, |r| ranges.lock().unwrap().push(r));
        let mut ranges = ranges.into_inner().unwrap();
        ranges.sort_by_key(|r| r.start);
        assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), 3);
        assert!(ranges.iter().all(|r| !r.is_empty()));

        // Nothing to do.
        parallel_for_ranges(0, |_| panic!("should not be called"));
    }

    #[test]
    fn test_custom_pool() {
        let pool = ThreadPool::with_num_threads(3);
        assert_eq!(pool.num_threads(), 3);
        let n = pool.run(max_threads);
        assert_eq!(n, 3);
    }
}
