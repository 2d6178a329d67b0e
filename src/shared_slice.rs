use std::marker::PhantomData;

/// A mutable slice which several threads write to concurrently.
///
/// Kernels address outputs through layout-dependent offsets, so the set of
/// elements a work item writes is not a contiguous sub-slice that could be
/// split off with `chunks_mut`. Instead each work item receives this shared
/// handle and writes individual elements. Kernels guarantee that work items
/// write disjoint sets of coordinates, and primitives reject output
/// descriptors which fail [`MemoryDesc::check_writable`], so disjoint
/// coordinates are also disjoint offsets.
///
/// [`MemoryDesc::check_writable`]: vkern_layout::MemoryDesc::check_writable
pub struct SharedSliceMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// Safety: Concurrent access is only possible through the unsafe `read` and
// `write` methods, whose callers guarantee that no element is accessed by
// more than one thread while any thread writes to it.
unsafe impl<T: Send> Send for SharedSliceMut<'_, T> {}
unsafe impl<T: Send> Sync for SharedSliceMut<'_, T> {}

impl<'a, T: Copy> SharedSliceMut<'a, T> {
    pub fn new(data: &'a mut [T]) -> Self {
        SharedSliceMut {
            ptr: data.as_mut_ptr(),
            len: data.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write `value` at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len()` and no other thread may read or
    /// write `index` concurrently.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len, "index {} out of bounds {}", index, self.len);
        // Safety: See function docs.
        unsafe { *self.ptr.add(index) = value }
    }

    /// Read the element at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len()` and no other thread may write
    /// `index` concurrently.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T {
        debug_assert!(index < self.len, "index {} out of bounds {}", index, self.len);
        // Safety: See function docs.
        unsafe { *self.ptr.add(index) }
    }
}

#[cfg(test)]
mod tests {
    use rayon::prelude::*;

    use super::SharedSliceMut;

    #[test]
    fn test_disjoint_parallel_writes() {
        let mut data = vec![0usize; 1000];
        let shared = SharedSliceMut::new(&mut data);

        // Interleaved writes, so no thread owns a contiguous chunk.
        (0..4usize).into_par_iter().for_each(|t| {
            for i in (t..shared.len()).step_by(4) {
                // Safety: Each index is written by exactly one task.
                unsafe { shared.write(i, i * 2) };
            }
        });

        assert!(data.iter().enumerate().all(|(i, &x)| x == i * 2));
    }
}
