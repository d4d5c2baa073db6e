//! Implements a low-level, mirrored memory buffer.
//!
//! A `MirroredBuffer` owns a virtual memory region that is twice the size of
//! its backing storage. The second half of the virtual memory is a mirror of
//! the first half, so any run of up to `capacity()` elements starting anywhere
//! in the first half is contiguous in memory.
//!
//! It does not track head, tail or fill level. That bookkeeping lives in
//! [`MirroredRing`](crate::MirroredRing).

use super::*;
use crate::error::Result;
use bytemuck::Pod;
use core::{
    marker::PhantomData,
    mem::{ManuallyDrop, align_of, size_of},
    ptr::{self, NonNull},
    slice,
};

/// A contiguous, mirrored memory buffer for elements of type `T`.
///
/// # Invariants
///
/// - `size_of::<T>()` is a power of two and divides `byte_capacity`.
/// - `byte_capacity` is a non-zero multiple of `V::allocation_granularity()`.
/// - `[ptr, ptr + byte_capacity)` is mirrored to `[ptr + byte_capacity, ptr + 2 * byte_capacity)`.
/// - Every slot holds a valid `T`: the OS hands out zeroed pages and `T` is [`Pod`].
pub(crate) struct MirroredBuffer<T, V: VirtualMemory = Os> {
    ptr: NonNull<T>,
    byte_capacity: usize,
    _backend: PhantomData<fn() -> V>,
}

impl<T: Pod, V: VirtualMemory> MirroredBuffer<T, V> {
    /// Maps a new region with room for at least `requested` elements.
    ///
    /// The actual capacity is rounded up to whole allocation units.
    pub(crate) fn with_capacity(requested: usize) -> Result<Self> {
        let byte_capacity = mirrored_byte_capacity::<T, V>(requested)?;
        // size_of::<T>() is a multiple of align_of::<T>(), so an aligned base aligns every slot in both halves.
        let base = unsafe { V::reserve(byte_capacity, align_of::<T>())? };
        tracing::debug!(
            base = ?base,
            element_size = size_of::<T>(),
            byte_capacity,
            "mapped mirrored region"
        );
        Ok(Self { ptr: base.cast(), byte_capacity, _backend: PhantomData })
    }

    /// Number of `T`s that fit in one half.
    #[inline]
    pub(crate) fn capacity(&self) -> usize { self.byte_capacity / size_of::<T>() }

    /// Byte length of one half, i.e. of the backing region.
    #[inline]
    pub(crate) fn byte_capacity(&self) -> usize { self.byte_capacity }

    /// Number of `T`s addressable through the whole virtual region.
    #[inline(always)]
    pub(crate) fn virtual_len(&self) -> usize { self.capacity() * 2 }

    /// Returns a raw pointer to virtual slot `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is past the end of the virtual region. `idx == virtual_len()` is allowed.
    #[inline]
    pub(crate) fn ptr_at(&self, idx: usize) -> *mut T {
        assert!(idx <= self.virtual_len(), "index {idx} out of virtual capacity {}", self.virtual_len());
        unsafe { self.ptr.as_ptr().add(idx) }
    }

    /// The whole doubled region. Slot `i` and slot `i + capacity()` are the same memory.
    #[inline]
    pub(crate) fn virtual_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.virtual_len()) }
    }

    /// Returns `len` elements starting at virtual slot `start`.
    ///
    /// # Panics
    ///
    /// Panics if `[start, start + len)` is not inside the virtual region.
    #[inline]
    pub(crate) fn slice_at(&self, start: usize, len: usize) -> &[T] {
        assert!(start.checked_add(len) <= Some(self.virtual_len()), "slice bounds out of virtual capacity");
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().add(start), len) }
    }

    /// Returns `len` mutable elements starting at virtual slot `start`.
    ///
    /// # Panics
    ///
    /// Panics if `[start, start + len)` is not inside the virtual region, or if
    /// `len > capacity()`: a longer slice would contain the same slot twice.
    #[inline]
    pub(crate) fn slice_mut_at(&mut self, start: usize, len: usize) -> &mut [T] {
        assert!(start.checked_add(len) <= Some(self.virtual_len()), "slice bounds out of virtual capacity");
        assert!(len <= self.capacity(), "a mutable view longer than the capacity would alias itself");
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(start), len) }
    }

    /// Overwrites `len` slots starting at virtual slot `start` with zero bytes.
    #[inline]
    pub(crate) fn zero_at(&mut self, start: usize, len: usize) {
        let dst = self.slice_mut_at(start, len);
        unsafe { ptr::write_bytes(dst.as_mut_ptr(), 0, dst.len()) }
    }

    /// Unmaps the region and reports whether the OS agreed.
    pub(crate) fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        unsafe { V::release(this.ptr.cast(), this.byte_capacity) }
    }
}

impl<T, V: VirtualMemory> Drop for MirroredBuffer<T, V> {
    fn drop(&mut self) {
        match unsafe { V::release(self.ptr.cast(), self.byte_capacity) } {
            Ok(()) => tracing::debug!(base = ?self.ptr, byte_capacity = self.byte_capacity, "released mirrored region"),
            Err(err) => tracing::error!(
                base = ?self.ptr,
                byte_capacity = self.byte_capacity,
                error = %err,
                "mirrored region could not be released and is leaked"
            ),
        }
    }
}

unsafe impl<T: Send, V: VirtualMemory> Send for MirroredBuffer<T, V> {}
unsafe impl<T: Sync, V: VirtualMemory> Sync for MirroredBuffer<T, V> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, mirrored::log_capture::capture_logs};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to the real backend but reports every release as failed.
    struct FailingRelease;

    impl VirtualMemory for FailingRelease {
        fn allocation_granularity() -> usize { Os::allocation_granularity() }

        unsafe fn reserve(byte_capacity: usize, alignment: usize) -> Result<NonNull<u8>> {
            unsafe { Os::reserve(byte_capacity, alignment) }
        }

        unsafe fn release(base: NonNull<u8>, byte_capacity: usize) -> Result<()> {
            unsafe { Os::release(base, byte_capacity)? };
            Err(Error::Release(anyhow!("simulated unmap failure")))
        }
    }

    struct RefusesToMap;

    impl VirtualMemory for RefusesToMap {
        fn allocation_granularity() -> usize { Os::allocation_granularity() }

        unsafe fn reserve(_: usize, _: usize) -> Result<NonNull<u8>> { Err(Error::Mapping(anyhow!("no room"))) }

        unsafe fn release(_: NonNull<u8>, _: usize) -> Result<()> { unreachable!("nothing was reserved") }
    }

    static RELEASES: AtomicUsize = AtomicUsize::new(0);

    struct CountsReleases;

    impl VirtualMemory for CountsReleases {
        fn allocation_granularity() -> usize { Os::allocation_granularity() }

        unsafe fn reserve(byte_capacity: usize, alignment: usize) -> Result<NonNull<u8>> {
            unsafe { Os::reserve(byte_capacity, alignment) }
        }

        unsafe fn release(base: NonNull<u8>, byte_capacity: usize) -> Result<()> {
            RELEASES.fetch_add(1, Ordering::SeqCst);
            unsafe { Os::release(base, byte_capacity) }
        }
    }

    #[test]
    fn with_capacity_rounds_up() {
        let buf = MirroredBuffer::<u32>::with_capacity(10).unwrap();
        assert!(buf.capacity() >= 10);
        assert_eq!(buf.byte_capacity() % allocation_granularity(), 0);
        assert_eq!(buf.virtual_len(), buf.capacity() * 2);
    }

    #[test]
    fn rejects_non_power_of_two_elements() {
        let err = MirroredBuffer::<[u8; 3]>::with_capacity(128).err().unwrap();
        assert!(matches!(err, Error::InvalidLayout { size: 3 }));
    }

    #[test]
    fn mirrored_writes_are_correct() {
        let mut buf = MirroredBuffer::<u32>::with_capacity(4).unwrap();
        let capacity = buf.capacity();
        buf.slice_mut_at(0, 3).copy_from_slice(&[12345, 0, 67890]);
        assert_eq!(buf.slice_at(capacity, 3), &[12345, 0, 67890]);

        buf.slice_mut_at(capacity + 1, 1)[0] = 7;
        assert_eq!(buf.virtual_slice()[1], 7);
    }

    #[test]
    fn slice_across_boundary_is_contiguous() {
        let mut buf = MirroredBuffer::<u8>::with_capacity(16).unwrap();
        let capacity = buf.capacity();
        buf.slice_mut_at(capacity - 4, 8).copy_from_slice(b"abcdefgh");
        assert_eq!(buf.slice_at(capacity - 4, 4), b"abcd");
        assert_eq!(buf.slice_at(0, 4), b"efgh");
    }

    #[test]
    fn zero_at_clears_both_views() {
        let mut buf = MirroredBuffer::<u64>::with_capacity(8).unwrap();
        let capacity = buf.capacity();
        buf.slice_mut_at(capacity - 1, 2).copy_from_slice(&[u64::MAX, u64::MAX]);
        buf.zero_at(capacity - 1, 2);
        assert_eq!(buf.virtual_slice()[capacity - 1], 0);
        assert_eq!(buf.virtual_slice()[0], 0);
        assert_eq!(buf.virtual_slice()[2 * capacity - 1], 0);
    }

    #[test]
    #[should_panic(expected = "slice bounds out of virtual capacity")]
    fn slice_access_out_of_bounds() {
        let buf = MirroredBuffer::<u8>::with_capacity(16).unwrap();
        let v_len = buf.virtual_len();
        let _slice = buf.slice_at(v_len - 4, 5);
    }

    #[test]
    #[should_panic(expected = "would alias itself")]
    fn mutable_slice_longer_than_capacity_panics() {
        let mut buf = MirroredBuffer::<u8>::with_capacity(16).unwrap();
        let capacity = buf.capacity();
        let _slice = buf.slice_mut_at(0, capacity + 1);
    }

    #[test]
    fn alignment_is_honoured() {
        #[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
        #[repr(C, align(32))]
        struct Aligned([u64; 4]);

        let buf = MirroredBuffer::<Aligned>::with_capacity(4).unwrap();
        assert!(buf.capacity() >= 4);
        assert_eq!(buf.ptr_at(0) as usize % align_of::<Aligned>(), 0);
        assert_eq!(buf.ptr_at(buf.capacity()) as usize % align_of::<Aligned>(), 0);
    }

    #[test]
    fn alignment_beyond_the_granularity_is_honoured() {
        #[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
        #[repr(C, align(131072))]
        struct Slab([u8; 131072]);

        assert!(align_of::<Slab>() > allocation_granularity());
        let mut buf = MirroredBuffer::<Slab>::with_capacity(2).unwrap();
        let capacity = buf.capacity();
        assert!(capacity >= 2);
        assert_eq!(buf.ptr_at(0) as usize % align_of::<Slab>(), 0);
        assert_eq!(buf.ptr_at(capacity) as usize % align_of::<Slab>(), 0);

        buf.slice_mut_at(capacity - 1, 1)[0].0[17] = 0xab;
        assert_eq!(buf.slice_at(2 * capacity - 1, 1)[0].0[17], 0xab);
    }

    #[test]
    fn reserve_failure_aborts_construction() {
        let err = MirroredBuffer::<u32, RefusesToMap>::with_capacity(4).err().unwrap();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn explicit_release_reports_failure() {
        let buf = MirroredBuffer::<u32, FailingRelease>::with_capacity(4).unwrap();
        assert!(matches!(buf.release(), Err(Error::Release(_))));
    }

    #[test]
    fn drop_logs_release_failure_instead_of_panicking() {
        let logs = capture_logs(|| {
            let buf = MirroredBuffer::<u32, FailingRelease>::with_capacity(4).unwrap();
            drop(buf);
        });
        assert!(logs.contains("ERROR"), "no error event in {logs:?}");
        assert!(logs.contains("mirrored region could not be released and is leaked"));
        assert!(logs.contains("simulated unmap failure"));
    }

    #[test]
    fn region_is_released_exactly_once() {
        let before = RELEASES.load(Ordering::SeqCst);
        let buf = MirroredBuffer::<u8, CountsReleases>::with_capacity(1).unwrap();
        buf.release().unwrap();
        assert_eq!(RELEASES.load(Ordering::SeqCst), before + 1);

        let buf = MirroredBuffer::<u8, CountsReleases>::with_capacity(1).unwrap();
        drop(buf);
        assert_eq!(RELEASES.load(Ordering::SeqCst), before + 2);
    }
}
