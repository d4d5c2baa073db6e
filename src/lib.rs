//! # mirrored_ring
//!
//! A fixed-capacity ring buffer of plain-old-data elements whose storage is
//! mapped twice, back to back, in virtual memory. Byte `i` and byte
//! `i + byte_capacity()` are the same memory, so any run of up to
//! `capacity()` elements starting at the head or the tail is one contiguous
//! slice, even when it crosses the wrap point.
//!
//! ## Design
//!
//! - All OS work happens in [`MirroredRing::new`] and on drop.
//! - Producer workflow: write through [`head_ptr`](MirroredRing::head_ptr) or
//!   [`free_slice_mut`](MirroredRing::free_slice_mut) → [`produce`](MirroredRing::produce).
//! - Consumer workflow: read through [`tail_ptr`](MirroredRing::tail_ptr) or
//!   [`as_slice`](MirroredRing::as_slice) → [`consume`](MirroredRing::consume)
//!   or [`consume_zero`](MirroredRing::consume_zero).
//! - Positional indexing ([`get`](MirroredRing::get), [`set`](MirroredRing::set),
//!   `ring[i]`) addresses physical slots and ignores head and tail.
//!
//! ## Example
//!
//! ```
//! use mirrored_ring::MirroredRing;
//!
//! let mut ring = MirroredRing::<u32>::new(1000)?;
//! assert!(ring.capacity() >= 1000);
//!
//! ring.push_slice(&[1, 2, 3])?;
//! assert_eq!(ring.as_slice(), &[1, 2, 3]);
//!
//! ring.consume(2)?;
//! assert_eq!(ring.as_slice(), &[3]);
//! # Ok::<(), mirrored_ring::Error>(())
//! ```

mod error;
mod mirrored;

#[cfg(feature = "bytes")]
mod bytes;
#[cfg(feature = "io")]
mod io;
#[cfg(feature = "tokio-io")]
mod tokio;

pub use bytemuck::{Pod, Zeroable};
pub use error::{Error, Result};
pub use mirrored::{MAX_PHYSICAL_BUF_SIZE, MAX_VIRTUAL_BUF_SIZE, allocation_granularity};

use core::{
    fmt,
    mem::size_of,
    ops::{Index, IndexMut},
};
use mirrored::MirroredBuffer;

/// A fixed-capacity queue over a mirrored mapping.
///
/// `head` and `tail` are element offsets in `[0, capacity())`; pointers and
/// slices handed out may extend into the mirrored half.
pub struct MirroredRing<T> {
    buf: MirroredBuffer<T>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T: Pod> MirroredRing<T> {
    /// Maps a ring with room for at least `requested` elements.
    ///
    /// The capacity is rounded up to whole pages (whole allocation units on
    /// Windows), and a request for zero elements still gets one page.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidLayout`] if `size_of::<T>()` is not a power of two.
    /// - [`Error::Allocation`] if the backing region cannot be created, or the
    ///   request does not fit in the address space.
    /// - [`Error::Mapping`] if the two halves cannot be placed back to back.
    pub fn new(requested: usize) -> Result<Self> {
        let buf = MirroredBuffer::with_capacity(requested)?;
        Ok(Self { buf, head: 0, tail: 0, len: 0 })
    }

    /// Total number of elements the ring holds when full.
    #[inline]
    pub fn capacity(&self) -> usize { self.buf.capacity() }

    /// Same as [`capacity`](Self::capacity): the total element count, not the fill level.
    #[inline]
    pub fn size_elements(&self) -> usize { self.capacity() }

    /// Byte size of the backing region (one mirror half).
    #[inline]
    pub fn byte_capacity(&self) -> usize { self.buf.byte_capacity() }

    /// Number of produced elements not yet consumed.
    #[inline]
    pub fn len(&self) -> usize {
        let len = self.len;
        debug_assert!(len <= self.capacity(), "len:{} > capacity:{}", len, self.capacity());
        len
    }

    /// Bytes currently holding unconsumed data.
    #[inline]
    pub fn fill_bytes(&self) -> usize { self.len() * size_of::<T>() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    #[inline]
    pub fn is_full(&self) -> bool { self.len() == self.capacity() }

    /// Number of elements that can be produced before the ring is full.
    #[inline]
    pub fn free_space(&self) -> usize { self.capacity() - self.len() }

    /// Element offset of the write cursor, always below `capacity()`.
    #[inline]
    pub fn head(&self) -> usize {
        let head = self.head;
        debug_assert!(head < self.capacity());
        head
    }

    /// Element offset of the read cursor, always below `capacity()`.
    #[inline]
    pub fn tail(&self) -> usize {
        let tail = self.tail;
        debug_assert!(tail < self.capacity());
        tail
    }

    /// Pointer to the next slot to write.
    ///
    /// Up to [`free_space`](Self::free_space) elements may be written through
    /// it before calling [`produce`](Self::produce). The run is contiguous even
    /// if it crosses the end of the first half.
    #[inline]
    pub fn head_ptr(&mut self) -> *mut T { self.buf.ptr_at(self.head) }

    /// Pointer to the oldest unconsumed element.
    ///
    /// Up to [`capacity`](Self::capacity) elements are readable through it;
    /// only the first [`len`](Self::len) hold unconsumed data.
    #[inline]
    pub fn tail_ptr(&self) -> *const T { self.buf.ptr_at(self.tail) }

    /// Commits `n` elements already written at the head.
    ///
    /// # Errors
    ///
    /// [`Error::Capacity`] if `n` exceeds [`free_space`](Self::free_space).
    /// The ring is left untouched.
    pub fn produce(&mut self, n: usize) -> Result<()> {
        let available = self.free_space();
        if n > available {
            return Err(Error::Capacity { requested: n, available });
        }
        self.head = (self.head + n) % self.capacity();
        self.len += n;
        self.debug_assert_cursors();
        Ok(())
    }

    /// Releases `n` elements from the tail. The data is left in place.
    ///
    /// # Errors
    ///
    /// [`Error::Underflow`] if `n` exceeds [`len`](Self::len). The ring is left untouched.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        let available = self.len();
        if n > available {
            return Err(Error::Underflow { requested: n, available });
        }
        self.advance_tail(n);
        Ok(())
    }

    /// Like [`consume`](Self::consume), but overwrites the released slots with zero bytes first.
    ///
    /// # Errors
    ///
    /// [`Error::Underflow`] if `n` exceeds [`len`](Self::len). Nothing is zeroed in that case.
    pub fn consume_zero(&mut self, n: usize) -> Result<()> {
        let available = self.len();
        if n > available {
            return Err(Error::Underflow { requested: n, available });
        }
        self.buf.zero_at(self.tail, n);
        self.advance_tail(n);
        Ok(())
    }

    /// Drops all unconsumed elements without touching their memory.
    #[inline]
    pub fn clear(&mut self) {
        self.tail = self.head;
        self.len = 0;
    }

    /// Reads physical slot `index`, wrapping in both directions.
    ///
    /// `get(capacity())` is `get(0)` and `get(-1)` is `get(capacity() - 1)`.
    #[inline]
    pub fn get(&self, index: isize) -> T { self[index] }

    /// Writes physical slot `index`, wrapping in both directions. Head, tail and
    /// fill level are not affected.
    #[inline]
    pub fn set(&mut self, index: isize, value: T) { self[index] = value; }

    /// The unconsumed elements, oldest first, as one contiguous slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] { self.buf.slice_at(self.tail, self.len) }

    /// The unconsumed elements, oldest first, as one contiguous mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let (tail, len) = (self.tail, self.len);
        self.buf.slice_mut_at(tail, len)
    }

    /// The free region at the head as one contiguous slice. Write into it,
    /// then [`produce`](Self::produce) what was written.
    #[inline]
    pub fn free_slice_mut(&mut self) -> &mut [T] {
        let (head, free) = (self.head, self.free_space());
        self.buf.slice_mut_at(head, free)
    }

    /// Both halves of the mapping: `2 * capacity()` elements where slot `i`
    /// and slot `i + capacity()` are the same memory.
    #[inline]
    pub fn mirrored_slice(&self) -> &[T] { self.buf.virtual_slice() }

    /// Copies `src` in at the head and produces it, or does nothing.
    ///
    /// # Errors
    ///
    /// [`Error::Capacity`] if `src` does not fit in the free space.
    pub fn push_slice(&mut self, src: &[T]) -> Result<()> {
        let available = self.free_space();
        if src.len() > available {
            return Err(Error::Capacity { requested: src.len(), available });
        }
        self.free_slice_mut()[..src.len()].copy_from_slice(src);
        self.produce(src.len())
    }

    /// Fills `dst` from the tail and consumes what was copied, or does nothing.
    ///
    /// # Errors
    ///
    /// [`Error::Underflow`] if fewer than `dst.len()` elements are available.
    pub fn pop_slice(&mut self, dst: &mut [T]) -> Result<()> {
        let available = self.len();
        if dst.len() > available {
            return Err(Error::Underflow { requested: dst.len(), available });
        }
        dst.copy_from_slice(&self.as_slice()[..dst.len()]);
        self.consume(dst.len())
    }

    /// Unmaps the ring now and reports whether the OS agreed.
    ///
    /// Dropping the ring does the same but can only log a failure.
    ///
    /// # Errors
    ///
    /// [`Error::Release`] if the mapping could not be removed. The region is
    /// leaked; retrying is not possible.
    pub fn close(self) -> Result<()> { self.buf.release() }

    #[inline]
    fn advance_tail(&mut self, n: usize) {
        self.tail = (self.tail + n) % self.capacity();
        self.len -= n;
        self.debug_assert_cursors();
    }

    #[inline]
    fn slot(&self, index: isize) -> usize {
        // capacity() <= MAX_PHYSICAL_BUF_SIZE < isize::MAX
        index.rem_euclid(self.capacity() as isize) as usize
    }

    #[inline(always)]
    fn debug_assert_cursors(&self) {
        debug_assert!(self.len <= self.capacity());
        debug_assert_eq!(self.head, (self.tail + self.len) % self.capacity(), "head must trail tail by len");
    }
}

impl<T: Pod> Index<isize> for MirroredRing<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: isize) -> &T { &self.buf.virtual_slice()[self.slot(index)] }
}

impl<T: Pod> IndexMut<isize> for MirroredRing<T> {
    #[inline]
    fn index_mut(&mut self, index: isize) -> &mut T {
        let slot = self.slot(index);
        &mut self.buf.slice_mut_at(slot, 1)[0]
    }
}

impl<T: Pod> fmt::Debug for MirroredRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirroredRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
