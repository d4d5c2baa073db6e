//! Mirrored memory buffer.
//!
//! One backing region of `S` bytes is mapped twice, back to back, so that the
//! virtual range `[base, base + 2S)` reads and writes the same storage in both
//! halves. Each target provides exactly one [`VirtualMemory`] implementation,
//! exported here as [`Os`].
mod buffer;
#[cfg(test)]
pub(crate) mod log_capture;
mod utils;

use crate::error::Result;
use core::ptr::NonNull;

pub(crate) use buffer::MirroredBuffer;
pub use utils::{MAX_PHYSICAL_BUF_SIZE, MAX_VIRTUAL_BUF_SIZE};
pub(crate) use utils::{alignment_slack, mirrored_byte_capacity, offset_to_aligned};

/// Platform capability to install and remove a double mapping.
pub(crate) trait VirtualMemory {
    /// Smallest unit, in bytes, that either half of a mirror can be sized to.
    fn allocation_granularity() -> usize;

    /// Creates one backing region of `byte_capacity` bytes and maps it twice,
    /// contiguously. Returns the start of the `2 * byte_capacity` range, which
    /// is a multiple of `alignment`.
    ///
    /// # Safety
    ///
    /// `byte_capacity` must be a non-zero multiple of both
    /// [`allocation_granularity`](Self::allocation_granularity) and
    /// `alignment`, and no larger than [`MAX_PHYSICAL_BUF_SIZE`]. `alignment`
    /// must be a power of two. The returned region must be handed back to
    /// [`release`](Self::release) exactly once.
    unsafe fn reserve(byte_capacity: usize, alignment: usize) -> Result<NonNull<u8>>;

    /// Unmaps both halves of a region returned by [`reserve`](Self::reserve).
    ///
    /// # Safety
    ///
    /// `base` and `byte_capacity` must come from one successful `reserve`, and
    /// no reference into the region may outlive this call.
    unsafe fn release(base: NonNull<u8>, byte_capacity: usize) -> Result<()>;
}

/// Returns the platform's allocation granularity in bytes.
#[inline]
pub fn allocation_granularity() -> usize { Os::allocation_granularity() }

#[cfg(all(target_family = "unix", not(target_vendor = "apple")))]
mod unix;

#[cfg(all(target_family = "unix", not(target_vendor = "apple")))]
pub(crate) use unix::Os;

#[cfg(target_vendor = "apple")]
mod darwin;

#[cfg(target_vendor = "apple")]
pub(crate) use darwin::Os;

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub(crate) use windows::Os;
