use crate::{
    error::{Error, Result},
    mirrored::VirtualMemory,
};
use anyhow::anyhow;
use core::mem::size_of;
use num::Integer;

/// Upper bound on the size of the whole virtual (doubled) region.
pub const MAX_VIRTUAL_BUF_SIZE: usize = isize::MAX as usize;
/// Upper bound on the size of one half, i.e. the backing region.
pub const MAX_PHYSICAL_BUF_SIZE: usize = MAX_VIRTUAL_BUF_SIZE / 2;

/// Checks that `T` can tile the mirror boundary and returns its byte size.
pub(crate) fn validate_layout<T>() -> Result<usize> {
    let size = size_of::<T>();
    if !size.is_power_of_two() {
        return Err(Error::InvalidLayout { size });
    }
    Ok(size)
}

/// Smallest multiple of `lcm(granularity, element_size)` that holds
/// `requested` elements, never less than one unit.
///
/// Returns `None` if the result overflows or exceeds [`MAX_PHYSICAL_BUF_SIZE`].
pub(crate) fn round_up_to_page_multiple(requested: usize, element_size: usize, granularity: usize) -> Option<usize> {
    debug_assert!(element_size.is_power_of_two() && granularity.is_power_of_two());
    let unit = granularity.lcm(&element_size);
    let total = requested.checked_mul(element_size)?;
    let blocks = total.div_ceil(unit).max(1);
    blocks.checked_mul(unit).filter(|&bytes| bytes <= MAX_PHYSICAL_BUF_SIZE)
}

/// Extra bytes a backend must reserve so that a `granularity`-aligned range
/// can be shifted up to the next `alignment` boundary.
#[inline]
pub(crate) fn alignment_slack(alignment: usize, granularity: usize) -> usize { alignment.saturating_sub(granularity) }

/// Distance from `addr` up to the next multiple of `alignment`, which must be a power of two.
#[inline]
pub(crate) fn offset_to_aligned(addr: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    addr.wrapping_neg() & (alignment - 1)
}

/// Byte capacity of one mirror half for at least `requested` elements of `T` on backend `V`.
pub(crate) fn mirrored_byte_capacity<T, V: VirtualMemory>(requested: usize) -> Result<usize> {
    let element_size = validate_layout::<T>()?;
    round_up_to_page_multiple(requested, element_size, V::allocation_granularity()).ok_or_else(|| {
        Error::Allocation(anyhow!("{requested} elements of {element_size} bytes exceed the addressable mirror size"))
    })
}
