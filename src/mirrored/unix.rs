//! Mirrored memory on Linux, Android and the BSDs.
//!
//! A `PROT_NONE` placeholder of twice the capacity is reserved first, then the
//! backing object is mapped over each half with `MAP_FIXED`. Because the
//! placeholder already owns the whole range, no other thread can grab the
//! upper half between the two mappings. For elements aligned beyond a page
//! the placeholder is over-reserved and trimmed to an aligned start.
//!
//! | step              | Linux / Android        | other Unix                     |
//! |-------------------|------------------------|--------------------------------|
//! | backing object    | `memfd_create`         | `shm_open` + `shm_unlink`      |
//! | reserve range     | `mmap` `PROT_NONE`     | `mmap` `PROT_NONE`             |
//! | map each half     | `mmap` `MAP_FIXED`     | `mmap` `MAP_FIXED`             |
//! | release           | `munmap`               | `munmap`                       |

use crate::{
    error::{Error, Result},
    mirrored::{MAX_PHYSICAL_BUF_SIZE, VirtualMemory, alignment_slack, offset_to_aligned},
};
use anyhow::{Context, Result as AnyResult, anyhow};
use nix::{
    sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap},
    unistd::{SysconfVar, ftruncate, sysconf},
};
use std::{
    ffi::{c_long, c_void},
    num::NonZeroUsize,
    os::fd::{AsFd, OwnedFd},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Used for size arithmetic only when `sysconf(_SC_PAGESIZE)` has no answer.
/// [`Os::reserve`] refuses to map anything in that case.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// The Unix [`VirtualMemory`] backend.
pub(crate) struct Os;

#[inline(always)]
fn nonnull_into_nonzerousize(ptr: NonNull<c_void>) -> NonZeroUsize {
    unsafe { NonZeroUsize::new_unchecked(ptr.as_ptr() as usize) }
}

fn page_size_from(answer: nix::Result<Option<c_long>>) -> AnyResult<usize> {
    match answer {
        Ok(Some(size)) if size > 0 => Ok(size as usize),
        Ok(other) => Err(anyhow!("sysconf(PAGE_SIZE) gave no usable answer: {other:?}")),
        Err(errno) => Err(anyhow!(errno).context("sysconf(PAGE_SIZE) failed")),
    }
}

fn page_size() -> AnyResult<usize> {
    const UNINIT_PAGE_SIZE: usize = 0;
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(UNINIT_PAGE_SIZE);
    let cached_val = PAGE_SIZE.load(Ordering::Acquire);
    if cached_val != UNINIT_PAGE_SIZE {
        return Ok(cached_val);
    }
    let updated_val = page_size_from(sysconf(SysconfVar::PAGE_SIZE))?;
    match PAGE_SIZE.compare_exchange(UNINIT_PAGE_SIZE, updated_val, Ordering::Release, Ordering::Acquire) {
        Ok(_) => Ok(updated_val),
        Err(val_from_other_thread) => Ok(val_from_other_thread),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_backing_fd() -> AnyResult<OwnedFd> {
    use nix::sys::memfd::{MFdFlags, memfd_create};
    let fd = memfd_create("mirrored_ring", MFdFlags::MFD_CLOEXEC).context("memfd_create failed")?;
    Ok(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn random_shm_name() -> String {
    const RANDOM_LEN: usize = 16;
    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric).take(RANDOM_LEN).collect();
    format!("/mirrored_ring-{suffix}")
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn unlink_shm_name(name: &str) -> AnyResult<()> {
    nix::sys::mman::shm_unlink(name).map_err(|errno| {
        tracing::warn!(%name, %errno, "shm_unlink failed, the name stays in the shared memory namespace");
        anyhow!(errno).context(format!("shm_unlink({name}) failed"))
    })
}

/// Opens a fresh POSIX shared memory object and unlinks its name at once.
///
/// The object is only reachable through the returned descriptor, so another
/// process guessing the name finds nothing to attach to.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn create_backing_fd() -> AnyResult<OwnedFd> {
    use nix::{errno::Errno, fcntl::OFlag, sys::mman::shm_open, sys::stat::Mode};
    const MAX_ATTEMPTS: usize = 8;
    for attempt in 0..MAX_ATTEMPTS {
        let name = random_shm_name();
        match shm_open(name.as_str(), OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL, Mode::from_bits_truncate(0o600)) {
            Ok(fd) => {
                unlink_shm_name(&name)?;
                return Ok(fd);
            }
            Err(Errno::EEXIST) => tracing::trace!(attempt, %name, "shm name collision, retrying"),
            Err(errno) => return Err(anyhow!(errno).context(format!("shm_open({name}) failed"))),
        }
    }
    Err(anyhow!("shm_open kept colliding after {MAX_ATTEMPTS} random names"))
}

fn create_backing_region(byte_capacity: usize) -> AnyResult<OwnedFd> {
    let fd = create_backing_fd()?;
    let len = i64::try_from(byte_capacity).context("backing size does not fit in off_t")?;
    ftruncate(fd.as_fd(), len as _).with_context(|| format!("ftruncate to {byte_capacity} bytes failed"))?;
    Ok(fd)
}

/// Reserves `2 * byte_capacity` bytes of inaccessible address space starting
/// at a multiple of `alignment`.
unsafe fn reserve_placeholder(
    byte_capacity: NonZeroUsize,
    alignment: usize,
    page_size: usize,
) -> AnyResult<NonNull<c_void>> {
    const TWO: NonZeroUsize = NonZeroUsize::new(2).unwrap();
    let virtual_size = byte_capacity.checked_mul(TWO).context("mirror size overflow")?;
    let slack = alignment_slack(alignment, page_size);
    let reserved_size = virtual_size.checked_add(slack).context("mirror size overflow")?;
    let placeholder_flags = {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            MapFlags::MAP_PRIVATE
        }
    };
    let reserved = unsafe { mmap_anonymous(None, reserved_size, ProtFlags::PROT_NONE, placeholder_flags) }
        .with_context(|| format!("reserving {reserved_size} bytes of address space failed"))?;
    let lead = offset_to_aligned(reserved.as_ptr() as usize, alignment);
    debug_assert!(lead <= slack, "a page-aligned start is at most {slack} bytes from the boundary");
    let placeholder = unsafe { reserved.byte_add(lead) };
    let trail = slack - lead;
    let trim = || -> nix::Result<()> {
        if lead > 0 {
            unsafe { munmap(reserved, lead)? };
        }
        if trail > 0 {
            unsafe { munmap(placeholder.byte_add(virtual_size.get()), trail)? };
        }
        Ok(())
    };
    if let Err(errno) = trim() {
        let _ = unsafe { munmap(reserved, reserved_size.get()) };
        return Err(anyhow!(errno).context(format!("trimming the placeholder to alignment {alignment} failed")));
    }
    tracing::trace!(?placeholder, %virtual_size, lead, trail, "reserved placeholder range");
    Ok(placeholder)
}

/// Maps `fd` over both halves of `placeholder`. On failure the whole
/// placeholder, including any view already mapped, is unmapped.
unsafe fn map_views(
    fd: &OwnedFd,
    placeholder: NonNull<c_void>,
    byte_capacity: NonZeroUsize,
) -> AnyResult<NonNull<c_void>> {
    let virtual_size = byte_capacity.get() * 2;
    let map_view = |addr: NonNull<c_void>| unsafe {
        mmap(
            Some(nonnull_into_nonzerousize(addr)),
            byte_capacity,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
            fd.as_fd(),
            0,
        )
    };
    let low_half_addr = placeholder;
    let high_half_addr = unsafe { placeholder.byte_add(byte_capacity.get()) };
    // A failed MAP_FIXED leaves the placeholder (or an earlier view) in place, so the whole range goes.
    let unwind = || {
        let _ = unsafe { munmap(placeholder, virtual_size) };
    };
    let low_view = map_view(low_half_addr)
        .inspect_err(|_| unwind())
        .with_context(|| format!("failed to map low half at {low_half_addr:?}"))?;
    let high_view = map_view(high_half_addr)
        .inspect_err(|_| unwind())
        .with_context(|| format!("failed to map high half at {high_half_addr:?}"))?;
    if low_view != low_half_addr || high_view != high_half_addr {
        unwind();
        return Err(anyhow!(
            "kernel placed the halves at {low_view:?}/{high_view:?}, expected {low_half_addr:?}/{high_half_addr:?}"
        ));
    }
    Ok(low_view)
}

impl VirtualMemory for Os {
    #[inline]
    fn allocation_granularity() -> usize {
        page_size().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "page size unknown, sizing with {FALLBACK_PAGE_SIZE}");
            FALLBACK_PAGE_SIZE
        })
    }

    unsafe fn reserve(byte_capacity: usize, alignment: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            byte_capacity > 0
                && byte_capacity.is_multiple_of(Self::allocation_granularity())
                && byte_capacity <= MAX_PHYSICAL_BUF_SIZE,
            "byte_capacity must be a non-zero multiple of allocation_granularity()"
        );
        debug_assert!(alignment.is_power_of_two() && byte_capacity.is_multiple_of(alignment));
        let page_size = page_size().map_err(Error::Allocation)?;
        let physical_size = NonZeroUsize::new(byte_capacity)
            .ok_or_else(|| Error::Allocation(anyhow!("cannot mirror an empty region")))?;
        let fd = create_backing_region(byte_capacity).map_err(Error::Allocation)?;
        let placeholder = unsafe { reserve_placeholder(physical_size, alignment, page_size) }.map_err(Error::Mapping)?;
        // The descriptor can close once both views exist: the mappings keep the object alive.
        let base = unsafe { map_views(&fd, placeholder, physical_size) }.map_err(Error::Mapping)?;
        Ok(base.cast())
    }

    unsafe fn release(base: NonNull<u8>, byte_capacity: usize) -> Result<()> {
        debug_assert!(
            byte_capacity > 0 && byte_capacity.is_multiple_of(Self::allocation_granularity()),
            "byte_capacity must be a non-zero multiple of allocation_granularity()"
        );
        let virtual_size = byte_capacity
            .checked_mul(2)
            .ok_or_else(|| Error::Release(anyhow!("mirror size {byte_capacity} * 2 overflows")))?;
        unsafe { munmap(base.cast(), virtual_size) }
            .with_context(|| format!("munmap({base:?}, {virtual_size}) failed"))
            .map_err(Error::Release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::slice;
    use nix::errno::Errno;

    #[test]
    fn page_size_is_cached_and_sane() {
        let first = Os::allocation_granularity();
        assert!(first.is_power_of_two());
        assert_eq!(first, Os::allocation_granularity());
    }

    #[test]
    fn missing_page_size_is_an_error() {
        assert_eq!(page_size_from(Ok(Some(16384))).unwrap(), 16384);
        assert!(page_size_from(Ok(None)).is_err());
        assert!(page_size_from(Ok(Some(0))).is_err());
        assert!(page_size_from(Err(Errno::EINVAL)).is_err());
    }

    #[test]
    fn halves_observe_each_others_writes() {
        let physical_size = Os::allocation_granularity() * 2;
        let base = unsafe { Os::reserve(physical_size, 1) }.expect("reserve failed");
        let low = base.as_ptr();
        let high = unsafe { low.add(physical_size) };
        unsafe {
            let pattern = (0..physical_size).map(|i| (i % 251) as u8).collect::<Vec<_>>();
            slice::from_raw_parts_mut(low, physical_size).copy_from_slice(&pattern);
            assert_eq!(slice::from_raw_parts(high, physical_size), pattern.as_slice());

            slice::from_raw_parts_mut(high, physical_size).fill(0x5a);
            assert!(slice::from_raw_parts(low, physical_size).iter().all(|&b| b == 0x5a));
            Os::release(base, physical_size).expect("release failed");
        }
    }

    #[test]
    fn fresh_region_is_zeroed() {
        let physical_size = Os::allocation_granularity();
        let base = unsafe { Os::reserve(physical_size, 1) }.expect("reserve failed");
        unsafe {
            let full = slice::from_raw_parts(base.as_ptr(), physical_size * 2);
            assert!(full.iter().all(|&b| b == 0));
            Os::release(base, physical_size).expect("release failed");
        }
    }

    #[test]
    fn two_regions_do_not_alias() {
        let physical_size = Os::allocation_granularity();
        let a = unsafe { Os::reserve(physical_size, 1) }.expect("reserve failed");
        let b = unsafe { Os::reserve(physical_size, 1) }.expect("reserve failed");
        assert_ne!(a, b);
        unsafe {
            a.as_ptr().write(1);
            b.as_ptr().write(2);
            assert_eq!(a.as_ptr().add(physical_size).read(), 1);
            assert_eq!(b.as_ptr().add(physical_size).read(), 2);
            Os::release(a, physical_size).expect("release failed");
            Os::release(b, physical_size).expect("release failed");
        }
    }

    #[test]
    fn base_honours_alignment_beyond_a_page() {
        let alignment = Os::allocation_granularity() * 8;
        for _ in 0..4 {
            let base = unsafe { Os::reserve(alignment, alignment) }.expect("reserve failed");
            assert_eq!(base.as_ptr() as usize % alignment, 0);
            unsafe {
                base.as_ptr().write(9);
                assert_eq!(base.as_ptr().add(alignment).read(), 9);
                Os::release(base, alignment).expect("release failed");
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn failed_view_unmaps_the_placeholder() {
        use nix::sys::mman::{MsFlags, msync};

        let page = Os::allocation_granularity();
        let byte_capacity = NonZeroUsize::new(page).unwrap();
        let placeholder = unsafe { reserve_placeholder(byte_capacity, 1, page) }.expect("placeholder failed");
        // Pipes cannot be mmapped, so the low half already fails.
        let (read_end, _write_end) = nix::unistd::pipe().expect("pipe failed");
        let err = unsafe { map_views(&read_end, placeholder, byte_capacity) }.unwrap_err();
        assert!(format!("{err:#}").contains("failed to map low half"));
        let range_state = unsafe { msync(placeholder, page * 2, MsFlags::MS_ASYNC) };
        assert_eq!(range_state, Err(Errno::ENOMEM), "placeholder is still mapped");
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    #[test]
    fn shm_names_are_random_and_rooted() {
        let a = random_shm_name();
        let b = random_shm_name();
        assert!(a.starts_with("/mirrored_ring-"));
        assert_ne!(a, b);
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    #[test]
    fn failed_unlink_logs_the_leaked_name() {
        let name = random_shm_name();
        let mut result = None;
        let logs = crate::mirrored::log_capture::capture_logs(|| result = Some(unlink_shm_name(&name)));
        assert!(result.expect("closure ran").is_err());
        assert!(logs.contains("WARN"));
        assert!(logs.contains(&name));
        assert!(logs.contains("stays in the shared memory namespace"));
    }
}
