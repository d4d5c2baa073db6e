//! Mirrored memory on Windows 10 (1803) and newer, built on placeholders.
//!
//! A pagefile-backed section is created anonymously, a placeholder twice its
//! size is reserved with `VirtualAlloc2`, split in half, and each half is
//! replaced by a `MapViewOfFile3` view of the same section. Alignment beyond
//! the allocation granularity is reached by reserving extra room and splitting
//! the slack off either side.

use crate::{
    error::{Error, Result},
    mirrored::{MAX_PHYSICAL_BUF_SIZE, VirtualMemory, alignment_slack, offset_to_aligned},
};
use anyhow::{Context, anyhow};
use core::ptr::NonNull;
use std::{
    ffi::c_void,
    mem::MaybeUninit,
    sync::atomic::{AtomicUsize, Ordering},
};
use windows::{
    Win32::{
        Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE},
        System::{
            Memory::{
                CreateFileMappingW, MEM_PRESERVE_PLACEHOLDER, MEM_RELEASE, MEM_REPLACE_PLACEHOLDER, MEM_RESERVE,
                MEM_RESERVE_PLACEHOLDER, MEM_UNMAP_NONE, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile3, PAGE_NOACCESS,
                PAGE_READWRITE, SEC_COMMIT, UnmapViewOfFile2, VIRTUAL_FREE_TYPE, VirtualAlloc2, VirtualFree,
            },
            SystemInformation::{GetSystemInfo, SYSTEM_INFO},
            Threading::GetCurrentProcess,
        },
    },
    core::PCWSTR,
};

/// The Win32 [`VirtualMemory`] backend.
pub(crate) struct Os;

fn cached_allocation_granularity() -> usize {
    const UNINIT_ALLOCATION_GRANULARITY: usize = 0;
    static ALLOCATION_GRANULARITY: AtomicUsize = AtomicUsize::new(UNINIT_ALLOCATION_GRANULARITY);
    let cached_val = ALLOCATION_GRANULARITY.load(Ordering::Acquire);
    // fast path
    if cached_val != UNINIT_ALLOCATION_GRANULARITY {
        return cached_val;
    }
    // slow path
    let updated_val = unsafe {
        let mut system_info = MaybeUninit::<SYSTEM_INFO>::uninit();
        GetSystemInfo(system_info.as_mut_ptr());
        system_info.assume_init().dwAllocationGranularity as usize
    };
    match ALLOCATION_GRANULARITY.compare_exchange(
        UNINIT_ALLOCATION_GRANULARITY,
        updated_val,
        Ordering::Release,
        Ordering::Acquire,
    ) {
        Ok(_) => updated_val,
        Err(val_from_other_thread) => val_from_other_thread,
    }
}

/// Releases whatever part of a half-built mirror exists. Results are ignored
/// so every step runs.
unsafe fn unwind(
    process: HANDLE,
    section: HANDLE,
    placeholders: &[*mut c_void],
    views: &[MEMORY_MAPPED_VIEW_ADDRESS],
) {
    unsafe {
        for &view in views {
            let _ = UnmapViewOfFile2(process, view, MEM_UNMAP_NONE);
        }
        for &placeholder in placeholders {
            let _ = VirtualFree(placeholder, 0, MEM_RELEASE);
        }
        let _ = CloseHandle(section);
    }
}

/// Splits `[addr, addr + size)` off the front of a larger placeholder.
unsafe fn split_placeholder(addr: *mut c_void, size: usize) -> bool {
    unsafe { VirtualFree(addr, size, VIRTUAL_FREE_TYPE(MEM_RELEASE.0 | MEM_PRESERVE_PLACEHOLDER.0)).is_ok() }
}

/// Frees a placeholder piece that will never hold a view.
unsafe fn release_slack(addr: *mut c_void) {
    if let Err(err) = unsafe { VirtualFree(addr, 0, MEM_RELEASE) } {
        tracing::warn!(?addr, error = %err, "releasing placeholder slack failed");
    }
}

impl VirtualMemory for Os {
    #[inline]
    fn allocation_granularity() -> usize { cached_allocation_granularity() }

    unsafe fn reserve(byte_capacity: usize, alignment: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            byte_capacity > 0
                && byte_capacity.is_multiple_of(Self::allocation_granularity())
                && byte_capacity <= MAX_PHYSICAL_BUF_SIZE,
            "byte_capacity must be a non-zero multiple of allocation_granularity()"
        );
        debug_assert!(alignment.is_power_of_two() && byte_capacity.is_multiple_of(alignment));
        let physical_size = byte_capacity;
        let virtual_size = physical_size * 2;
        let slack = alignment_slack(alignment, Self::allocation_granularity());
        let reserved_size = virtual_size
            .checked_add(slack)
            .ok_or_else(|| Error::Mapping(anyhow!("mirror size {virtual_size} + {slack} overflows")))?;
        let max_size_low = physical_size as u32;
        let max_size_high = ((physical_size as u64) >> 32) as u32;
        unsafe {
            let section = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE | SEC_COMMIT,
                max_size_high,
                max_size_low,
                PCWSTR::null(),
            )
            .context("CreateFileMappingW failed")
            .map_err(Error::Allocation)?;
            let current_process = GetCurrentProcess();
            let reservation = VirtualAlloc2(
                Some(current_process),
                None,
                reserved_size,
                MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
                PAGE_NOACCESS.0,
                None,
            );
            if reservation.is_null() {
                let _ = CloseHandle(section);
                return Err(Error::Mapping(anyhow!("VirtualAlloc2 could not reserve {reserved_size} bytes")));
            }
            let lead = offset_to_aligned(reservation as usize, alignment);
            let placeholder = reservation.byte_add(lead);
            let trail = slack - lead;
            if lead > 0 {
                if !split_placeholder(reservation, lead) {
                    unwind(current_process, section, &[reservation], &[]);
                    return Err(Error::Mapping(anyhow!("splitting off {lead} leading bytes of slack failed")));
                }
                release_slack(reservation);
            }
            if trail > 0 {
                if !split_placeholder(placeholder, virtual_size) {
                    unwind(current_process, section, &[placeholder], &[]);
                    return Err(Error::Mapping(anyhow!("splitting off {trail} trailing bytes of slack failed")));
                }
                release_slack(placeholder.byte_add(virtual_size));
            }
            let low_half_addr = placeholder;
            let high_half_addr = placeholder.byte_add(physical_size);
            // Releasing the low half with MEM_PRESERVE_PLACEHOLDER splits the placeholder in two.
            if !split_placeholder(low_half_addr, physical_size) {
                unwind(current_process, section, &[placeholder], &[]);
                return Err(Error::Mapping(anyhow!("splitting the placeholder failed")));
            }
            let map_view = |addr: *mut c_void| {
                MapViewOfFile3(
                    section,
                    Some(current_process),
                    Some(addr as *const c_void),
                    0,
                    physical_size,
                    MEM_REPLACE_PLACEHOLDER,
                    PAGE_READWRITE.0,
                    None,
                )
            };
            let low_view = map_view(low_half_addr);
            if low_view.Value.is_null() {
                unwind(current_process, section, &[low_half_addr, high_half_addr], &[]);
                return Err(Error::Mapping(anyhow!("MapViewOfFile3 failed for the low half")));
            }
            let high_view = map_view(high_half_addr);
            if high_view.Value.is_null() {
                unwind(current_process, section, &[high_half_addr], &[low_view]);
                return Err(Error::Mapping(anyhow!("MapViewOfFile3 failed for the high half")));
            }
            // The section stays alive until both views are unmapped.
            if let Err(err) = CloseHandle(section) {
                tracing::warn!(error = %err, "closing the section handle failed after mapping");
            }
            NonNull::new(low_half_addr.cast::<u8>())
                .ok_or_else(|| Error::Mapping(anyhow!("VirtualAlloc2 returned a null placeholder")))
        }
    }

    unsafe fn release(base: NonNull<u8>, byte_capacity: usize) -> Result<()> {
        debug_assert!(
            byte_capacity > 0 && byte_capacity.is_multiple_of(Self::allocation_granularity()),
            "byte_capacity must be a non-zero multiple of allocation_granularity()"
        );
        unsafe {
            let current_process = GetCurrentProcess();
            let low_ptr = base.as_ptr().cast::<c_void>();
            let high_ptr = low_ptr.byte_add(byte_capacity);
            let into_view = |p| MEMORY_MAPPED_VIEW_ADDRESS { Value: p };
            let unmap_low_result = UnmapViewOfFile2(current_process, into_view(low_ptr), MEM_UNMAP_NONE);
            let unmap_high_result = UnmapViewOfFile2(current_process, into_view(high_ptr), MEM_UNMAP_NONE);
            // Unmapping without MEM_PRESERVE_PLACEHOLDER frees the address range as well.
            if unmap_low_result.is_err() || unmap_high_result.is_err() {
                return Err(Error::Release(anyhow!(
                    "unmapping the mirror failed (low: {unmap_low_result:?}, high: {unmap_high_result:?})"
                )));
            }
        }
        Ok(())
    }
}
