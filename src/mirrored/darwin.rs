//! Mirrored memory on macOS and iOS using mach2.
//!
//! The whole doubled range is allocated in one `mach_vm_allocate`, which also
//! provides the backing pages for the low half. `mach_vm_remap` then replaces
//! the high half with a shared (not copied) view of the low half. No nameable
//! object is ever created. Alignment beyond a page is reached by allocating
//! extra room and deallocating the slack around an aligned start.

use crate::{
    error::{Error, Result},
    mirrored::{MAX_PHYSICAL_BUF_SIZE, VirtualMemory, alignment_slack, offset_to_aligned},
};
use anyhow::anyhow;
use core::{mem::MaybeUninit, ptr::NonNull};
use mach2::{
    kern_return::KERN_SUCCESS,
    traps::mach_task_self,
    vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_remap},
    vm_inherit::VM_INHERIT_NONE,
    vm_page_size::vm_page_size,
    vm_prot::{VM_PROT_READ, VM_PROT_WRITE},
    vm_statistics::{VM_FLAGS_ANYWHERE, VM_FLAGS_FIXED, VM_FLAGS_OVERWRITE},
    vm_types::{mach_vm_address_t, mach_vm_size_t},
};

/// The mach [`VirtualMemory`] backend.
pub(crate) struct Os;

impl VirtualMemory for Os {
    /// ## System APIs Used
    /// - `vm_page_size`
    #[inline]
    fn allocation_granularity() -> usize { unsafe { vm_page_size as usize } }

    /// ## System APIs Used
    /// - `mach_task_self`
    /// - [`mach_vm_allocate`](https://developer.apple.com/documentation/kernel/1402376-mach_vm_allocate)
    /// - [`mach_vm_remap`](https://developer.apple.com/documentation/kernel/1402218-mach_vm_remap)
    unsafe fn reserve(byte_capacity: usize, alignment: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            byte_capacity > 0
                && byte_capacity.is_multiple_of(Self::allocation_granularity())
                && byte_capacity <= MAX_PHYSICAL_BUF_SIZE,
            "byte_capacity must be a non-zero multiple of allocation_granularity()"
        );
        debug_assert!(alignment.is_power_of_two() && byte_capacity.is_multiple_of(alignment));
        let physical_size = byte_capacity as mach_vm_size_t;
        let virtual_size = physical_size * 2;
        let slack = alignment_slack(alignment, Self::allocation_granularity()) as mach_vm_size_t;
        let reserved_size = virtual_size + slack;
        let this_task = unsafe { mach_task_self() };
        let mut reserved_addr = MaybeUninit::<mach_vm_address_t>::uninit();
        let result =
            unsafe { mach_vm_allocate(this_task, reserved_addr.as_mut_ptr(), reserved_size, VM_FLAGS_ANYWHERE) };
        if result != KERN_SUCCESS {
            return Err(Error::Allocation(anyhow!("mach_vm_allocate of {reserved_size} bytes failed: {result}")));
        }
        let reserved_addr = unsafe { reserved_addr.assume_init() };
        let lead = offset_to_aligned(reserved_addr as usize, alignment) as mach_vm_size_t;
        let low_half_addr = reserved_addr + lead;
        let trail = slack - lead;
        for (addr, size) in [(reserved_addr, lead), (low_half_addr + virtual_size, trail)] {
            if size == 0 {
                continue;
            }
            let result = unsafe { mach_vm_deallocate(this_task, addr, size) };
            if result != KERN_SUCCESS {
                unsafe { mach_vm_deallocate(this_task, reserved_addr, reserved_size) };
                return Err(Error::Allocation(anyhow!(
                    "trimming the allocation to alignment {alignment} failed: {result}"
                )));
            }
        }
        let mut high_half_addr = low_half_addr + physical_size;
        tracing::trace!(low_half_addr, high_half_addr, lead, trail, "allocated mach placeholder");
        let mut cur_prot = VM_PROT_READ | VM_PROT_WRITE;
        let mut max_prot = VM_PROT_READ | VM_PROT_WRITE;
        let result = unsafe {
            mach_vm_remap(
                this_task,
                &mut high_half_addr,
                physical_size,
                0,
                VM_FLAGS_FIXED | VM_FLAGS_OVERWRITE,
                this_task,
                low_half_addr,
                0,
                &mut cur_prot,
                &mut max_prot,
                VM_INHERIT_NONE,
            )
        };
        if result != KERN_SUCCESS {
            unsafe { mach_vm_deallocate(this_task, low_half_addr, virtual_size) };
            return Err(Error::Mapping(anyhow!("mach_vm_remap of the high half failed: {result}")));
        }
        if high_half_addr != low_half_addr + physical_size {
            unsafe { mach_vm_deallocate(this_task, low_half_addr, virtual_size) };
            return Err(Error::Mapping(anyhow!(
                "mach_vm_remap placed the mirror at {high_half_addr:#x}, expected {:#x}",
                low_half_addr + physical_size
            )));
        }
        NonNull::new(low_half_addr as *mut u8)
            .ok_or_else(|| Error::Mapping(anyhow!("mach_vm_allocate returned a null address")))
    }

    /// ## System APIs Used
    /// - `mach_task_self`
    /// - [`mach_vm_deallocate`](https://developer.apple.com/documentation/kernel/1402285-mach_vm_deallocate)
    unsafe fn release(base: NonNull<u8>, byte_capacity: usize) -> Result<()> {
        debug_assert!(
            byte_capacity > 0 && byte_capacity.is_multiple_of(Self::allocation_granularity()),
            "byte_capacity must be a non-zero multiple of allocation_granularity()"
        );
        let this_task = unsafe { mach_task_self() };
        let virtual_size = byte_capacity as mach_vm_size_t * 2;
        let result = unsafe { mach_vm_deallocate(this_task, base.as_ptr() as mach_vm_address_t, virtual_size) };
        if result != KERN_SUCCESS {
            return Err(Error::Release(anyhow!("mach_vm_deallocate failed with error: {result}")));
        }
        Ok(())
    }
}
