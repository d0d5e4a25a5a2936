//! Address spaces: the paging editor.
//!
//! An [`AddressSpace`] is the physical frame of a top-level page table plus
//! the implicit tree below it. The top 256 entries (kernel half) of every
//! address space point at the same kernel tables; the bottom 256 are
//! per-process. Intermediate tables are allocated lazily on `map_page` and
//! freed by `unmap_page` when their last present entry disappears.

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        self, frame_allocator,
        page_table::{AddressBreakdown, PageFlags, PageTable},
        FrameNumber, VirtualAddress, FRAME_SIZE, KERNEL_HALF_START,
    },
};

/// A per-process (or the kernel's own) paging tree.
#[derive(Debug)]
pub struct AddressSpace {
    root: FrameNumber,
}

/// View a physical frame as a page table through the direct mapping.
fn table_ptr(frame: FrameNumber) -> *mut PageTable {
    mm::phys_to_virt(frame.as_addr()) as *mut PageTable
}

impl AddressSpace {
    /// Wrap an existing root table frame.
    pub const fn from_root(root: FrameNumber) -> Self {
        Self { root }
    }

    /// The address space the CPU is currently using.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn current() -> Self {
        use x86_64::registers::control::Cr3;
        let (frame, _) = Cr3::read();
        Self {
            root: FrameNumber::new(frame.start_address().as_u64() >> 12),
        }
    }

    /// Root table frame (the value loaded into CR3).
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    /// Create a fresh address space: empty user half, kernel half shared
    /// with the current one.
    pub fn new_user() -> KernelResult<Self> {
        let root = frame_allocator::alloc_frame_zeroed()?;
        let space = Self { root };

        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let current = Self::current();
            // SAFETY: both roots are live table frames in the direct map.
            unsafe {
                let src = &*table_ptr(current.root);
                let dst = &mut *table_ptr(root);
                for i in KERNEL_HALF_START..512 {
                    dst[i] = src[i];
                }
            }
        }

        Ok(space)
    }

    /// Load this address space into the paging root register.
    pub fn switch_to(&self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            use x86_64::{
                registers::control::{Cr3, Cr3Flags},
                structures::paging::PhysFrame,
                PhysAddr,
            };
            let frame = PhysFrame::from_start_address(PhysAddr::new(self.root.as_addr().as_u64()))
                .expect("root table frame must be page aligned");
            // SAFETY: the root frame holds a valid table whose kernel half
            // covers all kernel code and data.
            unsafe { Cr3::write(frame, Cr3Flags::empty()) };
        }
    }

    /// Install a leaf mapping, lazily allocating intermediate tables.
    ///
    /// Fails with `Exists` if the page already has a present mapping.
    pub fn map_page(
        &mut self,
        virt: VirtualAddress,
        phys: FrameNumber,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let b = AddressBreakdown::new(virt);
        let user = flags.contains(PageFlags::USER);

        let l3 = descend_or_create(self.root, b.l4.as_usize(), user)?;
        let l2 = descend_or_create(l3, b.l3.as_usize(), user)?;
        let l1 = descend_or_create(l2, b.l2.as_usize(), user)?;

        // SAFETY: l1 is a live table frame in the direct map.
        let table = unsafe { &mut *table_ptr(l1) };
        let entry = &mut table[b.l1.as_usize()];
        if entry.is_present() {
            return Err(KernelError::Exists);
        }
        entry.set(phys, flags | PageFlags::PRESENT);
        invalidate(virt);
        Ok(())
    }

    /// Remove a leaf mapping, returning the frame that was mapped.
    ///
    /// Page tables whose last present entry is removed are freed, bottom
    /// up, so an address space never keeps empty interior tables.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> KernelResult<FrameNumber> {
        let b = AddressBreakdown::new(virt);

        let l3 = descend(self.root, b.l4.as_usize()).ok_or(KernelError::NotFound)?;
        let l2 = descend(l3, b.l3.as_usize()).ok_or(KernelError::NotFound)?;
        let l1 = descend(l2, b.l2.as_usize()).ok_or(KernelError::NotFound)?;

        // SAFETY: l1 is a live table frame in the direct map.
        let table = unsafe { &mut *table_ptr(l1) };
        let entry = &mut table[b.l1.as_usize()];
        let frame = entry.frame().ok_or(KernelError::NotFound)?;
        entry.clear();
        invalidate(virt);

        // Free emptied tables, walking back up. The root is never freed.
        // SAFETY: all frames below are live tables in the direct map.
        unsafe {
            if (*table_ptr(l1)).present_count() == 0 {
                (&mut *table_ptr(l2))[b.l2.as_usize()].clear();
                frame_allocator::free_frame(l1);
                if (*table_ptr(l2)).present_count() == 0 {
                    (&mut *table_ptr(l3))[b.l3.as_usize()].clear();
                    frame_allocator::free_frame(l2);
                    if (*table_ptr(l3)).present_count() == 0 {
                        (&mut *table_ptr(self.root))[b.l4.as_usize()].clear();
                        frame_allocator::free_frame(l3);
                    }
                }
            }
        }

        Ok(frame)
    }

    /// Look up the frame and flags mapped at `virt`.
    pub fn walk(&self, virt: VirtualAddress) -> Option<(FrameNumber, PageFlags)> {
        let b = AddressBreakdown::new(virt);
        let l3 = descend(self.root, b.l4.as_usize())?;
        let l2 = descend(l3, b.l3.as_usize())?;
        let l1 = descend(l2, b.l2.as_usize())?;
        // SAFETY: l1 is a live table frame in the direct map.
        let entry = unsafe { &(&*table_ptr(l1))[b.l1.as_usize()] };
        entry.frame().map(|f| (f, entry.flags()))
    }

    /// Deep-copy the user half for fork: fresh frames, contents copied;
    /// kernel half shared.
    pub fn clone_user(&self) -> KernelResult<AddressSpace> {
        let new = Self::new_user()?;

        // SAFETY: both roots are live table frames; copy_subtree only
        // touches frames reachable from present entries.
        unsafe {
            let src_root = &*table_ptr(self.root);
            let dst_root = &mut *table_ptr(new.root);
            for i in 0..KERNEL_HALF_START {
                if let Some(frame) = src_root[i].frame() {
                    let copied = copy_subtree(frame, 3)?;
                    dst_root[i].set(copied, src_root[i].flags());
                }
            }
        }

        Ok(new)
    }

    /// Tear down every user-half mapping, freeing leaf frames and tables.
    /// Used by exec (before loading the new image) and by exit.
    pub fn clear_user_half(&mut self) {
        // SAFETY: the root is a live table frame; free_subtree only touches
        // frames reachable from present entries.
        unsafe {
            let root = &mut *table_ptr(self.root);
            for i in 0..KERNEL_HALF_START {
                if let Some(frame) = root[i].frame() {
                    free_subtree(frame, 3);
                    root[i].clear();
                }
            }
        }
        invalidate_all();
    }

    /// Release the root table itself. The user half must already be clear.
    pub fn release_root(self) {
        frame_allocator::free_frame(self.root);
    }
}

/// Follow `index` in the table at `frame`, or `None` if not present.
fn descend(frame: FrameNumber, index: usize) -> Option<FrameNumber> {
    // SAFETY: `frame` is a live table frame in the direct map.
    unsafe { (&*table_ptr(frame))[index].frame() }
}

/// Follow `index`, allocating a zeroed table if the entry is empty.
fn descend_or_create(frame: FrameNumber, index: usize, user: bool) -> KernelResult<FrameNumber> {
    // SAFETY: `frame` is a live table frame in the direct map.
    let table = unsafe { &mut *table_ptr(frame) };
    let entry = &mut table[index];
    if let Some(next) = entry.frame() {
        return Ok(next);
    }

    let next = frame_allocator::alloc_frame_zeroed()?;
    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    if user {
        flags |= PageFlags::USER;
    }
    entry.set(next, flags);
    Ok(next)
}

/// Recursively copy a table subtree. `level` 1 means `frame` is a leaf
/// table whose entries point at data frames, which are duplicated.
fn copy_subtree(frame: FrameNumber, level: u8) -> KernelResult<FrameNumber> {
    let copy = frame_allocator::alloc_frame_zeroed()?;

    // SAFETY: source and copy are live frames in the direct map.
    unsafe {
        let src = &*table_ptr(frame);
        let dst = &mut *table_ptr(copy);

        for i in 0..512 {
            let Some(child) = src[i].frame() else { continue };
            let flags = src[i].flags();

            let new_child = if level == 1 {
                let data = frame_allocator::alloc_frame_zeroed()?;
                core::ptr::copy_nonoverlapping(
                    mm::phys_to_virt(child.as_addr()),
                    mm::phys_to_virt(data.as_addr()),
                    FRAME_SIZE,
                );
                data
            } else {
                copy_subtree(child, level - 1)?
            };
            dst[i].set(new_child, flags);
        }
    }

    Ok(copy)
}

/// Recursively free a table subtree including the data frames it maps.
fn free_subtree(frame: FrameNumber, level: u8) {
    // SAFETY: `frame` is a live table frame in the direct map.
    unsafe {
        let table = &*table_ptr(frame);
        for i in 0..512 {
            let Some(child) = table[i].frame() else { continue };
            if level == 1 {
                frame_allocator::free_frame(child);
            } else {
                free_subtree(child, level - 1);
            }
        }
    }
    frame_allocator::free_frame(frame);
}

/// Flush the TLB entry for one page.
pub fn invalidate(virt: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = virt;
}

/// Flush the entire TLB.
pub fn invalidate_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush_all();
}
