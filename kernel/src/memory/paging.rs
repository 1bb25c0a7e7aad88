// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! paging manages the two-level x86 page table hierarchy.
//!
//! An [`AddressSpace`] owns one page directory: an array of 1024
//! entries, each of which may reference a page table of 1024 entries
//! mapping 4 MiB. Both structures are 4 KiB-aligned and allocated
//! from the kernel heap.
//!
//! [`init`] builds the kernel's address space, identity-mapping the
//! kernel image and heap, installs it and enables paging. Process
//! address spaces are created with [`AddressSpace::new_kernel_clone`],
//! which copies the kernel's directory slots so the kernel remains
//! mapped (and the clone is safe to load into CR3).
//!
//! Page tables are not reclaimed when their last mapping is removed.
//! The leak is bounded by 4 KiB per 4 MiB of address space touched,
//! which is acceptable for this kernel.

use crate::interrupts::{without_interrupts, InterruptContext};
use crate::memory;
use crate::memory::PAGE_SIZE;
use crate::{println, Guarded};
use bitflags::bitflags;
use core::arch::asm;
use core::mem;
use core::ptr;
use core::ptr::NonNull;
use spin::Once;
use volatile::Volatile;

bitflags! {
    /// The flag bits in the low 12 bits of a page table or
    /// page directory entry.
    ///
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

// The paging bit in CR0.
const CR0_PAGING: u32 = 1 << 31;

/// One 32-bit entry in a page table or page directory: a
/// 4 KiB-aligned frame address in the upper 20 bits and
/// flags in the low 12.
///
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Returns an entry that maps nothing.
    ///
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    /// Returns an entry referencing the given frame with the
    /// given flags. Any offset bits in the frame address are
    /// discarded.
    ///
    pub fn new(frame: u32, flags: PageFlags) -> Self {
        PageTableEntry((frame & 0xffff_f000) | flags.bits())
    }

    /// Returns whether the entry has the PRESENT flag.
    ///
    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Returns the 4 KiB-aligned frame address the entry
    /// references.
    ///
    pub fn frame(&self) -> u32 {
        self.0 & 0xffff_f000
    }

    /// Returns the entry's flag bits.
    ///
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }
}

/// A page table: 1024 entries mapping 4 MiB of the virtual
/// address space.
///
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 1024],
}

/// A page directory: 1024 entries, each referencing a page
/// table.
///
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageTableEntry; 1024],
}

// Allocates a zeroed, 4 KiB-aligned page table (or directory;
// they share a layout) from the kernel heap.
//
fn alloc_table() -> Option<NonNull<PageTable>> {
    let table = memory::alloc_aligned(mem::size_of::<PageTable>(), PAGE_SIZE)?;
    unsafe { ptr::write_bytes(table.as_ptr(), 0, mem::size_of::<PageTable>()) };

    Some(table.cast())
}

/// An address space, described by one page directory.
///
/// Since the kernel identity-maps all memory it touches,
/// the directory's virtual address is also the physical
/// address loaded into CR3.
///
pub struct AddressSpace {
    directory: NonNull<PageDirectory>,
}

// The raw directory pointer makes AddressSpace !Send by
// default. Access is serialised by the owning structures.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Returns an empty address space with a zeroed page
    /// directory, or None if the heap is exhausted.
    ///
    pub fn new() -> Option<AddressSpace> {
        let directory = alloc_table()?.cast();

        Some(AddressSpace { directory })
    }

    /// Returns an address space sharing the kernel's page
    /// tables, safe to load into CR3.
    ///
    /// The kernel's directory slots are copied, so mappings
    /// later added to the clone do not affect the kernel
    /// space, but the kernel image and heap remain mapped.
    ///
    pub fn new_kernel_clone() -> Option<AddressSpace> {
        let mut space = AddressSpace::new()?;
        without_interrupts(|| {
            if let Some(kernel) = KERNEL_SPACE.get() {
                let kernel = kernel.lock();
                space.directory_mut().entries = kernel.directory().entries;
            }
        });

        Some(space)
    }

    fn directory(&self) -> &PageDirectory {
        unsafe { self.directory.as_ref() }
    }

    fn directory_mut(&mut self) -> &mut PageDirectory {
        unsafe { self.directory.as_mut() }
    }

    /// Returns the physical address of the page directory,
    /// as loaded into CR3.
    ///
    pub fn directory_addr(&self) -> u32 {
        self.directory.as_ptr() as u32
    }

    /// Maps the page at the given virtual address to the given
    /// physical frame.
    ///
    /// A page table is allocated if the directory slot is empty.
    /// Returns None if that allocation fails. The TLB entry for
    /// the virtual address is invalidated.
    ///
    pub fn map_page(&mut self, virt: u32, phys: u32, flags: PageFlags) -> Option<()> {
        let dir_index = (virt >> 22) as usize;
        let table_index = ((virt >> 12) & 0x3ff) as usize;

        let directory = self.directory_mut();
        if !directory.entries[dir_index].is_present() {
            let table = alloc_table()?;
            let entry = PageTableEntry::new(
                table.as_ptr() as u32,
                PageFlags::PRESENT | PageFlags::WRITE,
            );
            Volatile::new(&mut directory.entries[dir_index]).write(entry);
        }

        let table = directory.entries[dir_index].frame() as *mut PageTable;
        let table = unsafe { &mut *table };
        Volatile::new(&mut table.entries[table_index]).write(PageTableEntry::new(phys, flags));

        invalidate_page(virt);

        Some(())
    }

    /// Removes the mapping for the page at the given virtual
    /// address, if any, and invalidates its TLB entry.
    ///
    /// The page table itself is not reclaimed, even if this
    /// was its last mapping.
    ///
    pub fn unmap_page(&mut self, virt: u32) {
        let dir_index = (virt >> 22) as usize;
        let table_index = ((virt >> 12) & 0x3ff) as usize;

        let directory = self.directory_mut();
        if !directory.entries[dir_index].is_present() {
            return;
        }

        let table = directory.entries[dir_index].frame() as *mut PageTable;
        let table = unsafe { &mut *table };
        Volatile::new(&mut table.entries[table_index]).write(PageTableEntry::empty());

        invalidate_page(virt);
    }

    /// Returns the physical address the given virtual address
    /// maps to, or None if it is unmapped.
    ///
    pub fn translate(&self, virt: u32) -> Option<u32> {
        let dir_index = (virt >> 22) as usize;
        let table_index = ((virt >> 12) & 0x3ff) as usize;

        let directory = self.directory();
        if !directory.entries[dir_index].is_present() {
            return None;
        }

        let table = directory.entries[dir_index].frame() as *const PageTable;
        let entry = unsafe { &*table }.entries[table_index];
        if !entry.is_present() {
            return None;
        }

        Some(entry.frame() | (virt & 0xfff))
    }

    // Returns the entry for the given virtual address, if its
    // page table exists.
    //
    #[cfg(test)]
    fn entry(&self, virt: u32) -> Option<PageTableEntry> {
        let dir_index = (virt >> 22) as usize;
        let table_index = ((virt >> 12) & 0x3ff) as usize;

        let directory = self.directory();
        if !directory.entries[dir_index].is_present() {
            return None;
        }

        let table = directory.entries[dir_index].frame() as *const PageTable;
        Some(unsafe { &*table }.entries[table_index])
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Page tables are deliberately leaked; only the
        // directory page is returned to the heap.
        memory::free_aligned(self.directory.as_ptr() as *mut u8, PAGE_SIZE);
    }
}

/// KERNEL_SPACE is the kernel's own address space, installed
/// by [`init`] and shared (via cloned directory slots) with
/// every process.
///
static KERNEL_SPACE: Once<Guarded<AddressSpace>> = Once::new();

/// Builds the kernel's address space, identity-mapping the
/// kernel image and heap, then installs it and enables paging.
///
/// # Panics
///
/// `init` panics if the heap cannot hold the kernel's page
/// tables, which would leave the kernel unable to run at all.
///
pub fn init() {
    let mut space = AddressSpace::new().expect("failed to allocate kernel page directory");

    // Identity-map everything from the start of memory to the
    // end of the heap: the BIOS area, the kernel image, and
    // the heap itself. Nothing else is touched before a
    // process installs its own mappings.
    let end = memory::kernel_heap_start() + memory::KERNEL_HEAP_SIZE;
    let mut addr = 0u32;
    while (addr as usize) < end {
        space
            .map_page(addr, addr, PageFlags::PRESENT | PageFlags::WRITE)
            .expect("failed to allocate kernel page table");
        addr += PAGE_SIZE as u32;
    }

    let root = space.directory_addr();
    KERNEL_SPACE.call_once(|| Guarded::new(space));

    unsafe { switch_page_directory(root) };
}

/// Maps the page at the given virtual address to the given
/// physical frame in the kernel's address space.
///
/// Returns None if a needed page table cannot be allocated,
/// or if paging has not been initialised.
///
pub fn map_page(virt: u32, phys: u32, flags: PageFlags) -> Option<()> {
    without_interrupts(|| KERNEL_SPACE.get()?.lock().map_page(virt, phys, flags))
}

/// Removes the mapping for the page at the given virtual
/// address from the kernel's address space.
///
pub fn unmap_page(virt: u32) {
    without_interrupts(|| {
        if let Some(space) = KERNEL_SPACE.get() {
            space.lock().unmap_page(virt);
        }
    });
}

/// Installs the page directory at the given physical address,
/// enabling paging if it is not already enabled.
///
/// # Safety
///
/// The directory must map the currently-executing code, the
/// stack and the kernel heap, or the CPU will fault with no
/// way to recover.
///
pub unsafe fn switch_page_directory(directory: u32) {
    asm!("mov cr3, {}", in(reg) directory, options(nostack));

    let mut cr0: u32;
    asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
    if cr0 & CR0_PAGING == 0 {
        cr0 |= CR0_PAGING;
        asm!("mov cr0, {}", in(reg) cr0, options(nostack));
    }
}

// Invalidates the TLB entry for the given virtual address.
//
fn invalidate_page(virt: u32) {
    unsafe { asm!("invlpg [{}]", in(reg) virt, options(nostack)) };
}

// Reads the faulting address from CR2.
//
fn fault_address() -> u32 {
    let addr: u32;
    unsafe { asm!("mov {}, cr2", out(reg) addr, options(nomem, nostack)) };
    addr
}

/// The page fault handler. There is no demand paging, so a
/// page fault is always a kernel bug: the fault is reported
/// and the CPU halts.
///
pub fn page_fault_handler(context: &InterruptContext) {
    println!("EXCEPTION: PAGE FAULT");
    println!("Accessed Address: {:#010x}", fault_address());
    println!("Error Code: {:#x}", context.err_code);
    println!("EIP: {:#010x}", context.eip);
    crate::halt_loop();
}

// Tests

#[test_case]
fn page_table_entry_packing() {
    let entry = PageTableEntry::new(0x0080_0000, PageFlags::PRESENT | PageFlags::WRITE);
    assert!(entry.is_present());
    assert_eq!(entry.frame(), 0x0080_0000);
    assert_eq!(entry.flags(), PageFlags::PRESENT | PageFlags::WRITE);

    // Offset bits in the frame address are discarded.
    let entry = PageTableEntry::new(0x0080_0123, PageFlags::PRESENT);
    assert_eq!(entry.frame(), 0x0080_0000);

    let empty = PageTableEntry::empty();
    assert!(!empty.is_present());
    assert_eq!(empty.frame(), 0);
}

#[test_case]
fn address_space_map_unmap() {
    let mut space = AddressSpace::new().unwrap();

    // An unmapped address does not translate.
    assert_eq!(space.translate(0x40_0000), None);

    space
        .map_page(0x40_0000, 0x80_0000, PageFlags::PRESENT | PageFlags::WRITE)
        .unwrap();

    // The directory slot was created with PRESENT | WRITE and
    // a 4 KiB-aligned table address.
    let dir_entry = space.directory().entries[1];
    assert!(dir_entry.is_present());
    assert_eq!(
        dir_entry.flags(),
        PageFlags::PRESENT | PageFlags::WRITE
    );
    assert_eq!(dir_entry.frame() as usize % PAGE_SIZE, 0);

    // The mapping translates, including the page offset.
    assert_eq!(space.translate(0x40_0000), Some(0x80_0000));
    assert_eq!(space.translate(0x40_0123), Some(0x80_0123));

    let entry = space.entry(0x40_0000).unwrap();
    assert_eq!(entry.frame(), 0x80_0000);
    assert_eq!(entry.flags(), PageFlags::PRESENT | PageFlags::WRITE);

    // Unmapping zeroes the entry but keeps the page table.
    space.unmap_page(0x40_0000);
    assert_eq!(space.translate(0x40_0000), None);
    assert_eq!(space.entry(0x40_0000), Some(PageTableEntry::empty()));

    // Unmapping an address with no page table is a no-op.
    space.unmap_page(0xc000_0000);
}

#[test_case]
fn kernel_clone_shares_kernel_mappings() {
    let clone = AddressSpace::new_kernel_clone().unwrap();

    // The kernel image and heap translate identically in the
    // clone, so it is safe to load into CR3.
    let probe = kernel_clone_shares_kernel_mappings as *const () as u32;
    assert_eq!(clone.translate(probe), Some(probe));

    let heap_addr = memory::kernel_heap_start() as u32;
    assert_eq!(clone.translate(heap_addr), Some(heap_addr));
}

#[test_case]
fn kernel_space_identity_mapped() {
    // A store through the kernel mapping is observable at the
    // same physical address, which paging::init identity-mapped.
    let value = alloc::boxed::Box::new(0xdead_beefu32);
    let addr = &*value as *const u32 as u32;

    let space = KERNEL_SPACE.get().unwrap().lock();
    assert_eq!(space.translate(addr), Some(addr));
}
