//! Page-locked memory with a known physical address.
//!
//! The DMA engine reads source frames and control blocks straight from RAM,
//! so those pages must stay resident at a stable physical address for the
//! lifetime of the ring. Allocation touches the page to force residency,
//! locks it with `mlock`, and resolves the physical address through the
//! kernel's pagemap.

use crate::error::HalError;
use crate::mmap::PAGE_SIZE;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io::{Read, Seek, SeekFrom};

/// RAM as seen from the DMA engine's bus: the uncached alias.
pub const BUS_RAM_ALIAS: u32 = 0xC000_0000;

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = (1 << 55) - 1;

/// One page of locked RAM addressable both virtually and physically.
/// Unmapped and unlocked on drop.
pub struct PhysPage {
    virt: *mut u8,
    phys: u64,
}

// The page is exclusively owned; raw-pointer access is word-volatile.
unsafe impl Send for PhysPage {}
unsafe impl Sync for PhysPage {}

impl PhysPage {
    pub fn new() -> Result<Self, HalError> {
        let layout = page_layout();
        let virt = unsafe { alloc_zeroed(layout) };
        if virt.is_null() {
            return Err(HalError::PageAlloc);
        }

        // Touch the page so the kernel backs it before we ask for its
        // physical address, then pin it.
        unsafe {
            std::ptr::write_volatile(virt, 1u8);
            std::ptr::write_volatile(virt, 0u8);
        }
        if unsafe { libc::mlock(virt as *const libc::c_void, PAGE_SIZE) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { dealloc(virt, layout) };
            return Err(HalError::PageLock(err));
        }

        match phys_addr_of(virt as usize) {
            Ok(phys) => Ok(Self { virt, phys }),
            Err(e) => {
                unsafe {
                    libc::munlock(virt as *const libc::c_void, PAGE_SIZE);
                    dealloc(virt, layout);
                }
                Err(e)
            }
        }
    }

    pub fn virt_ptr(&self) -> *mut u8 {
        self.virt
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Bus-side address of this page, as a DMA SOURCE_AD/NEXTCONBK value.
    pub fn bus_addr(&self) -> u32 {
        (self.phys as u32) | BUS_RAM_ALIAS
    }

    /// Volatile read of the 32-bit word at word index `word`.
    #[inline]
    pub fn read_word(&self, word: usize) -> u32 {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { std::ptr::read_volatile((self.virt as *const u32).add(word)) }
    }

    /// Volatile write of the 32-bit word at word index `word`.
    #[inline]
    pub fn write_word(&self, word: usize, value: u32) {
        debug_assert!(word < PAGE_SIZE / 4);
        unsafe { std::ptr::write_volatile((self.virt as *mut u32).add(word), value) }
    }
}

impl Drop for PhysPage {
    fn drop(&mut self) {
        unsafe {
            libc::munlock(self.virt as *const libc::c_void, PAGE_SIZE);
            dealloc(self.virt, page_layout());
        }
    }
}

fn page_layout() -> Layout {
    // PAGE_SIZE is a power of two; this cannot fail.
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("page layout")
}

/// Resolve a virtual address to its physical address via
/// `/proc/self/pagemap`.
fn phys_addr_of(virt: usize) -> Result<u64, HalError> {
    let mut file = std::fs::File::open("/proc/self/pagemap")
        .map_err(|e| HalError::Pagemap(e.to_string()))?;
    let offset = (virt / PAGE_SIZE) as u64 * 8;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| HalError::Pagemap(e.to_string()))?;
    let mut entry = [0u8; 8];
    file.read_exact(&mut entry)
        .map_err(|e| HalError::Pagemap(e.to_string()))?;
    let entry = u64::from_le_bytes(entry);

    if entry & PAGEMAP_PRESENT == 0 {
        return Err(HalError::PageNotPresent);
    }
    let pfn = entry & PAGEMAP_PFN_MASK;
    if pfn == 0 {
        // Unprivileged reads get zeroed PFNs; DMA needs the real one.
        return Err(HalError::Pagemap(
            "pagemap returned PFN 0 (need CAP_SYS_ADMIN)".to_string(),
        ));
    }
    Ok(pfn * PAGE_SIZE as u64 + (virt % PAGE_SIZE) as u64)
}
