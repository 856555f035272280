// This module discovers which heap pages a worker touches during an iteration without
// instrumenting every access: the owning worker re-arms its whole heap window to PROT_NONE at
// begin_iter, and the first access to each page traps into a SIGSEGV handler that marks the
// page TOUCHED in its shadow, records it in a fixed-capacity list, and widens the page's
// protection to whatever its heap class allows. Tracked regions outside the window (globals,
// stack frames) have their shadow mapped up front and are never re-armed; a fault on one only
// widens its protection to what its class allows. The handler is kept minimal: it reads a
// process-static FaultTable through an atomic pointer, uses only mprotect and atomics, and on
// any protocol violation (a fault outside the registered extents, a second fault on a page
// that already faulted, an exhausted touched list) it writes a fixed diagnostic to stderr and
// aborts. All real cleanup is deferred to normal process exit.

//! Page-fault interception for first-touch tracking.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::core::error::{RuntimeError, RuntimeResult};
use crate::core::region::{page_of, protect, Protection, PAGE_SIZE};
use crate::heap::{HeapClass, HeapLayout, TrackedRegion};

use super::{bits, shadow_address};

/// The table the signal handler consults. Installed once per worker process.
static FAULT_TABLE: AtomicPtr<FaultTable> = AtomicPtr::new(ptr::null_mut());

const OUT_OF_REGISTERED: &[u8] = b"specpipe: segfault out of registered pages\n";
const DOUBLE_FAULT: &[u8] = b"specpipe: second fault on a touched page before reset\n";
const TOUCHED_FULL: &[u8] = b"specpipe: touched page list exhausted\n";
const PROTECT_FAILED: &[u8] = b"specpipe: mprotect failed in fault handler\n";
const NO_TABLE: &[u8] = b"specpipe: fault with no fault table installed\n";

/// Where an address falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Heap { class: HeapClass, slot: usize },
    Tracked { class: HeapClass },
    Shadow,
    Outside,
}

/// Per-process fault bookkeeping.
pub struct FaultTable {
    layout: HeapLayout,
    /// Registered end address of every arena, owned by the process's heap mirror.
    extents: *const AtomicUsize,
    extent_count: usize,
    regions: Box<[TrackedRegion]>,
    touched: Box<[AtomicUsize]>,
    touched_len: AtomicUsize,
    last_fault: AtomicUsize,
    faults: AtomicUsize,
}

// SAFETY: `extents` points into a boxed slice that outlives the table (both live until
// process exit); everything else is atomics.
unsafe impl Send for FaultTable {}
unsafe impl Sync for FaultTable {}

impl FaultTable {
    /// # Safety
    ///
    /// `extents` must point to `extent_count` atomics that stay alive and unmoved for
    /// the lifetime of the table.
    pub unsafe fn new(
        layout: HeapLayout,
        extents: *const AtomicUsize,
        extent_count: usize,
        touched_capacity: usize,
    ) -> Self {
        Self {
            layout,
            extents,
            extent_count,
            regions: Box::new([]),
            touched: (0..touched_capacity).map(|_| AtomicUsize::new(0)).collect(),
            touched_len: AtomicUsize::new(0),
            last_fault: AtomicUsize::new(0),
            faults: AtomicUsize::new(0),
        }
    }

    /// Also recognise `regions`, whose shadow the caller has mapped read/write.
    pub fn with_regions(mut self, regions: &[TrackedRegion]) -> Self {
        self.regions = regions.into();
        self
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn regions(&self) -> &[TrackedRegion] {
        &self.regions
    }

    fn tracked(&self, addr: usize) -> Option<&TrackedRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn region(&self, addr: usize) -> Region {
        if let Some(id) = self.layout.locate(addr) {
            return Region::Heap {
                class: id.class,
                slot: id.slot,
            };
        }
        if let Some(region) = self.tracked(addr) {
            return Region::Tracked { class: region.class };
        }
        let real = shadow_address(addr);
        if self.layout.locate(real).is_some() || self.tracked(real).is_some() {
            return Region::Shadow;
        }
        Region::Outside
    }

    fn registered_end(&self, class: HeapClass, slot: usize) -> usize {
        let index = self.layout.arena_index(class, slot);
        if index >= self.extent_count {
            return 0;
        }
        // SAFETY: bounds checked above; lifetime guaranteed by `new`'s contract.
        unsafe { (*self.extents.add(index)).load(Ordering::Acquire) }
    }

    /// The handler's work. Returns a diagnostic on protocol violation.
    fn on_fault(&self, addr: usize) -> Result<(), &'static [u8]> {
        self.faults.fetch_add(1, Ordering::Relaxed);
        match self.region(addr) {
            Region::Shadow => {
                protect(page_of(addr), PAGE_SIZE, Protection::ReadWrite).map_err(|_| PROTECT_FAILED)
            }
            Region::Heap { class, slot } => {
                if addr >= self.registered_end(class, slot) {
                    return Err(OUT_OF_REGISTERED);
                }
                let page = page_of(addr);
                let shadow = shadow_address(page);
                protect(shadow, PAGE_SIZE, Protection::ReadWrite).map_err(|_| PROTECT_FAILED)?;

                // SAFETY: the shadow page was just made read/write.
                let first = unsafe { AtomicU8::from_ptr(shadow as *mut u8) };
                if first.fetch_or(bits::TOUCHED, Ordering::Relaxed) & bits::TOUCHED != 0 {
                    return Err(DOUBLE_FAULT);
                }

                let slot_index = self.touched_len.fetch_add(1, Ordering::Relaxed);
                if slot_index >= self.touched.len() {
                    return Err(TOUCHED_FULL);
                }
                self.touched[slot_index].store(page, Ordering::Relaxed);
                self.last_fault.store(addr, Ordering::Relaxed);

                protect(page, PAGE_SIZE, class.protection()).map_err(|_| PROTECT_FAILED)
            }
            Region::Tracked { class } => {
                if self.last_fault.swap(addr, Ordering::Relaxed) == addr {
                    return Err(DOUBLE_FAULT);
                }
                protect(page_of(addr), PAGE_SIZE, class.protection()).map_err(|_| PROTECT_FAILED)
            }
            Region::Outside => Err(OUT_OF_REGISTERED),
        }
    }

    /// Pages touched since the last [`FaultTable::clear_touched`].
    pub fn touched_pages(&self) -> Vec<usize> {
        let len = self.touched_len.load(Ordering::Acquire).min(self.touched.len());
        self.touched[..len]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    pub fn clear_touched(&self) {
        self.touched_len.store(0, Ordering::Release);
    }

    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn last_fault(&self) -> usize {
        self.last_fault.load(Ordering::Relaxed)
    }

    /// Reset protection of the whole heap window to none and forget the last fault.
    ///
    /// Tracked regions keep their protection.
    pub fn rearm(&self) -> RuntimeResult<()> {
        protect(self.layout.base, self.layout.len(), Protection::None)?;
        self.last_fault.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Make a page writable for the runtime itself without marking it touched.
    pub fn unprotect_page(&self, page: usize) -> RuntimeResult<()> {
        protect(page_of(page), PAGE_SIZE, Protection::ReadWrite)?;
        protect(shadow_address(page_of(page)), PAGE_SIZE, Protection::ReadWrite)
    }
}

/// Write a diagnostic and abort. Async-signal-safe.
fn fatal(msg: &[u8]) -> ! {
    // SAFETY: write(2) and abort(3) are async-signal-safe.
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort()
    }
}

extern "C" fn handle_fault(_sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let table = FAULT_TABLE.load(Ordering::Acquire);
    if table.is_null() {
        fatal(NO_TABLE);
    }
    // SAFETY: installed tables are leaked and never freed; the kernel hands us a valid siginfo.
    let (table, addr) = unsafe { (&*table, (*info).si_addr() as usize) };
    if let Err(msg) = table.on_fault(addr) {
        fatal(msg);
    }
}

/// Install `table` as this process's fault table and hook SIGSEGV.
///
/// The table is leaked: it must stay valid for any fault until the process exits.
pub fn install(table: FaultTable) -> RuntimeResult<&'static FaultTable> {
    let table: &'static FaultTable = Box::leak(Box::new(table));
    FAULT_TABLE.store(table as *const _ as *mut _, Ordering::Release);

    // SAFETY: a zeroed sigaction is a valid starting point; we fill handler, flags and mask.
    let rc = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_fault as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut())
    };
    if rc != 0 {
        return Err(RuntimeError::InvalidConfig {
            reason: format!("sigaction failed: {}", std::io::Error::last_os_error()),
        });
    }
    log::trace!("fault table installed over {:#x}+{:#x}", table.layout.base, table.layout.len());
    Ok(table)
}

/// The installed table, if any.
pub fn installed() -> Option<&'static FaultTable> {
    let table = FAULT_TABLE.load(Ordering::Acquire);
    // SAFETY: installed tables are leaked.
    unsafe { table.as_ref() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::region::{MappedRegion, Sharing};

    fn layout() -> HeapLayout {
        HeapLayout {
            base: 0x2e00_0000_0000,
            arena_size: 1 << 20,
            slots: 3,
        }
    }

    #[test]
    fn test_region_classification() {
        let extents: Vec<AtomicUsize> = (0..HeapClass::COUNT * 3).map(|_| AtomicUsize::new(0)).collect();
        let table = unsafe { FaultTable::new(layout(), extents.as_ptr(), extents.len(), 8) };
        let l = layout();

        assert_eq!(
            table.region(l.arena_begin(HeapClass::ReadOnly, 2) + 5),
            Region::Heap { class: HeapClass::ReadOnly, slot: 2 }
        );
        assert_eq!(table.region(shadow_address(l.base + 100)), Region::Shadow);
        assert_eq!(table.region(l.base - 1), Region::Outside);
        assert_eq!(table.region(l.base + l.len()), Region::Outside);
    }

    #[test]
    fn test_tracked_regions_are_recognised() {
        let extents: Vec<AtomicUsize> = (0..HeapClass::COUNT * 3).map(|_| AtomicUsize::new(0)).collect();
        let globals = TrackedRegion {
            begin: 0x5000_0000,
            end: 0x5000_2000,
            class: HeapClass::Unclassified,
        };
        let constants = TrackedRegion {
            begin: 0x5100_0000,
            end: 0x5100_1000,
            class: HeapClass::ReadOnly,
        };
        let table = unsafe { FaultTable::new(layout(), extents.as_ptr(), extents.len(), 8) }
            .with_regions(&[globals, constants]);

        assert_eq!(table.region(0x5000_1fff), Region::Tracked { class: HeapClass::Unclassified });
        assert_eq!(table.region(0x5100_0010), Region::Tracked { class: HeapClass::ReadOnly });
        assert_eq!(table.region(shadow_address(0x5000_0008)), Region::Shadow);
        assert_eq!(table.region(0x5000_2000), Region::Outside);
        assert_eq!(table.regions().len(), 2);
    }

    #[test]
    fn test_repeated_fault_on_tracked_memory_is_fatal() {
        let page = MappedRegion::new(PAGE_SIZE, Sharing::Private).unwrap();
        protect(page.addr(), PAGE_SIZE, Protection::None).unwrap();
        let extents: Vec<AtomicUsize> = (0..HeapClass::COUNT * 3).map(|_| AtomicUsize::new(0)).collect();
        let table = unsafe { FaultTable::new(layout(), extents.as_ptr(), extents.len(), 8) }.with_regions(&[
            TrackedRegion {
                begin: page.addr(),
                end: page.addr() + PAGE_SIZE,
                class: HeapClass::Unclassified,
            },
        ]);

        assert_eq!(table.on_fault(page.addr() + 8), Ok(()));
        // the page is writable now and never marked touched
        unsafe { *(page.as_ptr().add(8)) = 5 };
        assert!(table.touched_pages().is_empty());
        assert_eq!(table.on_fault(page.addr() + 8), Err(DOUBLE_FAULT));
        assert_eq!(unsafe { *page.as_ptr().add(8) }, 5);
    }

    #[test]
    fn test_fault_outside_extent_is_rejected() {
        let extents: Vec<AtomicUsize> = (0..HeapClass::COUNT * 3).map(|_| AtomicUsize::new(0)).collect();
        let table = unsafe { FaultTable::new(layout(), extents.as_ptr(), extents.len(), 8) };
        assert_eq!(table.on_fault(layout().base + 10), Err(OUT_OF_REGISTERED));
        assert_eq!(table.on_fault(0x1000), Err(OUT_OF_REGISTERED));
    }
}
