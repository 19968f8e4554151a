//! Hardware Abstraction Layer trait for the Composite invocation core
//!
//! This crate defines the HAL trait through which the kernel reaches the
//! collaborators it does not implement itself: page-table primitives,
//! physical page lookup, the per-thread data page and the measurement
//! counters.
//!
//! # Page table naming
//!
//! The kernel names every address space with an opaque handle (`PgTblId`)
//! that it allocates itself. Platform implementations keep whatever backing
//! store they need (a physical root pointer on x86, a map in tests) keyed by
//! that handle.

#![no_std]

/// Kernel-assigned page-table handle
pub type PgTblId = u64;

/// Virtual address
pub type VirtAddr = u64;

/// Physical address
pub type PhysAddr = u64;

/// Hardware Abstraction Layer trait
///
/// Implementations provide platform-specific functionality for:
/// - Address-space management (create, destroy, install, region copy)
/// - Single translation add/remove
/// - Physical page lookup for mapping grants
/// - Thread data page switching
/// - Measurement counters
/// - Time and debug output
pub trait HAL: Send + Sync + 'static {
    // === Address spaces ===

    /// Create an empty page table named `pgtbl`.
    ///
    /// Allocation of the backing memory is a platform concern; the kernel
    /// bounds the number of live page tables itself.
    fn create_page_table(&self, pgtbl: PgTblId);

    /// Release the page table named `pgtbl`.
    fn destroy_page_table(&self, pgtbl: PgTblId);

    /// Make `pgtbl` the active address space on this core.
    fn install_page_table(&self, pgtbl: PgTblId);

    /// Copy all translations in `[base, base + size)` from `from` into `to`.
    ///
    /// Used when a protection domain joins a composite: its mappings become
    /// visible in the composite's address space.
    fn copy_region(&self, from: PgTblId, to: PgTblId, base: VirtAddr, size: u64);

    /// Remove all translations in `[base, base + size)` from `pgtbl`.
    fn clear_region(&self, pgtbl: PgTblId, base: VirtAddr, size: u64);

    /// Add a single translation `vaddr -> paddr` to `pgtbl`.
    ///
    /// # Returns
    /// * `Ok(())` - Translation installed
    /// * `Err(HalError::AlreadyMapped)` - `vaddr` already has a translation
    /// * `Err(HalError::OutOfMemory)` - No memory for intermediate tables
    fn pgtbl_add_entry(&self, pgtbl: PgTblId, vaddr: VirtAddr, paddr: PhysAddr)
        -> Result<(), HalError>;

    /// Remove the translation for `vaddr` from `pgtbl`.
    ///
    /// # Returns
    /// * `Ok(())` - Translation removed
    /// * `Err(HalError::NotMapped)` - `vaddr` had no translation
    fn pgtbl_rem_entry(&self, pgtbl: PgTblId, vaddr: VirtAddr) -> Result<(), HalError>;

    // === Memory ===

    /// Look up the physical page backing memory object `mem_id`.
    ///
    /// Returns `None` if the memory id does not name an accessible page.
    fn access_page(&self, mem_id: u64) -> Option<PhysAddr>;

    // === Threads ===

    /// Swap the user-visible data page of thread `old_tid` for that of
    /// `new_tid`.
    fn switch_thread_data_page(&self, old_tid: u32, new_tid: u32);

    // === Measurement ===

    /// Increment the opaque event counter `event`.
    fn meas_event(&self, _event: u32) {
        // Default: measurement disabled
    }

    // === Time & Debug ===

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    /// Write a debug message to the platform's console/log
    fn debug_write(&self, msg: &str);
}

/// HAL errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Not enough memory available
    OutOfMemory,
    /// Page table handle does not exist
    NoSuchPageTable,
    /// Address already has a translation
    AlreadyMapped,
    /// Address has no translation
    NotMapped,
    /// Operation not supported on this platform
    NotSupported,
}

/// A minimal test HAL for unit testing
///
/// Every primitive succeeds and nothing is recorded, which suits unit tests
/// that only look at kernel state.
#[derive(Default)]
pub struct TestHal {
    time: core::sync::atomic::AtomicU64,
}

impl TestHal {
    pub fn new() -> Self {
        Self {
            time: core::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Advance the clock by `nanos`.
    pub fn advance(&self, nanos: u64) {
        self.time
            .fetch_add(nanos, core::sync::atomic::Ordering::SeqCst);
    }
}

impl HAL for TestHal {
    fn create_page_table(&self, _pgtbl: PgTblId) {}

    fn destroy_page_table(&self, _pgtbl: PgTblId) {}

    fn install_page_table(&self, _pgtbl: PgTblId) {}

    fn copy_region(&self, _from: PgTblId, _to: PgTblId, _base: VirtAddr, _size: u64) {}

    fn clear_region(&self, _pgtbl: PgTblId, _base: VirtAddr, _size: u64) {}

    fn pgtbl_add_entry(
        &self,
        _pgtbl: PgTblId,
        _vaddr: VirtAddr,
        _paddr: PhysAddr,
    ) -> Result<(), HalError> {
        Ok(())
    }

    fn pgtbl_rem_entry(&self, _pgtbl: PgTblId, _vaddr: VirtAddr) -> Result<(), HalError> {
        Ok(())
    }

    fn access_page(&self, mem_id: u64) -> Option<PhysAddr> {
        // Identity-style backing: every id names page `mem_id`
        Some(mem_id << 12)
    }

    fn switch_thread_data_page(&self, _old_tid: u32, _new_tid: u32) {}

    fn now_nanos(&self) -> u64 {
        self.time.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn debug_write(&self, _msg: &str) {
        // No-op for tests
    }
}
